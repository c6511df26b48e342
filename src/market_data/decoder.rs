// =============================================================================
// Wire Protocol Decoder — binary feed frames to typed tick records
// =============================================================================
//
// Frame layout (little-endian):
//
//   offset  size  field
//   0       1     subscription mode (1 = LTP, 2 = Quote)
//   1       1     exchange type
//   2       25    token (ASCII, NUL padded)
//   27      8     sequence number
//   35      8     exchange timestamp (ms)
//   43      8     last traded price (minor units)
//   51      72    Quote only: nine further i64 fields

use thiserror::Error;

pub const HEADER_LEN: usize = 43;
pub const LTP_FRAME_LEN: usize = HEADER_LEN + 8;
pub const QUOTE_FRAME_LEN: usize = LTP_FRAME_LEN + 9 * 8;

const TOKEN_OFFSET: usize = 2;
const TOKEN_LEN: usize = 25;
const SEQ_OFFSET: usize = 27;
const TS_OFFSET: usize = 35;
const LTP_OFFSET: usize = 43;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Ltp = 1,
    Quote = 2,
}

impl SubscriptionMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Ltp),
            2 => Some(Self::Quote),
            _ => None,
        }
    }

    /// Minimum frame length for this mode.
    pub fn frame_len(&self) -> usize {
        match self {
            Self::Ltp => LTP_FRAME_LEN,
            Self::Quote => QUOTE_FRAME_LEN,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Mode 2 payload. All prices are minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuoteFields {
    pub last_traded_qty: i64,
    pub avg_traded_price: i64,
    pub day_volume: i64,
    pub total_buy_qty: i64,
    pub total_sell_qty: i64,
    pub day_open: i64,
    pub day_high: i64,
    pub day_low: i64,
    pub day_close: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTick {
    pub mode: SubscriptionMode,
    pub exchange_type: u8,
    /// Raw token text with trailing NULs removed; may still carry quotes or
    /// whitespace.
    pub token: String,
    pub sequence_number: i64,
    pub exchange_timestamp_ms: i64,
    pub last_traded_price: i64,
    pub quote: Option<QuoteFields>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown subscription mode {0}")]
    UnknownMode(u8),
    #[error("truncated mode {mode} frame: need {expected} bytes, got {actual}")]
    Truncated {
        mode: u8,
        expected: usize,
        actual: usize,
    },
}

/// Decode one binary frame. Never panics; any malformed input yields a
/// `DecodeError` so the caller can drop the frame and keep reading.
pub fn decode(buf: &[u8]) -> Result<DecodedTick, DecodeError> {
    let mode_byte = *buf.first().ok_or(DecodeError::Empty)?;
    let mode = SubscriptionMode::from_byte(mode_byte).ok_or(DecodeError::UnknownMode(mode_byte))?;

    if buf.len() < mode.frame_len() {
        return Err(DecodeError::Truncated {
            mode: mode_byte,
            expected: mode.frame_len(),
            actual: buf.len(),
        });
    }

    let token_bytes = &buf[TOKEN_OFFSET..TOKEN_OFFSET + TOKEN_LEN];
    let token_end = token_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(TOKEN_LEN);
    let token = String::from_utf8_lossy(&token_bytes[..token_end]).into_owned();

    let quote = match mode {
        SubscriptionMode::Ltp => None,
        SubscriptionMode::Quote => {
            let f = |i: usize| read_i64(buf, LTP_OFFSET + 8 * (i + 1));
            Some(QuoteFields {
                last_traded_qty: f(0),
                avg_traded_price: f(1),
                day_volume: f(2),
                total_buy_qty: f(3),
                total_sell_qty: f(4),
                day_open: f(5),
                day_high: f(6),
                day_low: f(7),
                day_close: f(8),
            })
        }
    };

    Ok(DecodedTick {
        mode,
        exchange_type: buf[1],
        token,
        sequence_number: read_i64(buf, SEQ_OFFSET),
        exchange_timestamp_ms: read_i64(buf, TS_OFFSET),
        last_traded_price: read_i64(buf, LTP_OFFSET),
        quote,
    })
}

/// Caller guarantees `offset + 8 <= buf.len()`.
fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(raw)
}

/// Inverse of [`decode`], for building test frames.
#[cfg(test)]
pub(crate) fn encode(tick: &DecodedTick) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tick.mode.frame_len());
    buf.push(tick.mode.code());
    buf.push(tick.exchange_type);

    let mut token = [0u8; TOKEN_LEN];
    let src = tick.token.as_bytes();
    let n = src.len().min(TOKEN_LEN);
    token[..n].copy_from_slice(&src[..n]);
    buf.extend_from_slice(&token);

    buf.extend_from_slice(&tick.sequence_number.to_le_bytes());
    buf.extend_from_slice(&tick.exchange_timestamp_ms.to_le_bytes());
    buf.extend_from_slice(&tick.last_traded_price.to_le_bytes());

    if let (SubscriptionMode::Quote, Some(q)) = (tick.mode, tick.quote) {
        for v in [
            q.last_traded_qty,
            q.avg_traded_price,
            q.day_volume,
            q.total_buy_qty,
            q.total_sell_qty,
            q.day_open,
            q.day_high,
            q.day_low,
            q.day_close,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote_tick() -> DecodedTick {
        DecodedTick {
            mode: SubscriptionMode::Quote,
            exchange_type: 1,
            token: "3045".into(),
            sequence_number: 77,
            exchange_timestamp_ms: 1_704_167_100_000,
            last_traded_price: 62_550,
            quote: Some(QuoteFields {
                last_traded_qty: 10,
                avg_traded_price: 62_400,
                day_volume: 1_250_000,
                total_buy_qty: 500,
                total_sell_qty: 700,
                day_open: 62_000,
                day_high: 63_000,
                day_low: 61_800,
                day_close: 61_900,
            }),
        }
    }

    #[test]
    fn decodes_quote_frame() {
        let frame = encode(&quote_tick());
        assert_eq!(frame.len(), QUOTE_FRAME_LEN);
        assert_eq!(frame.len(), 123);
        assert_eq!(decode(&frame).unwrap(), quote_tick());
    }

    #[test]
    fn decodes_ltp_frame_and_trims_nul_padding() {
        let mut tick = quote_tick();
        tick.mode = SubscriptionMode::Ltp;
        tick.quote = None;
        let frame = encode(&tick);
        assert_eq!(frame.len(), 51);

        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.token, "3045");
        assert_eq!(decoded.last_traded_price, 62_550);
        assert!(decoded.quote.is_none());
    }

    #[test]
    fn reads_header_fields_at_fixed_offsets() {
        let mut frame = vec![0u8; LTP_FRAME_LEN];
        frame[0] = 1;
        frame[1] = 2;
        frame[2..6].copy_from_slice(b"NIFT");
        frame[27..35].copy_from_slice(&5i64.to_le_bytes());
        frame[35..43].copy_from_slice(&1_000i64.to_le_bytes());
        frame[43..51].copy_from_slice(&(-3i64).to_le_bytes());

        let d = decode(&frame).unwrap();
        assert_eq!(d.exchange_type, 2);
        assert_eq!(d.token, "NIFT");
        assert_eq!(d.sequence_number, 5);
        assert_eq!(d.exchange_timestamp_ms, 1_000);
        assert_eq!(d.last_traded_price, -3);
    }

    #[test]
    fn rejects_truncated_frames() {
        let frame = encode(&quote_tick());
        assert_eq!(
            decode(&frame[..100]),
            Err(DecodeError::Truncated {
                mode: 2,
                expected: 123,
                actual: 100
            })
        );
        assert!(matches!(decode(&frame[..10]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn rejects_unknown_mode_and_empty_frames() {
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
        let mut frame = encode(&quote_tick());
        frame[0] = 3;
        assert_eq!(decode(&frame), Err(DecodeError::UnknownMode(3)));
    }

    #[test]
    fn quote_mode_frame_with_trailing_bytes_still_decodes() {
        let mut frame = encode(&quote_tick());
        frame.extend_from_slice(&[0xAB; 16]);
        assert_eq!(decode(&frame).unwrap(), quote_tick());
    }
}
