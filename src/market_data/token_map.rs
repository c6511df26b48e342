use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMapEntry {
    pub symbol: String,
    pub exchange: String,
}

/// Read-only lookup table built once at startup. Shared behind an `Arc` and
/// never mutated while the pipeline runs.
#[derive(Debug, Default, Clone)]
pub struct TokenMap {
    entries: HashMap<String, TokenMapEntry>,
}

impl TokenMap {
    pub fn from_entries(entries: impl IntoIterator<Item = (String, TokenMapEntry)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(token, entry)| (clean_token(&token), entry))
            .filter(|(token, _)| !token.is_empty())
            .collect();
        Self { entries }
    }

    pub fn lookup(&self, token: &str) -> Option<&TokenMapEntry> {
        self.entries.get(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tokens grouped by feed exchange-type code, in a stable order.
    pub fn tokens_by_exchange_type(&self) -> BTreeMap<u8, Vec<String>> {
        let mut grouped: BTreeMap<u8, Vec<String>> = BTreeMap::new();
        for (token, entry) in &self.entries {
            grouped
                .entry(exchange_type_code(&entry.exchange))
                .or_default()
                .push(token.clone());
        }
        for tokens in grouped.values_mut() {
            tokens.sort();
        }
        grouped
    }
}

/// Remove embedded double quotes and surrounding whitespace.
pub fn clean_token(raw: &str) -> String {
    raw.replace('"', "").trim().to_string()
}

/// Feed exchange-type code for an exchange name. Unknown names map to NSE.
pub fn exchange_type_code(exchange: &str) -> u8 {
    match exchange.trim().to_ascii_uppercase().as_str() {
        "NSE" => 1,
        "NFO" => 2,
        "BSE" => 3,
        "BFO" => 4,
        "MCX" => 5,
        "NCX" => 7,
        "CDS" => 13,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(symbol: &str, exchange: &str) -> TokenMapEntry {
        TokenMapEntry {
            symbol: symbol.into(),
            exchange: exchange.into(),
        }
    }

    #[test]
    fn tokens_are_cleaned_on_load() {
        let map = TokenMap::from_entries(vec![
            ("\"3045\" ".to_string(), entry("SBIN", "NSE")),
            ("  ".to_string(), entry("BLANK", "NSE")),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.lookup("3045").unwrap().symbol, "SBIN");
        assert!(map.lookup("\"3045\"").is_none());
    }

    #[test]
    fn groups_tokens_by_exchange_type() {
        let map = TokenMap::from_entries(vec![
            ("3045".to_string(), entry("SBIN", "NSE")),
            ("2885".to_string(), entry("RELIANCE", "nse")),
            ("500112".to_string(), entry("SBIN", "BSE")),
            ("1".to_string(), entry("ODD", "XYZ")),
        ]);
        let grouped = map.tokens_by_exchange_type();
        assert_eq!(grouped[&1], vec!["1", "2885", "3045"]);
        assert_eq!(grouped[&3], vec!["500112"]);
        assert_eq!(grouped.len(), 2);
    }

    #[test]
    fn exchange_codes() {
        assert_eq!(exchange_type_code("MCX"), 5);
        assert_eq!(exchange_type_code("CDS"), 13);
        assert_eq!(exchange_type_code("unknown"), 1);
    }
}
