use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::now_ms;

/// Total-ordered f64 wrapper for ranked set keys.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Gainer,
    Loser,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoverEntry {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub change: f64,
    pub percent_change: f64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Movers {
    pub gainers: Vec<MoverEntry>,
    pub losers: Vec<MoverEntry>,
}

#[derive(Default)]
struct Rankings {
    gainers: BTreeSet<(Score, String)>,
    losers: BTreeSet<(Score, String)>,
    /// Current set and score per symbol, so a re-rank can remove the old key.
    membership: HashMap<String, (Side, Score)>,
    details: HashMap<String, MoverEntry>,
}

impl Rankings {
    fn remove(&mut self, symbol: &str) {
        if let Some((side, score)) = self.membership.remove(symbol) {
            let key = (score, symbol.to_string());
            match side {
                Side::Gainer => self.gainers.remove(&key),
                Side::Loser => self.losers.remove(&key),
            };
        }
        self.details.remove(symbol);
    }
}

/// In-process ranked gainers/losers views. A symbol is in exactly one of the
/// two sets at any time. Detail records expire after `ttl_ms` without an
/// update and are skipped (and purged) on read.
pub struct MoversRanker {
    ttl_ms: i64,
    inner: RwLock<Rankings>,
}

impl MoversRanker {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_ms: (ttl_secs as i64).saturating_mul(1000),
            inner: RwLock::new(Rankings::default()),
        }
    }

    pub fn upsert(&self, symbol: &str, percent_change: f64, price: f64, change: f64) {
        self.upsert_at(symbol, percent_change, price, change, now_ms());
    }

    pub fn upsert_at(&self, symbol: &str, percent_change: f64, price: f64, change: f64, at_ms: i64) {
        if !percent_change.is_finite() {
            return;
        }
        let (side, score) = if percent_change >= 0.0 {
            (Side::Gainer, Score(percent_change))
        } else {
            (Side::Loser, Score(percent_change.abs()))
        };

        let mut r = self.inner.write();
        r.remove(symbol);
        let key = (score, symbol.to_string());
        match side {
            Side::Gainer => r.gainers.insert(key),
            Side::Loser => r.losers.insert(key),
        };
        r.membership.insert(symbol.to_string(), (side, score));
        r.details.insert(
            symbol.to_string(),
            MoverEntry {
                symbol: symbol.to_string(),
                name: symbol.to_string(),
                price,
                change,
                percent_change,
                updated_at_ms: at_ms,
            },
        );
    }

    pub fn top_gainers(&self, n: usize) -> Vec<MoverEntry> {
        self.top_at(Side::Gainer, n, now_ms())
    }

    pub fn top_losers(&self, n: usize) -> Vec<MoverEntry> {
        self.top_at(Side::Loser, n, now_ms())
    }

    pub fn movers(&self, n: usize) -> Movers {
        self.movers_at(n, now_ms())
    }

    pub fn movers_at(&self, n: usize, now: i64) -> Movers {
        Movers {
            gainers: self.top_at(Side::Gainer, n, now),
            losers: self.top_at(Side::Loser, n, now),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().membership.len()
    }

    fn is_stale(&self, entry: &MoverEntry, now: i64) -> bool {
        now.saturating_sub(entry.updated_at_ms) > self.ttl_ms
    }

    fn top_at(&self, side: Side, n: usize, now: i64) -> Vec<MoverEntry> {
        if n == 0 {
            return Vec::new();
        }
        let mut expired = Vec::new();
        let mut out = Vec::with_capacity(n);
        {
            let r = self.inner.read();
            let set = match side {
                Side::Gainer => &r.gainers,
                Side::Loser => &r.losers,
            };
            for (_, symbol) in set.iter().rev() {
                match r.details.get(symbol) {
                    Some(d) if !self.is_stale(d, now) => {
                        out.push(d.clone());
                        if out.len() == n {
                            break;
                        }
                    }
                    _ => expired.push(symbol.clone()),
                }
            }
        }

        if !expired.is_empty() {
            let mut r = self.inner.write();
            for symbol in &expired {
                // Re-check: an upsert may have refreshed it since the read.
                let still_stale = r
                    .details
                    .get(symbol)
                    .map_or(true, |d| self.is_stale(d, now));
                if still_stale {
                    r.remove(symbol);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 86_400;

    fn symbols(entries: &[MoverEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.symbol.as_str()).collect()
    }

    #[test]
    fn symbol_switches_sets_on_sign_change() {
        let ranker = MoversRanker::new(DAY);
        ranker.upsert("SBIN", 3.0, 103.0, 3.0);
        assert_eq!(symbols(&ranker.top_gainers(5)), vec!["SBIN"]);
        assert!(ranker.top_losers(5).is_empty());

        ranker.upsert("SBIN", -1.0, 99.0, -1.0);
        assert!(ranker.top_gainers(5).is_empty());
        let losers = ranker.top_losers(5);
        assert_eq!(symbols(&losers), vec!["SBIN"]);
        assert_eq!(losers[0].percent_change, -1.0);
        assert_eq!(ranker.len(), 1);
    }

    #[test]
    fn ranks_descending_by_magnitude() {
        let ranker = MoversRanker::new(DAY);
        ranker.upsert("A", 1.0, 0.0, 0.0);
        ranker.upsert("B", 5.0, 0.0, 0.0);
        ranker.upsert("C", 2.5, 0.0, 0.0);
        ranker.upsert("X", -0.5, 0.0, 0.0);
        ranker.upsert("Y", -7.0, 0.0, 0.0);
        ranker.upsert("Z", 0.0, 0.0, 0.0);

        assert_eq!(symbols(&ranker.top_gainers(3)), vec!["B", "C", "A"]);
        assert_eq!(symbols(&ranker.top_losers(5)), vec!["Y", "X"]);
        // Zero change counts as a gainer.
        assert_eq!(ranker.top_gainers(10).len(), 4);
    }

    #[test]
    fn rescoring_replaces_old_rank() {
        let ranker = MoversRanker::new(DAY);
        ranker.upsert("A", 1.0, 0.0, 0.0);
        ranker.upsert("B", 2.0, 0.0, 0.0);
        ranker.upsert("A", 9.0, 0.0, 0.0);
        assert_eq!(symbols(&ranker.top_gainers(5)), vec!["A", "B"]);
    }

    #[test]
    fn cold_ranking_is_empty() {
        let ranker = MoversRanker::new(DAY);
        assert_eq!(ranker.movers(5), Movers::default());
        assert!(ranker.top_gainers(0).is_empty());
    }

    #[test]
    fn stale_details_age_out() {
        let ranker = MoversRanker::new(60);
        ranker.upsert_at("OLD", 4.0, 0.0, 0.0, 0);
        ranker.upsert_at("NEW", 1.0, 0.0, 0.0, 50_000);

        let movers = ranker.movers_at(5, 90_000);
        assert_eq!(symbols(&movers.gainers), vec!["NEW"]);
        assert_eq!(ranker.len(), 1);
    }

    #[test]
    fn non_finite_percent_is_ignored() {
        let ranker = MoversRanker::new(DAY);
        ranker.upsert("NAN", f64::NAN, 0.0, 0.0);
        assert_eq!(ranker.len(), 0);
    }
}
