//! Per-symbol sliding windows.
//!
//! Entries are evicted, not just skipped, once their timestamp falls
//! before `now - window`. A hard entry cap bounds memory even when the
//! message rate is unthrottled.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::WindowSnapshot;
use crate::domain::market_data::{MarketDataMessage, Symbol, WILDCARD_SYMBOL};

/// Default cap on entries kept per symbol.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Sliding windows keyed by symbol.
#[derive(Debug)]
pub struct SymbolWindows {
    window_ms: u64,
    max_entries: usize,
    accept_any: bool,
    buffers: HashMap<Symbol, VecDeque<MarketDataMessage>>,
}

impl SymbolWindows {
    /// Allocate an empty buffer for each symbol.
    ///
    /// With the `"*"` symbol, buffers are created on first sight.
    #[must_use]
    pub fn new(symbols: &[Symbol], window_ms: u64, max_entries: usize) -> Self {
        let accept_any = symbols.iter().any(|s| s == WILDCARD_SYMBOL);
        let buffers = symbols
            .iter()
            .filter(|s| s.as_str() != WILDCARD_SYMBOL)
            .map(|s| (s.clone(), VecDeque::new()))
            .collect();

        Self {
            window_ms,
            max_entries: max_entries.max(1),
            accept_any,
            buffers,
        }
    }

    fn cutoff(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(i64::try_from(self.window_ms).unwrap_or(i64::MAX))
    }

    /// Append a message, then evict expired entries of its symbol.
    ///
    /// Returns false if the symbol is not tracked.
    pub fn record(&mut self, message: MarketDataMessage, now_ms: i64) -> bool {
        let cutoff = self.cutoff(now_ms);
        let max_entries = self.max_entries;

        let buffer = if self.accept_any {
            self.buffers.entry(message.symbol.clone()).or_default()
        } else {
            match self.buffers.get_mut(&message.symbol) {
                Some(buffer) => buffer,
                None => return false,
            }
        };

        buffer.push_back(message);
        while buffer.front().is_some_and(|m| m.timestamp < cutoff) {
            buffer.pop_front();
        }
        while buffer.len() > max_entries {
            buffer.pop_front();
        }
        true
    }

    /// Evict every expired entry across all symbols.
    ///
    /// Returns the number of entries removed.
    pub fn evict(&mut self, now_ms: i64) -> usize {
        let cutoff = self.cutoff(now_ms);
        let mut removed = 0;
        for buffer in self.buffers.values_mut() {
            let before = buffer.len();
            buffer.retain(|m| m.timestamp >= cutoff);
            removed += before - buffer.len();
        }
        removed
    }

    /// Evict, then copy the non-empty buffers.
    ///
    /// Returns `None` when every buffer is empty.
    pub fn snapshot(&mut self, now_ms: i64) -> Option<WindowSnapshot> {
        self.evict(now_ms);

        let buffers: BTreeMap<Symbol, Vec<MarketDataMessage>> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(symbol, buffer)| (symbol.clone(), buffer.iter().cloned().collect()))
            .collect();

        if buffers.is_empty() {
            return None;
        }

        Some(WindowSnapshot {
            as_of_ms: now_ms,
            window_ms: self.window_ms,
            buffers,
        })
    }

    /// Drop every buffered entry, keeping the symbol set.
    pub fn clear(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
    }

    /// Number of entries buffered for a symbol.
    #[must_use]
    pub fn len(&self, symbol: &str) -> usize {
        self.buffers.get(symbol).map_or(0, VecDeque::len)
    }

    /// Total entries across symbols.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.buffers.values().map(VecDeque::len).sum()
    }

    /// Whether every buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.values().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn trade(symbol: &str, ts: i64) -> MarketDataMessage {
        MarketDataMessage::trade(symbol, ts, dec!(10), 1)
    }

    fn symbols(list: &[&str]) -> Vec<Symbol> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn record_evicts_expired_entries() {
        let mut windows = SymbolWindows::new(&symbols(&["AAPL"]), 1_000, DEFAULT_MAX_ENTRIES);

        windows.record(trade("AAPL", 0), 0);
        windows.record(trade("AAPL", 500), 500);
        windows.record(trade("AAPL", 1_600), 1_600);

        assert_eq!(windows.len("AAPL"), 2);
    }

    #[test]
    fn untracked_symbols_are_ignored() {
        let mut windows = SymbolWindows::new(&symbols(&["AAPL"]), 1_000, DEFAULT_MAX_ENTRIES);
        assert!(!windows.record(trade("MSFT", 0), 0));
        assert!(windows.is_empty());
    }

    #[test]
    fn wildcard_tracks_new_symbols() {
        let mut windows = SymbolWindows::new(&symbols(&["*"]), 1_000, DEFAULT_MAX_ENTRIES);
        assert!(windows.record(trade("MSFT", 0), 0));
        assert_eq!(windows.len("MSFT"), 1);
    }

    #[test]
    fn snapshot_never_holds_entries_older_than_window() {
        let mut windows =
            SymbolWindows::new(&symbols(&["AAPL", "MSFT"]), 1_000, DEFAULT_MAX_ENTRIES);
        windows.record(trade("AAPL", 100), 100);
        windows.record(trade("MSFT", 900), 900);

        let snapshot = windows.snapshot(1_500).unwrap();

        assert!(snapshot.messages("AAPL").is_empty());
        assert_eq!(snapshot.messages("MSFT").len(), 1);
        assert!(
            snapshot
                .buffers
                .values()
                .flatten()
                .all(|m| m.timestamp >= 500)
        );
        assert_eq!(windows.len("AAPL"), 0);
    }

    #[test]
    fn snapshot_of_empty_windows_is_none() {
        let mut windows = SymbolWindows::new(&symbols(&["AAPL"]), 1_000, DEFAULT_MAX_ENTRIES);
        assert!(windows.snapshot(0).is_none());

        windows.record(trade("AAPL", 0), 0);
        assert!(windows.snapshot(5_000).is_none());
    }

    #[test]
    fn snapshot_is_detached_from_buffers() {
        let mut windows = SymbolWindows::new(&symbols(&["AAPL"]), 10_000, DEFAULT_MAX_ENTRIES);
        windows.record(trade("AAPL", 0), 0);
        let snapshot = windows.snapshot(0).unwrap();

        windows.record(trade("AAPL", 1), 1);
        assert_eq!(snapshot.messages("AAPL").len(), 1);
        assert_eq!(windows.len("AAPL"), 2);
    }

    #[test]
    fn entry_cap_bounds_memory() {
        let mut windows = SymbolWindows::new(&symbols(&["AAPL"]), 60_000, 3);
        for ts in 0..10 {
            windows.record(trade("AAPL", ts), ts);
        }

        assert_eq!(windows.len("AAPL"), 3);
        let snapshot = windows.snapshot(10).unwrap();
        let kept: Vec<i64> = snapshot.messages("AAPL").iter().map(|m| m.timestamp).collect();
        assert_eq!(kept, vec![7, 8, 9]);
    }

    #[test]
    fn clear_empties_buffers() {
        let mut windows = SymbolWindows::new(&symbols(&["AAPL"]), 1_000, DEFAULT_MAX_ENTRIES);
        windows.record(trade("AAPL", 0), 0);
        windows.clear();
        assert_eq!(windows.total_len(), 0);
    }
}
