//! The historical market-data feed contract. Production backends (a
//! columnar store behind an HTTP/WebSocket façade) are external
//! collaborators; this crate only defines the trait plus an in-memory
//! double used by tests and examples.

use crate::core_types::TimestampNs;
use crate::messages::{BarData, EventKind, EventPayload, MarketEvent, QuoteData, TradeData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarTimespan {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone)]
pub enum SourceEvent {
    Trade {
        symbol: String,
        timestamp_ns: TimestampNs,
        data: TradeData,
    },
    Quote {
        symbol: String,
        timestamp_ns: TimestampNs,
        data: QuoteData,
    },
}

/// All ranges are half-open `[start, end)`. `limit == 0` means unlimited.
pub trait DataSource: Send + Sync {
    fn stream_events(
        &self,
        symbols: &[String],
        start: TimestampNs,
        end: TimestampNs,
    ) -> Vec<SourceEvent>;

    fn get_trades(&self, symbol: &str, start: TimestampNs, end: TimestampNs) -> Vec<(TimestampNs, TradeData)>;

    fn get_quotes(&self, symbol: &str, start: TimestampNs, end: TimestampNs) -> Vec<(TimestampNs, QuoteData)>;

    fn get_bars(
        &self,
        symbol: &str,
        start: TimestampNs,
        end: TimestampNs,
        multiplier: u32,
        timespan: BarTimespan,
        limit: usize,
    ) -> Vec<(TimestampNs, BarData)>;
}

/// Converts a raw feed event into the queue's wire format. Shared by
/// every feeder (preload, polling, shared) so the mapping lives in one place.
pub fn source_event_to_market_event(e: SourceEvent) -> MarketEvent {
    match e {
        SourceEvent::Trade { symbol, timestamp_ns, data } => MarketEvent {
            timestamp_ns,
            sequence: 0,
            kind: EventKind::Trade,
            symbol,
            payload: EventPayload::Trade(data),
        },
        SourceEvent::Quote { symbol, timestamp_ns, data } => MarketEvent {
            timestamp_ns,
            sequence: 0,
            kind: EventKind::Quote,
            symbol,
            payload: EventPayload::Quote(data),
        },
    }
}

/// An in-memory data source seeded with a fixed event list, sorted by
/// timestamp at construction. Used by the test suite and by the
/// standalone demo binary; never the production backend.
#[derive(Default)]
pub struct InMemoryDataSource {
    events: Vec<SourceEvent>,
}

impl InMemoryDataSource {
    pub fn new(mut events: Vec<SourceEvent>) -> Self {
        events.sort_by_key(|e| match e {
            SourceEvent::Trade { timestamp_ns, .. } => *timestamp_ns,
            SourceEvent::Quote { timestamp_ns, .. } => *timestamp_ns,
        });
        Self { events }
    }

    fn ts_of(e: &SourceEvent) -> TimestampNs {
        match e {
            SourceEvent::Trade { timestamp_ns, .. } => *timestamp_ns,
            SourceEvent::Quote { timestamp_ns, .. } => *timestamp_ns,
        }
    }

    fn symbol_of(e: &SourceEvent) -> &str {
        match e {
            SourceEvent::Trade { symbol, .. } => symbol,
            SourceEvent::Quote { symbol, .. } => symbol,
        }
    }
}

impl DataSource for InMemoryDataSource {
    fn stream_events(
        &self,
        symbols: &[String],
        start: TimestampNs,
        end: TimestampNs,
    ) -> Vec<SourceEvent> {
        self.events
            .iter()
            .filter(|e| symbols.iter().any(|s| s == Self::symbol_of(e)))
            .filter(|e| Self::ts_of(e) >= start && Self::ts_of(e) < end)
            .cloned()
            .collect()
    }

    fn get_trades(&self, symbol: &str, start: TimestampNs, end: TimestampNs) -> Vec<(TimestampNs, TradeData)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SourceEvent::Trade { symbol: s, timestamp_ns, data } if s == symbol && *timestamp_ns >= start && *timestamp_ns < end => {
                    Some((*timestamp_ns, data.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn get_quotes(&self, symbol: &str, start: TimestampNs, end: TimestampNs) -> Vec<(TimestampNs, QuoteData)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SourceEvent::Quote { symbol: s, timestamp_ns, data } if s == symbol && *timestamp_ns >= start && *timestamp_ns < end => {
                    Some((*timestamp_ns, data.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn get_bars(
        &self,
        _symbol: &str,
        _start: TimestampNs,
        _end: TimestampNs,
        _multiplier: u32,
        _timespan: BarTimespan,
        _limit: usize,
    ) -> Vec<(TimestampNs, BarData)> {
        // Bars are derived/aggregated data the historical store computes;
        // the in-memory double carries only raw trades/quotes.
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_events_filters_symbol_and_window() {
        let src = InMemoryDataSource::new(vec![
            SourceEvent::Trade {
                symbol: "AAPL".to_string(),
                timestamp_ns: 10,
                data: TradeData { price: 100.0, size: 1.0 },
            },
            SourceEvent::Trade {
                symbol: "MSFT".to_string(),
                timestamp_ns: 20,
                data: TradeData { price: 200.0, size: 1.0 },
            },
            SourceEvent::Trade {
                symbol: "AAPL".to_string(),
                timestamp_ns: 30,
                data: TradeData { price: 101.0, size: 1.0 },
            },
        ]);
        let events = src.stream_events(&["AAPL".to_string()], 0, 25);
        assert_eq!(events.len(), 1);
    }
}
