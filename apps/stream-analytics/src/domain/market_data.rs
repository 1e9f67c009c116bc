//! Market Data Types
//!
//! Canonical internal representation of a market data event as delivered
//! by a provider adapter: one `MarketDataMessage` per quote, trade, bar,
//! book snapshot, news item or sentiment reading.
//!
//! Messages are immutable once emitted. Each subscription pushes its own
//! clone through its own pipeline, so nothing here is shared mutably.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// A symbol string (stock ticker, crypto pair, ...).
pub type Symbol = String;

/// Wildcard symbol admitting every symbol.
pub const WILDCARD_SYMBOL: &str = "*";

/// Category of market data carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    /// Top-of-book bid/ask quotes.
    Quotes,
    /// Executed trades.
    Trades,
    /// OHLCV bars.
    Bars,
    /// Order book depth levels.
    #[serde(rename = "LEVEL2")]
    Level2,
    /// News headlines.
    News,
    /// Sentiment readings.
    Sentiment,
}

impl DataType {
    /// Get all data types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Quotes,
            Self::Trades,
            Self::Bars,
            Self::Level2,
            Self::News,
            Self::Sentiment,
        ]
    }

    /// Get as string for logging and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Quotes => "quotes",
            Self::Trades => "trades",
            Self::Bars => "bars",
            Self::Level2 => "level2",
            Self::News => "news",
            Self::Sentiment => "sentiment",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Best bid price.
    pub bid_price: Decimal,
    /// Size available at the bid.
    pub bid_size: u64,
    /// Best ask price.
    pub ask_price: Decimal,
    /// Size available at the ask.
    pub ask_size: u64,
}

impl Quote {
    /// Calculate the spread.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }

    /// Calculate the mid price.
    #[must_use]
    pub fn mid_price(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }
}

/// Executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Execution price.
    pub price: Decimal,
    /// Executed size.
    pub size: u64,
}

/// OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Opening price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Closing price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: u64,
}

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Price level.
    pub price: Decimal,
    /// Size resting at this level.
    pub size: u64,
}

/// Order book snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level2 {
    /// Bid levels, best first.
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first.
    pub asks: Vec<BookLevel>,
}

/// News headline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct News {
    /// Headline text.
    pub headline: String,
    /// Publishing source.
    pub source: String,
    /// Link to the article, if any.
    pub url: Option<String>,
}

/// Sentiment reading produced upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    /// Score in `[-1, 1]`.
    pub score: f64,
    /// Producer of the score.
    pub source: String,
}

/// Payload of a market data message, shaped by its data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketPayload {
    /// Quote payload.
    Quote(Quote),
    /// Trade payload.
    Trade(Trade),
    /// Bar payload.
    Bar(Bar),
    /// Book payload.
    Level2(Level2),
    /// News payload.
    News(News),
    /// Sentiment payload.
    Sentiment(Sentiment),
}

impl MarketPayload {
    /// Data type this payload naturally belongs to.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Quote(_) => DataType::Quotes,
            Self::Trade(_) => DataType::Trades,
            Self::Bar(_) => DataType::Bars,
            Self::Level2(_) => DataType::Level2,
            Self::News(_) => DataType::News,
            Self::Sentiment(_) => DataType::Sentiment,
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// A single market data event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataMessage {
    /// Category of the event.
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Event time in epoch milliseconds.
    pub timestamp: i64,
    /// Typed payload.
    pub data: MarketPayload,
}

impl MarketDataMessage {
    /// Create a message whose data type follows its payload.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, timestamp: i64, data: MarketPayload) -> Self {
        Self {
            data_type: data.data_type(),
            symbol: symbol.into(),
            timestamp,
            data,
        }
    }

    /// Create a quote message.
    #[must_use]
    pub fn quote(
        symbol: impl Into<Symbol>,
        timestamp: i64,
        bid_price: Decimal,
        bid_size: u64,
        ask_price: Decimal,
        ask_size: u64,
    ) -> Self {
        Self::new(
            symbol,
            timestamp,
            MarketPayload::Quote(Quote {
                bid_price,
                bid_size,
                ask_price,
                ask_size,
            }),
        )
    }

    /// Create a trade message.
    #[must_use]
    pub fn trade(symbol: impl Into<Symbol>, timestamp: i64, price: Decimal, size: u64) -> Self {
        Self::new(symbol, timestamp, MarketPayload::Trade(Trade { price, size }))
    }

    /// Create a bar message.
    #[must_use]
    pub fn bar(symbol: impl Into<Symbol>, timestamp: i64, bar: Bar) -> Self {
        Self::new(symbol, timestamp, MarketPayload::Bar(bar))
    }

    /// Price used by price-series analytics: trade price or bar close.
    #[must_use]
    pub const fn reference_price(&self) -> Option<Decimal> {
        match &self.data {
            MarketPayload::Trade(trade) => Some(trade.price),
            MarketPayload::Bar(bar) => Some(bar.close),
            _ => None,
        }
    }

    /// Quote payload, if this is a quote.
    #[must_use]
    pub const fn as_quote(&self) -> Option<&Quote> {
        match &self.data {
            MarketPayload::Quote(quote) => Some(quote),
            _ => None,
        }
    }

    /// Trade payload, if this is a trade.
    #[must_use]
    pub const fn as_trade(&self) -> Option<&Trade> {
        match &self.data {
            MarketPayload::Trade(trade) => Some(trade),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
