//! The normalized tick — what every transport and the KV snapshot cache see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instrument::Exchange;

/// Open/high/low/close block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One level of market depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Price at this level, rupees.
    pub price: f64,
    /// Total quantity resting at this level.
    pub quantity: i32,
    /// Number of orders at this level.
    pub orders: i32,
}

/// Five bid and five ask levels from a full-mode packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    pub bid: [DepthLevel; 5],
    pub ask: [DepthLevel; 5],
}

/// A normalized market-data tick.
///
/// Prices are rupee doubles (the binary feed is unscaled for this broker).
/// Fields absent from the source packet are omitted, never zeroed — an LTP
/// packet produces a tick with only `last_price` populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Exchange-scoped instrument token.
    pub token: i32,
    /// Exchange segment.
    pub exchange: Exchange,
    /// Last traded price, rupees.
    pub last_price: f64,
    /// Last trade time, converted from the feed's IST epoch seconds to UTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_time: Option<DateTime<Utc>>,
    /// OHLC for the day, ohlcv/full modes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<Ohlc>,
    /// Total traded volume for the day.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i32>,
    /// Volume-weighted average trade price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<f64>,
    /// Total pending buy quantity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_buy_qty: Option<i64>,
    /// Total pending sell quantity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_sell_qty: Option<i64>,
    /// Open interest, derivatives only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<i32>,
    /// Last update time from the feed, IST epoch seconds converted to UTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    /// Quantity of the last trade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_qty: Option<i32>,
    /// Five-level bid/ask depth, full mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<Depth>,
    /// Daily price range band (upper, lower), full mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpr: Option<(i32, i32)>,
    /// Set when the registry had no instrument type for this token at parse
    /// time, so the index/non-index dispatch fell back to packet length.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub index_unknown: bool,
    /// Gateway-side receive timestamp.
    pub server_ts: DateTime<Utc>,
}

impl Tick {
    /// A tick carrying only the LTP fields.
    pub fn ltp(token: i32, exchange: Exchange, last_price: f64, server_ts: DateTime<Utc>) -> Self {
        Self {
            token,
            exchange,
            last_price,
            last_trade_time: None,
            ohlc: None,
            volume: None,
            avg_price: None,
            total_buy_qty: None,
            total_sell_qty: None,
            oi: None,
            last_update_time: None,
            last_trade_qty: None,
            depth: None,
            dpr: None,
            index_unknown: false,
            server_ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_are_omitted_from_json() {
        let tick = Tick::ltp(26000, Exchange::NSE_EQ, 25870.3, Utc::now());
        let json = serde_json::to_value(&tick).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("last_price"));
        assert!(!obj.contains_key("volume"));
        assert!(!obj.contains_key("ohlc"));
        assert!(!obj.contains_key("depth"));
        assert!(
            !obj.contains_key("index_unknown"),
            "a registry-resolved tick omits the fallback flag"
        );
    }

    #[test]
    fn index_unknown_survives_the_relay_round_trip() {
        let mut tick = Tick::ltp(26000, Exchange::NSE_EQ, 25870.3, Utc::now());
        tick.index_unknown = true;
        let json = serde_json::to_string(&tick).unwrap();
        assert!(json.contains("index_unknown"));
        let back: Tick = serde_json::from_str(&json).unwrap();
        assert!(back.index_unknown);
    }

    #[test]
    fn ltp_constructor_carries_price_unscaled() {
        let tick = Tick::ltp(26000, Exchange::NSE_EQ, 25870.3, Utc::now());
        assert_eq!(tick.last_price, 25870.3);
    }
}
