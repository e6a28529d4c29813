//! Exchange labels, instrument pairs, and registry records.
//!
//! Variant names use `SCREAMING_SNAKE_CASE` to match the string values on the
//! wire (control frames, REST payloads, and the binary packet exchange tag),
//! so we suppress the Rust naming convention lint.
#![allow(non_camel_case_types)]

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// Exchange segment identifier accepted by the upstream wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    /// NSE Equity Cash.
    NSE_EQ,
    /// NSE Futures & Options.
    NSE_FO,
    /// NSE Currency Derivatives.
    NSE_CUR,
    /// MCX Commodity Futures & Options.
    MCX_FO,
}

impl Exchange {
    /// All exchange segments the gateway serves.
    pub const ALL: [Exchange; 4] = [
        Exchange::NSE_EQ,
        Exchange::NSE_FO,
        Exchange::NSE_CUR,
        Exchange::MCX_FO,
    ];

    /// Wire label for control frames and client payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NSE_EQ => "NSE_EQ",
            Self::NSE_FO => "NSE_FO",
            Self::NSE_CUR => "NSE_CUR",
            Self::MCX_FO => "MCX_FO",
        }
    }

    /// Parse a wire label; also tolerates the padded ASCII tag from binary
    /// packets (trailing NUL/space stripped by the caller).
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "NSE_EQ" => Some(Self::NSE_EQ),
            "NSE_FO" => Some(Self::NSE_FO),
            "NSE_CUR" => Some(Self::NSE_CUR),
            "MCX_FO" => Some(Self::MCX_FO),
            _ => None,
        }
    }

    /// Divisor applied when the upstream REST surface reports money as a
    /// scaled integer (paise, or 10^7 units on the currency segment). The
    /// binary feed already carries rupee doubles and is never scaled.
    pub fn price_divisor(self) -> f64 {
        match self {
            Self::NSE_CUR => 10_000_000.0,
            _ => 100.0,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pair
// ---------------------------------------------------------------------------

/// An (exchange, token) pair — the only instrument identifier the upstream
/// wire protocol accepts.
///
/// Tokens may repeat across exchanges after contract expiries, so a bare
/// token is never a durable identity; durable identity is (exchange, symbol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    /// Exchange segment.
    pub exchange: Exchange,
    /// Instrument token, scoped by the exchange.
    pub token: i32,
}

impl Pair {
    /// Create a new pair.
    pub fn new(exchange: Exchange, token: i32) -> Self {
        Self { exchange, token }
    }

    /// Parse the `"EXCHANGE-TOKEN"` form accepted in subscribe payloads.
    pub fn parse(s: &str) -> Option<Self> {
        let (exchange, token) = s.rsplit_once('-')?;
        Some(Self {
            exchange: Exchange::from_label(exchange)?,
            token: token.parse().ok()?,
        })
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.exchange, self.token)
    }
}

// ---------------------------------------------------------------------------
// Instrument type
// ---------------------------------------------------------------------------

/// Instrument classification from the registry master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentType {
    /// Cash equity.
    EQ,
    /// Stock future.
    FUTSTK,
    /// Index future.
    FUTIDX,
    /// Currency future.
    FUTCUR,
    /// Commodity future.
    FUTCOM,
    /// Call option.
    CE,
    /// Put option.
    PE,
    /// Index value (no volume, OI, or depth on the feed).
    INDEX,
}

impl InstrumentType {
    /// Whether the feed emits the short index packet for this type.
    pub fn is_index(self) -> bool {
        matches!(self, Self::INDEX)
    }

    /// Parse the master-CSV label.
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "EQ" | "EQUITY" => Some(Self::EQ),
            "FUTSTK" => Some(Self::FUTSTK),
            "FUTIDX" => Some(Self::FUTIDX),
            "FUTCUR" => Some(Self::FUTCUR),
            "FUTCOM" => Some(Self::FUTCOM),
            "CE" => Some(Self::CE),
            "PE" => Some(Self::PE),
            "INDEX" | "IDX" => Some(Self::INDEX),
            _ => None,
        }
    }

    /// Wire/storage label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EQ => "EQ",
            Self::FUTSTK => "FUTSTK",
            Self::FUTIDX => "FUTIDX",
            Self::FUTCUR => "FUTCUR",
            Self::FUTCOM => "FUTCOM",
            Self::CE => "CE",
            Self::PE => "PE",
            Self::INDEX => "INDEX",
        }
    }
}

// ---------------------------------------------------------------------------
// Registry record
// ---------------------------------------------------------------------------

/// One row of the instrument master, keyed durably by (exchange, symbol) and
/// for the live session by (exchange, token).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentRecord {
    /// Exchange-scoped instrument token.
    pub token: i32,
    /// Exchange segment.
    pub exchange: Exchange,
    /// Trading symbol, unique within the exchange.
    pub symbol: String,
    /// Instrument classification.
    pub instrument_type: InstrumentType,
    /// Contract expiry, derivatives only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<NaiveDate>,
    /// Option strike, CE/PE only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strike: Option<f64>,
    /// Contract lot size.
    pub lot_size: i32,
    /// Minimum price increment.
    pub tick_size: f64,
    /// Whether the row was present in the latest master sync.
    pub is_active: bool,
    /// When the row was last marked inactive, if ever. Inactive rows stay
    /// resolvable for 24 h so in-flight subscriptions can be torn down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl InstrumentRecord {
    /// The live (exchange, token) pair for this record.
    pub fn pair(&self) -> Pair {
        Pair::new(self.exchange, self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_parse_accepts_exchange_token_form() {
        let pair = Pair::parse("NSE_EQ-26000").unwrap();
        assert_eq!(pair.exchange, Exchange::NSE_EQ);
        assert_eq!(pair.token, 26000);
    }

    #[test]
    fn pair_parse_rejects_unknown_exchange() {
        assert!(Pair::parse("BSE_EQ-500325").is_none());
        assert!(Pair::parse("26000").is_none());
        assert!(Pair::parse("NSE_EQ-notanumber").is_none());
    }

    #[test]
    fn currency_segment_uses_larger_divisor() {
        assert_eq!(Exchange::NSE_CUR.price_divisor(), 10_000_000.0);
        assert_eq!(Exchange::NSE_EQ.price_divisor(), 100.0);
        assert_eq!(Exchange::MCX_FO.price_divisor(), 100.0);
    }

    #[test]
    fn exchange_labels_round_trip() {
        for ex in Exchange::ALL {
            assert_eq!(Exchange::from_label(ex.as_str()), Some(ex));
        }
    }
}
