//! Subscription mode — the information depth of a tick stream.

use serde::{Deserialize, Serialize};

use crate::constants::{PACKET_LEN_FULL, PACKET_LEN_LTP, PACKET_LEN_OHLCV};
use crate::error::GatewayError;

/// Data mode for an instrument subscription.
///
/// Modes form a total order by information content (`ltp < ohlcv < full`).
/// When several clients subscribe the same instrument at different modes, the
/// multiplexer keeps the upstream subscription at the **maximum** of the
/// requested modes and every client receives that superset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Last traded price only.
    Ltp,
    /// LTP plus OHLC, last trade time, and volume.
    Ohlcv,
    /// Everything: averages, quantities, open interest, 5-level depth, DPR.
    Full,
}

impl Mode {
    /// Wire label used in upstream control frames and client payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Ohlcv => "ohlcv",
            Self::Full => "full",
        }
    }

    /// Parse a client-supplied mode string.
    pub fn parse(s: &str) -> Result<Self, GatewayError> {
        match s {
            "ltp" => Ok(Self::Ltp),
            "ohlcv" => Ok(Self::Ohlcv),
            "full" => Ok(Self::Full),
            other => Err(GatewayError::InvalidMode(other.to_owned())),
        }
    }

    /// The upstream binary packet length this mode produces for non-index
    /// instruments.
    pub fn packet_len(self) -> usize {
        match self {
            Self::Ltp => PACKET_LEN_LTP,
            Self::Ohlcv => PACKET_LEN_OHLCV,
            Self::Full => PACKET_LEN_FULL,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_order_is_by_information_content() {
        assert!(Mode::Ltp < Mode::Ohlcv);
        assert!(Mode::Ohlcv < Mode::Full);
        assert_eq!(Mode::Ltp.max(Mode::Full), Mode::Full);
    }

    #[test]
    fn parse_round_trips_wire_labels() {
        for mode in [Mode::Ltp, Mode::Ohlcv, Mode::Full] {
            assert_eq!(Mode::parse(mode.as_str()).unwrap(), mode);
        }
        assert!(Mode::parse("depth").is_err());
    }

    #[test]
    fn packet_lengths_match_wire_protocol() {
        assert_eq!(Mode::Ltp.packet_len(), 22);
        assert_eq!(Mode::Ohlcv.packet_len(), 62);
        assert_eq!(Mode::Full.packet_len(), 266);
    }
}
