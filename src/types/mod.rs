//! Shared domain types.
//!
//! ## Organization
//!
//! - [`mode`] — subscription mode (`ltp | ohlcv | full`), total-ordered
//! - [`instrument`] — exchange labels, (exchange, token) pairs, registry records
//! - [`tick`] — the normalized tick every transport sees
//! - [`api_key`] — tenant API keys and the abuse verdict
//!
//! The core identifiers are re-exported at the module root.

pub mod api_key;
pub mod instrument;
pub mod mode;
pub mod tick;

pub use api_key::{AbuseStatus, ApiKey};
pub use instrument::{Exchange, InstrumentRecord, InstrumentType, Pair};
pub use mode::Mode;
pub use tick::{Depth, DepthLevel, Ohlc, Tick};
