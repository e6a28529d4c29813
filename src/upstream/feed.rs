//! Binary tick parser for the Vortex feed.
//!
//! Every binary WebSocket frame carries one or more packets. Each packet is
//! prefixed by a little-endian `i16` length, and the length dispatches the
//! layout:
//!
//! | length | kind        | payload                                           |
//! |-------:|-------------|---------------------------------------------------|
//! |     22 | ltp         | exchange tag, token, last price                   |
//! |     58 | index ohlcv | ltp fields + trade time + OHLC (no volume)        |
//! |     62 | ohlcv       | ltp fields + trade time + OHLC + volume           |
//! |    266 | full        | ohlcv + averages, quantities, OI, depth, DPR band |
//!
//! Indices use the shorter volume-less form. Dispatch is **registry-first**:
//! the parser peeks the token and consults the registry's [`TypeHints`] —
//! a known index expects the 22/58 layouts, a known non-index the 22/62/266
//! ones. When the registry is cold for a token (no hint), dispatch falls
//! back to packet length alone and the resulting tick carries
//! `index_unknown = true`; a hint that contradicts the wire framing also
//! falls back to length, because the wire is authoritative about its own
//! packets. The hint view is an in-memory snapshot, so the parser never
//! suspends.
//!
//! The exchange tag is 10 bytes of right-padded ASCII. Prices arrive as IEEE
//! 754 doubles already in rupees — no scaling. Feed timestamps are epoch
//! seconds offset to IST; conversion to UTC is explicit here and nowhere
//! else. A single malformed packet never poisons the rest of its frame.
//!
//! Frame offsets are `usize` throughout: a frame larger than 65 535 bytes is
//! legal and must not truncate.

use chrono::{DateTime, Utc};

use crate::constants::{
    PACKET_EXCHANGE_TAG_LEN, PACKET_LEN_FULL, PACKET_LEN_INDEX_OHLCV, PACKET_LEN_LTP,
    PACKET_LEN_OHLCV,
};
use crate::error::{GatewayError, Result};
use crate::registry::TypeHints;
use crate::types::{Depth, DepthLevel, Exchange, Ohlc, Tick};

/// IST is UTC+05:30; the feed's epoch-second fields have this baked in.
pub const IST_OFFSET_SECS: i64 = 5 * 3600 + 30 * 60;

// ---------------------------------------------------------------------------
// Little-endian cursor helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_i16_le(data: &[u8], offset: &mut usize) -> i16 {
    let v = i16::from_le_bytes([data[*offset], data[*offset + 1]]);
    *offset += 2;
    v
}

#[inline(always)]
fn read_i32_le(data: &[u8], offset: &mut usize) -> i32 {
    let v = i32::from_le_bytes(data[*offset..*offset + 4].try_into().unwrap());
    *offset += 4;
    v
}

#[inline(always)]
fn read_i64_le(data: &[u8], offset: &mut usize) -> i64 {
    let v = i64::from_le_bytes(data[*offset..*offset + 8].try_into().unwrap());
    *offset += 8;
    v
}

#[inline(always)]
fn read_f64_le(data: &[u8], offset: &mut usize) -> f64 {
    let v = f64::from_le_bytes(data[*offset..*offset + 8].try_into().unwrap());
    *offset += 8;
    v
}

/// Convert a feed timestamp (epoch seconds, IST-offset) to UTC. Zero and
/// negative values mean "absent".
pub fn ist_epoch_to_utc(secs: i32) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs as i64 - IST_OFFSET_SECS, 0)
}

fn read_exchange_tag(data: &[u8], offset: &mut usize) -> Result<Exchange> {
    let raw = &data[*offset..*offset + PACKET_EXCHANGE_TAG_LEN];
    *offset += PACKET_EXCHANGE_TAG_LEN;
    let label = std::str::from_utf8(raw)
        .map_err(|_| GatewayError::Internal("non-ascii exchange tag".into()))?
        .trim_end_matches(['\0', ' ']);
    Exchange::from_label(label).ok_or_else(|| {
        GatewayError::Internal(format!("unknown exchange tag in packet: {label:?}"))
    })
}

// ---------------------------------------------------------------------------
// Packet parsing
// ---------------------------------------------------------------------------

/// Read the token out of a packet's common prefix without consuming it.
fn peek_token(data: &[u8]) -> Option<i32> {
    let bytes = data.get(PACKET_EXCHANGE_TAG_LEN..PACKET_EXCHANGE_TAG_LEN + 4)?;
    Some(i32::from_le_bytes(bytes.try_into().ok()?))
}

/// Length-only dispatch — the cold-registry fallback, and the arbiter when a
/// hint contradicts the wire framing.
fn parse_by_length(data: &[u8], server_ts: DateTime<Utc>) -> Result<Tick> {
    match data.len() {
        PACKET_LEN_LTP => parse_ltp(data, server_ts),
        PACKET_LEN_INDEX_OHLCV => parse_ohlcv(data, server_ts, false),
        PACKET_LEN_OHLCV => parse_ohlcv(data, server_ts, true),
        PACKET_LEN_FULL => parse_full(data, server_ts),
        other => Err(GatewayError::Internal(format!(
            "unknown packet length: {other} bytes"
        ))),
    }
}

/// Parse one packet (length already sliced off the frame) into a [`Tick`].
///
/// Dispatch consults the registry's type hints first; a token the registry
/// is cold for goes through [`parse_by_length`] and the tick is flagged
/// `index_unknown`. `server_ts` is stamped by the caller so one frame's
/// packets share a receive timestamp.
pub fn parse_packet(data: &[u8], server_ts: DateTime<Utc>, hints: &TypeHints) -> Result<Tick> {
    let hint = peek_token(data).and_then(|token| hints.get(token));
    let mut tick = match hint {
        Some(t) if t.is_index() => match data.len() {
            PACKET_LEN_LTP => parse_ltp(data, server_ts),
            PACKET_LEN_INDEX_OHLCV => parse_ohlcv(data, server_ts, false),
            _ => parse_by_length(data, server_ts),
        },
        Some(_) => match data.len() {
            PACKET_LEN_LTP => parse_ltp(data, server_ts),
            PACKET_LEN_OHLCV => parse_ohlcv(data, server_ts, true),
            PACKET_LEN_FULL => parse_full(data, server_ts),
            _ => parse_by_length(data, server_ts),
        },
        None => parse_by_length(data, server_ts),
    }?;
    tick.index_unknown = hint.is_none();
    Ok(tick)
}

fn parse_ltp(data: &[u8], server_ts: DateTime<Utc>) -> Result<Tick> {
    let mut off = 0usize;
    let exchange = read_exchange_tag(data, &mut off)?;
    let token = read_i32_le(data, &mut off);
    let last_price = read_f64_le(data, &mut off);
    Ok(Tick::ltp(token, exchange, last_price, server_ts))
}

fn parse_ohlcv(data: &[u8], server_ts: DateTime<Utc>, has_volume: bool) -> Result<Tick> {
    let mut off = 0usize;
    let exchange = read_exchange_tag(data, &mut off)?;
    let token = read_i32_le(data, &mut off);
    let last_price = read_f64_le(data, &mut off);
    let ltt = read_i32_le(data, &mut off);
    let ohlc = Ohlc {
        open: read_f64_le(data, &mut off),
        high: read_f64_le(data, &mut off),
        low: read_f64_le(data, &mut off),
        close: read_f64_le(data, &mut off),
    };
    let volume = has_volume.then(|| read_i32_le(data, &mut off));

    let mut tick = Tick::ltp(token, exchange, last_price, server_ts);
    tick.last_trade_time = ist_epoch_to_utc(ltt);
    tick.ohlc = Some(ohlc);
    tick.volume = volume;
    Ok(tick)
}

fn parse_full(data: &[u8], server_ts: DateTime<Utc>) -> Result<Tick> {
    let mut off = 0usize;
    let exchange = read_exchange_tag(data, &mut off)?;
    let token = read_i32_le(data, &mut off);
    let last_price = read_f64_le(data, &mut off);
    let ltt = read_i32_le(data, &mut off);
    let ohlc = Ohlc {
        open: read_f64_le(data, &mut off),
        high: read_f64_le(data, &mut off),
        low: read_f64_le(data, &mut off),
        close: read_f64_le(data, &mut off),
    };
    let volume = read_i32_le(data, &mut off);
    let avg_price = read_f64_le(data, &mut off);
    let total_buy_qty = read_i64_le(data, &mut off);
    let total_sell_qty = read_i64_le(data, &mut off);
    let oi = read_i32_le(data, &mut off);
    let lut = read_i32_le(data, &mut off);
    let last_trade_qty = read_i32_le(data, &mut off);

    let mut level = || DepthLevel {
        price: read_f64_le(data, &mut off),
        quantity: read_i32_le(data, &mut off),
        orders: read_i32_le(data, &mut off),
    };
    let bid = [level(), level(), level(), level(), level()];
    let ask = [level(), level(), level(), level(), level()];

    let dpr_high = read_i32_le(data, &mut off);
    let dpr_low = read_i32_le(data, &mut off);
    debug_assert_eq!(off, PACKET_LEN_FULL);

    let mut tick = Tick::ltp(token, exchange, last_price, server_ts);
    tick.last_trade_time = ist_epoch_to_utc(ltt);
    tick.ohlc = Some(ohlc);
    tick.volume = Some(volume);
    tick.avg_price = Some(avg_price);
    tick.total_buy_qty = Some(total_buy_qty);
    tick.total_sell_qty = Some(total_sell_qty);
    tick.oi = Some(oi);
    tick.last_update_time = ist_epoch_to_utc(lut);
    tick.last_trade_qty = Some(last_trade_qty);
    tick.depth = Some(Depth { bid, ask });
    tick.dpr = Some((dpr_high, dpr_low));
    Ok(tick)
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// Split a binary frame into packets and parse each one.
///
/// Returns one entry per packet so a malformed packet can be logged and
/// skipped without losing the rest of the frame. A 1-byte frame is the
/// upstream keep-alive and yields nothing.
pub fn parse_frame(data: &[u8], server_ts: DateTime<Utc>, hints: &TypeHints) -> Vec<Result<Tick>> {
    if data.len() <= 1 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut off = 0usize;
    while off + 2 <= data.len() {
        let len = read_i16_le(data, &mut off);
        if len <= 0 {
            out.push(Err(GatewayError::Internal(format!(
                "non-positive packet length: {len}"
            ))));
            break;
        }
        let len = len as usize;
        if off + len > data.len() {
            out.push(Err(GatewayError::Internal(format!(
                "truncated packet: need {len} bytes, {} remain",
                data.len() - off
            ))));
            break;
        }
        out.push(parse_packet(&data[off..off + len], server_ts, hints));
        off += len;
    }
    out
}

// ---------------------------------------------------------------------------
// Packet encoders — the wire tests and the mock upstream build frames here
// ---------------------------------------------------------------------------

fn push_exchange_tag(buf: &mut Vec<u8>, exchange: Exchange) {
    let label = exchange.as_str().as_bytes();
    buf.extend_from_slice(label);
    buf.resize(buf.len() + (PACKET_EXCHANGE_TAG_LEN - label.len()), 0);
}

fn utc_to_ist_epoch(ts: Option<DateTime<Utc>>) -> i32 {
    ts.map(|t| (t.timestamp() + IST_OFFSET_SECS) as i32).unwrap_or(0)
}

/// Encode an LTP packet, including its length prefix.
pub fn encode_ltp(exchange: Exchange, token: i32, last_price: f64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + PACKET_LEN_LTP);
    buf.extend_from_slice(&(PACKET_LEN_LTP as i16).to_le_bytes());
    push_exchange_tag(&mut buf, exchange);
    buf.extend_from_slice(&token.to_le_bytes());
    buf.extend_from_slice(&last_price.to_le_bytes());
    buf
}

/// Encode an OHLCV packet (or the volume-less index form), length prefix
/// included.
pub fn encode_ohlcv(tick: &Tick, index: bool) -> Vec<u8> {
    let len = if index { PACKET_LEN_INDEX_OHLCV } else { PACKET_LEN_OHLCV };
    let ohlc = tick.ohlc.unwrap_or(Ohlc { open: 0.0, high: 0.0, low: 0.0, close: 0.0 });
    let mut buf = Vec::with_capacity(2 + len);
    buf.extend_from_slice(&(len as i16).to_le_bytes());
    push_exchange_tag(&mut buf, tick.exchange);
    buf.extend_from_slice(&tick.token.to_le_bytes());
    buf.extend_from_slice(&tick.last_price.to_le_bytes());
    buf.extend_from_slice(&utc_to_ist_epoch(tick.last_trade_time).to_le_bytes());
    for px in [ohlc.open, ohlc.high, ohlc.low, ohlc.close] {
        buf.extend_from_slice(&px.to_le_bytes());
    }
    if !index {
        buf.extend_from_slice(&tick.volume.unwrap_or(0).to_le_bytes());
    }
    buf
}

/// Encode a full packet, length prefix included.
pub fn encode_full(tick: &Tick) -> Vec<u8> {
    let ohlc = tick.ohlc.unwrap_or(Ohlc { open: 0.0, high: 0.0, low: 0.0, close: 0.0 });
    let empty = DepthLevel { price: 0.0, quantity: 0, orders: 0 };
    let depth = tick.depth.unwrap_or(Depth { bid: [empty; 5], ask: [empty; 5] });
    let (dpr_high, dpr_low) = tick.dpr.unwrap_or((0, 0));

    let mut buf = Vec::with_capacity(2 + PACKET_LEN_FULL);
    buf.extend_from_slice(&(PACKET_LEN_FULL as i16).to_le_bytes());
    push_exchange_tag(&mut buf, tick.exchange);
    buf.extend_from_slice(&tick.token.to_le_bytes());
    buf.extend_from_slice(&tick.last_price.to_le_bytes());
    buf.extend_from_slice(&utc_to_ist_epoch(tick.last_trade_time).to_le_bytes());
    for px in [ohlc.open, ohlc.high, ohlc.low, ohlc.close] {
        buf.extend_from_slice(&px.to_le_bytes());
    }
    buf.extend_from_slice(&tick.volume.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&tick.avg_price.unwrap_or(0.0).to_le_bytes());
    buf.extend_from_slice(&tick.total_buy_qty.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&tick.total_sell_qty.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&tick.oi.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&utc_to_ist_epoch(tick.last_update_time).to_le_bytes());
    buf.extend_from_slice(&tick.last_trade_qty.unwrap_or(0).to_le_bytes());
    for level in depth.bid.iter().chain(depth.ask.iter()) {
        buf.extend_from_slice(&level.price.to_le_bytes());
        buf.extend_from_slice(&level.quantity.to_le_bytes());
        buf.extend_from_slice(&level.orders.to_le_bytes());
    }
    buf.extend_from_slice(&dpr_high.to_le_bytes());
    buf.extend_from_slice(&dpr_low.to_le_bytes());
    debug_assert_eq!(buf.len(), 2 + PACKET_LEN_FULL);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstrumentType;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap()
    }

    /// Cold registry: every token misses.
    fn cold() -> TypeHints {
        TypeHints::new()
    }

    /// Registry warmed with one (token, type) entry.
    fn warm(token: i32, instrument_type: InstrumentType) -> TypeHints {
        let hints = TypeHints::new();
        hints.insert(token, instrument_type);
        hints
    }

    #[test]
    fn ltp_packet_round_trips() {
        let frame = encode_ltp(Exchange::NSE_EQ, 26000, 25870.30);
        let ticks = parse_frame(&frame, now(), &cold());
        assert_eq!(ticks.len(), 1);
        let tick = ticks[0].as_ref().unwrap();
        assert_eq!(tick.token, 26000);
        assert_eq!(tick.exchange, Exchange::NSE_EQ);
        assert_eq!(tick.last_price, 25870.30);
        assert!(tick.ohlc.is_none());
        assert!(tick.volume.is_none());
        assert!(tick.index_unknown, "cold registry must flag the tick");
    }

    #[test]
    fn ohlcv_packet_round_trips() {
        let mut tick = Tick::ltp(11536, Exchange::NSE_EQ, 3501.5, now());
        tick.last_trade_time = Utc.timestamp_opt(1_717_407_000, 0).single();
        tick.ohlc = Some(Ohlc { open: 3480.0, high: 3510.0, low: 3475.2, close: 3490.0 });
        tick.volume = Some(1_234_567);

        let frame = encode_ohlcv(&tick, false);
        assert_eq!(frame.len(), 2 + PACKET_LEN_OHLCV);
        let parsed = parse_frame(&frame, now(), &warm(11536, InstrumentType::EQ));
        let got = parsed[0].as_ref().unwrap();
        assert_eq!(got, &tick);
    }

    #[test]
    fn warm_registry_dispatches_index_packet_by_type() {
        let mut tick = Tick::ltp(26000, Exchange::NSE_EQ, 23500.10, now());
        tick.last_trade_time = Utc.timestamp_opt(1_717_407_000, 0).single();
        tick.ohlc = Some(Ohlc { open: 23450.0, high: 23550.0, low: 23400.0, close: 23420.0 });

        let frame = encode_ohlcv(&tick, true);
        assert_eq!(frame.len(), 2 + PACKET_LEN_INDEX_OHLCV);
        let parsed = parse_frame(&frame, now(), &warm(26000, InstrumentType::INDEX));
        let got = parsed[0].as_ref().unwrap();
        assert!(got.volume.is_none());
        assert_eq!(got.ohlc, tick.ohlc);
        assert!(
            !got.index_unknown,
            "registry resolved the type; no fallback flag"
        );
    }

    #[test]
    fn cold_registry_falls_back_to_length_dispatch_for_index_packets() {
        let mut tick = Tick::ltp(26000, Exchange::NSE_EQ, 23500.10, now());
        tick.ohlc = Some(Ohlc { open: 23450.0, high: 23550.0, low: 23400.0, close: 23420.0 });

        let frame = encode_ohlcv(&tick, true);
        let parsed = parse_frame(&frame, now(), &cold());
        let got = parsed[0].as_ref().unwrap();
        // Length-only dispatch still lands on the volume-less index layout,
        // and the tick records that the registry could not confirm it.
        assert!(got.volume.is_none());
        assert_eq!(got.ohlc, tick.ohlc);
        assert!(got.index_unknown);
    }

    #[test]
    fn warm_non_index_tick_is_not_flagged() {
        let frame = encode_ltp(Exchange::NSE_FO, 49081, 152.35);
        let parsed = parse_frame(&frame, now(), &warm(49081, InstrumentType::CE));
        assert!(!parsed[0].as_ref().unwrap().index_unknown);
    }

    #[test]
    fn stale_index_hint_defers_to_wire_framing() {
        // Registry claims index, but the wire carries a 62-byte volume
        // packet; the wire wins, the registry still counts as warm.
        let mut tick = Tick::ltp(26000, Exchange::NSE_EQ, 23500.10, now());
        tick.ohlc = Some(Ohlc { open: 23450.0, high: 23550.0, low: 23400.0, close: 23420.0 });
        tick.volume = Some(42);

        let frame = encode_ohlcv(&tick, false);
        let parsed = parse_frame(&frame, now(), &warm(26000, InstrumentType::INDEX));
        let got = parsed[0].as_ref().unwrap();
        assert_eq!(got.volume, Some(42));
        assert!(!got.index_unknown);
    }

    #[test]
    fn full_packet_round_trips_bit_exact() {
        let mut tick = Tick::ltp(49081, Exchange::NSE_FO, 152.35, now());
        tick.last_trade_time = Utc.timestamp_opt(1_717_407_123, 0).single();
        tick.ohlc = Some(Ohlc { open: 150.0, high: 155.6, low: 148.9, close: 149.5 });
        tick.volume = Some(9_876_543);
        tick.avg_price = Some(151.87);
        tick.total_buy_qty = Some(5_000_000_000);
        tick.total_sell_qty = Some(4_200_000_000);
        tick.oi = Some(123_456);
        tick.last_update_time = Utc.timestamp_opt(1_717_407_125, 0).single();
        tick.last_trade_qty = Some(75);
        let level = |p: f64, q: i32, o: i32| DepthLevel { price: p, quantity: q, orders: o };
        tick.depth = Some(Depth {
            bid: [
                level(152.30, 150, 3),
                level(152.25, 300, 7),
                level(152.20, 525, 11),
                level(152.15, 75, 2),
                level(152.10, 900, 19),
            ],
            ask: [
                level(152.40, 225, 5),
                level(152.45, 150, 4),
                level(152.50, 600, 13),
                level(152.55, 75, 1),
                level(152.60, 1050, 23),
            ],
        });
        tick.dpr = Some((167, 137));

        let frame = encode_full(&tick);
        assert_eq!(frame.len(), 2 + PACKET_LEN_FULL);
        let parsed = parse_frame(&frame, now(), &warm(49081, InstrumentType::FUTSTK));
        assert_eq!(parsed[0].as_ref().unwrap(), &tick);
    }

    #[test]
    fn multi_packet_frame_parses_in_order() {
        let mut frame = encode_ltp(Exchange::NSE_EQ, 26000, 100.0);
        frame.extend(encode_ltp(Exchange::MCX_FO, 253461, 71234.0));
        let ticks = parse_frame(&frame, now(), &cold());
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].as_ref().unwrap().token, 26000);
        assert_eq!(ticks[1].as_ref().unwrap().token, 253461);
    }

    #[test]
    fn one_byte_heartbeat_is_dropped_silently() {
        assert!(parse_frame(&[0x01], now(), &cold()).is_empty());
        assert!(parse_frame(&[], now(), &cold()).is_empty());
    }

    #[test]
    fn oversized_frame_does_not_truncate_offsets() {
        // 65 537-byte frame: one full packet up front, then enough ltp
        // packets to push the total past the u16 range.
        let mut tick = Tick::ltp(26000, Exchange::NSE_EQ, 1.0, now());
        tick.ohlc = Some(Ohlc { open: 1.0, high: 1.0, low: 1.0, close: 1.0 });
        tick.volume = Some(1);
        let mut frame = encode_full(&tick);
        while frame.len() < 65_537 - (2 + PACKET_LEN_LTP) {
            frame.extend(encode_ltp(Exchange::NSE_EQ, 26001, 2.0));
        }
        frame.extend(encode_ltp(Exchange::NSE_EQ, 26002, 3.0));
        assert!(frame.len() > u16::MAX as usize);

        let ticks = parse_frame(&frame, now(), &cold());
        assert!(ticks.iter().all(|t| t.is_ok()));
        assert_eq!(ticks.last().unwrap().as_ref().unwrap().token, 26002);
    }

    #[test]
    fn bad_packet_does_not_poison_frame_tail_before_it() {
        let mut frame = encode_ltp(Exchange::NSE_EQ, 26000, 100.0);
        // Claim 300 bytes but provide 4: the trailing error is reported and
        // parsing stops, with the leading packet intact.
        frame.extend_from_slice(&300i16.to_le_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        let ticks = parse_frame(&frame, now(), &cold());
        assert_eq!(ticks.len(), 2);
        assert!(ticks[0].is_ok());
        assert!(ticks[1].is_err());
    }

    #[test]
    fn ist_conversion_has_no_off_by_hour() {
        // 2024-03-31 01:30 IST == 2024-03-30 20:00 UTC. IST has no DST;
        // the late-March boundary that trips tz-database misuse must not
        // shift the hour.
        let ist_wall = Utc.with_ymd_and_hms(2024, 3, 31, 1, 30, 0).unwrap();
        let feed_secs = ist_wall.timestamp() as i32; // feed bakes IST into epoch
        let utc = ist_epoch_to_utc(feed_secs).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 3, 30, 20, 0, 0).unwrap());
    }

    #[test]
    fn absent_trade_time_is_none_not_epoch() {
        assert_eq!(ist_epoch_to_utc(0), None);
        assert_eq!(ist_epoch_to_utc(-5), None);
    }
}
