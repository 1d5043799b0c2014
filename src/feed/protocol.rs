//! Bitfinex v2 book channel wire format
//!
//! Inbound frames are either control objects (`{"event": ...}`) or channel
//! arrays:
//! - `[chan, "hb", seq]` heartbeat
//! - `[chan, "cs", checksum, seq]` integrity check
//! - `[chan, [[price, count, amount], ...], seq]` snapshot
//! - `[chan, [price, count, amount], seq]` delta
//!
//! Numbers may arrive as JSON numbers or numeric strings.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::book::LevelUpdate;

/// `CHECKSUM` flag: server sends `cs` integrity messages.
pub const FLAG_CHECKSUM: u64 = 131_072;
/// `SEQ_ALL` flag: every message carries a sequence number.
pub const FLAG_SEQ_ALL: u64 = 65_536;
/// Info code asking clients to reconnect.
pub const INFO_RECONNECT: i64 = 20_051;
pub const BOOK_LEN: &str = "25";
pub const BOOK_FREQ: &str = "F0";

// =============================================================================
// DECODED MESSAGES
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Event(ControlEvent),
    Heartbeat { seq: Option<u64> },
    Checksum { checksum: i32, seq: Option<u64> },
    Book { payload: BookPayload, seq: Option<u64> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookPayload {
    /// Full book; malformed entries have already been dropped.
    Levels(Vec<LevelUpdate>),
    Level(LevelUpdate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Subscribed { chan_id: Option<i64>, symbol: Option<String> },
    Conf { status: Option<String> },
    Error { code: Option<i64>, msg: Option<String> },
    Info { code: Option<i64>, msg: Option<String> },
    Other(String),
}

impl ControlEvent {
    pub fn is_reconnect_request(&self) -> bool {
        matches!(self, Self::Info { code: Some(INFO_RECONNECT), .. })
    }
}

#[derive(Debug)]
pub enum DecodeError {
    InvalidJson(serde_json::Error),
    UnexpectedShape(&'static str),
    MissingField(&'static str),
    InvalidNumber(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "invalid json: {}", e),
            Self::UnexpectedShape(what) => write!(f, "unexpected shape: {}", what),
            Self::MissingField(name) => write!(f, "missing field: {}", name),
            Self::InvalidNumber(name) => write!(f, "invalid number in {}", name),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidJson(e) => Some(e),
            _ => None,
        }
    }
}

// =============================================================================
// DECODING
// =============================================================================

pub fn decode(text: &str) -> Result<FeedMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;

    match value {
        Value::Object(obj) => {
            let event = obj
                .get("event")
                .and_then(Value::as_str)
                .ok_or(DecodeError::MissingField("event"))?;
            Ok(FeedMessage::Event(decode_event(event, &obj)))
        }
        Value::Array(items) => decode_channel(&items),
        _ => Err(DecodeError::UnexpectedShape("frame is neither object nor array")),
    }
}

fn decode_event(event: &str, obj: &serde_json::Map<String, Value>) -> ControlEvent {
    let code = obj.get("code").and_then(Value::as_i64);
    let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

    match event {
        "subscribed" => ControlEvent::Subscribed {
            chan_id: obj.get("chanId").and_then(Value::as_i64),
            symbol: text("symbol"),
        },
        "conf" => ControlEvent::Conf { status: text("status") },
        "error" => ControlEvent::Error { code, msg: text("msg") },
        "info" => ControlEvent::Info { code, msg: text("msg") },
        other => ControlEvent::Other(other.to_string()),
    }
}

fn decode_channel(items: &[Value]) -> Result<FeedMessage, DecodeError> {
    let body = items.get(1).ok_or(DecodeError::MissingField("payload"))?;

    match body {
        Value::String(tag) if tag == "hb" => Ok(FeedMessage::Heartbeat {
            seq: items.get(2).and_then(as_u64),
        }),
        Value::String(tag) if tag == "cs" => {
            let raw = items.get(2).ok_or(DecodeError::MissingField("checksum"))?;
            let checksum = as_checksum(raw).ok_or(DecodeError::InvalidNumber("checksum"))?;
            Ok(FeedMessage::Checksum {
                checksum,
                seq: items.get(3).and_then(as_u64),
            })
        }
        Value::Array(payload) => {
            let seq = items.get(2).and_then(as_u64);
            let payload = match payload.first() {
                // Empty array is an empty snapshot.
                None | Some(Value::Array(_)) => {
                    BookPayload::Levels(payload.iter().filter_map(decode_level).collect())
                }
                Some(_) => BookPayload::Level(
                    decode_level(body).ok_or(DecodeError::UnexpectedShape("delta level"))?,
                ),
            };
            Ok(FeedMessage::Book { payload, seq })
        }
        _ => Err(DecodeError::UnexpectedShape("channel payload")),
    }
}

/// `[price, count, amount]`; anything shorter or non-numeric is `None`.
fn decode_level(value: &Value) -> Option<LevelUpdate> {
    let fields = value.as_array()?;
    if fields.len() < 3 {
        return None;
    }
    let price = as_decimal(&fields[0])?;
    let count = as_count(&fields[1])?;
    let amount = as_decimal(&fields[2])?;
    Some(LevelUpdate::new(price, count, amount))
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s.trim()),
        _ => None,
    }
}

fn as_count(value: &Value) -> Option<u32> {
    let count = as_decimal(value)?;
    if !count.fract().is_zero() {
        return None;
    }
    count.to_u32()
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Signed 32-bit; values sent as unsigned are reinterpreted.
fn as_checksum(value: &Value) -> Option<i32> {
    let raw = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    i32::try_from(raw)
        .ok()
        .or_else(|| u32::try_from(raw).ok().map(|v| v as i32))
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Strip an optional `t` symbol prefix (`tBTCUSD`) and uppercase.
pub fn normalize_pair(pair: &str) -> String {
    let trimmed = pair.trim();
    let bare = match trimmed.strip_prefix('t') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_uppercase()) => rest,
        _ => trimmed,
    };
    bare.to_ascii_uppercase()
}

pub fn trading_symbol(pair: &str) -> String {
    format!("t{}", normalize_pair(pair))
}

pub fn conf_request() -> String {
    serde_json::json!({
        "event": "conf",
        "flags": FLAG_CHECKSUM | FLAG_SEQ_ALL,
    })
    .to_string()
}

pub fn subscribe_request(pair: &str, precision: &str) -> String {
    serde_json::json!({
        "event": "subscribe",
        "channel": "book",
        "symbol": trading_symbol(pair),
        "prec": precision,
        "freq": BOOK_FREQ,
        "len": BOOK_LEN,
    })
    .to_string()
}
