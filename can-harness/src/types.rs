//! Core types for the CAN test harness
//!
//! This module defines the wire-level frame representation, the signal value
//! type exchanged between callers and the encoding pipeline, and the closed
//! error taxonomy used across the crate.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type used throughout the harness
pub type Timestamp = DateTime<Utc>;

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// A complete set of signal values for one message, keyed by signal name.
///
/// A `BTreeMap` keeps iteration order deterministic, which keeps logs and
/// payload construction stable across runs.
pub type SignalSet = BTreeMap<String, SignalValue>;

/// A raw CAN frame as sent to or received from a bus
///
/// This is the wire-level contract the harness reproduces exactly: an
/// 11-bit standard or 29-bit extended arbitration id, up to 8 payload bytes
/// for classic CAN or 64 for CAN-FD, and the FD/extended/remote flags.
#[derive(Debug, Clone, PartialEq)]
pub struct CanFrame {
    /// Timestamp in nanoseconds since epoch (0 for frames built locally)
    pub timestamp_ns: u64,
    /// Channel identity string of the bus this frame belongs to
    pub channel: String,
    /// CAN arbitration id (11-bit or 29-bit)
    pub can_id: u32,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
    /// True if this is a remote frame
    pub is_remote: bool,
}

impl CanFrame {
    /// Build an outgoing frame with no timestamp and no channel binding
    pub fn new(can_id: u32, data: Vec<u8>) -> Self {
        Self {
            timestamp_ns: 0,
            channel: String::new(),
            can_id,
            data,
            is_extended: can_id > 0x7FF,
            is_fd: false,
            is_remote: false,
        }
    }

    /// Convert timestamp from nanoseconds to DateTime<Utc>
    pub fn timestamp(&self) -> Timestamp {
        let secs = (self.timestamp_ns / 1_000_000_000) as i64;
        let nsecs = (self.timestamp_ns % 1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nsecs).unwrap_or_else(Utc::now)
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data: Vec<String> = self.data.iter().map(|b| format!("{:02X}", b)).collect();
        write!(
            f,
            "0x{:X} [{}] {}{}",
            self.can_id,
            self.data.len(),
            data.join(" "),
            if self.is_fd { " (FD)" } else { "" }
        )
    }
}

/// A signal value as supplied by a caller or produced by decoding
#[derive(Debug, Clone, PartialEq)]
pub enum SignalValue {
    /// Numeric physical value (after scale/offset)
    Num(f64),
    /// Symbolic value from a signal's choice table
    Sym(String),
}

impl SignalValue {
    /// Numeric view of this value, if it is numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Num(v) => Some(*v),
            SignalValue::Sym(_) => None,
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Num(v) => write!(f, "{}", v),
            SignalValue::Sym(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        SignalValue::Num(v)
    }
}

impl From<i64> for SignalValue {
    fn from(v: i64) -> Self {
        SignalValue::Num(v as f64)
    }
}

impl From<&str> for SignalValue {
    fn from(v: &str) -> Self {
        SignalValue::Sym(v.to_string())
    }
}

/// Errors that can occur in the harness
///
/// The taxonomy is closed on purpose: callers branch on kind, never on
/// message text. `Resolution`, `GroupIntegrity` and `EncodeMismatch` are
/// non-fatal in pipeline context and are normally logged-and-skipped by the
/// operation that hits them; `Configuration` and `Transport` are raised at
/// construction/connect time.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Signal or message not found: {0}")]
    Resolution(String),

    #[error("Signal group integrity: {0}")]
    GroupIntegrity(String),

    #[error("Encode/decode mismatch on channel '{channel}' (database: {database}): {reason}")]
    EncodeMismatch {
        channel: String,
        database: String,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl HarnessError {
    /// Build an encode/decode failure without bus context; the controller
    /// fills in channel and database identity via [`Self::with_bus_context`].
    pub(crate) fn codec(reason: impl Into<String>) -> Self {
        HarnessError::EncodeMismatch {
            channel: String::new(),
            database: String::new(),
            reason: reason.into(),
        }
    }

    /// Attach channel/database identity to an encode/decode failure
    pub fn with_bus_context(self, channel: &str, database: &str) -> Self {
        match self {
            HarnessError::EncodeMismatch { reason, .. } => HarnessError::EncodeMismatch {
                channel: channel.to_string(),
                database: database.to_string(),
                reason,
            },
            other => other,
        }
    }
}
