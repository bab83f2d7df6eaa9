//! Unified CAN database
//!
//! Holds message and signal metadata for one bus database and answers the
//! lookups the encoding pipeline needs: message by name, by frame id, by
//! signal name, and signal-group resolution for E2E-protected messages.

use crate::codec;
use crate::types::{HarnessError, Result, SignalSet};
use std::collections::HashMap;

/// Byte order for signal packing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// Send type of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendType {
    /// Transmitted on a fixed cycle
    Cyclic,
    /// Transmitted on demand
    Event,
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalSpec {
    /// Signal name (unique within its message)
    pub name: String,
    /// Start bit in the CAN frame
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub scale: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Initial raw value (used for default synthesis), if declared
    pub initial: Option<f64>,
    /// Choice table for enum-like values (raw value -> label)
    pub choices: Option<HashMap<i64, String>>,
    /// E2E data identifier (checksum signals only)
    pub data_id: Option<u16>,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
}

impl SignalSpec {
    /// Plain unsigned little-endian signal with unit scaling, no extras
    pub fn plain(name: &str, start_bit: u16, length: u16) -> Self {
        Self {
            name: name.to_string(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            scale: 1.0,
            offset: 0.0,
            initial: None,
            choices: None,
            data_id: None,
            unit: None,
        }
    }

    /// True if this signal is an update-bit marker for another signal
    pub fn is_update_bit(&self) -> bool {
        self.name.ends_with("_UB")
    }

    /// True if this signal carries an E2E checksum
    pub fn is_checksum(&self) -> bool {
        self.name.ends_with("Chks")
    }

    /// True if this signal carries an E2E rolling counter
    pub fn is_counter(&self) -> bool {
        self.name.ends_with("Cntr")
    }

    /// Map a choice label to its raw numeric value
    pub fn choice_to_number(&self, label: &str) -> Result<i64> {
        self.choices
            .as_ref()
            .and_then(|table| {
                table
                    .iter()
                    .find(|(_, name)| name.as_str() == label)
                    .map(|(raw, _)| *raw)
            })
            .ok_or_else(|| {
                HarnessError::Resolution(format!(
                    "Signal '{}' has no choice named '{}'",
                    self.name, label
                ))
            })
    }
}

/// A signal group: the signals covered by one E2E protection instance
///
/// The checksum and counter members are identified by the `…Chks` / `…Cntr`
/// naming convention within the member list.
#[derive(Debug, Clone)]
pub struct SignalGroupSpec {
    /// Group name
    pub name: String,
    /// Names of all member signals (checksum and counter included)
    pub signal_names: Vec<String>,
}

impl SignalGroupSpec {
    /// The checksum member of this group, if any
    pub fn checksum_signal(&self) -> Option<&str> {
        self.signal_names
            .iter()
            .find(|n| n.ends_with("Chks"))
            .map(String::as_str)
    }

    /// The counter member of this group, if any
    pub fn counter_signal(&self) -> Option<&str> {
        self.signal_names
            .iter()
            .find(|n| n.ends_with("Cntr"))
            .map(String::as_str)
    }
}

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageSpec {
    /// CAN arbitration id
    pub frame_id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Cycle time in milliseconds (cyclic messages)
    pub cycle_time_ms: Option<u32>,
    /// Send type (cyclic/event)
    pub send_type: SendType,
    /// True for CAN-FD messages
    pub is_fd: bool,
    /// True for 29-bit extended arbitration ids
    pub is_extended: bool,
    /// All signals in this message
    pub signals: Vec<SignalSpec>,
    /// Signal groups for E2E protection
    pub signal_groups: Vec<SignalGroupSpec>,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
}

impl MessageSpec {
    /// Look up a signal of this message by name
    pub fn signal(&self, name: &str) -> Option<&SignalSpec> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Find the signal group a signal belongs to
    pub fn signal_group_of(&self, signal_name: &str) -> Option<&SignalGroupSpec> {
        self.signal_groups
            .iter()
            .find(|g| g.signal_names.iter().any(|n| n == signal_name))
    }

    /// Encode a complete signal set into payload bytes
    pub fn encode(&self, signals: &SignalSet) -> Result<Vec<u8>> {
        codec::encode_message(self, signals)
    }

    /// Decode payload bytes into a signal set
    pub fn decode(&self, data: &[u8]) -> Result<SignalSet> {
        codec::decode_message(self, data)
    }
}

/// Bus configuration declared by the database
#[derive(Debug, Clone)]
pub struct BusSpec {
    /// Bus name
    pub name: String,
    /// True for CAN-FD buses
    pub is_fd: bool,
    /// Arbitration-phase bitrate
    pub bitrate: u32,
    /// Data-phase bitrate (FD buses)
    pub fd_bitrate: Option<u32>,
}

/// The unified CAN database
///
/// Owns immutable message/signal metadata and the lookup indices used by the
/// pipeline. Built from a DBC file (see [`crate::db::dbc`]) or assembled
/// programmatically with [`Database::add_message`].
#[derive(Debug, Default)]
pub struct Database {
    /// Message definitions in insertion order
    messages: Vec<MessageSpec>,
    /// Message name -> index into `messages`
    name_lookup: HashMap<String, usize>,
    /// Frame id -> index into `messages`
    frame_id_lookup: HashMap<u32, usize>,
    /// Signal name -> index of the owning message
    signal_lookup: HashMap<String, usize>,
    /// Bus configurations declared by the database
    buses: Vec<BusSpec>,
    /// Source file name, for diagnostics
    source: String,
}

impl Database {
    /// Create a new empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message definition and index its signals
    pub fn add_message(&mut self, message: MessageSpec) {
        let idx = self.messages.len();
        self.name_lookup.insert(message.name.clone(), idx);
        self.frame_id_lookup.insert(message.frame_id, idx);
        for signal in &message.signals {
            self.signal_lookup.insert(signal.name.clone(), idx);
        }
        self.messages.push(message);
    }

    /// Add a bus configuration
    pub fn add_bus(&mut self, bus: BusSpec) {
        self.buses.push(bus);
    }

    /// Record the source file this database was loaded from
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    /// Source file name, for diagnostics ("<builtin>" if assembled in code)
    pub fn source(&self) -> &str {
        if self.source.is_empty() {
            "<builtin>"
        } else {
            &self.source
        }
    }

    /// Bus configurations declared by the database
    pub fn buses(&self) -> &[BusSpec] {
        &self.buses
    }

    /// All message definitions
    pub fn messages(&self) -> &[MessageSpec] {
        &self.messages
    }

    /// Get a message definition by name
    pub fn message_by_name(&self, name: &str) -> Result<&MessageSpec> {
        self.name_lookup
            .get(name)
            .map(|&idx| &self.messages[idx])
            .ok_or_else(|| HarnessError::Resolution(format!("Message '{}' not found", name)))
    }

    /// Get a message definition by arbitration id
    pub fn message_by_frame_id(&self, frame_id: u32) -> Result<&MessageSpec> {
        self.frame_id_lookup
            .get(&frame_id)
            .map(|&idx| &self.messages[idx])
            .ok_or_else(|| {
                HarnessError::Resolution(format!("Message with frame id 0x{:X} not found", frame_id))
            })
    }

    /// Get the message that owns a signal
    pub fn message_by_signal(&self, signal_name: &str) -> Result<&MessageSpec> {
        self.signal_lookup
            .get(signal_name)
            .map(|&idx| &self.messages[idx])
            .ok_or_else(|| {
                HarnessError::Resolution(format!("No message owns signal '{}'", signal_name))
            })
    }

    /// Get a signal definition by name
    pub fn signal_by_name(&self, signal_name: &str) -> Result<&SignalSpec> {
        self.message_by_signal(signal_name)?
            .signal(signal_name)
            .ok_or_else(|| HarnessError::Resolution(format!("Signal '{}' not found", signal_name)))
    }

    /// Install an E2E data identifier on a checksum signal.
    ///
    /// Plain DBC files carry no E2E attributes, so data ids are installed
    /// after loading. Fails if the signal does not exist.
    pub fn set_data_id(&mut self, signal_name: &str, data_id: u16) -> Result<()> {
        let idx = *self.signal_lookup.get(signal_name).ok_or_else(|| {
            HarnessError::Resolution(format!("Signal '{}' not found", signal_name))
        })?;
        let signal = self.messages[idx]
            .signals
            .iter_mut()
            .find(|s| s.name == signal_name)
            .expect("signal index out of sync");
        signal.data_id = Some(data_id);
        Ok(())
    }

    /// Declare a message cyclic with the given period. Cycle times live in
    /// DBC attributes the loader does not surface, so they are installed
    /// after loading.
    pub fn set_cycle_time(&mut self, message_name: &str, cycle_time_ms: u32) -> Result<()> {
        let idx = *self.name_lookup.get(message_name).ok_or_else(|| {
            HarnessError::Resolution(format!("Message '{}' not found", message_name))
        })?;
        self.messages[idx].cycle_time_ms = Some(cycle_time_ms);
        self.messages[idx].send_type = SendType::Cyclic;
        Ok(())
    }

    /// Install a choice table on a signal (see [`Database::set_data_id`];
    /// same rationale — plain DBC parsing does not surface these).
    pub fn set_choices(&mut self, signal_name: &str, choices: HashMap<i64, String>) -> Result<()> {
        let idx = *self.signal_lookup.get(signal_name).ok_or_else(|| {
            HarnessError::Resolution(format!("Signal '{}' not found", signal_name))
        })?;
        let signal = self.messages[idx]
            .signals
            .iter_mut()
            .find(|s| s.name == signal_name)
            .expect("signal index out of sync");
        signal.choices = Some(choices);
        Ok(())
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.iter().map(|m| m.signals.len()).sum(),
            num_signal_groups: self.messages.iter().map(|m| m.signal_groups.len()).sum(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
    /// Total number of signal groups
    pub num_signal_groups: usize,
}
