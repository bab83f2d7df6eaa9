//! Signal packing and unpacking
//!
//! Turns a complete signal set into payload bytes and back, based on the
//! signal definitions of the owning message. Handles bit insertion and
//! extraction with both byte orders, sign extension, and physical value
//! conversion via scale/offset and choice tables.

use crate::db::{ByteOrder, MessageSpec, SignalSpec, ValueType};
use crate::types::{HarnessError, Result, SignalSet, SignalValue};

/// Encode a complete signal set into payload bytes.
///
/// Every signal declared by the message must be present in the set; the
/// resolver (see [`crate::resolve`]) guarantees this for pipeline callers.
pub fn encode_message(message: &MessageSpec, signals: &SignalSet) -> Result<Vec<u8>> {
    let mut data = vec![0u8; message.size];

    for signal in &message.signals {
        let value = signals.get(&signal.name).ok_or_else(|| {
            HarnessError::codec(format!(
                "Signal '{}' missing from set for message '{}'",
                signal.name, message.name
            ))
        })?;
        let raw = raw_from_value(signal, value)?;
        insert_signal_value(&mut data, signal, raw)?;
    }

    Ok(data)
}

/// Decode payload bytes into a signal set.
///
/// Signals whose raw value has a choice-table entry decode to the symbolic
/// label; all others decode to their physical value.
pub fn decode_message(message: &MessageSpec, data: &[u8]) -> Result<SignalSet> {
    let mut signals = SignalSet::new();

    for signal in &message.signals {
        let raw = extract_signal_value(data, signal)?;
        let value = match signal.choices.as_ref().and_then(|table| table.get(&raw)) {
            Some(label) => SignalValue::Sym(label.clone()),
            None => SignalValue::Num(signal.offset + signal.scale * raw as f64),
        };
        signals.insert(signal.name.clone(), value);
    }

    Ok(signals)
}

/// Convert a physical or symbolic value to the signal's raw integer form
pub fn raw_from_value(signal: &SignalSpec, value: &SignalValue) -> Result<i64> {
    match value {
        SignalValue::Num(phys) => Ok(((phys - signal.offset) / signal.scale).round() as i64),
        SignalValue::Sym(label) => signal.choice_to_number(label),
    }
}

/// Extract a signal's raw value from payload bytes
pub fn extract_signal_value(data: &[u8], signal: &SignalSpec) -> Result<i64> {
    let start_bit = signal.start_bit as usize;
    let length = signal.length as usize;

    let required_bytes = (start_bit + length + 7) / 8;
    if required_bytes > data.len() {
        return Err(HarnessError::codec(format!(
            "Signal '{}' requires {} bytes but frame only has {} bytes",
            signal.name,
            required_bytes,
            data.len()
        )));
    }

    let raw_value = match signal.byte_order {
        ByteOrder::LittleEndian => extract_little_endian(data, start_bit, length),
        ByteOrder::BigEndian => extract_big_endian(data, start_bit, length),
    };

    Ok(match signal.value_type {
        ValueType::Unsigned => raw_value as i64,
        ValueType::Signed => sign_extend(raw_value, length),
    })
}

/// Insert a signal's raw value into payload bytes
pub fn insert_signal_value(data: &mut [u8], signal: &SignalSpec, raw: i64) -> Result<()> {
    let start_bit = signal.start_bit as usize;
    let length = signal.length as usize;

    let required_bytes = (start_bit + length + 7) / 8;
    if required_bytes > data.len() {
        return Err(HarnessError::codec(format!(
            "Signal '{}' requires {} bytes but frame only has {} bytes",
            signal.name,
            required_bytes,
            data.len()
        )));
    }

    // Two's-complement truncation to the signal width covers both signed and
    // unsigned insertion.
    let mask = if length >= 64 { u64::MAX } else { (1u64 << length) - 1 };
    let value = (raw as u64) & mask;
    if raw >= 0 && (raw as u64) > mask {
        log::warn!(
            "Signal '{}': value {} exceeds {} bits, truncating",
            signal.name,
            raw,
            length
        );
    }

    match signal.byte_order {
        ByteOrder::LittleEndian => insert_little_endian(data, start_bit, length, value),
        ByteOrder::BigEndian => insert_big_endian(data, start_bit, length, value),
    }
    Ok(())
}

/// Extract signal with little-endian (Intel) byte order
///
/// Start bit points to the LSB; bits are numbered from LSB to MSB within
/// each byte.
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;

        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit_value as u64) << i;
        }
    }

    result
}

/// Extract signal with big-endian (Motorola) byte order
///
/// Start bit points to the MSB of the signal; bit 0 = MSB of byte 0.
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = 7 - (bit_pos % 8);

        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit_value as u64) << (length - 1 - i);
        }
    }

    result
}

/// Insert signal with little-endian (Intel) byte order
fn insert_little_endian(data: &mut [u8], start_bit: usize, length: usize, value: u64) {
    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;

        let bit_value = ((value >> i) & 0x01) as u8;
        data[byte_idx] = (data[byte_idx] & !(1 << bit_in_byte)) | (bit_value << bit_in_byte);
    }
}

/// Insert signal with big-endian (Motorola) byte order
fn insert_big_endian(data: &mut [u8], start_bit: usize, length: usize, value: u64) {
    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = 7 - (bit_pos % 8);

        let bit_value = ((value >> (length - 1 - i)) & 0x01) as u8;
        data[byte_idx] = (data[byte_idx] & !(1 << bit_in_byte)) | (bit_value << bit_in_byte);
    }
}

/// Sign-extend a value from N bits to 64 bits
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MessageSpec, SendType, SignalSpec};

    fn test_message() -> MessageSpec {
        let mut temp = SignalSpec::plain("Temp", 16, 8);
        temp.scale = 0.5;
        temp.offset = -40.0;
        MessageSpec {
            frame_id: 0x100,
            name: "TestMsg".to_string(),
            size: 4,
            cycle_time_ms: None,
            send_type: SendType::Event,
            is_fd: false,
            is_extended: false,
            signals: vec![SignalSpec::plain("Speed", 0, 16), temp],
            signal_groups: vec![],
            sender: None,
        }
    }

    #[test]
    fn test_extract_little_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_little_endian(&data, 0, 8), 0xAB);
    }

    #[test]
    fn test_extract_little_endian_cross_byte() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_little_endian(&data, 0, 16), 0xCDAB);
    }

    #[test]
    fn test_extract_big_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_big_endian(&data, 0, 8), 0xAB);
    }

    #[test]
    fn test_insert_extract_roundtrip_le() {
        let mut data = vec![0u8; 8];
        insert_little_endian(&mut data, 5, 12, 0xABC);
        assert_eq!(extract_little_endian(&data, 5, 12), 0xABC);
    }

    #[test]
    fn test_insert_extract_roundtrip_be() {
        let mut data = vec![0u8; 8];
        insert_big_endian(&mut data, 3, 11, 0x5A5);
        assert_eq!(extract_big_endian(&data, 3, 11), 0x5A5);
    }

    #[test]
    fn test_insert_clears_previous_bits() {
        let mut data = vec![0xFF; 4];
        insert_little_endian(&mut data, 8, 8, 0x00);
        assert_eq!(data, vec![0xFF, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_sign_extend_negative() {
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x8000, 16), -32768);
        assert_eq!(sign_extend(0x7F, 8), 127);
    }

    #[test]
    fn test_message_encode_decode_roundtrip() {
        let message = test_message();
        let mut signals = SignalSet::new();
        signals.insert("Speed".to_string(), SignalValue::Num(1200.0));
        signals.insert("Temp".to_string(), SignalValue::Num(25.0)); // raw 130

        let data = encode_message(&message, &signals).unwrap();
        let decoded = decode_message(&message, &data).unwrap();

        assert_eq!(decoded.get("Speed"), Some(&SignalValue::Num(1200.0)));
        assert_eq!(decoded.get("Temp"), Some(&SignalValue::Num(25.0)));
    }

    #[test]
    fn test_decode_to_symbol() {
        let mut message = test_message();
        let mut choices = std::collections::HashMap::new();
        choices.insert(3, "Drive".to_string());
        message.signals[0].choices = Some(choices);

        let mut signals = SignalSet::new();
        signals.insert("Speed".to_string(), SignalValue::Sym("Drive".to_string()));
        signals.insert("Temp".to_string(), SignalValue::Num(0.0));

        let data = encode_message(&message, &signals).unwrap();
        let decoded = decode_message(&message, &data).unwrap();
        assert_eq!(decoded.get("Speed"), Some(&SignalValue::Sym("Drive".to_string())));
    }

    #[test]
    fn test_encode_missing_signal_fails() {
        let message = test_message();
        let signals = SignalSet::new();
        assert!(encode_message(&message, &signals).is_err());
    }

    #[test]
    fn test_decode_short_frame_fails() {
        let message = test_message();
        assert!(decode_message(&message, &[0x00]).is_err());
    }
}
