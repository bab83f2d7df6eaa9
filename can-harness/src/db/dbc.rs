//! DBC file loader
//!
//! Parses Vector DBC files with the `can-dbc` crate and converts them into
//! the harness database model. E2E signal groups are inferred from the
//! `…Chks` / `…Cntr` naming convention, since plain DBC carries no E2E
//! attributes; data identifiers are installed afterwards with
//! [`crate::db::Database::set_data_id`].

use crate::db::database::{
    ByteOrder, Database, MessageSpec, SendType, SignalGroupSpec, SignalSpec, ValueType,
};
use crate::types::{HarnessError, Result};
use std::path::Path;

/// Parse a DBC file into a harness database
pub fn load_dbc_file(path: &Path) -> Result<Database> {
    log::info!("Parsing DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path).map_err(|e| {
        HarnessError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Try UTF-8 first, then fallback to Latin-1/Windows-1252 encoding
    let dbc_content = match String::from_utf8(bytes.clone()) {
        Ok(content) => content,
        Err(_) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            bytes.iter().map(|&b| b as char).collect()
        }
    };

    // Parse using can-dbc crate
    let dbc = can_dbc::DBC::from_slice(dbc_content.as_bytes()).map_err(|e| {
        HarnessError::DbcParseError(format!("Failed to parse DBC file {:?}: {:?}", path, e))
    })?;

    let source_filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc")
        .to_string();

    let mut database = Database::new();
    database.set_source(source_filename);

    for dbc_msg in dbc.messages() {
        let message = convert_message(dbc_msg)?;
        database.add_message(message);
    }

    log::info!(
        "Parsed {} messages from {:?}",
        database.stats().num_messages,
        path
    );

    Ok(database)
}

/// Convert a can-dbc message to our MessageSpec
fn convert_message(dbc_msg: &can_dbc::Message) -> Result<MessageSpec> {
    let mut signals = Vec::new();
    for dbc_sig in dbc_msg.signals() {
        signals.push(convert_signal(dbc_sig)?);
    }

    // DBC extended ids carry a marker in the top bit of the raw id
    let raw_id = dbc_msg.message_id().0;
    let is_extended = raw_id & 0x8000_0000 != 0;
    let frame_id = raw_id & 0x1FFF_FFFF;

    let size = *dbc_msg.message_size() as usize;
    let signal_groups = infer_signal_groups(dbc_msg.message_name(), &signals);

    Ok(MessageSpec {
        frame_id,
        name: dbc_msg.message_name().to_string(),
        size,
        // Cycle times live in GenMsgCycleTime attributes, which plain
        // can-dbc parsing does not surface. Cyclic sends fall back to the
        // default period until the caller installs one.
        cycle_time_ms: None,
        send_type: SendType::Event,
        is_fd: size > 8,
        is_extended,
        signals,
        signal_groups,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
    })
}

/// Convert a can-dbc signal to our SignalSpec
fn convert_signal(dbc_sig: &can_dbc::Signal) -> Result<SignalSpec> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    Ok(SignalSpec {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        scale: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        initial: None,
        // TODO: populate from can-dbc value descriptions once the v5 API
        // for them is wired up; until then choices are installed via
        // Database::set_choices.
        choices: None,
        data_id: None,
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
    })
}

/// Infer E2E signal groups from checksum/counter naming conventions.
///
/// A message with exactly one `…Chks`/`…Cntr` pair gets one group covering
/// every non-update-bit signal. With several pairs, each group collects the
/// signals sharing the checksum's name prefix.
fn infer_signal_groups(message_name: &str, signals: &[SignalSpec]) -> Vec<SignalGroupSpec> {
    let checksum_names: Vec<&SignalSpec> = signals.iter().filter(|s| s.is_checksum()).collect();
    if checksum_names.is_empty() {
        return Vec::new();
    }

    let mut groups = Vec::new();
    let single = checksum_names.len() == 1;
    for chks in checksum_names {
        let prefix = chks.name.trim_end_matches("Chks");
        let counter_name = format!("{}Cntr", prefix);
        if !signals.iter().any(|s| s.name == counter_name) {
            log::warn!(
                "Message '{}': checksum signal '{}' has no counter '{}', skipping group inference",
                message_name,
                chks.name,
                counter_name
            );
            continue;
        }

        let members: Vec<String> = signals
            .iter()
            .filter(|s| !s.is_update_bit())
            .filter(|s| single || s.name.starts_with(prefix))
            .map(|s| s.name.clone())
            .collect();

        groups.push(SignalGroupSpec {
            name: prefix.to_string(),
            signal_names: members,
        });
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_simple_dbc() {
        let dbc_content = r#"
VERSION ""

NS_ :
    NS_DESC_
    CM_
    BA_DEF_
    BA_
    VAL_
    CAT_DEF_
    CAT_
    FILTER
    BA_DEF_DEF_
    EV_DATA_
    ENVVAR_DATA_
    SGTYPE_
    SGTYPE_VAL_
    BA_DEF_SGTYPE_
    BA_SGTYPE_
    SIG_TYPE_REF_
    VAL_TABLE_
    SIG_GROUP_
    SIG_VALTYPE_
    SIGTYPE_VALTYPE_
    BO_TX_BU_
    BA_DEF_REL_
    BA_REL_
    BA_SGTYPE_REL_
    SG_MUL_VAL_

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 16|8@1+ (1,-40) [-40|215] "C" ECU2

BO_ 512 BatteryStatus: 8 ECU1
 SG_ BatteryVoltage : 0|16@1+ (0.01,0) [0|16] "V" ECU2
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(dbc_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let db = load_dbc_file(temp_file.path()).unwrap();
        assert_eq!(db.stats().num_messages, 2);

        let msg = db.message_by_name("EngineData").unwrap();
        assert_eq!(msg.frame_id, 291);
        assert_eq!(msg.size, 8);
        assert_eq!(msg.sender, Some("ECU1".to_string()));
        assert_eq!(msg.signals.len(), 2);

        let sig = msg.signal("EngineSpeed").unwrap();
        assert_eq!(sig.start_bit, 0);
        assert_eq!(sig.length, 16);
        assert_eq!(sig.scale, 1.0);
        assert_eq!(sig.unit, Some("rpm".to_string()));

        let temp = msg.signal("EngineTemp").unwrap();
        assert_eq!(temp.offset, -40.0);
    }

    #[test]
    fn test_infer_single_group() {
        let signals = vec![
            SignalSpec::plain("VehSpd", 0, 12),
            SignalSpec::plain("VehSpdQf", 12, 2),
            SignalSpec::plain("VehSpd_UB", 14, 1),
            SignalSpec::plain("VehSpdSafeCntr", 16, 4),
            SignalSpec::plain("VehSpdSafeChks", 24, 8),
        ];
        let groups = infer_signal_groups("VehSpdFr", &signals);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.checksum_signal(), Some("VehSpdSafeChks"));
        assert_eq!(group.counter_signal(), Some("VehSpdSafeCntr"));
        // All non-UB signals are members
        assert!(group.signal_names.iter().any(|n| n == "VehSpd"));
        assert!(!group.signal_names.iter().any(|n| n == "VehSpd_UB"));
    }

    #[test]
    fn test_infer_group_without_counter() {
        let signals = vec![
            SignalSpec::plain("SomeSig", 0, 8),
            SignalSpec::plain("SomeSigChks", 8, 8),
        ];
        let groups = infer_signal_groups("Orphan", &signals);
        assert!(groups.is_empty());
    }
}
