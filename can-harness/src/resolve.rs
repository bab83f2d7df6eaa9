//! Signal grouping and default resolution
//!
//! First stage of the encoding pipeline: partition a flat signal-name ->
//! value request into per-message buckets, then complete each bucket with
//! update-bit markers and synthesized defaults so the message can be encoded
//! without the caller naming every signal in the frame.

use crate::db::{Database, MessageSpec};
use crate::types::{SignalSet, SignalValue};
use std::collections::BTreeMap;

/// Partition a signal request into per-message buckets.
///
/// Each signal is resolved to its owning message via the database; signals
/// that resolve nowhere are logged and dropped (non-fatal). Signals from one
/// request that resolve to different messages are split into separate
/// buckets — this split, not the caller's grouping, determines how many
/// frames get built.
pub fn group_by_message(db: &Database, request: &SignalSet) -> BTreeMap<String, SignalSet> {
    let mut buckets: BTreeMap<String, SignalSet> = BTreeMap::new();

    for (name, value) in request {
        match db.message_by_signal(name) {
            Ok(message) => {
                buckets
                    .entry(message.name.clone())
                    .or_default()
                    .insert(name.clone(), value.clone());
            }
            Err(_) => {
                log::error!(
                    "Can't find the message of signal '{}' in database {}",
                    name,
                    db.source()
                );
            }
        }
    }

    for (message, signals) in &buckets {
        log::info!("Send message: {}, signals: {:?}", message, signals);
    }

    buckets
}

/// Complete a partial signal set so the message can be encoded.
///
/// For every signal the message declares that the caller did not supply:
/// update-bit signals are set active (1), all others get a default physical
/// value synthesized from the signal's initial raw value via scale/offset
/// (or 0 with no initial value). Caller-supplied numeric values are raw
/// units and are converted to physical here, once; symbolic values pass
/// through for the encode step to map.
pub fn complete_signal_set(message: &MessageSpec, supplied: &SignalSet) -> SignalSet {
    let mut completed = SignalSet::new();

    for signal in &message.signals {
        let value = match supplied.get(&signal.name) {
            Some(SignalValue::Num(raw)) => {
                SignalValue::Num(raw * signal.scale + signal.offset)
            }
            Some(sym @ SignalValue::Sym(_)) => sym.clone(),
            None if signal.is_update_bit() => SignalValue::Num(1.0),
            None => {
                let default = signal
                    .initial
                    .map(|initial| signal.scale * initial + signal.offset)
                    .unwrap_or(0.0);
                SignalValue::Num(default)
            }
        };
        completed.insert(signal.name.clone(), value);
    }

    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MessageSpec, SendType, SignalSpec};

    fn two_message_db() -> Database {
        let mut db = Database::new();
        db.add_message(MessageSpec {
            frame_id: 0x100,
            name: "MsgA".to_string(),
            size: 8,
            cycle_time_ms: Some(20),
            send_type: SendType::Cyclic,
            is_fd: false,
            is_extended: false,
            signals: vec![
                SignalSpec::plain("SigA1", 0, 8),
                SignalSpec::plain("SigA2", 8, 8),
            ],
            signal_groups: vec![],
            sender: None,
        });
        db.add_message(MessageSpec {
            frame_id: 0x200,
            name: "MsgB".to_string(),
            size: 8,
            cycle_time_ms: None,
            send_type: SendType::Event,
            is_fd: false,
            is_extended: false,
            signals: vec![SignalSpec::plain("SigB1", 0, 16)],
            signal_groups: vec![],
            sender: None,
        });
        db
    }

    #[test]
    fn test_grouping_splits_per_message() {
        let db = two_message_db();
        let mut request = SignalSet::new();
        request.insert("SigA1".to_string(), SignalValue::Num(1.0));
        request.insert("SigB1".to_string(), SignalValue::Num(2.0));
        request.insert("SigA2".to_string(), SignalValue::Num(3.0));

        let buckets = group_by_message(&db, &request);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets["MsgA"].len(), 2);
        assert_eq!(buckets["MsgB"].len(), 1);

        // Every signal appears in exactly one bucket
        let total: usize = buckets.values().map(|b| b.len()).sum();
        assert_eq!(total, request.len());
    }

    #[test]
    fn test_grouping_drops_unknown_signals() {
        let db = two_message_db();
        let mut request = SignalSet::new();
        request.insert("SigA1".to_string(), SignalValue::Num(1.0));
        request.insert("NoSuchSignal".to_string(), SignalValue::Num(9.0));

        let buckets = group_by_message(&db, &request);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets["MsgA"].len(), 1);
    }

    fn resolver_message() -> MessageSpec {
        let mut scaled = SignalSpec::plain("Scaled", 0, 8);
        scaled.scale = 0.5;
        scaled.offset = -10.0;
        let mut with_initial = SignalSpec::plain("WithInitial", 8, 8);
        with_initial.scale = 2.0;
        with_initial.initial = Some(5.0);
        MessageSpec {
            frame_id: 0x300,
            name: "MsgC".to_string(),
            size: 8,
            cycle_time_ms: None,
            send_type: SendType::Event,
            is_fd: false,
            is_extended: false,
            signals: vec![
                scaled,
                with_initial,
                SignalSpec::plain("NoInitial", 16, 8),
                SignalSpec::plain("Scaled_UB", 24, 1),
            ],
            signal_groups: vec![],
            sender: None,
        }
    }

    #[test]
    fn test_defaults_and_update_bits() {
        let message = resolver_message();
        let mut supplied = SignalSet::new();
        supplied.insert("Scaled".to_string(), SignalValue::Num(30.0)); // raw units

        let completed = complete_signal_set(&message, &supplied);
        assert_eq!(completed.len(), 4);
        // Caller's raw 30 becomes physical 30*0.5 - 10 = 5
        assert_eq!(completed["Scaled"], SignalValue::Num(5.0));
        // Default from initial raw value: 2.0 * 5 + 0 = 10
        assert_eq!(completed["WithInitial"], SignalValue::Num(10.0));
        // No initial value -> 0
        assert_eq!(completed["NoInitial"], SignalValue::Num(0.0));
        // Update bit defaults active
        assert_eq!(completed["Scaled_UB"], SignalValue::Num(1.0));
    }

    #[test]
    fn test_symbolic_value_passes_through() {
        let message = resolver_message();
        let mut supplied = SignalSet::new();
        supplied.insert("NoInitial".to_string(), SignalValue::Sym("On".to_string()));

        let completed = complete_signal_set(&message, &supplied);
        assert_eq!(completed["NoInitial"], SignalValue::Sym("On".to_string()));
    }
}
