//! E2E protection pass
//!
//! Walks a completed signal set, finds checksum signals, advances the
//! owning group's rolling counter and fills in the checksum computed by the
//! [`crate::e2e`] engine. All failure modes here are soft: an unresolvable
//! group, a missing counter signal, or a checksum signal without a data
//! identifier is logged and skipped, leaving the prior value in place.

use crate::codec;
use crate::db::MessageSpec;
use crate::e2e;
use crate::types::{SignalSet, SignalValue};
use std::collections::HashMap;

/// Length of a precomputed periodic frame rotation: one frame per counter
/// value, counters cycling 0..=14
pub const FRAME_ROTATION: usize = 15;

/// Rolling-counter state for every protected signal group.
///
/// Owned by one controller instance and scoped to its lifetime; the
/// controller serializes access (single-writer discipline per message).
#[derive(Debug, Default)]
pub struct CounterState {
    /// Group key -> last transmitted counter value
    counters: HashMap<String, u8>,
}

impl CounterState {
    /// Create fresh counter state (cold start for every group)
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the counter for a group and return the value to transmit.
    ///
    /// The first advance of a group in this state's lifetime yields 0; every
    /// later advance yields the previous value plus one, wrapping modulo 15.
    pub fn advance(&mut self, group_key: &str) -> u8 {
        let next = match self.counters.get(group_key) {
            None => 0,
            Some(&previous) => e2e::next_counter(previous),
        };
        self.counters.insert(group_key.to_string(), next);
        next
    }

    /// Last transmitted counter for a group, if it ever transmitted
    pub fn current(&self, group_key: &str) -> Option<u8> {
        self.counters.get(group_key).copied()
    }

    /// Forget a group's counter so its next advance is a cold start
    pub fn reset(&mut self, group_key: &str) {
        self.counters.remove(group_key);
    }
}

/// Reset every counter belonging to a message's signal groups.
///
/// Starting a periodic transmission precomputes a full rotation; the
/// rotation always begins at counter 0, so the groups cold-start here.
pub fn reset_counters(message: &MessageSpec, counters: &mut CounterState) {
    for group in &message.signal_groups {
        counters.reset(&format!("{}/{}", message.name, group.name));
    }
}

/// Apply E2E protection to a completed signal set.
///
/// For every checksum signal in the set: resolve its signal group, advance
/// the group counter, convert the member data signals back to raw form, and
/// write the computed checksum into the set. The counter signal is
/// overwritten with the state-owned value; any request-supplied counter is
/// ignored.
pub fn apply_protection(message: &MessageSpec, signals: &mut SignalSet, counters: &mut CounterState) {
    let checksum_names: Vec<String> = signals
        .keys()
        .filter(|name| name.ends_with("Chks"))
        .cloned()
        .collect();

    for chks_name in checksum_names {
        let group = match message.signal_group_of(&chks_name) {
            Some(group) => group,
            None => {
                log::error!(
                    "Signal '{}' has no signal group in message '{}'",
                    chks_name,
                    message.name
                );
                continue;
            }
        };

        let cntr_name = format!("{}Cntr", chks_name.trim_end_matches("Chks"));
        if !signals.contains_key(&cntr_name) {
            log::error!(
                "Signal set for '{}' has no counter signal '{}', please check and try again",
                message.name,
                cntr_name
            );
            continue;
        }

        let data_id = match message.signal(&chks_name).and_then(|s| s.data_id) {
            Some(data_id) => data_id,
            None => {
                log::warn!(
                    "The signal '{}' does not contain a data id for E2E, \
                     the value of this signal remains unchanged here",
                    chks_name
                );
                continue;
            }
        };

        let group_key = format!("{}/{}", message.name, group.name);
        let counter = counters.advance(&group_key);
        signals.insert(cntr_name.clone(), SignalValue::Num(counter as f64));

        // Data signals feed the checksum in sorted-name order, checksum and
        // counter members excluded.
        let mut member_names: Vec<&String> = group.signal_names.iter().collect();
        member_names.sort();

        let mut value_lengths: Vec<(u64, u16)> = Vec::new();
        for member in member_names {
            if member.ends_with("Chks") || member.ends_with("Cntr") {
                continue;
            }
            let spec = match message.signal(member) {
                Some(spec) => spec,
                None => {
                    log::error!(
                        "Group '{}' names signal '{}' which message '{}' does not declare",
                        group.name,
                        member,
                        message.name
                    );
                    continue;
                }
            };
            let raw = match signals.get(member) {
                Some(value) => match codec::raw_from_value(spec, value) {
                    Ok(raw) => raw,
                    Err(e) => {
                        log::error!("Can't convert '{}' to raw form: {}", member, e);
                        continue;
                    }
                },
                None => spec.initial.unwrap_or(0.0) as i64,
            };
            value_lengths.push((raw as u64, spec.length));
        }

        let checksum = e2e::e2e_checksum(data_id, counter, &value_lengths);
        signals.insert(chks_name, SignalValue::Num(checksum as f64));
    }
}
