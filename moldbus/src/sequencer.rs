/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! C9: Sequencer application.
//!
//! Dual role: the active primary validates and sequences commands from
//! application clients; a passive follower merely mirrors whatever
//! sequence numbers arrive on the event channel so its local caches track
//! the active primary without itself emitting anything. Grounded on the
//! example pack's `Layer-V-orderbook` `Sequencer` (an `AtomicU64` counter
//! gating a command channel), reworked for the single-threaded, non-atomic
//! world this core runs in and for per-application rather than
//! global sequence numbers.

use std::collections::HashMap;

use crate::header::HEADER_LEN;
use crate::messages::MessageType;

/// What the caller should do with one inbound command, per the
/// active-primary algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Too short to contain a header; drop and warn.
    TooShort,
    /// First-ever message from an as-yet-unbound application: accept
    /// unconditionally and let the handler assign a fresh `application_id`.
    AcceptBootstrap,
    /// In-sequence: dispatch and re-emit.
    Accept,
    /// Out of sequence: roll the application's counter back and drop.
    Reject { expected: u32 },
}

/// Tracks `application_id → next_expected_seq_num` and runs the
/// active-primary validation algorithm.
pub struct Sequencer {
    app_table: HashMap<u16, u32>,
    active: bool,
    heartbeat_timer_id: u64,
    self_registered: bool,
}

impl Sequencer {
    pub fn new() -> Sequencer {
        Sequencer {
            app_table: HashMap::new(),
            active: false,
            heartbeat_timer_id: 0,
            self_registered: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_application_sequence_number(&mut self, app_id: u16, n: u32) {
        self.app_table.insert(app_id, n);
    }

    /// `None` maps to the wire contract's `-1` ("no entry yet").
    pub fn get_application_sequence_number(&self, app_id: u16) -> Option<u32> {
        self.app_table.get(&app_id).copied()
    }

    pub fn increment_and_get_application_sequence_number(&mut self, app_id: u16) -> u32 {
        let entry = self.app_table.entry(app_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Runs the validation algorithm against a length-checked, decoded
    /// header for an inbound command. `length` is the full wire length of
    /// the command, used only for the header-length floor check.
    pub fn validate_command(&mut self, length: usize, app_id: u16, message_type: u8, received_seq: u32) -> Verdict {
        if length < HEADER_LEN {
            return Verdict::TooShort;
        }

        if received_seq == 1 && message_type == MessageType::ApplicationDefinition as u8 {
            return Verdict::AcceptBootstrap;
        }

        let expected = self.increment_and_get_application_sequence_number(app_id);
        if received_seq == expected {
            Verdict::Accept
        } else {
            self.set_application_sequence_number(app_id, expected.saturating_sub(1));
            Verdict::Reject { expected }
        }
    }

    /// Passive-follower path: adopt whatever sequence number arrived on
    /// the event channel without running validation.
    pub fn mirror_event(&mut self, app_id: u16, seq_num: u32) {
        self.set_application_sequence_number(app_id, seq_num);
    }

    pub fn activate(&mut self, heartbeat_timer_id: u64) {
        self.active = true;
        self.heartbeat_timer_id = heartbeat_timer_id;
    }

    pub fn deactivate(&mut self) -> u64 {
        self.active = false;
        std::mem::take(&mut self.heartbeat_timer_id)
    }

    pub fn heartbeat_timer_id(&self) -> u64 {
        self.heartbeat_timer_id
    }

    /// Whether the sequencer has issued its own `ApplicationDefinition`
    /// yet (it self-registers as `application_id = 0` on first heartbeat,
    /// on first heartbeat).
    pub fn needs_self_registration(&self) -> bool {
        !self.self_registered
    }

    pub fn mark_self_registered(&mut self) {
        self.self_registered = true;
    }
}

impl Default for Sequencer {
    fn default() -> Sequencer {
        Sequencer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `APP01` assigned id=2. Commands
    /// `(app=2,seq=2)`, `(app=2,seq=3)`, `(app=2,seq=2)` — two accepted,
    /// the third dropped with `application_sequence_number(2) == 3`.
    #[test]
    fn sequence_validation_scenario() {
        let mut seq = Sequencer::new();
        seq.set_application_sequence_number(2, 1);

        let v1 = seq.validate_command(HEADER_LEN, 2, MessageType::AddOrder as u8, 2);
        assert_eq!(v1, Verdict::Accept);

        let v2 = seq.validate_command(HEADER_LEN, 2, MessageType::AddOrder as u8, 3);
        assert_eq!(v2, Verdict::Accept);

        let v3 = seq.validate_command(HEADER_LEN, 2, MessageType::AddOrder as u8, 2);
        assert_eq!(v3, Verdict::Reject { expected: 4 });
        assert_eq!(seq.get_application_sequence_number(2), Some(3));
    }

    #[test]
    fn too_short_command_is_dropped() {
        let mut seq = Sequencer::new();
        let v = seq.validate_command(4, 1, MessageType::Heartbeat as u8, 1);
        assert_eq!(v, Verdict::TooShort);
    }

    #[test]
    fn first_application_definition_is_bootstrap_accepted() {
        let mut seq = Sequencer::new();
        let v = seq.validate_command(HEADER_LEN, 0, MessageType::ApplicationDefinition as u8, 1);
        assert_eq!(v, Verdict::AcceptBootstrap);
    }
}
