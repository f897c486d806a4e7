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

//! C5: Mold session identity and sequence-number authority.

use moldbus_core::clock::unix_nanos;

use crate::error::{BusError, BusResult};

/// Length of a session name: `YYYYMMDD` plus a two-character suffix.
pub const SESSION_NAME_LEN: usize = 10;

/// Owns the session identity and the next sequence number to assign.
/// `create` is the publisher path (this process mints the session);
/// `set_session_name` is the subscriber path (the session is learned from
/// the wire). Calling either after the session is already named is an
/// `IllegalState` error — a session, once named, never changes names.
pub struct MoldSession {
    session_name: Option<String>,
    next_seq_num: u64,
}

impl MoldSession {
    pub fn new() -> MoldSession {
        MoldSession {
            session_name: None,
            next_seq_num: 1,
        }
    }

    /// Mints `session_name = strftime("%Y%m%d") + suffix` from the current
    /// date and marks the owning activator ready. `suffix` must be exactly
    /// two ASCII characters.
    pub fn create(&mut self, suffix: &str) -> BusResult<()> {
        if self.session_name.is_some() {
            return Err(BusError::IllegalState(
                "session already created; cannot create twice".into(),
            ));
        }
        if suffix.len() != 2 || !suffix.is_ascii() {
            return Err(BusError::IllegalState(format!(
                "session suffix must be exactly two ASCII characters, got {suffix:?}"
            )));
        }
        let date = ymd_from_unix_nanos(unix_nanos());
        self.session_name = Some(format!("{date}{suffix}"));
        Ok(())
    }

    /// Learns the session name from the wire (subscriber path).
    pub fn set_session_name(&mut self, name: &str) -> BusResult<()> {
        if self.session_name.is_some() {
            return Err(BusError::IllegalState(
                "session already named; cannot set_session_name again".into(),
            ));
        }
        if name.len() != SESSION_NAME_LEN {
            return Err(BusError::WireFormat(format!(
                "session name must be {SESSION_NAME_LEN} bytes, got {}",
                name.len()
            )));
        }
        self.session_name = Some(name.to_string());
        Ok(())
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.session_name.is_some()
    }

    pub fn next_seq_num(&self) -> u64 {
        self.next_seq_num
    }

    /// Reserves and returns the next sequence number, advancing the
    /// counter.
    pub fn take_next_seq_num(&mut self) -> u64 {
        let n = self.next_seq_num;
        self.next_seq_num += 1;
        n
    }

    /// Advances the counter by `count` without returning individual
    /// numbers, for atomically-committed bursts (commit groups).
    pub fn advance_seq_num(&mut self, count: u64) {
        self.next_seq_num += count;
    }
}

impl Default for MoldSession {
    fn default() -> MoldSession {
        MoldSession::new()
    }
}

/// Formats a Unix-epoch nanosecond timestamp as `YYYYMMDD`, UTC, without
/// pulling in a full calendar crate — nothing else in this dependency set
/// carries one, and this is the only place the bus needs calendar arithmetic.
fn ymd_from_unix_nanos(nanos: u64) -> String {
    let days_since_epoch = nanos / (86_400 * 1_000_000_000);
    let (y, m, d) = civil_from_days(days_since_epoch as i64);
    format!("{y:04}{m:02}{d:02}")
}

/// Howard Hinnant's `civil_from_days` algorithm: converts a day count since
/// the Unix epoch into a proleptic-Gregorian `(year, month, day)` triple.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_create_again_is_illegal_state() {
        let mut s = MoldSession::new();
        s.create("AA").unwrap();
        assert!(matches!(s.create("BB"), Err(BusError::IllegalState(_))));
    }

    #[test]
    fn set_session_name_after_create_is_illegal_state() {
        let mut s = MoldSession::new();
        s.create("AA").unwrap();
        assert!(matches!(
            s.set_session_name("2026072801"),
            Err(BusError::IllegalState(_))
        ));
    }

    #[test]
    fn created_session_name_has_expected_shape() {
        let mut s = MoldSession::new();
        s.create("AA").unwrap();
        let name = s.session_name().unwrap();
        assert_eq!(name.len(), SESSION_NAME_LEN);
        assert!(name.ends_with("AA"));
    }

    #[test]
    fn civil_from_days_matches_known_date() {
        // 2026-07-28 per the epoch-day conversion used by this module.
        let epoch_day = 20662;
        assert_eq!(civil_from_days(epoch_day), (2026, 7, 28));
    }

    #[test]
    fn take_next_seq_num_increments_from_one() {
        let mut s = MoldSession::new();
        assert_eq!(s.take_next_seq_num(), 1);
        assert_eq!(s.take_next_seq_num(), 2);
        assert_eq!(s.next_seq_num(), 3);
    }
}
