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

//! Fixed message header: the wire encoding shared by every event payload.
//!
//! The source's header is platform-endian, an explicit Open Question
//! for cross-platform deployment. `DESIGN.md` resolves it:
//! big-endian, matching the mold frame's own `seq_num`/`message_count`
//! fields, so a payload can be parsed with the same byte order as the
//! frame that carries it.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{BusError, BusResult};

/// Size in bytes of the fixed header prefixing every payload.
pub const HEADER_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub application_id: u16,
    pub application_seq_num: u32,
    pub timestamp_ns: u64,
    pub optional_fields_index: u16,
    pub schema_version: u8,
    pub message_type: u8,
}

impl MessageHeader {
    pub fn encode(&self, out: &mut [u8]) -> BusResult<()> {
        if out.len() < HEADER_LEN {
            return Err(BusError::WireFormat("buffer too small for header".into()));
        }
        let mut cursor = &mut out[..HEADER_LEN];
        cursor.write_u16::<BigEndian>(self.application_id).unwrap();
        cursor.write_u32::<BigEndian>(self.application_seq_num).unwrap();
        cursor.write_u64::<BigEndian>(self.timestamp_ns).unwrap();
        cursor.write_u16::<BigEndian>(self.optional_fields_index).unwrap();
        cursor.write_u8(self.schema_version).unwrap();
        cursor.write_u8(self.message_type).unwrap();
        Ok(())
    }

    pub fn decode(data: &[u8]) -> BusResult<MessageHeader> {
        if data.len() < HEADER_LEN {
            return Err(BusError::WireFormat(format!(
                "payload length {} shorter than header length {}",
                data.len(),
                HEADER_LEN
            )));
        }
        let mut cursor = &data[..HEADER_LEN];
        Ok(MessageHeader {
            application_id: cursor.read_u16::<BigEndian>().unwrap(),
            application_seq_num: cursor.read_u32::<BigEndian>().unwrap(),
            timestamp_ns: cursor.read_u64::<BigEndian>().unwrap(),
            optional_fields_index: cursor.read_u16::<BigEndian>().unwrap(),
            schema_version: cursor.read_u8().unwrap(),
            message_type: cursor.read_u8().unwrap(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = MessageHeader {
            application_id: 7,
            application_seq_num: 42,
            timestamp_ns: 123_456_789,
            optional_fields_index: 0,
            schema_version: 1,
            message_type: 5,
        };
        let mut buf = [0u8; HEADER_LEN];
        h.encode(&mut buf).unwrap();
        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(MessageHeader::decode(&[0u8; 4]).is_err());
    }
}
