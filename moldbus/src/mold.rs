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

//! C6: UDP event publisher/subscriber and wire frame codec.
//!
//! Wire frame: `[session(10)][seq_num_u64][message_count_u16]{[len_u16]
//! [payload]}×`. `message_count == HEARTBEAT_MESSAGE_COUNT` (`0xFFFE`) marks
//! a heartbeat frame carrying `[session(10)][next_seq_num_u64]` instead of
//! messages.
//!
//! Grounded on the example pack's `Layer-V-orderbook` sequencer (monotonic
//! counter + synchronous in-order listener dispatch) for the publish path,
//! translated out of its async/mpsc shape into the callback form this core
//! uses throughout; there is no teacher analog for UDP multicast framing in
//! `mazharn-splinter` (its wire work is all DPDK mbufs), so the frame codec
//! itself is built directly from the wire framing described below.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mio::net::UdpSocket;

use crate::error::{BusError, BusResult};
use crate::session::SESSION_NAME_LEN;

pub const HEARTBEAT_MESSAGE_COUNT: u16 = 0xFFFE;
const FRAME_PREFIX_LEN: usize = SESSION_NAME_LEN + 8 + 2;

/// A decoded event frame: either a burst of sequenced messages or a
/// heartbeat.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub session: String,
    pub seq_num: u64,
    pub messages: Vec<Vec<u8>>,
    pub is_heartbeat: bool,
    /// Only meaningful when `is_heartbeat`: the publisher's current
    /// `next_seq_num`, letting a newly-connected peer learn how far behind
    /// it is.
    pub heartbeat_next_seq_num: u64,
}

/// Encodes a burst of already-assigned-sequence-number messages into one
/// wire frame.
pub fn encode_event_frame(session: &str, seq_num: u64, messages: &[&[u8]]) -> BusResult<Vec<u8>> {
    if session.len() != SESSION_NAME_LEN {
        return Err(BusError::WireFormat("session name must be 10 bytes".into()));
    }
    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + messages.iter().map(|m| m.len() + 2).sum::<usize>());
    out.extend_from_slice(session.as_bytes());
    out.write_u64::<BigEndian>(seq_num).unwrap();
    out.write_u16::<BigEndian>(messages.len() as u16).unwrap();
    for m in messages {
        if m.len() > u16::MAX as usize {
            return Err(BusError::WireFormat("message exceeds u16 length prefix".into()));
        }
        out.write_u16::<BigEndian>(m.len() as u16).unwrap();
        out.extend_from_slice(m);
    }
    Ok(out)
}

/// Encodes a heartbeat frame: `[session(10)][seq=0xFFFE marker][next_seq_num]`.
pub fn encode_heartbeat_frame(session: &str, next_seq_num: u64) -> BusResult<Vec<u8>> {
    if session.len() != SESSION_NAME_LEN {
        return Err(BusError::WireFormat("session name must be 10 bytes".into()));
    }
    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + 8);
    out.extend_from_slice(session.as_bytes());
    out.write_u64::<BigEndian>(0).unwrap();
    out.write_u16::<BigEndian>(HEARTBEAT_MESSAGE_COUNT).unwrap();
    out.write_u64::<BigEndian>(next_seq_num).unwrap();
    Ok(out)
}

pub fn decode_frame(data: &[u8]) -> BusResult<DecodedFrame> {
    if data.len() < FRAME_PREFIX_LEN {
        return Err(BusError::WireFormat("frame shorter than fixed prefix".into()));
    }
    let session = String::from_utf8(data[0..SESSION_NAME_LEN].to_vec())
        .map_err(|e| BusError::WireFormat(e.to_string()))?;
    let mut cursor = &data[SESSION_NAME_LEN..];
    let seq_num = cursor.read_u64::<BigEndian>().unwrap();
    let message_count = cursor.read_u16::<BigEndian>().unwrap();

    if message_count == HEARTBEAT_MESSAGE_COUNT {
        let next_seq_num = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| BusError::WireFormat("truncated heartbeat frame".into()))?;
        return Ok(DecodedFrame {
            session,
            seq_num,
            messages: Vec::new(),
            is_heartbeat: true,
            heartbeat_next_seq_num: next_seq_num,
        });
    }

    let mut messages = Vec::with_capacity(message_count as usize);
    for _ in 0..message_count {
        let len = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| BusError::WireFormat("truncated message length prefix".into()))?
            as usize;
        if cursor.len() < len {
            return Err(BusError::WireFormat("truncated message payload".into()));
        }
        let (payload, rest) = cursor.split_at(len);
        messages.push(payload.to_vec());
        cursor = rest;
    }

    Ok(DecodedFrame {
        session,
        seq_num,
        messages,
        is_heartbeat: false,
        heartbeat_next_seq_num: 0,
    })
}

/// Publishes committed bursts to a UDP multicast-style peer list and, via
/// `on_commit`, to any other observer (the TCP rewinder's live fanout —
/// fans out to connected TCP rewind clients that are fully caught up).
/// Kept decoupled from [`crate::rewind::Rewinder`] the same
/// way `Bus`'s `add_event_listener` decouples the sequencer from its
/// consumers.
pub struct MoldPublisher {
    socket: Option<UdpSocket>,
    peers: Vec<SocketAddr>,
    on_commit: Option<Box<dyn FnMut(&str, u64, &[u8])>>,
}

impl MoldPublisher {
    pub fn new(socket: Option<UdpSocket>, peers: Vec<SocketAddr>) -> MoldPublisher {
        MoldPublisher {
            socket,
            peers,
            on_commit: None,
        }
    }

    pub fn set_on_commit<F>(&mut self, f: F)
    where
        F: FnMut(&str, u64, &[u8]) + 'static,
    {
        self.on_commit = Some(Box::new(f));
    }

    /// Builds and broadcasts the wire frame for a just-committed burst
    /// (already durable in the message store), then notifies `on_commit`
    /// with the encoded bytes.
    pub fn publish(&mut self, session: &str, first_seq: u64, messages: &[&[u8]]) -> BusResult<()> {
        let frame = encode_event_frame(session, first_seq, messages)?;
        self.broadcast(&frame)?;
        if let Some(cb) = self.on_commit.as_mut() {
            cb(session, first_seq, &frame);
        }
        Ok(())
    }

    pub fn publish_heartbeat(&mut self, session: &str, next_seq_num: u64) -> BusResult<()> {
        let frame = encode_heartbeat_frame(session, next_seq_num)?;
        self.broadcast(&frame)
    }

    fn broadcast(&mut self, frame: &[u8]) -> BusResult<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };
        for peer in &self.peers {
            if let Err(e) = socket.send_to(frame, *peer) {
                log::warn!("mold publisher: send to {peer} failed: {e}");
            }
        }
        Ok(())
    }
}

/// Consumes an event stream, detecting gaps and buffering out-of-order
/// frames until the gap closes.
pub struct MoldSubscriber {
    expected_seq: u64,
    session_name: Option<String>,
    pending: BTreeMap<u64, DecodedFrame>,
}

/// What the subscriber learned from the most recent packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapStatus {
    /// No gap; any in-order frames (including previously-buffered ones
    /// unblocked by this arrival) were dispatched.
    InOrder,
    /// `received` is ahead of `expected`; the frame was buffered and the
    /// caller should request a rewind starting at `expected`.
    Gap { expected: u64, received: u64 },
    /// A stale/duplicate frame below `expected_seq`; ignored.
    Stale,
    Heartbeat,
}

impl MoldSubscriber {
    pub fn new() -> MoldSubscriber {
        MoldSubscriber {
            expected_seq: 1,
            session_name: None,
            pending: BTreeMap::new(),
        }
    }

    pub fn expected_seq(&self) -> u64 {
        self.expected_seq
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    /// Handles one inbound packet, calling `dispatch(seq_num, payload)` for
    /// every message that becomes deliverable in order as a result,
    /// including ones unblocked from the pending buffer.
    pub fn handle_packet<F>(&mut self, data: &[u8], mut dispatch: F) -> BusResult<GapStatus>
    where
        F: FnMut(u64, &[u8]),
    {
        let frame = decode_frame(data)?;
        if self.session_name.is_none() {
            self.session_name = Some(frame.session.clone());
        }

        if frame.is_heartbeat {
            return Ok(GapStatus::Heartbeat);
        }

        if frame.seq_num < self.expected_seq {
            return Ok(GapStatus::Stale);
        }

        if frame.seq_num > self.expected_seq {
            let gap = GapStatus::Gap {
                expected: self.expected_seq,
                received: frame.seq_num,
            };
            self.pending.insert(frame.seq_num, frame);
            return Ok(gap);
        }

        self.dispatch_frame(&frame, &mut dispatch);
        self.drain_pending(&mut dispatch);
        Ok(GapStatus::InOrder)
    }

    /// Feeds a rewound payload (already known to be in order) directly into
    /// the dispatcher, advancing `expected_seq` by one. Used by the TCP
    /// rewind client path once a gap has started closing.
    pub fn accept_rewound_payload<F>(&mut self, seq_num: u64, payload: &[u8], mut dispatch: F)
    where
        F: FnMut(u64, &[u8]),
    {
        if seq_num != self.expected_seq {
            return;
        }
        dispatch(seq_num, payload);
        self.expected_seq += 1;
        self.drain_pending(&mut dispatch);
    }

    fn dispatch_frame<F>(&mut self, frame: &DecodedFrame, dispatch: &mut F)
    where
        F: FnMut(u64, &[u8]),
    {
        let mut seq = frame.seq_num;
        for message in &frame.messages {
            dispatch(seq, message);
            seq += 1;
        }
        self.expected_seq = seq;
    }

    fn drain_pending<F>(&mut self, dispatch: &mut F)
    where
        F: FnMut(u64, &[u8]),
    {
        while let Some(frame) = self.pending.remove(&self.expected_seq) {
            self.dispatch_frame(&frame, dispatch);
        }
    }
}

impl Default for MoldSubscriber {
    fn default() -> MoldSubscriber {
        MoldSubscriber::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = encode_event_frame("20260728AA", 1, &[b"abc", b"de"]).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.session, "20260728AA");
        assert_eq!(decoded.seq_num, 1);
        assert_eq!(decoded.messages, vec![b"abc".to_vec(), b"de".to_vec()]);
        assert!(!decoded.is_heartbeat);
    }

    #[test]
    fn heartbeat_frame_round_trips() {
        let frame = encode_heartbeat_frame("20260728AA", 42).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert!(decoded.is_heartbeat);
        assert_eq!(decoded.heartbeat_next_seq_num, 42);
    }

    #[test]
    fn in_order_packets_dispatch_immediately() {
        let mut sub = MoldSubscriber::new();
        let mut seen = Vec::new();
        let frame = encode_event_frame("20260728AA", 1, &[b"a", b"b"]).unwrap();
        let status = sub.handle_packet(&frame, |seq, payload| seen.push((seq, payload.to_vec()))).unwrap();
        assert_eq!(status, GapStatus::InOrder);
        assert_eq!(seen, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
        assert_eq!(sub.expected_seq(), 3);
    }

    #[test]
    fn gap_buffers_and_drains_on_close() {
        let mut sub = MoldSubscriber::new();
        let mut seen = Vec::new();

        let later = encode_event_frame("20260728AA", 3, &[b"c"]).unwrap();
        let status = sub.handle_packet(&later, |seq, p| seen.push((seq, p.to_vec()))).unwrap();
        assert_eq!(status, GapStatus::Gap { expected: 1, received: 3 });
        assert!(seen.is_empty());

        let first = encode_event_frame("20260728AA", 1, &[b"a", b"b"]).unwrap();
        let status = sub.handle_packet(&first, |seq, p| seen.push((seq, p.to_vec()))).unwrap();
        assert_eq!(status, GapStatus::InOrder);
        assert_eq!(seen, vec![(1, b"a".to_vec()), (2, b"b".to_vec()), (3, b"c".to_vec())]);
        assert_eq!(sub.expected_seq(), 4);
    }

    #[test]
    fn stale_duplicate_is_ignored() {
        let mut sub = MoldSubscriber::new();
        let first = encode_event_frame("20260728AA", 1, &[b"a"]).unwrap();
        sub.handle_packet(&first, |_, _| {}).unwrap();

        let status = sub.handle_packet(&first, |_, _| panic!("must not redispatch")).unwrap();
        assert_eq!(status, GapStatus::Stale);
    }
}
