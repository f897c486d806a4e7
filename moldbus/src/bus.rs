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

//! C8: Bus server/client façade.
//!
//! `Bus` is the contract surface applications are built against: acquire a
//! scratch buffer, commit it (assigning the next sequence number and
//! persisting durably), and have it published to every transport and
//! in-process listener. It owns the pieces C4–C6 provide and wires them
//! together the way `service.rs`'s `Service` trait wires a `Context` to a
//! dispatch table, minus the NetBricks/DPDK coupling.

use moldbus_core::clock::unix_nanos;
use moldbus_core::buf::WriteBuf;

use crate::dispatcher::Dispatcher;
use crate::error::{BusError, BusResult};
use crate::header::{MessageHeader, HEADER_LEN};
use crate::mold::MoldPublisher;
use crate::session::MoldSession;
use crate::store::MessageStore;

type CommandListener = Box<dyn FnMut(&[u8])>;
type EventListener = Box<dyn FnMut(u64, &[u8])>;
type SessionListener = Box<dyn FnMut(&str)>;

/// Server-side façade: owns the message store, session, and publisher,
/// and is the only writer to any of them.
pub struct Bus {
    store: MessageStore,
    session: MoldSession,
    publisher: MoldPublisher,
    dispatcher: Dispatcher,
    command_listener: Option<CommandListener>,
    event_listeners: Vec<EventListener>,
    open_session_listeners: Vec<SessionListener>,
    close_session_listeners: Vec<Box<dyn FnMut()>>,
    active: bool,
}

impl Bus {
    pub fn new(store: MessageStore, session: MoldSession, publisher: MoldPublisher) -> Bus {
        Bus {
            store,
            session,
            publisher,
            dispatcher: Dispatcher::new(),
            command_listener: None,
            event_listeners: Vec::new(),
            open_session_listeners: Vec::new(),
            close_session_listeners: Vec::new(),
            active: false,
        }
    }

    pub fn store(&mut self) -> &mut MessageStore {
        &mut self.store
    }

    pub fn session(&mut self) -> &mut MoldSession {
        &mut self.session
    }

    pub fn dispatcher(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Forwards to the publisher's `on_commit` hook, fired once per commit
    /// with the fully wire-encoded event frame (`[session][seq_num]
    /// [message_count]{[len][payload]}×`) — the live-fanout path for TCP
    /// rewind clients that are already caught up.
    pub fn set_on_commit<F>(&mut self, f: F)
    where
        F: FnMut(&str, u64, &[u8]) + 'static,
    {
        self.publisher.set_on_commit(f);
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// True iff this server owns the command channel.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_command_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.command_listener = Some(Box::new(listener));
    }

    pub fn add_event_listener<F>(&mut self, listener: F)
    where
        F: FnMut(u64, &[u8]) + 'static,
    {
        self.event_listeners.push(Box::new(listener));
    }

    pub fn add_open_session_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&str) + 'static,
    {
        self.open_session_listeners.push(Box::new(listener));
    }

    pub fn add_close_session_listener<F>(&mut self, listener: F)
    where
        F: FnMut() + 'static,
    {
        self.close_session_listeners.push(Box::new(listener));
    }

    /// Feeds a raw command to the registered command listener, if any
    /// (the Sequencer application installs itself here when active).
    pub fn dispatch_command(&mut self, data: &[u8]) {
        if let Some(listener) = self.command_listener.as_mut() {
            listener(data);
        }
    }

    pub fn create_session(&mut self, suffix: &str) -> BusResult<()> {
        self.session.create(suffix)?;
        self.store.open(self.session.session_name().unwrap(), None)?;
        let name = self.session.session_name().unwrap().to_string();
        for listener in &mut self.open_session_listeners {
            listener(&name);
        }
        Ok(())
    }

    pub fn close_session(&mut self) {
        self.store.close();
        for listener in &mut self.close_session_listeners {
            listener();
        }
    }

    /// Hands out the store's scratch buffer (`acquire()`).
    pub fn acquire(&mut self) -> &mut WriteBuf {
        self.store.acquire()
    }

    /// Commits whatever was written into the acquired buffer, assigns
    /// sequence numbers, persists, and publishes. Returns the first
    /// assigned sequence number.
    pub fn commit(&mut self, lengths: &[u16]) -> BusResult<u64> {
        self.commit_with_timestamp(lengths, unix_nanos())
    }

    pub fn commit_with_timestamp(&mut self, lengths: &[u16], _timestamp_ns: u64) -> BusResult<u64> {
        let first_seq = self.store.num_messages() + 1;
        self.store.commit(lengths)?;
        self.session.advance_seq_num(lengths.len() as u64);
        self.send(first_seq, lengths.len() as u64)?;
        Ok(first_seq)
    }

    /// Convenience wrapper: encodes `header` and `body` into the acquired
    /// buffer and commits them as a single-message burst.
    pub fn emit_message(&mut self, header: &MessageHeader, body: &[u8]) -> BusResult<u64> {
        let total_len = HEADER_LEN + body.len();
        if total_len > moldbus_core::MAX_MESSAGE_SIZE {
            return Err(BusError::WireFormat("message exceeds MAX_MESSAGE_SIZE".into()));
        }
        {
            let buf = self.acquire();
            header.encode(buf.as_mut_slice())?;
            buf.as_mut_slice()[HEADER_LEN..total_len].copy_from_slice(body);
        }
        self.commit(&[total_len as u16])
    }

    fn send(&mut self, first_seq: u64, count: u64) -> BusResult<()> {
        let session_name = self
            .session
            .session_name()
            .ok_or_else(|| BusError::IllegalState("cannot send before session is created".into()))?
            .to_string();

        let mut payloads = Vec::with_capacity(count as usize);
        for i in 0..count {
            payloads.push(self.store.read(first_seq + i)?);
        }
        let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        self.publisher.publish(&session_name, first_seq, &refs)?;

        for (i, payload) in refs.iter().enumerate() {
            let seq = first_seq + i as u64;
            for listener in &mut self.event_listeners {
                listener(seq, payload);
            }
            if let Ok(header) = MessageHeader::decode(payload) {
                self.dispatcher.dispatch(&header, &payload[HEADER_LEN..]);
            }
        }
        Ok(())
    }
}

/// Per-application outbound publisher with its own monotonic
/// `application_seq_num` (`get_provider`). Builds headers;
/// callers pass the result to [`Bus::emit_message`].
pub struct Provider {
    pub application_id: u16,
    next_app_seq: u32,
}

impl Provider {
    pub fn new(application_id: u16) -> Provider {
        Provider {
            application_id,
            next_app_seq: 0,
        }
    }

    pub fn next_header(&mut self, message_type: u8) -> MessageHeader {
        self.next_app_seq += 1;
        MessageHeader {
            application_id: self.application_id,
            application_seq_num: self.next_app_seq,
            timestamp_ns: unix_nanos(),
            optional_fields_index: 0,
            schema_version: 1,
            message_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageType;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn new_test_bus() -> Bus {
        let mut bus = Bus::new(MessageStore::in_memory(), MoldSession::new(), MoldPublisher::new(None, Vec::new()));
        bus.create_session("AA").unwrap();
        bus
    }

    #[test]
    fn commit_assigns_sequence_and_notifies_event_listeners() {
        let mut bus = new_test_bus();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.add_event_listener(move |seq, payload| seen_clone.borrow_mut().push((seq, payload.to_vec())));

        let mut provider = Provider::new(1);
        let header = provider.next_header(MessageType::Heartbeat as u8);
        let seq = bus.emit_message(&header, &[]).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].0, 1);
    }

    #[test]
    fn store_read_matches_committed_payload() {
        let mut bus = new_test_bus();
        let mut provider = Provider::new(7);
        let header = provider.next_header(MessageType::Heartbeat as u8);
        bus.emit_message(&header, b"hi").unwrap();

        let payload = bus.store().read(1).unwrap();
        let decoded = MessageHeader::decode(payload.as_slice()).unwrap();
        assert_eq!(decoded.application_id, 7);
        assert_eq!(&payload.as_slice()[HEADER_LEN..], b"hi");
    }
}
