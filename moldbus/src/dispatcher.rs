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

//! Message-type-keyed demultiplexer (`get_dispatcher()`): a vector of
//! function values keyed by message type
//! replacing the source's dynamic listener registration).

use std::panic::{self, AssertUnwindSafe};

use crate::header::MessageHeader;
use crate::messages::MessageType;

type Handler = Box<dyn FnMut(&MessageHeader, &[u8])>;

/// Listeners register by message type; `dispatch` invokes every listener
/// registered for the header's `message_type` in registration order. A
/// panicking listener is caught and logged — it must not take down the
/// handler ahead of it or the rest of the pipeline.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Vec<(u8, Handler)>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    pub fn register<F>(&mut self, message_type: MessageType, handler: F)
    where
        F: FnMut(&MessageHeader, &[u8]) + 'static,
    {
        self.handlers.push((message_type as u8, Box::new(handler)));
    }

    pub fn dispatch(&mut self, header: &MessageHeader, body: &[u8]) {
        for (mt, handler) in &mut self.handlers {
            if *mt == header.message_type {
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler(header, body)));
                if result.is_err() {
                    log::error!("dispatcher: handler for message_type {} panicked", mt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dispatches_only_to_matching_message_type() {
        let mut d = Dispatcher::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s1 = seen.clone();
        d.register(MessageType::Heartbeat, move |_h, _b| s1.borrow_mut().push("heartbeat"));
        let s2 = seen.clone();
        d.register(MessageType::AddOrder, move |_h, _b| s2.borrow_mut().push("add_order"));

        let header = MessageHeader {
            application_id: 1,
            application_seq_num: 1,
            timestamp_ns: 0,
            optional_fields_index: 0,
            schema_version: 1,
            message_type: MessageType::AddOrder as u8,
        };
        d.dispatch(&header, &[]);
        assert_eq!(*seen.borrow(), vec!["add_order"]);
    }
}
