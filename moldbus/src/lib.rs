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

//! MoldBus: a deterministic, low-latency sequenced message bus for a
//! family of cooperating trading applications.
//!
//! The crate is organized leaves-first, mirroring the component table: a
//! monotonic [`scheduler`] and [`event_loop`] everything else runs on top
//! of, an [`activation`] graph managing component lifecycle, a
//! [`store`]/[`session`]/[`mold`]/[`rewind`] transport stack, and the
//! [`bus`] façade applications are built against. [`sequencer`] and
//! [`clob`] are the two applications this workspace ships: the sequencer
//! validates and linearizes commands, the CLOB matches orders in
//! price-time priority as the canonical sequenced consumer.

pub mod activation;
pub mod bus;
pub mod clob;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod header;
pub mod messages;
pub mod mold;
pub mod rewind;
pub mod scheduler;
pub mod sequencer;
pub mod session;
pub mod store;

pub use error::{BusError, BusResult};
