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

//! Shared low-level primitives used by every component of the bus: a
//! monotonic clock, scratch buffers for the publisher's acquire/commit
//! path, and a generic single-threaded object pool.
//!
//! Mirrors the split between the `sandstorm` support crate and the `db`
//! application crate: this crate holds the primitives that have no notion
//! of sessions, sequencing, or the wire format.

pub mod buf;
pub mod clock;
pub mod pool;

pub use buf::{ReadBuf, WriteBuf};
pub use clock::Clock;
pub use pool::Pool;

/// Maximum payload size admitted onto the bus: MTU minus the mold frame
/// header and per-message length prefix, rounded down for headroom.
pub const MAX_MESSAGE_SIZE: usize = 1450;
