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

//! Scratch buffers for the publisher's acquire/commit path (the
//! single-owner scratch region used throughout this core).
//!
//! The teacher's `sandstorm::buf` module (referenced from `context.rs` as
//! `ReadBuf`/`WriteBuf` but not itself present in the retrieval pack) wraps
//! NetBricks packet buffers behind a safe read/write split. We keep the
//! same two-type split — a mutable scratch region while a message is being
//! assembled, an immutable view once committed — backed by `bytes` instead
//! of a packet mbuf.

use bytes::{Bytes, BytesMut};

/// A single-owner, pre-sized scratch region handed out by
/// [`crate::pool::Pool`] or directly by the message store's `acquire()`.
/// Callers fill it and then hand it to `commit`; acquiring a new buffer
/// before committing the previous one is a programming error the message
/// store enforces by construction (it only ever has one outstanding
/// `WriteBuf`).
pub struct WriteBuf {
    bytes: BytesMut,
}

impl WriteBuf {
    /// Allocates a zero-filled scratch region of at least `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> WriteBuf {
        let mut bytes = BytesMut::with_capacity(capacity);
        bytes.resize(capacity, 0);
        WriteBuf { bytes }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Freezes the first `len` bytes into an immutable [`ReadBuf`].
    pub fn freeze(self, len: usize) -> ReadBuf {
        let mut bytes = self.bytes;
        bytes.truncate(len);
        ReadBuf {
            bytes: bytes.freeze(),
        }
    }
}

/// An immutable, ref-counted view of a committed payload. Cheap to clone —
/// clones share the same backing allocation, matching `Bytes`'s
/// copy-on-write-free sharing model.
#[derive(Clone)]
pub struct ReadBuf {
    bytes: Bytes,
}

impl ReadBuf {
    pub fn from_slice(data: &[u8]) -> ReadBuf {
        ReadBuf {
            bytes: Bytes::copy_from_slice(data),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_freeze_round_trips() {
        let mut w = WriteBuf::with_capacity(16);
        w.as_mut_slice()[0..5].copy_from_slice(b"hello");
        let r = w.freeze(5);
        assert_eq!(r.as_slice(), b"hello");
    }
}
