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

//! Error taxonomy. Validation failures never appear here — they
//! are surfaced as in-band reject events, not as `Result::Err`. Everything
//! that *does* belong here is one of: a protocol violation, a transport
//! I/O failure, resource exhaustion, an activation failure, or a bootstrap
//! failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed wire frame: {0}")]
    WireFormat(String),

    #[error("sequence gap on application {app_id}: expected {expected}, got {received}")]
    SequenceGap {
        app_id: u16,
        expected: u32,
        received: u32,
    },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("message store is full")]
    StoreFull,

    #[error("activation failure in {node}: {reason}")]
    Activation { node: String, reason: String },

    #[error("bootstrap error: {0}")]
    Bootstrap(String),
}

pub type BusResult<T> = Result<T, BusError>;
