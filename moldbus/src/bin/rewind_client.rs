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

//! Minimal TCP rewind client: connects, sends a resume-from sequence
//! number, and prints every payload streamed back. A debugging companion
//! to `sequencer_server`, in the same hand-parsed-`env::args()` spirit as
//! the `db/src/bin/*` binaries it was modeled on.

use std::io::{Read, Write};
use std::net::TcpStream;

use anyhow::{Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

fn main() -> Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let addr = args.next().context("usage: rewind_client <host:port> <resume_from_seq>")?;
    let resume_from: u64 = args
        .next()
        .context("usage: rewind_client <host:port> <resume_from_seq>")?
        .parse()
        .context("resume_from_seq must be a u64")?;

    let mut stream = TcpStream::connect(&addr).with_context(|| format!("connecting to {addr}"))?;
    let mut handshake = Vec::with_capacity(8);
    handshake.write_u64::<BigEndian>(resume_from).unwrap();
    stream.write_all(&handshake)?;

    let mut reader = std::io::BufReader::new(stream);
    loop {
        let len = match reader.read_u16::<BigEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if len == moldbus::mold::HEARTBEAT_MESSAGE_COUNT {
            let mut session = [0u8; moldbus::session::SESSION_NAME_LEN];
            reader.read_exact(&mut session)?;
            let next_seq = reader.read_u64::<BigEndian>()?;
            log::info!(
                "heartbeat: session={} next_seq_num={}",
                String::from_utf8_lossy(&session),
                next_seq
            );
            continue;
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        println!("payload ({} bytes): {:02x?}", payload.len(), payload);
    }
    Ok(())
}
