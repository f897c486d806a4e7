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

//! Integration tests for the two rewinder scenarios that don't fit neatly
//! as unit tests inside `rewind.rs`: catching a lagging TCP peer up over a
//! real socket, and disconnecting one that goes quiet.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use moldbus::mold::HEARTBEAT_MESSAGE_COUNT;
use moldbus::rewind::{RewindStep, Rewinder};
use moldbus::session::SESSION_NAME_LEN;
use moldbus::store::MessageStore;

const SESSION: &str = "20260728AA";

fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    loop {
        let len = match stream.read_u16::<BigEndian>() {
            Ok(len) => len,
            Err(_) => return None,
        };
        if len == HEARTBEAT_MESSAGE_COUNT {
            let mut skip = [0u8; SESSION_NAME_LEN + 8];
            stream.read_exact(&mut skip).ok()?;
            continue;
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).ok()?;
        return Some(payload);
    }
}

/// Scenario 5: publish 5 events, connect, resume from seq 2, expect
/// payloads 2-5 in order, then a live event 6 once caught up.
#[test]
fn tcp_rewind_replays_backlog_then_live_event() {
    let mut store = MessageStore::in_memory();
    store.open(SESSION, None).unwrap();
    for i in 1u8..=5 {
        let payload = vec![b'e', i];
        store.acquire().as_mut_slice()[0..2].copy_from_slice(&payload);
        store.commit(&[2]).unwrap();
    }
    assert_eq!(store.num_messages(), 5);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_nodelay(true).unwrap();
        let mut handshake = Vec::new();
        handshake.write_u64::<BigEndian>(2).unwrap();
        stream.write_all(&handshake).unwrap();

        let mut received = Vec::new();
        while received.len() < 5 {
            match read_frame(&mut stream) {
                Some(payload) => received.push(payload),
                None => break,
            }
        }
        received
    });

    let (std_stream, _) = listener.accept().unwrap();
    std_stream.set_nonblocking(true).unwrap();
    let mio_stream = mio::net::TcpStream::from_std(std_stream);

    let mut rewinder = Rewinder::new(64 * 1024);
    let id = rewinder.accept(mio_stream, 0, SESSION, 6).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut handshake_seen = false;
    while !handshake_seen {
        assert!(Instant::now() < deadline, "handshake never arrived");
        handshake_seen = rewinder.on_readable(id, 6).unwrap();
        if !handshake_seen {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    loop {
        match rewinder.rewind_batch(id, &mut store, 6).unwrap() {
            RewindStep::Done => break,
            RewindStep::More => std::thread::sleep(Duration::from_millis(1)),
            RewindStep::Blocked => {
                while !rewinder.flush_write_buffer(id).unwrap() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    store.acquire().as_mut_slice()[0..2].copy_from_slice(&[b'e', 6]);
    store.commit(&[2]).unwrap();
    loop {
        match rewinder.rewind_batch(id, &mut store, 7).unwrap() {
            RewindStep::Done => break,
            RewindStep::More => std::thread::sleep(Duration::from_millis(1)),
            RewindStep::Blocked => {
                while !rewinder.flush_write_buffer(id).unwrap() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    rewinder.remove(id);
    let received = client.join().unwrap();
    assert_eq!(
        received,
        vec![
            vec![b'e', 2],
            vec![b'e', 3],
            vec![b'e', 4],
            vec![b'e', 5],
            vec![b'e', 6],
        ]
    );
}

/// Scenario 6: a holder that never heartbeats gets dropped once
/// `HEARTBEAT_TIMEOUT_NS` has elapsed, and survives right up to the edge.
#[test]
fn quiet_holder_is_disconnected_after_heartbeat_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let _client = TcpStream::connect(addr).unwrap();
    let (std_stream, _) = listener.accept().unwrap();
    std_stream.set_nonblocking(true).unwrap();
    let mio_stream = mio::net::TcpStream::from_std(std_stream);

    let mut rewinder = Rewinder::new(64 * 1024);
    let start = 1_000_000_000u64;
    let id = rewinder.accept(mio_stream, start, SESSION, 1).unwrap();

    let just_before_timeout = start + moldbus::rewind::HEARTBEAT_TIMEOUT_NS - 1;
    let dead = rewinder.sweep_dead_holders(just_before_timeout);
    assert!(dead.is_empty());
    assert_eq!(rewinder.len(), 1);

    let after_timeout = start + moldbus::rewind::HEARTBEAT_TIMEOUT_NS + 1;
    let dead = rewinder.sweep_dead_holders(after_timeout);
    assert_eq!(dead, vec![id]);
    assert!(rewinder.is_empty());
}
