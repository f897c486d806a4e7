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

//! C2: Event loop.
//!
//! Single-threaded, cooperative: one pass waits on readiness with a
//! timeout sized to the nearest scheduler deadline, dispatches readiness
//! callbacks, then fires the scheduler. No callback may block; mio's
//! `Poll` is the stable-Rust, non-async readiness primitive standing in for
//! the DPDK/NetBricks poll loop (`db/src/sched.rs::RoundRobin::poll`) on a
//! general-purpose network stack — `r3bl-open-core`'s `mio_poller` (TUI
//! input backend) shows the same crate used the same way for a
//! single-threaded readiness loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::scheduler::Scheduler;

type ReadinessCallback = Box<dyn FnMut(&mio::event::Event)>;

/// The event loop. Not `Send`/`Sync` — it and everything registered with it
/// live on the one thread the whole core runs on.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    callbacks: Rc<RefCell<HashMap<Token, ReadinessCallback>>>,
    scheduler: Scheduler,
    exiting: Rc<RefCell<bool>>,
}

impl EventLoop {
    pub fn new(scheduler: Scheduler) -> io::Result<EventLoop> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            callbacks: Rc::new(RefCell::new(HashMap::new())),
            scheduler,
            exiting: Rc::new(RefCell::new(false)),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Registers `source` for `interest`, invoking `callback` whenever it
    /// becomes ready. `token` must be unique among currently-registered
    /// sources.
    pub fn register<S, F>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        callback: F,
    ) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
        F: FnMut(&mio::event::Event) + 'static,
    {
        self.poll.registry().register(source, token, interest)?;
        self.callbacks.borrow_mut().insert(token, Box::new(callback));
        Ok(())
    }

    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().deregister(source)?;
        self.callbacks.borrow_mut().remove(&token);
        Ok(())
    }

    pub fn reregister<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Requests that [`Self::run`] stop after the current pass.
    pub fn exit(&self) {
        *self.exiting.borrow_mut() = true;
    }

    /// A cheaply-clonable handle that can register/deregister sources from
    /// within a readiness callback, where a second `&mut EventLoop` borrow
    /// is unavailable (e.g. a TCP accept callback registering the
    /// connections it just accepted). Backed by `mio::Registry::try_clone`,
    /// which mio documents as safe to use independently of the `Poll` it
    /// came from.
    pub fn handle(&self) -> io::Result<EventLoopHandle> {
        Ok(EventLoopHandle {
            registry: Rc::new(self.poll.registry().try_clone()?),
            callbacks: self.callbacks.clone(),
        })
    }

    fn poll_timeout(&self) -> Option<Duration> {
        self.scheduler
            .next_deadline_in()
            .map(Duration::from_nanos)
    }

    /// Runs exactly one pass: block on readiness (bounded by the nearest
    /// timer deadline), dispatch readiness callbacks in the selector's
    /// order, then fire due timers. Readiness is handled before timers
    /// within a pass.
    pub fn run_once(&mut self) -> io::Result<()> {
        let timeout = self.poll_timeout();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for (event, token) in self.events.iter().zip(tokens) {
            let callback = self.callbacks.borrow_mut().remove(&token);
            if let Some(mut callback) = callback {
                callback(event);
                // The callback may have deregistered itself; only put it
                // back if nothing else claimed the slot (e.g. a fresh
                // registration using the same token after a close/accept).
                self.callbacks.borrow_mut().entry(token).or_insert(callback);
            }
        }

        self.scheduler.fire();
        Ok(())
    }

    /// Loops `run_once` until [`Self::exit`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        while !*self.exiting.borrow() {
            self.run_once()?;
        }
        Ok(())
    }
}

/// See [`EventLoop::handle`].
#[derive(Clone)]
pub struct EventLoopHandle {
    registry: Rc<mio::Registry>,
    callbacks: Rc<RefCell<HashMap<Token, ReadinessCallback>>>,
}

impl EventLoopHandle {
    pub fn register<S, F>(&self, source: &mut S, token: Token, interest: Interest, callback: F) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
        F: FnMut(&mio::event::Event) + 'static,
    {
        self.registry.register(source, token, interest)?;
        self.callbacks.borrow_mut().insert(token, Box::new(callback));
        Ok(())
    }

    pub fn deregister<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.registry.deregister(source)?;
        self.callbacks.borrow_mut().remove(&token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moldbus_core::clock::Clock;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn run_once_fires_due_timers_even_with_no_io() {
        let sched = Scheduler::new(Clock::new());
        let mut ev_loop = EventLoop::new(sched.clone()).unwrap();

        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        sched.schedule_in(0, "t", crate::scheduler::TaskFlags::NONE, move || {
            flag.set(true)
        });

        std::thread::sleep(Duration::from_millis(1));
        ev_loop.run_once().unwrap();
        assert!(ran.get());
    }

    #[test]
    fn exit_stops_run_loop() {
        let sched = Scheduler::new(Clock::new());
        let mut ev_loop = EventLoop::new(sched.clone()).unwrap();
        ev_loop.exit();
        // run() should return immediately without blocking.
        ev_loop.run().unwrap();
    }
}
