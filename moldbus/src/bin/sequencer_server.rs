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

//! Sequencer server entry point.
//!
//! Usage: `sequencer_server <config.toml>` or `sequencer_server --bootstrap
//! <commands.txt>`, mirroring the `db/src/bin/*` binaries, which hand-parse
//! `env::args()` rather than reach for an argument-parsing crate.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context, Result};
use mio::net::{TcpListener, UdpSocket};
use mio::{Interest, Token};

use moldbus::activation::{Activatable, ActivationGraph, NodeHandle};
use moldbus::bus::{Bus, Provider};
use moldbus::clob::{Clob, ClobEvent};
use moldbus::config::{Bootstrap, BusConfig};
use moldbus::event_loop::EventLoop;
use moldbus::header::{MessageHeader, HEADER_LEN};
use moldbus::messages::{
    AddOrder, ApplicationDefinition, ApplicationDiscovery, CancelOrder, EquityDefinition, MessageType, RejectCancel, RejectOrder,
};
use moldbus::mold::{self, MoldPublisher};
use moldbus::rewind::{HolderId, RewindStep, Rewinder, HEARTBEAT_TIMEOUT_NS};
use moldbus::scheduler::{Scheduler, TaskFlags};
use moldbus::sequencer::{Sequencer, Verdict};
use moldbus::session::MoldSession;
use moldbus::store::MessageStore;

fn load_config() -> Result<BusConfig> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (Some("--bootstrap"), Some(path)) => {
            let mut bootstrap = Bootstrap::new();
            bootstrap
                .load_file(path.as_ref())
                .context("loading bootstrap command file")?;
            bootstrap.into_config().map_err(Into::into)
        }
        (Some(path), None) => BusConfig::from_toml_file(path.as_ref()).map_err(Into::into),
        _ => anyhow::bail!("usage: sequencer_server <config.toml> | --bootstrap <commands.txt>"),
    }
}

const COMMAND_SOCKET_TOKEN: Token = Token(0);
const TCP_ACCEPT_TOKEN: Token = Token(1);
const HOLDER_TOKEN_BASE: usize = 1000;

fn holder_token(id: HolderId) -> Token {
    Token(HOLDER_TOKEN_BASE + id as usize)
}

/// Looks up (or mints) the outbound `Provider` for `app_id`, builds a header
/// for `message_type`, and emits `body` onto the bus under it.
fn emit_via_provider(bus: &mut Bus, providers: &mut HashMap<u16, Provider>, app_id: u16, message_type: MessageType, body: &[u8]) {
    let provider = providers.entry(app_id).or_insert_with(|| Provider::new(app_id));
    let header = provider.next_header(message_type as u8);
    if let Err(e) = bus.emit_message(&header, body) {
        log::warn!("failed to emit message_type {} for app {}: {e}", message_type as u8, app_id);
    }
}

fn emit_heartbeat(bus: &mut Bus, providers: &mut HashMap<u16, Provider>) {
    emit_via_provider(bus, providers, 0, MessageType::Heartbeat, &[]);
}

fn emit_application_discovery(bus: &mut Bus, providers: &mut HashMap<u16, Provider>, status: u8) {
    let body = ApplicationDiscovery {
        subject_application_id: 0,
        status,
    }
    .encode();
    emit_via_provider(bus, providers, 0, MessageType::ApplicationDiscovery, &body);
}

/// Routes one command body to the matching CLOB handler. Borrows `clob`
/// only for the duration of the single handler call, so the events it
/// returns can be re-emitted afterward without holding the `RefCell`
/// borrowed — letting the dispatcher's own copy-through handlers (wired
/// below) re-enter `clob` safely while those events are published.
fn dispatch_to_clob(clob: &Rc<RefCell<Clob>>, message_type: u8, body: &[u8]) -> Vec<ClobEvent> {
    if message_type == MessageType::ApplicationDefinition as u8 {
        match ApplicationDefinition::decode(body) {
            Ok(def) => vec![clob.borrow_mut().handle_application_definition(&def)],
            Err(e) => {
                log::warn!("dropping unparseable ApplicationDefinition: {e}");
                Vec::new()
            }
        }
    } else if message_type == MessageType::EquityDefinition as u8 {
        match EquityDefinition::decode(body) {
            Ok(def) => vec![clob.borrow_mut().handle_equity_definition(&def)],
            Err(e) => {
                log::warn!("dropping unparseable EquityDefinition: {e}");
                Vec::new()
            }
        }
    } else if message_type == MessageType::AddOrder as u8 {
        let side_valid = AddOrder::raw_side_valid(body);
        match AddOrder::decode(body) {
            Ok(order) => clob.borrow_mut().handle_add_order(&order, side_valid),
            Err(e) => {
                log::warn!("dropping unparseable AddOrder: {e}");
                Vec::new()
            }
        }
    } else if message_type == MessageType::CancelOrder as u8 {
        match CancelOrder::decode(body) {
            Ok(cancel) => vec![clob.borrow_mut().handle_cancel_order(&cancel)],
            Err(e) => {
                log::warn!("dropping unparseable CancelOrder: {e}");
                Vec::new()
            }
        }
    } else {
        log::debug!("no CLOB handler for message_type {message_type}");
        Vec::new()
    }
}

/// Re-encodes and emits one CLOB event onto the bus under the command's
/// originating application, except `ApplicationDefinitionAssigned`, whose
/// wire identity *is* the freshly-minted `application_id` it carries.
fn emit_clob_event(bus: &mut Bus, providers: &mut HashMap<u16, Provider>, origin_app_id: u16, event: ClobEvent) {
    let (app_id, message_type, body) = match event {
        ClobEvent::AddOrderAccepted(o) => (origin_app_id, MessageType::AddOrder, o.encode()),
        ClobEvent::RejectOrder(r) => (origin_app_id, MessageType::RejectOrder, r.encode()),
        ClobEvent::FillOrder(f) => (origin_app_id, MessageType::FillOrder, f.encode()),
        ClobEvent::CancelOrder(c) => (origin_app_id, MessageType::CancelOrder, c.encode()),
        ClobEvent::RejectCancel(rc) => (origin_app_id, MessageType::RejectCancel, rc.encode()),
        ClobEvent::EquityDefinitionAssigned(def) => (origin_app_id, MessageType::EquityDefinition, def.encode()),
        ClobEvent::ApplicationDefinitionAssigned { application_id, name } => (
            application_id,
            MessageType::ApplicationDefinition,
            ApplicationDefinition { name }.encode(),
        ),
    };
    emit_via_provider(bus, providers, app_id, message_type, &body);
}

/// Runs the active-primary validation algorithm against one inbound
/// command, dispatches accepted commands to the CLOB, and re-emits every
/// resulting event onto the bus so it gets sequenced, persisted, and
/// published like any other message.
fn handle_command(bus: &mut Bus, providers: &mut HashMap<u16, Provider>, sequencer: &mut Sequencer, clob: &Rc<RefCell<Clob>>, data: &[u8]) {
    if data.len() < HEADER_LEN {
        log::warn!("dropping command shorter than header");
        return;
    }
    let header = match MessageHeader::decode(data) {
        Ok(h) => h,
        Err(e) => {
            log::warn!("dropping unparseable command: {e}");
            return;
        }
    };
    let verdict = sequencer.validate_command(
        data.len(),
        header.application_id,
        header.message_type,
        header.application_seq_num,
    );
    match verdict {
        Verdict::TooShort => log::warn!("dropping too-short command"),
        Verdict::Reject { expected } => {
            log::warn!(
                "sequence gap on app {}: expected {}",
                header.application_id,
                expected
            );
        }
        Verdict::Accept | Verdict::AcceptBootstrap => {
            let body = &data[HEADER_LEN..];
            let events = dispatch_to_clob(clob, header.message_type, body);
            for event in events {
                emit_clob_event(bus, providers, header.application_id, event);
            }
        }
    }
}

/// Self-registers (if not already done) and emits a heartbeat. Self
/// registration rides the same bootstrap-acceptance path a client's own
/// `ApplicationDefinition` would: a synthetic command under
/// `application_id = 0`, `application_seq_num = 1`.
fn heartbeat_tick(
    bus: &Rc<RefCell<Bus>>,
    providers: &Rc<RefCell<HashMap<u16, Provider>>>,
    sequencer: &Rc<RefCell<Sequencer>>,
    clob: &Rc<RefCell<Clob>>,
) {
    if sequencer.borrow().needs_self_registration() {
        let def = ApplicationDefinition {
            name: "SEQUENCER".to_string(),
        };
        let header = MessageHeader {
            application_id: 0,
            application_seq_num: 1,
            timestamp_ns: moldbus_core::clock::unix_nanos(),
            optional_fields_index: 0,
            schema_version: 1,
            message_type: MessageType::ApplicationDefinition as u8,
        };
        let mut data = vec![0u8; HEADER_LEN];
        header.encode(&mut data).expect("fixed-size header buffer");
        data.extend_from_slice(&def.encode());
        handle_command(&mut *bus.borrow_mut(), &mut *providers.borrow_mut(), &mut *sequencer.borrow_mut(), clob, &data);
        sequencer.borrow_mut().mark_self_registered();
    }
    emit_heartbeat(&mut *bus.borrow_mut(), &mut *providers.borrow_mut());
}

/// Wraps the sequencer/heartbeat lifecycle as a DAG node (C3) instead of
/// activating it directly, so dependency propagation and
/// `prevent_parent_stop` semantics actually run for this application.
struct SequencerActivator {
    bus: Rc<RefCell<Bus>>,
    providers: Rc<RefCell<HashMap<u16, Provider>>>,
    sequencer: Rc<RefCell<Sequencer>>,
    clob: Rc<RefCell<Clob>>,
    scheduler: Scheduler,
    heartbeat_timeout_ms: u64,
}

impl Activatable for SequencerActivator {
    fn activate(&mut self, handle: NodeHandle) {
        let bus = self.bus.clone();
        let providers = self.providers.clone();
        let sequencer = self.sequencer.clone();
        let clob = self.clob.clone();
        let timer_id = self.scheduler.schedule_every(
            self.heartbeat_timeout_ms * 1_000_000,
            "sequencer-heartbeat",
            TaskFlags::NONE,
            move || heartbeat_tick(&bus, &providers, &sequencer, &clob),
        );
        self.sequencer.borrow_mut().activate(timer_id);
        handle.ready();

        heartbeat_tick(&self.bus, &self.providers, &self.sequencer, &self.clob);
        emit_application_discovery(&mut *self.bus.borrow_mut(), &mut *self.providers.borrow_mut(), 1);
    }

    fn deactivate(&mut self, handle: NodeHandle) {
        let timer_id = self.sequencer.borrow_mut().deactivate();
        self.scheduler.cancel(timer_id);
        emit_application_discovery(&mut *self.bus.borrow_mut(), &mut *self.providers.borrow_mut(), 2);
        handle.not_ready("deactivated");
    }
}

/// Drives one holder's backlog forward by a batch, retrying a blocked
/// write before attempting the next rewind read. Returns `true` once the
/// holder no longer needs servicing this tick.
fn drive_rewind(rewinder: &mut Rewinder, store: &mut MessageStore, id: HolderId, next_seq: u64) -> bool {
    if let Some(holder) = rewinder.holder(id) {
        if holder.is_write_blocked() {
            match rewinder.flush_write_buffer(id) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    log::warn!("holder {id} flush failed: {e}");
                    return true;
                }
            }
        }
    } else {
        return true;
    }

    match rewinder.rewind_batch(id, store, next_seq) {
        Ok(RewindStep::Done) => true,
        Ok(RewindStep::More) => false,
        Ok(RewindStep::Blocked) => false,
        Err(e) => {
            log::warn!("holder {id} rewind failed: {e}");
            true
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let config = load_config()?;

    let scheduler = Scheduler::new(moldbus_core::Clock::new());
    let mut ev_loop = EventLoop::new(scheduler.clone()).context("creating event loop")?;
    let ev_handle = ev_loop.handle().context("cloning event loop registry")?;

    let std_socket = std::net::UdpSocket::bind(config.bind_udp).context("binding UDP socket")?;
    std_socket.set_nonblocking(true)?;
    let publish_socket = UdpSocket::from_std(std_socket.try_clone()?);
    // Registration only needs a transient `&mut` to hand the fd to the OS
    // readiness primitive; the closure needs the same socket again on
    // every subsequent pass. `Rc<RefCell<..>>` (the single-threaded
    // sharing idiom used throughout this crate) lets both coexist without
    // a second registration.
    let command_socket = Rc::new(RefCell::new(UdpSocket::from_std(std_socket)));

    let publisher = MoldPublisher::new(Some(publish_socket), config.multicast_peers.clone());

    let bus = Rc::new(RefCell::new(Bus::new(MessageStore::in_memory(), MoldSession::new(), publisher)));
    bus.borrow_mut().create_session(&config.session_suffix)?;
    bus.borrow_mut().set_active(true);

    let clob = Rc::new(RefCell::new(Clob::new()));
    let sequencer = Rc::new(RefCell::new(Sequencer::new()));
    let providers: Rc<RefCell<HashMap<u16, Provider>>> = Rc::new(RefCell::new(HashMap::new()));

    // TCP rewind listener: accepts lagging subscribers, hands them off to
    // the rewinder's catch-up/backpressure state machine. Created ahead of
    // the live-fanout wiring below so `set_on_commit` can reach it.
    let rewinder = Rc::new(RefCell::new(Rewinder::new(config.rewind_write_buffer_size)));
    let pending_rewinds = Rc::new(RefCell::new(Vec::<HolderId>::new()));
    let tcp_listener = Rc::new(RefCell::new(
        TcpListener::bind(config.bind_tcp).context("binding TCP rewind listener")?,
    ));

    // Live fanout: push every just-committed message straight to whichever
    // rewind holders are already caught up, instead of waiting for them to
    // notice the gap on their own next heartbeat.
    {
        let rewinder = rewinder.clone();
        bus.borrow_mut().set_on_commit(move |_session, first_seq, frame| {
            let decoded = match mold::decode_frame(frame) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("live fanout: failed to decode own frame: {e}");
                    return;
                }
            };
            if decoded.is_heartbeat {
                return;
            }
            let mut rewinder = rewinder.borrow_mut();
            for id in rewinder.holder_ids() {
                for (i, payload) in decoded.messages.iter().enumerate() {
                    let seq = first_seq + i as u64;
                    if let Err(e) = rewinder.push_live_payload(id, seq, payload) {
                        log::debug!("holder {id} live push failed: {e}");
                    }
                }
            }
        });
    }

    // CLOB copy-through subscriptions (spec §4.10): observational only in
    // this active-primary binary, since every event reaching the
    // dispatcher here was emitted by this same process.
    {
        let clob = clob.clone();
        bus.borrow_mut().dispatcher().register(MessageType::Heartbeat, move |_h, _b| {
            clob.borrow_mut().observe_heartbeat();
        });
    }
    {
        let clob = clob.clone();
        bus.borrow_mut().dispatcher().register(MessageType::ApplicationDiscovery, move |_h, body| {
            if let Ok(discovery) = ApplicationDiscovery::decode(body) {
                clob.borrow_mut().observe_application_discovery(&discovery);
            }
        });
    }
    {
        let clob = clob.clone();
        bus.borrow_mut().dispatcher().register(MessageType::RejectOrder, move |_h, body| {
            if let Ok(reject) = RejectOrder::decode(body) {
                clob.borrow_mut().observe_reject_order(&reject);
            }
        });
    }
    {
        let clob = clob.clone();
        bus.borrow_mut().dispatcher().register(MessageType::RejectCancel, move |_h, body| {
            if let Ok(reject) = RejectCancel::decode(body) {
                clob.borrow_mut().observe_reject_cancel(&reject);
            }
        });
    }

    {
        let mut guard = command_socket.borrow_mut();
        let command_socket = command_socket.clone();
        let bus = bus.clone();
        let providers = providers.clone();
        let sequencer = sequencer.clone();
        let clob = clob.clone();
        ev_loop.register(&mut *guard, COMMAND_SOCKET_TOKEN, Interest::READABLE, move |_event| {
            let mut scratch = [0u8; moldbus_core::MAX_MESSAGE_SIZE];
            loop {
                let received = command_socket.borrow().recv(&mut scratch);
                match received {
                    Ok(n) => handle_command(
                        &mut *bus.borrow_mut(),
                        &mut *providers.borrow_mut(),
                        &mut *sequencer.borrow_mut(),
                        &clob,
                        &scratch[..n],
                    ),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("command socket recv error: {e}");
                        break;
                    }
                }
            }
        })?;
    }

    // Activation graph (C3): the sequencer node depends on a no-op session
    // node (ready the instant it's started) and only activates — wiring
    // the heartbeat timer and self-registration — once that dependency is
    // satisfied, instead of calling `sequencer.activate()` directly.
    let mut graph = ActivationGraph::new();
    let session_node = graph.add_node("bus-session", None);
    let sequencer_node = graph.add_node(
        "sequencer",
        Some(Box::new(SequencerActivator {
            bus: bus.clone(),
            providers: providers.clone(),
            sequencer: sequencer.clone(),
            clob: clob.clone(),
            scheduler: scheduler.clone(),
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
        })),
    );
    graph
        .add_dependency(sequencer_node, session_node)
        .expect("two freshly-created nodes cannot form a cycle");
    graph.start(sequencer_node);

    {
        let mut guard = tcp_listener.borrow_mut();
        let tcp_listener = tcp_listener.clone();
        let rewinder = rewinder.clone();
        let pending_rewinds = pending_rewinds.clone();
        let bus = bus.clone();
        let scheduler = scheduler.clone();
        let ev_handle = ev_handle.clone();
        ev_loop.register(&mut *guard, TCP_ACCEPT_TOKEN, Interest::READABLE, move |_event| loop {
            let accepted = tcp_listener.borrow_mut().accept();
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("tcp accept failed: {e}");
                    break;
                }
            };
            let _ = stream.set_nodelay(true);

            let (session_name, next_seq) = {
                let mut bus = bus.borrow_mut();
                let name = bus
                    .session()
                    .session_name()
                    .expect("session created before accepting rewind clients")
                    .to_string();
                let next_seq = bus.store().num_messages() + 1;
                (name, next_seq)
            };

            let id = match rewinder.borrow_mut().accept(stream, scheduler.now(), &session_name, next_seq) {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("rewind accept from {addr} failed: {e}");
                    continue;
                }
            };

            let rewinder_for_cb = rewinder.clone();
            let pending_rewinds_for_cb = pending_rewinds.clone();
            let bus_for_cb = bus.clone();
            let mut rewinder_guard = rewinder.borrow_mut();
            if let Some(socket) = rewinder_guard.holder_socket_mut(id) {
                let _ = ev_handle.register(socket, holder_token(id), Interest::READABLE, move |_event| {
                    let next_seq = bus_for_cb.borrow_mut().store().num_messages() + 1;
                    match rewinder_for_cb.borrow_mut().on_readable(id, next_seq) {
                        Ok(true) => pending_rewinds_for_cb.borrow_mut().push(id),
                        Ok(false) => {}
                        Err(e) => log::debug!("holder {id} read error: {e}"),
                    }
                });
            }
        })?;
    }

    // Drives every holder with an outstanding rewind forward by one batch
    // per tick, paced by `catchup_delay_ms`.
    {
        let rewinder = rewinder.clone();
        let pending_rewinds = pending_rewinds.clone();
        let bus = bus.clone();
        scheduler.schedule_every(
            config.catchup_delay_ms * 1_000_000,
            "rewind-catchup",
            TaskFlags::NONE,
            move || {
                let next_seq = bus.borrow_mut().store().num_messages() + 1;
                let mut still_pending = Vec::new();
                for id in pending_rewinds.borrow_mut().drain(..) {
                    let done = drive_rewind(&mut rewinder.borrow_mut(), bus.borrow_mut().store(), id, next_seq);
                    if !done {
                        still_pending.push(id);
                    }
                }
                pending_rewinds.borrow_mut().extend(still_pending);
            },
        );
    }

    // Heartbeats every holder and evicts the ones that have gone quiet for
    // longer than `HEARTBEAT_TIMEOUT_NS`.
    {
        let rewinder = rewinder.clone();
        let pending_rewinds = pending_rewinds.clone();
        let bus = bus.clone();
        let scheduler_for_now = scheduler.clone();
        let ev_handle = ev_handle.clone();
        scheduler.schedule_every(1_000_000_000, "rewind-heartbeat", TaskFlags::NONE, move || {
            let (session_name, next_seq) = {
                let mut bus = bus.borrow_mut();
                let name = bus.session().session_name().unwrap_or("").to_string();
                (name, bus.store().num_messages() + 1)
            };
            let ids = rewinder.borrow().holder_ids();
            for id in &ids {
                let _ = rewinder.borrow_mut().send_heartbeat(*id, &session_name, next_seq);
            }

            let now = scheduler_for_now.now();
            let dead: Vec<HolderId> = ids
                .into_iter()
                .filter(|id| {
                    rewinder
                        .borrow()
                        .holder(*id)
                        .map(|h| h.last_heartbeat_time + HEARTBEAT_TIMEOUT_NS < now)
                        .unwrap_or(false)
                })
                .collect();
            for id in dead {
                if let Some(socket) = rewinder.borrow_mut().holder_socket_mut(id) {
                    let _ = ev_handle.deregister(socket, holder_token(id));
                }
                rewinder.borrow_mut().remove(id);
                pending_rewinds.borrow_mut().retain(|&x| x != id);
                log::info!("rewind holder {id} disconnected: heartbeat timeout");
            }
        });
    }

    log::info!(
        "sequencer listening on udp {} / tcp rewind {}",
        config.bind_udp,
        config.bind_tcp
    );
    ev_loop.run()?;
    Ok(())
}
