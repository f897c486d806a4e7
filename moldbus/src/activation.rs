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

//! C3: Activation dependency graph.
//!
//! Every long-lived component in the core — the session, the UDP/TCP
//! transports, the sequencer application, the CLOB handler — is a node in
//! this DAG. `start()`/`stop()` propagate down to children; a node only
//! becomes `active` once it is `ready`, `started`, and every child is
//! `active`; becoming active or inactive re-triggers evaluation of
//! parents.
//!
//! There is no teacher analog for this component (the retrieved
//! `mazharn-splinter` files are below the activation layer), so it is
//! built directly from the activation state diagram and propagation rules.
//! Nodes live in a single arena (`Vec<Node>`, index handles) rather than an
//! `Rc<RefCell<Node>>` parent/child graph, the same shape used for the
//! order pool — it sidesteps reference
//! cycles entirely. The arena itself sits behind one `Rc<RefCell<..>>` so
//! that a node's `Activatable` object can call back into the graph
//! (`ready()`/`not_ready()`) from inside or after its own `activate()`
//! without the graph needing unsafe self-referential pointers: any borrow
//! is dropped before control passes to user code.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::error::{BusError, BusResult};

pub type NodeId = usize;

/// A callback surface a node's backing object implements so the graph can
/// drive its lifecycle. `activate` may complete synchronously (call
/// `handle.ready()` before returning) or asynchronously (return, and call
/// `handle.ready()` later from a scheduler callback) — the object later
/// calls ready(), possibly asynchronously.
pub trait Activatable {
    fn activate(&mut self, handle: NodeHandle);
    fn deactivate(&mut self, handle: NodeHandle);
}

struct Node {
    name: String,
    children: Vec<NodeId>,
    parents: Vec<NodeId>,
    ready: bool,
    started: bool,
    activating: bool,
    deactivating: bool,
    active: bool,
    not_ready_reason: Option<String>,
    prevent_parent_stop: bool,
    pending_start: bool,
    pending_stop: bool,
    object: Option<Box<dyn Activatable>>,
}

struct GraphInner {
    nodes: Vec<Node>,
    queue: VecDeque<NodeId>,
    draining: bool,
}

/// Owns every node and drives the coalesced update loop described in spec
/// §4.3 ("a single reentrant update loop drains the queue").
#[derive(Clone)]
pub struct ActivationGraph {
    inner: Rc<RefCell<GraphInner>>,
}

/// A handle a node's `Activatable` object uses to call back into the
/// graph. Cheap to clone (an `Rc` clone plus an index).
pub struct NodeHandle {
    inner: Rc<RefCell<GraphInner>>,
    id: NodeId,
}

impl NodeHandle {
    pub fn ready(&self) {
        ready(&self.inner, self.id);
    }

    pub fn not_ready(&self, reason: impl Into<String>) {
        not_ready(&self.inner, self.id, reason.into());
    }
}

impl ActivationGraph {
    pub fn new() -> ActivationGraph {
        ActivationGraph {
            inner: Rc::new(RefCell::new(GraphInner {
                nodes: Vec::new(),
                queue: VecDeque::new(),
                draining: false,
            })),
        }
    }

    /// Registers a new leaf node. Dependencies are added afterward with
    /// [`Self::add_dependency`], so the DAG necessarily grows leaves-first
    /// (adding a cycle is forbidden).
    pub fn add_node(&mut self, name: impl Into<String>, object: Option<Box<dyn Activatable>>) -> NodeId {
        let mut g = self.inner.borrow_mut();
        g.nodes.push(Node {
            name: name.into(),
            children: Vec::new(),
            parents: Vec::new(),
            ready: false,
            started: false,
            activating: false,
            deactivating: false,
            active: false,
            not_ready_reason: None,
            prevent_parent_stop: false,
            pending_start: false,
            pending_stop: false,
            object,
        });
        g.nodes.len() - 1
    }

    pub fn set_prevent_parent_stop(&mut self, id: NodeId, prevent: bool) {
        self.inner.borrow_mut().nodes[id].prevent_parent_stop = prevent;
    }

    /// Declares that `parent` depends on `child`: `child` must become
    /// active before `parent` can, and `parent` is asked to stop before
    /// `child` is (unless `prevent_parent_stop` holds `child` up). Rejects
    /// the edge if it would create a cycle.
    pub fn add_dependency(&mut self, parent: NodeId, child: NodeId) -> BusResult<()> {
        let mut g = self.inner.borrow_mut();
        if parent == child || is_ancestor(&g.nodes, child, parent) {
            return Err(BusError::IllegalState(format!(
                "adding {} -> {} would create a cycle",
                g.nodes[parent].name, g.nodes[child].name
            )));
        }
        g.nodes[parent].children.push(child);
        g.nodes[child].parents.push(parent);
        Ok(())
    }

    pub fn is_active(&self, id: NodeId) -> bool {
        self.inner.borrow().nodes[id].active
    }

    pub fn is_started(&self, id: NodeId) -> bool {
        self.inner.borrow().nodes[id].started
    }

    pub fn not_ready_reason(&self, id: NodeId) -> Option<String> {
        self.inner.borrow().nodes[id].not_ready_reason.clone()
    }

    pub fn name(&self, id: NodeId) -> String {
        self.inner.borrow().nodes[id].name.clone()
    }

    pub fn start(&mut self, id: NodeId) {
        start(&self.inner, id);
    }

    pub fn stop(&mut self, id: NodeId) {
        stop(&self.inner, id);
    }

    pub fn ready(&mut self, id: NodeId) {
        ready(&self.inner, id);
    }

    pub fn not_ready(&mut self, id: NodeId, reason: impl Into<String>) {
        not_ready(&self.inner, id, reason.into());
    }
}

impl Default for ActivationGraph {
    fn default() -> ActivationGraph {
        ActivationGraph::new()
    }
}

fn is_ancestor(nodes: &[Node], maybe_ancestor: NodeId, node: NodeId) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        if n == maybe_ancestor {
            return true;
        }
        if !seen.insert(n) {
            continue;
        }
        stack.extend(nodes[n].parents.iter().copied());
    }
    false
}

fn enqueue(graph: &Rc<RefCell<GraphInner>>, id: NodeId) {
    graph.borrow_mut().queue.push_back(id);
    drain(graph);
}

/// Drains the pending-node queue. Re-entrant calls from inside an
/// `activate`/`deactivate` callback just append to the same queue instead
/// of recursing into another `drain()`, so one `drain()` per external
/// stimulus suffices.
fn drain(graph: &Rc<RefCell<GraphInner>>) {
    {
        let mut g = graph.borrow_mut();
        if g.draining {
            return;
        }
        g.draining = true;
    }
    loop {
        let next = graph.borrow_mut().queue.pop_front();
        match next {
            Some(id) => step(graph, id),
            None => break,
        }
    }
    graph.borrow_mut().draining = false;
}

fn start(graph: &Rc<RefCell<GraphInner>>, id: NodeId) {
    {
        let mut g = graph.borrow_mut();
        if g.nodes[id].started || g.nodes[id].pending_start {
            return;
        }
        g.nodes[id].pending_start = true;
    }
    enqueue(graph, id);
}

fn stop(graph: &Rc<RefCell<GraphInner>>, id: NodeId) {
    graph.borrow_mut().nodes[id].pending_stop = true;
    enqueue(graph, id);
}

fn ready(graph: &Rc<RefCell<GraphInner>>, id: NodeId) {
    {
        let mut g = graph.borrow_mut();
        g.nodes[id].ready = true;
        g.nodes[id].not_ready_reason = None;
    }
    enqueue(graph, id);
}

fn not_ready(graph: &Rc<RefCell<GraphInner>>, id: NodeId, reason: String) {
    {
        let mut g = graph.borrow_mut();
        g.nodes[id].ready = false;
        g.nodes[id].not_ready_reason = Some(reason);
    }
    enqueue(graph, id);
}

fn step(graph: &Rc<RefCell<GraphInner>>, id: NodeId) {
    let children_to_start = {
        let mut g = graph.borrow_mut();
        if g.nodes[id].pending_start && !g.nodes[id].started {
            g.nodes[id].pending_start = false;
            g.nodes[id].started = true;
            Some(g.nodes[id].children.clone())
        } else {
            None
        }
    };
    if let Some(children) = children_to_start {
        for child in children {
            start(graph, child);
        }
    }

    try_activate(graph, id);

    let (should_go_inactive, should_recurse_stop, children) = {
        let g = graph.borrow();
        let node = &g.nodes[id];
        let parents_stopped = node.parents.iter().all(|&p| !g.nodes[p].started);
        let has_inactive_child = node.children.iter().any(|&c| !g.nodes[c].active);
        let stop_now = node.pending_stop && parents_stopped && !node.prevent_parent_stop;
        let should_go_inactive = node.active && (stop_now || !node.ready || has_inactive_child);
        (should_go_inactive, stop_now, node.children.clone())
    };

    if should_go_inactive {
        make_inactive(graph, id);
    }

    if should_recurse_stop {
        {
            let mut g = graph.borrow_mut();
            g.nodes[id].pending_stop = false;
            g.nodes[id].started = false;
        }
        for child in children {
            stop(graph, child);
        }
    }
}

fn try_activate(graph: &Rc<RefCell<GraphInner>>, id: NodeId) {
    let (bail, node_ready, busy) = {
        let g = graph.borrow();
        let node = &g.nodes[id];
        let has_inactive_child = node.children.iter().any(|&c| !g.nodes[c].active);
        (
            node.active || !node.started || has_inactive_child,
            node.ready,
            node.activating || node.deactivating,
        )
    };
    if bail {
        return;
    }

    if node_ready {
        let parents = {
            let mut g = graph.borrow_mut();
            g.nodes[id].active = true;
            g.nodes[id].activating = false;
            g.nodes[id].parents.clone()
        };
        for parent in parents {
            enqueue(graph, parent);
        }
        return;
    }

    if busy {
        return;
    }

    let object = {
        let mut g = graph.borrow_mut();
        g.nodes[id].activating = true;
        g.nodes[id].object.take()
    };

    match object {
        Some(mut obj) => {
            let handle = NodeHandle {
                inner: graph.clone(),
                id,
            };
            let result = panic::catch_unwind(AssertUnwindSafe(move || {
                obj.activate(handle);
                obj
            }));
            match result {
                Ok(obj) => graph.borrow_mut().nodes[id].object = Some(obj),
                Err(_) => {
                    let name = graph.borrow().nodes[id].name.clone();
                    log::error!("activation: '{}' panicked during activate()", name);
                    graph.borrow_mut().nodes[id].activating = false;
                    stop(graph, id);
                }
            }
        }
        None => {
            // No backing object: there is nothing to initialize, so the
            // node is ready the moment it is started.
            ready(graph, id);
        }
    }
}

fn make_inactive(graph: &Rc<RefCell<GraphInner>>, id: NodeId) {
    let object = {
        let mut g = graph.borrow_mut();
        g.nodes[id].active = false;
        g.nodes[id].object.take()
    };

    let object = object.map(|mut obj| {
        let handle = NodeHandle {
            inner: graph.clone(),
            id,
        };
        obj.deactivate(handle);
        obj
    });

    let parents = {
        let mut g = graph.borrow_mut();
        g.nodes[id].object = object;
        g.nodes[id].activating = false;
        g.nodes[id].deactivating = false;
        g.nodes[id].parents.clone()
    };
    for parent in parents {
        enqueue(graph, parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Immediate;
    impl Activatable for Immediate {
        fn activate(&mut self, handle: NodeHandle) {
            handle.ready();
        }
        fn deactivate(&mut self, _handle: NodeHandle) {}
    }

    #[test]
    fn leaf_activates_immediately_when_started() {
        let mut g = ActivationGraph::new();
        let leaf = g.add_node("leaf", Some(Box::new(Immediate)));
        g.start(leaf);
        assert!(g.is_active(leaf));
    }

    #[test]
    fn parent_activates_only_after_child_is_active() {
        let mut g = ActivationGraph::new();
        let child = g.add_node("child", Some(Box::new(Immediate)));
        let parent = g.add_node("parent", Some(Box::new(Immediate)));
        g.add_dependency(parent, child).unwrap();

        g.start(parent);
        assert!(g.is_active(child));
        assert!(g.is_active(parent));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = ActivationGraph::new();
        let a = g.add_node("a", None);
        let b = g.add_node("b", None);
        g.add_dependency(a, b).unwrap();
        assert!(g.add_dependency(b, a).is_err());
    }

    #[test]
    fn stopping_parent_deactivates_it_but_child_waits_for_all_parents() {
        let mut g = ActivationGraph::new();
        let child = g.add_node("child", Some(Box::new(Immediate)));
        let p1 = g.add_node("p1", Some(Box::new(Immediate)));
        let p2 = g.add_node("p2", Some(Box::new(Immediate)));
        g.add_dependency(p1, child).unwrap();
        g.add_dependency(p2, child).unwrap();

        g.start(p1);
        g.start(p2);
        assert!(g.is_active(child));

        g.stop(p1);
        assert!(g.is_active(child), "child must stay active while p2 still needs it");

        g.stop(p2);
        assert!(!g.is_active(child));
    }

    #[test]
    fn not_ready_deactivates_node_and_reason_is_retained() {
        let mut g = ActivationGraph::new();
        let leaf = g.add_node("leaf", Some(Box::new(Immediate)));
        g.start(leaf);
        assert!(g.is_active(leaf));

        g.not_ready(leaf, "disk full");
        assert!(!g.is_active(leaf));
        assert_eq!(g.not_ready_reason(leaf).as_deref(), Some("disk full"));
    }

    #[test]
    fn activation_monotonicity_once_active_stays_active_with_unchanged_inputs() {
        let mut g = ActivationGraph::new();
        let leaf = g.add_node("leaf", Some(Box::new(Immediate)));
        g.start(leaf);
        assert!(g.is_active(leaf));
        g.ready(leaf);
        assert!(g.is_active(leaf));
    }

    struct Failing;
    impl Activatable for Failing {
        fn activate(&mut self, _handle: NodeHandle) {
            panic!("boom");
        }
        fn deactivate(&mut self, _handle: NodeHandle) {}
    }

    #[test]
    fn activation_exception_triggers_self_stop() {
        let mut g = ActivationGraph::new();
        let leaf = g.add_node("leaf", Some(Box::new(Failing)));
        g.start(leaf);
        assert!(!g.is_active(leaf));
        assert!(!g.is_started(leaf));
    }
}
