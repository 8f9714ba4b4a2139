//! Shadow graph of every live asynchronous resource the reference host
//! runtime ([`crate::rt`]) creates.
//!
//! See the module-level docs of [`crate::fiber`] and [`crate::watchdog`] for
//! how nodes are linked into fibers and observed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fiber::FiberId;

bitflags::bitflags! {
    /// Lifecycle bits of an [`AsyncResourceNode`].
    ///
    /// `FINALIZED` is not a stored bit, it's the `POST_EXECUTION | RESOLVED`
    /// mask, exposed as an associated constant for callers that need to test
    /// "has this node finished, one way or another".
    pub struct NodeFlags: u8 {
        const INIT            = 0b0000_0001;
        const PRE_EXECUTION    = 0b0000_0010;
        const POST_EXECUTION   = 0b0000_0100;
        const RESOLVED         = 0b0000_1000;
        const ABORTED          = 0b0001_0000;
    }
}

impl NodeFlags {
    /// `POST_EXECUTION | RESOLVED` — not a stored bit, computed on demand.
    pub fn finalized_mask() -> NodeFlags {
        NodeFlags::POST_EXECUTION | NodeFlags::RESOLVED
    }

    pub fn is_finalized(self) -> bool {
        self.intersects(Self::finalized_mask())
    }
}

/// Runtime-supplied category of an async resource, analogous to the `type`
/// string Node.js's `async_hooks` attaches to every resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// A `Deferred<T>` / its awaiters — the `PROMISE` resource kind the
    /// stall check special-cases.
    Promise,
    /// The host's one-shot, cancellable, lowest-priority deferred task.
    Immediate,
    /// A synthetic node with no corresponding scheduled callback, used only
    /// as the process-wide or fiber-launch execution-context anchor.
    Root,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Promise => write!(f, "PROMISE"),
            ResourceType::Immediate => write!(f, "Immediate"),
            ResourceType::Root => write!(f, "Root"),
        }
    }
}

/// Best-effort capture of the call site at a node's `init`. Never a reason to
/// fail: a missing frame degrades diagnostics, not correctness.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl Frame {
    #[track_caller]
    pub fn capture() -> Self {
        let loc = Location::caller();
        Frame {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

static NEXT_ASYNC_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_async_id() -> u64 {
    NEXT_ASYNC_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct NodeInner {
    async_id: u64,
    fiber_id: Cell<u64>,
    rtype: ResourceType,
    frame: Option<Frame>,
    active: Cell<bool>,
    flags: Cell<NodeFlags>,
    execution_origin: RefCell<Option<Node>>,
    trigger_origin: RefCell<Option<Node>>,
    execution_targets: RefCell<HashMap<u64, Node>>,
    trigger_targets: RefCell<HashMap<u64, Node>>,
    observer: RefCell<Option<Rc<dyn crate::watchdog::Observer>>>,
}

/// A shadow node for one live asynchronous resource.
///
/// Cheap to clone (an `Rc` under the hood) — the whole system is
/// single-threaded and cooperative, so there is no need for atomic
/// refcounting or interior locking the way a multi-threaded runtime would
/// require.
#[derive(Clone)]
pub struct Node(pub(crate) Rc<NodeInner>);

impl Node {
    pub(crate) fn new_root(fiber_id: u64) -> Self {
        Node(Rc::new(NodeInner {
            async_id: next_async_id(),
            fiber_id: Cell::new(fiber_id),
            rtype: ResourceType::Root,
            frame: None,
            active: Cell::new(true),
            flags: Cell::new(NodeFlags::empty()),
            execution_origin: RefCell::new(None),
            trigger_origin: RefCell::new(None),
            execution_targets: RefCell::new(HashMap::new()),
            trigger_targets: RefCell::new(HashMap::new()),
            observer: RefCell::new(None),
        }))
    }

    pub(crate) fn new_child(rtype: ResourceType, frame: Option<Frame>, fiber_id: u64) -> Self {
        Node(Rc::new(NodeInner {
            async_id: next_async_id(),
            fiber_id: Cell::new(fiber_id),
            rtype,
            frame,
            active: Cell::new(true),
            flags: Cell::new(NodeFlags::empty()),
            execution_origin: RefCell::new(None),
            trigger_origin: RefCell::new(None),
            execution_targets: RefCell::new(HashMap::new()),
            trigger_targets: RefCell::new(HashMap::new()),
            observer: RefCell::new(None),
        }))
    }

    pub fn async_id(&self) -> u64 {
        self.0.async_id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.0.rtype
    }

    pub fn frame(&self) -> Option<Frame> {
        self.0.frame
    }

    pub fn fiber_id(&self) -> FiberId {
        FiberId::from_raw(self.0.fiber_id.get())
    }

    pub(crate) fn set_fiber_id(&self, id: FiberId) {
        self.0.fiber_id.set(id.as_raw());
    }

    pub fn active(&self) -> bool {
        self.0.active.get()
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.0.active.set(active);
    }

    pub fn flags(&self) -> NodeFlags {
        self.0.flags.get()
    }

    pub(crate) fn insert_flags(&self, flags: NodeFlags) {
        self.0.flags.set(self.0.flags.get() | flags);
    }

    pub fn execution_origin(&self) -> Option<Node> {
        self.0.execution_origin.borrow().clone()
    }

    pub fn trigger_origin(&self) -> Option<Node> {
        self.0.trigger_origin.borrow().clone()
    }

    pub(crate) fn set_execution_origin(&self, origin: &Node) {
        *self.0.execution_origin.borrow_mut() = Some(origin.clone());
    }

    pub(crate) fn set_trigger_origin(&self, origin: &Node) {
        *self.0.trigger_origin.borrow_mut() = Some(origin.clone());
    }

    pub(crate) fn link_execution_child(&self, child: &Node) {
        self.0
            .execution_targets
            .borrow_mut()
            .insert(child.async_id(), child.clone());
    }

    pub(crate) fn link_trigger_child(&self, child: &Node) {
        self.0
            .trigger_targets
            .borrow_mut()
            .insert(child.async_id(), child.clone());
    }

    pub fn execution_targets(&self) -> Vec<Node> {
        self.0.execution_targets.borrow().values().cloned().collect()
    }

    pub fn trigger_targets(&self) -> Vec<Node> {
        self.0.trigger_targets.borrow().values().cloned().collect()
    }

    pub(crate) fn execution_target(&self, async_id: u64) -> Option<Node> {
        self.0.execution_targets.borrow().get(&async_id).cloned()
    }

    pub fn observer(&self) -> Option<Rc<dyn crate::watchdog::Observer>> {
        self.0.observer.borrow().clone()
    }

    /// At most one observer is attached at a time.
    pub(crate) fn set_observer(&self, observer: Option<Rc<dyn crate::watchdog::Observer>>) {
        *self.0.observer.borrow_mut() = observer;
    }

    pub(crate) fn clear_observer(&self) {
        self.set_observer(None);
    }

    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("async_id", &self.async_id())
            .field("fiber_id", &self.fiber_id())
            .field("type", &self.resource_type())
            .field("flags", &self.flags())
            .finish()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_mask_covers_post_execution_and_resolved() {
        assert!(NodeFlags::POST_EXECUTION.is_finalized());
        assert!(NodeFlags::RESOLVED.is_finalized());
        assert!(!NodeFlags::PRE_EXECUTION.is_finalized());
        assert!(!NodeFlags::INIT.is_finalized());
    }

    #[test]
    fn new_child_inherits_fiber_id_and_links_execution_edge() {
        let root = Node::new_root(0);
        let child = Node::new_child(ResourceType::Promise, None, 3);
        child.set_execution_origin(&root);
        root.link_execution_child(&child);

        assert_eq!(child.fiber_id(), FiberId::from_raw(3));
        assert_eq!(root.execution_targets().len(), 1);
        assert!(root.execution_target(child.async_id()).is_some());
    }

    #[test]
    fn async_ids_are_unique_and_monotonic() {
        let a = Node::new_root(0);
        let b = Node::new_root(0);
        assert!(b.async_id() > a.async_id());
    }

    #[test]
    fn node_equality_is_pointer_identity() {
        let a = Node::new_root(0);
        let b = a.clone();
        let c = Node::new_root(0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
