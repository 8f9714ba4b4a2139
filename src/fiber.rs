//! Fiber records: named units of asynchronous isolation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::hooks;
use crate::node::{Frame, Node, ResourceType};

thread_local! {
    static FIBER_STACK: RefCell<Vec<Fiber>> = RefCell::new(Vec::new());
    static NEXT_FIBER_ID: Cell<u64> = Cell::new(1);
}

/// Process-unique fiber identifier. `NONE` (0) means "no owning fiber": a
/// root node's `fiberId` reverts to the parent fiber's id, or to 0, when
/// deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

impl FiberId {
    pub const NONE: FiberId = FiberId(0);

    pub(crate) fn from_raw(v: u64) -> Self {
        FiberId(v)
    }

    pub(crate) fn as_raw(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn alloc_fiber_id() -> FiberId {
    NEXT_FIBER_ID.with(|n| {
        let id = n.get();
        n.set(id + 1);
        FiberId::from_raw(id)
    })
}

struct FiberInner {
    id: FiberId,
    root: Node,
    parent: Option<Fiber>,
    active: Cell<bool>,
    frame: Option<Frame>,
}

/// A named unit of isolation: a root node plus a parent pointer.
///
/// Cloning a `Fiber` clones the handle (`Rc`), not the fiber itself — there
/// is exactly one fiber per launch, shared by every holder of the handle.
#[derive(Clone)]
pub struct Fiber(Rc<FiberInner>);

impl Fiber {
    /// Creates a fresh root node, parented into the graph at the current
    /// execution context, and records the currently active fiber (if any)
    /// as this fiber's parent. Does not activate the fiber — call
    /// [`Fiber::enable`] for that.
    ///
    /// The root is its own node rather than a reuse of the current one:
    /// two fibers started back to back from the same context must not
    /// share a root, or every resource they create would link into the same
    /// node and the isolation this whole module exists for would collapse.
    #[track_caller]
    pub(crate) fn new() -> Self {
        let frame = Some(Frame::capture());
        let exec_origin = hooks::current_node();
        let root = hooks::init(&exec_origin, None, ResourceType::Root, frame);
        let parent = active_fiber();
        let id = alloc_fiber_id();
        Fiber(Rc::new(FiberInner {
            id,
            root,
            parent,
            active: Cell::new(false),
            frame,
        }))
    }

    pub fn id(&self) -> FiberId {
        self.0.id
    }

    pub fn root(&self) -> Node {
        self.0.root.clone()
    }

    pub fn parent(&self) -> Option<Fiber> {
        self.0.parent.clone()
    }

    pub fn frame(&self) -> Option<Frame> {
        self.0.frame
    }

    pub fn is_active(&self) -> bool {
        self.0.active.get()
    }

    /// The ids of this fiber and every ancestor, nearest first. Used by the
    /// watchdog to distinguish `PARENT_ASYNC_TRIGGER` from
    /// `FOREIGN_ASYNC_TRIGGER`.
    pub(crate) fn parent_ids(&self) -> Vec<FiberId> {
        let mut ids = Vec::new();
        let mut cur = self.parent();
        while let Some(f) = cur {
            ids.push(f.id());
            cur = f.parent();
        }
        ids
    }

    /// Pushes this fiber on the fiber stack, stamps its id on the root node,
    /// and arms the runtime hook if it was the first fiber.
    pub fn enable(&self) -> Fiber {
        self.0.active.set(true);
        self.0.root.set_fiber_id(self.0.id);
        FIBER_STACK.with(|s| s.borrow_mut().push(self.clone()));
        self.clone()
    }

    /// Removes this fiber from the stack (not necessarily from the top),
    /// disarms the hook when the stack is empty, and sets the root node's
    /// `fiberId` to the topmost remaining active fiber's id, or 0.
    pub fn disable(&self) {
        self.0.active.set(false);
        FIBER_STACK.with(|s| {
            let mut stack = s.borrow_mut();
            if let Some(pos) = stack.iter().position(|f| f.id() == self.id()) {
                stack.remove(pos);
            }
        });
        let top = active_fiber();
        self.0
            .root
            .set_fiber_id(top.map(|f| f.id()).unwrap_or(FiberId::NONE));
    }

    /// Non-`FINALIZED` descendants of `root`, restricted to nodes owned by
    /// this fiber, excluding `root` itself.
    pub fn pending_count(&self) -> usize {
        fn walk(node: &Node, fiber_id: FiberId, count: &mut usize) {
            for child in node.execution_targets() {
                if child.fiber_id() != fiber_id {
                    continue;
                }
                if !child.flags().is_finalized() {
                    *count += 1;
                }
                walk(&child, fiber_id, count);
            }
        }
        let mut count = 0;
        walk(&self.0.root, self.id(), &mut count);
        count
    }

    /// Direct children of `root` owned by this fiber.
    pub fn execution_targets(&self) -> Vec<Node> {
        self.0
            .root
            .execution_targets()
            .into_iter()
            .filter(|n| n.fiber_id() == self.id())
            .collect()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// The topmost active fiber on the stack, or `None`.
pub fn active_fiber() -> Option<Fiber> {
    FIBER_STACK.with(|s| s.borrow().iter().rev().find(|f| f.is_active()).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_stamps_root_and_disable_reverts_to_parent() {
        let outer = Fiber::new();
        outer.enable();
        assert_eq!(outer.root().fiber_id(), outer.id());

        let inner = Fiber::new();
        assert_eq!(inner.parent().map(|f| f.id()), Some(outer.id()));
        inner.enable();
        assert_eq!(active_fiber().map(|f| f.id()), Some(inner.id()));

        inner.disable();
        assert_eq!(active_fiber().map(|f| f.id()), Some(outer.id()));

        outer.disable();
        assert!(active_fiber().is_none());
    }

    #[test]
    fn fiber_ids_are_assigned_in_order() {
        let a = Fiber::new();
        let b = Fiber::new();
        assert!(b.id().as_raw() > a.id().as_raw());
    }

    #[test]
    fn parent_ids_walks_the_whole_chain() {
        let a = Fiber::new();
        a.enable();
        let b = Fiber::new();
        b.enable();
        let c = Fiber::new();

        assert_eq!(c.parent_ids(), vec![b.id(), a.id()]);

        b.disable();
        a.disable();
    }
}
