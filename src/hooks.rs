//! Runtime hook adapter.
//!
//! Translates the reference host runtime's four lifecycle events — init,
//! before, after, promise-resolve — into calls on the shadow node that owns
//! the given resource, exactly as a real `async_hooks`-style adapter would
//! translate raw runtime callbacks into node methods.
//!
//! [`find_node`] implements a bounded search: start at the current execution
//! context, check its own id and its `executionTargets`, then walk
//! `executionOrigin` upward. [`crate::rt`]'s resource types could hand us a
//! direct node reference instead, but that would sidestep the exact lookup a
//! real host hook adapter has to perform.

use std::cell::{Cell, RefCell};

use crate::node::{Frame, Node, NodeFlags, ResourceType};

thread_local! {
    /// Stack of nodes whose execution context is currently active. The
    /// bottom-most entry is the process-wide root, pushed once, never
    /// popped.
    static CURRENT: RefCell<Vec<Node>> = RefCell::new(Vec::new());

    /// Reentrancy guard: while set, hook callbacks triggered by the adapter's
    /// own bookkeeping (or by the watchdog reacting to an event) must not
    /// recurse into another round of hook processing. It doubles as the "are
    /// we inside a hook right now" flag the watchdog's reject policy needs to
    /// decide whether to also unwind synchronously.
    static IN_HOOK: Cell<bool> = Cell::new(false);
}

/// Returns the process-wide root node, creating it on first use. Represents
/// "the execution context" outside of any fiber or resource callback.
pub(crate) fn process_root() -> Node {
    CURRENT.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.is_empty() {
            stack.push(Node::new_root(0));
        }
        stack[0].clone()
    })
}

/// The node whose execution context is current right now.
pub(crate) fn current_node() -> Node {
    CURRENT.with(|stack| {
        let stack = stack.borrow();
        stack.last().cloned()
    })
    .unwrap_or_else(process_root)
}

pub(crate) struct CurrentGuard;

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Pushes `node` as the current execution context until the returned guard
/// is dropped. Used both when a fiber's root starts running and whenever one
/// of our own resources is about to be polled.
#[must_use]
pub(crate) fn enter(node: Node) -> CurrentGuard {
    process_root(); // ensure the bottom sentinel exists
    CURRENT.with(|stack| stack.borrow_mut().push(node));
    CurrentGuard
}

pub(crate) fn in_hook() -> bool {
    IN_HOOK.with(Cell::get)
}

struct HookGuard;

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|f| f.set(false));
    }
}

/// Enters the reentrancy-guarded region. Returns `None` (and does nothing)
/// if we're already inside a hook callback: every hook entry is guarded by a
/// thread-local flag, and the init callback short-circuits while it's set.
fn enter_hook() -> Option<HookGuard> {
    let already = IN_HOOK.with(Cell::get);
    if already {
        return None;
    }
    IN_HOOK.with(|f| f.set(true));
    Some(HookGuard)
}

/// Locates the node for `async_id` using a bounded search: the current
/// node's own id, then its direct execution targets, then walk
/// `executionOrigin` upward repeating both checks.
pub(crate) fn find_node(async_id: u64) -> Option<Node> {
    let mut cursor = Some(current_node());
    while let Some(node) = cursor {
        if node.async_id() == async_id {
            return Some(node);
        }
        if let Some(child) = node.execution_target(async_id) {
            return Some(child);
        }
        cursor = node.execution_origin();
    }
    None
}

/// Creates a new child node of `exec_origin`, wires both edges, and notifies
/// `exec_origin`'s attached observer with an INIT event.
///
/// `trigger_origin` is `None` for a synchronous creation, in which case the
/// trigger edge is identical to the execution edge.
pub(crate) fn init(
    exec_origin: &Node,
    trigger_origin: Option<&Node>,
    rtype: ResourceType,
    frame: Option<Frame>,
) -> Node {
    let node = Node::new_child(rtype, frame, exec_origin.fiber_id().as_raw());
    node.set_execution_origin(exec_origin);
    exec_origin.link_execution_child(&node);

    let trigger = trigger_origin.unwrap_or(exec_origin);
    node.set_trigger_origin(trigger);
    trigger.link_trigger_child(&node);

    node.insert_flags(NodeFlags::INIT);

    // The new node inherits its owning context's observer, so that its own
    // later before/after/promise-resolve events — delivered via `find_node`,
    // keyed on this node's own async id, not `exec_origin`'s — still reach
    // the same watchdog.
    if let Some(observer) = exec_origin.observer() {
        node.set_observer(Some(observer.clone()));
        if let Some(_guard) = enter_hook() {
            observer.on_init(&node);
        }
    }
    node
}

/// Delivers a BEFORE event: the resource is about to run its callback / be
/// polled.
pub(crate) fn before(async_id: u64) {
    let Some(node) = find_node(async_id) else { return };
    if !node.active() {
        return;
    }
    node.insert_flags(NodeFlags::PRE_EXECUTION);
    if let Some(_guard) = enter_hook() {
        if let Some(observer) = node.observer() {
            observer.on_before(&node);
        }
    }
}

/// Delivers an AFTER event: the resource's callback / poll for this turn has
/// finished.
pub(crate) fn after(async_id: u64) {
    let Some(node) = find_node(async_id) else { return };
    if !node.active() {
        return;
    }
    node.insert_flags(NodeFlags::POST_EXECUTION);
    if let Some(_guard) = enter_hook() {
        if let Some(observer) = node.observer() {
            observer.on_after(&node);
        }
    }
    node.clear_observer();
}

/// Delivers a PROMISE_RESOLVE event: the deferred value has settled.
pub(crate) fn promise_resolve(async_id: u64) {
    let Some(node) = find_node(async_id) else { return };
    if !node.active() {
        return;
    }
    node.insert_flags(NodeFlags::RESOLVED);
    if let Some(_guard) = enter_hook() {
        if let Some(observer) = node.observer() {
            observer.on_resolve(&node);
        }
    }
    node.clear_observer();
}
