//! Per-fiber watchdog: the state machine that enforces the three contracts:
//!
//! 1. no awaiting a resource owned by a different fiber,
//! 2. no awaiting a resource the parent context created before this fiber
//!    started,
//! 3. no stalling forever on a promise with no outstanding real I/O.
//!
//! The watchdog attaches itself as the [`Observer`] of every node created
//! inside the fiber, classifies each lifecycle event against the two
//! ownership/abort tables below, and rejects the fiber's wrapped future the
//! first time either table calls a fault. Built on an observer/guard split
//! that bridges cooperative fiber primitives into `std::future::Future`: a
//! small non-generic core that does the classification, plus a thin generic
//! future wrapper that only cares about settling `Result<T, Fault>`.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::{self, Fault};
use crate::fiber::{Fiber, FiberId};
use crate::graph;
use crate::hooks;
use crate::node::{Node, NodeFlags, ResourceType};
use crate::rt::{self, RawDeferHandle};

/// Callback surface a [`crate::node::Node`] notifies its attached watchdog
/// through. Object-safe so a node can hold it as `Rc<dyn Observer>` without
/// knowing the fiber's result type.
pub trait Observer {
    fn on_init(&self, node: &Node);
    fn on_before(&self, node: &Node);
    fn on_after(&self, node: &Node);
    fn on_resolve(&self, node: &Node);
}

/// Signals cooperative cancellation of a fiber. Cancelling before the fiber
/// has bound itself (i.e. before [`CancelSignal::bind`] runs) just primes the
/// flag; cancelling after immediately taints the fiber's subgraph `ABORTED`.
pub struct CancelSignal {
    aborted: Cell<bool>,
    reason: RefCell<Option<String>>,
    root: RefCell<Option<Node>>,
}

impl CancelSignal {
    pub fn new() -> Rc<Self> {
        Rc::new(CancelSignal {
            aborted: Cell::new(false),
            reason: RefCell::new(None),
            root: RefCell::new(None),
        })
    }

    pub(crate) fn bind(&self, root: Node) {
        let was_aborted = self.aborted.get();
        *self.root.borrow_mut() = Some(root.clone());
        if was_aborted {
            graph::abort_fiber(&root);
        }
    }

    /// Marks the fiber aborted with `reason` and taints its subgraph if it
    /// has already started.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.aborted.set(true);
        *self.reason.borrow_mut() = Some(reason.into());
        if let Some(root) = self.root.borrow().clone() {
            graph::abort_fiber(&root);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.get()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.borrow().clone()
    }
}

/// Where the outcome of a watchdog's judgment lands: a single-slot mailbox a
/// [`WatchdogFuture`] polls on its way to settling.
struct FaultSlot {
    fault: RefCell<Option<Fault>>,
    waker: RefCell<Option<Waker>>,
}

impl FaultSlot {
    fn new() -> Rc<Self> {
        Rc::new(FaultSlot {
            fault: RefCell::new(None),
            waker: RefCell::new(None),
        })
    }

    fn reject(&self, fault: Fault) {
        let mut slot = self.fault.borrow_mut();
        if slot.is_some() {
            return;
        }
        *slot = Some(fault);
        drop(slot);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// The non-generic classification core, attached to every node the fiber
/// owns as its [`Observer`].
struct WatchdogCore {
    self_weak: Weak<WatchdogCore>,
    fiber: Fiber,
    parent_fiber_ids: Vec<FiberId>,
    abort_signal: Option<Rc<CancelSignal>>,
    pending: RefCell<Vec<Node>>,
    settled: Cell<bool>,
    slot: Rc<FaultSlot>,
    stall_check: RefCell<Option<RawDeferHandle>>,
}

impl WatchdogCore {
    fn reject(&self, fault: Fault) {
        if self.settled.replace(true) {
            return;
        }
        self.slot.reject(fault.clone());
        if hooks::in_hook() {
            // A fault discovered while inside a hook callback (INIT/BEFORE/
            // AFTER/RESOLVE) must not let that callback run to completion, so
            // it unwinds synchronously instead of waiting for the next poll.
            // `FaultSlot::reject` has already recorded the verdict; panicking
            // here unwinds back to the poll that triggered the hook, which
            // `WatchdogFuture::poll` catches and turns back into a normal
            // `Err`.
            panic!("{fault}");
        }
    }

    /// Ownership table: classifies a node's trigger edge as same-fiber,
    /// parent, or foreign.
    fn validate_ownership(&self, node: &Node) {
        if node.fiber_id() != self.fiber.id() {
            return;
        }
        let Some(trigger) = node.trigger_origin() else {
            return;
        };
        if trigger.ptr_eq(&self.fiber.root()) {
            return;
        }
        if trigger.fiber_id() == node.fiber_id() {
            return;
        }
        // Fiber id 0 means "the top-level execution context, owned by no
        // fiber" — it predates every fiber, so it is always an ancestor,
        // whether or not this particular fiber has a real parent `Fiber`
        // object. A fiber launched straight from the top level still expects
        // `PARENT_ASYNC_TRIGGER` here, not a foreign-trigger fault.
        if trigger.fiber_id().is_none() || self.parent_fiber_ids.contains(&trigger.fiber_id()) {
            self.reject(error::parent_async_trigger(&self.fiber, node));
            return;
        }
        self.reject(error::foreign_async_trigger(&self.fiber, node));
    }

    /// Abort table: classifies a node's own or trigger-origin `ABORTED`
    /// flag, plus an external cancel signal, into the matching fault.
    fn validate_abort(&self, node: &Node) {
        if node.flags().contains(NodeFlags::ABORTED) {
            self.reject(error::fiber_aborted(
                &self.fiber,
                node,
                self.abort_signal.as_ref().and_then(|s| s.reason()).as_deref(),
            ));
            return;
        }
        if let Some(trigger) = node.trigger_origin() {
            if trigger.flags().contains(NodeFlags::ABORTED) {
                if trigger.fiber_id() == node.fiber_id() {
                    self.reject(error::fiber_aborted(
                        &self.fiber,
                        node,
                        self.abort_signal.as_ref().and_then(|s| s.reason()).as_deref(),
                    ));
                } else {
                    self.reject(error::foreign_async_aborted(&self.fiber, node));
                }
                return;
            }
        }
        if let Some(signal) = &self.abort_signal {
            if signal.is_aborted() {
                self.reject(error::fiber_aborted(&self.fiber, node, signal.reason().as_deref()));
            }
        }
    }

    fn mark_pending(&self, node: &Node) {
        self.pending.borrow_mut().push(node.clone());
    }

    fn unmark_pending(&self, node: &Node) {
        self.pending.borrow_mut().retain(|n| !n.ptr_eq(node));
    }

    /// Re-arms the coalesced stall check: cancel whatever was scheduled
    /// before, schedule a fresh one. Spec.md §9 "coalesced: cancel and
    /// reschedule" — every event in a turn collapses to a single check run
    /// after that turn's deferred work drains.
    fn rearm_stall_check(&self) {
        if let Some(prev) = self.stall_check.borrow_mut().take() {
            prev.cancel();
        }
        let this = self
            .self_weak
            .upgrade()
            .expect("WatchdogCore outlives its own Rc while rearming");
        let handle = rt::raw_defer(move || this.run_stall_check());
        *self.stall_check.borrow_mut() = Some(handle);
    }

    fn run_stall_check(&self) {
        if self.settled.get() {
            return;
        }
        let pending = self.pending.borrow();
        let mut last: Option<Node> = None;
        for node in pending.iter() {
            if !node.flags().is_finalized() {
                if node.resource_type() != ResourceType::Promise {
                    // Real outstanding I/O: something will eventually wake
                    // this fiber. Not a stall.
                    return;
                }
                last = Some(node.clone());
            }
        }
        let fallback = last
            .or_else(|| self.fiber.execution_targets().into_iter().last())
            .unwrap_or_else(|| self.fiber.root());
        drop(pending);
        self.reject(error::fiber_stall(&self.fiber, &fallback));
    }
}

impl Observer for WatchdogCore {
    fn on_init(&self, node: &Node) {
        self.validate_ownership(node);
        self.validate_abort(node);
        if node.fiber_id() == self.fiber.id() {
            self.mark_pending(node);
        }
        self.rearm_stall_check();
    }

    fn on_before(&self, _node: &Node) {
        // No classification happens here: a resource merely starting its
        // callback can't yet be a violation.
        self.rearm_stall_check();
    }

    fn on_after(&self, node: &Node) {
        self.unmark_pending(node);
        self.rearm_stall_check();
    }

    fn on_resolve(&self, node: &Node) {
        self.validate_abort(node);
        self.unmark_pending(node);
        self.rearm_stall_check();
    }
}

/// Attaches a watchdog to `fiber`: walks every node the fiber already owns
/// (it may have created resources synchronously before the watchdog
/// existed) validating and registering each, then attaches the observer to
/// the root itself so subsequent INIT events are seen.
fn attach(fiber: Fiber, abort_signal: Option<Rc<CancelSignal>>) -> (Rc<WatchdogCore>, Rc<FaultSlot>) {
    let slot = FaultSlot::new();
    let core = Rc::new_cyclic(|weak| WatchdogCore {
        self_weak: weak.clone(),
        parent_fiber_ids: fiber.parent_ids(),
        fiber: fiber.clone(),
        abort_signal: abort_signal.clone(),
        pending: RefCell::new(Vec::new()),
        settled: Cell::new(false),
        slot: slot.clone(),
        stall_check: RefCell::new(None),
    });

    if let Some(signal) = &abort_signal {
        signal.bind(fiber.root());
    }

    // Treated as permanently deactivated for the fiber's lifetime rather
    // than ever reactivated — see DESIGN.md.
    fiber.root().set_active(false);

    fn walk_existing(core: &Rc<WatchdogCore>, node: &Node) {
        for child in node.execution_targets() {
            if child.fiber_id() != core.fiber.id() {
                continue;
            }
            core.validate_ownership(&child);
            core.validate_abort(&child);
            if !child.flags().is_finalized() {
                core.mark_pending(&child);
                child.set_observer(Some(core.clone() as Rc<dyn Observer>));
            }
            walk_existing(core, &child);
        }
    }
    walk_existing(&core, &fiber.root());

    fiber.root().set_observer(Some(core.clone() as Rc<dyn Observer>));
    core.rearm_stall_check();
    (core, slot)
}

/// Bridges a fiber's wrapped future to `Result<T, Fault>`, settling as soon
/// as the watchdog rejects it (from inside a hook, via the panic in
/// [`WatchdogCore::reject`], or from the stall check) or the inner future
/// completes on its own.
pub struct WatchdogFuture<Fut> {
    inner: Fut,
    core: Rc<WatchdogCore>,
    slot: Rc<FaultSlot>,
    fiber: Fiber,
}

/// Keeps a fiber on the fiber stack, and its root node's `fiberId` stamped
/// as itself, for the duration of one poll — reverted on drop even if the
/// inner future panics.
struct FiberActiveGuard(Fiber);

impl Drop for FiberActiveGuard {
    fn drop(&mut self) {
        self.0.disable();
    }
}

impl<Fut: Future + Unpin> Future for WatchdogFuture<Fut> {
    type Output = Result<Fut::Output, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(fault) = this.slot.fault.borrow_mut().take() {
            return Poll::Ready(Err(fault));
        }
        *this.slot.waker.borrow_mut() = Some(cx.waker().clone());

        this.fiber.enable();
        let _active = FiberActiveGuard(this.fiber.clone());
        let _guard = hooks::enter(this.fiber.root());
        let poll_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Pin::new(&mut this.inner).poll(cx)
        }));
        drop(_guard);
        drop(_active);

        match poll_result {
            Ok(Poll::Ready(v)) => {
                if let Some(fault) = this.slot.fault.borrow_mut().take() {
                    Poll::Ready(Err(fault))
                } else {
                    Poll::Ready(Ok(v))
                }
            }
            Ok(Poll::Pending) => {
                this.core.rearm_stall_check();
                if let Some(fault) = this.slot.fault.borrow_mut().take() {
                    Poll::Ready(Err(fault))
                } else {
                    Poll::Pending
                }
            }
            Err(_) => {
                // `WatchdogCore::reject` only panics after recording the
                // fault in the slot, so it is always there to recover.
                let fault = this
                    .slot
                    .fault
                    .borrow_mut()
                    .take()
                    .expect("panic originated from WatchdogCore::reject, which records the fault first");
                Poll::Ready(Err(fault))
            }
        }
    }
}

/// Wraps `body` in a new fiber and returns a future that resolves to
/// `Ok(value)` if `body` completes without ever violating one of the three
/// contracts, or `Err(fault)` the moment it does.
pub(crate) fn watch<Fut>(fiber: Fiber, abort_signal: Option<Rc<CancelSignal>>, body: Fut) -> WatchdogFuture<Fut>
where
    Fut: Future + Unpin,
{
    let (core, slot) = attach(fiber.clone(), abort_signal);
    WatchdogFuture {
        inner: body,
        core,
        slot,
        fiber,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultCode;

    fn child_of(parent: &Node, fiber_id: u64) -> Node {
        let n = Node::new_child(ResourceType::Promise, None, fiber_id);
        n.set_execution_origin(parent);
        parent.link_execution_child(&n);
        n.set_trigger_origin(parent);
        n
    }

    #[test]
    fn ownership_allows_a_trigger_that_is_the_fibers_own_root() {
        let f = Fiber::new();
        f.enable();
        let (core, _slot) = attach(f.clone(), None);
        let node = child_of(&f.root(), f.id().as_raw());
        core.validate_ownership(&node);
        assert!(!core.settled.get());
        f.disable();
    }

    #[test]
    fn ownership_rejects_a_parent_fibers_trigger_as_parent_async_trigger() {
        let outer = Fiber::new();
        outer.enable();
        let inner = Fiber::new();
        inner.enable();
        let (core, slot) = attach(inner.clone(), None);

        let node = child_of(&inner.root(), inner.id().as_raw());
        node.set_trigger_origin(&outer.root());
        core.validate_ownership(&node);

        assert!(core.settled.get());
        assert_eq!(slot.fault.borrow().clone().unwrap().code, FaultCode::ParentAsyncTrigger);

        inner.disable();
        outer.disable();
    }

    #[test]
    fn ownership_rejects_an_unrelated_fibers_trigger_as_foreign_async_trigger() {
        let unrelated = Fiber::new();
        let f = Fiber::new();
        unrelated.enable();
        f.enable();
        let (core, slot) = attach(f.clone(), None);

        let node = child_of(&f.root(), f.id().as_raw());
        node.set_trigger_origin(&unrelated.root());
        core.validate_ownership(&node);

        assert!(core.settled.get());
        assert_eq!(slot.fault.borrow().clone().unwrap().code, FaultCode::ForeignAsyncTrigger);

        f.disable();
        unrelated.disable();
    }

    #[test]
    fn abort_rejects_a_node_flagged_aborted_directly() {
        let f = Fiber::new();
        f.enable();
        let (core, slot) = attach(f.clone(), None);

        let node = child_of(&f.root(), f.id().as_raw());
        node.insert_flags(NodeFlags::ABORTED);
        core.validate_abort(&node);

        assert_eq!(slot.fault.borrow().clone().unwrap().code, FaultCode::FiberAborted);
        f.disable();
    }

    #[test]
    fn abort_rejects_via_a_same_fiber_tainted_trigger() {
        let f = Fiber::new();
        f.enable();
        let (core, slot) = attach(f.clone(), None);

        let trigger = child_of(&f.root(), f.id().as_raw());
        trigger.insert_flags(NodeFlags::ABORTED);
        let node = child_of(&f.root(), f.id().as_raw());
        node.set_trigger_origin(&trigger);
        core.validate_abort(&node);

        assert_eq!(slot.fault.borrow().clone().unwrap().code, FaultCode::FiberAborted);
        f.disable();
    }

    #[test]
    fn abort_rejects_via_a_different_fiber_tainted_trigger_as_foreign_async_aborted() {
        let f = Fiber::new();
        f.enable();
        let (core, slot) = attach(f.clone(), None);

        let node = child_of(&f.root(), f.id().as_raw());
        let foreign_trigger = Node::new_child(ResourceType::Promise, None, f.id().as_raw() + 1000);
        foreign_trigger.insert_flags(NodeFlags::ABORTED);
        node.set_trigger_origin(&foreign_trigger);
        core.validate_abort(&node);

        assert_eq!(slot.fault.borrow().clone().unwrap().code, FaultCode::ForeignAsyncAborted);
        f.disable();
    }

    #[test]
    fn abort_rejects_via_an_external_cancel_signal_with_no_tainted_flags_yet() {
        let f = Fiber::new();
        f.enable();
        let signal = CancelSignal::new();
        let (core, slot) = attach(f.clone(), Some(signal.clone()));
        signal.cancel("shutting down");

        let node = child_of(&f.root(), f.id().as_raw());
        core.validate_abort(&node);

        let fault = slot.fault.borrow().clone().unwrap();
        assert_eq!(fault.code, FaultCode::FiberAborted);
        assert!(fault.message.contains("shutting down"));
        f.disable();
    }

    #[test]
    fn reject_is_idempotent_the_first_fault_wins() {
        let f = Fiber::new();
        f.enable();
        let (core, slot) = attach(f.clone(), None);

        let node = child_of(&f.root(), f.id().as_raw());
        node.insert_flags(NodeFlags::ABORTED);
        core.validate_abort(&node);

        let other = child_of(&f.root(), f.id().as_raw());
        core.reject(error::fiber_stall(&f, &other));

        assert_eq!(slot.fault.borrow().clone().unwrap().code, FaultCode::FiberAborted);
        f.disable();
    }

    #[test]
    fn cancel_signal_cancelled_before_bind_primes_the_flag_and_taints_on_bind() {
        let signal = CancelSignal::new();
        signal.cancel("early");
        assert!(signal.is_aborted());

        let root = Node::new_root(0);
        let child = child_of(&root, 0);
        signal.bind(root.clone());

        assert!(root.flags().contains(NodeFlags::ABORTED));
        assert!(child.flags().contains(NodeFlags::ABORTED));
    }

    #[test]
    fn cancel_signal_cancelled_after_bind_taints_immediately() {
        let signal = CancelSignal::new();
        let root = Node::new_root(0);
        let child = child_of(&root, 0);
        signal.bind(root.clone());
        assert!(!root.flags().contains(NodeFlags::ABORTED));

        signal.cancel("late");

        assert!(root.flags().contains(NodeFlags::ABORTED));
        assert!(child.flags().contains(NodeFlags::ABORTED));
    }
}
