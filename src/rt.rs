//! Reference host runtime.
//!
//! This module is *not* part of the isolation primitive. It exists so the
//! fiber/graph/watchdog machinery can be exercised without an external async
//! runtime crate: a minimal single-threaded cooperative reactor with its own
//! `Deferred<T>` (promise) and `Immediate` (one-shot deferred task) resource
//! types, each of which calls into [`crate::hooks`] from its constructor and
//! `Future::poll` the way a real host would invoke the four lifecycle
//! callbacks. Modeled on a channel-future pattern: shared state cell plus
//! stored wakers.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::hooks;
use crate::node::{Frame, Node, ResourceType};

thread_local! {
    static QUEUE: RefCell<VecDeque<WorkItem>> = RefCell::new(VecDeque::new());
}

enum WorkItem {
    Raw(Rc<RawDeferEntry>),
    Immediate(Rc<ImmediateEntry>),
}

struct RawDeferEntry {
    cancelled: Cell<bool>,
    callback: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// A handle to a scheduled, cancellable, *untracked* deferred callback.
///
/// Used only by [`crate::watchdog`] for its own coalesced stall check: that
/// bookkeeping timer is deliberately invisible to the graph it supervises,
/// since it is not itself one of the resources the fiber's code created.
pub(crate) struct RawDeferHandle(Rc<RawDeferEntry>);

impl RawDeferHandle {
    pub(crate) fn cancel(&self) {
        self.0.cancelled.set(true);
    }
}

pub(crate) fn raw_defer(callback: impl FnOnce() + 'static) -> RawDeferHandle {
    let entry = Rc::new(RawDeferEntry {
        cancelled: Cell::new(false),
        callback: RefCell::new(Some(Box::new(callback))),
    });
    QUEUE.with(|q| q.borrow_mut().push_back(WorkItem::Raw(entry.clone())));
    RawDeferHandle(entry)
}

// ---------------------------------------------------------------------
// Immediate — the host's tracked, one-shot, cancellable deferred task.
// ---------------------------------------------------------------------

struct ImmediateEntry {
    node: Node,
    cancelled: Cell<bool>,
    callback: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// A handle to a scheduled [`ResourceType::Immediate`] resource — the host's
/// one-shot deferred task primitive.
#[must_use]
pub struct Immediate(Rc<ImmediateEntry>);

impl Immediate {
    #[track_caller]
    pub fn schedule(callback: impl FnOnce() + 'static) -> Self {
        let exec_origin = hooks::current_node();
        let node = hooks::init(
            &exec_origin,
            None,
            ResourceType::Immediate,
            Some(Frame::capture()),
        );
        let entry = Rc::new(ImmediateEntry {
            node,
            cancelled: Cell::new(false),
            callback: RefCell::new(Some(Box::new(callback))),
        });
        QUEUE.with(|q| q.borrow_mut().push_back(WorkItem::Immediate(entry.clone())));
        Immediate(entry)
    }

    pub fn cancel(&self) {
        self.0.cancelled.set(true);
    }

    pub fn node(&self) -> Node {
        self.0.node.clone()
    }
}

fn run_immediate(entry: &ImmediateEntry) {
    let id = entry.node.async_id();
    // Re-enter the context the immediate was created in so the bounded node
    // search in `hooks` can find it, exactly as a real host re-enters a
    // resource's owning execution context when its callback fires.
    let origin = entry
        .node
        .execution_origin()
        .unwrap_or_else(hooks::process_root);
    let _origin_guard = hooks::enter(origin);
    hooks::before(id);
    let _guard = hooks::enter(entry.node.clone());
    if let Some(cb) = entry.callback.borrow_mut().take() {
        cb();
    }
    drop(_guard);
    hooks::after(id);
    hooks::promise_resolve(id);
}

/// Drains and runs exactly one queued work item (a raw defer or an
/// `Immediate`), if any. Returns whether one ran.
///
/// One item at a time, not a batch: [`block_on`] re-polls the driven future
/// after every single item, so a promise's waker firing (via `Sender::send`
/// inside an `Immediate`'s callback) gets a chance to actually resume the
/// fiber — and therefore to re-arm or clear the coalesced stall check —
/// before that check itself gets a turn to run. Draining the whole queue
/// before re-polling, by contrast, would let the stall check fire while a
/// resource that has already in fact settled is merely waiting for its next
/// poll, a false positive.
fn drain_one() -> bool {
    let item = QUEUE.with(|q| q.borrow_mut().pop_front());
    match item {
        None => false,
        Some(WorkItem::Raw(entry)) => {
            if !entry.cancelled.get() {
                if let Some(cb) = entry.callback.borrow_mut().take() {
                    cb();
                }
            }
            true
        }
        Some(WorkItem::Immediate(entry)) => {
            if !entry.cancelled.get() {
                run_immediate(&entry);
            }
            true
        }
    }
}

// ---------------------------------------------------------------------
// Deferred<T> — a oneshot-style, clonable, tracked `PROMISE` resource.
// ---------------------------------------------------------------------

enum SlotState<T> {
    Pending,
    Ready(T),
}

struct DeferredInner<T> {
    node: Node,
    state: RefCell<SlotState<T>>,
    wakers: RefCell<Vec<Waker>>,
}

/// The producer half of a [`Deferred`]. Dropping the sender without sending
/// leaves every receiver pending forever — this is how a deferred value with
/// no resolver is constructed.
pub struct Sender<T>(Rc<DeferredInner<T>>);

impl<T> Sender<T> {
    pub fn send(&self, value: T) {
        {
            let mut state = self.0.state.borrow_mut();
            if matches!(*state, SlotState::Ready(_)) {
                return;
            }
            *state = SlotState::Ready(value);
        }
        hooks::promise_resolve(self.0.node.async_id());
        for waker in self.0.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    pub fn node(&self) -> Node {
        self.0.node.clone()
    }
}

/// A shared, clonable deferred value — a "deferred value" / `PROMISE`
/// resource.
///
/// Every clone, polled for the first time, creates its own `PROMISE` awaiter
/// node whose `triggerOrigin` is the `Deferred`'s own creation-time node,
/// modelling the same `.then()`-continuation semantics `async_hooks` gives
/// an `await` expression: the original resource keeps its own owner, while
/// each *await* of it is attributed to whoever is executing at the time.
pub struct Deferred<T: Clone> {
    inner: Rc<DeferredInner<T>>,
    awaiter: Option<Node>,
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            inner: self.inner.clone(),
            awaiter: None,
        }
    }
}

/// Creates a new tracked `PROMISE` resource, rooted at the current execution
/// context.
#[track_caller]
pub fn deferred<T: Clone>() -> (Sender<T>, Deferred<T>) {
    let exec_origin = hooks::current_node();
    let node = hooks::init(
        &exec_origin,
        None,
        ResourceType::Promise,
        Some(Frame::capture()),
    );
    let inner = Rc::new(DeferredInner {
        node,
        state: RefCell::new(SlotState::Pending),
        wakers: RefCell::new(Vec::new()),
    });
    (
        Sender(inner.clone()),
        Deferred {
            inner,
            awaiter: None,
        },
    )
}

/// Convenience helper: a deferred value that resolves via a host immediate
/// primitive rather than an explicit [`Sender::send`] call.
pub fn resolve_via_immediate<T: Clone + 'static>(value: T) -> Deferred<T> {
    let (tx, rx) = deferred::<T>();
    let _ = Immediate::schedule(move || tx.send(value));
    rx
}

impl<T: Clone> Future for Deferred<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if this.awaiter.is_none() {
            let exec_origin = hooks::current_node();
            let node = hooks::init(
                &exec_origin,
                Some(&this.inner.node),
                ResourceType::Promise,
                None,
            );
            this.awaiter = Some(node);
        }
        let awaiter = this.awaiter.clone().expect("awaiter just initialized");
        let id = awaiter.async_id();

        let ready = match &*this.inner.state.borrow() {
            SlotState::Ready(v) => Some(v.clone()),
            SlotState::Pending => None,
        };

        if let Some(v) = ready {
            // `before`/`after` bracket only the poll that actually observes
            // the settled value — the continuation genuinely "running" —
            // not every poll attempt. A poll that finds the value still
            // pending does nothing to the node's flags, so it stays
            // correctly non-finalized for the stall check. `before` runs
            // while `exec_origin` is still current, so the bounded search
            // in `hooks` finds `awaiter` via its creator's
            // `executionTargets`.
            hooks::before(id);
            hooks::after(id);
            hooks::promise_resolve(id);
            Poll::Ready(v)
        } else {
            this.inner.wakers.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Drives `fut` to completion, interleaving it with the reference runtime's
/// own deferred work (raw defers + tracked immediates) one queued item at a
/// time, re-polling `fut` after each.
///
/// One-at-a-time matters: draining every queued item before re-polling would
/// let a coalesced stall check — itself just another queued item — run
/// before `fut` gets a chance to observe that an immediate it was waiting on
/// already settled earlier in the same batch. Re-polling after each single
/// item keeps the stall check honest: it only ever runs once everything
/// queued ahead of it, including any repoll it indirectly depends on, has
/// already happened.
///
/// This is scaffolding, not a general-purpose executor: it never parks a
/// thread and has no I/O. It panics rather than hanging
/// forever if a future is still pending with no outstanding deferred work —
/// that would be a logic error in test setup, not a real stall. A real stall
/// is reported through a `FIBER_STALL` fault, which settles the watchdog's
/// future with `Ready(Err(..))`, so `block_on` never actually needs to
/// detect it itself.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    futures::pin_mut!(fut);
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
            return v;
        }
        if !drain_one() {
            panic!(
                "fiber_isolation::rt::block_on: no pending deferred work and the future is not ready (deadlock)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_resolves_synchronously_after_send() {
        let (tx, rx) = deferred::<u32>();
        tx.send(42);
        assert_eq!(block_on(rx), 42);
    }

    #[test]
    fn deferred_resolves_via_immediate() {
        let rx = resolve_via_immediate(99);
        assert_eq!(block_on(rx), 99);
    }

    #[test]
    fn cloned_deferred_each_get_their_own_awaiter_node() {
        let (tx, rx) = deferred::<u32>();
        let rx2 = rx.clone();
        tx.send(5);
        assert_eq!(block_on(rx), 5);
        assert_eq!(block_on(rx2), 5);
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn block_on_panics_on_a_never_resolved_deferred() {
        let (_tx, rx) = deferred::<u32>();
        block_on(rx);
    }
}
