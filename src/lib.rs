#![allow(clippy::let_and_return)]
//! A shadow graph over every asynchronous resource a cooperative,
//! single-threaded runtime creates, labeled by the "fiber" that owns it, so
//! that a piece of isolated code can be caught the moment it reaches outside
//! its own sandbox.
//!
//! - [Async resource nodes](node) form the graph: an [`node::ResourceType`]
//!   tagged shadow of one live `Deferred`, `Immediate`, or fiber root, linked
//!   to the node that created it and the node that will settle it.
//! - [Fibers](fiber) are named, nestable units of isolation: a root node
//!   plus a parent pointer.
//! - [The hook adapter](hooks) turns the reference runtime's four lifecycle
//!   events into node mutations and observer callbacks.
//! - [The watchdog](watchdog) attaches itself to every node a fiber owns and
//!   enforces the three contracts this crate exists for.
//! - [The reference host runtime](rt) is test/example scaffolding: a
//!   `Deferred<T>` promise type, an `Immediate` one-shot task, and a tiny
//!   `block_on` loop, none of which embed any isolation logic themselves.
//! - [Errors](error): the closed `Fault`/`FaultCode` taxonomy every
//!   contract violation settles into.
//!
//! ### The three contracts
//!
//! Code run inside [`fiber`] must not:
//!
//! 1. await a resource owned by an unrelated fiber,
//! 2. await a resource its parent context created before the fiber started,
//! 3. stall forever on a promise with no outstanding real I/O behind it.
//!
//! Breaking any of them settles the fiber's future with `Err(Fault)` instead
//! of letting it run to completion.
//!
//! ```
//! use fiber_isolation::{fiber, rt};
//!
//! let result = rt::block_on(fiber(Box::pin(async {
//!     let (tx, rx) = rt::deferred::<u32>();
//!     tx.send(7);
//!     rx.await
//! })));
//! assert_eq!(result.unwrap(), 7);
//! ```

pub mod error;
pub mod fiber;
pub mod graph;
pub mod hooks;
pub mod node;
pub mod rt;
pub mod watchdog;

pub use error::{Fault, FaultCode};
pub use fiber::FiberId;
pub use node::{Node, ResourceType};
pub use watchdog::CancelSignal;

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// `Result` alias for this crate's only error type.
pub type Result<T> = std::result::Result<T, Fault>;

/// Launches `body` as a new, isolated fiber and returns a future that
/// resolves to `Ok(value)` if it runs to completion without tripping one of
/// the three contracts, or `Err(fault)` the moment it does.
///
/// `body` must be `Unpin` — callers typically get this for free by boxing an
/// async block (`Box::pin(async move { .. })`), matching how the reference
/// runtime's own [`watchdog::WatchdogFuture`] is driven.
///
/// Nesting is a first-class citizen: calling `fiber` again from inside
/// `body` captures the currently-running fiber as the new one's parent,
/// which is exactly the information `PARENT_ASYNC_TRIGGER` needs to tell a
/// parent's pre-existing resource apart from a truly unrelated one.
pub fn fiber<Fut>(body: Fut) -> watchdog::WatchdogFuture<Fut>
where
    Fut: Future + Unpin,
{
    fiber_with_cancel(body, None)
}

/// Like [`fiber`], but with an attached [`CancelSignal`] the caller can use
/// to cooperatively cancel the fiber from outside — taints the fiber's
/// subgraph `ABORTED` and settles it with `FaultCode::FiberAborted`.
pub fn fiber_with_cancel<Fut>(body: Fut, abort_signal: Option<Rc<CancelSignal>>) -> watchdog::WatchdogFuture<Fut>
where
    Fut: Future + Unpin,
{
    let f = self::fiber::Fiber::new();
    watchdog::watch(f, abort_signal, body)
}

/// Convenience for launching `body` as a boxed async block.
///
/// ```
/// use fiber_isolation::{spawn, rt};
/// let out = rt::block_on(spawn(async { 1 + 1 }));
/// assert_eq!(out.unwrap(), 2);
/// ```
pub fn spawn<Fut>(body: Fut) -> watchdog::WatchdogFuture<Pin<Box<dyn Future<Output = Fut::Output>>>>
where
    Fut: Future + 'static,
{
    fiber(Box::pin(body))
}

/// The fiber currently executing, if any.
pub fn current_fiber() -> Option<self::fiber::Fiber> {
    self::fiber::active_fiber()
}

/// The execution-context node currently active. Mostly useful for tests and
/// diagnostics — ordinary code never needs to touch a `Node` directly.
pub fn current_node() -> Node {
    hooks::current_node()
}

/// Instruments already-running code as a fiber without wrapping it in a
/// future: if a fiber is already active, returns it unchanged; otherwise
/// creates a fresh root fiber anchored on the current execution context,
/// activates it, and returns it.
///
/// Paired with [`disable`], this is the manual alternative to [`fiber`] for
/// code that can't be restructured around a single wrapped body — enabling
/// twice without an intervening `disable` is a no-op, not a nested fiber.
pub fn enable() -> self::fiber::Fiber {
    match self::fiber::active_fiber() {
        Some(f) => f,
        None => self::fiber::Fiber::new().enable(),
    }
}

/// Deactivates the currently active fiber and returns it, or `None` if no
/// fiber is active.
pub fn disable() -> Option<self::fiber::Fiber> {
    let f = self::fiber::active_fiber()?;
    f.disable();
    Some(f)
}

/// Dereferences the shadow node attached to a raw async resource's id, for
/// callers instrumenting resources the public surface didn't itself create.
pub fn get_fiber_node(async_id: u64) -> Option<Node> {
    hooks::find_node(async_id)
}
