//! The fault surface.
//!
//! The taxonomy is closed and classification happens at exactly two sites
//! (ownership on INIT, abort on INIT/RESOLVED) plus one schedule-driven site
//! (the stall check). Every violation collapses to the same action: reject
//! the wrapped deferred value and, if observed inside a hook callback, also
//! unwind synchronously. See [`crate::watchdog`].

use std::fmt;
use std::rc::Rc;

use crate::fiber::Fiber;
use crate::node::Node;

const MAX_TRACE_DEPTH: usize = 32;

/// One of the five closed fault kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// A node's trigger origin belongs to a fiber that is neither this
    /// fiber nor an ancestor of it.
    ForeignAsyncTrigger,
    /// A node's trigger origin belongs to a parent fiber.
    ParentAsyncTrigger,
    /// A node's trigger origin is `ABORTED` and belongs to a different
    /// fiber than the node itself.
    ForeignAsyncAborted,
    /// This fiber (or a trigger within the same fiber) has been aborted.
    FiberAborted,
    /// The fiber has nothing but unresolved promises in flight; nothing
    /// will ever wake it.
    FiberStall,
}

impl FaultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultCode::ForeignAsyncTrigger => "FOREIGN_ASYNC_TRIGGER",
            FaultCode::ParentAsyncTrigger => "PARENT_ASYNC_TRIGGER",
            FaultCode::ForeignAsyncAborted => "FOREIGN_ASYNC_ABORTED",
            FaultCode::FiberAborted => "FIBER_ABORTED",
            FaultCode::FiberStall => "FIBER_STALL",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hop of a fault's trace: an execution-origin or trigger-origin
/// ancestor walked while building [`Fault::trace`].
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub async_id: u64,
    pub resource_type: crate::node::ResourceType,
    pub frame: Option<crate::node::Frame>,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame {
            Some(frame) => write!(f, "#{} {} at {}", self.async_id, self.resource_type, frame),
            None => write!(f, "#{} {} (no frame)", self.async_id, self.resource_type),
        }
    }
}

/// The single fault kind this crate ever raises.
///
/// Carries the offending fiber and node, a formatted message, and a trace
/// derived by walking `executionOrigin` (bounded to [`MAX_TRACE_DEPTH`]) and
/// `triggerOrigin`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Fault {
    pub code: FaultCode,
    pub fiber: Fiber,
    pub node: Node,
    pub message: String,
    pub trace: Rc<Vec<TraceEntry>>,
}

impl Fault {
    pub(crate) fn new(code: FaultCode, fiber: &Fiber, node: &Node) -> Self {
        let message = default_message(code, node);
        let trace = Rc::new(build_trace(node));
        Fault {
            code,
            fiber: fiber.clone(),
            node: node.clone(),
            message,
            trace,
        }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

fn default_message(code: FaultCode, node: &Node) -> String {
    match code {
        FaultCode::ForeignAsyncTrigger => format!(
            "node #{} ({}) was triggered by an async resource owned by a different, unrelated fiber",
            node.async_id(),
            node.resource_type()
        ),
        FaultCode::ParentAsyncTrigger => format!(
            "node #{} ({}) was triggered by an async resource created in a parent fiber's execution context before this fiber started",
            node.async_id(),
            node.resource_type()
        ),
        FaultCode::ForeignAsyncAborted => format!(
            "node #{} ({})'s trigger was aborted as part of a different fiber's cancellation",
            node.async_id(),
            node.resource_type()
        ),
        FaultCode::FiberAborted => format!(
            "fiber was aborted (node #{}, {})",
            node.async_id(),
            node.resource_type()
        ),
        FaultCode::FiberStall => format!(
            "fiber is stalled: node #{} ({}) is pending with no outstanding asynchronous I/O to ever wake it",
            node.async_id(),
            node.resource_type()
        ),
    }
}

fn build_trace(node: &Node) -> Vec<TraceEntry> {
    let mut trace = Vec::new();
    let mut cursor = Some(node.clone());
    let mut depth = 0;
    while let Some(n) = cursor {
        if depth >= MAX_TRACE_DEPTH {
            break;
        }
        trace.push(TraceEntry {
            async_id: n.async_id(),
            resource_type: n.resource_type(),
            frame: n.frame(),
        });
        depth += 1;
        cursor = n.execution_origin();
    }
    if let Some(t) = node.trigger_origin() {
        if depth < MAX_TRACE_DEPTH {
            trace.push(TraceEntry {
                async_id: t.async_id(),
                resource_type: t.resource_type(),
                frame: t.frame(),
            });
        }
    }
    trace
}

pub(crate) fn fiber_stall(fiber: &Fiber, node: &Node) -> Fault {
    Fault::new(FaultCode::FiberStall, fiber, node)
}

pub(crate) fn fiber_aborted(fiber: &Fiber, node: &Node, reason: Option<&str>) -> Fault {
    let fault = Fault::new(FaultCode::FiberAborted, fiber, node);
    match reason {
        Some(r) => fault.with_message(format!("fiber was cancelled: {r}")),
        None => fault,
    }
}

pub(crate) fn foreign_async_aborted(fiber: &Fiber, node: &Node) -> Fault {
    Fault::new(FaultCode::ForeignAsyncAborted, fiber, node)
}

pub(crate) fn parent_async_trigger(fiber: &Fiber, node: &Node) -> Fault {
    Fault::new(FaultCode::ParentAsyncTrigger, fiber, node)
}

pub(crate) fn foreign_async_trigger(fiber: &Fiber, node: &Node) -> Fault {
    Fault::new(FaultCode::ForeignAsyncTrigger, fiber, node)
}
