//! The six concrete scenarios and the universal invariants this crate exists
//! to satisfy.
//!
//! Each test is self-contained: `fiber(..)` is launched and driven to
//! completion by `rt::block_on` (`enable()`/`disable()` happen implicitly
//! around every poll, per-scenario, matching "`enable()` is called before,
//! `disable()` after" for every launch).

use std::cell::RefCell;
use std::rc::Rc;

use fiber_isolation::{fiber, fiber_with_cancel, rt, CancelSignal, FaultCode};

#[test]
fn parent_trigger_synchronous() {
    let p = rt::resolve_via_immediate(1u32);
    let body = {
        let p = p.clone();
        Box::pin(async move { p.await })
    };
    let result = rt::block_on(fiber(body));
    let fault = result.expect_err("awaiting a resource created outside any fiber must reject");
    assert_eq!(fault.code, FaultCode::ParentAsyncTrigger);
}

#[test]
fn parent_trigger_after_one_suspension() {
    let p = rt::resolve_via_immediate(1u32);
    let body = {
        let p = p.clone();
        Box::pin(async move {
            let already = rt::resolve_via_immediate(0u32);
            let _ = already.await;
            p.await
        })
    };
    let result = rt::block_on(fiber(body));
    let fault = result.expect_err("must still reject after an intervening suspension");
    assert_eq!(fault.code, FaultCode::ParentAsyncTrigger);
}

#[test]
fn foreign_trigger_synchronous() {
    let shared: Rc<RefCell<Option<rt::Deferred<u32>>>> = Rc::new(RefCell::new(None));

    let a_shared = shared.clone();
    let fiber_a = Box::pin(async move {
        let d = rt::resolve_via_immediate(7u32);
        *a_shared.borrow_mut() = Some(d);
    });
    rt::block_on(fiber(fiber_a)).expect("fiber A must not fault");

    let d = shared.borrow_mut().take().expect("fiber A published `shared`");
    let fiber_b = Box::pin(async move { d.await });
    let result = rt::block_on(fiber(fiber_b));
    let fault = result.expect_err("awaiting another fiber's resource must reject");
    assert_eq!(fault.code, FaultCode::ForeignAsyncTrigger);
}

#[test]
fn foreign_trigger_after_one_suspension() {
    let shared: Rc<RefCell<Option<rt::Deferred<u32>>>> = Rc::new(RefCell::new(None));

    let a_shared = shared.clone();
    let fiber_a = Box::pin(async move {
        let d = rt::resolve_via_immediate(7u32);
        *a_shared.borrow_mut() = Some(d);
    });
    rt::block_on(fiber(fiber_a)).expect("fiber A must not fault");

    let d = shared.borrow_mut().take().expect("fiber A published `shared`");
    let fiber_b = Box::pin(async move {
        let already = rt::resolve_via_immediate(0u32);
        let _ = already.await;
        d.await
    });
    let result = rt::block_on(fiber(fiber_b));
    let fault = result.expect_err("must still reject after an intervening suspension");
    assert_eq!(fault.code, FaultCode::ForeignAsyncTrigger);
}

#[test]
fn stall_direct() {
    let body = Box::pin(async move {
        let (_tx, rx) = rt::deferred::<u32>();
        rx.await
    });
    let result = rt::block_on(fiber(body));
    let fault = result.expect_err("a promise with no resolver must stall");
    assert_eq!(fault.code, FaultCode::FiberStall);
}

#[test]
fn stall_after_one_suspension() {
    let body = Box::pin(async move {
        let already = rt::resolve_via_immediate(0u32);
        let _ = already.await;
        let (_tx, rx) = rt::deferred::<u32>();
        rx.await
    });
    let result = rt::block_on(fiber(body));
    let fault = result.expect_err("must still stall after an intervening suspension");
    assert_eq!(fault.code, FaultCode::FiberStall);
}

#[test]
fn a_fiber_that_only_touches_its_own_resources_succeeds() {
    let body = Box::pin(async move {
        let a = rt::resolve_via_immediate(1u32).await;
        let b = rt::resolve_via_immediate(2u32).await;
        a + b
    });
    let result = rt::block_on(fiber(body));
    assert_eq!(result.unwrap(), 3);
}

#[test]
fn cancelled_before_launch_rejects_as_fiber_aborted() {
    let signal = CancelSignal::new();
    signal.cancel("stopping early");
    let body = Box::pin(async move {
        let (_tx, rx) = rt::deferred::<u32>();
        rx.await
    });
    let result = rt::block_on(fiber_with_cancel(body, Some(signal)));
    let fault = result.expect_err("a fiber launched with an already-cancelled signal must reject");
    assert_eq!(fault.code, FaultCode::FiberAborted);
}

#[test]
fn cancelled_mid_flight_skips_already_finalized_resources_and_rejects_the_next_one() {
    let signal = CancelSignal::new();
    let sig = signal.clone();
    let body = Box::pin(async move {
        let already = rt::resolve_via_immediate(0u32);
        let _ = already.await;
        sig.cancel("stopping mid flight");
        let (_tx, rx) = rt::deferred::<u32>();
        rx.await
    });
    let result = rt::block_on(fiber_with_cancel(body, Some(signal)));
    let fault = result.expect_err("a resource created after cancellation must reject, not run to completion");
    assert_eq!(fault.code, FaultCode::FiberAborted);
}

#[test]
fn cancellation_taints_a_still_pending_resource_before_it_has_a_chance_to_stall() {
    let signal = CancelSignal::new();
    let sig = signal.clone();
    let body = Box::pin(async move {
        let (_tx, rx) = rt::deferred::<u32>();
        sig.cancel("abandon");
        rx.await
    });
    let result = rt::block_on(fiber_with_cancel(body, Some(signal)));
    let fault = result.expect_err("a pending resource tainted by cancellation must reject as aborted, not stall");
    assert_eq!(fault.code, FaultCode::FiberAborted);
}

#[test]
fn at_most_one_fault_settles_the_fiber() {
    // Two independent stalls in flight; the fiber must settle exactly once,
    // with whichever fault is discovered first, not panic or double-settle.
    let body = Box::pin(async move {
        let (_tx_a, rx_a) = rt::deferred::<u32>();
        let (_tx_b, rx_b) = rt::deferred::<u32>();
        let a = rx_a.await;
        let b = rx_b.await;
        a + b
    });
    let result = rt::block_on(fiber(body));
    assert_eq!(result.unwrap_err().code, FaultCode::FiberStall);
}
