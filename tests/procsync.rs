//! Two-process synchronizer behavior, exercised with scenario stubs that
//! need no RDMA hardware.

use std::time::Duration;

use rdma_testkit::procsync::{run_two_process, Flow};
use rdma_testkit::{Side, TestkitError};

#[test]
fn both_sides_pass_through_barrier() {
    let result = run_two_process("both_sides_pass_through_barrier", Flow::Normal, |_role, ctx| {
        let mut barrier = ctx.rendezvous().map_err(TestkitError::Verbs)?;
        barrier.wait().map_err(TestkitError::Verbs)?;
        barrier.wait().map_err(TestkitError::Verbs)?;
        Ok(())
    });
    result.unwrap();
}

#[test]
fn one_side_skip_reports_skip() {
    let result = run_two_process("one_side_skip_reports_skip", Flow::Normal, |role, _ctx| {
        match role {
            Side::Active => Err(TestkitError::skip("nothing to do on this side")),
            Side::Passive => Ok(()),
        }
    });
    assert!(result.unwrap_err().is_skip());
}

#[test]
fn one_side_error_reports_exception() {
    let result = run_two_process("one_side_error_reports_exception", Flow::Normal, |role, _ctx| {
        match role {
            Side::Active => Err(TestkitError::PeerNotBound),
            Side::Passive => Ok(()),
        }
    });
    assert!(matches!(
        result.unwrap_err(),
        TestkitError::SideException { side: Side::Active }
    ));
}

#[test]
fn bad_flow_hang_is_the_expected_failure() {
    let result = run_two_process(
        "bad_flow_hang_is_the_expected_failure",
        Flow::Bad,
        |_role, _ctx| {
            // Outlive the bad-flow polling budget so the parent has to kill
            // this side.
            std::thread::sleep(Duration::from_secs(20));
            Ok(())
        },
    );
    result.unwrap();
}

#[test]
fn normal_flow_hang_reports_stuck() {
    let result = run_two_process("normal_flow_hang_reports_stuck", Flow::Normal, |role, _ctx| {
        if role == Side::Active {
            // Outlive the normal polling budget (150 x 100ms).
            std::thread::sleep(Duration::from_secs(60));
        }
        Ok(())
    });
    assert!(matches!(
        result.unwrap_err(),
        TestkitError::StuckHandshake
    ));
}
