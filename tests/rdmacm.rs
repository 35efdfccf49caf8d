//! Connection-manager handshakes driven as two OS processes.

use rdma_testkit::cm;
use rdma_testkit::procsync::{run_two_process, Flow};
use rdma_testkit::{EndpointSelector, TestConfig, TestkitError, TestkitResult};

/// CM listen port of the sync-traffic scenario.
const CM_TRAFFIC_PORT: u16 = 7471;
/// CM listen port of the reject scenario.
const CM_REJECT_PORT: u16 = 7472;

/// Children re-run the selector (selection is deterministic for unchanged
/// hardware) and require an IP-bearing endpoint.
fn scenario_ip() -> TestkitResult<String> {
    let endpoint = EndpointSelector::from_config(&TestConfig::from_env()).select()?;
    if endpoint.gid_index.is_none() {
        return Err(TestkitError::skip("no relevant GID found"));
    }
    endpoint.ip_addr.ok_or_else(|| {
        TestkitError::skip(format!("device {} has no net interface", endpoint.device))
    })
}

/// Unwrap a scenario verdict, tolerating skips.
fn expect_pass_or_skip(result: TestkitResult<()>) {
    match result {
        Ok(()) => {}
        Err(err) if err.is_skip() => eprintln!("skipping: {err}"),
        Err(err) => panic!("rdmacm scenario failed: {err}"),
    }
}

#[test]
fn rdmacm_sync_traffic() {
    let result = run_two_process("rdmacm_sync_traffic", Flow::Normal, |role, ctx| {
        let ip = scenario_ip()?;
        cm::sync_traffic_scenario(role, ctx, &ip, CM_TRAFFIC_PORT)
    });
    expect_pass_or_skip(result);
}

#[test]
fn rdmacm_reject_connection() {
    let result = run_two_process("rdmacm_reject_connection", Flow::Normal, |role, ctx| {
        let ip = scenario_ip()?;
        cm::reject_scenario(role, ctx, &ip, CM_REJECT_PORT)
    });
    expect_pass_or_skip(result);
}
