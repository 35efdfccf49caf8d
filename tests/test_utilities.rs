use rdma_testkit::resources::{create_pair, BundleConfig, Pair, Transport};
use rdma_testkit::{EndpointCandidate, EndpointSelector, TestConfig};

/// Install the fmt subscriber once per test binary.
fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Pick an endpoint, or report why the host can't run hardware scenarios.
#[allow(unused)] // it's used by the other test files
pub(crate) fn try_endpoint() -> Option<EndpointCandidate> {
    init_logging();
    match EndpointSelector::from_config(&TestConfig::from_env()).select() {
        Ok(endpoint) => Some(endpoint),
        Err(err) => {
            eprintln!("skipping hardware scenario: {err}");
            None
        }
    }
}

/// Build a bundle pair, turning skip outcomes into a quiet `None` so the
/// calling test early-returns the way unsupported hardware should.
#[allow(unused)] // it's used by the other test files
pub(crate) fn create_pair_or_skip<T: Transport>(cfg: &BundleConfig) -> Option<Pair<T>> {
    let endpoint = try_endpoint()?;
    match create_pair::<T>(&endpoint, cfg) {
        Ok(pair) => Some(pair),
        Err(err) if err.is_skip() => {
            eprintln!("skipping: {err}");
            None
        }
        Err(err) => panic!("pair creation failed: {err}"),
    }
}
