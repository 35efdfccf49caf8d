mod test_utilities;

use rdma_testkit::access::AccessFlag;
use rdma_testkit::resources::{BundleConfig, RcResources, Transport, XrcResources};
use rdma_testkit::traffic::{atomic_traffic, AtomicKind};
use rdma_testkit::TestkitError;
use test_utilities::{create_pair_or_skip, try_endpoint};

/// Atomics need device support; probe it before building players.
fn atomics_supported() -> bool {
    let Some(endpoint) = try_endpoint() else {
        return false;
    };
    match rdma_testkit::context::Context::open(Some(&endpoint.device)) {
        Ok(ctx) if ctx.supports_atomics() => true,
        Ok(_) => {
            eprintln!("skipping: atomic operations are not supported");
            false
        }
        Err(err) => {
            eprintln!("skipping: {err}");
            false
        }
    }
}

#[test]
fn atomic_cmp_and_swap() {
    if !atomics_supported() {
        return;
    }
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&BundleConfig::atomic()) else {
        return;
    };
    atomic_traffic(&mut pair, AtomicKind::CompareSwap, 10, 1, 0, None).unwrap();
    atomic_traffic(&mut pair, AtomicKind::CompareSwap, 10, 1, 1, None).unwrap();
}

#[test]
fn atomic_fetch_and_add_counts_exactly() {
    if !atomics_supported() {
        return;
    }
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&BundleConfig::atomic()) else {
        return;
    };
    // N fetch-adds of 1 from 0 leave exactly N behind.
    atomic_traffic(&mut pair, AtomicKind::FetchAdd, 10, 1, 0, None).unwrap();
}

#[test]
fn xrc_atomic_fetch_and_add() {
    if !atomics_supported() {
        return;
    }
    let cfg = BundleConfig {
        msg_size: 8,
        ..BundleConfig::xrc()
    };
    let Some(mut pair) = create_pair_or_skip::<XrcResources>(&cfg) else {
        return;
    };
    atomic_traffic(&mut pair, AtomicKind::FetchAdd, 10, 1, 0, None).unwrap();
}

#[test]
fn atomic_with_local_write_only_qp_fails() {
    if !atomics_supported() {
        return;
    }
    let cfg = BundleConfig {
        qp_access: AccessFlag::LocalWrite.into(),
        ..BundleConfig::atomic()
    };
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
        return;
    };
    // A permission violation must fail fast with an access error, not hang
    // into a timeout.
    let err = atomic_traffic(&mut pair, AtomicKind::FetchAdd, 1, 1, 0, None).unwrap_err();
    assert!(
        matches!(err, TestkitError::Completion(_)),
        "expected a completion error, got: {err}"
    );
}

#[test]
fn atomic_with_local_write_only_mr_fails() {
    if !atomics_supported() {
        return;
    }
    let cfg = BundleConfig {
        mr_access: AccessFlag::LocalWrite.into(),
        ..BundleConfig::atomic()
    };
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
        return;
    };
    let err = atomic_traffic(&mut pair, AtomicKind::FetchAdd, 1, 1, 0, None).unwrap_err();
    assert!(matches!(err, TestkitError::Completion(_)));
}

#[test]
fn atomic_with_corrupted_rkey_fails() {
    if !atomics_supported() {
        return;
    }
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&BundleConfig::atomic()) else {
        return;
    };
    pair.client.fields_mut().binding.as_mut().unwrap().rkey += 1;
    let err = atomic_traffic(&mut pair, AtomicKind::FetchAdd, 1, 1, 0, None).unwrap_err();
    assert!(matches!(err, TestkitError::Completion(_)));
}

#[test]
fn atomic_with_corrupted_lkey_fails() {
    if !atomics_supported() {
        return;
    }
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&BundleConfig::atomic()) else {
        return;
    };
    let lkey = pair.client.fields_mut().mr.lkey();
    pair.client.fields_mut().lkey_override = Some(lkey + 1);
    let err = atomic_traffic(&mut pair, AtomicKind::FetchAdd, 1, 1, 0, None).unwrap_err();
    assert!(matches!(err, TestkitError::Completion(_)));
}

#[test]
fn atomic_with_non_aligned_raddr_fails() {
    if !atomics_supported() {
        return;
    }
    let cfg = BundleConfig {
        msg_size: 9,
        ..BundleConfig::atomic()
    };
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
        return;
    };
    pair.client.fields_mut().binding.as_mut().unwrap().raddr += 1;
    let err = atomic_traffic(&mut pair, AtomicKind::FetchAdd, 1, 1, 0, None).unwrap_err();
    assert!(matches!(err, TestkitError::Completion(_)));
}
