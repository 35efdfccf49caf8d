mod test_utilities;

use rdma_testkit::memory_region::PrefetchAdvice;
use rdma_testkit::resources::{
    BundleConfig, MrSpec, PrefetchMode, RcResources, UdResources, XrcResources,
};
use rdma_testkit::traffic::{
    extended_send_traffic, rdma_traffic, traffic, ud_traffic, xrc_traffic, ExtendedSendOp,
    OneSidedOp,
};
use test_utilities::create_pair_or_skip;

/// ODP RC config forcing page faults through a fresh user mapping.
fn odp_rc_cfg() -> BundleConfig {
    BundleConfig::odp(MrSpec::Odp {
        user_buffer: true,
        huge: false,
        implicit: false,
        mixed: false,
    })
}

#[test]
fn odp_rc_traffic() {
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&odp_rc_cfg()) else {
        return;
    };
    traffic(&mut pair, 100).unwrap();
}

#[test]
fn odp_rc_rdma_read_and_write() {
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&odp_rc_cfg()) else {
        return;
    };
    rdma_traffic(&mut pair, OneSidedOp::Write, 10, None).unwrap();
    rdma_traffic(&mut pair, OneSidedOp::Read, 10, None).unwrap();
}

#[test]
fn odp_rc_mixed_mr_traffic() {
    let cfg = BundleConfig::odp(MrSpec::Odp {
        user_buffer: true,
        huge: false,
        implicit: false,
        mixed: true,
    });
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
        return;
    };
    traffic(&mut pair, 10).unwrap();
}

#[test]
fn odp_implicit_rc_traffic() {
    let cfg = BundleConfig::odp(MrSpec::Odp {
        user_buffer: true,
        huge: false,
        implicit: true,
        mixed: false,
    });
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
        return;
    };
    traffic(&mut pair, 10).unwrap();
}

#[test]
fn odp_rc_huge_page_traffic() {
    let cfg = BundleConfig::odp(MrSpec::Odp {
        user_buffer: true,
        huge: true,
        implicit: false,
        mixed: false,
    });
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
        return;
    };
    traffic(&mut pair, 10).unwrap();
}

#[test]
fn odp_sync_prefetch_rc_traffic() {
    for advice in [PrefetchAdvice::Prefetch, PrefetchAdvice::PrefetchWrite] {
        let cfg = BundleConfig {
            prefetch: Some((PrefetchMode::Sync, advice)),
            ..odp_rc_cfg()
        };
        let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
            return;
        };
        traffic(&mut pair, 10).unwrap();
    }
}

#[test]
fn odp_async_prefetch_rc_traffic() {
    for advice in [PrefetchAdvice::Prefetch, PrefetchAdvice::PrefetchWrite] {
        let cfg = BundleConfig {
            prefetch: Some((PrefetchMode::Async, advice)),
            ..odp_rc_cfg()
        };
        let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
            return;
        };
        traffic(&mut pair, 10).unwrap();
    }
}

#[test]
fn odp_prefetch_no_fault_rc_traffic() {
    let cfg = BundleConfig {
        prefetch: Some((PrefetchMode::Sync, PrefetchAdvice::PrefetchNoFault)),
        ..odp_rc_cfg()
    };
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
        return;
    };
    traffic(&mut pair, 10).unwrap();
}

#[test]
fn odp_extended_send_ops_skip() {
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&odp_rc_cfg()) else {
        return;
    };
    for op in [ExtendedSendOp::Flush, ExtendedSendOp::AtomicWrite] {
        let err = extended_send_traffic(&mut pair, op, 1).unwrap_err();
        assert!(err.is_skip(), "expected skip for {op:?}, got: {err}");
    }
}

#[test]
fn odp_ud_traffic() {
    let cfg = BundleConfig::odp(MrSpec::Odp {
        user_buffer: true,
        huge: false,
        implicit: false,
        mixed: false,
    });
    let Some(mut pair) = create_pair_or_skip::<UdResources>(&cfg) else {
        return;
    };
    ud_traffic(&mut pair, 100).unwrap();
}

#[test]
fn odp_xrc_traffic() {
    let cfg = BundleConfig {
        qp_count: 2,
        ..BundleConfig::odp(MrSpec::Odp {
            user_buffer: true,
            huge: false,
            implicit: false,
            mixed: false,
        })
    };
    let Some(mut pair) = create_pair_or_skip::<XrcResources>(&cfg) else {
        return;
    };
    xrc_traffic(&mut pair, 10).unwrap();
}
