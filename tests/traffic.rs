mod test_utilities;

use rdma_testkit::completion_queue::WcError;
use rdma_testkit::resources::{
    create_pair, BundleConfig, RawResources, RcResources, Transport, UdResources, XrcResources,
};
use rdma_testkit::traffic::{rdma_traffic, traffic, ud_traffic, xrc_traffic, OneSidedOp};
use rdma_testkit::TestkitError;
use test_utilities::{create_pair_or_skip, try_endpoint};

#[test]
fn rc_send_recv() {
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&BundleConfig::default()) else {
        return;
    };
    traffic(&mut pair, 10).unwrap();
}

#[test]
fn rc_send_recv_with_srq() {
    let cfg = BundleConfig {
        with_srq: true,
        ..BundleConfig::default()
    };
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&cfg) else {
        return;
    };
    traffic(&mut pair, 10).unwrap();
}

#[test]
fn rc_rdma_write_and_read() {
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&BundleConfig::default()) else {
        return;
    };
    rdma_traffic(&mut pair, OneSidedOp::Write, 10, None).unwrap();
    rdma_traffic(&mut pair, OneSidedOp::Read, 10, None).unwrap();
}

#[test]
fn rc_rdma_write_with_corrupted_rkey_fails() {
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&BundleConfig::default()) else {
        return;
    };
    pair.client.fields_mut().binding.as_mut().unwrap().rkey += 1;
    // Corrupting the key by one unit must produce a remote access error,
    // never silent success.
    rdma_traffic(&mut pair, OneSidedOp::Write, 1, Some(WcError::RemAccessErr)).unwrap();
}

#[test]
fn rc_rdma_read_with_corrupted_raddr_fails() {
    let Some(mut pair) = create_pair_or_skip::<RcResources>(&BundleConfig::default()) else {
        return;
    };
    pair.client.fields_mut().binding.as_mut().unwrap().raddr += 1;
    let err = rdma_traffic(&mut pair, OneSidedOp::Read, 1, None).unwrap_err();
    assert!(
        matches!(err, TestkitError::Completion(_)),
        "expected a completion error, got: {err}"
    );
}

#[test]
fn ud_send_recv() {
    let Some(mut pair) = create_pair_or_skip::<UdResources>(&BundleConfig::default()) else {
        return;
    };
    ud_traffic(&mut pair, 10).unwrap();
}

#[test]
fn raw_packet_bundle_creation() {
    let Some(endpoint) = try_endpoint() else { return };
    // Raw packet QPs need CAP_NET_RAW, so creation is allowed to fail; a
    // successful bundle must still hold its configured queue pair.
    match create_pair::<RawResources>(&endpoint, &BundleConfig::default()) {
        Ok(pair) => assert_eq!(pair.client.fields().qps.len(), 1),
        Err(err) => eprintln!("raw packet bundle unavailable: {err}"),
    }
}

#[test]
fn xrc_send_recv() {
    let Some(mut pair) = create_pair_or_skip::<XrcResources>(&BundleConfig::xrc()) else {
        return;
    };
    xrc_traffic(&mut pair, 10).unwrap();
}
