mod test_utilities;

use rdma_testkit::{EndpointSelector, TestConfig};
use test_utilities::try_endpoint;

#[test]
fn selection_is_repeatable() {
    let Some(first) = try_endpoint() else { return };
    let second = EndpointSelector::from_config(&TestConfig::from_env())
        .select()
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn selected_port_and_device_are_consistent() {
    let Some(endpoint) = try_endpoint() else { return };
    assert!(!endpoint.device.is_empty());
    assert!(endpoint.port >= 1);
    if let Some(mac) = endpoint.mac_addr {
        // Linux MAC addresses from sysfs are colon-separated.
        assert!(mac.contains(':'), "unexpected MAC format: {mac}");
    }
}

#[test]
fn explicit_config_wins() {
    let cfg = TestConfig {
        device: Some("fake9".to_owned()),
        port: Some(2),
        gid_index: Some(4),
    };
    let endpoint = EndpointSelector::from_config(&cfg).select().unwrap();
    assert_eq!(endpoint.device, "fake9");
    assert_eq!(endpoint.port, 2);
    assert_eq!(endpoint.gid_index, Some(4));
}
