use crate::config::TestConfig;
use crate::context::{Context, LINK_LAYER_ETHERNET};
use crate::device::DeviceList;
use crate::error::{TestkitError, TestkitResult};
use crate::gid::GidType;

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;

use clippy_utilities::Cast;
use lazy_static::lazy_static;
use tracing::debug;

/// Mellanox vendor id.
const MLNX_VENDOR_ID: u32 = 0x02c9;
/// ConnectX-3 part id.
const CX3_MLNX_PART_ID: u32 = 4099;
/// ConnectX-3 Pro part id.
const CX3PRO_MLNX_PART_ID: u32 = 4103;

lazy_static! {
    /// vendor_id -> part ids of devices that lack working RoCEv2 support.
    static ref ROCEV2_UNSUPPORTED_DEVS: HashMap<u32, Vec<u32>> = {
        let mut table = HashMap::new();
        let _ = table.insert(MLNX_VENDOR_ID, vec![CX3PRO_MLNX_PART_ID, CX3_MLNX_PART_ID]);
        table
    };
}

/// Whether this vendor/part pair has the known RoCEv2 hardware defect.
#[inline]
#[must_use]
pub fn has_roce_hw_bug(vendor_id: u32, vendor_part_id: u32) -> bool {
    ROCEV2_UNSUPPORTED_DEVS
        .get(&vendor_id)
        .map_or(false, |parts| parts.contains(&vendor_part_id))
}

/// One usable (device, port, GID) triple plus its best-effort addresses.
///
/// Immutable once selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidate {
    /// Device kernel name
    pub device: String,
    /// Port number
    pub port: u8,
    /// GID table index; `None` on fabrics without a GID table
    pub gid_index: Option<u16>,
    /// IP address of the backing net device, when resolvable
    pub ip_addr: Option<String>,
    /// MAC address of the backing net device, when resolvable
    pub mac_addr: Option<String>,
}

/// Enumerates endpoint candidates and picks one usable triple.
#[derive(Debug, Clone, Default)]
pub struct EndpointSelector {
    /// Explicit device name
    device: Option<String>,
    /// Explicit port
    port: Option<u8>,
    /// Explicit GID index
    gid_index: Option<u16>,
    /// Only keep GIDs of this type (ignored when `gid_index` is explicit)
    gid_type: Option<GidType>,
}

impl EndpointSelector {
    /// Build a selector from the configuration bag.
    #[must_use]
    pub fn from_config(cfg: &TestConfig) -> Self {
        Self {
            device: cfg.device.clone(),
            port: cfg.port,
            gid_index: cfg.gid_index,
            gid_type: None,
        }
    }

    /// Restrict enumeration to GIDs of one type.
    #[must_use]
    pub fn with_gid_type(mut self, gid_type: GidType) -> Self {
        if self.gid_index.is_none() {
            self.gid_type = Some(gid_type);
        }
        self
    }

    /// Produce exactly one usable candidate, or a skip outcome when no
    /// candidate survives filtering. Selection is deterministic for
    /// unchanged inputs and hardware state.
    pub fn select(&self) -> TestkitResult<EndpointCandidate> {
        // Fully explicit triples are accepted unvalidated, the caller
        // asserts their correctness.
        if let (Some(device), Some(port), Some(gid_index)) =
            (self.device.as_deref(), self.port, self.gid_index)
        {
            let (ip_addr, mac_addr) = resolve_addresses(device, port);
            return Ok(EndpointCandidate {
                device: device.to_owned(),
                port,
                gid_index: Some(gid_index),
                ip_addr,
                mac_addr,
            });
        }

        let candidates = self.enumerate()?;
        choose(&candidates).cloned().ok_or_else(|| {
            TestkitError::skip("no supported port is up, can't run traffic")
        })
    }

    /// Enumerate every candidate that passes the port/GID filters.
    fn enumerate(&self) -> TestkitResult<Vec<EndpointCandidate>> {
        let mut candidates = Vec::new();
        match self.device.as_deref() {
            Some(device) => {
                let ctx = Context::open(Some(device))?;
                self.add_ports(&ctx, &mut candidates)?;
            }
            None => {
                let dev_list = DeviceList::available().map_err(TestkitError::Verbs)?;
                if dev_list.as_slice().is_empty() {
                    return Err(TestkitError::skip("no RDMA devices found"));
                }
                for dev in dev_list.as_slice() {
                    // A device that cannot be opened is no candidate, but it
                    // must not abort enumeration of the others.
                    let Ok(ctx) = Context::open(Some(dev.name())) else {
                        debug!("cannot open {}, skipping it", dev.name());
                        continue;
                    };
                    self.add_ports(&ctx, &mut candidates)?;
                }
            }
        }
        Ok(candidates)
    }

    /// Walk the requested port, or every physical port of the device.
    fn add_ports(
        &self,
        ctx: &Context,
        candidates: &mut Vec<EndpointCandidate>,
    ) -> TestkitResult<()> {
        match self.port {
            Some(port) => self.add_gids_per_port(ctx, port, candidates),
            None => {
                for port in 1..=ctx.phys_port_cnt() {
                    self.add_gids_per_port(ctx, port, candidates)?;
                }
                Ok(())
            }
        }
    }

    /// Walk one port's GID table, applying the filters of the selection
    /// algorithm.
    fn add_gids_per_port(
        &self,
        ctx: &Context,
        port: u8,
        candidates: &mut Vec<EndpointCandidate>,
    ) -> TestkitResult<()> {
        let port_attr = ctx.query_port(port).map_err(TestkitError::Verbs)?;
        // Ports which are not active can't run traffic.
        if port_attr.state != rdma_sys::ibv_port_state::IBV_PORT_ACTIVE {
            debug!("port {} of {} is not active", port, ctx.name());
            return Ok(());
        }
        // No GID table (non-RoCE fabric): the index is irrelevant.
        if port_attr.gid_tbl_len == 0_i32 {
            candidates.push(make_candidate(ctx.name(), port, None));
            return Ok(());
        }
        let is_eth = port_attr.link_layer == LINK_LAYER_ETHERNET;
        let hw_bug = has_roce_hw_bug(ctx.vendor_id(), ctx.vendor_part_id());
        for idx in 0..port_attr.gid_tbl_len.cast::<u16>() {
            let gid = ctx.query_gid(port, idx).map_err(TestkitError::Verbs)?;
            if gid.is_zero() {
                continue;
            }
            let gid_type = ctx.query_gid_type(port, idx);
            // RoCEv2 is broken on hardware-defect-flagged parts.
            if is_eth && hw_bug && gid_type == Some(GidType::RoceV2) {
                continue;
            }
            if let Some(wanted) = self.gid_type {
                if gid_type != Some(wanted) {
                    continue;
                }
            }
            candidates.push(make_candidate(ctx.name(), port, Some(idx)));
        }
        Ok(())
    }
}

/// Candidate selection: prefer the first IP-bearing candidate, since
/// connection-manager and multicast flows need a routable address; otherwise
/// take the first candidate overall.
fn choose(candidates: &[EndpointCandidate]) -> Option<&EndpointCandidate> {
    candidates
        .iter()
        .find(|candidate| candidate.ip_addr.is_some())
        .or_else(|| candidates.first())
}

/// Build a candidate, attaching IP/MAC best-effort.
fn make_candidate(device: &str, port: u8, gid_index: Option<u16>) -> EndpointCandidate {
    let (ip_addr, mac_addr) = resolve_addresses(device, port);
    EndpointCandidate {
        device: device.to_owned(),
        port,
        gid_index,
        ip_addr,
        mac_addr,
    }
}

/// Resolve the net device backing an RDMA device, then its IP and MAC.
/// Failures degrade the candidate to "address unknown", never abort
/// selection.
fn resolve_addresses(device: &str, _port: u8) -> (Option<String>, Option<String>) {
    let Some(netdev) = netdev_name(device) else {
        return (None, None);
    };
    (interface_ip(&netdev), interface_mac(&netdev))
}

/// The first net device registered under the RDMA device, from sysfs.
fn netdev_name(device: &str) -> Option<String> {
    let dir = format!("/sys/class/infiniband/{device}/device/net");
    let mut names: Vec<String> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| Some(entry.ok()?.file_name().to_string_lossy().into_owned()))
        .collect();
    names.sort();
    names.into_iter().next()
}

/// The interface's IP address. IPv4 wins when both families are configured;
/// link-local IPv6 carries a zone suffix so it stays routable.
fn interface_ip(netdev: &str) -> Option<String> {
    let netifas = local_ip_address::list_afinet_netifas().ok()?;
    let addrs: Vec<IpAddr> = netifas
        .into_iter()
        .filter(|(name, _)| name == netdev)
        .map(|(_, addr)| addr)
        .collect();
    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())?;
    let mut formatted = addr.to_string();
    if formatted.starts_with("fe80:") {
        formatted = format!("{formatted}%{netdev}");
    }
    Some(formatted)
}

/// The interface's MAC address from sysfs.
fn interface_mac(netdev: &str) -> Option<String> {
    fs::read_to_string(format!("/sys/class/net/{netdev}/address"))
        .ok()
        .map(|mac| mac.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(device: &str, ip: Option<&str>) -> EndpointCandidate {
        EndpointCandidate {
            device: device.to_owned(),
            port: 1,
            gid_index: Some(0),
            ip_addr: ip.map(ToOwned::to_owned),
            mac_addr: None,
        }
    }

    #[test]
    fn hw_bug_table_flags_cx3() {
        assert!(has_roce_hw_bug(MLNX_VENDOR_ID, CX3_MLNX_PART_ID));
        assert!(has_roce_hw_bug(MLNX_VENDOR_ID, CX3PRO_MLNX_PART_ID));
        assert!(!has_roce_hw_bug(MLNX_VENDOR_ID, 4115));
        assert!(!has_roce_hw_bug(0x8086, CX3_MLNX_PART_ID));
    }

    #[test]
    fn ip_bearing_candidate_preferred() {
        let candidates = vec![
            candidate("mlx5_0", None),
            candidate("mlx5_1", Some("192.168.3.7")),
            candidate("mlx5_2", Some("192.168.3.8")),
        ];
        let chosen = choose(&candidates).unwrap();
        assert_eq!(chosen.device, "mlx5_1");
    }

    #[test]
    fn first_candidate_without_any_ip() {
        let candidates = vec![candidate("mlx5_0", None), candidate("mlx5_1", None)];
        assert_eq!(choose(&candidates).unwrap().device, "mlx5_0");
    }

    #[test]
    fn empty_candidate_set_selects_nothing() {
        assert!(choose(&[]).is_none());
    }

    #[test]
    fn selection_is_deterministic() {
        let candidates = vec![
            candidate("mlx5_0", None),
            candidate("mlx5_1", Some("10.0.0.1")),
        ];
        let first = choose(&candidates).cloned();
        let second = choose(&candidates).cloned();
        assert_eq!(first, second);
    }

    #[test]
    fn explicit_triple_accepted_without_validation() {
        let selector = EndpointSelector {
            device: Some("fake0".to_owned()),
            port: Some(1),
            gid_index: Some(3),
            gid_type: None,
        };
        let ep = selector.select().unwrap();
        assert_eq!(ep.device, "fake0");
        assert_eq!(ep.port, 1);
        assert_eq!(ep.gid_index, Some(3));
    }

    #[test]
    fn no_hardware_reports_skip() {
        let selector = EndpointSelector::default();
        match selector.select() {
            Ok(ep) => assert!(!ep.device.is_empty()),
            Err(err) => assert!(err.is_skip() || matches!(err, TestkitError::Verbs(_))),
        }
    }
}
