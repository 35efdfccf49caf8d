//! The typed hierarchy of connection resource bundles.
//!
//! A bundle exclusively owns a device context and everything derived from it
//! (PD, CQ, MR, QPs, optional SRQ). Variants differ in how queue pairs are
//! created and driven to the ready-to-send state; the shared fields live in
//! [`TrafficFields`] and the fixed hook set in [`Transport`].

mod raw;
mod rc;
mod ud;
mod xrc;

pub use raw::RawResources;
pub use rc::RcResources;
pub use ud::UdResources;
pub use xrc::{XrcPairId, XrcResources};

use crate::access::{atomic_access, default_mr_access, odp_access, AccessFlag};
use crate::completion_queue::CompletionQueue;
use crate::context::Context;
use crate::endpoint::EndpointCandidate;
use crate::error::{TestkitError, TestkitResult};
use crate::memory_region::{MappedBuffer, MemoryRegion, PrefetchAdvice};
use crate::protection_domain::ProtectionDomain;
use crate::queue_pair::{QpIdentity, QueuePair};
use crate::srq::SharedReceiveQueue;

use enumflags2::BitFlags;
use serde::{Deserialize, Serialize};

use std::sync::Arc;

/// Global-route header bytes prepended to datagram receives.
pub const GRH_SIZE: usize = 40;
/// Default message size.
pub const DEFAULT_MSG_SIZE: usize = 1024;
/// Default per-queue depth, also the CQ depth.
pub const DEFAULT_NUM_MSGS: u32 = 1000;
/// Hugetlb mapping length used when huge pages back an ODP region.
pub const HUGE_PAGE_SIZE: usize = 0x0020_0000;

/// When an ODP prefetch runs relative to traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchMode {
    /// On the scenario thread before traffic
    Sync,
    /// On a helper thread joined before traffic
    Async,
}

/// How the bundle's memory region is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrSpec {
    /// Heap buffer with the configured access set
    Regular,
    /// On-demand-paging registration
    Odp {
        /// Register over a fresh anonymous mapping so first device access
        /// faults
        user_buffer: bool,
        /// Back the mapping with huge pages
        huge: bool,
        /// Register the whole address space instead of one buffer
        implicit: bool,
        /// Also register a second non-ODP region for simultaneous use
        mixed: bool,
    },
}

/// Configuration of one resource bundle.
#[derive(Debug, Clone, Copy)]
pub struct BundleConfig {
    /// Message size of the scenario
    pub msg_size: usize,
    /// Number of queue pairs
    pub qp_count: usize,
    /// Queue and CQ depth
    pub num_msgs: u32,
    /// Attach the queue pairs to a shared receive queue
    pub with_srq: bool,
    /// Access flags granted to the queue pairs
    pub qp_access: BitFlags<AccessFlag>,
    /// Access flags of the memory region
    pub mr_access: BitFlags<AccessFlag>,
    /// Memory registration flavor
    pub mr_spec: MrSpec,
    /// Initiator rd/atomic depth
    pub max_rd_atomic: u8,
    /// Responder rd/atomic depth
    pub max_dest_rd_atomic: u8,
    /// Prefetch the ODP region before traffic
    pub prefetch: Option<(PrefetchMode, PrefetchAdvice)>,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            msg_size: DEFAULT_MSG_SIZE,
            qp_count: 1,
            num_msgs: DEFAULT_NUM_MSGS,
            with_srq: false,
            qp_access: AccessFlag::LocalWrite
                | AccessFlag::RemoteRead
                | AccessFlag::RemoteWrite
                | AccessFlag::RemoteAtomic,
            mr_access: default_mr_access(),
            mr_spec: MrSpec::Regular,
            max_rd_atomic: crate::queue_pair::DEFAULT_MAX_RD_ATOMIC,
            max_dest_rd_atomic: crate::queue_pair::DEFAULT_MAX_DEST_RD_ATOMIC,
            prefetch: None,
        }
    }
}

impl BundleConfig {
    /// Preset for remote atomic scenarios: 8-byte operands, atomic access on
    /// both the queue pairs and the region.
    #[must_use]
    pub fn atomic() -> Self {
        Self {
            msg_size: 8,
            qp_access: atomic_access(),
            mr_access: atomic_access(),
            ..Self::default()
        }
    }

    /// Preset for XRC scenarios: two send/receive couples per bundle.
    #[must_use]
    pub fn xrc() -> Self {
        Self {
            qp_count: 2,
            ..Self::default()
        }
    }

    /// Preset for on-demand-paging scenarios.
    #[must_use]
    pub fn odp(spec: MrSpec) -> Self {
        Self {
            qp_access: odp_access(),
            mr_access: odp_access(),
            mr_spec: spec,
            ..Self::default()
        }
    }
}

/// Remote key and buffer address copied from the opposite bundle.
///
/// Set exactly once per test by [`sync_remote_attrs`]; scenarios probing
/// error handling corrupt the fields deliberately afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerBinding {
    /// Remote key of the peer's MR
    pub rkey: u32,
    /// Address of the peer's buffer
    pub raddr: u64,
}

/// The peer identities of a single-QP-list transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpEndpoints {
    /// One identity per queue pair, in creation order
    pub ids: Vec<QpIdentity>,
}

/// Base aggregator: an opened context and a protection domain.
#[derive(Debug)]
pub struct BaseResources {
    /// The endpoint the bundle was built for
    pub endpoint: EndpointCandidate,
    /// Exclusive device context
    pub ctx: Arc<Context>,
    /// Protection domain
    pub pd: Arc<ProtectionDomain>,
}

impl BaseResources {
    /// Open the device named by the endpoint and allocate a PD.
    pub fn open(endpoint: &EndpointCandidate) -> TestkitResult<Self> {
        let ctx = Context::open(Some(&endpoint.device))?;
        let pd = ProtectionDomain::create(&ctx)?;
        Ok(Self {
            endpoint: endpoint.clone(),
            ctx,
            pd,
        })
    }
}

/// Fields shared by every traffic-capable bundle.
#[derive(Debug)]
pub struct TrafficFields {
    /// Context + PD
    pub base: BaseResources,
    /// Bundle configuration
    pub cfg: BundleConfig,
    /// Local identifier of the chosen port
    pub lid: u16,
    /// Completion queue shared by all queue pairs
    pub cq: Arc<CompletionQueue>,
    /// Optional shared receive queue
    pub srq: Option<Arc<SharedReceiveQueue>>,
    /// The scenario's memory region
    pub mr: MemoryRegion,
    /// Second, non-ODP region for mixed scenarios
    pub mixed_mr: Option<MemoryRegion>,
    /// Queue pairs, `cfg.qp_count` of them
    pub qps: Vec<QueuePair>,
    /// Locally generated 24-bit PSNs, one per queue pair
    pub psns: Vec<u32>,
    /// Peer queue pair identities, set by `pre_run`
    pub peer: Option<QpEndpoints>,
    /// Remote key/address binding, set by `sync_remote_attrs`
    pub binding: Option<PeerBinding>,
    /// Overrides `mr.lkey()` to probe invalid-lkey handling
    pub lkey_override: Option<u32>,
}

impl TrafficFields {
    /// Open context/PD, query the port and create the CQ and MR.
    /// `mr_len` differs from the message size for datagram transports.
    pub(crate) fn open(
        endpoint: &EndpointCandidate,
        cfg: BundleConfig,
        mr_len: usize,
    ) -> TestkitResult<Self> {
        let base = BaseResources::open(endpoint)?;
        let port_attr = base.ctx.query_port(endpoint.port).map_err(TestkitError::Verbs)?;
        let cq = CompletionQueue::create(&base.ctx, cfg.num_msgs)?;
        let (mr, mixed_mr) = create_mr(&base.pd, mr_len, &cfg)?;
        Ok(Self {
            base,
            cfg,
            lid: port_attr.lid,
            cq,
            srq: None,
            mr,
            mixed_mr,
            qps: Vec::new(),
            psns: Vec::new(),
            peer: None,
            binding: None,
            lkey_override: None,
        })
    }

    /// The lkey traffic should use, honoring a deliberate override.
    #[inline]
    #[must_use]
    pub fn mr_lkey(&self) -> u32 {
        self.lkey_override.unwrap_or_else(|| self.mr.lkey())
    }

    /// The peer binding; an error before `sync_remote_attrs` ran.
    pub fn binding(&self) -> TestkitResult<PeerBinding> {
        self.binding.ok_or(TestkitError::PeerNotBound)
    }

    /// The exchanged peer identities; an error before `pre_run` ran.
    pub(crate) fn peer(&self) -> TestkitResult<&QpEndpoints> {
        self.peer.as_ref().ok_or(TestkitError::PeerNotBound)
    }

    /// The local identities handed to the peer.
    #[must_use]
    pub fn local_endpoints(&self) -> QpEndpoints {
        QpEndpoints {
            ids: self
                .qps
                .iter()
                .zip(&self.psns)
                .map(|(qp, psn)| QpIdentity {
                    qp_num: qp.qp_num(),
                    psn: *psn,
                })
                .collect(),
        }
    }

    /// Run the configured ODP prefetch, if any.
    pub fn run_prefetch(&self) -> TestkitResult<()> {
        let Some((mode, advice)) = self.cfg.prefetch else {
            return Ok(());
        };
        match mode {
            PrefetchMode::Sync => self.mr.prefetch(advice).map_err(TestkitError::Verbs),
            PrefetchMode::Async => {
                // The advise call has no thread affinity; exercising it off
                // the scenario thread mirrors the asynchronous flavor.
                std::thread::scope(|scope| {
                    scope
                        .spawn(|| self.mr.prefetch(advice))
                        .join()
                        .unwrap_or_else(|_| {
                            Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "prefetch thread panicked",
                            ))
                        })
                })
                .map_err(TestkitError::Verbs)
            }
        }
    }
}

/// RoCE transports require a resolved GID index; callers that could not
/// resolve one get a skip outcome before any resource is created.
pub(crate) fn require_gid_index(endpoint: &EndpointCandidate) -> TestkitResult<u16> {
    endpoint
        .gid_index
        .ok_or_else(|| TestkitError::skip("no relevant GID found"))
}

/// MR creation dispatch over the configured registration flavor.
fn create_mr(
    pd: &Arc<ProtectionDomain>,
    len: usize,
    cfg: &BundleConfig,
) -> TestkitResult<(MemoryRegion, Option<MemoryRegion>)> {
    match cfg.mr_spec {
        MrSpec::Regular => Ok((MemoryRegion::register(pd, len, cfg.mr_access)?, None)),
        MrSpec::Odp {
            user_buffer,
            huge,
            implicit,
            mixed,
        } => {
            let mut access = cfg.mr_access | AccessFlag::OnDemand;
            if huge {
                access |= AccessFlag::HugeTlb;
            }
            let mapped = if user_buffer {
                let map_len = if huge { HUGE_PAGE_SIZE } else { len };
                match MappedBuffer::alloc(map_len, huge) {
                    Ok(mapped) => Some(mapped),
                    // No hugetlb pool configured on this host.
                    Err(err) if huge => {
                        return Err(TestkitError::skip(format!("no huge pages: {err}")))
                    }
                    Err(err) => {
                        return Err(crate::error::classify_create_err(err, "mmap ODP buffer"))
                    }
                }
            } else {
                None
            };
            let mr = if implicit {
                MemoryRegion::register_implicit(pd, access, mapped, len)?
            } else {
                match mapped {
                    Some(mapped) => MemoryRegion::register_mapped(pd, mapped, len, access)?,
                    None => MemoryRegion::register(pd, len, access)?,
                }
            };
            let mixed_mr = if mixed {
                Some(MemoryRegion::register(pd, len, default_mr_access())?)
            } else {
                None
            };
            Ok((mr, mixed_mr))
        }
    }
}

/// The fixed method set every transport variant provides.
pub trait Transport: Sized {
    /// The identity bundle exchanged with the peer before `pre_run`.
    type PeerIds: Clone;

    /// Build the bundle: context, PD, CQ, MR, queue pairs, through INIT.
    fn establish(endpoint: &EndpointCandidate, cfg: BundleConfig) -> TestkitResult<Self>;

    /// Shared fields.
    fn fields(&self) -> &TrafficFields;

    /// Shared fields, mutably.
    fn fields_mut(&mut self) -> &mut TrafficFields;

    /// The identities this bundle hands to its peer.
    fn local_ids(&self) -> Self::PeerIds;

    /// Consume the peer identities and advance every queue pair to its
    /// terminal state. Must run after the out-of-band exchange and before
    /// any traffic.
    fn pre_run(&mut self, peer: Self::PeerIds) -> TestkitResult<()>;

    /// The first queue pair, the one most scenarios drive.
    fn qp(&self) -> &QueuePair {
        &self.fields().qps[0]
    }

    /// The lkey traffic uses.
    fn mr_lkey(&self) -> u32 {
        self.fields().mr_lkey()
    }
}

/// A client/server bundle pair wired to each other.
#[derive(Debug)]
pub struct Pair<T> {
    /// The requesting side
    pub client: T,
    /// The responding side
    pub server: T,
}

/// Build both bundles, exchange identities, advance to ready and copy the
/// remote key/address both ways.
///
/// Mirrors the per-test setup flow: any creation failure of the unsupported
/// class arrives here as a skip outcome and propagates unchanged.
pub fn create_pair<T: Transport>(
    endpoint: &EndpointCandidate,
    cfg: &BundleConfig,
) -> TestkitResult<Pair<T>> {
    create_pair_with_sync::<T>(endpoint, cfg, true)
}

/// [`create_pair`] with control over the remote-attribute exchange, for
/// transports whose scenarios do not use one-sided operations.
pub fn create_pair_with_sync<T: Transport>(
    endpoint: &EndpointCandidate,
    cfg: &BundleConfig,
    sync_attrs: bool,
) -> TestkitResult<Pair<T>> {
    let mut client = T::establish(endpoint, *cfg)?;
    let mut server = T::establish(endpoint, *cfg)?;
    let client_ids = client.local_ids();
    let server_ids = server.local_ids();
    client.pre_run(server_ids)?;
    server.pre_run(client_ids)?;
    let mut pair = Pair { client, server };
    if sync_attrs {
        sync_remote_attrs(&mut pair);
    }
    Ok(pair)
}

/// Copy the remote key and buffer address from the opposite bundle, the
/// step that makes one-sided operations legal.
pub fn sync_remote_attrs<T: Transport>(pair: &mut Pair<T>) {
    let client_binding = PeerBinding {
        rkey: pair.server.fields().mr.rkey(),
        raddr: pair.server.fields().mr.addr(),
    };
    let server_binding = PeerBinding {
        rkey: pair.client.fields().mr.rkey(),
        raddr: pair.client.fields().mr.addr(),
    };
    pair.client.fields_mut().binding = Some(client_binding);
    pair.server.fields_mut().binding = Some(server_binding);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_preset_narrows_access() {
        let cfg = BundleConfig::atomic();
        assert_eq!(cfg.msg_size, 8);
        assert_eq!(cfg.qp_access, atomic_access());
        assert_eq!(cfg.mr_access, atomic_access());
    }

    #[test]
    fn odp_preset_carries_on_demand_spec() {
        let spec = MrSpec::Odp {
            user_buffer: true,
            huge: false,
            implicit: false,
            mixed: true,
        };
        let cfg = BundleConfig::odp(spec);
        assert_eq!(cfg.mr_spec, spec);
        assert!(cfg.qp_access.contains(AccessFlag::OnDemand));
    }

    #[test]
    fn default_config_shape() {
        let cfg = BundleConfig::default();
        assert_eq!(cfg.qp_count, 1);
        assert_eq!(cfg.msg_size, DEFAULT_MSG_SIZE);
        assert!(!cfg.with_srq);
        assert!(cfg.prefetch.is_none());
    }
}
