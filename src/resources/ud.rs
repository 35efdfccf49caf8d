use super::{
    require_gid_index, BundleConfig, MrSpec, QpEndpoints, TrafficFields, Transport, GRH_SIZE,
};
use crate::access::AccessFlag;
use crate::endpoint::EndpointCandidate;
use crate::error::{TestkitError, TestkitResult};
use crate::memory_region::{MappedBuffer, MemoryRegion};
use crate::queue_pair::{random_psn, QpCapacity, QpKind, QueuePair, DEFAULT_PKEY_INDEX};

/// Unreliable-datagram resources. There is no connection handshake; the
/// queue pairs go straight to RTS at creation and receives carry a 40-byte
/// global-route header in front of the payload.
#[derive(Debug)]
pub struct UdResources {
    /// Shared traffic fields; the MR has GRH headroom
    fields: TrafficFields,
    /// Separate demand-paged send region for ODP scenarios
    send_mr: Option<MemoryRegion>,
}

impl UdResources {
    /// The region sends are built from: the dedicated ODP send region when
    /// present, otherwise the shared one.
    #[inline]
    #[must_use]
    pub fn send_mr(&self) -> &MemoryRegion {
        self.send_mr.as_ref().unwrap_or(&self.fields.mr)
    }

    /// Mutable access to the send region.
    #[inline]
    #[must_use]
    pub fn send_mr_mut(&mut self) -> &mut MemoryRegion {
        self.send_mr.as_mut().unwrap_or(&mut self.fields.mr)
    }
}

impl Transport for UdResources {
    type PeerIds = QpEndpoints;

    fn establish(endpoint: &EndpointCandidate, cfg: BundleConfig) -> TestkitResult<Self> {
        let _gid_index = require_gid_index(endpoint)?;
        let mr_len = cfg.msg_size + GRH_SIZE;

        // Datagram receives always land in a plainly registered region; ODP
        // affects the send side only.
        let odp_spec = match cfg.mr_spec {
            MrSpec::Odp { user_buffer, .. } => Some(user_buffer),
            MrSpec::Regular => None,
        };
        let mut plain_cfg = cfg;
        plain_cfg.mr_spec = MrSpec::Regular;
        plain_cfg.mr_access = AccessFlag::LocalWrite.into();
        let mut fields = TrafficFields::open(endpoint, plain_cfg, mr_len)?;

        let send_mr = match odp_spec {
            None => None,
            Some(user_buffer) => {
                let access = AccessFlag::LocalWrite | AccessFlag::OnDemand;
                let mr = if user_buffer {
                    let mapped = MappedBuffer::alloc(mr_len, false)
                        .map_err(|err| crate::error::classify_create_err(err, "mmap ODP buffer"))?;
                    MemoryRegion::register_mapped(&fields.base.pd, mapped, mr_len, access)?
                } else {
                    MemoryRegion::register(&fields.base.pd, mr_len, access)?
                };
                Some(mr)
            }
        };

        for _ in 0..fields.cfg.qp_count {
            let cap = QpCapacity {
                max_send_wr: fields.cfg.num_msgs,
                max_recv_wr: fields.cfg.num_msgs,
                ..QpCapacity::default()
            };
            let qp = QueuePair::create(
                &fields.base.pd,
                &fields.cq,
                fields.srq.as_ref(),
                QpKind::Ud,
                cap,
                false,
            )?;
            let psn = random_psn();
            qp.modify_to_init(fields.cfg.qp_access, endpoint.port, DEFAULT_PKEY_INDEX)
                .map_err(TestkitError::Verbs)?;
            qp.ready_without_handshake(psn).map_err(TestkitError::Verbs)?;
            fields.qps.push(qp);
            fields.psns.push(psn);
        }
        Ok(Self { fields, send_mr })
    }

    fn fields(&self) -> &TrafficFields {
        &self.fields
    }

    fn fields_mut(&mut self) -> &mut TrafficFields {
        &mut self.fields
    }

    fn local_ids(&self) -> QpEndpoints {
        self.fields.local_endpoints()
    }

    /// Datagram queue pairs are already at RTS; only the peer identities are
    /// recorded so the traffic driver can address its sends.
    fn pre_run(&mut self, peer: QpEndpoints) -> TestkitResult<()> {
        self.fields.peer = Some(peer);
        Ok(())
    }
}
