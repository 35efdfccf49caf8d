use super::{require_gid_index, BundleConfig, QpEndpoints, TrafficFields, Transport};
use crate::endpoint::EndpointCandidate;
use crate::error::{TestkitError, TestkitResult};
use crate::queue_pair::{
    random_psn, AddressHandleBuilder, GlobalRouteBuilder, QpCapacity, QpKind, QueuePair,
    RemoteQueueAttrBuilder, SendQueueAttrBuilder, DEFAULT_PKEY_INDEX,
};
use crate::srq::SharedReceiveQueue;

use clippy_utilities::Cast;

use std::io;

/// Reliable-connected resources: queue pairs negotiate the full
/// RESET -> INIT -> RTR -> RTS handshake before traffic.
#[derive(Debug)]
pub struct RcResources {
    /// Shared traffic fields
    fields: TrafficFields,
    /// Resolved GID index, required for RoCE transports
    gid_index: u16,
}

impl RcResources {
    /// Advance every queue pair to RTS using the exchanged peer identities.
    fn to_rts(&mut self) -> TestkitResult<()> {
        let endpoint = &self.fields.base.endpoint;
        let gid = self
            .fields
            .base
            .ctx
            .query_gid(endpoint.port, self.gid_index)
            .map_err(TestkitError::Verbs)?;
        let grh = GlobalRouteBuilder::default()
            .dgid(gid)
            .sgid_index(self.gid_index.cast())
            .build()
            .map_err(io::Error::from)?;
        let address = AddressHandleBuilder::default()
            .grh(grh)
            .dest_lid(self.fields.lid)
            .port_num(endpoint.port)
            .build()
            .map_err(io::Error::from)?;

        let peer = self.fields.peer()?.clone();
        for (i, qp) in self.fields.qps.iter().enumerate() {
            let remote = RemoteQueueAttrBuilder::default()
                .dest_qp_num(peer.ids[i].qp_num)
                .rq_psn(self.fields.psns[i])
                .max_dest_rd_atomic(self.fields.cfg.max_dest_rd_atomic)
                .address(address)
                .build()
                .map_err(io::Error::from)?;
            let sq = SendQueueAttrBuilder::default()
                .sq_psn(peer.ids[i].psn)
                .max_rd_atomic(self.fields.cfg.max_rd_atomic)
                .build()
                .map_err(io::Error::from)?;
            qp.connect(&remote, &sq).map_err(TestkitError::Verbs)?;
        }
        Ok(())
    }
}

impl Transport for RcResources {
    type PeerIds = QpEndpoints;

    fn establish(endpoint: &EndpointCandidate, cfg: BundleConfig) -> TestkitResult<Self> {
        let gid_index = require_gid_index(endpoint)?;
        let msg_size = cfg.msg_size;
        let mut fields = TrafficFields::open(endpoint, cfg, msg_size)?;
        if fields.cfg.with_srq {
            let max_wr = fields.cfg.num_msgs * fields.cfg.qp_count.cast::<u32>();
            fields.srq = Some(SharedReceiveQueue::create(&fields.base.pd, max_wr)?);
        }
        let sge_per_wr = if fields.mixed_mr.is_some() { 2 } else { 1 };
        for _ in 0..fields.cfg.qp_count {
            let cap = QpCapacity {
                max_send_wr: fields.cfg.num_msgs,
                max_recv_wr: fields.cfg.num_msgs,
                max_send_sge: sge_per_wr,
                max_recv_sge: sge_per_wr,
            };
            let qp = QueuePair::create(
                &fields.base.pd,
                &fields.cq,
                fields.srq.as_ref(),
                QpKind::Rc,
                cap,
                false,
            )?;
            qp.modify_to_init(fields.cfg.qp_access, endpoint.port, DEFAULT_PKEY_INDEX)
                .map_err(TestkitError::Verbs)?;
            fields.qps.push(qp);
            fields.psns.push(random_psn());
        }
        Ok(Self { fields, gid_index })
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

    fn pre_run(&mut self, peer: QpEndpoints) -> TestkitResult<()> {
        self.fields.peer = Some(peer);
        self.to_rts()
    }
}
