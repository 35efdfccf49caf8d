use super::{require_gid_index, BundleConfig, TrafficFields, Transport};
use crate::access::AccessFlag;
use crate::endpoint::EndpointCandidate;
use crate::error::{TestkitError, TestkitResult};
use crate::queue_pair::{
    random_psn, AddressHandleBuilder, GlobalRouteBuilder, QueuePair, RemoteQueueAttrBuilder,
    SendQueueAttrBuilder, DEFAULT_PKEY_INDEX,
};
use crate::srq::SharedReceiveQueue;
use crate::xrc::XrcDomain;

use clippy_utilities::Cast;
use enumflags2::BitFlags;
use serde::{Deserialize, Serialize};

use std::io;
use std::sync::Arc;

/// Identity of one XRC send/receive queue-pair couple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XrcPairId {
    /// Receive-half queue pair number
    pub recv_qp_num: u32,
    /// Send-half queue pair number
    pub send_qp_num: u32,
    /// Shared receive queue number messages to this side target
    pub srq_num: u32,
    /// Locally generated 24-bit PSN of the couple
    pub psn: u32,
}

/// Extended-reliable-connected resources.
///
/// One domain fd is shared across the send and receive queue-pair lists;
/// receives flow through an XRC SRQ. `pre_run` cross-wires the lists: the
/// receive half targets the peer's send queue pair number and vice versa,
/// because XRC separates inbound and outbound identity from the shared
/// receive queue.
#[derive(Debug)]
pub struct XrcResources {
    /// Shared traffic fields; `fields.qps` stays empty, the halves live in
    /// the two lists below
    fields: TrafficFields,
    /// The shared domain, kept alive for both queue-pair lists
    _xrcd: Arc<XrcDomain>,
    /// Receive-half queue pairs, domain-attached
    recv_qps: Vec<QueuePair>,
    /// Send-half queue pairs, PD-attached
    send_qps: Vec<QueuePair>,
    /// Peer couples, set by `pre_run`
    peer: Option<Vec<XrcPairId>>,
    /// Queue number of the local shared receive queue
    srq_num: u32,
    /// Resolved GID index
    gid_index: u16,
}

impl XrcResources {
    /// The shared receive queue receives are posted to.
    pub fn srq(&self) -> TestkitResult<&SharedReceiveQueue> {
        self.fields
            .srq
            .as_deref()
            .ok_or_else(|| TestkitError::skip("XRC bundle lost its SRQ"))
    }

    /// Send-half queue pairs.
    #[inline]
    #[must_use]
    pub fn send_qps(&self) -> &[QueuePair] {
        &self.send_qps
    }

    /// The exchanged peer couples; an error before `pre_run` ran.
    pub fn peer(&self) -> TestkitResult<&[XrcPairId]> {
        self.peer.as_deref().ok_or(TestkitError::PeerNotBound)
    }

    /// Receive-half queue pairs.
    #[inline]
    #[must_use]
    pub fn recv_qps(&self) -> &[QueuePair] {
        &self.recv_qps
    }

    /// Advance both queue-pair lists to RTS with swapped peer numbers.
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

        let peer = self.peer.clone().ok_or(TestkitError::PeerNotBound)?;
        for i in 0..self.fields.cfg.qp_count {
            let sq = SendQueueAttrBuilder::default()
                .sq_psn(peer[i].psn)
                .build()
                .map_err(io::Error::from)?;
            // Receive half talks to the peer's send half.
            let remote = RemoteQueueAttrBuilder::default()
                .dest_qp_num(peer[i].send_qp_num)
                .rq_psn(self.fields.psns[i])
                .address(address)
                .build()
                .map_err(io::Error::from)?;
            self.recv_qps[i]
                .connect(&remote, &sq)
                .map_err(TestkitError::Verbs)?;
            // Send half talks to the peer's receive half.
            let remote = RemoteQueueAttrBuilder::default()
                .dest_qp_num(peer[i].recv_qp_num)
                .rq_psn(self.fields.psns[i])
                .address(address)
                .build()
                .map_err(io::Error::from)?;
            self.send_qps[i]
                .connect(&remote, &sq)
                .map_err(TestkitError::Verbs)?;
        }
        Ok(())
    }
}

impl Transport for XrcResources {
    type PeerIds = Vec<XrcPairId>;

    fn establish(endpoint: &EndpointCandidate, cfg: BundleConfig) -> TestkitResult<Self> {
        let gid_index = require_gid_index(endpoint)?;
        let msg_size = cfg.msg_size;
        let mut fields = TrafficFields::open(endpoint, cfg, msg_size)?;
        let xrcd = XrcDomain::open(&fields.base.ctx)?;

        let recv_access = AccessFlag::LocalWrite
            | AccessFlag::RemoteRead
            | AccessFlag::RemoteWrite
            | AccessFlag::RemoteAtomic;
        let mut recv_qps = Vec::with_capacity(fields.cfg.qp_count);
        let mut send_qps = Vec::with_capacity(fields.cfg.qp_count);
        for _ in 0..fields.cfg.qp_count {
            let recv_qp = QueuePair::create_xrc_recv(&fields.base.pd, &xrcd)?;
            recv_qp
                .modify_to_init(recv_access, endpoint.port, DEFAULT_PKEY_INDEX)
                .map_err(TestkitError::Verbs)?;
            recv_qps.push(recv_qp);

            let send_qp =
                QueuePair::create_xrc_send(&fields.base.pd, &fields.cq, fields.cfg.num_msgs)?;
            send_qp
                .modify_to_init(BitFlags::empty(), endpoint.port, DEFAULT_PKEY_INDEX)
                .map_err(TestkitError::Verbs)?;
            send_qps.push(send_qp);

            fields.psns.push(random_psn());
        }

        let srq_depth = fields.cfg.num_msgs * fields.cfg.qp_count.cast::<u32>();
        let srq = SharedReceiveQueue::create_xrc(&fields.base.pd, &xrcd, &fields.cq, srq_depth)?;
        let srq_num = srq.srq_num().map_err(TestkitError::Verbs)?;
        fields.srq = Some(srq);

        Ok(Self {
            fields,
            _xrcd: xrcd,
            recv_qps,
            send_qps,
            peer: None,
            srq_num,
            gid_index,
        })
    }

    fn fields(&self) -> &TrafficFields {
        &self.fields
    }

    fn fields_mut(&mut self) -> &mut TrafficFields {
        &mut self.fields
    }

    fn local_ids(&self) -> Vec<XrcPairId> {
        self.recv_qps
            .iter()
            .zip(&self.send_qps)
            .zip(&self.fields.psns)
            .map(|((recv_qp, send_qp), psn)| XrcPairId {
                recv_qp_num: recv_qp.qp_num(),
                send_qp_num: send_qp.qp_num(),
                srq_num: self.srq_num,
                psn: *psn,
            })
            .collect()
    }

    fn pre_run(&mut self, peer: Vec<XrcPairId>) -> TestkitResult<()> {
        self.peer = Some(peer);
        self.to_rts()
    }

    /// The first send-half queue pair is the one scenarios drive.
    fn qp(&self) -> &QueuePair {
        &self.send_qps[0]
    }
}
