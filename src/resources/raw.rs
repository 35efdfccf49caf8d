use super::{BundleConfig, TrafficFields, Transport};
use crate::endpoint::EndpointCandidate;
use crate::error::{TestkitError, TestkitResult};
use crate::queue_pair::{random_psn, QpCapacity, QpKind, QueuePair, DEFAULT_PKEY_INDEX};

/// Raw-packet resources. No handshake and no peer exchange at all; the
/// queue pairs reach RTS at creation. Raw packet QPs do not need a GID
/// index, so construction never gates on one.
#[derive(Debug)]
pub struct RawResources {
    /// Shared traffic fields
    fields: TrafficFields,
}

impl Transport for RawResources {
    type PeerIds = ();

    fn establish(endpoint: &EndpointCandidate, cfg: BundleConfig) -> TestkitResult<Self> {
        let msg_size = cfg.msg_size;
        let mut fields = TrafficFields::open(endpoint, cfg, msg_size)?;
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
                QpKind::RawPacket,
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
        Ok(Self { fields })
    }

    fn fields(&self) -> &TrafficFields {
        &self.fields
    }

    fn fields_mut(&mut self) -> &mut TrafficFields {
        &mut self.fields
    }

    fn local_ids(&self) {}

    /// Nothing to exchange and nothing to transition.
    fn pre_run(&mut self, (): ()) -> TestkitResult<()> {
        Ok(())
    }
}
