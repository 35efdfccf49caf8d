use crate::access::{flags_into_ibv_access, AccessFlag};
use crate::completion_queue::CompletionQueue;
use crate::error::{classify_create_err, log_last_os_err, log_ret_last_os_err, TestkitResult};
use crate::gid::Gid;
use crate::protection_domain::ProtectionDomain;
use crate::srq::SharedReceiveQueue;
use crate::wr::{RecvWr, SendWr};
use crate::xrc::XrcDomain;

use clippy_utilities::Cast;
use derive_builder::Builder;
use enumflags2::BitFlags;
use getset::{Getters, Setters};
use parking_lot::RwLock;
use rdma_sys::{
    ibv_ah, ibv_ah_attr, ibv_create_ah, ibv_create_qp, ibv_create_qp_ex, ibv_destroy_ah,
    ibv_destroy_qp, ibv_global_route, ibv_modify_qp,
    ibv_mtu, ibv_post_recv, ibv_post_send, ibv_qp, ibv_qp_attr, ibv_qp_attr_mask,
    ibv_qp_init_attr, ibv_qp_init_attr_ex, ibv_qp_init_attr_mask, ibv_qp_state, ibv_qp_type,
    ibv_recv_wr, ibv_send_wr,
};
use serde::{Deserialize, Serialize};

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// Path MTU used by connected transports.
pub(crate) const DEFAULT_PATH_MTU: Mtu = Mtu::Mtu1024;
/// Responder incoming rd/atomic depth.
pub(crate) const DEFAULT_MAX_DEST_RD_ATOMIC: u8 = 1;
/// Initiator outstanding rd/atomic depth.
pub(crate) const DEFAULT_MAX_RD_ATOMIC: u8 = 1;
/// Receiver-not-ready NAK timer value.
pub(crate) const DEFAULT_MIN_RNR_TIMER: u8 = 12;
/// Transport retry count.
pub(crate) const DEFAULT_RETRY_CNT: u8 = 7;
/// RNR retry count.
pub(crate) const DEFAULT_RNR_RETRY: u8 = 7;
/// ACK timeout exponent.
pub(crate) const DEFAULT_TIMEOUT: u8 = 14;
/// Fixed queue key for unreliable-datagram queue pairs.
pub(crate) const UD_QKEY: u32 = 0x1111_1111;
/// PKEY table index used everywhere; index 0 is always valid.
pub(crate) const DEFAULT_PKEY_INDEX: u16 = 0;
/// GRH hop limit.
const DEFAULT_HOP_LIMIT: u8 = 0xff;

/// Path MTU values of `ibv_mtu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtu {
    /// 256 bytes
    Mtu256,
    /// 512 bytes
    Mtu512,
    /// 1024 bytes
    Mtu1024,
    /// 2048 bytes
    Mtu2048,
    /// 4096 bytes
    Mtu4096,
}

impl From<Mtu> for u32 {
    #[inline]
    fn from(mtu: Mtu) -> Self {
        match mtu {
            Mtu::Mtu256 => ibv_mtu::IBV_MTU_256,
            Mtu::Mtu512 => ibv_mtu::IBV_MTU_512,
            Mtu::Mtu1024 => ibv_mtu::IBV_MTU_1024,
            Mtu::Mtu2048 => ibv_mtu::IBV_MTU_2048,
            Mtu::Mtu4096 => ibv_mtu::IBV_MTU_4096,
        }
    }
}

/// The transport service type of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpKind {
    /// Reliable connected
    Rc,
    /// Unreliable datagram
    Ud,
    /// Raw packet
    RawPacket,
    /// XRC send half
    XrcSend,
    /// XRC receive half
    XrcRecv,
}

impl QpKind {
    /// The matching `ibv_qp_type` value.
    fn ibv_type(self) -> u32 {
        match self {
            Self::Rc => ibv_qp_type::IBV_QPT_RC,
            Self::Ud => ibv_qp_type::IBV_QPT_UD,
            Self::RawPacket => ibv_qp_type::IBV_QPT_RAW_PACKET,
            Self::XrcSend => ibv_qp_type::IBV_QPT_XRC_SEND,
            Self::XrcRecv => ibv_qp_type::IBV_QPT_XRC_RECV,
        }
    }

    /// Connected transports negotiate remote state before traffic.
    #[inline]
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Rc | Self::XrcSend | Self::XrcRecv)
    }
}

/// The lifecycle state of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairState {
    /// Freshly created
    Reset,
    /// Initialized, receives can be posted
    Init,
    /// Ready to receive
    ReadyToRecv,
    /// Ready to send, traffic is legal
    ReadyToSend,
    /// Error state
    Err,
}

/// Queue pair identity exchanged with the peer before the RTS transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpIdentity {
    /// Queue pair number
    pub qp_num: u32,
    /// Locally generated 24-bit packet serial number
    pub psn: u32,
}

/// Generate a random 24-bit packet serial number.
#[inline]
#[must_use]
pub(crate) fn random_psn() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen::<u32>() & 0x00ff_ffff
}

/// Work queue depths requested at creation.
#[derive(Debug, Clone, Copy)]
pub struct QpCapacity {
    /// Max outstanding send requests
    pub max_send_wr: u32,
    /// Max outstanding receive requests
    pub max_recv_wr: u32,
    /// Max sges per send request
    pub max_send_sge: u32,
    /// Max sges per receive request
    pub max_recv_sge: u32,
}

impl Default for QpCapacity {
    fn default() -> Self {
        Self {
            max_send_wr: 1,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

/// Global-route information about the remote end, embedded in the address
/// handle for RTR.
#[derive(Debug, Clone, Copy, Builder, Getters)]
#[builder(derive(Debug, Copy))]
#[getset(get = "pub(crate)")]
pub struct GlobalRoute {
    /// Destination port GID
    dgid: Gid,
    /// Index in the local GID table identifying the packet originator
    sgid_index: u8,
    /// Flow label hint for multi-path routers
    #[builder(default)]
    flow_label: u32,
    /// Router hop budget
    #[builder(default = "DEFAULT_HOP_LIMIT")]
    hop_limit: u8,
    /// Delivery priority class
    #[builder(default)]
    traffic_class: u8,
}

impl From<GlobalRoute> for ibv_global_route {
    #[inline]
    fn from(grh: GlobalRoute) -> Self {
        // SAFETY: POD FFI type
        let mut ibv_grh = unsafe { std::mem::zeroed::<ibv_global_route>() };
        ibv_grh.dgid = grh.dgid.into();
        ibv_grh.flow_label = grh.flow_label;
        ibv_grh.sgid_index = grh.sgid_index;
        ibv_grh.hop_limit = grh.hop_limit;
        ibv_grh.traffic_class = grh.traffic_class;
        ibv_grh
    }
}

/// Everything needed to reach the remote destination.
#[derive(Debug, Clone, Copy, Builder, Getters)]
#[builder(derive(Debug, Copy))]
#[getset(get = "pub(crate)")]
pub struct AddressHandle {
    /// Global routing header target
    grh: GlobalRoute,
    /// Destination local identifier
    dest_lid: u16,
    /// Service level
    #[builder(default)]
    service_level: u8,
    /// Source path bits
    #[builder(default)]
    src_path_bits: u8,
    /// Static rate limit
    #[builder(default)]
    static_rate: u8,
    /// The local physical port packets leave from
    port_num: u8,
}

impl From<AddressHandle> for ibv_ah_attr {
    #[inline]
    fn from(ah: AddressHandle) -> Self {
        // SAFETY: POD FFI type
        let mut ah_attr = unsafe { std::mem::zeroed::<ibv_ah_attr>() };
        ah_attr.grh = ah.grh.into();
        ah_attr.dlid = ah.dest_lid;
        ah_attr.sl = ah.service_level;
        ah_attr.src_path_bits = ah.src_path_bits;
        ah_attr.static_rate = ah.static_rate;
        ah_attr.is_global = 1;
        ah_attr.port_num = ah.port_num;
        ah_attr
    }
}

/// Attributes for the RESET/INIT -> RTR transition of connected transports.
#[derive(Debug, Clone, Copy, Builder, Getters, Setters)]
#[builder(derive(Debug, Copy))]
#[getset(get = "pub(crate)", set = "pub")]
pub struct RemoteQueueAttr {
    /// Path MTU
    #[builder(default = "DEFAULT_PATH_MTU")]
    mtu: Mtu,
    /// Remote queue pair number
    dest_qp_num: u32,
    /// Packet serial number of received packets (the local PSN)
    rq_psn: u32,
    /// Responder rd/atomic depth
    #[builder(default = "DEFAULT_MAX_DEST_RD_ATOMIC")]
    max_dest_rd_atomic: u8,
    /// RNR NAK timer
    #[builder(default = "DEFAULT_MIN_RNR_TIMER")]
    min_rnr_timer: u8,
    /// Route to the remote end
    address: AddressHandle,
}

/// Attributes for the RTR -> RTS transition.
#[derive(Debug, Clone, Copy, Builder, Getters, Setters)]
#[builder(derive(Debug, Copy))]
#[getset(get = "pub(crate)", set = "pub")]
pub struct SendQueueAttr {
    /// ACK timeout exponent
    #[builder(default = "DEFAULT_TIMEOUT")]
    timeout: u8,
    /// Transport retry budget
    #[builder(default = "DEFAULT_RETRY_CNT")]
    retry_cnt: u8,
    /// RNR retry budget
    #[builder(default = "DEFAULT_RNR_RETRY")]
    rnr_retry: u8,
    /// Packet serial number of sent packets (the peer's PSN)
    sq_psn: u32,
    /// Initiator rd/atomic depth
    #[builder(default = "DEFAULT_MAX_RD_ATOMIC")]
    max_rd_atomic: u8,
}

impl From<GlobalRouteBuilderError> for io::Error {
    #[inline]
    fn from(err: GlobalRouteBuilderError) -> Self {
        Self::new(io::ErrorKind::InvalidInput, err.to_string())
    }
}

impl From<AddressHandleBuilderError> for io::Error {
    #[inline]
    fn from(err: AddressHandleBuilderError) -> Self {
        Self::new(io::ErrorKind::InvalidInput, err.to_string())
    }
}

impl From<RemoteQueueAttrBuilderError> for io::Error {
    #[inline]
    fn from(err: RemoteQueueAttrBuilderError) -> Self {
        Self::new(io::ErrorKind::InvalidInput, err.to_string())
    }
}

impl From<SendQueueAttrBuilderError> for io::Error {
    #[inline]
    fn from(err: SendQueueAttrBuilderError) -> Self {
        Self::new(io::ErrorKind::InvalidInput, err.to_string())
    }
}

/// Queue pair wrapper. Holds its completion queue (and shared receive
/// queue / XRC domain when attached) so release ordering stays correct.
#[derive(Debug)]
pub struct QueuePair {
    /// Protection domain it belongs to
    _pd: Arc<ProtectionDomain>,
    /// Completion queue both work queues report to
    _cq: Option<Arc<CompletionQueue>>,
    /// Attached shared receive queue
    _srq: Option<Arc<SharedReceiveQueue>>,
    /// Attached XRC domain
    _xrcd: Option<Arc<XrcDomain>>,
    /// Internal `ibv_qp` pointer
    inner_qp: NonNull<ibv_qp>,
    /// Transport service type
    kind: QpKind,
    /// Tracked lifecycle state
    cur_state: RwLock<QueuePairState>,
}

/// SAFETY: owned handle
unsafe impl Send for QueuePair {}
/// SAFETY: owned handle
unsafe impl Sync for QueuePair {}

impl QueuePair {
    /// Get the internal qp pointer.
    pub(crate) fn as_ptr(&self) -> *mut ibv_qp {
        self.inner_qp.as_ptr()
    }

    /// Create a queue pair of `kind` on the protection domain.
    ///
    /// Unsupported transport service types yield a skip outcome.
    pub fn create(
        pd: &Arc<ProtectionDomain>,
        cq: &Arc<CompletionQueue>,
        srq: Option<&Arc<SharedReceiveQueue>>,
        kind: QpKind,
        cap: QpCapacity,
        sq_sig_all: bool,
    ) -> TestkitResult<Self> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.qp_type = kind.ibv_type();
        init_attr.sq_sig_all = i32::from(sq_sig_all);
        init_attr.send_cq = cq.as_ptr();
        init_attr.recv_cq = cq.as_ptr();
        init_attr.srq = srq.map_or(std::ptr::null_mut(), |srq| srq.as_ptr());
        init_attr.cap.max_send_wr = cap.max_send_wr;
        init_attr.cap.max_recv_wr = cap.max_recv_wr;
        init_attr.cap.max_send_sge = cap.max_send_sge;
        init_attr.cap.max_recv_sge = cap.max_recv_sge;
        // SAFETY: ffi
        let inner_qp = NonNull::new(unsafe { ibv_create_qp(pd.as_ptr(), &mut init_attr) })
            .ok_or_else(|| {
                classify_create_err(io::Error::last_os_error(), &format!("create {kind:?} QP"))
            })?;
        Ok(Self {
            _pd: Arc::clone(pd),
            _cq: Some(Arc::clone(cq)),
            _srq: srq.map(Arc::clone),
            _xrcd: None,
            inner_qp,
            kind,
            cur_state: RwLock::new(QueuePairState::Reset),
        })
    }

    /// Create an XRC receive queue pair attached to the shared domain.
    pub fn create_xrc_recv(
        pd: &Arc<ProtectionDomain>,
        xrcd: &Arc<XrcDomain>,
    ) -> TestkitResult<Self> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr_ex>() };
        init_attr.qp_type = ibv_qp_type::IBV_QPT_XRC_RECV;
        init_attr.comp_mask = ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_XRCD.0;
        init_attr.xrcd = xrcd.as_ptr();
        // SAFETY: ffi
        let inner_qp =
            NonNull::new(unsafe { ibv_create_qp_ex(pd.ctx.as_ptr(), &mut init_attr) })
                .ok_or_else(|| {
                    classify_create_err(io::Error::last_os_error(), "create XRC recv QP")
                })?;
        Ok(Self {
            _pd: Arc::clone(pd),
            _cq: None,
            _srq: None,
            _xrcd: Some(Arc::clone(xrcd)),
            inner_qp,
            kind: QpKind::XrcRecv,
            cur_state: RwLock::new(QueuePairState::Reset),
        })
    }

    /// Create an XRC send queue pair on the protection domain.
    pub fn create_xrc_send(
        pd: &Arc<ProtectionDomain>,
        cq: &Arc<CompletionQueue>,
        max_send_wr: u32,
    ) -> TestkitResult<Self> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr_ex>() };
        init_attr.qp_type = ibv_qp_type::IBV_QPT_XRC_SEND;
        init_attr.sq_sig_all = 1_i32;
        init_attr.comp_mask = ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_PD.0;
        init_attr.pd = pd.as_ptr();
        init_attr.send_cq = cq.as_ptr();
        init_attr.cap.max_send_wr = max_send_wr;
        init_attr.cap.max_send_sge = 1;
        // SAFETY: ffi
        let inner_qp =
            NonNull::new(unsafe { ibv_create_qp_ex(pd.ctx.as_ptr(), &mut init_attr) })
                .ok_or_else(|| {
                    classify_create_err(io::Error::last_os_error(), "create XRC send QP")
                })?;
        Ok(Self {
            _pd: Arc::clone(pd),
            _cq: Some(Arc::clone(cq)),
            _srq: None,
            _xrcd: None,
            inner_qp,
            kind: QpKind::XrcSend,
            cur_state: RwLock::new(QueuePairState::Reset),
        })
    }

    /// The queue pair number assigned by the device.
    #[inline]
    #[must_use]
    pub fn qp_num(&self) -> u32 {
        // SAFETY: valid owned qp
        unsafe { (*self.as_ptr()).qp_num }
    }

    /// The transport service type.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> QpKind {
        self.kind
    }

    /// The tracked lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> QueuePairState {
        *self.cur_state.read()
    }

    /// RESET -> INIT. The access flags gate which remote operations the
    /// receive side will honor; datagram QPs take the fixed queue key
    /// instead.
    pub fn modify_to_init(
        &self,
        access: BitFlags<AccessFlag>,
        port_num: u8,
        pkey_index: u16,
    ) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = pkey_index;
        attr.port_num = port_num;
        let mut mask = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_PORT;
        match self.kind {
            QpKind::Ud => {
                attr.qkey = UD_QKEY;
                mask |= ibv_qp_attr_mask::IBV_QP_PKEY_INDEX | ibv_qp_attr_mask::IBV_QP_QKEY;
            }
            QpKind::RawPacket => {}
            QpKind::Rc | QpKind::XrcSend | QpKind::XrcRecv => {
                attr.qp_access_flags = flags_into_ibv_access(access).0;
                mask |= ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            }
        }
        self.modify(&mut attr, mask, QueuePairState::Init)
    }

    /// INIT -> RTR for connected transports, consuming the exchanged peer
    /// identity embedded in `remote`.
    pub fn modify_to_rtr(&self, remote: &RemoteQueueAttr) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = (*remote.mtu()).into();
        attr.dest_qp_num = *remote.dest_qp_num();
        attr.rq_psn = *remote.rq_psn();
        attr.max_dest_rd_atomic = *remote.max_dest_rd_atomic();
        attr.min_rnr_timer = *remote.min_rnr_timer();
        attr.ah_attr = (*remote.address()).into();
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        self.modify(&mut attr, mask, QueuePairState::ReadyToRecv)
    }

    /// RTR -> RTS for connected transports.
    pub fn modify_to_rts(&self, sq: &SendQueueAttr) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = *sq.timeout();
        attr.retry_cnt = *sq.retry_cnt();
        attr.rnr_retry = *sq.rnr_retry();
        attr.sq_psn = *sq.sq_psn();
        attr.max_rd_atomic = *sq.max_rd_atomic();
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        self.modify(&mut attr, mask, QueuePairState::ReadyToSend)
    }

    /// Full connected-transport handshake: RTR then RTS.
    pub fn connect(&self, remote: &RemoteQueueAttr, sq: &SendQueueAttr) -> io::Result<()> {
        self.modify_to_rtr(remote)?;
        self.modify_to_rts(sq)
    }

    /// Datagram/raw shortcut to RTS; no remote-state negotiation is needed
    /// before sending.
    pub fn ready_without_handshake(&self, sq_psn: u32) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        self.modify(&mut attr, ibv_qp_attr_mask::IBV_QP_STATE, QueuePairState::ReadyToRecv)?;

        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        let mut mask = ibv_qp_attr_mask::IBV_QP_STATE;
        if self.kind == QpKind::Ud {
            attr.sq_psn = sq_psn;
            mask |= ibv_qp_attr_mask::IBV_QP_SQ_PSN;
        }
        self.modify(&mut attr, mask, QueuePairState::ReadyToSend)
    }

    /// The single `ibv_modify_qp` site.
    fn modify(
        &self,
        attr: &mut ibv_qp_attr,
        mask: ibv_qp_attr_mask,
        next: QueuePairState,
    ) -> io::Result<()> {
        // SAFETY: ffi; the qp is not shared across threads during setup
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), attr, mask.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_modify_qp"));
        }
        *self.cur_state.write() = next;
        Ok(())
    }

    /// Post one send-side work request.
    pub fn post_send(&self, wr: &mut SendWr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_send_wr>();
        // SAFETY: ffi; the wr and its sges outlive the call
        let errno = unsafe { ibv_post_send(self.as_ptr(), wr.as_mut(), &mut bad_wr) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_post_send"));
        }
        Ok(())
    }

    /// Post one receive work request.
    pub fn post_recv(&self, wr: &mut RecvWr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: ffi; the wr and its sges outlive the call
        let errno = unsafe { ibv_post_recv(self.as_ptr(), wr.as_mut(), &mut bad_wr) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_post_recv"));
        }
        Ok(())
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_qp(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_destroy_qp");
        }
    }
}

/// A created address handle. Datagram sends attach one per work request.
#[derive(Debug)]
pub struct Ah {
    /// Internal `ibv_ah` pointer
    inner_ah: NonNull<ibv_ah>,
    /// The protection domain the handle belongs to
    _pd: Arc<ProtectionDomain>,
}

/// SAFETY: owned handle
unsafe impl Send for Ah {}
/// SAFETY: owned handle
unsafe impl Sync for Ah {}

impl Ah {
    /// Create an address handle from the route description.
    pub fn create(pd: &Arc<ProtectionDomain>, attr: AddressHandle) -> io::Result<Self> {
        let mut ah_attr: ibv_ah_attr = attr.into();
        // SAFETY: ffi
        let inner_ah = NonNull::new(unsafe { ibv_create_ah(pd.as_ptr(), &mut ah_attr) })
            .ok_or_else(|| log_ret_last_os_err("ibv_create_ah"))?;
        Ok(Self {
            inner_ah,
            _pd: Arc::clone(pd),
        })
    }

    /// Get the internal ah pointer.
    pub(crate) fn as_ptr(&self) -> *mut ibv_ah {
        self.inner_ah.as_ptr()
    }
}

impl Drop for Ah {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_ah(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_destroy_ah");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psn_fits_in_24_bits() {
        for _ in 0..1000 {
            assert!(random_psn() <= 0x00ff_ffff);
        }
    }

    #[test]
    fn connected_kinds() {
        assert!(QpKind::Rc.is_connected());
        assert!(QpKind::XrcSend.is_connected());
        assert!(QpKind::XrcRecv.is_connected());
        assert!(!QpKind::Ud.is_connected());
        assert!(!QpKind::RawPacket.is_connected());
    }

    #[test]
    fn remote_attr_builder_defaults() {
        let grh = GlobalRouteBuilder::default()
            .dgid(Gid::default())
            .sgid_index(1)
            .build()
            .unwrap();
        let ah = AddressHandleBuilder::default()
            .grh(grh)
            .dest_lid(3)
            .port_num(1)
            .build()
            .unwrap();
        let remote = RemoteQueueAttrBuilder::default()
            .dest_qp_num(42)
            .rq_psn(7)
            .address(ah)
            .build()
            .unwrap();
        assert_eq!(*remote.mtu(), DEFAULT_PATH_MTU);
        assert_eq!(*remote.min_rnr_timer(), DEFAULT_MIN_RNR_TIMER);
        assert_eq!(*remote.max_dest_rd_atomic(), DEFAULT_MAX_DEST_RD_ATOMIC);

        let sq = SendQueueAttrBuilder::default().sq_psn(9).build().unwrap();
        assert_eq!(*sq.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(*sq.retry_cnt(), DEFAULT_RETRY_CNT);
        assert_eq!(*sq.rnr_retry(), DEFAULT_RNR_RETRY);
    }
}
