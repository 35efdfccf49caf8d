use rdma_sys::{ibv_ah, ibv_recv_wr, ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wr_opcode};

use clippy_utilities::Cast;

use crate::memory_region::MemoryRegion;

/// One scatter/gather element.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    /// Buffer address
    pub addr: u64,
    /// Buffer length
    pub length: u32,
    /// Local key of the MR the buffer lives in
    pub lkey: u32,
}

impl Sge {
    /// An sge covering a whole memory region.
    #[inline]
    #[must_use]
    pub fn whole(mr: &MemoryRegion) -> Self {
        Self {
            addr: mr.addr(),
            length: mr.len().cast(),
            lkey: mr.lkey(),
        }
    }

    /// An sge covering `length` bytes of the region starting at `offset`.
    #[inline]
    #[must_use]
    pub fn slice(mr: &MemoryRegion, offset: u64, length: u32) -> Self {
        Self {
            addr: mr.addr() + offset,
            length,
            lkey: mr.lkey(),
        }
    }
}

impl From<Sge> for ibv_sge {
    #[inline]
    fn from(sge: Sge) -> Self {
        Self {
            addr: sge.addr,
            length: sge.length,
            lkey: sge.lkey,
        }
    }
}

/// The atomic operation kinds the traffic driver can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Compare-and-swap: swap in `swap` when the remote value equals
    /// `compare`
    CompareSwap {
        /// Expected remote value
        compare: u64,
        /// Replacement value
        swap: u64,
    },
    /// Fetch-and-add of `add`
    FetchAdd {
        /// Increment
        add: u64,
    },
}

/// A send-side work request. Owns its sge array so the pointers stay valid
/// until the post call returns.
pub struct SendWr {
    /// The wrapped work request
    inner: ibv_send_wr,
    /// Owned scatter/gather list referenced by `inner`
    sges: Vec<ibv_sge>,
}

impl SendWr {
    /// Shared skeleton: signaled request over `sges`.
    fn new(wr_id: u64, sges: Vec<Sge>, opcode: u32) -> Self {
        let sges: Vec<ibv_sge> = sges.into_iter().map(Into::into).collect();
        // SAFETY: POD FFI type
        let mut inner = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        inner.wr_id = wr_id;
        inner.opcode = opcode;
        inner.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        inner.num_sge = sges.len().cast();
        let mut wr = Self { inner, sges };
        wr.inner.sg_list = wr.sges.as_mut_ptr();
        wr
    }

    /// A two-sided send.
    #[must_use]
    pub fn new_send(wr_id: u64, sges: Vec<Sge>) -> Self {
        Self::new(wr_id, sges, ibv_wr_opcode::IBV_WR_SEND)
    }

    /// A two-sided send over a UD queue pair, addressed through `ah`.
    #[must_use]
    pub fn new_send_ud(wr_id: u64, sges: Vec<Sge>, ah: *mut ibv_ah, remote_qpn: u32, qkey: u32) -> Self {
        let mut wr = Self::new(wr_id, sges, ibv_wr_opcode::IBV_WR_SEND);
        wr.inner.wr.ud.ah = ah;
        wr.inner.wr.ud.remote_qpn = remote_qpn;
        wr.inner.wr.ud.remote_qkey = qkey;
        wr
    }

    /// A two-sided send over an XRC send queue pair; XRC routes the message
    /// into the peer's shared receive queue named by `remote_srqn`.
    #[must_use]
    pub fn new_send_xrc(wr_id: u64, sges: Vec<Sge>, remote_srqn: u32) -> Self {
        let mut wr = Self::new(wr_id, sges, ibv_wr_opcode::IBV_WR_SEND);
        wr.inner.qp_type.xrc.remote_srqn = remote_srqn;
        wr
    }

    /// A one-sided RDMA read from `raddr`/`rkey` into the local sges.
    #[must_use]
    pub fn new_read(wr_id: u64, sges: Vec<Sge>, raddr: u64, rkey: u32) -> Self {
        let mut wr = Self::new(wr_id, sges, ibv_wr_opcode::IBV_WR_RDMA_READ);
        wr.inner.wr.rdma.remote_addr = raddr;
        wr.inner.wr.rdma.rkey = rkey;
        wr
    }

    /// A one-sided RDMA write of the local sges to `raddr`/`rkey`.
    #[must_use]
    pub fn new_write(wr_id: u64, sges: Vec<Sge>, raddr: u64, rkey: u32) -> Self {
        let mut wr = Self::new(wr_id, sges, ibv_wr_opcode::IBV_WR_RDMA_WRITE);
        wr.inner.wr.rdma.remote_addr = raddr;
        wr.inner.wr.rdma.rkey = rkey;
        wr
    }

    /// An 8-byte atomic operation on `raddr`/`rkey`, with the original
    /// remote value landing in the local sge.
    #[must_use]
    pub fn new_atomic(wr_id: u64, sge: Sge, op: AtomicOp, raddr: u64, rkey: u32) -> Self {
        let opcode = match op {
            AtomicOp::CompareSwap { .. } => ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP,
            AtomicOp::FetchAdd { .. } => ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD,
        };
        let mut wr = Self::new(wr_id, vec![sge], opcode);
        wr.inner.wr.atomic.remote_addr = raddr;
        wr.inner.wr.atomic.rkey = rkey;
        match op {
            AtomicOp::CompareSwap { compare, swap } => {
                wr.inner.wr.atomic.compare_add = compare;
                wr.inner.wr.atomic.swap = swap;
            }
            AtomicOp::FetchAdd { add } => {
                wr.inner.wr.atomic.compare_add = add;
            }
        }
        wr
    }

    /// Mutable pointer for the post call.
    #[inline]
    pub fn as_mut(&mut self) -> &mut ibv_send_wr {
        self.inner.sg_list = self.sges.as_mut_ptr();
        &mut self.inner
    }
}

impl std::fmt::Debug for SendWr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendWr")
            .field("wr_id", &self.inner.wr_id)
            .field("opcode", &self.inner.opcode)
            .field("num_sge", &self.inner.num_sge)
            .finish()
    }
}

/// A receive-side work request. Owns its sge array like [`SendWr`].
pub struct RecvWr {
    /// The wrapped work request
    inner: ibv_recv_wr,
    /// Owned scatter/gather list referenced by `inner`
    sges: Vec<ibv_sge>,
}

impl RecvWr {
    /// A receive request over `sges`.
    #[must_use]
    pub fn new_recv(wr_id: u64, sges: Vec<Sge>) -> Self {
        let sges: Vec<ibv_sge> = sges.into_iter().map(Into::into).collect();
        // SAFETY: POD FFI type
        let mut inner = unsafe { std::mem::zeroed::<ibv_recv_wr>() };
        inner.wr_id = wr_id;
        inner.num_sge = sges.len().cast();
        let mut wr = Self { inner, sges };
        wr.inner.sg_list = wr.sges.as_mut_ptr();
        wr
    }

    /// Mutable pointer for the post call.
    #[inline]
    pub fn as_mut(&mut self) -> &mut ibv_recv_wr {
        self.inner.sg_list = self.sges.as_mut_ptr();
        &mut self.inner
    }
}

impl std::fmt::Debug for RecvWr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvWr")
            .field("wr_id", &self.inner.wr_id)
            .field("num_sge", &self.inner.num_sge)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_wr_keeps_sges_alive() {
        let sge = Sge {
            addr: 0x1000,
            length: 64,
            lkey: 7,
        };
        let mut wr = SendWr::new_send(3, vec![sge]);
        let raw = wr.as_mut();
        assert_eq!(raw.wr_id, 3);
        assert_eq!(raw.num_sge, 1);
        // SAFETY: sg_list points into the owned vec
        let first = unsafe { *raw.sg_list };
        assert_eq!(first.addr, 0x1000);
        assert_eq!(first.lkey, 7);
    }

    #[test]
    fn fetch_add_uses_compare_add_slot() {
        let sge = Sge {
            addr: 0x2000,
            length: 8,
            lkey: 1,
        };
        let mut wr = SendWr::new_atomic(1, sge, AtomicOp::FetchAdd { add: 5 }, 0x3000, 9);
        let raw = wr.as_mut();
        assert_eq!(raw.opcode, ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD);
        // SAFETY: atomic member was written by the constructor
        unsafe {
            assert_eq!(raw.wr.atomic.compare_add, 5);
            assert_eq!(raw.wr.atomic.rkey, 9);
        }
    }
}
