use crate::completion_queue::CompletionQueue;
use crate::error::{classify_create_err, log_last_os_err, log_ret_last_os_err, TestkitResult};
use crate::protection_domain::ProtectionDomain;
use crate::wr::RecvWr;
use crate::xrc::XrcDomain;

use rdma_sys::{
    ibv_create_srq, ibv_create_srq_ex, ibv_destroy_srq, ibv_post_srq_recv, ibv_recv_wr, ibv_srq,
    ibv_srq_init_attr, ibv_srq_init_attr_ex, ibv_srq_init_attr_mask, ibv_srq_type,
};

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// Shared receive queue wrapper, either plain or XRC-attached.
#[derive(Debug)]
pub struct SharedReceiveQueue {
    /// Internal `ibv_srq` pointer
    inner_srq: NonNull<ibv_srq>,
    /// The protection domain receive buffers resolve against
    _pd: Arc<ProtectionDomain>,
    /// The XRC domain the queue is bound to, kept alive past the queue
    _xrcd: Option<Arc<XrcDomain>>,
}

/// SAFETY: owned handle
unsafe impl Send for SharedReceiveQueue {}
/// SAFETY: owned handle
unsafe impl Sync for SharedReceiveQueue {}

impl SharedReceiveQueue {
    /// Get the internal srq pointer.
    pub(crate) fn as_ptr(&self) -> *mut ibv_srq {
        self.inner_srq.as_ptr()
    }

    /// Create a plain SRQ with room for `max_wr` outstanding receives.
    pub fn create(pd: &Arc<ProtectionDomain>, max_wr: u32) -> TestkitResult<Arc<Self>> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_srq_init_attr>() };
        init_attr.attr.max_wr = max_wr;
        init_attr.attr.max_sge = 1;
        // SAFETY: ffi
        let inner_srq = NonNull::new(unsafe { ibv_create_srq(pd.as_ptr(), &mut init_attr) })
            .ok_or_else(|| classify_create_err(io::Error::last_os_error(), "create SRQ"))?;
        Ok(Arc::new(Self {
            inner_srq,
            _pd: Arc::clone(pd),
            _xrcd: None,
        }))
    }

    /// Create an XRC SRQ bound to the domain and completion queue.
    pub fn create_xrc(
        pd: &Arc<ProtectionDomain>,
        xrcd: &Arc<XrcDomain>,
        cq: &CompletionQueue,
        max_wr: u32,
    ) -> TestkitResult<Arc<Self>> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_srq_init_attr_ex>() };
        init_attr.attr.max_wr = max_wr;
        init_attr.attr.max_sge = 1;
        init_attr.srq_type = ibv_srq_type::IBV_SRQT_XRC;
        init_attr.pd = pd.as_ptr();
        init_attr.xrcd = xrcd.as_ptr();
        init_attr.cq = cq.as_ptr();
        init_attr.comp_mask = (ibv_srq_init_attr_mask::IBV_SRQ_INIT_ATTR_TYPE
            | ibv_srq_init_attr_mask::IBV_SRQ_INIT_ATTR_PD
            | ibv_srq_init_attr_mask::IBV_SRQ_INIT_ATTR_XRCD
            | ibv_srq_init_attr_mask::IBV_SRQ_INIT_ATTR_CQ)
            .0;
        // SAFETY: ffi
        let inner_srq =
            NonNull::new(unsafe { ibv_create_srq_ex(pd.ctx.as_ptr(), &mut init_attr) })
                .ok_or_else(|| classify_create_err(io::Error::last_os_error(), "create XRC SRQ"))?;
        Ok(Arc::new(Self {
            inner_srq,
            _pd: Arc::clone(pd),
            _xrcd: Some(Arc::clone(xrcd)),
        }))
    }

    /// The queue number XRC senders name in their work requests.
    pub fn srq_num(&self) -> io::Result<u32> {
        let mut srq_num = 0_u32;
        // SAFETY: ffi
        let errno = unsafe { rdma_sys::ibv_get_srq_num(self.as_ptr(), &mut srq_num) };
        if errno != 0_i32 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(srq_num)
    }

    /// Post one receive work request to the shared queue.
    pub fn post_recv(&self, wr: &mut RecvWr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: ffi; the wr and its sges outlive the call
        let errno = unsafe { ibv_post_srq_recv(self.as_ptr(), wr.as_mut(), &mut bad_wr) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_post_srq_recv"));
        }
        Ok(())
    }
}

impl Drop for SharedReceiveQueue {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_srq(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_destroy_srq");
        }
    }
}
