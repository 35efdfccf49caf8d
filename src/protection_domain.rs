use crate::context::Context;
use crate::error::{log_last_os_err, log_ret_last_os_err};

use rdma_sys::{ibv_alloc_pd, ibv_dealloc_pd, ibv_pd};

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// Protection Domain wrapper.
#[derive(Debug)]
pub struct ProtectionDomain {
    /// The device context it was allocated from
    pub(crate) ctx: Arc<Context>,
    /// Internal `ibv_pd` pointer
    inner_pd: NonNull<ibv_pd>,
}

impl ProtectionDomain {
    /// Get pointer to the internal `ibv_pd`.
    pub(crate) fn as_ptr(&self) -> *mut ibv_pd {
        self.inner_pd.as_ptr()
    }

    /// Allocate a protection domain on the context.
    pub fn create(ctx: &Arc<Context>) -> io::Result<Arc<Self>> {
        // SAFETY: ffi
        let inner_pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) })
            .ok_or_else(|| log_ret_last_os_err("ibv_alloc_pd"))?;
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            inner_pd,
        }))
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dealloc_pd(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_dealloc_pd");
        }
    }
}

/// SAFETY: owned handle
unsafe impl Send for ProtectionDomain {}
/// SAFETY: owned handle
unsafe impl Sync for ProtectionDomain {}
