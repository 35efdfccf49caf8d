use crate::context::Context;
use crate::error::{classify_create_err, log_last_os_err, TestkitResult};

use rdma_sys::{ibv_close_xrcd, ibv_open_xrcd, ibv_xrcd, ibv_xrcd_init_attr, ibv_xrcd_init_attr_mask};

use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::Arc;

use tempfile::NamedTempFile;

/// An XRC domain, backed by a temporary file descriptor.
///
/// The fd is the one resource deliberately shared (by descriptor, not by
/// concurrent access) between the send- and receive-QP sets of a bundle.
#[derive(Debug)]
pub struct XrcDomain {
    /// Internal `ibv_xrcd` pointer
    inner_xrcd: NonNull<ibv_xrcd>,
    /// The context the domain lives on
    _ctx: Arc<Context>,
    /// Filesystem entry backing the domain fd, removed on drop
    _backing: NamedTempFile,
}

/// SAFETY: owned handle
unsafe impl Send for XrcDomain {}
/// SAFETY: owned handle
unsafe impl Sync for XrcDomain {}

impl XrcDomain {
    /// Get the internal xrcd pointer.
    pub(crate) fn as_ptr(&self) -> *mut ibv_xrcd {
        self.inner_xrcd.as_ptr()
    }

    /// Open an XRC domain over a fresh temporary file.
    ///
    /// Devices without XRC support yield a skip outcome.
    pub fn open(ctx: &Arc<Context>) -> TestkitResult<Arc<Self>> {
        let backing = NamedTempFile::new().map_err(crate::error::TestkitError::Verbs)?;
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_xrcd_init_attr>() };
        init_attr.comp_mask = (ibv_xrcd_init_attr_mask::IBV_XRCD_INIT_ATTR_FD
            | ibv_xrcd_init_attr_mask::IBV_XRCD_INIT_ATTR_OFLAGS)
            .0;
        init_attr.fd = backing.as_file().as_raw_fd();
        init_attr.oflags = libc::O_CREAT;
        // SAFETY: ffi
        let inner_xrcd = NonNull::new(unsafe { ibv_open_xrcd(ctx.as_ptr(), &mut init_attr) })
            .ok_or_else(|| classify_create_err(io::Error::last_os_error(), "create XRCD"))?;
        Ok(Arc::new(Self {
            inner_xrcd,
            _ctx: Arc::clone(ctx),
            _backing: backing,
        }))
    }
}

impl Drop for XrcDomain {
    fn drop(&mut self) {
        // SAFETY: ffi; runs before the backing file is unlinked
        let errno = unsafe { ibv_close_xrcd(self.inner_xrcd.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_close_xrcd");
        }
    }
}
