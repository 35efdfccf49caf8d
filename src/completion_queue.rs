use crate::context::Context;
use crate::error::log_ret_last_os_err;

use clippy_utilities::Cast;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rdma_sys::{ibv_cq, ibv_create_cq, ibv_destroy_cq, ibv_poll_cq, ibv_wc, ibv_wc_status};
use thiserror::Error;

use std::io;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a scenario polls a CQ before declaring the completion lost.
pub(crate) const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Completion queue wrapper. Completions are consumed by synchronous
/// bounded busy-polling, there is no event channel.
#[derive(Debug)]
pub struct CompletionQueue {
    /// The context the CQ lives on
    _ctx: Arc<Context>,
    /// Internal `ibv_cq` pointer
    inner_cq: NonNull<ibv_cq>,
}

impl CompletionQueue {
    /// Get the internal cq pointer.
    pub(crate) const fn as_ptr(&self) -> *mut ibv_cq {
        self.inner_cq.as_ptr()
    }

    /// Create a completion queue with room for `cq_size` entries.
    pub fn create(ctx: &Arc<Context>, cq_size: u32) -> io::Result<Arc<Self>> {
        // SAFETY: ffi
        let inner_cq = NonNull::new(unsafe {
            ibv_create_cq(
                ctx.as_ptr(),
                cq_size.cast(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0_i32,
            )
        })
        .ok_or_else(|| log_ret_last_os_err("ibv_create_cq"))?;
        Ok(Arc::new(Self {
            _ctx: Arc::clone(ctx),
            inner_cq,
        }))
    }

    /// Poll once, returning up to `max` completions without waiting.
    pub fn poll_once(&self, max: usize) -> io::Result<Vec<WorkCompletion>> {
        let mut wc_buf: Vec<WorkCompletion> = Vec::with_capacity(max);
        // SAFETY: ffi; the buffer holds `max` zeroable entries
        let polled =
            unsafe { ibv_poll_cq(self.as_ptr(), max.cast(), wc_buf.as_mut_ptr().cast()) };
        if polled < 0_i32 {
            return Err(log_ret_last_os_err("ibv_poll_cq"));
        }
        // SAFETY: the device wrote `polled` entries
        unsafe {
            wc_buf.set_len(polled.cast());
        }
        Ok(wc_buf)
    }

    /// Busy-poll until `count` completions arrive or the timeout expires.
    pub fn poll_with_timeout(
        &self,
        count: usize,
        timeout: Duration,
    ) -> io::Result<Vec<WorkCompletion>> {
        let deadline = Instant::now() + timeout;
        let mut completions = Vec::with_capacity(count);
        while completions.len() < count {
            let mut polled = self.poll_once(count - completions.len())?;
            completions.append(&mut polled);
            if completions.len() < count && Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "polled {} of {count} completions before timeout",
                        completions.len()
                    ),
                ));
            }
        }
        Ok(completions)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_cq(self.as_ptr()) };
        assert_eq!(errno, 0_i32, "failed to destroy CQ");
    }
}

/// SAFETY: owned handle
unsafe impl Send for CompletionQueue {}
/// SAFETY: owned handle
unsafe impl Sync for CompletionQueue {}

/// One work completion entry.
#[allow(missing_copy_implementations)] // semantically a queue entry, not a value
#[repr(C)]
pub struct WorkCompletion {
    /// The internal ibv work completion
    inner_wc: ibv_wc,
}

impl WorkCompletion {
    /// The caller-chosen work request id.
    #[inline]
    #[must_use]
    pub const fn wr_id(&self) -> u64 {
        self.inner_wc.wr_id
    }

    /// Completion outcome: byte length on success, the mapped status
    /// otherwise.
    #[inline]
    pub fn result(&self) -> Result<usize, WcError> {
        match self.error() {
            None => Ok(self.inner_wc.byte_len.cast()),
            Some(err) => Err(err),
        }
    }

    /// The mapped error status, `None` on success.
    #[inline]
    #[must_use]
    pub fn error(&self) -> Option<WcError> {
        if self.inner_wc.status == ibv_wc_status::IBV_WC_SUCCESS {
            None
        } else {
            Some(WcError::from_u32(self.inner_wc.status).unwrap_or(WcError::Unexpected))
        }
    }
}

impl std::fmt::Debug for WorkCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkCompletion")
            .field("wr_id", &self.wr_id())
            .field("status", &self.error())
            .finish()
    }
}

impl Default for WorkCompletion {
    fn default() -> Self {
        Self {
            // SAFETY: POD FFI type
            inner_wc: unsafe { mem::zeroed() },
        }
    }
}

/// Non-success work completion statuses, mirroring `ibv_wc_status`.
#[allow(missing_docs)] // the error strings describe each status
#[derive(Error, Debug, FromPrimitive, Copy, Clone, PartialEq, Eq)]
pub enum WcError {
    #[error("local length error")]
    LocLenErr = 1,
    #[error("local QP operation error")]
    LocQpOpErr = 2,
    #[error("local protection error: the posted buffers do not reference a valid MR")]
    LocProtErr = 4,
    #[error("work request flushed: the QP transitioned to the error state")]
    WrFlushErr = 5,
    #[error("memory window binding error")]
    MwBindErr = 6,
    #[error("bad response: unexpected transport opcode from the responder")]
    BadRespErr = 7,
    #[error("local access error")]
    LocAccessErr = 8,
    #[error("remote invalid request: the responder QP does not permit this operation")]
    RemInvReqErr = 9,
    #[error("remote access error: protection failure on the remote buffer")]
    RemAccessErr = 10,
    #[error("remote operation error")]
    RemOpErr = 11,
    #[error("transport retry counter exceeded")]
    RetryExc = 12,
    #[error("RNR retry counter exceeded")]
    RnrRetryExc = 13,
    #[error("remote aborted the operation")]
    RemAbortErr = 16,
    #[error("fatal error")]
    Fatal = 19,
    #[error("response timeout")]
    RespTimeout = 20,
    #[error("general error")]
    GeneralErr = 21,
    #[error("unexpected completion status")]
    Unexpected = 100,
}

impl From<WcError> for io::Error {
    #[inline]
    fn from(err: WcError) -> Self {
        Self::new(io::ErrorKind::Other, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_errors() {
        assert_eq!(WcError::from_u32(10), Some(WcError::RemAccessErr));
        assert_eq!(WcError::from_u32(4), Some(WcError::LocProtErr));
        assert_eq!(WcError::from_u32(77), None);
    }

    #[test]
    fn zeroed_wc_is_success() {
        let wc = WorkCompletion::default();
        assert!(wc.result().is_ok());
        assert!(wc.error().is_none());
    }
}
