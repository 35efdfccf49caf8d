use crate::access::{flags_into_ibv_access, AccessFlag};
use crate::error::{classify_create_err, log_last_os_err, TestkitError, TestkitResult};
use crate::protection_domain::ProtectionDomain;

use clippy_utilities::Cast;
use enumflags2::BitFlags;
use rdma_sys::{ibv_dereg_mr, ibv_mr, ibv_reg_mr, ibv_sge};

use std::io;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Arc;

/// Prefetch advice for on-demand-paging memory regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PrefetchAdvice {
    /// Prefetch for read access
    Prefetch = 0,
    /// Prefetch for write access
    PrefetchWrite = 1,
    /// Populate mappings without faulting pages in
    PrefetchNoFault = 2,
}

/// `IBV_ADVISE_MR_FLAG_FLUSH`: the advise call returns only after the
/// operation is fully resolved.
const ADVISE_FLAG_FLUSH: u32 = 1;

/// An anonymous private mapping, used to force page faults in ODP scenarios
/// by deferring population until first device access.
#[derive(Debug)]
pub struct MappedBuffer {
    /// Mapping base
    addr: NonNull<u8>,
    /// Mapping length
    len: usize,
}

/// SAFETY: owned mapping
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    /// Create an unpopulated anonymous mapping. `huge` asks for hugetlb
    /// backing.
    pub fn alloc(len: usize, huge: bool) -> io::Result<Self> {
        let mut flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }
        // SAFETY: ffi
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1_i32,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            // SAFETY: mmap success checked above
            addr: unsafe { NonNull::new_unchecked(addr.cast()) },
            len,
        })
    }

    /// Drop the backing pages so the next device access faults again.
    pub fn discard(&self) -> io::Result<()> {
        // SAFETY: ffi over an owned mapping
        let ret = unsafe {
            libc::madvise(self.addr.as_ptr().cast(), self.len, libc::MADV_DONTNEED)
        };
        if ret != 0_i32 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // SAFETY: ffi over an owned mapping
        let ret = unsafe { libc::munmap(self.addr.as_ptr().cast(), self.len) };
        if ret != 0_i32 {
            log_last_os_err("munmap");
        }
    }
}

/// The storage backing a memory region.
#[derive(Debug)]
enum MrBuffer {
    /// Heap allocation owned by the region
    Heap(Pin<Box<[u8]>>),
    /// `mmap`ed allocation owned by the region
    Mapped(MappedBuffer),
    /// Implicit whole-address-space registration, no dedicated buffer
    Implicit,
}

/// Memory region wrapper. Owns its buffer; the registration is torn down
/// before the buffer is released.
#[derive(Debug)]
pub struct MemoryRegion {
    /// Internal `ibv_mr` pointer
    inner_mr: NonNull<ibv_mr>,
    /// The protection domain the MR belongs to
    pd: Arc<ProtectionDomain>,
    /// Backing storage
    buf: MrBuffer,
    /// Registered length
    len: usize,
}

/// SAFETY: owned handle
unsafe impl Send for MemoryRegion {}
/// SAFETY: owned handle
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Register a zero-initialized heap buffer of `len` bytes.
    ///
    /// Creation failures of the unsupported class (e.g. an access set the
    /// device cannot grant) surface as skip outcomes.
    pub fn register(
        pd: &Arc<ProtectionDomain>,
        len: usize,
        access: BitFlags<AccessFlag>,
    ) -> TestkitResult<Self> {
        let buf = Pin::new(vec![0_u8; len].into_boxed_slice());
        let addr = buf.as_ptr().cast_mut().cast();
        Self::register_raw(pd, addr, len, len, access, MrBuffer::Heap(buf))
    }

    /// Register over a caller-provided anonymous mapping, deferring page
    /// population until first access.
    pub fn register_mapped(
        pd: &Arc<ProtectionDomain>,
        mapped: MappedBuffer,
        len: usize,
        access: BitFlags<AccessFlag>,
    ) -> TestkitResult<Self> {
        let addr = mapped.addr.as_ptr().cast();
        Self::register_raw(pd, addr, len, len, access, MrBuffer::Mapped(mapped))
    }

    /// Implicit (whole address space) on-demand registration. A payload
    /// buffer may still back the scenario's messages.
    pub fn register_implicit(
        pd: &Arc<ProtectionDomain>,
        access: BitFlags<AccessFlag>,
        mapped: Option<MappedBuffer>,
        len: usize,
    ) -> TestkitResult<Self> {
        let buf = match mapped {
            Some(mapped) => MrBuffer::Mapped(mapped),
            None => MrBuffer::Implicit,
        };
        Self::register_raw(pd, std::ptr::null_mut(), usize::MAX, len, access, buf)
    }

    /// The single `ibv_reg_mr` site. `reg_len` is what the device registers,
    /// `payload_len` what the scenario reads and writes.
    fn register_raw(
        pd: &Arc<ProtectionDomain>,
        addr: *mut libc::c_void,
        reg_len: usize,
        payload_len: usize,
        access: BitFlags<AccessFlag>,
        buf: MrBuffer,
    ) -> TestkitResult<Self> {
        let ibv_access = flags_into_ibv_access(access);
        // SAFETY: ffi; addr/reg_len describe memory owned by `buf` (or the
        // whole address space for implicit registrations)
        let inner_mr =
            unsafe { ibv_reg_mr(pd.as_ptr(), addr, reg_len, ibv_access.0.cast()) };
        let inner_mr = NonNull::new(inner_mr).ok_or_else(|| {
            classify_create_err(
                io::Error::last_os_error(),
                &format!("reg MR with access {access:?}"),
            )
        })?;
        Ok(Self {
            inner_mr,
            pd: Arc::clone(pd),
            buf,
            len: payload_len,
        })
    }

    /// Buffer address as the device sees it in scatter/gather entries.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> u64 {
        match self.buf {
            MrBuffer::Heap(ref buf) => buf.as_ptr() as u64,
            MrBuffer::Mapped(ref mapped) => mapped.addr.as_ptr() as u64,
            // SAFETY: valid owned mr
            MrBuffer::Implicit => (unsafe { (*self.inner_mr.as_ptr()).addr }) as u64,
        }
    }

    /// Local key.
    #[inline]
    #[must_use]
    pub fn lkey(&self) -> u32 {
        // SAFETY: valid owned mr
        unsafe { (*self.inner_mr.as_ptr()).lkey }
    }

    /// Remote key.
    #[inline]
    #[must_use]
    pub fn rkey(&self) -> u32 {
        // SAFETY: valid owned mr
        unsafe { (*self.inner_mr.as_ptr()).rkey }
    }

    /// Registered length.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the registered length is zero.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View of the backing buffer. Implicit registrations have none.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> Option<&[u8]> {
        match self.buf {
            MrBuffer::Heap(ref buf) => Some(buf),
            // SAFETY: the mapping is owned and `len` long
            MrBuffer::Mapped(ref mapped) => {
                Some(unsafe { std::slice::from_raw_parts(mapped.addr.as_ptr(), self.len) })
            }
            MrBuffer::Implicit => None,
        }
    }

    /// Mutable view of the backing buffer.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self.buf {
            MrBuffer::Heap(ref mut buf) => Some(buf),
            // SAFETY: the mapping is owned and `len` long
            MrBuffer::Mapped(ref mapped) => {
                Some(unsafe { std::slice::from_raw_parts_mut(mapped.addr.as_ptr(), self.len) })
            }
            MrBuffer::Implicit => None,
        }
    }

    /// Write `data` at `offset` into the buffer.
    pub fn write(&mut self, data: &[u8], offset: usize) -> TestkitResult<()> {
        let end = offset + data.len();
        let slice = self
            .as_mut_slice()
            .ok_or_else(|| TestkitError::skip("implicit MR has no local buffer"))?;
        slice
            .get_mut(offset..end)
            .ok_or_else(|| {
                TestkitError::BadPayload(format!("write of {end} bytes exceeds MR length"))
            })?
            .copy_from_slice(data);
        Ok(())
    }

    /// Read `len` bytes at `offset` from the buffer.
    pub fn read(&self, len: usize, offset: usize) -> TestkitResult<Vec<u8>> {
        let slice = self
            .as_slice()
            .ok_or_else(|| TestkitError::skip("implicit MR has no local buffer"))?;
        slice
            .get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                TestkitError::BadPayload(format!("read of {len} bytes exceeds MR length"))
            })
    }

    /// Forget backing pages (ODP mappings only) so traffic faults again.
    pub fn force_fault(&self) -> io::Result<()> {
        match self.buf {
            MrBuffer::Mapped(ref mapped) => mapped.discard(),
            MrBuffer::Heap(_) | MrBuffer::Implicit => Ok(()),
        }
    }

    /// Issue an `ibv_advise_mr` prefetch over the whole region on the
    /// calling thread.
    pub fn prefetch(&self, advice: PrefetchAdvice) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: self.addr(),
            length: self.len.cast(),
            lkey: self.lkey(),
        };
        // SAFETY: ffi; the sge references this owned registration
        let ret = unsafe {
            rdma_sys::ibv_advise_mr(
                self.pd.as_ptr(),
                (advice as u32).cast(),
                ADVISE_FLAG_FLUSH,
                &mut sge,
                1,
            )
        };
        if ret != 0_i32 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ffi; runs before the backing buffer is released
        let errno = unsafe { ibv_dereg_mr(self.inner_mr.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_dereg_mr");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_buffer_roundtrip() {
        let buf = MappedBuffer::alloc(4096, false).unwrap();
        // SAFETY: owned mapping
        let slice = unsafe { std::slice::from_raw_parts_mut(buf.addr.as_ptr(), buf.len) };
        slice[0] = 0xab;
        assert_eq!(slice[0], 0xab);
        buf.discard().unwrap();
        // Discarded anonymous pages read back as zero.
        assert_eq!(slice[0], 0);
    }
}
