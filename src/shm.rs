//! The process-shared memory region.
//!
//! One fixed-layout header holds the parameter block, the requested shader
//! chain, the lookup tables, the lock slots and the external work queue; the
//! rest of the 2 GiB region is a page-aligned scratch area used for bulk
//! uploads and exports. Work items address scratch data as byte offsets from
//! the region base, so the layout must be identical in every process mapping
//! the region.

use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::{error, fmt};

use crate::params::{
    BeamformerParameters, ShaderParameters, LOOKUP_TABLE_LEN, MAX_COMPUTE_SHADER_STAGES,
};
use crate::sync::{self, LockKind, SyncError, LOCK_COUNT};
use crate::work_queue::WorkQueue;

pub const SHARED_MEMORY_SIZE: usize = 2 << 30;

bitflags! {
    /// Regions with pending uploads the executor must honour. Bit `n`
    /// corresponds to lock slot `n + 1`.
    pub struct DirtyRegions: u32 {
        const PARAMETERS       = 1 << 0;
        const COMPUTE_PIPELINE = 1 << 1;
        const CHANNEL_MAPPING  = 1 << 2;
        const SPARSE_ELEMENTS  = 1 << 3;
        const FOCAL_VECTORS    = 1 << 4;
        const RF_DATA          = 1 << 5;
    }
}

impl DirtyRegions {
    pub fn for_lock(kind: LockKind) -> Option<DirtyRegions> {
        let index = kind as i32 - 1;
        if (0..6).contains(&index) {
            DirtyRegions::from_bits(1 << index)
        } else {
            None
        }
    }
}

/// Fixed header at the base of the region.
#[repr(C)]
pub struct SharedHeader {
    pub version: u32,
    pub dirty_regions: AtomicU32,
    pub data_kind: i32,
    pub shader_count: u32,
    pub parameters: BeamformerParameters,
    pub shaders: [i32; MAX_COMPUTE_SHADER_STAGES],
    pub shader_parameters: [ShaderParameters; MAX_COMPUTE_SHADER_STAGES],
    pub locks: [AtomicI32; LOCK_COUNT],
    pub channel_mapping: [i16; LOOKUP_TABLE_LEN],
    pub sparse_elements: [i16; LOOKUP_TABLE_LEN],
    pub focal_vectors: [[f32; 2]; LOOKUP_TABLE_LEN],
    pub external_work_queue: WorkQueue,
}

/// Byte offset of the scratch area: the header rounded up to a page.
pub const fn scratch_offset() -> usize {
    (mem::size_of::<SharedHeader>() + 4095) & !4095
}

/// Largest single bulk upload or export the scratch area can hold.
pub const fn max_scratch_size() -> usize {
    SHARED_MEMORY_SIZE - scratch_offset()
}

#[derive(Debug)]
pub enum SharedMemoryError {
    Open(i32),
    Truncate(i32),
    Map(i32),
    InvalidName,
}

impl fmt::Display for SharedMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SharedMemoryError::Open(errno) => write!(f, "shm_open failed (errno {})", errno),
            SharedMemoryError::Truncate(errno) => write!(f, "ftruncate failed (errno {})", errno),
            SharedMemoryError::Map(errno) => write!(f, "mmap failed (errno {})", errno),
            SharedMemoryError::InvalidName => f.write_str("shared memory name contains NUL"),
        }
    }
}

impl error::Error for SharedMemoryError {}

/// A mapping of the shared region. The worker creates (and later unlinks) the
/// region; clients open an existing one.
pub struct SharedMemoryRegion {
    base: *mut u8,
    name: std::ffi::CString,
    owner: bool,
}

unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

#[cfg(unix)]
fn map_region(name: &std::ffi::CStr, create: bool) -> Result<*mut u8, SharedMemoryError> {
    unsafe {
        let oflag = if create {
            libc::O_CREAT | libc::O_RDWR
        } else {
            libc::O_RDWR
        };
        let fd = libc::shm_open(name.as_ptr(), oflag, (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t);
        if fd == -1 {
            return Err(SharedMemoryError::Open(errno()));
        }
        if create && libc::ftruncate(fd, SHARED_MEMORY_SIZE as libc::off_t) == -1 {
            let e = errno();
            libc::close(fd);
            return Err(SharedMemoryError::Truncate(e));
        }
        let base = libc::mmap(
            std::ptr::null_mut(),
            SHARED_MEMORY_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        libc::close(fd);
        if base == libc::MAP_FAILED {
            return Err(SharedMemoryError::Map(errno()));
        }
        Ok(base as *mut u8)
    }
}

#[cfg(unix)]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl SharedMemoryRegion {
    /// Create and initialize the region. Called once by the GPU worker; any
    /// stale region with the same name is unlinked first so the header starts
    /// zeroed.
    #[cfg(unix)]
    pub fn create(name: &str) -> Result<SharedMemoryRegion, SharedMemoryError> {
        let cname =
            std::ffi::CString::new(name).map_err(|_| SharedMemoryError::InvalidName)?;
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
        let base = map_region(&cname, true)?;
        let region = SharedMemoryRegion {
            base,
            name: cname,
            owner: true,
        };

        unsafe {
            std::ptr::addr_of_mut!((*region.header_ptr()).version).write(crate::API_VERSION);
        }
        let header = region.header();
        // region-guard slots start with one permit (unlocked); event slots
        // (DispatchCompute, ExportSync, ComputeWorkerSync) stay at zero until
        // posted
        for kind in [
            LockKind::Parameters,
            LockKind::ComputePipeline,
            LockKind::ChannelMapping,
            LockKind::SparseElements,
            LockKind::FocalVectors,
            LockKind::RfData,
            LockKind::ScratchSpace,
        ] {
            header.locks[kind as usize].store(1, Ordering::Release);
        }
        Ok(region)
    }

    /// Map an existing region. Called by external producers.
    #[cfg(unix)]
    pub fn open(name: &str) -> Result<SharedMemoryRegion, SharedMemoryError> {
        let cname =
            std::ffi::CString::new(name).map_err(|_| SharedMemoryError::InvalidName)?;
        let base = map_region(&cname, false)?;
        Ok(SharedMemoryRegion {
            base,
            name: cname,
            owner: false,
        })
    }

    pub fn header(&self) -> &SharedHeader {
        unsafe { &*(self.base as *const SharedHeader) }
    }

    /// Raw header access for fields written under their lock slot.
    ///
    /// Callers must hold the lock guarding whichever field they mutate.
    pub fn header_ptr(&self) -> *mut SharedHeader {
        self.base as *mut SharedHeader
    }

    pub fn lock(&self, kind: LockKind, timeout_ms: i32) -> Result<(), SyncError> {
        sync::acquire(&self.header().locks[kind as usize], timeout_ms)
    }

    pub fn unlock(&self, kind: LockKind) {
        sync::release(&self.header().locks[kind as usize]);
    }

    pub fn post(&self, kind: LockKind) {
        sync::post(&self.header().locks[kind as usize]);
    }

    pub fn dirty_regions(&self) -> DirtyRegions {
        DirtyRegions::from_bits_truncate(self.header().dirty_regions.load(Ordering::Acquire))
    }

    pub fn mark_dirty(&self, regions: DirtyRegions) {
        self.header()
            .dirty_regions
            .fetch_or(regions.bits(), Ordering::AcqRel);
    }

    pub fn clear_dirty(&self, regions: DirtyRegions) {
        self.header()
            .dirty_regions
            .fetch_and(!regions.bits(), Ordering::AcqRel);
    }

    /// Borrow a byte range of the region.
    ///
    /// The caller must hold whichever lock guards the range against
    /// concurrent writers.
    pub unsafe fn bytes(&self, offset: u64, len: usize) -> &[u8] {
        debug_assert!(offset as usize + len <= SHARED_MEMORY_SIZE);
        std::slice::from_raw_parts(self.base.add(offset as usize), len)
    }

    /// Copy `data` into the region at `offset`. Same locking contract as
    /// [`SharedMemoryRegion::bytes`].
    pub unsafe fn write_bytes(&self, offset: u64, data: &[u8]) {
        debug_assert!(offset as usize + data.len() <= SHARED_MEMORY_SIZE);
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            self.base.add(offset as usize),
            data.len(),
        );
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, SHARED_MEMORY_SIZE);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_area_is_page_aligned_and_fits() {
        assert_eq!(scratch_offset() % 4096, 0);
        assert!(scratch_offset() >= mem::size_of::<SharedHeader>());
        assert!(max_scratch_size() > SHARED_MEMORY_SIZE / 2);
    }

    #[test]
    fn dirty_bits_map_to_lock_slots() {
        assert_eq!(
            DirtyRegions::for_lock(LockKind::Parameters),
            Some(DirtyRegions::PARAMETERS)
        );
        assert_eq!(
            DirtyRegions::for_lock(LockKind::ComputePipeline),
            Some(DirtyRegions::COMPUTE_PIPELINE)
        );
        assert_eq!(
            DirtyRegions::for_lock(LockKind::RfData),
            Some(DirtyRegions::RF_DATA)
        );
        assert_eq!(DirtyRegions::for_lock(LockKind::DispatchCompute), None);
        assert_eq!(DirtyRegions::for_lock(LockKind::ExportSync), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn create_open_round_trip() {
        let name = format!("/beamformer-test-{}", std::process::id());
        let server = SharedMemoryRegion::create(&name).expect("create region");
        assert_eq!(server.header().version, crate::API_VERSION);

        let client = SharedMemoryRegion::open(&name).expect("open region");
        assert_eq!(client.header().version, crate::API_VERSION);

        // guard slots hold one permit, event slots none
        client
            .lock(LockKind::Parameters, 0)
            .expect("parameters lock available");
        assert!(client.lock(LockKind::DispatchCompute, 0).is_err());
        client.unlock(LockKind::Parameters);

        // dirty flags propagate across mappings
        client.mark_dirty(DirtyRegions::PARAMETERS);
        assert!(server.dirty_regions().contains(DirtyRegions::PARAMETERS));
        server.clear_dirty(DirtyRegions::PARAMETERS);
        assert!(client.dirty_regions().is_empty());
    }
}
