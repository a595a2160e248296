//! Cross-process synchronization primitives.
//!
//! Every named slot is a 32-bit counter living in shared memory with
//! futex-style wait/wake semantics: `acquire` consumes a permit (waiting while
//! the counter is zero), `release` and `post` publish one and wake a waiter.
//! Timeouts are in milliseconds; `-1` waits forever and `0` tries once.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;
use std::{error, fmt};

/// Named sync slots in the shared memory region.
///
/// The slot order is load-bearing: upload-guard slots map to bits of the
/// dirty-regions field as `1 << (slot - 1)`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockKind {
    DispatchCompute = 0,
    Parameters = 1,
    ComputePipeline = 2,
    ChannelMapping = 3,
    SparseElements = 4,
    FocalVectors = 5,
    RfData = 6,
    ExportSync = 7,
    ScratchSpace = 8,
    /// The GPU worker sleeps on this slot; producers bump it after committing
    /// work.
    ComputeWorkerSync = 9,
}

pub const LOCK_COUNT: usize = 10;

impl LockKind {
    pub fn from_i32(value: i32) -> Option<LockKind> {
        Some(match value {
            0 => LockKind::DispatchCompute,
            1 => LockKind::Parameters,
            2 => LockKind::ComputePipeline,
            3 => LockKind::ChannelMapping,
            4 => LockKind::SparseElements,
            5 => LockKind::FocalVectors,
            6 => LockKind::RfData,
            7 => LockKind::ExportSync,
            8 => LockKind::ScratchSpace,
            9 => LockKind::ComputeWorkerSync,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    Timeout,
    InvalidTimeout,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::Timeout => f.write_str("timed out waiting on sync variable"),
            SyncError::InvalidTimeout => f.write_str("timeout must be >= -1"),
        }
    }
}

impl error::Error for SyncError {}

/// Block until the futex word changes away from `current`, or `timeout_ms`
/// elapses. Spurious wakeups are allowed; callers must re-check the value.
#[cfg(target_os = "linux")]
pub fn wait_on_value(value: &AtomicI32, current: i32, timeout_ms: i32) -> bool {
    let ts = libc::timespec {
        tv_sec: (timeout_ms / 1000) as libc::time_t,
        tv_nsec: ((timeout_ms % 1000) as i64 * 1_000_000) as libc::c_long,
    };
    let ts_ptr = if timeout_ms < 0 {
        std::ptr::null::<libc::timespec>()
    } else {
        &ts
    };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            value as *const AtomicI32 as *mut i32,
            libc::FUTEX_WAIT,
            current,
            ts_ptr,
            0usize,
            0usize,
        ) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait_on_value(value: &AtomicI32, current: i32, timeout_ms: i32) -> bool {
    let start = Instant::now();
    while value.load(Ordering::Acquire) == current {
        if timeout_ms >= 0 && start.elapsed().as_millis() as i64 >= timeout_ms as i64 {
            return false;
        }
        std::thread::yield_now();
    }
    true
}

#[cfg(target_os = "linux")]
pub fn wake_waiters(value: &AtomicI32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            value as *const AtomicI32 as *mut i32,
            libc::FUTEX_WAKE,
            i32::MAX,
            0usize,
            0usize,
            0usize,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wake_waiters(_value: &AtomicI32) {}

/// Consume one permit from `slot`, waiting while the counter is zero.
pub fn acquire(slot: &AtomicI32, timeout_ms: i32) -> Result<(), SyncError> {
    if timeout_ms < -1 {
        return Err(SyncError::InvalidTimeout);
    }
    let start = Instant::now();
    loop {
        let current = slot.load(Ordering::Acquire);
        if current > 0 {
            if slot
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
            continue;
        }

        let remaining = if timeout_ms < 0 {
            -1
        } else {
            let elapsed = start.elapsed().as_millis() as i64;
            let left = timeout_ms as i64 - elapsed;
            if left <= 0 {
                return Err(SyncError::Timeout);
            }
            left as i32
        };
        wait_on_value(slot, current, remaining);
    }
}

/// Publish one permit and wake a waiter. Release and post are the same
/// operation on a counting slot; the two names mirror the two use cases
/// (guard handoff vs. event signal).
pub fn release(slot: &AtomicI32) {
    slot.fetch_add(1, Ordering::Release);
    wake_waiters(slot);
}

pub fn post(slot: &AtomicI32) {
    release(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_once_fails_on_empty_slot() {
        let slot = AtomicI32::new(0);
        assert_eq!(acquire(&slot, 0), Err(SyncError::Timeout));
        // no state mutated by the failed acquisition
        assert_eq!(slot.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn acquire_consumes_a_posted_permit() {
        let slot = AtomicI32::new(0);
        post(&slot);
        post(&slot);
        assert!(acquire(&slot, 0).is_ok());
        assert_eq!(slot.load(Ordering::Relaxed), 1);
        assert!(acquire(&slot, 0).is_ok());
        assert_eq!(acquire(&slot, 0), Err(SyncError::Timeout));
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        let slot = AtomicI32::new(1);
        assert_eq!(acquire(&slot, -2), Err(SyncError::InvalidTimeout));
        assert_eq!(slot.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn timed_acquire_observes_cross_thread_post() {
        let slot = Arc::new(AtomicI32::new(0));
        let poster = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                post(&slot);
            })
        };
        assert!(acquire(&slot, 2000).is_ok());
        poster.join().unwrap();
    }

    #[test]
    fn timed_acquire_times_out() {
        let slot = AtomicI32::new(0);
        let start = std::time::Instant::now();
        assert_eq!(acquire(&slot, 30), Err(SyncError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
