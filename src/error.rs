//! Stable error codes for the producer-facing library surface.
//!
//! The integer values are part of the wire contract: external callers match on
//! them across language boundaries, so variants must never be renumbered.

use std::{error, fmt};

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LibErrorKind {
    None = 0,
    VersionMismatch = 1,
    InvalidAccess = 2,
    ComputeStageOverflow = 3,
    InvalidComputeStage = 4,
    InvalidStartShader = 5,
    InvalidDemodDataKind = 6,
    InvalidImagePlane = 7,
    BufferOverflow = 8,
    WorkQueueFull = 9,
    ExportSpaceOverflow = 10,
    SharedMemory = 11,
    SyncVariable = 12,
    InvalidTimeout = 13,
}

impl LibErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LibErrorKind::None => "None",
            LibErrorKind::VersionMismatch => "host-library version mismatch",
            LibErrorKind::InvalidAccess => "library in invalid state",
            LibErrorKind::ComputeStageOverflow => "compute stage overflow",
            LibErrorKind::InvalidComputeStage => "invalid compute shader stage",
            LibErrorKind::InvalidStartShader => "starting shader not Decode or Demodulate",
            LibErrorKind::InvalidDemodDataKind => {
                "data kind for demodulation not Int16 or Float"
            }
            LibErrorKind::InvalidImagePlane => "invalid image plane",
            LibErrorKind::BufferOverflow => "passed buffer size exceeds available space",
            LibErrorKind::WorkQueueFull => "work queue full",
            LibErrorKind::ExportSpaceOverflow => "not enough space for data export",
            LibErrorKind::SharedMemory => "failed to open shared memory region",
            LibErrorKind::SyncVariable => "failed to acquire lock within timeout period",
            LibErrorKind::InvalidTimeout => "invalid timeout value",
        }
    }
}

impl fmt::Display for LibErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl error::Error for LibErrorKind {}

pub type LibResult<T> = std::result::Result<T, LibErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(LibErrorKind::None as i32, 0);
        assert_eq!(LibErrorKind::InvalidStartShader as i32, 5);
        assert_eq!(LibErrorKind::WorkQueueFull as i32, 9);
        assert_eq!(LibErrorKind::InvalidTimeout as i32, 13);
    }
}
