//! Real-time ultrasound beamforming compute core.
//!
//! The crate is split along the process boundary of the system: a single
//! GPU-owning worker ([`worker::ComputeWorker`]) drains work queues embedded
//! in a shared memory region ([`shm::SharedMemoryRegion`]) that external
//! producers fill through the library surface ([`client::BeamformerClient`]).
//! Raw RF acquisitions are decoded, optionally demodulated, and delay-and-sum
//! beamformed into a ring of 3-D output volumes by a dynamically planned chain
//! of compute kernels ([`pipeline`], [`executor`]).

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub(crate) mod api;

pub mod accel;
pub mod client;
pub mod error;
pub mod executor;
pub mod filter;
pub mod frame;
pub mod math;
pub mod params;
pub mod pipeline;
pub mod reload;
pub mod shm;
pub mod sync;
pub mod timing;
pub mod work_queue;
pub mod worker;

pub use crate::client::BeamformerClient;
pub use crate::error::LibErrorKind;
pub use crate::params::{BeamformerParameters, DasKind, DataKind, ShaderKind, ViewPlaneTag};
pub use crate::worker::{ComputeWorker, WorkerConfig};

/// Version of the shared memory protocol. Written into the region header by
/// the worker and checked by every client on open.
pub const API_VERSION: u32 = 1;

pub fn api_version() -> u32 {
    API_VERSION
}
