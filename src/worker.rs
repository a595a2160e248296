//! The GPU worker: owns the GL context, the executor and the shared memory
//! region, and drains the work queues until asked to exit.

use std::os::raw::c_void;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{error, fmt, ptr, slice, str};

use crate::accel::AcceleratorOps;
use crate::api as gl;
use crate::api::types::*;
use crate::executor::{ComputeExecutor, DEFAULT_MAX_DISPATCH_POINTS};
use crate::frame::ComputeFrame;
use crate::reload::ReloadCoordinator;
use crate::shm::{SharedMemoryError, SharedMemoryRegion};
use crate::sync::{self, LockKind};
use crate::timing::{ComputeStats, TimingRing};
use crate::work_queue::{QueueFull, WorkItem, WorkQueue};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GlVendor {
    Amd,
    Arm,
    Intel,
    Nvidia,
    Unknown,
}

/// Implementation limits queried once at setup.
#[derive(Copy, Clone, Debug)]
pub struct GlParams {
    pub vendor: GlVendor,
    pub version_major: i32,
    pub version_minor: i32,
    pub texture_buffer_offset_alignment: i32,
    pub max_texture_buffer_size: i32,
    pub max_2d_texture_dim: i32,
    pub max_3d_texture_dim: i32,
    pub max_ssbo_size: i32,
    pub max_ubo_size: i32,
    /// [ns]
    pub max_server_wait_time: i64,
}

impl Default for GlParams {
    fn default() -> GlParams {
        GlParams {
            vendor: GlVendor::Unknown,
            version_major: 0,
            version_minor: 0,
            texture_buffer_offset_alignment: 1,
            max_texture_buffer_size: 0,
            max_2d_texture_dim: 2048,
            max_3d_texture_dim: 2048,
            max_ssbo_size: 0,
            max_ubo_size: 0,
            max_server_wait_time: 0,
        }
    }
}

impl GlParams {
    /// Query the current context. Requires loaded bindings.
    pub fn populate() -> GlParams {
        let getint = |param| unsafe {
            let mut v = 0;
            gl::GetIntegerv(param, &mut v);
            v
        };
        let getint64 = |param| unsafe {
            let mut v = 0i64;
            gl::GetInteger64v(param, &mut v);
            v
        };

        let vendor = unsafe {
            let ptr = gl::GetString(gl::VENDOR);
            if ptr.is_null() {
                ""
            } else {
                std::ffi::CStr::from_ptr(ptr as *const _)
                    .to_str()
                    .unwrap_or("")
            }
        };
        let vendor_id = if vendor.starts_with("AMD") || vendor.starts_with("ATI") {
            GlVendor::Amd
        } else if vendor.starts_with("ARM") {
            GlVendor::Arm
        } else if vendor.starts_with("Intel") {
            GlVendor::Intel
        } else if vendor.starts_with("NVIDIA") {
            GlVendor::Nvidia
        } else {
            GlVendor::Unknown
        };

        GlParams {
            vendor: vendor_id,
            version_major: getint(gl::MAJOR_VERSION),
            version_minor: getint(gl::MINOR_VERSION),
            texture_buffer_offset_alignment: getint(gl::TEXTURE_BUFFER_OFFSET_ALIGNMENT),
            max_texture_buffer_size: getint(gl::MAX_TEXTURE_BUFFER_SIZE),
            max_2d_texture_dim: getint(gl::MAX_TEXTURE_SIZE),
            max_3d_texture_dim: getint(gl::MAX_3D_TEXTURE_SIZE),
            max_ssbo_size: getint(gl::MAX_SHADER_STORAGE_BLOCK_SIZE),
            max_ubo_size: getint(gl::MAX_UNIFORM_BLOCK_SIZE),
            max_server_wait_time: getint64(gl::MAX_SERVER_WAIT_TIMEOUT),
        }
    }
}

extern "system" fn debug_callback(
    _source: GLenum,
    _ty: GLenum,
    _id: GLuint,
    severity: GLenum,
    length: GLsizei,
    msg: *const GLchar,
    _user: *mut c_void,
) {
    let text = unsafe {
        str::from_utf8(slice::from_raw_parts(msg as *const u8, length as usize)).unwrap_or("")
    };
    let level = match severity {
        gl::DEBUG_SEVERITY_HIGH => log::Level::Error,
        gl::DEBUG_SEVERITY_MEDIUM => log::Level::Warn,
        gl::DEBUG_SEVERITY_LOW => log::Level::Info,
        _ => log::Level::Debug,
    };
    log!(level, "(GL) {}", text);
}

/// Worker settings, read from the `config` stack with built-in fallbacks.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub shared_memory_name: String,
    pub shader_dir: PathBuf,
    pub max_dispatch_points: u32,
}

impl Default for WorkerConfig {
    fn default() -> WorkerConfig {
        WorkerConfig {
            shared_memory_name: "/beamformer".to_string(),
            shader_dir: PathBuf::from("shaders"),
            max_dispatch_points: DEFAULT_MAX_DISPATCH_POINTS,
        }
    }
}

impl WorkerConfig {
    pub fn from_config(cfg: &config::Config) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            shared_memory_name: cfg
                .get::<String>("beamformer.shared_memory_name")
                .unwrap_or(defaults.shared_memory_name),
            shader_dir: cfg
                .get::<String>("beamformer.shader_dir")
                .map(PathBuf::from)
                .unwrap_or(defaults.shader_dir),
            max_dispatch_points: cfg
                .get::<u32>("beamformer.max_dispatch_points")
                .unwrap_or(defaults.max_dispatch_points),
        }
    }
}

#[derive(Debug)]
pub enum WorkerError {
    SharedMemory(SharedMemoryError),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkerError::SharedMemory(err) => write!(f, "shared memory setup failed: {}", err),
        }
    }
}

impl error::Error for WorkerError {}

impl From<SharedMemoryError> for WorkerError {
    fn from(err: SharedMemoryError) -> WorkerError {
        WorkerError::SharedMemory(err)
    }
}

pub struct ComputeWorker {
    shm: SharedMemoryRegion,
    executor: ComputeExecutor,
    internal_queue: Box<WorkQueue>,
    timing: Arc<TimingRing>,
    stats: Arc<Mutex<ComputeStats>>,
    should_exit: Arc<AtomicBool>,
}

impl ComputeWorker {
    /// Set up the worker against an already-current GL context. `loader`
    /// resolves GL symbols (supplied by whoever created the context).
    pub fn new<F>(
        config: &WorkerConfig,
        loader: F,
        accel: Box<dyn AcceleratorOps>,
    ) -> Result<ComputeWorker, WorkerError>
    where
        F: FnMut(&'static str) -> *const c_void,
    {
        gl::load_with(loader);

        unsafe {
            if gl::DebugMessageCallback::is_loaded() {
                gl::Enable(gl::DEBUG_OUTPUT);
                gl::DebugMessageCallback(Some(debug_callback), ptr::null());
            }
        }

        let gl_params = GlParams::populate();
        debug!(
            "OpenGL {}.{} (vendor {:?}, max 3d texture dim {})",
            gl_params.version_major,
            gl_params.version_minor,
            gl_params.vendor,
            gl_params.max_3d_texture_dim
        );

        let shm = SharedMemoryRegion::create(&config.shared_memory_name)?;
        let timing: Arc<TimingRing> = Arc::from(TimingRing::new_boxed());
        let stats = Arc::new(Mutex::new(ComputeStats::new()));

        let reload = ReloadCoordinator::with_default_recipes(&config.shader_dir);
        let mut executor = ComputeExecutor::new(
            gl_params,
            reload,
            accel,
            Arc::clone(&timing),
            Arc::clone(&stats),
            config.max_dispatch_points,
        );
        if !executor.load_all_shaders() {
            warn!("one or more compute programs failed to build; continuing");
        }

        Ok(ComputeWorker {
            shm,
            executor,
            internal_queue: WorkQueue::new_boxed(),
            timing,
            stats,
            should_exit: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shared_memory(&self) -> &SharedMemoryRegion {
        &self.shm
    }

    pub fn executor(&self) -> &ComputeExecutor {
        &self.executor
    }

    pub fn timing_handle(&self) -> Arc<TimingRing> {
        Arc::clone(&self.timing)
    }

    pub fn stats_handle(&self) -> Arc<Mutex<ComputeStats>> {
        Arc::clone(&self.stats)
    }

    pub fn exit_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_exit)
    }

    pub fn latest_frame(&self) -> Option<&ComputeFrame> {
        self.executor.frames().latest()
    }

    /// Queue a work item on the worker-internal queue.
    pub fn push_work(&self, item: WorkItem) -> Result<(), QueueFull> {
        let slot = self.internal_queue.push()?;
        *slot = item;
        self.internal_queue.push_commit();
        self.wake();
        Ok(())
    }

    /// Wake the worker loop, e.g. after committing external work.
    pub fn wake(&self) {
        self.shm.post(LockKind::ComputeWorkerSync);
    }

    /// Drain the external queue, then the internal one.
    pub fn complete_compute(&mut self) {
        let header = self.shm.header();
        self.executor
            .complete_queue(&self.shm, &header.external_work_queue, true);
        self.executor
            .complete_queue(&self.shm, &self.internal_queue, false);
    }

    /// Run until [`ComputeWorker::exit_handle`] is flipped. Sleeps on the
    /// worker sync slot between batches; producers wake it after committing.
    pub fn run(&mut self) {
        while !self.should_exit.load(Ordering::Acquire) {
            self.complete_compute();

            let slot = &self.shm.header().locks[LockKind::ComputeWorkerSync as usize];
            if slot.swap(0, Ordering::AcqRel) == 0 {
                // bounded wait so exit requests are honoured without a wake
                sync::wait_on_value(slot, 0, 100);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.shared_memory_name, "/beamformer");
        assert_eq!(cfg.shader_dir, PathBuf::from("shaders"));
        assert_eq!(cfg.max_dispatch_points, DEFAULT_MAX_DISPATCH_POINTS);
    }

    #[test]
    fn config_reads_overrides() {
        let mut cfg = config::Config::default();
        cfg.set("beamformer.shared_memory_name", "/bf-test").unwrap();
        cfg.set("beamformer.max_dispatch_points", 1024i64).unwrap();
        let worker_cfg = WorkerConfig::from_config(&cfg);
        assert_eq!(worker_cfg.shared_memory_name, "/bf-test");
        assert_eq!(worker_cfg.max_dispatch_points, 1024);
        assert_eq!(worker_cfg.shader_dir, PathBuf::from("shaders"));
    }
}
