//! Producer-side library surface.
//!
//! External data producers map the shared memory region the worker created
//! and drive it through this client: staging parameters and lookup tables,
//! uploading RF data into the scratch area, queueing work items and waiting
//! on the sync slots. Every fallible call records its error in a last-error
//! slot retrievable as a stable integer code.

use std::cell::Cell;
use std::mem::offset_of;

use crate::error::{LibErrorKind, LibResult};
use crate::filter::{FilterDescriptor, FILTER_SLOTS};
use crate::params::{
    BeamformerParameters, DataKind, ShaderKind, ViewPlaneTag, MAX_COMPUTE_SHADER_STAGES,
    VIEW_PLANE_TAG_COUNT,
};
use crate::shm::{self, DirtyRegions, SharedHeader, SharedMemoryRegion};
use crate::sync::{LockKind, SyncError};
use crate::timing::ComputeStatsTable;
use crate::work_queue::{ExportKind, UploadKind, WorkBody, WorkItem, WorkQueue};

/// A pipeline must start by reducing the raw upload, so only these stages are
/// legal in the first position.
fn validate_pipeline(shaders: &[i32], data_kind: DataKind) -> LibResult<()> {
    if shaders.len() > MAX_COMPUTE_SHADER_STAGES {
        return Err(LibErrorKind::ComputeStageOverflow);
    }
    for &shader in shaders {
        if ShaderKind::from_i32(shader).is_none() {
            return Err(LibErrorKind::InvalidComputeStage);
        }
    }
    match shaders.first() {
        Some(&first)
            if first == ShaderKind::Decode as i32
                || first == ShaderKind::Demodulate as i32 => {}
        _ => return Err(LibErrorKind::InvalidStartShader),
    }
    let demodulates = shaders.contains(&(ShaderKind::Demodulate as i32));
    if demodulates && !matches!(data_kind, DataKind::Int16 | DataKind::Float32) {
        return Err(LibErrorKind::InvalidDemodDataKind);
    }
    Ok(())
}

pub struct BeamformerClient {
    shm: SharedMemoryRegion,
    timeout_ms: Cell<i32>,
    last_error: Cell<LibErrorKind>,
    last_image_plane: Cell<i32>,
}

impl BeamformerClient {
    /// Map the worker's region and check protocol compatibility.
    #[cfg(unix)]
    pub fn open(name: &str) -> LibResult<BeamformerClient> {
        let shm =
            SharedMemoryRegion::open(name).map_err(|_| LibErrorKind::SharedMemory)?;
        if shm.header().version != crate::API_VERSION {
            return Err(LibErrorKind::VersionMismatch);
        }
        Ok(BeamformerClient {
            shm,
            timeout_ms: Cell::new(0),
            last_error: Cell::new(LibErrorKind::None),
            last_image_plane: Cell::new(ViewPlaneTag::Xz as i32),
        })
    }

    pub fn last_error(&self) -> LibErrorKind {
        self.last_error.get()
    }

    pub fn last_error_string(&self) -> &'static str {
        self.last_error.get().as_str()
    }

    /// Default timeout for calls that may block but take no timeout argument.
    /// `-1` blocks forever.
    pub fn set_global_timeout(&self, timeout_ms: i32) -> LibResult<()> {
        self.record(if timeout_ms < -1 {
            Err(LibErrorKind::InvalidTimeout)
        } else {
            self.timeout_ms.set(timeout_ms);
            Ok(())
        })
    }

    fn record<T>(&self, result: LibResult<T>) -> LibResult<T> {
        match &result {
            Err(kind) => self.last_error.set(*kind),
            Ok(_) => self.last_error.set(LibErrorKind::None),
        }
        result
    }

    fn queue(&self) -> &WorkQueue {
        &self.shm.header().external_work_queue
    }

    fn push_work(&self, item: WorkItem) -> LibResult<()> {
        match self.queue().push() {
            Ok(slot) => {
                *slot = item;
                self.queue().push_commit();
                self.shm.post(LockKind::ComputeWorkerSync);
                Ok(())
            }
            Err(_) => Err(LibErrorKind::WorkQueueFull),
        }
    }

    fn lock(&self, kind: LockKind) -> LibResult<()> {
        self.lock_with_timeout(kind, self.timeout_ms.get())
    }

    fn lock_with_timeout(&self, kind: LockKind, timeout_ms: i32) -> LibResult<()> {
        self.shm.lock(kind, timeout_ms).map_err(|err| match err {
            SyncError::InvalidTimeout => LibErrorKind::InvalidTimeout,
            SyncError::Timeout => LibErrorKind::SyncVariable,
        })
    }

    //----------------------------------------------------------------------------------------------
    // staging

    pub fn push_parameters(&self, parameters: &BeamformerParameters) -> LibResult<()> {
        self.record((|| {
            self.lock(LockKind::Parameters)?;
            unsafe {
                std::ptr::addr_of_mut!((*self.shm.header_ptr()).parameters).write(*parameters);
            }
            self.shm.mark_dirty(DirtyRegions::PARAMETERS);
            self.shm.unlock(LockKind::Parameters);
            Ok(())
        })())
    }

    /// Stage the abstract shader chain. It must begin with Decode or
    /// Demodulate; demodulation restricts the upload data kind.
    pub fn push_pipeline(&self, shaders: &[i32], data_kind: DataKind) -> LibResult<()> {
        self.record((|| {
            validate_pipeline(shaders, data_kind)?;
            self.lock(LockKind::ComputePipeline)?;
            unsafe {
                let header = self.shm.header_ptr();
                let dst = std::ptr::addr_of_mut!((*header).shaders) as *mut i32;
                std::ptr::copy_nonoverlapping(shaders.as_ptr(), dst, shaders.len());
                std::ptr::addr_of_mut!((*header).shader_count).write(shaders.len() as u32);
                std::ptr::addr_of_mut!((*header).data_kind).write(data_kind as i32);
            }
            self.shm.mark_dirty(DirtyRegions::COMPUTE_PIPELINE);
            self.shm.unlock(LockKind::ComputePipeline);
            Ok(())
        })())
    }

    /// Set the opaque per-stage parameter (currently the filter slot) of one
    /// pipeline stage.
    pub fn set_pipeline_stage_parameters(
        &self,
        stage_index: usize,
        parameter: i32,
    ) -> LibResult<()> {
        self.record((|| {
            if stage_index >= MAX_COMPUTE_SHADER_STAGES {
                return Err(LibErrorKind::InvalidComputeStage);
            }
            self.lock(LockKind::ComputePipeline)?;
            unsafe {
                let header = self.shm.header_ptr();
                std::ptr::addr_of_mut!((*header).shader_parameters[stage_index].filter_slot)
                    .write(parameter as u32);
            }
            self.shm.mark_dirty(DirtyRegions::COMPUTE_PIPELINE);
            self.shm.unlock(LockKind::ComputePipeline);
            Ok(())
        })())
    }

    fn push_lookup_table<T: bytemuck::Pod>(
        &self,
        values: &[T],
        capacity: usize,
        lock: LockKind,
        kind: UploadKind,
        field_offset: usize,
    ) -> LibResult<()> {
        self.record((|| {
            if values.len() > capacity {
                return Err(LibErrorKind::BufferOverflow);
            }
            self.lock(lock)?;
            let bytes: &[u8] = bytemuck::cast_slice(values);
            unsafe {
                self.shm.write_bytes(field_offset as u64, bytes);
            }
            if let Some(region) = DirtyRegions::for_lock(lock) {
                self.shm.mark_dirty(region);
            }
            self.shm.unlock(lock);
            self.push_work(WorkItem::with_lock(
                WorkBody::UploadBuffer {
                    kind,
                    shared_memory_offset: field_offset as u64,
                    size: bytes.len() as u32,
                },
                lock,
            ))
        })())
    }

    pub fn push_channel_mapping(&self, mapping: &[i16]) -> LibResult<()> {
        self.push_lookup_table(
            mapping,
            crate::params::LOOKUP_TABLE_LEN,
            LockKind::ChannelMapping,
            UploadKind::ChannelMapping,
            offset_of!(SharedHeader, channel_mapping),
        )
    }

    pub fn push_sparse_elements(&self, elements: &[i16]) -> LibResult<()> {
        self.push_lookup_table(
            elements,
            crate::params::LOOKUP_TABLE_LEN,
            LockKind::SparseElements,
            UploadKind::SparseElements,
            offset_of!(SharedHeader, sparse_elements),
        )
    }

    /// `vectors` holds (angle [radians], focal depth [m]) pairs.
    pub fn push_focal_vectors(&self, vectors: &[[f32; 2]]) -> LibResult<()> {
        self.push_lookup_table(
            vectors,
            crate::params::LOOKUP_TABLE_LEN,
            LockKind::FocalVectors,
            UploadKind::FocalVectors,
            offset_of!(SharedHeader, focal_vectors),
        )
    }

    //----------------------------------------------------------------------------------------------
    // data upload and compute

    /// Copy an RF acquisition into the scratch area and queue its upload.
    pub fn push_data(&self, data: &[u8]) -> LibResult<()> {
        self.record((|| {
            if data.len() > shm::max_scratch_size() {
                return Err(LibErrorKind::BufferOverflow);
            }
            self.lock(LockKind::RfData)?;
            unsafe {
                self.shm.write_bytes(shm::scratch_offset() as u64, data);
            }
            self.shm.mark_dirty(DirtyRegions::RF_DATA);
            self.shm.unlock(LockKind::RfData);
            self.push_work(WorkItem::with_lock(
                WorkBody::UploadBuffer {
                    kind: UploadKind::RfData,
                    shared_memory_offset: shm::scratch_offset() as u64,
                    size: data.len() as u32,
                },
                LockKind::RfData,
            ))
        })())
    }

    /// Upload and immediately beamform into a frame tagged with
    /// `image_plane`.
    pub fn push_data_with_compute(&self, data: &[u8], image_plane: u32) -> LibResult<()> {
        self.record((|| {
            if image_plane >= VIEW_PLANE_TAG_COUNT as u32 {
                return Err(LibErrorKind::InvalidImagePlane);
            }
            self.push_data(data)?;
            self.last_image_plane.set(image_plane as i32);
            self.push_work(WorkItem::with_lock(
                WorkBody::ComputeIndirect {
                    view_plane: image_plane as i32,
                },
                LockKind::DispatchCompute,
            ))
        })())
    }

    /// Queue a beamform of the most recently used view plane and wait until
    /// the worker starts it.
    pub fn start_compute(&self, timeout_ms: i32) -> LibResult<()> {
        self.record((|| {
            self.push_work(WorkItem::with_lock(
                WorkBody::ComputeIndirect {
                    view_plane: self.last_image_plane.get(),
                },
                LockKind::DispatchCompute,
            ))?;
            self.wait_for_compute_dispatch(timeout_ms)
        })())
    }

    /// Block until a previously queued beamform begins dispatching.
    pub fn wait_for_compute_dispatch(&self, timeout_ms: i32) -> LibResult<()> {
        self.record(self.lock_with_timeout(LockKind::DispatchCompute, timeout_ms))
    }

    pub fn create_kaiser_low_pass_filter(
        &self,
        beta: f32,
        cutoff_frequency: f32,
        length: i16,
        slot: u8,
    ) -> LibResult<()> {
        self.record((|| {
            if (slot as usize) >= FILTER_SLOTS {
                return Err(LibErrorKind::InvalidAccess);
            }
            self.push_work(WorkItem::new(WorkBody::CreateFilter {
                slot: slot as u32,
                descriptor: FilterDescriptor::Kaiser {
                    cutoff_frequency,
                    beta,
                    length: length as i32,
                },
            }))
        })())
    }

    //----------------------------------------------------------------------------------------------
    // exports

    /// Download the rolling compute timing table.
    pub fn compute_timings(
        &self,
        output: &mut ComputeStatsTable,
        timeout_ms: i32,
    ) -> LibResult<()> {
        self.record((|| {
            self.push_work(WorkItem::with_lock(
                WorkBody::ExportBuffer {
                    kind: ExportKind::Stats,
                    size: std::mem::size_of::<ComputeStatsTable>() as u32,
                },
                LockKind::ScratchSpace,
            ))?;
            self.lock_with_timeout(LockKind::ExportSync, timeout_ms)?;
            let bytes = unsafe {
                self.shm.bytes(
                    shm::scratch_offset() as u64,
                    std::mem::size_of::<ComputeStatsTable>(),
                )
            };
            *output = *bytemuck::from_bytes(bytes);
            Ok(())
        })())
    }

    /// Upload, beamform and read the complex output volume back. `out_data`
    /// receives two floats per output point.
    pub fn beamform_data_synchronized(
        &self,
        data: &[u8],
        output_points: [i32; 3],
        out_data: &mut [f32],
        timeout_ms: i32,
    ) -> LibResult<()> {
        self.record((|| {
            let points = [
                output_points[0].max(1),
                output_points[1].max(1),
                output_points[2].max(1),
            ];
            let out_size = points[0] as usize * points[1] as usize * points[2] as usize * 2 * 4;
            if out_data.len() * 4 < out_size {
                return Err(LibErrorKind::ExportSpaceOverflow);
            }

            self.lock(LockKind::Parameters)?;
            unsafe {
                let header = self.shm.header_ptr();
                let dst =
                    std::ptr::addr_of_mut!((*header).parameters.output_points) as *mut i32;
                dst.write(points[0]);
                dst.add(1).write(points[1]);
                dst.add(2).write(points[2]);
                dst.add(3).write(1);
            }
            self.shm.mark_dirty(DirtyRegions::PARAMETERS);
            self.shm.unlock(LockKind::Parameters);

            self.push_data(data)?;
            self.push_work(WorkItem::new(WorkBody::ComputeIndirect {
                view_plane: self.last_image_plane.get(),
            }))?;
            self.push_work(WorkItem::with_lock(
                WorkBody::ExportBuffer {
                    kind: ExportKind::BeamformedData,
                    size: out_size as u32,
                },
                LockKind::ScratchSpace,
            ))?;

            self.lock_with_timeout(LockKind::ExportSync, timeout_ms)?;
            let bytes = unsafe { self.shm.bytes(shm::scratch_offset() as u64, out_size) };
            out_data[..out_size / 4].copy_from_slice(bytemuck::cast_slice(bytes));
            Ok(())
        })())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_must_start_with_decode_or_demodulate() {
        let ok = [ShaderKind::Decode as i32, ShaderKind::Das as i32];
        assert!(validate_pipeline(&ok, DataKind::Int16).is_ok());

        let ok = [
            ShaderKind::Demodulate as i32,
            ShaderKind::Decode as i32,
            ShaderKind::Das as i32,
        ];
        assert!(validate_pipeline(&ok, DataKind::Int16).is_ok());

        let bad = [ShaderKind::Das as i32];
        assert_eq!(
            validate_pipeline(&bad, DataKind::Int16),
            Err(LibErrorKind::InvalidStartShader)
        );
        assert_eq!(
            validate_pipeline(&[], DataKind::Int16),
            Err(LibErrorKind::InvalidStartShader)
        );
    }

    #[test]
    fn pipeline_stage_validation() {
        let overflow = [ShaderKind::Decode as i32; MAX_COMPUTE_SHADER_STAGES + 1];
        assert_eq!(
            validate_pipeline(&overflow, DataKind::Int16),
            Err(LibErrorKind::ComputeStageOverflow)
        );

        let unknown = [ShaderKind::Decode as i32, 42];
        assert_eq!(
            validate_pipeline(&unknown, DataKind::Int16),
            Err(LibErrorKind::InvalidComputeStage)
        );
    }

    #[test]
    fn demodulation_restricts_data_kind() {
        let chain = [
            ShaderKind::Demodulate as i32,
            ShaderKind::Decode as i32,
            ShaderKind::Das as i32,
        ];
        assert!(validate_pipeline(&chain, DataKind::Int16).is_ok());
        assert!(validate_pipeline(&chain, DataKind::Float32).is_ok());
        assert_eq!(
            validate_pipeline(&chain, DataKind::Int16Complex),
            Err(LibErrorKind::InvalidDemodDataKind)
        );
        assert_eq!(
            validate_pipeline(&chain, DataKind::Float32Complex),
            Err(LibErrorKind::InvalidDemodDataKind)
        );
    }

    #[cfg(target_os = "linux")]
    mod shared_memory {
        use super::super::*;
        use crate::work_queue::WorkBody;

        fn region_name(tag: &str) -> String {
            format!("/bf-client-{}-{}", tag, std::process::id())
        }

        #[test]
        fn staging_round_trip() {
            let name = region_name("stage");
            let server = SharedMemoryRegion::create(&name).unwrap();
            let client = BeamformerClient::open(&name).unwrap();

            let mut parameters = BeamformerParameters::default();
            parameters.dec_data_dim = [2048, 64, 64, 0];
            parameters.sampling_frequency = 40.0e6;
            client.push_parameters(&parameters).unwrap();
            assert_eq!(server.header().parameters, parameters);
            assert!(server.dirty_regions().contains(DirtyRegions::PARAMETERS));

            let chain = [
                ShaderKind::Demodulate as i32,
                ShaderKind::Decode as i32,
                ShaderKind::Das as i32,
            ];
            client.push_pipeline(&chain, DataKind::Int16).unwrap();
            assert_eq!(server.header().shader_count, 3);
            assert_eq!(&server.header().shaders[..3], &chain);
            assert!(server
                .dirty_regions()
                .contains(DirtyRegions::COMPUTE_PIPELINE));

            // the upload landed in the queue with its completion lock
            client.push_channel_mapping(&[1i16; 256]).unwrap();
            let item = server.header().external_work_queue.pop().unwrap();
            match item.body {
                WorkBody::UploadBuffer { kind, size, .. } => {
                    assert_eq!(kind, UploadKind::ChannelMapping);
                    assert_eq!(size, 512);
                }
                other => panic!("unexpected item {:?}", other),
            }
            assert_eq!(item.lock, LockKind::ChannelMapping as i32);
        }

        #[test]
        fn rf_upload_fills_scratch_and_queues_compute() {
            let name = region_name("rf");
            let server = SharedMemoryRegion::create(&name).unwrap();
            let client = BeamformerClient::open(&name).unwrap();

            let data: Vec<u8> = (0..1024u32).map(|v| v as u8).collect();
            client.push_data_with_compute(&data, 0).unwrap();

            let scratch = unsafe { server.bytes(shm::scratch_offset() as u64, data.len()) };
            assert_eq!(scratch, &data[..]);
            assert!(server.dirty_regions().contains(DirtyRegions::RF_DATA));

            let queue = &server.header().external_work_queue;
            match queue.pop().unwrap().body {
                WorkBody::UploadBuffer { kind, size, .. } => {
                    assert_eq!(kind, UploadKind::RfData);
                    assert_eq!(size, 1024);
                }
                other => panic!("unexpected item {:?}", other),
            }
            queue.pop_commit();
            match queue.pop().unwrap().body {
                WorkBody::ComputeIndirect { view_plane } => assert_eq!(view_plane, 0),
                other => panic!("unexpected item {:?}", other),
            }
            queue.pop_commit();
            assert!(queue.pop().is_none());
        }

        #[test]
        fn invalid_image_plane_is_rejected() {
            let name = region_name("plane");
            let _server = SharedMemoryRegion::create(&name).unwrap();
            let client = BeamformerClient::open(&name).unwrap();

            let result = client.push_data_with_compute(&[0u8; 16], 99);
            assert_eq!(result, Err(LibErrorKind::InvalidImagePlane));
            assert_eq!(client.last_error(), LibErrorKind::InvalidImagePlane);
        }

        #[test]
        fn work_queue_full_surfaces_to_the_caller() {
            let name = region_name("full");
            let _server = SharedMemoryRegion::create(&name).unwrap();
            let client = BeamformerClient::open(&name).unwrap();

            for _ in 0..WorkQueue::capacity() {
                client
                    .push_work(WorkItem::new(WorkBody::ComputeIndirect { view_plane: 0 }))
                    .unwrap();
            }
            let result =
                client.push_work(WorkItem::new(WorkBody::ComputeIndirect { view_plane: 0 }));
            assert_eq!(result, Err(LibErrorKind::WorkQueueFull));
        }
    }
}
