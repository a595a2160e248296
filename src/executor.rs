//! The compute executor.
//!
//! Owns every GPU object (programs, SSBOs, textures, queries) and runs work
//! items against the single GL context of the worker thread. Buffer and
//! texture storage reallocates lazily when dimensions change; DAS dispatches
//! are tiled so no single dispatch outlives the OS GPU watchdog.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::accel::AcceleratorOps;
use crate::api as gl;
use crate::api::types::*;
use crate::filter::FilterStore;
use crate::frame::{BeamformFrame, FrameRing};
use crate::math::{self, ceil_div, or_one};
use crate::params::*;
use crate::pipeline::{das_voxel_transform_matrix, ComputePipeline, PipelineSnapshot};
use crate::reload::ReloadCoordinator;
use crate::shm::{self, DirtyRegions, SharedMemoryRegion};
use crate::sync::LockKind;
use crate::timing::{ComputeStats, ComputeStatsTable, TimingEvent, TimingRing};
use crate::work_queue::{ExportKind, UploadKind, WorkBody, WorkQueue};
use crate::worker::GlParams;

const UBO_DECODE: usize = 0;
const UBO_DEMOD: usize = 1;
const UBO_DAS: usize = 2;
const UBO_COUNT: usize = 3;

/// Upper bound on voxels per DAS dispatch; keeps a single dispatch safely
/// below the OS watchdog threshold.
pub const DEFAULT_MAX_DISPATCH_POINTS: u32 = 64 * 1024;

fn label_gl_object(identifier: GLenum, object: GLuint, label: &str) {
    if let Ok(name) = std::ffi::CString::new(label) {
        unsafe {
            gl::ObjectLabel(
                identifier,
                object,
                name.as_bytes().len() as GLsizei,
                name.as_ptr(),
            );
        }
    }
}

/// Walks a 3-D grid in dispatch-sized tiles, keeping every dispatch at or
/// below `max_points` invocations.
#[derive(Debug)]
pub(crate) struct ComputeCursor {
    cursor: [i32; 3],
    dispatch: [u32; 3],
    target: [i32; 3],
    points_per_dispatch: u32,
    completed_points: u32,
    total_points: u32,
}

impl ComputeCursor {
    pub(crate) fn new(dim: [i32; 3], max_points: u32) -> ComputeCursor {
        let invocations = DAS_LOCAL_SIZE_X * DAS_LOCAL_SIZE_Y * DAS_LOCAL_SIZE_Z;

        let mut dispatch = [0u32; 3];
        dispatch[1] = or_one(
            (max_points / invocations).min(ceil_div(dim[1] as u32, DAS_LOCAL_SIZE_Y)),
        );
        let remaining = max_points / dispatch[1];
        dispatch[0] =
            or_one((remaining / invocations).min(ceil_div(dim[0] as u32, DAS_LOCAL_SIZE_X)));
        dispatch[2] = or_one(
            (remaining / (invocations * dispatch[0]))
                .min(ceil_div(dim[2] as u32, DAS_LOCAL_SIZE_Z)),
        );

        let target = [
            (dim[0] / dispatch[0] as i32 / DAS_LOCAL_SIZE_X as i32).max(1),
            (dim[1] / dispatch[1] as i32 / DAS_LOCAL_SIZE_Y as i32).max(1),
            (dim[2] / dispatch[2] as i32 / DAS_LOCAL_SIZE_Z as i32).max(1),
        ];

        let points_per_dispatch = (dispatch[0] * DAS_LOCAL_SIZE_X)
            * (dispatch[1] * DAS_LOCAL_SIZE_Y)
            * (dispatch[2] * DAS_LOCAL_SIZE_Z);

        ComputeCursor {
            cursor: [0; 3],
            dispatch,
            target,
            points_per_dispatch,
            completed_points: 0,
            total_points: (dim[0] * dim[1] * dim[2]) as u32,
        }
    }

    pub(crate) fn dispatch(&self) -> [u32; 3] {
        self.dispatch
    }

    pub(crate) fn points_per_dispatch(&self) -> u32 {
        self.points_per_dispatch
    }

    pub(crate) fn total_points(&self) -> u32 {
        self.total_points
    }

    pub(crate) fn finished(&self) -> bool {
        self.completed_points >= self.total_points
    }

    /// Advance to the next tile and return its voxel offset.
    pub(crate) fn step(&mut self) -> [i32; 3] {
        self.cursor[0] += 1;
        if self.cursor[0] >= self.target[0] {
            self.cursor[0] = 0;
            self.cursor[1] += 1;
            if self.cursor[1] >= self.target[1] {
                self.cursor[1] = 0;
                self.cursor[2] += 1;
            }
        }
        self.completed_points += self.points_per_dispatch;

        [
            self.cursor[0] * (self.dispatch[0] * DAS_LOCAL_SIZE_X) as i32,
            self.cursor[1] * (self.dispatch[1] * DAS_LOCAL_SIZE_Y) as i32,
            self.cursor[2] * (self.dispatch[2] * DAS_LOCAL_SIZE_Z) as i32,
        ]
    }
}

pub struct ComputeExecutor {
    programs: [GLuint; SHADER_KIND_COUNT],

    // Decoded data is only relevant within a single frame; two buffers swap
    // roles when chaining compute stages.
    rf_data_ssbos: [GLuint; 2],
    last_output_ssbo_index: usize,
    raw_data_ssbo: GLuint,
    rf_raw_size: u32,
    dec_data_dim: [u32; 4],

    ubos: [GLuint; UBO_COUNT],

    channel_mapping_texture: GLuint,
    sparse_elements_texture: GLuint,
    focal_vectors_texture: GLuint,
    hadamard_texture: GLuint,

    rf_data_timestamp_query: GLuint,
    shader_timer_ids: [GLuint; MAX_COMPUTE_SHADER_STAGES],

    pipeline: ComputePipeline,
    filters: FilterStore,
    frames: Box<FrameRing>,
    reload: ReloadCoordinator,
    accel: Box<dyn AcceleratorOps>,

    timing: Arc<TimingRing>,
    stats: Arc<Mutex<ComputeStats>>,

    gl_params: GlParams,
    max_dispatch_points: u32,
    cycle_t: u32,

    processing_progress: AtomicU32,
    processing_compute: AtomicBool,
    ui_read_params: AtomicBool,
}

impl ComputeExecutor {
    /// Build the executor against the current GL context. Allocates the UBOs,
    /// lookup table textures and query objects; bulk storage waits for the
    /// first RF upload.
    pub fn new(
        gl_params: GlParams,
        reload: ReloadCoordinator,
        accel: Box<dyn AcceleratorOps>,
        timing: Arc<TimingRing>,
        stats: Arc<Mutex<ComputeStats>>,
        max_dispatch_points: u32,
    ) -> ComputeExecutor {
        let mut ubos = [0; UBO_COUNT];
        let mut channel_mapping_texture = 0;
        let mut sparse_elements_texture = 0;
        let mut focal_vectors_texture = 0;
        let mut rf_data_timestamp_query = 0;
        let mut shader_timer_ids = [0; MAX_COMPUTE_SHADER_STAGES];

        unsafe {
            gl::CreateBuffers(UBO_COUNT as GLsizei, ubos.as_mut_ptr());
            for (index, size, label) in [
                (UBO_DECODE, std::mem::size_of::<DecodeUbo>(), "DecodeUbo"),
                (UBO_DEMOD, std::mem::size_of::<DemodUbo>(), "DemodUbo"),
                (
                    UBO_DAS,
                    std::mem::size_of::<BeamformerParameters>(),
                    "BeamformerParameters",
                ),
            ] {
                gl::NamedBufferStorage(
                    ubos[index],
                    size as GLsizeiptr,
                    std::ptr::null(),
                    gl::DYNAMIC_STORAGE_BIT,
                );
                label_gl_object(gl::BUFFER, ubos[index], label);
            }

            gl::CreateTextures(gl::TEXTURE_1D, 1, &mut channel_mapping_texture);
            gl::CreateTextures(gl::TEXTURE_1D, 1, &mut sparse_elements_texture);
            gl::CreateTextures(gl::TEXTURE_1D, 1, &mut focal_vectors_texture);
            gl::TextureStorage1D(
                channel_mapping_texture,
                1,
                gl::R16I,
                LOOKUP_TABLE_LEN as GLsizei,
            );
            gl::TextureStorage1D(
                sparse_elements_texture,
                1,
                gl::R16I,
                LOOKUP_TABLE_LEN as GLsizei,
            );
            gl::TextureStorage1D(
                focal_vectors_texture,
                1,
                gl::RG32F,
                LOOKUP_TABLE_LEN as GLsizei,
            );
            label_gl_object(gl::TEXTURE, channel_mapping_texture, "Channel_Mapping");
            label_gl_object(gl::TEXTURE, sparse_elements_texture, "Sparse_Elements");
            label_gl_object(gl::TEXTURE, focal_vectors_texture, "Focal_Vectors");

            gl::CreateQueries(
                gl::TIME_ELAPSED,
                MAX_COMPUTE_SHADER_STAGES as GLsizei,
                shader_timer_ids.as_mut_ptr(),
            );
            gl::CreateQueries(gl::TIMESTAMP, 1, &mut rf_data_timestamp_query);
            // arm the RF timestamp so the first upload reads a valid counter
            gl::QueryCounter(rf_data_timestamp_query, gl::TIMESTAMP);
        }

        ComputeExecutor {
            programs: [0; SHADER_KIND_COUNT],
            rf_data_ssbos: [0; 2],
            last_output_ssbo_index: 0,
            raw_data_ssbo: 0,
            rf_raw_size: 0,
            dec_data_dim: [0; 4],
            ubos,
            channel_mapping_texture,
            sparse_elements_texture,
            focal_vectors_texture,
            hadamard_texture: 0,
            rf_data_timestamp_query,
            shader_timer_ids,
            pipeline: ComputePipeline::default(),
            filters: FilterStore::new(),
            frames: FrameRing::new_boxed(),
            reload,
            accel,
            timing,
            stats,
            gl_params,
            max_dispatch_points,
            cycle_t: 0,
            processing_progress: AtomicU32::new(0),
            processing_compute: AtomicBool::new(false),
            ui_read_params: AtomicBool::new(false),
        }
    }

    /// Compile every compute program from its source recipe.
    pub fn load_all_shaders(&mut self) -> bool {
        let mut ok = true;
        for kind in [
            ShaderKind::Decode,
            ShaderKind::Demodulate,
            ShaderKind::Das,
            ShaderKind::MinMax,
            ShaderKind::Sum,
        ] {
            ok &= self.reload.reload(kind, &mut self.programs);
        }
        ok
    }

    pub fn frames(&self) -> &FrameRing {
        &self.frames
    }

    /// Fraction of the running DAS pass that has completed, monotonically
    /// increasing within one compute.
    pub fn processing_progress(&self) -> f32 {
        f32::from_bits(self.processing_progress.load(Ordering::Acquire))
    }

    fn set_progress(&self, value: f32) {
        self.processing_progress
            .store(value.to_bits(), Ordering::Release);
    }

    pub fn processing_compute(&self) -> bool {
        self.processing_compute.load(Ordering::Acquire)
    }

    /// True when the last plan came from the external queue and the UI must
    /// re-read the parameter block.
    pub fn take_ui_read_params(&self) -> bool {
        self.ui_read_params.swap(false, Ordering::AcqRel)
    }

    /// Handle a single work item outside of any queue.
    pub fn run(&mut self, shm: &SharedMemoryRegion, item: crate::work_queue::WorkItem) {
        let lock = LockKind::from_i32(item.lock);
        match item.body {
            WorkBody::Compute { frame_id } => self.handle_compute(shm, frame_id, lock, false),
            WorkBody::ComputeIndirect { view_plane } => {
                let plane = ViewPlaneTag::from_i32(view_plane).unwrap_or(ViewPlaneTag::Xz);
                let frame_id = self.frames.acquire(plane);
                let lock = lock.or(Some(LockKind::DispatchCompute));
                self.handle_compute(shm, frame_id, lock, false);
            }
            WorkBody::ReloadShader { kind } => {
                if let Some(kind) = ShaderKind::from_i32(kind) {
                    let ok = self.reload.reload(kind, &mut self.programs);
                    if ok {
                        let header = shm.header();
                        self.accel
                            .init(header.parameters.rf_raw_dim, self.dec_data_dim);
                        if self.raw_data_ssbo != 0 {
                            let plane = self
                                .frames
                                .latest()
                                .map(|f| f.view_plane)
                                .unwrap_or(ViewPlaneTag::Xz);
                            let frame_id = self.frames.acquire(plane);
                            self.handle_compute(
                                shm,
                                frame_id,
                                Some(LockKind::DispatchCompute),
                                false,
                            );
                        }
                    }
                }
            }
            WorkBody::CreateFilter { slot, descriptor } => {
                let sampling_frequency = shm.header().parameters.sampling_frequency;
                self.filters.update(slot, descriptor, sampling_frequency);
            }
            WorkBody::UploadBuffer {
                kind,
                shared_memory_offset,
                size,
            } => self.handle_upload(shm, kind, shared_memory_offset, size, lock),
            WorkBody::ExportBuffer { kind, size } => self.handle_export(shm, kind, size, lock),
        }
    }

    /// Drain `queue`, handling every committed item in FIFO order.
    pub fn complete_queue(
        &mut self,
        shm: &SharedMemoryRegion,
        queue: &WorkQueue,
        external: bool,
    ) {
        while let Some(work) = queue.pop() {
            let mut commit = true;
            let lock = LockKind::from_i32(work.lock);
            match work.body {
                WorkBody::ReloadShader { kind } => {
                    if let Some(kind) = ShaderKind::from_i32(kind) {
                        let ok = self.reload.reload(kind, &mut self.programs);
                        if ok {
                            // vendor kernels may cache program state
                            let header = shm.header();
                            self.accel
                                .init(header.parameters.rf_raw_dim, self.dec_data_dim);
                        }
                        if ok && self.raw_data_ssbo != 0 {
                            // refresh the image with the last view plane;
                            // without uploaded data there is nothing to show
                            let plane = self
                                .frames
                                .latest()
                                .map(|f| f.view_plane)
                                .unwrap_or(ViewPlaneTag::Xz);
                            let frame_id = self.frames.acquire(plane);
                            work.body = WorkBody::Compute { frame_id };
                            work.lock = LockKind::DispatchCompute as i32;
                            commit = false;
                        }
                    }
                }
                WorkBody::CreateFilter { slot, descriptor } => {
                    let sampling_frequency = shm.header().parameters.sampling_frequency;
                    self.filters.update(slot, descriptor, sampling_frequency);
                }
                WorkBody::UploadBuffer {
                    kind,
                    shared_memory_offset,
                    size,
                } => self.handle_upload(shm, kind, shared_memory_offset, size, lock),
                WorkBody::ExportBuffer { kind, size } => {
                    self.handle_export(shm, kind, size, lock)
                }
                WorkBody::ComputeIndirect { view_plane } => {
                    let plane = ViewPlaneTag::from_i32(view_plane).unwrap_or(ViewPlaneTag::Xz);
                    let frame_id = self.frames.acquire(plane);
                    work.body = WorkBody::Compute { frame_id };
                    if work.lock < 0 {
                        work.lock = LockKind::DispatchCompute as i32;
                    }
                    commit = false;
                }
                WorkBody::Compute { frame_id } => {
                    self.handle_compute(shm, frame_id, lock, external)
                }
            }
            if commit {
                queue.pop_commit();
            }
        }
    }

    //----------------------------------------------------------------------------------------------
    // uploads

    fn handle_upload(
        &mut self,
        shm: &SharedMemoryRegion,
        kind: UploadKind,
        offset: u64,
        size: u32,
        lock: Option<LockKind>,
    ) {
        if let Some(lock) = lock {
            if shm.lock(lock, -1).is_err() {
                return;
            }
        }

        match kind {
            UploadKind::ChannelMapping => {
                self.upload_lookup_table(shm, self.channel_mapping_texture, offset, size, 2, (
                    gl::RED_INTEGER,
                    gl::SHORT,
                ));
                let mapping =
                    unsafe { shm.bytes(offset, (size as usize).min(LOOKUP_TABLE_LEN * 2)) };
                self.accel
                    .set_channel_mapping(bytemuck::cast_slice(mapping));
            }
            UploadKind::SparseElements => {
                self.upload_lookup_table(shm, self.sparse_elements_texture, offset, size, 2, (
                    gl::RED_INTEGER,
                    gl::SHORT,
                ));
            }
            UploadKind::FocalVectors => {
                self.upload_lookup_table(shm, self.focal_vectors_texture, offset, size, 8, (
                    gl::RG,
                    gl::FLOAT,
                ));
            }
            UploadKind::RfData => {
                let parameters = shm.header().parameters;
                if self.rf_raw_size != size || self.dec_data_dim != parameters.dec_data_dim {
                    self.alloc_shader_storage(&parameters, size);
                }
                unsafe {
                    let data = shm.bytes(offset, size as usize);
                    gl::NamedBufferSubData(
                        self.raw_data_ssbo,
                        0,
                        size as GLsizeiptr,
                        data.as_ptr() as *const _,
                    );
                    let mut timer_count = 0u64;
                    gl::GetQueryObjectui64v(
                        self.rf_data_timestamp_query,
                        gl::QUERY_RESULT,
                        &mut timer_count,
                    );
                    gl::QueryCounter(self.rf_data_timestamp_query, gl::TIMESTAMP);
                    self.timing.push(TimingEvent::RfData { timer_count });
                }
            }
        }

        if let Some(lock) = lock {
            if let Some(region) = DirtyRegions::for_lock(lock) {
                shm.clear_dirty(region);
            }
            shm.unlock(lock);
        }
    }

    fn upload_lookup_table(
        &self,
        shm: &SharedMemoryRegion,
        texture: GLuint,
        offset: u64,
        size: u32,
        element_size: u32,
        (format, ty): (GLenum, GLenum),
    ) {
        let count = (size / element_size).min(LOOKUP_TABLE_LEN as u32);
        unsafe {
            let data = shm.bytes(offset, (count * element_size) as usize);
            gl::TextureSubImage1D(
                texture,
                0,
                0,
                count as GLsizei,
                format,
                ty,
                data.as_ptr() as *const _,
            );
        }
    }

    /// Reallocate the raw and decoded SSBOs for new dimensions. The raw
    /// buffer is double sized so decode's two passes can ping-pong halves.
    fn alloc_shader_storage(&mut self, parameters: &BeamformerParameters, rf_raw_size: u32) {
        self.dec_data_dim = parameters.dec_data_dim;
        self.rf_raw_size = rf_raw_size;

        debug!(
            "allocating shader storage: raw {} B, decoded dim {:?}",
            rf_raw_size, self.dec_data_dim
        );

        unsafe {
            gl::DeleteBuffers(2, self.rf_data_ssbos.as_ptr());
            gl::CreateBuffers(2, self.rf_data_ssbos.as_mut_ptr());
            gl::DeleteBuffers(1, &self.raw_data_ssbo);
            gl::CreateBuffers(1, &mut self.raw_data_ssbo);

            gl::NamedBufferStorage(
                self.raw_data_ssbo,
                2 * rf_raw_size as GLsizeiptr,
                std::ptr::null(),
                gl::DYNAMIC_STORAGE_BIT,
            );
            label_gl_object(gl::BUFFER, self.raw_data_ssbo, "Raw_RF_SSBO");

            let decoded_size = 2
                * 4
                * self.dec_data_dim[0] as GLsizeiptr
                * self.dec_data_dim[1] as GLsizeiptr
                * self.dec_data_dim[2] as GLsizeiptr;
            for (index, &ssbo) in self.rf_data_ssbos.iter().enumerate() {
                gl::NamedBufferStorage(ssbo, decoded_size, std::ptr::null(), 0);
                label_gl_object(gl::BUFFER, ssbo, &format!("Decoded_RF_SSBO_{}", index));
            }
        }

        self.accel
            .register_buffers(&self.rf_data_ssbos, self.raw_data_ssbo);
        self.accel.init(parameters.rf_raw_dim, self.dec_data_dim);

        let order = self.dec_data_dim[2];
        if let Some(hadamard) = math::make_hadamard_transpose(order) {
            unsafe {
                gl::DeleteTextures(1, &self.hadamard_texture);
                gl::CreateTextures(gl::TEXTURE_2D, 1, &mut self.hadamard_texture);
                gl::TextureStorage2D(
                    self.hadamard_texture,
                    1,
                    gl::R8I,
                    order as GLsizei,
                    order as GLsizei,
                );
                gl::TextureSubImage2D(
                    self.hadamard_texture,
                    0,
                    0,
                    0,
                    order as GLsizei,
                    order as GLsizei,
                    gl::RED_INTEGER,
                    gl::INT,
                    hadamard.as_ptr() as *const _,
                );
                label_gl_object(gl::TEXTURE, self.hadamard_texture, "Hadamard_Matrix");
            }
        } else if order != 0 {
            warn!("no hadamard matrix for transmit count {}", order);
        }
    }

    //----------------------------------------------------------------------------------------------
    // exports

    fn handle_export(
        &mut self,
        shm: &SharedMemoryRegion,
        kind: ExportKind,
        size: u32,
        lock: Option<LockKind>,
    ) {
        // release anyone still waiting on the dispatch barrier before the
        // blocking readback below
        shm.post(LockKind::DispatchCompute);
        if let Some(lock) = lock {
            if shm.lock(lock, -1).is_err() {
                return;
            }
        }

        match kind {
            ExportKind::BeamformedData => {
                if let Some(frame) = self.frames.latest() {
                    debug_assert!(frame.is_ready());
                    let out_size = frame.frame.output_size();
                    if out_size <= size as usize && out_size <= shm::max_scratch_size() {
                        unsafe {
                            let dst = shm
                                .header_ptr()
                                .cast::<u8>()
                                .add(shm::scratch_offset());
                            gl::GetTextureImage(
                                frame.frame.texture,
                                0,
                                gl::RG,
                                gl::FLOAT,
                                out_size as GLsizei,
                                dst as *mut _,
                            );
                        }
                    }
                }
            }
            ExportKind::Stats => {
                let table: ComputeStatsTable = {
                    let mut stats = self.stats.lock().unwrap();
                    stats.coalesce(&self.timing);
                    stats.table
                };
                if std::mem::size_of::<ComputeStatsTable>() <= size as usize {
                    unsafe {
                        shm.write_bytes(
                            shm::scratch_offset() as u64,
                            bytemuck::bytes_of(&table),
                        );
                    }
                }
            }
        }

        if let Some(lock) = lock {
            shm.unlock(lock);
        }
        shm.post(LockKind::ExportSync);
    }

    //----------------------------------------------------------------------------------------------
    // compute

    fn handle_compute(
        &mut self,
        shm: &SharedMemoryRegion,
        frame_id: u32,
        lock: Option<LockKind>,
        external: bool,
    ) {
        if let Some(lock) = lock {
            // external waiters observe the dispatch start
            shm.post(lock);
        }
        self.timing.push(TimingEvent::ComputeFrameBegin);

        let replan = DirtyRegions::PARAMETERS | DirtyRegions::COMPUTE_PIPELINE;
        if shm.dirty_regions().intersects(replan) {
            if let Ok(snapshot) = PipelineSnapshot::capture(shm) {
                self.pipeline = ComputePipeline::plan(&snapshot, &self.filters.time_offsets());
                self.ui_read_params.store(external, Ordering::Release);
                shm.clear_dirty(replan);
                unsafe {
                    gl::NamedBufferSubData(
                        self.ubos[UBO_DECODE],
                        0,
                        std::mem::size_of::<DecodeUbo>() as GLsizeiptr,
                        bytemuck::bytes_of(&self.pipeline.decode_ubo).as_ptr() as *const _,
                    );
                    gl::NamedBufferSubData(
                        self.ubos[UBO_DEMOD],
                        0,
                        std::mem::size_of::<DemodUbo>() as GLsizeiptr,
                        bytemuck::bytes_of(&self.pipeline.demod_ubo).as_ptr() as *const _,
                    );
                    gl::NamedBufferSubData(
                        self.ubos[UBO_DAS],
                        0,
                        std::mem::size_of::<BeamformerParameters>() as GLsizeiptr,
                        bytemuck::bytes_of(&self.pipeline.das_ubo).as_ptr() as *const _,
                    );
                }
            }
        }

        self.processing_compute.store(true, Ordering::Release);

        let bp = self.pipeline.das_ubo;
        let try_dim = [
            bp.output_points[0].max(1),
            bp.output_points[1].max(1),
            bp.output_points[2].max(1),
        ];

        {
            let gl_params = self.gl_params;
            let frame = self.frames.frame_mut(frame_id);
            if frame.frame.dim != try_dim || frame.frame.texture == 0 {
                alloc_frame_texture(&gl_params, &mut frame.frame, try_dim, "Beamformed_Data");
            }
            frame.frame.min_coordinate = bp.output_min_coordinate;
            frame.frame.max_coordinate = bp.output_max_coordinate;
            frame.frame.das_shader_id = bp.das_shader_id;
            frame.frame.compound_count = bp.dec_data_dim[2];
        }

        if bp.output_points[3] > 1 {
            let gl_params = self.gl_params;
            let needs_alloc = self.frames.averaged_frame(0).frame.dim != try_dim;
            if needs_alloc {
                for index in 0..2 {
                    let averaged = self.frames.averaged_frame_mut(index);
                    alloc_frame_texture(
                        &gl_params,
                        &mut averaged.frame,
                        try_dim,
                        "Averaged_Frame",
                    );
                }
            }
        }

        let shaders = self.pipeline.shaders.clone();
        let shader_parameters = self.pipeline.shader_parameters.clone();
        let mut did_sum = false;

        for (index, &tag) in shaders.iter().enumerate() {
            let kind = match ShaderKind::from_i32(tag) {
                Some(kind) => kind,
                None => {
                    error!("invalid compute stage {} at index {}", tag, index);
                    continue;
                }
            };
            did_sum |= kind == ShaderKind::Sum;
            unsafe {
                gl::BeginQuery(gl::TIME_ELAPSED, self.shader_timer_ids[index]);
            }
            self.dispatch_stage(frame_id, kind, shader_parameters[index]);
            unsafe {
                gl::EndQuery(gl::TIME_ELAPSED);
            }
        }

        // the first of these blocks until the GPU finishes the frame
        for (index, &tag) in shaders.iter().enumerate() {
            let mut timer_count = 0u64;
            unsafe {
                gl::GetQueryObjectui64v(
                    self.shader_timer_ids[index],
                    gl::QUERY_RESULT,
                    &mut timer_count,
                );
            }
            self.timing.push(TimingEvent::Shader {
                shader: tag,
                timer_count,
            });
        }
        self.set_progress(1.0);

        self.frames
            .frame(frame_id)
            .ready_to_present
            .store(1, Ordering::Release);
        if did_sum {
            let averaged_index = self.frames.averaged_frame_index() % 2;
            let view_plane = self.frames.frame(frame_id).view_plane;
            {
                let averaged = self.frames.averaged_frame_mut(averaged_index);
                averaged.view_plane = view_plane;
                averaged.ready_to_present.store(1, Ordering::Release);
            }
            self.frames.advance_averaged_frame();
            self.frames.publish(self.frames.averaged_frame(averaged_index));
        } else {
            self.frames.publish(self.frames.frame(frame_id));
        }
        self.processing_compute.store(false, Ordering::Release);

        self.timing.push(TimingEvent::ComputeFrameEnd);
    }

    fn dispatch_stage(&mut self, frame_id: u32, kind: ShaderKind, sp: ShaderParameters) {
        let program = self.programs[kind as usize];
        unsafe {
            gl::UseProgram(program);
        }

        let output_ssbo_index = 1 - self.last_output_ssbo_index;
        let input_ssbo_index = self.last_output_ssbo_index;
        let stage_is_first = self.pipeline.shaders.first() == Some(&(kind as i32));

        match kind {
            ShaderKind::Decode
            | ShaderKind::DecodeInt16Complex
            | ShaderKind::DecodeFloat
            | ShaderKind::DecodeFloatComplex => unsafe {
                // an accelerated implementation may own this stage entirely
                if self.accel.decode(0, output_ssbo_index as u32, 0) {
                    self.last_output_ssbo_index = output_ssbo_index;
                    return;
                }
                gl::BindBufferBase(gl::UNIFORM_BUFFER, 0, self.ubos[UBO_DECODE]);
                gl::BindBufferBase(
                    gl::SHADER_STORAGE_BUFFER,
                    3,
                    self.rf_data_ssbos[output_ssbo_index],
                );
                gl::BindImageTexture(
                    0,
                    self.hadamard_texture,
                    0,
                    gl::FALSE,
                    0,
                    gl::READ_ONLY,
                    gl::R8I,
                );

                // two samples per invocation for plain i16 input
                let mut local_size_x = DECODE_LOCAL_SIZE_X;
                if kind == ShaderKind::Decode {
                    local_size_x *= 2;
                }

                let mut dim = [
                    self.dec_data_dim[0],
                    self.dec_data_dim[1],
                    self.dec_data_dim[2],
                ];
                let raw_size = self.rf_raw_size as GLsizeiptr;
                if stage_is_first {
                    // first pass reads the raw half, writes the reordered
                    // half, then the second pass decodes from there
                    gl::BindImageTexture(
                        1,
                        self.channel_mapping_texture,
                        0,
                        gl::FALSE,
                        0,
                        gl::READ_ONLY,
                        gl::R16I,
                    );
                    gl::ProgramUniform1ui(program, DECODE_FIRST_PASS_UNIFORM_LOC as GLint, 1);
                    gl::BindBufferRange(
                        gl::SHADER_STORAGE_BUFFER,
                        1,
                        self.raw_data_ssbo,
                        0,
                        raw_size,
                    );
                    gl::BindBufferRange(
                        gl::SHADER_STORAGE_BUFFER,
                        2,
                        self.raw_data_ssbo,
                        raw_size,
                        raw_size,
                    );
                    gl::DispatchCompute(
                        ceil_div(dim[0], local_size_x),
                        ceil_div(dim[1], DECODE_LOCAL_SIZE_Y),
                        ceil_div(dim[2], DECODE_LOCAL_SIZE_Z),
                    );
                    gl::MemoryBarrier(gl::SHADER_STORAGE_BARRIER_BIT);
                    gl::BindBufferRange(
                        gl::SHADER_STORAGE_BUFFER,
                        1,
                        self.raw_data_ssbo,
                        raw_size,
                        raw_size,
                    );
                } else {
                    dim = [
                        self.pipeline.das_ubo.dec_data_dim[0],
                        self.pipeline.das_ubo.dec_data_dim[1],
                        self.pipeline.das_ubo.dec_data_dim[2],
                    ];
                    gl::BindBufferBase(
                        gl::SHADER_STORAGE_BUFFER,
                        1,
                        self.rf_data_ssbos[input_ssbo_index],
                    );
                }

                gl::ProgramUniform1ui(program, DECODE_FIRST_PASS_UNIFORM_LOC as GLint, 0);
                gl::DispatchCompute(
                    ceil_div(dim[0], local_size_x),
                    ceil_div(dim[1], DECODE_LOCAL_SIZE_Y),
                    ceil_div(dim[2], DECODE_LOCAL_SIZE_Z),
                );
                gl::MemoryBarrier(gl::SHADER_STORAGE_BARRIER_BIT);

                self.last_output_ssbo_index = output_ssbo_index;
            },
            ShaderKind::Demodulate | ShaderKind::DemodulateFloat => unsafe {
                gl::BindBufferBase(gl::UNIFORM_BUFFER, 0, self.ubos[UBO_DEMOD]);
                gl::BindBufferBase(
                    gl::SHADER_STORAGE_BUFFER,
                    2,
                    self.rf_data_ssbos[output_ssbo_index],
                );
                if stage_is_first {
                    gl::BindBufferRange(
                        gl::SHADER_STORAGE_BUFFER,
                        1,
                        self.raw_data_ssbo,
                        0,
                        self.rf_raw_size as GLsizeiptr,
                    );
                } else {
                    gl::BindBufferBase(
                        gl::SHADER_STORAGE_BUFFER,
                        1,
                        self.rf_data_ssbos[input_ssbo_index],
                    );
                }

                gl::BindImageTexture(
                    0,
                    self.filters.get(sp.filter_slot).texture(),
                    0,
                    gl::FALSE,
                    0,
                    gl::READ_ONLY,
                    gl::R32F,
                );
                if self.pipeline.demod_ubo.map_channels != 0 {
                    gl::BindImageTexture(
                        1,
                        self.channel_mapping_texture,
                        0,
                        gl::FALSE,
                        0,
                        gl::READ_ONLY,
                        gl::R16I,
                    );
                }

                let local_size_x =
                    DEMOD_LOCAL_SIZE_X * self.pipeline.demod_ubo.decimation_rate.max(1);
                gl::DispatchCompute(
                    ceil_div(self.dec_data_dim[0], local_size_x),
                    ceil_div(self.dec_data_dim[1], DEMOD_LOCAL_SIZE_Y),
                    ceil_div(self.dec_data_dim[2], DEMOD_LOCAL_SIZE_Z),
                );
                gl::MemoryBarrier(gl::SHADER_STORAGE_BARRIER_BIT);

                self.last_output_ssbo_index = output_ssbo_index;
            },
            ShaderKind::MinMax => {
                let (texture, dim, mips) = {
                    let frame = self.frames.frame(frame_id);
                    (frame.frame.texture, frame.frame.dim, frame.frame.mips)
                };
                for level in 1..mips {
                    unsafe {
                        gl::BindImageTexture(
                            0,
                            texture,
                            level - 1,
                            gl::TRUE,
                            0,
                            gl::READ_ONLY,
                            gl::RG32F,
                        );
                        gl::BindImageTexture(
                            1,
                            texture,
                            level,
                            gl::TRUE,
                            0,
                            gl::WRITE_ONLY,
                            gl::RG32F,
                        );
                        gl::ProgramUniform1i(
                            program,
                            MIN_MAX_MIPS_LEVEL_UNIFORM_LOC as GLint,
                            level,
                        );

                        let width = (dim[0] as u32) >> level;
                        let height = (dim[1] as u32) >> level;
                        let depth = (dim[2] as u32) >> level;
                        gl::DispatchCompute(
                            or_one(width / 32),
                            or_one(height),
                            or_one(depth / 32),
                        );
                        gl::MemoryBarrier(gl::SHADER_IMAGE_ACCESS_BARRIER_BIT);
                    }
                }
            }
            ShaderKind::Das | ShaderKind::DasFast => {
                self.dispatch_das(frame_id, kind, program);
            }
            ShaderKind::Sum => {
                self.dispatch_sum(frame_id, program);
            }
        }
    }

    fn dispatch_das(&mut self, frame_id: u32, kind: ShaderKind, program: GLuint) {
        let bp = self.pipeline.das_ubo;
        let (texture, dim) = {
            let frame = self.frames.frame(frame_id);
            (frame.frame.texture, frame.frame.dim)
        };

        unsafe {
            if kind == ShaderKind::DasFast {
                gl::ClearTexImage(texture, 0, gl::RED, gl::FLOAT, std::ptr::null());
                gl::MemoryBarrier(gl::TEXTURE_UPDATE_BARRIER_BIT);
                gl::BindImageTexture(0, texture, 0, gl::TRUE, 0, gl::READ_WRITE, gl::RG32F);
            } else {
                gl::BindImageTexture(0, texture, 0, gl::TRUE, 0, gl::WRITE_ONLY, gl::RG32F);
            }

            gl::BindBufferBase(gl::UNIFORM_BUFFER, 0, self.ubos[UBO_DAS]);
            gl::BindBufferBase(
                gl::SHADER_STORAGE_BUFFER,
                1,
                self.rf_data_ssbos[self.last_output_ssbo_index],
            );
            gl::BindImageTexture(
                1,
                self.sparse_elements_texture,
                0,
                gl::FALSE,
                0,
                gl::READ_ONLY,
                gl::R16I,
            );
            gl::BindImageTexture(
                2,
                self.focal_vectors_texture,
                0,
                gl::FALSE,
                0,
                gl::READ_ONLY,
                gl::RG32F,
            );

            let voxel_transform = das_voxel_transform_matrix(&bp);
            gl::ProgramUniform1ui(program, DAS_CYCLE_T_UNIFORM_LOC as GLint, self.cycle_t);
            self.cycle_t = self.cycle_t.wrapping_add(1);
            gl::ProgramUniformMatrix4fv(
                program,
                DAS_VOXEL_MATRIX_LOC as GLint,
                1,
                gl::FALSE,
                voxel_transform.as_ptr(),
            );

            if kind == ShaderKind::DasFast {
                // RCA transmits walk the focal vector texture; everything
                // else walks receive channels
                let loop_end = if bp.das_shader_id == DasKind::RcaVls as i32
                    || bp.das_shader_id == DasKind::RcaTpw as i32
                {
                    bp.dec_data_dim[2] as i32
                } else {
                    bp.dec_data_dim[1] as i32
                };
                let percent_per_step = 1.0 / loop_end.max(1) as f32;
                self.set_progress(0.0);
                for index in 0..loop_end {
                    // keeps the OS from coalescing the dispatches into one
                    // watchdog-visible submission
                    gl::Finish();
                    gl::ProgramUniform1i(program, DAS_FAST_CHANNEL_UNIFORM_LOC as GLint, index);
                    gl::DispatchCompute(
                        ceil_div(dim[0] as u32, DAS_FAST_LOCAL_SIZE_X),
                        ceil_div(dim[1] as u32, DAS_FAST_LOCAL_SIZE_Y),
                        ceil_div(dim[2] as u32, DAS_FAST_LOCAL_SIZE_Z),
                    );
                    gl::MemoryBarrier(gl::SHADER_IMAGE_ACCESS_BARRIER_BIT);
                    self.set_progress((index + 1) as f32 * percent_per_step);
                }
            } else {
                let mut cursor = ComputeCursor::new(dim, self.max_dispatch_points);
                let percent_per_step =
                    cursor.points_per_dispatch() as f32 / cursor.total_points() as f32;
                let mut progress = 0.0;
                let mut offset = [0i32; 3];
                self.set_progress(0.0);
                while !cursor.finished() {
                    gl::Finish();
                    gl::ProgramUniform3iv(
                        program,
                        DAS_VOXEL_OFFSET_UNIFORM_LOC as GLint,
                        1,
                        offset.as_ptr(),
                    );
                    let dispatch = cursor.dispatch();
                    gl::DispatchCompute(dispatch[0], dispatch[1], dispatch[2]);
                    progress += percent_per_step;
                    self.set_progress(progress);
                    offset = cursor.step();
                }
            }
            gl::MemoryBarrier(
                gl::TEXTURE_UPDATE_BARRIER_BIT | gl::SHADER_IMAGE_ACCESS_BARRIER_BIT,
            );
        }
    }

    fn dispatch_sum(&mut self, frame_id: u32, program: GLuint) {
        let to_average = self.pipeline.das_ubo.output_points[3].max(1) as u32;
        let averaged_index = self.frames.averaged_frame_index() % 2;
        let base_index = self.frames.base_index(frame_id);

        let mut in_textures: smallvec::SmallVec<[GLuint; MAX_BEAMFORMED_SAVED_FRAMES]> =
            smallvec::SmallVec::new();
        for frame in self
            .frames
            .iter_frames((1 + base_index).wrapping_sub(to_average), to_average)
        {
            in_textures.push(frame.frame.texture);
        }

        let (source_min, source_max, source_compound, source_das) = {
            let frame = &self.frames.frame(frame_id).frame;
            (
                frame.min_coordinate,
                frame.max_coordinate,
                frame.compound_count,
                frame.das_shader_id,
            )
        };

        let averaged_id = self.frames.averaged_frame_index();
        let averaged = self.frames.averaged_frame_mut(averaged_index);
        averaged.ready_to_present.store(0, Ordering::Release);
        averaged.frame.id = averaged_id;
        let out_texture = averaged.frame.texture;
        let out_dim = averaged.frame.dim;

        unsafe {
            // zero the accumulator before summing
            gl::ClearTexImage(out_texture, 0, gl::RED, gl::FLOAT, std::ptr::null());
            gl::MemoryBarrier(gl::TEXTURE_UPDATE_BARRIER_BIT);

            gl::BindImageTexture(0, out_texture, 0, gl::TRUE, 0, gl::READ_WRITE, gl::RG32F);
            gl::ProgramUniform1f(
                program,
                SUM_PRESCALE_UNIFORM_LOC as GLint,
                1.0 / in_textures.len().max(1) as f32,
            );
            for &texture in &in_textures {
                gl::BindImageTexture(1, texture, 0, gl::TRUE, 0, gl::READ_ONLY, gl::RG32F);
                gl::DispatchCompute(
                    or_one(out_dim[0] as u32 / 32),
                    or_one(out_dim[1] as u32),
                    or_one(out_dim[2] as u32 / 32),
                );
                gl::MemoryBarrier(gl::SHADER_IMAGE_ACCESS_BARRIER_BIT);
            }
        }

        averaged.frame.min_coordinate = source_min;
        averaged.frame.max_coordinate = source_max;
        averaged.frame.compound_count = source_compound;
        averaged.frame.das_shader_id = source_das;
    }
}

impl Drop for ComputeExecutor {
    fn drop(&mut self) {
        unsafe {
            for program in self.programs {
                gl::DeleteProgram(program);
            }
            gl::DeleteBuffers(2, self.rf_data_ssbos.as_ptr());
            gl::DeleteBuffers(1, &self.raw_data_ssbo);
            gl::DeleteBuffers(UBO_COUNT as GLsizei, self.ubos.as_ptr());
            gl::DeleteTextures(1, &self.channel_mapping_texture);
            gl::DeleteTextures(1, &self.sparse_elements_texture);
            gl::DeleteTextures(1, &self.focal_vectors_texture);
            gl::DeleteTextures(1, &self.hadamard_texture);
            gl::DeleteQueries(
                MAX_COMPUTE_SHADER_STAGES as GLsizei,
                self.shader_timer_ids.as_ptr(),
            );
            gl::DeleteQueries(1, &self.rf_data_timestamp_query);
        }
    }
}

/// Allocate (or replace) a frame's 3-D RG32F texture with a full mip chain.
fn alloc_frame_texture(
    gl_params: &GlParams,
    frame: &mut BeamformFrame,
    dim: [i32; 3],
    label: &str,
) {
    let max_dim = gl_params.max_3d_texture_dim.max(1);
    frame.dim = [
        dim[0].clamp(1, max_dim),
        dim[1].clamp(1, max_dim),
        dim[2].clamp(1, max_dim),
    ];
    frame.mips = math::mips_for_dim(frame.dim);

    unsafe {
        gl::DeleteTextures(1, &frame.texture);
        gl::CreateTextures(gl::TEXTURE_3D, 1, &mut frame.texture);
        gl::TextureStorage3D(
            frame.texture,
            frame.mips,
            gl::RG32F,
            frame.dim[0],
            frame.dim[1],
            frame.dim[2],
        );
        gl::TextureParameteri(frame.texture, gl::TEXTURE_MIN_FILTER, gl::NEAREST as GLint);
        gl::TextureParameteri(frame.texture, gl::TEXTURE_MAG_FILTER, gl::NEAREST as GLint);
    }
    label_gl_object(gl::TEXTURE, frame.texture, &format!("{}[{:x}]", label, frame.id));
}
