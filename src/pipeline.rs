//! The pipeline planner.
//!
//! Rewrites the user's abstract shader chain into the concrete chain that
//! will actually be dispatched: picks data-kind specialized kernel variants,
//! derives the per-stage stride layouts, applies demodulation arithmetic to
//! the parameter copy and folds filter group delays into the time offset.
//! Planning is pure: for a fixed snapshot it always produces the same plan.

use smallvec::SmallVec;

use crate::filter::FILTER_SLOTS;
use crate::math::Mat4;
use crate::params::{
    BeamformerParameters, DasKind, DataKind, DecodeUbo, DemodUbo, ShaderKind, ShaderParameters,
    MAX_COMPUTE_SHADER_STAGES,
};
use crate::shm::SharedMemoryRegion;
use crate::sync::{LockKind, SyncError};

/// A consistent copy of everything the planner reads from shared memory.
#[derive(Clone, Debug)]
pub struct PipelineSnapshot {
    pub parameters: BeamformerParameters,
    pub data_kind: DataKind,
    pub shaders: SmallVec<[i32; MAX_COMPUTE_SHADER_STAGES]>,
    pub shader_parameters: SmallVec<[ShaderParameters; MAX_COMPUTE_SHADER_STAGES]>,
}

impl PipelineSnapshot {
    /// Copy the requested chain and the parameter block out of shared memory,
    /// each under its own lock.
    pub fn capture(shm: &SharedMemoryRegion) -> Result<PipelineSnapshot, SyncError> {
        shm.lock(LockKind::ComputePipeline, -1)?;
        let header = shm.header();
        let count = (header.shader_count as usize).min(MAX_COMPUTE_SHADER_STAGES);
        let shaders = SmallVec::from_slice(&header.shaders[..count]);
        let shader_parameters = SmallVec::from_slice(&header.shader_parameters[..count]);
        let data_kind = DataKind::from_i32_clamped(header.data_kind);

        shm.lock(LockKind::Parameters, -1)?;
        let parameters = header.parameters;
        shm.unlock(LockKind::Parameters);
        shm.unlock(LockKind::ComputePipeline);

        Ok(PipelineSnapshot {
            parameters,
            data_kind,
            shaders,
            shader_parameters,
        })
    }
}

/// The planned pipeline. `das_ubo` is the mutated parameter copy that the DAS
/// kernels consume; `decode_ubo` / `demod_ubo` describe the stride layouts of
/// the earlier stages.
#[derive(Clone, Debug, PartialEq)]
pub struct ComputePipeline {
    pub shaders: SmallVec<[i32; MAX_COMPUTE_SHADER_STAGES]>,
    pub shader_parameters: SmallVec<[ShaderParameters; MAX_COMPUTE_SHADER_STAGES]>,
    pub das_ubo: BeamformerParameters,
    pub decode_ubo: DecodeUbo,
    pub demod_ubo: DemodUbo,
}

impl Default for ComputePipeline {
    fn default() -> ComputePipeline {
        ComputePipeline {
            shaders: SmallVec::new(),
            shader_parameters: SmallVec::new(),
            das_ubo: BeamformerParameters::default(),
            decode_ubo: DecodeUbo::default(),
            demod_ubo: DemodUbo::default(),
        }
    }
}

impl ComputePipeline {
    pub fn plan(
        snapshot: &PipelineSnapshot,
        filter_time_offsets: &[f32; FILTER_SLOTS],
    ) -> ComputePipeline {
        let mut bp = snapshot.parameters;
        let data_kind = snapshot.data_kind;

        let decode_first = snapshot.shaders.first() == Some(&(ShaderKind::Decode as i32));
        let demod_first = snapshot.shaders.first() == Some(&(ShaderKind::Demodulate as i32));

        let mut shaders = SmallVec::new();
        let mut shader_parameters = SmallVec::new();
        let mut demodulating = false;

        for (index, &requested) in snapshot.shaders.iter().enumerate() {
            let sp = snapshot
                .shader_parameters
                .get(index)
                .copied()
                .unwrap_or_default();
            let mut shader = requested;
            // unknown tags are retained unchanged; the executor rejects them
            // at dispatch
            match ShaderKind::from_i32(requested) {
                Some(ShaderKind::Decode) => {
                    const DECODE_TABLE: [ShaderKind; 4] = [
                        ShaderKind::Decode,
                        ShaderKind::DecodeInt16Complex,
                        ShaderKind::DecodeFloat,
                        ShaderKind::DecodeFloatComplex,
                    ];
                    shader = if decode_first {
                        DECODE_TABLE[data_kind as usize] as i32
                    } else if data_kind == DataKind::Int16 {
                        ShaderKind::DecodeInt16Complex as i32
                    } else {
                        ShaderKind::DecodeFloatComplex as i32
                    };
                }
                Some(ShaderKind::Demodulate) => {
                    if !demod_first || data_kind == DataKind::Float32 {
                        shader = ShaderKind::DemodulateFloat as i32;
                    }
                    bp.time_offset +=
                        filter_time_offsets[sp.filter_slot as usize % FILTER_SLOTS];
                    demodulating = true;
                }
                Some(ShaderKind::Das) => {
                    if bp.coherency_weighting == 0 {
                        shader = ShaderKind::DasFast as i32;
                    }
                }
                _ => {}
            }
            shaders.push(shader);
            shader_parameters.push(sp);
        }

        let mut dp = DecodeUbo {
            decode_mode: bp.decode as u32,
            transmit_count: bp.dec_data_dim[2],
            ..DecodeUbo::default()
        };

        if decode_first {
            dp.input_channel_stride = bp.rf_raw_dim[0];
            dp.input_sample_stride = 1;
            dp.input_transmit_stride = bp.dec_data_dim[0];

            dp.output_channel_stride = bp.dec_data_dim[0] * bp.dec_data_dim[2];
            dp.output_sample_stride = 1;
            dp.output_transmit_stride = bp.dec_data_dim[0];
        }

        let mut mp = DemodUbo::default();
        if demodulating {
            mp.sampling_frequency = bp.sampling_frequency;
            mp.demodulation_frequency = bp.center_frequency;
            mp.decimation_rate = bp.decimation_rate.max(1);

            bp.sampling_frequency /= mp.decimation_rate as f32;
            bp.dec_data_dim[0] /= mp.decimation_rate;

            mp.input_sample_stride = 1;
            mp.input_transmit_stride = bp.dec_data_dim[0] * mp.decimation_rate;
            mp.output_channel_stride = bp.dec_data_dim[0] * bp.dec_data_dim[2];

            if demod_first {
                // output the optimized decode layout so Decode can skip its
                // first pass
                mp.input_channel_stride = bp.rf_raw_dim[0];
                mp.output_sample_stride = bp.dec_data_dim[2];
                mp.output_transmit_stride = 1;
                mp.map_channels = 1;

                dp.input_channel_stride = mp.output_channel_stride;
                dp.input_sample_stride = mp.output_sample_stride;
                dp.input_transmit_stride = mp.output_transmit_stride;

                dp.output_channel_stride = bp.dec_data_dim[0] * bp.dec_data_dim[2];
                dp.output_sample_stride = 1;
                dp.output_transmit_stride = bp.dec_data_dim[0];
            } else {
                mp.input_channel_stride = dp.output_channel_stride;
                mp.output_sample_stride = 1;
                mp.output_transmit_stride = bp.dec_data_dim[0];
                mp.map_channels = 0;
            }
        } else {
            bp.center_frequency = 0.0;
            bp.decimation_rate = 1;
        }

        ComputePipeline {
            shaders,
            shader_parameters,
            das_ubo: bp,
            decode_ubo: dp,
            demod_ubo: mp,
        }
    }

    pub fn contains(&self, kind: ShaderKind) -> bool {
        self.shaders.iter().any(|&s| s == kind as i32)
    }
}

/// Voxel index to world-space transform for the DAS kernels. The geometry
/// tag drives axis collapse and in-plane rotation.
pub fn das_voxel_transform_matrix(bp: &BeamformerParameters) -> Mat4 {
    let min = bp.output_min_coordinate;
    let max = bp.output_max_coordinate;
    let extent = [
        (max[0] - min[0]).abs(),
        (max[1] - min[1]).abs(),
        (max[2] - min[2]).abs(),
    ];
    let points = [
        bp.output_points[0] as f32,
        bp.output_points[1] as f32,
        bp.output_points[2] as f32,
    ];

    let t1 = Mat4::translation([
        -0.5 * (points[0] - 1.0),
        -0.5 * (points[1] - 1.0),
        -0.5 * (points[2] - 1.0),
    ]);
    let mut t2 = Mat4::translation([
        min[0] + 0.5 * extent[0],
        min[1] + 0.5 * extent[1],
        min[2] + 0.5 * extent[2],
    ]);
    let mut s = Mat4::scale([
        extent[0] / points[0],
        extent[1] / points[1],
        extent[2] / points[2],
    ]);

    let r = match DasKind::from_i32(bp.das_shader_id) {
        Some(DasKind::Forces) | Some(DasKind::Uforces) | Some(DasKind::Flash) => {
            // these geometries collapse the Y axis
            s.0[5] = 0.0;
            t2.0[13] = 0.0;
            Mat4::identity()
        }
        Some(DasKind::Hercules)
        | Some(DasKind::Uhercules)
        | Some(DasKind::RcaTpw)
        | Some(DasKind::RcaVls) => {
            if !(points[0] > 1.0 && points[1] > 1.0 && points[2] > 1.0) {
                t2.0[13] = bp.off_axis_pos;
            }
            Mat4::rotation_about_z(if bp.beamform_plane != 0 { 0.0 } else { 0.25 })
        }
        _ => Mat4::identity(),
    };

    r.mul(&t2.mul(&s.mul(&t1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        shaders: &[ShaderKind],
        data_kind: DataKind,
        parameters: BeamformerParameters,
    ) -> PipelineSnapshot {
        PipelineSnapshot {
            parameters,
            data_kind,
            shaders: shaders.iter().map(|s| *s as i32).collect(),
            shader_parameters: shaders.iter().map(|_| ShaderParameters::default()).collect(),
        }
    }

    fn base_parameters() -> BeamformerParameters {
        BeamformerParameters {
            dec_data_dim: [2048, 64, 64, 0],
            rf_raw_dim: [4096, 2048],
            output_points: [256, 1, 1024, 1],
            sampling_frequency: 40.0e6,
            center_frequency: 5.0e6,
            decimation_rate: 4,
            coherency_weighting: 0,
            ..BeamformerParameters::default()
        }
    }

    const NO_FILTERS: [f32; FILTER_SLOTS] = [0.0; FILTER_SLOTS];

    #[test]
    fn int16_decode_first_pipeline() {
        let snap = snapshot(
            &[ShaderKind::Decode, ShaderKind::Das],
            DataKind::Int16,
            base_parameters(),
        );
        let plan = ComputePipeline::plan(&snap, &NO_FILTERS);

        assert_eq!(
            plan.shaders.as_slice(),
            &[ShaderKind::Decode as i32, ShaderKind::DasFast as i32]
        );
        assert_eq!(
            plan.decode_ubo,
            DecodeUbo {
                input_channel_stride: 4096,
                input_sample_stride: 1,
                input_transmit_stride: 2048,
                output_channel_stride: 2048 * 64,
                output_sample_stride: 1,
                output_transmit_stride: 2048,
                decode_mode: 1,
                transmit_count: 64,
            }
        );
        // no demodulation: baseband parameters are forced to the identity
        assert_eq!(plan.das_ubo.center_frequency, 0.0);
        assert_eq!(plan.das_ubo.decimation_rate, 1);
        assert_eq!(plan.das_ubo.sampling_frequency, 40.0e6);
    }

    #[test]
    fn demodulate_first_optimized_path() {
        let snap = snapshot(
            &[ShaderKind::Demodulate, ShaderKind::Decode, ShaderKind::Das],
            DataKind::Int16,
            base_parameters(),
        );
        let plan = ComputePipeline::plan(&snap, &NO_FILTERS);

        assert_eq!(
            plan.shaders.as_slice(),
            &[
                ShaderKind::Demodulate as i32,
                ShaderKind::DecodeInt16Complex as i32,
                ShaderKind::DasFast as i32,
            ]
        );
        assert_eq!(plan.das_ubo.sampling_frequency, 10.0e6);
        assert_eq!(plan.das_ubo.dec_data_dim[0], 2048 / 4);

        assert_eq!(plan.demod_ubo.output_sample_stride, 64);
        assert_eq!(plan.demod_ubo.output_transmit_stride, 1);
        assert_eq!(plan.demod_ubo.map_channels, 1);
        assert_eq!(plan.demod_ubo.input_channel_stride, 4096);

        // decode inherits the demodulated layout
        assert_eq!(
            plan.decode_ubo.input_channel_stride,
            plan.demod_ubo.output_channel_stride
        );
        assert_eq!(
            plan.decode_ubo.input_sample_stride,
            plan.demod_ubo.output_sample_stride
        );
        assert_eq!(
            plan.decode_ubo.input_transmit_stride,
            plan.demod_ubo.output_transmit_stride
        );
        assert_eq!(plan.decode_ubo.output_transmit_stride, 512);
    }

    #[test]
    fn demodulate_mid_chain_uses_float_variant_and_decode_layout() {
        let snap = snapshot(
            &[ShaderKind::Decode, ShaderKind::Demodulate, ShaderKind::Das],
            DataKind::Int16,
            base_parameters(),
        );
        let plan = ComputePipeline::plan(&snap, &NO_FILTERS);

        assert_eq!(plan.shaders[1], ShaderKind::DemodulateFloat as i32);
        assert_eq!(plan.demod_ubo.map_channels, 0);
        assert_eq!(
            plan.demod_ubo.input_channel_stride,
            plan.decode_ubo.output_channel_stride
        );
    }

    #[test]
    fn float_data_keeps_float_demodulate_even_when_first() {
        let snap = snapshot(
            &[ShaderKind::Demodulate, ShaderKind::Das],
            DataKind::Float32,
            base_parameters(),
        );
        let plan = ComputePipeline::plan(&snap, &NO_FILTERS);
        assert_eq!(plan.shaders[0], ShaderKind::DemodulateFloat as i32);
    }

    #[test]
    fn filter_time_offset_is_additive() {
        let mut offsets = NO_FILTERS;
        offsets[0] = -65.0 / 2.0 / 40.0e6;
        let mut params = base_parameters();
        params.time_offset = 0.0;

        let snap = snapshot(
            &[ShaderKind::Demodulate, ShaderKind::Decode, ShaderKind::Das],
            DataKind::Int16,
            params,
        );
        let plan = ComputePipeline::plan(&snap, &offsets);
        assert!((plan.das_ubo.time_offset - (-8.125e-7)).abs() < 1.0e-12);

        // pre-existing offsets accumulate rather than reset
        let mut params = base_parameters();
        params.time_offset = 1.0e-6;
        let snap = snapshot(
            &[ShaderKind::Demodulate, ShaderKind::Decode, ShaderKind::Das],
            DataKind::Int16,
            params,
        );
        let plan = ComputePipeline::plan(&snap, &offsets);
        assert!((plan.das_ubo.time_offset - (1.0e-6 - 8.125e-7)).abs() < 1.0e-12);
    }

    #[test]
    fn coherency_weighting_keeps_full_das() {
        let mut params = base_parameters();
        params.coherency_weighting = 1;
        let snap = snapshot(&[ShaderKind::Decode, ShaderKind::Das], DataKind::Int16, params);
        let plan = ComputePipeline::plan(&snap, &NO_FILTERS);
        assert_eq!(plan.shaders[1], ShaderKind::Das as i32);
    }

    #[test]
    fn planning_is_deterministic() {
        let snap = snapshot(
            &[ShaderKind::Demodulate, ShaderKind::Decode, ShaderKind::Das],
            DataKind::Int16Complex,
            base_parameters(),
        );
        let a = ComputePipeline::plan(&snap, &NO_FILTERS);
        let b = ComputePipeline::plan(&snap, &NO_FILTERS);
        assert_eq!(a, b);
    }

    #[test]
    fn specialization_closure() {
        for data_kind in [
            DataKind::Int16,
            DataKind::Int16Complex,
            DataKind::Float32,
            DataKind::Float32Complex,
        ] {
            for chain in [
                vec![ShaderKind::Decode, ShaderKind::Das],
                vec![ShaderKind::Demodulate, ShaderKind::Decode, ShaderKind::Das],
                vec![
                    ShaderKind::Decode,
                    ShaderKind::Demodulate,
                    ShaderKind::Das,
                    ShaderKind::MinMax,
                    ShaderKind::Sum,
                ],
            ] {
                let snap = snapshot(&chain, data_kind, base_parameters());
                let plan = ComputePipeline::plan(&snap, &NO_FILTERS);
                for (&planned, &requested) in plan.shaders.iter().zip(chain.iter()) {
                    let kind = ShaderKind::from_i32(planned).unwrap();
                    match requested {
                        ShaderKind::Decode => assert!(kind.is_decode()),
                        ShaderKind::Demodulate => assert!(kind.is_demodulate()),
                        ShaderKind::Das => {
                            assert!(kind == ShaderKind::Das || kind == ShaderKind::DasFast)
                        }
                        other => assert_eq!(kind, other),
                    }
                    // generic Das never survives planning with weighting off
                    if requested == ShaderKind::Das {
                        assert_ne!(planned, ShaderKind::Das as i32);
                    }
                }
            }
        }
    }

    #[test]
    fn unknown_tags_are_retained() {
        let mut snap = snapshot(&[ShaderKind::Decode, ShaderKind::Das], DataKind::Int16, base_parameters());
        snap.shaders.push(977);
        snap.shader_parameters.push(ShaderParameters::default());
        let plan = ComputePipeline::plan(&snap, &NO_FILTERS);
        assert_eq!(*plan.shaders.last().unwrap(), 977);
    }

    #[test]
    fn voxel_transform_collapses_y_for_forces() {
        let mut params = base_parameters();
        params.das_shader_id = DasKind::Forces as i32;
        params.output_min_coordinate = [-0.02, 0.0, 0.0, 0.0];
        params.output_max_coordinate = [0.02, 0.0, 0.04, 0.0];
        let m = das_voxel_transform_matrix(&params);
        // the Y column and Y translation vanish
        assert_eq!(m.0[5], 0.0);
        assert_eq!(m.0[13], 0.0);
    }

    #[test]
    fn voxel_transform_offsets_slice_for_hercules_2d() {
        let mut params = base_parameters();
        params.das_shader_id = DasKind::Hercules as i32;
        params.beamform_plane = 1;
        params.off_axis_pos = 0.013;
        params.output_points = [256, 1, 1024, 1];
        let m = das_voxel_transform_matrix(&params);
        assert!((m.0[13] - 0.013).abs() < 1.0e-6);
    }
}
