//! Parameter block, kernel tags and UBO mirrors.
//!
//! Everything in this module crosses a process or GPU boundary: the structs
//! follow the OpenGL std140 layout rules and must not be reordered without
//! rebuilding every client against the new header.

use bytemuck::{Pod, Zeroable};

pub const MAX_COMPUTE_SHADER_STAGES: usize = 16;
pub const MAX_BEAMFORMED_SAVED_FRAMES: usize = 16;

/// Lookup tables in shared memory have a fixed element count.
pub const LOOKUP_TABLE_LEN: usize = 256;

// Workgroup sizes baked into the generated shader headers. Decode reads two
// samples per invocation for i16 input, so its dispatch uses 2x the X size.
pub const DECODE_LOCAL_SIZE_X: u32 = 4;
pub const DECODE_LOCAL_SIZE_Y: u32 = 1;
pub const DECODE_LOCAL_SIZE_Z: u32 = 16;

pub const DEMOD_LOCAL_SIZE_X: u32 = 32;
pub const DEMOD_LOCAL_SIZE_Y: u32 = 1;
pub const DEMOD_LOCAL_SIZE_Z: u32 = 1;

pub const DAS_LOCAL_SIZE_X: u32 = 16;
pub const DAS_LOCAL_SIZE_Y: u32 = 1;
pub const DAS_LOCAL_SIZE_Z: u32 = 16;

pub const DAS_FAST_LOCAL_SIZE_X: u32 = 16;
pub const DAS_FAST_LOCAL_SIZE_Y: u32 = 1;
pub const DAS_FAST_LOCAL_SIZE_Z: u32 = 16;

// Explicit uniform locations shared with the GLSL kernels.
pub const DECODE_FIRST_PASS_UNIFORM_LOC: u32 = 1;
pub const MIN_MAX_MIPS_LEVEL_UNIFORM_LOC: u32 = 1;
pub const SUM_PRESCALE_UNIFORM_LOC: u32 = 1;
pub const DAS_VOXEL_OFFSET_UNIFORM_LOC: u32 = 2;
pub const DAS_FAST_CHANNEL_UNIFORM_LOC: u32 = 2;
pub const DAS_VOXEL_MATRIX_LOC: u32 = 3;
pub const DAS_CYCLE_T_UNIFORM_LOC: u32 = 7;

/// Element type of the raw RF upload.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataKind {
    Int16 = 0,
    Int16Complex = 1,
    Float32 = 2,
    Float32Complex = 3,
}

impl DataKind {
    /// Out of range values clamp to the nearest in-range kind.
    pub fn from_i32_clamped(value: i32) -> DataKind {
        match value {
            i32::MIN..=0 => DataKind::Int16,
            1 => DataKind::Int16Complex,
            2 => DataKind::Float32,
            _ => DataKind::Float32Complex,
        }
    }
}

/// Compute kernel tags. `Decode`, `Demodulate` and `Das` double as the
/// concrete Int16 / coherency-weighted variants once a pipeline is planned;
/// the remaining variants only ever appear in planned pipelines.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Decode = 0,
    DecodeInt16Complex = 1,
    DecodeFloat = 2,
    DecodeFloatComplex = 3,
    Demodulate = 4,
    DemodulateFloat = 5,
    Das = 6,
    DasFast = 7,
    MinMax = 8,
    Sum = 9,
}

pub const SHADER_KIND_COUNT: usize = 10;

impl ShaderKind {
    pub fn from_i32(value: i32) -> Option<ShaderKind> {
        Some(match value {
            0 => ShaderKind::Decode,
            1 => ShaderKind::DecodeInt16Complex,
            2 => ShaderKind::DecodeFloat,
            3 => ShaderKind::DecodeFloatComplex,
            4 => ShaderKind::Demodulate,
            5 => ShaderKind::DemodulateFloat,
            6 => ShaderKind::Das,
            7 => ShaderKind::DasFast,
            8 => ShaderKind::MinMax,
            9 => ShaderKind::Sum,
            _ => return None,
        })
    }

    pub fn is_decode(self) -> bool {
        matches!(
            self,
            ShaderKind::Decode
                | ShaderKind::DecodeInt16Complex
                | ShaderKind::DecodeFloat
                | ShaderKind::DecodeFloatComplex
        )
    }

    pub fn is_demodulate(self) -> bool {
        matches!(self, ShaderKind::Demodulate | ShaderKind::DemodulateFloat)
    }

    pub fn name(self) -> &'static str {
        match self {
            ShaderKind::Decode => "Decode",
            ShaderKind::DecodeInt16Complex => "Decode (I16C)",
            ShaderKind::DecodeFloat => "Decode (F32)",
            ShaderKind::DecodeFloatComplex => "Decode (F32C)",
            ShaderKind::Demodulate => "Demodulate",
            ShaderKind::DemodulateFloat => "Demodulate (F32)",
            ShaderKind::Das => "DAS",
            ShaderKind::DasFast => "DAS (Fast)",
            ShaderKind::MinMax => "Min/Max",
            ShaderKind::Sum => "Sum",
        }
    }
}

/// Beamforming geometry selector. Stable wire values.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DasKind {
    Forces = 0,
    Uforces = 1,
    Hercules = 2,
    Uhercules = 3,
    RcaTpw = 4,
    RcaVls = 5,
    Flash = 6,
}

pub const DAS_KIND_COUNT: usize = 7;

impl DasKind {
    pub fn from_i32(value: i32) -> Option<DasKind> {
        Some(match value {
            0 => DasKind::Forces,
            1 => DasKind::Uforces,
            2 => DasKind::Hercules,
            3 => DasKind::Uhercules,
            4 => DasKind::RcaTpw,
            5 => DasKind::RcaVls,
            6 => DasKind::Flash,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            DasKind::Forces => "FORCES",
            DasKind::Uforces => "UFORCES",
            DasKind::Hercules => "HERCULES",
            DasKind::Uhercules => "UHERCULES",
            DasKind::RcaTpw => "RCA_TPW",
            DasKind::RcaVls => "RCA_VLS",
            DasKind::Flash => "FLASH",
        }
    }
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeMode {
    None = 0,
    Hadamard = 1,
}

/// Which 2-D slice of the volume a frame represents.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViewPlaneTag {
    Xz = 0,
    Yz = 1,
    XzLeft = 2,
    XzRight = 3,
    Arbitrary = 4,
}

pub const VIEW_PLANE_TAG_COUNT: i32 = 5;

impl ViewPlaneTag {
    pub fn from_i32(value: i32) -> Option<ViewPlaneTag> {
        Some(match value {
            0 => ViewPlaneTag::Xz,
            1 => ViewPlaneTag::Yz,
            2 => ViewPlaneTag::XzLeft,
            3 => ViewPlaneTag::XzRight,
            4 => ViewPlaneTag::Arbitrary,
            _ => return None,
        })
    }
}

/// The shared parameter block. Doubles as the DAS UBO after the planner has
/// applied its demodulation corrections.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct BeamformerParameters {
    /// Samples * Channels * Transmits; last element ignored
    pub dec_data_dim: [u32; 4],
    /// Width * Height * Depth * AverageCount
    pub output_points: [i32; 4],
    /// [m] Back-Top-Left corner of output region (w ignored)
    pub output_min_coordinate: [f32; 4],
    /// [m] Front-Bottom-Right corner of output region (w ignored)
    pub output_max_coordinate: [f32; 4],
    /// Raw data dimensions
    pub rf_raw_dim: [u32; 2],
    pub das_shader_id: i32,
    pub decode: i32,
    /// Plane to beamform in for rotating geometries
    pub beamform_plane: i32,
    /// [m] Position on the axis normal to the beamform plane for <3-D grids
    pub off_axis_pos: f32,
    /// [m/s]
    pub speed_of_sound: f32,
    /// [Hz]
    pub sampling_frequency: f32,
    /// [Hz]
    pub center_frequency: f32,
    /// pulse length correction time [s]
    pub time_offset: f32,
    pub decimation_rate: u32,
    pub coherency_weighting: u32,
    pub _pad: [u32; 4],
}

impl Default for BeamformerParameters {
    fn default() -> BeamformerParameters {
        BeamformerParameters {
            dec_data_dim: [0; 4],
            output_points: [1, 1, 1, 1],
            output_min_coordinate: [0.0; 4],
            output_max_coordinate: [0.0; 4],
            rf_raw_dim: [0; 2],
            das_shader_id: 0,
            decode: DecodeMode::Hadamard as i32,
            beamform_plane: 0,
            off_axis_pos: 0.0,
            speed_of_sound: 1540.0,
            sampling_frequency: 0.0,
            center_frequency: 0.0,
            time_offset: 0.0,
            decimation_rate: 1,
            coherency_weighting: 0,
            _pad: [0; 4],
        }
    }
}

/// Per-stage opaque parameters forwarded from the client.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShaderParameters {
    pub filter_slot: u32,
    pub _pad: [u32; 3],
}

/// Uniform block of the decode kernels.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DecodeUbo {
    pub input_channel_stride: u32,
    pub input_sample_stride: u32,
    pub input_transmit_stride: u32,
    pub output_channel_stride: u32,
    pub output_sample_stride: u32,
    pub output_transmit_stride: u32,
    pub decode_mode: u32,
    pub transmit_count: u32,
}

/// Uniform block of the demodulation kernels.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DemodUbo {
    pub input_channel_stride: u32,
    pub input_sample_stride: u32,
    pub input_transmit_stride: u32,
    pub output_channel_stride: u32,
    pub output_sample_stride: u32,
    pub output_transmit_stride: u32,
    pub sampling_frequency: f32,
    pub demodulation_frequency: f32,
    pub decimation_rate: u32,
    pub map_channels: u32,
    pub _pad: [u32; 2],
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn parameter_block_layout() {
        // std140 compatibility: 16 byte multiple, no implicit padding
        assert_eq!(mem::size_of::<BeamformerParameters>(), 128);
        assert_eq!(mem::align_of::<BeamformerParameters>(), 4);
        assert_eq!(mem::size_of::<DecodeUbo>(), 32);
        assert_eq!(mem::size_of::<DemodUbo>(), 48);
        assert_eq!(mem::size_of::<ShaderParameters>(), 16);
    }

    #[test]
    fn data_kind_clamps() {
        assert_eq!(DataKind::from_i32_clamped(-3), DataKind::Int16);
        assert_eq!(DataKind::from_i32_clamped(2), DataKind::Float32);
        assert_eq!(DataKind::from_i32_clamped(17), DataKind::Float32Complex);
    }

    #[test]
    fn shader_kind_round_trip() {
        for i in 0..SHADER_KIND_COUNT as i32 {
            assert_eq!(ShaderKind::from_i32(i).unwrap() as i32, i);
        }
        assert!(ShaderKind::from_i32(SHADER_KIND_COUNT as i32).is_none());
        assert!(ShaderKind::from_i32(-1).is_none());
    }

    #[test]
    fn das_kind_values_are_stable() {
        assert_eq!(DasKind::Forces as i32, 0);
        assert_eq!(DasKind::Uforces as i32, 1);
        assert_eq!(DasKind::Hercules as i32, 2);
        assert_eq!(DasKind::Uhercules as i32, 3);
        assert_eq!(DasKind::RcaTpw as i32, 4);
        assert_eq!(DasKind::RcaVls as i32, 5);
        assert_eq!(DasKind::Flash as i32, 6);
    }
}
