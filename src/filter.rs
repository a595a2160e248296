//! The filter store: a dense table of 1-D filter textures built on demand
//! from descriptors carried in `CreateFilter` work items.

use crate::api as gl;
use crate::api::types::*;
use crate::math;

pub const FILTER_SLOTS: usize = 8;

/// How to synthesize the filter coefficients. Part of the wire protocol.
#[repr(C, i32)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FilterDescriptor {
    Kaiser {
        cutoff_frequency: f32,
        beta: f32,
        length: i32,
    },
}

impl FilterDescriptor {
    pub fn length(&self) -> i32 {
        match *self {
            FilterDescriptor::Kaiser { length, .. } => length,
        }
    }
}

/// One built filter: the texture plus everything needed to derive its group
/// delay later.
#[derive(Debug)]
pub struct Filter {
    texture: GLuint,
    descriptor: Option<FilterDescriptor>,
    sampling_frequency: f32,
}

impl Filter {
    const fn empty() -> Filter {
        Filter {
            texture: 0,
            descriptor: None,
            sampling_frequency: 0.0,
        }
    }

    pub fn texture(&self) -> GLuint {
        self.texture
    }

    /// Time the filter delays the signal by: `-length / (2 * fs)` for the
    /// symmetric Kaiser window. Zero for an unbuilt slot.
    pub fn time_offset(&self) -> f32 {
        match self.descriptor {
            Some(FilterDescriptor::Kaiser { length, .. }) => {
                -(length as f32) / 2.0 / self.sampling_frequency
            }
            None => 0.0,
        }
    }
}

pub struct FilterStore {
    slots: [Filter; FILTER_SLOTS],
}

impl FilterStore {
    pub fn new() -> FilterStore {
        FilterStore {
            slots: [const { Filter::empty() }; FILTER_SLOTS],
        }
    }

    pub fn get(&self, slot: u32) -> &Filter {
        &self.slots[slot as usize % FILTER_SLOTS]
    }

    /// Per-slot time offsets, in the shape the pipeline planner consumes.
    pub fn time_offsets(&self) -> [f32; FILTER_SLOTS] {
        let mut out = [0.0; FILTER_SLOTS];
        for (slot, filter) in self.slots.iter().enumerate() {
            out[slot] = filter.time_offset();
        }
        out
    }

    /// Destroy whatever lives at `slot` and build the described filter into a
    /// fresh 1-D R32F texture.
    pub fn update(&mut self, slot: u32, descriptor: FilterDescriptor, sampling_frequency: f32) {
        let coefficients = match descriptor {
            FilterDescriptor::Kaiser {
                cutoff_frequency,
                beta,
                length,
            } => math::kaiser_low_pass_filter(cutoff_frequency, sampling_frequency, beta, length),
        };

        let filter = &mut self.slots[slot as usize % FILTER_SLOTS];
        debug!(
            "building filter {:?} in slot {} (fs = {} Hz)",
            descriptor, slot, sampling_frequency
        );
        unsafe {
            gl::DeleteTextures(1, &filter.texture);
            gl::CreateTextures(gl::TEXTURE_1D, 1, &mut filter.texture);
            gl::TextureStorage1D(filter.texture, 1, gl::R32F, coefficients.len() as GLsizei);
            gl::TextureSubImage1D(
                filter.texture,
                0,
                0,
                coefficients.len() as GLsizei,
                gl::RED,
                gl::FLOAT,
                coefficients.as_ptr() as *const _,
            );
        }
        filter.descriptor = Some(descriptor);
        filter.sampling_frequency = sampling_frequency;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kaiser_time_offset() {
        let filter = Filter {
            texture: 0,
            descriptor: Some(FilterDescriptor::Kaiser {
                cutoff_frequency: 5.0e6,
                beta: 6.0,
                length: 65,
            }),
            sampling_frequency: 40.0e6,
        };
        let expected = -65.0 / 2.0 / 40.0e6;
        assert!((filter.time_offset() - expected).abs() < 1.0e-12);
    }

    #[test]
    fn empty_slot_has_no_time_offset() {
        let store = FilterStore::new();
        assert_eq!(store.get(0).time_offset(), 0.0);
        assert_eq!(store.time_offsets(), [0.0; FILTER_SLOTS]);
    }
}
