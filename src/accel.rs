//! Optional vendor-accelerated kernels.
//!
//! Some platforms ship accelerated decode / Hilbert implementations outside
//! the GL pipeline. The executor talks to them through this capability
//! interface, injected at construction; the default implementation does
//! nothing, which leaves every stage on the GL path.

/// Hooks an accelerated implementation may provide. `decode` and `hilbert`
/// return whether they handled the stage; `false` falls back to GL.
pub trait AcceleratorOps {
    /// Called whenever the raw / decoded buffer dimensions change.
    fn init(&self, _rf_raw_dim: [u32; 2], _dec_data_dim: [u32; 4]) {}

    /// Called after the shader storage buffers are (re)allocated.
    fn register_buffers(&self, _rf_data_ssbos: &[u32], _raw_data_ssbo: u32) {}

    fn decode(&self, _input_offset: usize, _output_buffer_index: u32, _channel_offset: u32) -> bool {
        false
    }

    fn hilbert(&self, _input_buffer_index: u32, _output_buffer_index: u32) -> bool {
        false
    }

    fn set_channel_mapping(&self, _mapping: &[i16]) {}
}

/// The GL-only default.
pub struct NoopAccelerator;

impl AcceleratorOps for NoopAccelerator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_accelerator_handles_nothing() {
        let accel = NoopAccelerator;
        accel.init([4096, 2048], [2048, 64, 64, 0]);
        accel.register_buffers(&[1, 2], 3);
        accel.set_channel_mapping(&[0i16; 256]);
        assert!(!accel.decode(0, 0, 0));
        assert!(!accel.hilbert(0, 1));
    }
}
