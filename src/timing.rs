//! GPU timing plumbing.
//!
//! The executor pushes timing events into a lock-free ring as it dispatches;
//! the UI thread drains the ring into rolling per-shader averages. Producer
//! and consumer each own one monotonic index, reduced modulo the ring size on
//! access; the read index is advanced only after a row has been folded in, so
//! the coalesced table is consistent after every event.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::params::{ShaderKind, SHADER_KIND_COUNT};

pub const TIMING_RING_CAPACITY: usize = 4096;

/// Frames of history the rolling averages run over.
pub const STATS_HISTORY_LEN: usize = 32;

#[repr(C, u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimingEvent {
    ComputeFrameBegin,
    ComputeFrameEnd,
    /// Elapsed GPU nanoseconds for one dispatched stage.
    Shader { shader: i32, timer_count: u64 },
    /// GPU timestamp taken when an RF upload landed.
    RfData { timer_count: u64 },
}

#[repr(C)]
pub struct TimingRing {
    write_index: AtomicU32,
    read_index: AtomicU32,
    buffer: [UnsafeCell<TimingEvent>; TIMING_RING_CAPACITY],
}

unsafe impl Sync for TimingRing {}
unsafe impl Send for TimingRing {}

impl TimingRing {
    pub fn new_boxed() -> Box<TimingRing> {
        // zeroed: indices 0, slots decode as ComputeFrameBegin and are never
        // read before being written
        unsafe { Box::new(std::mem::zeroed()) }
    }

    /// Producer side: record an event. Single producer (the GPU worker).
    pub fn push(&self, event: TimingEvent) {
        let index = self.write_index.fetch_add(1, Ordering::AcqRel) as usize;
        unsafe {
            *self.buffer[index % TIMING_RING_CAPACITY].get() = event;
        }
    }

    /// True once the consumer has caught up with every published event.
    pub fn drained(&self) -> bool {
        self.write_index.load(Ordering::Acquire) == self.read_index.load(Ordering::Acquire)
    }
}

/// Per-frame stage times plus RF arrival deltas, in export layout.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ComputeStatsTable {
    pub times: [[f32; SHADER_KIND_COUNT]; STATS_HISTORY_LEN],
    pub rf_time_deltas: [f32; STATS_HISTORY_LEN],
}

unsafe impl bytemuck::Zeroable for ComputeStatsTable {}
unsafe impl bytemuck::Pod for ComputeStatsTable {}

impl Default for ComputeStatsTable {
    fn default() -> ComputeStatsTable {
        ComputeStatsTable {
            times: [[0.0; SHADER_KIND_COUNT]; STATS_HISTORY_LEN],
            rf_time_deltas: [0.0; STATS_HISTORY_LEN],
        }
    }
}

/// Consumer-side coalesced state.
pub struct ComputeStats {
    pub table: ComputeStatsTable,
    pub average_times: [f32; SHADER_KIND_COUNT],
    pub rf_time_delta_average: f32,
    latest_frame_index: u32,
    latest_rf_index: u32,
    last_rf_timer_count: u64,
    compute_frame_active: bool,
}

impl ComputeStats {
    pub fn new() -> ComputeStats {
        ComputeStats {
            table: ComputeStatsTable::default(),
            average_times: [0.0; SHADER_KIND_COUNT],
            rf_time_delta_average: 0.0,
            latest_frame_index: 0,
            latest_rf_index: 0,
            last_rf_timer_count: 0,
            compute_frame_active: false,
        }
    }

    pub fn average_time_for(&self, shader: ShaderKind) -> f32 {
        self.average_times[shader as usize]
    }

    /// Drain every event published up to the producer's current snapshot.
    pub fn coalesce(&mut self, ring: &TimingRing) {
        let target = ring.write_index.load(Ordering::Acquire);
        let mut stats_index = (self.latest_frame_index + 1) % STATS_HISTORY_LEN as u32;

        let mut seen_shaders = [false; SHADER_KIND_COUNT];
        let mut seen_rf = false;

        while ring.read_index.load(Ordering::Acquire) != target {
            let read = ring.read_index.load(Ordering::Acquire);
            let event =
                unsafe { *ring.buffer[read as usize % TIMING_RING_CAPACITY].get() };
            match event {
                TimingEvent::ComputeFrameBegin => {
                    debug_assert!(!self.compute_frame_active);
                    self.compute_frame_active = true;
                    // multiple instances of one shader accumulate within a row
                    self.table.times[stats_index as usize] = [0.0; SHADER_KIND_COUNT];
                }
                TimingEvent::ComputeFrameEnd => {
                    debug_assert!(self.compute_frame_active);
                    self.compute_frame_active = false;
                    self.latest_frame_index = stats_index;
                    stats_index = (stats_index + 1) % STATS_HISTORY_LEN as u32;
                }
                TimingEvent::Shader {
                    shader,
                    timer_count,
                } => {
                    if let Some(kind) = ShaderKind::from_i32(shader) {
                        self.table.times[stats_index as usize][kind as usize] +=
                            timer_count as f32 / 1.0e9;
                        seen_shaders[kind as usize] = true;
                    }
                }
                TimingEvent::RfData { timer_count } => {
                    self.latest_rf_index =
                        (self.latest_rf_index + 1) % STATS_HISTORY_LEN as u32;
                    let delta =
                        timer_count.wrapping_sub(self.last_rf_timer_count) as f32 / 1.0e9;
                    self.table.rf_time_deltas[self.latest_rf_index as usize] = delta;
                    self.last_rf_timer_count = timer_count;
                    seen_rf = true;
                }
            }
            // advance last so exported state is consistent at every point
            ring.read_index.fetch_add(1, Ordering::AcqRel);
        }

        for (shader, seen) in seen_shaders.iter().enumerate() {
            if *seen {
                let sum: f32 = self.table.times.iter().map(|row| row[shader]).sum();
                self.average_times[shader] = sum / STATS_HISTORY_LEN as f32;
            }
        }
        if seen_rf {
            let sum: f32 = self.table.rf_time_deltas.iter().sum();
            self.rf_time_delta_average = sum / STATS_HISTORY_LEN as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_times_accumulate_into_the_active_row() {
        let ring = TimingRing::new_boxed();
        let mut stats = ComputeStats::new();

        ring.push(TimingEvent::ComputeFrameBegin);
        ring.push(TimingEvent::Shader {
            shader: ShaderKind::Decode as i32,
            timer_count: 1_000_000,
        });
        ring.push(TimingEvent::Shader {
            shader: ShaderKind::Decode as i32,
            timer_count: 2_000_000,
        });
        ring.push(TimingEvent::Shader {
            shader: ShaderKind::DasFast as i32,
            timer_count: 5_000_000,
        });
        ring.push(TimingEvent::ComputeFrameEnd);
        stats.coalesce(&ring);

        assert!(ring.drained());
        let row = stats.table.times[stats.latest_frame_index as usize];
        assert!((row[ShaderKind::Decode as usize] - 3.0e-3).abs() < 1.0e-9);
        assert!((row[ShaderKind::DasFast as usize] - 5.0e-3).abs() < 1.0e-9);
        // rolling average over the whole history window
        assert!(
            (stats.average_time_for(ShaderKind::Decode) - 3.0e-3 / STATS_HISTORY_LEN as f32)
                .abs()
                < 1.0e-9
        );
    }

    #[test]
    fn frame_rows_advance_on_end() {
        let ring = TimingRing::new_boxed();
        let mut stats = ComputeStats::new();

        for timer in [1_000_000u64, 4_000_000] {
            ring.push(TimingEvent::ComputeFrameBegin);
            ring.push(TimingEvent::Shader {
                shader: ShaderKind::Sum as i32,
                timer_count: timer,
            });
            ring.push(TimingEvent::ComputeFrameEnd);
        }
        stats.coalesce(&ring);

        assert_eq!(stats.latest_frame_index, 2);
        assert!(
            (stats.table.times[1][ShaderKind::Sum as usize] - 1.0e-3).abs() < 1.0e-9
        );
        assert!(
            (stats.table.times[2][ShaderKind::Sum as usize] - 4.0e-3).abs() < 1.0e-9
        );
    }

    #[test]
    fn begin_resets_a_recycled_row() {
        let ring = TimingRing::new_boxed();
        let mut stats = ComputeStats::new();

        // fill one full history window plus one frame targeting row 1 again
        for _ in 0..(STATS_HISTORY_LEN + 1) {
            ring.push(TimingEvent::ComputeFrameBegin);
            ring.push(TimingEvent::Shader {
                shader: ShaderKind::MinMax as i32,
                timer_count: 2_000_000,
            });
            ring.push(TimingEvent::ComputeFrameEnd);
            stats.coalesce(&ring);
        }
        // the recycled row holds only the new frame's time
        let row = stats.table.times[stats.latest_frame_index as usize];
        assert!((row[ShaderKind::MinMax as usize] - 2.0e-3).abs() < 1.0e-9);
    }

    #[test]
    fn rf_deltas_feed_a_separate_rolling_buffer() {
        let ring = TimingRing::new_boxed();
        let mut stats = ComputeStats::new();

        ring.push(TimingEvent::RfData {
            timer_count: 10_000_000,
        });
        ring.push(TimingEvent::RfData {
            timer_count: 30_000_000,
        });
        ring.push(TimingEvent::RfData {
            timer_count: 70_000_000,
        });
        stats.coalesce(&ring);

        assert!((stats.table.rf_time_deltas[2] - 20.0e-3).abs() < 1.0e-9);
        assert!((stats.table.rf_time_deltas[3] - 40.0e-3).abs() < 1.0e-9);
        assert!(stats.rf_time_delta_average > 0.0);
    }

    #[test]
    fn coalescing_is_incremental() {
        let ring = TimingRing::new_boxed();
        let mut stats = ComputeStats::new();

        ring.push(TimingEvent::ComputeFrameBegin);
        stats.coalesce(&ring);
        assert!(ring.drained());

        ring.push(TimingEvent::Shader {
            shader: ShaderKind::Das as i32,
            timer_count: 8_000_000,
        });
        ring.push(TimingEvent::ComputeFrameEnd);
        stats.coalesce(&ring);

        let row = stats.table.times[stats.latest_frame_index as usize];
        assert!((row[ShaderKind::Das as usize] - 8.0e-3).abs() < 1.0e-9);
    }
}
