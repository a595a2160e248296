//! The compute frame ring.
//!
//! A fixed array of output volumes cycled by monotonically assigned frame
//! ids, plus a two-entry accumulator pair used when time averaging is on.
//! Frames are mutated by the GPU worker only; the UI observes the most recent
//! completed frame through an atomic pointer that is replaced only after the
//! frame is marked ready to present.

use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::api::types::GLuint;
use crate::params::{ViewPlaneTag, MAX_BEAMFORMED_SAVED_FRAMES};

/// One beamformed output volume and its presentation metadata.
#[derive(Debug)]
pub struct BeamformFrame {
    pub texture: GLuint,
    pub dim: [i32; 3],
    pub mips: i32,
    pub min_coordinate: [f32; 4],
    pub max_coordinate: [f32; 4],
    pub das_shader_id: i32,
    pub compound_count: u32,
    pub id: u32,
}

impl BeamformFrame {
    fn empty() -> BeamformFrame {
        BeamformFrame {
            texture: 0,
            dim: [0; 3],
            mips: 0,
            min_coordinate: [0.0; 4],
            max_coordinate: [0.0; 4],
            das_shader_id: 0,
            compound_count: 0,
            id: 0,
        }
    }

    /// Bytes of one RG32F volume at mip 0; the size an export must provide.
    pub fn output_size(&self) -> usize {
        self.dim[0] as usize * self.dim[1] as usize * self.dim[2] as usize * 2 * 4
    }
}

#[derive(Debug)]
pub struct ComputeFrame {
    pub frame: BeamformFrame,
    pub view_plane: ViewPlaneTag,
    pub ready_to_present: AtomicU32,
}

impl ComputeFrame {
    fn empty() -> ComputeFrame {
        ComputeFrame {
            frame: BeamformFrame::empty(),
            view_plane: ViewPlaneTag::Xz,
            ready_to_present: AtomicU32::new(0),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_to_present.load(Ordering::Acquire) != 0
    }
}

/// Ring of per-compute frames plus the averaging accumulator pair.
///
/// Boxed by its owner and never moved afterwards: the latest-frame pointer
/// refers into the ring.
pub struct FrameRing {
    frames: [ComputeFrame; MAX_BEAMFORMED_SAVED_FRAMES],
    averaged_frames: [ComputeFrame; 2],
    next_frame_id: AtomicU32,
    averaged_frame_index: AtomicU32,
    latest: AtomicPtr<ComputeFrame>,
}

impl FrameRing {
    pub fn new_boxed() -> Box<FrameRing> {
        Box::new(FrameRing {
            frames: std::array::from_fn(|_| ComputeFrame::empty()),
            averaged_frames: std::array::from_fn(|_| ComputeFrame::empty()),
            next_frame_id: AtomicU32::new(0),
            averaged_frame_index: AtomicU32::new(0),
            latest: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    pub const fn capacity() -> usize {
        MAX_BEAMFORMED_SAVED_FRAMES
    }

    /// Claim the next frame id for a compute targeting `view_plane`. The
    /// frame's ready flag drops until the compute completes.
    pub fn acquire(&mut self, view_plane: ViewPlaneTag) -> u32 {
        let frame_id = self.next_frame_id.fetch_add(1, Ordering::AcqRel);
        let frame = &mut self.frames[frame_id as usize % MAX_BEAMFORMED_SAVED_FRAMES];
        frame.ready_to_present.store(0, Ordering::Release);
        frame.view_plane = view_plane;
        frame.frame.id = frame_id;
        frame_id
    }

    pub fn frame(&self, frame_id: u32) -> &ComputeFrame {
        &self.frames[frame_id as usize % MAX_BEAMFORMED_SAVED_FRAMES]
    }

    pub fn frame_mut(&mut self, frame_id: u32) -> &mut ComputeFrame {
        &mut self.frames[frame_id as usize % MAX_BEAMFORMED_SAVED_FRAMES]
    }

    /// Position of the frame inside the backing array.
    pub fn base_index(&self, frame_id: u32) -> u32 {
        frame_id % MAX_BEAMFORMED_SAVED_FRAMES as u32
    }

    /// Yield `count` consecutive ring slots starting at `start % capacity`.
    pub fn iter_frames(&self, start: u32, count: u32) -> FrameIterator<'_> {
        FrameIterator {
            ring: self,
            offset: start % MAX_BEAMFORMED_SAVED_FRAMES as u32,
            cursor: 0,
            needed: count.min(MAX_BEAMFORMED_SAVED_FRAMES as u32),
        }
    }

    pub fn averaged_frame_index(&self) -> u32 {
        self.averaged_frame_index.load(Ordering::Acquire)
    }

    pub fn averaged_frame(&self, index: u32) -> &ComputeFrame {
        &self.averaged_frames[index as usize % 2]
    }

    pub fn averaged_frame_mut(&mut self, index: u32) -> &mut ComputeFrame {
        &mut self.averaged_frames[index as usize % 2]
    }

    pub fn advance_averaged_frame(&self) -> u32 {
        self.averaged_frame_index.fetch_add(1, Ordering::AcqRel)
    }

    /// Publish `frame` as the latest completed output. The frame must already
    /// be marked ready; readers pair this release store with acquire loads.
    pub fn publish(&self, frame: &ComputeFrame) {
        debug_assert!(frame.is_ready());
        self.latest
            .store(frame as *const ComputeFrame as *mut ComputeFrame, Ordering::Release);
    }

    pub fn latest(&self) -> Option<&ComputeFrame> {
        let ptr = self.latest.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }
}

pub struct FrameIterator<'a> {
    ring: &'a FrameRing,
    offset: u32,
    cursor: u32,
    needed: u32,
}

impl<'a> Iterator for FrameIterator<'a> {
    type Item = &'a ComputeFrame;

    fn next(&mut self) -> Option<&'a ComputeFrame> {
        if self.cursor == self.needed {
            return None;
        }
        let index = (self.offset + self.cursor) % MAX_BEAMFORMED_SAVED_FRAMES as u32;
        self.cursor += 1;
        Some(&self.ring.frames[index as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ids_are_monotonic_and_wrap_modulo_capacity() {
        let mut ring = FrameRing::new_boxed();
        let n = FrameRing::capacity() as u32;
        for expect in 0..(n + 5) {
            let id = ring.acquire(ViewPlaneTag::Xz);
            assert_eq!(id, expect);
            assert_eq!(ring.base_index(id), expect % n);
            assert_eq!(ring.frame(id).frame.id, expect);
        }
        // frame n+4 recycled the slot of frame 4
        assert_eq!(ring.base_index(n + 4), 4);
    }

    #[test]
    fn latest_pointer_follows_ready_frames() {
        let mut ring = FrameRing::new_boxed();
        let n = FrameRing::capacity() as u32;
        for _ in 0..(n + 3) {
            let id = ring.acquire(ViewPlaneTag::Yz);
            assert!(!ring.frame(id).is_ready());
            ring.frame(id).ready_to_present.store(1, Ordering::Release);
            ring.publish(ring.frame(id));
        }
        let latest = ring.latest().unwrap();
        assert!(latest.is_ready());
        assert_eq!(latest.frame.id, n + 2);
    }

    #[test]
    fn iterator_collects_the_last_m_frames() {
        let mut ring = FrameRing::new_boxed();
        let n = FrameRing::capacity() as u32;
        for _ in 0..(n + 7) {
            ring.acquire(ViewPlaneTag::Xz);
        }
        // the most recent frame id is n+6; collect the last 4 frames the way
        // the averaging stage does
        let base = ring.base_index(n + 6);
        let ids: Vec<u32> = ring
            .iter_frames(1 + base.wrapping_sub(4), 4)
            .map(|f| f.frame.id)
            .collect();
        assert_eq!(ids, vec![n + 3, n + 4, n + 5, n + 6]);
    }

    #[test]
    fn averaged_frames_alternate() {
        let ring = FrameRing::new_boxed();
        assert_eq!(ring.advance_averaged_frame(), 0);
        assert_eq!(ring.advance_averaged_frame(), 1);
        assert_eq!(ring.averaged_frame_index(), 2);
    }

    #[test]
    fn output_size_matches_rg32f_volume() {
        let mut frame = BeamformFrame::empty();
        frame.dim = [256, 1, 1024];
        assert_eq!(frame.output_size(), 256 * 1024 * 2 * 4);
    }
}
