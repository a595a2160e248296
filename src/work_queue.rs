//! Bounded single-producer single-consumer work queue.
//!
//! The queue is embedded in the shared memory region, so everything here has
//! a fixed binary layout. One 64-bit word packs the producer write index in
//! the low half and the consumer read index in the high half; each half is
//! only ever advanced by its own side, which is what makes the packed word
//! safe to mutate with plain atomic adds.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::filter::FilterDescriptor;

const WORK_QUEUE_SLOTS: usize = 1 << 6;

/// Upload targets distinguished by the `UploadBuffer` work item.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UploadKind {
    ChannelMapping = 0,
    SparseElements = 1,
    FocalVectors = 2,
    RfData = 3,
}

#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportKind {
    BeamformedData = 0,
    Stats = 1,
}

/// A queued unit of work. The tag and payloads have a fixed layout so items
/// can cross the process boundary.
#[repr(C, i32)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WorkBody {
    /// Run the planned pipeline into the frame with this id.
    Compute { frame_id: u32 },
    /// Run the planned pipeline into the next free frame for this view plane.
    ComputeIndirect { view_plane: i32 },
    /// Recompile the named program and all of its specializations.
    ReloadShader { kind: i32 },
    /// Copy the latest result (or the stats table) into the scratch area.
    ExportBuffer { kind: ExportKind, size: u32 },
    /// (Re)build the filter texture at `slot`, using the sampling frequency
    /// in the parameter block at handling time.
    CreateFilter {
        slot: u32,
        descriptor: FilterDescriptor,
    },
    /// Copy a shared memory range into the matching GPU resource.
    UploadBuffer {
        kind: UploadKind,
        shared_memory_offset: u64,
        size: u32,
    },
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WorkItem {
    pub body: WorkBody,
    /// Sync slot (as `LockKind`) to post on completion; `-1` for none.
    pub lock: i32,
}

impl WorkItem {
    pub fn new(body: WorkBody) -> WorkItem {
        WorkItem { body, lock: -1 }
    }

    pub fn with_lock(body: WorkBody, lock: crate::sync::LockKind) -> WorkItem {
        WorkItem {
            body,
            lock: lock as i32,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFull;

#[repr(C)]
pub struct WorkQueue {
    /// Low 32 bits: write index. High 32 bits: read index. Monotonic; reduced
    /// modulo the slot count on access.
    indices: AtomicU64,
    items: [UnsafeCell<WorkItem>; WORK_QUEUE_SLOTS],
}

// Single producer / single consumer; the index protocol keeps both sides on
// disjoint slots.
unsafe impl Sync for WorkQueue {}
unsafe impl Send for WorkQueue {}

const INDEX_MASK: u64 = (WORK_QUEUE_SLOTS - 1) as u64;
// The write half must never carry into the read half; clearing the top bit of
// the low word periodically keeps the monotonic counter from overflowing.
const WRITE_CARRY_GUARD: u64 = 0x8000_0000;

impl WorkQueue {
    /// Usable capacity: one slot is sacrificed to distinguish full from empty.
    pub const fn capacity() -> usize {
        WORK_QUEUE_SLOTS - 1
    }

    /// Heap-allocate an empty queue (for the worker's internal queue; the
    /// external queue lives inside the shared memory header).
    pub fn new_boxed() -> Box<WorkQueue> {
        // zeroed is a valid empty queue: indices 0, every slot decodes as
        // Compute { frame_id: 0 }
        unsafe { Box::new(std::mem::zeroed()) }
    }

    /// Reserve the next slot for writing. The slot is reset to an empty item
    /// and not visible to the consumer until [`WorkQueue::push_commit`].
    ///
    /// Only one thread may produce at a time.
    pub fn push(&self) -> Result<&mut WorkItem, QueueFull> {
        let val = self.indices.load(Ordering::Acquire);
        let widx = val & INDEX_MASK;
        let ridx = (val >> 32) & INDEX_MASK;
        let next = (widx + 1) & INDEX_MASK;

        if val & WRITE_CARRY_GUARD != 0 {
            self.indices.fetch_and(!WRITE_CARRY_GUARD, Ordering::AcqRel);
        }

        if next == ridx {
            return Err(QueueFull);
        }
        let slot = unsafe { &mut *self.items[widx as usize].get() };
        *slot = WorkItem::new(WorkBody::Compute { frame_id: 0 });
        Ok(slot)
    }

    /// Publish the most recently reserved slot to the consumer.
    pub fn push_commit(&self) {
        self.indices.fetch_add(1, Ordering::Release);
    }

    /// Peek the oldest committed item. The item stays in the queue (and may
    /// be rewritten in place) until [`WorkQueue::pop_commit`].
    ///
    /// Only one thread may consume at a time.
    pub fn pop(&self) -> Option<&mut WorkItem> {
        let val = self.indices.load(Ordering::Acquire);
        let widx = val & INDEX_MASK;
        let ridx = (val >> 32) & INDEX_MASK;
        if ridx == widx {
            None
        } else {
            Some(unsafe { &mut *self.items[ridx as usize].get() })
        }
    }

    /// Retire the item returned by the last [`WorkQueue::pop`].
    pub fn pop_commit(&self) {
        self.indices.fetch_add(1 << 32, Ordering::AcqRel);
    }

    pub fn is_empty(&self) -> bool {
        let val = self.indices.load(Ordering::Acquire);
        (val & INDEX_MASK) == ((val >> 32) & INDEX_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn push_item(q: &WorkQueue, item: WorkItem) -> Result<(), QueueFull> {
        let slot = q.push()?;
        *slot = item;
        q.push_commit();
        Ok(())
    }

    #[test]
    fn fifo_order() {
        let q = WorkQueue::new_boxed();
        for i in 0..5 {
            push_item(&q, WorkItem::new(WorkBody::Compute { frame_id: i })).unwrap();
        }
        for i in 0..5 {
            let item = q.pop().expect("item committed");
            assert_eq!(item.body, WorkBody::Compute { frame_id: i });
            q.pop_commit();
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn full_queue_rejects_push_without_state_change() {
        let q = WorkQueue::new_boxed();
        for i in 0..WorkQueue::capacity() {
            push_item(&q, WorkItem::new(WorkBody::Compute { frame_id: i as u32 }))
                .expect("within capacity");
        }
        assert_eq!(q.push().err(), Some(QueueFull));

        // the failed push left the queue intact: drain everything in order
        for i in 0..WorkQueue::capacity() {
            let item = q.pop().expect("item survived the failed push");
            assert_eq!(item.body, WorkBody::Compute { frame_id: i as u32 });
            q.pop_commit();
        }
        assert!(q.is_empty());
    }

    #[test]
    fn reserved_slot_is_invisible_until_commit() {
        let q = WorkQueue::new_boxed();
        let slot = q.push().unwrap();
        slot.body = WorkBody::ComputeIndirect { view_plane: 1 };
        assert!(q.pop().is_none());
        q.push_commit();
        assert_eq!(
            q.pop().unwrap().body,
            WorkBody::ComputeIndirect { view_plane: 1 }
        );
    }

    #[test]
    fn uncommitted_pop_item_can_be_rewritten_in_place() {
        let q = WorkQueue::new_boxed();
        push_item(&q, WorkItem::new(WorkBody::ReloadShader { kind: 0 })).unwrap();

        // consumer converts the item instead of retiring it
        let item = q.pop().unwrap();
        item.body = WorkBody::Compute { frame_id: 7 };

        let again = q.pop().unwrap();
        assert_eq!(again.body, WorkBody::Compute { frame_id: 7 });
        q.pop_commit();
        assert!(q.pop().is_none());
    }

    #[test]
    fn spsc_threads_preserve_order_and_never_lose_items() {
        let q: Arc<WorkQueue> = Arc::from(WorkQueue::new_boxed());
        let total = 10_000u32;

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut sent = 0;
                while sent < total {
                    if let Ok(slot) = q.push() {
                        slot.body = WorkBody::Compute { frame_id: sent };
                        q.push_commit();
                        sent += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < total {
            if let Some(item) = q.pop() {
                assert_eq!(item.body, WorkBody::Compute { frame_id: expected });
                q.pop_commit();
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert!(q.is_empty());
    }
}
