//! Controller-side heap-segment pool (§3 "Heap segment", §4.4 `allocate_proclet`
//! / `destroy_proclet`).
//!
//! Mirrors a textbook buddy/page-heap free-list: one bucket per power-of-two
//! size class, carved out of the address planner's proclet-heap region on
//! first use and split from the next larger bucket when a class runs dry.
//! Freed segments are returned keyed by `prev_host` so a later allocation of
//! the same size can pass that node as a placement hint (§3 "memory
//! locality").

use std::collections::VecDeque;

use proclet_common::ids::NodeId;

use crate::addr_plan::AddressPlan;

/// A segment handed back to the controller on `destroy_proclet`.
#[derive(Debug, Clone, Copy)]
pub struct FreedSegment {
    pub base: u64,
    pub shift: u8,
    pub prev_host: NodeId,
}

struct Bucket {
    shift: u8,
    free: VecDeque<FreedSegment>,
}

/// Per-LP segment allocator. One instance lives inside the controller's
/// per-LP state.
pub struct SegmentPool {
    min_shift: u8,
    max_shift: u8,
    next_base: u64,
    heap_end: u64,
    buckets: Vec<Bucket>,
}

impl SegmentPool {
    pub fn new(plan: &AddressPlan) -> Self {
        let params = plan.params();
        let min_shift = plan.min_segment_shift();
        let max_shift = plan.max_segment_shift();
        let buckets = (min_shift..=max_shift)
            .map(|shift| Bucket {
                shift,
                free: VecDeque::new(),
            })
            .collect();
        SegmentPool {
            min_shift,
            max_shift,
            next_base: params.proclet_heap_base,
            heap_end: params.proclet_heap_base + params.proclet_heap_len,
            buckets,
        }
    }

    fn bucket_index(&self, shift: u8) -> usize {
        (shift - self.min_shift) as usize
    }

    /// Carve a brand-new, never-before-used segment of `shift` bits.
    fn carve_fresh(&mut self, shift: u8) -> Option<u64> {
        let size = 1u64 << shift;
        // Keep the bump pointer aligned to the class it is about to serve.
        let aligned = (self.next_base + size - 1) & !(size - 1);
        if aligned + size > self.heap_end {
            return None;
        }
        self.next_base = aligned + size;
        Some(aligned)
    }

    /// Allocate a segment able to hold `min_bytes`. Splits the smallest
    /// larger non-empty bucket when the exact class is empty, the way a
    /// buddy allocator splits a bigger block rather than failing outright.
    ///
    /// Returns `(base, shift)`, with `hint` honored when a free segment at
    /// exactly that base is available in the target bucket (placement
    /// locality, §3).
    pub fn allocate(&mut self, min_bytes: u64, hint: Option<NodeId>) -> Option<(u64, u8)> {
        self.allocate_with_origin(min_bytes, hint).map(|(base, shift, _)| (base, shift))
    }

    /// Same as [`SegmentPool::allocate`], but also reports the `prev_host`
    /// of the segment actually handed out when it came from the free list
    /// (placement locality, §4.4: "ip_hint > prev_host > round-robin").
    /// `None` in the third slot means the segment was freshly carved and
    /// carries no locality information.
    pub fn allocate_with_origin(
        &mut self,
        min_bytes: u64,
        hint: Option<NodeId>,
    ) -> Option<(u64, u8, Option<NodeId>)> {
        let target_shift = proclet_common::ids::CapacityClass::covering(
            min_bytes,
            self.min_shift,
            self.max_shift,
        )?
        .0;
        let idx = self.bucket_index(target_shift);

        if !self.buckets[idx].free.is_empty() {
            if let Some(hint) = hint {
                if let Some(pos) = self.buckets[idx]
                    .free
                    .iter()
                    .position(|seg| seg.prev_host == hint)
                {
                    let seg = self.buckets[idx].free.remove(pos).unwrap();
                    return Some((seg.base, seg.shift, Some(seg.prev_host)));
                }
            }
            let seg = self.buckets[idx].free.pop_front().unwrap();
            return Some((seg.base, seg.shift, Some(seg.prev_host)));
        }

        // Exact class is empty: split the smallest larger non-empty bucket,
        // or fall back to carving brand-new address space.
        for shift in (target_shift + 1)..=self.max_shift {
            let larger_idx = self.bucket_index(shift);
            if let Some(seg) = self.buckets[larger_idx].free.pop_front() {
                self.split_down(seg, target_shift);
                let seg = self.buckets[idx].free.pop_front().unwrap();
                return Some((seg.base, seg.shift, Some(seg.prev_host)));
            }
        }

        self.carve_fresh(target_shift).map(|base| (base, target_shift, None))
    }

    /// Split a larger free segment down to `target_shift`, pushing the
    /// lower half into the target bucket and the buddy halves above it
    /// into the intermediate buckets, exactly as a buddy allocator's
    /// recursive split does.
    fn split_down(&mut self, seg: FreedSegment, target_shift: u8) {
        let base = seg.base;
        let mut shift = seg.shift;
        while shift > target_shift {
            shift -= 1;
            let half = 1u64 << shift;
            let buddy_base = base + half;
            let buddy_idx = self.bucket_index(shift);
            self.buckets[buddy_idx].free.push_back(FreedSegment {
                base: buddy_base,
                shift,
                prev_host: seg.prev_host,
            });
        }
        let idx = self.bucket_index(target_shift);
        self.buckets[idx].free.push_back(FreedSegment {
            base,
            shift: target_shift,
            prev_host: seg.prev_host,
        });
    }

    /// Return a segment to its bucket, keyed by the last host that owned it
    /// (`destroy_proclet`).
    pub fn free(&mut self, segment: FreedSegment) {
        let idx = self.bucket_index(segment.shift);
        self.buckets[idx].free.push_back(segment);
    }
}
