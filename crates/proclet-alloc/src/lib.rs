//! Address planning, heap-segment pooling, and the per-proclet slab
//! allocator (C1/C2).

pub mod addr_plan;
pub mod segment_pool;
pub mod size_class;
pub mod slab;

pub use addr_plan::{AddressPlan, AddressPlanParams};
pub use segment_pool::{FreedSegment, SegmentPool};
pub use size_class::{class_for, SizeClassInfo, MAX_SMALL_SIZE, NUM_SIZE_CLASSES, SIZE_CLASSES};
pub use slab::{free_cross_proclet, slab_registry, BlockHandle, Slab, SlabId, SlabRegistry};
