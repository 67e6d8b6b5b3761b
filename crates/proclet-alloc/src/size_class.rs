//! Size-class table for the slab allocator (grounded in the tcmalloc-style
//! size classing used by production slab allocators: round every
//! allocation up to one of a small number of buckets so free lists stay
//! dense and cross-core transfers move fixed-size batches).

/// One size class: every allocation assigned to it is rounded up to
/// `size` bytes, and objects move between a core's local cache and the
/// shared transfer list in batches of `batch_size`.
#[derive(Debug, Clone, Copy)]
pub struct SizeClassInfo {
    pub size: u32,
    pub batch_size: u32,
}

/// 8 B .. 64 KiB in a tcmalloc-like progression: tight steps while small,
/// geometric once the per-object bookkeeping overhead stops mattering.
pub const NUM_SIZE_CLASSES: usize = 18;

pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = [
    SizeClassInfo { size: 8, batch_size: 32 },
    SizeClassInfo { size: 16, batch_size: 32 },
    SizeClassInfo { size: 32, batch_size: 32 },
    SizeClassInfo { size: 48, batch_size: 32 },
    SizeClassInfo { size: 64, batch_size: 32 },
    SizeClassInfo { size: 96, batch_size: 32 },
    SizeClassInfo { size: 128, batch_size: 32 },
    SizeClassInfo { size: 192, batch_size: 16 },
    SizeClassInfo { size: 256, batch_size: 16 },
    SizeClassInfo { size: 384, batch_size: 16 },
    SizeClassInfo { size: 512, batch_size: 8 },
    SizeClassInfo { size: 1024, batch_size: 8 },
    SizeClassInfo { size: 2048, batch_size: 8 },
    SizeClassInfo { size: 4096, batch_size: 4 },
    SizeClassInfo { size: 8192, batch_size: 4 },
    SizeClassInfo { size: 16384, batch_size: 2 },
    SizeClassInfo { size: 32768, batch_size: 2 },
    SizeClassInfo { size: 65536, batch_size: 1 },
];

/// Maximum size handled through a size class; anything bigger is a direct,
/// unbatched allocation (mirrors tcmalloc's "large object" path).
pub const MAX_SMALL_SIZE: u32 = 65536;

/// Index of the smallest size class able to hold `bytes`, or `None` if it
/// needs the large-object path.
pub fn class_for(bytes: usize) -> Option<usize> {
    if bytes as u32 > MAX_SMALL_SIZE {
        return None;
    }
    SIZE_CLASSES.iter().position(|c| c.size as usize >= bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_fit_picks_matching_class() {
        let idx = class_for(64).unwrap();
        assert_eq!(SIZE_CLASSES[idx].size, 64);
    }

    #[test]
    fn rounds_up_to_next_class() {
        let idx = class_for(50).unwrap();
        assert_eq!(SIZE_CLASSES[idx].size, 64);
    }

    #[test]
    fn oversized_request_has_no_class() {
        assert!(class_for(MAX_SMALL_SIZE as usize + 1).is_none());
    }

    #[test]
    fn classes_are_monotonically_increasing() {
        for pair in SIZE_CLASSES.windows(2) {
            assert!(pair[0].size < pair[1].size);
        }
    }
}
