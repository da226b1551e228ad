//! 定长的位图分配器
//!
//! 每一位代表一个槽位，置位表示已分配。`alloc` 总是返回最小的空闲下标，
//! 保证在相同的调用序列下得到相同的描述符布局。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = u64::BITS as usize;

#[inline]
const fn word_count(size: usize) -> usize {
    size.div_ceil(WORD_BITS)
}

/// 位图中的下标
///
/// `BitIndex::INVALID` 表示分配失败（位图已满）。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitIndex(usize);

impl BitIndex {
    pub const INVALID: Self = Self(usize::MAX);

    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != usize::MAX
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BitIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() { write!(f, "BitIndex({})", self.0) } else { write!(f, "BitIndex(INVALID)") }
    }
}

/// 单线程位图
///
/// 调用方负责外部同步；需要并发访问时使用 [`AtomicBitMap`]。
#[derive(Clone)]
pub struct BitMap {
    size: usize,
    words: Box<[u64]>,
}

// new & init
impl BitMap {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            words: vec![0; word_count(size)].into_boxed_slice(),
        }
    }
}

// alloc & release
impl BitMap {
    /// 从下标 0 开始查找第一个空闲位并占用
    pub fn alloc(&mut self) -> BitIndex {
        for (word_index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }

            let bit = word.trailing_ones() as usize;
            let index = word_index * WORD_BITS + bit;
            // 最后一个 word 中超出 size 的位永远不分配
            if index >= self.size {
                return BitIndex::INVALID;
            }

            *word |= 1 << bit;
            return BitIndex(index);
        }

        BitIndex::INVALID
    }

    /// 释放一个已分配的下标
    ///
    /// 释放未分配或越界的下标属于调用方错误
    pub fn release(&mut self, index: BitIndex) {
        debug_assert!(index.0 < self.size, "release out of range index {:?} (size {})", index, self.size);
        debug_assert!(self.test(index), "release unallocated index {:?}", index);

        let (word, mask) = Self::locate(index);
        self.words[word] &= !mask;
    }

    #[inline]
    pub fn test(&self, index: BitIndex) -> bool {
        if index.0 >= self.size {
            return false;
        }
        let (word, mask) = Self::locate(index);
        self.words[word] & mask != 0
    }

    pub fn reset(&mut self) {
        self.words.fill(0);
    }
}

// getters
impl BitMap {
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前已分配的槽位数
    pub fn allocated_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    fn locate(index: BitIndex) -> (usize, u64) {
        (index.0 / WORD_BITS, 1 << (index.0 % WORD_BITS))
    }
}

impl fmt::Debug for BitMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitMap").field("size", &self.size).field("allocated", &self.allocated_count()).finish()
    }
}

/// 线程安全的位图
///
/// 通过 `fetch_or` 抢占空闲位，失败时继续向后查找，因此多个线程可以同时分配。
pub struct AtomicBitMap {
    size: usize,
    words: Box<[AtomicU64]>,
}

impl AtomicBitMap {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            words: (0..word_count(size)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn alloc(&self) -> BitIndex {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Acquire);
            while current != u64::MAX {
                let bit = current.trailing_ones() as usize;
                let index = word_index * WORD_BITS + bit;
                if index >= self.size {
                    return BitIndex::INVALID;
                }

                let mask = 1u64 << bit;
                let previous = word.fetch_or(mask, Ordering::AcqRel);
                if previous & mask == 0 {
                    return BitIndex(index);
                }
                // 该位被其他线程抢先占用，重新读取
                current = previous | mask;
            }
        }

        BitIndex::INVALID
    }

    pub fn release(&self, index: BitIndex) {
        debug_assert!(index.0 < self.size, "release out of range index {:?} (size {})", index, self.size);

        let (word, mask) = BitMap::locate(index);
        let previous = self.words[word].fetch_and(!mask, Ordering::AcqRel);
        debug_assert!(previous & mask != 0, "release unallocated index {:?}", index);
    }

    pub fn test(&self, index: BitIndex) -> bool {
        if index.0 >= self.size {
            return false;
        }
        let (word, mask) = BitMap::locate(index);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    pub fn reset(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocated_count(&self) -> usize {
        self.words.iter().map(|w| w.load(Ordering::Acquire).count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_alloc_is_lowest_free_first() {
        for size in [1, 7, 64, 65, 130] {
            let mut bitmap = BitMap::new(size);
            for expected in 0..size {
                assert_eq!(bitmap.alloc(), BitIndex::new(expected));
            }
            assert_eq!(bitmap.alloc(), BitIndex::INVALID);
            assert_eq!(bitmap.allocated_count(), size);
        }
    }

    #[test]
    fn test_release_then_realloc() {
        let mut bitmap = BitMap::new(8);
        for _ in 0..8 {
            assert!(bitmap.alloc().is_valid());
        }
        assert_eq!(bitmap.alloc(), BitIndex::INVALID);

        bitmap.release(BitIndex::new(3));
        assert!(!bitmap.test(BitIndex::new(3)));
        assert_eq!(bitmap.alloc(), BitIndex::new(3));
        assert_eq!(bitmap.alloc(), BitIndex::INVALID);
    }

    #[test]
    fn test_live_indices_are_unique_and_bounded() {
        // 简单的线性同余序列驱动 alloc / release
        let size = 37;
        let mut bitmap = BitMap::new(size);
        let mut live: Vec<BitIndex> = Vec::new();
        let mut seed: u32 = 0x1234_5678;

        for _ in 0..2000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            if seed % 3 != 0 || live.is_empty() {
                let index = bitmap.alloc();
                if index.is_valid() {
                    assert!(!live.contains(&index));
                    live.push(index);
                } else {
                    assert_eq!(live.len(), size);
                }
            } else {
                let victim = live.swap_remove((seed as usize / 3) % live.len());
                bitmap.release(victim);
            }

            assert!(live.len() <= size);
            assert_eq!(bitmap.allocated_count(), live.len());
            let unique: HashSet<_> = live.iter().copied().collect();
            assert_eq!(unique.len(), live.len());
        }
    }

    #[test]
    fn test_reset_and_out_of_range() {
        let mut bitmap = BitMap::new(4);
        bitmap.alloc();
        bitmap.alloc();
        assert!(!bitmap.test(BitIndex::new(100)));
        assert!(!bitmap.test(BitIndex::INVALID));

        bitmap.reset();
        assert_eq!(bitmap.allocated_count(), 0);
        assert_eq!(bitmap.alloc(), BitIndex::new(0));
    }

    #[test]
    fn test_zero_sized() {
        let mut bitmap = BitMap::new(0);
        assert_eq!(bitmap.alloc(), BitIndex::INVALID);
    }

    #[test]
    fn test_atomic_concurrent_alloc() {
        let bitmap = Arc::new(AtomicBitMap::new(256));
        let threads = (0..4)
            .map(|_| {
                let bitmap = bitmap.clone();
                std::thread::spawn(move || (0..64).map(|_| bitmap.alloc()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut all = HashSet::new();
        for thread in threads {
            for index in thread.join().unwrap() {
                assert!(index.is_valid());
                assert!(all.insert(index));
            }
        }
        assert_eq!(all.len(), 256);
        assert_eq!(bitmap.alloc(), BitIndex::INVALID);

        bitmap.release(BitIndex::new(100));
        assert_eq!(bitmap.alloc(), BitIndex::new(100));
    }
}
