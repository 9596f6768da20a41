//! Frame reference counting.
//!
//! One table for the whole system, keyed by physical frame number and
//! guarded by a single interrupt-safe lock. A frame absent from the table
//! has, by convention, a count of zero: it is either unmapped or owned
//! exclusively by whoever holds it. The mapper counts every leaf it
//! installs, so any frame visible through a user page table is tracked.
//!
//! Dropping the last reference is the one place a mapped frame returns to
//! its provider. All entry storage is allocated once at initialisation,
//! so the critical sections are O(chain) lookups that never touch the
//! heap. Capacity is fixed and running out of it is unrecoverable; the
//! sizing is explicit so the boot code can make it inspectable.

use alloc::boxed::Box;
use alloc::vec::Vec;

use phoenix_arch::IrqSpinMutex;
use phoenix_paging::PhysAddr;

use crate::frames::FrameProvider;

/// Sizing for the reference table, chosen at boot from the amount of
/// manageable physical memory.
#[derive(Clone, Copy, Debug)]
pub struct RefTableConfig {
    /// Upper bound on simultaneously tracked frames.
    pub max_tracked_frames: usize,
}

impl Default for RefTableConfig {
    fn default() -> Self {
        Self {
            max_tracked_frames: 8192,
        }
    }
}

// End-of-chain marker for bucket heads and entry links.
const NIL: usize = usize::MAX;

struct RefEntry {
    frame: u64,
    count: u32,
    next: usize,
}

/// Chained hash table from frame number to share count, backed by a
/// preallocated entry arena and a free list.
pub struct FrameRefTable {
    heads: Box<[usize]>,
    entries: Box<[RefEntry]>,
    free: usize,
    tracked: usize,
}

impl FrameRefTable {
    #[must_use]
    pub fn new(config: RefTableConfig) -> Self {
        let capacity = config.max_tracked_frames.max(1);
        let bucket_count = (capacity / 4).next_power_of_two().max(64);
        let heads = (0..bucket_count)
            .map(|_| NIL)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Every slot starts on the free list, threaded in order.
        let entries = (0..capacity)
            .map(|i| RefEntry {
                frame: 0,
                count: 0,
                next: if i + 1 < capacity { i + 1 } else { NIL },
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            heads,
            entries,
            free: 0,
            tracked: 0,
        }
    }

    fn bucket(&self, frame: u64) -> usize {
        frame as usize & (self.heads.len() - 1)
    }

    fn find(&self, frame: u64) -> Option<usize> {
        let mut slot = self.heads[self.bucket(frame)];
        while slot != NIL {
            let entry = &self.entries[slot];
            if entry.frame == frame {
                return Some(slot);
            }
            slot = entry.next;
        }
        None
    }

    /// Adds one reference, returning the new count.
    pub fn increment(&mut self, frame: u64) -> u32 {
        if let Some(slot) = self.find(frame) {
            self.entries[slot].count += 1;
            return self.entries[slot].count;
        }
        assert!(
            self.free != NIL,
            "frame reference table exhausted at {} frames",
            self.entries.len()
        );
        let slot = self.free;
        self.free = self.entries[slot].next;
        let bucket = self.bucket(frame);
        self.entries[slot] = RefEntry {
            frame,
            count: 1,
            next: self.heads[bucket],
        };
        self.heads[bucket] = slot;
        self.tracked += 1;
        1
    }

    /// Drops one reference, returning the remaining count. At zero the
    /// entry is unlinked and its slot returned to the free list;
    /// ownership of the frame reverts to the caller.
    pub fn decrement(&mut self, frame: u64) -> u32 {
        let bucket = self.bucket(frame);
        let mut prev = NIL;
        let mut slot = self.heads[bucket];
        while slot != NIL && self.entries[slot].frame != frame {
            prev = slot;
            slot = self.entries[slot].next;
        }
        if slot == NIL {
            log::warn!("refcount: decrement of untracked frame {frame:#x}");
            return 0;
        }
        self.entries[slot].count -= 1;
        let remaining = self.entries[slot].count;
        if remaining == 0 {
            let next = self.entries[slot].next;
            if prev == NIL {
                self.heads[bucket] = next;
            } else {
                self.entries[prev].next = next;
            }
            self.entries[slot].next = self.free;
            self.free = slot;
            self.tracked -= 1;
        }
        remaining
    }

    /// Current count; zero for untracked frames.
    #[must_use]
    pub fn get(&self, frame: u64) -> u32 {
        self.find(frame).map_or(0, |slot| self.entries[slot].count)
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.tracked
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

// -- global instance -----------------------------------------------------

static REF_TABLE: IrqSpinMutex<Option<FrameRefTable>> = IrqSpinMutex::new(None);

/// Installs the system table. Called once during memory bring-up.
pub fn init(config: RefTableConfig) {
    let mut guard = REF_TABLE.lock();
    assert!(guard.is_none(), "frame reference table initialised twice");
    log::info!(
        "frame reference table: capacity {} frames",
        config.max_tracked_frames
    );
    *guard = Some(FrameRefTable::new(config));
}

fn with_table<R>(f: impl FnOnce(&mut FrameRefTable) -> R) -> R {
    let mut guard = REF_TABLE.lock();
    f(guard
        .as_mut()
        .expect("frame reference table used before init"))
}

/// Adds one reference to a mapped frame.
pub fn increment(frame: PhysAddr) -> u32 {
    with_table(|t| t.increment(frame.frame()))
}

/// Drops one reference; on the last one the frame goes back to
/// `provider`. Returns the remaining count.
pub fn decrement(frame: PhysAddr, provider: &dyn FrameProvider) -> u32 {
    let remaining = with_table(|t| t.decrement(frame.frame()));
    if remaining == 0 {
        provider.free_frame(frame);
    }
    remaining
}

/// Current count for a frame; zero means untracked.
#[must_use]
pub fn get(frame: PhysAddr) -> u32 {
    with_table(|t| t.get(frame.frame()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec as StdVec;

    #[test]
    fn counts_rise_and_fall() {
        let mut table = FrameRefTable::new(RefTableConfig {
            max_tracked_frames: 16,
        });
        assert_eq!(table.get(7), 0);
        assert_eq!(table.increment(7), 1);
        assert_eq!(table.increment(7), 2);
        assert_eq!(table.get(7), 2);
        assert_eq!(table.decrement(7), 1);
        assert_eq!(table.decrement(7), 0);
        assert_eq!(table.get(7), 0);
        assert_eq!(table.tracked(), 0);
    }

    #[test]
    fn untracked_decrement_reports_zero() {
        let mut table = FrameRefTable::new(RefTableConfig::default());
        assert_eq!(table.decrement(99), 0);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn capacity_overflow_is_fatal() {
        let mut table = FrameRefTable::new(RefTableConfig {
            max_tracked_frames: 4,
        });
        for frame in 0..5 {
            table.increment(frame);
        }
    }

    #[test]
    fn colliding_frames_keep_distinct_counts() {
        let mut table = FrameRefTable::new(RefTableConfig {
            max_tracked_frames: 1024,
        });
        // Same bucket by construction: identical low bits.
        let stride = (table.heads.len() as u64) * 3;
        for i in 0..8u64 {
            let frame = 5 + i * stride;
            for _ in 0..=i {
                table.increment(frame);
            }
        }
        for i in 0..8u64 {
            assert_eq!(table.get(5 + i * stride), i as u32 + 1);
        }
    }

    #[test]
    fn entry_slots_are_recycled_without_growing() {
        let mut table = FrameRefTable::new(RefTableConfig {
            max_tracked_frames: 8,
        });
        assert_eq!(table.capacity(), 8);
        for round in 0..3u64 {
            let base = round * 100;
            for frame in base..base + 8 {
                assert_eq!(table.increment(frame), 1);
            }
            assert_eq!(table.tracked(), 8);
            for frame in base..base + 8 {
                assert_eq!(table.decrement(frame), 0);
            }
            assert_eq!(table.tracked(), 0);
        }
        assert_eq!(table.capacity(), 8);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        const THREADS: u64 = 8;
        const FRAMES: u64 = 16;
        const UPS: u32 = 200;
        const DOWNS: u32 = 120;

        let table = Arc::new(IrqSpinMutex::new(FrameRefTable::new(RefTableConfig {
            max_tracked_frames: FRAMES as usize,
        })));
        let mut handles = StdVec::new();
        for t in 0..THREADS {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let lcg = |x: u64| x.wrapping_mul(6364136223846793005).wrapping_add(1);
                // A cheap per-thread shuffle keeps the interleaving honest.
                let seed = t.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
                let mut x = seed;
                for _ in 0..UPS {
                    x = lcg(x);
                    table.lock().increment(x % FRAMES);
                }
                // Replay the same sequence so every decrement hits a frame
                // this thread previously incremented.
                let mut x = seed;
                for _ in 0..DOWNS {
                    x = lcg(x);
                    table.lock().decrement(x % FRAMES);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let table = table.lock();
        let total: u64 = (0..FRAMES).map(|f| u64::from(table.get(f))).sum();
        assert_eq!(total, THREADS * u64::from(UPS - DOWNS));
    }
}
