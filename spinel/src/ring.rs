// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-capacity rings of host-submitted commands.

use std::collections::VecDeque;

use bytemuck::Pod;

/// Index arithmetic for a ring of `size` entries.
///
/// Entries are acquired at `head` and released in order at `tail`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ring {
    pub size: u32,
    pub head: u32,
    pub tail: u32,
    /// Entries neither acquired nor awaiting release.
    pub rem: u32,
}

impl Ring {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            head: 0,
            tail: 0,
            rem: size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rem == self.size
    }

    pub fn is_full(&self) -> bool {
        self.rem == 0
    }

    /// Acquires `n` entries at the head.
    pub fn drop_n(&mut self, n: u32) {
        debug_assert!(n <= self.rem, "ring overrun");
        self.rem -= n;
        self.head = (self.head + n) % self.size;
    }

    /// Releases `n` entries at the tail.
    pub fn release_n(&mut self, n: u32) {
        debug_assert!(self.rem + n <= self.size, "ring underrun");
        self.rem += n;
        self.tail = (self.tail + n) % self.size;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.size);
    }
}

/// An immutable window over a ring, captured for one GPU dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct Snap<T> {
    pub id: u64,
    /// Ring index of the first entry.
    pub base: u32,
    pub items: Vec<T>,
}

impl<T> Snap<T> {
    pub fn len(&self) -> u32 {
        self.items.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug)]
struct Outstanding {
    id: u64,
    count: u32,
    done: bool,
}

/// A ring of commands with a "work in progress" window.
///
/// Commands are appended to the window. A [`checkpoint`](Self::checkpoint) marks
/// everything appended so far as complete, and a [`snapshot`](Self::snapshot_alloc)
/// captures the checkpointed commands for a dispatch. The ring space behind a
/// snapshot is only reused after [`snapshot_free`](Self::snapshot_free), so the host
/// can never overwrite commands the GPU has yet to consume.
///
/// A window never wraps around the end of the ring: it is contiguous in the
/// GPU-visible buffer mirroring the ring.
#[derive(Debug)]
pub struct ExtentRing<T> {
    storage: Vec<T>,
    ring: Ring,
    /// Largest window, the size at which a dispatch is launched eagerly.
    eager: u32,
    wip_head: u32,
    wip_count: u32,
    checkpoint: u32,
    next_id: u64,
    outstanding: VecDeque<Outstanding>,
}

impl<T: Pod> ExtentRing<T> {
    /// Creates a ring of `size` commands which flushes every `eager` commands.
    pub fn new(size: u32, eager: u32) -> Self {
        assert!(size > 0, "extent ring must not be empty");
        Self {
            storage: vec![T::zeroed(); size as usize],
            ring: Ring::new(size),
            eager: eager.clamp(1, size),
            wip_head: 0,
            wip_count: 0,
            checkpoint: 0,
            next_id: 0,
            outstanding: VecDeque::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.ring.size
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Commands that can be appended to the window before it must be flushed.
    ///
    /// Zero means the caller has to snapshot the window, or wait for snapshots
    /// in flight to be freed.
    pub fn wip_rem(&self) -> u32 {
        let contiguous = self.ring.size - (self.wip_head + self.wip_count);
        self.ring
            .rem
            .min(contiguous)
            .min(self.eager - self.wip_count)
    }

    /// Commands in the window, checkpointed or not.
    pub fn wip_count(&self) -> u32 {
        self.wip_count
    }

    /// Snapshots which have not been freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Appends as many of `items` as fit in the window, returning how many did.
    pub fn append(&mut self, items: &[T]) -> u32 {
        let n = self.wip_rem().min(items.len() as u32);
        let start = (self.wip_head + self.wip_count) as usize;
        self.storage[start..start + n as usize].copy_from_slice(&items[..n as usize]);
        self.wip_count += n;
        self.ring.drop_n(n);
        n
    }

    /// Marks every command in the window as ready for the next snapshot.
    pub fn checkpoint(&mut self) {
        self.checkpoint = self.wip_count;
    }

    /// Commands the next snapshot would capture.
    pub fn checkpointed(&self) -> u32 {
        self.checkpoint
    }

    /// Captures the checkpointed commands, or `None` if there are none.
    pub fn snapshot_alloc(&mut self) -> Option<Snap<T>> {
        if self.checkpoint == 0 {
            return None;
        }
        let count = self.checkpoint;
        let base = self.wip_head;
        let items = self.storage[base as usize..(base + count) as usize].to_vec();
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.push_back(Outstanding {
            id,
            count,
            done: false,
        });
        self.wip_head = (base + count) % self.ring.size;
        self.wip_count -= count;
        self.checkpoint = 0;
        Some(Snap { id, base, items })
    }

    /// Frees the ring space behind a snapshot.
    ///
    /// Snapshots may complete in any order; space is returned to the ring in order.
    pub fn snapshot_free(&mut self, id: u64) {
        if let Some(entry) = self.outstanding.iter_mut().find(|entry| entry.id == id) {
            entry.done = true;
        }
        while self.outstanding.front().is_some_and(|entry| entry.done) {
            if let Some(entry) = self.outstanding.pop_front() {
                self.ring.release_n(entry.count);
            }
        }
    }

    /// Discards every command. No snapshot may be outstanding.
    pub fn reset(&mut self) {
        debug_assert!(self.outstanding.is_empty(), "reset with snapshots in flight");
        self.outstanding.clear();
        self.ring.reset();
        self.wip_head = 0;
        self.wip_count = 0;
        self.checkpoint = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_bounded_by_eager_size() {
        let mut ring = ExtentRing::<u32>::new(8, 3);
        assert_eq!(ring.append(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(ring.wip_rem(), 0);
        ring.checkpoint();
        let snap = ring.snapshot_alloc().unwrap();
        assert_eq!(snap.items, [1, 2, 3]);
        assert_eq!(snap.base, 0);
        assert_eq!(ring.wip_rem(), 3);
    }

    #[test]
    fn space_is_reused_only_after_free() {
        let mut ring = ExtentRing::<u32>::new(4, 4);
        assert_eq!(ring.append(&[1, 2, 3, 4]), 4);
        ring.checkpoint();
        let snap = ring.snapshot_alloc().unwrap();
        assert_eq!(ring.wip_rem(), 0);
        assert_eq!(ring.append(&[5]), 0);
        ring.snapshot_free(snap.id);
        assert_eq!(ring.wip_rem(), 4);
        assert_eq!(ring.append(&[5, 6]), 2);
        ring.checkpoint();
        let snap = ring.snapshot_alloc().unwrap();
        assert_eq!((snap.base, snap.items), (0, vec![5, 6]));
    }

    #[test]
    fn window_does_not_wrap() {
        let mut ring = ExtentRing::<u32>::new(4, 3);
        ring.append(&[1, 2, 3]);
        ring.checkpoint();
        let first = ring.snapshot_alloc().unwrap();
        ring.snapshot_free(first.id);
        // One slot left before the end of the ring, although four are free.
        assert_eq!(ring.ring().rem, 4);
        assert_eq!(ring.wip_rem(), 1);
        ring.append(&[4]);
        ring.checkpoint();
        let second = ring.snapshot_alloc().unwrap();
        assert_eq!(second.base, 3);
        assert_eq!(ring.wip_rem(), 3);
    }

    #[test]
    fn out_of_order_free_releases_in_order() {
        let mut ring = ExtentRing::<u32>::new(4, 2);
        ring.append(&[1, 2]);
        ring.checkpoint();
        let a = ring.snapshot_alloc().unwrap();
        ring.append(&[3, 4]);
        ring.checkpoint();
        let b = ring.snapshot_alloc().unwrap();
        ring.snapshot_free(b.id);
        assert_eq!(ring.ring().rem, 0);
        ring.snapshot_free(a.id);
        assert_eq!(ring.ring().rem, 4);
        assert_eq!(ring.outstanding(), 0);
    }

    #[test]
    fn only_checkpointed_commands_are_captured() {
        let mut ring = ExtentRing::<u32>::new(8, 8);
        ring.append(&[1, 2]);
        ring.checkpoint();
        ring.append(&[3]);
        let snap = ring.snapshot_alloc().unwrap();
        assert_eq!(snap.items, [1, 2]);
        assert_eq!(ring.wip_count(), 1);
        assert!(ring.snapshot_alloc().is_none());
    }
}
