//! A fixed-capacity ring of hardware descriptors with generation-bit tracking.
//!
//! A ring is shared with the device: the driver posts descriptors at `next` and the
//! device consumes them in order starting at `head`. Rather than a separate full/empty flag,
//! each descriptor carries a generation bit; the ring's `gen` flips every time `next` wraps,
//! so a descriptor whose bit matches the reader's expected `gen` is fresh and one that
//! doesn't is stale.

use core::mem::size_of;
use alloc::{boxed::Box, sync::Arc};
use nic_buffers::{DmaAllocator, DmaRegion, PhysicalAddress};
use owning_ref::BoxRefMut;
use zerocopy::FromBytes;
use crate::regs::{DESC_ALIGN, MAX_RING_SIZE};

/// The generation bit value of a freshly initialized ring.
pub const INIT_GEN: bool = true;

/// A fixed-size record the device reads from or writes into a ring.
pub trait Descriptor: FromBytes {
    /// Zeroes the descriptor's contents.
    fn clear(&mut self);
}

/// A descriptor written by the device to report finished work.
pub trait CompletionDescriptor: Descriptor {
    /// The generation bit the device wrote with this completion.
    fn gen(&self) -> bool;
}

/// `N` descriptors of type `D` in physically-contiguous memory,
/// plus the driver's cursors into them.
pub struct DescriptorRing<D: Descriptor, const N: usize> {
    descs: BoxRefMut<DmaRegion, [D]>,
    /// The oldest slot still owned by the device.
    head: usize,
    /// The next slot the driver will post.
    next: usize,
    /// How many slots are posted and not yet retired.
    fill: usize,
    /// The generation bit of the current pass over the ring.
    gen: bool,
}

impl<D: Descriptor, const N: usize> DescriptorRing<D, N> {
    const VALID_SIZE: () = assert!(N > 0 && N <= MAX_RING_SIZE, "ring size must be between 1 and 4096");

    /// Allocates the ring's descriptors and zeroes them.
    pub fn new(allocator: &Arc<dyn DmaAllocator>) -> Result<DescriptorRing<D, N>, &'static str> {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SIZE;

        let region = DmaRegion::allocate(allocator, N * size_of::<D>(), DESC_ALIGN)?;
        // cast our physically-contiguous region into a slice of descriptors
        let descs = BoxRefMut::new(Box::new(region)).try_map_mut(|r| r.as_slice_mut::<D>(0, N))?;
        let mut ring = DescriptorRing { descs, head: 0, next: 0, fill: 0, gen: INIT_GEN };
        ring.clear_all();
        Ok(ring)
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Physical address of the first descriptor, which is what the device is told.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.descs.as_owner().phys_addr()
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn next(&self) -> usize {
        self.next
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn gen(&self) -> bool {
        self.gen
    }

    pub fn free_slots(&self) -> usize {
        N - self.fill
    }

    pub fn is_full(&self) -> bool {
        self.fill == N
    }

    /// Returns the descriptor at `index`, which must be less than `N`.
    pub fn get(&self, index: usize) -> &D {
        debug_assert!(index < N);
        &self.descs[index]
    }

    /// Returns the descriptor at `index`, which must be less than `N`.
    pub fn get_mut(&mut self, index: usize) -> &mut D {
        debug_assert!(index < N);
        &mut self.descs[index]
    }

    pub fn clear(&mut self, index: usize) {
        self.get_mut(index).clear();
    }

    pub fn clear_all(&mut self) {
        for desc in self.descs.iter_mut() {
            desc.clear();
        }
    }

    /// Marks the slot at `next` as posted and moves `next` forward,
    /// flipping `gen` when it wraps around to slot 0.
    pub fn advance(&mut self) {
        debug_assert!(self.fill < N, "advanced a full ring");
        self.next += 1;
        if self.next == N {
            self.next = 0;
            self.gen = !self.gen;
        }
        self.fill += 1;
    }

    /// Returns `count` slots starting at `head` to the driver.
    pub fn retire(&mut self, count: usize) {
        debug_assert!(count <= self.fill, "retired more slots than were posted");
        self.head = (self.head + count) % N;
        self.fill -= count;
    }

    /// Steps over one slot without keeping it in flight.
    /// Completion rings use this, since the driver only reads them.
    pub fn skip(&mut self) {
        self.advance();
        self.retire(1);
    }

    /// Puts every cursor and the generation bit back to their initial values and zeroes all descriptors.
    /// The underlying memory is kept.
    pub fn reset(&mut self) {
        self.head = 0;
        self.next = 0;
        self.fill = 0;
        self.gen = INIT_GEN;
        self.clear_all();
    }
}
