//! Physically-contiguous memory that a device can access through DMA.
//!
//! The driver never maps memory itself; instead it asks a [`DmaAllocator`] for a region
//! of a given size and alignment and receives both a virtual address it can dereference
//! and the physical address that must be handed to the device.

use core::{
    fmt,
    mem::{align_of, size_of},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use alloc::{
    alloc::{alloc_zeroed, dealloc, Layout},
    sync::Arc,
};
use zerocopy::FromBytes;

/// A device-visible physical memory address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(value: u64) -> PhysicalAddress {
        PhysicalAddress(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The lower 32 bits, as written into a device's "low" address register.
    pub const fn low_u32(&self) -> u32 {
        self.0 as u32
    }

    /// The upper 32 bits, as written into a device's "high" address register.
    pub const fn high_u32(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the address `offset` bytes past this one.
    pub const fn offset(&self, offset: usize) -> PhysicalAddress {
        PhysicalAddress(self.0 + offset as u64)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}
impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
impl fmt::UpperHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}


/// The interface to whatever part of the OS hands out physically-contiguous memory.
pub trait DmaAllocator: Send + Sync {
    /// Allocates a zero-filled, physically-contiguous region of at least `size` bytes
    /// whose physical address is aligned to `align` bytes.
    ///
    /// Returns the region's virtual address and its starting physical address.
    fn allocate(&self, size: usize, align: usize) -> Result<(NonNull<u8>, PhysicalAddress), &'static str>;

    /// Returns a region to the allocator.
    ///
    /// # Safety
    /// `vaddr` must have been returned by [`DmaAllocator::allocate`] on this allocator
    /// with the same `size` and `align`, and must not be used afterwards.
    unsafe fn deallocate(&self, vaddr: NonNull<u8>, size: usize, align: usize);
}


/// An owned region of DMA memory, freed back to its allocator when dropped.
///
/// This offers the same typed views as Theseus's `MappedPages`,
/// i.e., `as_slice`, `as_slice_mut`, `as_type` and `as_type_mut`.
pub struct DmaRegion {
    vaddr: NonNull<u8>,
    paddr: PhysicalAddress,
    size: usize,
    align: usize,
    allocator: Arc<dyn DmaAllocator>,
}

// SAFETY: a `DmaRegion` exclusively owns its memory, just like a `Box<[u8]>`.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocates a new zeroed region of `size` bytes, aligned to `align` bytes.
    ///
    /// # Arguments
    /// * `allocator`: the allocator that provides (and will later reclaim) the memory
    /// * `size`: size of the region in bytes, must be non-zero
    /// * `align`: required alignment of the physical address, must be a power of two
    pub fn allocate(allocator: &Arc<dyn DmaAllocator>, size: usize, align: usize) -> Result<DmaRegion, &'static str> {
        if size == 0 {
            return Err("DmaRegion::allocate(): size was zero");
        }
        if !align.is_power_of_two() {
            return Err("DmaRegion::allocate(): alignment was not a power of two");
        }
        let (vaddr, paddr) = allocator.allocate(size, align)?;
        if paddr.value() % align as u64 != 0 {
            // SAFETY: returned above by the same allocator with the same parameters.
            unsafe { allocator.deallocate(vaddr, size, align) };
            return Err("DmaRegion::allocate(): allocator returned a misaligned physical address");
        }
        Ok(DmaRegion { vaddr, paddr, size, align, allocator: Arc::clone(allocator) })
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.paddr
    }

    pub fn start_address(&self) -> usize {
        self.vaddr.as_ptr() as usize
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    fn check_bounds<T>(&self, byte_offset: usize, length: usize) -> Result<*mut T, &'static str> {
        let end = size_of::<T>()
            .checked_mul(length)
            .and_then(|bytes| bytes.checked_add(byte_offset))
            .ok_or("DmaRegion: requested range overflowed")?;
        if end > self.size {
            return Err("DmaRegion: requested range was larger than the region");
        }
        let addr = self.start_address() + byte_offset;
        if addr % align_of::<T>() != 0 {
            return Err("DmaRegion: requested type was misaligned within the region");
        }
        Ok(addr as *mut T)
    }

    /// Reinterprets `length` elements of type `T` starting at `byte_offset` as a slice.
    pub fn as_slice<T: FromBytes>(&self, byte_offset: usize, length: usize) -> Result<&[T], &'static str> {
        let ptr = self.check_bounds::<T>(byte_offset, length)?;
        // SAFETY: bounds and alignment checked above, any bit pattern is a valid `T`,
        // and the returned lifetime is tied to `self`, which owns the memory.
        Ok(unsafe { core::slice::from_raw_parts(ptr as *const T, length) })
    }

    /// Mutable version of [`DmaRegion::as_slice`].
    pub fn as_slice_mut<T: FromBytes>(&mut self, byte_offset: usize, length: usize) -> Result<&mut [T], &'static str> {
        let ptr = self.check_bounds::<T>(byte_offset, length)?;
        // SAFETY: same as `as_slice`, plus `&mut self` guarantees exclusive access.
        Ok(unsafe { core::slice::from_raw_parts_mut(ptr, length) })
    }

    /// Reinterprets the bytes starting at `byte_offset` as a `T`.
    pub fn as_type<T: FromBytes>(&self, byte_offset: usize) -> Result<&T, &'static str> {
        self.as_slice::<T>(byte_offset, 1).map(|s| &s[0])
    }

    /// Mutable version of [`DmaRegion::as_type`].
    pub fn as_type_mut<T: FromBytes>(&mut self, byte_offset: usize) -> Result<&mut T, &'static str> {
        self.as_slice_mut::<T>(byte_offset, 1).map(|s| &mut s[0])
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: this region was obtained from `self.allocator` with exactly these parameters.
        unsafe { self.allocator.deallocate(self.vaddr, self.size, self.align) };
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DmaRegion {{ vaddr: {:#X}, paddr: {:#X}, size: {} }}", self.start_address(), self.paddr, self.size)
    }
}


/// A [`DmaAllocator`] that carves regions out of the kernel heap.
///
/// This is only correct where the heap is identity-mapped, i.e., the virtual address
/// of heap memory equals its physical address, such as an early-boot environment or a
/// hosted device model.
#[derive(Default)]
pub struct HeapDmaAllocator {
    live_regions: AtomicUsize,
}

impl HeapDmaAllocator {
    pub const fn new() -> HeapDmaAllocator {
        HeapDmaAllocator { live_regions: AtomicUsize::new(0) }
    }

    /// The number of regions that have been allocated but not yet freed.
    pub fn live_regions(&self) -> usize {
        self.live_regions.load(Ordering::Acquire)
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<(NonNull<u8>, PhysicalAddress), &'static str> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_e| "HeapDmaAllocator: invalid size or alignment")?;
        // SAFETY: `DmaRegion::allocate` never requests a zero-sized layout.
        let ptr = unsafe { alloc_zeroed(layout) };
        let vaddr = NonNull::new(ptr).ok_or("HeapDmaAllocator: out of memory")?;
        self.live_regions.fetch_add(1, Ordering::AcqRel);
        Ok((vaddr, PhysicalAddress::new(ptr as u64)))
    }

    unsafe fn deallocate(&self, vaddr: NonNull<u8>, size: usize, align: usize) {
        if let Ok(layout) = Layout::from_size_align(size, align) {
            dealloc(vaddr.as_ptr(), layout);
            self.live_regions.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
