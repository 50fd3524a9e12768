//! Functions and interfaces that are used in a NIC initialization procedure.
//!
//! They include the register windows a PCI device exposes through its BARs,
//! the bus-level view of a PCI function, interrupt registration, and filling a receive buffer pool.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

mod interrupts;

pub use interrupts::{dispatch_interrupt, InterruptController, InterruptHandlers, VectorClass};

use core::ptr::NonNull;
use alloc::{sync::Arc, vec::Vec};
use nic_buffers::ReceiveBufferPool;
use volatile::Volatile;


/// A window of 32-bit device registers, such as the memory behind one PCI BAR.
///
/// Offsets are in bytes from the start of the window.
pub trait RegisterWindow: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    fn size_in_bytes(&self) -> usize;
}

/// A [`RegisterWindow`] backed by memory-mapped I/O.
pub struct MmioRegion {
    base: NonNull<Volatile<u32>>,
    size: usize,
}

// SAFETY: every access is a single volatile 32-bit load or store, which the device serializes.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wraps an already-mapped register region.
    ///
    /// # Safety
    /// `virt_base` must be the start of a mapping of at least `size` bytes of device memory
    /// that stays mapped, uncached, for the lifetime of the returned object.
    pub unsafe fn new(virt_base: usize, size: usize) -> Result<MmioRegion, &'static str> {
        if virt_base % 4 != 0 {
            return Err("MmioRegion::new(): base address was not 4-byte aligned");
        }
        let base = NonNull::new(virt_base as *mut Volatile<u32>).ok_or("MmioRegion::new(): base address was null")?;
        Ok(MmioRegion { base, size })
    }

    fn register(&self, offset: usize) -> Option<*mut Volatile<u32>> {
        if offset % 4 != 0 || offset + 4 > self.size {
            error!("MmioRegion: invalid register offset {:#X} in a window of {:#X} bytes", offset, self.size);
            return None;
        }
        // SAFETY: in bounds of the mapping per the checks above.
        Some(unsafe { self.base.as_ptr().add(offset / 4) })
    }
}

impl RegisterWindow for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        match self.register(offset) {
            // SAFETY: `register` only returns pointers into the mapped window.
            Some(reg) => unsafe { (*reg).read() },
            None => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        if let Some(reg) = self.register(offset) {
            // SAFETY: see `read32`.
            unsafe { (*reg).write(value) }
        }
    }

    fn size_in_bytes(&self) -> usize {
        self.size
    }
}


/// The bus-level view of one PCI function that a driver is bound to.
pub trait PciFunction {
    fn vendor_id(&self) -> u16;
    fn device_id(&self) -> u16;
    /// Maps the memory BAR with the given index and returns its register window.
    fn map_bar(&self, bar: u8) -> Result<Arc<dyn RegisterWindow>, &'static str>;
    /// Allows the device to initiate DMA.
    fn enable_bus_mastering(&self);
}

/// Maps the register memory behind `bar` and checks that it covers at least `min_size` bytes.
///
/// # Arguments
/// * `dev`: the PCI function owning the BAR
/// * `bar`: index of the BAR to map
/// * `min_size`: the smallest window the driver's register layout fits into
pub fn allocate_device_register_memory(dev: &dyn PciFunction, bar: u8, min_size: usize) -> Result<Arc<dyn RegisterWindow>, &'static str> {
    let window = dev.map_bar(bar)?;
    if window.size_in_bytes() < min_size {
        error!("nic_initialization: BAR{} is {:#X} bytes, need at least {:#X}", bar, window.size_in_bytes(), min_size);
        return Err("BAR window was too small for the device's registers");
    }
    Ok(window)
}

/// Initialize the receive buffer pool from where receive buffers are taken and returned
///
/// # Arguments
/// * `num_rx_buffers`: number of buffers that are initially added to the pool
/// * `rx_buffer_pool`: buffer pool to initialize
pub fn init_rx_buf_pool(num_rx_buffers: usize, rx_buffer_pool: &Arc<ReceiveBufferPool>) -> Result<(), &'static str> {
    let buffers = (0..num_rx_buffers)
        .map(|_| rx_buffer_pool.allocate())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            error!("nic_initialization::init_rx_buf_pool(): couldn't create {} rx buffers: {}", num_rx_buffers, e);
            e
        })?;
    // dropping them puts them all back into the pool
    drop(buffers);
    Ok(())
}
