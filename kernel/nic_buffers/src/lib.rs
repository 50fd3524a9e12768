//! Defines buffers that are used to send and receive packets,
//! and the physically-contiguous memory they are built from.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

mod dma;

pub use dma::{DmaAllocator, DmaRegion, HeapDmaAllocator, PhysicalAddress};

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use spin::Mutex;

/// Alignment of packet buffers, one cache line.
pub const BUFFER_ALIGNMENT: usize = 64;


/// A buffer that stores one fragment of a packet to be transmitted through the NIC
/// and is guaranteed to be contiguous in physical memory.
/// Auto-dereferences into a byte slice that represents its underlying memory.
pub struct TransmitBuffer {
    region: DmaRegion,
    length: usize,
}

impl TransmitBuffer {
    /// Creates a new zero-filled TransmitBuffer with the specified size in bytes.
    pub fn new(allocator: &Arc<dyn DmaAllocator>, size_in_bytes: usize) -> Result<TransmitBuffer, &'static str> {
        let region = DmaRegion::allocate(allocator, size_in_bytes, BUFFER_ALIGNMENT)?;
        Ok(TransmitBuffer { region, length: size_in_bytes })
    }

    /// Creates a new TransmitBuffer holding a copy of `data`.
    pub fn from_slice(allocator: &Arc<dyn DmaAllocator>, data: &[u8]) -> Result<TransmitBuffer, &'static str> {
        let mut buf = TransmitBuffer::new(allocator, data.len())?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.region.phys_addr()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: usize) -> Result<(), &'static str> {
        if length > self.region.size_in_bytes() {
            Err("TransmitBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl Deref for TransmitBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.region.as_slice(0, self.length).unwrap_or(&[])
    }
}

impl DerefMut for TransmitBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let length = self.length;
        self.region.as_slice_mut(0, length).unwrap_or(&mut [])
    }
}


/// The offload work a packet asks the NIC to perform on transmit.
///
/// Offsets are counted in bytes from the start of the frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxOffload {
    #[default]
    None,
    /// Compute the TCP checksum, whose header begins at `l4_offset`.
    TcpChecksum { l4_offset: u16 },
    /// Compute the UDP checksum, whose header begins at `l4_offset`.
    UdpChecksum { l4_offset: u16 },
    /// Segment a large TCP payload into `mss`-sized packets.
    TcpSegmentation { l4_offset: u16, tcp_header_len: u16, mss: u16 },
}

/// One outgoing logical packet: a chain of fragments plus its offload metadata.
pub struct TxPacket {
    fragments: Vec<TransmitBuffer>,
    offload: TxOffload,
    vlan_tag: Option<u16>,
}

impl TxPacket {
    pub fn new(fragments: Vec<TransmitBuffer>) -> TxPacket {
        TxPacket { fragments, offload: TxOffload::None, vlan_tag: None }
    }

    pub fn single(buffer: TransmitBuffer) -> TxPacket {
        TxPacket::new(alloc::vec![buffer])
    }

    pub fn with_offload(mut self, offload: TxOffload) -> TxPacket {
        self.offload = offload;
        self
    }

    /// Requests that the NIC insert an 802.1Q tag with the given TCI.
    pub fn with_vlan_tag(mut self, tci: u16) -> TxPacket {
        self.vlan_tag = Some(tci);
        self
    }

    pub fn fragments(&self) -> &[TransmitBuffer] {
        &self.fragments
    }

    pub fn offload(&self) -> TxOffload {
        self.offload
    }

    pub fn vlan_tag(&self) -> Option<u16> {
        self.vlan_tag
    }

    /// Total length in bytes of all fragments.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(|f| f.length()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_fragments(self) -> Vec<TransmitBuffer> {
        self.fragments
    }
}


/// A buffer that stores a packet (a piece of an Ethernet frame) that has been received from the NIC
/// and is guaranteed to be contiguous in physical memory.
/// Auto-dereferences into a byte slice that represents its underlying memory.
/// When dropped, its underlying memory is automatically returned to its [`ReceiveBufferPool`] for future reuse.
pub struct ReceiveBuffer {
    region: Option<DmaRegion>,
    length: u16,
    pool: Weak<ReceiveBufferPool>,
}

impl ReceiveBuffer {
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.region.as_ref().map(|r| r.phys_addr()).unwrap_or_default()
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// The number of bytes this buffer can hold.
    pub fn capacity(&self) -> u16 {
        self.region.as_ref().map(|r| r.size_in_bytes() as u16).unwrap_or(0)
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if length > self.capacity() {
            Err("ReceiveBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl Deref for ReceiveBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self.region {
            Some(ref r) => r.as_slice(0, usize::from(self.length)).unwrap_or(&[]),
            None => &[],
        }
    }
}

impl DerefMut for ReceiveBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let length = usize::from(self.length);
        match self.region {
            Some(ref mut r) => r.as_slice_mut(0, length).unwrap_or(&mut []),
            None => &mut [],
        }
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        // trace!("ReceiveBuffer::drop(): length: {:5}, phys_addr: {:#X}", self.length, self.phys_addr());
        if let Some(region) = self.region.take() {
            match self.pool.upgrade() {
                Some(pool) => pool.recycle(region),
                // the pool is gone, so the memory goes straight back to the allocator
                None => drop(region),
            }
        }
    }
}


/// A pool of equally-sized receive buffers.
///
/// Buffers are handed out by [`ReceiveBufferPool::allocate`] and come back automatically
/// when the last owner drops them. New buffers are allocated on demand, up to `max_buffers`.
pub struct ReceiveBufferPool {
    free: Mutex<Vec<DmaRegion>>,
    allocator: Arc<dyn DmaAllocator>,
    buffer_size: u16,
    max_buffers: usize,
    created: AtomicUsize,
}

impl ReceiveBufferPool {
    /// Creates an empty pool.
    ///
    /// # Arguments
    /// * `allocator`: where new buffer memory comes from
    /// * `buffer_size`: size of each receive buffer in bytes
    /// * `max_buffers`: the most buffers this pool will ever create
    pub fn new(allocator: Arc<dyn DmaAllocator>, buffer_size: u16, max_buffers: usize) -> Arc<ReceiveBufferPool> {
        Arc::new(ReceiveBufferPool {
            free: Mutex::new(Vec::with_capacity(max_buffers)),
            allocator,
            buffer_size,
            max_buffers,
            created: AtomicUsize::new(0),
        })
    }

    pub fn buffer_size(&self) -> u16 {
        self.buffer_size
    }

    /// The number of buffers currently sitting unused in the pool.
    pub fn free_buffers(&self) -> usize {
        self.free.lock().len()
    }

    /// The number of buffers this pool has created so far.
    pub fn created_buffers(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Takes a buffer from the pool, or allocates a new one if the pool is empty.
    ///
    /// Fails if the pool is empty and has reached `max_buffers`, or if the allocator fails.
    pub fn allocate(self: &Arc<Self>) -> Result<ReceiveBuffer, &'static str> {
        let region = match self.free.lock().pop() {
            Some(region) => region,
            None => {
                let reserved = self.created.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < self.max_buffers).then(|| n + 1)
                });
                if reserved.is_err() {
                    return Err("ReceiveBufferPool::allocate(): pool exhausted");
                }
                match DmaRegion::allocate(&self.allocator, usize::from(self.buffer_size), BUFFER_ALIGNMENT) {
                    Ok(region) => region,
                    Err(e) => {
                        self.created.fetch_sub(1, Ordering::AcqRel);
                        return Err(e);
                    }
                }
            }
        };
        Ok(ReceiveBuffer {
            region: Some(region),
            length: self.buffer_size,
            pool: Arc::downgrade(self),
        })
    }

    fn recycle(&self, region: DmaRegion) {
        let mut free = self.free.lock();
        if free.len() >= self.max_buffers {
            error!("ReceiveBufferPool: couldn't return buffer at {:#X} to a full pool", region.phys_addr());
            return;
        }
        free.push(region);
    }
}


/// Whether the NIC verified a received frame's checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// The NIC did not check the frame, e.g., it was not IP.
    Unchecked,
    Valid,
    Invalid,
}

/// A network (e.g., Ethernet) frame that has been received by the NIC.
pub struct ReceivedFrame {
    /// The pieces of the frame, in order.
    pub buffers: Vec<ReceiveBuffer>,
    pub checksum: ChecksumStatus,
    /// The 802.1Q TCI the NIC stripped from the frame, if any.
    pub vlan_tag: Option<u16>,
    pub rss_hash: u32,
}

impl ReceivedFrame {
    pub fn new(buffers: Vec<ReceiveBuffer>) -> ReceivedFrame {
        ReceivedFrame { buffers, checksum: ChecksumStatus::Unchecked, vlan_tag: None, rss_hash: 0 }
    }

    /// Total length in bytes of all pieces.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(|b| usize::from(b.length())).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the whole frame into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        for b in &self.buffers {
            bytes.extend_from_slice(b);
        }
        bytes
    }
}
