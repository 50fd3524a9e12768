//! Records shared between the driver and the device in DMA memory.
//!
//! The driver-shared record is the root: its physical address is handed to the device
//! through `DSL`/`DSH`, and it points at the queue-shared records, which in turn point at the rings.
//! The layouts below are fixed by the device and must not change.

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use crate::regs::MAX_INTRS;

/// Written into [`DriverShared::magic`] so the device recognizes revision-1 records.
pub const REV1_MAGIC: u32 = 0xBABE_FEE1;
/// The driver version reported to the device.
pub const DRIVER_VERSION: u32 = 0x0001_0000;

pub const GOS_32BIT: u32 = 0x01;
pub const GOS_64BIT: u32 = 0x02;

/// Bit in [`DriverShared::ictrl`] that masks every interrupt at once.
pub const ICTRL_DISABLE_ALL: u32 = 0x01;
/// Moderation level that lets the device pick the interrupt rate.
pub const IMOD_ADAPTIVE: u8 = 8;

/// Guest OS word for the architecture this driver was built for.
pub const fn guest_info() -> u32 {
    if cfg!(target_pointer_width = "64") { GOS_64BIT } else { GOS_32BIT }
}


/// Location and size of an optional configuration block (RSS, power management, plugins).
#[derive(FromBytes, Default, Debug, Clone, Copy)]
#[repr(C)]
pub struct SharedRegionDesc {
    pub version: u32,
    pub len: u32,
    pub paddr: u64,
}
const_assert_eq!(core::mem::size_of::<SharedRegionDesc>(), 16);

/// The driver-shared record.
#[derive(FromBytes)]
#[repr(C)]
pub struct DriverShared {
    pub magic: u32,
    pad1: u32,

    // misc info
    pub version: u32,
    pub guest: u32,
    pub vmxnet3_revision: u32,
    pub upt_version: u32,
    pub upt_features: u64,
    pub driver_data: u64,
    pub queue_shared: u64,
    pub driver_data_len: u32,
    pub queue_shared_len: u32,
    pub mtu: u32,
    pub nrxsg_max: u16,
    pub ntxqueue: u8,
    pub nrxqueue: u8,
    reserved1: [u32; 4],

    // interrupt control
    pub automask: u8,
    pub nintr: u8,
    pub evintr: u8,
    pub modlevel: [u8; MAX_INTRS],
    pub ictrl: u32,
    reserved2: [u32; 2],

    // receive filter
    pub rxmode: u32,
    pub mcast_tablelen: u16,
    pad2: u16,
    pub mcast_table: u64,
    pub vlan_filter: [u32; 128],

    pub rss: SharedRegionDesc,
    pub pm: SharedRegionDesc,
    pub plugin: SharedRegionDesc,

    /// Events the device has raised and the driver has not yet acknowledged.
    pub event: u32,
    reserved3: [u32; 5],
}
const_assert_eq!(core::mem::size_of::<DriverShared>(), 720);

impl DriverShared {
    /// Reads the pending event word the device writes asynchronously.
    pub fn pending_events(&self) -> u32 {
        // SAFETY: a valid, aligned reference.
        unsafe { core::ptr::read_volatile(&self.event) }
    }
}


/// Counters the device keeps for one transmit queue.
#[derive(FromBytes, Default, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UptTxStats {
    pub tso_packets: u64,
    pub tso_bytes: u64,
    pub ucast_packets: u64,
    pub ucast_bytes: u64,
    pub mcast_packets: u64,
    pub mcast_bytes: u64,
    pub bcast_packets: u64,
    pub bcast_bytes: u64,
    pub error: u64,
    pub discard: u64,
}
const_assert_eq!(core::mem::size_of::<UptTxStats>(), 80);

/// Counters the device keeps for one receive queue.
#[derive(FromBytes, Default, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UptRxStats {
    pub lro_packets: u64,
    pub lro_bytes: u64,
    pub ucast_packets: u64,
    pub ucast_bytes: u64,
    pub mcast_packets: u64,
    pub mcast_bytes: u64,
    pub bcast_packets: u64,
    pub bcast_bytes: u64,
    /// Frames dropped because no receive buffer was posted.
    pub nobuffer: u64,
    pub error: u64,
}
const_assert_eq!(core::mem::size_of::<UptRxStats>(), 80);


/// Per transmit queue record, read by the device to find the queue's rings.
#[derive(FromBytes)]
#[repr(C)]
pub struct TxQueueShared {
    pub npending: u32,
    /// How many pending descriptors it takes before the device raises an interrupt.
    pub intr_threshold: u32,
    reserved1: u64,

    pub cmd_ring: u64,
    pub data_ring: u64,
    pub comp_ring: u64,
    pub driver_data: u64,
    reserved2: u64,
    pub cmd_ring_len: u32,
    pub data_ring_len: u32,
    pub comp_ring_len: u32,
    pub driver_data_len: u32,
    pub intr_idx: u8,
    pad1: [u8; 7],

    // written by the device
    pub stopped: u8,
    pad2: [u8; 3],
    pub error: u32,
    pub stats: UptTxStats,
    pad3: [u8; 88],
}
const_assert_eq!(core::mem::size_of::<TxQueueShared>(), 256);

/// Per receive queue record, read by the device to find the queue's rings.
#[derive(FromBytes)]
#[repr(C)]
pub struct RxQueueShared {
    pub update_rxhead: u8,
    pad1: [u8; 7],
    reserved1: u64,

    pub cmd_ring: [u64; 2],
    pub comp_ring: u64,
    pub driver_data: u64,
    reserved2: u64,
    pub cmd_ring_len: [u32; 2],
    pub comp_ring_len: u32,
    pub driver_data_len: u32,
    pub intr_idx: u8,
    pad2: [u8; 7],

    // written by the device
    pub stopped: u8,
    pad3: [u8; 3],
    pub error: u32,
    pub stats: UptRxStats,
    pad4: [u8; 88],
}
const_assert_eq!(core::mem::size_of::<RxQueueShared>(), 256);

/// The status the device reports for one queue, after `GET_STATUS`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub stopped: bool,
    pub error: u32,
}

impl TxQueueShared {
    pub fn status(&self) -> QueueStatus {
        // SAFETY: valid, aligned references; the device writes these fields.
        unsafe {
            QueueStatus {
                stopped: core::ptr::read_volatile(&self.stopped) != 0,
                error: core::ptr::read_volatile(&self.error),
            }
        }
    }

    pub fn device_stats(&self) -> UptTxStats {
        // SAFETY: see `status`.
        unsafe { core::ptr::read_volatile(&self.stats) }
    }
}

impl RxQueueShared {
    pub fn status(&self) -> QueueStatus {
        // SAFETY: valid, aligned references; the device writes these fields.
        unsafe {
            QueueStatus {
                stopped: core::ptr::read_volatile(&self.stopped) != 0,
                error: core::ptr::read_volatile(&self.error),
            }
        }
    }

    pub fn device_stats(&self) -> UptRxStats {
        // SAFETY: see `status`.
        unsafe { core::ptr::read_volatile(&self.stats) }
    }
}

/// Byte offset of the transmit queue record within the queue-shared area.
pub const TX_QUEUE_SHARED_OFFSET: usize = 0;
/// Byte offset of the receive queue record, right after all the transmit records.
pub const RX_QUEUE_SHARED_OFFSET: usize = crate::regs::NUM_TX_QUEUES * core::mem::size_of::<TxQueueShared>();
/// Size of the whole queue-shared area.
pub const QUEUES_SHARED_LEN: usize = RX_QUEUE_SHARED_OFFSET + crate::regs::NUM_RX_QUEUES * core::mem::size_of::<RxQueueShared>();
