//! The interface between NIC drivers and the rest of the networking stack.
//!
//! Drivers implement [`NetworkInterfaceCard`]; the stack implements [`NetworkStack`]
//! to receive frames and link reports from a driver.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use core::sync::atomic::{AtomicUsize, Ordering};
use alloc::{
    collections::VecDeque,
    format,
    string::String,
    vec::Vec,
};
use nic_buffers::{ReceivedFrame, TxPacket};
use spin::Mutex;


/// A trait that defines the necessary minimum functions that all network interface card (NIC) drivers
/// should implement.
pub trait NetworkInterfaceCard {
    /// Why a packet could not be accepted. It hands the packet back to the caller.
    type SendError;

    /// Hands the given packet to this NIC for transmission.
    /// Never blocks waiting for hardware; if the NIC can't take the packet right now, it is returned in the error.
    fn send_packet(&self, packet: TxPacket) -> Result<(), Self::SendError>;

    /// Poll the NIC for received frames, delivering them to the network stack.
    /// Can be used as an alternative to interrupts, or as a supplement to interrupts.
    fn poll_receive(&self) -> Result<(), &'static str>;

    /// Returns the MAC address that this NIC is configured with.
    fn mac_address(&self) -> [u8; 6];

    fn link_status(&self) -> LinkStatus;

    /// Returns a snapshot of this NIC's traffic counters.
    fn statistics(&self) -> NicStatistics;
}


/// The sink through which a NIC driver reports to the network stack.
pub trait NetworkStack: Send + Sync {
    /// Takes ownership of one complete received frame.
    fn deliver_frame(&self, frame: ReceivedFrame);
    fn link_status_changed(&self, status: LinkStatus);
    fn mac_address_changed(&self, mac: [u8; 6]);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    pub speed_mbps: u32,
}

/// Per-direction traffic counters. Every counter only ever grows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NicStatistics {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Packets refused because they could not be described to the NIC.
    pub tx_errors: u64,
    /// Accepted packets that were discarded without being sent, e.g., by a reset.
    pub tx_drops: u64,
    pub tx_csum: u64,
    pub tx_tso: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_drops: u64,
    /// Received frames whose checksums the NIC validated.
    pub rx_csum: u64,
    /// Received frames whose checksums the NIC found to be wrong.
    pub rx_csum_err: u64,
}


/// Hands out instance numbers and names (`eth0`, `eth1`, ...) to NICs as they are probed.
pub struct InterfaceRegistry {
    prefix: &'static str,
    next: AtomicUsize,
    names: Mutex<Vec<String>>,
}

/// The identity a NIC was given by an [`InterfaceRegistry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceId {
    pub index: usize,
    pub name: String,
}

impl InterfaceRegistry {
    pub const fn new(prefix: &'static str) -> InterfaceRegistry {
        InterfaceRegistry { prefix, next: AtomicUsize::new(0), names: Mutex::new(Vec::new()) }
    }

    /// Reserves the next instance number.
    pub fn register(&self) -> InterfaceId {
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        let name = format!("{}{}", self.prefix, index);
        debug!("InterfaceRegistry: registered {}", name);
        self.names.lock().push(name.clone());
        InterfaceId { index, name }
    }

    /// The names of every interface registered so far, in order.
    pub fn registered(&self) -> Vec<String> {
        self.names.lock().clone()
    }
}


/// A [`NetworkStack`] that simply queues what it is given, for consumers that poll.
#[derive(Default)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<ReceivedFrame>>,
    link: Mutex<LinkStatus>,
    mac: Mutex<Option<[u8; 6]>>,
}

impl FrameQueue {
    pub fn new() -> FrameQueue {
        FrameQueue::default()
    }

    /// Returns the earliest received frame.
    pub fn pop_frame(&self) -> Option<ReceivedFrame> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn link_status(&self) -> LinkStatus {
        *self.link.lock()
    }

    pub fn mac_address(&self) -> Option<[u8; 6]> {
        *self.mac.lock()
    }
}

impl NetworkStack for FrameQueue {
    fn deliver_frame(&self, frame: ReceivedFrame) {
        self.frames.lock().push_back(frame);
    }

    fn link_status_changed(&self, status: LinkStatus) {
        *self.link.lock() = status;
    }

    fn mac_address_changed(&self, mac: [u8; 6]) {
        *self.mac.lock() = Some(mac);
    }
}
