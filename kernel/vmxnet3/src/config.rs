//! Tunable parameters of a vmxnet3 instance.

use crate::regs::{RxMode, UptFeatures, MAX_RX_SEGMENTS, TX_RING_SIZE};
use crate::shared::IMOD_ADAPTIVE;

/// The default number of posted descriptors after which the transmit doorbell is rung.
pub const DEFAULT_KICK_THRESHOLD: usize = 32;
/// The default number of packets that can wait for room in the transmit ring.
pub const DEFAULT_STAGING_CAPACITY: usize = 4096;
pub const DEFAULT_RX_BUFFER_SIZE: u16 = 2048;
pub const DEFAULT_MTU: u32 = 1500;
/// The default number of receive completions handled in one pass.
pub const DEFAULT_RX_BUDGET: usize = 256;
/// The default most receive buffers the pool will create.
pub const DEFAULT_RX_POOL_SIZE: usize = 1024;

/// Configuration of one vmxnet3 instance, given at probe time.
#[derive(Clone, Debug)]
pub struct Vmxnet3Config {
    /// Ring the transmit doorbell once this many descriptors have been posted without one.
    /// A value of 1 rings it for every packet.
    pub kick_threshold: usize,
    /// How many packets `transmit` may hold back while the ring is full before returning `Busy`.
    pub staging_capacity: usize,
    /// Size in bytes of each receive buffer.
    pub rx_buffer_size: u16,
    /// The most receive buffers this instance will ever allocate.
    pub rx_pool_size: usize,
    pub mtu: u32,
    /// The most receive completions drained per `receive_work` round.
    pub rx_budget: usize,
    pub features: UptFeatures,
    pub rx_mode: RxMode,
    /// Interrupt moderation level written for every vector.
    pub interrupt_moderation: u8,
}

impl Default for Vmxnet3Config {
    fn default() -> Self {
        Vmxnet3Config {
            kick_threshold: DEFAULT_KICK_THRESHOLD,
            staging_capacity: DEFAULT_STAGING_CAPACITY,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            rx_pool_size: DEFAULT_RX_POOL_SIZE,
            mtu: DEFAULT_MTU,
            rx_budget: DEFAULT_RX_BUDGET,
            features: UptFeatures::RX_CSUM | UptFeatures::RX_VLAN,
            rx_mode: RxMode::UCAST | RxMode::BCAST | RxMode::ALLMULTI,
            interrupt_moderation: IMOD_ADAPTIVE,
        }
    }
}

impl Vmxnet3Config {
    /// Checks that every parameter is in a range the device and rings can handle.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.kick_threshold == 0 || self.kick_threshold > TX_RING_SIZE {
            return Err("kick_threshold must be between 1 and the transmit ring size");
        }
        if self.staging_capacity == 0 {
            return Err("staging_capacity must be at least 1");
        }
        if !(64..=0x3FFF).contains(&self.rx_buffer_size) {
            return Err("rx_buffer_size must be between 64 and 16383 bytes");
        }
        if !(60..=9000).contains(&self.mtu) {
            return Err("mtu must be between 60 and 9000 bytes");
        }
        if self.rx_budget == 0 {
            return Err("rx_budget must be at least 1");
        }
        // both rings full, plus a maximal chain being replenished
        if self.rx_pool_size < crate::regs::RX_RING_SIZE * crate::regs::RX_RINGS_PER_QUEUE + MAX_RX_SEGMENTS {
            return Err("rx_pool_size is too small to fill both receive rings");
        }
        if self.features.contains(UptFeatures::RSS) || self.features.contains(UptFeatures::LRO) {
            return Err("RSS and LRO offloads are not supported");
        }
        Ok(())
    }
}
