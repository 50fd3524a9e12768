//! A driver for the VMware vmxnet3 paravirtual network interface card.
//!
//! The device is driven almost entirely through memory shared with the hypervisor:
//! descriptor rings for each queue, per-queue records describing those rings, and one
//! driver-shared record that ties everything together. Registers are only used for
//! doorbells, interrupt masks, and a small command channel.
//!
//! A [`Vmxnet3Nic`] moves through these states:
//! `probe` → `Probed` → `configure` → `Configured` → `enable` → `Enabled`,
//! from which `disable` leads to `Disabled` and `reset` leads back to `Configured`.
//! The version handshake must succeed before the device can be enabled.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

pub mod command;
pub mod config;
pub mod descriptors;
pub mod regs;
pub mod ring;
pub mod rxq;
pub mod shared;
pub mod stats;
pub mod txq;
#[cfg(test)]
mod test_vmxnet3_driver;

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use alloc::{collections::VecDeque, sync::Arc};
use network_interface_card::{InterfaceId, InterfaceRegistry, LinkStatus, NetworkInterfaceCard, NetworkStack, NicStatistics};
use nic_buffers::{DmaAllocator, ReceiveBufferPool, TxPacket};
use nic_initialization::{
    allocate_device_register_memory, init_rx_buf_pool, InterruptController, InterruptHandlers,
    PciFunction, RegisterWindow, VectorClass,
};
use spin::Mutex;
use command::CommandChannel;
use config::Vmxnet3Config;
use regs::*;
use rxq::{ReceiveQueue, RxReassembly, RxRingId};
use shared::{UptRxStats, UptTxStats};
use stats::{RxStats, TxStats};
use txq::{TransmitQueue, TxRequest};

/// The ways bringing up or driving a vmxnet3 device can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vmxnet3Error {
    /// The PCI function is not a vmxnet3 device.
    DeviceMismatch { vendor: u16, device: u16 },
    /// A BAR could not be mapped or is too small.
    BarMapping(&'static str),
    /// The register table failed its consistency check.
    InvalidRegisterLayout(&'static str),
    /// The device doesn't offer the revision or UPT version this driver speaks.
    UnsupportedRevision,
    /// The device answered a command with a failure status.
    CommandFailed { command: Command, status: u32 },
    /// Memory for rings, shared records or buffers could not be obtained.
    Allocation(&'static str),
    /// An interrupt vector could not be registered.
    Interrupt(&'static str),
    /// The device can't be enabled before the version handshake.
    HandshakeRequired,
    /// The operation isn't allowed in the device's current state.
    InvalidState(DeviceState),
    /// A configuration value is out of range.
    InvalidConfig(&'static str),
}

impl From<Vmxnet3Error> for &'static str {
    fn from(error: Vmxnet3Error) -> Self {
        match error {
            Vmxnet3Error::DeviceMismatch { .. } => "PCI device is not a vmxnet3 NIC",
            Vmxnet3Error::BarMapping(e) => e,
            Vmxnet3Error::InvalidRegisterLayout(e) => e,
            Vmxnet3Error::UnsupportedRevision => "vmxnet3 device doesn't support revision 1",
            Vmxnet3Error::CommandFailed { .. } => "vmxnet3 device command failed",
            Vmxnet3Error::Allocation(e) => e,
            Vmxnet3Error::Interrupt(e) => e,
            Vmxnet3Error::HandshakeRequired => "vmxnet3 version handshake has not been done",
            Vmxnet3Error::InvalidState(_) => "operation not allowed in the vmxnet3 device's current state",
            Vmxnet3Error::InvalidConfig(e) => e,
        }
    }
}

impl fmt::Display for Vmxnet3Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Vmxnet3Error::DeviceMismatch { vendor, device } => write!(f, "device {:04x}:{:04x} is not a vmxnet3 NIC", vendor, device),
            Vmxnet3Error::CommandFailed { command, status } => write!(f, "command {:?} failed with status {:#X}", command, status),
            Vmxnet3Error::InvalidState(state) => write!(f, "operation not allowed in state {:?}", state),
            other => {
                let msg: &'static str = (*other).into();
                f.write_str(msg)
            }
        }
    }
}


/// Lifecycle state of a [`Vmxnet3Nic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Resources are allocated, the device has not been told about them.
    Probed,
    /// The shared records have been handed to the device.
    Configured,
    /// Traffic is flowing.
    Enabled,
    Disabled,
}

/// Why a packet was not accepted by [`Vmxnet3Nic::transmit`]. The packet is always handed back.
pub enum TransmitError {
    /// No room right now; try again later.
    Busy(TxPacket),
    /// The device is not enabled.
    NotRunning(TxPacket),
    /// The packet can't be described to the device.
    Invalid { packet: TxPacket, reason: &'static str },
}

impl TransmitError {
    pub fn into_packet(self) -> TxPacket {
        match self {
            TransmitError::Busy(packet) | TransmitError::NotRunning(packet) | TransmitError::Invalid { packet, .. } => packet,
        }
    }
}

impl fmt::Debug for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransmitError::Busy(p) => write!(f, "Busy({} bytes)", p.len()),
            TransmitError::NotRunning(p) => write!(f, "NotRunning({} bytes)", p.len()),
            TransmitError::Invalid { packet, reason } => write!(f, "Invalid({} bytes: {})", packet.len(), reason),
        }
    }
}


struct RxPath {
    queue: ReceiveQueue,
    reassembly: RxReassembly,
}

/// A vmxnet3 NIC instance.
///
/// Locks are always taken in this order: `state`, `channel`, `rx`, `txq`, `staging`.
pub struct Vmxnet3Nic {
    id: InterfaceId,
    config: Vmxnet3Config,
    layout: &'static RegisterLayout,
    bar0: Arc<dyn RegisterWindow>,
    state: Mutex<DeviceState>,
    /// Whether the data paths may touch the rings. Cleared first when quiescing.
    running: AtomicBool,
    channel: Mutex<CommandChannel>,
    rx: Mutex<RxPath>,
    txq: Mutex<TransmitQueue>,
    /// Packets accepted by `transmit` that haven't made it into the ring yet.
    staging: Mutex<VecDeque<TxRequest>>,
    /// Events acknowledged in interrupt context, waiting for `event_work`.
    latched_events: AtomicU32,
    /// Set by the event interrupt, cleared by `event_work`.
    event_raised: AtomicBool,
    stack: Arc<dyn NetworkStack>,
    mac: Mutex<[u8; 6]>,
    link: Mutex<LinkStatus>,
    tx_stats: Arc<TxStats>,
    rx_stats: Arc<RxStats>,
}

impl Vmxnet3Nic {
    /// Binds to a vmxnet3 PCI function and allocates everything the device will need.
    ///
    /// # Arguments
    /// * `pci`: the PCI function, which must be a vmxnet3 device
    /// * `allocator`: source of DMA memory for rings, shared records and receive buffers
    /// * `interrupts`: where the device's three interrupt vectors get registered
    /// * `stack`: where received frames and link changes are reported
    /// * `registry`: hands out this instance's interface name
    /// * `config`: tunable parameters
    pub fn probe(
        pci: &dyn PciFunction,
        allocator: Arc<dyn DmaAllocator>,
        interrupts: &dyn InterruptController,
        stack: Arc<dyn NetworkStack>,
        registry: &InterfaceRegistry,
        config: Vmxnet3Config,
    ) -> Result<Arc<Vmxnet3Nic>, Vmxnet3Error> {
        let (vendor, device) = (pci.vendor_id(), pci.device_id());
        if (vendor, device) != (VMXNET3_VENDOR_ID, VMXNET3_DEVICE_ID) {
            return Err(Vmxnet3Error::DeviceMismatch { vendor, device });
        }
        config.validate().map_err(Vmxnet3Error::InvalidConfig)?;
        let layout = &VMXNET3_REV1;
        layout.validate().map_err(Vmxnet3Error::InvalidRegisterLayout)?;

        let bar0 = allocate_device_register_memory(pci, BAR0, layout.bar0_span()).map_err(Vmxnet3Error::BarMapping)?;
        let bar1 = allocate_device_register_memory(pci, BAR1, layout.bar1_span()).map_err(Vmxnet3Error::BarMapping)?;
        pci.enable_bus_mastering();
        // no interrupts until the device is enabled
        for vector in 0..NUM_INTRS {
            bar0.write32(layout.imask(vector), 1);
        }

        let tx_stats = Arc::new(TxStats::default());
        let rx_stats = Arc::new(RxStats::default());
        let rx_pool = ReceiveBufferPool::new(allocator.clone(), config.rx_buffer_size, config.rx_pool_size);
        init_rx_buf_pool(RX_RING_SIZE * RX_RINGS_PER_QUEUE, &rx_pool).map_err(Vmxnet3Error::Allocation)?;

        let txq = TransmitQueue::new(0, &allocator, bar0.clone(), layout.txh(0), config.kick_threshold, tx_stats.clone())
            .map_err(Vmxnet3Error::Allocation)?;
        let rxq = ReceiveQueue::new(0, &allocator, rx_pool, rx_stats.clone()).map_err(Vmxnet3Error::Allocation)?;
        let channel = CommandChannel::new(bar1, layout, &allocator).map_err(Vmxnet3Error::Allocation)?;
        let id = registry.register();

        let nic = Arc::new(Vmxnet3Nic {
            id,
            config,
            layout,
            bar0,
            state: Mutex::new(DeviceState::Probed),
            running: AtomicBool::new(false),
            channel: Mutex::new(channel),
            rx: Mutex::new(RxPath { queue: rxq, reassembly: RxReassembly::new() }),
            txq: Mutex::new(txq),
            staging: Mutex::new(VecDeque::new()),
            latched_events: AtomicU32::new(0),
            event_raised: AtomicBool::new(false),
            stack,
            mac: Mutex::new([0; 6]),
            link: Mutex::new(LinkStatus::default()),
            tx_stats,
            rx_stats,
        });

        let handlers: Arc<dyn InterruptHandlers> = nic.clone();
        let handlers = Arc::downgrade(&handlers);
        for (vector, class) in [
            (TX_VECTOR, VectorClass::Transmit(0)),
            (RX_VECTOR, VectorClass::Receive(0)),
            (EVENT_VECTOR, VectorClass::Event),
        ] {
            interrupts.register_vector(vector, class, handlers.clone()).map_err(Vmxnet3Error::Interrupt)?;
        }

        debug!("vmxnet3::probe(): {} probed", nic.id.name);
        Ok(nic)
    }

    /// Probes, handshakes, configures and enables the device in one go.
    pub fn init(
        pci: &dyn PciFunction,
        allocator: Arc<dyn DmaAllocator>,
        interrupts: &dyn InterruptController,
        stack: Arc<dyn NetworkStack>,
        registry: &InterfaceRegistry,
        config: Vmxnet3Config,
    ) -> Result<Arc<Vmxnet3Nic>, Vmxnet3Error> {
        let nic = Self::probe(pci, allocator, interrupts, stack, registry, config)?;
        nic.version_handshake()?;
        nic.configure()?;
        nic.enable()?;
        Ok(nic)
    }

    /// Agrees with the device on the protocol revision to use.
    pub fn version_handshake(&self) -> Result<(), Vmxnet3Error> {
        let state = self.state.lock();
        if !matches!(*state, DeviceState::Probed | DeviceState::Configured) {
            return Err(Vmxnet3Error::InvalidState(*state));
        }
        self.channel.lock().version_handshake()
    }

    /// Fills in the shared records and hands them to the device.
    pub fn configure(&self) -> Result<(), Vmxnet3Error> {
        let mut state = self.state.lock();
        if !matches!(*state, DeviceState::Probed | DeviceState::Configured) {
            return Err(Vmxnet3Error::InvalidState(*state));
        }
        let mut channel = self.channel.lock();
        let intr_config = channel.interrupt_config()?;
        debug!("vmxnet3::configure(): {} interrupt config {:?}", self.id.name, intr_config);
        channel.fill_driver_shared(&self.config, intr_config.automask());
        self.fill_queue_shared(&mut channel)?;
        channel.publish_shared();
        *state = DeviceState::Configured;
        Ok(())
    }

    fn fill_queue_shared(&self, channel: &mut CommandChannel) -> Result<(), Vmxnet3Error> {
        let rx = self.rx.lock();
        rx.queue.fill_shared(channel.rx_queue_shared_mut().map_err(Vmxnet3Error::Allocation)?, RX_VECTOR);
        let txq = self.txq.lock();
        txq.fill_shared(channel.tx_queue_shared_mut().map_err(Vmxnet3Error::Allocation)?, TX_VECTOR);
        Ok(())
    }

    /// Starts the device: posts receive buffers, activates it, and opens the data paths.
    pub fn enable(&self) -> Result<(), Vmxnet3Error> {
        let mut state = self.state.lock();
        if !matches!(*state, DeviceState::Configured | DeviceState::Disabled) {
            return Err(Vmxnet3Error::InvalidState(*state));
        }
        let mut channel = self.channel.lock();
        if !channel.handshake_done() {
            return Err(Vmxnet3Error::HandshakeRequired);
        }

        {
            let mut rx = self.rx.lock();
            rx.reassembly.reset();
            rx.queue.refill();
            if rx.queue.posted(RxRingId::Head) == 0 {
                error!("vmxnet3::enable(): {} couldn't post any receive buffers", self.id.name);
                return Err(Vmxnet3Error::Allocation("no receive buffers could be posted"));
            }
        }
        self.fill_queue_shared(&mut channel)?;
        channel.publish_shared();
        channel.enable()?;

        for ring in RxRingId::ALL {
            self.bar0.write32(self.layout.rxh(ring.index(), 0), 0);
        }
        channel.set_rx_mode(self.config.rx_mode);
        let mac = channel.mac_address();
        let link = channel.link_status();
        *self.mac.lock() = mac;
        *self.link.lock() = link;
        channel.set_interrupts_disabled(false);

        self.running.store(true, Ordering::Release);
        *state = DeviceState::Enabled;
        drop(channel);
        drop(state);

        for vector in 0..NUM_INTRS {
            self.set_vector_masked(vector, false);
        }
        info!("vmxnet3::enable(): {} enabled, MAC {:02X?}, link {} at {} Mbps",
            self.id.name, mac, if link.up { "up" } else { "down" }, link.speed_mbps
        );
        self.stack.mac_address_changed(mac);
        self.stack.link_status_changed(link);
        self.flush_staging();
        Ok(())
    }

    /// Closes the data paths and holds off every interrupt.
    /// Callers then take the queue locks, which waits out any drain still in progress.
    fn quiesce(&self, channel: &mut CommandChannel) {
        self.running.store(false, Ordering::Release);
        self.mask_all_vectors();
        channel.set_interrupts_disabled(true);
    }

    fn mask_all_vectors(&self) {
        for vector in 0..NUM_INTRS {
            self.set_vector_masked(vector, true);
        }
    }

    /// Stops the device. Completed transmissions are still reclaimed; everything else in the rings is dropped.
    pub fn disable(&self) -> Result<(), Vmxnet3Error> {
        let mut state = self.state.lock();
        if *state != DeviceState::Enabled {
            return Err(Vmxnet3Error::InvalidState(*state));
        }
        let mut channel = self.channel.lock();
        self.quiesce(&mut channel);
        let mut rx = self.rx.lock();
        let mut txq = self.txq.lock();
        // a drain that was running during `quiesce` may have re-armed its vector on the way out
        self.mask_all_vectors();

        channel.disable();
        let sent = txq.reclaim();
        let dropped = txq.reset();
        rx.queue.reset();
        rx.reassembly.reset();
        channel.reset();

        *state = DeviceState::Disabled;
        debug!("vmxnet3::disable(): {} disabled, {} packets completed, {} dropped", self.id.name, sent, dropped);
        Ok(())
    }

    /// Resets the device and returns every ring to its initial state, ready to be enabled again.
    /// Packets waiting in the staging queue are kept.
    pub fn reset(&self) -> Result<(), Vmxnet3Error> {
        let mut state = self.state.lock();
        if *state != DeviceState::Enabled {
            return Err(Vmxnet3Error::InvalidState(*state));
        }
        let mut channel = self.channel.lock();
        self.quiesce(&mut channel);
        let mut rx = self.rx.lock();
        let mut txq = self.txq.lock();
        // a drain that was running during `quiesce` may have re-armed its vector on the way out
        self.mask_all_vectors();

        channel.reset();
        let sent = txq.reclaim();
        let dropped = txq.reset();
        rx.queue.reset();
        rx.reassembly.reset();

        *state = DeviceState::Configured;
        debug!("vmxnet3::reset(): {} reset, {} packets completed, {} dropped", self.id.name, sent, dropped);
        Ok(())
    }

    /// Queues a packet for transmission and pushes as much of the queue into the ring as fits.
    ///
    /// Never waits for the hardware. Whenever the packet isn't accepted, it is handed back in the error.
    pub fn transmit(&self, packet: TxPacket) -> Result<(), TransmitError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransmitError::NotRunning(packet));
        }
        let req = match TxRequest::prepare(packet) {
            Ok(req) => req,
            Err((packet, reason)) => {
                warn!("vmxnet3::transmit(): {} rejected a {}-byte packet: {}", self.id.name, packet.len(), reason);
                self.tx_stats.errors.inc();
                return Err(TransmitError::Invalid { packet, reason });
            }
        };
        {
            let mut staging = self.staging.lock();
            if staging.len() >= self.config.staging_capacity {
                return Err(TransmitError::Busy(req.into_packet()));
            }
            staging.push_back(req);
        }
        self.drain_staging();
        Ok(())
    }

    /// Moves staged packets into the transmit ring and rings the doorbell for everything posted.
    ///
    /// Returns the number of packets moved into the ring.
    pub fn flush_staging(&self) -> usize {
        self.drain_staging()
    }

    /// Moves staged packets into the transmit ring until it fills up or nothing is left,
    /// then rings the doorbell for whatever the kick threshold left unannounced.
    ///
    /// Never spins on a lock: if another context holds the transmit ring or the staging queue,
    /// that context drains instead.
    fn drain_staging(&self) -> usize {
        let mut posted = 0;
        loop {
            let Some(mut txq) = self.txq.try_lock() else { return posted };
            if !self.running.load(Ordering::Acquire) {
                return posted;
            }
            let mut ring_full = false;
            loop {
                let Some(mut staging) = self.staging.try_lock() else { break };
                let Some(req) = staging.pop_front() else { break };
                if let Err(req) = txq.encap(req) {
                    staging.push_front(req);
                    drop(staging);
                    if txq.reclaim() == 0 {
                        ring_full = true;
                        break;
                    }
                    continue;
                }
                posted += 1;
            }
            txq.kick_pending();
            drop(txq);

            // a packet may have been staged after this pass emptied the queue, but before the ring lock was released
            if ring_full {
                return posted;
            }
            match self.staging.try_lock() {
                Some(staging) if !staging.is_empty() => { }
                _ => return posted,
            }
        }
    }

    /// Drains received frames to the network stack. This is the only receive path:
    /// if another context is already draining, this returns 0 right away.
    ///
    /// The receive vector stays masked until a pass finds no completion left,
    /// including any that land just as it is unmasked.
    ///
    /// Returns the number of completions processed.
    pub fn receive_work(&self) -> usize {
        let Some(mut rx) = self.rx.try_lock() else { return 0 };
        let RxPath { queue, reassembly } = &mut *rx;
        let mut processed = 0;
        while self.running.load(Ordering::Acquire) {
            self.set_vector_masked(RX_VECTOR, true);
            loop {
                processed += queue.drain_completions(reassembly, self.stack.as_ref(), self.config.rx_budget);
                if !queue.ring_has_capacity() {
                    queue.refill();
                }
                if !queue.completion_pending() {
                    break;
                }
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.set_vector_masked(RX_VECTOR, false);
            if !queue.completion_pending() {
                break;
            }
        }
        processed
    }

    /// Acts on the events the device has raised since the last call.
    ///
    /// The event interrupt only acknowledges events; link queries and queue-error recovery
    /// issue commands and take every lock, so they run here, in thread context.
    /// `poll_receive` calls this on every poll.
    ///
    /// Returns the events handled.
    pub fn event_work(&self) -> Events {
        if !self.event_raised.swap(false, Ordering::AcqRel) {
            return Events::empty();
        }
        let latched = Events::from_bits_truncate(self.latched_events.swap(0, Ordering::AcqRel));
        let events = latched | self.channel.lock().take_events();
        if events.is_empty() {
            return events;
        }

        if events.contains(Events::LINK) {
            let link = self.channel.lock().link_status();
            *self.link.lock() = link;
            info!("vmxnet3::event_work(): {} link is {} at {} Mbps", self.id.name, if link.up { "up" } else { "down" }, link.speed_mbps);
            self.stack.link_status_changed(link);
        }

        if events.intersects(Events::TQERROR | Events::RQERROR) {
            match self.channel.lock().queue_status() {
                Ok((tx, rx)) => error!("vmxnet3::event_work(): {} queue error, txq stopped: {} error: {:#X}, rxq stopped: {} error: {:#X}",
                    self.id.name, tx.stopped, tx.error, rx.stopped, rx.error
                ),
                Err(e) => error!("vmxnet3::event_work(): {} queue error, couldn't read queue status: {}", self.id.name, e),
            }
            if let Err(e) = self.reset().and_then(|_| self.enable()) {
                error!("vmxnet3::event_work(): {} couldn't recover from a queue error: {}", self.id.name, e);
            }
        }

        if events.contains(Events::DIC) {
            debug!("vmxnet3::event_work(): {} device implementation changed", self.id.name);
        }
        if events.contains(Events::DEBUG) {
            debug!("vmxnet3::event_work(): {} debug event", self.id.name);
        }
        events
    }

    fn set_vector_masked(&self, vector: u8, masked: bool) {
        self.bar0.write32(self.layout.imask(vector), masked as u32);
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    pub fn config(&self) -> &Vmxnet3Config {
        &self.config
    }

    /// The number of packets accepted by `transmit` but not yet posted to the ring.
    pub fn staged(&self) -> usize {
        self.staging.lock().len()
    }

    /// A snapshot of this driver's traffic counters.
    pub fn stats(&self) -> NicStatistics {
        let mut out = NicStatistics::default();
        stats::fill_stats(&self.tx_stats, &self.rx_stats, &mut out);
        out
    }

    /// The counters the device itself keeps for each queue.
    pub fn device_queue_stats(&self) -> Result<(UptTxStats, UptRxStats), Vmxnet3Error> {
        self.channel.lock().device_stats().map_err(Vmxnet3Error::Allocation)
    }

    pub fn set_rx_mode(&self, mode: RxMode) {
        self.channel.lock().set_rx_mode(mode);
    }

    /// Replaces the set of multicast addresses the device accepts.
    pub fn set_multicast_filter(&self, addrs: &[[u8; 6]]) -> Result<(), Vmxnet3Error> {
        self.channel.lock().set_multicast_filter(addrs)
    }
}

impl InterruptHandlers for Vmxnet3Nic {
    fn on_transmit_interrupt(&self, _queue: u8) {
        if let Some(mut txq) = self.txq.try_lock() {
            txq.reclaim();
        }
        self.flush_staging();
        if self.running.load(Ordering::Acquire) {
            self.set_vector_masked(TX_VECTOR, false);
        }
    }

    fn on_receive_interrupt(&self, _queue: u8) {
        self.receive_work();
    }

    fn on_event_interrupt(&self) {
        // the channel may be held by the context this interrupt preempted
        if let Some(channel) = self.channel.try_lock() {
            self.latched_events.fetch_or(channel.take_events().bits(), Ordering::AcqRel);
        }
        self.event_raised.store(true, Ordering::Release);
        if self.running.load(Ordering::Acquire) {
            self.set_vector_masked(EVENT_VECTOR, false);
        }
    }
}

impl NetworkInterfaceCard for Vmxnet3Nic {
    type SendError = TransmitError;

    fn send_packet(&self, packet: TxPacket) -> Result<(), TransmitError> {
        self.transmit(packet)
    }

    fn poll_receive(&self) -> Result<(), &'static str> {
        self.event_work();
        self.receive_work();
        self.flush_staging();
        Ok(())
    }

    fn mac_address(&self) -> [u8; 6] {
        *self.mac.lock()
    }

    fn link_status(&self) -> LinkStatus {
        *self.link.lock()
    }

    fn statistics(&self) -> NicStatistics {
        self.stats()
    }
}
