//! A software model of a vmxnet3 device, and tests that drive a [`Vmxnet3Nic`] against it.
//!
//! The model is built on [`HeapDmaAllocator`], whose physical addresses equal heap addresses,
//! so it reads and writes the rings and shared records directly through the addresses the driver publishes.
//! Like the real device, it only looks at transmit descriptors the doorbell has covered.

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};
use core::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use alloc::sync::Arc;
use bit_field::BitField;
use network_interface_card::{FrameQueue, InterfaceRegistry, LinkStatus, NetworkInterfaceCard};
use nic_buffers::{ChecksumStatus, DmaAllocator, HeapDmaAllocator, TransmitBuffer, TxOffload, TxPacket};
use nic_initialization::{dispatch_interrupt, InterruptController, InterruptHandlers, PciFunction, RegisterWindow, VectorClass};
use crate::config::Vmxnet3Config;
use crate::descriptors::{RxCompDesc, RxDesc, TxCompDesc, TxDesc, TxDescFields};
use crate::regs::*;
use crate::rxq::RxRingId;
use crate::shared::{DriverShared, RxQueueShared, TxQueueShared, RX_QUEUE_SHARED_OFFSET, TX_QUEUE_SHARED_OFFSET};
use crate::{DeviceState, TransmitError, Vmxnet3Error, Vmxnet3Nic};

const BAR_SIZE: usize = 0x1000;

/// Completion word 3 for an IPv4/TCP frame whose checksums the device verified.
pub const TCP4_CSUM_OK: u32 = (1 << 16) | (1 << 18) | (1 << 19) | (1 << 21);
/// Completion word 3 for an IPv4/TCP frame with a bad TCP checksum.
pub const TCP4_CSUM_BAD: u32 = (1 << 18) | (1 << 19) | (1 << 21);

/// How the model describes a received frame in its completions.
#[derive(Clone, Copy, Default)]
pub struct RxMeta {
    /// Checksum bits of word 3, reported with the last buffer.
    pub csum_bits: u32,
    pub error: bool,
    pub vlan: Option<u16>,
    pub rss_hash: u32,
}

/// One packet the model took off the transmit ring.
#[derive(Default)]
pub struct SentPacket {
    pub bytes: Vec<u8>,
    pub descs: Vec<TxDescFields>,
}

/// A register write the driver made, as (BAR, offset, value).
pub type RegWrite = (u8, usize, u32);

struct SimState {
    supported_revisions: u32,
    supported_upt: u32,
    selected_revision: Option<u32>,
    selected_upt: Option<u32>,
    dsl: u32,
    dsh: u32,
    last_cmd: u32,
    enable_status: u32,
    mac: [u8; 6],
    link: u32,
    intr_config: u32,
    commands: Vec<u32>,
    writes: Vec<RegWrite>,
    acked_events: Vec<u32>,
    imask: [u32; NUM_INTRS as usize],
    txh: usize,
    /// Whether the doorbell was rung since the device last caught up with it.
    kicked: bool,
    queue_error: u32,
    tx_completed: u64,

    // the device's own cursors
    tx_next: usize,
    tx_gen: bool,
    txc_next: usize,
    txc_gen: bool,
    rx_next: [usize; RX_RINGS_PER_QUEUE],
    rx_gen: [bool; RX_RINGS_PER_QUEUE],
    rxc_next: usize,
    rxc_gen: bool,
}

impl SimState {
    fn reset_cursors(&mut self) {
        self.txh = 0;
        self.kicked = false;
        self.tx_next = 0;
        self.tx_gen = true;
        self.txc_next = 0;
        self.txc_gen = true;
        self.rx_next = [0; RX_RINGS_PER_QUEUE];
        self.rx_gen = [true; RX_RINGS_PER_QUEUE];
        self.rxc_next = 0;
        self.rxc_gen = true;
    }

    fn driver_shared(&self) -> *mut DriverShared {
        ((u64::from(self.dsh) << 32) | u64::from(self.dsl)) as usize as *mut DriverShared
    }

    fn queues_shared(&self) -> usize {
        let ds = self.driver_shared();
        assert!(!ds.is_null(), "the driver-shared record was never published");
        unsafe { read_volatile(addr_of!((*ds).queue_shared)) as usize }
    }

    fn tx_shared(&self) -> *mut TxQueueShared {
        (self.queues_shared() + TX_QUEUE_SHARED_OFFSET) as *mut TxQueueShared
    }

    fn rx_shared(&self) -> *mut RxQueueShared {
        (self.queues_shared() + RX_QUEUE_SHARED_OFFSET) as *mut RxQueueShared
    }

    fn run_command(&mut self, cmd: u32) {
        self.last_cmd = cmd;
        self.commands.push(cmd);
        match Command::try_from(cmd) {
            Ok(Command::Enable) if self.enable_status == 0 => self.reset_cursors(),
            Ok(Command::Reset) => self.reset_cursors(),
            Ok(Command::GetStatus) if self.queue_error != 0 => {
                let ts = self.tx_shared();
                unsafe {
                    write_volatile(addr_of_mut!((*ts).stopped), 1);
                    write_volatile(addr_of_mut!((*ts).error), self.queue_error);
                }
            }
            Ok(Command::GetStats) => {
                let ts = self.tx_shared();
                unsafe { write_volatile(addr_of_mut!((*ts).stats.ucast_packets), self.tx_completed) };
            }
            _ => {}
        }
    }

    fn command_result(&self) -> u32 {
        match Command::try_from(self.last_cmd) {
            Ok(Command::Enable) => self.enable_status,
            Ok(Command::GetMacLow) => u32::from_le_bytes([self.mac[0], self.mac[1], self.mac[2], self.mac[3]]),
            Ok(Command::GetMacHigh) => u32::from_le_bytes([self.mac[4], self.mac[5], 0, 0]),
            Ok(Command::GetLink) => self.link,
            Ok(Command::GetIntrConfig) => self.intr_config,
            _ => 0,
        }
    }
}

/// The model of one vmxnet3 device.
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    pub fn new() -> Arc<SimDevice> {
        let state = SimState {
            supported_revisions: 0b1,
            supported_upt: 0b1,
            selected_revision: None,
            selected_upt: None,
            dsl: 0,
            dsh: 0,
            last_cmd: 0,
            enable_status: 0,
            mac: [0x00, 0x50, 0x56, 0x01, 0x02, 0x03],
            link: 1 | (10000 << 16),
            intr_config: 0x3,
            commands: Vec::new(),
            writes: Vec::new(),
            acked_events: Vec::new(),
            imask: [0; NUM_INTRS as usize],
            txh: 0,
            kicked: false,
            queue_error: 0,
            tx_completed: 0,
            tx_next: 0,
            tx_gen: true,
            txc_next: 0,
            txc_gen: true,
            rx_next: [0; RX_RINGS_PER_QUEUE],
            rx_gen: [true; RX_RINGS_PER_QUEUE],
            rxc_next: 0,
            rxc_gen: true,
        };
        Arc::new(SimDevice { state: Mutex::new(state) })
    }

    /// The register window of the given BAR.
    pub fn window(self: &Arc<Self>, bar: u8) -> Arc<dyn RegisterWindow> {
        Arc::new(SimWindow { bar, dev: Arc::clone(self) })
    }

    pub fn set_supported_versions(&self, revisions: u32, upt_versions: u32) {
        let mut st = self.state.lock().unwrap();
        st.supported_revisions = revisions;
        st.supported_upt = upt_versions;
    }

    /// The revision and UPT version the driver wrote back, if any.
    pub fn selected_versions(&self) -> (Option<u32>, Option<u32>) {
        let st = self.state.lock().unwrap();
        (st.selected_revision, st.selected_upt)
    }

    /// Makes `ENABLE` report the given status; anything but 0 is a refusal.
    pub fn set_enable_status(&self, status: u32) {
        self.state.lock().unwrap().enable_status = status;
    }

    pub fn set_mac(&self, mac: [u8; 6]) {
        self.state.lock().unwrap().mac = mac;
    }

    pub fn set_link(&self, up: bool, speed_mbps: u32) {
        self.state.lock().unwrap().link = u32::from(up) | (speed_mbps << 16);
    }

    pub fn set_interrupt_config(&self, word: u32) {
        self.state.lock().unwrap().intr_config = word;
    }

    /// Makes the next `GET_STATUS` report the transmit queue as stopped with this error code.
    pub fn set_queue_error(&self, error: u32) {
        self.state.lock().unwrap().queue_error = error;
    }

    /// A position in the log of register writes, for [`SimDevice::writes_since`].
    pub fn mark(&self) -> usize {
        self.state.lock().unwrap().writes.len()
    }

    pub fn writes_since(&self, mark: usize) -> Vec<RegWrite> {
        self.state.lock().unwrap().writes[mark..].to_vec()
    }

    /// Every command written to `CMD`, in order.
    pub fn commands(&self) -> Vec<u32> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count_commands(&self, cmd: Command) -> usize {
        let cmd = u32::from(cmd);
        self.state.lock().unwrap().commands.iter().filter(|c| **c == cmd).count()
    }

    /// The address last written through `DSL` and `DSH`.
    pub fn driver_shared_addr(&self) -> u64 {
        let st = self.state.lock().unwrap();
        (u64::from(st.dsh) << 32) | u64::from(st.dsl)
    }

    pub fn imask(&self, vector: u8) -> u32 {
        self.state.lock().unwrap().imask[usize::from(vector)]
    }

    /// The last value written to the transmit doorbell.
    pub fn txh(&self) -> usize {
        self.state.lock().unwrap().txh
    }

    /// Sets event bits in the driver-shared record.
    pub fn raise_events(&self, events: Events) {
        let st = self.state.lock().unwrap();
        let ds = st.driver_shared();
        assert!(!ds.is_null(), "the driver-shared record was never published");
        unsafe {
            let event = addr_of_mut!((*ds).event);
            write_volatile(event, read_volatile(event) | events.bits());
        }
    }

    /// Every value written to `ECR`, in order.
    pub fn acknowledged_events(&self) -> Vec<u32> {
        self.state.lock().unwrap().acked_events.clone()
    }

    /// Consumes every transmit descriptor up to the doorbell and completes each finished packet.
    pub fn transmit_pending(&self) -> Vec<SentPacket> {
        let mut st = self.state.lock().unwrap();
        let ts = st.tx_shared();
        let (cmd_ring, comp_ring, ring_len, comp_len) = unsafe {
            (
                read_volatile(addr_of!((*ts).cmd_ring)) as usize as *const TxDesc,
                read_volatile(addr_of!((*ts).comp_ring)) as usize as *mut TxCompDesc,
                read_volatile(addr_of!((*ts).cmd_ring_len)) as usize,
                read_volatile(addr_of!((*ts).comp_ring_len)) as usize,
            )
        };

        // a doorbell equal to the device's cursor means either nothing or a whole ring
        let mut budget = (st.txh + ring_len - st.tx_next) % ring_len;
        if budget == 0 && st.kicked {
            budget = ring_len;
        }
        st.kicked = false;

        let mut sent = Vec::new();
        let mut current = SentPacket::default();
        for _ in 0..budget {
            let idx = st.tx_next;
            let fields = unsafe { (*cmd_ring.add(idx)).read() };
            if fields.gen != st.tx_gen {
                break;
            }
            fence(Ordering::Acquire);
            let len = if fields.len == 0 { TX_MAX_SEGMENT_SIZE } else { fields.len as usize };
            let bytes = unsafe { std::slice::from_raw_parts(fields.addr as usize as *const u8, len) };
            current.bytes.extend_from_slice(bytes);
            current.descs.push(fields);

            st.tx_next += 1;
            if st.tx_next == ring_len {
                st.tx_next = 0;
                st.tx_gen = !st.tx_gen;
            }
            if fields.eop {
                let comp = unsafe { &mut *comp_ring.add(st.txc_next) };
                let mut w3 = 0u32;
                w3.set_bit(31, st.txc_gen);
                unsafe {
                    write_volatile(&mut comp.word0, idx as u32);
                    fence(Ordering::Release);
                    write_volatile(&mut comp.word3, w3);
                }
                st.txc_next += 1;
                if st.txc_next == comp_len {
                    st.txc_next = 0;
                    st.txc_gen = !st.txc_gen;
                }
                st.tx_completed += 1;
                sent.push(core::mem::take(&mut current));
            }
        }
        sent
    }

    /// Writes a frame into posted receive buffers, one fragment per buffer, and completes it.
    ///
    /// Returns `false`, having written nothing, if not enough buffers are posted.
    pub fn receive(&self, frags: &[&[u8]], meta: RxMeta) -> bool {
        let mut st = self.state.lock().unwrap();
        let rs = st.rx_shared();
        let (cmd_rings, comp_ring, ring_lens, comp_len) = unsafe {
            let rings = read_volatile(addr_of!((*rs).cmd_ring));
            let lens = read_volatile(addr_of!((*rs).cmd_ring_len));
            (
                [rings[0] as usize as *const RxDesc, rings[1] as usize as *const RxDesc],
                read_volatile(addr_of!((*rs).comp_ring)) as usize as *mut RxCompDesc,
                [lens[0] as usize, lens[1] as usize],
                read_volatile(addr_of!((*rs).comp_ring_len)) as usize,
            )
        };

        // pick the slots first, so nothing is written unless the whole frame fits
        let mut next = st.rx_next;
        let mut gen = st.rx_gen;
        let mut slots = Vec::new();
        for (i, frag) in frags.iter().enumerate() {
            let ring = if i == 0 { 0 } else { 1 };
            let idx = next[ring];
            let desc = unsafe { &*cmd_rings[ring].add(idx) };
            if desc.gen() != gen[ring] || frag.len() > usize::from(desc.len()) {
                return false;
            }
            slots.push((ring, idx, desc.buffer_addr()));
            next[ring] += 1;
            if next[ring] == ring_lens[ring] {
                next[ring] = 0;
                gen[ring] = !gen[ring];
            }
        }
        st.rx_next = next;
        st.rx_gen = gen;

        for (i, (frag, (ring, idx, addr))) in frags.iter().zip(slots).enumerate() {
            let eop = i + 1 == frags.len();
            unsafe { core::ptr::copy_nonoverlapping(frag.as_ptr(), addr as usize as *mut u8, frag.len()) };

            let mut w0 = 0u32;
            w0.set_bits(0..12, idx as u32);
            w0.set_bit(14, eop);
            w0.set_bit(15, i == 0);
            w0.set_bits(16..26, (ring * NUM_RX_QUEUES) as u32);
            let mut w2 = 0u32;
            w2.set_bits(0..14, frag.len() as u32);
            w2.set_bit(14, eop && meta.error);
            if let (true, Some(tci)) = (eop, meta.vlan) {
                w2.set_bit(15, true);
                w2.set_bits(16..32, u32::from(tci));
            }
            let mut w3 = if eop { meta.csum_bits } else { 0 };
            w3.set_bit(31, st.rxc_gen);

            let comp = unsafe { &mut *comp_ring.add(st.rxc_next) };
            unsafe {
                write_volatile(&mut comp.word0, w0);
                write_volatile(&mut comp.word1, meta.rss_hash);
                write_volatile(&mut comp.word2, w2);
                fence(Ordering::Release);
                write_volatile(&mut comp.word3, w3);
            }
            st.rxc_next += 1;
            if st.rxc_next == comp_len {
                st.rxc_next = 0;
                st.rxc_gen = !st.rxc_gen;
            }
        }
        true
    }
}

struct SimWindow {
    bar: u8,
    dev: Arc<SimDevice>,
}

impl RegisterWindow for SimWindow {
    fn read32(&self, offset: usize) -> u32 {
        let st = self.dev.state.lock().unwrap();
        let layout = &VMXNET3_REV1;
        match self.bar {
            BAR0 => (0..NUM_INTRS)
                .find(|v| layout.imask(*v) == offset)
                .map(|v| st.imask[usize::from(v)])
                .unwrap_or(0),
            _ if offset == layout.vrrs => st.supported_revisions,
            _ if offset == layout.uvrs => st.supported_upt,
            _ if offset == layout.cmd => st.command_result(),
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut st = self.dev.state.lock().unwrap();
        st.writes.push((self.bar, offset, value));
        let layout = &VMXNET3_REV1;
        if self.bar == BAR0 {
            if let Some(v) = (0..NUM_INTRS).find(|v| layout.imask(*v) == offset) {
                st.imask[usize::from(v)] = value;
            } else if offset == layout.txh(0) {
                st.txh = value as usize;
                st.kicked = true;
            }
            return;
        }
        match offset {
            o if o == layout.vrrs => st.selected_revision = Some(value),
            o if o == layout.uvrs => st.selected_upt = Some(value),
            o if o == layout.dsl => st.dsl = value,
            o if o == layout.dsh => st.dsh = value,
            o if o == layout.cmd => st.run_command(value),
            o if o == layout.ecr => {
                st.acked_events.push(value);
                let ds = st.driver_shared();
                if !ds.is_null() {
                    unsafe {
                        let event = addr_of_mut!((*ds).event);
                        write_volatile(event, read_volatile(event) & !value);
                    }
                }
            }
            _ => {}
        }
    }

    fn size_in_bytes(&self) -> usize {
        BAR_SIZE
    }
}

struct SimPci {
    dev: Arc<SimDevice>,
    vendor: u16,
    device: u16,
    bus_master: AtomicBool,
}

impl SimPci {
    fn new(dev: &Arc<SimDevice>) -> SimPci {
        SimPci { dev: Arc::clone(dev), vendor: VMXNET3_VENDOR_ID, device: VMXNET3_DEVICE_ID, bus_master: AtomicBool::new(false) }
    }
}

impl PciFunction for SimPci {
    fn vendor_id(&self) -> u16 { self.vendor }
    fn device_id(&self) -> u16 { self.device }
    fn map_bar(&self, bar: u8) -> Result<Arc<dyn RegisterWindow>, &'static str> {
        Ok(self.dev.window(bar))
    }
    fn enable_bus_mastering(&self) {
        self.bus_master.store(true, Ordering::SeqCst);
    }
}

/// Remembers registered vectors and lets a test fire them.
#[derive(Default)]
struct RecordingInterruptController {
    vectors: Mutex<Vec<(u8, VectorClass, Weak<dyn InterruptHandlers>)>>,
}

impl InterruptController for RecordingInterruptController {
    fn register_vector(&self, vector: u8, class: VectorClass, handlers: Weak<dyn InterruptHandlers>) -> Result<(), &'static str> {
        self.vectors.lock().unwrap().push((vector, class, handlers));
        Ok(())
    }
}

impl RecordingInterruptController {
    fn fire(&self, vector: u8) -> bool {
        let registered = self.vectors.lock().unwrap()
            .iter()
            .find(|(v, ..)| *v == vector)
            .map(|(_, class, handlers)| (*class, handlers.clone()));
        match registered {
            Some((class, handlers)) => dispatch_interrupt(class, &handlers),
            None => false,
        }
    }

    fn classes(&self) -> Vec<(u8, VectorClass)> {
        self.vectors.lock().unwrap().iter().map(|(v, c, _)| (*v, *c)).collect()
    }
}


struct Harness {
    dev: Arc<SimDevice>,
    nic: Arc<Vmxnet3Nic>,
    stack: Arc<FrameQueue>,
    irq: RecordingInterruptController,
    allocator: Arc<dyn DmaAllocator>,
}

impl Harness {
    fn probe(config: Vmxnet3Config) -> Harness {
        let dev = SimDevice::new();
        let allocator: Arc<dyn DmaAllocator> = Arc::new(HeapDmaAllocator::new());
        let stack = Arc::new(FrameQueue::new());
        let irq = RecordingInterruptController::default();
        let registry = InterfaceRegistry::new("vmx");
        let nic = Vmxnet3Nic::probe(&SimPci::new(&dev), allocator.clone(), &irq, stack.clone(), &registry, config).unwrap();
        Harness { dev, nic, stack, irq, allocator }
    }

    fn enabled(config: Vmxnet3Config) -> Harness {
        let h = Harness::probe(config);
        h.nic.version_handshake().unwrap();
        h.nic.configure().unwrap();
        h.nic.enable().unwrap();
        h
    }

    fn packet(&self, data: &[u8]) -> TxPacket {
        TxPacket::single(TransmitBuffer::from_slice(&self.allocator, data).unwrap())
    }

    fn fragmented_packet(&self, sizes: &[usize]) -> TxPacket {
        let frags = sizes.iter().enumerate()
            .map(|(i, len)| TransmitBuffer::from_slice(&self.allocator, &vec![i as u8; *len]).unwrap())
            .collect();
        TxPacket::new(frags)
    }
}

fn per_packet_kicks() -> Vmxnet3Config {
    Vmxnet3Config { kick_threshold: 1, ..Default::default() }
}


#[test]
fn test_probe_rejects_other_devices() {
    let dev = SimDevice::new();
    let pci = SimPci { vendor: 0x8086, device: 0x100E, ..SimPci::new(&dev) };
    let allocator: Arc<dyn DmaAllocator> = Arc::new(HeapDmaAllocator::new());
    let irq = RecordingInterruptController::default();
    let registry = InterfaceRegistry::new("vmx");
    let result = Vmxnet3Nic::probe(&pci, allocator, &irq, Arc::new(FrameQueue::new()), &registry, Vmxnet3Config::default());
    assert!(matches!(result, Err(Vmxnet3Error::DeviceMismatch { vendor: 0x8086, device: 0x100E })));
    assert!(irq.classes().is_empty());
    assert!(registry.registered().is_empty());
}

#[test]
fn test_probe_rejects_bad_config() {
    let dev = SimDevice::new();
    let allocator: Arc<dyn DmaAllocator> = Arc::new(HeapDmaAllocator::new());
    let config = Vmxnet3Config { kick_threshold: 0, ..Default::default() };
    let result = Vmxnet3Nic::probe(
        &SimPci::new(&dev), allocator, &RecordingInterruptController::default(),
        Arc::new(FrameQueue::new()), &InterfaceRegistry::new("vmx"), config,
    );
    assert!(matches!(result, Err(Vmxnet3Error::InvalidConfig(_))));
}

#[test]
fn test_probe_masks_and_registers_vectors() {
    let h = Harness::probe(Vmxnet3Config::default());
    assert_eq!(h.nic.state(), DeviceState::Probed);
    assert_eq!(h.nic.name(), "vmx0");
    assert_eq!(h.irq.classes(), vec![
        (TX_VECTOR, VectorClass::Transmit(0)),
        (RX_VECTOR, VectorClass::Receive(0)),
        (EVENT_VECTOR, VectorClass::Event),
    ]);
    for vector in 0..NUM_INTRS {
        assert_eq!(h.dev.imask(vector), 1);
    }
    assert!(h.dev.commands().is_empty(), "probing must not issue commands");
}

#[test]
fn test_enable_before_handshake_is_refused() {
    let h = Harness::probe(Vmxnet3Config::default());
    h.nic.configure().unwrap();
    let mark = h.dev.mark();
    assert!(matches!(h.nic.enable(), Err(Vmxnet3Error::HandshakeRequired)));
    assert!(h.dev.writes_since(mark).is_empty(), "no register may be touched");
    assert_eq!(h.nic.state(), DeviceState::Configured);
    assert!(matches!(h.nic.transmit(h.packet(&[1; 60])), Err(TransmitError::NotRunning(_))));

    h.nic.version_handshake().unwrap();
    h.nic.enable().unwrap();
    assert_eq!(h.nic.state(), DeviceState::Enabled);
}

#[test]
fn test_enable_from_wrong_state_is_refused() {
    let h = Harness::probe(Vmxnet3Config::default());
    h.nic.version_handshake().unwrap();
    assert!(matches!(h.nic.enable(), Err(Vmxnet3Error::InvalidState(DeviceState::Probed))));
    assert!(matches!(h.nic.disable(), Err(Vmxnet3Error::InvalidState(DeviceState::Probed))));
    assert!(matches!(h.nic.reset(), Err(Vmxnet3Error::InvalidState(DeviceState::Probed))));
}

#[test]
fn test_refused_enable_leaves_device_configured() {
    let h = Harness::probe(Vmxnet3Config::default());
    h.nic.version_handshake().unwrap();
    h.nic.configure().unwrap();
    h.dev.set_enable_status(0x1);
    assert!(matches!(h.nic.enable(), Err(Vmxnet3Error::CommandFailed { command: Command::Enable, status: 1 })));
    assert_eq!(h.nic.state(), DeviceState::Configured);
    assert_eq!(h.dev.imask(RX_VECTOR), 1);
}

#[test]
fn test_invalid_interrupt_config_fails_configure() {
    let h = Harness::probe(Vmxnet3Config::default());
    h.nic.version_handshake().unwrap();
    h.dev.set_interrupt_config(0xF);
    assert!(matches!(
        h.nic.configure(),
        Err(Vmxnet3Error::CommandFailed { command: Command::GetIntrConfig, status: 0xF })
    ));
    assert_eq!(h.nic.state(), DeviceState::Probed);
    assert_eq!(h.dev.driver_shared_addr(), 0, "nothing was published");
}

#[test]
fn test_enable_brings_up_device() {
    let h = Harness::enabled(Vmxnet3Config::default());
    assert_eq!(h.dev.selected_versions(), (Some(1), Some(1)));
    assert_eq!(h.dev.driver_shared_addr(), h.nic.channel.lock().driver_shared_phys().value());
    assert_eq!(h.dev.count_commands(Command::Enable), 1);
    assert_eq!(h.dev.commands().last(), Some(&u32::from(Command::GetLink)));
    for vector in 0..NUM_INTRS {
        assert_eq!(h.dev.imask(vector), 0, "vector {} left masked", vector);
    }

    {
        let rx = h.nic.rx.lock();
        assert_eq!(rx.queue.posted(RxRingId::Head), RX_RING_SIZE);
        assert_eq!(rx.queue.posted(RxRingId::Body), RX_RING_SIZE);
    }
    let ch = h.nic.channel.lock();
    let ds: &DriverShared = ch.driver_shared();
    assert_eq!(ds.rxmode, h.nic.config().rx_mode.bits());
    assert_eq!(ds.ictrl & crate::shared::ICTRL_DISABLE_ALL, 0);
    drop(ch);

    assert_eq!(h.stack.mac_address(), Some([0x00, 0x50, 0x56, 0x01, 0x02, 0x03]));
    assert_eq!(h.stack.link_status(), LinkStatus { up: true, speed_mbps: 10000 });
    assert_eq!(h.nic.mac_address(), [0x00, 0x50, 0x56, 0x01, 0x02, 0x03]);
}

#[test]
fn test_init_runs_whole_bring_up() {
    let dev = SimDevice::new();
    let allocator: Arc<dyn DmaAllocator> = Arc::new(HeapDmaAllocator::new());
    let irq = RecordingInterruptController::default();
    let registry = InterfaceRegistry::new("vmx");
    registry.register();
    let nic = Vmxnet3Nic::init(
        &SimPci::new(&dev), allocator, &irq, Arc::new(FrameQueue::new()), &registry, Vmxnet3Config::default(),
    ).unwrap();
    assert_eq!(nic.state(), DeviceState::Enabled);
    assert_eq!(nic.name(), "vmx1");
}

#[test]
fn test_transmit_and_complete() {
    let h = Harness::enabled(per_packet_kicks());
    let data: Vec<u8> = (0..200u8).collect();
    h.nic.transmit(h.packet(&data)).unwrap();
    assert_eq!(h.dev.txh(), 1);

    let sent = h.dev.transmit_pending();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bytes, data);
    assert!(sent[0].descs[0].eop && sent[0].descs[0].compreq);
    assert_eq!(h.nic.txq.lock().in_flight(), 1);

    assert!(h.irq.fire(TX_VECTOR));
    assert_eq!(h.nic.txq.lock().in_flight(), 0);
    let stats = h.nic.stats();
    assert_eq!((stats.tx_packets, stats.tx_bytes), (1, 200));

    let (device_tx, _) = h.nic.device_queue_stats().unwrap();
    assert_eq!(device_tx.ucast_packets, 1);
}

#[test]
fn test_transmit_splits_oversized_fragments() {
    let h = Harness::enabled(per_packet_kicks());
    let packet = h.fragmented_packet(&[100, 20000, 16384]);
    h.nic.transmit(packet).unwrap();

    let sent = h.dev.transmit_pending();
    assert_eq!(sent.len(), 1);
    let lens: Vec<u32> = sent[0].descs.iter().map(|d| d.len).collect();
    // a full 16 KiB span is encoded as 0
    assert_eq!(lens, vec![100, 0, 20000 - 16384, 0]);
    assert_eq!(sent[0].bytes.len(), 100 + 20000 + 16384);
    assert_eq!(sent[0].bytes[100], 1);
    assert_eq!(sent[0].bytes[100 + 20000], 2);
    let eops: Vec<bool> = sent[0].descs.iter().map(|d| d.eop).collect();
    assert_eq!(eops, vec![false, false, false, true]);
}

#[test]
fn test_transmit_offload_fields() {
    let h = Harness::enabled(per_packet_kicks());
    let packet = h.packet(&[0; 1514])
        .with_offload(TxOffload::TcpChecksum { l4_offset: 34 })
        .with_vlan_tag(0x0064);
    h.nic.transmit(packet).unwrap();
    let sent = h.dev.transmit_pending();
    let sop = sent[0].descs[0];
    assert_eq!((sop.offload_mode, sop.hlen, sop.offload_pos), (2, 34, 34 + 16));
    assert_eq!(sop.vtag, Some(0x0064));
    assert_eq!(h.nic.stats().tx_csum, 1);
}

#[test]
fn test_lone_packet_is_kicked() {
    let h = Harness::enabled(Vmxnet3Config::default());
    h.nic.transmit(h.packet(&[7; 60])).unwrap();
    assert_eq!(h.dev.txh(), 1, "an emptied staging queue leaves nothing unannounced");
    assert_eq!(h.nic.txq.lock().unkicked(), 0);
    let sent = h.dev.transmit_pending();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bytes, vec![7; 60]);
}

#[test]
fn test_kick_threshold_batches_doorbells() {
    let h = Harness::enabled(Vmxnet3Config { kick_threshold: 4, ..Default::default() });
    let fill = TX_RING_SIZE / TX_MAX_SEGMENTS;
    for _ in 0..fill {
        h.nic.transmit(h.fragmented_packet(&[64; TX_MAX_SEGMENTS])).unwrap();
    }
    for i in 0..6 {
        h.nic.transmit(h.packet(&[i; 64])).unwrap();
    }
    assert_eq!(h.nic.staged(), 6);
    assert_eq!(h.dev.transmit_pending().len(), fill);

    let mark = h.dev.mark();
    assert!(h.irq.fire(TX_VECTOR));
    assert_eq!(h.nic.staged(), 0);
    let doorbells: Vec<u32> = h.dev.writes_since(mark).into_iter()
        .filter(|(bar, offset, _)| *bar == BAR0 && *offset == VMXNET3_REV1.txh(0))
        .map(|(_, _, value)| value)
        .collect();
    assert_eq!(doorbells, vec![4, 6], "one kick per threshold, one for the remainder");
    assert_eq!(h.dev.transmit_pending().len(), 6);
}

#[test]
fn test_full_ring_stages_then_refuses() {
    let h = Harness::enabled(Vmxnet3Config { staging_capacity: 2, ..Default::default() });
    let fill = TX_RING_SIZE / TX_MAX_SEGMENTS;
    for _ in 0..fill {
        h.nic.transmit(h.fragmented_packet(&[64; TX_MAX_SEGMENTS])).unwrap();
    }
    assert_eq!(h.nic.txq.lock().avail(), 0);
    assert_eq!(h.nic.staged(), 0);

    h.nic.transmit(h.packet(&[1; 60])).unwrap();
    h.nic.transmit(h.packet(&[2; 60])).unwrap();
    assert_eq!(h.nic.staged(), 2);
    match h.nic.transmit(h.packet(&[3; 60])) {
        Err(TransmitError::Busy(packet)) => assert_eq!(packet.len(), 60),
        other => panic!("expected Busy, got {:?}", other),
    }

    assert_eq!(h.dev.transmit_pending().len(), fill);
    assert!(h.irq.fire(TX_VECTOR));
    assert_eq!(h.nic.staged(), 0);
    let sent = h.dev.transmit_pending();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].bytes, vec![1; 60], "staged packets keep their order");
    assert_eq!(sent[1].bytes, vec![2; 60]);
}

#[test]
fn test_invalid_packets_are_returned() {
    let h = Harness::enabled(Vmxnet3Config::default());
    match h.nic.transmit(h.fragmented_packet(&[])) {
        Err(TransmitError::Invalid { packet, .. }) => assert!(packet.is_empty()),
        other => panic!("expected Invalid, got {:?}", other),
    }
    let too_many = h.fragmented_packet(&[64; TX_MAX_SEGMENTS + 1]);
    assert!(matches!(h.nic.transmit(too_many), Err(TransmitError::Invalid { .. })));
    assert_eq!(h.nic.stats().tx_errors, 2);
    assert_eq!(h.nic.txq.lock().in_flight(), 0);
}

#[test]
fn test_receive_interrupt_delivers_frames() {
    let h = Harness::enabled(Vmxnet3Config::default());
    let frame: Vec<u8> = (0..60u8).collect();
    assert!(h.dev.receive(&[&frame], RxMeta { csum_bits: TCP4_CSUM_OK, vlan: Some(5), rss_hash: 0x1234, ..Default::default() }));
    assert!(h.dev.receive(&[&[0xEE; 80]], RxMeta { csum_bits: TCP4_CSUM_BAD, ..Default::default() }));
    assert!(h.irq.fire(RX_VECTOR));

    assert_eq!(h.stack.len(), 2);
    let first = h.stack.pop_frame().unwrap();
    assert_eq!(first.to_vec(), frame);
    assert_eq!(first.checksum, ChecksumStatus::Valid);
    assert_eq!((first.vlan_tag, first.rss_hash), (Some(5), 0x1234));
    let second = h.stack.pop_frame().unwrap();
    assert_eq!(second.checksum, ChecksumStatus::Invalid, "bad checksums are reported, not dropped");

    let stats = h.nic.stats();
    assert_eq!((stats.rx_packets, stats.rx_bytes), (2, 140));
    assert_eq!((stats.rx_csum, stats.rx_csum_err), (1, 1));
    assert_eq!(h.dev.imask(RX_VECTOR), 0, "the receive vector is re-armed");
    assert_eq!(h.nic.receive_work(), 0);

    let rx = h.nic.rx.lock();
    assert_eq!(rx.queue.posted(RxRingId::Head), RX_RING_SIZE, "every consumed buffer is replaced");
}

#[test]
fn test_multi_buffer_receive() {
    let h = Harness::enabled(Vmxnet3Config::default());
    let size = usize::from(h.nic.config().rx_buffer_size);
    let head = vec![1u8; size];
    let body = vec![2u8; size];
    let tail = vec![3u8; 100];
    assert!(h.dev.receive(&[&head, &body, &tail], RxMeta::default()));
    h.nic.poll_receive().unwrap();

    assert_eq!(h.stack.len(), 1);
    let frame = h.stack.pop_frame().unwrap();
    assert_eq!(frame.buffers.len(), 3);
    let mut expected = head.clone();
    expected.extend_from_slice(&body);
    expected.extend_from_slice(&tail);
    assert_eq!(frame.to_vec(), expected);
    assert_eq!(frame.checksum, ChecksumStatus::Unchecked);
}

#[test]
fn test_errored_frames_are_dropped() {
    let h = Harness::enabled(Vmxnet3Config::default());
    assert!(h.dev.receive(&[&[9; 64]], RxMeta { error: true, ..Default::default() }));
    assert!(h.dev.receive(&[&[8; 64]], RxMeta::default()));
    assert_eq!(h.nic.receive_work(), 2);
    assert_eq!(h.stack.len(), 1);
    assert_eq!(h.stack.pop_frame().unwrap().to_vec(), vec![8; 64]);
    assert_eq!(h.nic.stats().rx_drops, 1);
}

#[test]
fn test_receive_interrupt_drains_past_budget() {
    let h = Harness::enabled(Vmxnet3Config { rx_budget: 1, ..Default::default() });
    for i in 0..6 {
        assert!(h.dev.receive(&[&[i; 64]], RxMeta::default()));
    }
    assert!(h.irq.fire(RX_VECTOR));
    assert_eq!(h.stack.len(), 6);
    assert!(!h.nic.rx.lock().queue.completion_pending());
    assert_eq!(h.dev.imask(RX_VECTOR), 0);
    let order: Vec<u8> = (0..6).map(|_| h.stack.pop_frame().unwrap().to_vec()[0]).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn test_reset_restores_initial_state() {
    let h = Harness::enabled(per_packet_kicks());
    for _ in 0..3 {
        h.nic.transmit(h.packet(&[4; 100])).unwrap();
    }
    assert_eq!(h.dev.transmit_pending().len(), 3);
    h.nic.transmit(h.packet(&[5; 100])).unwrap();
    assert!(h.dev.receive(&[&[6; 64]], RxMeta::default()));

    h.nic.reset().unwrap();
    assert_eq!(h.nic.state(), DeviceState::Configured);
    assert_eq!(h.dev.count_commands(Command::Reset), 1);
    for vector in 0..NUM_INTRS {
        assert_eq!(h.dev.imask(vector), 1);
    }
    {
        let txq = h.nic.txq.lock();
        let ring = txq.cmd_ring();
        assert_eq!((ring.head(), ring.next(), ring.fill(), ring.gen()), (0, 0, 0, true));
        let rx = h.nic.rx.lock();
        for ring in RxRingId::ALL {
            let r = rx.queue.cmd_ring(ring);
            assert_eq!((r.head(), r.next(), r.fill(), r.gen()), (0, 0, 0, true));
        }
        assert!(rx.reassembly.is_idle());
    }
    let stats = h.nic.stats();
    assert_eq!((stats.tx_packets, stats.tx_drops), (3, 1), "completed packets are reclaimed, the rest dropped");
    assert!(matches!(h.nic.transmit(h.packet(&[0; 60])), Err(TransmitError::NotRunning(_))));

    h.nic.enable().unwrap();
    assert_eq!(h.dev.count_commands(Command::Enable), 2);
    h.nic.transmit(h.packet(&[7; 100])).unwrap();
    let sent = h.dev.transmit_pending();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bytes, vec![7; 100]);
    assert!(h.dev.receive(&[&[8; 64]], RxMeta::default()));
    assert_eq!(h.nic.receive_work(), 1);
    assert_eq!(h.stack.pop_frame().unwrap().to_vec(), vec![8; 64]);
}

#[test]
fn test_reset_keeps_staged_packets() {
    let h = Harness::enabled(Vmxnet3Config::default());
    for _ in 0..TX_RING_SIZE / TX_MAX_SEGMENTS {
        h.nic.transmit(h.fragmented_packet(&[64; TX_MAX_SEGMENTS])).unwrap();
    }
    h.nic.transmit(h.packet(&[1; 60])).unwrap();
    assert_eq!(h.nic.staged(), 1);

    h.nic.reset().unwrap();
    assert_eq!(h.nic.staged(), 1);
    h.nic.enable().unwrap();
    assert_eq!(h.nic.staged(), 0, "enabling flushes the staging queue");
    let sent = h.dev.transmit_pending();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bytes, vec![1; 60]);
}

#[test]
fn test_disable_and_reenable() {
    let h = Harness::enabled(per_packet_kicks());
    h.nic.disable().unwrap();
    assert_eq!(h.nic.state(), DeviceState::Disabled);
    assert_eq!(h.dev.count_commands(Command::Disable), 1);
    assert!(matches!(h.nic.transmit(h.packet(&[0; 60])), Err(TransmitError::NotRunning(_))));
    assert!(!h.dev.receive(&[&[1; 60]], RxMeta::default()), "no buffers stay posted");

    h.nic.enable().unwrap();
    h.nic.transmit(h.packet(&[2; 60])).unwrap();
    assert_eq!(h.dev.transmit_pending().len(), 1);
}

#[test]
fn test_link_event() {
    let h = Harness::enabled(Vmxnet3Config::default());
    h.dev.set_link(false, 0);
    h.dev.raise_events(Events::LINK);
    assert!(h.irq.fire(EVENT_VECTOR));
    assert_eq!(h.dev.acknowledged_events(), vec![Events::LINK.bits()]);
    assert_eq!(h.nic.event_work(), Events::LINK);
    assert_eq!(h.nic.event_work(), Events::empty());
    assert_eq!(h.stack.link_status(), LinkStatus { up: false, speed_mbps: 0 });
    assert!(!h.nic.link_status().up);
    assert_eq!(h.dev.acknowledged_events(), vec![Events::LINK.bits()]);
    assert_eq!(h.dev.imask(EVENT_VECTOR), 0);
}

#[test]
fn test_queue_error_event_recovers() {
    let h = Harness::enabled(per_packet_kicks());
    h.dev.set_queue_error(0x10);
    h.dev.raise_events(Events::TQERROR);
    assert!(h.irq.fire(EVENT_VECTOR));
    assert_eq!(h.dev.count_commands(Command::Reset), 0, "recovery waits for thread context");
    h.nic.poll_receive().unwrap();

    assert_eq!(h.dev.count_commands(Command::GetStatus), 1);
    assert_eq!(h.dev.count_commands(Command::Reset), 1);
    assert_eq!(h.dev.count_commands(Command::Enable), 2);
    assert_eq!(h.nic.state(), DeviceState::Enabled);
    h.nic.transmit(h.packet(&[3; 60])).unwrap();
    assert_eq!(h.dev.transmit_pending().len(), 1);
}

#[test]
fn test_interrupts_never_wait_for_held_locks() {
    let h = Harness::enabled(Vmxnet3Config::default());
    h.dev.set_link(false, 0);
    h.dev.raise_events(Events::LINK);
    {
        let _channel = h.nic.channel.lock();
        assert!(h.irq.fire(EVENT_VECTOR));
        assert!(h.dev.acknowledged_events().is_empty());
    }
    {
        let _staging = h.nic.staging.lock();
        assert!(h.irq.fire(TX_VECTOR));
    }
    {
        let _rx = h.nic.rx.lock();
        assert!(h.irq.fire(RX_VECTOR));
    }
    assert!(h.nic.link_status().up, "link changes are applied by the deferred pass");
    assert_eq!(h.dev.imask(EVENT_VECTOR), 0);

    h.nic.poll_receive().unwrap();
    assert!(!h.nic.link_status().up);
    assert_eq!(h.dev.acknowledged_events(), vec![Events::LINK.bits()]);
}

#[test]
fn test_rx_mode_and_multicast() {
    let h = Harness::enabled(Vmxnet3Config::default());
    h.nic.set_rx_mode(RxMode::UCAST | RxMode::PROMISC);
    assert_eq!(h.nic.channel.lock().driver_shared().rxmode, (RxMode::UCAST | RxMode::PROMISC).bits());
    assert_eq!(h.dev.commands().last(), Some(&u32::from(Command::SetRxMode)));

    h.nic.set_multicast_filter(&[[0x01, 0x00, 0x5E, 0, 0, 0xFB]]).unwrap();
    assert_eq!(h.dev.commands().last(), Some(&u32::from(Command::SetFilter)));
    assert!(matches!(h.nic.set_multicast_filter(&[[0; 6]; MULTICAST_MAX + 1]), Err(Vmxnet3Error::InvalidConfig(_))));
}

#[test]
fn test_interrupt_after_drop_is_ignored() {
    let h = Harness::enabled(Vmxnet3Config::default());
    let Harness { nic, irq, .. } = h;
    drop(nic);
    assert!(!irq.fire(RX_VECTOR));
}
