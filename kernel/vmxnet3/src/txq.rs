//! The transmit queue: offload classification, descriptor posting, doorbells and completion reclaim.

use core::sync::atomic::{fence, Ordering};
use alloc::{sync::Arc, vec::Vec};
use nic_buffers::{DmaAllocator, TxOffload, TxPacket};
use nic_initialization::RegisterWindow;
use crate::descriptors::{OffloadMode, TxCompDesc, TxDesc, TxDescFields};
use crate::regs::{TX_COMP_RING_SIZE, TX_MAX_SEGMENTS, TX_MAX_SEGMENT_SIZE, TX_RING_SIZE};
use crate::ring::{CompletionDescriptor, DescriptorRing};
use crate::shared::TxQueueShared;
use crate::stats::TxStats;

/// Offset of the checksum field within a TCP header.
const TCP_CSUM_OFFSET: u16 = 16;
/// Offset of the checksum field within a UDP header.
const UDP_CSUM_OFFSET: u16 = 6;
/// Largest value the `hlen` descriptor field can hold.
const MAX_HLEN: u16 = (1 << 10) - 1;
/// Largest value the `offload_pos` descriptor field can hold.
const MAX_OFFLOAD_POS: u16 = (1 << 14) - 1;
/// When fewer than this many descriptors are free, every post rings the doorbell.
const KICK_LOW_WATER: usize = 32;


/// How the device should treat a packet, as encoded in its first descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffloadContext {
    pub mode: OffloadMode,
    /// Checksum mode: where the L4 header starts. Segmentation mode: the length of all headers.
    pub hlen: u16,
    /// Checksum mode: where to store the checksum. Segmentation mode: the MSS.
    pub pos: u16,
}

impl OffloadContext {
    pub const NONE: OffloadContext = OffloadContext { mode: OffloadMode::None, hlen: 0, pos: 0 };

    /// Maps a packet's offload request onto the device's descriptor fields,
    /// failing if the offsets don't fit into them.
    pub fn classify(offload: TxOffload) -> Result<OffloadContext, &'static str> {
        let ctx = match offload {
            TxOffload::None => return Ok(OffloadContext::NONE),
            TxOffload::TcpChecksum { l4_offset } => OffloadContext {
                mode: OffloadMode::Checksum,
                hlen: l4_offset,
                pos: l4_offset.checked_add(TCP_CSUM_OFFSET).ok_or("checksum offset overflowed")?,
            },
            TxOffload::UdpChecksum { l4_offset } => OffloadContext {
                mode: OffloadMode::Checksum,
                hlen: l4_offset,
                pos: l4_offset.checked_add(UDP_CSUM_OFFSET).ok_or("checksum offset overflowed")?,
            },
            TxOffload::TcpSegmentation { l4_offset, tcp_header_len, mss } => {
                if mss == 0 {
                    return Err("segmentation requested with an MSS of zero");
                }
                OffloadContext {
                    mode: OffloadMode::Segmentation,
                    hlen: l4_offset.checked_add(tcp_header_len).ok_or("header length overflowed")?,
                    pos: mss,
                }
            }
        };
        if ctx.hlen > MAX_HLEN {
            return Err("header length does not fit in a transmit descriptor");
        }
        if ctx.pos > MAX_OFFLOAD_POS {
            return Err("offload position does not fit in a transmit descriptor");
        }
        Ok(ctx)
    }
}


/// A packet that has been checked and classified, ready to be posted to a [`TransmitQueue`].
pub struct TxRequest {
    packet: TxPacket,
    offload: OffloadContext,
    /// How many descriptors the packet will occupy.
    count: usize,
}

impl TxRequest {
    /// Validates `packet` and works out how it will be described to the device.
    ///
    /// Each fragment takes one descriptor per 16 KiB it spans; empty fragments take none.
    /// On failure the packet is handed back along with the reason.
    pub fn prepare(packet: TxPacket) -> Result<TxRequest, (TxPacket, &'static str)> {
        let count: usize = packet.fragments().iter()
            .map(|f| (f.length() + TX_MAX_SEGMENT_SIZE - 1) / TX_MAX_SEGMENT_SIZE)
            .sum();
        if count == 0 {
            return Err((packet, "packet has no data"));
        }
        if count > TX_MAX_SEGMENTS {
            return Err((packet, "packet needs too many transmit descriptors"));
        }
        match OffloadContext::classify(packet.offload()) {
            Ok(offload) => Ok(TxRequest { packet, offload, count }),
            Err(e) => Err((packet, e)),
        }
    }

    pub fn descriptor_count(&self) -> usize {
        self.count
    }

    pub fn offload(&self) -> OffloadContext {
        self.offload
    }

    pub fn packet(&self) -> &TxPacket {
        &self.packet
    }

    pub fn into_packet(self) -> TxPacket {
        self.packet
    }
}


/// One transmit queue: a command ring the driver fills and a completion ring the device fills.
pub struct TransmitQueue {
    id: usize,
    cmd_ring: DescriptorRing<TxDesc, TX_RING_SIZE>,
    comp_ring: DescriptorRing<TxCompDesc, TX_COMP_RING_SIZE>,
    /// The in-flight request whose first descriptor sits at each slot.
    pending: Vec<Option<TxRequest>>,
    /// Descriptors posted since the doorbell was last rung.
    unkicked: usize,
    kick_threshold: usize,
    doorbell: Arc<dyn RegisterWindow>,
    doorbell_offset: usize,
    stats: Arc<TxStats>,
}

impl TransmitQueue {
    /// Allocates the queue's rings.
    ///
    /// # Arguments
    /// * `id`: the queue number
    /// * `allocator`: source of the rings' DMA memory
    /// * `doorbell`: the register window holding this queue's `TXH` register, at `doorbell_offset`
    /// * `kick_threshold`: how many posted descriptors it takes to ring the doorbell
    pub fn new(
        id: usize,
        allocator: &Arc<dyn DmaAllocator>,
        doorbell: Arc<dyn RegisterWindow>,
        doorbell_offset: usize,
        kick_threshold: usize,
        stats: Arc<TxStats>,
    ) -> Result<TransmitQueue, &'static str> {
        let cmd_ring = DescriptorRing::new(allocator)?;
        let comp_ring = DescriptorRing::new(allocator)?;
        let mut pending = Vec::with_capacity(TX_RING_SIZE);
        pending.resize_with(TX_RING_SIZE, || None);
        Ok(TransmitQueue {
            id,
            cmd_ring,
            comp_ring,
            pending,
            unkicked: 0,
            kick_threshold: kick_threshold.max(1),
            doorbell,
            doorbell_offset,
            stats,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The number of free descriptors in the command ring.
    pub fn avail(&self) -> usize {
        self.cmd_ring.free_slots()
    }

    /// The number of packets posted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.pending.iter().filter(|p| p.is_some()).count()
    }

    pub fn unkicked(&self) -> usize {
        self.unkicked
    }

    pub fn cmd_ring(&self) -> &DescriptorRing<TxDesc, TX_RING_SIZE> {
        &self.cmd_ring
    }

    /// Posts the request's descriptors to the command ring.
    ///
    /// Either every descriptor of the packet is posted or nothing is:
    /// if the ring lacks room, the request is handed back untouched.
    /// The first descriptor is written with the wrong generation bit and flipped only once
    /// the rest of the chain is in place, so the device never starts on half a packet.
    pub fn encap(&mut self, req: TxRequest) -> Result<(), TxRequest> {
        if self.cmd_ring.free_slots() < req.count {
            return Err(req);
        }

        let sop = self.cmd_ring.next();
        let vtag = req.packet.vlan_tag();
        let mut written = 0;
        for frag in req.packet.fragments() {
            let base = frag.phys_addr().value();
            let mut offset = 0;
            while offset < frag.length() {
                let len = core::cmp::min(frag.length() - offset, TX_MAX_SEGMENT_SIZE);
                let first = written == 0;
                let eop = written + 1 == req.count;
                let gen = if first { !self.cmd_ring.gen() } else { self.cmd_ring.gen() };
                let fields = TxDescFields {
                    addr: base + offset as u64,
                    len: len as u32,
                    gen,
                    offload_pos: if first { u32::from(req.offload.pos) } else { 0 },
                    hlen: if first { u32::from(req.offload.hlen) } else { 0 },
                    offload_mode: if first { req.offload.mode as u32 } else { 0 },
                    eop,
                    compreq: eop,
                    vtag: if first { vtag } else { None },
                };
                let idx = self.cmd_ring.next();
                self.cmd_ring.get_mut(idx).write(&fields);
                self.cmd_ring.advance();
                written += 1;
                offset += len;
            }
        }
        debug_assert_eq!(written, req.count);

        match req.offload.mode {
            OffloadMode::Checksum => self.stats.csum.inc(),
            OffloadMode::Segmentation => self.stats.tso.inc(),
            OffloadMode::None => { }
        }
        self.unkicked += req.count;
        self.pending[sop] = Some(req);

        // hand the whole chain over to the device
        fence(Ordering::Release);
        self.cmd_ring.get_mut(sop).flip_gen();

        if self.unkicked >= self.kick_threshold || self.cmd_ring.free_slots() < KICK_LOW_WATER {
            self.kick();
        }
        Ok(())
    }

    /// Rings the doorbell, telling the device how far the ring has been filled.
    pub fn kick(&mut self) {
        self.doorbell.write32(self.doorbell_offset, self.cmd_ring.next() as u32);
        self.unkicked = 0;
    }

    /// Rings the doorbell if anything has been posted since it was last rung.
    pub fn kick_pending(&mut self) {
        if self.unkicked > 0 {
            self.kick();
        }
    }

    /// Walks the completion ring in order, releasing every packet the device has finished with.
    ///
    /// Returns the number of packets released.
    pub fn reclaim(&mut self) -> usize {
        let mut completed = 0;
        loop {
            let comp_idx = self.comp_ring.next();
            let desc = self.comp_ring.get(comp_idx);
            if desc.gen() != self.comp_ring.gen() {
                break;
            }
            // the generation bit must be seen before the rest of the completion
            fence(Ordering::Acquire);
            let eop_idx = desc.eop_idx();
            self.comp_ring.skip();

            let head = self.cmd_ring.head();
            let used = (eop_idx + TX_RING_SIZE - head) % TX_RING_SIZE + 1;
            if eop_idx >= TX_RING_SIZE || used > self.cmd_ring.fill() {
                error!("vmxnet3::TransmitQueue::reclaim(): txq {} completion for slot {} beyond the {} posted descriptors at {}",
                    self.id, eop_idx, self.cmd_ring.fill(), head
                );
                continue;
            }

            match self.pending[head].take() {
                Some(req) => {
                    if req.count != used {
                        warn!("vmxnet3::TransmitQueue::reclaim(): txq {} packet at {} used {} descriptors, device completed {}",
                            self.id, head, req.count, used
                        );
                    }
                    self.stats.packets.inc();
                    self.stats.bytes.add(req.packet.len() as u64);
                    // dropping the request returns its buffers
                }
                None => warn!("vmxnet3::TransmitQueue::reclaim(): txq {} no packet started at slot {}", self.id, head),
            }
            self.cmd_ring.retire(used);
            completed += 1;
        }
        completed
    }

    /// Throws away every in-flight packet and returns both rings to their initial state.
    ///
    /// Returns the number of packets thrown away, which are counted as drops.
    pub fn reset(&mut self) -> usize {
        let dropped = self.pending.iter_mut().filter_map(Option::take).count();
        self.stats.drops.add(dropped as u64);
        self.cmd_ring.reset();
        self.comp_ring.reset();
        self.unkicked = 0;
        dropped
    }

    /// Describes this queue's rings in its queue-shared record.
    pub fn fill_shared(&self, ts: &mut TxQueueShared, intr_idx: u8) {
        ts.npending = 0;
        ts.intr_threshold = 1;
        ts.cmd_ring = self.cmd_ring.phys_addr().value();
        ts.data_ring = 0;
        ts.comp_ring = self.comp_ring.phys_addr().value();
        ts.driver_data = 0;
        ts.cmd_ring_len = TX_RING_SIZE as u32;
        ts.data_ring_len = 0;
        ts.comp_ring_len = TX_COMP_RING_SIZE as u32;
        ts.driver_data_len = 0;
        ts.intr_idx = intr_idx;
    }

    #[cfg(test)]
    pub(crate) fn comp_ring_mut(&mut self) -> &mut DescriptorRing<TxCompDesc, TX_COMP_RING_SIZE> {
        &mut self.comp_ring
    }
}
