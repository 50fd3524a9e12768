//! The receive queue: buffer posting, completion draining and frame reassembly.
//!
//! Every receive queue has two command rings. The first holds "head" buffers, which receive the
//! start of each frame; the second holds "body" buffers, which receive the rest of frames
//! larger than one buffer. The device reports filled buffers in order through one completion ring.

use core::sync::atomic::{fence, Ordering};
use alloc::{sync::Arc, vec::Vec};
use nic_buffers::{ChecksumStatus, DmaAllocator, ReceiveBuffer, ReceiveBufferPool, ReceivedFrame};
use network_interface_card::NetworkStack;
use crate::descriptors::{BufferType, RxCompDesc, RxCompletion, RxDesc};
use crate::regs::{MAX_RX_SEGMENTS, NUM_RX_QUEUES, RX_COMP_RING_SIZE, RX_RINGS_PER_QUEUE, RX_RING_SIZE};
use crate::ring::{CompletionDescriptor, DescriptorRing};
use crate::shared::RxQueueShared;
use crate::stats::RxStats;

/// Which of a receive queue's two command rings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxRingId {
    Head = 0,
    Body = 1,
}

impl RxRingId {
    pub const ALL: [RxRingId; RX_RINGS_PER_QUEUE] = [RxRingId::Head, RxRingId::Body];

    pub fn index(self) -> usize {
        self as usize
    }

    fn buffer_type(self) -> BufferType {
        match self {
            RxRingId::Head => BufferType::Head,
            RxRingId::Body => BufferType::Body,
        }
    }

    /// The device reports completions of the second ring with a queue id offset by the number of queues.
    fn from_completion(qid: usize) -> RxRingId {
        if qid < NUM_RX_QUEUES { RxRingId::Head } else { RxRingId::Body }
    }
}


/// The buffers of a frame received so far.
#[derive(Default)]
pub struct FrameChain {
    buffers: Vec<ReceiveBuffer>,
}

impl FrameChain {
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Reassembly state carried from one completion to the next.
#[derive(Default)]
pub struct RxReassembly {
    pub in_progress: Option<FrameChain>,
    /// Set while the remainder of an abandoned frame is being skipped, until its end-of-packet.
    pub discarding: bool,
}

impl RxReassembly {
    pub fn new() -> RxReassembly {
        RxReassembly::default()
    }

    pub fn reset(&mut self) {
        self.in_progress = None;
        self.discarding = false;
    }

    /// Whether no frame is partly received.
    pub fn is_idle(&self) -> bool {
        self.in_progress.is_none() && !self.discarding
    }

    /// Gives up on the current frame, skipping its remaining completions unless `eop` ends it here.
    fn abandon(&mut self, eop: bool) {
        self.in_progress = None;
        self.discarding = !eop;
    }
}


/// One receive queue.
pub struct ReceiveQueue {
    id: usize,
    cmd_rings: [DescriptorRing<RxDesc, RX_RING_SIZE>; RX_RINGS_PER_QUEUE],
    comp_ring: DescriptorRing<RxCompDesc, RX_COMP_RING_SIZE>,
    /// The buffer posted at each slot of each command ring.
    buffers: [Vec<Option<ReceiveBuffer>>; RX_RINGS_PER_QUEUE],
    pool: Arc<ReceiveBufferPool>,
    stats: Arc<RxStats>,
}

impl ReceiveQueue {
    /// Allocates the queue's rings. No buffers are posted until [`ReceiveQueue::refill`].
    pub fn new(
        id: usize,
        allocator: &Arc<dyn DmaAllocator>,
        pool: Arc<ReceiveBufferPool>,
        stats: Arc<RxStats>,
    ) -> Result<ReceiveQueue, &'static str> {
        let cmd_rings = [DescriptorRing::new(allocator)?, DescriptorRing::new(allocator)?];
        let comp_ring = DescriptorRing::new(allocator)?;
        let empty_slots = || {
            let mut v = Vec::with_capacity(RX_RING_SIZE);
            v.resize_with(RX_RING_SIZE, || None);
            v
        };
        Ok(ReceiveQueue {
            id,
            cmd_rings,
            comp_ring,
            buffers: [empty_slots(), empty_slots()],
            pool,
            stats,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The number of buffers currently posted to the given ring.
    pub fn posted(&self, ring: RxRingId) -> usize {
        self.cmd_rings[ring.index()].fill()
    }

    pub fn cmd_ring(&self, ring: RxRingId) -> &DescriptorRing<RxDesc, RX_RING_SIZE> {
        &self.cmd_rings[ring.index()]
    }

    /// Posts one fresh buffer from the pool to `ring`.
    ///
    /// Fails if the ring is already full or no buffer can be obtained;
    /// the ring is then simply left one buffer short.
    pub fn replenish(&mut self, ring: RxRingId) -> Result<(), &'static str> {
        if self.cmd_rings[ring.index()].is_full() {
            return Err("receive ring is already full");
        }
        match self.pool.allocate() {
            Ok(buffer) => {
                self.post_buffer(ring, buffer);
                Ok(())
            }
            Err(e) => {
                self.stats.alloc_failures.inc();
                Err(e)
            }
        }
    }

    /// Posts buffers to every ring until it is full or the pool runs dry.
    ///
    /// Returns how many buffers were posted.
    pub fn refill(&mut self) -> usize {
        let mut posted = 0;
        for ring in RxRingId::ALL {
            while !self.cmd_rings[ring.index()].is_full() {
                if let Err(e) = self.replenish(ring) {
                    warn!("vmxnet3::ReceiveQueue::refill(): rxq {} ring {:?} left short: {}", self.id, ring, e);
                    break;
                }
                posted += 1;
            }
        }
        posted
    }

    /// Attaches `buffer` to the next free slot of `ring` and hands the slot to the device.
    fn post_buffer(&mut self, ring: RxRingId, buffer: ReceiveBuffer) {
        let r = &mut self.cmd_rings[ring.index()];
        let idx = r.next();
        let gen = r.gen();
        r.get_mut(idx).post(buffer.phys_addr().value(), buffer.capacity(), ring.buffer_type(), gen);
        r.advance();
        self.buffers[ring.index()][idx] = Some(buffer);
    }

    /// Takes back the buffer at the head of `ring`, which the device is done with.
    fn take_buffer(&mut self, ring: RxRingId) -> Option<ReceiveBuffer> {
        let r = &mut self.cmd_rings[ring.index()];
        if r.fill() == 0 {
            return None;
        }
        let idx = r.head();
        r.retire(1);
        self.buffers[ring.index()][idx].take()
    }

    /// Re-posts the buffers of every slot the device passed over on its way to `rxd_idx`,
    /// then detaches and returns the buffer at `rxd_idx` itself.
    fn detach(&mut self, ring: RxRingId, rxd_idx: usize) -> Option<ReceiveBuffer> {
        if rxd_idx >= RX_RING_SIZE {
            error!("vmxnet3::ReceiveQueue::detach(): rxq {} completion for slot {} beyond the end of ring {:?}",
                self.id, rxd_idx, ring
            );
            return None;
        }
        let mut skipped = 0;
        while self.cmd_rings[ring.index()].head() != rxd_idx {
            if skipped == RX_RING_SIZE || self.cmd_rings[ring.index()].fill() == 0 {
                error!("vmxnet3::ReceiveQueue::detach(): rxq {} completion for slot {} of ring {:?}, which was never posted",
                    self.id, rxd_idx, ring
                );
                return None;
            }
            if let Some(buffer) = self.take_buffer(ring) {
                self.post_buffer(ring, buffer);
            }
            skipped += 1;
        }
        if skipped > 0 {
            warn!("vmxnet3::ReceiveQueue::detach(): rxq {} device skipped {} slots of ring {:?}", self.id, skipped, ring);
        }
        self.take_buffer(ring)
    }

    /// Processes completions in order until one still belongs to the device or `budget` have been handled.
    ///
    /// Finished frames are delivered to `stack`. Every buffer taken off a ring is immediately
    /// replaced; if no replacement can be had, the taken buffer goes back onto the ring and
    /// its frame is dropped, so the rings never drain from here.
    ///
    /// Returns the number of completions processed.
    pub fn drain_completions(&mut self, reasm: &mut RxReassembly, stack: &dyn NetworkStack, budget: usize) -> usize {
        let mut processed = 0;
        while processed < budget {
            let comp_idx = self.comp_ring.next();
            let desc = self.comp_ring.get(comp_idx);
            if desc.gen() != self.comp_ring.gen() {
                break;
            }
            // the generation bit must be seen before the rest of the completion
            fence(Ordering::Acquire);
            let completion = desc.read();
            self.comp_ring.skip();
            processed += 1;

            let ring = RxRingId::from_completion(completion.qid);
            let Some(buffer) = self.detach(ring, completion.rxd_idx) else {
                if !reasm.discarding {
                    self.stats.drops.inc();
                }
                reasm.abandon(completion.eop);
                continue;
            };

            if self.replenish(ring).is_err() {
                self.post_buffer(ring, buffer);
                if !reasm.discarding {
                    self.stats.drops.inc();
                }
                reasm.abandon(completion.eop);
                continue;
            }
            self.input(reasm, buffer, &completion, stack);
        }
        processed
    }

    /// Adds one filled buffer to the frame being reassembled, delivering the frame at its end.
    fn input(&mut self, reasm: &mut RxReassembly, mut buffer: ReceiveBuffer, c: &RxCompletion, stack: &dyn NetworkStack) {
        if reasm.discarding {
            if c.eop {
                reasm.discarding = false;
            }
            return;
        }

        if c.sop {
            if reasm.in_progress.take().is_some() {
                warn!("vmxnet3::ReceiveQueue::input(): rxq {} frame started before the previous one ended", self.id);
                self.stats.drops.inc();
            }
            if c.len == 0 {
                self.stats.drops.inc();
                reasm.abandon(c.eop);
                return;
            }
            reasm.in_progress = Some(FrameChain::default());
        }

        let Some(chain) = reasm.in_progress.as_mut() else {
            warn!("vmxnet3::ReceiveQueue::input(): rxq {} body buffer without a frame start", self.id);
            self.stats.drops.inc();
            reasm.abandon(c.eop);
            return;
        };
        if buffer.set_length(c.len).is_err() || chain.len() == MAX_RX_SEGMENTS {
            self.stats.drops.inc();
            reasm.abandon(c.eop);
            return;
        }
        chain.buffers.push(buffer);

        if !c.eop {
            return;
        }
        let Some(chain) = reasm.in_progress.take() else { return };
        if c.error {
            self.stats.drops.inc();
            return;
        }
        match c.checksum {
            ChecksumStatus::Valid => self.stats.csum.inc(),
            ChecksumStatus::Invalid => self.stats.csum_err.inc(),
            ChecksumStatus::Unchecked => { }
        }
        let frame = ReceivedFrame {
            buffers: chain.buffers,
            checksum: c.checksum,
            vlan_tag: c.vlan_tag,
            rss_hash: c.rss_hash,
        };
        self.stats.packets.inc();
        self.stats.bytes.add(frame.len() as u64);
        stack.deliver_frame(frame);
    }

    /// Whether the device has written a completion that hasn't been processed yet.
    pub fn completion_pending(&self) -> bool {
        self.comp_ring.get(self.comp_ring.next()).gen() == self.comp_ring.gen()
    }

    /// Whether the rings hold enough buffers to receive at least one maximal frame.
    pub fn ring_has_capacity(&self) -> bool {
        self.posted(RxRingId::Head) > 0 && self.posted(RxRingId::Body) >= MAX_RX_SEGMENTS - 1
    }

    /// Returns every posted buffer to the pool and puts all rings back in their initial state.
    pub fn reset(&mut self) {
        for slots in self.buffers.iter_mut() {
            slots.iter_mut().for_each(|b| drop(b.take()));
        }
        for ring in self.cmd_rings.iter_mut() {
            ring.reset();
        }
        self.comp_ring.reset();
    }

    /// Describes this queue's rings in its queue-shared record.
    pub fn fill_shared(&self, rs: &mut RxQueueShared, intr_idx: u8) {
        rs.update_rxhead = 0;
        rs.cmd_ring[0] = self.cmd_rings[0].phys_addr().value();
        rs.cmd_ring[1] = self.cmd_rings[1].phys_addr().value();
        rs.comp_ring = self.comp_ring.phys_addr().value();
        rs.driver_data = 0;
        rs.cmd_ring_len = [RX_RING_SIZE as u32; RX_RINGS_PER_QUEUE];
        rs.comp_ring_len = RX_COMP_RING_SIZE as u32;
        rs.driver_data_len = 0;
        rs.intr_idx = intr_idx;
    }

    #[cfg(test)]
    pub(crate) fn comp_ring_mut(&mut self) -> &mut DescriptorRing<RxCompDesc, RX_COMP_RING_SIZE> {
        &mut self.comp_ring
    }
}
