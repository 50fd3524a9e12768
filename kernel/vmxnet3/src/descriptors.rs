//! The four vmxnet3 descriptor formats: transmit, transmit completion, receive, receive completion.
//!
//! Every descriptor is 16 bytes of little-endian bitfields living in DMA memory shared with the device,
//! so every field access is a volatile load or store of a whole 32-bit word.

use core::ptr::{read_volatile, write_volatile};
use bit_field::BitField;
use nic_buffers::ChecksumStatus;
use num_enum::TryFromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use crate::ring::{CompletionDescriptor, Descriptor};

#[inline(always)]
fn load<T: Copy>(field: &T) -> T {
    // SAFETY: `field` is a valid, aligned reference.
    unsafe { read_volatile(field) }
}

#[inline(always)]
fn store<T: Copy>(field: &mut T, value: T) {
    // SAFETY: `field` is a valid, aligned, exclusive reference.
    unsafe { write_volatile(field, value) }
}

/// What the device should compute for an outgoing packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum OffloadMode {
    None = 0,
    Checksum = 2,
    Segmentation = 3,
}

/// Receive buffer type: the first buffer of a frame, or a continuation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferType {
    Head = 0,
    Body = 1,
}


/// Transmit descriptor.
///
/// * word 2: `len[0:14] gen[14] dtype[16] offload_pos[18:32]`
/// * word 3: `hlen[0:10] om[10:12] eop[12] cq[13] vtag_mode[15] vtag[16:32]`
#[derive(FromBytes)]
#[repr(C)]
pub struct TxDesc {
    pub(crate) addr: u64,
    pub(crate) word2: u32,
    pub(crate) word3: u32,
}
const_assert_eq!(core::mem::size_of::<TxDesc>(), 16);

/// Fields of a [`TxDesc`] as the driver fills them in, before they are written out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxDescFields {
    pub addr: u64,
    /// Bytes described; `TX_MAX_SEGMENT_SIZE` is encoded as 0.
    pub len: u32,
    pub gen: bool,
    pub offload_pos: u32,
    pub hlen: u32,
    pub offload_mode: u32,
    pub eop: bool,
    pub compreq: bool,
    pub vtag: Option<u16>,
}

impl TxDesc {
    /// Writes the whole descriptor, with the word holding the generation bit last.
    pub fn write(&mut self, f: &TxDescFields) {
        let mut w2 = 0u32;
        w2.set_bits(0..14, f.len & 0x3FFF);
        w2.set_bit(14, f.gen);
        w2.set_bits(18..32, f.offload_pos);
        let mut w3 = 0u32;
        w3.set_bits(0..10, f.hlen);
        w3.set_bits(10..12, f.offload_mode);
        w3.set_bit(12, f.eop);
        w3.set_bit(13, f.compreq);
        if let Some(tci) = f.vtag {
            w3.set_bit(15, true);
            w3.set_bits(16..32, u32::from(tci));
        }
        store(&mut self.addr, f.addr);
        store(&mut self.word3, w3);
        store(&mut self.word2, w2);
    }

    /// Reads the descriptor back into its fields.
    pub fn read(&self) -> TxDescFields {
        let w2 = load(&self.word2);
        let w3 = load(&self.word3);
        TxDescFields {
            addr: load(&self.addr),
            len: w2.get_bits(0..14),
            gen: w2.get_bit(14),
            offload_pos: w2.get_bits(18..32),
            hlen: w3.get_bits(0..10),
            offload_mode: w3.get_bits(10..12),
            eop: w3.get_bit(12),
            compreq: w3.get_bit(13),
            vtag: w3.get_bit(15).then(|| w3.get_bits(16..32) as u16),
        }
    }

    pub fn gen(&self) -> bool {
        load(&self.word2).get_bit(14)
    }

    /// Flips the generation bit, handing the descriptor to (or taking it back from) the device.
    pub fn flip_gen(&mut self) {
        let mut w2 = load(&self.word2);
        w2.set_bit(14, !w2.get_bit(14));
        store(&mut self.word2, w2);
    }
}

impl Descriptor for TxDesc {
    fn clear(&mut self) {
        store(&mut self.addr, 0);
        store(&mut self.word2, 0);
        store(&mut self.word3, 0);
    }
}


/// Transmit completion descriptor.
///
/// * word 0: `eop_idx[0:12]`
/// * word 3: `type[24:31] gen[31]`
#[derive(FromBytes)]
#[repr(C)]
pub struct TxCompDesc {
    pub(crate) word0: u32,
    pub(crate) word1: u32,
    pub(crate) word2: u32,
    pub(crate) word3: u32,
}
const_assert_eq!(core::mem::size_of::<TxCompDesc>(), 16);

impl TxCompDesc {
    /// Index of the end-of-packet descriptor of the packet this completes.
    pub fn eop_idx(&self) -> usize {
        load(&self.word0).get_bits(0..12) as usize
    }

    pub fn completion_type(&self) -> u32 {
        load(&self.word3).get_bits(24..31)
    }
}

impl Descriptor for TxCompDesc {
    fn clear(&mut self) {
        store(&mut self.word0, 0);
        store(&mut self.word1, 0);
        store(&mut self.word2, 0);
        store(&mut self.word3, 0);
    }
}

impl CompletionDescriptor for TxCompDesc {
    fn gen(&self) -> bool {
        load(&self.word3).get_bit(31)
    }
}


/// Receive descriptor.
///
/// * word 2: `len[0:14] btype[14] dtype[15] gen[31]`
#[derive(FromBytes)]
#[repr(C)]
pub struct RxDesc {
    pub(crate) addr: u64,
    pub(crate) word2: u32,
    pub(crate) word3: u32,
}
const_assert_eq!(core::mem::size_of::<RxDesc>(), 16);

impl RxDesc {
    /// Attaches a buffer and hands the descriptor to the device by writing `gen` last.
    pub fn post(&mut self, addr: u64, len: u16, btype: BufferType, gen: bool) {
        let mut w2 = 0u32;
        w2.set_bits(0..14, u32::from(len) & 0x3FFF);
        w2.set_bit(14, btype == BufferType::Body);
        w2.set_bit(31, gen);
        store(&mut self.addr, addr);
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        store(&mut self.word2, w2);
    }

    pub fn buffer_addr(&self) -> u64 {
        load(&self.addr)
    }

    pub fn len(&self) -> u16 {
        load(&self.word2).get_bits(0..14) as u16
    }

    pub fn buffer_type(&self) -> BufferType {
        if load(&self.word2).get_bit(14) { BufferType::Body } else { BufferType::Head }
    }

    pub fn gen(&self) -> bool {
        load(&self.word2).get_bit(31)
    }
}

impl Descriptor for RxDesc {
    fn clear(&mut self) {
        store(&mut self.addr, 0);
        store(&mut self.word2, 0);
        store(&mut self.word3, 0);
    }
}


/// Receive completion descriptor.
///
/// * word 0: `rxd_idx[0:12] eop[14] sop[15] qid[16:26] rss_type[26:30] no_csum[30]`
/// * word 1: `rss_hash`
/// * word 2: `len[0:14] error[14] vlan[15] vtag[16:32]`
/// * word 3: `csum[0:16] csum_ok[16] udp[17] tcp[18] ipcsum_ok[19] ipv6[20] ipv4[21] fragment[22] fcs[23] type[24:31] gen[31]`
#[derive(FromBytes)]
#[repr(C)]
pub struct RxCompDesc {
    pub(crate) word0: u32,
    pub(crate) word1: u32,
    pub(crate) word2: u32,
    pub(crate) word3: u32,
}
const_assert_eq!(core::mem::size_of::<RxCompDesc>(), 16);

/// A decoded copy of one [`RxCompDesc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxCompletion {
    pub rxd_idx: usize,
    pub qid: usize,
    pub sop: bool,
    pub eop: bool,
    pub len: u16,
    pub error: bool,
    pub vlan_tag: Option<u16>,
    pub rss_hash: u32,
    pub checksum: ChecksumStatus,
}

impl RxCompDesc {
    /// Copies the descriptor out of shared memory.
    pub fn read(&self) -> RxCompletion {
        let w0 = load(&self.word0);
        let w2 = load(&self.word2);
        let w3 = load(&self.word3);
        RxCompletion {
            rxd_idx: w0.get_bits(0..12) as usize,
            qid: w0.get_bits(16..26) as usize,
            sop: w0.get_bit(15),
            eop: w0.get_bit(14),
            len: w2.get_bits(0..14) as u16,
            error: w2.get_bit(14),
            vlan_tag: w2.get_bit(15).then(|| w2.get_bits(16..32) as u16),
            rss_hash: load(&self.word1),
            checksum: checksum_status(w0, w3),
        }
    }
}

/// Interprets the checksum bits the device reported.
///
/// Frames that are not IP, or that the device did not look at, are `Unchecked`.
/// An IPv4 header checksum failure, or a TCP/UDP checksum failure on an unfragmented datagram, is `Invalid`.
fn checksum_status(word0: u32, word3: u32) -> ChecksumStatus {
    let no_csum = word0.get_bit(30);
    let ipv4 = word3.get_bit(21);
    let ipv6 = word3.get_bit(20);
    if no_csum || !(ipv4 || ipv6) {
        return ChecksumStatus::Unchecked;
    }
    let ip_ok = !ipv4 || word3.get_bit(19);
    let l4 = word3.get_bit(18) || word3.get_bit(17);
    let l4_ok = !l4 || word3.get_bit(22) || word3.get_bit(16);
    if ip_ok && l4_ok { ChecksumStatus::Valid } else { ChecksumStatus::Invalid }
}

impl Descriptor for RxCompDesc {
    fn clear(&mut self) {
        store(&mut self.word0, 0);
        store(&mut self.word1, 0);
        store(&mut self.word2, 0);
        store(&mut self.word3, 0);
    }
}

impl CompletionDescriptor for RxCompDesc {
    fn gen(&self) -> bool {
        load(&self.word3).get_bit(31)
    }
}
