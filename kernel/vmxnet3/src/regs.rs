//! The vmxnet3 register layout, command tokens and flag words.
//!
//! Everything the driver needs to know about register placement lives in one
//! [`RegisterLayout`] table, which is checked by [`RegisterLayout::validate`] when a device is probed.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const VMXNET3_VENDOR_ID: u16 = 0x15AD;
pub const VMXNET3_DEVICE_ID: u16 = 0x07B0;

/// BAR holding the per-queue doorbell and interrupt mask registers.
pub const BAR0: u8 = 0;
/// BAR holding the global command and configuration registers.
pub const BAR1: u8 = 1;

pub const NUM_TX_QUEUES: usize = 1;
pub const NUM_RX_QUEUES: usize = 1;
/// Two command rings per receive queue: head buffers and body buffers.
pub const RX_RINGS_PER_QUEUE: usize = 2;

pub const TX_RING_SIZE: usize = 512;
pub const TX_COMP_RING_SIZE: usize = TX_RING_SIZE;
pub const RX_RING_SIZE: usize = 256;
pub const RX_COMP_RING_SIZE: usize = RX_RING_SIZE * RX_RINGS_PER_QUEUE;

/// Descriptor indices are 12 bits wide in completion descriptors.
pub const MAX_RING_SIZE: usize = 4096;

/// The most descriptors one outgoing packet may use.
pub const TX_MAX_SEGMENTS: usize = 32;
/// The most bytes one transmit descriptor can describe. Encoded as a length of 0.
pub const TX_MAX_SEGMENT_SIZE: usize = 1 << 14;
/// The most buffers one received frame may span.
pub const MAX_RX_SEGMENTS: usize = 17;
pub const MULTICAST_MAX: usize = 32;

/// Interrupt vectors: one per queue plus one for device events.
pub const TX_VECTOR: u8 = 0;
pub const RX_VECTOR: u8 = 1;
pub const EVENT_VECTOR: u8 = 2;
pub const NUM_INTRS: u8 = 3;
/// Size of the interrupt moderation table in the driver-shared record.
pub const MAX_INTRS: usize = 25;

pub const DRIVER_SHARED_ALIGN: usize = 1;
pub const QUEUES_SHARED_ALIGN: usize = 128;
pub const MULTICAST_ALIGN: usize = 32;
pub const DESC_ALIGN: usize = 512;


/// Offsets of every vmxnet3 register, for one hardware revision.
#[derive(Debug)]
pub struct RegisterLayout {
    /// The device revision this table describes, as negotiated through `VRRS`.
    pub revision: u32,
    /// The UPT interface version negotiated through `UVRS`.
    pub upt_version: u32,

    // BAR0
    pub imask: usize,
    pub txh: usize,
    pub rxh1: usize,
    pub rxh2: usize,
    /// Distance between the registers of consecutive queues or vectors.
    pub stride: usize,

    // BAR1
    pub vrrs: usize,
    pub uvrs: usize,
    pub dsl: usize,
    pub dsh: usize,
    pub cmd: usize,
    pub macl: usize,
    pub mach: usize,
    pub icr: usize,
    pub ecr: usize,
}

/// Revision 1 of the vmxnet3 device, the only one this driver speaks.
pub static VMXNET3_REV1: RegisterLayout = RegisterLayout {
    revision: 1,
    upt_version: 1,
    imask: 0x000,
    txh: 0x600,
    rxh1: 0x800,
    rxh2: 0xA00,
    stride: 8,
    vrrs: 0x000,
    uvrs: 0x008,
    dsl: 0x010,
    dsh: 0x018,
    cmd: 0x020,
    macl: 0x028,
    mach: 0x030,
    icr: 0x038,
    ecr: 0x040,
};

impl RegisterLayout {
    /// Interrupt mask register of the given vector.
    pub fn imask(&self, vector: u8) -> usize {
        self.imask + usize::from(vector) * self.stride
    }

    /// Transmit doorbell of the given queue.
    pub fn txh(&self, queue: usize) -> usize {
        self.txh + queue * self.stride
    }

    /// Receive head register of the given command ring of the given queue.
    pub fn rxh(&self, ring: usize, queue: usize) -> usize {
        let base = if ring == 0 { self.rxh1 } else { self.rxh2 };
        base + queue * self.stride
    }

    /// The number of bytes of BAR0 this layout touches.
    pub fn bar0_span(&self) -> usize {
        self.rxh(1, NUM_RX_QUEUES - 1) + 4
    }

    /// The number of bytes of BAR1 this layout touches.
    pub fn bar1_span(&self) -> usize {
        self.bar1_registers().iter().copied().max().unwrap_or(0) + 4
    }

    fn bar1_registers(&self) -> [usize; 9] {
        [self.vrrs, self.uvrs, self.dsl, self.dsh, self.cmd, self.macl, self.mach, self.icr, self.ecr]
    }

    /// The bit to test in `VRRS` and write back to select this revision.
    pub fn revision_bit(&self) -> u32 {
        1 << (self.revision - 1)
    }

    /// The bit to test in `UVRS` and write back to select this UPT version.
    pub fn upt_version_bit(&self) -> u32 {
        1 << (self.upt_version - 1)
    }

    /// Checks that this table is internally consistent and describes a revision this driver supports.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.revision != 1 || self.upt_version != 1 {
            return Err("register layout describes an unsupported device revision");
        }
        if self.stride < 4 || self.stride % 4 != 0 {
            return Err("register stride must be a multiple of 4");
        }

        // BAR0 blocks must be ordered and must not overlap.
        let blocks = [
            (self.imask, usize::from(NUM_INTRS)),
            (self.txh, NUM_TX_QUEUES),
            (self.rxh1, NUM_RX_QUEUES),
            (self.rxh2, NUM_RX_QUEUES),
        ];
        for pair in blocks.windows(2) {
            let (start, count) = pair[0];
            if start % 4 != 0 || start + count * self.stride > pair[1].0 {
                return Err("BAR0 register blocks overlap or are misaligned");
            }
        }

        let bar1 = self.bar1_registers();
        if bar1.iter().any(|off| off % 4 != 0) || bar1.windows(2).any(|w| w[0] >= w[1]) {
            return Err("BAR1 registers are misaligned or out of order");
        }

        for cmd in Command::ALL {
            let prefix = u32::from(cmd) >> 16;
            let expected = if cmd.is_query() { 0xF00D } else { 0xCAFE };
            if prefix != expected {
                return Err("command token has the wrong class prefix");
            }
        }
        Ok(())
    }
}


/// Command tokens written to the `CMD` register.
///
/// "Set" commands carry the `0xCAFE` prefix and return nothing;
/// "get" commands carry the `0xF00D` prefix and return a value through `CMD`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Command {
    Enable      = 0xCAFE_0000,
    Disable     = 0xCAFE_0001,
    Reset       = 0xCAFE_0002,
    SetRxMode   = 0xCAFE_0003,
    SetFilter   = 0xCAFE_0004,
    VlanFilter  = 0xCAFE_0005,
    GetStatus   = 0xF00D_0000,
    GetStats    = 0xF00D_0001,
    GetLink     = 0xF00D_0002,
    GetMacLow   = 0xF00D_0003,
    GetMacHigh  = 0xF00D_0004,
    GetIntrConfig = 0xF00D_0008,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::Enable, Command::Disable, Command::Reset, Command::SetRxMode,
        Command::SetFilter, Command::VlanFilter, Command::GetStatus, Command::GetStats,
        Command::GetLink, Command::GetMacLow, Command::GetMacHigh, Command::GetIntrConfig,
    ];

    /// Whether this command produces a result in the `CMD` register.
    pub fn is_query(self) -> bool {
        matches!(self,
            Command::GetStatus | Command::GetStats | Command::GetLink |
            Command::GetMacLow | Command::GetMacHigh | Command::GetIntrConfig
        )
    }
}


/// How the device delivers interrupts, bits 0-1 of the `GET_INTRCFG` result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum InterruptType {
    Auto = 0,
    Intx = 1,
    Msi  = 2,
    Msix = 3,
}

/// How the device masks interrupts, bits 2-3 of the `GET_INTRCFG` result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum InterruptMaskMode {
    /// The device masks a vector itself when it fires.
    Auto   = 0,
    Active = 1,
    Lazy   = 2,
}

bitflags! {
    /// UPT offload features the driver asks the device to enable.
    pub struct UptFeatures: u64 {
        const RX_CSUM = 0x1;
        const RSS     = 0x2;
        const RX_VLAN = 0x4;
        const LRO     = 0x8;
    }
}

bitflags! {
    /// Which frames the device's receive filter lets through.
    pub struct RxMode: u32 {
        const UCAST    = 0x01;
        const MCAST    = 0x02;
        const BCAST    = 0x04;
        const ALLMULTI = 0x08;
        const PROMISC  = 0x10;
    }
}

bitflags! {
    /// Events the device reports through the driver-shared record.
    pub struct Events: u32 {
        const RQERROR = 0x01;
        const TQERROR = 0x02;
        const LINK    = 0x04;
        const DIC     = 0x08;
        const DEBUG   = 0x10;
    }
}
