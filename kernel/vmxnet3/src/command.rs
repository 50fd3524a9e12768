//! The device command channel and the shared-memory records behind it.
//!
//! Commands are single 32-bit tokens written to the `CMD` register of BAR1;
//! "get" commands leave their result in the same register. The channel also owns the
//! driver-shared record, the queue-shared records and the multicast table,
//! since the device only ever learns about them through commands and the `DSL`/`DSH` registers.

use core::mem::{align_of, size_of};
use core::sync::atomic::{fence, Ordering};
use alloc::{boxed::Box, sync::Arc};
use network_interface_card::LinkStatus;
use nic_buffers::{DmaAllocator, DmaRegion, PhysicalAddress};
use nic_initialization::RegisterWindow;
use owning_ref::BoxRefMut;
use crate::Vmxnet3Error;
use crate::config::Vmxnet3Config;
use crate::regs::*;
use crate::shared::*;

/// The interrupt setup the device reports through `GET_INTRCFG`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterruptConfig {
    pub intr_type: InterruptType,
    pub mask_mode: InterruptMaskMode,
}

impl InterruptConfig {
    /// Decodes a `GET_INTRCFG` result, or returns `None` if the mask mode is not one the device defines.
    fn from_bits(word: u32) -> Option<InterruptConfig> {
        Some(InterruptConfig {
            intr_type: InterruptType::try_from(word & 0x3).ok()?,
            mask_mode: InterruptMaskMode::try_from((word >> 2) & 0x3).ok()?,
        })
    }

    /// Whether the device masks a vector by itself when it fires.
    pub fn automask(&self) -> bool {
        self.mask_mode == InterruptMaskMode::Auto
    }
}

pub struct CommandChannel {
    bar1: Arc<dyn RegisterWindow>,
    layout: &'static RegisterLayout,
    driver_shared: BoxRefMut<DmaRegion, DriverShared>,
    queues_shared: DmaRegion,
    multicast: DmaRegion,
    handshake_done: bool,
}

impl CommandChannel {
    /// Allocates the driver-shared record, the queue-shared records and the multicast table.
    pub fn new(
        bar1: Arc<dyn RegisterWindow>,
        layout: &'static RegisterLayout,
        allocator: &Arc<dyn DmaAllocator>,
    ) -> Result<CommandChannel, &'static str> {
        let ds_align = DRIVER_SHARED_ALIGN.max(align_of::<DriverShared>());
        let ds_region = DmaRegion::allocate(allocator, size_of::<DriverShared>(), ds_align)?;
        let driver_shared = BoxRefMut::new(Box::new(ds_region)).try_map_mut(|r| r.as_type_mut::<DriverShared>(0))?;
        let queues_shared = DmaRegion::allocate(allocator, QUEUES_SHARED_LEN, QUEUES_SHARED_ALIGN)?;
        let multicast = DmaRegion::allocate(allocator, MULTICAST_MAX * 6, MULTICAST_ALIGN)?;
        Ok(CommandChannel { bar1, layout, driver_shared, queues_shared, multicast, handshake_done: false })
    }

    pub fn write_cmd(&self, cmd: Command) {
        self.bar1.write32(self.layout.cmd, cmd.into());
    }

    /// Issues a command and returns what the device left in the `CMD` register.
    pub fn read_cmd(&self, cmd: Command) -> u32 {
        self.write_cmd(cmd);
        self.bar1.read32(self.layout.cmd)
    }

    /// Selects the device revision and UPT version this driver speaks.
    pub fn version_handshake(&mut self) -> Result<(), Vmxnet3Error> {
        let revisions = self.bar1.read32(self.layout.vrrs);
        if revisions & self.layout.revision_bit() == 0 {
            error!("vmxnet3::version_handshake(): device revisions {:#X} don't include revision {}", revisions, self.layout.revision);
            return Err(Vmxnet3Error::UnsupportedRevision);
        }
        self.bar1.write32(self.layout.vrrs, self.layout.revision_bit());

        let upt_versions = self.bar1.read32(self.layout.uvrs);
        if upt_versions & self.layout.upt_version_bit() == 0 {
            error!("vmxnet3::version_handshake(): device UPT versions {:#X} don't include version {}", upt_versions, self.layout.upt_version);
            return Err(Vmxnet3Error::UnsupportedRevision);
        }
        self.bar1.write32(self.layout.uvrs, self.layout.upt_version_bit());

        self.handshake_done = true;
        debug!("vmxnet3::version_handshake(): revision {}, UPT version {}", self.layout.revision, self.layout.upt_version);
        Ok(())
    }

    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    pub fn driver_shared_phys(&self) -> PhysicalAddress {
        self.driver_shared.as_owner().phys_addr()
    }

    /// Fills in the driver-shared record. Interrupts start out disabled through `ictrl`.
    pub fn fill_driver_shared(&mut self, config: &Vmxnet3Config, automask: bool) {
        let layout = self.layout;
        let queues_pa = self.queues_shared.phys_addr().value();
        let mcast_pa = self.multicast.phys_addr().value();
        let ds = &mut *self.driver_shared;

        ds.magic = REV1_MAGIC;
        ds.version = DRIVER_VERSION;
        ds.guest = guest_info();
        ds.vmxnet3_revision = layout.revision;
        ds.upt_version = layout.upt_version;
        ds.upt_features = config.features.bits();
        ds.driver_data = 0;
        ds.driver_data_len = 0;
        ds.queue_shared = queues_pa;
        ds.queue_shared_len = QUEUES_SHARED_LEN as u32;
        ds.mtu = config.mtu;
        ds.nrxsg_max = MAX_RX_SEGMENTS as u16;
        ds.ntxqueue = NUM_TX_QUEUES as u8;
        ds.nrxqueue = NUM_RX_QUEUES as u8;

        ds.automask = automask as u8;
        ds.nintr = NUM_INTRS;
        ds.evintr = EVENT_VECTOR;
        ds.modlevel = [0; MAX_INTRS];
        for level in ds.modlevel.iter_mut().take(usize::from(NUM_INTRS)) {
            *level = config.interrupt_moderation;
        }
        ds.ictrl = ICTRL_DISABLE_ALL;

        ds.rxmode = config.rx_mode.bits();
        ds.mcast_table = mcast_pa;
        ds.mcast_tablelen = 0;
        ds.vlan_filter = [0; 128];
        ds.rss = SharedRegionDesc::default();
        ds.pm = SharedRegionDesc::default();
        ds.plugin = SharedRegionDesc::default();
        ds.event = 0;
    }

    pub fn tx_queue_shared_mut(&mut self) -> Result<&mut TxQueueShared, &'static str> {
        self.queues_shared.as_type_mut::<TxQueueShared>(TX_QUEUE_SHARED_OFFSET)
    }

    pub fn rx_queue_shared_mut(&mut self) -> Result<&mut RxQueueShared, &'static str> {
        self.queues_shared.as_type_mut::<RxQueueShared>(RX_QUEUE_SHARED_OFFSET)
    }

    /// Tells the device where the driver-shared record lives.
    pub fn publish_shared(&self) {
        // everything written to the shared records must be visible before the device looks
        fence(Ordering::SeqCst);
        let pa = self.driver_shared_phys();
        self.bar1.write32(self.layout.dsl, pa.low_u32());
        self.bar1.write32(self.layout.dsh, pa.high_u32());
    }

    /// Activates the device.
    ///
    /// Refuses without touching any register if the version handshake hasn't succeeded.
    pub fn enable(&self) -> Result<(), Vmxnet3Error> {
        if !self.handshake_done {
            return Err(Vmxnet3Error::HandshakeRequired);
        }
        let status = self.read_cmd(Command::Enable);
        if status != 0 {
            error!("vmxnet3::enable(): device refused to activate, status {:#X}", status);
            return Err(Vmxnet3Error::CommandFailed { command: Command::Enable, status });
        }
        Ok(())
    }

    pub fn disable(&self) {
        self.write_cmd(Command::Disable);
    }

    pub fn reset(&self) {
        self.write_cmd(Command::Reset);
    }

    pub fn mac_address(&self) -> [u8; 6] {
        let low = self.read_cmd(Command::GetMacLow).to_le_bytes();
        let high = self.read_cmd(Command::GetMacHigh).to_le_bytes();
        [low[0], low[1], low[2], low[3], high[0], high[1]]
    }

    pub fn link_status(&self) -> LinkStatus {
        let word = self.read_cmd(Command::GetLink);
        LinkStatus { up: word & 0x1 != 0, speed_mbps: word >> 16 }
    }

    pub fn interrupt_config(&self) -> Result<InterruptConfig, Vmxnet3Error> {
        let status = self.read_cmd(Command::GetIntrConfig);
        InterruptConfig::from_bits(status).ok_or_else(|| {
            error!("vmxnet3::interrupt_config(): device reported an invalid interrupt config {:#X}", status);
            Vmxnet3Error::CommandFailed { command: Command::GetIntrConfig, status }
        })
    }

    pub fn set_rx_mode(&mut self, mode: RxMode) {
        self.driver_shared.rxmode = mode.bits();
        fence(Ordering::SeqCst);
        self.write_cmd(Command::SetRxMode);
    }

    /// Replaces the multicast filter with `addrs`, at most [`MULTICAST_MAX`] of them.
    pub fn set_multicast_filter(&mut self, addrs: &[[u8; 6]]) -> Result<(), Vmxnet3Error> {
        if addrs.len() > MULTICAST_MAX {
            return Err(Vmxnet3Error::InvalidConfig("too many multicast addresses"));
        }
        let table = self.multicast.as_slice_mut::<[u8; 6]>(0, addrs.len()).map_err(Vmxnet3Error::Allocation)?;
        table.copy_from_slice(addrs);
        self.driver_shared.mcast_table = self.multicast.phys_addr().value();
        self.driver_shared.mcast_tablelen = (addrs.len() * 6) as u16;
        fence(Ordering::SeqCst);
        self.write_cmd(Command::SetFilter);
        Ok(())
    }

    /// Sets or clears the bit that holds off every interrupt.
    pub fn set_interrupts_disabled(&mut self, disabled: bool) {
        let ictrl = &mut self.driver_shared.ictrl;
        let value = if disabled { *ictrl | ICTRL_DISABLE_ALL } else { *ictrl & !ICTRL_DISABLE_ALL };
        // SAFETY: a valid, aligned, exclusive reference.
        unsafe { core::ptr::write_volatile(ictrl, value) };
    }

    /// Returns the events the device has raised and acknowledges them.
    pub fn take_events(&self) -> Events {
        let events = self.driver_shared.pending_events();
        if events != 0 {
            self.bar1.write32(self.layout.ecr, events);
        }
        Events::from_bits_truncate(events)
    }

    /// Asks the device to report the state of the transmit and receive queues.
    pub fn queue_status(&mut self) -> Result<(QueueStatus, QueueStatus), &'static str> {
        self.write_cmd(Command::GetStatus);
        let tx = self.tx_queue_shared_mut()?.status();
        let rx = self.rx_queue_shared_mut()?.status();
        Ok((tx, rx))
    }

    /// Asks the device to refresh its own queue counters and returns them.
    pub fn device_stats(&mut self) -> Result<(UptTxStats, UptRxStats), &'static str> {
        self.write_cmd(Command::GetStats);
        let tx = self.tx_queue_shared_mut()?.device_stats();
        let rx = self.rx_queue_shared_mut()?.device_stats();
        Ok((tx, rx))
    }

    #[cfg(test)]
    pub(crate) fn driver_shared(&self) -> &DriverShared {
        &self.driver_shared
    }
}
