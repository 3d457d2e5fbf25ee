//! Aggregate wiring of the SCSI subsystem: virtual clock, bus, host adapter.
//!
//! Owns every shared piece of state explicitly (no globals) and acts as the
//! dispatch hub: bus notifications destined for the controller and expired
//! timers are routed here, on one logical thread, totally ordered by virtual
//! time.

use std::path::Path;

use anyhow::Result;

use crate::irq::InterruptSink;
use crate::scsi::bus::ScsiBus;
use crate::scsi::controller::{ChipVariant, ScsiController};
use crate::scsi::disk::ScsiTargetDisk;
use crate::scsi::dma::DmaChannel;
use crate::scsi::target::{ScsiDevice, ScsiTarget, ScsiTargetDevice, ScsiTargetType};
use crate::timer::{Fired, TimerScheduler, TimerTask};

pub struct ScsiSubsystem {
    timers: TimerScheduler,
    bus: ScsiBus,
    controller: ScsiController,
}

impl ScsiSubsystem {
    pub fn new(
        variant: ChipVariant,
        hba_id: u8,
        irq_id: u8,
        int_sink: Box<dyn InterruptSink>,
    ) -> Self {
        let mut bus = ScsiBus::new();
        bus.register_initiator(hba_id);
        Self {
            timers: TimerScheduler::new(),
            bus,
            controller: ScsiController::new(variant, hba_id, irq_id, int_sink),
        }
    }

    /// Loads a disk image (filename) and attaches a hard drive at the given
    /// SCSI ID
    pub fn attach_hdd_at(&mut self, filename: &Path, scsi_id: u8) -> Result<()> {
        self.attach_target_at(Box::new(ScsiTargetDisk::load_disk(filename)?), scsi_id)
    }

    /// Attaches a hard drive backed by an in-memory buffer
    pub fn attach_hdd_buffer_at(&mut self, data: Vec<u8>, scsi_id: u8) -> Result<()> {
        self.attach_target_at(Box::new(ScsiTargetDisk::from_buffer(data)?), scsi_id)
    }

    /// Attaches any command-level target behind the standard phase logic
    pub fn attach_target_at(&mut self, dev: Box<dyn ScsiTarget>, scsi_id: u8) -> Result<()> {
        self.bus
            .register_device(scsi_id, Box::new(ScsiTargetDevice::new(scsi_id, dev)))
    }

    /// Attaches a raw bus participant (custom phase logic)
    pub fn attach_device_at(&mut self, dev: Box<dyn ScsiDevice>, scsi_id: u8) -> Result<()> {
        self.bus.register_device(scsi_id, dev)
    }

    /// Detaches a target from the given SCSI ID
    pub fn detach_target(&mut self, scsi_id: u8) {
        self.bus.remove_device(scsi_id);
    }

    /// Returns the capacity of a target or None if detached or no media
    pub fn get_disk_capacity(&self, scsi_id: u8) -> Option<usize> {
        self.bus.device(scsi_id).and_then(|t| t.capacity())
    }

    /// Returns the image filename of a target or None if detached or no media
    pub fn get_disk_imagefn(&self, scsi_id: u8) -> Option<&Path> {
        self.bus.device(scsi_id).and_then(|t| t.image_fn())
    }

    /// Gets the target type (if attached) of an ID
    pub fn get_target_type(&self, scsi_id: u8) -> Option<ScsiTargetType> {
        self.bus.device(scsi_id).map(|t| t.target_type())
    }

    pub fn set_dma_channel(&mut self, chan: Option<Box<dyn DmaChannel>>) {
        self.controller.set_dma_channel(chan);
    }

    pub fn controller(&self) -> &ScsiController {
        &self.controller
    }

    pub fn bus(&self) -> &ScsiBus {
        &self.bus
    }

    pub fn now_ns(&self) -> u64 {
        self.timers.now_ns()
    }

    // Register port

    pub fn read_reg(&mut self, offset: u8) -> u8 {
        let v = self
            .controller
            .read_reg(&mut self.bus, &mut self.timers, offset);
        self.settle();
        v
    }

    pub fn write_reg(&mut self, offset: u8, val: u8) {
        self.controller
            .write_reg(&mut self.bus, &mut self.timers, offset, val);
        self.settle();
    }

    pub fn pseudo_dma_read(&mut self) -> u16 {
        let v = self
            .controller
            .pseudo_dma_read(&mut self.bus, &mut self.timers);
        self.settle();
        v
    }

    pub fn pseudo_dma_write(&mut self, val: u16) {
        self.controller
            .pseudo_dma_write(&mut self.bus, &mut self.timers, val);
        self.settle();
    }

    /// Advances virtual time by `ns`, firing due timers in deadline order
    pub fn run_for(&mut self, ns: u64) {
        let target = self.timers.now_ns() + ns;
        self.settle();
        while let Some(fired) = self.timers.next_due(target) {
            self.dispatch(fired);
            self.settle();
        }
        self.timers.advance_to(target);
    }

    /// Fires everything due right now (zero-delay continuations)
    pub fn run_due(&mut self) {
        self.run_for(0);
    }

    /// Runs until the controller raises its interrupt line or virtual time
    /// reaches `deadline_ns`. Returns the line level. This is the shape of
    /// the machine's "execute until the next IRQ" loop.
    pub fn run_until_irq(&mut self, deadline_ns: u64) -> bool {
        self.settle();
        while !self.controller.get_irq() {
            let Some(fired) = self.timers.next_due(deadline_ns) else {
                self.timers.advance_to(deadline_ns);
                return self.controller.get_irq();
            };
            self.dispatch(fired);
            self.settle();
        }
        true
    }

    fn dispatch(&mut self, fired: Fired) {
        match fired.task {
            TimerTask::SeqStep
            | TimerTask::SelTimeout
            | TimerTask::DmaChunk
            | TimerTask::RstRelease => {
                self.controller
                    .timer_fired(&mut self.bus, &mut self.timers, fired);
            }
            TimerTask::TargetSettle(id) => self.bus.target_settle(id, &mut self.timers),
        }
    }

    /// Drains bus notifications until the subsystem is quiescent
    fn settle(&mut self) {
        loop {
            self.bus.pump(&mut self.timers);
            let Some(msg) = self.bus.take_initiator_msg() else {
                break;
            };
            self.controller
                .notify(&mut self.bus, &mut self.timers, msg);
        }
    }
}
