//! Shared test scaffolding: recording doubles for the external seams and a
//! couple of scripted bus participants.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;

use crate::irq::InterruptSink;
use crate::scsi::bus::{BusState, ScsiBus};
use crate::scsi::controller::{ChipVariant, ScsiController};
use crate::scsi::dma::DmaChannel;
use crate::scsi::target::{ScsiDevice, ScsiTarget, ScsiTargetType};
use crate::scsi::{
    ScsiBusPhase, ScsiCmdResult, ScsiMsg, CTRL_BSY, CTRL_REQ, MSG_CMD_COMPLETE,
    STATUS_CHECK_CONDITION, STATUS_GOOD,
};
use crate::timer::TimerScheduler;

/// Records every interrupt line transition the controller reports
#[derive(Clone, Default)]
pub struct IrqRecorder {
    events: Rc<RefCell<Vec<bool>>>,
}

impl IrqRecorder {
    pub fn sink(&self) -> Box<dyn InterruptSink> {
        Box::new(Self {
            events: self.events.clone(),
        })
    }

    pub fn events(&self) -> Vec<bool> {
        self.events.borrow().clone()
    }
}

impl InterruptSink for IrqRecorder {
    fn ack_int(&mut self, _irq_id: u8, level: bool) {
        self.events.borrow_mut().push(level);
    }
}

/// DMA channel whose buffers stay visible to the test through shared handles
#[derive(Clone, Default)]
pub struct SharedDma {
    outgoing: Rc<RefCell<Vec<u8>>>,
    incoming: Rc<RefCell<Vec<u8>>>,
}

impl SharedDma {
    pub fn supply(&self, data: &[u8]) {
        self.outgoing.borrow_mut().extend_from_slice(data);
    }

    pub fn received(&self) -> Vec<u8> {
        self.incoming.borrow().clone()
    }
}

impl DmaChannel for SharedDma {
    fn pull_data(&mut self, max: usize) -> Vec<u8> {
        let mut out = self.outgoing.borrow_mut();
        let n = max.min(out.len());
        out.drain(..n).collect()
    }

    fn push_data(&mut self, data: &[u8]) {
        self.incoming.borrow_mut().extend_from_slice(data);
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn xfer_retry(&mut self) {}
}

/// Minimal command-level target: answers the vendor command 0xC1 with a
/// canned DataIn payload.
#[derive(Default)]
pub struct TestTarget {
    data: Vec<u8>,
}

impl TestTarget {
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ScsiTarget for TestTarget {
    fn target_type(&self) -> ScsiTargetType {
        ScsiTargetType::Disk
    }

    fn unit_ready(&mut self) -> Result<ScsiCmdResult> {
        Ok(ScsiCmdResult::Status(STATUS_GOOD))
    }

    fn inquiry(&mut self, _cmd: &[u8]) -> Result<ScsiCmdResult> {
        Ok(ScsiCmdResult::DataIn(vec![0; 36]))
    }

    fn mode_sense_page(&mut self, _page: u8) -> Option<Vec<u8>> {
        None
    }

    fn req_sense(&mut self) -> (u8, u16) {
        (0, 0)
    }

    fn set_cc(&mut self, _code: u8, _asc: u16) {}

    fn blocksize(&self) -> Option<usize> {
        None
    }

    fn blocks(&self) -> Option<usize> {
        None
    }

    fn read(&self, _block_offset: usize, _block_count: usize) -> Vec<u8> {
        vec![]
    }

    fn write(&mut self, _block_offset: usize, _data: &[u8]) {}

    fn image_fn(&self) -> Option<&Path> {
        None
    }

    fn specific_cmd(&mut self, cmd: &[u8], _outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        match cmd[0] {
            0xC1 => Ok(ScsiCmdResult::DataIn(self.data.clone())),
            _ => Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION)),
        }
    }
}

/// A target that answers selection but skips the Command phase entirely,
/// jumping from MessageOut straight to Status. Exercises the short-circuit
/// path of composite select commands.
pub struct StatusJumper {
    id: u8,
    phase: ScsiBusPhase,
}

impl StatusJumper {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            phase: ScsiBusPhase::Free,
        }
    }

    fn enter_phase(&mut self, bus: &mut BusState, phase: ScsiBusPhase) {
        self.phase = phase;
        bus.switch_phase(self.id, phase);
        bus.assert_ctrl_line(self.id, CTRL_REQ);
    }
}

impl ScsiDevice for StatusJumper {
    fn scsi_id(&self) -> u8 {
        self.id
    }

    fn target_type(&self) -> ScsiTargetType {
        ScsiTargetType::Disk
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn image_fn(&self) -> Option<&Path> {
        None
    }

    fn notify(&mut self, bus: &mut BusState, _timers: &mut TimerScheduler, msg: ScsiMsg) {
        if let ScsiMsg::BusPhaseChange(ScsiBusPhase::Selection) = msg {
            if bus.data_lines() & (1 << self.id) != 0 {
                bus.assert_ctrl_line(self.id, CTRL_BSY);
                bus.confirm_selection(self.id);
                self.enter_phase(bus, ScsiBusPhase::MessageOut);
            }
        }
    }

    fn settle_expired(&mut self, _bus: &mut BusState, _timers: &mut TimerScheduler) {}

    fn send_data(&mut self, _bus: &mut BusState) -> Option<u8> {
        match self.phase {
            ScsiBusPhase::Status => Some(STATUS_GOOD),
            ScsiBusPhase::MessageIn => Some(MSG_CMD_COMPLETE),
            _ => None,
        }
    }

    fn rcv_data(&mut self, bus: &mut BusState, _byte: u8) -> bool {
        if self.phase == ScsiBusPhase::MessageOut {
            // Off-script: straight to Status, no Command phase
            self.enter_phase(bus, ScsiBusPhase::Status);
            return true;
        }
        false
    }

    fn next_step(&mut self, bus: &mut BusState) {
        match self.phase {
            ScsiBusPhase::Status => self.enter_phase(bus, ScsiBusPhase::MessageIn),
            _ => {
                self.phase = ScsiBusPhase::Free;
                bus.disconnect(self.id);
            }
        }
    }

    fn xfer_data(&mut self, _bus: &mut BusState) {}

    fn negotiate_xfer(&mut self, _bytes_in: usize, _bytes_out: usize) {}
}

/// A controller on a bus of its own, for register-level tests
pub fn controller() -> (ScsiController, ScsiBus, TimerScheduler, IrqRecorder) {
    let irq = IrqRecorder::default();
    let mut bus = ScsiBus::new();
    bus.register_initiator(7);
    let ctrl = ScsiController::new(ChipVariant::Sc53C94, 7, 1, irq.sink());
    (ctrl, bus, TimerScheduler::new(), irq)
}
