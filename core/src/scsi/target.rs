//! SCSI target generic/shared code: the bus-facing phase state machine and
//! the command execution abstraction implemented by concrete devices.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::Result;

use crate::scsi::bus::BusState;
use crate::scsi::{
    scsi_cmd_len, ScsiBusPhase, ScsiCmdResult, ScsiMsg, CTRL_ATN, CTRL_BSY, CTRL_REQ,
    MSG_CMD_COMPLETE, STATUS_CHECK_CONDITION, STATUS_GOOD,
};
use crate::timer::{TimerId, TimerScheduler, TimerTask};

/// Bus settle delay between recognizing selection and responding
pub const BUS_SETTLE_DELAY_NS: u64 = 400;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
/// Enumeration of supported emulated SCSI target types (devices)
pub enum ScsiTargetType {
    Disk,
    Cdrom,
}

/// A bus participant in the target role: everything the bus needs to be able
/// to route to a device, and nothing more.
pub trait ScsiDevice {
    fn scsi_id(&self) -> u8;
    fn target_type(&self) -> ScsiTargetType;
    fn capacity(&self) -> Option<usize>;
    fn image_fn(&self) -> Option<&Path>;

    /// Bus notification fan-out (phase changes, selection confirmation)
    fn notify(&mut self, bus: &mut BusState, timers: &mut TimerScheduler, msg: ScsiMsg);

    /// Continuation of the bus-settle delay armed from `notify`
    fn settle_expired(&mut self, bus: &mut BusState, timers: &mut TimerScheduler);

    /// One byte, target -> initiator (DataIn/Status/MessageIn)
    fn send_data(&mut self, bus: &mut BusState) -> Option<u8>;

    /// One byte, initiator -> target (Command/DataOut/MessageOut).
    /// Returns whether the byte was accepted.
    fn rcv_data(&mut self, bus: &mut BusState, byte: u8) -> bool;

    /// Advances the phase state machine one step
    fn next_step(&mut self, bus: &mut BusState);

    /// Nudges the device to drive the current transfer phase
    fn xfer_data(&mut self, bus: &mut BusState);

    /// Announces the initiator's intended transfer lengths
    fn negotiate_xfer(&mut self, bytes_in: usize, bytes_out: usize);
}

/// Target-side phase logic wrapping a concrete [`ScsiTarget`].
///
/// Reacts to selection, walks the information-transfer phases
/// (MessageOut -> Command -> Data -> Status -> MessageIn -> bus free) and
/// feeds completed commands to the inner device for execution.
pub struct ScsiTargetDevice {
    id: u8,

    /// The device's own notion of the phase it is driving
    phase: ScsiBusPhase,

    /// ATN was asserted when we were selected
    sel_atn: bool,

    /// Command buffer
    cmdbuf: Vec<u8>,

    /// Active command length
    cmdlen: usize,

    /// Message Out accumulation
    msg_out: Vec<u8>,

    /// Message In bytes ready to send
    msg_in: VecDeque<u8>,

    /// Response buffer (DataIn phase)
    databuf_in: VecDeque<u8>,

    /// DataOut phase accumulation and expected length
    databuf_out: Vec<u8>,
    dataout_len: usize,

    /// Status byte for the Status phase
    status: u8,

    settle_timer: Option<TimerId>,

    dev: Box<dyn ScsiTarget>,
}

impl ScsiTargetDevice {
    pub fn new(id: u8, dev: Box<dyn ScsiTarget>) -> Self {
        Self {
            id,
            phase: ScsiBusPhase::Free,
            sel_atn: false,
            cmdbuf: vec![],
            cmdlen: 0,
            msg_out: vec![],
            msg_in: VecDeque::new(),
            databuf_in: VecDeque::new(),
            databuf_out: vec![],
            dataout_len: 0,
            status: STATUS_GOOD,
            settle_timer: None,
            dev,
        }
    }

    fn enter_phase(&mut self, bus: &mut BusState, phase: ScsiBusPhase) {
        self.phase = phase;
        if phase == ScsiBusPhase::Free {
            bus.disconnect(self.id);
            return;
        }
        bus.switch_phase(self.id, phase);
        bus.assert_ctrl_line(self.id, CTRL_REQ);
    }

    fn clear_buffers(&mut self) {
        self.cmdbuf.clear();
        self.cmdlen = 0;
        self.msg_out.clear();
        self.msg_in.clear();
        self.databuf_in.clear();
        self.databuf_out.clear();
        self.dataout_len = 0;
        self.status = STATUS_GOOD;
    }

    fn bus_reset(&mut self, bus: &mut BusState, timers: &mut TimerScheduler) {
        if let Some(t) = self.settle_timer.take() {
            timers.cancel(t);
        }
        self.clear_buffers();
        self.phase = ScsiBusPhase::Free;
        bus.disconnect(self.id);
    }

    fn run_command(&mut self, bus: &mut BusState, outdata: Option<&[u8]>) {
        let result = self.dev.cmd(&self.cmdbuf, outdata);

        match result {
            Ok(ScsiCmdResult::Status(s)) => {
                self.status = s;
                self.enter_phase(bus, ScsiBusPhase::Status);
            }
            Ok(ScsiCmdResult::DataIn(data)) => {
                self.status = STATUS_GOOD;
                self.databuf_in = VecDeque::from(data);
                if self.databuf_in.is_empty() {
                    self.enter_phase(bus, ScsiBusPhase::Status);
                } else {
                    self.enter_phase(bus, ScsiBusPhase::DataIn);
                }
            }
            Ok(ScsiCmdResult::DataOut(len)) => {
                self.dataout_len = len;
                self.databuf_out.clear();
                self.enter_phase(bus, ScsiBusPhase::DataOut);

                if len == 0 {
                    // Legal according to spec
                    self.run_command(bus, Some(&[]));
                }
            }
            Err(e) => {
                log::error!("SCSI ID {} command error: {:#}", self.id, e);
                self.status = STATUS_CHECK_CONDITION;
                self.enter_phase(bus, ScsiBusPhase::Status);
            }
        }
    }
}

impl ScsiDevice for ScsiTargetDevice {
    fn scsi_id(&self) -> u8 {
        self.id
    }

    fn target_type(&self) -> ScsiTargetType {
        self.dev.target_type()
    }

    fn capacity(&self) -> Option<usize> {
        self.dev.capacity()
    }

    fn image_fn(&self) -> Option<&Path> {
        self.dev.image_fn()
    }

    fn notify(&mut self, bus: &mut BusState, timers: &mut TimerScheduler, msg: ScsiMsg) {
        match msg {
            ScsiMsg::BusPhaseChange(ScsiBusPhase::Selection) => {
                if bus.data_lines() & (1 << self.id) != 0 {
                    // That's us. Respond after the bus settle delay.
                    if let Some(t) = self.settle_timer.take() {
                        timers.cancel(t);
                    }
                    self.settle_timer =
                        Some(timers.add_oneshot(BUS_SETTLE_DELAY_NS, TimerTask::TargetSettle(self.id)));
                }
            }
            ScsiMsg::BusPhaseChange(ScsiBusPhase::Reset) => {
                self.bus_reset(bus, timers);
            }
            _ => (),
        }
    }

    fn settle_expired(&mut self, bus: &mut BusState, _timers: &mut TimerScheduler) {
        self.settle_timer = None;

        // Selection may have been abandoned while we were settling
        if bus.cur_phase() != ScsiBusPhase::Selection || bus.data_lines() & (1 << self.id) == 0 {
            return;
        }

        self.sel_atn = bus.ctrl_lines() & CTRL_ATN != 0;
        self.clear_buffers();
        bus.assert_ctrl_line(self.id, CTRL_BSY);
        bus.confirm_selection(self.id);

        if self.sel_atn {
            self.enter_phase(bus, ScsiBusPhase::MessageOut);
        } else {
            self.enter_phase(bus, ScsiBusPhase::Command);
        }
    }

    fn send_data(&mut self, bus: &mut BusState) -> Option<u8> {
        match self.phase {
            ScsiBusPhase::DataIn => {
                let byte = self.databuf_in.pop_front();
                if byte.is_some() && self.databuf_in.is_empty() {
                    // Last byte handed over; move on to Status
                    self.next_step(bus);
                }
                byte
            }
            ScsiBusPhase::Status => Some(self.status),
            ScsiBusPhase::MessageIn => {
                Some(self.msg_in.pop_front().unwrap_or(MSG_CMD_COMPLETE))
            }
            _ => {
                log::warn!(
                    "SCSI ID {}: data requested in phase {:?}",
                    self.id,
                    self.phase
                );
                None
            }
        }
    }

    fn rcv_data(&mut self, bus: &mut BusState, byte: u8) -> bool {
        match self.phase {
            ScsiBusPhase::MessageOut => {
                self.msg_out.push(byte);
                // Single-byte messages (IDENTIFY et al) complete immediately
                if byte & 0x80 != 0 || self.msg_out.len() > 1 {
                    self.next_step(bus);
                }
                true
            }
            ScsiBusPhase::Command => {
                if self.cmdbuf.is_empty() {
                    self.cmdlen = scsi_cmd_len(byte).unwrap_or_else(|| {
                        log::error!("Cmd length unknown for {:02X}", byte);
                        6
                    });
                }
                self.cmdbuf.push(byte);
                if self.cmdbuf.len() >= self.cmdlen {
                    self.run_command(bus, None);
                }
                true
            }
            ScsiBusPhase::DataOut => {
                self.databuf_out.push(byte);
                if self.databuf_out.len() >= self.dataout_len {
                    let data = std::mem::take(&mut self.databuf_out);
                    self.dataout_len = 0;
                    self.run_command(bus, Some(&data));
                }
                true
            }
            _ => {
                log::warn!(
                    "SCSI ID {}: dropped byte {:02X} in phase {:?}",
                    self.id,
                    byte,
                    self.phase
                );
                false
            }
        }
    }

    fn next_step(&mut self, bus: &mut BusState) {
        match self.phase {
            ScsiBusPhase::MessageOut => self.enter_phase(bus, ScsiBusPhase::Command),
            ScsiBusPhase::Command => {
                // Dispatch happens on the final CDB byte; a premature step
                // request leaves the phase alone.
            }
            ScsiBusPhase::DataIn => self.enter_phase(bus, ScsiBusPhase::Status),
            ScsiBusPhase::DataOut => {
                let data = std::mem::take(&mut self.databuf_out);
                self.dataout_len = 0;
                self.run_command(bus, Some(&data));
            }
            ScsiBusPhase::Status => {
                self.msg_in.push_back(MSG_CMD_COMPLETE);
                self.enter_phase(bus, ScsiBusPhase::MessageIn);
            }
            ScsiBusPhase::MessageIn | ScsiBusPhase::Free => {
                self.phase = ScsiBusPhase::Free;
                bus.disconnect(self.id);
            }
            _ => (),
        }
    }

    fn xfer_data(&mut self, bus: &mut BusState) {
        // Re-assert REQ if there is anything left to hand over or room to
        // accept; the line may have been dropped by a phase round-trip.
        let pending = match self.phase {
            ScsiBusPhase::DataIn => !self.databuf_in.is_empty(),
            ScsiBusPhase::Status | ScsiBusPhase::MessageIn => true,
            ScsiBusPhase::Command | ScsiBusPhase::DataOut | ScsiBusPhase::MessageOut => true,
            _ => false,
        };
        if pending {
            bus.assert_ctrl_line(self.id, CTRL_REQ);
        }
    }

    fn negotiate_xfer(&mut self, _bytes_in: usize, bytes_out: usize) {
        if bytes_out > 0 {
            self.dataout_len = bytes_out;
        }
    }
}

/// An abstraction of a generic SCSI target: device-specific command
/// execution behind the phase logic above.
pub trait ScsiTarget {
    fn target_type(&self) -> ScsiTargetType;
    fn unit_ready(&mut self) -> Result<ScsiCmdResult>;
    fn inquiry(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult>;

    /// Mode page contents (without the page header) or None if unsupported
    fn mode_sense_page(&mut self, page: u8) -> Option<Vec<u8>>;

    /// Request sense result (code, asc)
    fn req_sense(&mut self) -> (u8, u16);
    fn set_cc(&mut self, code: u8, asc: u16);

    // For block devices
    fn blocksize(&self) -> Option<usize>;
    fn blocks(&self) -> Option<usize>;
    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8>;
    fn write(&mut self, block_offset: usize, data: &[u8]);
    fn image_fn(&self) -> Option<&Path>;

    /// Device-specific commands
    fn specific_cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult>;

    /// Returns the drives total capacity in bytes
    fn capacity(&self) -> Option<usize> {
        Some(self.blocksize()? * self.blocks()?)
    }

    fn cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        match cmd[0] {
            0x00 => {
                // UNIT READY
                self.unit_ready()
            }
            0x03 => {
                // REQUEST SENSE
                let (key, asc) = self.req_sense();
                let mut result = vec![0; 14];
                result[2] = key & 0x0F;
                result[12..14].copy_from_slice(&asc.to_be_bytes());
                self.set_cc(0, 0);
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x04 => {
                // FORMAT UNIT(6)
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            0x08 => {
                // READ(6)
                let Some(blocks) = self.blocks() else {
                    log::warn!("READ(6) command to non-block device");
                    return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
                };
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };

                if blocknum + blockcnt > blocks {
                    log::error!("Reading beyond disk");
                    self.set_cc(5, 0x2100);
                    Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
                } else {
                    Ok(ScsiCmdResult::DataIn(self.read(blocknum, blockcnt)))
                }
            }
            0x0A => {
                // WRITE(6)
                let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
                    log::warn!("WRITE(6) command to non-block device");
                    return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
                };
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };

                if let Some(data) = outdata {
                    if blocknum + blockcnt > blocks {
                        log::error!("Writing beyond disk");
                        self.set_cc(5, 0x2100);
                        Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
                    } else {
                        self.write(blocknum, data);
                        Ok(ScsiCmdResult::Status(STATUS_GOOD))
                    }
                } else {
                    Ok(ScsiCmdResult::DataOut(blockcnt * blocksize))
                }
            }
            0x12 => {
                // INQUIRY
                self.inquiry(cmd)
            }
            0x15 => {
                // MODE SELECT(6)
                Ok(ScsiCmdResult::DataOut(cmd[4] as usize))
            }
            0x1A => {
                // MODE SENSE(6)
                let page = cmd[2] & 0x3F;
                let Some(pagedata) = self.mode_sense_page(page) else {
                    log::warn!("MODE SENSE(6): unsupported page {:02X}", page);
                    self.set_cc(5, 0x2400);
                    return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
                };
                let mut result = vec![0; 4];
                result[0] = (pagedata.len() + 3) as u8;
                result.extend_from_slice(&pagedata);
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x25 => {
                // READ CAPACITY(10)
                let mut result = vec![0; 8];
                let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
                    log::warn!("READ CAPACITY(10) command to non-block device");
                    return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
                };

                result[0..4].copy_from_slice(&((blocks as u32) - 1).to_be_bytes());
                result[4..8].copy_from_slice(&(blocksize as u32).to_be_bytes());
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x28 => {
                // READ(10)
                let Some(blocks) = self.blocks() else {
                    log::warn!("READ(10) command to non-block device");
                    return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
                };
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;

                if blocknum + blockcnt > blocks {
                    log::error!("Reading beyond disk");
                    self.set_cc(5, 0x2100);
                    Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
                } else {
                    Ok(ScsiCmdResult::DataIn(self.read(blocknum, blockcnt)))
                }
            }
            0x2A => {
                // WRITE(10)
                let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
                    log::warn!("WRITE(10) command to non-block device");
                    return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
                };
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;

                if let Some(data) = outdata {
                    if blocknum + blockcnt > blocks {
                        log::error!("Writing beyond disk");
                        self.set_cc(5, 0x2100);
                        Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
                    } else {
                        self.write(blocknum, data);
                        Ok(ScsiCmdResult::Status(STATUS_GOOD))
                    }
                } else {
                    Ok(ScsiCmdResult::DataOut(blockcnt * blocksize))
                }
            }
            0x2F => {
                // VERIFY(10)
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            0x3C => {
                // READ BUFFER(10)
                let result = vec![0; 4];
                // 0 reserved (0)
                // 1-3 buffer length (0)
                Ok(ScsiCmdResult::DataIn(result))
            }
            _ => self.specific_cmd(cmd, outdata),
        }
    }
}
