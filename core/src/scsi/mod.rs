//! SCSI bus, host adapter and target emulation

pub mod bus;
pub mod controller;
pub mod disk;
pub mod dma;
pub mod subsystem;
pub mod target;

use serde::{Deserialize, Serialize};

pub const STATUS_GOOD: u8 = 0;
pub const STATUS_CHECK_CONDITION: u8 = 2;

/// COMMAND COMPLETE message byte
pub const MSG_CMD_COMPLETE: u8 = 0x00;
/// IDENTIFY message base (bit 7 set)
pub const MSG_IDENTIFY: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
/// SCSI bus phases
pub enum ScsiBusPhase {
    Free,
    Arbitration,
    Selection,
    Reselection,
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MessageIn,
    MessageOut,
    /// RST asserted somewhere on the bus
    Reset,
}

/// Control line bit masks. The bus-wide value of each line is the wired-OR of
/// every participant's contribution.
pub const CTRL_REQ: u16 = 1 << 0;
pub const CTRL_ACK: u16 = 1 << 1;
pub const CTRL_BSY: u16 = 1 << 2;
pub const CTRL_SEL: u16 = 1 << 3;
pub const CTRL_ATN: u16 = 1 << 4;
pub const CTRL_MSG: u16 = 1 << 5;
pub const CTRL_CD: u16 = 1 << 6;
pub const CTRL_IO: u16 = 1 << 7;
pub const CTRL_RST: u16 = 1 << 8;

pub const CTRL_ALL: u16 = CTRL_REQ
    | CTRL_ACK
    | CTRL_BSY
    | CTRL_SEL
    | CTRL_ATN
    | CTRL_MSG
    | CTRL_CD
    | CTRL_IO
    | CTRL_RST;

/// The information-transfer phases are encoded on the MSG/CD/IO lines; these
/// are the lines a participant asserts (beyond the REQ/ACK handshake) when it
/// drives the bus into the phase.
pub const fn phase_ctrl_lines(phase: ScsiBusPhase) -> u16 {
    match phase {
        ScsiBusPhase::Command => CTRL_CD,
        ScsiBusPhase::DataIn => CTRL_IO,
        ScsiBusPhase::DataOut => 0,
        ScsiBusPhase::Status => CTRL_CD | CTRL_IO,
        ScsiBusPhase::MessageOut => CTRL_CD | CTRL_MSG,
        ScsiBusPhase::MessageIn => CTRL_CD | CTRL_MSG | CTRL_IO,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Notification fanned out to bus participants other than the originator
pub enum ScsiMsg {
    BusPhaseChange(ScsiBusPhase),
    /// Target responded to selection; dedicated message (instead of a generic
    /// phase change) so the initiator can cancel its selection timeout
    /// precisely.
    ConfirmSel,
}

/// Result of a command executed by a target
pub enum ScsiCmdResult {
    /// Immediately turn to the Status phase
    Status(u8),
    /// Returns data to the initiator
    DataIn(Vec<u8>),
    /// Expects data written to target
    DataOut(usize),
}

pub const fn scsi_cmd_len(cmdnum: u8) -> Option<usize> {
    match cmdnum {
        // UNIT READY
        0x00
        // REQUEST SENSE
        | 0x03
        // FORMAT UNIT
        | 0x04
        // READ(6)
        | 0x08
        // WRITE(6)
        | 0x0A
        // INQUIRY
        | 0x12
        // MODE SELECT(6)
        | 0x15
        // MODE SENSE(6)
        | 0x1A
        => Some(6),
        // READ CAPACITY(10)
        0x25
        // READ(10)
        | 0x28
        // WRITE(10)
        | 0x2A
        // VERIFY(10)
        | 0x2F
        // READ BUFFER(10)
        | 0x3C
        => Some(10),
        _ => {
            None
        }
    }
}
