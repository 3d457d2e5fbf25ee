//! 53C94-compatible SCSI host adapter controller.
//!
//! One parameterized model covers both shipped chip revisions
//! ([`ChipVariant`]); they share the register file, FIFOs and sequencer and
//! differ only in chip ID and one interrupt detail on message acceptance.
//!
//! The chip executes SCSI commands as a sequence of bus-mediated steps driven
//! by the sequencer state machine. A step either re-enters the sequencer
//! synchronously, arms a one-shot timer that re-enters it later, or waits for
//! a bus notification (phase change, selection confirmation). Composite
//! select commands are table-driven: a static [`SeqDesc`] list maps each
//! expected bus phase to the next sequencer state and the interrupt to post.

use arrayvec::ArrayVec;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::irq::InterruptSink;
use crate::scsi::bus::ScsiBus;
use crate::scsi::dma::DmaChannel;
use crate::scsi::{ScsiBusPhase, ScsiMsg, CTRL_ATN, CTRL_BSY, CTRL_REQ, CTRL_RST, CTRL_SEL};
use crate::timer::{Fired, TimerId, TimerScheduler, TimerTask};

const SCSI_TRACE: bool = false;

pub const CMD_FIFO_SIZE: usize = 2;
pub const DATA_FIFO_SIZE: usize = 16;

/// Bus clear + bus settle before (re)trying arbitration
const BUS_FREE_DELAY_NS: u64 = 800;
/// Arbitration delay before examining the data lines
const ARB_DELAY_NS: u64 = 2_400;
/// Descriptor-boundary pacing between real-DMA chunks
const DMA_CHUNK_DELAY_NS: u64 = 10_000;
/// RST assertion width for a bus reset command
const RST_RELEASE_DELAY_NS: u64 = 25_000;
/// One selection timeout register step (8192 clocks at the nominal 25 MHz)
const SEL_TIMEOUT_STEP_NS: u64 = 1_638_400;

// Status register bits
pub const STAT_IO: u8 = 0x01;
pub const STAT_CD: u8 = 0x02;
pub const STAT_MSG: u8 = 0x04;
pub const STAT_GPC: u8 = 0x08;
pub const STAT_TC: u8 = 0x10;
pub const STAT_PE: u8 = 0x20;
pub const STAT_GE: u8 = 0x40;
pub const STAT_INT: u8 = 0x80;

// Interrupt status register bits
pub const INT_SELECTED: u8 = 0x01;
pub const INT_SELECTED_ATN: u8 = 0x02;
pub const INT_RESELECTED: u8 = 0x04;
pub const INT_FC: u8 = 0x08;
pub const INT_BUS_SERVICE: u8 = 0x10;
pub const INT_DISCONNECT: u8 = 0x20;
pub const INT_ILL_CMD: u8 = 0x40;
pub const INT_SCSI_RST: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Shipped revisions of the chip
pub enum ChipVariant {
    Sc53C94,
    Sc53CF94,
}

impl ChipVariant {
    pub const fn chip_id(self) -> u8 {
        match self {
            Self::Sc53C94 => 0x12,
            Self::Sc53CF94 => 0x92,
        }
    }
}

#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive)]
/// Register file, read accesses
enum RegRd {
    XferCntLo = 0x0,
    XferCntMid = 0x1,
    Fifo = 0x2,
    Command = 0x3,
    Status = 0x4,
    IntStatus = 0x5,
    SeqStep = 0x6,
    FifoFlags = 0x7,
    Config1 = 0x8,
    ClockFactor = 0x9,
    Test = 0xA,
    Config2 = 0xB,
    Config3 = 0xC,
    Config4 = 0xD,
    XferCntHi = 0xE,
    Reserved = 0xF,
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive)]
/// Register file, write accesses
enum RegWr {
    XferCntLo = 0x0,
    XferCntMid = 0x1,
    Fifo = 0x2,
    Command = 0x3,
    DestBusId = 0x4,
    SelTimeout = 0x5,
    SyncPeriod = 0x6,
    SyncOffset = 0x7,
    Config1 = 0x8,
    ClockFactor = 0x9,
    Test = 0xA,
    Config2 = 0xB,
    Config3 = 0xC,
    Config4 = 0xD,
    XferCntHi = 0xE,
    DataAlign = 0xF,
}

bitfield! {
    /// Configuration register 1
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RegConfig1(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub bus_id: u8 @ 0..=2,
        pub chip_test: bool @ 3,
        pub parity_enable: bool @ 4,
        pub parity_test: bool @ 5,
        /// Suppress the interrupt on a SCSI bus reset
        pub rst_int_disable: bool @ 6,
        pub slow_cable: bool @ 7,
    }
}

bitfield! {
    /// Configuration register 2
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RegConfig2(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub dma_parity_enable: bool @ 0,
        pub parity_abort: bool @ 1,
        pub target_bad_parity_abort: bool @ 2,
        pub scsi2: bool @ 3,
        pub drq_hiz: bool @ 4,
        pub byte_order: bool @ 5,
        /// Extended features: 24-bit transfer counter, chip ID readout
        pub features: bool @ 6,
        pub reserve_fifo_byte: bool @ 7,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
/// Command set, opcode in the low 7 bits (bit 7 = DMA)
enum SeqCmd {
    Nop = 0x00,
    ClearFifo = 0x01,
    ResetDevice = 0x02,
    ResetBus = 0x03,
    DmaStop = 0x04,
    Transfer = 0x10,
    InitCmdComplete = 0x11,
    MsgAccepted = 0x12,
    TransferPad = 0x13,
    SetAtn = 0x14,
    ResetAtn = 0x15,
    Select = 0x41,
    SelectAtn = 0x42,
    SelectAtnStop = 0x43,
    EnableSel = 0x44,
    DisableSel = 0x45,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
/// Sequencer states
enum SeqState {
    Idle,
    BusFree,
    ArbBegin,
    ArbEnd,
    SelBegin,
    SelEnd,
    SendMsg,
    /// Send one message byte, then stop with ATN still asserted
    SendMsgEx,
    SendCmd,
    CmdComplete,
    XferBegin,
    XferEnd,
    SendData,
    RcvData,
    RcvStatus,
    RcvMessage,
}

/// One step of a composite command: when the bus reaches `expect_phase`, the
/// sequencer continues in `next_state` and `int_status` is posted. A phase
/// that does not match short-circuits the sequence with the same interrupt.
#[derive(Debug, Clone, Copy)]
struct SeqDesc {
    expect_phase: ScsiBusPhase,
    next_state: SeqState,
    int_status: u8,
}

static SEQ_SELECT: &[SeqDesc] = &[
    SeqDesc {
        expect_phase: ScsiBusPhase::Command,
        next_state: SeqState::SendCmd,
        int_status: INT_BUS_SERVICE,
    },
    SeqDesc {
        expect_phase: ScsiBusPhase::Status,
        next_state: SeqState::CmdComplete,
        int_status: INT_BUS_SERVICE | INT_FC,
    },
];

static SEQ_SELECT_ATN: &[SeqDesc] = &[
    SeqDesc {
        expect_phase: ScsiBusPhase::MessageOut,
        next_state: SeqState::SendMsg,
        int_status: INT_BUS_SERVICE,
    },
    SeqDesc {
        expect_phase: ScsiBusPhase::Command,
        next_state: SeqState::SendCmd,
        int_status: INT_BUS_SERVICE,
    },
    SeqDesc {
        expect_phase: ScsiBusPhase::Status,
        next_state: SeqState::CmdComplete,
        int_status: INT_BUS_SERVICE | INT_FC,
    },
];

static SEQ_SELECT_ATN_STOP: &[SeqDesc] = &[SeqDesc {
    expect_phase: ScsiBusPhase::MessageOut,
    next_state: SeqState::SendMsgEx,
    int_status: INT_BUS_SERVICE | INT_FC,
}];

/// 53C94-compatible SCSI controller
pub struct ScsiController {
    variant: ChipVariant,
    my_bus_id: u8,
    irq_id: u8,

    int_sink: Box<dyn InterruptSink>,
    irq_level: bool,

    // Register file
    status: u8,
    int_status: u8,
    seq_step: u8,
    last_cmd: u8,
    dest_bus_id: u8,
    sel_timeout_reg: u8,
    sync_period: u8,
    sync_offset: u8,
    config1: RegConfig1,
    config2: RegConfig2,
    config3: u8,
    config4: u8,
    clock_factor: u8,

    /// Shadow written through the set-transfer-count registers
    set_xfer_cnt: u32,
    /// Live counter, latched from the shadow on DMA commands
    xfer_cnt: u32,

    cmd_fifo: ArrayVec<u8, CMD_FIFO_SIZE>,
    data_fifo: ArrayVec<u8, DATA_FIFO_SIZE>,

    /// Set by ResetDevice; only a NOP command clears it
    on_reset: bool,

    // Sequencer
    cur_state: SeqState,
    next_state: SeqState,
    seq_desc: Option<&'static [SeqDesc]>,
    seq_desc_idx: usize,

    /// DMA flag of the command currently executing
    cur_cmd_dma: bool,
    /// Assert ATN during the upcoming selection
    sel_atn: bool,

    seq_timer: Option<TimerId>,
    sel_timer: Option<TimerId>,
    dma_timer: Option<TimerId>,
    rst_timer: Option<TimerId>,

    dma: Option<Box<dyn DmaChannel>>,
    dma_active: bool,
    dma_dir_in: bool,
}

impl ScsiController {
    pub fn new(
        variant: ChipVariant,
        my_bus_id: u8,
        irq_id: u8,
        int_sink: Box<dyn InterruptSink>,
    ) -> Self {
        Self {
            variant,
            my_bus_id,
            irq_id,
            int_sink,
            irq_level: false,
            status: 0,
            int_status: 0,
            seq_step: 0,
            last_cmd: 0,
            dest_bus_id: 0,
            sel_timeout_reg: 0,
            sync_period: 0,
            sync_offset: 0,
            config1: RegConfig1(my_bus_id & 7),
            config2: RegConfig2(0),
            config3: 0,
            config4: 0,
            clock_factor: 0,
            set_xfer_cnt: 0,
            xfer_cnt: 0,
            cmd_fifo: ArrayVec::new(),
            data_fifo: ArrayVec::new(),
            on_reset: false,
            cur_state: SeqState::Idle,
            next_state: SeqState::Idle,
            seq_desc: None,
            seq_desc_idx: 0,
            cur_cmd_dma: false,
            sel_atn: false,
            seq_timer: None,
            sel_timer: None,
            dma_timer: None,
            rst_timer: None,
            dma: None,
            dma_active: false,
            dma_dir_in: false,
        }
    }

    pub fn my_bus_id(&self) -> u8 {
        self.my_bus_id
    }

    pub fn get_irq(&self) -> bool {
        self.irq_level
    }

    pub fn set_dma_channel(&mut self, chan: Option<Box<dyn DmaChannel>>) {
        self.dma = chan;
    }

    pub fn dma_channel_mut(&mut self) -> Option<&mut Box<dyn DmaChannel>> {
        self.dma.as_mut()
    }

    /// Whether the chip wants a pseudo-DMA port access right now
    pub fn dma_req(&self) -> bool {
        match self.cur_state {
            SeqState::RcvData | SeqState::RcvStatus | SeqState::RcvMessage => {
                !self.data_fifo.is_empty()
            }
            SeqState::SendData | SeqState::SendCmd | SeqState::SendMsg => {
                self.data_fifo.len() < DATA_FIFO_SIZE
            }
            _ => false,
        }
    }

    /// Recomputes the interrupt line and reports edges to the sink
    fn update_irq(&mut self) {
        let level = self.int_status != 0;
        if level {
            self.status |= STAT_INT;
        } else {
            self.status &= !STAT_INT;
        }
        if level != self.irq_level {
            self.irq_level = level;
            self.int_sink.ack_int(self.irq_id, level);
        }
    }

    fn raise_int(&mut self, bits: u8) {
        self.int_status |= bits;
        self.update_irq();
    }

    fn fifo_push(&mut self, val: u8) {
        if self.data_fifo.try_push(val).is_err() {
            log::error!("SCSI data FIFO overflow, byte {:02X} dropped", val);
            self.status |= STAT_GE;
        }
    }

    fn fifo_pop(&mut self) -> u8 {
        if self.data_fifo.is_empty() {
            log::error!("SCSI data FIFO underflow");
            self.status |= STAT_GE;
            0
        } else {
            self.data_fifo.remove(0)
        }
    }

    /// Status register phase bits, live from the bus lines
    fn phase_bits(bus: &ScsiBus) -> u8 {
        let lines = bus.ctrl_lines();
        let mut bits = 0;
        if lines & crate::scsi::CTRL_IO != 0 {
            bits |= STAT_IO;
        }
        if lines & crate::scsi::CTRL_CD != 0 {
            bits |= STAT_CD;
        }
        if lines & crate::scsi::CTRL_MSG != 0 {
            bits |= STAT_MSG;
        }
        bits
    }

    pub fn read_reg(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler, offset: u8) -> u8 {
        let reg = RegRd::from_u8(offset & 0xF).unwrap();

        let val = match reg {
            RegRd::XferCntLo => (self.xfer_cnt & 0xFF) as u8,
            RegRd::XferCntMid => ((self.xfer_cnt >> 8) & 0xFF) as u8,
            RegRd::Fifo => {
                let v = self.fifo_pop();
                self.pump_transfer(bus, timers);
                v
            }
            RegRd::Command => self.last_cmd,
            RegRd::Status => (self.status & !0x07) | Self::phase_bits(bus),
            RegRd::IntStatus => {
                // Read-and-clear: the pre-read value is returned, the
                // interrupt condition drops and a fixed set of sticky status
                // bits goes with it.
                let v = self.int_status;
                self.int_status = 0;
                self.status &= !(STAT_GE | STAT_PE | STAT_GPC);
                self.update_irq();
                v
            }
            RegRd::SeqStep => self.seq_step,
            RegRd::FifoFlags => (self.data_fifo.len() as u8 & 0x1F) | (self.seq_step << 5),
            RegRd::Config1 => self.config1.0,
            RegRd::ClockFactor | RegRd::Test | RegRd::Reserved => 0,
            RegRd::Config2 => self.config2.0,
            RegRd::Config3 => self.config3,
            RegRd::Config4 => self.config4,
            RegRd::XferCntHi => {
                if self.config2.features() {
                    // Undocumented: with extended features on, this offset
                    // identifies the chip revision. Firmware uses it to probe
                    // which part it is talking to.
                    self.variant.chip_id()
                } else {
                    ((self.xfer_cnt >> 16) & 0xFF) as u8
                }
            }
        };

        if SCSI_TRACE && reg != RegRd::Status {
            log::debug!("SCSI read: reg = {:?}, value = {:02X}", reg, val);
        }
        val
    }

    pub fn write_reg(
        &mut self,
        bus: &mut ScsiBus,
        timers: &mut TimerScheduler,
        offset: u8,
        val: u8,
    ) {
        let reg = RegWr::from_u8(offset & 0xF).unwrap();

        if SCSI_TRACE {
            log::debug!("SCSI write: reg = {:?}, value = {:02X}", reg, val);
        }

        match reg {
            RegWr::XferCntLo => {
                self.set_xfer_cnt = (self.set_xfer_cnt & !0xFF) | u32::from(val);
            }
            RegWr::XferCntMid => {
                self.set_xfer_cnt = (self.set_xfer_cnt & !0xFF00) | (u32::from(val) << 8);
            }
            RegWr::XferCntHi => {
                self.set_xfer_cnt = (self.set_xfer_cnt & !0xFF_0000) | (u32::from(val) << 16);
            }
            RegWr::Fifo => {
                self.fifo_push(val);
                self.pump_transfer(bus, timers);
            }
            RegWr::Command => self.update_command_reg(bus, timers, val),
            RegWr::DestBusId => self.dest_bus_id = val & 7,
            RegWr::SelTimeout => self.sel_timeout_reg = val,
            RegWr::SyncPeriod => self.sync_period = val,
            RegWr::SyncOffset => self.sync_offset = val,
            RegWr::Config1 => {
                if val & 7 != self.my_bus_id {
                    // The surrounding machine model is mis-wired; nothing
                    // sensible can come of continuing.
                    panic!(
                        "SCSI config: bus ID {} written to adapter wired as ID {}",
                        val & 7,
                        self.my_bus_id
                    );
                }
                self.config1.0 = val;
            }
            RegWr::ClockFactor => self.clock_factor = val,
            RegWr::Test => (),
            RegWr::Config2 => self.config2.0 = val,
            RegWr::Config3 => self.config3 = val,
            RegWr::Config4 => self.config4 = val,
            RegWr::DataAlign => (),
        }
    }

    fn update_command_reg(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler, val: u8) {
        let opcode = val & 0x7F;

        if self.on_reset {
            if opcode == SeqCmd::Nop as u8 {
                self.on_reset = false;
            } else {
                log::warn!(
                    "SCSI command {:02X} rejected: chip blocked until NOP after reset",
                    val
                );
                return;
            }
        }

        self.last_cmd = val;

        // Reset/stop commands bypass the queue entirely
        match SeqCmd::from_u8(opcode) {
            Some(SeqCmd::ResetDevice) => {
                self.cmd_fifo.clear();
                self.reset_device(bus, timers);
                return;
            }
            Some(SeqCmd::ResetBus) => {
                self.cmd_fifo.clear();
                self.reset_bus(bus, timers);
                return;
            }
            Some(SeqCmd::DmaStop) => {
                self.cmd_fifo.clear();
                self.dma_stop(timers);
                return;
            }
            _ => (),
        }

        if self.cmd_fifo.try_push(val).is_err() {
            log::error!("SCSI command FIFO overwritten while full ({:02X})", val);
            self.status |= STAT_GE;
            self.raise_int(INT_ILL_CMD);
            return;
        }
        if self.cmd_fifo.len() == 1 {
            self.exec_command(bus, timers);
        }
    }

    fn exec_command(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        let Some(&raw) = self.cmd_fifo.first() else {
            return;
        };
        self.cur_cmd_dma = raw & 0x80 != 0;

        if self.cur_cmd_dma {
            // Latch the transfer counter; a zero 16-bit count means 65536
            self.xfer_cnt = if self.config2.features() {
                self.set_xfer_cnt & 0xFF_FFFF
            } else {
                match self.set_xfer_cnt & 0xFFFF {
                    0 => 0x1_0000,
                    n => n,
                }
            };
            self.status &= !STAT_TC;
        }
        self.seq_step = 0;

        match SeqCmd::from_u8(raw & 0x7F) {
            Some(SeqCmd::Nop) => self.exec_next_command(bus, timers),
            Some(SeqCmd::ClearFifo) => {
                self.data_fifo.clear();
                self.exec_next_command(bus, timers);
            }
            Some(SeqCmd::Transfer | SeqCmd::TransferPad) => {
                self.cur_state = SeqState::XferBegin;
                self.sequencer(bus, timers);
            }
            Some(SeqCmd::InitCmdComplete) => {
                self.cur_state = SeqState::RcvStatus;
                self.sequencer(bus, timers);
            }
            Some(SeqCmd::MsgAccepted) => {
                // The accepted message ends the session; the target proceeds
                // to bus free.
                bus.target_next_step();
                let ints = match self.variant {
                    ChipVariant::Sc53C94 => INT_DISCONNECT,
                    ChipVariant::Sc53CF94 => INT_DISCONNECT | INT_FC,
                };
                self.raise_int(ints);
                self.cur_state = SeqState::Idle;
                self.exec_next_command(bus, timers);
            }
            Some(SeqCmd::SetAtn) => {
                bus.assert_ctrl_line(self.my_bus_id, CTRL_ATN);
                self.exec_next_command(bus, timers);
            }
            Some(SeqCmd::ResetAtn) => {
                bus.release_ctrl_line(self.my_bus_id, CTRL_ATN);
                self.exec_next_command(bus, timers);
            }
            Some(SeqCmd::Select) => self.start_selection(bus, timers, SEQ_SELECT, false),
            Some(SeqCmd::SelectAtn) => self.start_selection(bus, timers, SEQ_SELECT_ATN, true),
            Some(SeqCmd::SelectAtnStop) => {
                self.start_selection(bus, timers, SEQ_SELECT_ATN_STOP, true);
            }
            Some(SeqCmd::EnableSel | SeqCmd::DisableSel) => {
                // Target mode responding is not implemented
                self.exec_next_command(bus, timers);
            }
            Some(SeqCmd::ResetDevice | SeqCmd::ResetBus | SeqCmd::DmaStop) => {
                unreachable!("immediate command in FIFO")
            }
            None => {
                log::warn!("Invalid SCSI controller command {:02X}", raw);
                self.raise_int(INT_ILL_CMD);
                self.exec_next_command(bus, timers);
            }
        }
    }

    /// Retires the running command and starts the queued one, if any
    fn exec_next_command(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        if !self.cmd_fifo.is_empty() {
            self.cmd_fifo.remove(0);
        }
        if !self.cmd_fifo.is_empty() {
            self.exec_command(bus, timers);
        }
    }

    fn start_selection(
        &mut self,
        bus: &mut ScsiBus,
        timers: &mut TimerScheduler,
        desc: &'static [SeqDesc],
        atn: bool,
    ) {
        self.seq_desc = Some(desc);
        self.seq_desc_idx = 0;
        self.sel_atn = atn;
        self.cur_state = SeqState::BusFree;
        self.sequencer(bus, timers);
    }

    fn reset_device(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        self.cancel_timers(timers);
        if let Some(t) = self.rst_timer.take() {
            // Don't leave RST latched on the bus forever
            timers.cancel(t);
            bus.release_ctrl_line(self.my_bus_id, CTRL_RST);
        }

        self.data_fifo.clear();
        self.cmd_fifo.clear();
        self.set_xfer_cnt = 0;
        self.xfer_cnt = 0;
        self.status = 0;
        self.int_status = 0;
        self.seq_step = 0;
        self.dest_bus_id = 0;
        self.sel_timeout_reg = 0;
        self.sync_period = 0;
        self.sync_offset = 0;
        self.config1 = RegConfig1(self.my_bus_id & 7);
        self.config2 = RegConfig2(0);
        self.config3 = 0;
        self.config4 = 0;
        self.cur_state = SeqState::Idle;
        self.next_state = SeqState::Idle;
        self.seq_desc = None;
        self.dma_active = false;
        self.on_reset = true;
        self.update_irq();
        bus.disconnect(self.my_bus_id);
    }

    fn reset_bus(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        self.cancel_timers(timers);
        self.cur_state = SeqState::Idle;
        self.seq_desc = None;
        self.dma_active = false;

        bus.assert_ctrl_line(self.my_bus_id, CTRL_RST);
        if let Some(t) = self.rst_timer.take() {
            timers.cancel(t);
        }
        self.rst_timer = Some(timers.add_oneshot(RST_RELEASE_DELAY_NS, TimerTask::RstRelease));

        if !self.config1.rst_int_disable() {
            self.raise_int(INT_SCSI_RST);
        }
    }

    fn dma_stop(&mut self, timers: &mut TimerScheduler) {
        if let Some(t) = self.dma_timer.take() {
            timers.cancel(t);
        }
        self.dma_active = false;
    }

    fn cancel_timers(&mut self, timers: &mut TimerScheduler) {
        for t in [
            self.seq_timer.take(),
            self.sel_timer.take(),
            self.dma_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timers.cancel(t);
        }
    }

    /// Arms the sequencer continuation timer, replacing any pending one
    fn seq_arm(&mut self, timers: &mut TimerScheduler, delay_ns: u64, next: SeqState) {
        if let Some(t) = self.seq_timer.take() {
            timers.cancel(t);
        }
        self.next_state = next;
        self.seq_timer = Some(timers.add_oneshot(delay_ns, TimerTask::SeqStep));
    }

    fn sel_timeout_ns(&self) -> u64 {
        u64::from(self.sel_timeout_reg.max(1)) * SEL_TIMEOUT_STEP_NS
    }

    /// Timer continuations routed back from the subsystem. Stale firings
    /// (handle no longer stored) are dropped.
    pub fn timer_fired(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler, fired: Fired) {
        match fired.task {
            TimerTask::SeqStep if self.seq_timer == Some(fired.id) => {
                self.seq_timer = None;
                self.cur_state = self.next_state;
                self.sequencer(bus, timers);
            }
            TimerTask::SelTimeout if self.sel_timer == Some(fired.id) => {
                self.sel_timer = None;
                self.sel_timeout_expired(bus, timers);
            }
            TimerTask::DmaChunk if self.dma_timer == Some(fired.id) => {
                self.dma_timer = None;
                self.dma_chunk(bus, timers);
            }
            TimerTask::RstRelease if self.rst_timer == Some(fired.id) => {
                self.rst_timer = None;
                bus.release_ctrl_line(self.my_bus_id, CTRL_RST);
            }
            _ => {
                if SCSI_TRACE {
                    log::debug!("Stale SCSI timer: {:?}", fired);
                }
            }
        }
    }

    fn sel_timeout_expired(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        if self.cur_state != SeqState::SelEnd {
            return;
        }
        log::debug!("SCSI selection of ID {} timed out", self.dest_bus_id);
        self.seq_step = 0;
        self.seq_desc = None;
        self.cur_state = SeqState::Idle;
        bus.disconnect(self.my_bus_id);
        self.raise_int(INT_DISCONNECT);
        self.exec_next_command(bus, timers);
    }

    /// Bus notification handler: selection confirmation, descriptor-driven
    /// composite command stepping, and transfer-phase supervision.
    pub fn notify(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler, msg: ScsiMsg) {
        match msg {
            ScsiMsg::ConfirmSel => {
                if self.cur_state != SeqState::SelEnd {
                    return;
                }
                if let Some(t) = self.sel_timer.take() {
                    timers.cancel(t);
                }
                if bus.end_selection(self.my_bus_id, self.dest_bus_id) {
                    // The target holds BSY from here on; the initiator lets
                    // go of the selection lines and the descriptor walk picks
                    // up the target's phase changes.
                    bus.release_ctrl_line(self.my_bus_id, CTRL_SEL | CTRL_BSY);
                } else {
                    log::warn!("SCSI: unexpected target confirmed selection");
                }
            }
            ScsiMsg::BusPhaseChange(phase) => self.phase_changed(bus, timers, phase),
        }
    }

    fn phase_changed(
        &mut self,
        bus: &mut ScsiBus,
        timers: &mut TimerScheduler,
        phase: ScsiBusPhase,
    ) {
        if phase == ScsiBusPhase::Reset {
            // Somebody else pulled RST
            self.cancel_timers(timers);
            self.cur_state = SeqState::Idle;
            self.seq_desc = None;
            self.cmd_fifo.clear();
            self.data_fifo.clear();
            self.dma_active = false;
            if !self.config1.rst_int_disable() {
                self.raise_int(INT_SCSI_RST);
            }
            return;
        }

        let info_phase = matches!(
            phase,
            ScsiBusPhase::Command
                | ScsiBusPhase::DataIn
                | ScsiBusPhase::DataOut
                | ScsiBusPhase::Status
                | ScsiBusPhase::MessageIn
                | ScsiBusPhase::MessageOut
        );

        if let Some(desc) = self.seq_desc {
            if !info_phase {
                return;
            }
            let Some(&d) = desc.get(self.seq_desc_idx) else {
                self.seq_desc = None;
                return;
            };
            if d.expect_phase == phase {
                self.seq_desc_idx += 1;
                self.seq_step += 1;
                self.raise_int(d.int_status);
                if d.next_state == SeqState::CmdComplete {
                    self.seq_desc = None;
                    self.cur_state = SeqState::Idle;
                    self.exec_next_command(bus, timers);
                } else {
                    self.seq_arm(timers, 0, d.next_state);
                }
            } else {
                // The target went off-script; the sequence ends here and the
                // posted interrupt tells firmware how far it got.
                if SCSI_TRACE {
                    log::debug!(
                        "SCSI sequence short-circuit: expected {:?}, got {:?}",
                        d.expect_phase,
                        phase
                    );
                }
                self.raise_int(d.int_status);
                self.seq_desc = None;
                self.cur_state = SeqState::Idle;
                self.exec_next_command(bus, timers);
            }
            return;
        }

        if info_phase || phase == ScsiBusPhase::Free {
            match self.cur_state {
                SeqState::RcvData | SeqState::SendData => {
                    self.data_phase_ended(bus, timers, phase);
                }
                _ => (),
            }
        }
    }

    /// The bus left the data phase while a transfer was running: either the
    /// transfer ran its course, or the target violated protocol.
    fn data_phase_ended(
        &mut self,
        bus: &mut ScsiBus,
        timers: &mut TimerScheduler,
        _new_phase: ScsiBusPhase,
    ) {
        if !self.cur_cmd_dma {
            // Untallied transfer; the phase change is its natural end
            self.cur_state = SeqState::XferEnd;
            self.sequencer(bus, timers);
            return;
        }
        if self.xfer_cnt == 0 {
            // Terminal count already handled the completion
            return;
        }
        if self.cur_state == SeqState::RcvData
            && self.xfer_cnt as usize <= self.data_fifo.len()
        {
            // Remaining bytes sit in the FIFO; the port drain finishes the
            // transfer.
            return;
        }
        log::error!(
            "SCSI protocol violation: bus phase changed with {} bytes outstanding",
            self.xfer_cnt
        );
        self.cmd_fifo.clear();
        self.cur_state = SeqState::Idle;
        self.raise_int(INT_BUS_SERVICE);
    }

    /// Re-enters the sequencer when a FIFO port access may have unblocked a
    /// running transfer.
    fn pump_transfer(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        match self.cur_state {
            SeqState::SendMsg
            | SeqState::SendMsgEx
            | SeqState::SendCmd
            | SeqState::SendData
            | SeqState::RcvData => self.sequencer(bus, timers),
            _ => (),
        }
    }

    /// Executes one state's worth of work. States either recurse
    /// synchronously, arm the continuation timer, or return and wait for a
    /// bus notification.
    fn sequencer(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        if SCSI_TRACE {
            let name: &'static str = self.cur_state.into();
            log::debug!("SCSI sequencer: {} (bus {:?})", name, bus.cur_phase());
        }

        match self.cur_state {
            SeqState::Idle => (),

            SeqState::BusFree => {
                if bus.cur_phase() == ScsiBusPhase::Free {
                    self.cur_state = SeqState::ArbBegin;
                    self.sequencer(bus, timers);
                } else {
                    // Bus still settling; try again shortly
                    self.seq_arm(timers, BUS_FREE_DELAY_NS, SeqState::BusFree);
                }
            }

            SeqState::ArbBegin => {
                if bus.begin_arbitration(self.my_bus_id) {
                    self.seq_arm(timers, ARB_DELAY_NS, SeqState::ArbEnd);
                } else {
                    // Somebody claimed the bus between our check and now
                    bus.release_ctrl_line(self.my_bus_id, CTRL_BSY);
                    self.seq_arm(timers, BUS_FREE_DELAY_NS, SeqState::BusFree);
                }
            }

            SeqState::ArbEnd => {
                if bus.end_arbitration(self.my_bus_id) {
                    self.cur_state = SeqState::SelBegin;
                    self.sequencer(bus, timers);
                } else {
                    // Lost arbitration; retry after bus clear
                    bus.release_ctrl_line(self.my_bus_id, CTRL_BSY);
                    self.seq_arm(timers, BUS_FREE_DELAY_NS, SeqState::BusFree);
                }
            }

            SeqState::SelBegin => {
                if bus.begin_selection(self.my_bus_id, self.dest_bus_id, self.sel_atn) {
                    self.cur_state = SeqState::SelEnd;
                    if let Some(t) = self.sel_timer.take() {
                        timers.cancel(t);
                    }
                    self.sel_timer =
                        Some(timers.add_oneshot(self.sel_timeout_ns(), TimerTask::SelTimeout));
                } else {
                    bus.release_ctrl_line(self.my_bus_id, CTRL_BSY);
                    self.seq_arm(timers, BUS_FREE_DELAY_NS, SeqState::BusFree);
                }
            }

            // Passive: resolved by ConfirmSel or the selection timeout
            SeqState::SelEnd => (),

            SeqState::SendMsg | SeqState::SendMsgEx => {
                if self.cur_cmd_dma && self.data_fifo.is_empty() {
                    self.dma_fill_fifo();
                }
                if bus.cur_phase() == ScsiBusPhase::MessageOut && !self.data_fifo.is_empty() {
                    let b = self.data_fifo.remove(0);
                    if self.cur_state == SeqState::SendMsgEx {
                        // Stop after the single message byte; ATN stays up so
                        // firmware can continue the message by hand.
                        bus.push_data(b);
                        self.cur_state = SeqState::Idle;
                        self.seq_desc = None;
                        self.exec_next_command(bus, timers);
                    } else {
                        // Last (only) message byte: drop ATN before handing
                        // it over
                        bus.release_ctrl_line(self.my_bus_id, CTRL_ATN);
                        bus.push_data(b);
                    }
                }
            }

            SeqState::SendCmd => {
                if self.cur_cmd_dma && self.data_fifo.is_empty() {
                    self.dma_fill_fifo();
                }
                while bus.cur_phase() == ScsiBusPhase::Command && !self.data_fifo.is_empty() {
                    let b = self.data_fifo.remove(0);
                    bus.push_data(b);
                }
                // The target switches phase once the CDB is complete; the
                // notification handler takes it from there.
            }

            SeqState::XferBegin => match bus.cur_phase() {
                ScsiBusPhase::DataIn => {
                    bus.target_xfer_data();
                    if self.cur_cmd_dma && self.dma.is_some() {
                        self.dma_active = true;
                        self.dma_dir_in = true;
                        self.cur_state = SeqState::RcvData;
                        self.dma_chunk(bus, timers);
                    } else {
                        self.cur_state = SeqState::RcvData;
                        self.sequencer(bus, timers);
                    }
                }
                ScsiBusPhase::DataOut => {
                    if self.cur_cmd_dma {
                        bus.negotiate_xfer(0, self.xfer_cnt as usize);
                    }
                    bus.target_xfer_data();
                    if self.cur_cmd_dma && self.dma.is_some() {
                        self.dma_active = true;
                        self.dma_dir_in = false;
                        self.cur_state = SeqState::SendData;
                        self.dma_chunk(bus, timers);
                    } else {
                        self.cur_state = SeqState::SendData;
                        self.sequencer(bus, timers);
                    }
                }
                ScsiBusPhase::Status => {
                    self.cur_state = SeqState::RcvStatus;
                    self.sequencer(bus, timers);
                }
                ScsiBusPhase::MessageIn => {
                    self.cur_state = SeqState::RcvMessage;
                    self.sequencer(bus, timers);
                }
                ScsiBusPhase::MessageOut => {
                    self.cur_state = SeqState::SendMsg;
                    self.sequencer(bus, timers);
                }
                ScsiBusPhase::Command => {
                    self.cur_state = SeqState::SendCmd;
                    self.sequencer(bus, timers);
                }
                _ => {
                    log::warn!("SCSI transfer command outside an information phase");
                    self.raise_int(INT_ILL_CMD);
                    self.cur_state = SeqState::Idle;
                    self.exec_next_command(bus, timers);
                }
            },

            SeqState::SendData => {
                if bus.cur_phase() != ScsiBusPhase::DataOut {
                    // Completion/violation is resolved by the notification
                    // handler; nothing to push here.
                    return;
                }
                if self.cur_cmd_dma && self.dma.is_some() {
                    // Chunked engine path is timer-driven
                    return;
                }
                while bus.cur_phase() == ScsiBusPhase::DataOut && !self.data_fifo.is_empty() {
                    let b = self.data_fifo.remove(0);
                    if !bus.push_data(b) {
                        break;
                    }
                }
            }

            SeqState::RcvData => {
                if bus.cur_phase() != ScsiBusPhase::DataIn {
                    return;
                }
                if self.cur_cmd_dma && self.dma.is_some() {
                    return;
                }
                while self.data_fifo.len() < DATA_FIFO_SIZE
                    && bus.cur_phase() == ScsiBusPhase::DataIn
                    && bus.ctrl_lines() & CTRL_REQ != 0
                {
                    match bus.pull_data() {
                        Some(b) => self.fifo_push(b),
                        None => break,
                    }
                }
            }

            SeqState::RcvStatus => {
                if bus.cur_phase() != ScsiBusPhase::Status {
                    self.raise_int(INT_ILL_CMD);
                    self.cur_state = SeqState::Idle;
                    self.exec_next_command(bus, timers);
                    return;
                }
                if let Some(b) = bus.pull_data() {
                    self.fifo_push(b);
                }
                // Accepting the status byte immediately requests the
                // following message byte.
                bus.target_next_step();
                self.seq_arm(timers, 0, SeqState::RcvMessage);
            }

            SeqState::RcvMessage => {
                if let Some(b) = bus.pull_data() {
                    self.fifo_push(b);
                }
                self.cur_state = SeqState::CmdComplete;
                self.sequencer(bus, timers);
            }

            SeqState::CmdComplete => {
                self.raise_int(INT_BUS_SERVICE | INT_FC);
                self.cur_state = SeqState::Idle;
                self.exec_next_command(bus, timers);
            }

            SeqState::XferEnd => {
                self.dma_active = false;
                self.raise_int(INT_BUS_SERVICE);
                self.cur_state = SeqState::Idle;
                self.exec_next_command(bus, timers);
            }
        }
    }

    /// Refills the data FIFO from the DMA engine (memory -> device)
    fn dma_fill_fifo(&mut self) -> usize {
        let want = (self.xfer_cnt as usize).min(DATA_FIFO_SIZE - self.data_fifo.len());
        let Some(chan) = self.dma.as_mut() else {
            return 0;
        };
        let data = chan.pull_data(want);
        for &b in &data {
            self.fifo_push(b);
        }
        data.len()
    }

    /// Moves one FIFO-sized chunk between the DMA engine and the bus, then
    /// re-arms itself. The per-chunk break models the engine's descriptor
    /// boundary granularity; other code cancels this timer, so it must stay
    /// an individually armed, cancelable handle.
    fn dma_chunk(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        if !self.dma_active || self.dma.is_none() {
            return;
        }
        if !self.dma.as_ref().unwrap().is_ready() {
            self.dma.as_mut().unwrap().xfer_retry();
            self.dma_timer = Some(timers.add_oneshot(DMA_CHUNK_DELAY_NS, TimerTask::DmaChunk));
            return;
        }

        let chunk = (self.xfer_cnt as usize).min(DATA_FIFO_SIZE);
        let moved;

        if self.dma_dir_in {
            // Bus -> FIFO -> engine
            while self.data_fifo.len() < chunk
                && bus.cur_phase() == ScsiBusPhase::DataIn
                && bus.ctrl_lines() & CTRL_REQ != 0
            {
                match bus.pull_data() {
                    Some(b) => self.fifo_push(b),
                    None => break,
                }
            }
            let staged: Vec<u8> = self.data_fifo.drain(..).collect();
            moved = staged.len();
            if moved > 0 {
                self.dma.as_mut().unwrap().push_data(&staged);
            }
        } else {
            // Engine -> FIFO -> bus
            moved = self.dma_fill_fifo();
            while !self.data_fifo.is_empty() && bus.cur_phase() == ScsiBusPhase::DataOut {
                let b = self.data_fifo.remove(0);
                if !bus.push_data(b) {
                    break;
                }
            }
        }

        self.xfer_cnt = self.xfer_cnt.saturating_sub(moved as u32);

        if self.xfer_cnt == 0 {
            self.status |= STAT_TC;
            self.cur_state = SeqState::XferEnd;
            self.sequencer(bus, timers);
        } else {
            self.dma_timer = Some(timers.add_oneshot(DMA_CHUNK_DELAY_NS, TimerTask::DmaChunk));
        }
    }

    /// Restarts a stopped chunk pump, exposed to the DMA engine
    pub fn dma_start(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        if self.dma_active {
            return;
        }
        if matches!(self.cur_state, SeqState::RcvData | SeqState::SendData) && self.cur_cmd_dma {
            self.dma_active = true;
            self.dma_chunk(bus, timers);
        }
    }

    /// Stops the chunk pump, exposed to the DMA engine
    pub fn dma_halt(&mut self, timers: &mut TimerScheduler) {
        self.dma_stop(timers);
    }

    /// Synchronous bridge path, device -> host: drains the FIFO first, then
    /// the bus. Returns the number of bytes produced.
    pub fn xfer_to(&mut self, bus: &mut ScsiBus, buf: &mut [u8]) -> usize {
        let mut moved = 0;
        while moved < buf.len() && !self.data_fifo.is_empty() {
            buf[moved] = self.data_fifo.remove(0);
            moved += 1;
        }
        while moved < buf.len() && bus.ctrl_lines() & CTRL_REQ != 0 {
            match bus.pull_data() {
                Some(b) => {
                    buf[moved] = b;
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Synchronous bridge path, host -> device. Returns bytes consumed.
    pub fn xfer_from(&mut self, bus: &mut ScsiBus, buf: &[u8]) -> usize {
        let mut moved = 0;
        for &b in buf {
            self.fifo_push(b);
            while !self.data_fifo.is_empty() {
                let v = self.data_fifo.remove(0);
                if !bus.push_data(v) {
                    return moved;
                }
                moved += 1;
            }
        }
        moved
    }

    /// 16-bit pseudo-DMA port, read side. Each byte pops the FIFO and counts
    /// against the transfer counter.
    pub fn pseudo_dma_read(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) -> u16 {
        let hi = self.pdma_byte_in(bus, timers);
        let lo = self.pdma_byte_in(bus, timers);
        (u16::from(hi) << 8) | u16::from(lo)
    }

    fn pdma_byte_in(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) -> u8 {
        let b = self.fifo_pop();
        self.pump_transfer(bus, timers);
        self.pdma_count(bus, timers);
        b
    }

    /// 16-bit pseudo-DMA port, write side
    pub fn pseudo_dma_write(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler, val: u16) {
        self.pdma_byte_out(bus, timers, (val >> 8) as u8);
        self.pdma_byte_out(bus, timers, (val & 0xFF) as u8);
    }

    fn pdma_byte_out(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler, val: u8) {
        self.fifo_push(val);
        self.pump_transfer(bus, timers);
        self.pdma_count(bus, timers);
    }

    fn pdma_count(&mut self, bus: &mut ScsiBus, timers: &mut TimerScheduler) {
        if !self.cur_cmd_dma || self.xfer_cnt == 0 {
            return;
        }
        self.xfer_cnt -= 1;
        if self.xfer_cnt == 0 {
            self.status |= STAT_TC;
            self.cur_state = SeqState::XferEnd;
            self.sequencer(bus, timers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::controller;

    #[test]
    fn data_fifo_overflow_sets_gross_error() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        for i in 0..17u8 {
            c.write_reg(&mut bus, &mut timers, 0x2, i);
        }
        assert_eq!(c.data_fifo.len(), DATA_FIFO_SIZE);
        assert_ne!(c.read_reg(&mut bus, &mut timers, 0x4) & STAT_GE, 0);

        // Contents up to capacity come back in FIFO order
        for i in 0..16u8 {
            assert_eq!(c.read_reg(&mut bus, &mut timers, 0x2), i);
        }
    }

    #[test]
    fn data_fifo_underflow_sets_gross_error_and_reads_zero() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        assert_eq!(c.read_reg(&mut bus, &mut timers, 0x2), 0);
        assert_eq!(c.data_fifo.len(), 0);
        assert_ne!(c.read_reg(&mut bus, &mut timers, 0x4) & STAT_GE, 0);
    }

    #[test]
    fn fifo_flags_report_fill_level() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        for i in 0..5u8 {
            c.write_reg(&mut bus, &mut timers, 0x2, i);
        }
        assert_eq!(c.read_reg(&mut bus, &mut timers, 0x7) & 0x1F, 5);
    }

    #[test]
    fn int_status_read_clears() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        // Force an interrupt and a sticky error bit
        c.write_reg(&mut bus, &mut timers, 0x3, 0x7F); // invalid command
        c.status |= STAT_GE | STAT_PE;

        let v = c.read_reg(&mut bus, &mut timers, 0x5);
        assert_eq!(v, INT_ILL_CMD);
        // Second read returns 0; error bits are gone with the first read
        assert_eq!(c.read_reg(&mut bus, &mut timers, 0x5), 0);
        assert_eq!(
            c.read_reg(&mut bus, &mut timers, 0x4) & (STAT_GE | STAT_PE | STAT_GPC | STAT_INT),
            0
        );
    }

    #[test]
    fn irq_line_reports_edges_only() {
        let (mut c, mut bus, mut timers, irq) = controller();
        c.write_reg(&mut bus, &mut timers, 0x3, 0x7F);
        c.write_reg(&mut bus, &mut timers, 0x3, 0x7F);
        // Two raises, one edge
        assert_eq!(irq.events(), vec![true]);

        let _ = c.read_reg(&mut bus, &mut timers, 0x5);
        assert_eq!(irq.events(), vec![true, false]);
    }

    #[test]
    fn command_fifo_overflow_is_rejected() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        // A select against nobody parks the command in the FIFO
        c.write_reg(&mut bus, &mut timers, 0x3, 0x41);
        c.write_reg(&mut bus, &mut timers, 0x3, 0x41);
        assert_eq!(c.cmd_fifo.len(), 2);

        c.write_reg(&mut bus, &mut timers, 0x3, 0x41);
        assert_eq!(c.cmd_fifo.len(), 2);
        let status = c.read_reg(&mut bus, &mut timers, 0x4);
        assert_ne!(status & STAT_GE, 0);
        assert_eq!(c.read_reg(&mut bus, &mut timers, 0x5), INT_ILL_CMD);
    }

    #[test]
    fn reset_device_blocks_until_nop() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        c.write_reg(&mut bus, &mut timers, 0x3, 0x02); // reset device
        assert!(c.on_reset);

        c.write_reg(&mut bus, &mut timers, 0x3, 0x41);
        assert!(c.cmd_fifo.is_empty());

        c.write_reg(&mut bus, &mut timers, 0x3, 0x00); // NOP unblocks
        assert!(!c.on_reset);
        c.write_reg(&mut bus, &mut timers, 0x3, 0x41);
        assert_eq!(c.cmd_fifo.len(), 1);
    }

    #[test]
    fn transfer_count_latch_16bit_zero_means_65536() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        c.write_reg(&mut bus, &mut timers, 0x0, 0);
        c.write_reg(&mut bus, &mut timers, 0x1, 0);
        // DMA NOP latches the counter
        c.write_reg(&mut bus, &mut timers, 0x3, 0x80);
        assert_eq!(c.xfer_cnt, 0x1_0000);
    }

    #[test]
    fn transfer_count_latch_24bit_with_features() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        c.write_reg(&mut bus, &mut timers, 0xB, 0x40); // features on
        c.write_reg(&mut bus, &mut timers, 0x0, 0x11);
        c.write_reg(&mut bus, &mut timers, 0x1, 0x22);
        c.write_reg(&mut bus, &mut timers, 0xE, 0x33);
        c.write_reg(&mut bus, &mut timers, 0x3, 0x80);
        assert_eq!(c.xfer_cnt, 0x33_2211);
    }

    #[test]
    fn chip_id_readable_with_features_enabled() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        assert_eq!(c.read_reg(&mut bus, &mut timers, 0xE), 0);
        c.write_reg(&mut bus, &mut timers, 0xB, 0x40);
        assert_eq!(
            c.read_reg(&mut bus, &mut timers, 0xE),
            ChipVariant::Sc53C94.chip_id()
        );
    }

    #[test]
    #[should_panic(expected = "bus ID")]
    fn config1_bus_id_mismatch_aborts() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        c.write_reg(&mut bus, &mut timers, 0x8, 0x03);
    }

    #[test]
    fn reset_bus_asserts_and_releases_rst() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        c.write_reg(&mut bus, &mut timers, 0x3, 0x03);
        assert_ne!(bus.ctrl_lines() & CTRL_RST, 0);
        assert_eq!(c.read_reg(&mut bus, &mut timers, 0x5), INT_SCSI_RST);

        // Fire the release timer
        while let Some(f) = timers.next_due(RST_RELEASE_DELAY_NS) {
            c.timer_fired(&mut bus, &mut timers, f);
        }
        timers.advance_to(RST_RELEASE_DELAY_NS);
        assert_eq!(bus.ctrl_lines() & CTRL_RST, 0);
        assert_eq!(bus.cur_phase(), ScsiBusPhase::Free);
    }

    #[test]
    fn reset_bus_interrupt_can_be_suppressed() {
        let (mut c, mut bus, mut timers, irq) = controller();
        c.write_reg(&mut bus, &mut timers, 0x8, 0x40 | 7); // keep wired ID 7
        c.write_reg(&mut bus, &mut timers, 0x3, 0x03);
        assert!(irq.events().is_empty());
        assert_eq!(c.read_reg(&mut bus, &mut timers, 0x5), 0);
    }

    #[test]
    fn seq_timer_rearm_cancels_previous() {
        let (mut c, mut bus, mut timers, _irq) = controller();
        c.seq_arm(&mut timers, 100, SeqState::BusFree);
        let first = c.seq_timer.unwrap();
        c.seq_arm(&mut timers, 200, SeqState::BusFree);
        assert!(!timers.is_pending(first));
        assert!(timers.is_pending(c.seq_timer.unwrap()));
    }
}
