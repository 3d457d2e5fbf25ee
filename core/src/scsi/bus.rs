//! Shared SCSI bus: wired-OR control lines, phase bookkeeping, arbitration
//! and selection refereeing, and byte routing between initiator and target.
//!
//! The bus is the single source of truth for the shared line state. Every
//! participant owns only its own contribution (`dev_ctrl_lines[id]`); the
//! externally observable lines are the bitwise OR over all contributions, so
//! a line only drops bus-wide once every participant has released it.
//!
//! Participants are looked up by SCSI ID, never by stored reference. Target
//! devices are registered as boxed [`ScsiDevice`] objects and are invoked
//! directly; the host adapter registers only its ID and receives its
//! notifications through a queue drained by the owning subsystem.

use std::collections::VecDeque;

use anyhow::{bail, Result};

use crate::scsi::target::ScsiDevice;
use crate::scsi::{
    phase_ctrl_lines, ScsiBusPhase, ScsiMsg, CTRL_BSY, CTRL_RST, CTRL_SEL,
};
use crate::timer::TimerScheduler;

const SCSI_TRACE: bool = false;

/// Number of addressable SCSI IDs on a narrow bus
pub const MAX_SCSI_IDS: usize = 8;

/// Pure line/phase state of the bus.
///
/// This is the restricted view handed to target devices: line operations and
/// selection confirmation, but no access to the participant registry.
#[derive(Debug)]
pub struct BusState {
    /// Per-participant control line contributions
    dev_ctrl_lines: [u16; MAX_SCSI_IDS],

    /// Wired-OR over all contributions
    ctrl_lines: u16,

    /// One bit per participant ID, driven during arbitration/selection
    data_lines: u8,

    cur_phase: ScsiBusPhase,

    /// Winner of the last arbitration round
    arb_winner_id: Option<u8>,

    /// Session state, valid between arbitration and disconnect
    initiator_id: Option<u8>,
    target_id: Option<u8>,

    /// Notifications queued for fan-out, with originating ID
    pending: VecDeque<(u8, ScsiMsg)>,
}

impl BusState {
    pub(crate) fn new() -> Self {
        Self {
            dev_ctrl_lines: [0; MAX_SCSI_IDS],
            ctrl_lines: 0,
            data_lines: 0,
            cur_phase: ScsiBusPhase::Free,
            arb_winner_id: None,
            initiator_id: None,
            target_id: None,
            pending: VecDeque::new(),
        }
    }

    pub fn ctrl_lines(&self) -> u16 {
        self.ctrl_lines
    }

    pub fn dev_ctrl_lines(&self, id: u8) -> u16 {
        self.dev_ctrl_lines[id as usize]
    }

    pub fn data_lines(&self) -> u8 {
        self.data_lines
    }

    pub fn cur_phase(&self) -> ScsiBusPhase {
        self.cur_phase
    }

    pub fn initiator_id(&self) -> Option<u8> {
        self.initiator_id
    }

    pub fn target_id(&self) -> Option<u8> {
        self.target_id
    }

    fn notify_others(&mut self, origin: u8, msg: ScsiMsg) {
        self.pending.push_back((origin, msg));
    }

    /// Recomputes the wired-OR aggregate and resolves RST edges
    fn recompute(&mut self, origin: u8) {
        let old = self.ctrl_lines;
        self.ctrl_lines = self
            .dev_ctrl_lines
            .iter()
            .fold(0, |lines, contrib| lines | contrib);

        if old & CTRL_RST == 0 && self.ctrl_lines & CTRL_RST != 0 {
            self.cur_phase = ScsiBusPhase::Reset;
            self.notify_others(origin, ScsiMsg::BusPhaseChange(ScsiBusPhase::Reset));
        } else if old & CTRL_RST != 0 && self.ctrl_lines & CTRL_RST == 0 {
            self.cur_phase = ScsiBusPhase::Free;
            self.arb_winner_id = None;
            self.initiator_id = None;
            self.target_id = None;
            self.notify_others(origin, ScsiMsg::BusPhaseChange(ScsiBusPhase::Free));
        }
    }

    pub fn assert_ctrl_line(&mut self, id: u8, mask: u16) {
        self.dev_ctrl_lines[id as usize] |= mask;
        self.recompute(id);
    }

    /// Releases `id`'s contribution to the given lines. A line only drops
    /// bus-wide once no other participant still asserts it.
    pub fn release_ctrl_line(&mut self, id: u8, mask: u16) {
        self.dev_ctrl_lines[id as usize] &= !mask;
        self.recompute(id);
    }

    /// Claims the bus for arbitration. Fails if the bus is not free; the
    /// caller retries after a bus-clear delay.
    pub fn begin_arbitration(&mut self, id: u8) -> bool {
        if self.cur_phase != ScsiBusPhase::Free {
            return false;
        }
        self.data_lines |= 1 << id;
        self.assert_ctrl_line(id, CTRL_BSY);
        self.cur_phase = ScsiBusPhase::Arbitration;
        self.notify_others(id, ScsiMsg::BusPhaseChange(ScsiBusPhase::Arbitration));
        true
    }

    /// Settles arbitration: of all IDs driving the data lines, the highest
    /// one wins. Returns whether the calling participant is the winner; a
    /// loser's ID bit is removed from the data lines.
    pub fn end_arbitration(&mut self, id: u8) -> bool {
        for bit in (0..8u8).rev() {
            if self.data_lines & (1 << bit) != 0 {
                self.arb_winner_id = Some(bit);
                break;
            }
        }
        if self.arb_winner_id == Some(id) {
            true
        } else {
            self.data_lines &= !(1 << id);
            false
        }
    }

    /// Starts selection of `target_id`. Only valid for the participant that
    /// just won arbitration.
    pub fn begin_selection(&mut self, initiator_id: u8, target_id: u8, assert_atn: bool) -> bool {
        if self.cur_phase != ScsiBusPhase::Arbitration || self.arb_winner_id != Some(initiator_id) {
            return false;
        }
        let mut lines = CTRL_SEL;
        if assert_atn {
            lines |= crate::scsi::CTRL_ATN;
        }
        self.assert_ctrl_line(initiator_id, lines);
        self.data_lines = (1 << initiator_id) | (1 << target_id);
        self.initiator_id = Some(initiator_id);
        self.cur_phase = ScsiBusPhase::Selection;
        self.notify_others(initiator_id, ScsiMsg::BusPhaseChange(ScsiBusPhase::Selection));
        true
    }

    /// Called by the target that recognized its ID during selection
    pub fn confirm_selection(&mut self, target_id: u8) {
        self.target_id = Some(target_id);
        self.notify_others(target_id, ScsiMsg::ConfirmSel);
    }

    /// The initiator's check whether the expected target responded
    pub fn end_selection(&mut self, _initiator_id: u8, target_id: u8) -> bool {
        self.target_id == Some(target_id)
    }

    /// Leaves the current phase's control lines, asserts the new phase's
    /// lines and fans the change out. This is the only way `cur_phase`
    /// changes outside arbitration/selection/reset.
    pub fn switch_phase(&mut self, id: u8, new_phase: ScsiBusPhase) -> ScsiBusPhase {
        let old_phase = self.cur_phase;
        self.release_ctrl_line(id, phase_ctrl_lines(old_phase));
        self.assert_ctrl_line(id, phase_ctrl_lines(new_phase));
        self.cur_phase = new_phase;
        if SCSI_TRACE {
            log::debug!("Bus phase: {:?} -> {:?}", old_phase, new_phase);
        }
        self.notify_others(id, ScsiMsg::BusPhaseChange(new_phase));
        old_phase
    }

    /// Releases all of `id`'s lines; once nobody drives BSY or SEL anymore
    /// the bus goes free.
    pub fn disconnect(&mut self, id: u8) {
        self.release_ctrl_line(id, crate::scsi::CTRL_ALL);
        self.data_lines &= !(1 << id);

        if self.ctrl_lines & (CTRL_BSY | CTRL_SEL | CTRL_RST) == 0
            && self.cur_phase != ScsiBusPhase::Free
        {
            self.cur_phase = ScsiBusPhase::Free;
            self.arb_winner_id = None;
            self.initiator_id = None;
            self.target_id = None;
            self.data_lines = 0;
            self.notify_others(id, ScsiMsg::BusPhaseChange(ScsiBusPhase::Free));
        }
    }
}

/// The bus proper: line state plus the participant registry
pub struct ScsiBus {
    state: BusState,

    /// Target-side participants, indexed by SCSI ID
    devices: [Option<Box<dyn ScsiDevice>>; MAX_SCSI_IDS],

    /// Registered host adapter ID
    hba_id: Option<u8>,

    /// Notifications destined for the host adapter, drained by the subsystem
    initiator_queue: VecDeque<ScsiMsg>,
}

impl ScsiBus {
    pub fn new() -> Self {
        Self {
            state: BusState::new(),
            devices: Default::default(),
            hba_id: None,
            initiator_queue: VecDeque::new(),
        }
    }

    /// Records the host adapter's bus ID. The adapter itself stays outside
    /// the registry; its notifications are queued instead of delivered.
    pub fn register_initiator(&mut self, id: u8) {
        self.hba_id = Some(id);
    }

    pub fn register_device(&mut self, id: u8, dev: Box<dyn ScsiDevice>) -> Result<()> {
        if id as usize >= MAX_SCSI_IDS {
            bail!("SCSI ID out of range: {}", id);
        }
        if self.hba_id == Some(id) {
            bail!("SCSI ID {} is taken by the host adapter", id);
        }
        if self.devices[id as usize].is_some() {
            bail!("SCSI ID {} already occupied", id);
        }
        self.devices[id as usize] = Some(dev);
        Ok(())
    }

    pub fn remove_device(&mut self, id: u8) -> Option<Box<dyn ScsiDevice>> {
        self.devices[id as usize].take()
    }

    pub fn device(&self, id: u8) -> Option<&dyn ScsiDevice> {
        self.devices[id as usize].as_deref()
    }

    /// Fans out queued notifications to every registered device other than
    /// the originator. Initiator-bound notifications pile up in a separate
    /// queue for the subsystem to hand to the controller, because the
    /// controller is not owned by the bus.
    pub fn pump(&mut self, timers: &mut TimerScheduler) {
        while let Some((origin, msg)) = self.state.pending.pop_front() {
            for id in 0..MAX_SCSI_IDS as u8 {
                if id == origin {
                    continue;
                }
                if let Some(dev) = self.devices[id as usize].as_mut() {
                    dev.notify(&mut self.state, timers, msg);
                }
            }
            if self.hba_id.is_some_and(|hba| hba != origin) {
                self.initiator_queue.push_back(msg);
            }
        }
    }

    pub fn take_initiator_msg(&mut self) -> Option<ScsiMsg> {
        self.initiator_queue.pop_front()
    }

    /// Routes a timer continuation to the device that armed it
    pub fn target_settle(&mut self, id: u8, timers: &mut TimerScheduler) {
        if let Some(dev) = self.devices[id as usize].as_mut() {
            dev.settle_expired(&mut self.state, timers);
        }
    }

    /// Pulls one byte from the current target (target -> initiator phases).
    /// The bus never buffers bytes; it only routes.
    pub fn pull_data(&mut self) -> Option<u8> {
        let tid = self.state.target_id?;
        let dev = self.devices[tid as usize].as_mut()?;
        dev.send_data(&mut self.state)
    }

    /// Pushes one byte to the current target (initiator -> target phases)
    pub fn push_data(&mut self, byte: u8) -> bool {
        let Some(tid) = self.state.target_id else {
            return false;
        };
        let Some(dev) = self.devices[tid as usize].as_mut() else {
            return false;
        };
        dev.rcv_data(&mut self.state, byte)
    }

    /// Prompts the current target to advance its phase state machine
    pub fn target_next_step(&mut self) {
        if let Some(tid) = self.state.target_id {
            if let Some(dev) = self.devices[tid as usize].as_mut() {
                dev.next_step(&mut self.state);
            }
        }
    }

    /// Asks the current target to drive one transfer step
    pub fn target_xfer_data(&mut self) {
        if let Some(tid) = self.state.target_id {
            if let Some(dev) = self.devices[tid as usize].as_mut() {
                dev.xfer_data(&mut self.state);
            }
        }
    }

    /// Announces intended transfer lengths to the current target
    pub fn negotiate_xfer(&mut self, bytes_in: usize, bytes_out: usize) {
        if let Some(tid) = self.state.target_id {
            if let Some(dev) = self.devices[tid as usize].as_mut() {
                dev.negotiate_xfer(bytes_in, bytes_out);
            }
        }
    }

    // Line/phase state pass-throughs

    pub fn ctrl_lines(&self) -> u16 {
        self.state.ctrl_lines()
    }

    pub fn data_lines(&self) -> u8 {
        self.state.data_lines()
    }

    pub fn cur_phase(&self) -> ScsiBusPhase {
        self.state.cur_phase()
    }

    pub fn assert_ctrl_line(&mut self, id: u8, mask: u16) {
        self.state.assert_ctrl_line(id, mask);
    }

    pub fn release_ctrl_line(&mut self, id: u8, mask: u16) {
        self.state.release_ctrl_line(id, mask);
    }

    pub fn begin_arbitration(&mut self, id: u8) -> bool {
        self.state.begin_arbitration(id)
    }

    pub fn end_arbitration(&mut self, id: u8) -> bool {
        self.state.end_arbitration(id)
    }

    pub fn begin_selection(&mut self, initiator_id: u8, target_id: u8, assert_atn: bool) -> bool {
        self.state.begin_selection(initiator_id, target_id, assert_atn)
    }

    pub fn end_selection(&mut self, initiator_id: u8, target_id: u8) -> bool {
        self.state.end_selection(initiator_id, target_id)
    }

    pub fn switch_phase(&mut self, id: u8, new_phase: ScsiBusPhase) -> ScsiBusPhase {
        self.state.switch_phase(id, new_phase)
    }

    pub fn disconnect(&mut self, id: u8) {
        self.state.disconnect(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::{CTRL_ATN, CTRL_CD, CTRL_IO, CTRL_MSG};

    fn state() -> BusState {
        BusState::new()
    }

    #[test]
    fn wired_or_aggregates_all_contributions() {
        let mut b = state();
        b.assert_ctrl_line(1, CTRL_BSY);
        b.assert_ctrl_line(3, CTRL_BSY | CTRL_SEL);
        b.assert_ctrl_line(6, CTRL_ATN);

        let expected = (0..8).fold(0, |l, id| l | b.dev_ctrl_lines(id));
        assert_eq!(b.ctrl_lines(), expected);
        assert_eq!(b.ctrl_lines(), CTRL_BSY | CTRL_SEL | CTRL_ATN);
    }

    #[test]
    fn release_is_voting() {
        let mut b = state();
        b.assert_ctrl_line(1, CTRL_BSY);
        b.assert_ctrl_line(2, CTRL_BSY);

        // One of two holders lets go: line stays asserted bus-wide
        b.release_ctrl_line(1, CTRL_BSY);
        assert_eq!(b.ctrl_lines() & CTRL_BSY, CTRL_BSY);

        b.release_ctrl_line(2, CTRL_BSY);
        assert_eq!(b.ctrl_lines() & CTRL_BSY, 0);
    }

    #[test]
    fn release_only_affects_own_contribution() {
        let mut b = state();
        b.assert_ctrl_line(1, CTRL_BSY);
        // Releasing a line you never asserted must not drop it
        b.release_ctrl_line(5, CTRL_BSY);
        assert_eq!(b.ctrl_lines() & CTRL_BSY, CTRL_BSY);
    }

    #[test]
    fn arbitration_highest_id_wins() {
        // Every non-empty subset of IDs 0..8
        for subset in 1u16..256 {
            let mut b = state();
            let mut first = true;
            for id in 0..8u8 {
                if subset & (1 << id) != 0 {
                    if first {
                        assert!(b.begin_arbitration(id));
                        first = false;
                    } else {
                        // Latecomers put their ID up as well
                        b.data_lines |= 1 << id;
                    }
                }
            }
            let winner = 15 - subset.leading_zeros() as u8;
            for id in 0..8u8 {
                if subset & (1 << id) != 0 {
                    assert_eq!(b.end_arbitration(id), id == winner, "subset {subset:#b}");
                }
            }
        }
    }

    #[test]
    fn arbitration_requires_free_bus() {
        let mut b = state();
        assert!(b.begin_arbitration(7));
        assert!(!b.begin_arbitration(3));
    }

    #[test]
    fn selection_records_session() {
        let mut b = state();
        assert!(b.begin_arbitration(7));
        assert!(b.end_arbitration(7));
        assert!(b.begin_selection(7, 2, true));
        assert_eq!(b.cur_phase(), ScsiBusPhase::Selection);
        assert_eq!(b.data_lines(), (1 << 7) | (1 << 2));
        assert_ne!(b.ctrl_lines() & CTRL_ATN, 0);

        assert!(!b.end_selection(7, 2));
        b.confirm_selection(2);
        assert!(b.end_selection(7, 2));
        assert!(!b.end_selection(7, 3));
    }

    #[test]
    fn selection_requires_winning_arbitration() {
        let mut b = state();
        assert!(b.begin_arbitration(3));
        b.data_lines |= 1 << 6;
        assert!(!b.end_arbitration(3));
        assert!(!b.begin_selection(3, 0, false));
    }

    #[test]
    fn phase_line_encoding() {
        let cases = [
            (ScsiBusPhase::Command, CTRL_CD),
            (ScsiBusPhase::DataIn, CTRL_IO),
            (ScsiBusPhase::DataOut, 0),
            (ScsiBusPhase::Status, CTRL_CD | CTRL_IO),
            (ScsiBusPhase::MessageOut, CTRL_CD | CTRL_MSG),
            (ScsiBusPhase::MessageIn, CTRL_CD | CTRL_MSG | CTRL_IO),
        ];
        for (phase, lines) in cases {
            let mut b = state();
            b.switch_phase(2, phase);
            assert_eq!(
                b.ctrl_lines() & (CTRL_CD | CTRL_IO | CTRL_MSG),
                lines,
                "{phase:?}"
            );
        }
    }

    #[test]
    fn switch_phase_leaves_previous_lines() {
        let mut b = state();
        b.switch_phase(2, ScsiBusPhase::MessageIn);
        let old = b.switch_phase(2, ScsiBusPhase::DataOut);
        assert_eq!(old, ScsiBusPhase::MessageIn);
        assert_eq!(b.ctrl_lines() & (CTRL_CD | CTRL_IO | CTRL_MSG), 0);
    }

    #[test]
    fn disconnect_frees_bus_when_nobody_holds_it() {
        let mut b = state();
        assert!(b.begin_arbitration(7));
        assert!(b.end_arbitration(7));
        assert!(b.begin_selection(7, 2, false));
        b.assert_ctrl_line(2, CTRL_BSY);
        b.confirm_selection(2);

        b.disconnect(7);
        // Target still asserts BSY
        assert_ne!(b.cur_phase(), ScsiBusPhase::Free);

        b.disconnect(2);
        assert_eq!(b.cur_phase(), ScsiBusPhase::Free);
        assert_eq!(b.ctrl_lines(), 0);
        assert_eq!(b.target_id(), None);
    }

    #[test]
    fn rst_forces_reset_phase() {
        let mut b = state();
        b.switch_phase(2, ScsiBusPhase::DataIn);
        b.assert_ctrl_line(7, CTRL_RST);
        assert_eq!(b.cur_phase(), ScsiBusPhase::Reset);
        b.release_ctrl_line(7, CTRL_RST);
        assert_eq!(b.cur_phase(), ScsiBusPhase::Free);
    }
}
