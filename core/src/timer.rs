//! Virtual clock and timer scheduler
//!
//! All waiting in the emulated SCSI subsystem is expressed as "schedule a
//! callback N virtual nanoseconds from now". The scheduler does not store
//! callbacks; it returns fired-timer records ([`Fired`]) and the owner routes
//! them back to the component that armed them. This keeps the timer queue
//! plain data and the borrow graph flat.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Virtual nanoseconds since machine power-on
pub type Ns = u64;

/// Opaque, non-zero handle to a pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(u64);

/// What a timer continuation is for. Each purpose gets its own variant so a
/// stale or mis-routed firing is detectable instead of silently corrupting
/// another continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum TimerTask {
    /// Controller sequencer delayed re-entry
    SeqStep,
    /// Controller selection timeout
    SelTimeout,
    /// Controller real-DMA inter-chunk pacing
    DmaChunk,
    /// Controller RST line release after a bus reset command
    RstRelease,
    /// Target bus-settle delay before confirming selection (SCSI ID)
    TargetSettle(u8),
}

/// An expired timer, delivered from [`TimerScheduler::next_due`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub id: TimerId,
    pub task: TimerTask,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TimerEntry {
    id: TimerId,
    task: TimerTask,
    /// Re-arm interval for cyclic timers
    period_ns: Option<Ns>,
}

/// Monotonic virtual-time timer queue.
///
/// Deadlines are totally ordered by `(deadline, arm sequence)` so that two
/// timers expiring at the same instant fire in the order they were armed.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TimerScheduler {
    now_ns: Ns,
    next_id: u64,
    queue: BTreeMap<(Ns, u64), TimerEntry>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self {
            now_ns: 0,
            next_id: 1,
            queue: BTreeMap::new(),
        }
    }

    /// Current virtual time
    pub fn now_ns(&self) -> Ns {
        self.now_ns
    }

    /// Schedules a one-shot timer `delay_ns` from now. A zero delay fires on
    /// the next scheduler pump, not synchronously.
    pub fn add_oneshot(&mut self, delay_ns: Ns, task: TimerTask) -> TimerId {
        self.insert(delay_ns, task, None)
    }

    /// Schedules a timer that re-arms itself every `interval_ns`
    pub fn add_cyclic(&mut self, interval_ns: Ns, task: TimerTask) -> TimerId {
        self.insert(interval_ns, task, Some(interval_ns))
    }

    fn insert(&mut self, delay_ns: Ns, task: TimerTask, period_ns: Option<Ns>) -> TimerId {
        let id = TimerId(self.next_id);
        let seq = self.next_id;
        self.next_id += 1;
        self.queue.insert(
            (self.now_ns.saturating_add(delay_ns), seq),
            TimerEntry { id, task, period_ns },
        );
        id
    }

    /// Cancels a pending timer. Idempotent: canceling an already-fired or
    /// already-canceled handle is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        self.queue.retain(|_, e| e.id != id);
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.queue.values().any(|e| e.id == id)
    }

    /// Pops the earliest timer expiring at or before `target_ns`, advancing
    /// the clock to its deadline. Returns `None` once no timer is due, without
    /// touching the clock; callers finish the window with [`Self::advance_to`].
    ///
    /// Popping one entry at a time lets a handler arm a new timer inside the
    /// same window and still have it fire in deadline order.
    pub fn next_due(&mut self, target_ns: Ns) -> Option<Fired> {
        let (&(deadline, seq), _) = self.queue.iter().next()?;
        if deadline > target_ns {
            return None;
        }
        let entry = self.queue.remove(&(deadline, seq)).unwrap();
        self.now_ns = self.now_ns.max(deadline);
        if let Some(period) = entry.period_ns {
            let seq = self.next_id;
            self.next_id += 1;
            self.queue
                .insert((deadline.saturating_add(period), seq), entry);
        }
        Some(Fired {
            id: entry.id,
            task: entry.task,
        })
    }

    /// Moves the clock forward to `target_ns` after all due timers have been
    /// drained through [`Self::next_due`].
    pub fn advance_to(&mut self, target_ns: Ns) {
        debug_assert!(self.queue.keys().next().is_none_or(|&(d, _)| d > target_ns));
        self.now_ns = self.now_ns.max(target_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sched: &mut TimerScheduler, target: Ns) -> Vec<TimerTask> {
        let mut fired = vec![];
        while let Some(f) = sched.next_due(target) {
            fired.push(f.task);
        }
        sched.advance_to(target);
        fired
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut s = TimerScheduler::new();
        s.add_oneshot(300, TimerTask::SelTimeout);
        s.add_oneshot(100, TimerTask::SeqStep);
        s.add_oneshot(200, TimerTask::DmaChunk);

        assert_eq!(
            drain(&mut s, 1000),
            vec![TimerTask::SeqStep, TimerTask::DmaChunk, TimerTask::SelTimeout]
        );
        assert_eq!(s.now_ns(), 1000);
    }

    #[test]
    fn same_deadline_fires_in_arm_order() {
        let mut s = TimerScheduler::new();
        s.add_oneshot(100, TimerTask::SelTimeout);
        s.add_oneshot(100, TimerTask::SeqStep);
        assert_eq!(
            drain(&mut s, 100),
            vec![TimerTask::SelTimeout, TimerTask::SeqStep]
        );
    }

    #[test]
    fn zero_delay_fires_on_next_pump() {
        let mut s = TimerScheduler::new();
        s.add_oneshot(0, TimerTask::SeqStep);
        assert_eq!(drain(&mut s, 0), vec![TimerTask::SeqStep]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut s = TimerScheduler::new();
        let id = s.add_oneshot(100, TimerTask::SeqStep);
        assert!(s.is_pending(id));
        s.cancel(id);
        assert!(!s.is_pending(id));
        s.cancel(id);
        assert!(drain(&mut s, 1000).is_empty());
    }

    #[test]
    fn cancel_only_removes_the_given_timer() {
        let mut s = TimerScheduler::new();
        let a = s.add_oneshot(100, TimerTask::SeqStep);
        s.add_oneshot(100, TimerTask::DmaChunk);
        s.cancel(a);
        assert_eq!(drain(&mut s, 1000), vec![TimerTask::DmaChunk]);
    }

    #[test]
    fn cyclic_rearms_until_canceled() {
        let mut s = TimerScheduler::new();
        let id = s.add_cyclic(100, TimerTask::DmaChunk);
        assert_eq!(drain(&mut s, 350).len(), 3);
        s.cancel(id);
        assert!(drain(&mut s, 1000).is_empty());
    }

    #[test]
    fn timer_armed_during_window_fires_in_order() {
        let mut s = TimerScheduler::new();
        s.add_oneshot(100, TimerTask::SeqStep);
        let f = s.next_due(1000).unwrap();
        assert_eq!(f.task, TimerTask::SeqStep);
        // re-arm from "inside the handler"
        s.add_oneshot(50, TimerTask::SelTimeout);
        let f = s.next_due(1000).unwrap();
        assert_eq!(f.task, TimerTask::SelTimeout);
        assert_eq!(s.now_ns(), 150);
        assert!(s.next_due(1000).is_none());
        s.advance_to(1000);
    }
}
