//! Timer set for the single-threaded core loop.
//!
//! Each scheduled item is identified by an [`AlarmKind`] owner token rather
//! than a callback, so the dispatcher can match on it while holding the whole
//! engine mutably. Items carry a soonest-fire time and a latest-acceptable
//! deadline; due items are drained once per wakeup, so an item rescheduling
//! itself to `now` cannot starve others. Readiness on sockets is multiplexed
//! by the run loop itself (the rx channel arm of its `select!` comes before
//! the timer arm), keeping fd events ahead of expired timers in any single
//! wakeup.

use std::collections::HashMap;

/// Which engine component an alarm belongs to. Slot-indexed variants carry
/// the owner's arena index, never a reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AlarmKind {
    /// Periodic interface discovery sweep.
    Discover,
    /// Self-announce tick for the interface in this slot.
    InterfaceTick(usize),
    /// Read pass over a file-backed interface in this slot.
    DummyPoll(usize),
    /// The TX engine's next send opportunity.
    NextPacket,
    /// Per-second call status / expiry pass.
    VompTick,
    /// Rhizome fetch/sync round.
    RhizomeSync,
}

#[derive(Clone, Copy, Debug)]
pub struct Alarm {
    pub kind: AlarmKind,
    /// Soonest time this item wants to fire, in engine milliseconds.
    pub alarm: u64,
    /// Latest acceptable fire time.
    pub deadline: u64,
}

#[derive(Clone, Copy)]
struct Entry {
    alarm: Alarm,
    seq: u64,
}

#[derive(Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
    next_seq: u64,
    fired: HashMap<AlarmKind, u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an alarm, replacing any existing alarm of the same kind.
    pub fn schedule(&mut self, alarm: Alarm) {
        self.unschedule(alarm.kind);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { alarm, seq });
    }

    /// Remove the alarm of this kind, if present. Missing items are fine:
    /// a callback may cancel an item that fired in the same wakeup.
    pub fn unschedule(&mut self, kind: AlarmKind) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.alarm.kind != kind);
        self.entries.len() != before
    }

    pub fn is_scheduled(&self, kind: AlarmKind) -> bool {
        self.entries.iter().any(|entry| entry.alarm.kind == kind)
    }

    /// The earliest `alarm` across all items, i.e. how long the run loop may
    /// sleep.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.entries.iter().map(|entry| entry.alarm.alarm).min()
    }

    /// Remove and return every item due at `now`, ordered by alarm time,
    /// then deadline, then insertion order.
    pub fn take_due(&mut self, now: u64) -> Vec<AlarmKind> {
        let mut due: Vec<Entry> = Vec::new();
        self.entries.retain(|entry| {
            if entry.alarm.alarm <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|entry| (entry.alarm.alarm, entry.alarm.deadline, entry.seq));
        for entry in &due {
            *self.fired.entry(entry.alarm.kind).or_insert(0) += 1;
        }
        due.into_iter().map(|entry| entry.alarm.kind).collect()
    }

    /// How many times alarms of this kind have fired.
    pub fn fired(&self, kind: AlarmKind) -> u64 {
        self.fired.get(&kind).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alarm(kind: AlarmKind, at: u64, deadline: u64) -> Alarm {
        Alarm { kind, alarm: at, deadline }
    }

    #[test]
    fn schedule_is_idempotent_per_kind() {
        let mut sched = Scheduler::new();
        sched.schedule(alarm(AlarmKind::NextPacket, 100, 150));
        sched.schedule(alarm(AlarmKind::NextPacket, 50, 80));
        assert_eq!(sched.next_wakeup(), Some(50));
        assert_eq!(sched.take_due(60), vec![AlarmKind::NextPacket]);
        assert!(sched.take_due(1000).is_empty());
    }

    #[test]
    fn due_items_order_by_alarm_then_deadline_then_insertion() {
        let mut sched = Scheduler::new();
        sched.schedule(alarm(AlarmKind::VompTick, 10, 40));
        sched.schedule(alarm(AlarmKind::Discover, 10, 20));
        sched.schedule(alarm(AlarmKind::InterfaceTick(0), 5, 100));
        sched.schedule(alarm(AlarmKind::InterfaceTick(1), 10, 40));
        assert_eq!(
            sched.take_due(10),
            vec![
                AlarmKind::InterfaceTick(0),
                AlarmKind::Discover,
                AlarmKind::VompTick,
                AlarmKind::InterfaceTick(1),
            ]
        );
    }

    #[test]
    fn drain_is_once_per_wakeup() {
        let mut sched = Scheduler::new();
        sched.schedule(alarm(AlarmKind::NextPacket, 10, 20));
        sched.schedule(alarm(AlarmKind::VompTick, 10, 25));
        let due = sched.take_due(10);
        assert_eq!(due.len(), 2);
        // an item rescheduled to `now` by a callback waits for the next drain
        sched.schedule(alarm(AlarmKind::NextPacket, 10, 20));
        assert!(sched.is_scheduled(AlarmKind::NextPacket));
        assert_eq!(sched.next_wakeup(), Some(10));
    }

    #[test]
    fn unschedule_tolerates_missing_items() {
        let mut sched = Scheduler::new();
        assert!(!sched.unschedule(AlarmKind::RhizomeSync));
        sched.schedule(alarm(AlarmKind::RhizomeSync, 5, 10));
        assert!(sched.unschedule(AlarmKind::RhizomeSync));
        assert_eq!(sched.next_wakeup(), None);
    }

    #[test]
    fn fire_counters_accumulate() {
        let mut sched = Scheduler::new();
        for _ in 0..3 {
            sched.schedule(alarm(AlarmKind::VompTick, 1, 2));
            let _ = sched.take_due(5);
        }
        assert_eq!(sched.fired(AlarmKind::VompTick), 3);
    }
}
