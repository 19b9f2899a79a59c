//! File d'événements triée
//!
//! Anneau doublement chaîné de créneaux, un par unité, encadré par deux
//! sentinelles (tête et queue). Les liens sont des index dans une arène.

use log::warn;
use serde::{Deserialize, Serialize};

use super::{Timestamp, UnitDispatch, UnitId, DISABLED_TS};

const HEAD: usize = 0;
const TAIL: usize = UnitId::COUNT + 1;
const SLOT_COUNT: usize = UnitId::COUNT + 2;

const HEAD_TS: Timestamp = Timestamp::MIN;
const TAIL_TS: Timestamp = Timestamp::MAX;

/// Créneau d'une unité dans la file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventSlot {
    time: Timestamp,
    prev: usize,
    next: usize,
}

/// File d'événements du noyau de synchronisation
#[derive(Debug, Clone)]
pub struct EventQueue {
    slots: [EventSlot; SLOT_COUNT],
}

/// Image sérialisable de la file : dates par unité et ordre de parcours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub times: Vec<Timestamp>,
    pub order: Vec<u8>,
}

impl EventQueue {
    /// Crée une file où toutes les unités sont dues au timestamp 0
    pub fn new() -> Self {
        let mut queue = Self {
            slots: [EventSlot { time: 0, prev: HEAD, next: HEAD }; SLOT_COUNT],
        };
        queue.init();
        queue
    }

    /// Réinitialise la file dans l'ordre des créneaux
    pub fn init(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.time = match i {
                HEAD => HEAD_TS,
                TAIL => TAIL_TS,
                _ => 0,
            };
            slot.prev = i.saturating_sub(1);
            slot.next = (i + 1).min(TAIL);
        }
    }

    /// Replace l'unité dans la file à la date `at`
    ///
    /// Une unité avancée passe après les unités déjà planifiées à la même
    /// date ; une unité repoussée passe avant elles. L'ordre obtenu ne dépend
    /// que de la suite d'appels, il est donc reproductible.
    pub fn schedule(&mut self, unit: UnitId, at: Timestamp) {
        let e = unit.slot();
        let current = self.slots[e].time;

        if at < current {
            let mut fe = e;
            loop {
                fe = self.slots[fe].prev;
                if at >= self.slots[fe].time {
                    break;
                }
            }
            self.detach(e);
            self.insert_after(fe, e);
        } else if at > current {
            let mut fe = e;
            loop {
                fe = self.slots[fe].next;
                if at <= self.slots[fe].time {
                    break;
                }
            }
            self.detach(e);
            let before = self.slots[fe].prev;
            self.insert_after(before, e);
        }

        self.slots[e].time = at;
    }

    /// Désarme l'unité jusqu'au prochain `schedule`
    pub fn disable(&mut self, unit: UnitId) {
        self.schedule(unit, DISABLED_TS);
    }

    pub fn is_armed(&self, unit: UnitId) -> bool {
        self.slots[unit.slot()].time != DISABLED_TS
    }

    pub fn event_time(&self, unit: UnitId) -> Timestamp {
        self.slots[unit.slot()].time
    }

    /// Date du prochain événement armé, `DISABLED_TS` si aucun
    pub fn next_event_time(&self) -> Timestamp {
        match self.slots[HEAD].next {
            TAIL => DISABLED_TS,
            first => self.slots[first].time,
        }
    }

    /// Unités dans l'ordre de traitement
    pub fn order(&self) -> Vec<UnitId> {
        let mut out = Vec::with_capacity(UnitId::COUNT);
        let mut cur = self.slots[HEAD].next;
        while cur != TAIL {
            if let Some(unit) = UnitId::from_slot(cur) {
                out.push(unit);
            }
            cur = self.slots[cur].next;
        }
        out
    }

    /// Traite tous les événements dus jusqu'à `timestamp` inclus
    ///
    /// Retourne le nombre d'appels `update` effectués.
    pub fn advance_to<D: UnitDispatch + ?Sized>(&mut self, timestamp: Timestamp, dispatch: &mut D) -> usize {
        let mut calls = 0;

        loop {
            let first = self.slots[HEAD].next;
            let etime = self.slots[first].time;

            if first == TAIL || etime == DISABLED_TS || timestamp < etime {
                break;
            }

            let Some(unit) = UnitId::from_slot(first) else {
                break;
            };

            let mut nt = dispatch.dispatch(unit, etime);
            calls += 1;

            if nt <= etime {
                warn!(
                    "[SCHED] [BUG] {:?} a rendu nt={} pour event_time={} (timestamp={})",
                    unit, nt, etime, timestamp
                );
                nt = etime + 1;
            }

            self.schedule(unit, nt);
        }

        calls
    }

    /// Met à jour immédiatement toutes les unités armées
    pub fn force_updates<D: UnitDispatch + ?Sized>(&mut self, timestamp: Timestamp, dispatch: &mut D) {
        for unit in UnitId::ALL {
            if self.is_armed(unit) {
                let nt = dispatch.dispatch(unit, timestamp);
                self.schedule(unit, nt);
            }
        }
    }

    /// Soustrait `timestamp` de toutes les dates armées
    pub fn rebase(&mut self, timestamp: Timestamp) {
        for unit in UnitId::ALL {
            let slot = &mut self.slots[unit.slot()];

            if slot.time == DISABLED_TS {
                continue;
            }

            if slot.time <= timestamp {
                warn!(
                    "[SCHED] rebase({}) avec {:?} en retard (event_time={})",
                    timestamp, unit, slot.time
                );
            }

            slot.time -= timestamp;
        }
    }

    pub fn snapshot(&self) -> EventSnapshot {
        let times = UnitId::ALL.iter().map(|u| self.slots[u.slot()].time).collect();
        let order = self.order().iter().map(|u| u.slot() as u8).collect();

        EventSnapshot { times, order }
    }

    /// Restaure une image ; une image incohérente réinitialise la file
    pub fn restore(&mut self, snapshot: &EventSnapshot) -> bool {
        if self.try_restore(snapshot) {
            return true;
        }

        warn!("[SCHED] Données d'événements invalides dans la sauvegarde, file réinitialisée");
        self.init();
        false
    }

    fn try_restore(&mut self, snapshot: &EventSnapshot) -> bool {
        if snapshot.times.len() != UnitId::COUNT || snapshot.order.len() != UnitId::COUNT {
            return false;
        }

        let mut used = [false; SLOT_COUNT];
        let mut cur = HEAD;

        for (i, (&time, &slot)) in snapshot.times.iter().zip(&snapshot.order).enumerate() {
            let slot = slot as usize;

            if slot == HEAD || slot >= TAIL || used[slot] {
                return false;
            }
            used[slot] = true;

            if time < self.slots[HEAD].time {
                return false;
            }
            self.slots[i + 1].time = time;

            self.slots[cur].next = slot;
            self.slots[slot].prev = cur;
            cur = slot;
        }

        self.slots[cur].next = TAIL;
        self.slots[TAIL].prev = cur;
        self.slots[TAIL].next = TAIL;
        self.slots[HEAD].prev = HEAD;

        self.is_consistent()
    }

    /// Vérifie le chaînage et le tri de l'anneau
    fn is_consistent(&self) -> bool {
        (0..SLOT_COUNT).all(|i| {
            let slot = &self.slots[i];
            let forward_ok = i == TAIL
                || (self.slots[slot.next].prev == i && self.slots[slot.next].time >= slot.time);
            let backward_ok = i == HEAD
                || (self.slots[slot.prev].next == i && self.slots[slot.prev].time <= slot.time);
            forward_ok && backward_ok
        })
    }

    fn detach(&mut self, e: usize) {
        let EventSlot { prev, next, .. } = self.slots[e];
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    fn insert_after(&mut self, fe: usize, e: usize) {
        let next = self.slots[fe].next;
        self.slots[e].prev = fe;
        self.slots[e].next = next;
        self.slots[next].prev = e;
        self.slots[fe].next = e;
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        calls: Vec<(UnitId, Timestamp)>,
        step: Timestamp,
    }

    impl UnitDispatch for Recorder {
        fn dispatch(&mut self, unit: UnitId, timestamp: Timestamp) -> Timestamp {
            self.calls.push((unit, timestamp));
            timestamp + self.step
        }
    }

    #[test]
    fn test_schedule_keeps_sorted_order() {
        let mut queue = EventQueue::new();
        queue.schedule(UnitId::Cdb, 500);
        queue.schedule(UnitId::Vdp2, 200);

        assert_eq!(queue.order(), vec![UnitId::Vdp2, UnitId::Cdb]);
        assert_eq!(queue.next_event_time(), 200);

        queue.schedule(UnitId::Vdp2, 900);
        assert_eq!(queue.order(), vec![UnitId::Cdb, UnitId::Vdp2]);
        assert!(queue.is_consistent());
    }

    #[test]
    fn test_disable_stops_dispatch() {
        let mut queue = EventQueue::new();
        queue.schedule(UnitId::Cdb, 10);
        queue.disable(UnitId::Vdp2);

        let mut rec = Recorder { calls: Vec::new(), step: 1000 };
        queue.advance_to(100, &mut rec);

        assert_eq!(rec.calls, vec![(UnitId::Cdb, 10)]);
        assert!(!queue.is_armed(UnitId::Vdp2));
        assert_eq!(queue.event_time(UnitId::Cdb), 1010);
    }

    #[test]
    fn test_non_advancing_handler_is_clamped() {
        let mut queue = EventQueue::new();
        queue.schedule(UnitId::Cdb, 5);
        queue.disable(UnitId::Vdp2);

        let mut rec = Recorder { calls: Vec::new(), step: 0 };
        queue.advance_to(7, &mut rec);

        // 5, 6, 7 : le handler fautif progresse d'un cycle à chaque appel
        assert_eq!(rec.calls.len(), 3);
        assert_eq!(queue.event_time(UnitId::Cdb), 8);
    }

    #[test]
    fn test_rebase_skips_disabled() {
        let mut queue = EventQueue::new();
        queue.schedule(UnitId::Cdb, 1500);
        queue.disable(UnitId::Vdp2);

        queue.rebase(1000);

        assert_eq!(queue.event_time(UnitId::Cdb), 500);
        assert_eq!(queue.event_time(UnitId::Vdp2), DISABLED_TS);
    }

    #[test]
    fn test_restore_rejects_duplicate_order() {
        let mut queue = EventQueue::new();
        queue.schedule(UnitId::Cdb, 40);
        queue.schedule(UnitId::Vdp2, 30);

        let bad = EventSnapshot {
            times: vec![40, 30],
            order: vec![1, 1],
        };

        assert!(!queue.restore(&bad));
        assert_eq!(queue.event_time(UnitId::Cdb), 0);
        assert_eq!(queue.event_time(UnitId::Vdp2), 0);
    }

    #[test]
    fn test_restore_rejects_unsorted_order() {
        let mut queue = EventQueue::new();

        let unsorted = EventSnapshot {
            times: vec![40, 30],
            order: vec![UnitId::Cdb.slot() as u8, UnitId::Vdp2.slot() as u8],
        };

        assert!(!queue.restore(&unsorted));
        assert!(queue.is_consistent());
    }
}
