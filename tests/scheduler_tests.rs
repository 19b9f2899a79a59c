//! Tests du noyau de synchronisation

use pixel_saturn_rust::scheduler::*;

/// Unité factice : avance d'un pas fixe et journalise ses appels
struct Ticker {
    calls: Vec<(UnitId, Timestamp)>,
    cdb_step: Timestamp,
    vdp2_step: Timestamp,
}

impl Ticker {
    fn new(cdb_step: Timestamp, vdp2_step: Timestamp) -> Self {
        Self {
            calls: Vec::new(),
            cdb_step,
            vdp2_step,
        }
    }
}

impl UnitDispatch for Ticker {
    fn dispatch(&mut self, unit: UnitId, timestamp: Timestamp) -> Timestamp {
        self.calls.push((unit, timestamp));
        match unit {
            UnitId::Cdb => timestamp + self.cdb_step,
            UnitId::Vdp2 => timestamp + self.vdp2_step,
        }
    }
}

/// Les unités sont appelées dans l'ordre chronologique
#[test]
fn test_dispatch_in_timestamp_order() {
    let mut queue = EventQueue::new();
    let mut ticker = Ticker::new(300, 200);

    queue.advance_to(600, &mut ticker);

    assert_eq!(
        ticker.calls,
        vec![
            (UnitId::Cdb, 0),
            (UnitId::Vdp2, 0),
            (UnitId::Vdp2, 200),
            (UnitId::Cdb, 300),
            (UnitId::Vdp2, 400),
            (UnitId::Vdp2, 600),
            (UnitId::Cdb, 600),
        ]
    );
    assert_eq!(queue.next_event_time(), 800);
}

/// À date égale, une unité repoussée passe devant, une unité avancée derrière
#[test]
fn test_same_timestamp_ties_are_stable() {
    let mut queue = EventQueue::new();
    queue.schedule(UnitId::Vdp2, 50);
    queue.schedule(UnitId::Cdb, 50);

    // Cdb repoussé de 0 à 50
    assert_eq!(queue.order(), vec![UnitId::Cdb, UnitId::Vdp2]);

    // Cdb avancé de 100 à 50
    queue.schedule(UnitId::Cdb, 100);
    queue.schedule(UnitId::Cdb, 50);
    assert_eq!(queue.order(), vec![UnitId::Vdp2, UnitId::Cdb]);
}

#[test]
fn test_disabled_units_are_never_dispatched() {
    let mut queue = EventQueue::new();
    queue.disable(UnitId::Cdb);
    queue.disable(UnitId::Vdp2);

    let mut ticker = Ticker::new(1, 1);
    assert_eq!(queue.advance_to(Timestamp::MAX - 1, &mut ticker), 0);
    assert!(ticker.calls.is_empty());
    assert_eq!(queue.next_event_time(), DISABLED_TS);

    queue.schedule(UnitId::Vdp2, 10);
    assert!(queue.is_armed(UnitId::Vdp2));
    assert!(!queue.is_armed(UnitId::Cdb));
    assert_eq!(queue.next_event_time(), 10);
}

/// Un handler qui ne progresse pas est forcé d'un cycle en avant
#[test]
fn test_stalled_handler_still_progresses() {
    let mut queue = EventQueue::new();
    queue.disable(UnitId::Vdp2);

    let mut ticker = Ticker::new(-20, 0);
    let calls = queue.advance_to(3, &mut ticker);

    assert_eq!(calls, 4);
    assert_eq!(queue.event_time(UnitId::Cdb), 4);
}

#[test]
fn test_force_updates_reaches_armed_units_only() {
    let mut queue = EventQueue::new();
    queue.schedule(UnitId::Cdb, 5000);
    queue.disable(UnitId::Vdp2);

    let mut ticker = Ticker::new(100, 100);
    queue.force_updates(1234, &mut ticker);

    assert_eq!(ticker.calls, vec![(UnitId::Cdb, 1234)]);
    assert_eq!(queue.event_time(UnitId::Cdb), 1334);
    assert!(!queue.is_armed(UnitId::Vdp2));
}

/// Le rebasage conserve l'ordre et les écarts entre unités
#[test]
fn test_rebase_preserves_relative_order() {
    let mut queue = EventQueue::new();
    queue.schedule(UnitId::Cdb, 1_000_300);
    queue.schedule(UnitId::Vdp2, 1_000_100);
    let order = queue.order();

    queue.rebase(1_000_000);

    assert_eq!(queue.event_time(UnitId::Cdb), 300);
    assert_eq!(queue.event_time(UnitId::Vdp2), 100);
    assert_eq!(queue.order(), order);
}

#[test]
fn test_snapshot_restore() {
    let mut queue = EventQueue::new();
    queue.schedule(UnitId::Cdb, 900);
    queue.schedule(UnitId::Vdp2, 400);
    let snapshot = queue.snapshot();

    let mut restored = EventQueue::new();
    assert!(restored.restore(&snapshot));
    assert_eq!(restored.order(), vec![UnitId::Vdp2, UnitId::Cdb]);
    assert_eq!(restored.event_time(UnitId::Cdb), 900);
    assert_eq!(restored.next_event_time(), 400);
}

/// Une image incohérente réinitialise la file au lieu de la corrompre
#[test]
fn test_corrupted_snapshot_resets_queue() {
    let mut queue = EventQueue::new();
    queue.schedule(UnitId::Cdb, 900);

    let truncated = EventSnapshot {
        times: vec![900],
        order: vec![1],
    };
    assert!(!queue.restore(&truncated));
    assert_eq!(queue.event_time(UnitId::Cdb), 0);
    assert_eq!(queue.order(), vec![UnitId::Cdb, UnitId::Vdp2]);

    let sentinel = EventSnapshot {
        times: vec![10, 20],
        order: vec![0, 1],
    };
    assert!(!queue.restore(&sentinel));

    // La file reste utilisable
    let mut ticker = Ticker::new(10, 10);
    queue.advance_to(0, &mut ticker);
    assert_eq!(ticker.calls.len(), 2);
}

#[test]
fn test_clock_budget_conversions() {
    let ratio = clock_ratio(11_289_600, 28_636_360);

    // Un cycle maître vaut un peu moins de 0,4 cycle lecteur
    let per_master = ratio as f64 / (1u64 << CLOCK_FRAC_BITS) as f64;
    assert!((per_master - 0.3942).abs() < 0.001);

    // L'arrondi supérieur couvre toujours la demande
    let need = fixed_cycles(1000);
    let master = master_cycles_for(need, ratio) as i64;
    assert!(master * ratio as i64 >= need);
    assert!((master - 1) * (ratio as i64) < need);

    // Pas de débordement sur les compteurs « jamais »
    assert_eq!(master_cycles_for(i64::MAX, ratio), Timestamp::MAX);
    assert_eq!(master_cycles_for(-5, ratio), 0);
}
