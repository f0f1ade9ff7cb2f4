use super::*;

#[test]
fn test_token_bucket_gating() {
    let t0 = Instant::now();
    let mut p = EmitPacer::new(10.0, 1.0, 100.0, t0);

    // One token is primed at construction.
    assert!(p.try_take(t0));
    assert!(!p.try_take(t0), "bucket must be empty after the primed token");

    // At 10 chunks/sec a token is back 100ms later.
    assert!(p.next_token_at(t0).is_some());
    let t1 = t0 + Duration::from_millis(100);
    assert!(p.try_take(t1));
    assert!(!p.try_take(t1));
}

#[test]
fn test_bucket_capacity_bounds_bursts() {
    let t0 = Instant::now();
    let mut p = EmitPacer::new(100.0, 1.0, 1000.0, t0);

    // A long idle gap refills at most one update interval's worth (10 tokens).
    let t1 = t0 + Duration::from_secs(60);
    let mut emitted = 0;
    while p.try_take(t1) {
        emitted += 1;
    }
    assert_eq!(emitted, 10);
}

#[test]
fn test_rate_increases_under_pressure() {
    let t0 = Instant::now();
    let mut p = EmitPacer::new(100.0, 10.0, 1000.0, t0);

    let mut now = t0;
    for _ in 0..5 {
        now += PACER_UPDATE_INTERVAL;
        p.on_request();
        assert!(p.maybe_update(500.0, now), "pressure 5x rate must raise it");
    }
    let expected = 100.0 * 1.1f64.powi(5);
    assert!((p.rate() - expected).abs() < 1e-6);
    assert_eq!(p.adjustments(), 5);
}

#[test]
fn test_rate_capped_and_floored() {
    let t0 = Instant::now();
    let mut p = EmitPacer::new(95.0, 90.0, 100.0, t0);

    let mut now = t0 + PACER_UPDATE_INTERVAL;
    p.on_request();
    assert!(p.maybe_update(1e6, now));
    assert_eq!(p.rate(), 100.0);

    // Idle intervals decay toward the floor and stop adjusting there.
    for _ in 0..20 {
        now += PACER_UPDATE_INTERVAL;
        p.maybe_update(0.0, now);
    }
    assert_eq!(p.rate(), 90.0);
    let adjustments = p.adjustments();
    now += PACER_UPDATE_INTERVAL;
    assert!(!p.maybe_update(0.0, now));
    assert_eq!(p.adjustments(), adjustments, "clamped idle makes no new events");
}

#[test]
fn test_rate_steady_under_matched_demand() {
    let t0 = Instant::now();
    let mut p = EmitPacer::new(100.0, 10.0, 1000.0, t0);

    // Demand at the current rate: pressure below the overshoot threshold and
    // requests present, so the rate must hold steady.
    let mut now = t0;
    for _ in 0..10 {
        now += PACER_UPDATE_INTERVAL;
        p.on_request();
        assert!(!p.maybe_update(100.0, now));
    }
    assert_eq!(p.rate(), 100.0);
    assert_eq!(p.adjustments(), 0);
}

#[test]
fn test_update_interval_is_respected() {
    let t0 = Instant::now();
    let mut p = EmitPacer::new(100.0, 10.0, 1000.0, t0);
    p.on_request();
    assert!(!p.maybe_update(1e6, t0 + Duration::from_millis(50)));
    assert!(p.maybe_update(1e6, t0 + Duration::from_millis(150)));
}

#[test]
fn test_window_halves_on_retransmit() {
    let t0 = Instant::now();
    let mut w = WindowPacer::new(16, 256, t0);
    w.on_retransmit();
    assert_eq!(w.window(), 8);
    w.on_retransmit();
    w.on_retransmit();
    assert_eq!(w.window(), 2);
    w.on_retransmit();
    assert_eq!(w.window(), 2, "window never drops below the floor");
}

#[test]
fn test_window_additive_increase() {
    let t0 = Instant::now();
    let mut w = WindowPacer::new(4, 256, t0);

    // Clean interval with the window's worth of arrivals grows by one.
    for _ in 0..4 {
        w.on_received();
    }
    assert!(w.maybe_update(t0 + PACER_UPDATE_INTERVAL));
    assert_eq!(w.window(), 5);

    // An interval with too few arrivals does not grow.
    w.on_received();
    assert!(!w.maybe_update(t0 + 2 * PACER_UPDATE_INTERVAL));
    assert_eq!(w.window(), 5);
}

#[test]
fn test_window_retransmit_blocks_growth() {
    let t0 = Instant::now();
    let mut w = WindowPacer::new(4, 256, t0);
    for _ in 0..10 {
        w.on_received();
    }
    w.on_retransmit();
    assert!(!w.maybe_update(t0 + PACER_UPDATE_INTERVAL));
    assert_eq!(w.window(), 2);
}

#[test]
fn test_window_cap() {
    let t0 = Instant::now();
    let mut w = WindowPacer::new(8, 8, t0);
    for _ in 0..8 {
        w.on_received();
    }
    assert!(!w.maybe_update(t0 + PACER_UPDATE_INTERVAL));
    assert_eq!(w.window(), 8);
}

#[test]
fn test_window_stabilizes_above_floor_without_loss() {
    // A receiver that keeps its window busy and never retransmits settles
    // into monotonic growth; five clean intervals from the default window.
    let t0 = Instant::now();
    let mut w = WindowPacer::new(16, 256, t0);
    let mut now = t0;
    for i in 0..5 {
        for _ in 0..w.window() {
            w.on_received();
        }
        now += PACER_UPDATE_INTERVAL;
        assert!(w.maybe_update(now));
        assert_eq!(w.window(), 17 + i);
    }
    assert!(w.window() > WINDOW_FLOOR);
}
