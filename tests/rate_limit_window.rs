use chrono::Duration;
use volley::bot::RateLimiter;

mod common;
use common::t0;

#[test]
fn three_pings_then_silence_until_window_passes() {
    // quota 3 per 360s: t=0,10,20 admitted, t=30 refused, t=361 admitted again
    let mut rl = RateLimiter::default();
    let at = |s: i64| t0() + Duration::seconds(s);
    assert!(rl.admit("A", at(0)));
    assert!(rl.admit("A", at(10)));
    assert!(rl.admit("A", at(20)));
    assert!(!rl.admit("A", at(30)));
    assert!(rl.admit("A", at(361)));
}

#[test]
fn never_more_than_quota_in_any_window() {
    let mut rl = RateLimiter::new(std::time::Duration::from_secs(60), 3);
    let mut admitted = Vec::new();
    for s in (0..600).step_by(7) {
        let now = t0() + Duration::seconds(s);
        if rl.admit("B", now) {
            admitted.push(s);
        }
    }
    for (i, start) in admitted.iter().enumerate() {
        let in_window = admitted[i..].iter().filter(|s| **s - *start < 60).count();
        assert!(in_window <= 3, "window at {start}s holds {in_window}");
    }
    assert!(admitted.len() > 3);
}

#[test]
fn housekeeping_bounds_memory() {
    let mut rl = RateLimiter::default();
    for i in 0..1000 {
        rl.admit(&format!("node{i}"), t0());
    }
    assert_eq!(rl.tracked(), 1000);
    assert_eq!(rl.forget_idle(t0() + Duration::seconds(359)), 0);
    assert_eq!(rl.forget_idle(t0() + Duration::seconds(360)), 1000);
    assert_eq!(rl.tracked(), 0);
}
