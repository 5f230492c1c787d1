//! Property tests for the circuit breaker state machine.

use chrono::{Duration, Utc};
use homeostat_core::{AnomalyId, BreakerConfig, BreakerState, ManualClock};
use homeostat_safety::CircuitBreaker;
use proptest::prelude::*;
use std::sync::Arc;

/// Ops act on behalf of one of two runs, picked by index
#[derive(Debug, Clone)]
enum Op {
    Allow(usize),
    Fail,
    Succeed,
    Release(usize),
    Advance(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..2).prop_map(Op::Allow),
        3 => Just(Op::Fail),
        2 => Just(Op::Succeed),
        1 => (0usize..2).prop_map(Op::Release),
        2 => (1i64..400).prop_map(Op::Advance),
    ]
}

fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = BreakerConfig {
        failure_threshold: 3,
        window_secs: 300,
        cooldown_secs: 60,
        max_cooldown_secs: 480,
    };
    (CircuitBreaker::in_memory(config, clock.clone()), clock)
}

proptest! {
    #[test]
    fn failure_never_moves_toward_closed(ops in prop::collection::vec(op(), 1..80)) {
        let (b, clock) = breaker();
        let holders = [AnomalyId::new(), AnomalyId::new()];
        for op in ops {
            let before = b.state("svc");
            match op {
                Op::Allow(h) => { b.allow_for("svc", holders[h]).unwrap(); }
                Op::Fail => {
                    b.record_outcome("svc", false).unwrap();
                    let after = b.state("svc");
                    if before.state != BreakerState::Closed {
                        prop_assert_ne!(after.state, BreakerState::Closed);
                    }
                    if before.state == BreakerState::HalfOpen {
                        prop_assert_eq!(after.state, BreakerState::Open);
                        prop_assert!(after.cooldown_secs >= before.cooldown_secs);
                    }
                }
                Op::Succeed => {
                    b.record_outcome("svc", true).unwrap();
                    let after = b.state("svc");
                    if before.state != BreakerState::Open {
                        prop_assert_eq!(after.state, BreakerState::Closed);
                    }
                }
                Op::Release(h) => { b.release_trial("svc", holders[h]).unwrap(); }
                Op::Advance(secs) => clock.advance(Duration::seconds(secs)),
            }
            let now = b.state("svc");
            prop_assert!(now.cooldown_secs <= 480);
        }
    }

    #[test]
    fn half_open_grants_at_most_one_trial(ops in prop::collection::vec(op(), 1..80)) {
        let (b, clock) = breaker();
        let holders = [AnomalyId::new(), AnomalyId::new()];
        let mut owner: Option<usize> = None;
        for op in ops {
            match op {
                Op::Allow(h) => {
                    let granted = b.allow_for("svc", holders[h]).unwrap();
                    if b.state("svc").state == BreakerState::HalfOpen && granted {
                        if let Some(current) = owner {
                            prop_assert_eq!(current, h);
                        }
                        owner = Some(h);
                    }
                }
                Op::Fail | Op::Succeed => {
                    b.record_outcome("svc", matches!(op, Op::Succeed)).unwrap();
                    owner = None;
                }
                Op::Release(h) => {
                    b.release_trial("svc", holders[h]).unwrap();
                    if owner == Some(h) {
                        owner = None;
                    }
                }
                Op::Advance(secs) => clock.advance(Duration::seconds(secs)),
            }
        }
    }
}

#[test]
fn services_are_isolated_under_concurrency() {
    let (b, _) = breaker();
    let b = Arc::new(b);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let b = Arc::clone(&b);
            std::thread::spawn(move || {
                let service = format!("svc-{}", i % 2);
                for _ in 0..50 {
                    b.record_outcome(&service, i % 2 == 0).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(b.peek("svc-0"), BreakerState::Closed);
    assert_eq!(b.peek("svc-1"), BreakerState::Open);
}
