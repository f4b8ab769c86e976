//! FSM unit tests

use std::time::Duration;

use pisync::sync::fsm::{SchedulerEvent, SchedulerFsm, SchedulerState};
use pisync::utils::CooldownOptions;

fn cooldown() -> CooldownOptions {
    CooldownOptions {
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    }
}

fn fail_cycle(fsm: &mut SchedulerFsm, trigger: SchedulerEvent) {
    fsm.process(trigger).unwrap();
    fsm.process(SchedulerEvent::CycleFailed("connection reset".to_string()))
        .unwrap();
}

#[test]
fn test_fsm_initial_state() {
    let fsm = SchedulerFsm::new(cooldown());
    assert_eq!(fsm.state(), SchedulerState::Idle);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.err_streak(), 0);
    assert_eq!(
        fsm.next_wait(Duration::from_secs(3600)),
        Some(Duration::from_secs(3600))
    );
}

#[test]
fn test_fsm_update_flow() {
    let mut fsm = SchedulerFsm::new(cooldown());

    // Idle -> Checking
    fsm.process(SchedulerEvent::CheckRequested).unwrap();
    assert_eq!(fsm.state(), SchedulerState::Checking);

    // Checking -> Applying
    fsm.process(SchedulerEvent::ManifestFetched { changed: true })
        .unwrap();
    assert_eq!(fsm.state(), SchedulerState::Applying);

    // Applying -> Idle
    fsm.process(SchedulerEvent::JobsResolved).unwrap();
    assert_eq!(fsm.state(), SchedulerState::Idle);
}

#[test]
fn test_fsm_unchanged_manifest_skips_applying() {
    let mut fsm = SchedulerFsm::new(cooldown());

    fsm.process(SchedulerEvent::TimerFired).unwrap();
    fsm.process(SchedulerEvent::ManifestFetched { changed: false })
        .unwrap();
    assert_eq!(fsm.state(), SchedulerState::Idle);
}

#[test]
fn test_fsm_backoff_grows_then_caps() {
    let mut fsm = SchedulerFsm::new(cooldown());
    let interval = Duration::from_secs(3600);

    fail_cycle(&mut fsm, SchedulerEvent::TimerFired);
    assert_eq!(fsm.state(), SchedulerState::Backoff);
    assert_eq!(fsm.error(), Some("connection reset"));
    let first = fsm.next_wait(interval).unwrap();

    fail_cycle(&mut fsm, SchedulerEvent::BackoffElapsed);
    let second = fsm.next_wait(interval).unwrap();

    fail_cycle(&mut fsm, SchedulerEvent::BackoffElapsed);
    let third = fsm.next_wait(interval).unwrap();

    fail_cycle(&mut fsm, SchedulerEvent::BackoffElapsed);
    let fourth = fsm.next_wait(interval).unwrap();

    assert_eq!(fsm.err_streak(), 4);
    assert_eq!(first, Duration::from_secs(10));
    assert_eq!(second, Duration::from_secs(20));
    assert!(first < second && second < third);
    assert_eq!(third, Duration::from_secs(30));
    assert_eq!(fourth, third);
}

#[test]
fn test_fsm_success_resets_streak() {
    let mut fsm = SchedulerFsm::new(cooldown());

    fail_cycle(&mut fsm, SchedulerEvent::TimerFired);
    fail_cycle(&mut fsm, SchedulerEvent::BackoffElapsed);
    assert_eq!(fsm.err_streak(), 2);

    fsm.process(SchedulerEvent::BackoffElapsed).unwrap();
    fsm.process(SchedulerEvent::ManifestFetched { changed: true })
        .unwrap();
    fsm.process(SchedulerEvent::JobsResolved).unwrap();

    assert_eq!(fsm.state(), SchedulerState::Idle);
    assert_eq!(fsm.err_streak(), 0);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.backoff_delay(), Duration::from_secs(10));
}

#[test]
fn test_fsm_check_request_cuts_backoff_short() {
    let mut fsm = SchedulerFsm::new(cooldown());

    fail_cycle(&mut fsm, SchedulerEvent::TimerFired);
    fsm.process(SchedulerEvent::CheckRequested).unwrap();
    assert_eq!(fsm.state(), SchedulerState::Checking);
}

#[test]
fn test_fsm_halt_is_terminal() {
    let mut fsm = SchedulerFsm::new(cooldown());

    fsm.process(SchedulerEvent::TimerFired).unwrap();
    fsm.process(SchedulerEvent::Halt("401: Invalid signature".to_string()))
        .unwrap();
    assert!(fsm.is_halted());
    assert_eq!(fsm.error(), Some("401: Invalid signature"));
    assert_eq!(fsm.next_wait(Duration::from_secs(3600)), None);

    assert!(fsm.process(SchedulerEvent::TimerFired).is_err());
    assert!(fsm.process(SchedulerEvent::CheckRequested).is_err());
    assert!(fsm.process(SchedulerEvent::Halt("again".to_string())).is_err());
    assert_eq!(fsm.state(), SchedulerState::Halted);
}

#[test]
fn test_fsm_halt_from_backoff() {
    let mut fsm = SchedulerFsm::new(cooldown());

    fail_cycle(&mut fsm, SchedulerEvent::TimerFired);
    fsm.process(SchedulerEvent::Halt("credential revoked".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), SchedulerState::Halted);
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = SchedulerFsm::new(cooldown());

    // Nothing to resolve or back off from while idle
    assert!(fsm.process(SchedulerEvent::JobsResolved).is_err());
    assert!(fsm.process(SchedulerEvent::BackoffElapsed).is_err());
    assert!(fsm
        .process(SchedulerEvent::CycleFailed("x".to_string()))
        .is_err());
    assert_eq!(fsm.state(), SchedulerState::Idle);

    // A second trigger mid-check is rejected
    fsm.process(SchedulerEvent::TimerFired).unwrap();
    assert!(fsm.process(SchedulerEvent::CheckRequested).is_err());
    assert_eq!(fsm.state(), SchedulerState::Checking);
}
