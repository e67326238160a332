//! Reconnection controller.
//!
//! A pure reducer: the session feeds it transport lifecycle and external
//! triggers, and performs the effects it returns. Every connect attempt bumps
//! the epoch; scheduled retries carry the epoch they were armed under and are
//! ignored once it moves on. The epoch doubles as the transport generation.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Connected,
    /// A retry timer is armed.
    Waiting,
    /// Attempt budget exhausted; only an external trigger restarts.
    Parked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Visible,
    HealthRecovered,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// First connect, or an identity change.
    Start,
    Opened,
    Failed,
    Closed,
    RetryDue { epoch: u64 },
    Trigger(TriggerReason),
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEffect {
    Connect { epoch: u64 },
    Schedule {
        delay: Duration,
        attempt: u32,
        epoch: u64,
    },
    Park { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct Controller {
    policy: RetryPolicy,
    phase: Phase,
    attempt: u32,
    epoch: u64,
}

impl Controller {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            phase: Phase::Idle,
            attempt: 0,
            epoch: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn handle(&mut self, event: ControlEvent) -> Vec<ControlEffect> {
        match (self.phase, event) {
            (_, ControlEvent::Start) => {
                self.attempt = 0;
                vec![self.connect()]
            }
            (_, ControlEvent::Teardown) => {
                self.epoch += 1;
                self.attempt = 0;
                self.phase = Phase::Idle;
                Vec::new()
            }
            (Phase::Connecting, ControlEvent::Opened) => {
                if self.attempt > 0 {
                    info!(
                        target = "taskchat::reconnect",
                        attempts = self.attempt,
                        "reconnected"
                    );
                }
                self.attempt = 0;
                self.phase = Phase::Connected;
                Vec::new()
            }
            (Phase::Connecting, ControlEvent::Failed | ControlEvent::Closed)
            | (Phase::Connected, ControlEvent::Closed) => self.schedule_retry(),
            // an error on a live socket is always followed by its close
            (Phase::Connected, ControlEvent::Failed) => Vec::new(),
            (Phase::Waiting, ControlEvent::RetryDue { epoch }) if epoch == self.epoch => {
                vec![self.connect()]
            }
            (Phase::Waiting | Phase::Parked, ControlEvent::Trigger(reason)) => {
                debug!(
                    target = "taskchat::reconnect",
                    ?reason,
                    phase = ?self.phase,
                    "external trigger restarts reconnection"
                );
                self.attempt = 0;
                vec![self.connect()]
            }
            _ => Vec::new(),
        }
    }

    fn connect(&mut self) -> ControlEffect {
        self.epoch += 1;
        self.phase = Phase::Connecting;
        ControlEffect::Connect { epoch: self.epoch }
    }

    fn schedule_retry(&mut self) -> Vec<ControlEffect> {
        self.attempt += 1;
        if self.attempt > self.policy.max_reconnect_attempts {
            let attempts = self.attempt - 1;
            warn!(
                target = "taskchat::reconnect",
                attempts, "reconnect attempts exhausted; parking"
            );
            self.phase = Phase::Parked;
            return vec![ControlEffect::Park { attempts }];
        }
        let delay = self.policy.backoff(self.attempt);
        metrics::RECONNECT_ATTEMPTS.inc();
        debug!(
            target = "taskchat::reconnect",
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.phase = Phase::Waiting;
        vec![ControlEffect::Schedule {
            delay,
            attempt: self.attempt,
            epoch: self.epoch,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Controller {
        let mut controller = Controller::new(RetryPolicy::default());
        assert_eq!(
            controller.handle(ControlEvent::Start),
            vec![ControlEffect::Connect { epoch: 1 }]
        );
        controller
    }

    /// Fails the pending connect and fires the resulting timer.
    fn fail_and_fire(controller: &mut Controller) -> Option<Duration> {
        let effects = controller.handle(ControlEvent::Failed);
        match effects.as_slice() {
            [ControlEffect::Schedule { delay, epoch, .. }] => {
                let fired = controller.handle(ControlEvent::RetryDue { epoch: *epoch });
                assert!(matches!(fired.as_slice(), [ControlEffect::Connect { .. }]));
                Some(*delay)
            }
            _ => None,
        }
    }

    #[test]
    fn backoff_sequence_follows_policy() {
        let mut controller = started();
        let delays: Vec<u64> = (0..6)
            .filter_map(|_| fail_and_fire(&mut controller))
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
    }

    #[test]
    fn successful_open_resets_attempts() {
        let mut controller = started();
        fail_and_fire(&mut controller);
        fail_and_fire(&mut controller);
        assert_eq!(controller.attempt(), 2);

        controller.handle(ControlEvent::Opened);
        assert_eq!(controller.phase(), Phase::Connected);
        assert_eq!(controller.attempt(), 0);

        let effects = controller.handle(ControlEvent::Closed);
        assert!(matches!(
            effects.as_slice(),
            [ControlEffect::Schedule {
                attempt: 1,
                delay,
                ..
            }] if *delay == Duration::from_millis(1_000)
        ));
    }

    #[test]
    fn parks_after_attempt_budget_and_waits_for_trigger() {
        let mut controller = started();
        for _ in 0..10 {
            assert!(fail_and_fire(&mut controller).is_some());
        }
        assert_eq!(
            controller.handle(ControlEvent::Failed),
            vec![ControlEffect::Park { attempts: 10 }]
        );
        assert_eq!(controller.phase(), Phase::Parked);

        // stray events do not restart a parked controller
        assert!(controller.handle(ControlEvent::Closed).is_empty());
        assert!(controller
            .handle(ControlEvent::RetryDue {
                epoch: controller.epoch()
            })
            .is_empty());

        let effects = controller.handle(ControlEvent::Trigger(TriggerReason::Manual));
        assert!(matches!(effects.as_slice(), [ControlEffect::Connect { .. }]));
        assert_eq!(controller.attempt(), 0);
    }

    #[test]
    fn stale_timer_is_ignored_after_restart() {
        let mut controller = started();
        let effects = controller.handle(ControlEvent::Failed);
        let [ControlEffect::Schedule { epoch: stale, .. }] = effects.as_slice() else {
            panic!("expected schedule, got {effects:?}");
        };
        let stale = *stale;

        // identity change
        controller.handle(ControlEvent::Start);
        assert!(controller
            .handle(ControlEvent::RetryDue { epoch: stale })
            .is_empty());
        assert_eq!(controller.phase(), Phase::Connecting);
    }

    #[test]
    fn teardown_cancels_pending_retry() {
        let mut controller = started();
        let effects = controller.handle(ControlEvent::Failed);
        let [ControlEffect::Schedule { epoch, .. }] = effects.as_slice() else {
            panic!("expected schedule");
        };
        let epoch = *epoch;
        controller.handle(ControlEvent::Teardown);
        assert!(controller.handle(ControlEvent::RetryDue { epoch }).is_empty());
        assert!(controller.handle(ControlEvent::Closed).is_empty());
        assert!(controller
            .handle(ControlEvent::Trigger(TriggerReason::Visible))
            .is_empty());
        assert_eq!(controller.phase(), Phase::Idle);
    }

    #[test]
    fn error_then_close_on_live_socket_schedules_once() {
        let mut controller = started();
        controller.handle(ControlEvent::Opened);
        assert!(controller.handle(ControlEvent::Failed).is_empty());
        assert_eq!(controller.handle(ControlEvent::Closed).len(), 1);
        assert!(controller.handle(ControlEvent::Closed).is_empty());
    }

    #[test]
    fn triggers_do_not_disturb_a_live_connection() {
        let mut controller = started();
        controller.handle(ControlEvent::Opened);
        assert!(controller
            .handle(ControlEvent::Trigger(TriggerReason::HealthRecovered))
            .is_empty());
        assert_eq!(controller.phase(), Phase::Connected);
    }
}
