//! Periodic health monitoring of the primary, run only by standbys.
//!
//! Each cycle runs [`health::assess`] and feeds the verdict into a
//! consecutive-failure counter. Reaching the threshold emits one
//! [`Alert`] and resets the counter; the operator decides whether to
//! promote.

use crate::health::{self, HealthAssessment, PrimaryProbe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Counts consecutive non-healthy verdicts.
#[derive(Debug, Clone)]
pub struct FailureCounter {
    threshold: u32,
    consecutive: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Record a verdict. Returns true exactly when the threshold is reached,
    /// after which the count starts over.
    pub fn observe(&mut self, assessment: &HealthAssessment) -> bool {
        if assessment.is_healthy() {
            self.consecutive = 0;
            return false;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }
}

/// Notification that the primary has failed enough cycles in a row.
#[derive(Debug, Clone)]
pub struct Alert {
    pub assessment: HealthAssessment,
    pub failed_cycles: u32,
}

pub struct HealthMonitor {
    probe: Arc<dyn PrimaryProbe>,
    interval: Duration,
    counter: FailureCounter,
    latest: watch::Sender<Option<HealthAssessment>>,
    alerts: mpsc::Sender<Alert>,
}

impl HealthMonitor {
    /// Returns the monitor and a receiver that always holds the most recent
    /// assessment (`None` until the first cycle completes).
    pub fn new(
        probe: Arc<dyn PrimaryProbe>,
        interval: Duration,
        threshold: u32,
        alerts: mpsc::Sender<Alert>,
    ) -> (Self, watch::Receiver<Option<HealthAssessment>>) {
        let (latest, rx) = watch::channel(None);
        let monitor = Self {
            probe,
            interval,
            counter: FailureCounter::new(threshold),
            latest,
            alerts,
        };
        (monitor, rx)
    }

    /// Run one cycle: assess, publish, count, maybe alert.
    pub async fn check_once(&mut self) -> HealthAssessment {
        let assessment = health::assess(self.probe.as_ref()).await;
        if assessment.is_healthy() {
            tracing::debug!("primary healthy: {}", assessment.detail);
        } else {
            tracing::warn!(
                consecutive = self.counter.consecutive() + 1,
                "primary {}",
                assessment.summary()
            );
        }
        self.latest.send_replace(Some(assessment.clone()));

        if self.counter.observe(&assessment) {
            let alert = Alert {
                assessment: assessment.clone(),
                failed_cycles: self.counter.threshold,
            };
            if self.alerts.send(alert).await.is_err() {
                tracing::debug!("alert receiver dropped");
            }
        }
        assessment
    }

    /// Check on a fixed interval until `cancel` fires. Cancellation is
    /// observed both between and during checks.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            threshold = self.counter.threshold,
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.check_once() => {}
            }
        }
        tracing::info!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CheckLevel, Verdict};

    fn verdict(v: Verdict) -> HealthAssessment {
        HealthAssessment::new(v, CheckLevel::Api, "test")
    }

    #[test]
    fn below_threshold_does_not_notify() {
        let mut counter = FailureCounter::new(3);
        assert!(!counter.observe(&verdict(Verdict::Down)));
        assert!(!counter.observe(&verdict(Verdict::Degraded)));
        assert_eq!(counter.consecutive(), 2);
    }

    #[test]
    fn threshold_notifies_once_and_resets() {
        let mut counter = FailureCounter::new(2);
        assert!(!counter.observe(&verdict(Verdict::Down)));
        assert!(counter.observe(&verdict(Verdict::Down)));
        assert_eq!(counter.consecutive(), 0);
        assert!(!counter.observe(&verdict(Verdict::Healthy)));
        assert!(!counter.observe(&verdict(Verdict::Down)));
    }

    #[test]
    fn healthy_cycle_resets_streak() {
        let mut counter = FailureCounter::new(2);
        assert!(!counter.observe(&verdict(Verdict::Degraded)));
        assert!(!counter.observe(&verdict(Verdict::Healthy)));
        assert!(!counter.observe(&verdict(Verdict::Degraded)));
        assert_eq!(counter.consecutive(), 1);
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let mut counter = FailureCounter::new(0);
        assert!(counter.observe(&verdict(Verdict::Down)));
    }
}
