/// Route termination guard
///
/// A route may only be closed on the backend once every completion report
/// has left the delivery queue. Automatic termination additionally waits
/// for the terminal stop to reach a final status.
use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::ClientError;
use crate::delivery::{DeliveryQueueHandle, QueueStats};

#[async_trait]
pub trait RouteTerminator: Send + Sync {
    async fn end_route(&self, device_id: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationRequest {
    /// The terminal stop was reached
    Automatic,
    /// The operator asked to end the route
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationDecision {
    Proceed,
    /// Terminal stop still open
    NotYet,
    QueueNotDrained(QueueStats),
    /// `notify` is set only the first time in a row this is refused
    Unauthorized { notify: bool },
    AlreadyTerminating,
}

#[derive(Debug, Default)]
pub struct TerminationGuard {
    terminating: bool,
    unauthorized_notified: bool,
}

impl TerminationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// Decide whether a termination may start. `Proceed` marks the guard as
    /// terminating until [`TerminationGuard::finish`] is called.
    pub fn evaluate(
        &mut self,
        request: TerminationRequest,
        terminal_reached: bool,
        authorized: bool,
        stats: QueueStats,
    ) -> TerminationDecision {
        if self.terminating {
            return TerminationDecision::AlreadyTerminating;
        }
        if request == TerminationRequest::Automatic && !terminal_reached {
            return TerminationDecision::NotYet;
        }
        if !authorized {
            let notify = !self.unauthorized_notified;
            self.unauthorized_notified = true;
            return TerminationDecision::Unauthorized { notify };
        }
        self.unauthorized_notified = false;

        if !stats.is_empty() {
            return TerminationDecision::QueueNotDrained(stats);
        }

        self.terminating = true;
        TerminationDecision::Proceed
    }

    pub fn finish(&mut self) {
        self.terminating = false;
    }

    /// Close the route after a `Proceed` decision. On success the delivery
    /// queue is reset.
    pub async fn execute(
        &mut self,
        terminator: &dyn RouteTerminator,
        device_id: &str,
        queue: &DeliveryQueueHandle,
    ) -> Result<(), ClientError> {
        let result = terminator.end_route(device_id).await;
        self.finish();

        match &result {
            Ok(()) => {
                info!(device = %device_id, "Route terminated");
                queue.reset();
            }
            Err(e) => warn!(device = %device_id, error = %e, "Route termination failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drained() -> QueueStats {
        QueueStats::default()
    }

    fn backlog() -> QueueStats {
        QueueStats {
            total: 2,
            pending: 2,
            failed: 0,
        }
    }

    #[test]
    fn automatic_waits_for_terminal_stop() {
        let mut guard = TerminationGuard::new();
        assert_eq!(
            guard.evaluate(TerminationRequest::Automatic, false, true, drained()),
            TerminationDecision::NotYet
        );
        assert_eq!(
            guard.evaluate(TerminationRequest::Automatic, true, true, drained()),
            TerminationDecision::Proceed
        );
    }

    #[test]
    fn both_requests_wait_for_empty_queue() {
        let mut guard = TerminationGuard::new();
        assert_eq!(
            guard.evaluate(TerminationRequest::Automatic, true, true, backlog()),
            TerminationDecision::QueueNotDrained(backlog())
        );
        assert_eq!(
            guard.evaluate(TerminationRequest::Manual, false, true, backlog()),
            TerminationDecision::QueueNotDrained(backlog())
        );
        assert_eq!(
            guard.evaluate(TerminationRequest::Manual, false, true, drained()),
            TerminationDecision::Proceed
        );
    }

    #[test]
    fn no_overlapping_terminations() {
        let mut guard = TerminationGuard::new();
        assert_eq!(
            guard.evaluate(TerminationRequest::Manual, false, true, drained()),
            TerminationDecision::Proceed
        );
        assert!(guard.is_terminating());
        assert_eq!(
            guard.evaluate(TerminationRequest::Automatic, true, true, drained()),
            TerminationDecision::AlreadyTerminating
        );

        guard.finish();
        assert_eq!(
            guard.evaluate(TerminationRequest::Manual, false, true, drained()),
            TerminationDecision::Proceed
        );
    }

    #[test]
    fn unauthorized_notice_shown_once_until_authorized() {
        let mut guard = TerminationGuard::new();
        assert_eq!(
            guard.evaluate(TerminationRequest::Automatic, true, false, drained()),
            TerminationDecision::Unauthorized { notify: true }
        );
        assert_eq!(
            guard.evaluate(TerminationRequest::Automatic, true, false, drained()),
            TerminationDecision::Unauthorized { notify: false }
        );

        assert_eq!(
            guard.evaluate(TerminationRequest::Manual, false, true, backlog()),
            TerminationDecision::QueueNotDrained(backlog())
        );
        assert_eq!(
            guard.evaluate(TerminationRequest::Manual, false, false, drained()),
            TerminationDecision::Unauthorized { notify: true }
        );
    }
}
