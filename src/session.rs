/// Route session
///
/// Single writer of the route state. Position fixes, the one second tick and
/// operator commands are applied strictly one after the other; completion
/// events are handed to the delivery queue and never awaited.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryNotice, DeliveryQueueHandle, QueueStats};
use crate::models::HistoryEntry;
use crate::route::{CompletionEvent, PositionFix, Route, RouteAssignment, RouteError, RouteProgress};
use crate::termination::{RouteTerminator, TerminationDecision, TerminationGuard, TerminationRequest};

const COMMAND_BUFFER: usize = 32;

enum SessionCommand {
    CompleteWaypoint {
        waypoint_id: String,
        clock_time: String,
        reply: oneshot::Sender<Result<CompletionEvent, RouteError>>,
    },
    Terminate {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ReplaceHistory(Vec<HistoryEntry>),
    ReplaceAssignment {
        assignment: RouteAssignment,
        history: Vec<HistoryEntry>,
    },
    Shutdown,
}

/// What the session reports to whoever displays it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionOutput {
    Transition { event: CompletionEvent },
    Delivery { notice: DeliveryNotice },
    Terminated { device_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Terminated,
    Shutdown,
    InputClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is no longer running")]
    Closed,
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("Termination refused: {0}")]
    TerminationRefused(String),
    #[error("Termination failed: {0}")]
    TerminationFailed(String),
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    route: watch::Receiver<Route>,
}

impl SessionHandle {
    /// Mark a waypoint as reached at an operator-entered clock time
    pub async fn complete_waypoint(&self, waypoint_id: &str, clock_time: &str) -> Result<CompletionEvent, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::CompleteWaypoint {
            waypoint_id: waypoint_id.to_string(),
            clock_time: clock_time.to_string(),
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Ask to end the route; refused while reports are still queued
    pub async fn terminate(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Terminate { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn replace_history(&self, history: Vec<HistoryEntry>) -> Result<(), SessionError> {
        self.send(SessionCommand::ReplaceHistory(history)).await
    }

    pub async fn replace_assignment(&self, assignment: RouteAssignment, history: Vec<HistoryEntry>) -> Result<(), SessionError> {
        self.send(SessionCommand::ReplaceAssignment { assignment, history }).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown).await
    }

    /// Latest route state, refreshed on every transition and tick
    pub fn route(&self) -> watch::Receiver<Route> {
        self.route.clone()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::Closed)
    }
}

pub struct RouteSession {
    progress: RouteProgress,
    queue: DeliveryQueueHandle,
    notices: mpsc::UnboundedReceiver<DeliveryNotice>,
    stats: watch::Receiver<QueueStats>,
    terminator: Arc<dyn RouteTerminator>,
    guard: TerminationGuard,
    tz: Tz,
    tick_interval: Duration,
}

impl RouteSession {
    pub fn new(
        progress: RouteProgress,
        queue: DeliveryQueueHandle,
        notices: mpsc::UnboundedReceiver<DeliveryNotice>,
        terminator: Arc<dyn RouteTerminator>,
        tz: Tz,
        tick_interval: Duration,
    ) -> Self {
        let stats = queue.subscribe_stats();
        Self {
            progress,
            queue,
            notices,
            stats,
            terminator,
            guard: TerminationGuard::new(),
            tz,
            tick_interval,
        }
    }

    /// Run the session on its own task
    pub fn spawn(
        self,
        positions: mpsc::Receiver<PositionFix>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionOutput>, JoinHandle<SessionEnd>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (route_tx, route_rx) = watch::channel(self.progress.route().clone());
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(self.run(positions, commands, route_tx, output_tx));

        let handle = SessionHandle {
            commands: commands_tx,
            route: route_rx,
        };
        (handle, output_rx, task)
    }

    async fn run(
        mut self,
        mut positions: mpsc::Receiver<PositionFix>,
        mut commands: mpsc::Receiver<SessionCommand>,
        route: watch::Sender<Route>,
        output: mpsc::UnboundedSender<SessionOutput>,
    ) -> SessionEnd {
        let assignment = self.progress.assignment();
        info!(
            assignment = %assignment.assignment_code,
            route = %assignment.route_code,
            device = %assignment.device_id,
            view_only = self.progress.is_view_only(),
            "Route session started"
        );

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut positions_open = true;
        let mut commands_open = true;
        let mut notices_open = true;
        let mut stats_open = true;

        let end = loop {
            if !positions_open && !commands_open {
                break SessionEnd::InputClosed;
            }

            tokio::select! {
                fix = positions.recv(), if positions_open => match fix {
                    Some(fix) => {
                        let now = self.local_time(fix.timestamp);
                        if let Some(event) = self.progress.on_position(&fix, now) {
                            self.dispatch(event, &output);
                            route.send_replace(self.progress.route().clone());
                            if self.try_terminate(TerminationRequest::Automatic, &output).await {
                                break SessionEnd::Terminated;
                            }
                        }
                    }
                    None => {
                        info!("Position feed closed");
                        positions_open = false;
                    }
                },
                _ = tick.tick() => {
                    let now = self.local_time(None);
                    if let Some(event) = self.progress.tick(now) {
                        self.dispatch(event, &output);
                        if self.try_terminate(TerminationRequest::Automatic, &output).await {
                            break SessionEnd::Terminated;
                        }
                    }
                    route.send_replace(self.progress.route().clone());
                }
                command = commands.recv(), if commands_open => match command {
                    Some(SessionCommand::Shutdown) => break SessionEnd::Shutdown,
                    Some(command) => {
                        if self.handle(command, &output).await {
                            break SessionEnd::Terminated;
                        }
                        route.send_replace(self.progress.route().clone());
                    }
                    None => commands_open = false,
                },
                changed = self.stats.changed(), if stats_open => match changed {
                    Ok(()) => {
                        let stats = *self.stats.borrow_and_update();
                        debug!(total = stats.total, pending = stats.pending, failed = stats.failed, "Queue stats");
                        if self.progress.route().terminal_reached()
                            && self.try_terminate(TerminationRequest::Automatic, &output).await
                        {
                            break SessionEnd::Terminated;
                        }
                    }
                    Err(_) => stats_open = false,
                },
                notice = self.notices.recv(), if notices_open => match notice {
                    Some(notice) => {
                        let _ = output.send(SessionOutput::Delivery { notice });
                    }
                    None => notices_open = false,
                },
            }
        };

        info!(end = ?end, "Route session finished");
        end
    }

    /// Returns true when the route was terminated
    async fn handle(&mut self, command: SessionCommand, output: &mpsc::UnboundedSender<SessionOutput>) -> bool {
        match command {
            SessionCommand::CompleteWaypoint {
                waypoint_id,
                clock_time,
                reply,
            } => {
                let now = self.local_time(None);
                let result = self.progress.complete_manually(&waypoint_id, &clock_time, now);
                match &result {
                    Ok(event) => self.dispatch(event.clone(), output),
                    Err(e) => warn!(waypoint = %waypoint_id, error = %e, "Manual completion refused"),
                }
                let _ = reply.send(result);
                self.try_terminate(TerminationRequest::Automatic, output).await
            }
            SessionCommand::Terminate { reply } => {
                let result = self.terminate_manually(output).await;
                let terminated = result.is_ok();
                let _ = reply.send(result);
                terminated
            }
            SessionCommand::ReplaceHistory(history) => {
                self.progress.replace_history(&history, self.local_time(None));
                false
            }
            SessionCommand::ReplaceAssignment { assignment, history } => {
                self.progress.replace_assignment(assignment, &history, self.local_time(None));
                false
            }
            SessionCommand::Shutdown => false,
        }
    }

    fn dispatch(&self, event: CompletionEvent, output: &mpsc::UnboundedSender<SessionOutput>) {
        if !event.is_authorized() {
            debug!(waypoint = %event.waypoint_name, "View-only device, report will be refused");
        }
        self.queue.enqueue(event.clone());
        let _ = output.send(SessionOutput::Transition { event });
    }

    async fn try_terminate(&mut self, request: TerminationRequest, output: &mpsc::UnboundedSender<SessionOutput>) -> bool {
        let terminal_reached = self.progress.route().terminal_reached();
        if request == TerminationRequest::Automatic && !terminal_reached {
            return false;
        }

        let stats = self.queue.stats().await;
        let decision = self
            .guard
            .evaluate(request, terminal_reached, !self.progress.is_view_only(), stats);

        match decision {
            TerminationDecision::Proceed => self.execute_termination(output).await.is_ok(),
            TerminationDecision::QueueNotDrained(stats) => {
                debug!(queued = stats.total, "Waiting for queue to drain before ending route");
                false
            }
            TerminationDecision::Unauthorized { notify } => {
                if notify {
                    warn!("This device is not assigned to the route and cannot end it");
                }
                false
            }
            TerminationDecision::NotYet | TerminationDecision::AlreadyTerminating => false,
        }
    }

    async fn terminate_manually(&mut self, output: &mpsc::UnboundedSender<SessionOutput>) -> Result<(), SessionError> {
        let stats = self.queue.stats().await;
        let decision = self.guard.evaluate(
            TerminationRequest::Manual,
            self.progress.route().terminal_reached(),
            !self.progress.is_view_only(),
            stats,
        );

        match decision {
            TerminationDecision::Proceed => self.execute_termination(output).await,
            TerminationDecision::QueueNotDrained(stats) => Err(SessionError::TerminationRefused(format!(
                "{} reports still queued",
                stats.total
            ))),
            TerminationDecision::Unauthorized { .. } => Err(SessionError::TerminationRefused(
                "device is not assigned to this route".to_string(),
            )),
            TerminationDecision::AlreadyTerminating => Err(SessionError::TerminationRefused(
                "termination already in progress".to_string(),
            )),
            TerminationDecision::NotYet => Err(SessionError::TerminationRefused("terminal stop not reached".to_string())),
        }
    }

    async fn execute_termination(&mut self, output: &mpsc::UnboundedSender<SessionOutput>) -> Result<(), SessionError> {
        let device_id = self.progress.assignment().device_id.clone();
        match self
            .guard
            .execute(self.terminator.as_ref(), &device_id, &self.queue)
            .await
        {
            Ok(()) => {
                let _ = output.send(SessionOutput::Terminated { device_id });
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Could not end route");
                Err(SessionError::TerminationFailed(e.to_string()))
            }
        }
    }

    /// Wall-clock time in the route's time zone
    fn local_time(&self, timestamp: Option<DateTime<Utc>>) -> NaiveDateTime {
        timestamp
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.tz)
            .naive_local()
    }
}
