use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::{ControlSink, DeliveryError, DeliveryNotice, DeliveryRecord, QueueStats};
use crate::config::DeliveryConfig;
use crate::models::ControlPayload;
use crate::route::CompletionEvent;

enum Command {
    Enqueue(CompletionEvent),
    Drain,
    Reset,
    Stats(oneshot::Sender<QueueStats>),
    Snapshot(oneshot::Sender<Vec<DeliveryRecord>>),
    Shutdown,
}

/// Result of one delivery attempt, applied back by record id
struct AttemptOutcome {
    id: String,
    result: Result<(), DeliveryError>,
}

/// Cloneable front of the queue actor
#[derive(Clone)]
pub struct DeliveryQueueHandle {
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<QueueStats>,
}

impl DeliveryQueueHandle {
    /// Append a completion event and start a drain
    pub fn enqueue(&self, event: CompletionEvent) {
        self.send(Command::Enqueue(event));
    }

    pub fn drain(&self) {
        self.send(Command::Drain);
    }

    /// Drop every record and cancel the pending retry
    pub fn reset(&self) {
        self.send(Command::Reset);
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    /// Current stats, or the last published ones if the actor is gone
    pub async fn stats(&self) -> QueueStats {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx));
        match rx.await {
            Ok(stats) => stats,
            Err(_) => *self.stats.borrow(),
        }
    }

    pub async fn snapshot(&self) -> Vec<DeliveryRecord> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx));
        rx.await.unwrap_or_default()
    }

    /// Stats published after every enqueue, drain and periodic tick
    pub fn subscribe_stats(&self) -> watch::Receiver<QueueStats> {
        self.stats.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Delivery queue is no longer running");
        }
    }
}

/// Queue actor. Owns the records; nothing else mutates them.
pub struct DeliveryQueue {
    sink: Arc<dyn ControlSink>,
    config: DeliveryConfig,
    tz: Tz,
    records: Vec<DeliveryRecord>,
    sequence: u64,
    is_processing: bool,
    retry_at: Option<Instant>,
    connectivity: watch::Receiver<bool>,
    connectivity_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    finished_tx: mpsc::UnboundedSender<Vec<AttemptOutcome>>,
    finished_rx: mpsc::UnboundedReceiver<Vec<AttemptOutcome>>,
    stats_tx: watch::Sender<QueueStats>,
    notices: mpsc::UnboundedSender<DeliveryNotice>,
}

impl DeliveryQueue {
    /// Start the actor on the current runtime
    pub fn spawn(
        sink: Arc<dyn ControlSink>,
        config: DeliveryConfig,
        tz: Tz,
        connectivity: watch::Receiver<bool>,
    ) -> (DeliveryQueueHandle, mpsc::UnboundedReceiver<DeliveryNotice>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(QueueStats::default());
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let queue = Self {
            sink,
            config,
            tz,
            records: Vec::new(),
            sequence: 0,
            is_processing: false,
            retry_at: None,
            connectivity,
            connectivity_open: true,
            commands,
            finished_tx,
            finished_rx,
            stats_tx,
            notices,
        };
        tokio::spawn(queue.run());

        let handle = DeliveryQueueHandle {
            commands: commands_tx,
            stats: stats_rx,
        };
        (handle, notices_rx)
    }

    async fn run(mut self) {
        info!(
            max_retries = self.config.max_retries,
            retry_secs = self.config.retry_interval_secs,
            "Delivery queue started"
        );

        let mut stats_interval = tokio::time::interval(self.config.stats_interval());
        // Skip the first tick which fires immediately
        stats_interval.tick().await;

        loop {
            let retry_at = self.retry_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(outcomes) = self.finished_rx.recv() => self.apply(outcomes),
                _ = wait_until(retry_at) => {
                    self.retry_at = None;
                    self.drain();
                }
                _ = stats_interval.tick() => {
                    self.publish_stats();
                    self.drain();
                }
                changed = self.connectivity.changed(), if self.connectivity_open => match changed {
                    Ok(()) => {
                        if *self.connectivity.borrow_and_update() {
                            info!(queued = self.records.len(), "Connectivity restored, draining");
                            self.drain();
                        }
                    }
                    Err(_) => self.connectivity_open = false,
                },
            }
        }

        info!(remaining = self.records.len(), "Delivery queue stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(event) => self.enqueue(event),
            Command::Drain => self.drain(),
            Command::Reset => self.reset(),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.records.clone());
            }
            Command::Shutdown => {}
        }
    }

    fn enqueue(&mut self, event: CompletionEvent) {
        self.sequence += 1;
        let record = DeliveryRecord::new(event, self.config.max_retries, self.sequence, Utc::now());

        info!(id = %record.id, waypoint = %record.event.waypoint_name, "Queued completion report");
        self.notify(DeliveryNotice::Queued {
            id: record.id.clone(),
            waypoint: record.event.waypoint_name.clone(),
        });

        self.records.push(record);
        self.publish_stats();
        self.drain();
    }

    fn reset(&mut self) {
        info!(dropped = self.records.len(), "Resetting delivery queue");
        self.records.clear();
        self.retry_at = None;
        self.publish_stats();
    }

    /// Start one pass over every record. A pass already in flight makes this a no-op.
    fn drain(&mut self) {
        if self.is_processing {
            debug!("Drain already in progress");
            return;
        }
        if self.records.is_empty() {
            self.publish_stats();
            return;
        }
        if !*self.connectivity.borrow() {
            info!(queued = self.records.len(), "Offline, deferring delivery");
            self.schedule_retry();
            return;
        }

        self.is_processing = true;
        self.retry_at = None;

        let sent_at = Utc::now().with_timezone(&self.tz).naive_local();
        let attempts: Vec<(String, Option<ControlPayload>)> = self
            .records
            .iter()
            .map(|record| {
                let payload = record
                    .event
                    .is_authorized()
                    .then(|| ControlPayload::from_event(&record.event, sent_at));
                (record.id.clone(), payload)
            })
            .collect();

        debug!(records = attempts.len(), "Starting delivery pass");

        let sink = self.sink.clone();
        let timeout = self.config.attempt_timeout();
        let finished = self.finished_tx.clone();

        tokio::spawn(async move {
            let tasks = attempts.into_iter().map(|(id, payload)| {
                let sink = sink.clone();
                async move {
                    let result = match payload {
                        None => Err(DeliveryError::Unauthorized),
                        Some(payload) => tokio::time::timeout(timeout, sink.deliver(&payload))
                            .await
                            .unwrap_or(Err(DeliveryError::Timeout)),
                    };
                    AttemptOutcome { id, result }
                }
            });

            let outcomes = futures::future::join_all(tasks).await;
            let _ = finished.send(outcomes);
        });
    }

    /// Fold a finished pass back into the live records
    fn apply(&mut self, outcomes: Vec<AttemptOutcome>) {
        self.is_processing = false;

        for outcome in outcomes {
            // Records dropped by a reset during the pass are gone for good
            let Some(position) = self.records.iter().position(|r| r.id == outcome.id) else {
                debug!(id = %outcome.id, "Outcome for a record no longer queued");
                continue;
            };

            match outcome.result {
                Ok(()) => {
                    let record = self.records.remove(position);
                    info!(id = %record.id, waypoint = %record.event.waypoint_name, "Completion report delivered");
                    self.notify(DeliveryNotice::Delivered {
                        id: record.id,
                        waypoint: record.event.waypoint_name,
                    });
                }
                Err(e) if e.is_permanent() => {
                    let record = self.records.remove(position);
                    warn!(id = %record.id, waypoint = %record.event.waypoint_name, error = %e, "Completion report rejected");
                    self.notify(DeliveryNotice::Rejected {
                        id: record.id,
                        waypoint: record.event.waypoint_name,
                    });
                }
                Err(e) => {
                    let record = &mut self.records[position];
                    record.retry_count += 1;

                    if record.is_exhausted() {
                        let record = self.records.remove(position);
                        error!(
                            id = %record.id,
                            waypoint = %record.event.waypoint_name,
                            attempts = record.retry_count,
                            error = %e,
                            "Giving up on completion report"
                        );
                        self.notify(DeliveryNotice::Exhausted {
                            id: record.id,
                            waypoint: record.event.waypoint_name,
                            attempts: record.retry_count,
                        });
                    } else {
                        warn!(
                            id = %record.id,
                            attempt = record.retry_count,
                            max = record.max_retries,
                            error = %e,
                            "Delivery failed, will retry"
                        );
                        let notice = DeliveryNotice::Retrying {
                            id: record.id.clone(),
                            waypoint: record.event.waypoint_name.clone(),
                            attempt: record.retry_count,
                            error: e.to_string(),
                        };
                        self.notify(notice);
                    }
                }
            }
        }

        self.publish_stats();
        if !self.records.is_empty() {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_at.is_none() {
            self.retry_at = Some(Instant::now() + self.config.retry_interval());
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats::from_records(&self.records)
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats());
    }

    fn notify(&self, notice: DeliveryNotice) {
        let _ = self.notices.send(notice);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
