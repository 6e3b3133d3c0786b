use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datero::client::DateroClient;
use datero::config::Config;
use datero::connectivity::ConnectivityMonitor;
use datero::delivery::DeliveryQueue;
use datero::fleet::{visible_window, FleetMonitor};
use datero::route::{catalog, PositionFix, RouteProgress};
use datero::session::{RouteSession, SessionHandle};

const POSITION_BUFFER: usize = 64;
const FLEET_WINDOW: usize = 3;

/// One NDJSON line on stdin
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Fix(PositionFix),
    Complete { complete: String, time: String },
    Terminate { terminate: bool },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datero=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DATERO_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".to_string());
    info!(path = %config_path, "Loading configuration");

    let config = Config::load(&config_path)?;
    let tz = config.tz()?;
    let client = DateroClient::new(&config.api)?;

    let Some(assignment) = client.fetch_assignment(&config.plate).await? else {
        info!(plate = %config.plate, "No route in progress, nothing to do");
        return Ok(());
    };
    info!(
        assignment = %assignment.assignment_code,
        route = %assignment.route_code,
        label = catalog::route_label(&assignment.route_code),
        start = %assignment.route_start,
        "Route assignment found"
    );

    let history = match client.fetch_history(&assignment.assignment_code).await {
        Ok(history) => history,
        Err(e) => {
            warn!(error = %e, "Failed to fetch control history, starting from scratch");
            Vec::new()
        }
    };

    let connectivity = ConnectivityMonitor::spawn(client.clone(), &config.connectivity);
    let (queue, notices) = DeliveryQueue::spawn(
        Arc::new(client.clone()),
        config.delivery.clone(),
        tz,
        connectivity,
    );

    if config.fleet.enabled {
        let mut ranking = FleetMonitor::spawn(
            client.clone(),
            &assignment.route_code,
            &config.plate,
            Duration::from_secs(config.fleet.refresh_interval_secs),
        );
        tokio::spawn(async move {
            while ranking.changed().await.is_ok() {
                let ranked = ranking.borrow_and_update().clone();
                for vehicle in visible_window(&ranked, FLEET_WINDOW) {
                    info!(
                        device = %vehicle.device_id,
                        km = vehicle.distance_km,
                        gap_min = ?vehicle.gap_minutes,
                        own = vehicle.is_own,
                        "Fleet"
                    );
                }
            }
        });
    }

    let now = Utc::now().with_timezone(&tz).naive_local();
    let progress = RouteProgress::new(
        assignment,
        &config.hardware_id,
        config.route.progress_settings(),
        &history,
        now,
    );

    let session = RouteSession::new(
        progress,
        queue.clone(),
        notices,
        Arc::new(client.clone()),
        tz,
        config.route.tick_interval(),
    );
    let (positions_tx, positions_rx) = mpsc::channel(POSITION_BUFFER);
    let (handle, mut outputs, mut task) = session.spawn(positions_rx);

    tokio::spawn(read_stdin(positions_tx, handle.clone()));
    tokio::spawn(async move {
        while let Some(output) = outputs.recv().await {
            match serde_json::to_string(&output) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize session output"),
            }
        }
    });

    let end = tokio::select! {
        end = &mut task => end?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            let _ = handle.shutdown().await;
            task.await?
        }
    };

    let stats = queue.stats().await;
    if !stats.is_empty() {
        warn!(queued = stats.total, "Exiting with undelivered reports");
    }
    queue.shutdown();
    info!(end = ?end, "Done");

    Ok(())
}

/// Feed NDJSON position fixes and operator commands from stdin
async fn read_stdin(positions: mpsc::Sender<PositionFix>, handle: SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<InputLine>(&line) {
            Ok(InputLine::Fix(fix)) => {
                if positions.send(fix).await.is_err() {
                    break;
                }
            }
            Ok(InputLine::Complete { complete, time }) => match handle.complete_waypoint(&complete, &time).await {
                Ok(event) => info!(waypoint = %event.waypoint_name, duration = %event.duration, "Marked manually"),
                Err(e) => warn!(waypoint = %complete, error = %e, "Manual completion failed"),
            },
            Ok(InputLine::Terminate { terminate }) => {
                if terminate {
                    if let Err(e) = handle.terminate().await {
                        warn!(error = %e, "Route not terminated");
                    }
                }
            }
            Err(e) => warn!(error = %e, line = %line, "Ignoring malformed input line"),
        }
    }

    info!("Input closed");
}
