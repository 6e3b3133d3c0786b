/// Backend reachability monitor
///
/// Probes the backend on a fixed interval and publishes the result on a
/// watch channel. Consumers react to the false to true edge.
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::DateroClient;
use crate::config::ConnectivityConfig;

pub struct ConnectivityMonitor {
    client: DateroClient,
    interval: Duration,
    probe_timeout: Duration,
    online: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Start probing. The channel starts offline until the first probe answers.
    pub fn spawn(client: DateroClient, config: &ConnectivityConfig) -> watch::Receiver<bool> {
        let (online, rx) = watch::channel(false);
        let monitor = Self {
            client,
            interval: Duration::from_secs(config.probe_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs.max(1)),
            online,
        };
        tokio::spawn(monitor.run());
        rx
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;

            let reachable = self.client.probe(self.probe_timeout).await;
            let changed = self.online.send_if_modified(|current| {
                let changed = *current != reachable;
                *current = reachable;
                changed
            });

            if changed {
                if reachable {
                    info!("Backend reachable");
                } else {
                    warn!("Backend unreachable, reports will be queued");
                }
            }

            if self.online.is_closed() {
                break;
            }
        }
    }
}
