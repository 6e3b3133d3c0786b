/// Dispatch backend client
///
/// Endpoints (all JSON):
/// - `GET  {base}/urbano/{plate}` - active assignment of a vehicle, 204 when none
/// - `GET  {base}/logurb/{assignment}` - controls already reported for an assignment
/// - `POST {base}/enviocontrol` - report one control
/// - `POST {base}/endruta/{deviceID}` - close the route of a vehicle
/// - `GET  {fleet_base}/ruta/{route}` - last known position of every vehicle on a route
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, error, info, warn};

use crate::config::ApiConfig;
use crate::delivery::{ControlSink, DeliveryError};
use crate::models::{AssignmentResponse, ControlPayload, FleetVehicle, HistoryEntry};
use crate::route::RouteAssignment;
use crate::termination::RouteTerminator;

#[derive(Debug, Clone)]
pub struct DateroClient {
    client: reqwest::Client,
    base_url: String,
    fleet_base_url: String,
}

impl DateroClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ClientError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fleet_base_url: config.fleet_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Active assignment of a vehicle, `None` when no route is running
    pub async fn fetch_assignment(&self, plate: &str) -> Result<Option<RouteAssignment>, ClientError> {
        let url = format!("{}/urbano/{}", self.base_url, urlencoding::encode(plate.trim()));
        debug!(url = %url, "Fetching assignment");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT => {
                info!(plate = %plate, "No active route for vehicle");
                return Ok(None);
            }
            StatusCode::NOT_FOUND => return Err(ClientError::UnknownPlate(plate.to_string())),
            _ => {}
        }

        let text = read_success(response).await?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let parsed: AssignmentResponse = serde_json::from_str(&text).map_err(|e| {
            error!(
                error = %e,
                body_preview = %text.chars().take(200).collect::<String>(),
                "Failed to parse assignment"
            );
            ClientError::ParseError(e.to_string())
        })?;

        if !parsed.is_active() {
            info!(plate = %plate, isruta = %parsed.isruta, "Vehicle has an assignment but no route in progress");
            return Ok(None);
        }

        parsed
            .into_assignment()
            .map(Some)
            .map_err(|e| ClientError::ParseError(e.to_string()))
    }

    /// Controls already reported for an assignment
    pub async fn fetch_history(&self, assignment_code: &str) -> Result<Vec<HistoryEntry>, ClientError> {
        let url = format!("{}/logurb/{}", self.base_url, urlencoding::encode(assignment_code));
        debug!(url = %url, "Fetching control history");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;

        if matches!(response.status(), StatusCode::NO_CONTENT | StatusCode::NOT_FOUND) {
            return Ok(Vec::new());
        }

        let text = read_success(response).await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&text).map_err(|e| {
            error!(error = %e, "Failed to parse control history");
            ClientError::ParseError(e.to_string())
        })
    }

    pub async fn send_control(&self, payload: &ControlPayload) -> Result<(), ClientError> {
        let url = format!("{}/enviocontrol", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;

        read_success(response).await.map(|_| ())
    }

    pub async fn end_route(&self, device_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/endruta/{}", self.base_url, urlencoding::encode(device_id));
        info!(device = %device_id, "Ending route");

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;

        read_success(response).await.map(|_| ())
    }

    pub async fn fetch_fleet(&self, route_code: &str) -> Result<Vec<FleetVehicle>, ClientError> {
        let url = format!("{}/ruta/{}", self.fleet_base_url, urlencoding::encode(route_code));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;

        let text = read_success(response).await?;
        serde_json::from_str(&text).map_err(|e| ClientError::ParseError(e.to_string()))
    }

    /// Whether the backend answers at all; any HTTP status counts as reachable
    pub async fn probe(&self, timeout: Duration) -> bool {
        match self.client.head(&self.base_url).timeout(timeout).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Backend probe failed");
                false
            }
        }
    }
}

/// Body of a 2xx response, or a status error
async fn read_success(response: reqwest::Response) -> Result<String, ClientError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ClientError::NetworkError(e.to_string()))?;

    if !status.is_success() {
        warn!(status = %status, body_preview = %text.chars().take(200).collect::<String>(), "Backend error");
        return Err(ClientError::HttpStatus(status.as_u16()));
    }

    Ok(text)
}

#[async_trait]
impl ControlSink for DateroClient {
    async fn deliver(&self, payload: &ControlPayload) -> Result<(), DeliveryError> {
        self.send_control(payload).await.map_err(DeliveryError::from)
    }
}

#[async_trait]
impl RouteTerminator for DateroClient {
    async fn end_route(&self, device_id: &str) -> Result<(), ClientError> {
        DateroClient::end_route(self, device_id).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Backend answered HTTP {0}")]
    HttpStatus(u16),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("Unknown plate: {0}")]
    UnknownPlate(String),
}

impl From<ClientError> for DeliveryError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::HttpStatus(code) => DeliveryError::Status(code),
            other => DeliveryError::Transport(other.to_string()),
        }
    }
}
