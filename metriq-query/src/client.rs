//! The interface to the remote metrics API.
//!
//! The low-level client and credential resolution live outside of this crate. They are plugged in
//! through a [`ClientFactory`] that hands out one [`MetricsClient`] per region.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchEntry;
use crate::error::ClientError;

/// The message code signalling that a search matched more metrics than the remote API returns.
pub const MAX_METRICS_EXCEEDED: &str = "MaxMetricsExceeded";

/// One outbound request for a single batch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchRequest {
    /// Inclusive start of the queried time range.
    pub start: DateTime<Utc>,
    /// Exclusive end of the queried time range.
    pub end: DateTime<Utc>,
    /// The entries of the batch in builder order.
    pub entries: Vec<BatchEntry>,
    /// The continuation token returned with the previous page, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Completeness of a single [`MetricDataResult`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum StatusCode {
    /// All datapoints were returned.
    #[default]
    Complete,
    /// More datapoints are available on the next page.
    PartialData,
    /// The remote API failed to compute some datapoints.
    InternalError,
    /// The caller is not permitted to read the metric.
    Forbidden,
}

/// One labeled series returned for an entry of a batch.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricDataResult {
    /// The identifier of the entry this result answers.
    pub id: String,
    /// The label of the series.
    pub label: String,
    /// Timestamps of the datapoints, ascending.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Values of the datapoints, parallel to `timestamps`.
    pub values: Vec<f64>,
    /// Whether the series is complete.
    pub status_code: StatusCode,
}

/// A message attached to a [`BatchResponse`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponseMessage {
    /// Machine readable code, such as [`MAX_METRICS_EXCEEDED`].
    pub code: String,
    /// Human readable text.
    pub value: String,
}

/// The answer to one page of a [`BatchRequest`].
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchResponse {
    /// Results for the entries of the batch.
    pub results: Vec<MetricDataResult>,
    /// Advisory messages of the remote API.
    pub messages: Vec<ResponseMessage>,
    /// Set if more pages are available for the same request.
    pub next_token: Option<String>,
}

impl BatchResponse {
    /// Returns `true` if the remote API truncated search results on this page.
    pub fn exceeded_max_metrics(&self) -> bool {
        self.messages.iter().any(|m| m.code == MAX_METRICS_EXCEEDED)
    }
}

/// A client bound to one region of the remote metrics API.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Sends one page of a batch request.
    async fn fetch_batch(&self, request: &BatchRequest) -> Result<BatchResponse, ClientError>;
}

/// Creates region-scoped [`MetricsClient`]s.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Returns a client for the given region.
    async fn client(&self, region: &str) -> Result<Box<dyn MetricsClient>, ClientError>;
}
