//! Helpers for testing query execution.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner. All logs emitted with [`metriq_log`] will show up for test
//!    failures or when run with `--nocapture`.
//!  - Use [`MockClientFactory`] in place of the real remote API. It answers batches through a
//!    closure and records every request it receives.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     metriq_test::setup();
//!
//!     let factory = metriq_test::MockClientFactory::echo().fail_region("eu-west-1");
//!     metriq_log::debug!("hello, world!");
//!     assert!(factory.requests().is_empty());
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use metriq_query::{
    BatchRequest, BatchResponse, ClientError, ClientFactory, MetricDataResult, MetricsClient,
    RequestQuery, StatusCode, TimeRange,
};
use parking_lot::Mutex;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate and mutes all other logs.
pub fn setup() {
    metriq_log::init_test!();
}

/// Closure answering one page request of a region.
pub type Responder =
    Arc<dyn Fn(&str, &BatchRequest) -> Result<BatchResponse, ClientError> + Send + Sync>;

/// A page request received by a [`ScriptedClient`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    /// The region of the client that received the request.
    pub region: String,
    /// The request as sent by the dispatcher.
    pub request: BatchRequest,
}

impl RecordedRequest {
    /// Returns the entry ids of the request in order.
    pub fn ids(&self) -> Vec<&str> {
        self.request.entries.iter().map(|e| e.id.as_str()).collect()
    }
}

/// A [`ClientFactory`] handing out [`ScriptedClient`]s.
pub struct MockClientFactory {
    responder: Responder,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockClientFactory {
    /// Creates a factory whose clients answer through `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &BatchRequest) -> Result<BatchResponse, ClientError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            failing: HashSet::new(),
            delays: HashMap::new(),
            requests: Arc::default(),
        }
    }

    /// Creates a factory whose clients answer with [`echo_response`].
    pub fn echo() -> Self {
        Self::new(|_, request| Ok(echo_response(request)))
    }

    /// Fails client acquisition for the given region.
    pub fn fail_region(mut self, region: &str) -> Self {
        self.failing.insert(region.to_owned());
        self
    }

    /// Delays every request of the given region.
    pub fn delay_region(mut self, region: &str, delay: Duration) -> Self {
        self.delays.insert(region.to_owned(), delay);
        self
    }

    /// Returns all requests received so far, in order of arrival.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Returns the requests received by clients of one region, in order of arrival.
    pub fn requests_for(&self, region: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.region == region)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn client(&self, region: &str) -> Result<Box<dyn MetricsClient>, ClientError> {
        if self.failing.contains(region) {
            return Err(ClientError::Credentials(region.to_owned()));
        }

        Ok(Box::new(ScriptedClient {
            region: region.to_owned(),
            responder: Arc::clone(&self.responder),
            delay: self.delays.get(region).copied(),
            requests: Arc::clone(&self.requests),
        }))
    }
}

/// A [`MetricsClient`] for one region that records requests and answers through a closure.
pub struct ScriptedClient {
    region: String,
    responder: Responder,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

#[async_trait]
impl MetricsClient for ScriptedClient {
    async fn fetch_batch(&self, request: &BatchRequest) -> Result<BatchResponse, ClientError> {
        self.requests.lock().push(RecordedRequest {
            region: self.region.clone(),
            request: request.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        (self.responder)(&self.region, request)
    }
}

/// Answers every entry with one complete series labeled `"{id} series"`.
///
/// The series carries a single datapoint with value `1.0` at the start of the request.
pub fn echo_response(request: &BatchRequest) -> BatchResponse {
    BatchResponse {
        results: request
            .entries
            .iter()
            .map(|entry| {
                let label = format!("{} series", entry.id);
                metric_data(&entry.id, &label, &[(request.start, 1.0)])
            })
            .collect(),
        ..Default::default()
    }
}

/// Builds a complete result for the given datapoints.
pub fn metric_data(id: &str, label: &str, points: &[(DateTime<Utc>, f64)]) -> MetricDataResult {
    MetricDataResult {
        id: id.to_owned(),
        label: label.to_owned(),
        timestamps: points.iter().map(|(t, _)| *t).collect(),
        values: points.iter().map(|(_, v)| *v).collect(),
        status_code: StatusCode::Complete,
    }
}

/// Returns a time range of the given length starting at 2024-01-01 00:00:00 UTC.
pub fn time_range(hours: i64) -> TimeRange {
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default();

    TimeRange {
        start,
        end: start + TimeDelta::hours(hours),
    }
}

/// Builds a metric stat request query for one instance.
pub fn request_query(ref_id: &str, region: &str, statistics: &[&str]) -> RequestQuery {
    RequestQuery {
        ref_id: ref_id.to_owned(),
        region: region.to_owned(),
        namespace: "AWS/EC2".to_owned(),
        metric_name: "CPUUtilization".to_owned(),
        dimensions: [("InstanceId".to_owned(), vec![format!("i-{ref_id}")])].into(),
        statistics: statistics.iter().map(|s| (*s).to_owned()).collect(),
        ..Default::default()
    }
}

/// Builds a request query that is resolved as a search for all instances.
pub fn search_query(ref_id: &str, region: &str) -> RequestQuery {
    let mut query = request_query(ref_id, region, &["Average"]);
    query.dimensions = [("InstanceId".to_owned(), vec!["*".to_owned()])].into();
    query
}
