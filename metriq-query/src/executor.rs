use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::batch::BatchLimits;
use crate::client::ClientFactory;
use crate::dispatch::{DispatchConfig, RegionDispatcher};
use crate::error::{ExecuteError, QueryBuilderError};
use crate::query::RequestQuery;
use crate::transform::{expand, validate, QueryResult};

/// The kind of request issued by the caller.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum QueryType {
    /// Time series of metrics and expressions.
    #[default]
    #[serde(rename = "timeSeriesQuery")]
    TimeSeries,
    /// Discovery of metric names and dimension values.
    #[serde(rename = "metricFindQuery")]
    MetricFind,
    /// Annotation events.
    #[serde(rename = "annotationQuery")]
    Annotation,
}

impl QueryType {
    /// Returns the string representation of this query type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeSeries => "timeSeriesQuery",
            Self::MetricFind => "metricFindQuery",
            Self::Annotation => "annotationQuery",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryType {
    type Err = Infallible;

    /// Parses a query type. Unknown strings are time series queries.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "metricFindQuery" => Self::MetricFind,
            "annotationQuery" => Self::Annotation,
            _ => Self::TimeSeries,
        })
    }
}

/// The absolute time range of an execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Returns an error unless `start` is before `end`.
    pub fn validate(&self) -> Result<(), ExecuteError> {
        if self.start < self.end {
            Ok(())
        } else {
            Err(ExecuteError::InvalidTimeRange)
        }
    }

    /// Returns the length of the range in whole seconds, or zero if it is empty.
    pub fn duration_secs(&self) -> u64 {
        u64::try_from((self.end - self.start).num_seconds()).unwrap_or(0)
    }
}

/// The input of one execution.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    /// The time range shared by all queries.
    pub time_range: TimeRange,
    /// The request queries to execute.
    pub queries: Vec<RequestQuery>,
}

/// Executes request queries against the remote metrics API.
///
/// The executor validates and expands the queries, dispatches the resulting batches to their
/// regions concurrently, and regroups the answers into one [`QueryResult`] per ref id.
pub struct Executor {
    dispatcher: RegionDispatcher,
    limits: BatchLimits,
}

impl Executor {
    /// Creates an executor that acquires region clients from `factory`.
    pub fn new(factory: Arc<dyn ClientFactory>, limits: BatchLimits, dispatch: DispatchConfig) -> Self {
        Self {
            dispatcher: RegionDispatcher::new(factory, limits, dispatch),
            limits,
        }
    }

    /// Executes all queries of the context.
    ///
    /// Input errors are reported per ref id and never abort the execution. The returned map
    /// contains an entry for every ref id of the context.
    pub async fn query(
        &self,
        query_type: QueryType,
        context: QueryContext,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, QueryResult>, ExecuteError> {
        if query_type != QueryType::TimeSeries {
            return Err(ExecuteError::UnsupportedQueryType(query_type));
        }

        let QueryContext {
            time_range,
            queries,
        } = context;
        time_range.validate()?;

        let mut errors = BTreeMap::<String, QueryBuilderError>::new();
        for query in &queries {
            if let Err(error) = validate(query, &time_range, &self.limits) {
                errors.entry(query.ref_id.clone()).or_insert(error);
            }
        }

        let valid = queries.iter().filter(|q| !errors.contains_key(&q.ref_id));
        let expansion = expand(valid);
        errors.extend(expansion.errors);

        metriq_log::debug!(
            queries = expansion.queries.len(),
            errors = errors.len(),
            "expanded request queries"
        );

        let mut results = if expansion.queries.is_empty() {
            BTreeMap::new()
        } else {
            self.dispatcher
                .dispatch(&time_range, expansion.queries, cancel)
                .await?
        };

        for (ref_id, error) in errors {
            let result = QueryResult::from_error(ref_id.clone(), error.to_string());
            results.insert(ref_id, result);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::client::{BatchRequest, BatchResponse, MetricsClient};
    use crate::error::ClientError;

    use super::*;

    /// A factory that fails the test if any region is contacted.
    struct Unreachable;

    #[async_trait]
    impl ClientFactory for Unreachable {
        async fn client(&self, region: &str) -> Result<Box<dyn MetricsClient>, ClientError> {
            panic!("region {region} must not be contacted");
        }
    }

    struct Empty;

    #[async_trait]
    impl MetricsClient for Empty {
        async fn fetch_batch(&self, _: &BatchRequest) -> Result<BatchResponse, ClientError> {
            Ok(BatchResponse::default())
        }
    }

    #[async_trait]
    impl ClientFactory for Empty {
        async fn client(&self, _: &str) -> Result<Box<dyn MetricsClient>, ClientError> {
            Ok(Box::new(Empty))
        }
    }

    fn time_range() -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TimeRange {
            start,
            end: start + chrono::Duration::hours(1),
        }
    }

    fn request(ref_id: &str) -> RequestQuery {
        RequestQuery {
            ref_id: ref_id.to_owned(),
            region: "us-east-1".to_owned(),
            namespace: "AWS/EC2".to_owned(),
            metric_name: "CPUUtilization".to_owned(),
            dimensions: [("InstanceId".to_owned(), vec!["i-1".to_owned()])].into(),
            statistics: vec!["Average".to_owned()],
            ..Default::default()
        }
    }

    fn executor(factory: impl ClientFactory + 'static) -> Executor {
        Executor::new(
            Arc::new(factory),
            BatchLimits::default(),
            DispatchConfig::default(),
        )
    }

    #[test]
    fn test_parse_query_type() {
        assert_eq!("metricFindQuery".parse::<QueryType>(), Ok(QueryType::MetricFind));
        assert_eq!("annotationQuery".parse::<QueryType>(), Ok(QueryType::Annotation));
        assert_eq!("timeSeriesQuery".parse::<QueryType>(), Ok(QueryType::TimeSeries));
        assert_eq!("".parse::<QueryType>(), Ok(QueryType::TimeSeries));
        assert_eq!(QueryType::MetricFind.to_string(), "metricFindQuery");
    }

    #[test]
    fn test_duration_secs() {
        assert_eq!(time_range().duration_secs(), 3600);

        let range = time_range();
        let reversed = TimeRange {
            start: range.end,
            end: range.start,
        };
        assert_eq!(reversed.duration_secs(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_query_type() {
        let context = QueryContext {
            time_range: time_range(),
            queries: vec![request("A")],
        };

        let error = executor(Unreachable)
            .query(QueryType::Annotation, context, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            ExecuteError::UnsupportedQueryType(QueryType::Annotation)
        ));
    }

    #[tokio::test]
    async fn test_invalid_time_range() {
        let range = time_range();
        let context = QueryContext {
            time_range: TimeRange {
                start: range.end,
                end: range.end,
            },
            queries: vec![request("A")],
        };

        let error = executor(Unreachable)
            .query(QueryType::TimeSeries, context, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, ExecuteError::InvalidTimeRange));
    }

    #[tokio::test]
    async fn test_only_input_errors_skip_dispatch() {
        let mut invalid = request("A");
        invalid.period = 0;
        let mut empty = request("B");
        empty.statistics.clear();

        let context = QueryContext {
            time_range: time_range(),
            queries: vec![invalid, empty],
        };

        let results = executor(Unreachable)
            .query(QueryType::TimeSeries, context, &CancellationToken::new())
            .await
            .unwrap();

        insta::assert_snapshot!(
            results["A"].error.as_deref().unwrap(),
            @"error parsing query A, period must be greater than zero"
        );
        insta::assert_snapshot!(
            results["B"].error.as_deref().unwrap(),
            @"error parsing query B, query has neither statistics nor an expression"
        );
    }

    #[tokio::test]
    async fn test_input_error_does_not_affect_siblings() {
        let mut invalid = request("B");
        invalid.period = 0;
        // Shares the ref id of the invalid query, so it is dropped with it.
        let sibling = request("B");

        let context = QueryContext {
            time_range: time_range(),
            queries: vec![request("A"), invalid, sibling],
        };

        let results = executor(Empty)
            .query(QueryType::TimeSeries, context, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(!results["A"].is_error());
        assert_eq!(results["A"].meta.ids, vec!["queryA"]);
        assert!(results["B"].is_error());
    }
}
