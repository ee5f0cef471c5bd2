//! Expansion of request queries and reassembly of their results.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::batch::BatchLimits;
use crate::error::{QueryBuilderError, QueryBuilderErrorKind};
use crate::executor::TimeRange;
use crate::query::{FlattenedQuery, RequestQuery, SEARCH_MARKER};

/// Advisory attached to results whose search was truncated by the remote API.
pub const EXCEEDED_LIMIT_NOTICE: &str = "metrics limit exceeded; search results may be truncated";

/// Advisory attached to results containing series with missing datapoints.
pub const PARTIAL_DATA_NOTICE: &str =
    "some datapoints are missing; the remote API returned partial data";

/// A single datapoint. Missing values are `None`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TimePoint {
    /// The value, or `None` if the remote API returned no datapoint for this timestamp.
    pub value: Option<f64>,
    /// The timestamp of the datapoint.
    pub timestamp: DateTime<Utc>,
}

/// A labeled series of datapoints.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TimeSeries {
    /// The series label.
    pub name: String,
    /// Concrete dimensions of the query that produced this series.
    pub tags: BTreeMap<String, String>,
    /// Datapoints ordered by timestamp.
    pub points: Vec<TimePoint>,
}

/// The parsed answer of the remote API for one flattened query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawResponse {
    /// The identifier of the flattened query.
    pub id: String,
    /// The ref id of the originating request query.
    pub ref_id: String,
    /// Series returned for the query.
    pub series: Vec<TimeSeries>,
    /// The search expression sent, if the query was a search.
    pub search_expression: Option<String>,
    /// Whether the remote API truncated search results.
    pub exceeded_limit: bool,
    /// Whether any series is missing datapoints.
    pub partial_data: bool,
}

/// Metadata of a [`QueryResult`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultMeta {
    /// Search expressions sent on behalf of this ref id.
    pub search_expressions: Vec<String>,
    /// Identifiers of all flattened queries that contributed.
    pub ids: Vec<String>,
    /// Whether any contributing search was truncated by the remote API.
    pub exceeded_limit: bool,
    /// Whether any contributing series is missing datapoints.
    pub partial_data: bool,
    /// Human readable advisories. These are not errors.
    pub notices: Vec<String>,
}

/// The final result for one ref id.
///
/// A result either carries series or an error, never both.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// The ref id this result belongs to.
    pub ref_id: String,
    /// All series of the ref id, sorted by name.
    pub series: Vec<TimeSeries>,
    /// The error message if the ref id failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Metadata for observability.
    pub meta: QueryResultMeta,
}

impl QueryResult {
    /// Creates a failed result.
    pub fn from_error(ref_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Returns `true` if this result carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The outcome of [`expand`].
#[derive(Debug, Default)]
pub struct Expansion {
    /// All flattened queries keyed by identifier, in request order.
    pub queries: IndexMap<String, FlattenedQuery>,
    /// Input errors keyed by the ref id they are attributed to.
    pub errors: BTreeMap<String, QueryBuilderError>,
}

/// Returns the identifiers for all statistics of a request query.
///
/// Without a client-supplied id the query is named `query{RefId}`. When the query has more than one
/// statistic, every identifier is suffixed with the statistic, e.g. `queryA_Average`. Dots in the
/// statistic are replaced, so `p99.9` becomes `queryA_p99_9`.
fn query_ids(request: &RequestQuery) -> Vec<(String, &str)> {
    let base = match request.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => format!("query{}", request.ref_id),
    };

    if request.statistics.is_empty() {
        return vec![(base, "")];
    }

    if let [statistic] = request.statistics.as_slice() {
        return vec![(base, statistic.as_str())];
    }

    request
        .statistics
        .iter()
        .map(|stat| (format!("{base}_{}", stat.replace('.', "_")), stat.as_str()))
        .collect()
}

/// Expands request queries into flattened queries, one per statistic.
///
/// Identifier collisions are attributed to the ref id whose query introduced the duplicate. All
/// flattened queries of an erroneous ref id are dropped, while the expansion of every other ref
/// id is unaffected.
pub fn expand<'a, I>(requests: I) -> Expansion
where
    I: IntoIterator<Item = &'a RequestQuery>,
{
    let mut expansion = Expansion::default();

    for request in requests {
        if request.statistics.is_empty() && request.expression.is_empty() {
            let error =
                QueryBuilderError::new(&request.ref_id, QueryBuilderErrorKind::MissingStatistics);
            expansion.errors.insert(request.ref_id.clone(), error);
            continue;
        }

        let ids = query_ids(request);

        let mut seen = HashSet::new();
        let duplicate = ids.iter().find(|(id, _)| {
            expansion.queries.contains_key(id.as_str()) || !seen.insert(id.as_str())
        });

        if let Some((id, _)) = duplicate {
            metriq_log::debug!(ref_id = %request.ref_id, id = %id, "duplicate query id");
            let kind = QueryBuilderErrorKind::DuplicateId(id.clone());
            expansion
                .errors
                .insert(request.ref_id.clone(), QueryBuilderError::new(&request.ref_id, kind));
            continue;
        }

        for (id, statistic) in ids {
            let query = FlattenedQuery::new(id.clone(), request, statistic);
            expansion.queries.insert(id, query);
        }
    }

    // A ref id may be used by several request queries, some of which succeeded.
    let errors = &expansion.errors;
    expansion.queries.retain(|_, q| !errors.contains_key(&q.ref_id));

    expansion
}

/// Validates a request query against the time range and limits.
pub fn validate(
    request: &RequestQuery,
    time_range: &TimeRange,
    limits: &BatchLimits,
) -> Result<(), QueryBuilderError> {
    let is_math = !request.expression.is_empty() && !request.expression.contains(SEARCH_MARKER);

    if request.period == 0 {
        if is_math {
            return Ok(());
        }
        return Err(QueryBuilderError::new(
            &request.ref_id,
            QueryBuilderErrorKind::InvalidPeriod,
        ));
    }

    if request.high_resolution {
        let datapoints = time_range.duration_secs() / u64::from(request.period);
        if datapoints > limits.max_high_resolution_datapoints {
            return Err(QueryBuilderError::new(
                &request.ref_id,
                QueryBuilderErrorKind::PeriodTooLong,
            ));
        }
    }

    Ok(())
}

/// Merges raw responses into one result per ref id.
///
/// Series of all responses sharing a ref id are concatenated and sorted by name. The outcome does
/// not depend on the order of `responses`: ties between equally named series are broken by the
/// identifier of the response they came from.
pub fn regroup<I>(responses: I) -> BTreeMap<String, QueryResult>
where
    I: IntoIterator<Item = RawResponse>,
{
    let mut by_ref_id = BTreeMap::<String, Vec<RawResponse>>::new();
    for response in responses {
        by_ref_id
            .entry(response.ref_id.clone())
            .or_default()
            .push(response);
    }

    by_ref_id
        .into_iter()
        .map(|(ref_id, mut responses)| {
            responses.sort_by(|a, b| a.id.cmp(&b.id));

            let mut result = QueryResult {
                ref_id: ref_id.clone(),
                ..Default::default()
            };

            for response in responses {
                result.series.extend(response.series);
                result.meta.exceeded_limit |= response.exceeded_limit;
                result.meta.partial_data |= response.partial_data;
                if let Some(expression) = response.search_expression.filter(|e| !e.is_empty()) {
                    result.meta.search_expressions.push(expression);
                }
                result.meta.ids.push(response.id);
            }

            // Stable, so series with equal names keep the identifier order established above.
            result.series.sort_by(|a, b| a.name.cmp(&b.name));

            if result.meta.exceeded_limit {
                result.meta.notices.push(EXCEEDED_LIMIT_NOTICE.to_owned());
            }
            if result.meta.partial_data {
                result.meta.notices.push(PARTIAL_DATA_NOTICE.to_owned());
            }

            (ref_id, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use similar_asserts::assert_eq;

    use super::*;

    fn request(ref_id: &str, statistics: &[&str]) -> RequestQuery {
        RequestQuery {
            ref_id: ref_id.to_owned(),
            region: "us-east-1".to_owned(),
            namespace: "AWS/EC2".to_owned(),
            metric_name: "CPUUtilization".to_owned(),
            statistics: statistics.iter().map(|s| (*s).to_owned()).collect(),
            ..Default::default()
        }
    }

    fn series(name: &str) -> TimeSeries {
        TimeSeries {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    fn response(id: &str, ref_id: &str, names: &[&str]) -> RawResponse {
        RawResponse {
            id: id.to_owned(),
            ref_id: ref_id.to_owned(),
            series: names.iter().map(|n| series(n)).collect(),
            ..Default::default()
        }
    }

    fn names(result: &QueryResult) -> Vec<&str> {
        result.series.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_expand_single_statistic() {
        let expansion = expand(&[request("A", &["Average"])]);

        assert!(expansion.errors.is_empty());
        let ids: Vec<_> = expansion.queries.keys().collect();
        assert_eq!(ids, vec!["queryA"]);
        assert_eq!(expansion.queries["queryA"].statistic, "Average");
    }

    #[test]
    fn test_expand_multiple_statistics() {
        let expansion = expand(&[request("A", &["Average", "Maximum", "p99.9"])]);

        let ids: Vec<_> = expansion.queries.keys().collect();
        assert_eq!(ids, vec!["queryA_Average", "queryA_Maximum", "queryA_p99_9"]);
        assert_eq!(expansion.queries["queryA_p99_9"].statistic, "p99.9");
    }

    #[test]
    fn test_expand_explicit_id() {
        let mut single = request("A", &["Sum"]);
        single.id = Some("cpu".to_owned());
        let mut multi = request("B", &["Sum", "Average"]);
        multi.id = Some("mem".to_owned());
        let mut empty = request("C", &["Sum"]);
        empty.id = Some(String::new());

        let expansion = expand(&[single, multi, empty]);
        let ids: Vec<_> = expansion.queries.keys().collect();
        assert_eq!(ids, vec!["cpu", "mem_Sum", "mem_Average", "queryC"]);
    }

    #[test]
    fn test_expand_duplicate_is_scoped_to_ref_id() {
        let mut clashing = request("B", &["Average", "Maximum"]);
        clashing.id = Some("queryA".to_owned());
        let mut explicit = request("C", &["Sum"]);
        explicit.id = Some("queryA".to_owned());

        let requests = [request("A", &["Average"]), clashing, explicit, request("D", &["Sum"])];
        let expansion = expand(&requests);

        // B does not collide (its ids are suffixed), C does.
        let ids: Vec<_> = expansion.queries.keys().collect();
        assert_eq!(
            ids,
            vec!["queryA", "queryA_Average", "queryA_Maximum", "queryD"]
        );
        assert_eq!(expansion.errors.len(), 1);
        assert_eq!(
            expansion.errors["C"],
            QueryBuilderError::new("C", QueryBuilderErrorKind::DuplicateId("queryA".to_owned()))
        );
    }

    #[test]
    fn test_expand_duplicate_statistics_within_query() {
        let expansion = expand(&[request("A", &["Sum", "Sum"]), request("B", &["Sum"])]);

        assert_eq!(
            expansion.errors["A"].kind,
            QueryBuilderErrorKind::DuplicateId("queryA_Sum".to_owned())
        );
        let ids: Vec<_> = expansion.queries.keys().collect();
        assert_eq!(ids, vec!["queryB"]);
    }

    #[test]
    fn test_expand_repeated_ref_id_drops_all_queries() {
        let expansion = expand(&[request("A", &["Sum"]), request("A", &["Sum"])]);

        assert!(expansion.queries.is_empty());
        assert!(expansion.errors.contains_key("A"));
    }

    #[test]
    fn test_expand_missing_statistics() {
        let mut expression = request("B", &[]);
        expression.expression = "queryA * 2".to_owned();

        let expansion = expand(&[request("A", &[]), expression]);

        assert_eq!(
            expansion.errors["A"].kind,
            QueryBuilderErrorKind::MissingStatistics
        );
        let ids: Vec<_> = expansion.queries.keys().collect();
        assert_eq!(ids, vec!["queryB"]);
        assert_eq!(expansion.queries["queryB"].statistic, "");
    }

    fn time_range(hours: i64) -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TimeRange {
            start,
            end: start + chrono::Duration::hours(hours),
        }
    }

    #[test]
    fn test_validate_period() {
        let limits = BatchLimits::default();

        let mut query = request("A", &["Sum"]);
        query.period = 0;
        assert_eq!(
            validate(&query, &time_range(1), &limits).unwrap_err().kind,
            QueryBuilderErrorKind::InvalidPeriod
        );

        query.expression = "queryB * 2".to_owned();
        assert!(validate(&query, &time_range(1), &limits).is_ok());
    }

    #[test]
    fn test_validate_high_resolution() {
        let limits = BatchLimits::default();

        let mut query = request("A", &["Sum"]);
        query.high_resolution = true;
        query.period = 1;

        // 6 hours at one second is 21600 datapoints, the maximum.
        assert!(validate(&query, &time_range(6), &limits).is_ok());
        assert_eq!(
            validate(&query, &time_range(7), &limits).unwrap_err().kind,
            QueryBuilderErrorKind::PeriodTooLong
        );
    }

    #[test]
    fn test_regroup_multiple_statistics() {
        let results = regroup(vec![
            response("queryA_Maximum", "A", &["Y"]),
            response("queryA_Average", "A", &["X"]),
        ]);

        assert_eq!(results.len(), 1);
        let result = &results["A"];
        assert_eq!(names(result), vec!["X", "Y"]);
        assert_eq!(result.meta.ids, vec!["queryA_Average", "queryA_Maximum"]);
        assert!(result.meta.notices.is_empty());
        assert!(!result.is_error());
    }

    #[test]
    fn test_regroup_is_order_independent() {
        let responses = vec![
            response("queryA_1", "A", &["b", "a"]),
            response("queryA_2", "A", &["a", "c"]),
            response("queryB", "B", &["z"]),
            RawResponse {
                search_expression: Some("SEARCH('x')".to_owned()),
                ..response("queryA_3", "A", &["b"])
            },
        ];

        let expected = regroup(responses.clone());
        assert_eq!(names(&expected["A"]), vec!["a", "a", "b", "b", "c"]);

        let mut permuted = responses;
        permuted.reverse();
        assert_eq!(regroup(permuted.clone()), expected);
        permuted.swap(0, 2);
        assert_eq!(regroup(permuted), expected);
    }

    #[test]
    fn test_regroup_exceeded_limit() {
        let results = regroup(vec![
            RawResponse {
                exceeded_limit: true,
                search_expression: Some("SEARCH('{AWS/EC2} x')".to_owned()),
                ..response("queryA_1", "A", &["x"])
            },
            RawResponse {
                search_expression: Some(String::new()),
                ..response("queryA_2", "A", &["y"])
            },
        ]);

        let result = &results["A"];
        assert!(result.meta.exceeded_limit);
        assert!(!result.is_error());
        assert_eq!(result.meta.notices, vec![EXCEEDED_LIMIT_NOTICE]);
        assert_eq!(result.meta.search_expressions, vec!["SEARCH('{AWS/EC2} x')"]);
        assert_eq!(names(result), vec!["x", "y"]);
    }

    #[test]
    fn test_regroup_partial_data() {
        let results = regroup(vec![RawResponse {
            partial_data: true,
            ..response("queryA", "A", &["x"])
        }]);

        assert_eq!(results["A"].meta.notices, vec![PARTIAL_DATA_NOTICE]);
    }
}
