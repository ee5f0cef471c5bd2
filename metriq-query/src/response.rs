//! Folding of paged batch responses into per-query results.

use std::collections::{BTreeMap, HashSet};

use chrono::TimeDelta;

use crate::client::{BatchResponse, MetricDataResult, StatusCode};
use crate::query::FlattenedQuery;
use crate::transform::{RawResponse, TimePoint, TimeSeries};

/// Merged state of one labeled series across all pages.
#[derive(Debug, Default)]
struct LabeledResult {
    points: Vec<(chrono::DateTime<chrono::Utc>, f64)>,
    status_code: StatusCode,
}

impl LabeledResult {
    fn merge(&mut self, result: &MetricDataResult) {
        let points = result.timestamps.iter().copied().zip(result.values.iter().copied());
        self.points.extend(points);

        // The status of the last page wins. A partial page followed by the final one is complete.
        self.status_code = result.status_code;
    }

    fn into_points(mut self, period: u32) -> Vec<TimePoint> {
        self.points.sort_by_key(|(timestamp, _)| *timestamp);

        let mut points = Vec::with_capacity(self.points.len());
        let period = TimeDelta::seconds(i64::from(period));

        for (timestamp, value) in self.points {
            if let Some(previous) = points.last().map(|p: &TimePoint| p.timestamp) {
                let expected = previous + period;
                if !period.is_zero() && timestamp > expected {
                    points.push(TimePoint {
                        value: None,
                        timestamp: expected,
                    });
                }
            }

            points.push(TimePoint {
                value: Some(value),
                timestamp,
            });
        }

        points
    }
}

/// Accumulated results for one query identifier.
#[derive(Debug, Default)]
struct IdResults {
    labels: BTreeMap<String, LabeledResult>,
    exceeded_limit: bool,
}

/// Folds all pages returned for one region into one [`RawResponse`] per query.
///
/// The responses are returned in the order of `queries`. Queries without any results still yield
/// an empty response, unless they do not return data. Results for identifiers that were not part
/// of the region's queries are dropped.
pub fn parse_responses(pages: &[BatchResponse], queries: &[FlattenedQuery]) -> Vec<RawResponse> {
    let known: HashSet<&str> = queries.iter().map(|q| q.id.as_str()).collect();
    let mut by_id = BTreeMap::<&str, IdResults>::new();

    for page in pages {
        let exceeded = page.exceeded_max_metrics();

        for result in &page.results {
            if !known.contains(result.id.as_str()) {
                metriq_log::warn!(id = %result.id, "received result for unknown query id");
                continue;
            }

            let entry = by_id.entry(result.id.as_str()).or_default();
            entry.exceeded_limit |= exceeded;
            entry
                .labels
                .entry(result.label.clone())
                .or_default()
                .merge(result);
        }
    }

    let mut responses = Vec::with_capacity(queries.len());

    for query in queries {
        let Some(results) = by_id.remove(query.id.as_str()) else {
            if query.return_data {
                responses.push(RawResponse {
                    id: query.id.clone(),
                    ref_id: query.ref_id.clone(),
                    search_expression: query.search_expression(),
                    ..Default::default()
                });
            }
            continue;
        };

        let tags: BTreeMap<String, String> = query
            .concrete_dimensions()
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();

        let mut partial_data = false;
        let series = results
            .labels
            .into_iter()
            .map(|(label, result)| {
                partial_data |= result.status_code != StatusCode::Complete;
                TimeSeries {
                    name: if label.is_empty() { query.id.clone() } else { label },
                    tags: tags.clone(),
                    points: result.into_points(query.period),
                }
            })
            .collect();

        responses.push(RawResponse {
            id: query.id.clone(),
            ref_id: query.ref_id.clone(),
            series,
            search_expression: query.search_expression(),
            exceeded_limit: results.exceeded_limit,
            partial_data,
        });
    }

    responses
}
