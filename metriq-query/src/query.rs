//! Request queries, their flattened form and classification.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// The literal marking a user-written search expression.
pub const SEARCH_MARKER: &str = "SEARCH(";

/// A dimension value that matches any value.
pub const WILDCARD: &str = "*";

/// Dimension names mapped to their candidate values, ordered by name.
pub type Dimensions = BTreeMap<String, Vec<String>>;

fn default_return_data() -> bool {
    true
}

/// A user-authored query as received from the ingestion boundary.
///
/// A single request query may name multiple statistics. It is expanded into one
/// [`FlattenedQuery`] per statistic by [`expand`](crate::expand).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestQuery {
    /// Groups all flattened queries whose results are merged into one result.
    pub ref_id: String,
    /// The region to query.
    pub region: String,
    /// The client-supplied identifier, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The metric namespace.
    pub namespace: String,
    /// The metric name.
    pub metric_name: String,
    /// Dimension names and their candidate values.
    pub dimensions: Dimensions,
    /// Statistics to fetch, each producing a separate flattened query.
    pub statistics: Vec<String>,
    /// A math or search expression. Empty if the query names a metric.
    pub expression: String,
    /// Whether series of this query appear in the output or only feed expressions.
    #[serde(default = "default_return_data")]
    pub return_data: bool,
    /// Period in seconds.
    pub period: u32,
    /// Alias template for series names.
    pub alias: String,
    /// Whether high resolution data is requested.
    pub high_resolution: bool,
    /// Whether search expressions only match the exact set of dimensions.
    pub match_exact: bool,
}

impl Default for RequestQuery {
    fn default() -> Self {
        Self {
            ref_id: String::new(),
            region: String::new(),
            id: None,
            namespace: String::new(),
            metric_name: String::new(),
            dimensions: Dimensions::new(),
            statistics: Vec::new(),
            expression: String::new(),
            return_data: true,
            period: 60,
            alias: String::new(),
            high_resolution: false,
            match_exact: true,
        }
    }
}

/// How the remote API evaluates a [`FlattenedQuery`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Classification {
    /// A single concrete metric and statistic.
    MetricStat,
    /// An expression computed from the results of other queries.
    MathExpression,
    /// A query expanded by the remote API through metric discovery.
    SearchExpression,
}

/// One metric and statistic pair derived from a [`RequestQuery`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlattenedQuery {
    /// The identifier, unique within one execution.
    pub id: String,
    /// The ref id of the originating request query.
    pub ref_id: String,
    /// The region to query.
    pub region: String,
    /// The metric namespace.
    pub namespace: String,
    /// The metric name.
    pub metric_name: String,
    /// Dimension names and their candidate values.
    pub dimensions: Dimensions,
    /// The single statistic of this query. Empty for pure expressions.
    pub statistic: String,
    /// A math or search expression. Empty if the query names a metric.
    pub expression: String,
    /// Whether series of this query appear in the output.
    pub return_data: bool,
    /// Period in seconds.
    pub period: u32,
    /// Alias template for series names.
    pub alias: String,
    /// Whether high resolution data is requested.
    pub high_resolution: bool,
    /// Whether search expressions only match the exact set of dimensions.
    pub match_exact: bool,
}

impl FlattenedQuery {
    /// Creates a flattened query for one statistic of a request query.
    pub fn new(id: String, request: &RequestQuery, statistic: &str) -> Self {
        Self {
            id,
            ref_id: request.ref_id.clone(),
            region: request.region.clone(),
            namespace: request.namespace.clone(),
            metric_name: request.metric_name.clone(),
            dimensions: request.dimensions.clone(),
            statistic: statistic.to_owned(),
            expression: request.expression.clone(),
            return_data: request.return_data,
            period: request.period,
            alias: request.alias.clone(),
            high_resolution: request.high_resolution,
            match_exact: request.match_exact,
        }
    }

    /// Returns `true` if the expression is set and is not a search.
    pub fn is_math_expression(&self) -> bool {
        !self.expression.is_empty() && !self.is_user_defined_search_expression()
    }

    /// Returns `true` if the user wrote a search expression.
    pub fn is_user_defined_search_expression(&self) -> bool {
        self.expression.contains(SEARCH_MARKER)
    }

    /// Returns `true` if the dimensions cannot pin down exactly one metric.
    ///
    /// This is the case if there are no dimensions at all, a dimension has multiple candidate
    /// values, or a value is the [`WILDCARD`].
    pub fn is_inferred_search_expression(&self) -> bool {
        if self.dimensions.is_empty() {
            return true;
        }

        self.dimensions
            .values()
            .any(|values| values.len() > 1 || values.iter().any(|v| v == WILDCARD))
    }

    /// Returns `true` if the query is resolved through metric discovery.
    pub fn is_search_expression(&self) -> bool {
        self.is_user_defined_search_expression() || self.is_inferred_search_expression()
    }

    /// Returns `true` if the query names one concrete metric and statistic.
    pub fn is_metric_stat(&self) -> bool {
        !self.is_search_expression() && !self.is_math_expression()
    }

    /// Classifies the query.
    ///
    /// Search takes precedence over math, so an expression without any dimensions counts as a
    /// search.
    pub fn classify(&self) -> Classification {
        if self.is_search_expression() {
            Classification::SearchExpression
        } else if self.is_math_expression() {
            Classification::MathExpression
        } else {
            Classification::MetricStat
        }
    }

    /// Returns the search expression sent for this query, if it is a search.
    ///
    /// User-defined searches are returned verbatim. Inferred searches without an expression of
    /// their own are synthesized from namespace, metric, dimensions and statistic.
    pub fn search_expression(&self) -> Option<String> {
        if self.is_user_defined_search_expression() {
            Some(self.expression.clone())
        } else if self.expression.is_empty() && self.is_inferred_search_expression() {
            Some(self.build_search_expression())
        } else {
            None
        }
    }

    /// Returns the dimensions that have exactly one concrete value.
    pub fn concrete_dimensions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.dimensions
            .iter()
            .filter_map(|(name, values)| match values.as_slice() {
                [value] if value != WILDCARD => Some((name.as_str(), value.as_str())),
                _ => None,
            })
    }

    fn build_search_expression(&self) -> String {
        let mut search_term = format!("MetricName=\"{}\"", self.metric_name);
        let mut unknown_names = Vec::new();

        for (name, values) in &self.dimensions {
            if values.is_empty() || values.iter().any(|v| v == WILDCARD) {
                unknown_names.push(name);
                continue;
            }

            let joined = values
                .iter()
                .map(|value| format!("\"{}\"", escape_double_quotes(value)))
                .join(" OR ");

            let filter = match values.len() {
                1 => format!("\"{name}\"={joined}"),
                _ => format!("\"{name}\"=({joined})"),
            };
            append_search_term(&mut search_term, &filter);
        }

        if self.match_exact {
            let mut schema = self.namespace.clone();
            if !self.dimensions.is_empty() {
                schema.push(',');
                schema.push_str(&self.dimensions.keys().map(|k| format!("\"{k}\"")).join(","));
            }

            return format!(
                "REMOVE_EMPTY(SEARCH('{{{schema}}} {search_term}', '{}', {}))",
                self.statistic, self.period
            );
        }

        let unknown = unknown_names.iter().map(|n| format!("\"{n}\"")).join(" ");
        append_search_term(&mut search_term, &unknown);

        format!(
            "REMOVE_EMPTY(SEARCH('Namespace=\"{}\" {search_term}', '{}', {}))",
            self.namespace, self.statistic, self.period
        )
    }
}

fn escape_double_quotes(value: &str) -> String {
    value.replace('"', "\\\"")
}

fn append_search_term(search: &mut String, term: &str) {
    if term.is_empty() {
        return;
    }
    if !search.is_empty() {
        search.push(' ');
    }
    search.push_str(term);
}
