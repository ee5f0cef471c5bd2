//! Packing of flattened queries into batches of request entries.
//!
//! The remote API caps the number of entries per request, and caps search expressions much more
//! tightly since they are far more expensive to evaluate. [`BatchBuilder`] walks the queries of one
//! region in order and starts a new batch whenever the next entry would exceed either ceiling.

use serde::{Deserialize, Serialize};

use crate::query::{Classification, FlattenedQuery};

/// Per-request limits of the remote API.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchLimits {
    /// The maximum number of entries in one batch.
    ///
    /// Defaults to `100`.
    pub max_queries_per_request: usize,

    /// The maximum number of search expression entries in one batch.
    ///
    /// Defaults to `5`.
    pub max_search_expressions: usize,

    /// The maximum number of datapoints a high resolution query may span.
    ///
    /// High resolution data is retained for 15 days at one minute, hence `15 * 24 * 60`.
    pub max_high_resolution_datapoints: u64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_queries_per_request: 100,
            max_search_expressions: 5,
            max_high_resolution_datapoints: 21_600,
        }
    }
}

/// A single dimension filter of a metric stat entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DimensionFilter {
    /// The dimension name.
    pub name: String,
    /// The concrete dimension value.
    pub value: String,
}

/// What a [`BatchEntry`] asks the remote API to compute.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EntryKind {
    /// Fetch one concrete metric.
    #[serde(rename_all = "camelCase")]
    MetricStat {
        /// The metric namespace.
        namespace: String,
        /// The metric name.
        metric_name: String,
        /// The concrete dimensions identifying the metric.
        dimensions: Vec<DimensionFilter>,
        /// The statistic to compute.
        statistic: String,
        /// Period in seconds.
        period: u32,
    },
    /// Evaluate a math or search expression.
    Expression {
        /// The expression text.
        expression: String,
        /// Period in seconds, if set.
        #[serde(skip_serializing_if = "Option::is_none")]
        period: Option<u32>,
    },
}

/// One entry of a batch request, addressable by the identifier of its query.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    /// The identifier of the flattened query.
    pub id: String,
    /// Whether the remote API returns data for this entry.
    pub return_data: bool,
    /// The metric or expression to evaluate.
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl BatchEntry {
    /// Builds the entry for a flattened query.
    pub fn from_query(query: &FlattenedQuery) -> Self {
        let kind = if !query.expression.is_empty() {
            EntryKind::Expression {
                expression: query.expression.clone(),
                period: Some(query.period).filter(|p| *p > 0),
            }
        } else if let Some(expression) = query.search_expression() {
            EntryKind::Expression {
                expression,
                period: Some(query.period),
            }
        } else {
            EntryKind::MetricStat {
                namespace: query.namespace.clone(),
                metric_name: query.metric_name.clone(),
                dimensions: query
                    .concrete_dimensions()
                    .map(|(name, value)| DimensionFilter {
                        name: name.to_owned(),
                        value: value.to_owned(),
                    })
                    .collect(),
                statistic: query.statistic.clone(),
                period: query.period,
            }
        };

        Self {
            id: query.id.clone(),
            return_data: query.return_data,
            kind,
        }
    }
}

/// An ordered list of entries sent in one request to one region.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    search_expressions: usize,
}

impl Batch {
    /// Returns the entries of this batch in order.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Consumes the batch and returns its entries.
    pub fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }

    /// Returns the number of entries in this batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of entries counting against the search expression ceiling.
    pub fn search_expressions(&self) -> usize {
        self.search_expressions
    }
}

/// Outcome of trying to add a query to the current batch.
#[derive(Debug, Eq, PartialEq)]
enum PackDecision {
    /// The entry fits, the flag indicates whether it is a search expression.
    Fits(bool),
    /// The entry would exceed a ceiling and must start the next batch.
    MoveToNextBatch,
}

/// Packs flattened queries of one region into [`Batch`]es.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchBuilder {
    limits: BatchLimits,
}

impl BatchBuilder {
    /// Creates a builder with the given limits.
    pub fn new(limits: BatchLimits) -> Self {
        Self { limits }
    }

    /// Returns the limits applied by this builder.
    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    /// Packs all queries into batches, preserving their order.
    ///
    /// Concatenating the entries of all batches yields exactly one entry per input query, in input
    /// order.
    pub fn build<'a, I>(&self, queries: I) -> Vec<Batch>
    where
        I: IntoIterator<Item = &'a FlattenedQuery>,
    {
        self.batches(queries).collect()
    }

    /// Returns an iterator lazily yielding the batches for the given queries.
    pub fn batches<'a, I>(&self, queries: I) -> Batches<'a, I::IntoIter>
    where
        I: IntoIterator<Item = &'a FlattenedQuery>,
    {
        Batches {
            limits: self.limits,
            inner: queries.into_iter().peekable(),
        }
    }

    fn decide(&self, batch: &Batch, query: &FlattenedQuery) -> PackDecision {
        let is_search = query.classify() == Classification::SearchExpression;

        // The first entry always fits, so an oversized query is emitted as a singleton batch.
        if batch.is_empty() {
            return PackDecision::Fits(is_search);
        }

        if batch.len() + 1 > self.limits.max_queries_per_request {
            return PackDecision::MoveToNextBatch;
        }

        if is_search && batch.search_expressions + 1 > self.limits.max_search_expressions {
            return PackDecision::MoveToNextBatch;
        }

        PackDecision::Fits(is_search)
    }
}

/// Iterator yielding batches of a [`BatchBuilder`].
pub struct Batches<'a, I: Iterator<Item = &'a FlattenedQuery>> {
    limits: BatchLimits,
    inner: std::iter::Peekable<I>,
}

impl<'a, I> Iterator for Batches<'a, I>
where
    I: Iterator<Item = &'a FlattenedQuery>,
{
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let builder = BatchBuilder::new(self.limits);
        let mut batch = Batch::default();

        while let Some(query) = self.inner.peek() {
            match builder.decide(&batch, query) {
                PackDecision::Fits(is_search) => {
                    batch.entries.push(BatchEntry::from_query(query));
                    batch.search_expressions += usize::from(is_search);
                    self.inner.next();
                }
                PackDecision::MoveToNextBatch => break,
            }
        }

        if batch.is_empty() {
            return None;
        }

        Some(batch)
    }
}
