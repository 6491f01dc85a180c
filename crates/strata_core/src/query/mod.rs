//! Streaming queries over one collection.
//!
//! A query reads a fixed snapshot. The collection's documents are split
//! into partitions by `doc_id % query_partitions`; each partition is a lazy
//! [`RowStream`]. Without an ordering the partitions are concatenated; with
//! one, each partition is sorted and the results are k-way merged.
//!
//! ```rust,ignore
//! let query = Query::new()
//!     .filter(Expression::gt("age", 30))
//!     .order_by(OrderSpec::asc("age"))
//!     .limit(10);
//! for row in engine.query("app", "people", &query)? {
//!     let row = row?;
//!     println!("{} {}", row.doc_id, String::from_utf8_lossy(&row.payload));
//! }
//! ```

mod executor;
mod expr;
mod merge;
mod stream;

pub use executor::{execute, QueryStream};
pub use expr::{lookup, Expression};
pub use merge::{MergeStream, NumberKey, SortKey};
pub use stream::{ConcatStream, PartitionStream, RowStream, SortedStream, VecStream};

use crate::error::{CoreError, CoreResult};
use crate::types::DocumentId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Document ID.
    pub doc_id: DocumentId,
    /// Payload, after projection.
    pub payload: Vec<u8>,
}

impl Row {
    /// The payload parsed as JSON, if it is JSON.
    #[must_use]
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

impl Direction {
    /// Whether this is [`Direction::Desc`].
    #[must_use]
    pub fn is_descending(self) -> bool {
        self == Self::Desc
    }

    pub(crate) fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Asc => ordering,
            Self::Desc => ordering.reverse(),
        }
    }
}

/// Ordering of a query's results. Ties are broken by ascending doc ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Dot path of the sort field.
    pub field: String,
    /// Direction.
    #[serde(default)]
    pub direction: Direction,
}

impl OrderSpec {
    /// Orders by `field` in `direction`.
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Ascending by `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, Direction::Asc)
    }

    /// Descending by `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, Direction::Desc)
    }
}

/// A single-collection query: filter, projection, ordering and limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Query {
    /// Rows must match this predicate.
    pub filter: Option<Expression>,
    /// Dot paths kept in each JSON object payload; empty keeps everything.
    pub projection: Vec<String>,
    /// Stop after this many rows.
    pub limit: Option<usize>,
    /// Result ordering; `None` yields partitions in order.
    pub order_by: Option<OrderSpec>,
}

impl Query {
    /// A query returning every document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a query from JSON.
    ///
    /// ```json
    /// {"filter": {"eq": {"field": "kind", "value": "user"}},
    ///  "projection": ["name"], "limit": 10,
    ///  "order_by": {"field": "age", "direction": "desc"}}
    /// ```
    pub fn from_json(text: &str) -> CoreResult<Self> {
        let query: Self = serde_json::from_str(text)
            .map_err(|e| CoreError::invalid_argument(format!("malformed query: {e}")))?;
        query.validate()?;
        Ok(query)
    }

    /// Sets the filter.
    #[must_use]
    pub fn filter(mut self, filter: Expression) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the projection.
    #[must_use]
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the limit.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn order_by(mut self, order: OrderSpec) -> Self {
        self.order_by = Some(order);
        self
    }

    /// Checks every field path in the query.
    pub fn validate(&self) -> CoreResult<()> {
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        for field in &self.projection {
            expr::validate_path(field)?;
        }
        if let Some(order) = &self.order_by {
            expr::validate_path(&order.field)?;
        }
        Ok(())
    }
}
