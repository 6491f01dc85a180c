//! Forward-only row streams.

use super::expr::Expression;
use super::merge::SortKey;
use super::{OrderSpec, Row};
use crate::database::LogicalDatabase;
use crate::error::{CoreError, CoreResult};
use crate::mvcc::Snapshot;
use crate::types::DocumentId;
use std::sync::Arc;

/// A lazy, forward-only, non-restartable source of rows.
///
/// `close` releases the stream's resources and is idempotent; a closed
/// stream yields nothing.
pub trait RowStream: Send {
    /// The next row, or `None` once the stream is exhausted or closed.
    fn next_row(&mut self) -> CoreResult<Option<Row>>;

    /// Releases resources.
    fn close(&mut self);
}

impl RowStream for Box<dyn RowStream> {
    fn next_row(&mut self) -> CoreResult<Option<Row>> {
        (**self).next_row()
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// Rows held in memory.
#[derive(Debug, Default)]
pub struct VecStream {
    rows: std::vec::IntoIter<Row>,
    closed: bool,
}

impl VecStream {
    /// A stream yielding `rows` in order.
    #[must_use]
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
            closed: false,
        }
    }
}

impl RowStream for VecStream {
    fn next_row(&mut self) -> CoreResult<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.next())
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows = Vec::new().into_iter();
    }
}

/// One partition of a collection, read at a fixed snapshot.
///
/// Each advance resolves the next document's visible version and applies
/// the filter. The snapshot is released on close.
pub struct PartitionStream {
    db: Arc<LogicalDatabase>,
    snapshot: Option<Arc<Snapshot>>,
    collection: String,
    ids: std::vec::IntoIter<DocumentId>,
    filter: Option<Arc<Expression>>,
}

impl PartitionStream {
    pub(crate) fn new(
        db: Arc<LogicalDatabase>,
        snapshot: Arc<Snapshot>,
        collection: &str,
        ids: Vec<DocumentId>,
        filter: Option<Arc<Expression>>,
    ) -> Self {
        Self {
            db,
            snapshot: Some(snapshot),
            collection: collection.to_string(),
            ids: ids.into_iter(),
            filter,
        }
    }
}

impl RowStream for PartitionStream {
    fn next_row(&mut self) -> CoreResult<Option<Row>> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(None);
        };
        if !self.db.is_open() {
            return Err(CoreError::DatabaseClosed);
        }
        for doc_id in self.ids.by_ref() {
            let Some(payload) = self.db.visible_payload(snapshot, &self.collection, doc_id) else {
                continue;
            };
            if self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches_payload(&payload))
            {
                return Ok(Some(Row { doc_id, payload }));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.snapshot = None;
        self.ids = Vec::new().into_iter();
    }
}

impl std::fmt::Debug for PartitionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStream")
            .field("db", &self.db.id())
            .field("collection", &self.collection)
            .field("remaining", &self.ids.len())
            .field("closed", &self.snapshot.is_none())
            .finish()
    }
}

/// Sorts its source on the first advance, then yields the sorted rows.
pub struct SortedStream<S> {
    source: S,
    order: OrderSpec,
    sorted: Option<std::vec::IntoIter<Row>>,
    closed: bool,
}

impl<S: RowStream> SortedStream<S> {
    /// Wraps `source`.
    pub fn new(source: S, order: OrderSpec) -> Self {
        Self {
            source,
            order,
            sorted: None,
            closed: false,
        }
    }
}

impl<S: RowStream> RowStream for SortedStream<S> {
    fn next_row(&mut self) -> CoreResult<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        if self.sorted.is_none() {
            let mut keyed = Vec::new();
            while let Some(row) = self.source.next_row()? {
                keyed.push((SortKey::of(&row.payload, &self.order.field), row));
            }
            keyed.sort_by(|(ka, a), (kb, b)| {
                self.order
                    .direction
                    .apply(ka.cmp(kb))
                    .then(a.doc_id.cmp(&b.doc_id))
            });
            self.sorted = Some(keyed.into_iter().map(|(_, row)| row).collect::<Vec<_>>().into_iter());
        }
        Ok(self.sorted.as_mut().and_then(Iterator::next))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.sorted = None;
            self.source.close();
        }
    }
}

/// Drains each source to completion before moving to the next.
pub struct ConcatStream {
    sources: Vec<Box<dyn RowStream>>,
    current: usize,
}

impl ConcatStream {
    /// Concatenates `sources` in order.
    #[must_use]
    pub fn new(sources: Vec<Box<dyn RowStream>>) -> Self {
        Self {
            sources,
            current: 0,
        }
    }
}

impl RowStream for ConcatStream {
    fn next_row(&mut self) -> CoreResult<Option<Row>> {
        while let Some(source) = self.sources.get_mut(self.current) {
            if let Some(row) = source.next_row()? {
                return Ok(Some(row));
            }
            source.close();
            self.current += 1;
        }
        Ok(None)
    }

    fn close(&mut self) {
        // Sources before `current` were closed when they ran dry.
        for source in self.sources.iter_mut().skip(self.current) {
            source.close();
        }
        self.current = self.sources.len();
    }
}
