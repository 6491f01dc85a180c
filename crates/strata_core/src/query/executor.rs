//! Query execution: partitioning, limit and projection.

use super::expr::lookup;
use super::merge::MergeStream;
use super::stream::{ConcatStream, PartitionStream, RowStream, SortedStream};
use super::{Query, Row};
use crate::database::LogicalDatabase;
use crate::error::{CoreError, CoreResult};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Starts `query` against `collection` at the database's current snapshot.
///
/// # Errors
///
/// `InvalidArgument` for a malformed query or zero partitions, `NotFound`
/// if the collection is not visible, `DatabaseClosed` if the database is
/// closed.
pub fn execute(
    db: Arc<LogicalDatabase>,
    collection: &str,
    query: &Query,
    partitions: usize,
) -> CoreResult<QueryStream> {
    query.validate()?;
    if partitions == 0 {
        return Err(CoreError::invalid_argument("query needs at least one partition"));
    }

    let snapshot = Arc::new(db.snapshot()?);
    let ids = db.candidate_ids(&snapshot, collection)?;
    let mut buckets = vec![Vec::new(); partitions];
    for doc_id in ids {
        buckets[(doc_id % partitions as u64) as usize].push(doc_id);
    }

    tracing::debug!(
        db = %db.id(),
        collection,
        snapshot = %snapshot.tx(),
        partitions,
        ordered = query.order_by.is_some(),
        limit = ?query.limit,
        "query started"
    );

    let filter = query.filter.clone().map(Arc::new);
    let sources = buckets.into_iter().map(|ids| {
        PartitionStream::new(
            Arc::clone(&db),
            Arc::clone(&snapshot),
            collection,
            ids,
            filter.clone(),
        )
    });
    let inner: Box<dyn RowStream> = match &query.order_by {
        None => Box::new(ConcatStream::new(
            sources.map(|s| Box::new(s) as Box<dyn RowStream>).collect(),
        )),
        Some(order) => Box::new(MergeStream::new(
            sources
                .map(|s| Box::new(SortedStream::new(s, order.clone())) as Box<dyn RowStream>)
                .collect(),
            order.clone(),
        )),
    };
    Ok(QueryStream::new(inner, query.limit, query.projection.clone()))
}

/// The result of a query: a row stream with limit and projection applied.
///
/// Iterating yields `CoreResult<Row>`. Yielding the last row the limit
/// allows, running dry or hitting an error closes every partition; so does
/// dropping the stream.
pub struct QueryStream {
    inner: Box<dyn RowStream>,
    limit: Option<usize>,
    projection: Vec<String>,
    yielded: usize,
    closed: bool,
}

impl QueryStream {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Box<dyn RowStream>, limit: Option<usize>, projection: Vec<String>) -> Self {
        let mut stream = Self {
            inner,
            limit,
            projection,
            yielded: 0,
            closed: false,
        };
        if stream.limit_reached() {
            stream.close();
        }
        stream
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.yielded >= limit)
    }

    /// Rows yielded so far.
    #[must_use]
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Whether the stream has finished or was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn project(&self, row: Row) -> Row {
        if self.projection.is_empty() {
            return row;
        }
        let Ok(Value::Object(doc)) = serde_json::from_slice::<Value>(&row.payload) else {
            return row;
        };
        let doc = Value::Object(doc);
        let mut out = Map::new();
        for path in &self.projection {
            if let Some(value) = lookup(&doc, path) {
                insert_path(&mut out, path, value.clone());
            }
        }
        match serde_json::to_vec(&Value::Object(out)) {
            Ok(payload) => Row {
                doc_id: row.doc_id,
                payload,
            },
            Err(_) => row,
        }
    }
}

fn insert_path(out: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            out.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = out
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

impl RowStream for QueryStream {
    fn next_row(&mut self) -> CoreResult<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        match self.inner.next_row() {
            Ok(Some(row)) => {
                self.yielded += 1;
                if self.limit_reached() {
                    self.close();
                }
                Ok(Some(self.project(row)))
            }
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.close();
        }
    }
}

impl Iterator for QueryStream {
    type Item = CoreResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("limit", &self.limit)
            .field("yielded", &self.yielded)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::{BufferPool, MemoryGovernor};
    use crate::query::{Expression, OrderSpec};
    use crate::types::DatabaseId;
    use serde_json::json;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Arc<LogicalDatabase> {
        let config = Config::new(dir).sync_on_commit(false);
        let governor = Arc::new(MemoryGovernor::new(config.global_memory_bytes));
        Arc::new(
            LogicalDatabase::open(DatabaseId(1), "q", &config, governor, Arc::new(BufferPool::new()))
                .unwrap(),
        )
    }

    fn people(db: &LogicalDatabase) {
        db.create_collection("people").unwrap();
        let rows = [
            json!({"name": "ada", "age": 36, "address": {"city": "London"}}),
            json!({"name": "alan", "age": 41, "address": {"city": "Wilmslow"}}),
            json!({"name": "grace", "age": 85}),
            json!({"name": "edsger", "age": 72, "address": {"city": "Austin"}}),
            json!({"name": "barbara", "age": 29}),
        ];
        for (id, doc) in rows.iter().enumerate() {
            db.create("people", id as u64 + 1, serde_json::to_vec(doc).unwrap())
                .unwrap();
        }
    }

    fn names(stream: QueryStream) -> Vec<String> {
        stream
            .map(|row| row.unwrap().json().unwrap()["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn filter_order_and_limit() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        people(&db);

        let query = Query::new()
            .filter(Expression::gt("age", 30))
            .order_by(OrderSpec::desc("age"))
            .limit(3);
        let stream = execute(Arc::clone(&db), "people", &query, 3).unwrap();
        assert_eq!(names(stream), ["grace", "edsger", "alan"]);
    }

    #[test]
    fn unordered_query_concatenates_partitions() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        people(&db);

        // Partition 0 holds ids 2 and 4, partition 1 holds 1, 3 and 5.
        let stream = execute(Arc::clone(&db), "people", &Query::new(), 2).unwrap();
        let ids: Vec<_> = stream.map(|row| row.unwrap().doc_id).collect();
        assert_eq!(ids, [2, 4, 1, 3, 5]);
    }

    #[test]
    fn projection_keeps_listed_paths() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        people(&db);
        db.create("people", 9, b"opaque".to_vec()).unwrap();

        let query = Query::new()
            .project(["name", "address.city"])
            .order_by(OrderSpec::asc("age"));
        let rows: Vec<Row> = execute(Arc::clone(&db), "people", &query, 4)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(rows[0].payload, b"opaque");
        assert_eq!(rows[1].json().unwrap(), json!({"name": "barbara"}));
        assert_eq!(
            rows[2].json().unwrap(),
            json!({"name": "ada", "address": {"city": "London"}})
        );
    }

    #[test]
    fn stream_reads_a_fixed_snapshot() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        people(&db);

        let stream = execute(Arc::clone(&db), "people", &Query::new(), 4).unwrap();
        assert_eq!(db.held_snapshots(), 1);
        db.delete("people", 1).unwrap();
        db.create("people", 6, br#"{"name": "late"}"#.to_vec()).unwrap();

        let mut got = names(stream);
        got.sort();
        assert_eq!(got, ["ada", "alan", "barbara", "edsger", "grace"]);
        assert_eq!(db.held_snapshots(), 0);
    }

    #[test]
    fn dropping_a_stream_releases_its_snapshot() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        people(&db);

        let mut stream = execute(Arc::clone(&db), "people", &Query::new(), 4).unwrap();
        assert!(stream.next().is_some());
        assert_eq!(db.held_snapshots(), 1);
        drop(stream);
        assert_eq!(db.held_snapshots(), 0);
    }

    #[test]
    fn zero_limit_yields_nothing() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        people(&db);
        let mut stream = execute(Arc::clone(&db), "people", &Query::new().limit(0), 4).unwrap();
        assert!(stream.is_closed());
        assert_eq!(db.held_snapshots(), 0);
        assert!(stream.next().is_none());
    }

    #[test]
    fn last_row_within_the_limit_closes_the_stream() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        people(&db);

        let query = Query::new().order_by(OrderSpec::asc("age")).limit(2);
        let mut stream = execute(Arc::clone(&db), "people", &query, 3).unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert!(!stream.is_closed());
        assert_eq!(db.held_snapshots(), 1);

        assert!(stream.next().unwrap().is_ok());
        assert!(stream.is_closed());
        assert_eq!(db.held_snapshots(), 0);
        assert_eq!(stream.yielded(), 2);
        assert!(stream.next().is_none());
    }

    #[test]
    fn errors() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        assert!(matches!(
            execute(Arc::clone(&db), "nope", &Query::new(), 4).unwrap_err(),
            CoreError::NotFound { .. }
        ));
        assert!(matches!(
            execute(Arc::clone(&db), "_default", &Query::new(), 0).unwrap_err(),
            CoreError::InvalidArgument { .. }
        ));
        assert!(matches!(
            execute(Arc::clone(&db), "_default", &Query::new().project([""]), 4).unwrap_err(),
            CoreError::InvalidArgument { .. }
        ));

        let mut stream = execute(Arc::clone(&db), "_default", &Query::new(), 1).unwrap();
        db.close().unwrap();
        assert!(matches!(stream.next(), Some(Err(CoreError::DatabaseClosed))));
        assert!(stream.next().is_none());
    }
}
