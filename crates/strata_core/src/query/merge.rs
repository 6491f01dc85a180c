//! K-way merge of ordered partition streams.

use super::expr::lookup;
use super::stream::RowStream;
use super::{OrderSpec, Row};
use crate::error::CoreResult;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Sort key extracted from one document field.
///
/// Keys are totally ordered. Missing fields sort first, then booleans,
/// numbers, strings, and finally arrays and objects, which compare equal
/// to each other. Values of one type compare naturally; integers compare
/// exactly. The relative order of different types is not part of the
/// query contract.
#[derive(Debug, Clone)]
pub enum SortKey {
    /// Field absent, `null`, or payload not JSON.
    Missing,
    /// Boolean.
    Bool(bool),
    /// Any JSON number.
    Number(NumberKey),
    /// String.
    Text(String),
    /// Array or object.
    Other,
}

/// A JSON number, kept exact when it is an integer.
#[derive(Debug, Clone, Copy)]
pub enum NumberKey {
    /// Fits `i64` or `u64`.
    Int(i128),
    /// Anything else.
    Float(f64),
}

impl NumberKey {
    fn of(n: &serde_json::Number) -> Self {
        if let Some(i) = n.as_i64() {
            Self::Int(i128::from(i))
        } else if let Some(u) = n.as_u64() {
            Self::Int(i128::from(u))
        } else {
            Self::Float(n.as_f64().unwrap_or(0.0))
        }
    }
}

/// Exact comparison of an integer with a finite float.
fn cmp_int_float(i: i128, f: f64) -> Ordering {
    // Rounding is monotonic, so a strict result is exact. On a tie `f` is
    // integral and within range.
    match (i as f64).partial_cmp(&f) {
        Some(Ordering::Equal) => i.cmp(&(f as i128)),
        Some(ordering) => ordering,
        None => Ordering::Equal,
    }
}

impl PartialEq for NumberKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NumberKey {}

impl PartialOrd for NumberKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NumberKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (*self, *other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(&b),
            (Self::Int(a), Self::Float(b)) => cmp_int_float(a, b),
            (Self::Float(a), Self::Int(b)) => cmp_int_float(b, a).reverse(),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        }
    }
}

impl SortKey {
    /// Key of `field` in a raw payload.
    #[must_use]
    pub fn of(payload: &[u8], field: &str) -> Self {
        serde_json::from_slice::<Value>(payload)
            .ok()
            .as_ref()
            .and_then(|doc| lookup(doc, field))
            .map_or(Self::Missing, Self::from_value)
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Missing,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(NumberKey::of(n)),
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Self::Other,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Missing => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::Text(_) => 3,
            Self::Other => 4,
        }
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

struct HeapEntry {
    key: SortKey,
    row: Row,
    source: usize,
    descending: bool,
}

impl HeapEntry {
    /// Output order: key (reversed when descending), then doc id, then source.
    fn output_order(&self, other: &Self) -> Ordering {
        let by_key = self.key.cmp(&other.key);
        let by_key = if self.descending { by_key.reverse() } else { by_key };
        by_key
            .then(self.row.doc_id.cmp(&other.row.doc_id))
            .then(self.source.cmp(&other.source))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.output_order(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the first row in output order
        // is on top.
        other.output_order(self)
    }
}

/// Merges sources that are each ordered by `order` into one ordered stream.
///
/// The heap holds at most one row per source. It is primed on the first
/// advance and refilled from the source of each popped row.
pub struct MergeStream {
    sources: Vec<Box<dyn RowStream>>,
    done: Vec<bool>,
    heap: BinaryHeap<HeapEntry>,
    order: OrderSpec,
    primed: bool,
}

impl MergeStream {
    /// Merges `sources`, each already ordered by `order`.
    #[must_use]
    pub fn new(sources: Vec<Box<dyn RowStream>>, order: OrderSpec) -> Self {
        Self {
            done: vec![false; sources.len()],
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            order,
            primed: false,
        }
    }

    fn pull(&mut self, source: usize) -> CoreResult<()> {
        if self.done[source] {
            return Ok(());
        }
        match self.sources[source].next_row()? {
            Some(row) => self.heap.push(HeapEntry {
                key: SortKey::of(&row.payload, &self.order.field),
                row,
                source,
                descending: self.order.direction.is_descending(),
            }),
            None => {
                self.done[source] = true;
                self.sources[source].close();
            }
        }
        Ok(())
    }
}

impl RowStream for MergeStream {
    fn next_row(&mut self) -> CoreResult<Option<Row>> {
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                self.pull(source)?;
            }
        }
        let Some(entry) = self.heap.pop() else {
            return Ok(None);
        };
        self.pull(entry.source)?;
        Ok(Some(entry.row))
    }

    fn close(&mut self) {
        for (source, done) in self.sources.iter_mut().zip(self.done.iter_mut()) {
            if !*done {
                *done = true;
                source.close();
            }
        }
        self.heap.clear();
        self.primed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::stream::tests::{row, Counting};
    use crate::query::stream::{SortedStream, VecStream};
    use crate::query::{Direction, QueryStream};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn v(doc_id: u64, value: i64) -> Row {
        row(doc_id, &format!(r#"{{"v": {value}}}"#))
    }

    fn values(rows: &[Row]) -> Vec<i64> {
        rows.iter()
            .map(|r| {
                let doc: Value = serde_json::from_slice(&r.payload).unwrap();
                doc["v"].as_i64().unwrap()
            })
            .collect()
    }

    fn merged(partitions: Vec<Vec<Row>>, order: OrderSpec) -> MergeStream {
        let sources = partitions
            .into_iter()
            .map(|rows| {
                Box::new(SortedStream::new(VecStream::new(rows), order.clone())) as Box<dyn RowStream>
            })
            .collect();
        MergeStream::new(sources, order)
    }

    fn three_partitions() -> Vec<Vec<Row>> {
        vec![
            vec![v(1, 3), v(2, 1)],
            vec![v(3, 2)],
            vec![v(4, 4), v(5, 0)],
        ]
    }

    fn collect(mut stream: impl RowStream) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Some(row) = stream.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn unsorted_partitions_merge_ascending() {
        let rows = collect(merged(three_partitions(), OrderSpec::asc("v")));
        assert_eq!(values(&rows), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn limit_two_yields_the_two_smallest() {
        let stream = merged(three_partitions(), OrderSpec::asc("v"));
        let mut query = QueryStream::new(Box::new(stream), Some(2), Vec::new());
        let rows: Vec<Row> = query.by_ref().collect::<CoreResult<_>>().unwrap();
        assert_eq!(values(&rows), [0, 1]);
        assert!(query.next_row().unwrap().is_none());
        assert!(query.is_closed());
    }

    #[test]
    fn descending_with_ties_by_doc_id() {
        let partitions = vec![vec![v(9, 5), v(2, 7)], vec![v(4, 5), v(1, 7)]];
        let rows = collect(merged(partitions, OrderSpec::new("v", Direction::Desc)));
        let ids: Vec<_> = rows.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, [1, 2, 4, 9]);
    }

    #[test]
    fn missing_fields_sort_first() {
        let partitions = vec![vec![v(1, 2), row(2, r#"{"w": 1}"#)], vec![row(3, "not json")]];
        let rows = collect(merged(partitions, OrderSpec::asc("v")));
        let ids: Vec<_> = rows.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, [2, 3, 1]);
    }

    #[test]
    fn sort_key_ordering() {
        let num = |text: &str| SortKey::of(format!(r#"{{"v": {text}}}"#).as_bytes(), "v");
        assert!(SortKey::Missing < num("-1"));
        assert!(num("2") < num("10"));
        assert!(num("2") < num("2.5"));
        assert_eq!(num("3"), num("3.0"));
        assert!(SortKey::Text("10".into()) < SortKey::Text("2".into()));
        assert!(num("1e300") < SortKey::Text("a".into()));
        assert_eq!(SortKey::of(br#"{"a": [1]}"#, "a"), SortKey::of(br#"{"a": {}}"#, "a"));
        assert_eq!(SortKey::of(br#"{"a": {"b": 1.5}}"#, "a.b"), num("1.5"));
        assert_eq!(SortKey::of(br#"{"a": null}"#, "a"), SortKey::Missing);
    }

    #[test]
    fn large_integers_keep_their_order() {
        let key = |n: u64| SortKey::of(format!(r#"{{"v": {n}}}"#).as_bytes(), "v");
        let big = 1u64 << 60;
        assert!(key(big) < key(big + 1));
        assert!(key(u64::MAX - 1) < key(u64::MAX));
        assert!(SortKey::of(br#"{"v": -9007199254740993}"#, "v") < SortKey::of(br#"{"v": -9007199254740992.0}"#, "v"));
    }

    #[test]
    fn mixed_types_sort_without_panicking() {
        let rows: Vec<Row> = (0..2000u64)
            .map(|id| {
                if id % 2 == 0 {
                    row(id, &format!(r#"{{"v": {}}}"#, id % 7))
                } else {
                    row(id, &format!(r#"{{"v": "s{}"}}"#, id % 5))
                }
            })
            .collect();
        let order = OrderSpec::asc("v");
        let sources: Vec<Box<dyn RowStream>> = rows
            .chunks(500)
            .map(|chunk| {
                Box::new(SortedStream::new(VecStream::new(chunk.to_vec()), order.clone()))
                    as Box<dyn RowStream>
            })
            .collect();
        let merged = collect(MergeStream::new(sources, order.clone()));
        assert_eq!(merged.len(), 2000);
        let keys: Vec<SortKey> = merged.iter().map(|r| SortKey::of(&r.payload, "v")).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        assert!(matches!(keys[0], SortKey::Number(_)));
        assert!(matches!(keys[1999], SortKey::Text(_)));
    }

    #[test]
    fn close_reaches_every_partition_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let sources = vec![
            Counting::new(vec![v(1, 1), v(2, 5)], &closes),
            Counting::new(vec![v(3, 2)], &closes),
            Counting::new(Vec::new(), &closes),
        ];
        let mut stream = MergeStream::new(sources, OrderSpec::asc("v"));
        assert_eq!(stream.next_row().unwrap().unwrap().doc_id, 1);
        // The empty partition ran dry while priming.
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);

        stream.close();
        stream.close();
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 3);
        assert!(stream.next_row().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn merge_equals_full_sort(
            partitions in proptest::collection::vec(
                proptest::collection::vec(-50i64..50, 0..12),
                1..6,
            ),
            descending in any::<bool>(),
            limit in proptest::option::of(0usize..20),
        ) {
            let mut next_id = 0;
            let mut expected = Vec::new();
            let partitions: Vec<Vec<Row>> = partitions
                .into_iter()
                .map(|values| {
                    values
                        .into_iter()
                        .map(|value| {
                            next_id += 1;
                            expected.push((value, next_id));
                            v(next_id, value)
                        })
                        .collect()
                })
                .collect();

            let direction = if descending { Direction::Desc } else { Direction::Asc };
            expected.sort_by(|a, b| {
                let by_value = if descending { b.0.cmp(&a.0) } else { a.0.cmp(&b.0) };
                by_value.then(a.1.cmp(&b.1))
            });
            if let Some(limit) = limit {
                expected.truncate(limit);
            }

            let stream = merged(partitions, OrderSpec::new("v", direction));
            let query = QueryStream::new(Box::new(stream), limit, Vec::new());
            let rows: Vec<Row> = query.collect::<CoreResult<_>>().unwrap();
            let got: Vec<(i64, u64)> = values(&rows)
                .into_iter()
                .zip(rows.iter().map(|r| r.doc_id))
                .collect();
            prop_assert_eq!(got, expected);
        }
    }
}
