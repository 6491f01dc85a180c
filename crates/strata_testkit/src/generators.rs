//! Property-based test generators using proptest.
//!
//! Provides strategies for payloads, names and operation sequences, plus a
//! reference model the sequences can be checked against.

use proptest::prelude::*;
use std::collections::BTreeMap;
use strata_core::{DocumentId, Request};

/// Strategy for valid database and collection names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for opaque payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for flat JSON objects with small integer and string fields.
pub fn json_object_strategy() -> impl Strategy<Value = serde_json::Value> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-e]").expect("Invalid regex"),
        prop_oneof![
            any::<i32>().prop_map(serde_json::Value::from),
            prop::string::string_regex("[a-z]{0,6}")
                .expect("Invalid regex")
                .prop_map(serde_json::Value::from),
        ],
        0..5,
    )
    .prop_map(|fields| serde_json::Value::Object(fields.into_iter().collect()))
}

/// One document operation on `_default`.
#[derive(Debug, Clone)]
pub enum DocOperation {
    /// Create a document.
    Create {
        /// Document ID.
        id: DocumentId,
        /// Payload.
        data: Vec<u8>,
    },
    /// Replace a document.
    Update {
        /// Document ID.
        id: DocumentId,
        /// Payload.
        data: Vec<u8>,
    },
    /// Delete a document.
    Delete {
        /// Document ID.
        id: DocumentId,
    },
    /// Read a document.
    Read {
        /// Document ID.
        id: DocumentId,
    },
}

impl DocOperation {
    /// The scheduler request performing this operation.
    #[must_use]
    pub fn to_request(&self) -> Request {
        match self {
            Self::Create { id, data } => Request::create("_default", *id, data.clone()),
            Self::Update { id, data } => Request::update("_default", *id, data.clone()),
            Self::Delete { id } => Request::delete("_default", *id),
            Self::Read { id } => Request::read("_default", *id),
        }
    }
}

/// Strategy for document operations over IDs `0..id_space`.
pub fn doc_operation_strategy(id_space: u64) -> impl Strategy<Value = DocOperation> {
    let id = 0..id_space;
    prop_oneof![
        3 => (id.clone(), payload_strategy()).prop_map(|(id, data)| DocOperation::Create { id, data }),
        2 => (id.clone(), payload_strategy()).prop_map(|(id, data)| DocOperation::Update { id, data }),
        1 => id.clone().prop_map(|id| DocOperation::Delete { id }),
        2 => id.prop_map(|id| DocOperation::Read { id }),
    ]
}

/// Strategy for a sequence of document operations.
pub fn operation_sequence_strategy(
    id_space: u64,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<DocOperation>> {
    prop::collection::vec(doc_operation_strategy(id_space), min_ops..max_ops)
}

/// Expected outcome of one operation under the reference model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    /// Succeeds; reads return the payload.
    Ok(Option<Vec<u8>>),
    /// Fails with `NotFound`.
    NotFound,
    /// Fails with `AlreadyExists`.
    AlreadyExists,
}

/// In-memory model of one collection's committed state.
#[derive(Debug, Default, Clone)]
pub struct Model {
    docs: BTreeMap<DocumentId, Vec<u8>>,
}

impl Model {
    /// Applies `op` and returns what the engine should report.
    pub fn apply(&mut self, op: &DocOperation) -> Expected {
        match op {
            DocOperation::Create { id, data } => {
                if self.docs.contains_key(id) {
                    Expected::AlreadyExists
                } else {
                    self.docs.insert(*id, data.clone());
                    Expected::Ok(None)
                }
            }
            DocOperation::Update { id, data } => match self.docs.get_mut(id) {
                Some(doc) => {
                    doc.clone_from(data);
                    Expected::Ok(None)
                }
                None => Expected::NotFound,
            },
            DocOperation::Delete { id } => match self.docs.remove(id) {
                Some(_) => Expected::Ok(None),
                None => Expected::NotFound,
            },
            DocOperation::Read { id } => match self.docs.get(id) {
                Some(doc) => Expected::Ok(Some(doc.clone())),
                None => Expected::NotFound,
            },
        }
    }

    /// Committed documents.
    #[must_use]
    pub fn docs(&self) -> &BTreeMap<DocumentId, Vec<u8>> {
        &self.docs
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::catalog::validate_name;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generated_names_are_valid(name in name_strategy()) {
            prop_assert!(validate_name(&name).is_ok());
        }

        #[test]
        fn json_objects_serialize(doc in json_object_strategy()) {
            let bytes = serde_json::to_vec(&doc).unwrap();
            prop_assert_eq!(bytes.first(), Some(&b'{'));
        }
    }

    #[test]
    fn model_follows_existence_rules() {
        let mut model = Model::default();
        let create = DocOperation::Create { id: 1, data: vec![1] };
        assert_eq!(model.apply(&create), Expected::Ok(None));
        assert_eq!(model.apply(&create), Expected::AlreadyExists);
        assert_eq!(
            model.apply(&DocOperation::Read { id: 1 }),
            Expected::Ok(Some(vec![1]))
        );
        assert_eq!(model.apply(&DocOperation::Delete { id: 1 }), Expected::Ok(None));
        assert_eq!(model.apply(&DocOperation::Update { id: 1, data: vec![] }), Expected::NotFound);
    }
}
