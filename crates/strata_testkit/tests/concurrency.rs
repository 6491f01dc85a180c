//! Scheduler modes, deadlines and memory limits under load.

use proptest::prelude::*;
use std::time::Duration;
use strata_core::WriterMode;
use strata_testkit::prelude::*;

#[test]
fn single_writer_never_conflicts() {
    let env = TestEngine::new();
    let db = env.create_database("single");
    for id in 0..4 {
        env.execute(db, Request::create("_default", id, json_doc(id))).unwrap();
    }

    let config = StressConfig {
        threads: 8,
        ops_per_thread: 50,
        ..StressConfig::default()
    };
    let result = stress_hot_updates(&env, db, 4, &config);
    assert_eq!(result.successful_ops, 400);
    assert_eq!(result.conflicts, 0);
    assert_eq!(result.failed_ops, 0);
}

#[test]
fn multi_worker_hot_updates_account_for_every_request() {
    let env = TestEngine::with_config(|c| c.writer_mode(WriterMode::MultiWorker, 4));
    let db = env.create_database("multi");
    for id in 0..2 {
        env.execute(db, Request::create("_default", id, json_doc(id))).unwrap();
    }

    let config = StressConfig {
        threads: 8,
        ops_per_thread: 50,
        ..StressConfig::default()
    };
    let result = stress_hot_updates(&env, db, 2, &config);
    assert_eq!(result.failed_ops, 0);
    assert_eq!(result.successful_ops + result.conflicts, result.total_ops);
    assert!(result.successful_ops > 0);

    // Every committed update is an installed version of one of the hot documents.
    let handle = env.database(db).unwrap();
    assert_eq!(handle.document_count("_default").unwrap(), 2);
}

#[test]
fn multi_worker_disjoint_creates_all_commit() {
    let env = TestEngine::with_config(|c| c.writer_mode(WriterMode::MultiWorker, 4));
    let db = env.create_database("disjoint");
    let result = stress_concurrent_creates(&env, db, &StressConfig::default());
    assert_eq!(result.successful_ops, result.total_ops);
    assert_eq!(
        env.database(db).unwrap().document_count("_default").unwrap(),
        result.total_ops
    );
}

#[test]
fn expired_requests_do_not_run() {
    let env = TestEngine::new();
    let db = env.create_database("deadline");
    let err = env
        .submit(db, Request::create("_default", 1, json_doc(1)), Duration::ZERO)
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout));
    assert!(matches!(
        env.execute(db, Request::read("_default", 1)).unwrap_err(),
        CoreError::NotFound { .. }
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn per_database_limit_holds(sizes in proptest::collection::vec(1usize..400, 1..40)) {
        let env = TestEngine::with_config(|c| c.memory(1 << 20, 2048));
        let db = env.create_database("capped");
        let handle = env.database(db).unwrap();

        let mut created = 0;
        for (id, size) in sizes.iter().enumerate() {
            match env.execute(db, Request::create("_default", id as u64, vec![b'x'; *size])) {
                Ok(_) => created += 1,
                Err(CoreError::MemoryLimit { .. }) => {
                    prop_assert!(handle.read("_default", id as u64).is_err());
                }
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
            let usage = handle.memory_usage().unwrap();
            prop_assert!(usage.used <= usage.limit);
        }
        prop_assert_eq!(handle.document_count("_default").unwrap(), created);
    }
}
