use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use hlog_bench::fixtures::{large_universe, tiny_large_store};
use hlog_bench::store::functions::LargeInput;
use hlog_bench::value::{LargeOutput, LargeValue, Tagged};
use hlog_bench::{
    BenchConfig, BenchOptions, FailurePolicy, KeyPolicy, KvSession, KvStore, RoundController,
    Status, UniverseShape,
};

const VALUE_SIZE: usize = 64;

#[test]
fn test_word_translation() {
    let content: i64 = 13212;
    let bytes = content.to_le_bytes();
    assert_eq!(i64::from_le_bytes(bytes), content);

    let value = LargeValue::with_content(content, VALUE_SIZE);
    for chunk in value.as_bytes().chunks_exact(8) {
        assert_eq!(chunk, bytes);
    }
    assert_eq!(value.tag(), Some(content));

    let negative = LargeValue::with_content(-1, 16);
    assert!(negative.as_bytes().iter().all(|&b| b == 0xff));
    assert_eq!(negative.tag(), Some(-1));
}

#[test]
fn test_single_upsert_grows_value() {
    let (_dir, store) = tiny_large_store();
    let mut session = store.new_session();
    let key = -1231i64;

    let small = LargeValue::patterned(8);
    assert_eq!(session.upsert(&key, &small, (), 1), Status::Ok);
    let large = LargeValue::with_content(13212, VALUE_SIZE);
    assert_eq!(session.upsert(&key, &large, (), 2), Status::Ok);

    let mut output = LargeOutput::default();
    let status = session.read(&key, &LargeInput::default(), &mut output, (), 3);
    assert_eq!(status, Status::Ok);
    let value = output.0.unwrap();
    assert_eq!(value.len(), VALUE_SIZE);
    assert_eq!(value.words().collect::<Vec<_>>(), vec![13212; 8]);

    assert_eq!(session.delete(&key, (), 4), Status::Ok);
    let mut output = LargeOutput::default();
    let status = session.read(&key, &LargeInput::default(), &mut output, (), 5);
    assert_eq!(status, Status::NotFound);
    assert_eq!(output, LargeOutput::default());
    session.dispose();
}

#[test]
fn test_concurrent_upserts_never_tear() {
    const UPDATERS: u64 = 4;
    const UPDATES: u64 = 2_000;

    let (_dir, store) = tiny_large_store();
    let key = 0i64;
    let mut init = store.new_session();
    init.upsert(&key, &LargeValue::with_content(0, VALUE_SIZE), (), 1);
    init.dispose();

    let ticks = AtomicU64::new(0);
    let observed = thread::scope(|scope| {
        for updater in 0..UPDATERS {
            let store = &store;
            let ticks = &ticks;
            scope.spawn(move || {
                let mut session = store.new_session();
                for i in 0..UPDATES {
                    let content = (updater * UPDATES + i) as i64;
                    let value = LargeValue::with_content(content, VALUE_SIZE);
                    assert_eq!(session.upsert(&key, &value, (), i + 1), Status::Ok);
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
                session.dispose();
            });
        }

        let reader = scope.spawn(|| {
            let mut session = store.new_session();
            let mut observed = 0u64;
            let mut serial = 0;
            while ticks.load(Ordering::Relaxed) < UPDATERS * UPDATES {
                serial += 1;
                let mut output = LargeOutput::default();
                match session.read(&key, &LargeInput::default(), &mut output, (), serial) {
                    Status::Ok => {
                        let value = output.0.as_ref().unwrap();
                        assert_eq!(value.len(), VALUE_SIZE);
                        assert!(output.tag().is_some(), "torn value {value:?}");
                        observed += 1;
                    }
                    Status::Pending => {
                        session.complete_pending(true);
                    }
                    status => panic!("unexpected read status {status:?}"),
                }
            }
            assert!(session.complete_pending(true));
            session.dispose();
            observed
        });
        reader.join().unwrap()
    });

    log::debug!("reader observed {observed} consistent values");
    assert_eq!(store.functions().mismatches(), 0);

    let mut session = store.new_session();
    let mut output = LargeOutput::default();
    match session.read(&key, &LargeInput::default(), &mut output, (), 1) {
        Status::Ok => {
            let content = output.tag().unwrap();
            assert!((0..(UPDATERS * UPDATES) as i64).contains(&content));
        }
        Status::Pending => assert!(session.complete_pending(true)),
        status => panic!("unexpected read status {status:?}"),
    }
    session.dispose();
    assert_eq!(store.entry_count(), 1);
    assert_eq!(store.active_sessions(), 0);
}

#[test]
fn test_large_object_rounds_verify_reads() {
    let (_dir, store) = tiny_large_store();
    let config = BenchConfig::try_from(BenchOptions {
        per_round_keys: Some(16),
        rounds: Some(8),
        threads: Some(4),
        iterations: Some(2),
        verify_reads: Some(true),
        failure_policy: Some(FailurePolicy::FailFast),
        ..Default::default()
    })
    .unwrap();
    let controller = RoundController::new(&store, config);
    let report = controller
        .run(|tag| LargeValue::with_content(tag as i64, VALUE_SIZE))
        .unwrap();

    assert_eq!(report.iterations.len(), 2);
    assert!(report.iterations.iter().all(|round| round.drained));
    assert_eq!(store.functions().mismatches(), 0);
    assert_eq!(store.entry_count(), 128);
}

#[test]
fn test_large_universe_values_carry_their_tag() {
    let shape = UniverseShape::new(4, 2);
    let universe = large_universe(shape, KeyPolicy::Fresh, 3, VALUE_SIZE);
    for round in 0..shape.rounds {
        let (keys, values) = universe.round(round);
        for (key, value) in keys.iter().zip(values) {
            assert_eq!(value.tag(), Some(*key as i64));
        }
    }
}
