//! Upsert variable-length values whose every word holds the value tag, then
//! read them back and check each payload.

use hlog_bench::config::BenchFile;
use hlog_bench::fixtures::LargeStore;
use hlog_bench::store::LargeFunctions;
use hlog_bench::value::LargeValue;
use hlog_bench::{BenchConfig, BenchOptions, KvStore, LogConfig, RoundController};

/// 16 words
const VALUE_SIZE: usize = 16 * 8;

fn default_options() -> BenchOptions {
    BenchOptions {
        per_round_keys: Some(1 << 14),
        rounds: Some(1 << 6),
        verify_reads: Some(true),
        ..Default::default()
    }
}

fn main() {
    env_logger::init();

    let file = BenchFile::from_env().unwrap().unwrap_or_else(|| BenchFile {
        bench: default_options(),
        ..Default::default()
    });
    let report_path = file.report;
    let config = BenchConfig::try_from(file.bench).unwrap();
    let log_config = LogConfig::try_from(file.log).unwrap();

    let store = LargeStore::new(
        (config.max_key() / 2) as usize,
        LargeFunctions::verifying(),
        log_config,
        None,
    )
    .unwrap();

    let controller = RoundController::new(&store, config);
    let report = controller
        .run(|tag| LargeValue::with_content(tag as i64, VALUE_SIZE))
        .unwrap();
    println!("{report}");
    if let Some(path) = report_path {
        report.write_json(&path).unwrap();
    }
    println!(
        "entries {} completed reads {} mismatches {}",
        store.entry_count(),
        store.functions().completed_reads(),
        store.functions().mismatches()
    );
    assert_eq!(store.functions().mismatches(), 0);
}
