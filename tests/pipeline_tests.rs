//! End-to-end runs over Parquet partitions on the local filesystem.


use std::fs;
use std::path::Path;

use txsum_core::config::{PipelineConfig, TimestampPolicy};
use txsum_core::error::{Error, SourceFailure};
use txsum_core::hash::hash_bytes;
use txsum_exec::{Engine, Stage};
use txsum_operators::ENTRY_FOOTPRINT_BYTES;
use test_data_gen::{
    config_for, read_rows, tx, write_dictionary_customers, write_partition, DatetimeEncoding, Tx,
};

const HEADER: &str = "date,transaction_count,customer_count,total_order_amount,total_order_qty";

fn two_day_dataset(data: &Path) {
    write_partition(
        data,
        "date=2024-01-01/part-0.parquet",
        &[
            tx(1, Some(11), 1_000, 1, "2024-01-01 08:00:00"),
            tx(2, Some(12), 2_000, 2, "2024-01-01 12:30:00"),
            tx(3, Some(13), 3_000, 3, "2024-01-01 23:59:59"),
        ],
        DatetimeEncoding::TimestampUtc,
    );
    write_partition(
        data,
        "date=2024-01-02/part-0.parquet",
        &[tx(4, Some(14), 500, 1, "2024-01-02 00:00:00")],
        DatetimeEncoding::TimestampUtc,
    );
}

/// A rendered amount such as `12.5` or `60` in cents.
fn cents(amount: &str) -> i128 {
    let (whole, frac) = amount.split_once('.').unwrap_or((amount, ""));
    assert!(frac.len() <= 2, "unexpected precision in {amount}");
    let frac = format!("{frac:0<2}");
    let sign = if whole.starts_with('-') { -1 } else { 1 };
    whole.parse::<i128>().unwrap() * 100 + sign * frac.parse::<i128>().unwrap()
}

/// Ten single-day partitions cycling through five days.
fn ten_partition_dataset(data: &Path) {
    const DAYS: [&str; 5] = [
        "2024-02-01 10:00:00",
        "2024-02-02 10:00:00",
        "2024-02-03 10:00:00",
        "2024-02-04 10:00:00",
        "2024-02-05 10:00:00",
    ];
    for i in 0..10i64 {
        let day = DAYS[(i % 5) as usize];
        let rows: Vec<Tx> = (0..4)
            .map(|j| {
                let id = i * 10 + j;
                let customer = if j == 3 { None } else { Some(id) };
                tx(id, customer, 125 * (i as i128 + 1) + j as i128, j + 1, day)
            })
            .collect();
        write_partition(
            data,
            &format!("part-{i:02}.parquet"),
            &rows,
            DatetimeEncoding::TimestampUtc,
        );
    }
}

#[test]
fn two_partition_summary_matches_expected_csv() {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    two_day_dataset(data.path());
    let cfg = config_for(data.path(), work.path());

    let manifest = Engine::new(cfg.clone()).run().unwrap();

    let csv = fs::read_to_string(&cfg.output_path).unwrap();
    assert_eq!(
        csv,
        format!("{HEADER}\n2024-01-01,3,3,60,6\n2024-01-02,1,1,5,1\n")
    );
    assert_eq!(manifest.outputs_digest, Some(hash_bytes(csv.as_bytes())));
    assert!(manifest.inputs_digest.is_some());
    assert_eq!(manifest.metrics.partitions, 2);
    assert_eq!(manifest.metrics.rows_read, 4);
    assert_eq!(manifest.metrics.spills, 0);
}

#[test]
fn null_customer_only_drops_out_of_customer_count() {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write_partition(
        data.path(),
        "part-0.parquet",
        &[
            tx(1, Some(1), 1_050, 1, "2024-03-01 09:00:00"),
            tx(2, None, 2_000, 2, "2024-03-01 10:00:00"),
            tx(3, Some(3), 0, 3, "2024-03-01 11:00:00"),
        ],
        DatetimeEncoding::TimestampUtc,
    );
    let cfg = config_for(data.path(), work.path());
    Engine::new(cfg.clone()).run().unwrap();

    assert_eq!(
        read_rows(&cfg.output_path),
        vec![vec!["2024-03-01", "3", "2", "30.5", "6"]]
    );
}

#[test]
fn three_forced_spills_match_the_single_pass_run() {
    let data = tempfile::tempdir().unwrap();
    ten_partition_dataset(data.path());

    let single_work = tempfile::tempdir().unwrap();
    let single_cfg = config_for(data.path(), single_work.path());
    let single = Engine::new(single_cfg.clone()).run().unwrap();
    assert_eq!(single.metrics.batches, 10);
    assert_eq!(single.metrics.spills, 0);

    // Room for two days: the third distinct day in memory forces a spill.
    let spill_work = tempfile::tempdir().unwrap();
    let spill_cfg = PipelineConfig {
        memory_budget_bytes: 2 * ENTRY_FOOTPRINT_BYTES,
        ..config_for(data.path(), spill_work.path())
    };
    let spilled = Engine::new(spill_cfg.clone()).run().unwrap();
    assert_eq!(spilled.metrics.spills, 3);
    assert_eq!(spilled.metrics.segments_merged, 3);
    assert_eq!(
        spilled.metrics.peak_state_bytes,
        3 * ENTRY_FOOTPRINT_BYTES as u64
    );

    assert_eq!(
        fs::read(&single_cfg.output_path).unwrap(),
        fs::read(&spill_cfg.output_path).unwrap()
    );

    // Per-day totals add up to the ungrouped totals.
    let rows = read_rows(&spill_cfg.output_path);
    assert_eq!(rows.len(), 5);
    let tx_total: u64 = rows.iter().map(|r| r[1].parse::<u64>().unwrap()).sum();
    let customer_total: u64 = rows.iter().map(|r| r[2].parse::<u64>().unwrap()).sum();
    let qty_total: i64 = rows.iter().map(|r| r[4].parse::<i64>().unwrap()).sum();
    let amount_total: i128 = rows.iter().map(|r| cents(&r[3])).sum();
    let generated: i128 = (0..10i128)
        .flat_map(|i| (0..4i128).map(move |j| 125 * (i + 1) + j))
        .sum();
    assert_eq!(amount_total, generated);
    assert_eq!(tx_total, 40);
    assert_eq!(customer_total, 30);
    assert_eq!(qty_total, 10 * (1 + 2 + 3 + 4));

    let spill_root = spill_work.path().join("spill");
    let leftovers = fs::read_dir(&spill_root).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn repeated_runs_are_byte_identical() {
    let data = tempfile::tempdir().unwrap();
    ten_partition_dataset(data.path());
    let work = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        fetch_concurrency: 3,
        prefetch_depth: 1,
        ..config_for(data.path(), work.path())
    };

    let first = Engine::new(cfg.clone()).run().unwrap();
    let first_bytes = fs::read(&cfg.output_path).unwrap();
    let second = Engine::new(cfg.clone()).run().unwrap();
    let second_bytes = fs::read(&cfg.output_path).unwrap();

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.outputs_digest, second.outputs_digest);
    assert_eq!(first.inputs_digest, second.inputs_digest);
    assert_eq!(first.config_hash, second.config_hash);
    assert_ne!(first.id, second.id);
}

#[test]
fn output_is_ordered_by_amount_then_date() {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write_partition(
        data.path(),
        "part-0.parquet",
        &[
            tx(1, Some(1), 700, 1, "2024-04-03 01:00:00"),
            tx(2, Some(1), 900, 1, "2024-04-01 01:00:00"),
            tx(3, Some(1), 700, 1, "2024-04-02 01:00:00"),
            tx(4, Some(1), -100, 1, "2024-04-05 01:00:00"),
            tx(5, Some(1), 1_200, 1, "2024-04-04 01:00:00"),
            tx(6, Some(1), 700, 1, "2024-04-06 01:00:00"),
        ],
        DatetimeEncoding::TimestampUtc,
    );
    let cfg = config_for(data.path(), work.path());
    Engine::new(cfg.clone()).run().unwrap();

    let order: Vec<(String, String)> = read_rows(&cfg.output_path)
        .into_iter()
        .map(|r| (r[0].clone(), r[3].clone()))
        .collect();
    let expected: Vec<(String, String)> = [
        ("2024-04-04", "12"),
        ("2024-04-01", "9"),
        ("2024-04-02", "7"),
        ("2024-04-03", "7"),
        ("2024-04-06", "7"),
        ("2024-04-05", "-1"),
    ]
    .iter()
    .map(|(d, a)| (d.to_string(), a.to_string()))
    .collect();
    assert_eq!(order, expected);
}

#[test]
fn string_datetimes_follow_the_declared_format_and_policy() {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write_partition(
        data.path(),
        "part-0.parquet",
        &[
            tx(1, Some(1), 100, 1, "2024-05-01 10:00:00"),
            tx(2, Some(2), 200, 1, "05/01/2024 11:00"),
            tx(3, Some(3), 300, 1, "2024-05-02 00:00:01"),
        ],
        DatetimeEncoding::Text,
    );

    let abort_cfg = config_for(data.path(), work.path());
    let err = Engine::new(abort_cfg.clone()).run().unwrap_err();
    assert_eq!(err.stage, Stage::Project);
    match &err.error {
        Error::InvalidTimestamp { raw, partition, .. } => {
            assert_eq!(raw, "05/01/2024 11:00");
            assert!(partition.ends_with("part-0.parquet"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!Path::new(&abort_cfg.output_path).exists());

    let skip_cfg = PipelineConfig {
        timestamp_policy: TimestampPolicy::Skip,
        ..abort_cfg
    };
    let manifest = Engine::new(skip_cfg.clone()).run().unwrap();
    assert_eq!(manifest.metrics.rows_skipped, 1);
    assert_eq!(
        read_rows(&skip_cfg.output_path),
        vec![
            vec!["2024-05-02", "1", "1", "3", "1"],
            vec!["2024-05-01", "1", "1", "1", "1"],
        ]
    );
}

#[test]
fn empty_match_set_is_not_found() {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    fs::write(data.path().join("notes.txt"), "not parquet").unwrap();
    let cfg = config_for(data.path(), work.path());

    let err = Engine::new(cfg.clone()).run().unwrap_err();
    assert_eq!(err.stage, Stage::Source);
    assert!(matches!(
        err.error,
        Error::SourceUnavailable {
            kind: SourceFailure::NotFound,
            ..
        }
    ));
    assert!(!Path::new(&cfg.output_path).exists());
}

#[test]
fn finer_decimal_than_amount_scale_is_a_schema_mismatch() {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    two_day_dataset(data.path());
    let cfg = PipelineConfig {
        amount_scale: 1,
        ..config_for(data.path(), work.path())
    };
    let err = Engine::new(cfg).run().unwrap_err();
    assert_eq!(err.stage, Stage::Aggregate);
    assert!(matches!(err.error, Error::SchemaMismatch { .. }));
}

#[test]
fn dictionary_encoded_customer_ids_are_read_as_strings() {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write_dictionary_customers(
        data.path(),
        "part-0.parquet",
        &[
            (1, Some("c1"), 1_000, 1, "2024-07-01 08:00:00"),
            (2, Some("c2"), 250, 2, "2024-07-01 09:00:00"),
            (3, Some("c1"), 750, 1, "2024-07-02 10:00:00"),
            (4, None, 100, 1, "2024-07-02 11:00:00"),
        ],
    );
    let cfg = config_for(data.path(), work.path());
    Engine::new(cfg.clone()).run().unwrap();

    assert_eq!(
        read_rows(&cfg.output_path),
        vec![
            vec!["2024-07-01", "2", "2", "12.5", "3"],
            vec!["2024-07-02", "2", "1", "8.5", "2"],
        ]
    );
}

#[test]
fn zoned_timestamps_bucket_by_utc_date() {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    // Wall-clock times at +02:00: 01:30 local on June 2nd is 23:30 UTC on June 1st.
    write_partition(
        data.path(),
        "part-0.parquet",
        &[
            tx(1, Some(1), 400, 1, "2024-06-02 01:30:00"),
            tx(2, Some(2), 100, 1, "2024-06-02 03:00:00"),
            tx(3, Some(3), 100, 1, "2024-06-02 23:59:00"),
        ],
        DatetimeEncoding::TimestampZoned("+02:00"),
    );
    let cfg = config_for(data.path(), work.path());
    Engine::new(cfg.clone()).run().unwrap();

    assert_eq!(
        read_rows(&cfg.output_path),
        vec![
            vec!["2024-06-01", "1", "1", "4", "1"],
            vec!["2024-06-02", "2", "2", "2", "2"],
        ]
    );
}
