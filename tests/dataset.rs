mod common;

use numerai_pipeline::dataset::{Column, read_parquet};
use numerai_pipeline::error::PipelineError;
use numerai_pipeline::features::load_feature_set;
use numerai_pipeline::submission::{IdSource, resolve_ids};

use common::{TestColumn, fixture_path, scratch_dir, write_parquet};

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn sample_file(name: &str) -> std::path::PathBuf {
    let dir = scratch_dir(name);
    let path = dir.join("train.parquet");
    write_parquet(
        &path,
        &[
            TestColumn::Text("id", names(&["n0", "n1", "n2", "n3"])),
            TestColumn::Text("era", names(&["0002", "0001", "0002", "0010"])),
            TestColumn::Int8("feature_alpha", vec![0, 1, 2, 4]),
            TestColumn::Double("feature_beta", vec![0.25, 0.5, 0.75, 1.0]),
            TestColumn::OptionalDouble("target", vec![Some(0.5), None, Some(0.25), Some(1.0)]),
        ],
    );
    path
}

#[test]
fn reads_every_column_without_projection() {
    let path = sample_file("full_read");
    let frame = read_parquet(&path, None).expect("parquet should load");
    assert_eq!(frame.len(), 4);
    assert_eq!(
        frame.column_names(),
        names(&["id", "era", "feature_alpha", "feature_beta", "target"]).as_slice()
    );
    assert!(matches!(frame.column("id"), Some(Column::Text(_))));
    assert_eq!(
        frame.numeric("feature_alpha").expect("int8 reads as numeric"),
        &[0.0, 1.0, 2.0, 4.0]
    );
}

#[test]
fn projection_reads_only_requested_columns() {
    let path = sample_file("projection");
    let wanted = names(&["feature_beta", "target", "feature_missing"]);
    let frame = read_parquet(&path, Some(&wanted)).expect("parquet should load");
    assert_eq!(frame.len(), 4);
    assert!(frame.has_column("feature_beta"));
    assert!(frame.has_column("target"));
    assert!(!frame.has_column("id"));
    assert!(!frame.has_column("feature_missing"));

    let err = frame
        .require_columns(&wanted, &path)
        .expect_err("missing column should be reported");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingColumn { column, .. }) if column == "feature_missing"
    ));
}

#[test]
fn nulls_read_as_nan() {
    let path = sample_file("nulls");
    let frame = read_parquet(&path, Some(&names(&["target"]))).expect("parquet should load");
    let target = frame.numeric("target").expect("target is numeric");
    assert_eq!(target[0], 0.5);
    assert!(target[1].is_nan());
    assert_eq!(target[3], 1.0);
}

#[test]
fn text_columns_are_not_numeric() {
    let path = sample_file("text_numeric");
    let frame = read_parquet(&path, None).expect("parquet should load");
    assert!(matches!(
        frame.numeric("era").map_err(|e| e.downcast::<PipelineError>().ok()),
        Err(Some(PipelineError::NotNumeric(name))) if name == "era"
    ));
}

#[test]
fn feature_matrix_follows_requested_order() {
    let path = sample_file("matrix");
    let frame = read_parquet(&path, None).expect("parquet should load");
    let x = frame
        .feature_matrix(&names(&["feature_beta", "feature_alpha"]))
        .expect("matrix should build");
    assert_eq!(x.rows(), 4);
    assert_eq!(x.cols(), 2);
    assert_eq!(x.row(3), &[1.0, 4.0]);
}

#[test]
fn ids_come_from_id_column() {
    let path = sample_file("ids");
    let frame = read_parquet(&path, None).expect("parquet should load");
    let (ids, source) = resolve_ids(&frame);
    assert_eq!(source, IdSource::Column("id".to_string()));
    assert_eq!(ids, names(&["n0", "n1", "n2", "n3"]));
}

#[test]
fn integer_ids_keep_every_digit() {
    let dir = scratch_dir("int64_ids");
    let path = dir.join("live.parquet");
    write_parquet(
        &path,
        &[
            TestColumn::Int64("id", vec![9_007_199_254_740_993, 1_234_567_890_123_456_789]),
            TestColumn::Int64("feature_count", vec![3, 4]),
        ],
    );

    let frame = read_parquet(&path, None).expect("parquet should load");
    let (ids, source) = resolve_ids(&frame);
    assert_eq!(source, IdSource::Column("id".to_string()));
    assert_eq!(ids, names(&["9007199254740993", "1234567890123456789"]));
    assert_eq!(
        frame.numeric("feature_count").expect("other int64 columns stay numeric"),
        &[3.0, 4.0]
    );
}

#[test]
fn integer_row_ids_are_text_too() {
    let dir = scratch_dir("int64_row_ids");
    let path = dir.join("live.parquet");
    write_parquet(&path, &[TestColumn::Int64("row_id", vec![i64::MAX, -7])]);

    let frame = read_parquet(&path, Some(&names(&["row_id"]))).expect("parquet should load");
    assert!(matches!(frame.column("row_id"), Some(Column::Text(_))));
    let (ids, source) = resolve_ids(&frame);
    assert_eq!(source, IdSource::Column("row_id".to_string()));
    assert_eq!(ids, names(&["9223372036854775807", "-7"]));
}

#[test]
fn fixture_feature_sets_resolve() {
    let path = fixture_path("features.json");
    let small = load_feature_set(&path, "small").expect("small set exists");
    assert_eq!(small, names(&["feature_alpha", "feature_beta"]));
    let all = load_feature_set(&path, "all").expect("all set exists");
    assert_eq!(all.len(), 3);

    let err = load_feature_set(&path, "huge").expect_err("unknown set");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::FeatureSetMissing { set, .. }) if set == "huge"
    ));
}
