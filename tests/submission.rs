mod common;

use std::fs;

use numerai_pipeline::submission::Submission;

use common::scratch_dir;

fn read_back(name: &str, contents: &str) -> anyhow::Result<Submission> {
    let path = scratch_dir(name).join("submission.csv");
    fs::write(&path, contents).expect("write csv");
    Submission::read_csv(&path)
}

fn rejection(name: &str, contents: &str) -> String {
    let err = read_back(name, contents).expect_err("csv should be rejected");
    format!("{err:#}")
}

#[test]
fn well_formed_file_is_accepted() {
    let sub = read_back("csv_ok", "id,prediction\nn1,0.25\nn2, 0.75\n").expect("valid csv");
    assert_eq!(sub.ids(), &["n1".to_string(), "n2".to_string()]);
    assert_eq!(sub.predictions(), &[0.25, 0.75]);
}

#[test]
fn wrong_header_is_rejected() {
    assert!(rejection("csv_header", "id,score\nn1,0.5\n").contains("prediction"));
    assert!(rejection("csv_columns", "id,era,prediction\nn1,1,0.5\n").contains("two columns"));
}

#[test]
fn blank_prediction_is_rejected() {
    assert!(rejection("csv_blank", "id,prediction\nn1,0.5\nn2,\n").contains("row 1"));
}

#[test]
fn non_numeric_prediction_is_rejected() {
    let msg = rejection("csv_text", "id,prediction\nn1,high\n");
    assert!(msg.contains("non-numeric"), "{msg}");
}

#[test]
fn non_finite_predictions_are_rejected() {
    assert!(rejection("csv_nan", "id,prediction\nn1,NaN\n").contains("non-finite"));
    assert!(rejection("csv_inf", "id,prediction\nn1,inf\n").contains("non-finite"));
}

#[test]
fn header_only_file_is_rejected() {
    assert!(rejection("csv_header_only", "id,prediction\n").contains("no predictions"));
}

#[test]
fn empty_file_is_rejected() {
    assert!(rejection("csv_empty", "").contains("two columns"));
}
