mod common;

use std::fs;

use numerai_pipeline::credentials::ApiKey;
use numerai_pipeline::error::PipelineError;
use numerai_pipeline::numerai_api::{NumerApi, parse_graphql_response};
use serde_json::json;

use common::{MockServer, fixture_path, scratch_dir, test_client};

fn api_against(server: &MockServer, key: Option<ApiKey>) -> NumerApi {
    NumerApi::with_client(test_client(), key).with_url(server.url())
}

#[test]
fn parses_models_fixture() {
    let raw = fs::read_to_string(fixture_path("models_response.json"))
        .expect("fixture file should be readable");
    let data = parse_graphql_response(&raw).expect("fixture should parse");
    let models = data["account"]["models"].as_array().expect("models array");
    assert_eq!(models.len(), 2);
    assert_eq!(models[0]["name"], "alpha_boost");
}

#[test]
fn get_models_sends_token_and_maps_names() {
    let raw = fs::read_to_string(fixture_path("models_response.json"))
        .expect("fixture file should be readable");
    let server = MockServer::start(1, move |_, _| (200, raw.clone().into_bytes()));
    let api = api_against(&server, Some(ApiKey::new("PUB", "SEC")));

    let models = api.get_models().expect("models should load");
    assert_eq!(models.len(), 2);
    assert_eq!(
        models.get("beta_sgd").map(String::as_str),
        Some("7b2d9a34-11aa-4c2b-8f3e-aabbccddeeff")
    );

    let seen = server.received(1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, "/graphql");
    assert_eq!(seen[0].header("authorization"), Some("Token PUB$SEC"));
    let body: serde_json::Value =
        serde_json::from_slice(&seen[0].body).expect("request body is json");
    assert_eq!(body["variables"]["tournament"], 8);
    assert!(body["query"].as_str().unwrap_or_default().contains("models"));
}

#[test]
fn graphql_errors_become_api_errors() {
    let server = MockServer::start(1, |_, _| {
        let body = json!({ "errors": [{ "message": "invalid token" }], "data": null });
        (200, body.to_string().into_bytes())
    });
    let api = api_against(&server, Some(ApiKey::new("PUB", "WRONG")));

    let err = api.get_models().expect_err("errors should surface");
    let api_err = err
        .downcast_ref::<PipelineError>()
        .expect("should be a pipeline error");
    assert!(matches!(api_err, PipelineError::Api(msg) if msg.contains("invalid token")));
}

#[test]
fn http_error_status_keeps_graphql_message() {
    let server = MockServer::start(1, |_, _| {
        let body = json!({ "errors": [{ "message": "not authorised" }] });
        (401, body.to_string().into_bytes())
    });
    let api = api_against(&server, Some(ApiKey::new("PUB", "SEC")));

    let err = api.get_models().expect_err("401 should fail");
    let text = format!("{err:#}");
    assert!(text.contains("401"));
    assert!(text.contains("not authorised"));
}

#[test]
fn authorized_query_without_key_fails_before_sending() {
    let api = NumerApi::with_client(test_client(), None).with_url("http://127.0.0.1:9/graphql");
    assert!(!api.has_key());
    let err = api.get_models().expect_err("no key configured");
    assert!(format!("{err:#}").contains("api key"));
}

#[test]
fn download_dataset_follows_presigned_url() {
    let server = MockServer::start(2, |req, base| {
        if req.method == "POST" {
            let body = json!({ "data": { "dataset": format!("{base}/bucket/v4/live.parquet?sig=abc") } });
            (200, body.to_string().into_bytes())
        } else {
            (200, b"PAR1fake".to_vec())
        }
    });
    let api = api_against(&server, None);
    let dir = scratch_dir("download");
    let dest = dir.join("nested").join("live.parquet");

    let bytes = api
        .download_dataset("v4/live.parquet", &dest)
        .expect("download should succeed");
    assert_eq!(bytes, 8);
    assert_eq!(fs::read(&dest).expect("file written"), b"PAR1fake");
    assert!(!dest.with_extension("part").exists());

    let seen = server.received(2);
    assert!(seen[0].header("authorization").is_none());
    assert!(seen[0].body_text().contains("v4/live.parquet"));
    assert_eq!(seen[1].method, "GET");
    assert_eq!(seen[1].path, "/bucket/v4/live.parquet?sig=abc");
}

#[test]
fn unknown_dataset_is_an_error() {
    let server = MockServer::start(1, |_, _| {
        (200, json!({ "data": { "dataset": null } }).to_string().into_bytes())
    });
    let api = api_against(&server, None);
    let err = api.dataset_url("v9/nope.parquet").expect_err("missing dataset");
    assert!(format!("{err:#}").contains("v9/nope.parquet"));
}

#[test]
fn upload_requests_slot_puts_file_and_registers_it() {
    let server = MockServer::start(3, |req, base| {
        let text = req.body_text();
        if req.method == "PUT" {
            (200, Vec::new())
        } else if text.contains("submission_upload_auth") {
            let body = json!({ "data": { "submission_upload_auth": {
                "filename": "uploads/predictions.csv",
                "url": format!("{base}/upload/predictions.csv")
            } } });
            (200, body.to_string().into_bytes())
        } else if text.contains("create_submission") {
            (200, json!({ "data": { "create_submission": { "id": "sub-42" } } }).to_string().into_bytes())
        } else {
            (400, b"{}".to_vec())
        }
    });
    let api = api_against(&server, Some(ApiKey::new("PUB", "SEC")));
    let dir = scratch_dir("upload");
    let path = dir.join("predictions.csv");
    fs::write(&path, "id,prediction\nn1,0.5\n").expect("write submission");

    let id = api
        .upload_predictions(&path, "model-1")
        .expect("upload should succeed");
    assert_eq!(id, "sub-42");

    let seen = server.received(3);
    let auth: serde_json::Value = serde_json::from_slice(&seen[0].body).expect("json");
    assert_eq!(auth["variables"]["filename"], "predictions.csv");
    assert_eq!(auth["variables"]["modelId"], "model-1");
    assert_eq!(seen[1].method, "PUT");
    assert_eq!(seen[1].path, "/upload/predictions.csv");
    assert_eq!(seen[1].body_text(), "id,prediction\nn1,0.5\n");
    let created: serde_json::Value = serde_json::from_slice(&seen[2].body).expect("json");
    assert_eq!(created["variables"]["filename"], "uploads/predictions.csv");
    assert_eq!(seen[2].header("authorization"), Some("Token PUB$SEC"));
}

#[test]
fn rejected_put_stops_the_upload() {
    let server = MockServer::start(2, |req, base| {
        if req.method == "PUT" {
            (500, b"{}".to_vec())
        } else {
            let body = json!({ "data": { "submission_upload_auth": {
                "filename": "predictions.csv",
                "url": format!("{base}/upload/predictions.csv")
            } } });
            (200, body.to_string().into_bytes())
        }
    });
    let api = api_against(&server, Some(ApiKey::new("PUB", "SEC")));
    let dir = scratch_dir("upload_rejected");
    let path = dir.join("predictions.csv");
    fs::write(&path, "id,prediction\nn1,0.5\n").expect("write submission");

    let err = api
        .upload_predictions(&path, "model-1")
        .expect_err("500 on PUT should fail");
    assert!(format!("{err:#}").contains("rejected"));
    assert_eq!(server.received(2).len(), 2);
}
