use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::{CLASSIC_TOURNAMENT, DEFAULT_API_URL};
use crate::credentials::ApiKey;
use crate::error::PipelineError;
use crate::http_client::{self, download_to_file, redact_query};

const DATASET_QUERY: &str = r#"
query($filename: String!) {
  dataset(filename: $filename)
}
"#;

const MODELS_QUERY: &str = r#"
query($tournament: Int!) {
  account {
    models(tournament: $tournament) {
      id
      name
      tournament
    }
  }
}
"#;

const UPLOAD_AUTH_QUERY: &str = r#"
query($filename: String!, $tournament: Int!, $modelId: String) {
  submission_upload_auth(filename: $filename, tournament: $tournament, modelId: $modelId) {
    filename
    url
  }
}
"#;

const CREATE_SUBMISSION_MUTATION: &str = r#"
mutation($filename: String!, $tournament: Int!, $modelId: String) {
  create_submission(filename: $filename, tournament: $tournament, modelId: $modelId) {
    id
  }
}
"#;

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: &'a Value,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct DatasetData {
    dataset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsData {
    account: AccountModels,
}

#[derive(Debug, Deserialize)]
struct AccountModels {
    #[serde(default)]
    models: Vec<ModelRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelRow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tournament: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UploadAuthData {
    submission_upload_auth: UploadAuth,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadAuth {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct CreateSubmissionData {
    create_submission: CreatedSubmission,
}

#[derive(Debug, Deserialize)]
struct CreatedSubmission {
    id: String,
}

/// Thin GraphQL client for the tournament API.
#[derive(Debug, Clone)]
pub struct NumerApi {
    client: Client,
    url: String,
    key: Option<ApiKey>,
    tournament: u32,
}

impl NumerApi {
    pub fn new(key: Option<ApiKey>) -> Result<Self> {
        let client = http_client::http_client()?.clone();
        Ok(Self::with_client(client, key))
    }

    pub fn with_client(client: Client, key: Option<ApiKey>) -> Self {
        Self {
            client,
            url: DEFAULT_API_URL.to_string(),
            key,
            tournament: CLASSIC_TOURNAMENT,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_tournament(mut self, tournament: u32) -> Self {
        self.tournament = tournament;
        self
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Posts a query and returns its `data` member.
    pub fn raw_query(&self, query: &str, variables: Value, authorized: bool) -> Result<Value> {
        let body = GraphqlRequest {
            query,
            variables: &variables,
        };
        let mut req = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&body);
        if authorized {
            let Some(key) = self.key.as_ref() else {
                return Err(anyhow!(PipelineError::Api(
                    "query requires an api key but none was configured".to_string()
                )));
            };
            req = req.header(AUTHORIZATION, key.authorization_header());
        }

        let resp = req.send().context("graphql request failed")?;
        let status = resp.status();
        let raw = resp.text().context("failed reading graphql body")?;
        // Errors come back as JSON even on 4xx; prefer their message when present.
        match parse_graphql_response(&raw) {
            Ok(data) if status.is_success() => Ok(data),
            Ok(_) => Err(anyhow!(PipelineError::Api(format!("http {status}: {raw}")))),
            Err(err) if status.is_success() => Err(err),
            Err(err) => Err(err.context(format!("http {status}"))),
        }
    }

    fn typed_query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
        authorized: bool,
    ) -> Result<T> {
        let data = self.raw_query(query, variables, authorized)?;
        serde_json::from_value(data).context("unexpected graphql response shape")
    }

    pub fn dataset_url(&self, filename: &str) -> Result<String> {
        let data: DatasetData =
            self.typed_query(DATASET_QUERY, json!({ "filename": filename }), false)?;
        data.dataset
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| anyhow!(PipelineError::Api(format!("no dataset named {filename}"))))
    }

    pub fn download_dataset(&self, filename: &str, dest: &Path) -> Result<u64> {
        let url = self.dataset_url(filename)?;
        debug!(url = redact_query(&url), "resolved dataset url");
        let bytes = download_to_file(&self.client, &url, dest)
            .with_context(|| format!("download {filename}"))?;
        info!(filename, dest = %dest.display(), bytes, "dataset downloaded");
        Ok(bytes)
    }

    /// Model name to model id for the authenticated account.
    pub fn get_models(&self) -> Result<BTreeMap<String, String>> {
        let rows = self.list_models()?;
        Ok(rows.into_iter().map(|m| (m.name, m.id)).collect())
    }

    pub fn list_models(&self) -> Result<Vec<ModelRow>> {
        let data: ModelsData = self.typed_query(
            MODELS_QUERY,
            json!({ "tournament": self.tournament }),
            true,
        )?;
        Ok(data.account.models)
    }

    /// Uploads a submission CSV and registers it; returns the submission id.
    pub fn upload_predictions(&self, path: &Path, model_id: &str) -> Result<String> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("submission path has no file name: {}", path.display()))?
            .to_string();
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;

        let auth: UploadAuthData = self.typed_query(
            UPLOAD_AUTH_QUERY,
            json!({
                "filename": filename,
                "tournament": self.tournament,
                "modelId": model_id,
            }),
            true,
        )?;
        let auth = auth.submission_upload_auth;
        debug!(url = redact_query(&auth.url), "upload slot granted");

        self.client
            .put(&auth.url)
            .body(bytes)
            .send()
            .context("submission upload failed")?
            .error_for_status()
            .context("submission upload rejected")?;

        let created: CreateSubmissionData = self.typed_query(
            CREATE_SUBMISSION_MUTATION,
            json!({
                "filename": auth.filename,
                "tournament": self.tournament,
                "modelId": model_id,
            }),
            true,
        )?;
        Ok(created.create_submission.id)
    }
}

/// Returns the `data` member of a GraphQL response or an error carrying
/// every reported message.
pub fn parse_graphql_response(raw: &str) -> Result<Value> {
    let parsed: GraphqlResponse =
        serde_json::from_str(raw).context("graphql response is not json")?;
    if let Some(errors) = parsed.errors
        && !errors.is_empty()
    {
        let joined = errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(anyhow!(PipelineError::Api(joined)));
    }
    parsed
        .data
        .filter(|d| !d.is_null())
        .ok_or_else(|| anyhow!(PipelineError::Api("response carried no data".to_string())))
}
