use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;

const CONNECT_TIMEOUT_SECS: u64 = 30;
// Dataset files run to several hundred MB; the timeout covers the whole body.
const REQUEST_TIMEOUT_SECS: u64 = 1800;
const USER_AGENT: &str = concat!("numerai-pipeline/", env!("CARGO_PKG_VERSION"));

static CLIENT: OnceCell<Client> = OnceCell::new();

pub fn http_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| {
        Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")
    })
}

/// Streams `url` into `dest` through a sibling temp file so a failed
/// transfer never leaves a truncated dataset behind.
pub fn download_to_file(client: &Client, url: &str, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }

    let mut res = client
        .get(url)
        .send()
        .with_context(|| format!("request {}", redact_query(url)))?
        .error_for_status()
        .with_context(|| format!("status for {}", redact_query(url)))?;

    let tmp = dest.with_extension("part");
    let mut file =
        fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    let written = match res.copy_to(&mut file) {
        Ok(n) => n,
        Err(err) => {
            drop(file);
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("read body {}", redact_query(url)));
        }
    };
    drop(file);
    fs::rename(&tmp, dest).with_context(|| format!("move into {}", dest.display()))?;
    Ok(written)
}

/// Presigned URLs carry credentials in the query string.
pub fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
