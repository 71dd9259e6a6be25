//! Hugging Face Hub client
//!
//! Commits go through the NDJSON commit endpoint: a header line carrying the
//! summary, then one line per file with base64 content. Listing walks the
//! recursive tree endpoint, following `Link: rel="next"` pages.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, LINK};
use serde_json::{Value, json};
use tracing::debug;

use crate::store::{RemoteError, RemoteFile, RemoteStore, StoreFuture};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Which repository and revision to write to.
#[derive(Debug, Clone)]
pub struct HubTarget {
    pub endpoint: String,
    pub repo_id: String,
    /// `dataset`, `model` or `space`
    pub repo_type: String,
    pub revision: String,
}

impl HubTarget {
    fn api_base(&self) -> String {
        format!(
            "{}/api/{}s/{}",
            self.endpoint.trim_end_matches('/'),
            self.repo_type,
            self.repo_id
        )
    }

    fn commit_url(&self) -> String {
        format!("{}/commit/{}", self.api_base(), self.revision)
    }

    fn tree_url(&self) -> String {
        format!("{}/tree/{}?recursive=true", self.api_base(), self.revision)
    }
}

pub struct HfHub {
    client: reqwest::Client,
    target: HubTarget,
    token: Secret<String>,
    timeout: Duration,
}

impl HfHub {
    pub fn new(
        client: reqwest::Client,
        target: HubTarget,
        token: Secret<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            target,
            token,
            timeout,
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose())
    }

    async fn push(&self, files: &[RemoteFile], message: &str) -> Result<(), RemoteError> {
        let url = self.target.commit_url();
        debug!(files = files.len(), "pushing commit");

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, self.bearer())
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(commit_body(files, message))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RemoteError::Other(format!("commit request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        Err(classify_failure(
            Some(status.as_u16()),
            &format!("hub returned {status}: {body}"),
        ))
    }

    async fn list(&self) -> Result<Vec<String>, RemoteError> {
        let mut paths = Vec::new();
        let mut next = Some(self.target.tree_url());

        while let Some(url) = next.take() {
            let response = self
                .client
                .get(&url)
                .header(AUTHORIZATION, self.bearer())
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| RemoteError::Other(format!("listing request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(classify_failure(
                    Some(status.as_u16()),
                    &format!("hub listing returned {status}: {body}"),
                ));
            }

            next = next_page(response.headers());
            let entries: Vec<Value> = response
                .json()
                .await
                .map_err(|e| RemoteError::Other(format!("invalid listing response: {e}")))?;
            paths.extend(entries.iter().filter_map(file_path));
        }

        debug!(files = paths.len(), "listed repository");
        Ok(paths)
    }
}

impl RemoteStore for HfHub {
    fn commit<'a>(&'a self, files: &'a [RemoteFile], message: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.push(files, message))
    }

    fn list_files(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(self.list())
    }
}

/// Map a failed hub response to the retry taxonomy.
///
/// File-count wording wins over status, because the hub has answered both 400
/// and 413 for oversized commits.
pub fn classify_failure(status: Option<u16>, message: &str) -> RemoteError {
    let lower = message.to_lowercase();
    if lower.contains("too many files") || lower.contains("maximum number of files") {
        RemoteError::FileCountExceeded(message.to_string())
    } else if status == Some(429)
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        RemoteError::RateLimited(message.to_string())
    } else {
        RemoteError::Other(message.to_string())
    }
}

fn commit_body(files: &[RemoteFile], message: &str) -> Vec<u8> {
    let mut body = json!({
        "key": "header",
        "value": {"summary": message, "description": ""},
    })
    .to_string();
    body.push('\n');
    for file in files {
        let line = json!({
            "key": "file",
            "value": {
                "path": file.path,
                "encoding": "base64",
                "content": STANDARD.encode(&file.content),
            },
        });
        body.push_str(&line.to_string());
        body.push('\n');
    }
    body.into_bytes()
}

fn file_path(entry: &Value) -> Option<String> {
    if entry.get("type").and_then(Value::as_str) != Some("file") {
        return None;
    }
    entry.get("path").and_then(Value::as_str).map(str::to_owned)
}

/// `<url>; rel="next"` from a Link header.
fn next_page(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_owned)
    })
}
