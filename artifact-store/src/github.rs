//! GitHub Actions artifact backend.
//!
//! Listing and downloading go through the public REST API:
//!
//! ```text
//! GET {api}/repos/{owner}/{repo}/actions/artifacts?name=&per_page=&page=
//! GET {api}/repos/{owner}/{repo}/actions/artifacts/{id}/zip
//! ```
//!
//! Uploading is only possible from inside a workflow job. It uses the
//! Actions results service (artifact v4):
//!
//! 1. `CreateArtifact` returns a signed blob URL
//! 2. the zip is `PUT` to that URL
//! 3. `FinalizeArtifact` commits it with its size and sha256

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::archive;
use crate::artifact::Artifact;
use crate::error::{Result, StoreError, is_rate_limit_message};
use crate::store::{ArtifactStore, blocking};

/// Default REST API base.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const ARTIFACT_SERVICE: &str = "twirp/github.actions.results.api.v1.ArtifactService";
const RESULTS_SCOPE_PREFIX: &str = "Actions.Results:";
const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for [`GitHubArtifactStore`].
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// REST API base (e.g. `https://api.github.com`).
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    /// Token for the REST API. Empty means unauthenticated.
    pub token: String,
    /// `ACTIONS_RESULTS_URL` of the current job; required for uploads.
    pub results_url: Option<String>,
    /// `ACTIONS_RUNTIME_TOKEN` of the current job; required for uploads.
    pub runtime_token: Option<String>,
    /// `GITHUB_RUN_ID` of the current job, recorded on uploaded artifacts.
    pub run_id: u64,
    pub user_agent: String,
}

impl GitHubConfig {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
            results_url: None,
            runtime_token: None,
            run_id: 0,
            user_agent: concat!("hyaline-merge/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Artifact store backed by GitHub Actions artifacts.
pub struct GitHubArtifactStore {
    client: reqwest::Client,
    config: GitHubConfig,
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListArtifactsResponse {
    #[serde(default)]
    artifacts: Vec<ApiArtifact>,
}

#[derive(Debug, Deserialize)]
struct ApiArtifact {
    id: u64,
    name: String,
    created_at: Option<DateTime<Utc>>,
    workflow_run: Option<WorkflowRunRef>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunRef {
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Serialize)]
struct CreateArtifactRequest<'a> {
    workflow_run_backend_id: &'a str,
    workflow_job_run_backend_id: &'a str,
    name: &'a str,
    version: u32,
}

#[derive(Debug, Deserialize)]
struct CreateArtifactResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default, alias = "signedUploadUrl")]
    signed_upload_url: String,
}

#[derive(Debug, Serialize)]
struct FinalizeArtifactRequest<'a> {
    workflow_run_backend_id: &'a str,
    workflow_job_run_backend_id: &'a str,
    name: &'a str,
    /// int64 travels as a string in protobuf JSON.
    size: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct FinalizeArtifactResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default, alias = "artifactId")]
    artifact_id: String,
}

/// Backend ids extracted from the runtime token.
#[derive(Debug, PartialEq, Eq)]
struct BackendIds {
    run: String,
    job: String,
}

impl ApiArtifact {
    fn into_artifact(self) -> Result<Artifact> {
        let created_at = self.created_at.ok_or_else(|| {
            StoreError::Parse(format!("artifact {} has no created_at", self.id))
        })?;
        Ok(Artifact {
            id: self.id,
            name: self.name,
            created_at,
            run_id: self.workflow_run.and_then(|r| r.id).unwrap_or(0),
        })
    }
}

impl GitHubArtifactStore {
    /// Creates a store with a default HTTP client.
    pub fn new(config: GitHubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Self::with_client(client, config)
    }

    /// Creates a store with a custom HTTP client.
    pub fn with_client(client: reqwest::Client, config: GitHubConfig) -> Result<Self> {
        if config.owner.trim().is_empty() || config.repo.trim().is_empty() {
            return Err(StoreError::Config(
                "GitHub owner and repo must both be set".to_string(),
            ));
        }
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GitHubConfig {
        &self.config
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}/{suffix}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
        )
    }

    fn api_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        if !self.config.token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
                .map_err(|_| StoreError::Config("GitHub token is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Upload prerequisites: results URL, runtime token and the backend ids
    /// encoded in that token.
    fn upload_context(&self) -> Result<(&str, &str, BackendIds)> {
        let results_url = self
            .config
            .results_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                StoreError::Config(
                    "ACTIONS_RESULTS_URL is not set; uploads only work inside a workflow job"
                        .to_string(),
                )
            })?;
        let runtime_token = self
            .config
            .runtime_token
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                StoreError::Config(
                    "ACTIONS_RUNTIME_TOKEN is not set; uploads only work inside a workflow job"
                        .to_string(),
                )
            })?;
        let ids = backend_ids(runtime_token)?;
        Ok((results_url, runtime_token, ids))
    }

    async fn twirp<Req, Resp>(
        &self,
        results_url: &str,
        runtime_token: &str,
        method: &str,
        body: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned + Send,
    {
        let url = format!(
            "{}/{ARTIFACT_SERVICE}/{method}",
            results_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(runtime_token)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }
}

/// Turn a non-success response into [`StoreError::Api`], or
/// [`StoreError::RateLimited`] when GitHub is throttling.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let throttled_by_headers = is_throttled(status, resp.headers());
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or(body);
    let status = status.as_u16();
    if throttled_by_headers || (status == 403 && is_rate_limit_message(&message)) {
        return Err(StoreError::RateLimited { status, message });
    }
    Err(StoreError::Api { status, message })
}

/// 429 always; 403 with an exhausted quota or a `retry-after` hint.
fn is_throttled(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if status != StatusCode::FORBIDDEN {
        return false;
    }
    let remaining_zero = headers
        .get(RATELIMIT_REMAINING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    remaining_zero || headers.contains_key(RETRY_AFTER)
}

/// Extract the results-service backend ids from the runtime token.
///
/// The token is a JWT whose `scp` claim carries a space-separated scope list
/// including `Actions.Results:<run backend id>:<job backend id>`.
fn backend_ids(runtime_token: &str) -> Result<BackendIds> {
    let invalid = |why: &str| StoreError::Config(format!("invalid ACTIONS_RUNTIME_TOKEN: {why}"));

    let payload = runtime_token
        .split('.')
        .nth(1)
        .ok_or_else(|| invalid("not a JWT"))?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| invalid("payload is not base64url"))?;
    let claims: serde_json::Value =
        serde_json::from_slice(&decoded).map_err(|_| invalid("payload is not JSON"))?;
    let scopes = claims
        .get("scp")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| invalid("missing scp claim"))?;

    for scope in scopes.split_whitespace() {
        if let Some(rest) = scope.strip_prefix(RESULTS_SCOPE_PREFIX)
            && let Some((run, job)) = rest.split_once(':')
            && !run.is_empty()
            && !job.is_empty()
        {
            return Ok(BackendIds {
                run: run.to_string(),
                job: job.to_string(),
            });
        }
    }
    Err(invalid("no Actions.Results scope"))
}

#[async_trait]
impl ArtifactStore for GitHubArtifactStore {
    async fn list_page(&self, name: &str, page: u32, per_page: u32) -> Result<Vec<Artifact>> {
        let url = self.repo_url("actions/artifacts");
        let per_page = per_page.clamp(1, crate::MAX_PER_PAGE).to_string();
        let page = page.max(1).to_string();

        let resp = self
            .client
            .get(&url)
            .headers(self.api_headers()?)
            .query(&[("name", name), ("per_page", &per_page), ("page", &page)])
            .send()
            .await?;
        let resp = check_status(resp).await.map_err(|e| match e {
            StoreError::Api { status: 404, .. } => StoreError::Config(format!(
                "repository {}/{} not found or not visible to this token",
                self.config.owner, self.config.repo
            )),
            other => other,
        })?;
        let body: ListArtifactsResponse = resp.json().await?;

        tracing::debug!(name, page = %page, count = body.artifacts.len(), "listed artifacts");
        body.artifacts
            .into_iter()
            .map(ApiArtifact::into_artifact)
            .collect()
    }

    async fn download(&self, artifact: &Artifact, dest: &Path) -> Result<PathBuf> {
        let url = self.repo_url(&format!("actions/artifacts/{}/zip", artifact.id));
        tracing::info!(
            artifact_id = artifact.id,
            run_id = artifact.run_id,
            dest = %dest.display(),
            "downloading artifact"
        );

        let resp = self
            .client
            .get(&url)
            .headers(self.api_headers()?)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let bytes = resp.bytes().await?;

        let unpack_to = dest.to_path_buf();
        blocking(move || archive::unpack(&bytes, &unpack_to)).await?;
        Ok(dest.to_path_buf())
    }

    async fn upload(&self, name: &str, root: &Path, files: &[&str]) -> Result<Artifact> {
        let (results_url, runtime_token, ids) = self.upload_context()?;
        let pack_root = root.to_path_buf();
        let pack_files: Vec<String> = files.iter().map(|f| (*f).to_string()).collect();
        let zipped = blocking(move || {
            let names: Vec<&str> = pack_files.iter().map(String::as_str).collect();
            archive::pack(&pack_root, &names)
        })
        .await?;

        let created: CreateArtifactResponse = self
            .twirp(
                results_url,
                runtime_token,
                "CreateArtifact",
                &CreateArtifactRequest {
                    workflow_run_backend_id: &ids.run,
                    workflow_job_run_backend_id: &ids.job,
                    name,
                    version: 4,
                },
            )
            .await?;
        if !created.ok || created.signed_upload_url.is_empty() {
            return Err(StoreError::Parse(format!(
                "CreateArtifact did not return an upload URL for {name}"
            )));
        }

        let size = zipped.len();
        let hash = hex::encode(Sha256::digest(&zipped));
        let resp = self
            .client
            .put(&created.signed_upload_url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_TYPE, "application/zip")
            .body(zipped)
            .send()
            .await?;
        check_status(resp).await?;

        let finalized: FinalizeArtifactResponse = self
            .twirp(
                results_url,
                runtime_token,
                "FinalizeArtifact",
                &FinalizeArtifactRequest {
                    workflow_run_backend_id: &ids.run,
                    workflow_job_run_backend_id: &ids.job,
                    name,
                    size: size.to_string(),
                    hash: format!("sha256:{hash}"),
                },
            )
            .await?;
        if !finalized.ok {
            return Err(StoreError::Parse(format!(
                "FinalizeArtifact rejected {name}"
            )));
        }
        let id = finalized.artifact_id.parse::<u64>().map_err(|_| {
            StoreError::Parse(format!(
                "FinalizeArtifact returned a non-numeric id: {:?}",
                finalized.artifact_id
            ))
        })?;

        tracing::info!(artifact_id = id, name, size, "uploaded artifact");
        Ok(Artifact {
            id,
            name: name.to_string(),
            created_at: Utc::now(),
            run_id: self.config.run_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn jwt(claims: serde_json::Value) -> String {
        let enc = |b: &[u8]| base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b);
        format!(
            "{}.{}.{}",
            enc(br#"{"alg":"none"}"#),
            enc(claims.to_string().as_bytes()),
            enc(b"sig")
        )
    }

    #[test]
    fn backend_ids_come_from_results_scope() {
        let token = jwt(serde_json::json!({
            "scp": "Actions.ExampleScope Actions.Results:run-abc:job-def"
        }));
        assert_eq!(
            backend_ids(&token).unwrap(),
            BackendIds {
                run: "run-abc".to_string(),
                job: "job-def".to_string(),
            }
        );
    }

    #[test]
    fn backend_ids_require_results_scope() {
        let token = jwt(serde_json::json!({ "scp": "Actions.GenericRead:1" }));
        let err = backend_ids(&token).unwrap_err();
        assert!(err.to_string().contains("no Actions.Results scope"));
    }

    #[test]
    fn backend_ids_reject_non_jwt() {
        assert!(backend_ids("opaque-token").unwrap_err().is_config());
    }

    #[test]
    fn missing_created_at_is_a_parse_error() {
        let raw = ApiArtifact {
            id: 9,
            name: "_extracted-documentation".to_string(),
            created_at: None,
            workflow_run: None,
        };
        assert!(matches!(raw.into_artifact(), Err(StoreError::Parse(_))));
    }

    #[test]
    fn store_requires_owner_and_repo() {
        let err = GitHubArtifactStore::new(GitHubConfig::new("", "docs", "t")).err().unwrap();
        assert!(err.is_config());
    }
}
