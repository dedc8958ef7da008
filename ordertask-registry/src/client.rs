//! Registry v2 HTTP client
//!
//! Anonymous pulls only: a `401` with a bearer challenge is answered by
//! fetching a token from the challenge realm, which is then cached per
//! repository for later requests.

use async_trait::async_trait;
use ordertask_core::retry::{Attempt, RetryError, RetryPolicy, retry};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, WWW_AUTHENTICATE};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::manifest::{BearerChallenge, MANIFEST_ACCEPT_HEADER, parse_challenge};
use crate::reference::ImageReference;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// A manifest as served by the registry
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    /// `Content-Type` of the response, if any
    pub media_type: Option<String>,
    /// `Docker-Content-Digest`, or the sha256 of the body when absent
    pub digest: String,
    pub body: Vec<u8>,
}

/// Read access to a registry's manifests and blobs
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches the manifest for `target` (a tag or digest) of `reference`'s repository
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        target: &str,
    ) -> Result<FetchedManifest, RegistryError>;

    /// Fetches a blob of `reference`'s repository by digest
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>, RegistryError>;
}

/// Registry client settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
    /// Bounds for connection failures, `5xx` and `429` responses
    pub retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            insecure_registries: Vec::new(),
            retry: RetryPolicy::new(3, Duration::from_millis(500)),
        }
    }
}

/// Failure of a single request attempt
enum SendError {
    Transient(String),
    Fatal(RegistryError),
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub struct RegistryClient {
    http: reqwest::Client,
    config: RegistryConfig,
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RegistryError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Base URL of the repository's v2 API
    pub fn repository_url(&self, reference: &ImageReference) -> String {
        let scheme = if self.is_insecure(reference) {
            "http"
        } else {
            "https"
        };
        format!(
            "{}://{}/v2/{}",
            scheme,
            reference.api_host(),
            reference.repository
        )
    }

    fn is_insecure(&self, reference: &ImageReference) -> bool {
        self.config
            .insecure_registries
            .iter()
            .any(|r| r == &reference.registry || r == reference.api_host())
    }

    fn token_key(reference: &ImageReference) -> String {
        format!("{}/{}", reference.api_host(), reference.repository)
    }

    fn cached_token(&self, reference: &ImageReference) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&Self::token_key(reference))
            .cloned()
    }

    fn store_token(&self, reference: &ImageReference, token: String) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Self::token_key(reference), token);
    }

    /// GETs `url`, retrying transient failures within the configured policy
    async fn get(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let result = retry(self.config.retry, move |attempt| async move {
            match self.send_once(reference, url, accept).await {
                Ok(response) => Ok(Attempt::Done(response)),
                Err(SendError::Transient(reason)) => {
                    warn!(
                        url = %url,
                        attempt = attempt,
                        "Transient registry failure: {}",
                        reason
                    );
                    Ok(Attempt::Retry)
                }
                Err(SendError::Fatal(e)) => Err(e),
            }
        })
        .await;

        result.map_err(|e| match e {
            RetryError::Exhausted { attempts } => RegistryError::RetryExhausted { attempts },
            RetryError::Failed(e) => e,
            RetryError::InvalidPolicy => {
                RegistryError::Unreachable("retry policy allows no attempts".to_string())
            }
        })
    }

    async fn send_once(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, SendError> {
        let token = self.cached_token(reference);
        let response = self.request(url, accept, token.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response);
        }

        let challenge = challenge_from(response.headers()).ok_or_else(|| {
            SendError::Fatal(RegistryError::Unauthorized(format!(
                "{} answered 401 without a bearer challenge",
                url
            )))
        })?;

        debug!(realm = %challenge.realm, "Fetching anonymous registry token");
        let token = self.fetch_token(reference, &challenge).await?;
        self.store_token(reference, token.clone());

        let response = self.request(url, accept, Some(&token)).await?;
        check_status(response)
    }

    async fn request(
        &self,
        url: &str,
        accept: Option<&str>,
        token: Option<&str>,
    ) -> Result<reqwest::Response, SendError> {
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        request
            .send()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))
    }

    async fn fetch_token(
        &self,
        reference: &ImageReference,
        challenge: &BearerChallenge,
    ) -> Result<String, SendError> {
        let mut url = reqwest::Url::parse(&challenge.realm).map_err(|e| {
            SendError::Fatal(RegistryError::Unauthorized(format!(
                "invalid token realm '{}': {}",
                challenge.realm, e
            )))
        })?;

        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", &scope);
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SendError::Transient(format!("token endpoint returned {}", status)));
        }
        if !status.is_success() {
            return Err(SendError::Fatal(RegistryError::Unauthorized(format!(
                "token endpoint returned {}",
                status
            ))));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            SendError::Fatal(RegistryError::Unauthorized(format!(
                "token response is not valid JSON: {}",
                e
            )))
        })?;

        body.token.or(body.access_token).ok_or_else(|| {
            SendError::Fatal(RegistryError::Unauthorized(
                "token response carries no token".to_string(),
            ))
        })
    }
}

#[async_trait]
impl ManifestSource for RegistryClient {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        target: &str,
    ) -> Result<FetchedManifest, RegistryError> {
        let url = format!("{}/manifests/{}", self.repository_url(reference), target);
        debug!(url = %url, "Fetching manifest");

        let response = self
            .get(reference, &url, Some(MANIFEST_ACCEPT_HEADER))
            .await?;

        let media_type = header_value(response.headers(), CONTENT_TYPE.as_str());
        let header_digest = header_value(response.headers(), DOCKER_CONTENT_DIGEST);
        let body = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Unreachable(format!("failed to read manifest: {}", e)))?
            .to_vec();

        let digest = header_digest.unwrap_or_else(|| sha256_digest(&body));

        Ok(FetchedManifest {
            media_type,
            digest,
            body,
        })
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = format!("{}/blobs/{}", self.repository_url(reference), digest);
        debug!(url = %url, "Fetching blob");

        let response = self.get(reference, &url, None).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Unreachable(format!("failed to read blob: {}", e)))?;

        Ok(body.to_vec())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SendError::Transient(format!("registry returned {}", status)));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SendError::Fatal(RegistryError::Unauthorized(format!(
            "registry returned {}",
            status
        ))));
    }

    Err(SendError::Fatal(RegistryError::Status {
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string(),
    }))
}

fn challenge_from(headers: &HeaderMap) -> Option<BearerChallenge> {
    headers
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_challenge)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `sha256:<hex>` digest of `body`
pub fn sha256_digest(body: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(body))
}
