//! Provider hook registration.
//!
//! Once a listener is serving, the provider is told where to deliver. Both
//! clients are idempotent: an existing hook pointing at the same callback
//! URL is reused rather than duplicated, so restarts and reloads never pile
//! up hooks on the provider side.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use sluice_core::{IngestError, SecretRef, SecretResolver};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::{Provider, WebhookSource};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));
const HOOKS_PER_PAGE: &str = "100";
const MAX_HOOK_PAGES: u32 = 50;

/// Provider API failures.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Transport-level failure.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status.
    #[error("provider returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, for diagnostics
        body: String,
    },

    /// Base URL could not be turned into an API URL.
    #[error("invalid provider URL: {0}")]
    Url(String),
}

impl RegistrationError {
    /// Whether another attempt could succeed.
    ///
    /// Network errors, rate limiting, and server errors are transient;
    /// anything else (bad credentials, unknown project) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Url(_) => false,
        }
    }
}

/// Creates and removes hooks on a provider.
#[async_trait]
pub trait HookRegistrar: Send + Sync + fmt::Debug {
    /// Ensures a hook delivering to `callback_url` exists; returns its id.
    async fn register(&self, callback_url: &str) -> Result<String, RegistrationError>;

    /// Removes a hook created by [`register`](Self::register).
    async fn deregister(&self, hook_id: &str) -> Result<(), RegistrationError>;
}

/// Builds the registrar for `source`, if it asks for registration.
///
/// Registration needs a public `url` plus the provider coordinates
/// (`projectId` for GitLab, `owner` and `repository` for GitHub). Generic
/// webhooks are never registered.
///
/// # Errors
///
/// Returns [`IngestError::ConfigInvalid`] when the API token cannot be
/// resolved.
pub async fn registrar_for(
    source: &WebhookSource,
    secrets: &dyn SecretResolver,
    client: &Client,
) -> sluice_core::Result<Option<Arc<dyn HookRegistrar>>> {
    if source.url.is_none() {
        return Ok(None);
    }

    match &source.provider {
        Provider::Gitlab { project_id: Some(project_id), event, base_url } => {
            let token = resolve_text(source, secrets, &source.access_token).await?;
            Ok(Some(Arc::new(GitlabRegistrar {
                client: client.clone(),
                base_url: base_url.clone(),
                project_id: project_id.clone(),
                event: event.clone(),
                token,
                enable_ssl_verification: source.enable_ssl_verification,
            })))
        },
        Provider::Github {
            owner: Some(owner),
            repository: Some(repository),
            events,
            webhook_secret,
            api_url,
            content_type,
            active,
        } => {
            let token = resolve_text(source, secrets, &source.access_token).await?;
            let secret = resolve_text(source, secrets, webhook_secret).await?;
            Ok(Some(Arc::new(GithubRegistrar {
                client: client.clone(),
                api_url: api_url.clone(),
                owner: owner.clone(),
                repository: repository.clone(),
                events: events.clone(),
                content_type: content_type.clone(),
                active: *active,
                insecure_ssl: !source.enable_ssl_verification,
                token,
                secret,
            })))
        },
        _ => Ok(None),
    }
}

async fn resolve_text(
    source: &WebhookSource,
    secrets: &dyn SecretResolver,
    secret: &SecretRef,
) -> sluice_core::Result<String> {
    let value = secrets
        .resolve(secret)
        .await
        .map_err(|e| IngestError::config(&source.name, e.to_string()))?;
    value
        .as_str(secret)
        .map(str::to_string)
        .map_err(|e| IngestError::config(&source.name, e.to_string()))
}

/// Builds `base` + `segments`, percent-encoding each segment.
fn api_url(base: &str, segments: &[&str]) -> Result<Url, RegistrationError> {
    let mut url = Url::parse(base).map_err(|e| RegistrationError::Url(format!("{base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| RegistrationError::Url(format!("{base}: cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn check(response: Response) -> Result<Response, RegistrationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistrationError::Status { status: status.as_u16(), body })
}

/// Whether a listing response advertises another page, through GitLab's
/// `X-Next-Page` or a `Link: <...>; rel="next"` entry.
fn has_next_page(headers: &header::HeaderMap) -> bool {
    let gitlab_next = headers
        .get("x-next-page")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().is_empty());
    let link_next = headers
        .get(header::LINK)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|link| link.contains("rel=\"next\"")));
    gitlab_next || link_next
}

/// Walks every page of a hook listing until `matches` finds a hook.
async fn find_hook<T, F>(
    list_page: F,
    matches: impl Fn(&T) -> bool,
) -> Result<Option<T>, RegistrationError>
where
    T: DeserializeOwned,
    F: Fn() -> RequestBuilder,
{
    for page in 1..=MAX_HOOK_PAGES {
        let page_number = page.to_string();
        let response = check(
            list_page()
                .query(&[("per_page", HOOKS_PER_PAGE), ("page", page_number.as_str())])
                .send()
                .await?,
        )
        .await?;
        let more = has_next_page(response.headers());
        let hooks: Vec<T> = response.json().await?;

        if let Some(hook) = hooks.into_iter().find(|hook| matches(hook)) {
            return Ok(Some(hook));
        }
        if !more {
            break;
        }
    }
    Ok(None)
}

/// `PushEvents` → `push_events`, the GitLab hook attribute name.
fn gitlab_event_field(event: &str) -> String {
    let mut field = String::with_capacity(event.len() + 4);
    for (i, c) in event.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !field.ends_with('_') {
                field.push('_');
            }
            field.push(c.to_ascii_lowercase());
        } else {
            field.push(c);
        }
    }
    field
}

#[derive(Debug, Deserialize)]
struct GitlabHook {
    id: u64,
    #[serde(default)]
    url: String,
}

/// GitLab project hooks (`/api/v4/projects/:id/hooks`).
pub struct GitlabRegistrar {
    client: Client,
    base_url: String,
    project_id: String,
    event: String,
    token: String,
    enable_ssl_verification: bool,
}

impl fmt::Debug for GitlabRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitlabRegistrar")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

impl GitlabRegistrar {
    fn hooks_url(&self, hook_id: Option<&str>) -> Result<Url, RegistrationError> {
        let mut segments = vec!["api", "v4", "projects", self.project_id.as_str(), "hooks"];
        segments.extend(hook_id);
        api_url(&self.base_url, &segments)
    }
}

#[async_trait]
impl HookRegistrar for GitlabRegistrar {
    #[instrument(name = "gitlab_register", skip(self), fields(project_id = %self.project_id))]
    async fn register(&self, callback_url: &str) -> Result<String, RegistrationError> {
        let url = self.hooks_url(None)?;

        let existing = find_hook(
            || self.client.get(url.clone()).header("PRIVATE-TOKEN", &self.token),
            |hook: &GitlabHook| hook.url == callback_url,
        )
        .await?;

        if let Some(hook) = existing {
            info!(hook_id = hook.id, "reusing existing GitLab hook");
            return Ok(hook.id.to_string());
        }

        let mut body = Map::new();
        body.insert("url".into(), Value::from(callback_url));
        body.insert("token".into(), Value::from(self.token.as_str()));
        body.insert("enable_ssl_verification".into(), Value::from(self.enable_ssl_verification));
        body.insert(gitlab_event_field(&self.event), Value::Bool(true));

        let created: GitlabHook = check(
            self.client.post(url).header("PRIVATE-TOKEN", &self.token).json(&body).send().await?,
        )
        .await?
        .json()
        .await?;

        info!(hook_id = created.id, "created GitLab hook");
        Ok(created.id.to_string())
    }

    #[instrument(name = "gitlab_deregister", skip(self), fields(project_id = %self.project_id))]
    async fn deregister(&self, hook_id: &str) -> Result<(), RegistrationError> {
        let url = self.hooks_url(Some(hook_id))?;
        let response =
            self.client.delete(url).header("PRIVATE-TOKEN", &self.token).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("GitLab hook already gone");
            return Ok(());
        }
        check(response).await?;
        info!("deleted GitLab hook");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GithubHook {
    id: u64,
    #[serde(default)]
    config: GithubHookConfig,
}

#[derive(Debug, Default, Deserialize)]
struct GithubHookConfig {
    #[serde(default)]
    url: Option<String>,
}

/// GitHub repository hooks (`/repos/:owner/:repo/hooks`).
pub struct GithubRegistrar {
    client: Client,
    api_url: String,
    owner: String,
    repository: String,
    events: Vec<String>,
    content_type: String,
    active: bool,
    insecure_ssl: bool,
    token: String,
    secret: String,
}

impl fmt::Debug for GithubRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubRegistrar")
            .field("api_url", &self.api_url)
            .field("owner", &self.owner)
            .field("repository", &self.repository)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl GithubRegistrar {
    fn hooks_url(&self, hook_id: Option<&str>) -> Result<Url, RegistrationError> {
        let mut segments = vec!["repos", self.owner.as_str(), self.repository.as_str(), "hooks"];
        segments.extend(hook_id);
        api_url(&self.api_url, &segments)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(header::ACCEPT, GITHUB_ACCEPT)
            .header(header::USER_AGENT, USER_AGENT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
    }
}

#[async_trait]
impl HookRegistrar for GithubRegistrar {
    #[instrument(name = "github_register", skip(self), fields(repository = %format!("{}/{}", self.owner, self.repository)))]
    async fn register(&self, callback_url: &str) -> Result<String, RegistrationError> {
        let url = self.hooks_url(None)?;

        let existing = find_hook(
            || self.request(reqwest::Method::GET, url.clone()),
            |hook: &GithubHook| hook.config.url.as_deref() == Some(callback_url),
        )
        .await?;

        if let Some(hook) = existing {
            info!(hook_id = hook.id, "reusing existing GitHub hook");
            return Ok(hook.id.to_string());
        }

        let body = json!({
            "name": "web",
            "active": self.active,
            "events": self.events,
            "config": {
                "url": callback_url,
                "content_type": self.content_type,
                "secret": self.secret,
                "insecure_ssl": if self.insecure_ssl { "1" } else { "0" },
            },
        });

        let created: GithubHook =
            check(self.request(reqwest::Method::POST, url).json(&body).send().await?)
                .await?
                .json()
                .await?;

        info!(hook_id = created.id, "created GitHub hook");
        Ok(created.id.to_string())
    }

    #[instrument(name = "github_deregister", skip(self), fields(repository = %format!("{}/{}", self.owner, self.repository)))]
    async fn deregister(&self, hook_id: &str) -> Result<(), RegistrationError> {
        let url = self.hooks_url(Some(hook_id))?;
        let response = self.request(reqwest::Method::DELETE, url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("GitHub hook already gone");
            return Ok(());
        }
        check(response).await?;
        info!("deleted GitHub hook");
        Ok(())
    }
}
