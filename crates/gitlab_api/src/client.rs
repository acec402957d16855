use crate::config::GitlabConfig;
use crate::error::{GitlabError, Result};
use crate::models::{CurrentUser, Event, Namespace, Pipeline, Project};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Certificate, Client as HttpClient, ClientBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

const MAX_PER_PAGE: u32 = 100;

/// Query options for `GET /users/:id/events`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub action: Option<&'static str>,
    pub target_type: Option<&'static str>,
    pub per_page: u32,
}

impl EventFilter {
    pub fn pushed(per_page: u32) -> Self {
        Self {
            action: Some("pushed"),
            target_type: None,
            per_page,
        }
    }

    pub fn commented(per_page: u32) -> Self {
        Self {
            action: Some("commented"),
            target_type: Some("note"),
            per_page,
        }
    }
}

#[derive(Clone)]
pub struct GitlabClient {
    http: HttpClient,
    config: GitlabConfig,
}

impl GitlabClient {
    pub fn new(config: GitlabConfig) -> Result<Self> {
        let http = build_http_client(&config)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GitlabConfig {
        &self.config
    }

    pub async fn get<T>(&self, path: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.get_with_query(path, None).await
    }

    pub async fn get_with_query<T>(&self, path: &str, query: Option<&[(&str, &str)]>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        debug!(path, "GET");
        let mut request = self.http.get(self.url_for(path));
        if let Some(params) = query {
            request = request.query(params);
        }
        let response = request.send().await?;
        Self::parse_json(response).await
    }

    fn url_for(&self, path: &str) -> String {
        let mut base = self.config.api_root();
        base.push_str(path.trim_start_matches('/'));
        base
    }

    async fn parse_json<T>(response: Response) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        if status.is_success() {
            let value = response.json::<Value>().await.map_err(GitlabError::from)?;
            if let Some(message) = oauth_error_message(&value) {
                return Err(GitlabError::Authentication(message));
            }
            serde_json::from_value(value).map_err(GitlabError::from)
        } else if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            Err(GitlabError::Authentication(format!(
                "Access denied ({}) - {}",
                status, body
            )))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(build_http_error(status, &body))
        }
    }

    pub async fn current_user(&self) -> Result<CurrentUser> {
        self.get("user").await
    }

    pub async fn namespace(&self, path: &str) -> Result<Namespace> {
        let path = format!("namespaces/{}", encode_path_segment(path));
        self.get(&path).await
    }

    pub async fn user_events(&self, user_id: u64, filter: &EventFilter) -> Result<Vec<Event>> {
        let path = format!("users/{}/events", user_id);
        let per_page = filter.per_page.clamp(1, MAX_PER_PAGE).to_string();
        let mut params: Vec<(&str, &str)> = vec![("per_page", per_page.as_str())];
        if let Some(action) = filter.action {
            params.push(("action", action));
        }
        if let Some(target_type) = filter.target_type {
            params.push(("target_type", target_type));
        }
        self.get_with_query(&path, Some(&params)).await
    }

    /// Push events that carried at least one commit, newest first.
    pub async fn recent_commits(&self, user_id: u64, limit: u32) -> Result<Vec<Event>> {
        let events = self.user_events(user_id, &EventFilter::pushed(limit)).await?;
        Ok(events
            .into_iter()
            .filter(|event| event.pushed_commit().is_some())
            .collect())
    }

    pub async fn recent_comments(&self, user_id: u64, limit: u32) -> Result<Vec<Event>> {
        let events = self.user_events(user_id, &EventFilter::commented(limit)).await?;
        Ok(events
            .into_iter()
            .filter(|event| event.note.is_some())
            .collect())
    }

    pub async fn commit_pipelines(&self, project_id: u64, sha: &str) -> Result<Vec<Pipeline>> {
        let path = format!("projects/{}/pipelines", project_id);
        self.get_with_query(
            &path,
            Some(&[("sha", sha), ("order_by", "id"), ("sort", "desc")]),
        )
        .await
    }

    pub async fn latest_commit_pipeline(&self, project_id: u64, sha: &str) -> Result<Option<Pipeline>> {
        Ok(self.commit_pipelines(project_id, sha).await?.into_iter().next())
    }

    pub async fn pipeline(&self, project_id: u64, pipeline_id: u64) -> Result<Pipeline> {
        let path = format!("projects/{}/pipelines/{}", project_id, pipeline_id);
        self.get(&path).await
    }

    pub async fn project(&self, project_id: u64) -> Result<Project> {
        let path = format!("projects/{}", project_id);
        self.get(&path).await
    }
}

/// Shared builder for every HTTP client talking to one host: user agent,
/// timeouts and an optional extra root certificate.
pub(crate) fn http_client_builder(config: &GitlabConfig) -> Result<ClientBuilder> {
    let mut builder = HttpClient::builder()
        .user_agent(config.user_agent.clone())
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout);

    if let Some(path) = &config.custom_cert_path {
        let pem = std::fs::read(path)?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|err| GitlabError::Certificate(format!("{}: {}", path.display(), err)))?;
        builder = builder.add_root_certificate(certificate);
    }

    Ok(builder)
}

fn build_http_client(config: &GitlabConfig) -> Result<HttpClient> {
    let mut headers = HeaderMap::new();
    let mut auth_value = HeaderValue::from_str(&format!("Bearer {}", config.token))?;
    auth_value.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth_value);
    headers.insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);

    http_client_builder(config)?
        .default_headers(headers)
        .build()
        .map_err(|err| GitlabError::Other(err.to_string()))
}

pub(crate) fn build_http_error(status: StatusCode, body: &str) -> GitlabError {
    let code = extract_error_code(body);
    GitlabError::http(status, code, body.to_string())
}

fn extract_error_code(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").and_then(|c| c.as_str()).map(|s| s.to_string()))
}

/// OAuth-style error objects (`{"error": "invalid_token", ...}`) mean the
/// bearer token is no longer accepted, whatever the HTTP status.
fn oauth_error_message(value: &Value) -> Option<String> {
    let error = value.as_object()?.get("error")?.as_str()?;
    let description = value
        .get("error_description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if description.is_empty() {
        Some(error.to_string())
    } else {
        Some(format!("{error}: {description}"))
    }
}

fn encode_path_segment(value: &str) -> String {
    value.replace('%', "%25").replace('/', "%2F")
}
