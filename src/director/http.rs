//! Director client over the BOSH HTTP API
//!
//! Mutating calls answer with a `302` pointing at a task; the client follows
//! the task until it reaches a terminal state. Authentication is discovered
//! through `/info`: UAA directors get a client-credentials bearer token,
//! others use basic auth.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Certificate, Client, RequestBuilder, Response};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use super::{DiffLine, Director, DirectorError, JobState, Result, VmInfo};
use crate::config::BoshConfig;

const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3600);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Refresh tokens this long before the UAA expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum AuthState {
    Basic,
    Bearer { token: String, expires_at: Instant },
}

impl AuthState {
    fn expired(&self) -> bool {
        match self {
            AuthState::Basic => false,
            AuthState::Bearer { expires_at, .. } => Instant::now() >= *expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Info {
    #[serde(default)]
    user_authentication: Option<UserAuthentication>,
}

#[derive(Debug, Deserialize)]
struct UserAuthentication {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    options: UaaOptions,
}

#[derive(Debug, Default, Deserialize)]
struct UaaOptions {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Task {
    id: u64,
    state: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiffResponse {
    #[serde(default)]
    diff: Vec<(String, Option<String>)>,
}

/// [`Director`] backed by the director's REST API
pub struct HttpDirector {
    base_url: String,
    username: String,
    password: String,
    client: Client,
    auth: Mutex<Option<AuthState>>,
    task_poll_interval: Duration,
    task_timeout: Duration,
}

impl HttpDirector {
    /// Create a client for `url`, trusting `ca_cert` in addition to the system roots
    pub fn new(url: &str, username: &str, password: &str, ca_cert: Option<&str>) -> Result<Self> {
        let parsed = Url::parse(url)?;
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .use_rustls_tls();
        if let Some(pem) = ca_cert.filter(|pem| !pem.trim().is_empty()) {
            builder = builder.add_root_certificate(Certificate::from_pem(pem.as_bytes())?);
        }

        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client: builder.build()?,
            auth: Mutex::new(None),
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        })
    }

    pub fn from_config(config: &BoshConfig) -> Result<Self> {
        Self::new(
            &config.director_url(),
            &config.username,
            &config.password,
            Some(&config.director_ca_cert),
        )
    }

    pub fn with_task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authenticate(&self) -> Result<AuthState> {
        let info: Info = check(self.client.get(self.url("/info")).send().await?)
            .await?
            .json()
            .await?;

        let uaa_url = match info.user_authentication {
            Some(auth) if auth.kind == "uaa" => auth.options.url.ok_or_else(|| {
                DirectorError::Auth("director uses UAA but reports no UAA URL".to_string())
            })?,
            _ => {
                tracing::debug!(director = %self.base_url, "Using basic authentication");
                return Ok(AuthState::Basic);
            }
        };

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .finish();
        let response = self
            .client
            .post(format!("{}/oauth/token", uaa_url.trim_end_matches('/')))
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectorError::Auth(format!(
                "UAA token request returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        tracing::debug!(director = %self.base_url, "Obtained UAA token");

        Ok(AuthState::Bearer {
            token: token.access_token,
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        })
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let mut auth = self.auth.lock().await;
        if auth.as_ref().is_none_or(AuthState::expired) {
            *auth = Some(self.authenticate().await?);
        }
        Ok(match auth.as_ref() {
            Some(AuthState::Bearer { token, .. }) => request.bearer_auth(token),
            _ => request.basic_auth(&self.username, Some(&self.password)),
        })
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).await?.send().await?;
        check(response).await
    }

    /// Send a request that starts a task and wait for it to finish
    async fn run_task(&self, request: RequestBuilder) -> Result<u64> {
        let response = self.send(request).await?;
        let id = task_id(&response)?;
        self.wait_for_task(id).await?;
        Ok(id)
    }

    async fn wait_for_task(&self, id: u64) -> Result<()> {
        let deadline = Instant::now() + self.task_timeout;
        loop {
            let task: Task = self
                .send(self.client.get(self.url(&format!("/tasks/{}", id))))
                .await?
                .json()
                .await?;
            tracing::trace!(task_id = task.id, state = %task.state, "Polled director task");

            match task.state.as_str() {
                "done" => return Ok(()),
                "error" | "cancelled" | "timeout" => {
                    return Err(DirectorError::TaskFailed {
                        id,
                        state: task.state,
                        result: task
                            .result
                            .or(task.description)
                            .unwrap_or_default(),
                    });
                }
                _ => {}
            }

            if Instant::now() + self.task_poll_interval > deadline {
                return Err(DirectorError::TaskTimeout(id));
            }
            tokio::time::sleep(self.task_poll_interval).await;
        }
    }

    async fn task_result(&self, id: u64) -> Result<String> {
        let url = self.url(&format!("/tasks/{}/output?type=result", id));
        Ok(self.send(self.client.get(url)).await?.text().await?)
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DirectorError::Status {
        status: status.as_u16(),
        body,
    })
}

fn task_id(response: &Response) -> Result<u64> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|location| location.to_str().ok())
        .and_then(|location| location.trim_end_matches('/').rsplit('/').next())
        .and_then(|id| id.parse().ok())
        .ok_or(DirectorError::MissingTask)
}

#[async_trait]
impl Director for HttpDirector {
    async fn update_deployment(&self, manifest: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url("/deployments"))
            .header(CONTENT_TYPE, "text/yaml")
            .body(manifest.to_string());
        let id = self.run_task(request).await?;
        tracing::info!(task_id = id, "Deployment updated");
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.url(&format!("/deployments/{}?force=true", name)));
        let id = self.run_task(request).await?;
        tracing::info!(deployment = %name, task_id = id, "Deployment deleted");
        Ok(())
    }

    async fn vm_infos(&self, deployment: &str) -> Result<Vec<VmInfo>> {
        let request = self
            .client
            .get(self.url(&format!("/deployments/{}/vms?format=full", deployment)));
        let id = self.run_task(request).await?;
        let output = self.task_result(id).await?;

        let vms = output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<VmInfo>, _>>()?;
        tracing::debug!(deployment = %deployment, count = vms.len(), "Listed VMs");
        Ok(vms)
    }

    async fn change_job_state(&self, deployment: &str, job: &str, state: JobState) -> Result<()> {
        let request = self
            .client
            .put(self.url(&format!(
                "/deployments/{}/jobs/{}?state={}",
                deployment, job, state
            )))
            .header(CONTENT_TYPE, "text/yaml")
            .body("");
        let id = self.run_task(request).await?;
        tracing::info!(deployment = %deployment, job = %job, state = %state, task_id = id, "Changed job state");
        Ok(())
    }

    async fn set_resurrection(
        &self,
        deployment: &str,
        job: &str,
        instance_id: &str,
        enabled: bool,
    ) -> Result<()> {
        let body = serde_json::json!({ "resurrection_paused": !enabled });
        let request = self
            .client
            .put(self.url(&format!(
                "/deployments/{}/jobs/{}/{}/resurrection",
                deployment, job, instance_id
            )))
            .json(&body);
        self.send(request).await?;
        tracing::debug!(deployment = %deployment, job = %job, instance = %instance_id, enabled, "Set resurrection");
        Ok(())
    }

    async fn upload_release_url(&self, url: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url("/releases"))
            .json(&serde_json::json!({ "location": url }));
        let id = self.run_task(request).await?;
        tracing::info!(url = %url, task_id = id, "Uploaded release");
        Ok(())
    }

    async fn diff(&self, deployment: &str, manifest: &str) -> Result<Vec<DiffLine>> {
        let request = self
            .client
            .post(self.url(&format!("/deployments/{}/diff?redact=true", deployment)))
            .header(CONTENT_TYPE, "text/yaml")
            .body(manifest.to_string());
        let response: DiffResponse = self.send(request).await?.json().await?;
        Ok(response
            .diff
            .into_iter()
            .map(|(text, state)| DiffLine {
                text,
                state: state.unwrap_or_default(),
            })
            .collect())
    }
}
