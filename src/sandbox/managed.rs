//! Managed remote sandbox backend.
//!
//! Talks to the managed sandbox service over its REST API.  The client is
//! initialized lazily on first use under a mutex so concurrent callers
//! share the outcome: a successful init is cached for the lifetime of the
//! backend, a failed init surfaces as `Unavailable` on every operation and
//! is re-attempted on the next top-level call.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use url::Url;

use crate::config::ManagedConfig;

use super::{
    ExecOutput, FileInfo, SandboxBackend, SandboxDescriptor, SandboxError, SandboxHandle,
    SandboxState, VNC_PORT, WEB_PORT, WORKSPACE_DIR,
};

/// Wall-clock ceiling for one API request; individual execs pass their own
/// server-side timeout below this.
const HTTP_TIMEOUT: Duration = Duration::from_secs(180);

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InstanceInfo {
    id: String,
    state: String,
    #[serde(default)]
    vnc_url: Option<String>,
    #[serde(default)]
    web_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i64,
}

impl From<ExecResponse> for ExecOutput {
    fn from(r: ExecResponse) -> Self {
        ExecOutput {
            stdout: r.stdout,
            stderr: r.stderr,
            exit_code: r.exit_code,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    #[serde(default)]
    files: Vec<FileInfo>,
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    exists: bool,
}

#[derive(Debug, Deserialize)]
struct ReadFileResponse {
    content_base64: String,
}

fn parse_state(state: &str) -> SandboxState {
    match state {
        "running" => SandboxState::Running,
        "created" => SandboxState::Created,
        // stopped / archived both restart the same way.
        _ => SandboxState::Stopped,
    }
}

// ─── ManagedClient ────────────────────────────────────────────────────────────

/// REST client for the managed sandbox service.
#[derive(Debug)]
pub struct ManagedClient {
    http: reqwest::Client,
    base: Url,
    api_key: String,
    target: String,
}

impl ManagedClient {
    fn new(config: &ManagedConfig) -> Result<Self, SandboxError> {
        let mut base = Url::parse(&config.server_url)
            .map_err(|e| SandboxError::Unavailable(format!("invalid sandbox server URL: {e}")))?;
        // Url::join replaces the last path segment unless the base ends
        // with a slash.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base,
            api_key: config.api_key.clone(),
            target: config.target.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SandboxError> {
        self.base
            .join(path)
            .map_err(|e| SandboxError::Unavailable(format!("bad endpoint {path}: {e}")))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        instance_id: &str,
    ) -> Result<reqwest::Response, SandboxError> {
        let response = request
            .bearer_auth(&self.api_key)
            .header("X-Sandbox-Target", &self.target)
            .send()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("sandbox service request failed: {e}")))?;

        match response.status() {
            s if s.is_success() => Ok(response),
            reqwest::StatusCode::NOT_FOUND => {
                Err(SandboxError::NotFound(instance_id.to_string()))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(SandboxError::Unavailable(format!(
                    "sandbox service returned {s}: {body}"
                )))
            }
        }
    }

    async fn get_instance(&self, id: &str) -> Result<InstanceInfo, SandboxError> {
        let url = self.endpoint(&format!("instances/{id}"))?;
        self.send(self.http.get(url), id)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("bad instance payload: {e}")))
    }

    async fn start_instance(&self, id: &str) -> Result<(), SandboxError> {
        let url = self.endpoint(&format!("instances/{id}/start"))?;
        self.send(self.http.post(url), id).await.map(|_| ())
    }

    async fn create_instance(
        &self,
        project_id: &str,
        vnc_password: &str,
        image: &str,
    ) -> Result<InstanceInfo, SandboxError> {
        let url = self.endpoint("instances")?;
        let body = json!({
            "image": image,
            "public": true,
            "labels": { "project_id": project_id },
            "env": {
                "VNC_PASSWORD": vnc_password,
                "RESOLUTION": "1024x768x24",
                "RESOLUTION_WIDTH": "1024",
                "RESOLUTION_HEIGHT": "768",
                "CHROME_PERSISTENT_SESSION": "true",
                "ANONYMIZED_TELEMETRY": "false",
                "CHROME_DEBUGGING_PORT": "9222",
            },
            "resources": { "cpu": 2, "memory_gb": 4, "disk_gb": 5 },
        });
        self.send(self.http.post(url).json(&body), project_id)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("bad instance payload: {e}")))
    }

    async fn delete_instance(&self, id: &str) -> Result<(), SandboxError> {
        let url = self.endpoint(&format!("instances/{id}"))?;
        self.send(self.http.delete(url), id).await.map(|_| ())
    }

    async fn exec(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError> {
        let url = self.endpoint(&format!("instances/{id}/exec"))?;
        let body = ExecRequest {
            command,
            cwd,
            timeout_secs: timeout.map(|t| t.as_secs()),
        };
        let response: ExecResponse = self
            .send(self.http.post(url).json(&body), id)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("bad exec payload: {e}")))?;
        Ok(response.into())
    }

    async fn session_exec(
        &self,
        id: &str,
        session_id: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let url = self.endpoint(&format!("instances/{id}/sessions/{session_id}/exec"))?;
        let response: ExecResponse = self
            .send(self.http.post(url).json(&json!({ "command": command })), id)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("bad exec payload: {e}")))?;
        Ok(response.into())
    }
}

// ─── ManagedSandbox ───────────────────────────────────────────────────────────

/// [`SandboxHandle`] over one managed instance.
#[derive(Debug)]
pub struct ManagedSandbox {
    client: Arc<ManagedClient>,
    instance_id: String,
    vnc_url: Option<String>,
    web_url: Option<String>,
}

#[async_trait]
impl SandboxHandle for ManagedSandbox {
    fn id(&self) -> &str {
        &self.instance_id
    }

    async fn upload(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let url = self
            .client
            .endpoint(&format!("instances/{}/fs/upload", self.instance_id))?;
        let body = json!({
            "path": path,
            "content_base64": BASE64.encode(content),
        });
        self.client
            .send(self.client.http.post(url).json(&body), &self.instance_id)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                SandboxError::NotFound(id) => SandboxError::NotFound(id),
                other => SandboxError::UploadFailed(other.to_string()),
            })
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>, SandboxError> {
        let mut url = self
            .client
            .endpoint(&format!("instances/{}/fs/list", self.instance_id))?;
        url.query_pairs_mut().append_pair("path", path);
        let response: FileListResponse = self
            .client
            .send(self.client.http.get(url), &self.instance_id)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("bad listing payload: {e}")))?;
        Ok(response.files)
    }

    async fn mkdir(&self, path: &str, permissions: Option<u32>) -> Result<(), SandboxError> {
        let url = self
            .client
            .endpoint(&format!("instances/{}/fs/mkdir", self.instance_id))?;
        let body = json!({
            "path": path,
            "mode": permissions.map(|m| format!("{m:o}")),
        });
        self.client
            .send(self.client.http.post(url).json(&body), &self.instance_id)
            .await
            .map(|_| ())
    }

    async fn chmod(&self, path: &str, permissions: u32) -> Result<(), SandboxError> {
        let url = self
            .client
            .endpoint(&format!("instances/{}/fs/chmod", self.instance_id))?;
        let body = json!({ "path": path, "mode": format!("{permissions:o}") });
        self.client
            .send(self.client.http.post(url).json(&body), &self.instance_id)
            .await
            .map(|_| ())
    }

    async fn exists(&self, path: &str) -> Result<bool, SandboxError> {
        let mut url = self
            .client
            .endpoint(&format!("instances/{}/fs/exists", self.instance_id))?;
        url.query_pairs_mut().append_pair("path", path);
        let response: ExistsResponse = self
            .client
            .send(self.client.http.get(url), &self.instance_id)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("bad exists payload: {e}")))?;
        Ok(response.exists)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let mut url = self
            .client
            .endpoint(&format!("instances/{}/fs/read", self.instance_id))?;
        url.query_pairs_mut().append_pair("path", path);
        let response: ReadFileResponse = self
            .client
            .send(self.client.http.get(url), &self.instance_id)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("bad read payload: {e}")))?;
        BASE64
            .decode(response.content_base64)
            .map_err(|e| SandboxError::Unavailable(format!("invalid base64 from service: {e}")))
    }

    async fn exec(
        &self,
        command: &str,
        workdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError> {
        self.client
            .exec(
                &self.instance_id,
                command,
                Some(workdir.unwrap_or(WORKSPACE_DIR)),
                timeout,
            )
            .await
    }

    fn preview_link(&self, container_port: u16) -> Option<String> {
        match container_port {
            VNC_PORT => self.vnc_url.clone(),
            WEB_PORT => self.web_url.clone(),
            _ => None,
        }
    }

    async fn create_session(&self, session_id: &str) -> Result<(), SandboxError> {
        let url = self
            .client
            .endpoint(&format!("instances/{}/sessions", self.instance_id))?;
        self.client
            .send(
                self.client
                    .http
                    .post(url)
                    .json(&json!({ "session_id": session_id })),
                &self.instance_id,
            )
            .await
            .map(|_| ())
    }

    async fn execute_session_command(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        self.client
            .session_exec(&self.instance_id, session_id, command)
            .await
    }
}

// ─── ManagedBackend ───────────────────────────────────────────────────────────

/// [`SandboxBackend`] for the managed remote service.
pub struct ManagedBackend {
    config: ManagedConfig,
    client: Mutex<Option<Arc<ManagedClient>>>,
}

impl ManagedBackend {
    pub fn new(config: ManagedConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<ManagedClient>, SandboxError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        if !self.config.is_configured() {
            return Err(SandboxError::Unavailable(
                "managed sandbox service is not configured (missing API key or server URL)".into(),
            ));
        }
        let client = Arc::new(ManagedClient::new(&self.config)?);
        *guard = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl SandboxBackend for ManagedBackend {
    async fn status(&self, descriptor: &SandboxDescriptor) -> Result<SandboxState, SandboxError> {
        let info = self.client().await?.get_instance(&descriptor.id).await?;
        Ok(parse_state(&info.state))
    }

    async fn start(&self, descriptor: &SandboxDescriptor) -> Result<(), SandboxError> {
        self.client().await?.start_instance(&descriptor.id).await
    }

    async fn connect(
        &self,
        descriptor: &SandboxDescriptor,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let client = self.client().await?;
        // Endpoint URLs may have changed server-side since the descriptor
        // was recorded; prefer fresh instance info.
        let (vnc_url, web_url) = match client.get_instance(&descriptor.id).await {
            Ok(info) => (
                info.vnc_url.or_else(|| descriptor.vnc_url.clone()),
                info.web_url.or_else(|| descriptor.web_url.clone()),
            ),
            Err(SandboxError::NotFound(id)) => return Err(SandboxError::NotFound(id)),
            Err(_) => (descriptor.vnc_url.clone(), descriptor.web_url.clone()),
        };
        Ok(Arc::new(ManagedSandbox {
            client,
            instance_id: descriptor.id.clone(),
            vnc_url,
            web_url,
        }))
    }

    async fn provision(
        &self,
        project_id: &str,
        vnc_password: &str,
        image: &str,
    ) -> Result<SandboxDescriptor, SandboxError> {
        let client = self.client().await?;
        let info = client
            .create_instance(project_id, vnc_password, image)
            .await?;
        tracing::info!(instance = %info.id, "managed sandbox created");

        let mut descriptor = SandboxDescriptor::managed(info.id, vnc_password);
        descriptor.vnc_url = info.vnc_url;
        descriptor.web_url = info.web_url;
        Ok(descriptor)
    }

    async fn destroy(&self, descriptor: &SandboxDescriptor) -> Result<(), SandboxError> {
        self.client().await?.delete_instance(&descriptor.id).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_map_to_lifecycle_states() {
        assert_eq!(parse_state("running"), SandboxState::Running);
        assert_eq!(parse_state("created"), SandboxState::Created);
        assert_eq!(parse_state("stopped"), SandboxState::Stopped);
        assert_eq!(parse_state("archived"), SandboxState::Stopped);
    }

    #[test]
    fn exec_response_deserializes_with_missing_streams() {
        let response: ExecResponse =
            serde_json::from_str(r#"{"exit_code": 0, "stdout": "ok"}"#).unwrap();
        let output: ExecOutput = response.into();
        assert!(output.success());
        assert_eq!(output.stdout, "ok");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_backend_is_unavailable_and_retries_lazily() {
        let backend = ManagedBackend::new(ManagedConfig::default());
        let descriptor = SandboxDescriptor::managed("inst-1", "pw");

        let err = backend.status(&descriptor).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));

        // Still unavailable on the next call; nothing was cached.
        let err = backend.start(&descriptor).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));
    }

    #[test]
    fn client_rejects_invalid_server_url() {
        let config = ManagedConfig {
            api_key: "mk-test".into(),
            server_url: "not a url".into(),
            target: "eu".into(),
        };
        assert!(matches!(
            ManagedClient::new(&config),
            Err(SandboxError::Unavailable(_))
        ));
    }

    #[test]
    fn instance_info_tolerates_missing_urls() {
        let info: InstanceInfo =
            serde_json::from_str(r#"{"id": "inst-9", "state": "running"}"#).unwrap();
        assert_eq!(info.id, "inst-9");
        assert!(info.vnc_url.is_none());
    }
}
