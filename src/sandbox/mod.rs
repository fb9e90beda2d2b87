//! Per-project sandbox containers.
//!
//! Every project owns at most one sandbox: an isolated container running
//! the agent execution image with `/workspace`, a VNC endpoint (6080), and
//! a web endpoint (8080).  Two backends provide the same interface:
//!
//! - [`docker`] — containers on the local container runtime, driven
//!   through the `docker` CLI.
//! - [`managed`] — instances on a managed remote sandbox service, driven
//!   through its REST API.
//!
//! [`SandboxService`] is the provider used by the runtime: it routes
//! `ensure`/`remove` by the descriptor stored on the project and `create`
//! by the configured backend, caches per-project handles, and boots the
//! in-container process supervisor after every fresh start.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{AppConfig, SandboxKind};
use crate::store::ProjectStore;

pub mod docker;
pub mod managed;

pub use docker::DockerBackend;
pub use managed::ManagedBackend;

/// Container port of the VNC endpoint inside the sandbox image.
pub const VNC_PORT: u16 = 6080;
/// Container port of the web/control endpoint inside the sandbox image.
pub const WEB_PORT: u16 = 8080;
/// Working directory of the agent inside the sandbox.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Session name under which the process supervisor is started.
const SUPERVISOR_SESSION: &str = "supervisord-session";
/// Command that boots the in-container process supervisor.
const SUPERVISOR_COMMAND: &str =
    "exec /usr/bin/supervisord -n -c /etc/supervisor/conf.d/supervisord.conf";

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Failures surfaced by the sandbox layer.  None of these are retried
/// inside the provider; callers decide.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),

    #[error("command failed with exit code {exit_code}: {stderr}")]
    ExecFailed { exit_code: i64, stderr: String },

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("storage error: {0}")]
    Store(String),
}

// ─── Descriptor & state ───────────────────────────────────────────────────────

/// Sandbox record persisted on the project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxDescriptor {
    pub kind: SandboxKind,
    /// Container id (local) or instance id (managed).
    pub id: String,
    pub vnc_password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_vnc_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_web_port: Option<u16>,
}

impl SandboxDescriptor {
    pub fn local(id: impl Into<String>, vnc_password: impl Into<String>) -> Self {
        Self {
            kind: SandboxKind::Local,
            id: id.into(),
            vnc_password: vnc_password.into(),
            vnc_url: None,
            web_url: None,
            host_vnc_port: None,
            host_web_port: None,
        }
    }

    pub fn managed(id: impl Into<String>, vnc_password: impl Into<String>) -> Self {
        Self {
            kind: SandboxKind::Managed,
            ..Self::local(id, vnc_password)
        }
    }
}

/// Runtime state of a sandbox as reported by its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Running,
    Stopped,
}

/// Entry returned by a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Captured output of one command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ─── Handle & provider traits ─────────────────────────────────────────────────

/// Filesystem and process primitives of one running sandbox.
///
/// Paths are absolute inside the container; tools normalize user input to
/// `/workspace` before calling in.
#[async_trait]
pub trait SandboxHandle: Send + Sync + std::fmt::Debug {
    /// Container / instance identifier.
    fn id(&self) -> &str;

    async fn upload(&self, path: &str, content: &[u8]) -> Result<(), SandboxError>;

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>, SandboxError>;

    async fn mkdir(&self, path: &str, permissions: Option<u32>) -> Result<(), SandboxError>;

    async fn chmod(&self, path: &str, permissions: u32) -> Result<(), SandboxError>;

    async fn exists(&self, path: &str) -> Result<bool, SandboxError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Run a command through the backend's exec API with demultiplexed
    /// stdout/stderr.  A non-zero exit code is reported in [`ExecOutput`],
    /// not as an error; `Err` means the exec could not run at all.
    async fn exec(
        &self,
        command: &str,
        workdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError>;

    /// Host-reachable URL for a container port, when mapped.
    fn preview_link(&self, container_port: u16) -> Option<String>;

    /// Create a named long-lived exec session.  A no-op on backends whose
    /// exec API is sessionless.
    async fn create_session(&self, session_id: &str) -> Result<(), SandboxError>;

    /// Run a command inside a named session.
    async fn execute_session_command(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError>;
}

/// Sandbox lifecycle operations exposed to the rest of the runtime.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Resolve the project's sandbox, starting it if it is stopped.
    /// Fails with [`SandboxError::NotFound`] when the project has no
    /// descriptor.  Idempotent.
    async fn ensure(&self, project_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError>;

    /// Start a new sandbox for the project and record its descriptor.
    async fn create(
        &self,
        project_id: &str,
        vnc_password: &str,
        image: Option<&str>,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError>;

    /// Stop and delete the project's sandbox, clearing the descriptor.
    /// Absent counts as success.
    async fn remove(&self, project_id: &str) -> Result<bool, SandboxError>;
}

/// One concrete sandbox backend.  Both implementations satisfy this
/// interface; [`SandboxService`] dispatches between them.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Runtime state of the sandbox the descriptor points at.
    async fn status(&self, descriptor: &SandboxDescriptor) -> Result<SandboxState, SandboxError>;

    /// Start a created/stopped sandbox.  Starting a running sandbox is a
    /// success at the runtime level.
    async fn start(&self, descriptor: &SandboxDescriptor) -> Result<(), SandboxError>;

    /// Build a handle onto a running sandbox.
    async fn connect(
        &self,
        descriptor: &SandboxDescriptor,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError>;

    /// Provision a brand-new sandbox and return its descriptor.
    async fn provision(
        &self,
        project_id: &str,
        vnc_password: &str,
        image: &str,
    ) -> Result<SandboxDescriptor, SandboxError>;

    /// Stop and delete the sandbox.  Missing sandboxes are not an error.
    async fn destroy(&self, descriptor: &SandboxDescriptor) -> Result<(), SandboxError>;
}

// ─── SandboxService ───────────────────────────────────────────────────────────

/// Provider implementation that routes between the local and managed
/// backends and owns the per-project handle cache.
pub struct SandboxService {
    docker: Arc<dyn SandboxBackend>,
    managed: Arc<dyn SandboxBackend>,
    projects: Arc<dyn ProjectStore>,
    default_kind: SandboxKind,
    default_image: String,
    handles: Mutex<HashMap<String, Arc<dyn SandboxHandle>>>,
}

impl SandboxService {
    /// Build the service from configuration.  The managed backend stays
    /// constructible even when unconfigured; its calls fail with
    /// `Unavailable` until credentials appear, and a service rebuilt from
    /// fresh configuration picks them up without a process restart.
    pub fn from_config(config: &AppConfig, projects: Arc<dyn ProjectStore>) -> Self {
        Self::with_backends(
            Arc::new(DockerBackend::new(config.sandbox.clone())),
            Arc::new(ManagedBackend::new(config.managed.clone())),
            projects,
            config.sandbox.kind,
            config.sandbox.image.clone(),
        )
    }

    /// Assemble from explicit backends (tests inject stubs here).
    pub fn with_backends(
        docker: Arc<dyn SandboxBackend>,
        managed: Arc<dyn SandboxBackend>,
        projects: Arc<dyn ProjectStore>,
        default_kind: SandboxKind,
        default_image: String,
    ) -> Self {
        Self {
            docker,
            managed,
            projects,
            default_kind,
            default_image,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn backend_for(&self, kind: SandboxKind) -> &Arc<dyn SandboxBackend> {
        match kind {
            SandboxKind::Local => &self.docker,
            SandboxKind::Managed => &self.managed,
        }
    }

    async fn descriptor_of(
        &self,
        project_id: &str,
    ) -> Result<Option<SandboxDescriptor>, SandboxError> {
        let project = self
            .projects
            .get_project(project_id)
            .await
            .map_err(|e| match e {
                crate::store::StoreError::ProjectNotFound(id) => SandboxError::NotFound(id),
                other => SandboxError::Store(other.to_string()),
            })?;
        Ok(project.sandbox)
    }

    /// Start the process supervisor inside a freshly started sandbox.
    async fn boot_supervisor(&self, handle: &Arc<dyn SandboxHandle>) -> Result<(), SandboxError> {
        handle.create_session(SUPERVISOR_SESSION).await?;
        handle
            .execute_session_command(SUPERVISOR_SESSION, SUPERVISOR_COMMAND)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for SandboxService {
    #[tracing::instrument(name = "sandbox.ensure", skip(self))]
    async fn ensure(&self, project_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let descriptor = self.descriptor_of(project_id).await?.ok_or_else(|| {
            SandboxError::NotFound(format!("no sandbox recorded for project {project_id}"))
        })?;

        let backend = self.backend_for(descriptor.kind);
        let state = backend.status(&descriptor).await?;

        let fresh_start = match state {
            SandboxState::Running => false,
            SandboxState::Created | SandboxState::Stopped => {
                tracing::info!(sandbox = %descriptor.id, ?state, "starting sandbox");
                backend.start(&descriptor).await?;
                true
            }
        };

        let handle = {
            let cached = self.handles.lock().await.get(project_id).cloned();
            match cached {
                Some(handle) if handle.id() == descriptor.id => handle,
                _ => {
                    let handle = backend.connect(&descriptor).await?;
                    self.handles
                        .lock()
                        .await
                        .insert(project_id.to_string(), handle.clone());
                    handle
                }
            }
        };

        if fresh_start {
            self.boot_supervisor(&handle).await?;
        }
        Ok(handle)
    }

    #[tracing::instrument(name = "sandbox.create", skip(self, vnc_password))]
    async fn create(
        &self,
        project_id: &str,
        vnc_password: &str,
        image: Option<&str>,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        // A project owns at most one sandbox; tear down any existing one
        // before provisioning a replacement.
        if self.descriptor_of(project_id).await?.is_some() {
            self.remove(project_id).await?;
        }

        let backend = self.backend_for(self.default_kind);
        let image = image.unwrap_or(&self.default_image);
        let descriptor = backend.provision(project_id, vnc_password, image).await?;

        self.projects
            .set_sandbox(project_id, Some(descriptor.clone()))
            .await
            .map_err(|e| SandboxError::Store(e.to_string()))?;

        let handle = backend.connect(&descriptor).await?;
        self.boot_supervisor(&handle).await?;
        self.handles
            .lock()
            .await
            .insert(project_id.to_string(), handle.clone());
        Ok(handle)
    }

    #[tracing::instrument(name = "sandbox.remove", skip(self))]
    async fn remove(&self, project_id: &str) -> Result<bool, SandboxError> {
        let Some(descriptor) = self.descriptor_of(project_id).await? else {
            return Ok(true);
        };

        let backend = self.backend_for(descriptor.kind);
        match backend.destroy(&descriptor).await {
            Ok(()) => {}
            Err(SandboxError::NotFound(_)) => {
                tracing::warn!(sandbox = %descriptor.id, "sandbox already gone; clearing descriptor");
            }
            Err(e) => return Err(e),
        }

        self.projects
            .set_sandbox(project_id, None)
            .await
            .map_err(|e| SandboxError::Store(e.to_string()))?;
        self.handles.lock().await.remove(project_id);
        Ok(true)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct StubHandle {
        id: String,
    }

    #[async_trait]
    impl SandboxHandle for StubHandle {
        fn id(&self) -> &str {
            &self.id
        }
        async fn upload(&self, _: &str, _: &[u8]) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn list_dir(&self, _: &str) -> Result<Vec<FileInfo>, SandboxError> {
            Ok(vec![])
        }
        async fn mkdir(&self, _: &str, _: Option<u32>) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn chmod(&self, _: &str, _: u32) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn exists(&self, _: &str) -> Result<bool, SandboxError> {
            Ok(false)
        }
        async fn read_file(&self, _: &str) -> Result<Vec<u8>, SandboxError> {
            Ok(vec![])
        }
        async fn exec(
            &self,
            _: &str,
            _: Option<&str>,
            _: Option<Duration>,
        ) -> Result<ExecOutput, SandboxError> {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        fn preview_link(&self, _: u16) -> Option<String> {
            None
        }
        async fn create_session(&self, _: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn execute_session_command(
            &self,
            _: &str,
            _: &str,
        ) -> Result<ExecOutput, SandboxError> {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    /// Backend whose sandboxes are always stopped until started.
    struct StubBackend {
        kind: SandboxKind,
        available: bool,
        starts: AtomicUsize,
        provisions: AtomicUsize,
    }

    impl StubBackend {
        fn new(kind: SandboxKind, available: bool) -> Self {
            Self {
                kind,
                available,
                starts: AtomicUsize::new(0),
                provisions: AtomicUsize::new(0),
            }
        }

        fn check(&self) -> Result<(), SandboxError> {
            if self.available {
                Ok(())
            } else {
                Err(SandboxError::Unavailable("backend not configured".into()))
            }
        }
    }

    #[async_trait]
    impl SandboxBackend for StubBackend {
        async fn status(&self, _: &SandboxDescriptor) -> Result<SandboxState, SandboxError> {
            self.check()?;
            Ok(if self.starts.load(Ordering::SeqCst) > 0 {
                SandboxState::Running
            } else {
                SandboxState::Stopped
            })
        }
        async fn start(&self, _: &SandboxDescriptor) -> Result<(), SandboxError> {
            self.check()?;
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn connect(
            &self,
            descriptor: &SandboxDescriptor,
        ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
            self.check()?;
            Ok(Arc::new(StubHandle {
                id: descriptor.id.clone(),
            }))
        }
        async fn provision(
            &self,
            project_id: &str,
            vnc_password: &str,
            _image: &str,
        ) -> Result<SandboxDescriptor, SandboxError> {
            self.check()?;
            self.provisions.fetch_add(1, Ordering::SeqCst);
            let mut d = match self.kind {
                SandboxKind::Local => SandboxDescriptor::local(
                    format!("cont-{project_id}"),
                    vnc_password,
                ),
                SandboxKind::Managed => SandboxDescriptor::managed(
                    format!("inst-{project_id}"),
                    vnc_password,
                ),
            };
            d.host_vnc_port = Some(32_768);
            Ok(d)
        }
        async fn destroy(&self, _: &SandboxDescriptor) -> Result<(), SandboxError> {
            self.check()?;
            Ok(())
        }
    }

    fn service(
        docker_ok: bool,
        managed_ok: bool,
        store: Arc<InMemoryStore>,
    ) -> (SandboxService, Arc<StubBackend>, Arc<StubBackend>) {
        let docker = Arc::new(StubBackend::new(SandboxKind::Local, docker_ok));
        let managed = Arc::new(StubBackend::new(SandboxKind::Managed, managed_ok));
        let svc = SandboxService::with_backends(
            docker.clone(),
            managed.clone(),
            store,
            SandboxKind::Local,
            "agent-runtime/sandbox:latest".into(),
        );
        (svc, docker, managed)
    }

    #[tokio::test]
    async fn ensure_without_descriptor_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let project = store.create_project("acct").await.unwrap();
        let (svc, _, _) = service(true, true, store);

        let err = svc.ensure(&project).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_records_descriptor_and_ensure_reuses_it() {
        let store = Arc::new(InMemoryStore::new());
        let project = store.create_project("acct").await.unwrap();
        let (svc, docker, _) = service(true, true, store.clone());

        let handle = svc.create(&project, "pw", None).await.unwrap();
        assert_eq!(docker.provisions.load(Ordering::SeqCst), 1);

        let stored = store.get_project(&project).await.unwrap().sandbox.unwrap();
        assert_eq!(stored.id, handle.id());

        let again = svc.ensure(&project).await.unwrap();
        assert_eq!(again.id(), handle.id());
        // At most one descriptor per project at all times.
        let project_rec = store.get_project(&project).await.unwrap();
        assert!(project_rec.sandbox.is_some());
    }

    #[tokio::test]
    async fn ensure_starts_stopped_sandbox_once() {
        let store = Arc::new(InMemoryStore::new());
        let project = store.create_project("acct").await.unwrap();
        store
            .set_sandbox(&project, Some(SandboxDescriptor::local("cont-1", "pw")))
            .await
            .unwrap();
        let (svc, docker, _) = service(true, true, store);

        svc.ensure(&project).await.unwrap();
        assert_eq!(docker.starts.load(Ordering::SeqCst), 1);

        // Second ensure sees a running sandbox; no new start.
        svc.ensure(&project).await.unwrap();
        assert_eq!(docker.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn managed_descriptor_with_unconfigured_backend_is_unavailable() {
        let store = Arc::new(InMemoryStore::new());
        let project = store.create_project("acct").await.unwrap();
        store
            .set_sandbox(&project, Some(SandboxDescriptor::managed("inst-1", "pw")))
            .await
            .unwrap();

        // Managed backend unconfigured → Unavailable.
        let (svc, _, _) = service(true, false, store.clone());
        let err = svc.ensure(&project).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));

        // A service rebuilt with configuration succeeds without restart.
        let (svc, _, _) = service(true, true, store);
        assert!(svc.ensure(&project).await.is_ok());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let project = store.create_project("acct").await.unwrap();
        let (svc, _, _) = service(true, true, store.clone());

        // Absent sandbox counts as success.
        assert!(svc.remove(&project).await.unwrap());

        svc.create(&project, "pw", None).await.unwrap();
        assert!(svc.remove(&project).await.unwrap());
        assert!(store.get_project(&project).await.unwrap().sandbox.is_none());
        assert!(svc.remove(&project).await.unwrap());
    }
}
