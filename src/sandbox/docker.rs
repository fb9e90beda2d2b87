//! Local sandbox backend over the container runtime CLI.
//!
//! Drives the `docker` binary directly (`run`, `inspect`, `exec`, `cp`)
//! rather than the daemon socket, which works in restricted environments
//! where the socket may not be accessible.  Filesystem uploads travel as
//! in-memory tar archives piped to `docker cp -`; exec captures stdout and
//! stderr on separate pipes.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::SandboxConfig;

use super::{
    ExecOutput, FileInfo, SandboxBackend, SandboxDescriptor, SandboxError, SandboxHandle,
    SandboxState, VNC_PORT, WEB_PORT, WORKSPACE_DIR,
};

/// Label identifying containers owned by this runtime.
const MANAGED_BY_LABEL: &str = "managed_by=agent_runtime";

// ─── Shell quoting ────────────────────────────────────────────────────────────

/// Quote a string for safe interpolation into `sh -c`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ─── DockerCli ────────────────────────────────────────────────────────────────

/// Thin async wrapper around the container runtime binary.
#[derive(Debug)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }

    /// Locate the runtime binary and verify the daemon answers.
    pub async fn detect() -> Result<Self, SandboxError> {
        let binary = which::which("docker")
            .map_err(|_| SandboxError::Unavailable("docker binary not found in PATH".into()))?
            .to_string_lossy()
            .into_owned();
        let cli = Self::new(binary);
        cli.ping().await?;
        Ok(cli)
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        let output = self
            .command(&["version", "--format", "{{.Server.Version}}"])
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(SandboxError::Unavailable(format!(
                "container daemon not reachable: {}",
                output.stderr.trim()
            )))
        }
    }

    /// Run one CLI invocation to completion.
    async fn command(&self, args: &[&str]) -> Result<ExecOutput, SandboxError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to spawn {}: {e}", self.binary)))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: i64::from(output.status.code().unwrap_or(-1)),
        })
    }

    fn map_missing(&self, output: &ExecOutput, id: &str) -> Option<SandboxError> {
        let stderr = output.stderr.to_ascii_lowercase();
        if stderr.contains("no such object") || stderr.contains("no such container") {
            Some(SandboxError::NotFound(id.to_string()))
        } else {
            None
        }
    }

    /// Build the complete argument list for `docker run`.
    ///
    /// Exposed so unit tests can inspect the arguments without a live
    /// container daemon.
    pub fn build_run_args(
        image: &str,
        name: &str,
        env: &HashMap<String, String>,
        labels: &[String],
        vnc_host_port: Option<u16>,
        web_host_port: Option<u16>,
    ) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--detach".to_string()];

        args.push("--name".to_string());
        args.push(name.to_string());

        for label in labels {
            args.push("--label".to_string());
            args.push(label.clone());
        }

        // Publish the two well-known container ports; an absent host port
        // lets the runtime assign one.
        let publish = |container: u16, host: Option<u16>| match host {
            Some(h) => format!("{h}:{container}"),
            None => format!("{container}"),
        };
        args.push("--publish".to_string());
        args.push(publish(VNC_PORT, vnc_host_port));
        args.push("--publish".to_string());
        args.push(publish(WEB_PORT, web_host_port));

        let mut env_pairs: Vec<_> = env.iter().collect();
        env_pairs.sort();
        for (k, v) in env_pairs {
            args.push("--env".to_string());
            args.push(format!("{k}={v}"));
        }

        args.push(image.to_string());
        args
    }

    /// `docker run` returning the new container id.
    async fn run_container(&self, args: &[String]) -> Result<String, SandboxError> {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.command(&arg_refs).await?;
        if !output.success() {
            return Err(SandboxError::Unavailable(format!(
                "container start failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Host port a container port is published on.
    async fn host_port(&self, container_id: &str, port: u16) -> Result<Option<u16>, SandboxError> {
        let port_arg = format!("{port}/tcp");
        let output = self.command(&["port", container_id, &port_arg]).await?;
        if !output.success() {
            return Ok(None);
        }
        // Lines look like `0.0.0.0:32768` (possibly one per address family).
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.rsplit(':').next())
            .find_map(|p| p.trim().parse::<u16>().ok()))
    }

    async fn container_state(&self, container_id: &str) -> Result<SandboxState, SandboxError> {
        let output = self
            .command(&["inspect", "--format", "{{.State.Status}}", container_id])
            .await?;
        if !output.success() {
            if let Some(err) = self.map_missing(&output, container_id) {
                return Err(err);
            }
            return Err(SandboxError::Unavailable(format!(
                "inspect failed: {}",
                output.stderr.trim()
            )));
        }
        match output.stdout.trim() {
            "running" => Ok(SandboxState::Running),
            "created" => Ok(SandboxState::Created),
            // exited / dead / paused are all recoverable via start.
            _ => Ok(SandboxState::Stopped),
        }
    }

    async fn start_container(&self, container_id: &str) -> Result<(), SandboxError> {
        let output = self.command(&["start", container_id]).await?;
        if output.success() {
            return Ok(());
        }
        Err(self
            .map_missing(&output, container_id)
            .unwrap_or_else(|| {
                SandboxError::Unavailable(format!("start failed: {}", output.stderr.trim()))
            }))
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), SandboxError> {
        let stop = self.command(&["stop", "--time", "5", container_id]).await?;
        if !stop.success()
            && let Some(err) = self.map_missing(&stop, container_id)
        {
            return Err(err);
        }
        let rm = self.command(&["rm", "--force", container_id]).await?;
        if !rm.success() {
            if let Some(err) = self.map_missing(&rm, container_id) {
                return Err(err);
            }
            return Err(SandboxError::Unavailable(format!(
                "remove failed: {}",
                rm.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Exec with demultiplexed stdout/stderr and an optional wall-clock
    /// timeout.
    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        workdir: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError> {
        let args = [
            "exec",
            "--workdir",
            workdir,
            container_id,
            "sh",
            "-c",
            command,
        ];
        let run = self.command(&args);

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                SandboxError::ExecFailed {
                    exit_code: -1,
                    stderr: format!("command timed out after {}s", limit.as_secs()),
                }
            })??,
            None => run.await?,
        };

        if let Some(err) = self.map_missing(&output, container_id) {
            return Err(err);
        }
        Ok(output)
    }

    /// Stream a tar archive into the container (`docker cp -`).
    async fn put_archive(
        &self,
        container_id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxError> {
        let mut child = tokio::process::Command::new(&self.binary)
            .args(["cp", "-", &format!("{container_id}:{dest_dir}")])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::UploadFailed(format!("failed to spawn cp: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&archive)
                .await
                .map_err(|e| SandboxError::UploadFailed(format!("failed to stream archive: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| SandboxError::UploadFailed(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::UploadFailed(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::UploadFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String, SandboxError> {
        let tail = tail.to_string();
        let output = self
            .command(&["logs", "--tail", &tail, container_id])
            .await?;
        if let Some(err) = self.map_missing(&output, container_id) {
            return Err(err);
        }
        // The daemon may write logs to either pipe depending on the
        // container's own stream usage.
        Ok(format!("{}{}", output.stdout, output.stderr))
    }
}

// ─── ls parsing ───────────────────────────────────────────────────────────────

/// Parse `ls -lA --time-style=long-iso` output into [`FileInfo`] records.
///
/// Directories and files are distinguished by the first permissions
/// character; unparseable lines are skipped with a warning.
pub(crate) fn parse_ls_output(stdout: &str) -> Vec<FileInfo> {
    let mut files = Vec::new();
    for line in stdout.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("total ") {
            continue;
        }
        // perms links owner group size date time name
        let Some((fields, name)) = split_listing_line(line) else {
            tracing::warn!(line, "skipping unparseable listing line");
            continue;
        };
        let Ok(size) = fields[4].parse::<u64>() else {
            tracing::warn!(line, "skipping listing line with non-numeric size");
            continue;
        };
        files.push(FileInfo {
            name: name.to_string(),
            is_dir: fields[0].starts_with('d'),
            size,
        });
    }
    files
}

/// Split a long-listing line into its seven metadata fields and the file
/// name (which may itself contain spaces).
fn split_listing_line(line: &str) -> Option<([&str; 7], &str)> {
    let mut rest = line;
    let mut fields = [""; 7];
    for slot in &mut fields {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        *slot = &rest[..end];
        rest = &rest[end..];
    }
    let name = rest.trim_start();
    if name.is_empty() { None } else { Some((fields, name)) }
}

// ─── DockerSandbox ────────────────────────────────────────────────────────────

/// [`SandboxHandle`] over one local container.
#[derive(Debug)]
pub struct DockerSandbox {
    cli: Arc<DockerCli>,
    container_id: String,
    host_vnc_port: Option<u16>,
    host_web_port: Option<u16>,
}

#[async_trait]
impl SandboxHandle for DockerSandbox {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn upload(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let (parent, file_name) = match path.rsplit_once('/') {
            Some((dir, name)) if !dir.is_empty() => (dir, name),
            _ => ("/", path.trim_start_matches('/')),
        };
        if file_name.is_empty() {
            return Err(SandboxError::UploadFailed(format!(
                "not a file path: {path}"
            )));
        }

        self.mkdir(parent, None).await?;

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, file_name, content)
            .map_err(|e| SandboxError::UploadFailed(e.to_string()))?;
        let archive = builder
            .into_inner()
            .map_err(|e| SandboxError::UploadFailed(e.to_string()))?;

        self.cli
            .put_archive(&self.container_id, parent, archive)
            .await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>, SandboxError> {
        let command = format!("ls -lA --time-style=long-iso {}", shell_quote(path));
        let output = self
            .cli
            .exec(&self.container_id, &command, "/", None)
            .await?;
        if !output.success() {
            return Err(SandboxError::ExecFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(parse_ls_output(&output.stdout))
    }

    async fn mkdir(&self, path: &str, permissions: Option<u32>) -> Result<(), SandboxError> {
        let command = match permissions {
            Some(mode) => format!("mkdir -p -m {:o} {}", mode, shell_quote(path)),
            None => format!("mkdir -p {}", shell_quote(path)),
        };
        let output = self
            .cli
            .exec(&self.container_id, &command, "/", None)
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(SandboxError::ExecFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    async fn chmod(&self, path: &str, permissions: u32) -> Result<(), SandboxError> {
        let command = format!("chmod {:o} {}", permissions, shell_quote(path));
        let output = self
            .cli
            .exec(&self.container_id, &command, "/", None)
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(SandboxError::ExecFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, SandboxError> {
        let command = format!("test -e {}", shell_quote(path));
        let output = self
            .cli
            .exec(&self.container_id, &command, "/", None)
            .await?;
        Ok(output.success())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        // base64 round-trip keeps binary content intact across the exec
        // text pipes.
        let command = format!("base64 {}", shell_quote(path));
        let output = self
            .cli
            .exec(&self.container_id, &command, "/", None)
            .await?;
        if !output.success() {
            return Err(SandboxError::ExecFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        let compact: String = output
            .stdout
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        BASE64
            .decode(compact)
            .map_err(|e| SandboxError::ExecFailed {
                exit_code: -1,
                stderr: format!("invalid base64 from container: {e}"),
            })
    }

    async fn exec(
        &self,
        command: &str,
        workdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError> {
        self.cli
            .exec(
                &self.container_id,
                command,
                workdir.unwrap_or(WORKSPACE_DIR),
                timeout,
            )
            .await
    }

    fn preview_link(&self, container_port: u16) -> Option<String> {
        let host_port = match container_port {
            VNC_PORT => self.host_vnc_port,
            WEB_PORT => self.host_web_port,
            _ => None,
        }?;
        Some(format!("http://localhost:{host_port}"))
    }

    async fn create_session(&self, session_id: &str) -> Result<(), SandboxError> {
        // The CLI exec API is sessionless; commands run directly.
        tracing::debug!(session = session_id, "session create is a no-op on the local backend");
        Ok(())
    }

    async fn execute_session_command(
        &self,
        _session_id: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        self.exec(command, None, None).await
    }
}

impl DockerSandbox {
    /// Recent container logs, mainly for diagnostics.
    pub async fn logs(&self, tail: usize) -> Result<String, SandboxError> {
        self.cli.logs(&self.container_id, tail).await
    }
}

// ─── DockerBackend ────────────────────────────────────────────────────────────

/// Sandbox environment variables shared by every container we start.
fn sandbox_env(vnc_password: &str) -> HashMap<String, String> {
    HashMap::from([
        ("VNC_PASSWORD".to_string(), vnc_password.to_string()),
        ("RESOLUTION".to_string(), "1024x768x24".to_string()),
        ("RESOLUTION_WIDTH".to_string(), "1024".to_string()),
        ("RESOLUTION_HEIGHT".to_string(), "768".to_string()),
        ("CHROME_PERSISTENT_SESSION".to_string(), "true".to_string()),
        ("ANONYMIZED_TELEMETRY".to_string(), "false".to_string()),
        ("CHROME_DEBUGGING_PORT".to_string(), "9222".to_string()),
    ])
}

/// [`SandboxBackend`] for the local container runtime.
///
/// The CLI client is initialized lazily on first use.  A successful init
/// is cached for the process lifetime; a failed init is reported as
/// `Unavailable` and re-attempted on the next top-level call.
pub struct DockerBackend {
    config: SandboxConfig,
    cli: Mutex<Option<Arc<DockerCli>>>,
}

impl DockerBackend {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            cli: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<DockerCli>, SandboxError> {
        let mut guard = self.cli.lock().await;
        if let Some(cli) = guard.as_ref() {
            return Ok(cli.clone());
        }
        let cli = Arc::new(DockerCli::detect().await?);
        *guard = Some(cli.clone());
        Ok(cli)
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn status(&self, descriptor: &SandboxDescriptor) -> Result<SandboxState, SandboxError> {
        self.client().await?.container_state(&descriptor.id).await
    }

    async fn start(&self, descriptor: &SandboxDescriptor) -> Result<(), SandboxError> {
        self.client().await?.start_container(&descriptor.id).await
    }

    async fn connect(
        &self,
        descriptor: &SandboxDescriptor,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let cli = self.client().await?;
        // Prefer the recorded port map; fall back to querying the runtime
        // for containers recorded before the ports were known.
        let host_vnc_port = match descriptor.host_vnc_port {
            Some(p) => Some(p),
            None => cli.host_port(&descriptor.id, VNC_PORT).await?,
        };
        let host_web_port = match descriptor.host_web_port {
            Some(p) => Some(p),
            None => cli.host_port(&descriptor.id, WEB_PORT).await?,
        };
        Ok(Arc::new(DockerSandbox {
            cli,
            container_id: descriptor.id.clone(),
            host_vnc_port,
            host_web_port,
        }))
    }

    async fn provision(
        &self,
        project_id: &str,
        vnc_password: &str,
        image: &str,
    ) -> Result<SandboxDescriptor, SandboxError> {
        let cli = self.client().await?;

        let name = format!("sandpiper_sandbox_{project_id}");
        let labels = vec![
            MANAGED_BY_LABEL.to_string(),
            format!("project_id={project_id}"),
        ];
        let args = DockerCli::build_run_args(
            image,
            &name,
            &sandbox_env(vnc_password),
            &labels,
            self.config.vnc_host_port,
            self.config.web_host_port,
        );

        let container_id = cli.run_container(&args).await?;
        tracing::info!(container = %container_id, name, "local sandbox started");

        let host_vnc_port = cli.host_port(&container_id, VNC_PORT).await?;
        let host_web_port = cli.host_port(&container_id, WEB_PORT).await?;

        let mut descriptor = SandboxDescriptor::local(container_id, vnc_password);
        descriptor.host_vnc_port = host_vnc_port;
        descriptor.host_web_port = host_web_port;
        descriptor.vnc_url = host_vnc_port.map(|p| format!("http://localhost:{p}"));
        descriptor.web_url = host_web_port.map(|p| format!("http://localhost:{p}"));
        Ok(descriptor)
    }

    async fn destroy(&self, descriptor: &SandboxDescriptor) -> Result<(), SandboxError> {
        self.client().await?.stop_and_remove(&descriptor.id).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
