//! Shared test doubles for tool unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::sandbox::{ExecOutput, FileInfo, SandboxError, SandboxHandle, SandboxProvider};
use crate::storage::InlineImageStore;
use crate::store::InMemoryStore;

use super::traits::ToolContext;

/// Sandbox stub that records calls and replays scripted outputs.
#[derive(Debug)]
pub(crate) struct ScriptedSandbox {
    pub exec_calls: Mutex<Vec<(String, String)>>,
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
    pub exec_output: ExecOutput,
    pub file_content: Vec<u8>,
    pub listing: Vec<FileInfo>,
}

impl ScriptedSandbox {
    pub fn ok(stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            exec_calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            exec_output: ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
            file_content: Vec::new(),
            listing: Vec::new(),
        })
    }

    pub fn failing(stderr: &str, exit_code: i64) -> Arc<Self> {
        Arc::new(Self {
            exec_calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            exec_output: ExecOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
            file_content: Vec::new(),
            listing: Vec::new(),
        })
    }

    pub fn with_file(content: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            exec_calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            exec_output: ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            },
            file_content: content.to_vec(),
            listing: Vec::new(),
        })
    }
}

#[async_trait]
impl SandboxHandle for ScriptedSandbox {
    fn id(&self) -> &str {
        "stub-sandbox"
    }
    async fn upload(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        self.uploads
            .lock()
            .unwrap()
            .push((path.to_string(), content.to_vec()));
        Ok(())
    }
    async fn list_dir(&self, _: &str) -> Result<Vec<FileInfo>, SandboxError> {
        Ok(self.listing.clone())
    }
    async fn mkdir(&self, _: &str, _: Option<u32>) -> Result<(), SandboxError> {
        Ok(())
    }
    async fn chmod(&self, _: &str, _: u32) -> Result<(), SandboxError> {
        Ok(())
    }
    async fn exists(&self, _: &str) -> Result<bool, SandboxError> {
        Ok(true)
    }
    async fn read_file(&self, _: &str) -> Result<Vec<u8>, SandboxError> {
        Ok(self.file_content.clone())
    }
    async fn exec(
        &self,
        command: &str,
        workdir: Option<&str>,
        _timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError> {
        self.exec_calls.lock().unwrap().push((
            command.to_string(),
            workdir.unwrap_or_default().to_string(),
        ));
        Ok(self.exec_output.clone())
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
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        self.exec(command, None, None).await
    }
}

/// Provider that always returns the same handle.
pub(crate) struct FixedProvider(pub Arc<dyn SandboxHandle>);

#[async_trait]
impl SandboxProvider for FixedProvider {
    async fn ensure(&self, _: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        Ok(self.0.clone())
    }
    async fn create(
        &self,
        _: &str,
        _: &str,
        _: Option<&str>,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        Ok(self.0.clone())
    }
    async fn remove(&self, _: &str) -> Result<bool, SandboxError> {
        Ok(true)
    }
}

/// Tool context over the stub sandbox plus a fresh in-memory store with
/// one live thread.
pub(crate) async fn ctx_with(handle: Arc<dyn SandboxHandle>) -> (ToolContext, Arc<InMemoryStore>) {
    use crate::store::ThreadStore as _;

    let store = Arc::new(InMemoryStore::new());
    let thread_id = store.create_thread("acct-test").await.unwrap();
    let ctx = ToolContext {
        thread_id,
        project_id: "project-1".into(),
        sandbox: Arc::new(FixedProvider(handle)),
        threads: store.clone(),
        images: Arc::new(InlineImageStore),
    };
    (ctx, store)
}

/// Build kwargs from string pairs.
pub(crate) fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}
