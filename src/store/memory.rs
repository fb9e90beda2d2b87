//! In-process store used by tests and local single-node runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::sandbox::SandboxDescriptor;

use super::traits::{
    Message, MessageKind, Project, ProjectStore, StoreError, ThreadStore,
};

#[derive(Default)]
struct Inner {
    /// thread_id → (owning account, ordered messages)
    threads: HashMap<String, (String, Vec<Message>)>,
    projects: HashMap<String, Project>,
    /// Store-wide id counter; per-thread ids are therefore strictly
    /// increasing in insertion order.
    next_message_id: u64,
}

/// [`ThreadStore`] + [`ProjectStore`] over a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for InMemoryStore {
    async fn create_thread(&self, account_id: &str) -> Result<String, StoreError> {
        let thread_id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().await;
        inner
            .threads
            .insert(thread_id.clone(), (account_id.to_string(), Vec::new()));
        Ok(thread_id)
    }

    async fn thread_account(&self, thread_id: &str) -> Result<String, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .threads
            .get(thread_id)
            .map(|(account, _)| account.clone())
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))
    }

    async fn add_message(
        &self,
        thread_id: &str,
        kind: MessageKind,
        content: Value,
        is_llm_visible: bool,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_message_id += 1;
        let id = inner.next_message_id;
        let message = Message {
            id,
            thread_id: thread_id.to_string(),
            kind,
            content,
            is_llm_visible,
            created_at: Utc::now(),
        };
        let (_, messages) = inner
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        messages.push(message);
        Ok(id)
    }

    async fn latest_message(
        &self,
        thread_id: &str,
        kinds: &[MessageKind],
    ) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().await;
        let (_, messages) = inner
            .threads
            .get(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        Ok(messages
            .iter()
            .rev()
            .find(|m| kinds.contains(&m.kind))
            .cloned())
    }

    async fn visible_messages(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        let (_, messages) = inner
            .threads
            .get(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        Ok(messages
            .iter()
            .filter(|m| m.is_llm_visible)
            .cloned()
            .collect())
    }

    async fn delete_message(&self, message_id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for (_, messages) in inner.threads.values_mut() {
            if let Some(pos) = messages.iter().position(|m| m.id == message_id) {
                messages.remove(pos);
                return Ok(());
            }
        }
        Err(StoreError::MessageNotFound(message_id))
    }
}

#[async_trait]
impl ProjectStore for InMemoryStore {
    async fn create_project(&self, account_id: &str) -> Result<String, StoreError> {
        let project_id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().await;
        inner.projects.insert(
            project_id.clone(),
            Project {
                project_id: project_id.clone(),
                account_id: account_id.to_string(),
                sandbox: None,
            },
        );
        Ok(project_id)
    }

    async fn get_project(&self, project_id: &str) -> Result<Project, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))
    }

    async fn set_sandbox(
        &self,
        project_id: &str,
        descriptor: Option<SandboxDescriptor>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let project = inner
            .projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))?;
        project.sandbox = descriptor;
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn message_ids_increase_within_thread() {
        let store = InMemoryStore::new();
        let thread = store.create_thread("acct-1").await.unwrap();

        let a = store
            .add_message(&thread, MessageKind::User, json!({"content": "hi"}), true)
            .await
            .unwrap();
        let b = store
            .add_message(&thread, MessageKind::Assistant, json!({"content": "yo"}), true)
            .await
            .unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn latest_message_filters_by_kind() {
        let store = InMemoryStore::new();
        let thread = store.create_thread("acct-1").await.unwrap();
        store
            .add_message(&thread, MessageKind::User, json!({}), true)
            .await
            .unwrap();
        store
            .add_message(&thread, MessageKind::BrowserState, json!({}), false)
            .await
            .unwrap();

        let latest = store
            .latest_message(&thread, &[MessageKind::User, MessageKind::Assistant])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.kind, MessageKind::User);
    }

    #[tokio::test]
    async fn visible_messages_skips_hidden() {
        let store = InMemoryStore::new();
        let thread = store.create_thread("acct-1").await.unwrap();
        store
            .add_message(&thread, MessageKind::User, json!({"content": "a"}), true)
            .await
            .unwrap();
        store
            .add_message(&thread, MessageKind::ImageContext, json!({}), false)
            .await
            .unwrap();

        let visible = store.visible_messages(&thread).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].kind, MessageKind::User);
    }

    #[tokio::test]
    async fn delete_message_removes_record() {
        let store = InMemoryStore::new();
        let thread = store.create_thread("acct-1").await.unwrap();
        let id = store
            .add_message(&thread, MessageKind::ImageContext, json!({}), false)
            .await
            .unwrap();

        store.delete_message(id).await.unwrap();
        let latest = store
            .latest_message(&thread, &[MessageKind::ImageContext])
            .await
            .unwrap();
        assert!(latest.is_none());
        assert!(store.delete_message(id).await.is_err());
    }

    #[tokio::test]
    async fn project_sandbox_roundtrip() {
        let store = InMemoryStore::new();
        let project = store.create_project("acct-9").await.unwrap();
        assert!(store.get_project(&project).await.unwrap().sandbox.is_none());

        let descriptor = SandboxDescriptor::local("cont-1", "pw");
        store
            .set_sandbox(&project, Some(descriptor.clone()))
            .await
            .unwrap();
        let loaded = store.get_project(&project).await.unwrap();
        assert_eq!(loaded.sandbox.unwrap().id, descriptor.id);

        store.set_sandbox(&project, None).await.unwrap();
        assert!(store.get_project(&project).await.unwrap().sandbox.is_none());
    }
}
