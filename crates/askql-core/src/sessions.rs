use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tokio::fs;
use tokio::sync::RwLock;

use askql_types::{title_from_query, Message, Session};

const SESSIONS_FILE: &str = "sessions.json";

/// Conversation sessions. Only finalized messages are appended; a run's
/// intermediate state never reaches the store.
pub struct SessionStore {
    base: Option<PathBuf>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub async fn open(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let file = base.join(SESSIONS_FILE);
        let sessions = if file.exists() {
            let raw = fs::read_to_string(&file).await?;
            serde_json::from_str::<HashMap<String, Session>>(&raw).unwrap_or_else(|err| {
                tracing::warn!("ignoring unreadable {}: {}", file.display(), err);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        tracing::info!("loaded {} sessions from {}", sessions.len(), base.display());
        Ok(Self {
            base: Some(base),
            sessions: RwLock::new(sessions),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            base: None,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(
        &self,
        title: Option<String>,
        data_source_ids: Vec<String>,
    ) -> anyhow::Result<Session> {
        let session = Session::new(title, data_source_ids);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.flush().await?;
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Looks up `id`, creating the session under that id when it is unknown.
    /// Without an id a fresh session titled after the question is created.
    pub async fn get_or_create(
        &self,
        id: Option<&str>,
        question: &str,
        data_source_ids: &[String],
    ) -> anyhow::Result<Session> {
        let id = id.map(str::trim).filter(|id| !id.is_empty());
        if let Some(existing) = match id {
            Some(id) => self.get(id).await,
            None => None,
        } {
            return Ok(existing);
        }
        let mut session = Session::new(Some(title_from_query(question)), data_source_ids.to_vec());
        if let Some(id) = id {
            session.id = id.to_string();
        }
        self.sessions
            .write()
            .await
            .entry(session.id.clone())
            .or_insert_with(|| session.clone());
        self.flush().await?;
        Ok(session)
    }

    pub async fn append_message(&self, session_id: &str, message: Message) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .context("session not found for append_message")?;
        session.messages.push(message);
        session.updated_at = Utc::now();
        drop(sessions);
        self.flush().await
    }

    /// Most recently updated first.
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let Some(base) = &self.base else {
            return Ok(());
        };
        let snapshot = self.sessions.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        let tmp = base.join(format!("{SESSIONS_FILE}.tmp"));
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, base.join(SESSIONS_FILE)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askql_types::MessageStatus;

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).await.expect("open");
        let session = store
            .get_or_create(None, "Total sales in 2024?", &["shop".to_string()])
            .await
            .expect("create");
        assert_eq!(session.title, "Total sales in 2024?");
        store
            .append_message(&session.id, Message::user("Total sales in 2024?"))
            .await
            .expect("append");

        let reopened = SessionStore::open(dir.path()).await.expect("reopen");
        let loaded = reopened.get(&session.id).await.expect("persisted");
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].status, MessageStatus::Sent);
        assert_eq!(loaded.data_source_ids, vec!["shop".to_string()]);
    }

    #[tokio::test]
    async fn unknown_id_is_adopted() {
        let store = SessionStore::in_memory();
        let session = store
            .get_or_create(Some("client-chosen"), "hi", &[])
            .await
            .expect("create");
        assert_eq!(session.id, "client-chosen");
        let again = store
            .get_or_create(Some("client-chosen"), "other", &[])
            .await
            .expect("get");
        assert_eq!(again.title, session.title);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn append_to_missing_session_fails() {
        let store = SessionStore::in_memory();
        assert!(store.append_message("nope", Message::user("x")).await.is_err());
    }
}
