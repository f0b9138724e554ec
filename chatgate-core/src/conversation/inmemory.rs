//! In-memory session store

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    ClientContext, ConversationConfig, ConversationStore, Message, Session, SessionId,
    SessionStats, SessionSummary, TitlePolicy,
};
use crate::error::{ChatError, Result};

type SharedSession = Arc<RwLock<Session>>;

/// Process-local [`ConversationStore`].
///
/// Maps are locked in the order `active` then `sessions`, and only for
/// lookups. Map guards are dropped before any per-session lock is awaited,
/// so message work on one session never blocks another.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    policy: TitlePolicy,
    sessions: RwLock<HashMap<SessionId, SharedSession>>,
    active: RwLock<HashMap<ClientContext, SessionId>>,
}

impl InMemoryConversationStore {
    pub fn new(config: &ConversationConfig) -> Self {
        Self {
            policy: TitlePolicy::from_config(config),
            sessions: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &TitlePolicy {
        &self.policy
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn lookup(&self, id: SessionId) -> Result<SharedSession> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))
    }

    async fn active_handle(&self, ctx: &ClientContext) -> Option<SharedSession> {
        let id = self.active.read().await.get(ctx).copied()?;
        self.sessions.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_session(&self, ctx: &ClientContext, title: Option<String>) -> Result<Session> {
        let session = match title.map(|t| t.trim().to_string()) {
            Some(title) if !title.is_empty() => Session::with_title(&self.policy, title),
            _ => Session::new(&self.policy),
        };
        let id = session.id();

        let mut active = self.active.write().await;
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(RwLock::new(session.clone())));
        active.insert(ctx.clone(), id);

        info!(session_id = %id, client = %ctx, "created session");
        Ok(session)
    }

    async fn get_active(&self, ctx: &ClientContext) -> Result<Session> {
        if let Some(current) = self.active_handle(ctx).await {
            let snapshot = current.read().await.clone();
            return Ok(snapshot);
        }

        // Re-checked under the write locks so two first requests of a client
        // cannot both create a session.
        let handle = {
            let mut active = self.active.write().await;
            let mut sessions = self.sessions.write().await;
            match active.get(ctx).and_then(|id| sessions.get(id)).cloned() {
                Some(existing) => existing,
                None => {
                    let session = Session::new(&self.policy);
                    let id = session.id();
                    let handle = Arc::new(RwLock::new(session));
                    sessions.insert(id, handle.clone());
                    active.insert(ctx.clone(), id);
                    info!(session_id = %id, client = %ctx, "created session on first use");
                    handle
                }
            }
        };
        let snapshot = handle.read().await.clone();
        Ok(snapshot)
    }

    async fn switch_active(&self, ctx: &ClientContext, id: SessionId) -> Result<Session> {
        let session = {
            let mut active = self.active.write().await;
            let session = self.lookup(id).await?;
            active.insert(ctx.clone(), id);
            session
        };

        debug!(session_id = %id, client = %ctx, "switched active session");
        let snapshot = session.read().await.clone();
        Ok(snapshot)
    }

    async fn get_session(&self, id: SessionId) -> Result<Session> {
        let session = self.lookup(id).await?;
        let snapshot = session.read().await.clone();
        Ok(snapshot)
    }

    async fn history(&self, id: SessionId) -> Result<Vec<Message>> {
        let session = self.lookup(id).await?;
        let messages = session.read().await.messages().to_vec();
        Ok(messages)
    }

    async fn append_message(&self, id: SessionId, message: Message) -> Result<()> {
        let session = self.lookup(id).await?;
        let mut guard = session.write().await;
        // A delete that won the race leaves this handle orphaned.
        if !self.sessions.read().await.contains_key(&id) {
            return Err(ChatError::SessionNotFound(id.to_string()));
        }
        guard.push(message, &self.policy);
        Ok(())
    }

    async fn rename_session(&self, id: SessionId, title: String) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::ValidationError(
                "Title must not be empty".to_string(),
            ));
        }

        let session = self.lookup(id).await?;
        if session.write().await.rename(title) {
            debug!(session_id = %id, %title, "renamed session");
        }
        Ok(())
    }

    async fn delete_session(&self, id: SessionId) -> Result<()> {
        let mut active = self.active.write().await;
        if self.sessions.write().await.remove(&id).is_none() {
            return Err(ChatError::SessionNotFound(id.to_string()));
        }
        active.retain(|_, current| *current != id);

        info!(session_id = %id, "deleted session");
        Ok(())
    }

    async fn clear_session(&self, id: SessionId) -> Result<usize> {
        let session = self.lookup(id).await?;
        let removed = session.write().await.clear();
        debug!(session_id = %id, removed, "cleared session");
        Ok(removed)
    }

    async fn list_sessions(
        &self,
        ctx: &ClientContext,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionSummary>> {
        let current = self.active.read().await.get(ctx).copied();
        let handles: Vec<SharedSession> = self.sessions.read().await.values().cloned().collect();

        let mut summaries: Vec<SessionSummary> =
            join_all(handles.iter().map(|handle| async move {
                let session = handle.read().await;
                session.summary(current == Some(session.id()))
            }))
            .await;
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(summaries.into_iter().skip(offset).take(limit).collect())
    }

    async fn session_stats(&self, id: SessionId) -> Result<SessionStats> {
        let session = self.lookup(id).await?;
        let stats = session.read().await.stats();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::TitleSource;
    use uuid::Uuid;

    fn ctx(name: &str) -> ClientContext {
        ClientContext::new(name)
    }

    #[tokio::test]
    async fn test_get_active_creates_once() {
        let store = InMemoryConversationStore::default();
        let first = store.get_active(&ctx("a")).await.unwrap();
        let second = store.get_active(&ctx("a")).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.title(), "New Chat");

        let other = store.get_active(&ctx("b")).await.unwrap();
        assert_ne!(first.id(), other.id());
        assert_eq!(store.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_create_and_switch() {
        let store = InMemoryConversationStore::default();
        let client = ctx("a");
        let first = store.create_session(&client, None).await.unwrap();
        let second = store
            .create_session(&client, Some("Trip planning".to_string()))
            .await
            .unwrap();
        assert_eq!(second.title_source(), TitleSource::User);
        assert_eq!(store.get_active(&client).await.unwrap().id(), second.id());

        store.switch_active(&client, first.id()).await.unwrap();
        assert_eq!(store.get_active(&client).await.unwrap().id(), first.id());

        let err = store.switch_active(&client, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(_)));
        assert_eq!(store.get_active(&client).await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_append_titles_and_rename_sticks() {
        let store = InMemoryConversationStore::default();
        let session = store.get_active(&ctx("a")).await.unwrap();
        let id = session.id();

        store.append_message(id, Message::user("Hello")).await.unwrap();
        assert_eq!(store.get_session(id).await.unwrap().title(), "Hello");

        store.rename_session(id, "Mine".to_string()).await.unwrap();
        store.clear_session(id).await.unwrap();
        store.append_message(id, Message::user("Something else")).await.unwrap();
        assert_eq!(store.get_session(id).await.unwrap().title(), "Mine");

        let err = store.rename_session(id, "  ".to_string()).await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_long_first_message_title() {
        let store = InMemoryConversationStore::default();
        let id = store.get_active(&ctx("a")).await.unwrap().id();
        let content = "x".repeat(80);
        store.append_message(id, Message::user(content)).await.unwrap();

        let title = store.get_session(id).await.unwrap().title().to_string();
        assert_eq!(title, format!("{}...", "x".repeat(50)));
    }

    #[tokio::test]
    async fn test_delete_active_session() {
        let store = InMemoryConversationStore::default();
        let client = ctx("a");
        let doomed = store.get_active(&client).await.unwrap().id();

        // A second client pointing at the same session loses its pointer too.
        store.switch_active(&ctx("b"), doomed).await.unwrap();
        store.delete_session(doomed).await.unwrap();

        assert!(matches!(
            store.get_session(doomed).await.unwrap_err(),
            ChatError::SessionNotFound(_)
        ));
        let fresh = store.get_active(&client).await.unwrap();
        assert_ne!(fresh.id(), doomed);
        assert_eq!(fresh.message_count(), 0);
        assert_ne!(store.get_active(&ctx("b")).await.unwrap().id(), doomed);

        assert!(store.delete_session(doomed).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_returns_removed_count() {
        let store = InMemoryConversationStore::default();
        let id = store.get_active(&ctx("a")).await.unwrap().id();
        store.append_message(id, Message::user("q")).await.unwrap();
        store.append_message(id, Message::assistant("a", "m")).await.unwrap();

        assert_eq!(store.clear_session(id).await.unwrap(), 2);
        assert!(store.history(id).await.unwrap().is_empty());
        assert_eq!(store.clear_session(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_sessions_ordering_and_paging() {
        let store = InMemoryConversationStore::default();
        let client = ctx("a");
        let oldest = store.create_session(&client, Some("one".into())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let middle = store.create_session(&client, Some("two".into())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newest = store.create_session(&client, Some("three".into())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Touching the oldest moves it to the front.
        store.append_message(oldest.id(), Message::user("bump")).await.unwrap();

        let listed = store.list_sessions(&client, 10, 0).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![oldest.id(), newest.id(), middle.id()]);
        assert!(listed[1].is_active);
        assert!(!listed[0].is_active);
        assert_eq!(listed[0].message_count, 1);

        let page = store.list_sessions(&client, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, newest.id());

        let stranger = store.list_sessions(&ctx("b"), 10, 0).await.unwrap();
        assert!(stranger.iter().all(|s| !s.is_active));
    }

    #[tokio::test]
    async fn test_stats_for_missing_session() {
        let store = InMemoryConversationStore::default();
        assert!(matches!(
            store.session_stats(Uuid::new_v4()).await.unwrap_err(),
            ChatError::SessionNotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_keep_per_writer_order() {
        let store = Arc::new(InMemoryConversationStore::default());
        let id = store.get_active(&ctx("a")).await.unwrap().id();

        let mut tasks = Vec::new();
        for writer in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for seq in 0..25 {
                    store
                        .append_message(id, Message::user(format!("{writer}:{seq}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 200);
        for writer in 0..8 {
            let seen: Vec<u32> = history
                .iter()
                .filter_map(|m| m.content.split_once(':'))
                .filter(|(w, _)| *w == writer.to_string())
                .map(|(_, seq)| seq.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..25).collect::<Vec<_>>());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_to_different_sessions() {
        let store = Arc::new(InMemoryConversationStore::default());
        let mut ids = Vec::new();
        for n in 0..6 {
            ids.push(store.get_active(&ctx(&format!("client-{n}"))).await.unwrap().id());
        }

        let tasks: Vec<_> = ids
            .iter()
            .copied()
            .map(|id| {
                let store = store.clone();
                tokio::spawn(async move {
                    for seq in 0..40 {
                        store
                            .append_message(id, Message::user(seq.to_string()))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        for id in ids {
            let seen: Vec<u32> = store
                .history(id)
                .await
                .unwrap()
                .iter()
                .map(|m| m.content.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..40).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_busy_session_does_not_block_other_clients() {
        let store = InMemoryConversationStore::default();
        let busy = store.get_active(&ctx("a")).await.unwrap().id();
        let other = store.get_active(&ctx("b")).await.unwrap().id();

        let handle = store.lookup(busy).await.unwrap();
        let _held = handle.write().await;

        let lookups = async {
            let active = store.get_active(&ctx("b")).await.unwrap();
            store.append_message(other, Message::user("hi")).await.unwrap();
            let fresh = store.get_active(&ctx("c")).await.unwrap();
            (active.id(), fresh.id())
        };
        let (active, fresh) = tokio::time::timeout(std::time::Duration::from_secs(1), lookups)
            .await
            .expect("other clients proceed while one session is locked");
        assert_eq!(active, other);
        assert_ne!(fresh, busy);
    }

    #[tokio::test]
    async fn test_append_after_delete_reports_missing_session() {
        let store = Arc::new(InMemoryConversationStore::default());
        let id = store.get_active(&ctx("a")).await.unwrap().id();

        // Hold the session so the append stalls after its lookup.
        let handle = store.lookup(id).await.unwrap();
        let held = handle.write().await;
        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.append_message(id, Message::assistant("late", "m")).await }
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        store.delete_session(id).await.unwrap();
        drop(held);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(_)));
    }
}
