//! A user's editing session on one shared document.
//!
//! ```text
//! host editor ──local_text_change()──► replace(0, len, text) ──► template-edits
//! host editor ──local_cursor_change()► cursor-move ────────────► collaborative-cursors
//!
//! template-edits ────────► apply_edit() ──► SessionEvent::RemoteEdit
//! collaborative-cursors ─► CursorTable ───► SessionEvent::CursorMoved
//! ```
//!
//! Local changes go out as whole-document replaces, so concurrent edits
//! resolve as last write wins. Our own edits come back through the topic and
//! are recognised by author plus a timestamp no newer than the last one sent.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::broker::{lock, Subscription};
use crate::error::Result;
use crate::presence::{CursorMarker, CursorTable};
use crate::protocol::{now_millis, EditEnvelope, EditKind, EditOperation, Message};
use crate::router::{Topic, TopicRouter};

/// Notifications for the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A collaborator changed the text; `text` is the full new document.
    RemoteEdit { author_id: String, text: String },
    CursorMoved(CursorMarker),
    /// Shown once per session when collaboration stops working.
    Warning(String),
}

struct SessionState {
    text: String,
    /// Origin of the last edit we published
    last_sent: Option<(String, i64)>,
    last_timestamp: i64,
    cursors: CursorTable,
    warned: bool,
}

impl SessionState {
    /// Strictly increasing per session, even within one millisecond.
    fn next_timestamp(&mut self) -> i64 {
        let ts = now_millis().max(self.last_timestamp + 1);
        self.last_timestamp = ts;
        ts
    }
}

/// One user's view of a shared document, kept in sync over the router.
pub struct CollaborationSession {
    router: TopicRouter,
    document_id: String,
    user_id: String,
    username: String,
    state: Arc<Mutex<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    subscriptions: Vec<Subscription>,
}

impl CollaborationSession {
    /// Subscribe to edits and cursors of `document_id` and announce our
    /// cursor at offset 0.
    pub async fn join(
        router: TopicRouter,
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        initial_text: impl Into<String>,
    ) -> Self {
        let document_id = document_id.into();
        let user_id = user_id.into();
        let (events, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SessionState {
            text: initial_text.into(),
            last_sent: None,
            last_timestamp: 0,
            cursors: CursorTable::new(document_id.clone(), user_id.clone()),
            warned: false,
        }));

        let edits = {
            let state = state.clone();
            let events = events.clone();
            let document_id = document_id.clone();
            router
                .subscribe(Topic::TemplateEdits.as_str(), move |message: &Message| {
                    on_remote_edit(&state, &events, &document_id, message)
                })
                .await
        };
        let cursors = {
            let state = state.clone();
            let events = events.clone();
            router
                .subscribe(Topic::CollaborativeCursors.as_str(), move |message: &Message| {
                    on_remote_cursor(&state, &events, message)
                })
                .await
        };

        let session = Self {
            router,
            document_id,
            user_id,
            username: username.into(),
            state,
            events,
            event_rx: Some(event_rx),
            subscriptions: vec![edits, cursors],
        };
        log::info!(
            "User {} joined document {}",
            session.user_id,
            session.document_id
        );
        session.local_cursor_change(0).await;
        session
    }

    /// Document this session edits.
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Local user.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current document text.
    pub fn text(&self) -> String {
        lock(&self.state).text.clone()
    }

    /// Remote cursors, sorted by user id.
    pub fn cursors(&self) -> Vec<CursorMarker> {
        lock(&self.state).cursors.markers()
    }

    /// Event stream for the host UI. Can be taken once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// The local editor now shows `new_text`. Publishes a whole-document
    /// replace; returns whether it was sent.
    pub async fn local_text_change(&self, new_text: impl Into<String>) -> bool {
        let new_text = new_text.into();
        let edit = {
            let mut state = lock(&self.state);
            if state.text == new_text {
                return true;
            }
            let timestamp = state.next_timestamp();
            let edit = EditOperation {
                document_id: self.document_id.clone(),
                author_id: self.user_id.clone(),
                author_name: self.username.clone(),
                timestamp,
                kind: EditKind::Replace {
                    position: 0,
                    length: state.text.chars().count(),
                    content: new_text.clone(),
                },
            };
            state.text = new_text;
            state.last_sent = Some((self.user_id.clone(), timestamp));
            edit
        };

        let sent = self.router.send_template_edit(&edit).await;
        if !sent {
            self.warn_once("Changes could not be shared with collaborators");
        }
        sent
    }

    /// The local caret moved to character `offset`.
    pub async fn local_cursor_change(&self, offset: usize) -> bool {
        let timestamp = lock(&self.state).next_timestamp();
        let cursor = EditOperation {
            document_id: self.document_id.clone(),
            author_id: self.user_id.clone(),
            author_name: self.username.clone(),
            timestamp,
            kind: EditKind::CursorMove {
                cursor_position: offset,
            },
        };

        let sent = self.router.send_cursor_position(&cursor).await;
        if !sent {
            self.warn_once("Cursor position could not be shared with collaborators");
        }
        sent
    }

    /// Stop receiving edits and cursors. Idempotent.
    pub fn leave(&self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }

    fn warn_once(&self, text: &str) {
        let mut state = lock(&self.state);
        if state.warned {
            return;
        }
        state.warned = true;
        log::warn!("{text} (document {})", self.document_id);
        let _ = self.events.send(SessionEvent::Warning(text.to_string()));
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        self.leave();
    }
}

fn on_remote_edit(
    state: &Mutex<SessionState>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    document_id: &str,
    message: &Message,
) -> Result<()> {
    let envelope: EditEnvelope = message.decode()?;
    if envelope.template_id != document_id || envelope.edit.is_cursor_move() {
        return Ok(());
    }
    let edit = envelope.edit;

    let text = {
        let mut state = lock(state);
        let (author, timestamp) = edit.origin();
        // Our timestamps only grow, so any own edit at or before the last
        // one sent is an echo, including ones overtaken by a newer edit.
        if state
            .last_sent
            .as_ref()
            .is_some_and(|(a, t)| a == author && timestamp <= *t)
        {
            log::trace!("Ignoring echo of our own edit at {timestamp}");
            return Ok(());
        }
        state.text = apply_edit(&state.text, &edit.kind);
        state.text.clone()
    };

    let _ = events.send(SessionEvent::RemoteEdit {
        author_id: edit.author_id,
        text,
    });
    Ok(())
}

fn on_remote_cursor(
    state: &Mutex<SessionState>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    message: &Message,
) -> Result<()> {
    let cursor: EditOperation = message.decode()?;
    let marker = lock(state).cursors.apply(&cursor).cloned();
    if let Some(marker) = marker {
        let _ = events.send(SessionEvent::CursorMoved(marker));
    }
    Ok(())
}

/// Apply a text-changing edit to `text`. Offsets count characters and are
/// clamped to the text; cursor moves leave the text unchanged.
pub fn apply_edit(text: &str, kind: &EditKind) -> String {
    let chars: Vec<char> = text.chars().collect();
    let splice = |position: usize, length: usize, content: &str| {
        let start = position.min(chars.len());
        let end = start.saturating_add(length).min(chars.len());
        let mut out: String = chars[..start].iter().collect();
        out.push_str(content);
        out.extend(&chars[end..]);
        out
    };

    match kind {
        EditKind::Insert { position, content } => splice(*position, 0, content),
        EditKind::Delete { position, length } => splice(*position, *length, ""),
        EditKind::Replace {
            position,
            length,
            content,
        } => splice(*position, *length, content),
        EditKind::CursorMove { .. } => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::connection::ConnectionManager;
    use crate::presence::cursor_color;

    fn local_router() -> TopicRouter {
        TopicRouter::new(Arc::new(ConnectionManager::new(BrokerConfig::default())))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_apply_insert_and_delete() {
        let insert = EditKind::Insert {
            position: 1,
            content: "X".into(),
        };
        assert_eq!(apply_edit("ABC", &insert), "AXBC");

        let delete = EditKind::Delete {
            position: 1,
            length: 2,
        };
        assert_eq!(apply_edit("ABCDE", &delete), "ADE");
    }

    #[test]
    fn test_apply_clamps_and_counts_chars() {
        let past_end = EditKind::Insert {
            position: 99,
            content: "!".into(),
        };
        assert_eq!(apply_edit("ab", &past_end), "ab!");

        let long_delete = EditKind::Delete {
            position: 1,
            length: usize::MAX,
        };
        assert_eq!(apply_edit("héllo", &long_delete), "h");

        let replace = EditKind::Replace {
            position: 0,
            length: 2,
            content: "Ü".into(),
        };
        assert_eq!(apply_edit("äöx", &replace), "Üx");

        let cursor = EditKind::CursorMove { cursor_position: 1 };
        assert_eq!(apply_edit("same", &cursor), "same");
    }

    #[tokio::test]
    async fn test_remote_edit_applied_and_echo_suppressed() {
        let router = local_router();
        let mut alice = CollaborationSession::join(router.clone(), "doc", "alice", "Alice", "").await;
        let mut bob = CollaborationSession::join(router.clone(), "doc", "bob", "Bob", "").await;
        let mut alice_rx = alice.take_event_rx().unwrap();
        let mut bob_rx = bob.take_event_rx().unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        assert!(alice.local_text_change("hello").await);

        assert_eq!(bob.text(), "hello");
        assert_eq!(
            drain(&mut bob_rx),
            vec![SessionEvent::RemoteEdit {
                author_id: "alice".into(),
                text: "hello".into()
            }]
        );
        // Alice's own edit came back through the topic and was dropped.
        assert_eq!(alice.text(), "hello");
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_whole_document_replace_shape() {
        let router = local_router();
        let session = CollaborationSession::join(router.clone(), "doc", "u1", "Ann", "abc").await;
        session.local_text_change("abcd").await;
        session.local_text_change("xy").await;

        let local = router.connection().local_broker();
        let edits: Vec<EditEnvelope> = local
            .messages("template-edits")
            .iter()
            .map(|m| m.decode().unwrap())
            .collect();
        assert_eq!(edits.len(), 2);
        assert_eq!(
            edits[1].edit.kind,
            EditKind::Replace {
                position: 0,
                length: 4,
                content: "xy".into()
            }
        );
        assert!(edits[1].edit.timestamp > edits[0].edit.timestamp);
    }

    #[tokio::test]
    async fn test_other_documents_ignored() {
        let router = local_router();
        let reader = CollaborationSession::join(router.clone(), "doc-a", "r", "R", "keep").await;
        let writer = CollaborationSession::join(router.clone(), "doc-b", "w", "W", "").await;

        writer.local_text_change("changed").await;
        writer.local_cursor_change(3).await;

        assert_eq!(reader.text(), "keep");
        assert!(reader.cursors().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_announce_and_move() {
        let router = local_router();
        let mut alice = CollaborationSession::join(router.clone(), "doc", "alice", "Alice", "").await;
        let mut alice_rx = alice.take_event_rx().unwrap();
        let bob = CollaborationSession::join(router.clone(), "doc", "bob", "Bob", "").await;

        // Bob's join announced cursor 0.
        let markers = alice.cursors();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].user_id, "bob");
        assert_eq!(markers[0].position, 0);
        assert_eq!(markers[0].color, cursor_color("bob"));

        drain(&mut alice_rx);
        bob.local_cursor_change(12).await;
        let events = drain(&mut alice_rx);
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::CursorMoved(m)] if m.position == 12 && m.username == "Bob"
        ));
        // Own cursor is never tracked.
        assert!(bob.cursors().iter().all(|m| m.user_id != "bob"));
    }

    #[tokio::test]
    async fn test_single_warning_when_publishing_fails() {
        let manager = Arc::new(ConnectionManager::new(BrokerConfig {
            enabled: false,
            ..BrokerConfig::default()
        }));
        let mut session =
            CollaborationSession::join(TopicRouter::new(manager), "doc", "u", "U", "").await;
        let mut rx = session.take_event_rx().unwrap();

        assert!(!session.local_text_change("one").await);
        assert!(!session.local_text_change("two").await);
        assert!(!session.local_cursor_change(1).await);

        // Editing continues locally.
        assert_eq!(session.text(), "two");
        let warnings: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Warning(_)))
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_stops_updates() {
        let router = local_router();
        let reader = CollaborationSession::join(router.clone(), "doc", "r", "R", "").await;
        let writer = CollaborationSession::join(router.clone(), "doc", "w", "W", "").await;

        reader.leave();
        reader.leave();
        writer.local_text_change("after leave").await;

        assert_eq!(reader.text(), "");
        assert_eq!(router.connection().local_broker().subscriber_count("template-edits"), 1);
    }

    #[tokio::test]
    async fn test_overtaken_echo_is_not_reapplied() {
        let router = local_router();
        let alice = CollaborationSession::join(router.clone(), "doc", "alice", "Alice", "").await;
        alice.local_text_change("a").await;
        alice.local_text_change("ab").await;

        // Replay the first edit as if the relay delivered it late.
        let first: EditEnvelope = router.connection().local_broker().messages("template-edits")[0]
            .decode()
            .unwrap();
        assert!(router.send_template_edit(&first.edit).await);

        assert_eq!(alice.text(), "ab");
    }
}
