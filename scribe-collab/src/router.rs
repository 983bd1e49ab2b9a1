//! Fixed topic namespace and typed publish helpers.
//!
//! The router never surfaces connectivity errors: `publish` answers with a
//! `bool`, and `subscribe` registers with the [`ConnectionManager`], which
//! keeps the callback attached to whichever broker is active.

use std::sync::Arc;

use serde::Serialize;

use crate::broker::{Callback, Subscription};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::protocol::{now_millis, to_payload, EditEnvelope, EditOperation, Message, Payload};

/// Every topic the system knows about. There is no dynamic discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    UserInputs,
    AiOutputs,
    UserFeedback,
    UserSessions,
    AllEvents,
    TemplateEdits,
    CollaborativeCursors,
    CursorUpdates,
}

impl Topic {
    /// Every topic, in a fixed order.
    pub const ALL: [Topic; 8] = [
        Topic::UserInputs,
        Topic::AiOutputs,
        Topic::UserFeedback,
        Topic::UserSessions,
        Topic::AllEvents,
        Topic::TemplateEdits,
        Topic::CollaborativeCursors,
        Topic::CursorUpdates,
    ];

    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::UserInputs => "user-inputs",
            Topic::AiOutputs => "ai-outputs",
            Topic::UserFeedback => "user-feedback",
            Topic::UserSessions => "user-sessions",
            Topic::AllEvents => "all-events",
            Topic::TemplateEdits => "template-edits",
            Topic::CollaborativeCursors => "collaborative-cursors",
            Topic::CursorUpdates => "cursor-updates",
        }
    }

    /// Look a topic up by its wire name.
    pub fn from_name(name: &str) -> Option<Topic> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish/subscribe front door used by sessions and host code.
#[derive(Clone)]
pub struct TopicRouter {
    connection: Arc<ConnectionManager>,
}

impl TopicRouter {
    /// Router over a shared connection manager.
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// The manager deciding which broker serves this router.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Publish a payload. `false` means nothing was sent.
    pub async fn publish(&self, topic: &str, payload: Payload) -> bool {
        if !self.connection.is_enabled() {
            return false;
        }
        if !self.connection.ensure_connected().await {
            return false;
        }
        let Some(broker) = self.connection.broker() else {
            return false;
        };

        match broker.publish(Message::new(topic, payload)).await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Publish to '{topic}' failed: {e}");
                false
            }
        }
    }

    /// Register a callback for one topic.
    ///
    /// The subscription follows the active broker across fallback and
    /// reconnects. It is inert only when the manager is disabled.
    pub async fn subscribe<F>(&self, topic: &str, callback: F) -> Subscription
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        self.connection.subscribe(topic, callback).await
    }

    /// Publish an edit on `template-edits`, wrapped with its document id.
    pub async fn send_template_edit(&self, edit: &EditOperation) -> bool {
        self.publish_record(Topic::TemplateEdits, &EditEnvelope::new(edit.clone()))
            .await
    }

    /// Publish a cursor message. Only `cursor-move` operations have that shape.
    pub async fn send_cursor_position(&self, cursor: &EditOperation) -> bool {
        if !cursor.is_cursor_move() {
            log::debug!("Refusing to publish a non cursor-move operation as a cursor");
            return false;
        }
        self.publish_record(Topic::CollaborativeCursors, cursor).await
    }

    /// Publish a record on `user-sessions`.
    pub async fn send_session<T: Serialize + ?Sized>(&self, record: &T) -> bool {
        self.publish_record(Topic::UserSessions, record).await
    }

    /// Publish a record on `user-feedback`.
    pub async fn send_feedback<T: Serialize + ?Sized>(&self, record: &T) -> bool {
        self.publish_record(Topic::UserFeedback, record).await
    }

    /// Publish a record on `user-inputs`.
    pub async fn send_user_input<T: Serialize + ?Sized>(&self, record: &T) -> bool {
        self.publish_record(Topic::UserInputs, record).await
    }

    /// Publish a record on `ai-outputs`.
    pub async fn send_ai_output<T: Serialize + ?Sized>(&self, record: &T) -> bool {
        self.publish_record(Topic::AiOutputs, record).await
    }

    /// Publish a record on `all-events`.
    pub async fn send_event<T: Serialize + ?Sized>(&self, record: &T) -> bool {
        self.publish_record(Topic::AllEvents, record).await
    }

    async fn publish_record<T: Serialize + ?Sized>(&self, topic: Topic, record: &T) -> bool {
        let mut payload = match to_payload(record) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Not publishing to '{topic}': {e}");
                return false;
            }
        };
        payload
            .entry("timestamp")
            .or_insert_with(|| serde_json::Value::from(now_millis()));
        self.publish(topic.as_str(), payload).await
    }
}
