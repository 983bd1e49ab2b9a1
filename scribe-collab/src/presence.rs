//! Remote cursor markers for a document.
//!
//! ```text
//! collaborative-cursors ──► CollaborationSession ──► CursorTable::apply()
//!                                                          │
//!                                                          ▼
//!                                             host UI draws CursorMarkers
//! ```
//!
//! A marker's color depends only on the user id, so a collaborator keeps
//! the same color across reconnects and across sessions in one process.

use std::collections::HashMap;

use serde::Serialize;

use crate::protocol::{EditKind, EditOperation};

/// Fixed marker palette (hex RGB).
pub const CURSOR_PALETTE: [&str; 8] = [
    "#E6194B", "#3CB44B", "#4363D8", "#F58231", "#911EB4", "#42D4F4", "#F032E6", "#BFEF45",
];

/// Stable marker color for a user id (FNV-1a into [`CURSOR_PALETTE`]).
pub fn cursor_color(user_id: &str) -> &'static str {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let hash = user_id
        .bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u32).wrapping_mul(FNV_PRIME));
    CURSOR_PALETTE[hash as usize % CURSOR_PALETTE.len()]
}

/// Where a remote collaborator's cursor sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMarker {
    /// Document the cursor is in
    pub document_id: String,
    /// Collaborator owning the cursor
    pub user_id: String,
    /// Display name shown next to the caret
    pub username: String,
    /// Character offset into the document
    pub position: usize,
    /// Palette entry derived from `user_id`
    pub color: &'static str,
    /// Sender timestamp of the last applied move
    #[serde(skip)]
    last_timestamp: i64,
}

impl CursorMarker {
    /// Marker with the user's palette color.
    pub fn new(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        position: usize,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            color: cursor_color(&user_id),
            document_id: document_id.into(),
            user_id,
            username: username.into(),
            position,
            last_timestamp: 0,
        }
    }
}

/// Remote cursor markers of one document, one per user.
#[derive(Debug, Clone)]
pub struct CursorTable {
    document_id: String,
    local_user_id: String,
    markers: HashMap<String, CursorMarker>,
}

impl CursorTable {
    /// Empty table for `document_id`; cursors of `local_user_id` are never
    /// tracked.
    pub fn new(document_id: impl Into<String>, local_user_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            local_user_id: local_user_id.into(),
            markers: HashMap::new(),
        }
    }

    /// Apply a cursor-move. Returns the updated marker, or `None` when the
    /// operation is ignored (own cursor, other document, not a move, stale).
    pub fn apply(&mut self, op: &EditOperation) -> Option<&CursorMarker> {
        let EditKind::CursorMove { cursor_position } = op.kind else {
            return None;
        };
        if op.author_id == self.local_user_id || op.document_id != self.document_id {
            return None;
        }

        let marker = self
            .markers
            .entry(op.author_id.clone())
            .or_insert_with(|| {
                CursorMarker::new(&op.document_id, &op.author_id, &op.author_name, cursor_position)
            });

        // Reject stale updates (sender timestamps are monotonic per user)
        if op.timestamp < marker.last_timestamp {
            return None;
        }
        marker.position = cursor_position;
        marker.username = op.author_name.clone();
        marker.last_timestamp = op.timestamp;
        Some(&*marker)
    }

    /// Forget a collaborator's cursor.
    pub fn remove(&mut self, user_id: &str) -> Option<CursorMarker> {
        self.markers.remove(user_id)
    }

    /// Current marker of one collaborator.
    pub fn get(&self, user_id: &str) -> Option<&CursorMarker> {
        self.markers.get(user_id)
    }

    /// Markers sorted by user id (stable draw order).
    pub fn markers(&self) -> Vec<CursorMarker> {
        let mut markers: Vec<CursorMarker> = self.markers.values().cloned().collect();
        markers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        markers
    }

    /// Number of tracked collaborators.
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// Whether no remote cursor is tracked.
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moved(user: &str, position: usize, timestamp: i64) -> EditOperation {
        EditOperation {
            document_id: "doc".into(),
            author_id: user.into(),
            author_name: format!("{user}-name"),
            timestamp,
            kind: EditKind::CursorMove {
                cursor_position: position,
            },
        }
    }

    #[test]
    fn test_color_is_pure_function_of_user() {
        assert_eq!(cursor_color("alice"), cursor_color("alice"));
        assert!(CURSOR_PALETTE.contains(&cursor_color("bob")));
        assert!(CURSOR_PALETTE.contains(&cursor_color("")));
    }

    #[test]
    fn test_colors_spread_over_palette() {
        let distinct: std::collections::HashSet<&str> =
            (0..64).map(|i| cursor_color(&format!("user-{i}"))).collect();
        assert!(distinct.len() > 4, "only {} colors used", distinct.len());
    }

    #[test]
    fn test_latest_position_overwrites() {
        let mut table = CursorTable::new("doc", "me");
        table.apply(&moved("bob", 3, 1));
        table.apply(&moved("bob", 9, 2));

        assert_eq!(table.len(), 1);
        let marker = table.get("bob").unwrap();
        assert_eq!(marker.position, 9);
        assert_eq!(marker.color, cursor_color("bob"));
        assert_eq!(marker.username, "bob-name");
    }

    #[test]
    fn test_rejects_stale_own_and_foreign() {
        let mut table = CursorTable::new("doc", "me");
        table.apply(&moved("bob", 5, 10));
        assert!(table.apply(&moved("bob", 1, 9)).is_none());
        assert_eq!(table.get("bob").unwrap().position, 5);

        assert!(table.apply(&moved("me", 1, 1)).is_none());

        let other_doc = EditOperation {
            document_id: "other".into(),
            ..moved("carol", 2, 1)
        };
        assert!(table.apply(&other_doc).is_none());

        let insert = EditOperation {
            kind: EditKind::Insert {
                position: 0,
                content: "x".into(),
            },
            ..moved("carol", 0, 1)
        };
        assert!(table.apply(&insert).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_markers_sorted_and_removable() {
        let mut table = CursorTable::new("doc", "me");
        table.apply(&moved("zed", 1, 1));
        table.apply(&moved("amy", 2, 1));

        let ids: Vec<String> = table.markers().into_iter().map(|m| m.user_id).collect();
        assert_eq!(ids, vec!["amy", "zed"]);

        assert!(table.remove("amy").is_some());
        assert!(table.remove("amy").is_none());
        assert_eq!(table.len(), 1);
    }
}
