use std::collections::HashMap;
use std::time::{Duration, Instant};

use cp_base::{DocumentId, UserId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::connection::ClientId;

/// Round-robin palette assigned to joining users per document.
const DEFAULT_COLORS: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F",
    "#BB8FCE", "#85C1E9",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined,
    Left,
    Idle,
    Stale,
    CursorMoved,
    TypingChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub document_id: DocumentId,
    pub client_id: ClientId,
    pub user_name: String,
    pub user_color: String,
    pub cursor_position: Option<u64>,
    pub selection_start: Option<u64>,
    pub selection_end: Option<u64>,
    #[serde(skip, default = "Instant::now")]
    pub joined_at: Instant,
    #[serde(skip, default = "Instant::now")]
    pub last_activity: Instant,
    pub is_active: bool,
    pub is_typing: bool,
}

struct DocumentPresence {
    users: HashMap<ClientId, UserPresence>,
    next_color: usize,
}

impl Default for DocumentPresence {
    fn default() -> Self {
        Self { users: HashMap::new(), next_color: 0 }
    }
}

/// Per-document presence roster, with idle/stale sweeps driven by a
/// background loop in the gateway.
pub struct PresenceManager {
    documents: DashMap<DocumentId, Mutex<DocumentPresence>>,
    idle_timeout: Duration,
    stale_timeout: Duration,
}

impl PresenceManager {
    pub fn new(idle_timeout: Duration, stale_timeout: Duration) -> Self {
        Self { documents: DashMap::new(), idle_timeout, stale_timeout }
    }

    /// Registers a user in a document, assigning the next color in the
    /// round-robin palette for that document.
    pub fn join(
        &self,
        document_id: DocumentId,
        client_id: ClientId,
        user_id: UserId,
        user_name: Option<String>,
    ) -> UserPresence {
        let entry = self.documents.entry(document_id.clone()).or_default();
        let mut doc = entry.lock();
        let color = DEFAULT_COLORS[doc.next_color % DEFAULT_COLORS.len()].to_string();
        doc.next_color += 1;
        let now = Instant::now();
        let presence = UserPresence {
            user_id,
            document_id,
            client_id,
            user_name: user_name.unwrap_or_else(|| format!("User {}", &user_id.to_string()[..8])),
            user_color: color,
            cursor_position: None,
            selection_start: None,
            selection_end: None,
            joined_at: now,
            last_activity: now,
            is_active: true,
            is_typing: false,
        };
        doc.users.insert(client_id, presence.clone());
        presence
    }

    pub fn leave(&self, document_id: &DocumentId, client_id: ClientId) -> Option<UserPresence> {
        let removed = {
            let entry = self.documents.get(document_id)?;
            let mut doc = entry.lock();
            doc.users.remove(&client_id)
        };
        if let Some(entry) = self.documents.get(document_id) {
            if entry.lock().users.is_empty() {
                drop(entry);
                self.documents.remove(document_id);
            }
        }
        removed
    }

    pub fn update_cursor(
        &self,
        document_id: &DocumentId,
        client_id: ClientId,
        position: u64,
        selection: Option<(u64, u64)>,
    ) -> Option<UserPresence> {
        let entry = self.documents.get(document_id)?;
        let mut doc = entry.lock();
        let presence = doc.users.get_mut(&client_id)?;
        presence.cursor_position = Some(position);
        presence.selection_start = selection.map(|s| s.0);
        presence.selection_end = selection.map(|s| s.1);
        presence.last_activity = Instant::now();
        Some(presence.clone())
    }

    pub fn set_typing(&self, document_id: &DocumentId, client_id: ClientId, is_typing: bool) -> Option<UserPresence> {
        let entry = self.documents.get(document_id)?;
        let mut doc = entry.lock();
        let presence = doc.users.get_mut(&client_id)?;
        presence.is_typing = is_typing;
        presence.last_activity = Instant::now();
        Some(presence.clone())
    }

    pub fn mark_activity(&self, document_id: &DocumentId, client_id: ClientId) {
        if let Some(entry) = self.documents.get(document_id) {
            let mut doc = entry.lock();
            if let Some(presence) = doc.users.get_mut(&client_id) {
                presence.last_activity = Instant::now();
                presence.is_active = true;
            }
        }
    }

    pub fn document_presence(&self, document_id: &DocumentId) -> Vec<UserPresence> {
        self.documents
            .get(document_id)
            .map(|entry| entry.lock().users.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes entries whose `last_activity` is older than
    /// `stale_timeout`, returning the removed presences for a
    /// `PresenceEvent::Stale` broadcast.
    pub fn cleanup_stale(&self) -> Vec<UserPresence> {
        let mut removed = Vec::new();
        for entry in self.documents.iter() {
            let mut doc = entry.value().lock();
            let cutoff = Instant::now().checked_sub(self.stale_timeout).unwrap_or(Instant::now());
            let stale: Vec<ClientId> = doc
                .users
                .iter()
                .filter(|(_, p)| p.last_activity < cutoff)
                .map(|(id, _)| *id)
                .collect();
            for client_id in stale {
                if let Some(presence) = doc.users.remove(&client_id) {
                    removed.push(presence);
                }
            }
        }
        self.documents.retain(|_, entry| !entry.lock().users.is_empty());
        removed
    }

    /// Marks active users whose `last_activity` exceeds `idle_timeout`
    /// as inactive, returning the newly-idle presences.
    pub fn mark_idle_users(&self) -> Vec<UserPresence> {
        let mut went_idle = Vec::new();
        let cutoff = Instant::now().checked_sub(self.idle_timeout).unwrap_or(Instant::now());
        for entry in self.documents.iter() {
            let mut doc = entry.value().lock();
            for presence in doc.users.values_mut() {
                if presence.is_active && presence.last_activity < cutoff {
                    presence.is_active = false;
                    went_idle.push(presence.clone());
                }
            }
        }
        went_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_colors_round_robin_per_document() {
        let manager = PresenceManager::new(Duration::from_secs(300), Duration::from_secs(60));
        let doc = DocumentId::new("d1");
        let mut colors = Vec::new();
        for _ in 0..12 {
            let p = manager.join(doc.clone(), ClientId::new(), UserId::new(), None);
            colors.push(p.user_color);
        }
        assert_eq!(colors[0], DEFAULT_COLORS[0]);
        assert_eq!(colors[10], DEFAULT_COLORS[0]);
        assert_eq!(colors[9], DEFAULT_COLORS[9]);
    }

    #[test]
    fn leave_removes_empty_document_entries() {
        let manager = PresenceManager::new(Duration::from_secs(300), Duration::from_secs(60));
        let doc = DocumentId::new("d1");
        let client = ClientId::new();
        manager.join(doc.clone(), client, UserId::new(), None);
        manager.leave(&doc, client);
        assert!(manager.document_presence(&doc).is_empty());
        assert!(!manager.documents.contains_key(&doc));
    }

    #[test]
    fn default_name_uses_the_first_eight_characters_of_the_user_id() {
        let manager = PresenceManager::new(Duration::from_secs(300), Duration::from_secs(60));
        let doc = DocumentId::new("d1");
        let user = UserId::new();
        let presence = manager.join(doc, ClientId::new(), user, None);
        assert_eq!(presence.user_name, format!("User {}", &user.to_string()[..8]));
    }

    #[test]
    fn mark_idle_users_flips_is_active_after_the_idle_timeout() {
        let manager = PresenceManager::new(Duration::from_millis(10), Duration::from_secs(300));
        let doc = DocumentId::new("d1");
        let client = ClientId::new();
        let mut presence = manager.join(doc.clone(), client, UserId::new(), None);
        presence.last_activity = Instant::now() - Duration::from_millis(50);
        {
            let entry = manager.documents.get(&doc).unwrap();
            entry.lock().users.insert(client, presence);
        }
        let idle = manager.mark_idle_users();
        assert_eq!(idle.len(), 1);
        assert!(!idle[0].is_active);
    }
}
