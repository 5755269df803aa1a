//! In-memory blob registry behind `URL.createObjectURL`.
//!
//! Each context owns one [`BlobStore`]. Other contexts can never see the store
//! directly; they read entries through the broadcast protocol in [`resolver`],
//! answered by a responder thread that lives as long as the store.

pub mod broadcast;
pub mod resolver;

use broadcast::{BroadcastChannel, Membership};
use parking_lot::RwLock;
use resolver::{ContentRequest, ContentResponse, REQUEST_CHANNEL, RESPONSE_CHANNEL};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, warn};

pub const BLOB_SCHEME: &str = "blob:";

/// Prefix of every URL this crate hands out
pub const BLOB_URL_PREFIX: &str = "blob:spindle/";

#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub content: String,
    pub content_type: String,
}

type Entries = Arc<RwLock<HashMap<String, BlobEntry>>>;

pub struct BlobStore {
    entries: Entries,
    responder: Option<Membership>,
}

impl BlobStore {
    /// Create a store and start answering requests for its entries
    pub fn new() -> Self {
        let entries: Entries = Arc::default();
        let responder = spawn_responder(Arc::downgrade(&entries));
        Self { entries, responder }
    }

    pub fn create_object_url(&self, content: &str, content_type: &str) -> String {
        let url = format!("{BLOB_URL_PREFIX}{}", uuid::Uuid::new_v4());
        self.entries.write().insert(
            url.clone(),
            BlobEntry {
                content: content.to_string(),
                content_type: content_type.to_string(),
            },
        );
        debug!(%url, bytes = content.len(), "registered blob");
        url
    }

    pub fn revoke_object_url(&self, url: &str) -> bool {
        self.entries.write().remove(url).is_some()
    }

    pub fn get(&self, url: &str) -> Option<BlobEntry> {
        self.entries.read().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        if let Some(responder) = &self.responder {
            responder.revoke();
        }
    }
}

fn spawn_responder(entries: Weak<RwLock<HashMap<String, BlobEntry>>>) -> Option<Membership> {
    let mut requests = BroadcastChannel::join(REQUEST_CHANNEL);
    let membership = requests.membership();
    let spawned = thread::Builder::new()
        .name("spindle-blob-responder".into())
        .spawn(move || {
            while let Some(message) = requests.blocking_recv() {
                let Ok(ContentRequest { token }) = serde_json::from_value(message) else {
                    continue;
                };
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let content = entries.read().get(&token).map(|e| e.content.clone());
                if let Some(content) = content {
                    match serde_json::to_value(ContentResponse { token, content }) {
                        Ok(response) => {
                            broadcast::publish(RESPONSE_CHANNEL, response);
                        }
                        Err(e) => warn!("could not encode blob response: {e}"),
                    }
                }
            }
        });
    match spawned {
        Ok(_) => Some(membership),
        Err(e) => {
            warn!("blob responder not started, entries are local only: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_revoke() {
        let store = BlobStore::new();
        let url = store.create_object_url("export default 1", "text/javascript");
        assert!(url.starts_with(BLOB_URL_PREFIX));
        assert_eq!(store.get(&url).unwrap().content, "export default 1");
        assert_eq!(store.len(), 1);

        assert!(store.revoke_object_url(&url));
        assert!(!store.revoke_object_url(&url));
        assert!(store.is_empty());
    }

    #[test]
    fn test_urls_are_unique() {
        let store = BlobStore::new();
        let a = store.create_object_url("same", "text/plain");
        let b = store.create_object_url("same", "text/plain");
        assert_ne!(a, b);
    }
}
