//! Named many-to-many broadcast channels.
//!
//! Every member of a channel receives each message posted by every other member.
//! Posting is fire-and-forget; a member never receives its own posts.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

struct Member {
    id: u64,
    sender: UnboundedSender<Value>,
}

static CHANNELS: LazyLock<Mutex<HashMap<String, Vec<Member>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static NEXT_MEMBER_ID: AtomicU64 = AtomicU64::new(1);

/// One membership in a named channel. Leaving happens on drop.
pub struct BroadcastChannel {
    name: String,
    id: u64,
    inbox: UnboundedReceiver<Value>,
}

impl BroadcastChannel {
    pub fn join(name: &str) -> Self {
        let id = NEXT_MEMBER_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, inbox) = unbounded_channel();
        CHANNELS
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(Member { id, sender });
        Self {
            name: name.to_string(),
            id,
            inbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver to every other member. Returns the number of recipients.
    pub fn post(&self, message: Value) -> usize {
        deliver(&self.name, message, Some(self.id))
    }

    /// Wait for the next message. `None` once the membership has been revoked.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    /// Blocking form of [`recv`](Self::recv) for plain threads.
    pub fn blocking_recv(&mut self) -> Option<Value> {
        self.inbox.blocking_recv()
    }

    /// A handle that can revoke this membership from another thread
    pub fn membership(&self) -> Membership {
        Membership {
            name: self.name.clone(),
            id: self.id,
        }
    }
}

impl Drop for BroadcastChannel {
    fn drop(&mut self) {
        leave(&self.name, self.id);
    }
}

/// Revokes a membership; a blocked receiver then wakes with `None`
#[derive(Debug, Clone)]
pub struct Membership {
    name: String,
    id: u64,
}

impl Membership {
    pub fn revoke(&self) {
        leave(&self.name, self.id);
    }
}

/// Post to every member of `name` without joining it
pub fn publish(name: &str, message: Value) -> usize {
    deliver(name, message, None)
}

fn deliver(name: &str, message: Value, except: Option<u64>) -> usize {
    let mut channels = CHANNELS.lock();
    let Some(members) = channels.get_mut(name) else {
        return 0;
    };
    members.retain(|m| !m.sender.is_closed());
    members
        .iter()
        .filter(|m| Some(m.id) != except)
        .filter(|m| m.sender.send(message.clone()).is_ok())
        .count()
}

fn leave(name: &str, id: u64) {
    let mut channels = CHANNELS.lock();
    if let Some(members) = channels.get_mut(name) {
        members.retain(|m| m.id != id);
        if members.is_empty() {
            channels.remove(name);
        }
    }
}
