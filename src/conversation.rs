//! Per-peer message history.
//!
//! Conversations are created lazily on first append and only ever grow.
//! Order is arrival order; embedded timestamps are never used to resequence.

use std::collections::HashMap;

use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::models::{Address, Conversation, ConversationSummary, Message};

struct Entry {
    conversation: Conversation,
    last_activity: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Address, Entry>,
    appends: u64,
}

impl Inner {
    fn summaries(&self) -> Vec<ConversationSummary> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        entries.iter().map(|e| e.conversation.summary()).collect()
    }
}

/// Store of every conversation, keyed by peer address.
pub struct ConversationStore {
    inner: RwLock<Inner>,
    updates: watch::Sender<Vec<ConversationSummary>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            inner: RwLock::new(Inner::default()),
            updates,
        }
    }

    /// Appends a message to the conversation with `peer`, creating it if needed.
    pub async fn append(&self, peer: &Address, message: Message) {
        let mut inner = self.inner.write().await;
        self.push(&mut inner, peer, message);
    }

    /// Appends unless the conversation with `peer` already holds a message
    /// with the same id. Check and append happen under one write lock.
    ///
    /// Returns whether the message was appended.
    pub async fn append_if_absent(&self, peer: &Address, message: Message) -> bool {
        let mut inner = self.inner.write().await;
        let present = inner
            .entries
            .get(peer)
            .is_some_and(|e| e.conversation.contains(&message.id));
        if present {
            return false;
        }
        self.push(&mut inner, peer, message);
        true
    }

    fn push(&self, inner: &mut Inner, peer: &Address, message: Message) {
        inner.appends += 1;
        let activity = inner.appends;

        let entry = inner.entries.entry(peer.clone()).or_insert_with(|| Entry {
            conversation: Conversation::new(peer.clone()),
            last_activity: 0,
        });
        debug!(peer = %peer, id = %message.id, transport = %message.transport, "appending message");
        entry.conversation.append(message);
        entry.last_activity = activity;

        // Published while still holding the write lock so observers see
        // updates in append order.
        self.updates.send_replace(inner.summaries());
    }

    /// Messages exchanged with `peer`, in append order.
    pub async fn get(&self, peer: &Address) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(peer)
            .map(|e| e.conversation.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn summary(&self, peer: &Address) -> Option<ConversationSummary> {
        let inner = self.inner.read().await;
        inner.entries.get(peer).map(|e| e.conversation.summary())
    }

    /// Every conversation, most recent activity first.
    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        self.inner.read().await.summaries()
    }

    /// Receiver that sees the summary list after every append.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.updates.subscribe()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
