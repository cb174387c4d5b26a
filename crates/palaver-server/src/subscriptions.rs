//! Subscription table for message-delivery streams.
//!
//! Maps usernames to the connections streaming their messages. The apply
//! loop holds the mutex only long enough to collect the targets for one
//! delivery; it never owns the table.

use std::collections::HashMap;
use std::sync::Mutex;

use mio::Token;
use palaver_types::Username;

/// Active `StreamMessages` subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    inner: Mutex<HashMap<Username, Vec<Token>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for a user's messages.
    pub fn subscribe(&self, username: &str, token: Token) {
        let mut table = self.inner.lock().expect("subscription table poisoned");
        let subs = table.entry(username.to_string()).or_default();
        if !subs.contains(&token) {
            subs.push(token);
        }
    }

    /// Connections currently subscribed to a user.
    pub fn subscribers(&self, username: &str) -> Vec<Token> {
        let table = self.inner.lock().expect("subscription table poisoned");
        table.get(username).cloned().unwrap_or_default()
    }

    /// Removes every subscription held by a connection (on disconnect).
    pub fn drop_connection(&self, token: Token) {
        let mut table = self.inner.lock().expect("subscription table poisoned");
        table.retain(|_, subs| {
            subs.retain(|t| *t != token);
            !subs.is_empty()
        });
    }

    /// Removes all subscriptions for a user (account deleted).
    pub fn drop_user(&self, username: &str) -> Vec<Token> {
        let mut table = self.inner.lock().expect("subscription table poisoned");
        table.remove(username).unwrap_or_default()
    }

    /// Empties the table, returning every subscribed connection.
    ///
    /// Used on leader change: subscriptions are invalidated and clients
    /// reconnect.
    pub fn drain_all(&self) -> Vec<Token> {
        let mut table = self.inner.lock().expect("subscription table poisoned");
        let mut tokens: Vec<Token> = table.values().flatten().copied().collect();
        table.clear();
        tokens.sort_by_key(|t| t.0);
        tokens.dedup();
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_deliver_targets() {
        let table = SubscriptionTable::new();
        table.subscribe("bob", Token(1));
        table.subscribe("bob", Token(2));
        table.subscribe("bob", Token(1)); // duplicate ignored
        assert_eq!(table.subscribers("bob"), vec![Token(1), Token(2)]);
        assert!(table.subscribers("alice").is_empty());
    }

    #[test]
    fn disconnect_removes_everywhere() {
        let table = SubscriptionTable::new();
        table.subscribe("bob", Token(1));
        table.subscribe("alice", Token(1));
        table.subscribe("alice", Token(2));
        table.drop_connection(Token(1));
        assert!(table.subscribers("bob").is_empty());
        assert_eq!(table.subscribers("alice"), vec![Token(2)]);
    }

    #[test]
    fn drain_reports_each_connection_once() {
        let table = SubscriptionTable::new();
        table.subscribe("bob", Token(1));
        table.subscribe("alice", Token(1));
        table.subscribe("alice", Token(2));
        assert_eq!(table.drain_all(), vec![Token(1), Token(2)]);
        assert!(table.subscribers("alice").is_empty());
    }
}
