//! Connection registry
//!
//! Authoritative table of user id -> current connection id. At most one
//! connection per user; the most recent registration wins. Every successful
//! mutation publishes the new online set while the table is still locked, so
//! broadcasts leave in the same order as the mutations that caused them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::identity;
use crate::presence::{OnlineUsers, PresenceBroadcaster};
use crate::session::ConnId;

pub struct ConnectionRegistry {
    entries: Mutex<HashMap<String, ConnId>>,
    presence: PresenceBroadcaster,
}

impl ConnectionRegistry {
    pub fn new(presence: PresenceBroadcaster) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            presence,
        }
    }

    /// Map `user_id` to `conn_id`, replacing any previous connection.
    ///
    /// No-identity user ids are ignored. Returns true if the table changed.
    pub fn register(&self, user_id: &str, conn_id: ConnId) -> bool {
        if identity::is_no_identity(user_id) {
            debug!(conn_id = %conn_id, "refusing to register without identity");
            return false;
        }

        let mut entries = self.lock();
        let previous = entries.insert(user_id.to_string(), conn_id);
        debug!(user_id, conn_id = %conn_id, replaced = ?previous, "connection registered");

        self.presence.publish(snapshot(&entries));
        true
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnId> {
        self.lock().get(user_id).copied()
    }

    /// Remove the mapping for `user_id`, but only while it still points at
    /// `conn_id`. A teardown from a connection that has since been replaced
    /// leaves the newer mapping untouched. Returns true if an entry was removed.
    pub fn unregister(&self, user_id: &str, conn_id: ConnId) -> bool {
        let mut entries = self.lock();
        match entries.get(user_id) {
            Some(current) if *current == conn_id => {
                entries.remove(user_id);
                debug!(user_id, conn_id = %conn_id, "connection unregistered");
                self.presence.publish(snapshot(&entries));
                true
            }
            Some(current) => {
                debug!(
                    user_id,
                    conn_id = %conn_id,
                    current = %current,
                    "ignoring stale teardown"
                );
                false
            }
            None => false,
        }
    }

    /// Sorted snapshot of online user ids
    pub fn online_users(&self) -> Vec<String> {
        let entries = self.lock();
        let mut users: Vec<String> = entries.keys().cloned().collect();
        users.sort_unstable();
        users
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run `f` on the current online set with the table locked.
    ///
    /// No mutation, and so no presence broadcast, can land between reading the
    /// set and whatever `f` does with it.
    pub fn with_online_users<R>(&self, f: impl FnOnce(Vec<String>) -> R) -> R {
        let entries = self.lock();
        f(snapshot(&entries).to_vec())
    }

    // Every critical section leaves the table consistent, so a poisoned lock
    // is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConnId>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn snapshot(entries: &HashMap<String, ConnId>) -> OnlineUsers {
    let mut users: Vec<String> = entries.keys().cloned().collect();
    users.sort_unstable();
    Arc::new(users)
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    fn registry() -> (ConnectionRegistry, broadcast::Receiver<OnlineUsers>) {
        let presence = PresenceBroadcaster::new();
        let rx = presence.subscribe();
        (ConnectionRegistry::new(presence), rx)
    }

    fn next(rx: &mut broadcast::Receiver<OnlineUsers>) -> Vec<String> {
        rx.try_recv().expect("expected a presence broadcast").to_vec()
    }

    #[test]
    fn test_register_and_lookup() {
        let (registry, _rx) = registry();
        assert!(registry.register("u1", ConnId(1)));
        assert_eq!(registry.lookup("u1"), Some(ConnId(1)));
        assert_eq!(registry.lookup("u2"), None);
    }

    #[test]
    fn test_last_registration_wins() {
        let (registry, _rx) = registry();
        registry.register("u1", ConnId(1));
        registry.register("u1", ConnId(2));

        assert_eq!(registry.lookup("u1"), Some(ConnId(2)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_no_identity_never_registered() {
        let (registry, mut rx) = registry();
        assert!(!registry.register("undefined", ConnId(1)));
        assert!(!registry.register("", ConnId(2)));

        assert!(registry.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_matching_connection() {
        let (registry, mut rx) = registry();
        registry.register("u1", ConnId(1));
        assert_eq!(next(&mut rx), vec!["u1"]);

        assert!(registry.unregister("u1", ConnId(1)));
        assert_eq!(registry.lookup("u1"), None);
        assert_eq!(next(&mut rx), Vec::<String>::new());
    }

    #[test]
    fn test_stale_unregister_is_noop() {
        let (registry, mut rx) = registry();
        registry.register("u1", ConnId(1));
        registry.register("u1", ConnId(3));
        next(&mut rx);
        next(&mut rx);

        assert!(!registry.unregister("u1", ConnId(1)));
        assert_eq!(registry.lookup("u1"), Some(ConnId(3)));
        // No broadcast for a no-op
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_unknown_user() {
        let (registry, mut rx) = registry();
        assert!(!registry.unregister("ghost", ConnId(9)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_sequence_matches_scenario() {
        let (registry, mut rx) = registry();

        registry.register("u1", ConnId(1));
        assert_eq!(next(&mut rx), vec!["u1"]);

        registry.register("u2", ConnId(2));
        assert_eq!(next(&mut rx), vec!["u1", "u2"]);

        registry.unregister("u1", ConnId(1));
        assert_eq!(next(&mut rx), vec!["u2"]);
    }

    #[test]
    fn test_with_online_users_sees_current_set() {
        let (registry, _rx) = registry();
        registry.register("u2", ConnId(2));
        registry.register("u1", ConnId(1));

        let seen = registry.with_online_users(|users| users);
        assert_eq!(seen, vec!["u1", "u2"]);
        assert_eq!(seen, registry.online_users());
    }

    #[test]
    fn test_concurrent_users_do_not_interfere() {
        let registry = Arc::new(ConnectionRegistry::new(PresenceBroadcaster::new()));

        let handles: Vec<_> = (0..8u64)
            .map(|n| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let user = format!("user-{}", n);
                    for round in 0..200u64 {
                        let conn = ConnId(n * 1000 + round);
                        registry.register(&user, conn);
                        if round % 2 == 0 {
                            registry.unregister(&user, conn);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Last round (199) is odd and stays registered
        assert_eq!(registry.len(), 8);
        for n in 0..8u64 {
            assert_eq!(
                registry.lookup(&format!("user-{}", n)),
                Some(ConnId(n * 1000 + 199))
            );
        }
    }
}
