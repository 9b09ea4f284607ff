use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use storage::GrantKey;
use tokio::sync::OwnedMutexGuard;

/// Per-(client, endpoint) async locks.
///
/// Serializes every read-check-write sequence on a grant: token validation,
/// once-grant consumption and persisting a consent answer.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: Mutex<HashMap<GrantKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub(crate) async fn lock(&self, key: &GrantKey) -> OwnedMutexGuard<()> {
        let lock = {
            // The map only ever holds weak handles, so a panic elsewhere cannot
            // leave it inconsistent.
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    locks.retain(|_, weak| weak.strong_count() > 0);
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::{ClientIdentity, EndpointRef};
    use std::time::Duration;

    fn key(client: &str) -> GrantKey {
        GrantKey::new(&ClientIdentity::named(client), &EndpointRef::new("demo", "/execute"))
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::default());
        let guard = locks.lock(&key("app-a")).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key("app-a")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyLocks::default();
        let _a = locks.lock(&key("app-a")).await;
        let _b = locks.lock(&key("app-b")).await;
        assert_eq!(locks.live(), 2);
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = KeyLocks::default();
        drop(locks.lock(&key("app-a")).await);
        let _b = locks.lock(&key("app-b")).await;
        assert_eq!(locks.live(), 1);
        assert_eq!(locks.locks.lock().unwrap().len(), 1);
    }
}
