//! Display-name resolution with a session-lifetime cache.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use parley_shared::types::{UserId, UserProfile};

use crate::services::{ServiceResult, UserDirectory};

/// Caches user directory lookups for the lifetime of a session so
/// rendering never refetches display metadata for the same user.
pub struct ProfileCache<D: UserDirectory + ?Sized = dyn UserDirectory> {
    directory: Arc<D>,
    cache: Mutex<HashMap<UserId, UserProfile>>,
}

impl<D: UserDirectory + ?Sized> ProfileCache<D> {
    pub fn new(directory: Arc<D>) -> Self {
        Self {
            directory,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a profile, hitting the directory only on first sight of
    /// the user. Concurrent misses for the same user may fetch twice;
    /// last write wins.
    pub async fn resolve(&self, user: &UserId) -> ServiceResult<UserProfile> {
        if let Some(hit) = self.cache.lock().await.get(user) {
            return Ok(hit.clone());
        }

        let profile = self.directory.lookup_user(user).await?;
        debug!(user = %user, "Cached profile");
        self.cache
            .lock()
            .await
            .insert(user.clone(), profile.clone());
        Ok(profile)
    }

    /// Number of cached profiles.
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDirectory {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl UserDirectory for CountingDirectory {
        async fn lookup_user(&self, user: &UserId) -> ServiceResult<UserProfile> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if user.as_str() == "ghost" {
                return Err(ServiceError::Status { status: 404 });
            }
            Ok(UserProfile {
                user_id: user.clone(),
                display_name: user.as_str().to_uppercase(),
                avatar_url: None,
            })
        }
    }

    #[tokio::test]
    async fn test_second_resolve_hits_cache() {
        let directory = Arc::new(CountingDirectory {
            lookups: AtomicUsize::new(0),
        });
        let cache = ProfileCache::new(directory.clone());

        let alice = UserId::new("alice");
        let first = cache.resolve(&alice).await.unwrap();
        let second = cache.resolve(&alice).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_not_cached() {
        let directory = Arc::new(CountingDirectory {
            lookups: AtomicUsize::new(0),
        });
        let cache = ProfileCache::new(directory.clone());

        let ghost = UserId::new("ghost");
        assert!(cache.resolve(&ghost).await.is_err());
        assert!(cache.resolve(&ghost).await.is_err());
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty().await);
    }
}
