//! Per-user authorization context cache.
//!
//! One map from user id to an immutable `(context, inserted_at)` entry. The
//! lock is never held while the authorization source is read, so two callers
//! missing on the same user may both fetch; the last write wins.
//!
//! A fetch that overlaps an `invalidate` of its user, or a `clear`, still
//! answers its caller but is not cached, so an invalidation is never undone
//! by a read that started before it.

use chrono::{DateTime, Duration, Utc};
use mongate_core::{AuthorizationContext, AuthorizationRecord, CacheConfig, PolicyConfig};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::ContextError;

/// Reads the combined authorization record of a user.
pub trait ContextSource: Send + Sync {
    /// `Ok(None)` when the user does not exist.
    fn fetch(&self, user_id: &str) -> anyhow::Result<Option<AuthorizationRecord>>;
}

impl<T: ContextSource + ?Sized> ContextSource for Arc<T> {
    fn fetch(&self, user_id: &str) -> anyhow::Result<Option<AuthorizationRecord>> {
        (**self).fetch(user_id)
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    context: Arc<AuthorizationContext>,
    inserted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Bumped per user by `invalidate`.
    generations: HashMap<String, u64>,
    /// Bumped by `clear`.
    epoch: u64,
}

impl CacheState {
    fn version(&self, user_id: &str) -> (u64, u64) {
        let generation = self.generations.get(user_id).copied().unwrap_or(0);
        (self.epoch, generation)
    }
}

/// TTL cache of resolved authorization contexts.
pub struct AuthorizationContextCache {
    source: Arc<dyn ContextSource>,
    policy: Arc<PolicyConfig>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
}

impl AuthorizationContextCache {
    pub fn new(
        source: Arc<dyn ContextSource>,
        policy: Arc<PolicyConfig>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            source,
            policy,
            ttl: config.ttl(),
            clock: Arc::new(SystemClock),
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The caller's context, fetched from the source on a miss or once the
    /// cached entry is older than the TTL.
    pub fn get(&self, user_id: &str) -> Result<Arc<AuthorizationContext>, ContextError> {
        let now = self.clock.now();
        let version = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = state.entries.get(user_id) {
                if now - entry.inserted_at < self.ttl {
                    tracing::trace!(user_id, "Authorization context cache hit");
                    return Ok(Arc::clone(&entry.context));
                }
            }
            state.version(user_id)
        };

        tracing::debug!(user_id, "Authorization context cache miss, fetching");
        let record = match self.source.fetch(user_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(user_id, "No authorization record for user");
                return Err(ContextError::NotFound {
                    user_id: user_id.to_string(),
                });
            }
            Err(err) => {
                tracing::error!(user_id, error = %err, "Authorization source failed");
                return Err(ContextError::Source(err));
            }
        };

        let inserted_at = self.clock.now();
        let context = AuthorizationContext::from_record(user_id, &record, &self.policy, inserted_at)
            .map_err(|err| {
                tracing::warn!(user_id, error = %err, "Invalid authorization record");
                ContextError::from(err)
            })?;
        let context = Arc::new(context);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.version(user_id) != version {
            tracing::debug!(user_id, "Invalidated during fetch, not caching");
            return Ok(context);
        }
        state.entries.insert(
            user_id.to_string(),
            CacheEntry {
                context: Arc::clone(&context),
                inserted_at,
            },
        );

        Ok(context)
    }

    /// Drop a user's entry, e.g. after a role or tenant change. Returns
    /// whether an entry was present. A fetch for the user already in flight
    /// is not cached.
    pub fn invalidate(&self, user_id: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state.generations.entry(user_id.to_string()).or_default() += 1;
        let removed = state.entries.remove(user_id).is_some();
        tracing::debug!(user_id, removed, "Authorization context invalidated");
        removed
    }

    /// Drop every entry. Fetches already in flight are not cached.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
        state.generations.clear();
        state.epoch += 1;
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now - entry.inserted_at < self.ttl);
        before - state.entries.len()
    }
}
