/// Advisory, TTL-based edit locks. Cooperating clients advertise "this
/// card is being edited until time T" to make concurrent free-text edits
/// rare; the store never enforces exclusivity, so every store write here
/// is best-effort and a failure never blocks the content edit itself.
use board::{ClientId, Idea, IdeaId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{IdeaStore, SyncConfig};

/// Cached claim on one entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EditLock {
    pub holder: ClientId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EditLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockResult {
    pub granted: bool,
    pub held_by: Option<ClientId>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct LockState {
    locks: HashMap<IdeaId, EditLock>,
    /// Debounce generation per entity. Every acquire bumps it; only the
    /// timer holding the latest generation performs the store write.
    debounce: HashMap<IdeaId, u64>,
}

/// Cheap to clone; all clones share the same cache, so the debounce
/// timers and the sweeper see the same state as the callers.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn IdeaStore>,
    client: ClientId,
    cfg: SyncConfig,
    state: Arc<Mutex<LockState>>,
}

impl LockService {
    pub fn new(store: Arc<dyn IdeaStore>, client: ClientId, cfg: SyncConfig) -> Self {
        Self {
            store,
            client,
            cfg,
            state: Arc::new(Mutex::new(LockState::default())),
        }
    }

    /// Claim or renew the edit lock on `id`. Grants are answered from the
    /// local cache immediately; the store write is debounced so a burst of
    /// calls during continuous typing costs one write, not one per call.
    pub async fn acquire(&self, id: IdeaId) -> LockResult {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(lock) = state.locks.get(&id) {
            if lock.holder != self.client && !lock.is_expired(now) {
                return LockResult {
                    granted: false,
                    held_by: Some(lock.holder),
                    expires_at: Some(lock.expires_at),
                };
            }
        }

        let ttl = chrono::Duration::from_std(self.cfg.lock_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let expires_at = now + ttl;
        let acquired_at = state
            .locks
            .get(&id)
            .filter(|lock| lock.holder == self.client && !lock.is_expired(now))
            .map(|lock| lock.acquired_at)
            .unwrap_or(now);
        state.locks.insert(
            id,
            EditLock {
                holder: self.client,
                acquired_at,
                expires_at,
            },
        );

        let generation = {
            let slot = state.debounce.entry(id).or_insert(0);
            *slot += 1;
            *slot
        };
        drop(state);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.cfg.lock_debounce).await;
            this.flush_lock_write(id, generation).await;
        });

        LockResult {
            granted: true,
            held_by: Some(self.client),
            expires_at: Some(expires_at),
        }
    }

    /// The debounce timer that survived without being superseded performs
    /// the actual store write.
    async fn flush_lock_write(&self, id: IdeaId, generation: u64) {
        let state = self.state.lock().await;
        if state.debounce.get(&id) != Some(&generation) {
            return;
        }
        let Some(lock) = state.locks.get(&id).copied() else {
            return;
        };
        if lock.holder != self.client {
            return;
        }
        drop(state);

        if let Err(error) = self.store.write_lock(id, self.client, lock.expires_at).await {
            warn!(%id, %error, "advisory lock write failed");
        }
    }

    /// Release a self-held lock. Never touches someone else's claim.
    pub async fn release(&self, id: IdeaId) {
        let mut state = self.state.lock().await;
        let held = state
            .locks
            .get(&id)
            .is_some_and(|lock| lock.holder == self.client);
        if !held {
            return;
        }
        state.locks.remove(&id);
        // Invalidate any debounce timer still waiting to write the lock.
        if let Some(generation) = state.debounce.get_mut(&id) {
            *generation += 1;
        }
        drop(state);

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this.store.clear_lock(id, this.client).await {
                warn!(%id, %error, "advisory lock clear failed");
            }
        });
    }

    /// True when the entity is unlocked, expired, or held by this client.
    pub async fn is_editable(&self, id: IdeaId) -> bool {
        let now = Utc::now();
        let state = self.state.lock().await;
        match state.locks.get(&id) {
            None => true,
            Some(lock) => lock.holder == self.client || lock.is_expired(now),
        }
    }

    pub async fn lock_info(&self, id: IdeaId) -> Option<EditLock> {
        let now = Utc::now();
        let state = self.state.lock().await;
        state
            .locks
            .get(&id)
            .filter(|lock| !lock.is_expired(now))
            .copied()
    }

    /// Feed lock columns observed on an inbound row into the cache. Our
    /// own claims are authoritative locally and are not overwritten by
    /// their echoes.
    pub async fn observe_remote(&self, row: &Idea) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        match (row.locked_by, row.locked_until) {
            (Some(holder), Some(_)) if holder == self.client => {}
            (Some(holder), Some(until)) if until > now => {
                let acquired_at = state
                    .locks
                    .get(&row.id)
                    .filter(|lock| lock.holder == holder)
                    .map(|lock| lock.acquired_at)
                    .unwrap_or(now);
                state.locks.insert(
                    row.id,
                    EditLock {
                        holder,
                        acquired_at,
                        expires_at: until,
                    },
                );
            }
            _ => {
                // Row reports unlocked or expired. A claim we hold
                // ourselves stays until we release it or it expires.
                if state
                    .locks
                    .get(&row.id)
                    .is_some_and(|lock| lock.holder != self.client)
                {
                    state.locks.remove(&row.id);
                }
            }
        }
    }

    /// The entity is gone, so any claim on it is moot.
    pub async fn observe_delete(&self, id: IdeaId) {
        self.state.lock().await.locks.remove(&id);
    }

    /// Drop every lock past its expiry. Local clearing is authoritative
    /// for this client; the store cleanup may fail without consequence.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let expired: Vec<(IdeaId, ClientId)> = state
            .locks
            .iter()
            .filter(|(_, lock)| lock.is_expired(now))
            .map(|(id, lock)| (*id, lock.holder))
            .collect();
        for (id, _) in &expired {
            state.locks.remove(id);
        }
        drop(state);

        for (id, holder) in &expired {
            let this_store = Arc::clone(&self.store);
            let id = *id;
            let holder = *holder;
            tokio::spawn(async move {
                if let Err(error) = this_store.clear_lock(id, holder).await {
                    debug!(%id, %error, "expired lock store cleanup failed");
                }
            });
        }
        expired.len()
    }

    /// Periodic sweep task. Caller owns the handle and aborts it on
    /// shutdown.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.cfg.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cleared = this.sweep_expired().await;
                if cleared > 0 {
                    debug!(cleared, "swept expired edit locks");
                }
            }
        })
    }
}
