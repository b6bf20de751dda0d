/// The persistent-store seam. The engine owns no durable state; it talks
/// to the row store through [`IdeaStore`] and receives change events back
/// through the store's subscription primitive. Delivery is neither ordered
/// nor exactly-once.
use async_trait::async_trait;
use board::{ClientId, Idea, IdeaDraft, IdeaId, IdeaPatch, ProjectId};
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::{Result, SyncError};

/// Identifies one logical event stream. The rendered channel name is a
/// deterministic function of the scope, which is what makes repeated
/// subscribe calls collapse onto one connection instead of leaking a new
/// channel each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum ScopeKey {
    Ideas { project: ProjectId },
    Collaborators { project: ProjectId },
}

impl ScopeKey {
    pub fn ideas(project: ProjectId) -> Self {
        Self::Ideas { project }
    }

    pub fn collaborators(project: ProjectId) -> Self {
        Self::Collaborators { project }
    }

    pub fn project(&self) -> ProjectId {
        match self {
            Self::Ideas { project } | Self::Collaborators { project } => *project,
        }
    }

    pub fn channel_name(&self) -> String {
        match self {
            Self::Ideas { project } => format!("ideas:{project}"),
            Self::Collaborators { project } => format!("collaborators:{project}"),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.channel_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One change notification from the store. Deletes carry the last known
/// row so scope filtering and id resolution work uniformly for all three
/// operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub scope: ScopeKey,
    pub row: Idea,
}

/// Authoritative row store for ideas, plus its change-subscription
/// primitive and the advisory lock columns.
#[async_trait]
pub trait IdeaStore: Send + Sync {
    /// Insert a new row; the store assigns the id and both timestamps and
    /// returns the full row.
    async fn insert(&self, draft: IdeaDraft, created_by: ClientId) -> Result<Idea>;

    /// Apply a partial update and return the full updated row, which is
    /// what lets clients recognize the echo of their own write.
    async fn update(&self, id: IdeaId, patch: IdeaPatch) -> Result<Idea>;

    async fn delete(&self, id: IdeaId) -> Result<()>;

    /// Snapshot fetch; also the polling fallback when realtime is down.
    async fn list(&self, project: ProjectId) -> Result<Vec<Idea>>;

    /// Write the advisory lock columns. Failures are reported but never
    /// gate a content edit.
    async fn write_lock(
        &self,
        id: IdeaId,
        holder: ClientId,
        until: DateTime<Utc>,
    ) -> Result<()>;

    /// Clear the lock columns if currently held by `holder`.
    async fn clear_lock(&self, id: IdeaId, holder: ClientId) -> Result<()>;

    /// Open a change stream. The transport may multiplex more broadly than
    /// the requested scope; consumers filter.
    async fn subscribe(&self, scope: ScopeKey) -> Result<BoxStream<'static, ChangeEvent>>;
}

/// Call counters exposed by [`MemoryStore`] so tests can assert on write
/// volume (debounce, supersede) without instrumenting the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub lock_writes: usize,
    pub lock_clears: usize,
    pub subscribes: usize,
    /// Highest number of row writes that were ever on the wire at once.
    pub max_writes_in_flight: usize,
}

/// In-process reference store. Backs the integration tests and local
/// single-process use; simulates a transport that fans every event out to
/// every subscriber, so scope filtering downstream is actually exercised.
pub struct MemoryStore {
    rows: RwLock<HashMap<IdeaId, Idea>>,
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    fail_writes: AtomicBool,
    fail_subscribe: AtomicBool,
    write_latency: StdMutex<Option<Duration>>,
    inserts: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    lock_writes: AtomicUsize,
    lock_clears: AtomicUsize,
    subscribes: AtomicUsize,
    writes_in_flight: AtomicUsize,
    max_writes_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            subscribers: StdMutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            write_latency: StdMutex::new(None),
            inserts: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            lock_writes: AtomicUsize::new(0),
            lock_clears: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            writes_in_flight: AtomicUsize::new(0),
            max_writes_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make every row write fail with a transport error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subscription attempts fail until reset.
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Delay every row write, to widen race windows in tests.
    pub fn set_write_latency(&self, latency: Option<Duration>) {
        *self.write_latency.lock().unwrap() = latency;
    }

    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            inserts: self.inserts.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
            lock_writes: self.lock_writes.load(Ordering::SeqCst),
            lock_clears: self.lock_clears.load(Ordering::SeqCst),
            subscribes: self.subscribes.load(Ordering::SeqCst),
            max_writes_in_flight: self.max_writes_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Drop every live change stream, as a transport failure would.
    /// Streams end; subscribers reconnect through `subscribe`.
    pub fn disconnect_all(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    /// Seed a row directly, bypassing the event pipeline. For tests that
    /// need pre-existing state such as legacy rows without anchor dims.
    pub async fn seed(&self, idea: Idea) {
        self.rows.write().await.insert(idea.id, idea);
    }

    fn publish(&self, op: ChangeOp, row: Idea) {
        let event = ChangeEvent {
            op,
            scope: ScopeKey::ideas(row.project_id),
            row,
        };
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    async fn write_gate(&self) -> Result<()> {
        let entered = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_writes_in_flight.fetch_max(entered, Ordering::SeqCst);

        let latency = *self.write_latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.fail_writes.load(Ordering::SeqCst) {
            self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(SyncError::Transport("injected write failure".to_string()));
        }
        Ok(())
    }

    fn write_done(&self) {
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdeaStore for MemoryStore {
    async fn insert(&self, draft: IdeaDraft, created_by: ClientId) -> Result<Idea> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.write_gate().await?;

        let now = Utc::now();
        let row = Idea {
            id: IdeaId::new(),
            content: draft.content,
            detail: draft.detail,
            priority: draft.priority,
            position: draft.position,
            collapsed: false,
            anchor_dims: None,
            locked_by: None,
            locked_until: None,
            project_id: draft.project_id,
            created_by,
            created_at: now,
            updated_at: now,
        };
        self.rows.write().await.insert(row.id, row.clone());
        self.write_done();

        self.publish(ChangeOp::Insert, row.clone());
        Ok(row)
    }

    async fn update(&self, id: IdeaId, patch: IdeaPatch) -> Result<Idea> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.write_gate().await?;

        let mut rows = self.rows.write().await;
        let row = match rows.get_mut(&id) {
            Some(row) => row,
            None => {
                self.write_done();
                return Err(SyncError::Conflict(format!("row {id} no longer exists")));
            }
        };
        row.apply_patch(&patch);
        row.updated_at = Utc::now();
        let updated = row.clone();
        drop(rows);
        self.write_done();

        self.publish(ChangeOp::Update, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: IdeaId) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.write_gate().await?;

        let removed = self.rows.write().await.remove(&id);
        self.write_done();

        if let Some(row) = removed {
            self.publish(ChangeOp::Delete, row);
        }
        Ok(())
    }

    async fn list(&self, project: ProjectId) -> Result<Vec<Idea>> {
        let rows = self.rows.read().await;
        let mut out: Vec<Idea> = rows
            .values()
            .filter(|row| row.project_id == project)
            .cloned()
            .collect();
        out.sort_by_key(|row| row.created_at);
        Ok(out)
    }

    async fn write_lock(
        &self,
        id: IdeaId,
        holder: ClientId,
        until: DateTime<Utc>,
    ) -> Result<()> {
        self.lock_writes.fetch_add(1, Ordering::SeqCst);
        self.write_gate().await?;

        let mut rows = self.rows.write().await;
        let row = match rows.get_mut(&id) {
            Some(row) => row,
            None => {
                self.write_done();
                return Err(SyncError::Conflict(format!("row {id} no longer exists")));
            }
        };
        row.locked_by = Some(holder);
        row.locked_until = Some(until);
        row.updated_at = Utc::now();
        let updated = row.clone();
        drop(rows);
        self.write_done();

        self.publish(ChangeOp::Update, updated);
        Ok(())
    }

    async fn clear_lock(&self, id: IdeaId, holder: ClientId) -> Result<()> {
        self.lock_clears.fetch_add(1, Ordering::SeqCst);
        self.write_gate().await?;

        let mut rows = self.rows.write().await;
        let updated = match rows.get_mut(&id) {
            Some(row) if row.locked_by == Some(holder) => {
                row.locked_by = None;
                row.locked_until = None;
                row.updated_at = Utc::now();
                Some(row.clone())
            }
            // Never clears someone else's lock; missing row is fine.
            _ => None,
        };
        drop(rows);
        self.write_done();

        if let Some(row) = updated {
            self.publish(ChangeOp::Update, row);
        }
        Ok(())
    }

    async fn subscribe(&self, scope: ScopeKey) -> Result<BoxStream<'static, ChangeEvent>> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(format!(
                "cannot open channel {}",
                scope.channel_name()
            )));
        }
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        Ok(Box::pin(rx))
    }
}
