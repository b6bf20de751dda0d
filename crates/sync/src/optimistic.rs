/// Optimistic update coordination: every mutation lands in the local view
/// immediately, goes to the store asynchronously, and is guaranteed to
/// resolve within the revert timeout, either confirmed by the store or
/// rolled back to the snapshot taken when it was applied.
use board::{capture_anchor, BoxSize, ClientId, Idea, IdeaDraft, IdeaId, IdeaPatch, Position};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{ChangeEvent, ChangeOp, IdeaStore, OpTicket, Result, SyncConfig, SyncError};

/// Notifications to the presentation layer. Carries full rows so the UI
/// never reads engine state mid-transition.
#[derive(Debug, Clone)]
pub enum ViewEvent {
    Upserted { idea: Idea },
    Removed { id: IdeaId },
    /// A placeholder created under a client-local id now has its store id.
    Remapped { local: IdeaId, stored: IdeaId },
    /// An optimistic operation failed or timed out; the view snapped back.
    Reverted { id: IdeaId, error: SyncError },
    /// The whole view was replaced from a snapshot fetch.
    Refreshed,
}

/// The write the coordinator still owes the store for an entity, coalesced
/// across rapid local edits.
#[derive(Debug, Clone)]
enum StoreWrite {
    Update(IdeaPatch),
    Delete,
}

/// In-flight optimistic mutation for one entity. There is at most one of
/// these per id: newer local intents supersede older ones in place, which
/// is also what keeps at most one store write on the wire per entity.
#[derive(Debug)]
struct PendingOp {
    /// Latest local intent. Watchdogs key on this.
    intent: OpTicket,
    /// The write currently on the wire. Completions key on this.
    wire: OpTicket,
    /// The wire write is an insert and the id is still client-local.
    creating: bool,
    /// State to restore on rollback, taken at the latest intent's
    /// apply time. `None` while creating: rollback removes the placeholder.
    snapshot: Option<Idea>,
    submitted_at: DateTime<Utc>,
    /// Coalesced follow-up write, issued when the wire write completes.
    queued: Option<StoreWrite>,
}

impl PendingOp {
    fn queue(&mut self, write: StoreWrite) {
        match (&mut self.queued, write) {
            (Some(StoreWrite::Update(earlier)), StoreWrite::Update(later)) => {
                earlier.merge(later)
            }
            (slot, write) => *slot = Some(write),
        }
    }
}

#[derive(Default)]
struct ViewState {
    ideas: HashMap<IdeaId, Idea>,
    pending: HashMap<IdeaId, PendingOp>,
    /// Client-local create ids to their store-assigned ids.
    aliases: HashMap<IdeaId, IdeaId>,
}

impl ViewState {
    fn resolve(&self, id: IdeaId) -> IdeaId {
        self.aliases.get(&id).copied().unwrap_or(id)
    }
}

/// Cheap to clone; all clones share the same view state, which is what
/// the spawned write, watchdog and reconcile paths rely on.
#[derive(Clone)]
pub struct OptimisticCoordinator {
    store: Arc<dyn IdeaStore>,
    client: ClientId,
    cfg: SyncConfig,
    state: Arc<Mutex<ViewState>>,
    events: broadcast::Sender<ViewEvent>,
}

impl OptimisticCoordinator {
    pub fn new(store: Arc<dyn IdeaStore>, client: ClientId, cfg: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            client,
            cfg,
            state: Arc::new(Mutex::new(ViewState::default())),
            events,
        }
    }

    pub fn view_events(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<Idea> {
        let state = self.state.lock().await;
        let mut ideas: Vec<Idea> = state.ideas.values().cloned().collect();
        ideas.sort_by_key(|idea| idea.created_at);
        ideas
    }

    pub async fn idea(&self, id: IdeaId) -> Option<Idea> {
        let state = self.state.lock().await;
        let id = state.resolve(id);
        state.ideas.get(&id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Insert a placeholder under a client-local id and issue the store
    /// insert. The returned id stays valid after the store assigns the
    /// real one; lookups follow the alias.
    pub async fn apply_create(&self, draft: IdeaDraft) -> Result<IdeaId> {
        draft.validate()?;

        let mut state = self.state.lock().await;
        let local = IdeaId::local();
        let now = Utc::now();
        let placeholder = Idea {
            id: local,
            content: draft.content.clone(),
            detail: draft.detail.clone(),
            priority: draft.priority,
            position: draft.position,
            collapsed: false,
            anchor_dims: None,
            locked_by: None,
            locked_until: None,
            project_id: draft.project_id,
            created_by: self.client,
            created_at: now,
            updated_at: now,
        };
        state.ideas.insert(local, placeholder.clone());

        let ticket = OpTicket::new();
        state.pending.insert(
            local,
            PendingOp {
                intent: ticket,
                wire: ticket,
                creating: true,
                snapshot: None,
                submitted_at: now,
                queued: None,
            },
        );
        self.emit(ViewEvent::Upserted { idea: placeholder });
        drop(state);

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.store.insert(draft, this.client).await.map(Some);
            this.on_write_complete(local, ticket, result).await;
        });
        self.spawn_watchdog(local, ticket);
        Ok(local)
    }

    /// Merge the patch into the local entity now and issue the store
    /// update. A pending operation for the same id is superseded: its
    /// rollback obligation is dropped and the patches coalesce into the
    /// next write.
    pub async fn apply_update(&self, id: IdeaId, patch: IdeaPatch) -> Result<()> {
        patch.validate()?;
        self.submit_patch(id, patch).await
    }

    /// Position write: `{x,y}` and the box snapshot captured at this
    /// moment always travel in the same patch. The collapse state feeding
    /// the snapshot is read under the view lock, after any collapse
    /// toggle already applied.
    pub async fn apply_move(
        &self,
        id: IdeaId,
        position: Position,
        current_box: BoxSize,
    ) -> Result<()> {
        current_box.validate()?;
        if !position.is_finite() {
            return Err(SyncError::Validation(
                "position is not a finite number".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let id = state.resolve(id);
        let collapsed = state
            .ideas
            .get(&id)
            .ok_or(SyncError::NotFound(id))?
            .collapsed;
        let patch = IdeaPatch::moved(position, capture_anchor(current_box, collapsed));
        self.submit_patch_locked(&mut state, id, patch)
    }

    /// Remove the entity locally now and issue the store delete. On
    /// failure the exact pre-delete row comes back.
    pub async fn apply_delete(&self, id: IdeaId) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = state.resolve(id);
        let removed = state.ideas.remove(&id).ok_or(SyncError::NotFound(id))?;
        self.emit(ViewEvent::Removed { id });

        let ticket = OpTicket::new();
        match state.pending.get_mut(&id) {
            Some(pending) => {
                pending.intent = ticket;
                if !pending.creating {
                    pending.snapshot = Some(removed);
                }
                pending.submitted_at = Utc::now();
                pending.queue(StoreWrite::Delete);
            }
            None => {
                state.pending.insert(
                    id,
                    PendingOp {
                        intent: ticket,
                        wire: ticket,
                        creating: false,
                        snapshot: Some(removed),
                        submitted_at: Utc::now(),
                        queued: None,
                    },
                );
                self.spawn_write(id, ticket, StoreWrite::Delete);
            }
        }
        drop(state);
        self.spawn_watchdog(id, ticket);
        Ok(())
    }

    async fn submit_patch(&self, id: IdeaId, patch: IdeaPatch) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = state.resolve(id);
        self.submit_patch_locked(&mut state, id, patch)
    }

    fn submit_patch_locked(
        &self,
        state: &mut ViewState,
        id: IdeaId,
        patch: IdeaPatch,
    ) -> Result<()> {
        let idea = state.ideas.get_mut(&id).ok_or(SyncError::NotFound(id))?;
        let snapshot = idea.clone();
        idea.apply_patch(&patch);
        let updated = idea.clone();

        let ticket = OpTicket::new();
        match state.pending.get_mut(&id) {
            Some(pending) => {
                pending.intent = ticket;
                if !pending.creating {
                    pending.snapshot = Some(snapshot);
                }
                pending.submitted_at = Utc::now();
                pending.queue(StoreWrite::Update(patch));
            }
            None => {
                state.pending.insert(
                    id,
                    PendingOp {
                        intent: ticket,
                        wire: ticket,
                        creating: false,
                        snapshot: Some(snapshot),
                        submitted_at: Utc::now(),
                        queued: None,
                    },
                );
                self.spawn_write(id, ticket, StoreWrite::Update(patch));
            }
        }
        self.emit(ViewEvent::Upserted { idea: updated });
        self.spawn_watchdog(id, ticket);
        Ok(())
    }

    fn spawn_write(&self, id: IdeaId, ticket: OpTicket, write: StoreWrite) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = match write {
                StoreWrite::Update(patch) => this.store.update(id, patch).await.map(Some),
                StoreWrite::Delete => this.store.delete(id).await.map(|_| None),
            };
            this.on_write_complete(id, ticket, result).await;
        });
    }

    fn spawn_watchdog(&self, id: IdeaId, ticket: OpTicket) {
        let this = self.clone();
        let timeout = self.cfg.revert_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.revert_if_unresolved(id, ticket).await;
        });
    }

    /// Deadline path: the intent is still pending after the revert
    /// timeout, so the store write is presumed hung. Same rollback as a
    /// failed write; the abandoned completion resolves to a no-op.
    async fn revert_if_unresolved(&self, id: IdeaId, ticket: OpTicket) {
        let mut state = self.state.lock().await;
        let id = state.resolve(id);
        let unresolved = state
            .pending
            .get(&id)
            .is_some_and(|pending| pending.intent == ticket);
        if !unresolved {
            return;
        }
        let Some(entry) = state.pending.remove(&id) else {
            return;
        };
        warn!(%id, "optimistic operation timed out, reverting");
        self.rollback(&mut state, id, entry, SyncError::Timeout);
    }

    async fn on_write_complete(
        &self,
        id: IdeaId,
        ticket: OpTicket,
        result: Result<Option<Idea>>,
    ) {
        let mut state = self.state.lock().await;
        let Some(mut entry) = state.pending.remove(&id) else {
            // Already resolved by timeout or a remote delete; the write's
            // outcome reaches us again through the change stream.
            return;
        };
        if entry.wire != ticket {
            state.pending.insert(id, entry);
            return;
        }

        if entry.creating {
            self.finish_create(&mut state, id, entry, result);
            return;
        }

        // A newer local intent superseded this write: discard its outcome,
        // rollback included, and put the coalesced intent on the wire.
        if let Some(next) = entry.queued.take() {
            entry.wire = entry.intent;
            let wire = entry.wire;
            state.pending.insert(id, entry);
            self.spawn_write(id, wire, next);
            return;
        }

        match result {
            Ok(Some(row)) => {
                state.ideas.insert(row.id, row.clone());
                self.emit(ViewEvent::Upserted { idea: row });
            }
            Ok(None) => {
                // Delete acknowledged; the entity is already gone locally.
            }
            Err(error) => {
                warn!(%id, %error, "store write failed, reverting");
                self.rollback(&mut state, id, entry, error);
            }
        }
    }

    fn finish_create(
        &self,
        state: &mut ViewState,
        local: IdeaId,
        mut entry: PendingOp,
        result: Result<Option<Idea>>,
    ) {
        let row = match result {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(error) => {
                warn!(%local, %error, "create failed, removing placeholder");
                state.ideas.remove(&local);
                self.emit(ViewEvent::Removed { id: local });
                self.emit(ViewEvent::Reverted { id: local, error });
                return;
            }
        };

        state.ideas.remove(&local);
        state.aliases.insert(local, row.id);
        self.emit(ViewEvent::Remapped {
            local,
            stored: row.id,
        });

        match entry.queued.take() {
            // Edits queued against the temporary id carry over to the
            // store id and keep the write chain going.
            Some(next) => {
                let wire = entry.intent;
                match &next {
                    StoreWrite::Update(patch) => {
                        let mut optimistic = row.clone();
                        optimistic.apply_patch(patch);
                        state.ideas.insert(row.id, optimistic.clone());
                        self.emit(ViewEvent::Upserted { idea: optimistic });
                    }
                    StoreWrite::Delete => {
                        // Deleted locally while the insert was in flight.
                    }
                }
                state.pending.insert(
                    row.id,
                    PendingOp {
                        intent: entry.intent,
                        wire,
                        creating: false,
                        snapshot: Some(row.clone()),
                        submitted_at: entry.submitted_at,
                        queued: None,
                    },
                );
                self.spawn_write(row.id, wire, next);
            }
            None => {
                state.ideas.insert(row.id, row.clone());
                self.emit(ViewEvent::Upserted { idea: row });
            }
        }
    }

    fn rollback(&self, state: &mut ViewState, id: IdeaId, entry: PendingOp, error: SyncError) {
        if entry.creating {
            state.ideas.remove(&id);
            self.emit(ViewEvent::Removed { id });
        } else if let Some(snapshot) = entry.snapshot {
            state.ideas.insert(snapshot.id, snapshot.clone());
            self.emit(ViewEvent::Upserted { idea: snapshot });
        }
        self.emit(ViewEvent::Reverted { id, error });
    }

    /// Entry point for the change stream. Echoes of this client's own
    /// writes clear the matching pending operation without re-applying;
    /// genuinely remote rows replace the local value wholesale.
    pub async fn reconcile(&self, event: ChangeEvent) {
        let mut state = self.state.lock().await;
        match event.op {
            ChangeOp::Insert => {
                let row = event.row;
                if state.pending.contains_key(&row.id) {
                    // A local write chain already owns this row; its own
                    // completion will settle the value.
                    return;
                }
                if row.created_by == self.client
                    && state.pending.values().any(|pending| pending.creating)
                {
                    // Echo of an insert this client has in flight; the
                    // completion path owns the id remap.
                    debug!(id = %row.id, "suppressing own create echo");
                    return;
                }
                state.ideas.insert(row.id, row.clone());
                self.emit(ViewEvent::Upserted { idea: row });
            }
            ChangeOp::Update => {
                let row = event.row;
                if let Some(pending) = state.pending.get(&row.id) {
                    let is_echo = row.updated_at >= pending.submitted_at;
                    if is_echo && pending.queued.is_none() && !pending.creating {
                        state.pending.remove(&row.id);
                        // Sync server-owned fields without announcing a
                        // change the user already sees.
                        state.ideas.insert(row.id, row);
                        debug!("cleared pending operation on write echo");
                    }
                    // Otherwise the local intent stands until its own
                    // write resolves.
                    return;
                }
                state.ideas.insert(row.id, row.clone());
                self.emit(ViewEvent::Upserted { idea: row });
            }
            ChangeOp::Delete => {
                let id = event.row.id;
                // Covers remote deletes and collection cascades: any local
                // intent for the row is moot once the row is gone.
                state.pending.remove(&id);
                if state.ideas.remove(&id).is_some() {
                    self.emit(ViewEvent::Removed { id });
                }
            }
        }
    }

    /// Replace the view from a snapshot fetch. Entities with pending local
    /// operations keep their optimistic value; everything else mirrors the
    /// store, including removals.
    pub async fn refresh(&self, project: board::ProjectId, rows: Vec<Idea>) {
        let mut state = self.state.lock().await;
        let ViewState {
            ideas, pending, ..
        } = &mut *state;

        let mut seen: HashSet<IdeaId> = HashSet::with_capacity(rows.len());
        for row in rows {
            seen.insert(row.id);
            if !pending.contains_key(&row.id) {
                ideas.insert(row.id, row);
            }
        }
        ideas.retain(|id, idea| {
            idea.project_id != project || seen.contains(id) || pending.contains_key(id)
        });
        self.emit(ViewEvent::Refreshed);
    }

    fn emit(&self, event: ViewEvent) {
        // Nobody listening is fine; the engine still converges.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use board::{IdeaDraft, ProjectId};
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, OptimisticCoordinator, ProjectId) {
        let store = Arc::new(MemoryStore::new());
        let coordinator =
            OptimisticCoordinator::new(store.clone(), ClientId::new(), SyncConfig::default());
        (store, coordinator, ProjectId::new())
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn create_is_visible_immediately_and_remaps() {
        let (store, coordinator, project) = setup();

        let local = coordinator
            .apply_create(IdeaDraft::new(project, "first"))
            .await
            .unwrap();
        // Optimistic placeholder before the store answers.
        assert!(coordinator.idea(local).await.is_some());

        settle().await;

        // Lookup through the local id still works after the remap.
        let confirmed = coordinator.idea(local).await.unwrap();
        assert_ne!(confirmed.id, local);
        assert_eq!(store.list(project).await.unwrap()[0].id, confirmed.id);
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn failed_create_removes_placeholder() {
        let (store, coordinator, project) = setup();
        store.fail_writes(true);

        let local = coordinator
            .apply_create(IdeaDraft::new(project, "doomed"))
            .await
            .unwrap();
        settle().await;

        assert!(coordinator.idea(local).await.is_none());
        assert!(store.list(project).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_update_restores_exact_snapshot() {
        let (store, coordinator, project) = setup();

        let id = coordinator
            .apply_create(IdeaDraft::new(project, "A"))
            .await
            .unwrap();
        settle().await;

        store.fail_writes(true);
        coordinator
            .apply_update(id, IdeaPatch::content("B"))
            .await
            .unwrap();
        // Optimistic value shows first.
        assert_eq!(coordinator.idea(id).await.unwrap().content, "B");

        settle().await;
        assert_eq!(coordinator.idea(id).await.unwrap().content, "A");
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn failed_delete_restores_entity() {
        let (store, coordinator, project) = setup();

        let id = coordinator
            .apply_create(IdeaDraft::new(project, "keep me"))
            .await
            .unwrap();
        settle().await;

        store.fail_writes(true);
        coordinator.apply_delete(id).await.unwrap();
        assert!(coordinator.idea(id).await.is_none());

        settle().await;
        assert_eq!(coordinator.idea(id).await.unwrap().content, "keep me");
    }

    #[tokio::test]
    async fn rapid_moves_keep_one_write_on_the_wire() {
        let (store, coordinator, project) = setup();

        let id = coordinator
            .apply_create(IdeaDraft::new(project, "card"))
            .await
            .unwrap();
        settle().await;

        store.set_write_latency(Some(Duration::from_millis(10)));
        let the_box = BoxSize::new(100.0, 50.0);
        for step in 0..10 {
            coordinator
                .apply_move(id, Position::new(step as f64 * 10.0, 0.0), the_box)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;

        assert_eq!(store.counters().max_writes_in_flight, 1);
        // Final intent won, intermediate moves coalesced away.
        let rows = store.list(project).await.unwrap();
        assert_eq!(rows[0].position, Position::new(90.0, 0.0));
        assert_eq!(coordinator.idea(id).await.unwrap().position.x, 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_write_reverts_at_deadline() {
        let (store, coordinator, project) = setup();

        let id = coordinator
            .apply_create(IdeaDraft::new(project, "A"))
            .await
            .unwrap();
        settle().await;

        // The write takes far longer than the revert timeout.
        store.set_write_latency(Some(Duration::from_secs(120)));
        coordinator
            .apply_update(id, IdeaPatch::content("B"))
            .await
            .unwrap();
        assert_eq!(coordinator.idea(id).await.unwrap().content, "B");

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(coordinator.idea(id).await.unwrap().content, "A");
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn echo_clears_pending_without_reapplying() {
        let (store, coordinator, project) = setup();

        let id = coordinator
            .apply_create(IdeaDraft::new(project, "quiet"))
            .await
            .unwrap();
        settle().await;
        let stored = coordinator.idea(id).await.unwrap();

        let mut events = coordinator.view_events();
        store.set_write_latency(Some(Duration::from_millis(50)));
        coordinator
            .apply_update(id, IdeaPatch::content("quiet edit"))
            .await
            .unwrap();
        assert_eq!(coordinator.pending_count().await, 1);

        // The store's echo arrives while the write itself is still on the
        // wire: a row with our content and a server-assigned timestamp.
        let mut echo = coordinator.idea(id).await.unwrap();
        echo.updated_at = Utc::now();
        coordinator
            .reconcile(ChangeEvent {
                op: ChangeOp::Update,
                scope: crate::ScopeKey::ideas(project),
                row: echo,
            })
            .await;

        assert_eq!(coordinator.pending_count().await, 0);
        let after = coordinator.idea(id).await.unwrap();
        assert_eq!(after.content, "quiet edit");
        assert_eq!(after.id, stored.id);

        // The view announced the optimistic apply, never a revert back to
        // the old value and no re-apply on the echo.
        let mut contents = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                ViewEvent::Upserted { idea } => contents.push(idea.content),
                ViewEvent::Reverted { .. } => panic!("echo must not revert"),
                _ => {}
            }
        }
        assert_eq!(contents, vec!["quiet edit".to_string()]);
    }

    #[tokio::test]
    async fn remote_update_applies_directly() {
        let (store, coordinator, project) = setup();

        let row = store
            .insert(IdeaDraft::new(project, "remote"), ClientId::new())
            .await
            .unwrap();
        coordinator
            .reconcile(ChangeEvent {
                op: ChangeOp::Insert,
                scope: crate::ScopeKey::ideas(project),
                row: row.clone(),
            })
            .await;

        assert_eq!(coordinator.idea(row.id).await.unwrap().content, "remote");

        let updated = store
            .update(row.id, IdeaPatch::content("remote v2"))
            .await
            .unwrap();
        coordinator
            .reconcile(ChangeEvent {
                op: ChangeOp::Update,
                scope: crate::ScopeKey::ideas(project),
                row: updated,
            })
            .await;
        assert_eq!(coordinator.idea(row.id).await.unwrap().content, "remote v2");
    }

    #[tokio::test]
    async fn remote_delete_drops_entity_and_pending() {
        let (store, coordinator, project) = setup();

        let id = coordinator
            .apply_create(IdeaDraft::new(project, "cascade victim"))
            .await
            .unwrap();
        settle().await;
        let stored = coordinator.idea(id).await.unwrap();

        store.set_write_latency(Some(Duration::from_millis(50)));
        coordinator
            .apply_update(id, IdeaPatch::content("editing"))
            .await
            .unwrap();

        // Owning collection deleted server-side while our write is out.
        coordinator
            .reconcile(ChangeEvent {
                op: ChangeOp::Delete,
                scope: crate::ScopeKey::ideas(project),
                row: stored,
            })
            .await;

        assert!(coordinator.idea(id).await.is_none());
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn refresh_keeps_optimistic_values() {
        let (store, coordinator, project) = setup();

        let id = coordinator
            .apply_create(IdeaDraft::new(project, "mine"))
            .await
            .unwrap();
        settle().await;

        store.set_write_latency(Some(Duration::from_millis(50)));
        coordinator
            .apply_update(id, IdeaPatch::content("mine, edited"))
            .await
            .unwrap();

        // Snapshot from the store still carries the old content.
        let rows = store.list(project).await.unwrap();
        coordinator.refresh(project, rows).await;

        assert_eq!(
            coordinator.idea(id).await.unwrap().content,
            "mine, edited"
        );
    }

    #[tokio::test]
    async fn refresh_removes_rows_gone_from_store() {
        let (store, coordinator, project) = setup();

        let row = store
            .insert(IdeaDraft::new(project, "stale"), ClientId::new())
            .await
            .unwrap();
        coordinator.refresh(project, vec![row.clone()]).await;
        assert!(coordinator.idea(row.id).await.is_some());

        coordinator.refresh(project, Vec::new()).await;
        assert!(coordinator.idea(row.id).await.is_none());
    }

    #[tokio::test]
    async fn edits_queued_against_temp_id_reach_the_store() {
        let (store, coordinator, project) = setup();
        store.set_write_latency(Some(Duration::from_millis(10)));

        let local = coordinator
            .apply_create(IdeaDraft::new(project, "draft"))
            .await
            .unwrap();
        // Edit before the insert resolves.
        coordinator
            .apply_update(local, IdeaPatch::content("draft, polished"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;

        let rows = store.list(project).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "draft, polished");
        assert_eq!(
            coordinator.idea(local).await.unwrap().content,
            "draft, polished"
        );
        assert_eq!(coordinator.pending_count().await, 0);
    }
}
