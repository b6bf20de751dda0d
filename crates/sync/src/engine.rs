/// The single entry point for the presentation layer: composes the
/// optimistic coordinator, the lock service and the subscription
/// coordinator into the operations a canvas needs, every one returning a
/// result instead of panicking so the UI can render optimistic state
/// uniformly.
use board::{
    render_anchor, BoxSize, ClientId, Idea, IdeaDraft, IdeaId, IdeaPatch, Position, ProjectId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::{
    ChangeOp, ChannelMessage, ChannelNotice, EditLock, IdeaStore, LockResult, LockService,
    OptimisticCoordinator, Result, ScopeKey, Subscription, SubscriptionCoordinator, SyncConfig,
    SyncError, ViewEvent,
};

struct Attachment {
    project: ProjectId,
    subscription: Subscription,
    pump: JoinHandle<()>,
    poller: JoinHandle<()>,
}

pub struct SyncEngine {
    store: Arc<dyn IdeaStore>,
    client: ClientId,
    cfg: SyncConfig,
    coordinator: OptimisticCoordinator,
    locks: LockService,
    subscriptions: SubscriptionCoordinator,
    attachment: Mutex<Option<Attachment>>,
    sweeper: JoinHandle<()>,
    realtime_up: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn IdeaStore>, client: ClientId) -> Self {
        Self::with_config(store, client, SyncConfig::default())
    }

    pub fn with_config(store: Arc<dyn IdeaStore>, client: ClientId, cfg: SyncConfig) -> Self {
        let coordinator = OptimisticCoordinator::new(Arc::clone(&store), client, cfg.clone());
        let locks = LockService::new(Arc::clone(&store), client, cfg.clone());
        let subscriptions = SubscriptionCoordinator::new(Arc::clone(&store), cfg.clone());
        let sweeper = locks.spawn_sweeper();

        Self {
            store,
            client,
            cfg,
            coordinator,
            locks,
            subscriptions,
            attachment: Mutex::new(None),
            sweeper,
            realtime_up: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Wire this engine to a project: fetch the current rows, open the
    /// realtime channel and keep reconciling until `detach`. Attaching to
    /// another project replaces the previous attachment.
    pub async fn attach(&self, project: ProjectId) {
        self.detach();

        match self.store.list(project).await {
            Ok(rows) => self.coordinator.refresh(project, rows).await,
            Err(error) => warn!(%project, %error, "initial snapshot fetch failed"),
        }

        let (subscription, mut rx) = self.subscriptions.subscribe(ScopeKey::ideas(project));

        let coordinator = self.coordinator.clone();
        let locks = self.locks.clone();
        let store = Arc::clone(&self.store);
        let realtime_up = Arc::clone(&self.realtime_up);
        let pump = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    ChannelMessage::Event(event) => {
                        match event.op {
                            ChangeOp::Delete => locks.observe_delete(event.row.id).await,
                            _ => locks.observe_remote(&event.row).await,
                        }
                        coordinator.reconcile(event).await;
                    }
                    ChannelMessage::Notice(ChannelNotice::Connected) => {
                        realtime_up.store(true, Ordering::SeqCst);
                        // Delivery may have gapped while we were away;
                        // resume from a fresh snapshot, not from deltas.
                        match store.list(project).await {
                            Ok(rows) => coordinator.refresh(project, rows).await,
                            Err(error) => {
                                warn!(%project, %error, "post-connect snapshot fetch failed")
                            }
                        }
                    }
                    ChannelMessage::Notice(ChannelNotice::Disconnected) => {
                        realtime_up.store(false, Ordering::SeqCst);
                        info!(%project, "realtime down, degrading to polling");
                    }
                }
            }
        });

        let coordinator = self.coordinator.clone();
        let store = Arc::clone(&self.store);
        let realtime_up = Arc::clone(&self.realtime_up);
        let poll_interval = self.cfg.poll_interval;
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if realtime_up.load(Ordering::SeqCst) {
                    continue;
                }
                match store.list(project).await {
                    Ok(rows) => coordinator.refresh(project, rows).await,
                    Err(error) => warn!(%project, %error, "poll refresh failed"),
                }
            }
        });

        *self.attachment.lock().unwrap() = Some(Attachment {
            project,
            subscription,
            pump,
            poller,
        });
    }

    /// Tear down the realtime attachment. Idempotent.
    pub fn detach(&self) {
        if let Some(attachment) = self.attachment.lock().unwrap().take() {
            attachment.subscription.unsubscribe();
            attachment.pump.abort();
            attachment.poller.abort();
            self.realtime_up.store(false, Ordering::SeqCst);
        }
    }

    pub fn attached_project(&self) -> Option<ProjectId> {
        self.attachment
            .lock()
            .unwrap()
            .as_ref()
            .map(|attachment| attachment.project)
    }

    pub async fn create_idea(&self, draft: IdeaDraft) -> Result<IdeaId> {
        self.coordinator.apply_create(draft).await
    }

    /// Content edits proceed even against a foreign lock: the lock is an
    /// affordance hint, not a write gate.
    pub async fn update_idea(&self, id: IdeaId, patch: IdeaPatch) -> Result<()> {
        if !self.locks.is_editable(id).await {
            warn!(%id, "editing despite a foreign advisory lock");
        }
        self.coordinator.apply_update(id, patch).await
    }

    pub async fn delete_idea(&self, id: IdeaId) -> Result<()> {
        self.coordinator.apply_delete(id).await
    }

    /// Drag-end: writes the position together with the box snapshot that
    /// anchors it.
    pub async fn move_idea(
        &self,
        id: IdeaId,
        position: Position,
        current_box: BoxSize,
    ) -> Result<()> {
        self.coordinator.apply_move(id, position, current_box).await
    }

    /// Flip the collapse state. Deliberately leaves the stored anchor
    /// untouched; the render-time adjustment absorbs the size change.
    pub async fn toggle_collapsed(&self, id: IdeaId) -> Result<bool> {
        let idea = self
            .coordinator
            .idea(id)
            .await
            .ok_or(SyncError::NotFound(id))?;
        let next = !idea.collapsed;
        self.coordinator
            .apply_update(id, IdeaPatch::collapsed(next))
            .await?;
        Ok(next)
    }

    /// Claim the edit lock before opening a text editor. Denial comes back
    /// as `LockDenied` so the UI can show who is editing; it never blocks
    /// a write that happens anyway.
    pub async fn acquire_lock(&self, id: IdeaId) -> Result<LockResult> {
        let result = self.locks.acquire(id).await;
        match (result.granted, result.held_by) {
            (false, Some(holder)) => Err(SyncError::LockDenied { holder }),
            _ => Ok(result),
        }
    }

    pub async fn release_lock(&self, id: IdeaId) {
        self.locks.release(id).await;
    }

    pub async fn is_editable(&self, id: IdeaId) -> bool {
        self.locks.is_editable(id).await
    }

    pub async fn lock_info(&self, id: IdeaId) -> Option<EditLock> {
        self.locks.lock_info(id).await
    }

    /// Where the card should be centered right now, compensating for any
    /// box-size change since its position was anchored.
    pub async fn card_anchor(&self, id: IdeaId, current_box: BoxSize) -> Result<Position> {
        current_box.validate()?;
        let idea = self
            .coordinator
            .idea(id)
            .await
            .ok_or(SyncError::NotFound(id))?;
        Ok(render_anchor(
            idea.position,
            idea.anchor_dims.as_ref(),
            current_box,
            idea.collapsed,
        ))
    }

    pub async fn snapshot(&self) -> Vec<Idea> {
        self.coordinator.snapshot().await
    }

    pub async fn idea(&self, id: IdeaId) -> Option<Idea> {
        self.coordinator.idea(id).await
    }

    pub async fn pending_count(&self) -> usize {
        self.coordinator.pending_count().await
    }

    pub fn view_events(&self) -> broadcast::Receiver<ViewEvent> {
        self.coordinator.view_events()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.detach();
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use board::{capture_anchor, Priority};
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn engine_pair() -> (Arc<MemoryStore>, SyncEngine, SyncEngine, ProjectId) {
        let store = Arc::new(MemoryStore::new());
        let alice = SyncEngine::new(store.clone(), ClientId::new());
        let bob = SyncEngine::new(store.clone(), ClientId::new());
        (store, alice, bob, ProjectId::new())
    }

    #[tokio::test]
    async fn toggle_collapsed_preserves_anchor_dims() {
        let (_, engine, _, project) = engine_pair();
        engine.attach(project).await;

        let id = engine
            .create_idea(IdeaDraft::new(project, "card"))
            .await
            .unwrap();
        settle().await;

        let dragged_box = BoxSize::new(100.0, 50.0);
        engine
            .move_idea(id, Position::new(300.0, 200.0), dragged_box)
            .await
            .unwrap();
        settle().await;

        let anchored = engine.idea(id).await.unwrap().anchor_dims.unwrap();
        assert_eq!(anchored, capture_anchor(dragged_box, false));

        engine.toggle_collapsed(id).await.unwrap();
        settle().await;

        let idea = engine.idea(id).await.unwrap();
        assert!(idea.collapsed);
        // The anchor still reflects the box at drag time.
        assert_eq!(idea.anchor_dims.unwrap(), anchored);
    }

    #[tokio::test]
    async fn card_anchor_adjusts_for_box_growth() {
        let (_, engine, _, project) = engine_pair();
        engine.attach(project).await;

        let id = engine
            .create_idea(IdeaDraft::new(project, "card").with_priority(Priority::High))
            .await
            .unwrap();
        settle().await;

        engine
            .move_idea(id, Position::new(300.0, 200.0), BoxSize::new(100.0, 50.0))
            .await
            .unwrap();
        settle().await;

        let expanded = engine
            .card_anchor(id, BoxSize::new(130.0, 90.0))
            .await
            .unwrap();
        assert_eq!(expanded, Position::new(315.0, 220.0));

        let back = engine
            .card_anchor(id, BoxSize::new(100.0, 50.0))
            .await
            .unwrap();
        assert_eq!(back, Position::new(300.0, 200.0));
    }

    #[tokio::test]
    async fn acquire_lock_reports_holder_on_denial() {
        let (_, alice, bob, project) = engine_pair();
        alice.attach(project).await;
        bob.attach(project).await;

        let id = alice
            .create_idea(IdeaDraft::new(project, "contested"))
            .await
            .unwrap();
        settle().await;
        let stored = alice.idea(id).await.unwrap().id;

        alice.acquire_lock(stored).await.unwrap();
        // Wait out the debounced lock write plus event propagation.
        tokio::time::sleep(Duration::from_millis(400)).await;
        settle().await;

        let denied = bob.acquire_lock(stored).await;
        match denied {
            Err(SyncError::LockDenied { holder }) => assert_eq!(holder, alice.client()),
            other => panic!("expected LockDenied, got {other:?}"),
        }
        assert!(!bob.is_editable(stored).await);
        assert!(alice.is_editable(stored).await);
    }

    #[tokio::test]
    async fn detach_is_idempotent_and_reattachable() {
        let (_, engine, _, project) = engine_pair();
        engine.attach(project).await;
        assert_eq!(engine.attached_project(), Some(project));

        engine.detach();
        engine.detach();
        assert_eq!(engine.attached_project(), None);

        engine.attach(project).await;
        assert_eq!(engine.attached_project(), Some(project));
    }
}
