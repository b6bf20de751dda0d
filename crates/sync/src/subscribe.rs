/// Realtime channel management: exactly one live stream per scope, fanned
/// out to every interested consumer. Channels are keyed by scope, so
/// repeated subscribe calls reuse the connection instead of leaking a new
/// one, and the underlying stream is torn down when the last subscriber
/// leaves.
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{ChangeEvent, IdeaStore, ScopeKey, SyncConfig};

/// What a subscriber receives: scoped change events, interleaved with
/// connection-state notices so consumers can pause reconciliation and
/// re-snapshot instead of assuming gapless delivery.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Event(ChangeEvent),
    Notice(ChannelNotice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelNotice {
    /// The stream is (re)established; state may have been missed, fetch a
    /// fresh snapshot before trusting deltas again.
    Connected,
    Disconnected,
}

struct ChannelEntry {
    subscribers: HashMap<u64, mpsc::UnboundedSender<ChannelMessage>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<ScopeKey, ChannelEntry>,
    next_subscriber: u64,
}

impl Registry {
    fn fan_out(&mut self, scope: ScopeKey, message: ChannelMessage) {
        if let Some(entry) = self.channels.get_mut(&scope) {
            entry
                .subscribers
                .retain(|_, tx| tx.send(message.clone()).is_ok());
        }
    }
}

pub struct SubscriptionCoordinator {
    store: Arc<dyn IdeaStore>,
    cfg: SyncConfig,
    registry: Arc<Mutex<Registry>>,
}

impl SubscriptionCoordinator {
    pub fn new(store: Arc<dyn IdeaStore>, cfg: SyncConfig) -> Self {
        Self {
            store,
            cfg,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Register a consumer for `scope`. The first subscriber opens the
    /// channel; later ones share it. Failures to connect are retried in
    /// the background and never surface here: realtime is an optimization,
    /// not a correctness dependency.
    pub fn subscribe(
        &self,
        scope: ScopeKey,
    ) -> (Subscription, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock().unwrap();
        let subscriber = registry.next_subscriber;
        registry.next_subscriber += 1;

        match registry.channels.get_mut(&scope) {
            Some(entry) => {
                entry.subscribers.insert(subscriber, tx);
                debug!(channel = %scope.channel_name(), "joined existing channel");
            }
            None => {
                let task = self.spawn_channel_task(scope);
                let mut subscribers = HashMap::new();
                subscribers.insert(subscriber, tx);
                registry
                    .channels
                    .insert(scope, ChannelEntry { subscribers, task });
                info!(channel = %scope.channel_name(), "opened realtime channel");
            }
        }

        (
            Subscription {
                scope,
                subscriber,
                registry: Arc::clone(&self.registry),
                active: AtomicBool::new(true),
            },
            rx,
        )
    }

    /// One task per open channel: connect, forward matching events, and
    /// on stream end reconnect with exponential backoff.
    fn spawn_channel_task(&self, scope: ScopeKey) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let cfg = self.cfg.clone();
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                match store.subscribe(scope).await {
                    Ok(mut stream) => {
                        attempt = 0;
                        registry
                            .lock()
                            .unwrap()
                            .fan_out(scope, ChannelMessage::Notice(ChannelNotice::Connected));

                        while let Some(event) = stream.next().await {
                            if event.scope != scope {
                                // The transport multiplexes more broadly
                                // than this channel's scope.
                                debug!(
                                    channel = %scope.channel_name(),
                                    received = %event.scope,
                                    "filtered cross-scope event"
                                );
                                continue;
                            }
                            registry
                                .lock()
                                .unwrap()
                                .fan_out(scope, ChannelMessage::Event(event));
                        }

                        warn!(channel = %scope.channel_name(), "change stream ended");
                        registry.lock().unwrap().fan_out(
                            scope,
                            ChannelMessage::Notice(ChannelNotice::Disconnected),
                        );
                    }
                    Err(error) => {
                        warn!(
                            channel = %scope.channel_name(),
                            %error,
                            "channel connect failed"
                        );
                    }
                }

                let delay = cfg.reconnect_delay(attempt);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        })
    }

    pub fn channel_count(&self) -> usize {
        self.registry.lock().unwrap().channels.len()
    }

    pub fn subscriber_count(&self, scope: ScopeKey) -> usize {
        self.registry
            .lock()
            .unwrap()
            .channels
            .get(&scope)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }
}

/// Handle owned by one subscriber. Unsubscribing is idempotent and also
/// happens on drop; the channel closes when the last handle goes.
pub struct Subscription {
    scope: ScopeKey,
    subscriber: u64,
    registry: Arc<Mutex<Registry>>,
    active: AtomicBool,
}

impl Subscription {
    pub fn scope(&self) -> ScopeKey {
        self.scope
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut registry = self.registry.lock().unwrap();
        let close = match registry.channels.get_mut(&self.scope) {
            Some(entry) => {
                entry.subscribers.remove(&self.subscriber);
                entry.subscribers.is_empty()
            }
            None => false,
        };
        if close {
            if let Some(entry) = registry.channels.remove(&self.scope) {
                entry.task.abort();
                info!(channel = %self.scope.channel_name(), "closed realtime channel");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use board::{ClientId, IdeaDraft, ProjectId};
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, SubscriptionCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = SubscriptionCoordinator::new(store.clone(), SyncConfig::default());
        (store, coordinator)
    }

    async fn recv_with_timeout(
        rx: &mut mpsc::UnboundedReceiver<ChannelMessage>,
    ) -> Option<ChannelMessage> {
        tokio::select! {
            message = rx.recv() => message,
            _ = tokio::time::sleep(Duration::from_secs(1)) => panic!("timed out waiting for channel message"),
        }
    }

    #[tokio::test]
    async fn same_scope_shares_one_channel() {
        let (store, coordinator) = setup();
        let scope = ScopeKey::ideas(ProjectId::new());

        let (sub_a, mut rx_a) = coordinator.subscribe(scope);
        let (sub_b, mut rx_b) = coordinator.subscribe(scope);

        assert_eq!(coordinator.channel_count(), 1);
        assert_eq!(coordinator.subscriber_count(scope), 2);

        // Both consumers see the connect notice from the single stream.
        assert!(matches!(
            recv_with_timeout(&mut rx_a).await,
            Some(ChannelMessage::Notice(ChannelNotice::Connected))
        ));
        assert!(matches!(
            recv_with_timeout(&mut rx_b).await,
            Some(ChannelMessage::Notice(ChannelNotice::Connected))
        ));
        assert_eq!(store.counters().subscribes, 1);

        drop(sub_a);
        drop(sub_b);
    }

    #[tokio::test]
    async fn unsubscribe_tears_down_only_when_last() {
        let (_, coordinator) = setup();
        let scope = ScopeKey::ideas(ProjectId::new());

        let (sub_a, _rx_a) = coordinator.subscribe(scope);
        let (sub_b, _rx_b) = coordinator.subscribe(scope);

        sub_a.unsubscribe();
        assert_eq!(coordinator.channel_count(), 1);
        assert_eq!(coordinator.subscriber_count(scope), 1);

        // Safe to call twice.
        sub_a.unsubscribe();
        assert_eq!(coordinator.subscriber_count(scope), 1);

        sub_b.unsubscribe();
        assert_eq!(coordinator.channel_count(), 0);
    }

    #[tokio::test]
    async fn events_outside_the_scope_are_filtered() {
        let (store, coordinator) = setup();
        let watched = ProjectId::new();
        let other = ProjectId::new();
        let scope = ScopeKey::ideas(watched);

        let (_sub, mut rx) = coordinator.subscribe(scope);
        assert!(matches!(
            recv_with_timeout(&mut rx).await,
            Some(ChannelMessage::Notice(ChannelNotice::Connected))
        ));

        // The memory transport fans every event to every stream; only the
        // watched project's event may come through.
        store
            .insert(IdeaDraft::new(other, "elsewhere"), ClientId::new())
            .await
            .unwrap();
        let row = store
            .insert(IdeaDraft::new(watched, "here"), ClientId::new())
            .await
            .unwrap();

        match recv_with_timeout(&mut rx).await {
            Some(ChannelMessage::Event(event)) => {
                assert_eq!(event.scope, scope);
                assert_eq!(event.row.id, row.id);
            }
            message => panic!("expected the watched project's event, got {message:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_reconnects_with_backoff() {
        let (store, coordinator) = setup();
        let scope = ScopeKey::ideas(ProjectId::new());

        let (_sub, mut rx) = coordinator.subscribe(scope);
        assert!(matches!(
            recv_with_timeout(&mut rx).await,
            Some(ChannelMessage::Notice(ChannelNotice::Connected))
        ));

        store.disconnect_all();
        assert!(matches!(
            recv_with_timeout(&mut rx).await,
            Some(ChannelMessage::Notice(ChannelNotice::Disconnected))
        ));

        // Backoff elapses, the channel comes back on its own.
        assert!(matches!(
            recv_with_timeout(&mut rx).await,
            Some(ChannelMessage::Notice(ChannelNotice::Connected))
        ));
        assert_eq!(store.counters().subscribes, 2);
    }

    #[tokio::test]
    async fn subscribe_failure_keeps_retrying_without_erroring() {
        let (store, coordinator) = setup();
        store.fail_subscribe(true);
        let scope = ScopeKey::ideas(ProjectId::new());

        let (_sub, mut rx) = coordinator.subscribe(scope);
        assert_eq!(coordinator.channel_count(), 1);

        // Nothing arrives while the transport is down.
        tokio::select! {
            message = rx.recv() => panic!("unexpected message {message:?}"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
}
