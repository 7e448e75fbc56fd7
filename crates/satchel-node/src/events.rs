//! Wallet notifications.
//!
//! The engine publishes [`WalletEvent`]s to an [`EventBus`]. Consumers either
//! pull from a [`Subscription`] channel or register a [`WalletObserver`]
//! callback. Events are delivered in publication order to every live
//! subscriber. Dropping the handle (or calling `cancel`) unsubscribes without
//! touching the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use satchel_core::types::Hash256;
use satchel_network::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WalletEvent {
    PeerConnected {
        #[serde(serialize_with = "serialize_peer")]
        peer: PeerId,
        peers: usize,
    },
    PeerDisconnected {
        #[serde(serialize_with = "serialize_peer")]
        peer: PeerId,
        peers: usize,
    },
    BlockReceived { hash: Hash256, height: u64, blocks_remaining: u64 },
    CoinsReceived { txid: Hash256, amount: u64, balance: u64 },
    CoinsSent { txid: Hash256, amount: u64, balance: u64 },
    /// Every known block is applied. Once per catch-up.
    SyncComplete { height: Option<u64> },
    /// The configured peer could not be reached within the retry budget.
    PeersExhausted,
}

fn serialize_peer<S: serde::Serializer>(peer: &PeerId, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(peer)
}

/// Callback-style consumer.
pub trait WalletObserver: Send + Sync {
    fn on_event(&self, event: &WalletEvent);
}

enum Sink {
    Channel(mpsc::UnboundedSender<WalletEvent>),
    Observer(Arc<dyn WalletObserver>),
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(u64, Sink)>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        self.sinks.lock().retain(|(sid, _)| *sid != id);
    }
}

/// Fan-out of wallet events to any number of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, sink: Sink) -> u64 {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.sinks.lock().push((id, sink));
        id
    }

    /// Channel subscription. Nothing published before this call is delivered.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(Sink::Channel(tx));
        Subscription { rx, handle: SubscriptionHandle { id, registry: Arc::downgrade(&self.registry) } }
    }

    /// Register a callback. It runs on the publishing task and must not block.
    pub fn observe(&self, observer: Arc<dyn WalletObserver>) -> SubscriptionHandle {
        let id = self.register(Sink::Observer(observer));
        SubscriptionHandle { id, registry: Arc::downgrade(&self.registry) }
    }

    pub fn publish(&self, event: WalletEvent) {
        let mut sinks = self.registry.sinks.lock();
        sinks.retain(|(_, sink)| match sink {
            Sink::Channel(tx) => tx.send(event.clone()).is_ok(),
            Sink::Observer(observer) => {
                observer.on_event(&event);
                true
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.sinks.lock().len()
    }
}

/// Unregisters on drop.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<Registry>,
}

impl SubscriptionHandle {
    pub fn cancel(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Pull-style subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<WalletEvent>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Next event, or `None` once the engine has gone away.
    pub async fn recv(&mut self) -> Option<WalletEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WalletEvent> {
        self.rx.try_recv().ok()
    }

    pub fn cancel(self) {
        drop(self.handle);
    }
}
