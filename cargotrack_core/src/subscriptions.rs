//! Ref-counted entity subscriptions multiplexed over one push channel.
//!
//! Every UI consumer (the selected cargo, each visible list row) holds one
//! reference. The channel sees exactly one subscribe per entity while the
//! count is positive, and one unsubscribe when it drops to zero. The
//! backend forgets subscriptions across disconnects, so every transition
//! into `Connected` re-issues the full active set.

use cargotrack_env::{EntityId, PushChannel};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Interest in one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub entity_id: EntityId,

    pub ref_count: u32,

    /// Whether a subscribe message went out on the current connection
    delivered: bool,
}

impl Subscription {
    pub fn is_delivered(&self) -> bool {
        self.delivered
    }
}

pub struct SubscriptionRegistry<Ch: PushChannel> {
    channel: Arc<Ch>,

    /// Ordered so that re-subscription after reconnect is deterministic
    subscriptions: BTreeMap<EntityId, Subscription>,

    connected: bool,
}

impl<Ch: PushChannel> SubscriptionRegistry<Ch> {
    pub fn new(channel: Arc<Ch>) -> Self {
        Self {
            channel,
            subscriptions: BTreeMap::new(),
            connected: false,
        }
    }

    /// Adds one reference to `entity` and returns the new count.
    ///
    /// The first reference sends a subscribe message when connected;
    /// otherwise the subscription waits for the next `Connected` transition.
    pub fn subscribe(&mut self, entity: &EntityId) -> u32 {
        let sub = self
            .subscriptions
            .entry(entity.clone())
            .or_insert_with(|| Subscription {
                entity_id: entity.clone(),
                ref_count: 0,
                delivered: false,
            });
        sub.ref_count += 1;
        let count = sub.ref_count;

        if count == 1 && self.connected {
            self.deliver(entity);
        } else if count == 1 {
            debug!(entity = %entity, "subscription queued until connected");
        }
        count
    }

    /// Drops one reference to `entity` and returns the remaining count.
    ///
    /// At zero an unsubscribe goes out, best-effort: a failed send is logged
    /// and not retried since the server-side subscription expires on its own.
    /// Unsubscribing an entity without references is a no-op.
    pub fn unsubscribe(&mut self, entity: &EntityId) -> u32 {
        let Some(sub) = self.subscriptions.get_mut(entity) else {
            debug!(entity = %entity, "unsubscribe without subscription; ignored");
            return 0;
        };

        sub.ref_count -= 1;
        if sub.ref_count > 0 {
            return sub.ref_count;
        }

        let was_delivered = sub.delivered;
        self.subscriptions.remove(entity);

        if was_delivered && self.connected {
            if let Err(e) = self.channel.send_unsubscribe(entity) {
                warn!(entity = %entity, error = %e, "unsubscribe not delivered");
            }
        }
        0
    }

    /// Feeds a connectivity transition into the registry.
    ///
    /// Connecting after having been disconnected re-issues one subscribe
    /// per active entity. Losing the connection marks every subscription
    /// as undelivered.
    pub fn on_connection_change(&mut self, connected: bool) {
        if connected == self.connected {
            return;
        }
        self.connected = connected;

        if connected {
            let pending: Vec<EntityId> = self.subscriptions.keys().cloned().collect();
            debug!(count = pending.len(), "re-issuing subscriptions after connect");
            for entity in &pending {
                self.deliver(entity);
            }
        } else {
            for sub in self.subscriptions.values_mut() {
                sub.delivered = false;
            }
        }
    }

    fn deliver(&mut self, entity: &EntityId) {
        match self.channel.send_subscribe(entity) {
            Ok(()) => {
                if let Some(sub) = self.subscriptions.get_mut(entity) {
                    sub.delivered = true;
                }
            }
            Err(e) => {
                // Stays undelivered; the next reconnect picks it up
                warn!(entity = %entity, error = %e, "subscribe not delivered");
            }
        }
    }

    pub fn ref_count(&self, entity: &EntityId) -> u32 {
        self.subscriptions.get(entity).map_or(0, |s| s.ref_count)
    }

    pub fn is_subscribed(&self, entity: &EntityId) -> bool {
        self.subscriptions.contains_key(entity)
    }

    /// Entities with at least one reference, in id order.
    pub fn active(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
