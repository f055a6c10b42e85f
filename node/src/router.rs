use chordkv_lib::dht_messages::{DhtMessage, NodeId, NodeInfo};
use chordkv_lib::{display_id, IdentifierSpace};
use log::debug;

use crate::network_client::NetworkClient;
use crate::node::{log_warn, ChordNode};

/// Result of routing an identifier to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub node: NodeInfo,
    /// Forwards taken after the node that started the lookup.
    pub hops: u32,
}

enum Route {
    Done(NodeInfo),
    Forward(NodeInfo),
}

/// Highest finger lying strictly between `own` and `id`, or `own` itself
/// when no finger qualifies.
pub(crate) fn closest_preceding_in(
    space: &IdentifierSpace,
    own: &NodeInfo,
    finger_table: &[NodeInfo],
    id: &NodeId,
) -> NodeInfo {
    finger_table
        .iter()
        .rev()
        .find(|finger| space.in_open(&finger.id, &own.id, id))
        .unwrap_or(own)
        .clone()
}

impl<T: NetworkClient> ChordNode<T> {
    /// Owner of `id`, i.e. the first node at or after it on the ring.
    pub async fn find_successor(&self, id: NodeId) -> NodeInfo {
        self.lookup(id).await.node
    }

    /// Like `find_successor` but also reports how many forwards were needed.
    ///
    /// The local decision is made in one critical section and the lock is
    /// released before any forward. A failed forward degrades to our own
    /// successor instead of failing the lookup.
    pub async fn lookup(&self, id: NodeId) -> Lookup {
        let route = {
            let state = self.lock_state();
            if self
                .space
                .in_half_open(&id, &self.info.id, &state.successor.id)
            {
                Route::Done(state.successor.clone())
            } else {
                let next = closest_preceding_in(&self.space, &self.info, &state.finger_table, &id);
                if self.is_self(&next) {
                    debug!(
                        "[{}] Lookup {}: no closer finger, answering with successor",
                        self.info.address,
                        display_id(&id)
                    );
                    Route::Done(state.successor.clone())
                } else {
                    Route::Forward(next)
                }
            }
        };

        let lookup = match route {
            Route::Done(node) => Lookup { node, hops: 0 },
            Route::Forward(next) => self.forward_lookup(&next, id).await,
        };
        self.lock_metrics().record_lookup(lookup.hops);
        lookup
    }

    async fn forward_lookup(&self, next: &NodeInfo, id: NodeId) -> Lookup {
        match self
            .call_peer(&next.address, DhtMessage::FindSuccessor { id })
            .await
        {
            Ok(DhtMessage::FoundSuccessor { node, hops }) => Lookup {
                node,
                hops: hops.saturating_add(1),
            },
            Ok(other) => {
                log_warn!(
                    self.info.address,
                    "Lookup {} degraded: unexpected reply from {}: {:?}",
                    display_id(&id),
                    next.address,
                    other
                );
                self.degraded_lookup()
            }
            Err(e) => {
                log_warn!(
                    self.info.address,
                    "Lookup {} degraded: {}",
                    display_id(&id),
                    e
                );
                self.degraded_lookup()
            }
        }
    }

    fn degraded_lookup(&self) -> Lookup {
        Lookup {
            node: self.successor(),
            hops: 0,
        }
    }

    /// Finger that most immediately precedes `id`, or this node if none does.
    pub fn closest_preceding_node(&self, id: NodeId) -> NodeInfo {
        let state = self.lock_state();
        closest_preceding_in(&self.space, &self.info, &state.finger_table, &id)
    }
}
