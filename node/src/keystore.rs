use chordkv_lib::dht_messages::{DhtMessage, Entry, NodeId, NodeInfo};
use chordkv_lib::display_id;
use log::debug;

use crate::error::NodeError;
use crate::network_client::NetworkClient;
use crate::node::{log_info, log_warn, ChordNode};

/// Owner resolutions tried before a key operation gives up.
pub const KEY_OP_ATTEMPTS: u32 = 3;

/// `NotOwner` redirects followed before a key operation gives up.
pub const KEY_OP_REDIRECTS: u32 = 4;

impl<T: NetworkClient> ChordNode<T> {
    /// Stores `value` under `key` on whichever node owns `hash(key)`.
    pub async fn insert(&self, key: &str, value: Vec<u8>) -> Result<(), NodeError> {
        let request = DhtMessage::Put {
            key: key.to_string(),
            value,
        };
        match self.send_to_owner(key, request).await? {
            (_, DhtMessage::Ack) => Ok(()),
            (owner, other) => Err(NodeError::unexpected(&owner.address, other)),
        }
    }

    /// Looks `key` up on its owner. Absence is `Ok(None)`, not an error.
    pub async fn search(&self, key: &str) -> Result<Option<Vec<u8>>, NodeError> {
        let request = DhtMessage::Get {
            key: key.to_string(),
        };
        match self.send_to_owner(key, request).await? {
            (_, DhtMessage::Value { value, .. }) => Ok(value),
            (owner, other) => Err(NodeError::unexpected(&owner.address, other)),
        }
    }

    /// Removes `key` from its owner, reporting whether it was there.
    pub async fn delete(&self, key: &str) -> Result<bool, NodeError> {
        let request = DhtMessage::Delete {
            key: key.to_string(),
        };
        match self.send_to_owner(key, request).await? {
            (_, DhtMessage::Deleted { existed, .. }) => Ok(existed),
            (owner, other) => Err(NodeError::unexpected(&owner.address, other)),
        }
    }

    /// Resolves the owner of `key` and delivers `request` to it.
    ///
    /// A node that turns the request away names a closer node, which is
    /// tried next. An unreachable owner is dropped from the routing table
    /// and the lookup is retried.
    async fn send_to_owner(
        &self,
        key: &str,
        request: DhtMessage,
    ) -> Result<(NodeInfo, DhtMessage), NodeError> {
        if !self.is_alive() {
            return Err(NodeError::AlreadyLeft);
        }

        let id = self.space.hash(key);
        let mut failures = 0;
        let mut redirects = 0;
        let mut next_hop: Option<NodeInfo> = None;
        loop {
            let owner = match next_hop.take() {
                Some(node) => node,
                None => self.find_successor(id).await,
            };
            debug!(
                "[{}] Key {} ({}) is owned by {}",
                self.info.address,
                key,
                display_id(&id),
                owner.address
            );

            let reply = if self.is_self(&owner) {
                Ok(self.serve_key_request(request.clone()))
            } else {
                self.call_peer(&owner.address, request.clone()).await
            };

            match reply {
                Ok(DhtMessage::NotOwner { owner: closer, .. }) => {
                    redirects += 1;
                    if redirects > KEY_OP_REDIRECTS {
                        return Err(NodeError::OwnerUnresolved {
                            key: key.to_string(),
                            redirects: KEY_OP_REDIRECTS,
                        });
                    }
                    debug!(
                        "[{}] {} does not own key {}, trying {}",
                        self.info.address, owner.address, key, closer.address
                    );
                    next_hop = Some(closer);
                }
                Ok(reply) => return Ok((owner, reply)),
                Err(e) => {
                    failures += 1;
                    log_warn!(
                        self.info.address,
                        "Owner {} of key {} unreachable (attempt {}/{}): {}",
                        owner.address,
                        key,
                        failures,
                        KEY_OP_ATTEMPTS,
                        e
                    );
                    if failures >= KEY_OP_ATTEMPTS {
                        return Err(NodeError::OwnerUnreachable {
                            key: key.to_string(),
                            attempts: KEY_OP_ATTEMPTS,
                        });
                    }
                    self.forget_peer(&owner).await;
                }
            }
        }
    }

    /// Stops routing through `peer`. A dead successor can't simply be
    /// dropped, so that case runs a stabilize to find a replacement.
    pub(crate) async fn forget_peer(&self, peer: &NodeInfo) {
        let was_successor = {
            let mut state = self.lock_state();
            for finger in state.finger_table.iter_mut().skip(1) {
                if finger.id == peer.id {
                    *finger = self.info.clone();
                }
            }
            state.successor.id == peer.id
        };

        if was_successor {
            if let Err(e) = self.stabilize().await {
                debug!(
                    "[{}] Stabilize after losing {} failed: {}",
                    self.info.address, peer.address, e
                );
            }
        }
    }

    /// Answers a `Get`, `Put` or `Delete` against the local store, or
    /// `NotOwner` when the key belongs elsewhere. The ownership check and
    /// the store access share one critical section.
    pub(crate) fn serve_key_request(&self, request: DhtMessage) -> DhtMessage {
        let mut state = self.lock_state();
        let key = match &request {
            DhtMessage::Get { key } | DhtMessage::Put { key, .. } | DhtMessage::Delete { key } => {
                key.clone()
            }
            other => {
                return DhtMessage::Error {
                    message: format!("not a key request: {:?}", other),
                }
            }
        };
        if let Some(owner) = state.redirect_for(&self.space, &self.info, &self.space.hash(&key)) {
            return DhtMessage::NotOwner { key, owner };
        }

        match request {
            DhtMessage::Put { key, value } => {
                debug!("[{}] Stored key {}", self.info.address, key);
                state.store.insert(key, value);
                DhtMessage::Ack
            }
            DhtMessage::Delete { key } => DhtMessage::Deleted {
                existed: state.store.remove(&key).is_some(),
                key,
            },
            _ => DhtMessage::Value {
                value: state.store.get(&key).cloned(),
                key,
            },
        }
    }

    /// Writes straight into the local store, bypassing ownership.
    pub fn store_local(&self, key: String, value: Vec<u8>) {
        self.lock_state().store.insert(key, value);
    }

    pub fn retrieve_local(&self, key: &str) -> Option<Vec<u8>> {
        self.lock_state().store.get(key).cloned()
    }

    /// Every entry held locally, sorted by key.
    pub fn local_entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .lock_state()
            .store
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Copies of the local keys hashing into `(low_exclusive, high_inclusive]`
    /// that this node no longer owns. Keys it still serves are never handed
    /// out, and nothing is removed until the receiver releases it.
    pub fn transfer_range(&self, low_exclusive: &NodeId, high_inclusive: &NodeId) -> Vec<Entry> {
        let entries: Vec<Entry> = {
            let state = self.lock_state();
            state
                .copy_range(&self.space, low_exclusive, high_inclusive)
                .into_iter()
                .filter(|(key, _)| {
                    state
                        .redirect_for(&self.space, &self.info, &self.space.hash(key))
                        .is_some()
                })
                .collect()
        };
        if !entries.is_empty() {
            log_info!(
                self.info.address,
                "Handing out {} keys in ({}, {}]",
                entries.len(),
                display_id(low_exclusive),
                display_id(high_inclusive)
            );
        }
        entries
    }

    /// Drops entries the sender has taken over.
    pub fn release_entries(&self, entries: &[Entry]) -> usize {
        let released = self.lock_state().release(&self.space, &self.info, entries);
        if released > 0 {
            log_info!(self.info.address, "Released {} keys", released);
        }
        released
    }

    /// Installs keys pushed by `from`. When `from` is leaving we are its
    /// successor: we inherit its predecessor and stop routing through it.
    pub fn absorb_handoff(
        &self,
        from: NodeInfo,
        leaving: bool,
        predecessor: Option<NodeInfo>,
        entries: Vec<Entry>,
    ) {
        let mut state = self.lock_state();
        // A leaving node was the owner until now; otherwise local values are
        // newer than what was pushed
        let count = if leaving {
            state.absorb(entries)
        } else {
            state.absorb_missing(entries)
        };

        if leaving {
            let points_at_leaver = state
                .predecessor
                .as_ref()
                .map_or(true, |p| p.id == from.id);
            if points_at_leaver {
                state.predecessor = predecessor;
            }
            state.replace_peer(&from.id, &self.info);
        }
        drop(state);

        log_info!(
            self.info.address,
            "Absorbed {} keys from {}{}",
            count,
            from.address,
            if leaving { " (leaving)" } else { "" }
        );
    }

    /// Our successor `leaving` is departing; route to its successor instead.
    pub fn splice_successor(&self, leaving: NodeInfo, successor: NodeInfo) {
        let mut state = self.lock_state();
        state.replace_peer(&leaving.id, &successor);
        if state.predecessor.as_ref().is_some_and(|p| p.id == leaving.id) {
            state.predecessor = None;
        }
        drop(state);

        log_info!(
            self.info.address,
            "{} left, successor is now {}",
            leaving.address,
            successor.address
        );
    }
}
