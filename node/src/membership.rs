use chordkv_lib::dht_messages::{DhtMessage, Entry, NodeInfo};
use chordkv_lib::display_id;
use std::sync::atomic::Ordering;
use std::sync::PoisonError;

use crate::error::NodeError;
use crate::network_client::NetworkClient;
use crate::node::{log_error, log_info, log_warn, ChordNode};

impl<T: NetworkClient> ChordNode<T> {
    /// Makes this node a ring of one: it is its own successor and
    /// predecessor and owns every key.
    pub fn create_ring(&self) {
        let mut state = self.lock_state();
        state.predecessor = Some(self.info.clone());
        state.set_successor(self.info.clone());
        for finger in state.finger_table.iter_mut() {
            *finger = self.info.clone();
        }
        drop(state);

        self.alive.store(true, Ordering::SeqCst);
        log_info!(
            self.info.address,
            "Started new ring as {}",
            display_id(&self.info.id)
        );
    }

    /// Enters the ring known to `bootstrap`, or creates a new one when there
    /// is none.
    ///
    /// The successor is whatever the bootstrap node resolves for our id.
    /// We notify it straight away so it turns away requests for our range,
    /// then copy the keys that now fall to us and let it release them. The
    /// predecessor is left for `notify` to establish.
    pub async fn join(&self, bootstrap: Option<&str>) -> Result<(), NodeError> {
        let bootstrap = match bootstrap {
            Some(address) if address != self.info.address => address,
            _ => {
                self.create_ring();
                return Ok(());
            }
        };
        log_info!(self.info.address, "Joining ring via {}", bootstrap);

        let join_failure = |reason: String| NodeError::JoinFailure {
            bootstrap: bootstrap.to_string(),
            reason,
        };

        let successor = match self
            .call_peer(bootstrap, DhtMessage::FindSuccessor { id: self.info.id })
            .await
        {
            Ok(DhtMessage::FoundSuccessor { node, .. }) => node,
            Ok(other) => return Err(join_failure(format!("unexpected reply {:?}", other))),
            Err(e) => return Err(join_failure(e.to_string())),
        };
        if successor.id == self.info.id {
            return Err(join_failure(format!(
                "identifier {} is already taken by {}",
                display_id(&self.info.id),
                successor.address
            )));
        }

        {
            let mut state = self.lock_state();
            state.predecessor = None;
            state.set_successor(successor.clone());
            for finger in state.finger_table.iter_mut() {
                *finger = successor.clone();
            }
        }
        self.alive.store(true, Ordering::SeqCst);

        let notify = DhtMessage::Notify {
            candidate: self.info.clone(),
        };
        if let Err(e) = self.call_peer(&successor.address, notify).await {
            log_warn!(
                self.info.address,
                "Could not notify successor {}: {}",
                successor.address,
                e
            );
        }

        let count = self.pull_keys(&successor).await;
        log_info!(
            self.info.address,
            "Joined ring, successor {} ({}), took over {} keys",
            successor.address,
            display_id(&successor.id),
            count
        );
        Ok(())
    }

    /// Copies the keys `successor` holds outside `(self, successor]` and
    /// asks it to drop them once they are stored here.
    async fn pull_keys(&self, successor: &NodeInfo) -> usize {
        let transfer = DhtMessage::TransferRange {
            low_exclusive: successor.id,
            high_inclusive: self.info.id,
        };
        let entries = match self.call_peer(&successor.address, transfer).await {
            Ok(DhtMessage::Entries { entries }) => entries,
            Ok(other) => {
                log_warn!(
                    self.info.address,
                    "Key pull from {} returned {:?}",
                    successor.address,
                    other
                );
                return 0;
            }
            Err(e) => {
                log_warn!(
                    self.info.address,
                    "Key pull from {} failed: {}",
                    successor.address,
                    e
                );
                return 0;
            }
        };
        if entries.is_empty() {
            return 0;
        }

        let count = self.lock_state().absorb_missing(entries.clone());
        let release = DhtMessage::ReleaseEntries { entries };
        if let Err(e) = self.call_peer(&successor.address, release).await {
            log_warn!(
                self.info.address,
                "Successor {} did not release pulled keys: {}",
                successor.address,
                e
            );
        }
        count
    }

    /// Leaves the ring gracefully.
    ///
    /// The node is marked dead and its store handed to the successor before
    /// anything else. If the successor refuses, everything is put back and
    /// the node stays in the ring. Telling the predecessor is best effort;
    /// stabilization repairs it otherwise.
    pub async fn leave(&self) -> Result<(), NodeError> {
        let (entries, successor, predecessor) = {
            let mut state = self.lock_state();
            if self
                .alive
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(NodeError::AlreadyLeft);
            }
            let entries: Vec<_> = std::mem::take(&mut state.store).into_iter().collect();
            (entries, state.successor.clone(), state.predecessor.clone())
        };

        if self.is_self(&successor) {
            if !entries.is_empty() {
                log_warn!(
                    self.info.address,
                    "Last node leaving, {} keys are discarded",
                    entries.len()
                );
            }
            log_info!(self.info.address, "Left the ring");
            return Ok(());
        }

        let handoff = DhtMessage::Handoff {
            from: self.info.clone(),
            leaving: true,
            predecessor: predecessor.clone(),
            entries: entries.clone(),
        };
        let failure = match self.call_peer(&successor.address, handoff).await {
            Ok(DhtMessage::Ack) => None,
            Ok(other) => Some(format!("unexpected reply {:?}", other)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            self.rollback_leave(entries);
            log_error!(
                self.info.address,
                "Leave aborted, successor {} did not take the keys: {}",
                successor.address,
                reason
            );
            return Err(NodeError::HandoffFailed {
                successor: successor.address,
                reason,
            });
        }

        if let Some(predecessor) = predecessor.filter(|p| !self.is_self(p) && p.id != successor.id) {
            let splice = DhtMessage::SpliceSuccessor {
                leaving: self.info.clone(),
                successor: successor.clone(),
            };
            if let Err(e) = self.call_peer(&predecessor.address, splice).await {
                log_warn!(
                    self.info.address,
                    "Could not tell predecessor {} about the leave: {}",
                    predecessor.address,
                    e
                );
            }
        }

        log_info!(
            self.info.address,
            "Left the ring, {} keys handed to {}",
            entries.len(),
            successor.address
        );
        Ok(())
    }

    fn rollback_leave(&self, entries: Vec<Entry>) {
        {
            let mut state = self.lock_state();
            state.absorb_missing(entries);
            self.alive.store(true, Ordering::SeqCst);
        }

        let had_stabilizer = self
            .stabilizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if had_stabilizer {
            self.spawn_stabilizer();
        }
    }
}
