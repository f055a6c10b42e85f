use chordkv_lib::dht_messages::{DhtMessage, Entry, NodeInfo};
use chordkv_lib::display_id;
use log::debug;
use rand::Rng;
use std::collections::HashSet;
use std::sync::PoisonError;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

use crate::error::NodeError;
use crate::network_client::NetworkClient;
use crate::node::{log_error, log_info, log_warn, ChordNode};

impl<T: NetworkClient> ChordNode<T> {
    /// Verifies the successor pointer and tells the successor about us.
    ///
    /// A dead successor is replaced by the first alive finger. Otherwise the
    /// successor's predecessor is adopted when it sits strictly between us
    /// and the successor.
    pub async fn stabilize(&self) -> Result<(), NodeError> {
        let successor = self.successor();
        debug!(
            "[{}] Stabilize: current successor is {}",
            self.info.address, successor.address
        );

        let mut failure = None;
        if !self.ping(&successor).await {
            let replacement = self.recover_successor(&successor).await;
            log_warn!(
                self.info.address,
                "Successor {} is not alive, replacing it with {}",
                successor.address,
                replacement.address
            );
            self.replace_successor(&successor, replacement);
        } else {
            match self.fetch_predecessor(&successor).await {
                Ok(Some(x)) => {
                    if !self.is_self(&x)
                        && self.space.in_open(&x.id, &self.info.id, &successor.id)
                        && self.ping(&x).await
                    {
                        debug!(
                            "[{}] Stabilize: updating successor from {} to {}",
                            self.info.address, successor.address, x.address
                        );
                        self.replace_successor(&successor, x);
                    }
                }
                Ok(None) => {
                    debug!(
                        "[{}] Stabilize: successor {} has no predecessor",
                        self.info.address, successor.address
                    );
                }
                Err(e) => failure = Some(e),
            }
        }

        let current = self.successor();
        if !self.is_self(&current) {
            if let Err(e) = self
                .call_peer(
                    &current.address,
                    DhtMessage::Notify {
                        candidate: self.info.clone(),
                    },
                )
                .await
            {
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Only swaps if nobody changed the successor while we were talking to
    /// peers.
    fn replace_successor(&self, expected: &NodeInfo, replacement: NodeInfo) {
        let mut state = self.lock_state();
        if state.successor.id == expected.id {
            state.set_successor(replacement);
        }
    }

    /// First alive finger in increasing index order, skipping ourselves and
    /// the dead successor. Falls back to ourselves, leaving a singleton ring
    /// that a later `notify` can rejoin.
    async fn recover_successor(&self, dead: &NodeInfo) -> NodeInfo {
        let fingers = self.finger_table();
        let mut probed = HashSet::from([self.info.id, dead.id]);

        for finger in fingers {
            if !probed.insert(finger.id) {
                continue;
            }
            if self.ping(&finger).await {
                return finger;
            }
        }

        log_warn!(
            self.info.address,
            "No alive finger left, continuing as a single-node ring"
        );
        self.info.clone()
    }

    /// Inbound side of stabilization: `candidate` thinks it is our
    /// predecessor.
    ///
    /// Accepted when we have no predecessor, when the current one is dead, or
    /// when the candidate is strictly closer. From then on requests for keys
    /// the candidate owns are turned away, and copies of those keys are pushed
    /// to it; they are dropped here once it acknowledges them.
    pub async fn notify(&self, candidate: NodeInfo) {
        if self.is_self(&candidate) {
            return;
        }

        let current = self.predecessor();
        let accept = match &current {
            None => true,
            Some(p) if p.id == candidate.id => false,
            Some(p) if self.is_self(p) => true,
            Some(p) => {
                self.space.in_open(&candidate.id, &p.id, &self.info.id) || !self.ping(p).await
            }
        };
        if !accept {
            debug!(
                "[{}] Notify: keeping current predecessor {:?}",
                self.info.address,
                current.as_ref().map(|p| &p.address)
            );
            return;
        }

        let moving = {
            let mut state = self.lock_state();
            let unchanged = state.predecessor.as_ref().map(|p| p.id) == current.as_ref().map(|p| p.id);
            if !unchanged {
                debug!(
                    "[{}] Notify: predecessor changed concurrently, ignoring {}",
                    self.info.address, candidate.address
                );
                return;
            }
            state.predecessor = Some(candidate.clone());
            if state.successor.id == self.info.id {
                state.set_successor(candidate.clone());
            }
            // Everything outside (candidate, self] belongs to the candidate now
            state
                .strays(&self.space, &self.info)
                .map(|(_, entries)| entries)
                .unwrap_or_default()
        };

        log_info!(
            self.info.address,
            "Predecessor is now {} ({})",
            candidate.address,
            display_id(&candidate.id)
        );

        if !moving.is_empty() {
            self.push_entries(&candidate, moving).await;
        }
    }

    /// Pushes keys held here that belong behind the predecessor. Keys only
    /// leave this node once the predecessor has acknowledged them, so a
    /// failed push is simply retried on the next round.
    pub async fn hand_back_strays(&self) {
        let strays = self.lock_state().strays(&self.space, &self.info);
        if let Some((predecessor, entries)) = strays {
            self.push_entries(&predecessor, entries).await;
        }
    }

    async fn push_entries(&self, target: &NodeInfo, entries: Vec<Entry>) {
        let count = entries.len();
        let result = self
            .call_peer(
                &target.address,
                DhtMessage::Handoff {
                    from: self.info.clone(),
                    leaving: false,
                    predecessor: None,
                    entries: entries.clone(),
                },
            )
            .await;

        match result {
            Ok(DhtMessage::Ack) => {
                let released = self.release_entries(&entries);
                log_info!(
                    self.info.address,
                    "Transferred {} keys to predecessor {} ({} released)",
                    count,
                    target.address,
                    released
                );
            }
            other => {
                log_error!(
                    self.info.address,
                    "Failed to transfer {} keys to {}: {:?}, keeping them",
                    count,
                    target.address,
                    other
                );
            }
        }
    }

    /// Recomputes every finger `i` as the owner of `id + 2^i`.
    pub async fn fix_fingers(&self) {
        for i in 0..self.space.finger_count() {
            let start = self.space.finger_start(&self.info.id, i);
            let owner = self.find_successor(start).await;
            if let Some(entry) = self.lock_state().finger_table.get_mut(i) {
                *entry = owner;
            }
        }
    }

    /// Clears the predecessor if it no longer answers.
    pub async fn check_predecessor(&self) {
        let Some(predecessor) = self.predecessor() else {
            return;
        };
        if self.is_self(&predecessor) || self.ping(&predecessor).await {
            return;
        }

        let mut state = self.lock_state();
        if state.predecessor.as_ref().map(|p| p.id) == Some(predecessor.id) {
            state.predecessor = None;
            log_warn!(
                self.info.address,
                "Predecessor {} is dead, cleared",
                predecessor.address
            );
        }
    }

    /// One pass of stabilize, fix_fingers and check_predecessor, followed
    /// by handing back keys that belong to the predecessor.
    pub async fn run_stabilization_round(&self) -> Result<(), NodeError> {
        let started = Instant::now();
        let result = self.stabilize().await;
        self.fix_fingers().await;
        self.check_predecessor().await;
        self.hand_back_strays().await;

        let mut metrics = self.lock_metrics();
        metrics.stabilization_rounds += 1;
        metrics.last_round_duration = started.elapsed();
        if result.is_err() {
            metrics.stabilization_errors += 1;
        }
        result
    }

    /// Starts the periodic stabilization task unless one is already running.
    ///
    /// Each round runs in its own task, so a panic inside a round is logged
    /// like any other failed round. The loop ends once the node has left.
    pub fn spawn_stabilizer(&self) {
        let mut slot = self
            .stabilizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let node = self.clone();
        *slot = Some(tokio::spawn(async move {
            // Spread the first round so nodes started together don't tick in lockstep
            let jitter = {
                let max = node.stabilize_interval.as_millis() as u64 / 4;
                Duration::from_millis(rand::thread_rng().gen_range(0..=max))
            };
            tokio::time::sleep(jitter).await;

            let mut ticker = tokio::time::interval(node.stabilize_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while node.is_alive() {
                ticker.tick().await;
                if !node.is_alive() {
                    break;
                }

                let round_node = node.clone();
                match tokio::spawn(async move { round_node.run_stabilization_round().await }).await
                {
                    Ok(Ok(())) => node.debug_ring_state(),
                    Ok(Err(e)) => {
                        log_warn!(node.info.address, "Stabilization round failed: {}", e)
                    }
                    Err(e) => {
                        node.lock_metrics().stabilization_errors += 1;
                        log_error!(node.info.address, "Stabilization round aborted: {}", e)
                    }
                }
            }
            log_info!(node.info.address, "Stabilizer stopped");
        }));
    }

    /// Whether a stabilizer was started for this node and is still running.
    pub fn stabilizer_running(&self) -> bool {
        self.stabilizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
