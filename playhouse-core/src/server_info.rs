//! Peer directory (C6, §4.6). A concurrent map of known servers, updated
//! by mesh discovery heartbeats and queried by the sender facade to pick a
//! destination for service-level sends.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Play,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_id: String,
    pub bind_endpoint: String,
    pub role: ServerRole,
    pub service_id: u16,
    pub weight: u32,
    pub state: ServerState,
    pub last_heartbeat: Instant,
}

/// Peer directory, kept behind a single `RwLock` (mirrors C7/C4's
/// preference for simple concurrent structures over lock-free maps, since
/// updates are infrequent compared to reads).
pub struct ServerInfoCenter {
    peers: RwLock<HashMap<String, ServerInfo>>,
    round_robin_counters: RwLock<HashMap<u16, AtomicU64>>,
    missed_heartbeat_limit: u32,
}

impl ServerInfoCenter {
    pub fn new(missed_heartbeat_limit: u32) -> Self {
        ServerInfoCenter {
            peers: RwLock::new(HashMap::new()),
            round_robin_counters: RwLock::new(HashMap::new()),
            missed_heartbeat_limit,
        }
    }

    pub fn upsert(&self, info: ServerInfo) {
        let mut peers = self.peers.write().expect("server info poisoned");
        peers.insert(info.server_id.clone(), info);
    }

    pub fn touch_heartbeat(&self, server_id: &str) {
        let mut peers = self.peers.write().expect("server info poisoned");
        if let Some(info) = peers.get_mut(server_id) {
            info.last_heartbeat = Instant::now();
            info.state = ServerState::Running;
        }
    }

    /// Overrides a known peer's state directly, used by C13 when a
    /// heartbeat body or a Shutdown system message reports `paused` or
    /// `stopped` rather than the plain liveness `touch_heartbeat` assumes.
    pub fn set_state(&self, server_id: &str, state: ServerState) {
        let mut peers = self.peers.write().expect("server info poisoned");
        if let Some(info) = peers.get_mut(server_id) {
            info.state = state;
        }
    }

    pub fn find_by_id(&self, server_id: &str) -> Option<ServerInfo> {
        self.peers
            .read()
            .expect("server info poisoned")
            .get(server_id)
            .cloned()
    }

    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<ServerInfo> {
        self.peers
            .read()
            .expect("server info poisoned")
            .values()
            .find(|info| info.bind_endpoint == endpoint)
            .cloned()
    }

    fn live_peers_for_service(&self, service_id: u16) -> Vec<ServerInfo> {
        let peers = self.peers.read().expect("server info poisoned");
        let mut live: Vec<ServerInfo> = peers
            .values()
            .filter(|info| info.service_id == service_id && info.state == ServerState::Running)
            .cloned()
            .collect();
        live.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        live
    }

    /// Picks the next peer for `serviceId` in round-robin order. Returns
    /// `None` if no live peer exists for that service.
    pub fn find_round_robin(&self, service_id: u16) -> Option<ServerInfo> {
        let live = self.live_peers_for_service(service_id);
        if live.is_empty() {
            return None;
        }
        let counters = self.round_robin_counters.read().expect("counters poisoned");
        let idx = if let Some(counter) = counters.get(&service_id) {
            counter.fetch_add(1, Ordering::Relaxed) as usize
        } else {
            drop(counters);
            let mut counters = self.round_robin_counters.write().expect("counters poisoned");
            counters.entry(service_id).or_insert_with(|| AtomicU64::new(1));
            0
        };
        Some(live[idx % live.len()].clone())
    }

    /// Picks a peer for `serviceId` by a stable hash of `accountId`,
    /// giving the same account affinity to the same peer as long as
    /// membership doesn't change (rehash on membership change accepted
    /// per §4.6).
    pub fn find_by_account_id(&self, service_id: u16, account_id: &str) -> Option<ServerInfo> {
        let live = self.live_peers_for_service(service_id);
        if live.is_empty() {
            return None;
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        account_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % live.len();
        Some(live[idx].clone())
    }

    /// Drops peers that have missed `missed_heartbeat_limit` consecutive
    /// heartbeat intervals.
    pub fn sweep_dead_peers(&self, heartbeat_interval: Duration) {
        let cutoff = heartbeat_interval * self.missed_heartbeat_limit;
        let now = Instant::now();
        let mut peers = self.peers.write().expect("server info poisoned");
        peers.retain(|_, info| now.duration_since(info.last_heartbeat) < cutoff);
    }

    pub fn all(&self) -> Vec<ServerInfo> {
        self.peers.read().expect("server info poisoned").values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, service_id: u16) -> ServerInfo {
        ServerInfo {
            server_id: id.to_string(),
            bind_endpoint: format!("tcp://{id}"),
            role: ServerRole::Play,
            service_id,
            weight: 1,
            state: ServerState::Running,
            last_heartbeat: Instant::now(),
        }
    }

    #[test]
    fn round_robin_cycles_through_live_peers() {
        let center = ServerInfoCenter::new(3);
        center.upsert(info("a", 1));
        center.upsert(info("b", 1));
        let first = center.find_round_robin(1).unwrap().server_id;
        let second = center.find_round_robin(1).unwrap().server_id;
        assert_ne!(first, second);
    }

    #[test]
    fn account_affinity_is_stable_for_same_membership() {
        let center = ServerInfoCenter::new(3);
        center.upsert(info("a", 1));
        center.upsert(info("b", 1));
        let first = center.find_by_account_id(1, "user-42").unwrap().server_id;
        let second = center.find_by_account_id(1, "user-42").unwrap().server_id;
        assert_eq!(first, second);
    }

    #[test]
    fn paused_peer_is_excluded_from_round_robin() {
        let center = ServerInfoCenter::new(3);
        center.upsert(info("a", 1));
        center.upsert(info("b", 1));
        center.set_state("a", ServerState::Paused);
        let picked = center.find_round_robin(1).unwrap().server_id;
        assert_eq!(picked, "b");
        assert_eq!(center.find_by_id("a").unwrap().state, ServerState::Paused);
    }

    #[test]
    fn sweep_drops_peers_past_missed_heartbeat_limit() {
        let center = ServerInfoCenter::new(2);
        let mut stale = info("stale", 1);
        stale.last_heartbeat = Instant::now() - Duration::from_secs(60);
        center.upsert(stale);
        center.sweep_dead_peers(Duration::from_millis(1));
        assert!(center.find_by_id("stale").is_none());
    }
}
