//! Awareness state management
//!
//! Tracks ephemeral presence state (cursor, user info, ...) of every client
//! attached to a document, across all instances. States are arbitrary JSON
//! and replaced wholesale; each client carries a logical clock so stale or
//! duplicated updates are ignored. A state nobody renews within the outdated
//! timeout is dropped by [`Awareness::remove_outdated`].

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;

pub type ClientId = u64;

/// Remote states not renewed for this long are dropped
pub const DEFAULT_OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AwarenessError {
    #[error("Malformed awareness update: {0}")]
    Malformed(#[from] read::Error),
    #[error("Invalid awareness state: {0}")]
    InvalidState(#[from] serde_json::Error),
}

/// One client's entry in an awareness update
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u32,
    /// None = client left
    pub state: Option<Value>,
}

/// Awareness update in the y-protocols layout
///
/// `varUint(n)` followed by n times
/// `varUint(client) varUint(clock) varString(json)`, where a removed client
/// is encoded as the JSON literal `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.entries.len() as u32);
        for entry in &self.entries {
            buf.write_var(entry.client_id);
            buf.write_var(entry.clock);
            let json = match &entry.state {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            buf.write_string(&json);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, AwarenessError> {
        let mut cursor = Cursor::new(data);
        let len: u32 = cursor.read_var()?;
        let mut entries = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            let client_id: u64 = cursor.read_var()?;
            let clock: u32 = cursor.read_var()?;
            let state: Value = serde_json::from_str(cursor.read_string()?)?;
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state: if state.is_null() { None } else { Some(state) },
            });
        }
        Ok(Self { entries })
    }

    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.entries.iter().map(|e| e.client_id)
    }
}

/// Client ids touched by an awareness operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    /// Same state with a newer clock; still forwarded so peers keep it alive
    pub renewed: Vec<ClientId>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.renewed.is_empty()
    }

    /// Every touched id, renewals included
    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .chain(&self.renewed)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u32,
    last_updated: Instant,
}

/// Awareness map of one document
#[derive(Debug, Default)]
pub struct Awareness {
    states: HashMap<ClientId, Value>,
    /// Last seen clock per client, kept for a while after removal so late
    /// updates stay stale
    meta: HashMap<ClientId, ClientMeta>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, client_id: ClientId) -> Option<&Value> {
        self.states.get(&client_id)
    }

    pub fn clock(&self, client_id: ClientId) -> u32 {
        self.meta.get(&client_id).map_or(0, |meta| meta.clock)
    }

    fn touch(&mut self, client_id: ClientId, clock: u32) {
        self.meta.insert(
            client_id,
            ClientMeta {
                clock,
                last_updated: Instant::now(),
            },
        );
    }

    /// Ids of all clients with a state, sorted
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Set the state of a client attached to this instance
    pub fn set_local_state(&mut self, client_id: ClientId, state: Value) -> AwarenessChanges {
        let clock = self.clock(client_id) + 1;
        self.touch(client_id, clock);

        let mut changes = AwarenessChanges::default();
        match self.states.insert(client_id, state.clone()) {
            None => changes.added.push(client_id),
            Some(previous) if previous != state => changes.updated.push(client_id),
            Some(_) => changes.renewed.push(client_id),
        }
        changes
    }

    /// Mark clients as gone, e.g. when their connection closes
    pub fn remove_states(&mut self, client_ids: &[ClientId]) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();
        for &client_id in client_ids {
            if self.states.remove(&client_id).is_some() {
                let clock = self.clock(client_id) + 1;
                self.touch(client_id, clock);
                changes.removed.push(client_id);
            }
        }
        changes
    }

    /// Merge a remote update
    ///
    /// An entry wins when its clock is newer than the one we know, or equal
    /// with a removal for a client that is still present.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();

        for entry in &update.entries {
            let current = self.clock(entry.client_id);
            let present = self.states.contains_key(&entry.client_id);
            let newer = current < entry.clock
                || (current == entry.clock && entry.state.is_none() && present);
            if !newer {
                continue;
            }

            self.touch(entry.client_id, entry.clock);
            match &entry.state {
                None => {
                    if self.states.remove(&entry.client_id).is_some() {
                        changes.removed.push(entry.client_id);
                    }
                }
                Some(state) => match self.states.insert(entry.client_id, state.clone()) {
                    None => changes.added.push(entry.client_id),
                    Some(previous) if previous != *state => {
                        changes.updated.push(entry.client_id)
                    }
                    Some(_) => changes.renewed.push(entry.client_id),
                },
            }
        }

        changes
    }

    /// Build an update covering the given clients
    pub fn encode_update(&self, client_ids: &[ClientId]) -> AwarenessUpdate {
        let entries = client_ids
            .iter()
            .map(|&client_id| AwarenessEntry {
                client_id,
                clock: self.clock(client_id),
                state: self.states.get(&client_id).cloned(),
            })
            .collect();
        AwarenessUpdate { entries }
    }

    /// Update covering every client with a state
    pub fn full_update(&self) -> AwarenessUpdate {
        self.encode_update(&self.client_ids())
    }

    /// Drop states last renewed more than `timeout` before `now`
    ///
    /// Expired clients keep their clock, so the removal encodes with the
    /// same clock and peers accept it. Clocks of clients gone for longer
    /// than `timeout` are forgotten.
    pub fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();
        let states = &mut self.states;
        self.meta.retain(|&client_id, meta| {
            let outdated = now.saturating_duration_since(meta.last_updated) >= timeout;
            if !outdated {
                return true;
            }
            if states.remove(&client_id).is_some() {
                meta.last_updated = now;
                changes.removed.push(client_id);
                return true;
            }
            false
        });
        changes.removed.sort_unstable();
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_encoding_round_trip() {
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry {
                    client_id: 42,
                    clock: 3,
                    state: Some(json!({"user": {"name": "ada"}, "cursor": 12})),
                },
                AwarenessEntry {
                    client_id: u64::from(u32::MAX) + 5,
                    clock: 1,
                    state: None,
                },
            ],
        };
        assert_eq!(AwarenessUpdate::decode(&update.encode()).unwrap(), update);
    }

    #[test]
    fn test_apply_adds_updates_and_removes() {
        let mut local = Awareness::new();
        let mut remote = Awareness::new();

        let changes = remote.set_local_state(1, json!({"cursor": 1}));
        assert_eq!(changes.added, vec![1]);
        let changes = local.apply_update(&remote.full_update());
        assert_eq!(changes.added, vec![1]);
        assert_eq!(local.state(1), Some(&json!({"cursor": 1})));

        remote.set_local_state(1, json!({"cursor": 2}));
        let changes = local.apply_update(&remote.full_update());
        assert_eq!(changes.updated, vec![1]);

        let removed = remote.remove_states(&[1]);
        let changes = local.apply_update(&remote.encode_update(&removed.changed_clients()));
        assert_eq!(changes.removed, vec![1]);
        assert!(local.is_empty());
    }

    #[test]
    fn test_stale_and_duplicate_updates_are_ignored() {
        let mut local = Awareness::new();
        let mut remote = Awareness::new();

        remote.set_local_state(7, json!("first"));
        let stale = remote.full_update();
        remote.set_local_state(7, json!("second"));
        let fresh = remote.full_update();

        assert!(!local.apply_update(&fresh).is_empty());
        assert!(local.apply_update(&fresh).is_empty());
        assert!(local.apply_update(&stale).is_empty());
        assert_eq!(local.state(7), Some(&json!("second")));
    }

    #[test]
    fn test_removed_client_stays_removed_against_older_state() {
        let mut local = Awareness::new();
        local.set_local_state(3, json!({"a": 1}));
        let old = local.full_update();
        local.remove_states(&[3]);

        assert!(local.apply_update(&old).is_empty());
        assert!(local.state(3).is_none());
        assert_eq!(local.clock(3), 2);
    }

    #[test]
    fn test_equal_state_with_newer_clock_is_a_renewal() {
        let mut local = Awareness::new();
        let mut remote = Awareness::new();
        remote.set_local_state(4, json!("here"));
        local.apply_update(&remote.full_update());

        let changes = remote.set_local_state(4, json!("here"));
        assert_eq!(changes.renewed, vec![4]);
        let changes = local.apply_update(&remote.full_update());
        assert_eq!(changes.renewed, vec![4]);
        assert!(changes.added.is_empty() && changes.updated.is_empty());
        assert_eq!(changes.changed_clients(), vec![4]);
        assert_eq!(local.clock(4), 2);
    }

    #[test]
    fn test_outdated_states_expire_and_their_clocks_are_forgotten() {
        let timeout = Duration::from_secs(30);
        let mut local = Awareness::new();
        let mut remote = Awareness::new();
        remote.set_local_state(1, json!("a"));
        remote.set_local_state(2, json!("b"));
        local.apply_update(&remote.full_update());
        let start = Instant::now();

        assert!(local.remove_outdated(start, timeout).is_empty());

        let expired = start + timeout + Duration::from_secs(1);
        let changes = local.remove_outdated(expired, timeout);
        assert_eq!(changes.removed, vec![1, 2]);
        assert!(local.is_empty());

        // The removal goes out with the clock peers already have
        let removal = local.encode_update(&changes.changed_clients());
        assert!(removal.entries.iter().all(|e| e.clock == 1 && e.state.is_none()));
        let changes = remote.apply_update(&removal);
        assert_eq!(changes.removed, vec![1, 2]);

        // Clocks survive one more timeout, then go
        assert!(local.remove_outdated(expired + Duration::from_secs(1), timeout).is_empty());
        assert_eq!(local.clock(1), 1);
        assert!(local.remove_outdated(expired + timeout, timeout).is_empty());
        assert_eq!(local.clock(1), 0);
        assert!(local.meta.is_empty());
    }

    #[test]
    fn test_renewed_state_outlives_the_timeout() {
        let timeout = Duration::from_millis(50);
        let mut local = Awareness::new();
        let mut remote = Awareness::new();
        remote.set_local_state(9, json!("x"));
        local.apply_update(&remote.full_update());

        std::thread::sleep(Duration::from_millis(60));
        remote.set_local_state(9, json!("x"));
        local.apply_update(&remote.full_update());

        assert!(local.remove_outdated(Instant::now(), timeout).is_empty());
        assert_eq!(local.state(9), Some(&json!("x")));
    }
}
