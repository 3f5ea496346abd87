// Copyright 2020, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The operation map: the registry of ongoing keymaster operations, mainly
//! required for tracking operations for the purpose of pruning.
//!
//! ## Operation lifecycle
//! An operation is registered after a successful keymaster `begin`. The
//! lifecycle ends when `finish` or `abort` is called, when the owning
//! client's liveness handle dies, or when the operation is pruned.
//! Once removed, the ticket is dead: any further use yields
//! `InvalidOperationHandle`.
//!
//! ## Pruning
//! The keymaster has a small number of operation slots, so keystore caps
//! concurrent operations and evicts under pressure. Only operations started
//! as pruneable may be evicted; the victim is always the pruneable
//! operation whose `begin` completed earliest, ties broken by ticket
//! allocation order. Non-pruneable operations (a privilege of the system
//! principal) are never selected.
//!
//! The map itself only selects victims; the service aborts them and
//! retries, stopping when the keymaster no longer reports
//! `TooManyOperations` or no pruneable operation remains.

use crate::auth_token::HardwareAuthToken;
use crate::key_parameter::{KeyCharacteristics, KeyPurpose};
use crate::traits::KeymasterDevice;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The maximum number of concurrent operations the service admits.
pub const MAX_OPERATIONS: usize = 15;

/// Process-unique handle to a registered operation. Never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpTicket(u64);

/// Opaque handle binding an operation to its client's liveness. When the
/// transport observes the client dying it reports the handle to
/// `KeyStoreCore::on_client_death`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LivenessHandle(pub u64);

struct OperationEntry {
    handle: u64,
    key_id: u64,
    purpose: KeyPurpose,
    device: Arc<dyn KeymasterDevice>,
    liveness: LivenessHandle,
    characteristics: Arc<KeyCharacteristics>,
    pruneable: bool,
    auth_token: Option<HardwareAuthToken>,
    /// Begin completion order, used by `get_oldest_pruneable`.
    seq: u64,
}

/// An operation's shared state, handed out to the service for dispatching
/// update/finish/abort without holding the map lock.
#[derive(Clone)]
pub struct OpView {
    pub ticket: OpTicket,
    pub handle: u64,
    pub key_id: u64,
    pub purpose: KeyPurpose,
    pub device: Arc<dyn KeymasterDevice>,
    pub characteristics: Arc<KeyCharacteristics>,
    pub pruneable: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<u64, OperationEntry>,
    next_ticket: u64,
    next_seq: u64,
}

/// Registry of live operations. All access is serialized by one mutex; the
/// lock is never held across keymaster calls.
#[derive(Default)]
pub struct OperationMap {
    inner: Mutex<Inner>,
}

impl OperationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly begun operation and returns its ticket. The
    /// characteristics move into the map; update and finish borrow them
    /// from here.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        handle: u64,
        key_id: u64,
        purpose: KeyPurpose,
        device: Arc<dyn KeymasterDevice>,
        liveness: LivenessHandle,
        characteristics: KeyCharacteristics,
        pruneable: bool,
    ) -> OpTicket {
        let mut inner = self.inner.lock().expect("In OperationMap::add.");
        inner.next_ticket += 1;
        inner.next_seq += 1;
        let ticket = OpTicket(inner.next_ticket);
        let seq = inner.next_seq;
        inner.entries.insert(
            ticket.0,
            OperationEntry {
                handle,
                key_id,
                purpose,
                device,
                liveness,
                characteristics: Arc::new(characteristics),
                pruneable,
                auth_token: None,
                seq,
            },
        );
        ticket
    }

    pub fn get(&self, ticket: OpTicket) -> Option<OpView> {
        let inner = self.inner.lock().expect("In OperationMap::get.");
        inner.entries.get(&ticket.0).map(|e| OpView {
            ticket,
            handle: e.handle,
            key_id: e.key_id,
            purpose: e.purpose,
            device: e.device.clone(),
            characteristics: e.characteristics.clone(),
            pruneable: e.pruneable,
        })
    }

    /// Caches the auth token resolved for this operation. Returns false if
    /// the operation is gone.
    pub fn set_auth_token(&self, ticket: OpTicket, token: HardwareAuthToken) -> bool {
        let mut inner = self.inner.lock().expect("In OperationMap::set_auth_token.");
        match inner.entries.get_mut(&ticket.0) {
            Some(entry) => {
                entry.auth_token = Some(token);
                true
            }
            None => false,
        }
    }

    pub fn get_auth_token(&self, ticket: OpTicket) -> Option<HardwareAuthToken> {
        let inner = self.inner.lock().expect("In OperationMap::get_auth_token.");
        inner.entries.get(&ticket.0).and_then(|e| e.auth_token.clone())
    }

    /// Removes the operation, returning its final view. Removal is the only
    /// way an operation leaves the map; a second removal returns None.
    pub fn remove(&self, ticket: OpTicket) -> Option<OpView> {
        let mut inner = self.inner.lock().expect("In OperationMap::remove.");
        inner.entries.remove(&ticket.0).map(|e| OpView {
            ticket,
            handle: e.handle,
            key_id: e.key_id,
            purpose: e.purpose,
            device: e.device,
            characteristics: e.characteristics,
            pruneable: e.pruneable,
        })
    }

    /// The pruneable operation whose begin completed earliest.
    pub fn get_oldest_pruneable(&self) -> Option<OpTicket> {
        let inner = self.inner.lock().expect("In OperationMap::get_oldest_pruneable.");
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.pruneable)
            .min_by_key(|(ticket, e)| (e.seq, **ticket))
            .map(|(ticket, _)| OpTicket(*ticket))
    }

    pub fn has_pruneable(&self) -> bool {
        let inner = self.inner.lock().expect("In OperationMap::has_pruneable.");
        inner.entries.values().any(|e| e.pruneable)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("In OperationMap::count.").entries.len()
    }

    /// Every operation bound to the given liveness handle.
    pub fn operations_for_liveness(&self, liveness: LivenessHandle) -> Vec<OpTicket> {
        let inner = self.inner.lock().expect("In OperationMap::operations_for_liveness.");
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.liveness == liveness)
            .map(|(ticket, _)| OpTicket(*ticket))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockKeymaster;

    fn map_with_ops(pruneable: &[bool]) -> (OperationMap, Vec<OpTicket>) {
        let map = OperationMap::new();
        let device: Arc<dyn KeymasterDevice> = Arc::new(MockKeymaster::new(false));
        let tickets = pruneable
            .iter()
            .enumerate()
            .map(|(i, p)| {
                map.add(
                    i as u64 + 100,
                    i as u64,
                    KeyPurpose::SIGN,
                    device.clone(),
                    LivenessHandle(i as u64 % 2),
                    KeyCharacteristics::default(),
                    *p,
                )
            })
            .collect();
        (map, tickets)
    }

    #[test]
    fn tickets_are_unique_and_removal_is_final() {
        let (map, tickets) = map_with_ops(&[true, true]);
        assert_ne!(tickets[0], tickets[1]);
        assert_eq!(map.count(), 2);

        assert!(map.remove(tickets[0]).is_some());
        assert!(map.remove(tickets[0]).is_none());
        assert!(map.get(tickets[0]).is_none());
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn oldest_pruneable_ignores_non_pruneable() {
        let (map, tickets) = map_with_ops(&[false, true, true]);
        assert_eq!(map.get_oldest_pruneable(), Some(tickets[1]));

        map.remove(tickets[1]);
        assert_eq!(map.get_oldest_pruneable(), Some(tickets[2]));

        map.remove(tickets[2]);
        assert_eq!(map.get_oldest_pruneable(), None);
        assert!(!map.has_pruneable());
        // The non-pruneable operation is still there.
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn liveness_index_returns_bound_operations() {
        let (map, tickets) = map_with_ops(&[true, true, true, true]);
        let mut bound = map.operations_for_liveness(LivenessHandle(0));
        bound.sort();
        assert_eq!(bound, vec![tickets[0], tickets[2]]);
    }

    #[test]
    fn auth_token_cache_follows_entry_lifetime() {
        let (map, tickets) = map_with_ops(&[true]);
        let token = HardwareAuthToken {
            challenge: 100,
            user_id: 42,
            authenticator_id: 1,
            authenticator_type: 1,
            timestamp_ms: 0,
            mac: [0; 32],
        };
        assert_eq!(map.get_auth_token(tickets[0]), None);
        assert!(map.set_auth_token(tickets[0], token.clone()));
        assert_eq!(map.get_auth_token(tickets[0]), Some(token.clone()));

        map.remove(tickets[0]);
        assert!(!map.set_auth_token(tickets[0], token));
        assert_eq!(map.get_auth_token(tickets[0]), None);
    }

    #[test]
    fn characteristics_move_into_the_map() {
        let map = OperationMap::new();
        let device: Arc<dyn KeymasterDevice> = Arc::new(MockKeymaster::new(false));
        let chars = KeyCharacteristics {
            software_enforced: vec![],
            hardware_enforced: vec![crate::key_parameter::KeyParameter::bool(
                crate::key_parameter::Tag::NO_AUTH_REQUIRED,
            )],
        };
        let ticket = map.add(
            1,
            2,
            KeyPurpose::SIGN,
            device,
            LivenessHandle(9),
            chars.clone(),
            true,
        );
        let view = map.get(ticket).unwrap();
        assert_eq!(*view.characteristics, chars);
    }
}
