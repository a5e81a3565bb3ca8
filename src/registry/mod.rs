//! Replicated signed registry
//!
//! An append-only log of signed entries with a deterministic total
//! order derived from the parent tree: pre-order traversal, siblings
//! ascending by uuid. Replicas that hold the same entry set therefore
//! produce the same order, the same rolling hash chain and the same
//! materialized head state, no matter in which order the entries
//! arrived. Convergence is driven by head announcements and a
//! binary-search reconciliation over the hash chain.
//!
//! Entries that fail their signature or permission check are kept in
//! the log — removing them would fork the entry set across replicas —
//! but their state effect is suppressed during head materialization.

pub mod entry;
pub mod predicate;
pub mod sync;

pub use entry::{EntryKind, RegistryEntry};
pub use predicate::RegistryPredicate;
pub use sync::{ProbeStep, SyncPhase, SyncSession};

use crate::config::RegistryConfig;
use crate::storage::StorageBackend;
use crate::time::RelTimeProvider;
use crate::wire::{
    self, Datagrams, MessageTarget, RegistryEntries, RegistryHashReply, RegistryHashRequest,
    RegistryHead, TAG_REGISTRY_ENTRIES, TAG_REGISTRY_HASH_REPLY, TAG_REGISTRY_HASH_REQUEST,
    TAG_REGISTRY_HEAD,
};
use crate::identity::KeyPair;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

const REGISTRY_STORAGE_PREFIX: &[u8] = b"registry::";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("entry already present in the log")]
    AlreadyPresent,
    #[error("entry retained but its state effect is not permitted")]
    PermissionDenied,
    #[error("entry retained but its signature did not verify")]
    SignatureVerificationFailed,
    #[error("entry's parent is not in the log")]
    OrphanEntry,
    #[error("could not parse serialized entry: {0}")]
    ParsingError(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// A replicated key/value registry backed by the signed entry log.
pub struct Registry<V> {
    name: String,
    instance_id: Uuid,
    config: RegistryConfig,
    predicate: RegistryPredicate,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn RelTimeProvider>,

    entries: Vec<RegistryEntry<V>>,
    uuids: HashSet<Uuid>,
    hash_chain: Vec<[u8; 32]>,
    head_state: HashMap<String, V>,
    /// uuid of the entry that last wrote each live key
    head_uuids: HashMap<String, Uuid>,

    session: SyncSession,
    next_announce_at: u64,
    parse_failures: u64,
}

impl<V> Registry<V>
where
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    pub fn new(
        name: &str,
        predicate: RegistryPredicate,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn RelTimeProvider>,
        config: RegistryConfig,
    ) -> Self {
        let session = SyncSession::new(config.sync_timeout_ms);
        let mut registry = Self {
            name: name.to_string(),
            instance_id: Uuid::new_v4(),
            config,
            predicate,
            storage,
            clock,
            entries: Vec::new(),
            uuids: HashSet::new(),
            hash_chain: Vec::new(),
            head_state: HashMap::new(),
            head_uuids: HashMap::new(),
            session,
            next_announce_at: 0,
            parse_failures: 0,
        };
        registry.load_persisted();
        registry
    }

    fn storage_key(&self) -> Vec<u8> {
        let mut key = REGISTRY_STORAGE_PREFIX.to_vec();
        key.extend_from_slice(self.name.as_bytes());
        key
    }

    fn load_persisted(&mut self) {
        let persisted = match self.storage.get(&self.storage_key()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                warn!(registry = %self.name, error = %e, "could not read persisted log");
                return;
            }
        };
        match bincode::deserialize::<Vec<RegistryEntry<V>>>(&persisted) {
            Ok(entries) => {
                // The log is persisted in canonical order; re-deriving it
                // through the insertion path is unnecessary.
                self.uuids = entries.iter().map(|e| e.uuid).collect();
                self.entries = entries;
                let _ = self.update_head(false, None);
            }
            Err(e) => {
                warn!(registry = %self.name, error = %e, "discarding undecodable persisted log");
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.head_state.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.head_state.contains_key(key)
    }

    /// Rolling hash identifying the entry set and its order.
    pub fn head_hash(&self) -> [u8; 32] {
        self.hash_chain.last().copied().unwrap_or([0u8; 32])
    }

    pub fn entries(&self) -> &[RegistryEntry<V>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Upsert a key. A no-op when the head already maps `key` to
    /// `value`. The new entry's parent is the entry currently backing
    /// the key in head state, or nil for a fresh key.
    pub fn set(&mut self, key: &str, value: V, keys: &KeyPair) -> Result<(), RegistryError> {
        if self.head_state.get(key) == Some(&value) {
            return Ok(());
        }
        let parent = self.head_uuids.get(key).copied().unwrap_or_else(Uuid::nil);
        let entry = RegistryEntry::create(
            parent,
            EntryKind::Upsert,
            key,
            Some(value),
            keys,
            self.clock.now_ms(),
        );
        self.add_entry(entry)
    }

    /// Delete a key. A no-op when the key is not live in head state.
    pub fn del(&mut self, key: &str, keys: &KeyPair) -> Result<(), RegistryError> {
        let Some(parent) = self.head_uuids.get(key).copied() else {
            return Ok(());
        };
        let entry = RegistryEntry::create(
            parent,
            EntryKind::Delete,
            key,
            None,
            keys,
            self.clock.now_ms(),
        );
        self.add_entry(entry)
    }

    /// Drop the whole log, locally only. Other replicas are unaffected
    /// and will re-seed this one on the next sync.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.uuids.clear();
        self.hash_chain.clear();
        self.head_state.clear();
        self.head_uuids.clear();
        if let Err(e) = self.storage.remove(&self.storage_key()) {
            warn!(registry = %self.name, error = %e, "could not remove persisted log");
        }
    }

    /// Insert one entry at its canonical position.
    ///
    /// The canonical order is a pre-order traversal of the entry tree
    /// with siblings ascending by uuid, so each subtree occupies a
    /// contiguous range. A new entry goes immediately before its
    /// smallest larger sibling, or after the last sibling's subtree.
    /// Root entries (nil parent) are siblings under a virtual root. An
    /// entry whose parent is unknown is refused with `OrphanEntry` so
    /// bulk addition can retry it once the parent arrives.
    pub fn add_entry(&mut self, entry: RegistryEntry<V>) -> Result<(), RegistryError> {
        if self.uuids.contains(&entry.uuid) {
            return Err(RegistryError::AlreadyPresent);
        }

        let index = if entry.parent_uuid.is_nil() {
            self.root_insert_index(&entry)
        } else {
            let Some(parent_index) = self
                .entries
                .iter()
                .position(|e| e.uuid == entry.parent_uuid)
            else {
                return Err(RegistryError::OrphanEntry);
            };
            self.child_insert_index(parent_index, &entry)
        };
        self.insert_at(index, entry)
    }

    /// Position for a new root: before the first larger root, else at
    /// the very end (root subtrees tile the whole list).
    fn root_insert_index(&self, entry: &RegistryEntry<V>) -> usize {
        for (i, existing) in self.entries.iter().enumerate() {
            if existing.parent_uuid.is_nil() && existing.uuid > entry.uuid {
                return i;
            }
        }
        self.entries.len()
    }

    /// Position for a new child: walk the parent's contiguous subtree,
    /// stopping at the first larger sibling or at the subtree's end.
    fn child_insert_index(&self, parent_index: usize, entry: &RegistryEntry<V>) -> usize {
        let parent_uuid = self.entries[parent_index].uuid;
        let mut descendants = HashSet::from([parent_uuid]);
        let mut i = parent_index + 1;
        while i < self.entries.len() {
            let existing = &self.entries[i];
            if !descendants.contains(&existing.parent_uuid) {
                break;
            }
            if existing.parent_uuid == parent_uuid && existing.uuid > entry.uuid {
                return i;
            }
            descendants.insert(existing.uuid);
            i += 1;
        }
        i
    }

    fn insert_at(&mut self, index: usize, entry: RegistryEntry<V>) -> Result<(), RegistryError> {
        trace!(registry = %self.name, index, uuid = %entry.uuid, "inserting entry");
        self.uuids.insert(entry.uuid);
        self.entries.insert(index, entry);
        self.update_head(true, Some(index))
    }

    /// Decode and insert an entry received from a peer.
    pub fn add_serialized_entry(&mut self, bytes: &[u8]) -> Result<(), RegistryError> {
        let entry = bincode::deserialize::<RegistryEntry<V>>(bytes)
            .map_err(|e| RegistryError::ParsingError(e.to_string()))?;
        self.add_entry(entry)
    }

    /// Integrate a batch of entries in dependency order.
    ///
    /// Repeatedly adds every entry whose parent is already in the log
    /// (or nil) until a fixed point. Entries whose ancestor chain can
    /// never be resolved — the parent is neither present, nor nil, nor
    /// anywhere in the batch — are discarded. Returns how many entries
    /// were actually added.
    pub fn add_entries(&mut self, incoming: Vec<RegistryEntry<V>>) -> usize {
        let mut pending = incoming;
        let mut added = 0;

        loop {
            let before = pending.len();
            let mut rest = Vec::new();
            for entry in pending {
                if self.uuids.contains(&entry.uuid) {
                    continue;
                }
                if entry.parent_uuid.is_nil() || self.uuids.contains(&entry.parent_uuid) {
                    match self.add_entry(entry) {
                        Ok(()) => added += 1,
                        // Rejected effects still extend the log
                        Err(RegistryError::PermissionDenied)
                        | Err(RegistryError::SignatureVerificationFailed) => added += 1,
                        Err(e) => debug!(registry = %self.name, error = %e, "bulk entry not added"),
                    }
                } else {
                    rest.push(entry);
                }
            }
            pending = rest;

            if pending.is_empty() {
                break;
            }
            if pending.len() == before {
                // No progress: every remaining parent is outside the log.
                // Branches rooted inside the batch stay; the rest are lost.
                let batch_uuids: HashSet<Uuid> = pending.iter().map(|e| e.uuid).collect();
                let before_discard = pending.len();
                pending.retain(|e| {
                    let resolvable = batch_uuids.contains(&e.parent_uuid);
                    if !resolvable {
                        debug!(registry = %self.name, uuid = %e.uuid, "discarding entry with unknown ancestor");
                    }
                    resolvable
                });
                if pending.len() == before_discard {
                    // Parent references form a cycle; nothing can resolve.
                    warn!(registry = %self.name, remaining = pending.len(), "discarding cyclic entry batch");
                    break;
                }
            }
        }
        added
    }

    // ------------------------------------------------------------------
    // Head materialization
    // ------------------------------------------------------------------

    /// Rebuild the hash chain and head state from the canonical order.
    ///
    /// When `inserted` names an index, reports whether that entry's
    /// effect was suppressed — the entry stays in the log either way.
    fn update_head(&mut self, save: bool, inserted: Option<usize>) -> Result<(), RegistryError> {
        self.head_state.clear();
        self.head_uuids.clear();
        self.hash_chain.clear();

        let mut result = Ok(());
        for i in 0..self.entries.len() {
            let signed_bytes = self.entries[i].signed_bytes();
            let mut hasher = blake3::Hasher::new();
            hasher.update(&signed_bytes);
            if let Some(previous) = self.hash_chain.last() {
                hasher.update(previous);
            }
            self.hash_chain.push(*hasher.finalize().as_bytes());

            let signature_valid = self.entries[i].verify_signature();
            let permitted = self.predicate.permits(&self.entries, i);
            if !signature_valid || !permitted {
                if inserted == Some(i) {
                    result = Err(if !signature_valid {
                        RegistryError::SignatureVerificationFailed
                    } else {
                        RegistryError::PermissionDenied
                    });
                }
                continue;
            }

            let entry = &self.entries[i];
            match entry.kind {
                EntryKind::Upsert => {
                    if let Some(value) = &entry.value {
                        self.head_state.insert(entry.key.clone(), value.clone());
                        self.head_uuids.insert(entry.key.clone(), entry.uuid);
                    }
                }
                EntryKind::Delete => {
                    self.head_state.remove(&entry.key);
                    self.head_uuids.remove(&entry.key);
                }
            }
        }

        if save {
            self.persist()?;
        }
        result
    }

    fn persist(&self) -> Result<(), RegistryError> {
        let bytes = bincode::serialize(&self.entries)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        self.storage
            .put(&self.storage_key(), &bytes)
            .map_err(RegistryError::Storage)
    }

    // ------------------------------------------------------------------
    // Anti-entropy
    // ------------------------------------------------------------------

    /// Announce the head if the interval elapsed (or unconditionally
    /// with `force`).
    pub fn sync(&mut self, force: bool) -> Datagrams {
        let now = self.clock.now_ms();
        if !force && now < self.next_announce_at {
            return Vec::new();
        }
        self.next_announce_at = now + self.config.announce_interval_ms;

        let head = RegistryHead {
            name: self.name.clone(),
            head_hash: self.head_hash(),
            entry_count: self.entries.len() as u32,
            instance_id: self.instance_id,
        };
        match wire::encode(TAG_REGISTRY_HEAD, &head) {
            Ok(datagram) => vec![(MessageTarget::broadcast(), datagram)],
            Err(_) => Vec::new(),
        }
    }

    /// Periodic work: expire a stuck session, announce when due.
    pub fn tick(&mut self) -> Datagrams {
        let now = self.clock.now_ms();
        if self.session.expired(now) {
            debug!(registry = %self.name, "sync session timed out");
            self.session.complete();
        }
        self.sync(false)
    }

    /// Feed one registry datagram (tags 0x10–0x13) to this replica.
    pub fn on_data(&mut self, datagram: &[u8]) -> Datagrams {
        match wire::tag(datagram) {
            Ok(TAG_REGISTRY_HEAD) => match wire::decode::<RegistryHead>(datagram) {
                Ok(head) => self.handle_head(head),
                Err(_) => self.note_parse_failure(),
            },
            Ok(TAG_REGISTRY_HASH_REQUEST) => match wire::decode::<RegistryHashRequest>(datagram) {
                Ok(request) => self.handle_hash_request(request),
                Err(_) => self.note_parse_failure(),
            },
            Ok(TAG_REGISTRY_HASH_REPLY) => match wire::decode::<RegistryHashReply>(datagram) {
                Ok(reply) => self.handle_hash_reply(reply),
                Err(_) => self.note_parse_failure(),
            },
            Ok(TAG_REGISTRY_ENTRIES) => match wire::decode::<RegistryEntries>(datagram) {
                Ok(entries) => self.handle_entries(entries),
                Err(_) => self.note_parse_failure(),
            },
            _ => Vec::new(),
        }
    }

    fn note_parse_failure(&mut self) -> Datagrams {
        self.parse_failures += 1;
        Vec::new()
    }

    fn handle_head(&mut self, head: RegistryHead) -> Datagrams {
        if head.name != self.name || head.instance_id == self.instance_id {
            return Vec::new();
        }
        if head.head_hash == self.head_hash() {
            return Vec::new();
        }
        if !self.session.is_idle() {
            trace!(registry = %self.name, "sync already in progress, ignoring differing head");
            return Vec::new();
        }

        let now = self.clock.now_ms();
        let upper = self.entries.len().min(head.entry_count as usize);
        debug!(registry = %self.name, remote = %head.instance_id, upper, "head divergence, starting reconciliation");
        let (request_id, step) = self.session.begin(head.instance_id, upper, now);
        match step {
            ProbeStep::Probe { index } => self.hash_request_packet(request_id, index, head.instance_id),
            ProbeStep::Diverged { index } => self.entries_packet(index),
        }
    }

    fn handle_hash_request(&mut self, request: RegistryHashRequest) -> Datagrams {
        if request.name != self.name || request.target != self.instance_id {
            return Vec::new();
        }
        // Answered statelessly; out-of-range probes get the zero sentinel.
        let hash = self
            .hash_chain
            .get(request.index as usize)
            .copied()
            .unwrap_or([0u8; 32]);
        let reply = RegistryHashReply {
            name: self.name.clone(),
            request_id: request.request_id,
            index: request.index,
            hash,
            responder: self.instance_id,
        };
        match wire::encode(TAG_REGISTRY_HASH_REPLY, &reply) {
            Ok(datagram) => vec![(MessageTarget::broadcast(), datagram)],
            Err(_) => Vec::new(),
        }
    }

    fn handle_hash_reply(&mut self, reply: RegistryHashReply) -> Datagrams {
        if reply.name != self.name {
            return Vec::new();
        }
        if !self
            .session
            .accepts_reply(&reply.request_id, &reply.responder, reply.index as usize)
        {
            return Vec::new();
        }

        let now = self.clock.now_ms();
        let matched = self.hash_chain.get(reply.index as usize) == Some(&reply.hash);
        match self.session.advance(matched, now) {
            Some(ProbeStep::Probe { index }) => {
                self.hash_request_packet(reply.request_id, index, reply.responder)
            }
            Some(ProbeStep::Diverged { index }) => {
                debug!(registry = %self.name, index, "divergence located, transferring entries");
                self.entries_packet(index)
            }
            None => Vec::new(),
        }
    }

    fn handle_entries(&mut self, frame: RegistryEntries) -> Datagrams {
        if frame.name != self.name || frame.sender == self.instance_id {
            return Vec::new();
        }

        let mut decoded = Vec::with_capacity(frame.entries.len());
        for bytes in &frame.entries {
            match bincode::deserialize::<RegistryEntry<V>>(bytes) {
                Ok(entry) => decoded.push(entry),
                Err(_) => {
                    self.parse_failures += 1;
                }
            }
        }

        let starting = (frame.starting_index as usize).min(self.entries.len());
        let sent = decoded.len();
        let added = self.add_entries(decoded);
        debug!(registry = %self.name, added, "integrated transferred entries");

        if !self.session.is_idle() && self.session.target() == Some(frame.sender) {
            // Our initiated exchange: the remote's tail just arrived.
            self.session.complete();
            return Vec::new();
        }

        // Responder side: ship our tail back when we hold entries the
        // initiator did not send.
        if self.entries.len() > starting + sent {
            return self.entries_packet(starting);
        }
        // Nothing to offer. Confirm with an empty tail so the sender's
        // session closes promptly; never confirm a confirmation.
        if sent > 0 {
            return self.entries_packet(self.entries.len());
        }
        Vec::new()
    }

    fn hash_request_packet(&self, request_id: Uuid, index: usize, target: Uuid) -> Datagrams {
        let request = RegistryHashRequest {
            name: self.name.clone(),
            request_id,
            index: index as u32,
            target,
        };
        match wire::encode(TAG_REGISTRY_HASH_REQUEST, &request) {
            Ok(datagram) => vec![(MessageTarget::broadcast(), datagram)],
            Err(_) => Vec::new(),
        }
    }

    /// Serialize entries from `index` onward into a transfer frame. An
    /// empty tail is still sent: it tells the remote where to pick up.
    fn entries_packet(&self, index: usize) -> Datagrams {
        let serialized: Vec<Vec<u8>> = self.entries[index.min(self.entries.len())..]
            .iter()
            .filter_map(|entry| bincode::serialize(entry).ok())
            .collect();
        let frame = RegistryEntries {
            name: self.name.clone(),
            starting_index: index as u32,
            entries: serialized,
            sender: self.instance_id,
        };
        match wire::encode(TAG_REGISTRY_ENTRIES, &frame) {
            Ok(datagram) => vec![(MessageTarget::broadcast(), datagram)],
            Err(_) => {
                warn!(registry = %self.name, "entry transfer too large for one datagram");
                Vec::new()
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn session_phase(&self) -> &SyncPhase {
        self.session.phase()
    }
}
