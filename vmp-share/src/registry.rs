//! Reference-counted table of canonical prototypes

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use vmp_bytecode::{OwnerTag, Ownership, Proto};

use crate::key::{BUCKET_COUNT, ProtoKey};

/// How entries with equal keys are told apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeCompare {
    /// Trust code length and hash; colliding streams are merged
    #[default]
    Hash,
    /// Also compare the instruction streams word for word
    Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryConfig {
    pub code_compare: CodeCompare,
}

/// Stable reference to a registry entry.
///
/// A handle outlives nothing: once its entry is removed the slot's
/// generation moves on and lookups through the old handle fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtoHandle {
    slot: u32,
    generation: u32,
}

/// Result of [`ProtoRegistry::get`]
#[derive(Debug, Clone)]
pub struct SharedProto {
    pub handle: ProtoHandle,
    /// The canonical prototype every registrant shares; its reference
    /// count lives in the registry, not in its `ownership`
    pub proto: Arc<Proto>,
    /// Whether an equal prototype was already registered
    pub hit: bool,
}

#[derive(Debug)]
struct Entry {
    key: ProtoKey,
    canonical: Arc<Proto>,
    refcount: u32,
    owner: OwnerTag,
    next: Option<u32>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Statistics about registry usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub entries: usize,
    pub total_refs: u64,
    pub longest_chain: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Fixed 64-bucket registry of shared prototypes.
///
/// The registry does no locking of its own; wrap it in a
/// [`SharedRegistry`] to use it from several interpreters.
#[derive(Debug)]
pub struct ProtoRegistry {
    config: RegistryConfig,
    buckets: [Option<u32>; BUCKET_COUNT],
    slots: Vec<Slot>,
    free: Vec<u32>,
    hits: u64,
    misses: u64,
}

/// Registry handle shared between interpreters
pub type SharedRegistry = Arc<Mutex<ProtoRegistry>>;

impl ProtoRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            buckets: [None; BUCKET_COUNT],
            slots: Vec::new(),
            free: Vec::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Wrap a new registry for sharing
    pub fn shared(config: RegistryConfig) -> SharedRegistry {
        Arc::new(Mutex::new(Self::with_config(config)))
    }

    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    fn entry(&self, slot: u32) -> Option<&Entry> {
        self.slots.get(slot as usize)?.entry.as_ref()
    }

    fn entry_mut(&mut self, slot: u32) -> Option<&mut Entry> {
        self.slots.get_mut(slot as usize)?.entry.as_mut()
    }

    fn matches(&self, entry: &Entry, key: &ProtoKey, proto: &Proto) -> bool {
        entry.key == *key
            && match self.config.code_compare {
                CodeCompare::Hash => true,
                CodeCompare::Bytes => entry.canonical.code == proto.code,
            }
    }

    /// Walk `bucket`, returning the matching slot and its predecessor
    fn find(&self, bucket: usize, key: &ProtoKey, proto: &Proto) -> Option<(Option<u32>, u32)> {
        let mut prev = None;
        let mut cursor = self.buckets[bucket];
        while let Some(slot) = cursor {
            let entry = self.entry(slot)?;
            if self.matches(entry, key, proto) {
                return Some((prev, slot));
            }
            prev = Some(slot);
            cursor = entry.next;
        }
        None
    }

    fn handle(&self, slot: u32) -> ProtoHandle {
        ProtoHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    /// Register `proto` under `owner`, or join an equal prototype.
    ///
    /// Either way `proto` is marked shared; on a hit the returned
    /// prototype is the one registered first and `proto` itself should no
    /// longer be used for execution.
    pub fn get(&mut self, proto: &mut Proto, owner: OwnerTag) -> SharedProto {
        let key = ProtoKey::of(proto);
        let bucket = key.bucket();

        let found = self.find(bucket, &key, proto).map(|(_, slot)| slot);
        if let Some(slot) = found {
            let handle = self.handle(slot);
            let Some(entry) = self.entry_mut(slot) else {
                return self.insert(bucket, key, proto, owner);
            };
            entry.refcount += 1;
            let count = entry.refcount;
            let canonical = entry.canonical.clone();
            self.hits += 1;
            proto.ownership = Ownership::Shared { count, owner };
            debug!(bucket, refcount = count, %owner, "shared prototype reused");
            return SharedProto {
                handle,
                proto: canonical,
                hit: true,
            };
        }
        self.insert(bucket, key, proto, owner)
    }

    fn insert(&mut self, bucket: usize, key: ProtoKey, proto: &mut Proto, owner: OwnerTag) -> SharedProto {
        self.misses += 1;
        let canonical = Arc::new(Proto {
            ownership: Ownership::Exclusive,
            ..proto.clone()
        });
        proto.ownership = Ownership::Shared { count: 1, owner };
        let entry = Entry {
            key,
            canonical: canonical.clone(),
            refcount: 1,
            owner,
            next: self.buckets[bucket],
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].entry = Some(entry);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.buckets[bucket] = Some(slot);
        debug!(bucket, %owner, "shared prototype registered");
        SharedProto {
            handle: self.handle(slot),
            proto: canonical,
            hit: false,
        }
    }

    /// Drop one reference held through `proto`.
    ///
    /// Returns the remaining count, or `None` when `proto` is not shared
    /// or no longer registered. At zero the entry is removed and `proto`
    /// becomes exclusive again.
    pub fn release(&mut self, proto: &mut Proto) -> Option<u32> {
        let Ownership::Shared { owner, .. } = proto.ownership else {
            return None;
        };
        let key = ProtoKey::of(proto);
        let bucket = key.bucket();
        let (prev, slot) = self.find(bucket, &key, proto)?;

        let entry = self.entry_mut(slot)?;
        entry.refcount -= 1;
        let remaining = entry.refcount;
        let next = entry.next;
        if remaining > 0 {
            proto.ownership = Ownership::Shared {
                count: remaining,
                owner,
            };
            debug!(bucket, refcount = remaining, "shared prototype released");
            return Some(remaining);
        }

        match prev {
            Some(p) => {
                if let Some(prev_entry) = self.entry_mut(p) {
                    prev_entry.next = next;
                }
            }
            None => self.buckets[bucket] = next,
        }
        let freed = &mut self.slots[slot as usize];
        freed.entry = None;
        freed.generation = freed.generation.wrapping_add(1);
        self.free.push(slot);
        proto.ownership = Ownership::Exclusive;
        debug!(bucket, "shared prototype removed");
        Some(0)
    }

    /// Current reference count behind `handle`
    pub fn refcount(&self, handle: ProtoHandle) -> Option<u32> {
        self.live(handle).map(|e| e.refcount)
    }

    pub fn resolve(&self, handle: ProtoHandle) -> Option<Arc<Proto>> {
        self.live(handle).map(|e| e.canonical.clone())
    }

    /// Owner that registered the entry first
    pub fn owner(&self, handle: ProtoHandle) -> Option<OwnerTag> {
        self.live(handle).map(|e| e.owner)
    }

    fn live(&self, handle: ProtoHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries with their reference counts
    pub fn entries(&self) -> impl Iterator<Item = (ProtoHandle, &Arc<Proto>, u32)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry.as_ref().map(|e| {
                let handle = ProtoHandle {
                    slot: i as u32,
                    generation: slot.generation,
                };
                (handle, &e.canonical, e.refcount)
            })
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let mut longest_chain = 0;
        for head in self.buckets {
            let mut len = 0;
            let mut cursor = head;
            while let Some(slot) = cursor {
                len += 1;
                cursor = self.entry(slot).and_then(|e| e.next);
            }
            longest_chain = longest_chain.max(len);
        }
        RegistryStats {
            entries: self.len(),
            total_refs: self.entries().map(|(_, _, rc)| rc as u64).sum(),
            longest_chain,
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Forget every entry. Prototypes still marked shared stay marked.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.buckets = [None; BUCKET_COUNT];
    }
}

impl Default for ProtoRegistry {
    fn default() -> Self {
        Self::new()
    }
}
