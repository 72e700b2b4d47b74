//! The recursive-answer cache: a TTL-bounded map with CNAME back-reference
//! flattening so later lookups of a CNAME's owner return the terminal
//! A/AAAA answer directly.

use crate::enums::RecordType;
use crate::resourcerecord::InternalResourceRecord;
use crate::MAX_CNAME_CHASE;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone)]
struct CacheEntry {
    record_type: RecordType,
    expire: u64,
    answers: Vec<InternalResourceRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Maintain CNAME back-references and flatten A/AAAA answers up the chain.
    Flatten,
    /// Insert the entry without touching the back-reference map.
    Simple,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// target_name -> owner_name, for CNAMEs: lets an A/AAAA write for
    /// `target_name` find and rewrite the entries that point at it.
    backref: HashMap<String, String>,
}

/// Guarded by a single mutex, per the data model's "a single writer at a
/// time" discipline for cache mutation.
#[derive(Default)]
pub struct Cache {
    inner: Mutex<Inner>,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Cache {
    pub fn new() -> Self {
        Cache::default()
    }

    /// Returns `(answers, found, remaining_ttl)`. An expired entry is
    /// treated as absent and removed.
    pub fn get(&self, name: &str) -> (Vec<InternalResourceRecord>, bool, u32) {
        let name = name.to_ascii_lowercase();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = now();
        match inner.entries.get(&name) {
            Some(entry) if entry.expire > now => {
                let remaining = (entry.expire - now) as u32;
                (entry.answers.clone(), true, remaining)
            }
            Some(_) => {
                inner.entries.remove(&name);
                (vec![], false, 0)
            }
            None => (vec![], false, 0),
        }
    }

    /// Inserts or overwrites the cache entry for `name`.
    pub fn set(
        &self,
        mode: SetMode,
        name: &str,
        record_type: RecordType,
        answers: Vec<InternalResourceRecord>,
        ttl: u32,
    ) {
        let name = name.to_ascii_lowercase();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let expire = now() + ttl as u64;

        if mode == SetMode::Flatten {
            if record_type == RecordType::CNAME {
                if let Some(InternalResourceRecord::CNAME { cname, .. }) = answers.first() {
                    inner.backref.insert(cname.name.clone(), name.clone());
                }
            }
            if record_type == RecordType::A || record_type == RecordType::AAAA {
                let mut current = name.clone();
                let mut hops = 0usize;
                while let Some(owner) = inner.backref.get(&current).cloned() {
                    hops += 1;
                    if hops > MAX_CNAME_CHASE {
                        warn!(name = %name, "cycle guard tripped while flattening cache chain");
                        break;
                    }
                    if let Some(existing) = inner.entries.get(&owner).cloned() {
                        inner.entries.insert(
                            owner.clone(),
                            CacheEntry {
                                record_type,
                                expire: existing.expire,
                                answers: answers.clone(),
                            },
                        );
                    }
                    current = owner;
                }
            }
        }

        inner.entries.insert(
            name,
            CacheEntry {
                record_type,
                expire,
                answers,
            },
        );
    }
}
