//! In-memory member directory.
//!
//! The map lives behind an `Arc` that writers replace wholesale, so a reader
//! holding a [`Snapshot`] keeps seeing exactly the state it was taken from.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{Member, MemberStatus, TagKey};

/// Point-in-time view of the directory, ordered by member id.
#[derive(Debug, Clone, Default)]
pub struct Snapshot(Arc<BTreeMap<String, Member>>);

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&Member> {
        self.0.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Members carrying `key` with exactly `value`, ordered by id.
    pub fn with_tag<'a>(&'a self, key: &'a TagKey, value: &'a str) -> impl Iterator<Item = &'a Member> {
        self.0.values().filter(move |m| m.has_tag(key, value))
    }

    pub fn to_vec(&self) -> Vec<Member> {
        self.0.values().cloned().collect()
    }
}

#[derive(Debug, Default)]
pub struct MemberDirectory {
    members: RwLock<Arc<BTreeMap<String, Member>>>,
}

impl MemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `member.id`.  Tags are not merged.
    pub fn upsert(&self, member: Member) {
        let mut guard = self.members.write();
        let mut next = (**guard).clone();
        next.insert(member.id.clone(), member);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, id: &str) -> Option<Member> {
        let mut guard = self.members.write();
        if !guard.contains_key(id) {
            return None;
        }
        let mut next = (**guard).clone();
        let removed = next.remove(id);
        *guard = Arc::new(next);
        removed
    }

    /// Returns false when `id` is unknown.
    pub fn set_status(&self, id: &str, status: MemberStatus) -> bool {
        let mut guard = self.members.write();
        match guard.get(id) {
            Some(current) if current.status == status => true,
            Some(current) => {
                let updated = Member {
                    status,
                    ..current.clone()
                };
                let mut next = (**guard).clone();
                next.insert(id.to_string(), updated);
                *guard = Arc::new(next);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.members.read().clone())
    }
}
