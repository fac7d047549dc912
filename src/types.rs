//! Data structures shared across the agent.
//!
//! [`Member`] is what every node knows about every other node.  It is
//! serialised with [`serde`](https://serde.rs/) both for the `/agents`
//! endpoint and inside gossip [`Update`] messages, so the field set is
//! kept small.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Value carried by a [`TagKey::Volume`] tag.
pub const VOLUME_LOCAL: &str = "local";

/// Tag keys the agent interprets.
///
/// Anything else received from a peer is kept as [`TagKey::Other`] so that
/// newer agents can publish tags older ones do not understand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TagKey {
    /// `manager` or `worker`.
    Role,
    /// Agent version string.
    Version,
    /// The member owns the named volume.
    Volume(String),
    Other(String),
}

impl TagKey {
    const VOLUME_PREFIX: &'static str = "volume:";

    pub fn volume(name: impl Into<String>) -> Self {
        TagKey::Volume(name.into())
    }
}

impl From<String> for TagKey {
    fn from(raw: String) -> Self {
        if raw == "role" {
            return TagKey::Role;
        }
        if raw == "version" {
            return TagKey::Version;
        }
        if let Some(name) = raw.strip_prefix(Self::VOLUME_PREFIX) {
            if !name.is_empty() {
                return TagKey::Volume(name.to_string());
            }
        }
        TagKey::Other(raw)
    }
}

impl From<TagKey> for String {
    fn from(key: TagKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagKey::Role => f.write_str("role"),
            TagKey::Version => f.write_str("version"),
            TagKey::Volume(name) => write!(f, "{}{}", Self::VOLUME_PREFIX, name),
            TagKey::Other(raw) => f.write_str(raw),
        }
    }
}

pub type Tags = BTreeMap<TagKey, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Suspect,
    Failed,
    Left,
}

impl MemberStatus {
    /// Whether requests may be routed to a member in this state.
    pub fn is_routable(self) -> bool {
        matches!(self, MemberStatus::Alive | MemberStatus::Suspect)
    }
}

/// One agent instance participating in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable node identity (node name), never the network address.
    pub id: String,
    /// `host:port` of the member's HTTP listener.
    pub address: String,
    #[serde(default)]
    pub tags: Tags,
    pub status: MemberStatus,
}

impl Member {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            tags: Tags::new(),
            status: MemberStatus::Alive,
        }
    }

    pub fn with_tag(mut self, key: TagKey, value: impl Into<String>) -> Self {
        self.tags.insert(key, value.into());
        self
    }

    pub fn has_tag(&self, key: &TagKey, value: &str) -> bool {
        self.tags.get(key).map(String::as_str) == Some(value)
    }
}

/// Membership change delivered by the membership protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Join(Member),
    Update(Member),
    Suspect(String),
    Fail(String),
    Leave(String),
}

impl MembershipEvent {
    pub fn member_id(&self) -> &str {
        match self {
            MembershipEvent::Join(m) | MembershipEvent::Update(m) => &m.id,
            MembershipEvent::Suspect(id) | MembershipEvent::Fail(id) | MembershipEvent::Leave(id) => id,
        }
    }
}

/// A gossip message.
///
/// Every member periodically announces itself; the announcement doubles as
/// the heartbeat and as the tag update.  A graceful shutdown sends `Leave`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update {
    Announce { member: Member },
    Leave { id: String },
}

/// Volume change reported by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeUpdate {
    /// Full list of local volumes, sent after every (re)connect.
    Snapshot { names: Vec<String> },
    Add { name: String },
    Remove { name: String },
}

impl VolumeUpdate {
    /// Folds the change into a member's tags.  A snapshot replaces every
    /// volume tag.
    pub fn apply_to(self, tags: &mut Tags) {
        match self {
            VolumeUpdate::Snapshot { names } => {
                tags.retain(|key, _| !matches!(key, TagKey::Volume(_)));
                for name in names {
                    tags.insert(TagKey::Volume(name), VOLUME_LOCAL.to_string());
                }
            }
            VolumeUpdate::Add { name } => {
                tags.insert(TagKey::Volume(name), VOLUME_LOCAL.to_string());
            }
            VolumeUpdate::Remove { name } => {
                tags.remove(&TagKey::Volume(name));
            }
        }
    }
}
