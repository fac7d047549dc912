//! Resolution policy: which member(s) should serve a request.
//!
//! Everything here is a pure function of a directory [`Snapshot`]; no I/O,
//! no state.

use log::warn;

use crate::cluster::Snapshot;
use crate::types::{Member, TagKey, VOLUME_LOCAL};

/// What a request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey {
    /// No resource key: handled by this node.
    Local,
    /// A volume owned by exactly one member.
    Volume(String),
    /// Cluster-wide listing.
    Broadcast,
}

impl RouteKey {
    /// Route for an optional `volumeID` query parameter.
    pub fn for_volume(volume_id: Option<&str>) -> Self {
        match volume_id {
            Some(id) if !id.is_empty() => RouteKey::Volume(id.to_string()),
            _ => RouteKey::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Unicast(Member),
    Broadcast(Vec<Member>),
    Unresolved,
}

pub fn resolve(key: &RouteKey, snapshot: &Snapshot, local_id: &str) -> Decision {
    match key {
        RouteKey::Local => match snapshot.get(local_id) {
            Some(local) => Decision::Unicast(local.clone()),
            None => Decision::Unresolved,
        },
        RouteKey::Volume(volume) => resolve_owner(volume, snapshot),
        RouteKey::Broadcast => Decision::Broadcast(
            snapshot
                .iter()
                .filter(|m| m.status.is_routable())
                .cloned()
                .collect(),
        ),
    }
}

fn resolve_owner(volume: &str, snapshot: &Snapshot) -> Decision {
    // Snapshot iteration is ordered by id, so the first owner is the smallest.
    let key = TagKey::volume(volume);
    let mut owners = snapshot
        .with_tag(&key, VOLUME_LOCAL)
        .filter(|m| m.status.is_routable());

    let Some(first) = owners.next() else {
        return Decision::Unresolved;
    };

    let others: Vec<&str> = owners.map(|m| m.id.as_str()).collect();
    if !others.is_empty() {
        warn!(
            "Volume {} is claimed by several members ({} and {:?}), routing to {}",
            volume, first.id, others, first.id
        );
    }
    Decision::Unicast(first.clone())
}
