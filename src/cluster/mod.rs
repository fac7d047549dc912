//! Cluster membership service.
//!
//! [`ClusterService`] owns the [`MemberDirectory`] and is the only part of
//! the agent that talks to the [`MembershipProtocol`].  Everything else
//! reads membership through its queries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::error::JoinError;
use crate::types::{Member, MemberStatus, MembershipEvent, Tags};

pub mod directory;

pub use directory::{MemberDirectory, Snapshot};

/// Capabilities the cluster needs from a membership/failure-detection
/// transport.
#[async_trait]
pub trait MembershipProtocol: Send + Sync {
    /// Contacts the given seeds.  Returns the number of peers reached.
    async fn join(&self, seeds: &[String]) -> Result<usize, JoinError>;

    /// Tells peers this node is going away.
    async fn leave(&self) -> anyhow::Result<()>;

    /// Publishes the local member, including its current tags.
    async fn announce(&self, local: &Member) -> anyhow::Result<()>;

    /// Registers the channel membership events are delivered on.
    fn subscribe(&self, events: mpsc::Sender<MembershipEvent>);
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub join_attempts: u32,
    pub join_backoff: Duration,
    pub leave_timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            join_attempts: 3,
            join_backoff: Duration::from_secs(2),
            leave_timeout: Duration::from_secs(3),
        }
    }
}

pub struct ClusterService {
    local_id: String,
    directory: MemberDirectory,
    protocol: Arc<dyn MembershipProtocol>,
    settings: ClusterSettings,
}

impl ClusterService {
    pub fn new(
        local: Member,
        protocol: Arc<dyn MembershipProtocol>,
        settings: ClusterSettings,
    ) -> Self {
        let directory = MemberDirectory::new();
        let local_id = local.id.clone();
        directory.upsert(Member {
            status: MemberStatus::Alive,
            ..local
        });
        Self {
            local_id,
            directory,
            protocol,
            settings,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn snapshot(&self) -> Snapshot {
        self.directory.snapshot()
    }

    /// All known members, ordered by id.
    pub fn members(&self) -> Vec<Member> {
        self.directory.snapshot().to_vec()
    }

    pub fn local_member(&self) -> Member {
        let snapshot = self.directory.snapshot();
        match snapshot.get(&self.local_id) {
            Some(member) => member.clone(),
            // Only reachable if someone removed the local entry behind our back.
            None => Member::new(self.local_id.clone(), String::new()),
        }
    }

    /// Joins the cluster through `seeds`, retrying the whole seed list up to
    /// the configured number of attempts.  An empty seed list means this
    /// node starts a cluster of its own and waits for others to join it.
    /// When every attempt fails the node still falls back to that listening
    /// mode, so peers that list it as a seed can reach it; the error is
    /// returned all the same.
    pub async fn join(&self, seeds: &[String]) -> Result<usize, JoinError> {
        if seeds.is_empty() {
            info!("No seeds configured, running as a single-member cluster");
            let reached = self.protocol.join(seeds).await?;
            self.announce_local().await;
            return Ok(reached);
        }

        let attempts = self.settings.join_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.protocol.join(seeds).await {
                Ok(reached) => {
                    info!("Joined cluster through {} peer(s)", reached);
                    self.announce_local().await;
                    return Ok(reached);
                }
                Err(e) => {
                    warn!("Join attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                sleep(self.settings.join_backoff).await;
            }
        }

        match self.protocol.join(&[]).await {
            Ok(_) => {
                warn!("No seed reachable, listening for peers instead");
                self.announce_local().await;
            }
            Err(e) => warn!("Failed to listen for peers: {}", e),
        }

        Err(JoinError::Unreachable {
            attempts,
            reason: last_error,
        })
    }

    async fn announce_local(&self) {
        if let Err(e) = self.protocol.announce(&self.local_member()).await {
            warn!("Failed to announce local member after join: {}", e);
        }
    }

    /// Best-effort departure notice, bounded by the leave timeout.
    pub async fn leave(&self) {
        self.directory.set_status(&self.local_id, MemberStatus::Left);
        match timeout(self.settings.leave_timeout, self.protocol.leave()).await {
            Ok(Ok(())) => info!("Left cluster"),
            Ok(Err(e)) => warn!("Failed to notify peers of departure: {}", e),
            Err(_) => warn!(
                "Leave notification timed out after {:?}",
                self.settings.leave_timeout
            ),
        }
    }

    pub fn handle_membership_event(&self, event: MembershipEvent) {
        if event.member_id() == self.local_id {
            debug!("Ignoring membership event about the local member: {:?}", event);
            return;
        }

        match event {
            MembershipEvent::Join(member) => {
                info!("Member joined: {} ({})", member.id, member.address);
                self.directory.upsert(Member {
                    status: MemberStatus::Alive,
                    ..member
                });
                debug!("{} members known", self.directory.snapshot().len());
            }
            MembershipEvent::Update(member) => {
                debug!("Member updated: {}", member.id);
                self.directory.upsert(Member {
                    status: MemberStatus::Alive,
                    ..member
                });
            }
            MembershipEvent::Suspect(id) => {
                if self.directory.set_status(&id, MemberStatus::Suspect) {
                    warn!("Member suspected: {}", id);
                }
            }
            MembershipEvent::Fail(id) => {
                if self.directory.set_status(&id, MemberStatus::Failed) {
                    warn!("Member failed: {}", id);
                }
            }
            MembershipEvent::Leave(id) => {
                if self.directory.remove(&id).is_some() {
                    info!("Member left: {}", id);
                }
            }
        }
    }

    /// Replaces the local tags through `update` and announces the result.
    pub async fn update_local_tags<F>(&self, update: F)
    where
        F: FnOnce(&mut Tags),
    {
        let mut local = self.local_member();
        update(&mut local.tags);
        self.directory.upsert(local.clone());
        if let Err(e) = self.protocol.announce(&local).await {
            warn!("Failed to announce tag update: {}", e);
        }
    }

    /// Subscribes to the protocol and applies its events in delivery order.
    pub fn run_events(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel(256);
        self.protocol.subscribe(tx);
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                cluster.handle_membership_event(event);
            }
            info!("Membership event channel closed");
        })
    }
}
