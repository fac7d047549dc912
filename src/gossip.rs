//! Membership transport based on Iroh gossip.
//!
//! Every node periodically broadcasts a signed [`Update::Announce`] carrying
//! its member record.  Receivers feed those heartbeats to a
//! [`FailureDetector`] which turns silence into suspect, fail and finally
//! leave events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use iroh::protocol::Router;
use iroh::{Endpoint, NodeId};
use iroh_gossip::net::{Event, Gossip, GossipEvent, GossipReceiver, GossipSender, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::cluster::MembershipProtocol;
use crate::error::JoinError;
use crate::types::{Member, MemberStatus, MembershipEvent, Update};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub heartbeat_interval: Duration,
    pub suspect_after: Duration,
    pub fail_after: Duration,
    pub reap_after: Duration,
}

/// Wire form of an [`Update`].  `payload` is the JSON encoding and
/// `digest` is `hex(sha256(secret || payload))`.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    payload: String,
    digest: String,
}

fn digest(secret: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

pub fn seal(secret: &str, update: &Update) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_string(update)?;
    let envelope = Envelope {
        digest: digest(secret, payload.as_bytes()),
        payload,
    };
    Ok(serde_json::to_vec(&envelope)?.into())
}

pub fn open(secret: &str, bytes: &[u8]) -> anyhow::Result<Update> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if digest(secret, envelope.payload.as_bytes()) != envelope.digest {
        anyhow::bail!("digest mismatch");
    }
    Ok(serde_json::from_str(&envelope.payload)?)
}

struct PeerState {
    member: Member,
    last_seen: Instant,
}

/// Heartbeat bookkeeping for remote members.
pub struct FailureDetector {
    settings: DetectorSettings,
    peers: HashMap<String, PeerState>,
}

impl FailureDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            settings,
            peers: HashMap::new(),
        }
    }

    /// Records a heartbeat.  Returns an event only when the member is new,
    /// changed, or recovering from suspicion.
    pub fn observe(&mut self, member: Member, now: Instant) -> Option<MembershipEvent> {
        let member = Member {
            status: MemberStatus::Alive,
            ..member
        };
        match self.peers.get_mut(&member.id) {
            None => {
                self.peers.insert(
                    member.id.clone(),
                    PeerState {
                        member: member.clone(),
                        last_seen: now,
                    },
                );
                Some(MembershipEvent::Join(member))
            }
            Some(peer) => {
                peer.last_seen = now;
                if peer.member == member {
                    return None;
                }
                peer.member = member.clone();
                Some(MembershipEvent::Update(member))
            }
        }
    }

    pub fn forget(&mut self, id: &str) -> Option<MembershipEvent> {
        self.peers
            .remove(id)
            .map(|_| MembershipEvent::Leave(id.to_string()))
    }

    /// Ages every peer against `now`, ordered by member id.
    pub fn sweep(&mut self, now: Instant) -> Vec<MembershipEvent> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();

        let mut events = Vec::new();
        for id in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            let silent = now.saturating_duration_since(peer.last_seen);
            if silent >= self.settings.reap_after {
                self.peers.remove(&id);
                events.push(MembershipEvent::Leave(id));
            } else if silent >= self.settings.fail_after {
                if peer.member.status != MemberStatus::Failed {
                    peer.member.status = MemberStatus::Failed;
                    events.push(MembershipEvent::Fail(id));
                }
            } else if silent >= self.settings.suspect_after
                && peer.member.status == MemberStatus::Alive
            {
                peer.member.status = MemberStatus::Suspect;
                events.push(MembershipEvent::Suspect(id));
            }
        }
        events
    }
}

struct Shared {
    local_id: String,
    secret: String,
    detector: Mutex<FailureDetector>,
    events: Mutex<Option<mpsc::Sender<MembershipEvent>>>,
    local: Mutex<Option<Member>>,
    sender: tokio::sync::Mutex<Option<GossipSender>>,
}

impl Shared {
    async fn emit(&self, event: MembershipEvent) {
        let events = self.events.lock().clone();
        if let Some(events) = events {
            if events.send(event).await.is_err() {
                debug!("Membership event dropped, no subscriber");
            }
        }
    }

    async fn broadcast(&self, update: &Update) -> anyhow::Result<()> {
        let bytes = seal(&self.secret, update)?;
        match self.sender.lock().await.as_ref() {
            Some(sender) => sender.broadcast(bytes).await,
            None => anyhow::bail!("not subscribed to the gossip topic"),
        }
    }

    async fn apply(&self, update: Update) {
        let event = match update {
            Update::Announce { member } if member.id == self.local_id => None,
            Update::Announce { member } => self.detector.lock().observe(member, Instant::now()),
            Update::Leave { id } => self.detector.lock().forget(&id),
        };
        if let Some(event) = event {
            self.emit(event).await;
        }
    }

    async fn receive(self: Arc<Self>, mut receiver: GossipReceiver) {
        while let Some(event) = receiver.next().await {
            match event {
                Ok(Event::Gossip(GossipEvent::Received(msg))) => {
                    match open(&self.secret, &msg.content) {
                        Ok(update) => self.apply(update).await,
                        Err(e) => warn!("Rejected gossip message from {}: {}", msg.delivered_from, e),
                    }
                }
                Ok(Event::Gossip(GossipEvent::NeighborUp(peer))) => {
                    info!("Gossip peer joined: {}", peer);
                }
                Ok(Event::Gossip(GossipEvent::NeighborDown(peer))) => {
                    info!("Gossip peer left: {}", peer);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Gossip receiver error: {}", e);
                    break;
                }
            }
        }
        info!("Gossip receiver closed");
    }

    async fn heartbeat(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let local = self.local.lock().clone();
            if let Some(member) = local {
                if let Err(e) = self.broadcast(&Update::Announce { member }).await {
                    debug!("Heartbeat broadcast failed: {}", e);
                }
            }
            let events = self.detector.lock().sweep(Instant::now());
            for event in events {
                self.emit(event).await;
            }
        }
    }
}

/// [`MembershipProtocol`] over an Iroh gossip topic.
pub struct GossipMembership {
    shared: Arc<Shared>,
    gossip: Gossip,
    topic: TopicId,
    heartbeat_interval: Duration,
    node_id: NodeId,
    _router: Router,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipMembership {
    pub async fn bind(
        local_id: String,
        topic_id: &str,
        secret: String,
        settings: DetectorSettings,
    ) -> anyhow::Result<Self> {
        let topic_bytes = hex::decode(topic_id)?;
        let topic = TopicId::from_bytes(
            topic_bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid topic ID length"))?,
        );

        let endpoint = Endpoint::builder().discovery_n0().bind().await?;
        let node_id = endpoint.node_id();
        info!("Gossip endpoint created with ID: {}", node_id);

        let my_addr = endpoint.node_addr().await?;
        let gossip = Gossip::from_endpoint(
            endpoint.clone(),
            iroh_gossip::proto::Config::default(),
            &my_addr.info,
        );
        let router = Router::builder(endpoint)
            .accept(GOSSIP_ALPN, Arc::new(gossip.clone()))
            .spawn()
            .await?;

        let heartbeat_interval = settings.heartbeat_interval;
        Ok(Self {
            shared: Arc::new(Shared {
                local_id,
                secret,
                detector: Mutex::new(FailureDetector::new(settings)),
                events: Mutex::new(None),
                local: Mutex::new(None),
                sender: tokio::sync::Mutex::new(None),
            }),
            gossip,
            topic,
            heartbeat_interval,
            node_id,
            _router: router,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Id other nodes list as a seed to reach this one.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

#[async_trait]
impl MembershipProtocol for GossipMembership {
    async fn join(&self, seeds: &[String]) -> Result<usize, JoinError> {
        let mut bootstrap = Vec::new();
        for seed in seeds {
            match seed.parse::<NodeId>() {
                Ok(id) => bootstrap.push(id),
                Err(_) => warn!("Invalid bootstrap peer ID: {}", seed),
            }
        }
        if !seeds.is_empty() && bootstrap.is_empty() {
            return Err(JoinError::Protocol(anyhow::anyhow!(
                "no valid bootstrap peer ids"
            )));
        }

        let reached = bootstrap.len();
        let topic = self.gossip.subscribe(self.topic, bootstrap)?;
        let (sender, mut receiver) = topic.split();
        if reached > 0 {
            match timeout(JOIN_TIMEOUT, receiver.joined()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(JoinError::Protocol(e)),
                Err(_) => {
                    return Err(JoinError::Protocol(anyhow::anyhow!(
                        "no peer answered within {:?}",
                        JOIN_TIMEOUT
                    )))
                }
            }
        }

        *self.shared.sender.lock().await = Some(sender);
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        tasks.push(tokio::spawn(Arc::clone(&self.shared).receive(receiver)));
        tasks.push(tokio::spawn(
            Arc::clone(&self.shared).heartbeat(self.heartbeat_interval),
        ));
        Ok(reached)
    }

    async fn leave(&self) -> anyhow::Result<()> {
        let update = Update::Leave {
            id: self.shared.local_id.clone(),
        };
        let result = self.shared.broadcast(&update).await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        result
    }

    async fn announce(&self, local: &Member) -> anyhow::Result<()> {
        *self.shared.local.lock() = Some(local.clone());
        self.shared
            .broadcast(&Update::Announce {
                member: local.clone(),
            })
            .await
    }

    fn subscribe(&self, events: mpsc::Sender<MembershipEvent>) {
        *self.shared.events.lock() = Some(events);
    }
}
