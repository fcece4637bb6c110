//! Kademlia DHT over libp2p.
//!
//! One swarm task owns all libp2p state. [`KadDht`] handles talk to it over
//! a command channel and wait on a oneshot per reply. Market records pass
//! the [`RecordValidator`] three times: before we publish, when another node
//! pushes one to us, and for every candidate a lookup collects. A lookup
//! then keeps the candidate `select` picks.
//!
//! Peer ids are the hex Ed25519 keys the market already uses. The libp2p
//! `PeerId` is derived from the same key, so the two convert both ways.
//! Holder addresses learned from market records name transfer ports, not
//! DHT ports, so they are kept beside the routing table rather than in it.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use libp2p::core::upgrade;
use libp2p::kad::store::{MemoryStore, MemoryStoreConfig, RecordStore};
use libp2p::kad::{self, QueryId};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{identify, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport};
use orca_core::crypto::Identity;
use orca_core::wire::MAX_FRAME_LEN;
use tokio::sync::{mpsc, oneshot};

use crate::dht::{parse_bootstrap, Dht, DhtError, RecordValidator};

const KAD_PROTOCOL: &str = "/orcanet/kad/1.0.0";
const IDENTIFY_PROTOCOL: &str = "/orcanet/1.0.0";

/// Largest record value a node will hold.
const MAX_RECORD_LEN: usize = 1024 * 1024;

const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack on top of the query timeout before a handle gives up on the swarm task.
const REPLY_GRACE: Duration = Duration::from_secs(1);

#[derive(NetworkBehaviour)]
struct MarketBehaviour {
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
}

enum Command {
    Put {
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, DhtError>>,
    },
    Join {
        peer: PeerId,
        addr: Multiaddr,
    },
    RoutingTable {
        reply: oneshot::Sender<Vec<(PeerId, Vec<Multiaddr>)>>,
    },
    Shutdown,
}

/// Handle to a running DHT node. Dropping it stops the node.
pub struct KadDht {
    commands: mpsc::UnboundedSender<Command>,
    validator: Arc<dyn RecordValidator>,
    contacts: DashMap<String, String>,
    local_id: String,
    listen_addr: Multiaddr,
    query_timeout: Duration,
}

impl KadDht {
    /// Start a node for `identity` listening on `listen` (`host:port`, port 0 picks one).
    ///
    /// Every query is bounded by `query_timeout`.
    pub async fn spawn(
        identity: &Identity,
        listen: &str,
        validator: Arc<dyn RecordValidator>,
        query_timeout: Duration,
    ) -> Result<Self, DhtError> {
        let keypair = keypair_for(identity)?;
        let local_peer = keypair.public().to_peer_id();

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise::Config::new(&keypair).map_err(network)?)
            .multiplex(yamux::Config::default())
            .boxed();

        let mut kad_config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL));
        kad_config.set_query_timeout(query_timeout);
        kad_config.set_record_filtering(kad::StoreInserts::FilterBoth);
        kad_config.set_max_packet_size(MAX_FRAME_LEN);
        let store = MemoryStore::with_config(
            local_peer,
            MemoryStoreConfig {
                max_value_bytes: MAX_RECORD_LEN,
                ..Default::default()
            },
        );
        let mut kademlia = kad::Behaviour::with_config(local_peer, store, kad_config);
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let mut swarm = Swarm::new(
            transport,
            MarketBehaviour {
                kademlia,
                identify,
            },
            local_peer,
            libp2p::swarm::Config::with_tokio_executor()
                .with_idle_connection_timeout(Duration::from_secs(60)),
        );

        let listen_on = to_multiaddr(listen)
            .ok_or_else(|| DhtError::Network(format!("bad listen address {listen:?}")))?;
        swarm.listen_on(listen_on).map_err(network)?;
        let listen_addr = tokio::time::timeout(LISTEN_TIMEOUT, async {
            loop {
                if let SwarmEvent::NewListenAddr { address, .. } = swarm.select_next_some().await {
                    return address;
                }
            }
        })
        .await
        .map_err(|_| DhtError::Network(format!("no listen address on {listen}")))?;

        let local_id = identity.peer_id();
        tracing::info!(peer_id = %local_id, addr = %listen_addr, "DHT node listening");

        let (commands, rx) = mpsc::unbounded_channel();
        let driver = SwarmDriver {
            swarm,
            validator: validator.clone(),
            gets: HashMap::new(),
            puts: HashMap::new(),
        };
        tokio::spawn(driver.run(rx));

        Ok(Self {
            commands,
            validator,
            contacts: DashMap::new(),
            local_id,
            listen_addr,
            query_timeout,
        })
    }

    pub fn listen_addr(&self) -> &Multiaddr {
        &self.listen_addr
    }

    /// This node as a bootstrap entry (`peer_id@host:port`) for others to join through.
    pub fn contact(&self) -> String {
        format!(
            "{}@{}",
            self.local_id,
            host_port(&self.listen_addr).unwrap_or_default()
        )
    }

    /// Stop the swarm task. Later calls fail with [`DhtError::Network`].
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), DhtError> {
        self.commands
            .send(command)
            .map_err(|_| DhtError::Network("DHT node stopped".into()))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, DhtError>>) -> Command,
    ) -> Result<T, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        match tokio::time::timeout(self.query_timeout + REPLY_GRACE, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DhtError::Network("DHT node stopped".into())),
            Err(_) => Err(DhtError::Timeout),
        }
    }

    async fn routing_table(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::RoutingTable { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

impl Drop for KadDht {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

#[async_trait]
impl Dht for KadDht {
    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<(), DhtError> {
        if let Err(e) = self.validator.validate(key, &value) {
            tracing::warn!(key, error = %e, "record rejected by validator");
            return Err(e.into());
        }
        let key = key.to_string();
        self.request(|reply| Command::Put { key, value, reply })
            .await
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        let key = key.to_string();
        self.request(|reply| Command::Get { key, reply }).await
    }

    async fn bootstrap(&self, peers: &[String]) -> Result<usize, DhtError> {
        let mut joins = Vec::with_capacity(peers.len());
        for entry in peers {
            let (id, addr) = parse_bootstrap(entry)?;
            let peer = peer_id_from_hex(id)?;
            let dial = to_multiaddr(addr)
                .ok_or_else(|| DhtError::BadBootstrapAddr(entry.to_string()))?;
            joins.push((id.to_string(), addr.to_string(), peer, dial));
        }
        let added = joins.len();
        for (id, addr, peer, dial) in joins {
            self.contacts.insert(id, addr);
            self.send(Command::Join { peer, addr: dial })?;
        }
        tracing::info!(peers = added, "joining DHT through bootstrap peers");
        Ok(added)
    }

    async fn find_peer(&self, peer_id: &str) -> Result<String, DhtError> {
        if let Some(addr) = self.contacts.get(peer_id) {
            return Ok(addr.value().clone());
        }
        let not_found = || DhtError::PeerNotFound(peer_id.to_string());
        let wanted = peer_id_from_hex(peer_id).map_err(|_| not_found())?;
        self.routing_table()
            .await
            .into_iter()
            .find(|(peer, _)| *peer == wanted)
            .and_then(|(_, addrs)| addrs.iter().find_map(host_port))
            .ok_or_else(not_found)
    }

    async fn list_peers(&self) -> Vec<String> {
        let mut peers: BTreeSet<String> =
            self.contacts.iter().map(|e| e.key().clone()).collect();
        peers.extend(
            self.routing_table()
                .await
                .iter()
                .filter_map(|(peer, _)| hex_from_peer_id(peer)),
        );
        peers.remove(&self.local_id);
        peers.into_iter().collect()
    }

    async fn add_peer(&self, peer_id: &str, addr: &str) {
        if peer_id != self.local_id {
            self.contacts.insert(peer_id.to_string(), addr.to_string());
        }
    }
}

// ── Swarm task ────────────────────────────────────────────────────────────────

struct PendingGet {
    key: String,
    candidates: Vec<Vec<u8>>,
    reply: oneshot::Sender<Result<Option<Vec<u8>>, DhtError>>,
}

struct SwarmDriver {
    swarm: Swarm<MarketBehaviour>,
    validator: Arc<dyn RecordValidator>,
    gets: HashMap<QueryId, PendingGet>,
    puts: HashMap<QueryId, oneshot::Sender<Result<(), DhtError>>>,
}

impl SwarmDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        tracing::info!("DHT node stopped");
    }

    fn kad(&mut self) -> &mut kad::Behaviour<MemoryStore> {
        &mut self.swarm.behaviour_mut().kademlia
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Put { key, value, reply } => {
                let record = kad::Record::new(kad::RecordKey::new(&key), value);
                match self.kad().put_record(record, kad::Quorum::One) {
                    Ok(id) => {
                        self.puts.insert(id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(network(e)));
                    }
                }
            }
            Command::Get { key, reply } => {
                let record_key = kad::RecordKey::new(&key);
                let mut candidates = Vec::new();
                if let Some(held) = self.kad().store_mut().get(&record_key) {
                    candidates.push(held.value.clone());
                }
                let id = self.kad().get_record(record_key);
                self.gets.insert(
                    id,
                    PendingGet {
                        key,
                        candidates,
                        reply,
                    },
                );
            }
            Command::Join { peer, addr } => {
                self.kad().add_address(&peer, addr.clone());
                let dial = addr.with(Protocol::P2p(peer));
                if let Err(e) = self.swarm.dial(dial.clone()) {
                    tracing::warn!(addr = %dial, error = %e, "failed to dial bootstrap peer");
                }
                if let Err(e) = self.kad().bootstrap() {
                    tracing::debug!(error = %e, "DHT bootstrap deferred");
                }
            }
            Command::RoutingTable { reply } => {
                let mut peers: Vec<(PeerId, Vec<Multiaddr>)> = Vec::new();
                for bucket in self.kad().kbuckets() {
                    for entry in bucket.iter() {
                        peers.push((
                            *entry.node.key.preimage(),
                            entry.node.value.iter().cloned().collect(),
                        ));
                    }
                }
                let _ = reply.send(peers);
            }
            Command::Shutdown => {}
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<MarketBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MarketBehaviourEvent::Kademlia(event)) => self.on_kad_event(event),
            SwarmEvent::Behaviour(MarketBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.kad().add_address(&peer_id, addr);
                }
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                tracing::debug!(peer = %peer_id, "DHT connection established");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!(peer = ?peer_id, error = %error, "DHT dial failed");
            }
            _ => {}
        }
    }

    fn on_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(found))) => {
                    if let Some(pending) = self.gets.get_mut(&id) {
                        match self.validator.validate(&pending.key, &found.record.value) {
                            Ok(()) => pending.candidates.push(found.record.value),
                            Err(e) => {
                                tracing::warn!(peer = ?found.peer, key = %pending.key, error = %e, "dropping invalid record from lookup");
                            }
                        }
                    }
                    if step.last {
                        self.finish_get(id, None);
                    }
                }
                kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord {
                    ..
                })) => self.finish_get(id, None),
                kad::QueryResult::GetRecord(Err(kad::GetRecordError::Timeout { .. })) => {
                    self.finish_get(id, Some(DhtError::Timeout));
                }
                kad::QueryResult::GetRecord(Err(e)) => {
                    tracing::debug!(error = %e, "record lookup ended");
                    self.finish_get(id, None);
                }
                kad::QueryResult::PutRecord(result) => {
                    let Some(reply) = self.puts.remove(&id) else {
                        return;
                    };
                    let outcome = match result {
                        Ok(_) => Ok(()),
                        Err(kad::PutRecordError::QuorumFailed { .. }) => {
                            tracing::debug!("no remote node took the record, serving it locally");
                            Ok(())
                        }
                        Err(_) => Err(DhtError::Timeout),
                    };
                    let _ = reply.send(outcome);
                }
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    tracing::debug!(remaining = ok.num_remaining, "DHT bootstrap step");
                }
                _ => {}
            },
            kad::Event::InboundRequest {
                request:
                    kad::InboundRequest::PutRecord {
                        source,
                        record: Some(record),
                        ..
                    },
                ..
            } => self.accept_pushed(source, record),
            kad::Event::RoutingUpdated { peer, .. } => {
                tracing::debug!(%peer, "DHT routing table updated");
            }
            _ => {}
        }
    }

    /// Store a record another node pushed, if it validates and beats what we hold.
    fn accept_pushed(&mut self, source: PeerId, record: kad::Record) {
        let Ok(key) = String::from_utf8(record.key.to_vec()) else {
            tracing::debug!(peer = %source, "dropping record with non-utf8 key");
            return;
        };
        if let Err(e) = self.validator.validate(&key, &record.value) {
            tracing::warn!(peer = %source, key, error = %e, "rejected pushed record");
            return;
        }

        let validator = self.validator.clone();
        let store = self.kad().store_mut();
        let keep_held = store.get(&record.key).is_some_and(|held| {
            validator.select(&key, &[held.value.clone(), record.value.clone()]) == 0
        });
        if keep_held {
            tracing::debug!(peer = %source, key, "pushed record loses to the one held");
            return;
        }
        if let Err(e) = store.put(record) {
            tracing::warn!(peer = %source, key, error = %e, "failed to store pushed record");
        }
    }

    fn finish_get(&mut self, id: QueryId, error: Option<DhtError>) {
        let Some(pending) = self.gets.remove(&id) else {
            return;
        };
        let outcome = if pending.candidates.is_empty() {
            error.map_or(Ok(None), Err)
        } else {
            let best = self.validator.select(&pending.key, &pending.candidates);
            Ok(pending.candidates.into_iter().nth(best))
        };
        let _ = pending.reply.send(outcome);
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

fn network(e: impl std::fmt::Display) -> DhtError {
    DhtError::Network(e.to_string())
}

/// The libp2p keypair behind a market identity.
fn keypair_for(identity: &Identity) -> Result<libp2p::identity::Keypair, DhtError> {
    let mut secret = identity.secret_bytes();
    libp2p::identity::Keypair::ed25519_from_bytes(&mut secret[..]).map_err(network)
}

/// libp2p peer id for a hex public key.
pub fn peer_id_from_hex(peer_id: &str) -> Result<PeerId, DhtError> {
    let bad = || DhtError::BadPeerId(peer_id.to_string());
    let bytes = hex::decode(peer_id).map_err(|_| bad())?;
    let key = libp2p::identity::ed25519::PublicKey::try_from_bytes(&bytes).map_err(|_| bad())?;
    Ok(libp2p::identity::PublicKey::from(key).to_peer_id())
}

/// Inverse of [`peer_id_from_hex`]. `None` for peers not keyed by Ed25519.
pub fn hex_from_peer_id(peer: &PeerId) -> Option<String> {
    // Ed25519 peer ids inline the encoded key under the identity multihash.
    let bytes = peer.to_bytes();
    let encoded = match bytes.as_slice() {
        [0x00, len, rest @ ..] if usize::from(*len) == rest.len() => rest,
        _ => return None,
    };
    let key = libp2p::identity::PublicKey::try_decode_protobuf(encoded).ok()?;
    Some(hex::encode(key.try_into_ed25519().ok()?.to_bytes()))
}

/// `host:port` as a TCP multiaddr. Hostnames become `/dns`.
fn to_multiaddr(host_port: &str) -> Option<Multiaddr> {
    let (host, port) = host_port.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut addr = Multiaddr::empty();
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => addr.push(Protocol::Ip4(ip)),
        Ok(IpAddr::V6(ip)) => addr.push(Protocol::Ip6(ip)),
        Err(_) if !host.is_empty() => addr.push(Protocol::Dns(host.into())),
        Err(_) => return None,
    }
    addr.push(Protocol::Tcp(port));
    Some(addr)
}

fn host_port(addr: &Multiaddr) -> Option<String> {
    let mut host = None;
    let mut port = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(format!("[{ip}]")),
            Protocol::Dns(h) | Protocol::Dns4(h) | Protocol::Dns6(h) => host = Some(h.to_string()),
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }
    Some(format!("{}:{}", host?, port?))
}
