//! libp2p transport.
//!
//! Broadcasts travel over gossipsub on a single topic; direct messages use a
//! JSON request-response protocol whose response is a bare acknowledgement.
//! Peers are found through explicit seeds and, optionally, mDNS.
//!
//! Listener callbacks run on a dedicated delivery thread fed in swarm order,
//! never on the swarm task itself.

use crate::{Listener, Message, MessageService, NetworkService};
use futures::{channel::mpsc, StreamExt};
use libp2p::{
    gossipsub, identify, mdns,
    multiaddr::Protocol,
    noise,
    request_response::{self, ProtocolSupport},
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour, SwarmEvent},
    tcp, yamux, StreamProtocol, Swarm,
};
use serde::{Deserialize, Serialize};
use std::{net::Ipv4Addr, sync::Arc, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub use libp2p::Multiaddr;

pub type PeerId = libp2p::PeerId;

const IDENTIFY_PROTOCOL: &str = "/cryptonet/id/1.0.0";
const DIRECT_PROTOCOL: StreamProtocol = StreamProtocol::new("/cryptonet/direct/1.0.0");

/// Response to a direct message. Carries nothing, the exchange only exists
/// because request-response needs one.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Ack;

#[derive(NetworkBehaviour)]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
    request_response: request_response::json::Behaviour<Message, Ack>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen: Multiaddr,
    pub seeds: Vec<Multiaddr>,
    pub topic: String,
    pub enable_mdns: bool,
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Multiaddr::empty()
                .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                .with(Protocol::Tcp(0)),
            seeds: Vec::new(),
            topic: "cryptonet".into(),
            enable_mdns: true,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

enum ActionItem {
    Broadcast { message: Message },
    Notify { peer_id: PeerId, message: Message },
    Shutdown,
}

/// Swarm events handed over to the delivery thread.
enum Inbound {
    Connected(PeerId),
    Disconnected(PeerId),
    Message(PeerId, Message),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to set up transport: {0}")]
    Setup(String),
    #[error("network worker has stopped")]
    WorkerClosed,
    #[error("failed to spawn delivery thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Owns the swarm. Must be created and run inside a tokio runtime.
pub struct Worker {
    swarm: Swarm<Behaviour>,
    queue: mpsc::UnboundedReceiver<ActionItem>,
    topic: gossipsub::IdentTopic,
}

/// Cloneable handle used by the rest of the node to talk to the worker.
#[derive(Clone)]
pub struct Service {
    sender: mpsc::UnboundedSender<ActionItem>,
    local_peer_id: PeerId,
}

impl Worker {
    pub fn new(config: Config) -> Result<(Self, Service), Error> {
        let enable_mdns = config.enable_mdns;
        let idle_timeout = config.idle_timeout;

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| Error::Setup(e.to_string()))?
            .with_behaviour(|key| {
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .build()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?;

                let mdns = if enable_mdns {
                    Some(mdns::tokio::Behaviour::new(
                        mdns::Config::default(),
                        key.public().to_peer_id(),
                    )?)
                } else {
                    None
                };

                Ok(Behaviour {
                    gossipsub,
                    identify: identify::Behaviour::new(identify::Config::new(
                        IDENTIFY_PROTOCOL.into(),
                        key.public(),
                    )),
                    mdns: mdns.into(),
                    request_response: request_response::json::Behaviour::new(
                        [(DIRECT_PROTOCOL, ProtocolSupport::Full)],
                        request_response::Config::default(),
                    ),
                })
            })
            .map_err(|e| Error::Setup(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
            .build();

        let topic = gossipsub::IdentTopic::new(config.topic.clone());
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| Error::Setup(format!("{:?}", e)))?;
        swarm
            .listen_on(config.listen.clone())
            .map_err(|e| Error::Setup(e.to_string()))?;

        for seed in &config.seeds {
            if let Err(e) = swarm.dial(seed.clone()) {
                warn!(%seed, "Failed to dial seed: {}", e);
            }
        }

        let (sender, queue) = mpsc::unbounded();
        let local_peer_id = *swarm.local_peer_id();
        info!(%local_peer_id, "Network worker created");

        Ok((
            Worker {
                swarm,
                queue,
                topic,
            },
            Service {
                sender,
                local_peer_id,
            },
        ))
    }

    /// Drive the swarm until every service handle is dropped or
    /// [`Service::shutdown`] is called.
    pub async fn run(mut self, listener: Arc<dyn Listener<PeerId>>) -> Result<(), Error> {
        let (inbound, receiver) = std::sync::mpsc::channel();
        thread::Builder::new()
            .name("network-delivery".into())
            .spawn(move || deliver(receiver, listener.as_ref()))?;

        loop {
            tokio::select! {
                action = self.queue.next() => match action {
                    Some(ActionItem::Broadcast { message }) => {
                        broadcast(&mut self.swarm, &self.topic, message)
                    }
                    Some(ActionItem::Notify { peer_id, message }) => {
                        self.swarm
                            .behaviour_mut()
                            .request_response
                            .send_request(&peer_id, message);
                    }
                    Some(ActionItem::Shutdown) | None => break,
                },
                event = self.swarm.select_next_some() => {
                    handle_event(&mut self.swarm, event, &inbound)
                }
            }
        }

        // The delivery thread drains what is queued and exits.
        drop(inbound);
        info!("Network worker stopped");
        Ok(())
    }
}

fn broadcast(swarm: &mut Swarm<Behaviour>, topic: &gossipsub::IdentTopic, message: Message) {
    let data = match serde_json::to_vec(&message) {
        Ok(data) => data,
        Err(e) => {
            warn!(name = %message.name, "Failed to encode broadcast: {}", e);
            return;
        }
    };

    match swarm.behaviour_mut().gossipsub.publish(topic.clone(), data) {
        Ok(_) => trace!(name = %message.name, "Broadcasted"),
        Err(gossipsub::PublishError::InsufficientPeers) => {
            debug!(name = %message.name, "No peers to broadcast to")
        }
        Err(e) => warn!(name = %message.name, "Broadcast failed: {:?}", e),
    }
}

fn deliver(receiver: std::sync::mpsc::Receiver<Inbound>, listener: &dyn Listener<PeerId>) {
    for inbound in receiver {
        match inbound {
            Inbound::Connected(peer) => listener.on_connect(peer),
            Inbound::Disconnected(peer) => listener.on_disconnect(peer),
            Inbound::Message(peer, message) => listener.on_message(peer, message),
        }
    }
    debug!("Delivery thread stopped");
}

fn hand_over(inbound: &std::sync::mpsc::Sender<Inbound>, event: Inbound) {
    if inbound.send(event).is_err() {
        warn!("Delivery thread is gone, dropping inbound event");
    }
}

fn handle_event(
    swarm: &mut Swarm<Behaviour>,
    event: SwarmEvent<BehaviourEvent>,
    inbound: &std::sync::mpsc::Sender<Inbound>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => info!(%address, "Listening"),
        SwarmEvent::ConnectionEstablished {
            peer_id,
            num_established,
            ..
        } => {
            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            if num_established.get() == 1 {
                debug!(%peer_id, "Peer connected");
                hand_over(inbound, Inbound::Connected(peer_id));
            }
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            if num_established == 0 {
                debug!(%peer_id, "Peer disconnected");
                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                hand_over(inbound, Inbound::Disconnected(peer_id));
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        })) => match serde_json::from_slice::<Message>(&message.data) {
            Ok(decoded) => hand_over(
                inbound,
                Inbound::Message(message.source.unwrap_or(propagation_source), decoded),
            ),
            Err(e) => warn!(peer = %propagation_source, "Undecodable broadcast: {}", e),
        },
        SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(
            request_response::Event::Message {
                peer,
                message: request_response::Message::Request {
                    request, channel, ..
                },
                ..
            },
        )) => {
            if swarm
                .behaviour_mut()
                .request_response
                .send_response(channel, Ack)
                .is_err()
            {
                debug!(%peer, "Could not acknowledge direct message");
            }
            hand_over(inbound, Inbound::Message(peer, request));
        }
        SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(
            request_response::Event::OutboundFailure { peer, error, .. },
        )) => warn!(%peer, "Direct message failed: {}", error),
        SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
            for (peer_id, address) in list {
                if !swarm.is_connected(&peer_id) {
                    debug!(%peer_id, %address, "Dialing discovered peer");
                    if let Err(e) = swarm.dial(address) {
                        debug!(%peer_id, "Dial failed: {}", e);
                    }
                }
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            ..
        })) => trace!(%peer_id, "Identified peer"),
        _ => {}
    }
}

impl Service {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Ask the worker to stop. Pending actions queued before this one are
    /// still processed.
    pub fn shutdown(&self) {
        let _ = self.sender.unbounded_send(ActionItem::Shutdown);
    }
}

impl NetworkService for Service {
    type PeerId = PeerId;
    type Error = Error;
}

impl MessageService for Service {
    fn notify(&self, peer: &PeerId, message: Message) -> Result<(), Error> {
        self.sender
            .unbounded_send(ActionItem::Notify {
                peer_id: *peer,
                message,
            })
            .map_err(|_| Error::WorkerClosed)
    }

    fn broadcast(&self, message: Message) -> Result<(), Error> {
        self.sender
            .unbounded_send(ActionItem::Broadcast { message })
            .map_err(|_| Error::WorkerClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use sync_extra::MutexExtra;

    #[derive(Default)]
    struct Log(Mutex<Vec<(String, PeerId)>>);

    impl Listener<PeerId> for Log {
        fn on_connect(&self, peer: PeerId) {
            self.0.lock_unwrap().push(("connect".into(), peer));
        }

        fn on_message(&self, peer: PeerId, message: Message) {
            self.0.lock_unwrap().push((message.name.into_owned(), peer));
        }

        fn on_disconnect(&self, peer: PeerId) {
            self.0.lock_unwrap().push(("disconnect".into(), peer));
        }
    }

    #[test]
    fn delivery_keeps_swarm_order() {
        let log = Arc::new(Log::default());
        let (inbound, receiver) = std::sync::mpsc::channel();
        let delivery = {
            let log = log.clone();
            thread::spawn(move || deliver(receiver, log.as_ref()))
        };

        let peer = PeerId::random();
        hand_over(&inbound, Inbound::Connected(peer));
        hand_over(&inbound, Inbound::Message(peer, Message::new("blocks", Vec::new())));
        hand_over(&inbound, Inbound::Disconnected(peer));
        drop(inbound);
        delivery.join().unwrap();

        let names = log
            .0
            .lock_unwrap()
            .iter()
            .map(|(name, from)| {
                assert_eq!(*from, peer);
                name.clone()
            })
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["connect", "blocks", "disconnect"]);
    }

    #[test]
    fn events_after_delivery_stops_are_dropped() {
        let (inbound, receiver) = std::sync::mpsc::channel();
        drop(receiver);
        hand_over(&inbound, Inbound::Connected(PeerId::random()));
    }
}
