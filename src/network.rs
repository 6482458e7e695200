use crate::engine::NetworkHandle;
use crate::types::Message;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    Multiaddr, gossipsub, mdns, noise, swarm::NetworkBehaviour, swarm::SwarmEvent, tcp, yamux,
};
use std::collections::hash_map::DefaultHasher;
use std::error::Error;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

const TOPIC: &str = "epochbft-consensus";

/// Gossipsub + mDNS behaviour carrying the engine's tagged `Message` over a
/// single consensus topic.
#[derive(NetworkBehaviour)]
pub struct EpochBftBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
}

/// Commands sent from the application into the swarm task.
#[derive(Debug)]
enum NetworkCommand {
    Broadcast(Message),
    Dial(Multiaddr),
}

/// Runs the libp2p swarm in a background task and exposes it to the rest of
/// the crate as a `NetworkHandle` plus an inbound `Message` stream.
pub struct Network {
    local_id: String,
    command_sender: mpsc::Sender<NetworkCommand>,
    message_receiver: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl Network {
    pub async fn new(port: u16) -> Result<Self, Box<dyn Error>> {
        let (command_sender, mut command_receiver) = mpsc::channel(100);
        let (message_sender, message_receiver) = mpsc::channel(100);

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| {
                let message_id_fn = |message: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    message.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(std::io::Error::other)?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?;

                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?;

                Ok(EpochBftBehaviour { gossipsub, mdns })
            })?
            .build();

        let local_id = swarm.local_peer_id().to_string();

        let addr = format!("/ip4/127.0.0.1/tcp/{port}").parse()?;
        swarm.listen_on(addr)?;

        let topic = gossipsub::IdentTopic::new(TOPIC);
        swarm.behaviour_mut().gossipsub.subscribe(&topic)?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = swarm.select_next_some() => match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            log::info!("swarm listening on {address}");
                        }
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            log::info!("connection established with peer {peer_id}");
                            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                        }
                        SwarmEvent::OutgoingConnectionError { error, .. } => {
                            log::warn!("outgoing connection error: {error}");
                        }
                        SwarmEvent::Behaviour(EpochBftBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                            for (peer_id, _multiaddr) in list {
                                log::info!("mDNS discovered peer {peer_id}");
                                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                            }
                        }
                        SwarmEvent::Behaviour(EpochBftBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                            for (peer_id, _multiaddr) in list {
                                log::info!("mDNS peer expired {peer_id}");
                                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                            }
                        }
                        SwarmEvent::Behaviour(EpochBftBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                            message, ..
                        })) => {
                            match serde_json::from_slice::<Message>(&message.data) {
                                Ok(msg) => {
                                    let _ = message_sender.send(msg).await;
                                }
                                Err(e) => log::warn!("failed to decode gossip message: {e}"),
                            }
                        }
                        _ => {}
                    },
                    command = command_receiver.recv() => match command {
                        Some(NetworkCommand::Broadcast(msg)) => {
                            let data = match serde_json::to_vec(&msg) {
                                Ok(data) => data,
                                Err(e) => {
                                    log::warn!("failed to encode outbound message: {e}");
                                    continue;
                                }
                            };
                            let topic = gossipsub::IdentTopic::new(TOPIC);
                            if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, data) {
                                match e {
                                    gossipsub::PublishError::Duplicate => {}
                                    _ => log::warn!("publish error: {e:?}"),
                                }
                            }
                        }
                        Some(NetworkCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr) {
                                log::warn!("dial error: {e:?}");
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(Network {
            local_id,
            command_sender,
            message_receiver: Mutex::new(Some(message_receiver)),
        })
    }

    pub async fn dial(&self, addr: &str) {
        if let Ok(multiaddr) = addr.parse() {
            let _ = self.command_sender.send(NetworkCommand::Dial(multiaddr)).await;
        } else {
            log::warn!("invalid multiaddr: {addr}");
        }
    }

    /// Take ownership of the inbound message stream, to be pumped into
    /// `Engine::add_message`. Callable once; a second call returns `None`.
    pub fn take_message_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.message_receiver.lock().unwrap().take()
    }
}

#[async_trait]
impl NetworkHandle for Network {
    fn id(&self) -> &str {
        &self.local_id
    }

    async fn broadcast(&self, msg: Message) {
        if self
            .command_sender
            .send(NetworkCommand::Broadcast(msg))
            .await
            .is_err()
        {
            log::warn!("network command channel closed; broadcast dropped");
        }
    }
}
