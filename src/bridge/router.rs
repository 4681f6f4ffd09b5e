//! Routes inbound MQTT traffic.
//!
//! Device `set` requests go straight to the command translator so that a slow
//! device never holds up the orchestrator loop. Everything that touches the
//! registry is forwarded to the orchestrator as a [`BridgeRequest`].

use super::command::CommandTranslator;
use super::event::EventTranslator;
use super::orchestrator::BridgeRequest;
use crate::error::BridgeError;
use crate::mqtt::{InboundTopic, MqttEvent, MqttMessage, Publisher, Topics};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) struct MqttRouter {
    topics: Topics,
    commands: Arc<CommandTranslator>,
    events: Arc<EventTranslator>,
    publisher: Publisher,
    requests: mpsc::Sender<BridgeRequest>,
}

impl MqttRouter {
    pub(crate) fn new(
        topics: Topics,
        commands: Arc<CommandTranslator>,
        events: Arc<EventTranslator>,
        publisher: Publisher,
        requests: mpsc::Sender<BridgeRequest>,
    ) -> Self {
        Self {
            topics,
            commands,
            events,
            publisher,
            requests,
        }
    }

    pub(crate) async fn run(self, mut inbound: mpsc::Receiver<MqttEvent>, shutdown: CancellationToken) {
        info!("[MQTT] Routing inbound messages under {}", self.topics.base());
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = inbound.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let request = match event {
                MqttEvent::Connected => Some(BridgeRequest::MqttConnected),
                MqttEvent::Disconnected { reason } => {
                    Some(BridgeRequest::MqttDisconnected { reason })
                }
                MqttEvent::Message(message) => self.route(message).await,
            };
            if let Some(request) = request
                && self.requests.send(request).await.is_err()
            {
                break;
            }
        }
        debug!("[MQTT] Router stopped");
    }

    async fn route(&self, message: MqttMessage) -> Option<BridgeRequest> {
        let Some(inbound) = self.topics.parse(&message.topic) else {
            debug!("[MQTT] Ignoring message on {}", message.topic);
            return None;
        };

        match inbound {
            InboundTopic::PermitJoin => Some(BridgeRequest::PermitJoin {
                payload: message.payload,
            }),
            InboundTopic::Remove { ieee } => Some(BridgeRequest::Remove { raw_ieee: ieee }),
            InboundTopic::Control { ieee, feature } => {
                match self.commands.submit(&ieee, feature, &message.payload) {
                    Ok(completion) => {
                        let requests = self.requests.clone();
                        let topic = message.topic;
                        tokio::spawn(async move {
                            let result = completion.await.unwrap_or_else(|_| {
                                Err(BridgeError::TransportUnavailable(
                                    "command worker stopped".into(),
                                ))
                            });
                            let _ = requests
                                .send(BridgeRequest::CommandCompleted {
                                    raw_ieee: ieee,
                                    topic,
                                    result,
                                })
                                .await;
                        });
                    }
                    Err(e) => {
                        warn!("[MQTT] Rejected {}: {}", message.topic, e);
                        self.publisher
                            .publish(&self.events.error(&ieee, Some(&message.topic), &e))
                            .await;
                    }
                }
                None
            }
        }
    }
}
