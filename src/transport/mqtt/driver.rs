//! Broker driver over an MQTT v5 broker
//!
//! Each connection owns a rumqttc client and an event loop task. The task
//! routes incoming publications into bounded per-subscription inboxes; `get`
//! drains an inbox without blocking, which gives the no-wait retrieval
//! semantics the consumer relies on. Publications are acknowledged to the
//! broker only when `get` hands them out, and `put` resolves on the PubAck.

use super::connection::{
    configure_mqtt_options, connect_reason, match_filter, puback_outcome, queue_topic,
    shared_queue_filter, suback_reason,
};
use crate::transport::driver::{
    BrokerDriver, ConnectOptions, ConnectionHandle, DestinationHandle, DestinationKind,
    DriverError, GetOptions, ObjectDescriptor, OpenMode, PutOptions, PutOutcome, RawMessage,
    SubscribeFailure, SubscriptionDescriptor,
};
use crate::transport::reason::ReasonCode;
use crate::transport::topic::topic_matches;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ClientError, Event, EventLoop};
use rumqttc::Outgoing;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 10;
const INBOX_CAPACITY: usize = 16;

type Routes = Arc<Mutex<Vec<Route>>>;
type Delivery = (RawMessage, Publish);
type SubAckOutcome = Option<ReasonCode>;
type PubAckOutcome = Result<PutOutcome, ReasonCode>;

struct Route {
    destination: u64,
    filter: String,
    inbox: mpsc::Sender<Delivery>,
}

/// Event loop side of an [`AckChannel`]
struct AckSender<T> {
    sent: mpsc::UnboundedSender<u16>,
    acked: mpsc::UnboundedSender<(u16, T)>,
}

/// Packet ids of flushed requests and the acks the broker returned for them
struct AckChannel<T> {
    sent: mpsc::UnboundedReceiver<u16>,
    acked: mpsc::UnboundedReceiver<(u16, T)>,
}

fn ack_channel<T>() -> (AckSender<T>, AckChannel<T>) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (acked_tx, acked_rx) = mpsc::unbounded_channel();
    (
        AckSender {
            sent: sent_tx,
            acked: acked_tx,
        },
        AckChannel {
            sent: sent_rx,
            acked: acked_rx,
        },
    )
}

fn ack_lost() -> DriverError {
    DriverError::new(
        ReasonCode::CONNECTION_BROKEN,
        "connection closed before acknowledgement",
    )
}

fn client_error(error: ClientError) -> DriverError {
    DriverError::new(ReasonCode::CONNECTION_BROKEN, error.to_string())
}

impl<T> AckChannel<T> {
    /// Forget ids and acks left behind by requests that timed out
    fn drain(&mut self) {
        while self.sent.try_recv().is_ok() {}
        while self.acked.try_recv().is_ok() {}
    }

    /// Wait for the next flushed packet id, then for the ack that carries it
    async fn await_ack(&mut self) -> Result<T, DriverError> {
        let pkid = self.sent.recv().await.ok_or_else(ack_lost)?;
        loop {
            match self.acked.recv().await {
                Some((id, outcome)) if id == pkid => return Ok(outcome),
                Some((id, _)) => {
                    debug!(target: "mqtt_transport", "Discarding late ack for packet {}", id)
                }
                None => return Err(ack_lost()),
            }
        }
    }

    /// Issue one request and wait for its ack; one request in flight at a time
    async fn request<F>(channel: &Mutex<Self>, send: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<(), ClientError>>,
    {
        let mut acks = channel.lock().await;
        acks.drain();
        send.await.map_err(client_error)?;
        tokio::time::timeout(ACK_TIMEOUT, acks.await_ack())
            .await
            .map_err(|_| {
                DriverError::new(ReasonCode::CONNECTION_BROKEN, "acknowledgement timeout")
            })?
    }
}

struct MqttConnection {
    client: AsyncClient,
    group: String,
    routes: Routes,
    subacks: Mutex<AckChannel<SubAckOutcome>>,
    pubacks: Mutex<AckChannel<PubAckOutcome>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum Target {
    Inbox {
        filter: String,
        inbox: mpsc::Receiver<Delivery>,
    },
    Output {
        topic: String,
    },
}

struct MqttDestination {
    connection: u64,
    target: Target,
}

/// [`BrokerDriver`] backed by rumqttc
#[derive(Default)]
pub struct MqttDriver {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<MqttConnection>>>,
    destinations: Mutex<HashMap<u64, MqttDestination>>,
}

impl MqttDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn connection(&self, handle: &ConnectionHandle) -> Result<Arc<MqttConnection>, DriverError> {
        self.connections
            .lock()
            .await
            .get(&handle.id())
            .cloned()
            .ok_or_else(|| {
                DriverError::new(
                    ReasonCode::HCONN_ERROR,
                    format!("connection {} is not open", handle.id()),
                )
            })
    }

    /// Poll until the broker acknowledges the connection
    async fn await_connack(event_loop: &mut EventLoop) -> Result<(), DriverError> {
        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(other) => debug!(target: "mqtt_transport", "MQTT event: {:?}", other),
                    Err(e) => return Err(DriverError::new(connect_reason(&e), e.to_string())),
                }
            }
        };

        tokio::time::timeout(CONNACK_TIMEOUT, handshake)
            .await
            .map_err(|_| {
                DriverError::new(
                    ReasonCode::Q_MGR_NOT_AVAILABLE,
                    "ConnAck timeout - no connection confirmation received",
                )
            })?
    }

    /// Drive the event loop, routing publications and matching acks to requests
    fn spawn_event_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        routes: Routes,
        subacks: AckSender<SubAckOutcome>,
        pubacks: AckSender<PubAckOutcome>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        Self::route(&routes, &client, publish).await;
                    }
                    Ok(Event::Incoming(Packet::SubAck(suback))) => {
                        let failure = suback.return_codes.iter().find_map(suback_reason);
                        let _ = subacks.acked.send((suback.pkid, failure));
                    }
                    Ok(Event::Incoming(Packet::PubAck(puback))) => {
                        let _ = pubacks
                            .acked
                            .send((puback.pkid, puback_outcome(&puback.reason)));
                    }
                    Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                        let _ = subacks.sent.send(pkid);
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        let _ = pubacks.sent.send(pkid);
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!(target: "mqtt_transport", "MQTT disconnect flushed");
                        break;
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        warn!("Broker closed the MQTT connection");
                        break;
                    }
                    Ok(event) => {
                        debug!(target: "mqtt_transport", "MQTT event: {:?}", event);
                    }
                    Err(e) => {
                        error!("MQTT event loop error: {}", e);
                        break;
                    }
                }
            }
            // Dropping the senders marks every inbox as broken
            routes.lock().await.clear();
        })
    }

    async fn route(routes: &Routes, client: &AsyncClient, publish: Publish) {
        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        let message = RawMessage {
            message_id: Some(publish.pkid.to_string()),
            correlation_id: publish
                .properties
                .as_ref()
                .and_then(|p| p.correlation_data.as_ref())
                .map(|c| String::from_utf8_lossy(c).to_string()),
            payload: publish.payload.clone(),
        };

        let inboxes: Vec<_> = routes
            .lock()
            .await
            .iter()
            .filter(|route| topic_matches(match_filter(&route.filter), &topic))
            .map(|route| route.inbox.clone())
            .collect();

        let mut delivered = false;
        // A full inbox holds the event loop so the backlog stays on the broker
        for inbox in inboxes {
            if inbox.send((message.clone(), publish.clone())).await.is_ok() {
                delivered = true;
            }
        }

        if !delivered {
            debug!(target: "mqtt_transport", "No open inbox for {}, acknowledging", topic);
            // try_ack: awaiting the request queue from the event loop could deadlock
            if let Err(e) = client.try_ack(&publish) {
                warn!("Failed to acknowledge unrouted publication on {}: {}", topic, e);
            }
        }
    }

    /// Subscribe on the wire and register an inbox for the filter
    async fn open_inbox(
        &self,
        handle: &ConnectionHandle,
        filter: String,
    ) -> Result<DestinationHandle, DriverError> {
        let connection = self.connection(handle).await?;
        let id = self.next_id();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        connection.routes.lock().await.push(Route {
            destination: id,
            filter: filter.clone(),
            inbox: tx,
        });

        let granted = AckChannel::request(
            &connection.subacks,
            connection.client.subscribe(filter.clone(), QoS::AtLeastOnce),
        )
        .await
        .and_then(|failure| match failure {
            None => Ok(()),
            Some(reason) => Err(DriverError::new(
                reason,
                format!("subscription to {filter} refused"),
            )),
        });

        if let Err(e) = granted {
            connection
                .routes
                .lock()
                .await
                .retain(|route| route.destination != id);
            return Err(e);
        }

        self.destinations.lock().await.insert(
            id,
            MqttDestination {
                connection: handle.id(),
                target: Target::Inbox { filter, inbox: rx },
            },
        );
        Ok(DestinationHandle::new(id))
    }
}

#[async_trait]
impl BrokerDriver for MqttDriver {
    async fn connect(
        &self,
        manager: &str,
        options: &ConnectOptions,
    ) -> Result<ConnectionHandle, DriverError> {
        let mqtt_options = configure_mqtt_options(manager, options)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        Self::await_connack(&mut event_loop).await?;

        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        let (suback_tx, subacks) = ack_channel();
        let (puback_tx, pubacks) = ack_channel();
        let task = Self::spawn_event_loop(
            event_loop,
            client.clone(),
            routes.clone(),
            suback_tx,
            puback_tx,
        );

        let id = self.next_id();
        self.connections.lock().await.insert(
            id,
            Arc::new(MqttConnection {
                client,
                group: options.application_name.clone(),
                routes,
                subacks: Mutex::new(subacks),
                pubacks: Mutex::new(pubacks),
                task: Mutex::new(Some(task)),
            }),
        );
        Ok(ConnectionHandle::new(id))
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), DriverError> {
        let connection = self
            .connections
            .lock()
            .await
            .remove(&handle.id())
            .ok_or_else(|| {
                DriverError::new(
                    ReasonCode::HCONN_ERROR,
                    format!("connection {} is not open", handle.id()),
                )
            })?;

        self.destinations
            .lock()
            .await
            .retain(|_, d| d.connection != handle.id());

        let result = connection.client.disconnect().await.map_err(client_error);

        // The event loop exits once DISCONNECT is flushed
        if let Some(mut task) = connection.task.lock().await.take() {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err() {
                warn!(
                    "MQTT event loop still running after {:?}; aborting",
                    DISCONNECT_TIMEOUT
                );
                task.abort();
            }
        }
        result
    }

    async fn open(
        &self,
        handle: &ConnectionHandle,
        descriptor: &ObjectDescriptor,
        mode: OpenMode,
    ) -> Result<DestinationHandle, DriverError> {
        let connection = self.connection(handle).await?;

        match (descriptor.kind, mode) {
            (DestinationKind::Queue, OpenMode::Input) => {
                let filter = shared_queue_filter(&connection.group, &descriptor.name);
                self.open_inbox(handle, filter).await
            }
            (DestinationKind::Topic, OpenMode::Input) => {
                self.open_inbox(handle, descriptor.name.clone()).await
            }
            (kind, OpenMode::Output) => {
                let topic = match kind {
                    DestinationKind::Queue => queue_topic(&descriptor.name),
                    DestinationKind::Topic => descriptor.name.clone(),
                };
                let id = self.next_id();
                self.destinations.lock().await.insert(
                    id,
                    MqttDestination {
                        connection: handle.id(),
                        target: Target::Output { topic },
                    },
                );
                Ok(DestinationHandle::new(id))
            }
        }
    }

    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        descriptor: &SubscriptionDescriptor,
    ) -> Result<DestinationHandle, SubscribeFailure> {
        Ok(self
            .open_inbox(handle, descriptor.topic_string.clone())
            .await?)
    }

    async fn close(&self, destination: DestinationHandle) -> Result<(), DriverError> {
        let closed = self
            .destinations
            .lock()
            .await
            .remove(&destination.id())
            .ok_or_else(|| {
                DriverError::new(
                    ReasonCode::HOBJ_ERROR,
                    format!("object handle {} is not open", destination.id()),
                )
            })?;

        let Target::Inbox { filter, .. } = closed.target else {
            return Ok(());
        };

        let connection = self.connections.lock().await.get(&closed.connection).cloned();
        if let Some(connection) = connection {
            connection
                .routes
                .lock()
                .await
                .retain(|route| route.destination != destination.id());
            connection
                .client
                .unsubscribe(filter)
                .await
                .map_err(client_error)?;
        }
        Ok(())
    }

    async fn get(
        &self,
        destination: &DestinationHandle,
        _options: &GetOptions,
    ) -> Result<RawMessage, DriverError> {
        let (connection_id, (message, publish)) = {
            let mut destinations = self.destinations.lock().await;
            let open = destinations.get_mut(&destination.id()).ok_or_else(|| {
                DriverError::new(
                    ReasonCode::HOBJ_ERROR,
                    format!("object handle {} is not open", destination.id()),
                )
            })?;

            match &mut open.target {
                Target::Inbox { inbox, .. } => match inbox.try_recv() {
                    Ok(delivery) => (open.connection, delivery),
                    Err(mpsc::error::TryRecvError::Empty) => return Err(DriverError::no_message()),
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return Err(DriverError::new(
                            ReasonCode::CONNECTION_BROKEN,
                            "connection to broker lost",
                        ))
                    }
                },
                Target::Output { .. } => {
                    return Err(DriverError::new(
                        ReasonCode::NOT_OPEN_FOR_INPUT,
                        "object not opened for input",
                    ))
                }
            }
        };

        let connection = self
            .connection(&ConnectionHandle::new(connection_id))
            .await?;
        connection.client.ack(&publish).await.map_err(client_error)?;
        Ok(message)
    }

    async fn put(
        &self,
        destination: &DestinationHandle,
        payload: Bytes,
        _options: &PutOptions,
    ) -> Result<PutOutcome, DriverError> {
        let (connection_id, topic) = {
            let destinations = self.destinations.lock().await;
            match destinations.get(&destination.id()) {
                Some(MqttDestination {
                    connection,
                    target: Target::Output { topic },
                }) => (*connection, topic.clone()),
                Some(_) => {
                    return Err(DriverError::new(
                        ReasonCode::NOT_OPEN_FOR_OUTPUT,
                        "object not opened for output",
                    ))
                }
                None => {
                    return Err(DriverError::new(
                        ReasonCode::HOBJ_ERROR,
                        format!("object handle {} is not open", destination.id()),
                    ))
                }
            }
        };

        let connection = self
            .connection(&ConnectionHandle::new(connection_id))
            .await?;
        let outcome = AckChannel::request(
            &connection.pubacks,
            connection
                .client
                .publish(topic.clone(), QoS::AtLeastOnce, false, payload),
        )
        .await?;
        outcome.map_err(|reason| DriverError::new(reason, format!("publish to {topic} refused")))
    }
}
