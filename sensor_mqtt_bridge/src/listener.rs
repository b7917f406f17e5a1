use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, SubAck, SubscribeReasonCode, Transport,
};
use sensor_common::SensorTopic;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::BrokerConfig;

/// Pending requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 10;
/// How long a requested disconnect may take before the listener gives up on it.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ListenError {
    #[error("ConnectionError({})", .0)]
    Connection(#[from] ConnectionError),
    #[error("BrokerDisconnected")]
    BrokerDisconnected,
    #[error("DispatcherClosed")]
    DispatcherClosed,
}

#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("RequestError({})", .0)]
    Request(#[from] ClientError),
    #[error("Rejected")]
    Rejected,
}

/// A publish received from the broker, stamped with its arrival time.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Builds the client. No network traffic happens until the event loop is polled.
pub fn connect(config: &BrokerConfig) -> (AsyncClient, EventLoop) {
    let endpoint = &config.endpoint;
    let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
    options.set_credentials(&config.username, &config.password);
    options.set_keep_alive(config.keep_alive);
    if endpoint.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        endpoint.host, endpoint.port, config.username
    );
    AsyncClient::new(options, REQUEST_CAPACITY)
}

pub async fn disconnect(client: &AsyncClient) {
    if let Err(e) = client.disconnect().await {
        warn!("Failed to request broker disconnect: {}", e);
    }
}

/// Drive the broker connection, forwarding publishes to `sender`, until `shutdown`
/// resolves or the connection fails.
///
/// On shutdown a disconnect is requested and nothing more is forwarded, even while the
/// queue is full. Returns `Ok` once the disconnect went out. A connection error ends the
/// loop for good; the client does not reconnect.
pub async fn listen<F>(
    client: AsyncClient,
    mut eventloop: EventLoop,
    sender: mpsc::Sender<InboundMessage>,
    shutdown: F,
) -> Result<(), ListenError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut subscriptions = SubscriptionTracker::default();
    let mut connected = false;
    let mut closing: Option<Instant> = None;

    loop {
        let polled = tokio::select! {
            _ = &mut shutdown, if closing.is_none() => {
                if !connected {
                    info!("Interrupted before the broker connection was up");
                    return Ok(());
                }
                closing = Some(request_disconnect(&client));
                continue;
            }
            _ = wait_until(closing) => {
                warn!(
                    "Broker disconnect did not complete in {:?}, dropping the connection",
                    DISCONNECT_GRACE
                );
                return Ok(());
            }
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(event) => event,
            Err(e) if closing.is_some() => {
                info!("Broker connection closed during shutdown: {}", e);
                return Ok(());
            }
            Err(e) => {
                error!("Connection error: {}", e);
                return Err(e.into());
            }
        };

        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                connected = true;
                subscribe_all(&client, &mut subscriptions);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                match subscriptions.acknowledged(&ack) {
                    Some((topic, Ok(qos))) => {
                        info!("Subscribed to MQTT topic: {} ({:?})", topic, qos)
                    }
                    Some((topic, Err(e))) => {
                        error!("Error subscribing to topic {}: {}", topic, e)
                    }
                    None => debug!("SubAck for unknown packet {}", ack.pkid),
                }
            }
            Event::Incoming(Packet::Publish(publish)) if closing.is_some() => {
                debug!("Shutting down, ignoring message on {}", publish.topic);
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    received_at: Utc::now(),
                };
                // A full queue must not keep the shutdown from going through.
                tokio::select! {
                    sent = sender.send(message) => {
                        if sent.is_err() {
                            warn!("Dispatcher is gone, closing broker connection");
                            disconnect(&client).await;
                            return Err(ListenError::DispatcherClosed);
                        }
                    }
                    _ = &mut shutdown => {
                        closing = Some(request_disconnect(&client));
                    }
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker closed the connection");
                return Err(ListenError::BrokerDisconnected);
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => subscriptions.sent(pkid),
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("Disconnected from MQTT broker");
                return Ok(());
            }
            other => debug!("MQTT event: {:?}", other),
        }
    }
}

/// Queue a disconnect without waiting on the request channel. Returns the deadline
/// for it to go out.
fn request_disconnect(client: &AsyncClient) -> Instant {
    info!("Interrupted, closing broker connection");
    if let Err(e) = client.try_disconnect() {
        warn!("Failed to request broker disconnect: {}", e);
    }
    Instant::now() + DISCONNECT_GRACE
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Request a subscription to every sensor topic. A failed request is logged and
/// does not stop the others.
pub fn subscribe_all(client: &AsyncClient, subscriptions: &mut SubscriptionTracker) {
    for topic in SensorTopic::ALL {
        match client.try_subscribe(topic.name(), QoS::AtMostOnce) {
            Ok(()) => subscriptions.requested(topic.name()),
            Err(e) => {
                let e = SubscribeError::from(e);
                error!("Error subscribing to topic {}: {}", topic.name(), e);
            }
        }
    }
}

/// Matches SubAcks back to the topic they answer.
///
/// Subscribe requests leave the event loop in the order they were made, so each
/// outgoing packet id pairs with the oldest requested topic.
#[derive(Default, Debug)]
pub struct SubscriptionTracker {
    requested: VecDeque<String>,
    in_flight: HashMap<u16, String>,
}

impl SubscriptionTracker {
    pub fn requested(&mut self, topic: &str) {
        self.requested.push_back(topic.to_string());
    }

    pub fn sent(&mut self, pkid: u16) {
        if let Some(topic) = self.requested.pop_front() {
            self.in_flight.insert(pkid, topic);
        }
    }

    pub fn acknowledged(&mut self, ack: &SubAck) -> Option<(String, Result<QoS, SubscribeError>)> {
        let topic = self.in_flight.remove(&ack.pkid)?;
        let result = match ack.return_codes.first() {
            Some(SubscribeReasonCode::Success(qos)) => Ok(*qos),
            _ => Err(SubscribeError::Rejected),
        };
        Some((topic, result))
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.requested.len() + self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerEndpoint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const CONNECT: u8 = 1;
    const SUBSCRIBE: u8 = 8;
    const DISCONNECT: u8 = 14;
    const WAIT: Duration = Duration::from_secs(5);

    fn broker_config(port: u16) -> BrokerConfig {
        BrokerConfig {
            endpoint: BrokerEndpoint { host: "127.0.0.1".to_string(), port, tls: false },
            client_id: "listener-test".to_string(),
            username: "sensor".to_string(),
            password: "hunter2".to_string(),
            keep_alive: Duration::from_secs(60),
        }
    }

    #[test]
    fn matches_acks_to_topics() {
        let mut tracker = SubscriptionTracker::default();
        tracker.requested("/temperature");
        tracker.requested("/humidity");
        tracker.sent(1);
        tracker.sent(2);
        assert_eq!(tracker.pending(), 2);

        let (topic, result) = tracker
            .acknowledged(&SubAck::new(2, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]))
            .unwrap();
        assert_eq!(topic, "/humidity");
        assert_eq!(result.unwrap(), QoS::AtMostOnce);

        let (topic, result) = tracker
            .acknowledged(&SubAck::new(1, vec![SubscribeReasonCode::Failure]))
            .unwrap();
        assert_eq!(topic, "/temperature");
        assert!(matches!(result, Err(SubscribeError::Rejected)));

        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn ignores_unknown_acks() {
        let mut tracker = SubscriptionTracker::default();
        let ack = SubAck::new(7, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        assert!(tracker.acknowledged(&ack).is_none());

        // A packet id with no requested topic is not tracked.
        tracker.sent(3);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn subscribes_to_every_sensor_topic() {
        let (client, _eventloop) = connect(&broker_config(1883));
        let mut tracker = SubscriptionTracker::default();
        subscribe_all(&client, &mut tracker);
        assert_eq!(tracker.pending(), SensorTopic::ALL.len());
    }

    #[test]
    fn failed_subscribe_requests_are_skipped() {
        let (client, eventloop) = connect(&broker_config(1883));
        drop(eventloop);
        let mut tracker = SubscriptionTracker::default();
        subscribe_all(&client, &mut tracker);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn connection_error_ends_listener() {
        // Grab a free port, then close it so the connect is refused.
        let port = {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let (client, eventloop) = connect(&broker_config(port));
        let (tx, mut rx) = mpsc::channel(1);

        let result = listen(client, eventloop, tx, std::future::pending()).await;
        assert!(matches!(result, Err(ListenError::Connection(_))));
        assert!(rx.try_recv().is_err());
    }

    /// Reads one MQTT packet and returns its type.
    async fn read_packet(stream: &mut TcpStream) -> Option<u8> {
        let header = stream.read_u8().await.ok()?;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            length |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await.ok()?;
        Some(header >> 4)
    }

    fn publish_packet(topic: &str, payload: &str) -> Vec<u8> {
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload.as_bytes());
        let mut packet = vec![0x30, body.len() as u8];
        packet.extend(body);
        packet
    }

    /// Accepts one client, acknowledges its CONNECT, sends `publishes` once every
    /// sensor topic is subscribed, and reports the type of each packet it reads.
    async fn start_broker(publishes: Vec<Vec<u8>>) -> (u16, mpsc::UnboundedReceiver<u8>) {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut stream, _) = socket.accept().await.unwrap();
            let mut subscribes = 0;
            while let Some(kind) = read_packet(&mut stream).await {
                match kind {
                    CONNECT => {
                        let _ = stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await;
                    }
                    SUBSCRIBE => {
                        subscribes += 1;
                        if subscribes == SensorTopic::ALL.len() {
                            for packet in &publishes {
                                let _ = stream.write_all(packet).await;
                            }
                        }
                    }
                    _ => {}
                }
                let _ = tx.send(kind);
            }
        });

        (port, rx)
    }

    async fn wait_for(packets: &mut mpsc::UnboundedReceiver<u8>, kind: u8, count: usize) {
        let seen = timeout(WAIT, async {
            let mut seen = 0;
            while seen < count {
                match packets.recv().await {
                    Some(k) if k == kind => seen += 1,
                    Some(_) => {}
                    None => break,
                }
            }
            seen
        })
        .await
        .unwrap_or(0);
        assert_eq!(seen, count, "packet type {}", kind);
    }

    #[tokio::test]
    async fn shutdown_disconnects_idle_connection() {
        let (port, mut packets) = start_broker(Vec::new()).await;
        let (client, eventloop) = connect(&broker_config(port));
        let (tx, _rx) = mpsc::channel(8);
        let (stop, stopped) = oneshot::channel::<()>();

        let listener = tokio::spawn(listen(client, eventloop, tx, async {
            let _ = stopped.await;
        }));
        wait_for(&mut packets, SUBSCRIBE, SensorTopic::ALL.len()).await;

        stop.send(()).unwrap();
        let result = timeout(WAIT, listener).await.expect("listener kept running");
        assert!(matches!(result, Ok(Ok(()))));
        wait_for(&mut packets, DISCONNECT, 1).await;
    }

    #[tokio::test]
    async fn shutdown_with_stalled_writers() {
        let publishes = (0..20)
            .map(|i| publish_packet("/temperature", &i.to_string()))
            .collect();
        let (port, mut packets) = start_broker(publishes).await;
        let (client, eventloop) = connect(&broker_config(port));
        // Nobody drains the queue, as with writes hanging on the database.
        let (tx, mut rx) = mpsc::channel(1);
        let (stop, stopped) = oneshot::channel::<()>();

        let listener = tokio::spawn(listen(client, eventloop, tx, async {
            let _ = stopped.await;
        }));
        wait_for(&mut packets, SUBSCRIBE, SensorTopic::ALL.len()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        stop.send(()).unwrap();
        let result = timeout(WAIT, listener).await.expect("listener kept running");
        assert!(matches!(result, Ok(Ok(()))));
        wait_for(&mut packets, DISCONNECT, 1).await;

        let mut forwarded = 0;
        while rx.try_recv().is_ok() {
            forwarded += 1;
        }
        assert!(forwarded <= 1, "forwarded {} messages", forwarded);
    }

    #[tokio::test]
    async fn shutdown_before_connack() {
        // Accepts the TCP connection but never answers the CONNECT.
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (client, eventloop) = connect(&broker_config(port));
        let (tx, _rx) = mpsc::channel(1);

        let shutdown = tokio::time::sleep(Duration::from_millis(100));
        let result = timeout(WAIT, listen(client, eventloop, tx, shutdown))
            .await
            .expect("listener kept running");
        assert!(result.is_ok());
        drop(socket);
    }
}
