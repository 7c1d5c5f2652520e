//! Broker session ownership and the connection state machine.
//!
//! [`ConnectionManager`] is the only owner of the rumqttc client. Each `connect` spawns one
//! network task that polls the event loop; that task never touches buffers or storage. It
//! only flips the shared [`ConnectionState`] and pushes entries into the ingestion queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::config::{session_client_id, ConnectionParams};
use super::message_manager::{QueueProducer, RawMessage, SystemEvent};
use crate::error::ConnectError;

/// Capacity of rumqttc's internal request channel.
const REQUEST_CAPACITY: usize = 10;
/// rumqttc refuses keep-alive intervals below this.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
/// How long `disconnect` waits for the network task before aborting it.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long the network task tries to flush a DISCONNECT packet on shutdown.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    /// Edges of the session state machine. Every state may fall back to `Disconnected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Failed)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failed => "Connect failed",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub messages_received: u64,
    pub messages_sent: u64,
    /// Network tasks currently alive; never more than one
    pub live_sessions: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Not connected, nothing was sent
    Skipped,
}

#[derive(Debug, Default)]
struct LinkCounters {
    received: AtomicU64,
    sent: AtomicU64,
}

/// Shared, guarded view of the connection state.
#[derive(Debug, Clone)]
struct StateCell(Arc<watch::Sender<ConnectionState>>);

impl StateCell {
    fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::default());
        Self(Arc::new(tx))
    }

    fn get(&self) -> ConnectionState {
        *self.0.borrow()
    }

    /// Applies `next` if the state machine allows it. Returns whether the state changed.
    fn advance(&self, next: ConnectionState) -> bool {
        let mut refused_from = None;
        let changed = self.0.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                refused_from = Some(*current);
                false
            }
        });

        if let Some(from) = refused_from {
            warn!("Refusing connection state transition {:?} -> {:?}", from, next);
        }
        if changed {
            info!("Connection state is now {:?}", next);
        }
        changed
    }
}

/// Everything the network task needs to react to broker events.
#[derive(Debug, Clone)]
struct SessionLink {
    client: AsyncClient,
    topic: String,
    state: StateCell,
    queue: QueueProducer,
    counters: Arc<LinkCounters>,
}

impl SessionLink {
    /// Handles one polled event. Returns `false` when the session is over.
    fn on_event(&self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => self.on_connack(ack),
            Event::Incoming(Packet::Publish(publish)) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                trace!("Publish on {} ({} bytes)", publish.topic, publish.payload.len());
                self.queue
                    .push_data(RawMessage::from_bytes(publish.topic, &publish.payload));
                true
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    self.queue.push_system(SystemEvent::SubscribeFailed {
                        topic: self.topic.clone(),
                        reason: "rejected by broker".to_string(),
                    });
                } else {
                    self.queue
                        .push_system(SystemEvent::Log(format!("SUBACK pkid={}", ack.pkid)));
                }
                true
            }
            Event::Incoming(Packet::Disconnect) => {
                self.on_disconnected("broker sent DISCONNECT");
                false
            }
            Event::Incoming(Packet::PingResp) | Event::Outgoing(Outgoing::PingReq) => {
                trace!("Keep-alive ping");
                true
            }
            Event::Incoming(packet) => {
                self.queue
                    .push_system(SystemEvent::Log(format!("incoming {:?}", packet)));
                true
            }
            Event::Outgoing(outgoing) => {
                debug!("Outgoing {:?}", outgoing);
                true
            }
        }
    }

    fn on_connack(&self, ack: ConnAck) -> bool {
        if ack.code != ConnectReturnCode::Success {
            self.on_refused(ack.code);
            return false;
        }

        match self.client.try_subscribe(self.topic.as_str(), QoS::AtMostOnce) {
            Ok(()) => self.queue.push_system(SystemEvent::Subscribed {
                topic: self.topic.clone(),
            }),
            Err(e) => {
                warn!("Subscribe to {} failed: {}", self.topic, e);
                self.queue.push_system(SystemEvent::SubscribeFailed {
                    topic: self.topic.clone(),
                    reason: e.to_string(),
                });
            }
        }
        if self.state.advance(ConnectionState::Connected) {
            self.queue.push_system(SystemEvent::Connected);
        }
        true
    }

    fn on_refused(&self, code: ConnectReturnCode) {
        warn!("Broker refused connection: {:?}", code);
        self.state.advance(ConnectionState::Failed);
        self.queue.push_system(SystemEvent::ConnectFailed {
            reason: format!("{:?}", code),
            code: Some(connack_code(code)),
        });
    }

    fn on_error(&self, error: ConnectionError) {
        if let ConnectionError::ConnectionRefused(code) = error {
            self.on_refused(code);
            return;
        }

        match self.state.get() {
            ConnectionState::Connected => self.on_disconnected(&error.to_string()),
            ConnectionState::Connecting => {
                warn!("Transport connect failed: {}", error);
                self.state.advance(ConnectionState::Failed);
                self.queue.push_system(SystemEvent::ConnectFailed {
                    reason: error.to_string(),
                    code: None,
                });
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                debug!("Network loop ended after session close: {}", error);
            }
        }
    }

    fn on_disconnected(&self, reason: &str) {
        info!("Disconnected from broker: {}", reason);
        if self.state.advance(ConnectionState::Disconnected) {
            self.queue.push_system(SystemEvent::Disconnected);
        }
    }
}

fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// Counts live network tasks for as long as it is held.
struct LoopGuard(Arc<AtomicUsize>);

impl LoopGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_network_loop(
    mut eventloop: EventLoop,
    link: SessionLink,
    cancel: CancellationToken,
    _guard: LoopGuard,
) {
    debug!("Network task started for topic {}", link.topic);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if link.state.get() == ConnectionState::Connected {
                    flush_disconnect(&mut eventloop, &link.client).await;
                }
                break;
            }
            polled = eventloop.poll() => match polled {
                Ok(event) => {
                    if !link.on_event(event) {
                        break;
                    }
                }
                Err(error) => {
                    link.on_error(error);
                    break;
                }
            }
        }
    }
    debug!("Network task for topic {} stopped", link.topic);
}

/// Sends DISCONNECT and polls until it left the socket. Errors are irrelevant here.
async fn flush_disconnect(eventloop: &mut EventLoop, client: &AsyncClient) {
    if let Err(e) = client.try_disconnect() {
        debug!("Could not queue DISCONNECT: {}", e);
        return;
    }
    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
        debug!("DISCONNECT flush timed out");
    }
}

#[derive(Debug)]
struct Session {
    link: SessionLink,
    params: ConnectionParams,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the broker session and the connection state machine.
#[derive(Debug)]
pub struct ConnectionManager {
    state: StateCell,
    queue: QueueProducer,
    session: Option<Session>,
    live_loops: Arc<AtomicUsize>,
    counters: Arc<LinkCounters>,
    keep_alive: Duration,
}

impl ConnectionManager {
    pub fn new(queue: QueueProducer, keep_alive: Duration) -> Self {
        Self {
            state: StateCell::new(),
            queue,
            session: None,
            live_loops: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(LinkCounters::default()),
            keep_alive: keep_alive.max(MIN_KEEP_ALIVE),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.0.subscribe()
    }

    /// Data topic of the current session, if any.
    pub fn active_topic(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|session| session.params.topic.as_str())
    }

    pub fn live_sessions(&self) -> usize {
        self.live_loops.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> MqttStatus {
        MqttStatus {
            connection_state: self.state(),
            messages_received: self.counters.received.load(Ordering::Relaxed),
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            live_sessions: self.live_sessions(),
        }
    }

    /// Opens a new session, replacing any existing one.
    ///
    /// Invalid parameters are rejected before the current session is touched. The broker
    /// handshake completes asynchronously; its outcome arrives as queue events.
    pub async fn connect(&mut self, params: ConnectionParams) -> Result<(), ConnectError> {
        params.validate()?;

        if self.session.is_some() {
            info!("Tearing down existing session before reconnecting");
            self.disconnect().await;
        }
        // a finished-but-failed session leaves the state at Failed
        self.state.advance(ConnectionState::Disconnected);

        let client_id = session_client_id();
        let mut options = MqttOptions::new(client_id.as_str(), params.host.as_str(), params.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);
        if let Some(credentials) = &params.credentials {
            options.set_credentials(
                credentials.username.as_str(),
                credentials.password.as_str(),
            );
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let link = SessionLink {
            client,
            topic: params.topic.clone(),
            state: self.state.clone(),
            queue: self.queue.clone(),
            counters: self.counters.clone(),
        };

        info!(
            "Connecting to {}:{} as {} (topic {})",
            params.host, params.port, client_id, params.topic
        );
        self.state.advance(ConnectionState::Connecting);
        self.queue.push_system(SystemEvent::ConnectIssued {
            host: params.host.clone(),
            port: params.port,
        });

        let cancel = CancellationToken::new();
        let guard = LoopGuard::enter(&self.live_loops);
        let task = tokio::spawn(run_network_loop(
            eventloop,
            link.clone(),
            cancel.clone(),
            guard,
        ));

        self.session = Some(Session {
            link,
            params,
            cancel,
            task,
        });
        Ok(())
    }

    /// Stops the network task and closes the session. Safe to call at any time.
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            debug!("Disconnect requested without an active session");
            self.state.advance(ConnectionState::Disconnected);
            return;
        };

        session.cancel.cancel();
        let mut task = session.task;
        match tokio::time::timeout(TEARDOWN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => debug!("Network task joined"),
            Ok(Err(e)) => debug!("Network task ended abnormally: {}", e),
            Err(_) => {
                warn!("Network task did not stop in time, aborting it");
                task.abort();
                let _ = task.await;
            }
        }

        if self.state.advance(ConnectionState::Disconnected) {
            self.queue.push_system(SystemEvent::Disconnected);
        }
    }

    /// Fire-and-forget publish, permitted only while connected.
    pub fn publish(&self, topic: &str, payload: String) -> Result<PublishOutcome, ConnectError> {
        let Some(session) = &self.session else {
            return Ok(PublishOutcome::Skipped);
        };
        if self.state() != ConnectionState::Connected {
            return Ok(PublishOutcome::Skipped);
        }

        session
            .link
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(PublishOutcome::Published)
    }

    /// Installs a session without a network task so broker events can be injected.
    #[cfg(test)]
    pub(crate) fn attach_offline_session(&mut self, params: ConnectionParams) -> EventLoop {
        let options = MqttOptions::new(session_client_id(), params.host.as_str(), params.port);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let link = SessionLink {
            client,
            topic: params.topic.clone(),
            state: self.state.clone(),
            queue: self.queue.clone(),
            counters: self.counters.clone(),
        };
        self.state.advance(ConnectionState::Connecting);
        self.session = Some(Session {
            link,
            params,
            cancel: CancellationToken::new(),
            task: tokio::spawn(async {}),
        });
        eventloop
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, event: Event) -> bool {
        match &self.session {
            Some(session) => session.link.on_event(event),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_error(&self, error: ConnectionError) {
        if let Some(session) = &self.session {
            session.link.on_error(error);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::{ingest_queue, IngestEntry, QueueConsumer};
    use rumqttc::Publish;
    use tokio::net::TcpListener;

    fn params(port: u16) -> ConnectionParams {
        ConnectionParams::parse("127.0.0.1", &port.to_string(), "home/air/esp01/data", "", "")
            .unwrap()
    }

    fn manager() -> (ConnectionManager, QueueConsumer) {
        let (producer, consumer) = ingest_queue(64);
        (
            ConnectionManager::new(producer, Duration::from_secs(60)),
            consumer,
        )
    }

    fn system_events(consumer: &mut QueueConsumer) -> Vec<SystemEvent> {
        consumer
            .drain()
            .entries
            .into_iter()
            .filter_map(|entry| match entry {
                IngestEntry::System { event, .. } => Some(event),
                IngestEntry::Data(_) => None,
            })
            .collect()
    }

    fn connack(code: ConnectReturnCode) -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
    }

    #[test]
    fn state_machine_edges() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Failed));
    }

    #[tokio::test]
    async fn disconnect_without_session_is_noop() {
        let (mut manager, mut consumer) = manager();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(system_events(&mut consumer).is_empty());
    }

    #[tokio::test]
    async fn invalid_params_rejected_before_network() {
        let (mut manager, mut consumer) = manager();
        let mut bad = params(1883);
        bad.host = "  ".into();

        assert!(matches!(
            manager.connect(bad).await,
            Err(ConnectError::MissingHost)
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.live_sessions(), 0);
        assert!(system_events(&mut consumer).is_empty());
    }

    #[tokio::test]
    async fn second_connect_replaces_first_session() {
        // accepts TCP but never answers CONNECT, so sessions stay in Connecting
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut manager, mut consumer) = manager();

        manager.connect(params(port)).await.unwrap();
        assert_eq!(manager.live_sessions(), 1);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.connect(params(port)).await.unwrap();
        assert_eq!(manager.live_sessions(), 1);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.disconnect().await;
        assert_eq!(manager.live_sessions(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let events = system_events(&mut consumer);
        let issued = events
            .iter()
            .filter(|e| matches!(e, SystemEvent::ConnectIssued { .. }))
            .count();
        assert_eq!(issued, 2);
        assert_eq!(events.last(), Some(&SystemEvent::Disconnected));
        drop(listener);
    }

    #[tokio::test]
    async fn connack_success_subscribes_and_connects() {
        let (mut manager, mut consumer) = manager();
        let _eventloop = manager.attach_offline_session(params(1883));

        assert!(manager.inject(connack(ConnectReturnCode::Success)));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            system_events(&mut consumer),
            vec![
                SystemEvent::Subscribed {
                    topic: "home/air/esp01/data".into()
                },
                SystemEvent::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn connack_refusal_fails_with_code() {
        let (mut manager, mut consumer) = manager();
        let _eventloop = manager.attach_offline_session(params(1883));

        assert!(!manager.inject(connack(ConnectReturnCode::BadUserNamePassword)));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(matches!(
            system_events(&mut consumer).as_slice(),
            [SystemEvent::ConnectFailed { code: Some(4), .. }]
        ));

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn publish_packets_are_enqueued_as_data() {
        let (mut manager, mut consumer) = manager();
        let _eventloop = manager.attach_offline_session(params(1883));
        manager.inject(connack(ConnectReturnCode::Success));
        consumer.drain();

        let publish = Publish::new(
            "home/air/esp01/data",
            QoS::AtMostOnce,
            r#"{"temperature":21.5}"#,
        );
        manager.inject(Event::Incoming(Packet::Publish(publish)));

        let drain = consumer.drain();
        match drain.entries.as_slice() {
            [IngestEntry::Data(msg)] => {
                assert_eq!(msg.topic, "home/air/esp01/data");
                assert_eq!(msg.payload, r#"{"temperature":21.5}"#);
            }
            other => panic!("unexpected entries {:?}", other),
        }
        assert_eq!(manager.status().messages_received, 1);
    }

    #[tokio::test]
    async fn broker_disconnect_moves_to_disconnected() {
        let (mut manager, mut consumer) = manager();
        let _eventloop = manager.attach_offline_session(params(1883));
        manager.inject(connack(ConnectReturnCode::Success));
        consumer.drain();

        assert!(!manager.inject(Event::Incoming(Packet::Disconnect)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(system_events(&mut consumer), vec![SystemEvent::Disconnected]);
    }

    #[tokio::test]
    async fn transport_error_while_connecting_fails() {
        let (mut manager, mut consumer) = manager();
        let _eventloop = manager.attach_offline_session(params(1883));

        manager.inject_error(ConnectionError::NetworkTimeout);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(matches!(
            system_events(&mut consumer).as_slice(),
            [SystemEvent::ConnectFailed { code: None, .. }]
        ));
    }

    #[tokio::test]
    async fn publish_requires_connected_state() {
        let (mut manager, _consumer) = manager();
        assert_eq!(
            manager.publish("home/air/esp01/cmd", "INC:0.5".into()).unwrap(),
            PublishOutcome::Skipped
        );

        let _eventloop = manager.attach_offline_session(params(1883));
        assert_eq!(
            manager.publish("home/air/esp01/cmd", "INC:0.5".into()).unwrap(),
            PublishOutcome::Skipped
        );

        manager.inject(connack(ConnectReturnCode::Success));
        assert_eq!(
            manager.publish("home/air/esp01/cmd", "INC:0.5".into()).unwrap(),
            PublishOutcome::Published
        );
        assert_eq!(manager.status().messages_sent, 1);
    }
}
