//! Client task driving a session over TCP
//!
//! [`Client::spawn`] starts one tokio task per session. The task owns the
//! [`Session`], the TCP stream, the engine relay and the timers, and reacts to
//! caller commands, socket readiness and timer ticks in a single `select!`
//! loop. Each event is handed to the session, then the actions it queued are
//! carried out before the loop waits again.

use crate::auth::KeyPair;
use crate::config::{ClientConfig, HostKeyPolicy, Target};
use crate::error::{ConnectError, SkiffError};
use crate::events::{EventReceiver, EventSender, SessionEvent};
use crate::session::{ChannelConsumer, Session, SessionAction, SessionState, SessionStatus};
use crate::Result;
use bytes::BytesMut;
use skiff_ssh::relay::{RELAY_CHUNK, RELAY_HIGH_WATER};
use skiff_ssh::{
    Connector, EngineError, EngineFactory, HostIdentity, ProtocolEngine, Relay, RelayEvent,
    TrafficCounters,
};
use std::future::Future;
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Capacity of the command channel
const COMMAND_CAPACITY: usize = 64;

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;
type ConnectReply = oneshot::Sender<std::result::Result<(), ConnectError>>;

enum Command<E> {
    Connect {
        target: Target,
        reply: Option<ConnectReply>,
    },
    Disconnect,
    SetPassword(Zeroizing<String>),
    SetKeyPair(KeyPair),
    LoadKnownHosts {
        path: PathBuf,
        reply: oneshot::Sender<Result<usize>>,
    },
    SaveKnownHosts {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    AddKnownHost {
        hostname: String,
        identity: HostIdentity,
        reply: oneshot::Sender<Result<()>>,
    },
    HostIdentity {
        reply: oneshot::Sender<Option<HostIdentity>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    RegisterConsumer(Box<dyn ChannelConsumer<E>>),
    Shutdown,
}

/// Handle on a running session task
pub struct Client<E> {
    id: Uuid,
    commands: mpsc::Sender<Command<E>>,
}

impl<E> Clone for Client<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            commands: self.commands.clone(),
        }
    }
}

impl<E> std::fmt::Debug for Client<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.id).finish()
    }
}

#[cfg(feature = "ssh2")]
impl Client<skiff_ssh::Ssh2Engine> {
    /// Spawn a libssh2 backed client connecting over plain TCP
    pub fn ssh2(config: ClientConfig) -> Result<(Self, EventReceiver)> {
        Self::spawn(config, skiff_ssh::Ssh2EngineFactory, Arc::new(skiff_ssh::TcpConnector::new()))
    }
}

impl<E> Client<E>
where
    E: ProtocolEngine + Send + 'static,
    E::Socket: From<StdUnixStream>,
{
    /// Spawn the session task
    ///
    /// Must be called from within a tokio runtime. The task runs until
    /// [`Client::shutdown`] or until every handle has been dropped.
    pub fn spawn<F>(
        config: ClientConfig,
        factory: F,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, EventReceiver)>
    where
        F: EngineFactory<Engine = E> + Send + 'static,
    {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Session::new(factory, &config);
        let id = session.id();
        let span = info_span!("session", %id);

        let driver = Driver {
            session,
            config,
            connector,
            commands: command_rx,
            events: event_tx,
            counters: TrafficCounters::new(),
            connecting: None,
            connect_deadline: None,
            reader: None,
            writer: None,
            relay: None,
            read_buf: BytesMut::with_capacity(RELAY_CHUNK),
            write_buf: BytesMut::new(),
            local_port: None,
            keepalive: None,
            waiter: None,
        };
        tokio::spawn(driver.run().instrument(span));

        Ok((Self { id, commands: command_tx }, event_rx))
    }

    /// Session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start connecting and return immediately
    ///
    /// The outcome arrives as [`SessionEvent`]s.
    pub async fn connect(&self, target: Target) -> Result<()> {
        self.send(Command::Connect { target, reply: None }).await
    }

    /// Connect and wait for the outcome
    ///
    /// Resolves once authentication succeeds, every attempt has failed, or
    /// no usable authentication method remains.
    pub async fn connect_and_wait(&self, target: Target) -> Result<()> {
        let outcome = self
            .request(|reply| Command::Connect {
                target,
                reply: Some(reply),
            })
            .await?;
        outcome.map_err(SkiffError::from)
    }

    /// Reset the session and forget the credentials
    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }

    /// Supply a password; authentication resumes if it was waiting
    pub async fn set_password(&self, password: impl Into<String>) -> Result<()> {
        self.send(Command::SetPassword(Zeroizing::new(password.into()))).await
    }

    /// Supply key pair material; authentication resumes if it was waiting
    pub async fn set_key_pair(&self, key_pair: KeyPair) -> Result<()> {
        self.send(Command::SetKeyPair(key_pair)).await
    }

    /// Merge a known hosts file into the trust store
    pub async fn load_known_hosts(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref().to_path_buf();
        self.request(|reply| Command::LoadKnownHosts { path, reply }).await?
    }

    /// Write the trust store to a known hosts file
    pub async fn save_known_hosts(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.request(|reply| Command::SaveKnownHosts { path, reply }).await?
    }

    /// Trust `identity` for `hostname`
    pub async fn add_known_host(
        &self,
        hostname: impl Into<String>,
        identity: HostIdentity,
    ) -> Result<()> {
        let hostname = hostname.into();
        self.request(|reply| Command::AddKnownHost {
            hostname,
            identity,
            reply,
        })
        .await?
    }

    /// Host identity from the most recent handshake
    pub async fn host_identity(&self) -> Result<Option<HostIdentity>> {
        self.request(|reply| Command::HostIdentity { reply }).await
    }

    /// Snapshot of the session state
    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Current session state
    pub async fn state(&self) -> Result<SessionState> {
        Ok(self.status().await?.state)
    }

    /// Most recent engine error
    pub async fn last_error(&self) -> Result<Option<EngineError>> {
        Ok(self.status().await?.last_error)
    }

    /// Local port of the TCP connection, if connected
    pub async fn local_port(&self) -> Result<Option<u16>> {
        Ok(self.status().await?.local_port)
    }

    /// Register a channel consumer
    pub async fn register_consumer(
        &self,
        consumer: impl ChannelConsumer<E> + 'static,
    ) -> Result<()> {
        self.send(Command::RegisterConsumer(Box::new(consumer))).await
    }

    /// Disconnect and stop the session task
    pub async fn shutdown(&self) -> Result<()> {
        debug!("Shutting down client {}", self.id);
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command<E>) -> Result<()> {
        self.commands.send(command).await.map_err(|_| SkiffError::ClientClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command<E>,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(command(reply_tx)).await?;
        reply_rx.await.map_err(|_| SkiffError::ClientClosed)
    }
}

/// The session task
struct Driver<F: EngineFactory> {
    session: Session<F>,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command<F::Engine>>,
    events: EventSender,
    counters: Arc<TrafficCounters>,
    connecting: Option<ConnectFuture>,
    connect_deadline: Option<Pin<Box<Sleep>>>,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    relay: Option<Relay>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    local_port: Option<u16>,
    keepalive: Option<Interval>,
    waiter: Option<ConnectReply>,
}

impl<F> Driver<F>
where
    F: EngineFactory,
    <F::Engine as ProtocolEngine>::Socket: From<StdUnixStream>,
{
    async fn run(mut self) {
        info!("Session task started");
        let mut traffic = interval(self.config.traffic_sample_interval);
        traffic.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        traffic.tick().await;

        loop {
            // Each direction stops taking bytes while its queue is full
            let accept_inbound = self.relay.as_ref().map_or(true, |relay| !relay.is_backlogged());
            let accept_outgoing = self.write_buf.len() < RELAY_HIGH_WATER;
            let flushing = !self.write_buf.is_empty();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                result = poll_opt(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(stream) => self.transport_connected(stream),
                        Err(e) => self.session.on_transport_error(&e),
                    }
                }
                _ = poll_opt(&mut self.connect_deadline) => {
                    self.connect_deadline = None;
                    debug!("Connect timer fired");
                    self.session.on_connect_timeout();
                }
                read = read_opt(&mut self.reader, &mut self.read_buf), if accept_inbound => {
                    match read {
                        Ok(0) => {
                            debug!("Server closed the connection");
                            self.transport_closed();
                        }
                        Ok(_) => self.queue_inbound(),
                        Err(e) => {
                            warn!("Transport read failed: {}", e);
                            self.transport_closed();
                        }
                    }
                }
                written = write_opt(&mut self.writer, &mut self.write_buf), if flushing => {
                    if let Err(e) = written {
                        warn!("Transport write failed: {}", e);
                        self.transport_closed();
                    }
                }
                relayed = relay_opt(&mut self.relay, accept_outgoing) => match relayed {
                    Ok(RelayEvent::Delivered(_)) => self.session.on_readable(),
                    Ok(RelayEvent::Outgoing(data)) => self.write_buf.extend_from_slice(&data),
                    Ok(RelayEvent::EngineClosed) => {
                        debug!("Engine closed its end of the relay");
                        self.relay = None;
                    }
                    Err(e) => {
                        warn!("Relay failed: {}", e);
                        self.transport_closed();
                    }
                },
                _ = tick_opt(&mut self.keepalive) => self.session.send_keepalive(),
                _ = traffic.tick() => {
                    let (sent, received) = self.counters.take();
                    self.emit(SessionEvent::TrafficSample { sent, received });
                }
            }

            self.apply_actions();
        }

        self.session.disconnect();
        self.apply_actions();
        info!("Session task stopped");
    }

    fn handle_command(&mut self, command: Command<F::Engine>) {
        match command {
            Command::Connect { target, reply } => {
                if self.session.state() != SessionState::Idle || self.session.is_connect_pending() {
                    self.session.reset();
                    self.apply_actions();
                }
                if let Some(stale) = self.waiter.take() {
                    let _ = stale.send(Err(ConnectError::Cancelled));
                }
                self.waiter = reply;
                self.session
                    .connect(target, self.config.retries, self.config.connect_timeout);
            }
            Command::Disconnect => self.session.disconnect(),
            Command::SetPassword(password) => self.session.set_password(password.as_str()),
            Command::SetKeyPair(key_pair) => self.session.set_key_pair(key_pair),
            Command::LoadKnownHosts { path, reply } => {
                let _ = reply.send(self.session.load_known_hosts(&path));
            }
            Command::SaveKnownHosts { path, reply } => {
                let _ = reply.send(self.session.save_known_hosts(&path));
            }
            Command::AddKnownHost {
                hostname,
                identity,
                reply,
            } => {
                let _ = reply.send(self.session.add_known_host(&hostname, &identity));
            }
            Command::HostIdentity { reply } => {
                let _ = reply.send(self.session.host_identity().cloned());
            }
            Command::Status { reply } => {
                let mut status = self.session.status();
                status.local_port = self.local_port;
                let _ = reply.send(status);
            }
            Command::RegisterConsumer(consumer) => self.session.register_consumer(consumer),
            Command::Shutdown => {}
        }
    }

    fn transport_connected(&mut self, stream: TcpStream) {
        let local_port = stream.local_addr().ok().map(|addr| addr.port());
        match Relay::pair(self.counters.clone()) {
            Ok((relay, engine_end)) => {
                debug!("TCP connected from local port {:?}", local_port);
                let (reader, writer) = stream.into_split();
                self.reader = Some(reader);
                self.writer = Some(writer);
                self.relay = Some(relay);
                self.local_port = local_port;
                self.session.on_tcp_connected(engine_end.into());
            }
            Err(e) => {
                error!("Failed to create engine relay: {}", e);
                self.session.on_transport_error(&e);
            }
        }
    }

    fn queue_inbound(&mut self) {
        match self.relay.as_mut() {
            Some(relay) => relay.queue_inbound(&self.read_buf),
            None => debug!("Dropping {} bytes; the engine is gone", self.read_buf.len()),
        }
    }

    fn transport_closed(&mut self) {
        self.close_transport();
        self.session.on_transport_closed();
    }

    fn close_transport(&mut self) {
        self.connecting = None;
        self.reader = None;
        self.writer = None;
        self.relay = None;
        self.write_buf.clear();
        self.local_port = None;
    }

    fn apply_actions(&mut self) {
        while let Some(action) = self.session.next_action() {
            match action {
                SessionAction::Emit(event) => self.emit(event),
                SessionAction::OpenTransport { host, port } => {
                    let connector = self.connector.clone();
                    self.close_transport();
                    self.connecting =
                        Some(Box::pin(async move { connector.connect(&host, port).await }));
                }
                SessionAction::CloseTransport => self.close_transport(),
                SessionAction::ArmConnectTimer(timeout) => {
                    self.connect_deadline = Some(Box::pin(sleep(timeout)));
                }
                SessionAction::StartKeepAlive => {
                    let period = self.config.keepalive_interval;
                    let mut keepalive = interval_at(Instant::now() + period, period);
                    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keepalive = Some(keepalive);
                }
                SessionAction::StopKeepAlive => self.keepalive = None,
                SessionAction::Reenter => self.session.resume(),
                SessionAction::ConnectFinished(outcome) => {
                    self.connect_deadline = None;
                    match &outcome {
                        Ok(()) => info!("Connected"),
                        Err(e) => info!("Connect finished: {}", e),
                    }
                    if let Some(waiter) = self.waiter.take() {
                        let _ = waiter.send(outcome);
                    }
                }
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

async fn poll_opt<T: Future + Unpin>(future: &mut Option<T>) -> T::Output {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn read_opt(reader: &mut Option<OwnedReadHalf>, buf: &mut BytesMut) -> io::Result<usize> {
    match reader {
        Some(reader) => {
            buf.clear();
            buf.reserve(RELAY_CHUNK);
            reader.read_buf(buf).await
        }
        None => std::future::pending().await,
    }
}

async fn write_opt(writer: &mut Option<OwnedWriteHalf>, buf: &mut BytesMut) -> io::Result<usize> {
    match writer {
        Some(writer) => writer.write_buf(buf).await,
        None => std::future::pending().await,
    }
}

async fn relay_opt(relay: &mut Option<Relay>, accept_outgoing: bool) -> io::Result<RelayEvent> {
    match relay {
        Some(relay) => relay.next_event(accept_outgoing).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Builder for a connected client
pub struct ClientBuilder {
    target: Target,
    config: ClientConfig,
    password: Option<Zeroizing<String>>,
    key_pair: Option<KeyPair>,
}

impl ClientBuilder {
    /// Create a builder for `[user@]host[:port]`
    pub fn new(target: &str) -> Self {
        Self {
            target: Target::parse(target),
            config: ClientConfig::default(),
            password: None,
            key_pair: None,
        }
    }

    /// Authenticate with a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Authenticate with a key pair
    pub fn with_key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    /// Set the per-attempt connect timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set how many extra connect attempts are allowed
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Set the host key policy
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.config.host_key_policy = policy;
        self
    }

    /// Load and persist trusted host keys in `path`
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.known_hosts = Some(path.into());
        self
    }

    /// Set the keep-alive period
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the traffic sample period
    pub fn with_traffic_sample_interval(mut self, interval: Duration) -> Self {
        self.config.traffic_sample_interval = interval;
        self
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Target this builder connects to
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Configuration the client will run with
    pub fn build_config(&self) -> ClientConfig {
        self.config.clone()
    }

    /// Connect with libssh2 over plain TCP
    #[cfg(feature = "ssh2")]
    pub async fn connect(self) -> Result<(Client<skiff_ssh::Ssh2Engine>, EventReceiver)> {
        self.connect_with(skiff_ssh::Ssh2EngineFactory, Arc::new(skiff_ssh::TcpConnector::new()))
            .await
    }

    /// Connect with a custom engine factory and connector
    pub async fn connect_with<F>(
        self,
        factory: F,
        connector: Arc<dyn Connector>,
    ) -> Result<(Client<F::Engine>, EventReceiver)>
    where
        F: EngineFactory + Send + 'static,
        F::Engine: Send + 'static,
        <F::Engine as ProtocolEngine>::Socket: From<StdUnixStream>,
    {
        if self.password.is_none() && self.key_pair.is_none() {
            warn!("Connecting to {} without credentials", self.target);
        }

        let (client, events) = Client::spawn(self.config, factory, connector)?;
        if let Some(password) = self.password {
            client.set_password(password.as_str()).await?;
        }
        if let Some(key_pair) = self.key_pair {
            client.set_key_pair(key_pair).await?;
        }

        client.connect_and_wait(self.target).await?;
        Ok((client, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_configuration() {
        let builder = ClientBuilder::new("test@example.com:2222")
            .with_timeout(Duration::from_secs(3))
            .with_retries(2)
            .with_host_key_policy(HostKeyPolicy::AcceptNew)
            .with_known_hosts("/tmp/known_hosts")
            .with_keepalive_interval(Duration::from_secs(30))
            .with_password("secret");

        assert_eq!(builder.target(), &Target::new("test", "example.com", 2222));

        let config = builder.build_config();
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.retries, 2);
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptNew);
        assert_eq!(config.known_hosts, Some(PathBuf::from("/tmp/known_hosts")));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.traffic_sample_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_optional_sources_stay_pending() {
        let mut nothing: Option<Pin<Box<Sleep>>> = None;
        tokio_test::assert_pending!(tokio_test::task::spawn(poll_opt(&mut nothing)).poll());

        let mut no_interval: Option<Interval> = None;
        tokio_test::assert_pending!(tokio_test::task::spawn(tick_opt(&mut no_interval)).poll());

        let mut no_relay: Option<Relay> = None;
        tokio_test::assert_pending!(tokio_test::task::spawn(relay_opt(&mut no_relay, true)).poll());

        let mut no_writer: Option<OwnedWriteHalf> = None;
        let mut queued = BytesMut::from(&b"pending"[..]);
        let mut write = tokio_test::task::spawn(write_opt(&mut no_writer, &mut queued));
        tokio_test::assert_pending!(write.poll());
    }

    #[tokio::test]
    async fn test_poll_opt_resolves_armed_timer() {
        let mut armed = Some(Box::pin(sleep(Duration::from_millis(1))));
        tokio::time::timeout(Duration::from_secs(5), poll_opt(&mut armed))
            .await
            .unwrap();
    }
}
