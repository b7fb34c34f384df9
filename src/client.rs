//! Connecting, retrying and supervising sessions.
//!
//! Every attempt runs the handshake engine against fresh transport connections, one per
//! request. When an attempt fails the reconnect policy decides whether another one follows.
//! The caller sees one [`Error::ConnectFailed`] once the policy gives up.

use crate::{
    config::ClientConfig,
    engine::{check_target, ClientEngine, UpgradeOutcome},
    reconnect::{NeverReconnect, ReconnectPolicy, RetryAfterPolicy},
    socket::exchange,
    Close, CloseCode, Error, Message, WebSocket,
};
use parking_lot::Mutex;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, BufStream},
    net::TcpStream,
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};
use url::{Host, Url};

/// How long a session being closed waits for the peer's close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens byte streams to servers.
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, url: &Url) -> impl Future<Output = Result<Self::Stream, Error>> + Send;

    /// Called when no attempt or session of any client sharing this transport is active.
    fn release(&self) {}

    /// Called when an attempt exceeds the handshake timeout.
    fn handshake_timed_out(&self, _url: &Url) {}
}

/// Plain TCP. Handles `ws` URLs only; bring a TLS transport for `wss`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn connect(&self, url: &Url) -> Result<TcpStream, Error> {
        if url.scheme() != "ws" {
            return Err(Error::IncorrectScheme(url.scheme().into()));
        }
        let port = url.port_or_known_default().unwrap_or(80);
        let stream = match url.host() {
            Some(Host::Domain(domain)) => TcpStream::connect((domain, port)).await?,
            Some(Host::Ipv4(addr)) => TcpStream::connect((addr, port)).await?,
            Some(Host::Ipv6(addr)) => TcpStream::connect((addr, port)).await?,
            None => return Err(Error::NoHost),
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Counts attempts and open sessions. The transport is released when the count drops to zero.
pub(crate) struct ActivityTracker {
    active: Mutex<usize>,
    on_idle: Box<dyn Fn() + Send + Sync>,
}

impl ActivityTracker {
    fn new(on_idle: impl Fn() + Send + Sync + 'static) -> Self {
        ActivityTracker {
            active: Mutex::new(0),
            on_idle: Box::new(on_idle),
        }
    }

    fn initiated(self: &Arc<Self>) -> ActivityGuard {
        *self.active.lock() += 1;
        ActivityGuard(Arc::clone(self))
    }

    fn terminated(&self) {
        // release happens under the lock so a new attempt can't start on a released transport
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            debug!("no active clients, releasing transport");
            (self.on_idle)();
        }
    }

    fn active(&self) -> usize {
        *self.active.lock()
    }
}

/// One active attempt or session.
pub(crate) struct ActivityGuard(Arc<ActivityTracker>);

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.0.terminated();
    }
}

impl std::fmt::Debug for ActivityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ActivityGuard")
    }
}

/// What the supervisor does after an attempt.
enum AttemptEvent<S> {
    Connected(WebSocket<S>),
    Failed(Error),
    RetryAfter { delay: Duration, error: Error },
}

struct Connector<T> {
    transport: Arc<T>,
    config: Arc<ClientConfig>,
    activity: Arc<ActivityTracker>,
}

impl<T> Clone for Connector<T> {
    fn clone(&self) -> Self {
        Connector {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            activity: Arc::clone(&self.activity),
        }
    }
}

impl<T: Transport> Connector<T> {
    fn policy(&self) -> Arc<dyn ReconnectPolicy> {
        if self.config.retry_after_enabled {
            return Arc::new(RetryAfterPolicy::new(self.config.reconnect_policy.clone()));
        }
        self.config
            .reconnect_policy
            .clone()
            .unwrap_or_else(|| Arc::new(NeverReconnect))
    }

    async fn attempt(&self, url: &Url) -> Result<WebSocket<T::Stream>, Error> {
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&self.config);

        let result = if self.config.synchronous {
            run_attempt(transport, config, url.clone()).await
        } else {
            match tokio::spawn(run_attempt(transport, config, url.clone())).await {
                Ok(result) => result,
                Err(err) => Err(err.into()),
            }
        };
        result
    }

    async fn connect(
        &self,
        url: &Url,
        policy: &dyn ReconnectPolicy,
        mut alive: Option<&mut watch::Receiver<bool>>,
    ) -> Result<WebSocket<T::Stream>, Error> {
        // one guard for every attempt, so retries don't release the transport
        let guard = self.activity.initiated();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let event = match self.attempt(url).await {
                Ok(ws) => AttemptEvent::Connected(ws),
                Err(error) if policy.on_connect_failure(&error) => AttemptEvent::RetryAfter {
                    delay: policy.delay(),
                    error,
                },
                Err(error) => AttemptEvent::Failed(error),
            };

            match event {
                AttemptEvent::Connected(ws) => return Ok(ws.with_activity(guard)),
                AttemptEvent::Failed(error) => {
                    debug!(attempts, %error, "giving up");
                    return Err(Error::ConnectFailed {
                        attempts,
                        source: Box::new(error),
                    });
                }
                AttemptEvent::RetryAfter { delay, error } => {
                    info!(attempts, ?delay, %error, "connect failed, retrying");
                    if !pause(delay, alive.as_deref_mut()).await {
                        return Err(Error::ConnectFailed {
                            attempts,
                            source: Box::new(error),
                        });
                    }
                }
            }
        }
    }
}

async fn run_attempt<T: Transport>(
    transport: Arc<T>,
    config: Arc<ClientConfig>,
    url: Url,
) -> Result<WebSocket<T::Stream>, Error> {
    let mut engine = ClientEngine::new(url, Arc::clone(&config))?;
    let timeout = config.handshake_timeout;

    match tokio::time::timeout(timeout, handshake(transport.as_ref(), &mut engine, &config)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(url = %engine.current_url(), ?timeout, "handshake timed out");
            transport.handshake_timed_out(engine.current_url());
            Err(engine.process_error(Error::Timeout(timeout)))
        }
    }
}

async fn handshake<T: Transport>(
    transport: &T,
    engine: &mut ClientEngine,
    config: &ClientConfig,
) -> Result<WebSocket<T::Stream>, Error> {
    loop {
        let request = engine.create_upgrade_request()?;
        let stream = match transport.connect(&request.url).await {
            Ok(stream) => stream,
            Err(err) => return Err(engine.process_error(err)),
        };

        let mut stream = BufStream::new(stream);
        let response = match exchange(&mut stream, &request, config.max_header_len).await {
            Ok(response) => response,
            Err(err) => return Err(engine.process_error(err)),
        };

        match engine.process_response(&response)? {
            UpgradeOutcome::Success(upgraded) => {
                return Ok(WebSocket::from_upgrade(stream, upgraded, config, request.secure()));
            }
            UpgradeOutcome::AnotherRequestRequired => {}
        }
    }
}

/// Waits `delay`. Returns false if the connection was closed meanwhile.
async fn pause(delay: Duration, alive: Option<&mut watch::Receiver<bool>>) -> bool {
    let Some(alive) = alive else {
        tokio::time::sleep(delay).await;
        return true;
    };

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        if !*alive.borrow() {
            return false;
        }
        tokio::select! {
            _ = &mut sleep => return *alive.borrow(),
            changed = alive.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Connects clients through a shared transport.
pub struct ClientManager<T = TcpTransport> {
    connector: Connector<T>,
}

impl ClientManager<TcpTransport> {
    pub fn new(config: ClientConfig) -> Self {
        ClientManager::with_transport(TcpTransport, config)
    }
}

impl<T: Transport> ClientManager<T> {
    pub fn with_transport(transport: T, config: ClientConfig) -> Self {
        let transport = Arc::new(transport);
        let released = Arc::clone(&transport);
        ClientManager {
            connector: Connector {
                transport,
                config: Arc::new(config),
                activity: Arc::new(ActivityTracker::new(move || released.release())),
            },
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.connector.config
    }

    /// Attempts in flight plus sessions not yet closed.
    pub fn active_clients(&self) -> usize {
        self.connector.activity.active()
    }

    /// Connects to `url`, retrying as long as the reconnect policy allows.
    pub async fn connect(&self, url: &str) -> Result<WebSocket<T::Stream>, Error> {
        let url = Url::parse(url)?;
        check_target(&url)?;
        let policy = self.connector.policy();
        self.connector.connect(&url, policy.as_ref(), None).await
    }

    /// Starts a session that lives until [`ConnectionHandle::close`].
    ///
    /// Messages go to `endpoint`. When the session ends the reconnect policy is asked whether to
    /// connect again.
    pub fn spawn<E: Endpoint>(&self, url: &str, endpoint: E) -> ConnectionHandle {
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (alive_tx, alive) = watch::channel(true);
        let (done_tx, done) = watch::channel(false);
        let handle = ConnectionHandle {
            messages: messages_tx,
            alive: Arc::new(alive_tx),
            done,
        };

        let supervisor = Supervisor {
            connector: self.connector.clone(),
            endpoint,
            handle: handle.clone(),
            messages,
            alive,
        };
        let url = url.to_string();
        tokio::spawn(async move {
            supervisor.run(&url).await;
            done_tx.send_replace(true);
        });

        handle
    }
}

/// Receives the events of a spawned session.
pub trait Endpoint: Send + 'static {
    fn on_open(&mut self, _handle: &ConnectionHandle) {}

    fn on_message(&mut self, _handle: &ConnectionHandle, _message: Message) {}

    /// `close` is `None` when the connection ended without a close frame.
    fn on_close(&mut self, _close: Option<&Close>) {}

    fn on_error(&mut self, _error: &Error) {}
}

/// Controls a spawned session.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    messages: mpsc::UnboundedSender<Message>,
    alive: Arc<watch::Sender<bool>>,
    done: watch::Receiver<bool>,
}

impl ConnectionHandle {
    /// Queues a message. Messages queued while reconnecting go out on the next session.
    pub fn send(&self, message: Message) -> Result<(), Error> {
        if !self.is_alive() {
            return Err(Error::WasClosed);
        }
        self.messages.send(message).map_err(|_| Error::WasClosed)
    }

    /// Closes the session and cancels any pending reconnect.
    pub fn close(&self) {
        self.alive.send_replace(false);
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Waits until the supervisor has stopped for good.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        if done.wait_for(|done| *done).await.is_err() {
            debug!("supervisor dropped");
        }
    }
}

struct Supervisor<T, E> {
    connector: Connector<T>,
    endpoint: E,
    handle: ConnectionHandle,
    messages: mpsc::UnboundedReceiver<Message>,
    alive: watch::Receiver<bool>,
}

impl<T: Transport, E: Endpoint> Supervisor<T, E> {
    async fn run(mut self, url: &str) {
        let url = match Url::parse(url)
            .map_err(Error::from)
            .and_then(|url| check_target(&url).map(|()| url))
        {
            Ok(url) => url,
            Err(err) => {
                self.endpoint.on_error(&err);
                return;
            }
        };
        let policy = self.connector.policy();
        // covers the pause between sessions
        let mut reconnecting = None;

        loop {
            let connected = self
                .connector
                .connect(&url, policy.as_ref(), Some(&mut self.alive))
                .await;
            drop(reconnecting.take());
            let mut ws = match connected {
                Ok(ws) => ws,
                Err(err) => {
                    if self.handle.is_alive() {
                        self.endpoint.on_error(&err);
                    }
                    return;
                }
            };

            self.endpoint.on_open(&self.handle);
            let close = self.session(&mut ws).await;
            reconnecting = Some(self.connector.activity.initiated());
            drop(ws);
            self.endpoint.on_close(close.as_ref());

            if !self.handle.is_alive() || !policy.on_disconnect(close.as_ref()) {
                return;
            }
            let delay = policy.delay();
            info!(?delay, ?close, "session ended, reconnecting");
            if !pause(delay, Some(&mut self.alive)).await {
                return;
            }
        }
    }

    /// Drives one open session. Returns the peer's close, if it sent one.
    async fn session(&mut self, ws: &mut WebSocket<T::Stream>) -> Option<Close> {
        loop {
            loop {
                match ws.next_buffered().await {
                    Ok(Some(message)) => self.endpoint.on_message(&self.handle, message),
                    Ok(None) => break,
                    Err(err) => return self.ended(err),
                }
            }

            tokio::select! {
                read = ws.read_bytes() => match read {
                    Ok(0) => return None,
                    Ok(_) => {}
                    Err(err) => return self.ended(err),
                },
                Some(message) = self.messages.recv() => {
                    let written = match ws.write(message).await {
                        Ok(()) => ws.flush().await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = written {
                        self.endpoint.on_error(&err);
                    }
                }
                changed = self.alive.changed() => {
                    if changed.is_err() || !*self.alive.borrow() {
                        return close_session(ws).await;
                    }
                }
            }
        }
    }

    fn ended(&mut self, err: Error) -> Option<Close> {
        match err {
            Error::Closed(close) => close,
            err => {
                self.endpoint.on_error(&err);
                None
            }
        }
    }
}

async fn close_session<S>(ws: &mut WebSocket<S>) -> Option<Close>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(err) = ws.close(CloseCode::Normal, "").await {
        debug!(%err, "could not send close frame");
        return None;
    }

    let echo = async {
        loop {
            match ws.read().await {
                Ok(_) => {}
                Err(Error::Closed(close)) => return close,
                Err(_) => return None,
            }
        }
    };
    tokio::time::timeout(CLOSE_TIMEOUT, echo)
        .await
        .unwrap_or_default()
}
