use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::connection::{Connector, LineReader, LineWriter, TcpConnector};
use crate::error::{Result, RotelError};
use crate::profile::{Profile, ProfileRegistry};
use crate::protocol::{decode_all, encode, Command, Event};
use crate::subscription::{ChangeReceiver, StatusReceiver};
use crate::types::{ConnectionStatus, DeviceState, Field, FieldValue, SessionState, StateChange, VolumeValue};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 256;

/// Pause between the state queries sent after the handshake
const REFRESH_SPACING: Duration = Duration::from_millis(50);

const REFRESH_FIELDS: [Field; 4] = [Field::Power, Field::Volume, Field::Mute, Field::Source];

/// Live connection to one Rotel amplifier
///
/// A `Session` keeps a single TCP connection open, performs the handshake
/// (model query, push enable, state refresh) and mirrors every pushed status
/// line into a [`DeviceState`]. Lost connections are re-established with
/// exponential backoff until [`shutdown`](Self::shutdown) is called.
///
/// # Example
///
/// ```no_run
/// use rotel_ip::{Session, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let session = Session::new(SessionConfig::new("192.168.1.50"))?;
///     let mut changes = session.subscribe_changes();
///     session.start()?;
///
///     while let Ok(change) = changes.recv().await {
///         println!("{:?}: {:?} -> {:?}", change.field, change.old, change.new);
///     }
///
///     session.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct Session {
    runner: Runner,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the session handle and its background task
struct Shared {
    inner: Mutex<Inner>,
    change_tx: broadcast::Sender<StateChange>,
    status_tx: broadcast::Sender<ConnectionStatus>,
}

struct Inner {
    phase: SessionState,
    device: DeviceState,
    profile: Arc<Profile>,
    link: Option<Link>,
}

/// The live connection as seen by command senders
#[derive(Clone)]
struct Link {
    writer: LineWriter,
    /// Cancelled by a sender whose write failed
    lost: CancellationToken,
}

/// Everything the background task needs
#[derive(Clone)]
struct Runner {
    shared: Arc<Shared>,
    config: SessionConfig,
    registry: Arc<ProfileRegistry>,
    connector: Arc<dyn Connector>,
    /// Profile used for the model query before the real one is known
    bootstrap: Arc<Profile>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session using the built-in profiles and TCP
    ///
    /// Fails if the config is invalid or names an unknown profile.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(ProfileRegistry::builtin().clone()),
            Arc::new(TcpConnector),
        )
    }

    /// Create a session with a custom profile registry and connector
    pub fn with_parts(
        config: SessionConfig,
        registry: Arc<ProfileRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let bootstrap = match &config.profile {
            Some(key) => registry.get(key)?,
            None => registry.default_profile(),
        };

        let (change_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                phase: SessionState::Idle,
                device: DeviceState::default(),
                profile: bootstrap.clone(),
                link: None,
            }),
            change_tx,
            status_tx,
        });

        Ok(Self {
            runner: Runner {
                shared,
                config,
                registry,
                connector,
                bootstrap,
                cancel: CancellationToken::new(),
            },
            task: Mutex::new(None),
        })
    }

    /// Spawn the connection task
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// running has no effect; a closed session cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }
        if self.runner.shared.lock().phase == SessionState::Closed {
            return Err(RotelError::NotConnected);
        }

        let runner = self.runner.clone();
        *task = Some(tokio::spawn(async move { runner.run().await }));
        Ok(())
    }

    /// Stop the session
    ///
    /// Cancels any pending connect, read or backoff wait, closes the socket
    /// and moves to [`SessionState::Closed`]. Idempotent.
    pub async fn shutdown(&self) {
        self.runner.cancel.cancel();

        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Session task ended abnormally");
            }
        }

        self.runner.shared.close().await;
    }

    /// Snapshot of the last-known device state
    pub fn get_state(&self) -> DeviceState {
        self.runner.shared.lock().device.clone()
    }

    /// Current phase of the state machine
    pub fn state(&self) -> SessionState {
        self.runner.shared.lock().phase
    }

    /// Current connectivity status
    pub fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    /// Profile in use (the configured or default one until the first handshake)
    pub fn profile(&self) -> Arc<Profile> {
        self.runner.shared.lock().profile.clone()
    }

    /// Subscribe to field changes
    pub fn subscribe_changes(&self) -> ChangeReceiver {
        ChangeReceiver::new(self.runner.shared.change_tx.subscribe())
    }

    /// Subscribe to connectivity status transitions
    pub fn subscribe_status(&self) -> StatusReceiver {
        StatusReceiver::new(self.runner.shared.status_tx.subscribe())
    }

    /// Turn the amplifier on or off
    pub async fn set_power(&self, on: bool) -> Result<()> {
        self.send_command(Command::Power(on)).await
    }

    /// Set volume on the profile's raw scale
    ///
    /// Values outside the profile range fail with [`RotelError::InvalidArgument`].
    pub async fn set_volume(&self, volume: VolumeValue) -> Result<()> {
        self.send_command(Command::SetVolume(volume)).await
    }

    /// Set volume from a 0.0..=1.0 level, clamping out-of-range levels
    pub async fn set_volume_level(&self, level: f32) -> Result<()> {
        let volume = self.profile().volume_from_level(level);
        self.set_volume(volume).await
    }

    pub async fn set_mute(&self, muted: bool) -> Result<()> {
        self.send_command(Command::Mute(muted)).await
    }

    /// Select a source by logical name
    ///
    /// Names missing from the profile fail with [`RotelError::InvalidArgument`].
    pub async fn set_source(&self, name: &str) -> Result<()> {
        self.send_command(Command::SetSource(name.to_string())).await
    }

    /// Ask the device to report power, volume, mute and source again
    pub async fn refresh(&self) -> Result<()> {
        let (link, commands) = {
            let inner = self.runner.shared.lock();
            let link = inner.subscribed_link()?;
            let commands: Vec<String> = REFRESH_FIELDS
                .iter()
                .filter_map(|field| encode(&inner.profile, &Command::Query(*field)).ok())
                .collect();
            (link, commands)
        };

        for command in commands {
            if let Err(e) = link.writer.send(&command).await {
                return Err(link.fail(&command, &e));
            }
        }
        Ok(())
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        let shared = &self.runner.shared;
        let (link, wire, optimistic) = {
            let mut inner = shared.lock();
            let link = inner.subscribed_link()?;
            let wire = encode(&inner.profile, &command)?;
            // Applied before writing so a fast device echo always lands last.
            let change = match optimistic_value(&inner.profile, &command) {
                Some(value) => shared.apply_locked(&mut inner, value),
                None => None,
            };
            (link, wire, change)
        };

        if let Err(e) = link.writer.send(&wire).await {
            if let Some(change) = optimistic {
                shared.revert(change);
            }
            return Err(link.fail(&wire, &e));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.runner.cancel.cancel();
    }
}

/// Value the device is expected to echo after `command`
fn optimistic_value(profile: &Profile, command: &Command) -> Option<FieldValue> {
    match command {
        Command::Power(on) => Some(FieldValue::Power(*on)),
        Command::Mute(muted) => Some(FieldValue::Mute(*muted)),
        Command::SetVolume(v) => Some(FieldValue::Volume(*v)),
        Command::SetSource(name) => profile
            .source_token(name)
            .and_then(|token| profile.source_name(token))
            .map(|canonical| FieldValue::Source(canonical.to_string())),
        _ => None,
    }
}

impl Inner {
    fn subscribed_link(&self) -> Result<Link> {
        if self.phase != SessionState::Subscribed {
            return Err(RotelError::NotConnected);
        }
        self.link.clone().ok_or(RotelError::NotConnected)
    }
}

impl Link {
    /// Report a failed write and hand the session loop the disconnect
    fn fail(&self, command: &str, error: &RotelError) -> RotelError {
        tracing::warn!(error = %error, command, "Command write failed, dropping connection");
        self.lost.cancel();
        RotelError::NotConnected
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `to`, emitting a status event if connectivity changed
    ///
    /// Returns `false` once the session is closed; nothing leaves `Closed`.
    fn transition(&self, to: SessionState) -> bool {
        let mut inner = self.lock();
        self.transition_locked(&mut inner, to)
    }

    fn transition_locked(&self, inner: &mut Inner, to: SessionState) -> bool {
        let from = inner.phase;
        if from == SessionState::Closed {
            return false;
        }
        inner.phase = to;

        tracing::info!(from = %from, to = %to, "Session state changed");
        if from.status() != to.status() {
            let _ = self.status_tx.send(to.status());
        }
        true
    }

    /// Install a freshly handshaken connection and enter `Subscribed`
    fn subscribed(&self, link: Link, profile: Arc<Profile>) -> bool {
        let mut inner = self.lock();
        if inner.phase == SessionState::Closed {
            return false;
        }
        inner.link = Some(link);
        inner.profile = profile;
        inner.device.stale = false;
        self.transition_locked(&mut inner, SessionState::Subscribed)
    }

    /// Forget the current connection; keep the state but mark it stale
    async fn disconnect(&self) {
        let link = {
            let mut inner = self.lock();
            inner.device.stale = true;
            inner.link.take()
        };
        if let Some(link) = link {
            link.writer.close().await;
        }
    }

    async fn close(&self) {
        let link = {
            let mut inner = self.lock();
            if inner.phase != SessionState::Closed {
                self.transition_locked(&mut inner, SessionState::Closed);
            }
            inner.link.take()
        };
        if let Some(link) = link {
            link.writer.close().await;
        }
    }

    fn set_profile(&self, profile: Arc<Profile>) {
        self.lock().profile = profile;
    }

    /// Store a value and notify subscribers if it changed
    fn apply(&self, value: FieldValue) {
        let mut inner = self.lock();
        if let Some(change) = self.apply_locked(&mut inner, value) {
            tracing::debug!(field = ?change.field, new = ?change.new, "State changed");
        }
    }

    fn apply_locked(&self, inner: &mut Inner, value: FieldValue) -> Option<StateChange> {
        let change = inner.device.apply(value)?;
        // Sent under the lock so notifications follow mutation order.
        let _ = self.change_tx.send(change.clone());
        Some(change)
    }

    /// Undo an optimistic change unless the device has reported since
    fn revert(&self, change: StateChange) {
        let Some(old) = change.old else {
            return;
        };
        let mut inner = self.lock();
        if inner.device.get(change.field).as_ref() == Some(&change.new) {
            self.apply_locked(&mut inner, old);
        }
    }

    fn apply_event(&self, event: Event) {
        match event.into_field_value() {
            Some(value) => self.apply(value),
            None => tracing::debug!("Ignoring status value outside profile"),
        }
    }
}

impl Runner {
    /// Connect, subscribe, and reconnect with backoff until cancelled
    async fn run(self) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            if !self.shared.transition(SessionState::Connecting) {
                break;
            }

            let reason = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                reason = self.connect_and_subscribe(&mut backoff) => reason,
            };
            self.shared.disconnect().await;
            if reason.is_transport() {
                tracing::warn!(error = %reason, host = %self.config.host, "Connection lost");
            } else {
                tracing::error!(error = %reason, host = %self.config.host, "Session failed");
            }

            if !self.shared.transition(SessionState::Reconnecting) {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt = backoff.attempt(),
                "Waiting before reconnect"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.shared.close().await;
        tracing::info!(host = %self.config.host, "Session closed");
    }

    /// One connection lifetime; returns why it ended
    async fn connect_and_subscribe(&self, backoff: &mut Backoff) -> RotelError {
        let connection = match self
            .connector
            .connect(
                &self.config.host,
                self.config.port,
                self.config.connect_timeout,
                self.config.max_line_len,
            )
            .await
        {
            Ok(connection) => connection,
            Err(e) => return e,
        };
        let (writer, mut reader) = connection.split();

        if !self.shared.transition(SessionState::Handshaking) {
            writer.close().await;
            return RotelError::NotConnected;
        }

        let profile = match self.handshake(&writer, &mut reader).await {
            Ok(profile) => profile,
            Err(e) => {
                writer.close().await;
                return e;
            }
        };

        let lost = CancellationToken::new();
        let link = Link {
            writer,
            lost: lost.clone(),
        };
        if !self.shared.subscribed(link, profile.clone()) {
            return RotelError::NotConnected;
        }
        backoff.reset();
        tracing::info!(host = %self.config.host, profile = %profile.key, "Subscribed to status updates");

        self.read_loop(&profile, &mut reader, &lost).await
    }

    /// Query the model, pick the profile, enable push and request current state
    async fn handshake(&self, writer: &LineWriter, reader: &mut LineReader) -> Result<Arc<Profile>> {
        writer.send(&encode(&self.bootstrap, &Command::Query(Field::Model))?).await?;

        let model = timeout(self.config.handshake_timeout, self.await_model(reader))
            .await
            .map_err(|_| RotelError::HandshakeTimeout)??;

        let profile = match &self.config.profile {
            Some(key) => self.registry.get(key)?,
            None => self.registry.resolve(&model),
        };
        tracing::info!(model = %model, profile = %profile.key, "Resolved device profile");
        self.shared.set_profile(profile.clone());

        writer.send(&encode(&profile, &Command::EnablePush)?).await?;

        for field in REFRESH_FIELDS {
            match encode(&profile, &Command::Query(field)) {
                Ok(query) => {
                    writer.send(&query).await?;
                    sleep(REFRESH_SPACING).await;
                }
                Err(_) => tracing::debug!(field = ?field, profile = %profile.key, "Profile has no query for field"),
            }
        }

        Ok(profile)
    }

    /// Read until a model response arrives, applying anything else on the way
    async fn await_model(&self, reader: &mut LineReader) -> Result<String> {
        loop {
            let line = reader.next_line().await?.ok_or(RotelError::ConnectionClosed)?;
            tracing::debug!(line = %line, "Received during handshake");

            let mut model = None;
            for event in decode_all(&self.bootstrap, &line) {
                if let Event::Model(m) = &event {
                    model = Some(m.clone());
                }
                self.shared.apply_event(event);
            }
            if let Some(model) = model {
                return Ok(model);
            }
        }
    }

    async fn read_loop(&self, profile: &Profile, reader: &mut LineReader, lost: &CancellationToken) -> RotelError {
        loop {
            tokio::select! {
                biased;
                _ = lost.cancelled() => return RotelError::Write("command write failed".to_string()),
                line = reader.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(profile, &line),
                    Ok(None) => return RotelError::ConnectionClosed,
                    Err(e) => return e,
                },
            }
        }
    }

    fn handle_line(&self, profile: &Profile, line: &str) {
        tracing::debug!(line, "Received");

        let events = decode_all(profile, line);
        if events.is_empty() {
            tracing::debug!(line, "Unrecognized status line");
            return;
        }
        for event in events {
            self.shared.apply_event(event);
        }
    }
}
