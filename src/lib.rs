//! Rust library for controlling Rotel amplifiers over the ASCII IP protocol
//!
//! This library keeps a live mirror of an amplifier's state over a single
//! persistent TCP connection. It supports:
//!
//! - Power, volume, mute and source control
//! - Push-driven state updates (no polling)
//! - Automatic reconnection with capped exponential backoff
//! - Profile-driven command mapping, so differing device dialects share one session
//! - Change notifications and connectivity status streams
//!
//! # Quick Start
//!
//! ```no_run
//! use rotel_ip::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(SessionConfig::new("192.168.1.50"))?;
//!     let mut status = session.subscribe_status();
//!     session.start()?;
//!
//!     // Wait until the handshake completes
//!     while !status.recv().await?.is_available() {}
//!
//!     session.set_power(true).await?;
//!     session.set_volume(35).await?;
//!     session.set_source("opt1").await?;
//!     println!("{:?}", session.get_state());
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Profile**: device dialect tables and model-string based selection
//! - **Protocol**: rendering commands to ASCII and decoding `$`-terminated status lines
//! - **Connection**: TCP socket, line framing and the [`Connector`] seam
//! - **Session**: connect, handshake, subscribe and reconnect state machine
//! - **Subscription**: ordered change and status receivers

mod backoff;
mod config;
mod connection;
mod error;
mod profile;
mod protocol;
mod session;
mod subscription;
mod types;

// Public exports
pub use backoff::Backoff;
pub use config::{ReconnectConfig, SessionConfig};
pub use connection::{
    Connection, Connector, LineReader, LineWriter, StatusCodec, TcpConnector, DEFAULT_MAX_LINE_LEN,
    STATUS_TERMINATOR,
};
pub use error::{Result, RotelError};
pub use profile::{
    normalize_model, rotel_ascii_v1, ModelMatcher, ModelPattern, Profile, ProfileRegistry, RegistryBuilder,
    SourceToken, StatusKeys, VolumeEncoding, DEFAULT_PORT, DEFAULT_PROFILE_KEY, REQUIRED_COMMANDS,
};
pub use protocol::{decode, decode_all, encode, Command, Event};
pub use session::Session;
pub use subscription::{ChangeReceiver, EventReceiver, StatusReceiver};
pub use types::{
    ConnectionStatus, DeviceState, Field, FieldValue, SessionState, SourceName, StateChange, VolumeValue,
};
