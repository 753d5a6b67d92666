//! Jingle session negotiation between two endpoints.
//!
//! This crate implements the session layer on top of an abstract signaling
//! channel: sessions and their contents, SOCKS5 bytestream candidate
//! negotiation with direct and relayed candidates, and the encrypted-transport
//! overlay that wraps negotiated streams.
//!
//! ## Features
//!
//! - **Session state machine**: initiate, accept, terminate, content add/remove/modify
//! - **SOCKS5 bytestreams**: candidate gathering, nomination, relay activation
//! - **Encrypted transports**: AES-256-GCM or ChaCha20-Poly1305 records keyed per content
//! - **Transport fallback**: replace a failed transport with a configured alternative
//! - **Keepalive**: session-info pings with RTT measurement
//!
//! ## Example
//!
//! ```rust,no_run
//! use jingle_session::{
//!     ChannelConsumer, ContentSpec, Extensions, JingleManager, LoopbackNetwork,
//!     NoRelays, OpaqueDescription, SessionConfig, Socks5TransportFactory,
//! };
//! use jingle_wire::Jid;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let network = LoopbackNetwork::new();
//! let alice = Jid::new("alice@example.org/laptop")?;
//! let config = Arc::new(SessionConfig::default());
//! let s5b = Socks5TransportFactory::bind(Arc::clone(&config), Arc::new(NoRelays)).await?;
//! let extensions = Extensions::new().with_transport(Arc::new(s5b));
//!
//! let (manager, mut events) = JingleManager::new(
//!     alice.clone(),
//!     network.endpoint(alice),
//!     extensions,
//!     SessionConfig::default(),
//! );
//! manager.start();
//!
//! let (consumer, mut outcomes) = ChannelConsumer::new();
//! let description = OpaqueDescription::new("urn:example:file", ciborium::Value::Null, consumer);
//! let session = manager
//!     .initiate(Jid::new("bob@example.org/phone")?, vec![ContentSpec::new("file", description)])
//!     .await?;
//! println!("Initiated {}", session.sid());
//!
//! while let Some(outcome) = outcomes.recv().await {
//!     println!("Content {} finished", outcome.content());
//! }
//! # let _ = events.recv().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod content;
pub mod description;
pub mod error;
pub mod extensions;
pub mod keepalive;
pub mod manager;
pub mod registry;
pub mod security;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{SessionConfig, DIRECT_PRIORITY, RELAY_PRIORITY};
pub use content::{ContentSpec, ContentState};
pub use description::{
    ChannelConsumer, ContentOutcome, Description, DescriptionFactory, OpaqueDescription,
    OpaqueDescriptionFactory, PayloadConsumer,
};
pub use error::{JingleError, SecurityError, SignalingError, TransportError};
pub use extensions::Extensions;
pub use manager::{JingleEvent, JingleManager};
pub use registry::{SessionKey, SessionRegistry};
pub use security::cipher::{Cipher, SymmetricKey};
pub use security::jet::{JetSecurity, JetSecurityFactory};
pub use security::psk::PreSharedKeyMethod;
pub use security::{EncryptionMethod, EncryptionMethods, Security, SecurityFactory};
pub use session::{Session, SessionState};
pub use signaling::{InboundRequest, LoopbackNetwork, LoopbackSignaling, Signaling};
pub use transport::relay::{LocalRelay, NoRelays, RelayDirectory, StreamHost};
pub use transport::s5b::{Socks5Negotiator, Socks5TransportFactory};
pub use transport::stream_host::StreamHostServer;
pub use transport::{IoStream, Transport, TransportFactory};
