//! Jingle node binary.
//!
//! Runs a loopback transfer: two session engines on one in-process signaling
//! network negotiate a SOCKS5 bytestream (optionally through a local relay
//! and the encrypted transport), move a random payload and verify it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jingle_session::security::psk::NS_PSK;
use jingle_session::{
    ChannelConsumer, Cipher, ContentOutcome, ContentSpec, EncryptionMethods, Extensions, IoStream,
    JetSecurityFactory, JingleEvent, JingleManager, LocalRelay, LoopbackNetwork, NoRelays,
    OpaqueDescription, OpaqueDescriptionFactory, PreSharedKeyMethod, RelayDirectory, Session,
    SessionConfig, Socks5TransportFactory,
};
use jingle_wire::{Jid, Reason, NS_JINGLE_JET};
use rand::RngCore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::JingleLogFormatter;

/// Application namespace of the demo payload
const FILE_NS: &str = "urn:xmpp:jingle:apps:file-transfer:5";

/// Jingle session node
#[derive(Parser, Debug)]
#[command(name = "jingle-node", version, about = "Jingle session negotiation node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Negotiate a session between two in-process endpoints and transfer random bytes
    Loopback(LoopbackArgs),
}

#[derive(clap::Args, Debug)]
struct LoopbackArgs {
    /// Payload size in bytes
    #[arg(long)]
    bytes: Option<usize>,

    /// Offer relay candidates from the initiator
    #[arg(long)]
    relay: bool,

    /// Announce relay candidates only
    #[arg(long)]
    relay_only: bool,

    /// Encrypt the stream with a pre-shared key
    #[arg(long)]
    encrypt: bool,

    /// Cipher for the encrypted stream (aes-256-gcm, chacha20-poly1305)
    #[arg(long)]
    cipher: Option<String>,

    /// Hex-encoded 32-byte pre-shared secret
    #[arg(long)]
    psk: Option<String>,

    /// Response timeout, e.g. 5s
    #[arg(long)]
    response_timeout: Option<humantime::Duration>,

    /// Total candidate connect budget, e.g. 5s
    #[arg(long)]
    connect_budget: Option<humantime::Duration>,

    /// Keepalive ping interval, e.g. 10s
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Deadline for negotiation and transfer
    #[arg(long, default_value = "60s")]
    deadline: humantime::Duration,
}

impl LoopbackArgs {
    /// Apply flags on top of the file and environment configuration
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(bytes) = self.bytes {
            config.transfer_bytes = bytes;
        }
        config.use_relay |= self.relay;
        config.relay_only |= self.relay_only;
        config.encrypt |= self.encrypt;
        if let Some(cipher) = &self.cipher {
            config.cipher = cipher.clone();
        }
        if let Some(psk) = &self.psk {
            config.psk = psk.clone();
        }
    }

    fn session_config(&self, config: &NodeConfig, relays: bool) -> SessionConfig {
        let mut session = config.to_session_config(relays);
        if let Some(timeout) = self.response_timeout {
            session.response_timeout = timeout.into();
        }
        if let Some(budget) = self.connect_budget {
            session.connect_budget = budget.into();
        }
        if let Some(interval) = self.ping_interval {
            session.ping_interval = Some(interval.into());
        }
        session
    }
}

/// One engine with its event and outcome channels
struct Endpoint {
    jid: Jid,
    manager: Arc<JingleManager>,
    events: mpsc::UnboundedReceiver<JingleEvent>,
    consumer: Arc<ChannelConsumer>,
    outcomes: mpsc::UnboundedReceiver<ContentOutcome>,
}

impl Endpoint {
    async fn start(
        network: &Arc<LoopbackNetwork>,
        jid: Jid,
        config: SessionConfig,
        relays: Arc<dyn RelayDirectory>,
        security: Option<(Cipher, [u8; 32])>,
    ) -> Result<Self> {
        let s5b = Socks5TransportFactory::bind(Arc::new(config.clone()), relays)
            .await
            .with_context(|| format!("binding stream host for {}", jid))?;
        debug!(
            "Stream host for {} listening on {}",
            jid,
            s5b.stream_host().local_addr()
        );

        let (consumer, outcomes) = ChannelConsumer::new();
        let mut extensions = Extensions::new()
            .with_description(Arc::new(OpaqueDescriptionFactory::new(FILE_NS, consumer.clone())))
            .with_transport(Arc::new(s5b));
        if let Some((cipher, secret)) = security {
            let methods = EncryptionMethods::new()
                .with(Arc::new(PreSharedKeyMethod::new(jid.clone(), secret)));
            extensions = extensions.with_security(Arc::new(JetSecurityFactory::new(
                methods,
                NS_PSK,
                cipher,
                config.key_exchange_timeout,
            )));
        }

        let (manager, events) =
            JingleManager::new(jid.clone(), network.endpoint(jid.clone()), extensions, config);
        manager.start();

        Ok(Self {
            jid,
            manager,
            events,
            consumer,
            outcomes,
        })
    }

    async fn incoming(&mut self) -> Result<Arc<Session>> {
        loop {
            match self.events.recv().await {
                Some(JingleEvent::IncomingSession(session)) => return Ok(session),
                Some(JingleEvent::SessionEnded { sid, reason, .. }) => {
                    bail!("session {} ended before it was offered: {}", sid, reason)
                }
                Some(event) => debug!("{} ignoring {:?}", self.jid, event),
                None => bail!("event channel of {} closed", self.jid),
            }
        }
    }

    async fn stream(&mut self) -> Result<IoStream> {
        match self.outcomes.recv().await {
            Some(ContentOutcome::Ready { content, stream, .. }) => {
                info!(
                    component = "demo",
                    "{} has stream for {} (encrypted: {})",
                    self.jid,
                    content,
                    stream.is_encrypted()
                );
                Ok(stream)
            }
            Some(ContentOutcome::Failed { content, reason, .. }) => {
                bail!("content {} failed at {}: {}", content, self.jid, reason)
            }
            None => bail!("outcome channel of {} closed", self.jid),
        }
    }

    async fn ended(&mut self) -> Option<Reason> {
        while let Some(event) = self.events.recv().await {
            if let JingleEvent::SessionEnded { reason, .. } = event {
                return Some(reason);
            }
        }
        None
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("jingle_node={}", args.log_level).parse()?)
        .add_directive(format!("jingle_session={}", args.log_level).parse()?)
        .add_directive(format!("jingle_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(JingleLogFormatter::new("jingle"))
        .init();

    info!("Starting Jingle node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    match args.command {
        Command::Loopback(loopback) => {
            loopback.apply(&mut config);
            config.validate()?;

            tokio::select! {
                result = run_loopback(&config, &loopback) => result,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, exiting");
                    Ok(())
                }
            }
        }
    }
}

async fn run_loopback(config: &NodeConfig, args: &LoopbackArgs) -> Result<()> {
    let initiator_jid: Jid = config.initiator.parse()?;
    let responder_jid: Jid = config.responder.parse()?;
    let network = LoopbackNetwork::new();

    let relay = if config.use_relay || config.relay_only {
        let addr = SocketAddr::new(config.local_address, 0);
        Some(LocalRelay::bind(config.relay.parse()?, addr).await?)
    } else {
        None
    };
    let security = if config.encrypt {
        Some((config.cipher()?, config.psk_secret()?))
    } else {
        None
    };

    let initiator_relays: Arc<dyn RelayDirectory> = match &relay {
        Some(relay) => Arc::clone(relay) as Arc<dyn RelayDirectory>,
        None => Arc::new(NoRelays),
    };
    let mut initiator = Endpoint::start(
        &network,
        initiator_jid,
        args.session_config(config, relay.is_some()),
        initiator_relays,
        security,
    )
    .await?;
    let mut responder = Endpoint::start(
        &network,
        responder_jid,
        args.session_config(config, false),
        Arc::new(NoRelays),
        security,
    )
    .await?;

    let deadline: Duration = args.deadline.into();
    let result = tokio::time::timeout(
        deadline,
        transfer(&mut initiator, &mut responder, config),
    )
    .await
    .with_context(|| format!("loopback transfer did not finish within {:?}", deadline))
    .and_then(|result| result);

    if let Some(relay) = &relay {
        info!(
            component = "demo",
            "Relay {} activations: {}, active splices: {}",
            relay.jid(),
            relay.activation_count(),
            relay.active_splices()
        );
    }

    initiator.manager.shutdown().await;
    responder.manager.shutdown().await;
    result
}

async fn transfer(
    initiator: &mut Endpoint,
    responder: &mut Endpoint,
    config: &NodeConfig,
) -> Result<()> {
    let size = config.transfer_bytes;
    let payload_info = ciborium::Value::Map(vec![
        (
            ciborium::Value::Text("name".into()),
            ciborium::Value::Text("payload.bin".into()),
        ),
        (
            ciborium::Value::Text("size".into()),
            ciborium::Value::Integer((size as u64).into()),
        ),
    ]);
    let description = OpaqueDescription::new(FILE_NS, payload_info, initiator.consumer.clone());
    let mut spec = ContentSpec::new("payload", description);
    if config.encrypt {
        spec = spec.with_security(NS_JINGLE_JET);
    }

    let started = Instant::now();
    let session = initiator
        .manager
        .initiate(responder.jid.clone(), vec![spec])
        .await?;
    let incoming = responder.incoming().await?;
    info!(
        component = "demo",
        "{} accepting session {} from {}",
        responder.jid,
        incoming.sid(),
        incoming.peer()
    );
    incoming.accept().await?;

    let (mut sender, mut receiver) = tokio::try_join!(initiator.stream(), responder.stream())?;
    let negotiated = started.elapsed();
    info!(component = "demo", "Negotiated session {} in {:?}", session.sid(), negotiated);

    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);

    let started = Instant::now();
    let send = async {
        sender.write_all(&payload).await?;
        sender.flush().await
    };
    let receive = async {
        let mut received = vec![0u8; size];
        receiver.read_exact(&mut received).await?;
        Ok::<_, std::io::Error>(received)
    };
    let ((), received) = tokio::try_join!(send, receive).context("transfer failed")?;
    let elapsed = started.elapsed();

    if received != payload {
        bail!("received payload does not match what was sent");
    }
    let mib_per_sec = size as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(1e-9);
    info!(
        component = "demo",
        "Transferred {} bytes in {:?} ({:.2} MiB/s)",
        size,
        elapsed,
        mib_per_sec
    );

    session.terminate(Reason::Success).await;
    match responder.ended().await {
        Some(reason) => info!(component = "demo", "{} saw session end: {}", responder.jid, reason),
        None => warn!("{} stopped before the session ended", responder.jid),
    }
    Ok(())
}
