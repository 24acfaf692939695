//! callwire - relay smoke test
//!
//! Registers an identity with a signaling relay, then lists presence, places
//! a call or waits for one. Calls connect over real WebRTC peer links fed by
//! a simulated capture device, so no camera or microphone is touched.
//! `--simulated-links` swaps the peer links for in-memory ones and exercises
//! only the signaling path.
//!
//! ```text
//! callwire --relay ws://127.0.0.1:9000/signal --id dana --role responder listen --auto-accept
//! callwire --relay ws://127.0.0.1:9000/signal --id pat call dana --hold 15
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use callwire_client_core::logging::{LogFormat, LoggingConfig, parse_log_level, setup_logging};
use callwire_client_core::sim::{SimulatedMediaCapture, SimulatedPeerLinkFactory};
use callwire_client_core::{
    CallClient, CallState, ClientBuilder, ClientConfig, ClientEvent, Identity, IdentityId,
    PeerLinkFactory, Role, Subscription, WebRtcPeerLinkFactory, format_duration,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Signaling relay smoke test", long_about = None)]
struct Args {
    /// Relay WebSocket URL
    #[arg(long, env = "CALLWIRE_RELAY", default_value = "ws://127.0.0.1:9000/signal")]
    relay: String,

    /// Identity to register
    #[arg(long)]
    id: String,

    /// Display name (defaults to the id)
    #[arg(long)]
    name: Option<String>,

    #[arg(long, value_enum, default_value_t = RoleArg::Initiator)]
    role: RoleArg,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// Seconds an invite may ring before it fails
    #[arg(long)]
    ring_timeout: Option<u64>,

    /// STUN/TURN server URL; repeat for several (defaults to a public STUN server)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Use in-memory peer links instead of WebRTC
    #[arg(long)]
    simulated_links: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for incoming calls
    Listen {
        /// Accept every incoming call
        #[arg(long)]
        auto_accept: bool,
    },
    /// Call an identity and hang up after a while
    Call {
        target: String,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "10")]
        hold: u64,
    },
    /// Print who the relay reports online
    Presence,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    #[value(alias = "patient")]
    Initiator,
    #[value(alias = "doctor")]
    Responder,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Initiator => Role::Initiator,
            RoleArg::Responder => Role::Responder,
        }
    }
}

const PRESENCE_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = parse_log_level(&args.log_level)?;
    let format = if args.json_logs { LogFormat::Json } else { LogFormat::Text };
    setup_logging(LoggingConfig::new(level).with_format(format))?;

    let mut config = ClientConfig::default();
    if !args.ice_servers.is_empty() {
        config = config.with_ice_servers(args.ice_servers.clone());
    }
    if let Some(secs) = args.ring_timeout {
        config = config.with_ring_timeout(Duration::from_secs(secs));
    }
    let links: Arc<dyn PeerLinkFactory> = if args.simulated_links {
        Arc::new(SimulatedPeerLinkFactory::new())
    } else {
        Arc::new(WebRtcPeerLinkFactory::new().context("failed to set up WebRTC")?)
    };

    let client = ClientBuilder::new()
        .relay_url(args.relay.clone())
        .media_capture(Arc::new(SimulatedMediaCapture::new()))
        .peer_links(links)
        .config(config)
        .build()
        .await
        .context("failed to build client")?;
    let events = client.subscribe();

    let name = args.name.clone().unwrap_or_else(|| args.id.clone());
    let identity = Identity::new(args.id.as_str(), name, args.role.into());
    client
        .start(identity)
        .await
        .with_context(|| format!("failed to register with {}", args.relay))?;
    info!(identity = %args.id, relay = %args.relay, "Registered");

    let result = match args.command {
        Command::Presence => {
            print_presence(&client);
            Ok(())
        }
        Command::Call { target, hold } => call(&client, events, IdentityId::from(target), hold).await,
        Command::Listen { auto_accept } => listen(&client, events, auto_accept).await,
    };

    client.shutdown().await;
    result
}

fn print_presence(client: &CallClient) {
    let presence = client.presence();
    println!("registration: {}", client.registration_state());
    if presence.is_empty() {
        println!("nobody else is online");
        return;
    }
    for id in presence.iter() {
        println!("online: {}", id);
    }
}

async fn call(
    client: &CallClient,
    mut events: Subscription<ClientEvent>,
    target: IdentityId,
    hold: u64,
) -> Result<()> {
    wait_online(client, &mut events, &target).await?;
    let call_id = client.place_call(&target).await?;
    println!("calling {} ({})", target, call_id);

    let mut hang_up_at: Option<Instant> = None;
    loop {
        let deadline = hang_up_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("client stopped");
                };
                match event {
                    ClientEvent::CallStateChanged { info } => {
                        println!("{} -> {}", info.previous_state, info.new_state);
                        if info.new_state == CallState::Active {
                            hang_up_at = Some(Instant::now() + Duration::from_secs(hold));
                        }
                    }
                    ClientEvent::CallEnded { summary } => {
                        println!(
                            "call {} ended: {} (connected {})",
                            summary.call_id,
                            summary.reason,
                            format_duration(summary.duration)
                        );
                        return Ok(());
                    }
                    other => debug!(?other, "Client event"),
                }
            }
            _ = sleep_until(deadline), if hang_up_at.is_some() => {
                hang_up_at = None;
                info!(hold, "Hold time elapsed, hanging up");
                client.hang_up().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, hanging up");
                client.hang_up().await?;
            }
        }
    }
}

async fn listen(client: &CallClient, mut events: Subscription<ClientEvent>, auto_accept: bool) -> Result<()> {
    println!("listening as {}", client.identity().map(|i| i.id.to_string()).unwrap_or_default());
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("client stopped");
                };
                match event {
                    ClientEvent::IncomingCall { info } => {
                        println!("incoming call {} from {}", info.call_id, info.caller_display_name);
                        if auto_accept {
                            if let Err(e) = client.accept(&info.call_id).await {
                                warn!(call_id = %info.call_id, error = %e, "Accept failed");
                            }
                        }
                    }
                    ClientEvent::CallStateChanged { info } => {
                        println!("{} -> {}", info.previous_state, info.new_state);
                    }
                    ClientEvent::CallEnded { summary } => {
                        println!("call {} ended: {}", summary.call_id, summary.reason);
                    }
                    ClientEvent::BusyRejected { caller, .. } => {
                        println!("refused {} while busy", caller.id);
                    }
                    ClientEvent::NetworkEvent { connected, reason } => {
                        println!("relay {}{}", if connected { "connected" } else { "disconnected" },
                            reason.map(|r| format!(": {}", r)).unwrap_or_default());
                    }
                    other => debug!(?other, "Client event"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                if client.session().is_some() {
                    client.hang_up().await?;
                }
                return Ok(());
            }
        }
    }
}

async fn wait_online(client: &CallClient, events: &mut Subscription<ClientEvent>, target: &IdentityId) -> Result<()> {
    if client.presence().contains(target) {
        return Ok(());
    }
    info!(target = %target, "Waiting for peer to come online");
    let wait = async {
        while let Some(event) = events.recv().await {
            if matches!(&event, ClientEvent::PresenceChanged { identity_id, online: true } if identity_id == target) {
                return true;
            }
        }
        false
    };
    match tokio::time::timeout(PRESENCE_WAIT, wait).await {
        Ok(true) => Ok(()),
        Ok(false) => bail!("client stopped"),
        Err(_) => bail!("{} is not online", target),
    }
}
