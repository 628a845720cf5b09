use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rendezvous::config::{
    self, CandidateStrategy, Credentials, MediaWanted, RelayPolicy, ResolutionProfile, Role,
    SessionConfig,
};
use rendezvous::events::SessionEvent;
use rendezvous::webrtc::{Collaborators, HostOrchestrator, PeerSession, WatcherSession};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Rendezvous command line arguments
#[derive(Parser, Debug)]
#[command(name = "rendezvous")]
#[command(version, about = "Peer-to-peer media and chat over a signaling channel", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer offers from any number of watchers
    Host(SessionArgs),
    /// Connect to the channel's host
    Watcher(SessionArgs),
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// JSON session configuration (flags override it)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Channel directory base URL (default: regional endpoint)
    #[arg(long, value_name = "URL")]
    directory_url: Option<String>,

    /// Signaling channel name
    #[arg(long, value_name = "NAME")]
    channel: Option<String>,

    /// Region of the channel
    #[arg(long, value_name = "REGION")]
    region: Option<String>,

    /// Client id presented by a watcher (random if omitted)
    #[arg(long, value_name = "ID")]
    client_id: Option<String>,

    /// Bearer token for the directory and relay
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Do not send local video
    #[arg(long)]
    no_video: bool,

    /// Do not send local audio
    #[arg(long)]
    no_audio: bool,

    /// Capture at 640x480 instead of 1280x720
    #[arg(long)]
    standard_resolution: bool,

    /// Open a data channel and forward stdin lines over it
    #[arg(long)]
    data_channel: bool,

    /// Send the description once candidate gathering completes
    #[arg(long)]
    batched: bool,

    /// NAT traversal policy (auto, relay-only, disabled)
    #[arg(long, value_name = "POLICY")]
    relay: Option<RelayPolicy>,

    /// Statistics polling period in milliseconds (0 disables)
    #[arg(long, value_name = "MS")]
    stats_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting rendezvous v{}", env!("CARGO_PKG_VERSION"));

    let (role, session_args) = match args.command {
        Command::Host(session_args) => (Role::Host, session_args),
        Command::Watcher(session_args) => (Role::Watcher, session_args),
    };
    let session_config = build_config(&session_args).await?;
    let directory_url = session_args
        .directory_url
        .clone()
        .unwrap_or_else(|| default_directory_url(&session_config.region));
    tracing::info!("Channel directory: {}", directory_url);

    let collaborators = Collaborators::connected(&directory_url)?;
    let session: Arc<dyn PeerSession> = match role {
        Role::Host => Arc::new(HostOrchestrator::new(collaborators)),
        Role::Watcher => Arc::new(WatcherSession::new(collaborators)),
    };

    let event_logger = tokio::spawn(log_events(session.subscribe()));
    session.start(session_config).await?;
    tracing::info!("Session running as {}, type to chat, Ctrl-C to quit", session.role());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let delivered = session.send(Bytes::from(line)).await;
                    tracing::debug!("Message delivered to {} peers", delivered);
                }
                Ok(None) => {
                    tracing::info!("Input closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Failed to read input: {}", e);
                    break;
                }
            },
        }
    }

    session.stop().await;
    event_logger.abort();
    tracing::info!("Bye");
    Ok(())
}

/// Session configuration from the optional file, overridden by flags
async fn build_config(args: &SessionArgs) -> anyhow::Result<SessionConfig> {
    let mut session_config = match args.config {
        Some(ref path) => config::load_config(path).await?,
        None => SessionConfig::default(),
    };

    if let Some(ref channel) = args.channel {
        session_config.channel_name = channel.clone();
    }
    if let Some(ref region) = args.region {
        session_config.region = region.clone();
    }
    if let Some(ref client_id) = args.client_id {
        session_config.client_id = Some(client_id.clone());
    }
    if let Some(ref token) = args.token {
        session_config.credentials = Some(Credentials::new(token.clone()));
    }
    if args.no_video || args.no_audio {
        session_config.media = MediaWanted {
            video: session_config.media.video && !args.no_video,
            audio: session_config.media.audio && !args.no_audio,
        };
    }
    if args.standard_resolution {
        session_config.resolution = ResolutionProfile::Standard;
    }
    if args.data_channel {
        session_config.open_data_channel = true;
    }
    if args.batched {
        session_config.candidate_strategy = CandidateStrategy::Batched;
    }
    if let Some(relay) = args.relay {
        session_config.relay_policy = relay;
    }
    if let Some(interval) = args.stats_interval_ms {
        session_config.stats_interval_ms = interval;
    }

    session_config.validate()?;
    Ok(session_config)
}

fn default_directory_url(region: &str) -> String {
    format!("https://kinesisvideo.{}.amazonaws.com", region)
}

/// Print remote messages and log everything else
async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::RemoteMessage { peer_id, data, .. }) => {
                let from = peer_id.map(|p| p.to_string()).unwrap_or_else(|| "host".to_string());
                println!("[{}] {}", from, String::from_utf8_lossy(&data));
            }
            Ok(SessionEvent::Stats(report)) => match serde_json::to_string(&report) {
                Ok(json) => tracing::debug!("stats {}", json),
                Err(e) => tracing::debug!("Unserializable stats report: {}", e),
            },
            Ok(event) => match event.peer_id() {
                Some(peer_id) => tracing::info!("{} ({})", event.event_name(), peer_id),
                None => tracing::info!("{}", event.event_name()),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged, {} events skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rendezvous=error,webrtc=error",
        LogLevel::Warn => "rendezvous=warn,webrtc=warn",
        LogLevel::Info => "rendezvous=info,webrtc=warn",
        LogLevel::Verbose => "rendezvous=debug,webrtc=warn",
        LogLevel::Debug => "rendezvous=debug,webrtc=info",
        LogLevel::Trace => "rendezvous=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
