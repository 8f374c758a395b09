//! Huddle CLI: in-process call demo and diagnostics

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use huddle_core::loopback::{LoopbackChannel, LoopbackHub, LoopbackPeerNetwork, SyntheticDevices};
use huddle_core::prelude::*;
use huddle_core::{grid_layout, MediaFrame};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

type Service = CallService<LoopbackChannel>;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// User id to sign in as (e.g., "falcon-orbit")
    #[arg(short, long, env = "HUDDLE_IDENTITY")]
    identity: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between in-process clients and print its events
    Demo {
        /// Place a video call
        #[arg(long)]
        video: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "3")]
        hold_secs: u64,

        /// Have the callees decline instead of answering
        #[arg(long)]
        reject: bool,

        /// Number of callees; more than one places a group call
        #[arg(long, default_value = "1")]
        participants: usize,
    },

    /// Show the video grid for a number of connected peers
    Grid {
        /// Connected peers
        peers: usize,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("huddle=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            video,
            hold_secs,
            reject,
            participants,
        } => {
            let identity = cli.identity.unwrap_or_else(generate_random_identity);
            let identity = UserId::parse(&identity)?;
            println!("🔗 Using identity: {}", identity);
            handle_demo(identity, config, video, hold_secs, reject, participants).await?;
        }
        Commands::Grid { peers } => handle_grid(peers),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<CallConfig> {
    let Some(path) = path else {
        return Ok(CallConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

async fn start_client(
    hub: &LoopbackHub,
    network: &LoopbackPeerNetwork,
    user: Participant,
    config: CallConfig,
) -> Result<Arc<Service>> {
    let service = CallService::builder(user)
        .with_channel(Arc::new(hub.channel()))
        .with_transport(Arc::new(network.transport()))
        .with_devices(Arc::new(SyntheticDevices::new()))
        .with_config(config)
        .build()?;
    service.start().await?;
    Ok(Arc::new(service))
}

/// Answer or decline every call that rings `service`
fn spawn_callee(service: Arc<Service>, reject: bool) -> tokio::task::JoinHandle<()> {
    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let CallEvent::IncomingCall { caller, .. } = event else {
                continue;
            };
            let user = service.signaling().user().clone();
            let result = if reject {
                println!("   {} declines {}", user, caller.username);
                service.reject().await
            } else {
                println!("   {} answers {}", user, caller.username);
                service.answer().await
            };
            if let Err(e) = result {
                tracing::warn!(user = %user, error = %e, "Callee could not respond");
            }
        }
    })
}

/// Print the caller's events until the call ends
fn spawn_event_printer(service: &Service) -> tokio::task::JoinHandle<()> {
    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::OutgoingCall { room, is_video, .. } => {
                    println!("📞 Ringing in room {} (video: {})", room, is_video);
                }
                CallEvent::CallConnected { participants, .. } => {
                    let names: Vec<&str> =
                        participants.iter().map(|p| p.username.as_str()).collect();
                    println!("✅ Connected with {}", names.join(", "));
                }
                CallEvent::ParticipantJoined { participant, .. } => {
                    println!("➕ {} joined", participant.username);
                }
                CallEvent::CallRejected { notice, .. } => {
                    println!("❌ {}", notice);
                    break;
                }
                CallEvent::CallFailed { reason, .. } => {
                    println!("⚠️  Call failed: {}", reason);
                    break;
                }
                CallEvent::MediaAccessFailed { reason } => {
                    println!("⚠️  Media unavailable: {}", reason);
                }
                CallEvent::RecordingStarted { peer, .. } => println!("⏺️  Recording {}", peer),
                CallEvent::RecordingFinished { artifact } => println!(
                    "💾 {} ({}, {} frames, {} bytes)",
                    artifact.file_name(),
                    artifact.mime_type,
                    artifact.frame_count,
                    artifact.data.len()
                ),
                CallEvent::CallEnded { summary, reason } => {
                    println!(
                        "📴 Call ended ({:?}): {:?} after {}s",
                        reason, summary.status, summary.duration_secs
                    );
                    break;
                }
                other => tracing::debug!(event = ?other, "Call event"),
            }
        }
    })
}

async fn handle_demo(
    identity: UserId,
    config: CallConfig,
    video: bool,
    hold_secs: u64,
    reject: bool,
    participants: usize,
) -> Result<()> {
    if participants == 0 {
        bail!("--participants must be at least 1");
    }

    let hub = LoopbackHub::new();
    let network = LoopbackPeerNetwork::new();
    let local = Participant::new(identity.clone(), identity.as_str());
    let caller = start_client(&hub, &network, local, config.clone()).await?;

    let mut callees = Vec::with_capacity(participants);
    let mut tasks = Vec::with_capacity(participants);
    for n in 1..=participants {
        let user = Participant::new(format!("guest-{n}"), format!("guest {n}"));
        let service = start_client(&hub, &network, user.clone(), config.clone()).await?;
        tasks.push(spawn_callee(Arc::clone(&service), reject));
        callees.push((user, service));
    }
    let printer = spawn_event_printer(&caller);

    let invited: Vec<Participant> = callees.iter().map(|(user, _)| user.clone()).collect();
    if participants == 1 {
        caller.call(invited[0].clone(), video, None).await?;
    } else {
        let room = RoomId::new(format!("huddle-{}", identity));
        for (_, service) in &callees {
            service.join_room(&room).await?;
        }
        caller.call_group(room, invited, video).await?;
    }

    let mut state = caller.subscribe_state();
    let settled = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| matches!(s, CallState::Connected | CallState::Idle)),
    )
    .await;
    let connected = match settled {
        Ok(current) => current.map(|s| *s == CallState::Connected)?,
        Err(_) => {
            println!("⌛ No answer, cancelling");
            caller.hang_up().await?;
            false
        }
    };

    if connected {
        hold_call(&caller, &callees, hold_secs).await;
        if let Some(summary) = caller.hang_up().await? {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;
    caller.shutdown().await;
    for (_, service) in &callees {
        service.shutdown().await;
    }
    for task in tasks {
        task.abort();
    }
    Ok(())
}

/// Keep the call up, feeding synthetic frames and recording the first peer
async fn hold_call(caller: &Service, callees: &[(Participant, Arc<Service>)], hold_secs: u64) {
    // Peers register shortly after the session forms
    tokio::time::sleep(Duration::from_millis(100)).await;
    let grid = caller.grid_layout().await;
    println!(
        "🖼️  Grid {}x{} for {} peer(s)",
        grid.columns,
        grid.rows,
        caller.connected_peers().len()
    );

    if let Err(e) = caller.start_recording().await {
        tracing::warn!(error = %e, "Recording unavailable");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    for tick in 0..hold_secs {
        ticker.tick().await;
        for (_, service) in callees {
            if let Some(stream) = service.local_stream().await {
                stream.publish(MediaFrame::audio(format!("tick-{tick}").into_bytes()));
            }
        }
        if let Some(info) = caller.current_call().await {
            println!("⏱️  {}s", info.duration_secs);
        }
    }
    ticker.tick().await;
}

fn handle_grid(peers: usize) {
    let grid = grid_layout(peers);
    println!(
        "{} peer(s): {} columns x {} rows ({} slots)",
        peers,
        grid.columns,
        grid.rows,
        grid.slots()
    );
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cobalt", "dune", "ember", "fjord", "garnet", "harbor", "iris", "juniper",
        "kestrel", "lagoon", "maple", "nimbus", "onyx", "pebble", "quartz", "raven", "saffron",
        "tundra", "umber", "violet", "willow", "yarrow", "zephyr", "falcon", "orbit", "comet",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        WORDS[rng.gen_range(0..WORDS.len())],
        WORDS[rng.gen_range(0..WORDS.len())]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_identity_is_two_words() {
        let identity = generate_random_identity();
        assert_eq!(identity.split('-').count(), 2);
        assert!(UserId::parse(&identity).is_ok());
    }

    #[test]
    fn test_cli_parses_demo() {
        let cli = Cli::parse_from(["huddle", "demo", "--video", "--participants", "3"]);
        match cli.command {
            Commands::Demo {
                video,
                participants,
                hold_secs,
                reject,
            } => {
                assert!(video);
                assert!(!reject);
                assert_eq!(participants, 3);
                assert_eq!(hold_secs, 3);
            }
            _ => panic!("expected demo"),
        }
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let path = std::path::Path::new("/nonexistent/huddle.json");
        assert!(load_config(Some(path)).is_err());
        assert!(load_config(None).is_ok());
    }
}
