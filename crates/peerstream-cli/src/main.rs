//! PeerStream CLI - connect to an interactive video stream from the command line
//!
//! Drives a session controller against a rendezvous server and prints its events.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use peerstream_client::{SessionControllerBuilder, SessionEvent};
use peerstream_core::{Flag, NumericParam, Settings, StatsSnapshot, TextParam};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PeerStream - interactive video session client
#[derive(Parser)]
#[command(name = "peerstream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file path (TOML)
    #[arg(short, long, global = true, env = "PEERSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a rendezvous server and print session events
    Connect {
        /// Rendezvous server URL, overrides the `ss` setting
        #[arg(short, long, env = "PEERSTREAM_URL")]
        url: Option<String>,

        /// Preferred streamer id
        #[arg(short, long)]
        streamer: Option<String>,

        /// Only use relayed (TURN) candidates
        #[arg(long)]
        force_turn: bool,

        /// Print a line per statistics snapshot
        #[arg(long)]
        stats: bool,

        /// Run a latency test once the side channel opens
        #[arg(long)]
        latency_test: bool,

        /// Console command to send once the server permits it
        #[arg(long)]
        console: Vec<String>,

        /// Text for the streamer to echo back once the side channel opens
        #[arg(long)]
        echo: Option<String>,
    },

    /// Print the effective settings
    Settings,

    /// Show version info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs)?;

    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Connect {
            url,
            streamer,
            force_turn,
            stats,
            latency_test,
            console,
            echo,
        } => {
            if let Some(url) = url {
                settings.set_text(TextParam::SignallingServerUrl, url);
            }
            if let Some(streamer) = streamer {
                settings.set_text(TextParam::StreamerId, streamer);
            }
            if force_turn {
                settings.set_flag(Flag::ForceTurn, true);
            }
            let options = RunOptions {
                print_stats: stats,
                latency_test,
                console,
                echo,
            };
            run_session(settings, options).await?;
        }

        Commands::Settings => print_settings(&settings),

        Commands::Info => print_info(),
    }

    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::new());
    };
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let settings = Settings::from_toml_str(&document)
        .with_context(|| format!("Invalid settings file {}", path.display()))?;
    info!("Loaded settings from {}", path.display());
    Ok(settings)
}

struct RunOptions {
    print_stats: bool,
    latency_test: bool,
    console: Vec<String>,
    echo: Option<String>,
}

async fn run_session(settings: Settings, options: RunOptions) -> Result<()> {
    let url = settings.text(TextParam::SignallingServerUrl);
    println!(
        "{} Connecting to {}",
        "PEERSTREAM".cyan().bold(),
        url.yellow()
    );

    let auto_connect = settings.flag(Flag::AutoConnect);
    let (session, mut events) = SessionControllerBuilder::from_settings(settings)
        .start()
        .context("Failed to start session controller")?;
    if !auto_connect {
        session.connect().context("Controller stopped")?;
    }

    let mut console = options.console;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Controller stopped");
                    break;
                };
                match &event {
                    SessionEvent::StreamerList { ids, auto_selected: None } if !ids.is_empty() => {
                        println!(
                            "{} Streamers: {}",
                            "PEERSTREAM".cyan().bold(),
                            ids.join(", ")
                        );
                        println!("  selecting {}", ids[0].green());
                        session.select_streamer(ids[0].clone())?;
                    }
                    SessionEvent::DataChannelOpen => {
                        if options.latency_test {
                            session.request_latency_test()?;
                        }
                        if let Some(text) = &options.echo {
                            session.test_echo(text.clone())?;
                        }
                    }
                    SessionEvent::InitialSettings(initial) if initial.allows_console_commands() => {
                        for command in console.drain(..) {
                            session.emit_console_command(command)?;
                        }
                    }
                    _ => {}
                }
                if print_event(&event, options.print_stats) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                session.disconnect()?;
                wait_for_disconnect(&mut events).await;
                break;
            }
        }
    }

    Ok(())
}

async fn wait_for_disconnect(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
) {
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if print_event(&event, false) {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Timed out waiting for the session to close");
    }
}

/// Print one event, returning true once the session has ended
fn print_event(event: &SessionEvent, print_stats: bool) -> bool {
    let tag = "PEERSTREAM".cyan().bold();
    match event {
        SessionEvent::StateChanged(state) => {
            info!("State: {}", state);
        }
        SessionEvent::Connecting => println!("{} Opening rendezvous channel", tag),
        SessionEvent::AutoConnect => println!("{} Reconnecting", tag),
        SessionEvent::StreamerList {
            ids,
            auto_selected: Some(id),
        } => {
            println!("{} Streamers: {} (using {})", tag, ids.join(", "), id.green());
        }
        SessionEvent::StreamerList { ids, .. } if ids.is_empty() => {
            println!("{} No streamers available", tag.yellow());
        }
        SessionEvent::StreamerList { .. } => {}
        SessionEvent::SdpExchanged => println!("{} Answer sent", tag),
        SessionEvent::Connected => println!("{} {}", tag, "Connected".green().bold()),
        SessionEvent::StreamLoading => println!("{} Video track received", tag),
        SessionEvent::VideoInitialized => println!("{} Video playing", tag),
        SessionEvent::DataChannelOpen => println!("{} Side channel open", tag),
        SessionEvent::PlayerCount(count) => println!("{} Players: {}", tag, count),
        SessionEvent::InitialSettings(initial) => println!(
            "{} Initial settings received (console commands {})",
            tag,
            if initial.allows_console_commands() {
                "allowed".green()
            } else {
                "denied".red()
            }
        ),
        SessionEvent::QualityControlOwnership(owned) => {
            println!("{} Quality controller: {}", tag, owned)
        }
        SessionEvent::InputControlOwnership(owned) => {
            println!("{} Input controller: {}", tag, owned)
        }
        SessionEvent::VideoEncoderAvgQp(qp) => info!("Encoder average QP: {}", qp),
        SessionEvent::LatencyTest(results) => println!(
            "{} Latency: round trip {:.1} ms, streamer {:.1} ms, network {:.1} ms",
            tag, results.round_trip_ms, results.streamer_processing_ms, results.network_latency_ms
        ),
        SessionEvent::OnScreenKeyboard { show, .. } => {
            info!("On-screen keyboard requested: {}", show)
        }
        SessionEvent::Response(text) => println!("{} Response: {}", tag, text),
        SessionEvent::Stats(snapshot) => {
            if print_stats {
                print_stats_line(snapshot);
            }
        }
        SessionEvent::Failed { reason } => {
            println!("{} {}: {}", tag, "Failed".red().bold(), reason);
        }
        SessionEvent::Disconnected {
            reason, abnormal, ..
        } => {
            if *abnormal {
                println!("{} {}: {}", tag, "Disconnected".red().bold(), reason);
            } else {
                println!("{} Disconnected: {}", tag, reason);
            }
            return true;
        }
    }
    false
}

fn print_stats_line(snapshot: &StatsSnapshot) {
    let bitrate = snapshot
        .inbound_video_bitrate_kbps
        .map(|kbps| format!("{:.0} kbps", kbps))
        .unwrap_or_else(|| "-".to_string());
    let resolution = snapshot
        .inbound_video
        .as_ref()
        .and_then(|video| Some((video.frame_width?, video.frame_height?)))
        .map(|(w, h)| format!("{}x{}", w, h))
        .unwrap_or_else(|| "-".to_string());
    let fps = snapshot
        .inbound_video
        .as_ref()
        .and_then(|video| video.frames_per_second)
        .map(|fps| format!("{:.0}", fps))
        .unwrap_or_else(|| "-".to_string());
    let rtt = snapshot
        .candidate_pair
        .current_round_trip_time
        .map(|secs| format!("{:.0} ms", secs * 1000.0))
        .unwrap_or_else(|| "-".to_string());

    println!(
        "  {} video {} {} fps {} rtt {}",
        "stats".dimmed(),
        bitrate,
        resolution,
        fps,
        rtt
    );
}

fn print_settings(settings: &Settings) {
    println!("{}", "[flags]".bold());
    for flag in Flag::ALL {
        println!("{} = {}", flag, settings.flag(flag));
    }
    println!();
    println!("{}", "[numeric]".bold());
    for param in NumericParam::ALL {
        println!("{} = {}", param, settings.numeric(param));
    }
    println!();
    println!("{}", "[text]".bold());
    for param in TextParam::ALL {
        println!("{} = {:?}", param, settings.text(param));
    }
}

fn print_info() {
    println!("{}", "PeerStream".cyan().bold());
    println!("  Version: {}", env!("CARGO_PKG_VERSION"));
    println!("  Default reconnect delay: {} ms", peerstream_core::RECONNECT_DELAY_MS);
    println!("  Stats interval: {} ms", peerstream_core::STATS_INTERVAL_MS);
    println!(
        "  WebRTC peer sessions: {}",
        if cfg!(feature = "webrtc") {
            "enabled".green()
        } else {
            "disabled".red()
        }
    );
}
