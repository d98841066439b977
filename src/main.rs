use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waav_speaker::{ClientConfig, SpeakOutcome, TtsSession};

/// How often `say` checks whether playback has gone quiet.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// WaaV Speaker - streaming text-to-speech playback client
#[derive(Parser, Debug)]
#[command(name = "waav-speaker")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Speak one utterance and exit once playback goes quiet
    Say {
        /// Text to speak
        text: String,
    },

    /// Speak each line typed on stdin, interrupting the previous one
    ///
    /// Commands: /mute, /unmute, /quit
    Interactive,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing (RUST_LOG overrides the default level)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    // Load configuration from file or environment
    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        ClientConfig::from_file(&config_path)?
    } else {
        ClientConfig::from_env()?
    };

    let session = TtsSession::new(config);
    session.initialize_from_config().await?;

    let result = match cli.command {
        Commands::Say { text } => say(&session, &text).await,
        Commands::Interactive => interactive(&session).await,
    };

    session.shutdown().await;
    result
}

async fn say(session: &TtsSession, text: &str) -> anyhow::Result<()> {
    match session.speak(text).await? {
        SpeakOutcome::Sent => {}
        other => anyhow::bail!("Nothing to speak ({other:?})"),
    }

    let linger = session.config().linger();
    let mut played = session.chunks_played();
    let mut quiet_since = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {}
        }

        let now_played = session.chunks_played();
        if now_played != played || session.buffered_chunks() > 0 {
            played = now_played;
            quiet_since = Instant::now();
            continue;
        }
        if !session.is_ready() {
            warn!("Synthesis connection ended before playback finished");
            return Ok(());
        }
        if quiet_since.elapsed() >= linger {
            return Ok(());
        }
    }
}

async fn interactive(session: &TtsSession) -> anyhow::Result<()> {
    println!("Type text to speak. Commands: /mute, /unmute, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        match line.trim() {
            "/quit" => break,
            "/mute" => session.set_speaking_enabled(false),
            "/unmute" => session.set_speaking_enabled(true),
            text => match session.speak(text).await? {
                SpeakOutcome::Sent | SpeakOutcome::Empty => {}
                SpeakOutcome::Muted => println!("(muted - /unmute to speak)"),
                SpeakOutcome::NotConnected => {
                    println!("Connection lost, reconnecting...");
                    session.initialize_from_config().await?;
                    session.speak(text).await?;
                }
            },
        }
    }
    Ok(())
}
