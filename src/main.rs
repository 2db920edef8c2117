use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use tars_link::Config;
use tars_link::audio::{
    CaptureDevice, CpalCapture, CpalPlayback, PlaybackDevice, SoundBank, rms, wait_for_drain,
};
use tars_link::client::{ClientSession, ConnectionManager, EnergyTrigger};
use tars_link::protocol::AudioFrame;
use tars_link::server::{ConversationRunner, ElevenLabsTts, GeminiLive, LinkServer};
use tars_link::transport::WsConnector;

/// TARS - voice assistant link between an edge device and a conversation server
#[derive(Parser)]
#[command(name = "tars", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the standard location
    #[arg(short, long, global = true, env = "TARS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the conversation server
    Server {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the edge device client
    Client {
        /// Conversation server URL (ws:// or wss://)
        #[arg(short, long)]
        server_url: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,tars_link=info",
        1 => "info,tars_link=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Server { host, port } => run_server(config, host, port).await,
        Command::Client { server_url } => run_client(config, server_url).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestSpeaker => test_speaker(&config).await,
    }
}

/// Run the conversation server until interrupted
async fn run_server(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let engine = Arc::new(GeminiLive::new(
        config.server.gemini.clone(),
        config.audio.sample_rate,
    )?);
    let tts = Arc::new(ElevenLabsTts::new(config.server.elevenlabs.clone())?);

    let (runner, handle) = ConversationRunner::new(&config.server, engine, tts);

    // Set up shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let runner_task = tokio::spawn(runner.run(shutdown_rx.clone()));

    let server = LinkServer::new(handle, config.server.host.clone(), config.server.port);
    let listener = server.bind().await?;

    tracing::info!(
        model = %config.server.gemini.model,
        voice = %config.server.elevenlabs.voice_id,
        "TARS server ready"
    );

    let mut signal_rx = shutdown_rx;
    server
        .run(listener, async move {
            let _ = signal_rx.wait_for(|stop| *stop).await;
        })
        .await?;

    let _ = runner_task.await;
    Ok(())
}

/// Run the edge client on this thread until interrupted
#[allow(clippy::future_not_send)]
async fn run_client(mut config: Config, server_url: Option<String>) -> anyhow::Result<()> {
    if let Some(url) = server_url {
        config.client.server_url = url;
    }

    let connector = Arc::new(WsConnector::new(&config.client.server_url)?);
    let connection = ConnectionManager::new(connector, &config.client);

    let capture = CpalCapture::new(&config.audio)?;
    let playback = CpalPlayback::new(&config.audio)?;
    let detector = EnergyTrigger::new(config.client.wake.clone(), config.audio.sample_rate);

    let mut session = ClientSession::new(
        &config.client,
        connection,
        Box::new(capture),
        Box::new(playback),
        Box::new(detector),
    )?;

    if let Some(dir) = &config.client.acknowledgement_dir {
        match SoundBank::load(dir, config.audio.sample_rate) {
            Ok(sounds) => {
                tracing::info!(count = sounds.len(), dir = %dir.display(), "loaded acknowledgement sounds");
                session = session.with_sounds(sounds);
            }
            Err(e) => tracing::warn!(error = %e, "acknowledgement sounds unavailable"),
        }
    }

    // Set up shutdown signal
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    tracing::info!(server = %config.client.server_url, "TARS client ready");
    session.run(&mut shutdown_rx).await?;

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = CpalCapture::new(&config.audio)?;
    let (tx, mut rx) = mpsc::channel(256);
    capture.start_capture(tx)?;

    println!("Sample rate: {} Hz", config.audio.sample_rate);
    println!("---");

    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut samples = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            samples.extend(frame.samples());
        }

        let energy = rms(&samples);
        let peak = samples
            .iter()
            .map(|s| f32::from(s.unsigned_abs()) / 32768.0)
            .fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop_capture();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Set TARS_HOTWORD_THRESHOLD just below your speaking RMS");

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut playback = CpalPlayback::new(&config.audio)?;

    let sample_rate = config.audio.sample_rate;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let samples: Vec<i16> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            ((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 * 32767.0) as i16
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    for chunk in samples.chunks(config.audio.block_size.max(1)) {
        playback.enqueue(AudioFrame::from_samples(chunk))?;
    }
    wait_for_drain(&playback, Duration::from_millis(50)).await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: aplay -l (to list devices)");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}
