use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chorus::config::{config_path, Config};
use chorus::engines::EngineSet;
use chorus::server::serve_http;
use chorus::{McpServer, ServerState};

/// Chorus - voice gateway for coding agents
#[derive(Parser)]
#[command(name = "chorus", version, about)]
struct Cli {
    /// Path to the config file (defaults to $CHORUS_CONFIG or the state dir)
    #[arg(short, long, env = "CHORUS_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load engines, synthesize one sentence, and report per-subsystem
    /// OK/FAILED
    Test,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,chorus=info",
        1 => "info,chorus=debug",
        2 => "debug",
        _ => "trace",
    };

    // stdout carries the JSON-RPC transport; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_file = cli.config.unwrap_or_else(config_path);
    let config = Config::load(&config_file);

    if let Some(Command::Test) = cli.command {
        return smoke_test(&config);
    }

    tracing::info!("starting chorus gateway");

    let engines = EngineSet::load(&config);
    let tts_ok = engines.tts.is_some();
    let stt_ok = engines.stt.is_some();
    if !tts_ok {
        tracing::warn!("TTS failed to load, running with STT only");
    }
    if !stt_ok {
        tracing::warn!("STT failed to load, running with TTS only");
    }

    let wake_at_boot = config.wake_word.enabled;
    let state = ServerState::init(config, config_file, engines)
        .map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;

    let entry = state.session_entry();
    tracing::info!(
        name = %entry.name,
        voice = %entry.voice,
        port = entry.port,
        tts = tts_ok,
        stt = stt_ok,
        "gateway ready"
    );

    // HTTP side-channel for siblings and push-to-talk.
    {
        let state = Arc::clone(&state);
        let port = entry.port;
        tokio::spawn(async move {
            if let Err(e) = serve_http(state, port).await {
                tracing::warn!(error = %e, port, "http side-channel failed");
            }
        });
    }

    let sweeper = state.spawn_sweeper();

    if wake_at_boot {
        match state.enable_wake() {
            Ok(model) => tracing::info!(model = %model, "wake word listener enabled"),
            Err(e) => tracing::warn!(error = %e, "wake word listener unavailable"),
        }
    }

    // Serve tool calls until stdin EOF or a termination signal.
    let server = McpServer::new(Arc::clone(&state));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = server.run(stdin, stdout) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "transport failed");
            } else {
                tracing::info!("stdin closed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        _ = sigterm.recv() => {
            tracing::info!("termination signal received");
        }
    }

    sweeper.abort();
    state.shutdown().await;
    Ok(())
}

/// Quick end-to-end check: load every engine, resolve a registry name,
/// synthesize a sentence, play it.
fn smoke_test(config: &Config) -> anyhow::Result<()> {
    use chorus::audio::{AudioLock, AudioSink};
    use chorus::config::audio_lock_path;
    use chorus::VoiceRegistry;

    tracing::info!("running smoke test");
    let engines = EngineSet::load(config);
    let mut results: Vec<String> = Vec::new();

    results.push(format!(
        "TTS: {}",
        if engines.tts.is_some() { "OK" } else { "FAILED" }
    ));
    results.push(format!(
        "STT: {}",
        if engines.stt.is_some() { "OK" } else { "FAILED" }
    ));
    results.push(format!(
        "VAD: {}",
        if engines.vad.is_some() { "OK" } else { "FAILED" }
    ));

    let mut registry = VoiceRegistry::new(&config.voice_registry);
    let (voice, _) = registry.resolve(&config.main_agent);
    results.push(format!("Registry: OK ({} -> {voice})", config.main_agent));

    if let Some(tts) = &engines.tts {
        match tts.synthesize(&voice, "Hello, this is a smoke test.", 1.0) {
            Ok(synthesis) => {
                results.push("Synthesis: OK".to_string());
                let sink =
                    AudioSink::new(&config.tts.audio_player, AudioLock::new(audio_lock_path()));
                match sink.play(&synthesis.samples, synthesis.sample_rate) {
                    Ok(_) => results.push("Playback: OK".to_string()),
                    Err(e) => results.push(format!("Playback: FAILED ({e})")),
                }
            }
            Err(e) => results.push(format!("Synthesis: FAILED ({e})")),
        }
    }

    eprintln!("{}", results.join("\n"));
    Ok(())
}
