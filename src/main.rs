use anyhow::{Context, Result};
use clap::Parser;
use futures_util::stream;
use owo_colors::OwoColorize;
use std::sync::Arc;
use voicepipe::cli::{Cli, Commands, ConfigAction};
use voicepipe::collaborator::scripted::{
    Reply, ScriptedGenerator, ScriptedRecognizer, ScriptedSynthesizer,
};
use voicepipe::config::Config;
use voicepipe::pipeline::stage::StageHealth;
use voicepipe::pipeline::types::AudioChunk;
use voicepipe::{
    Collaborators, CollectorSink, Pipeline, PipelineConfig, PipelineHealth, run_session,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    voicepipe::logging::init(&config.logging)?;

    match cli.command {
        Commands::Check => handle_check(&config, cli.quiet)?,
        Commands::Config { action } => handle_config_command(action, &config, cli.config)?,
        Commands::Simulate {
            utterance,
            reply,
            barge_in,
        } => handle_simulate(&config, utterance, reply, barge_in, cli.quiet).await?,
    }

    Ok(())
}

fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        // Try default path, fall back to defaults
        Config::load_or_default(&Config::default_path()?)?
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}

fn handle_check(config: &Config, quiet: bool) -> Result<()> {
    config.validate().context("invalid configuration")?;
    config
        .validate_credentials()
        .context("collaborator credentials")?;
    if !quiet {
        println!("{}", "Configuration OK".green());
    }
    Ok(())
}

fn handle_config_command(
    action: ConfigAction,
    config: &Config,
    custom_path: Option<std::path::PathBuf>,
) -> Result<()> {
    match action {
        ConfigAction::Path => {
            let path = match custom_path {
                Some(path) => path,
                None => Config::default_path()?,
            };
            println!("{}", path.display());
        }
        ConfigAction::Show => {
            print!("{}", config.redacted().to_toml()?);
        }
    }
    Ok(())
}

async fn handle_simulate(
    config: &Config,
    utterances: Vec<String>,
    reply: Option<String>,
    barge_in: bool,
    quiet: bool,
) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let reply = reply.map(Reply::Fixed).unwrap_or(Reply::Echo);
    let collaborators = Collaborators {
        recognition: Arc::new(ScriptedRecognizer::new()),
        generation: Arc::new(ScriptedGenerator::new(reply)),
        synthesis: Arc::new(ScriptedSynthesizer::new()),
    };

    // Scripted utterances arrive back to back, faster than anyone speaks.
    let pipeline_config = PipelineConfig {
        barge_in,
        ..PipelineConfig::from_config(config)
    };

    let handle = Pipeline::new(pipeline_config, collaborators)?.start()?;
    let source = stream::iter(
        utterances
            .into_iter()
            .map(|u| AudioChunk::new(u.into_bytes())),
    );
    let mut sink = CollectorSink::new();
    let summary = run_session(handle, source, &mut sink).await?;

    println!("{}", String::from_utf8_lossy(&sink.bytes()));
    if !quiet {
        eprintln!(
            "{} chunks in, {} chunks out ({} bytes)",
            summary.chunks_fed, summary.chunks_played, summary.bytes_played
        );
        print_health(&summary.health);
    }
    Ok(())
}

fn print_health(health: &PipelineHealth) {
    for stage in &health.stages {
        match &stage.health {
            StageHealth::Healthy => {
                eprintln!("  {} {:<12} {}", "●".green(), stage.name, stage.state);
            }
            StageHealth::Degraded { reason } => {
                eprintln!(
                    "  {} {:<12} {} ({})",
                    "●".yellow(),
                    stage.name,
                    stage.state,
                    reason.yellow()
                );
            }
        }
    }
}
