//! Chorus Audio Player (chorus-ap) - command-line driver
//!
//! Plays each given source (and every `[[groups]]` entry of the config file)
//! through a group on the simulated device, logs engine and group
//! notifications, then terminates the engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chorus_ap::{
    ChorusConfig, Engine, EngineEvent, Group, GroupConfig, GroupEvent, SimulatedBackend,
    SpriteRegion,
};

/// Command-line arguments for chorus-ap
#[derive(Parser, Debug)]
#[command(name = "chorus-ap")]
#[command(about = "Play sounds through the Chorus engine on a simulated device")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,

    /// Sources to play (paths, file:// or data: URIs)
    sources: Vec<String>,

    /// Sprite region for the given sources, as label=start:end (seconds)
    #[arg(long = "sprite", value_parser = parse_sprite)]
    sprites: Vec<(String, SpriteRegion)>,

    /// Play this sprite label instead of the whole buffer
    #[arg(long)]
    play_sprite: Option<String>,

    /// Loop the given sources
    #[arg(long = "loop")]
    looping: bool,

    /// Volume of the given sources (0.0 - 1.0)
    #[arg(long, default_value = "1.0")]
    volume: f32,

    /// Give up waiting for playback to end after this many seconds
    #[arg(long, default_value = "30")]
    max_seconds: u64,
}

fn parse_sprite(arg: &str) -> std::result::Result<(String, SpriteRegion), String> {
    let (label, range) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected label=start:end, got '{}'", arg))?;
    let (start, end) = range
        .split_once(':')
        .ok_or_else(|| format!("expected start:end, got '{}'", range))?;
    let start: f64 = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid start '{}': {}", start, e))?;
    let end: f64 = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid end '{}': {}", end, e))?;
    Ok((label.trim().to_string(), SpriteRegion::new(start, end)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus_ap=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ChorusConfig::resolve(args.config.as_deref())
        .context("Failed to load configuration")?;

    let mut group_configs = config.groups.clone();
    for source in &args.sources {
        let mut group = GroupConfig::new(source.clone())
            .with_loop(args.looping)
            .with_volume(args.volume);
        for (label, region) in &args.sprites {
            group = group.with_sprite(label.clone(), *region);
        }
        group_configs.push(group);
    }
    if group_configs.is_empty() {
        bail!("Nothing to play: pass sources or configure [[groups]]");
    }

    info!("Starting Chorus Audio Player with {} group(s)", group_configs.len());

    let engine = Engine::new(Arc::new(SimulatedBackend::new()));
    engine.setup(&config.engine);
    tokio::spawn(log_engine_events(engine.subscribe()));

    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
    let mut groups = Vec::new();
    let mut expected = 0usize;
    for group_config in group_configs {
        let (group, events) =
            Group::with_receiver(&engine, group_config).context("Invalid group configuration")?;
        tokio::spawn(log_group_events(group.id().to_string(), events, finished_tx.clone()));

        let started = match &args.play_sprite {
            Some(label) => group.play_sprite(label).is_some(),
            None => {
                group.play();
                true
            }
        };
        if started {
            expected += 1;
        }
        groups.push(group);
    }
    drop(finished_tx);

    let wait = Duration::from_secs(args.max_seconds);
    let finished = tokio::time::timeout(wait, async {
        let mut seen = 0;
        while seen < expected && finished_rx.recv().await.is_some() {
            seen += 1;
        }
    })
    .await;
    if finished.is_err() {
        warn!("Playback still running after {}s; stopping", args.max_seconds);
    }

    let mut engine_events = engine.subscribe();
    for group in &groups {
        group.destroy();
    }
    engine.terminate();
    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match engine_events.recv().await {
                Ok(EngineEvent::Done) | Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }
    })
    .await;
    if done.is_err() {
        warn!("Engine did not report completion of terminate");
    }

    info!("Chorus Audio Player finished");
    Ok(())
}

async fn log_engine_events(mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Error { kind, message }) => {
                warn!("Engine error ({:?}): {}", kind, message)
            }
            Ok(event) => info!("Engine: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Engine log lagged by {}", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Log a group's notifications; report each finished or failed playback
async fn log_group_events(
    group: String,
    mut events: broadcast::Receiver<GroupEvent>,
    finished: mpsc::UnboundedSender<()>,
) {
    loop {
        match events.recv().await {
            Ok(GroupEvent::Error {
                kind,
                message,
                sound,
            }) => {
                warn!("Group {} error ({:?}, sound {:?}): {}", group, kind, sound, message);
                let _ = finished.send(());
            }
            Ok(event @ GroupEvent::PlayEnd { .. }) => {
                info!("Group {}: {:?}", group, event);
                let _ = finished.send(());
            }
            Ok(event) => info!("Group {}: {:?}", group, event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Group {} log lagged by {}", group, n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
