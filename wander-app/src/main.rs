//! WanderAI voice host entry point.
//!
//! A headless front end for `wander-core`: press Enter to start or stop the
//! voice session, `status` for counters, `q` to quit.
//!
//! ```text
//! wander-voice                # interactive session
//! wander-voice devices        # list input/output devices
//! wander-voice init-settings  # write a settings file with defaults
//! ```

mod settings;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use wander_core::{
    audio::device::{list_devices, DeviceDirection},
    ipc::events::PlaybackEventKind,
    SessionState, VoiceEngine,
};

use settings::{default_settings_path, load_settings, resolve_api_key, save_settings};

/// Log one volume event out of this many.
const VOLUME_LOG_EVERY: u64 = 8;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wander=info")),
        )
        .init();

    let settings_path = default_settings_path();
    match std::env::args().nth(1).as_deref() {
        Some("devices") => {
            print_devices();
            return Ok(());
        }
        Some("init-settings") => {
            let settings = load_settings(&settings_path);
            save_settings(&settings_path, &settings)
                .with_context(|| format!("writing {}", settings_path.display()))?;
            println!("settings written to {}", settings_path.display());
            return Ok(());
        }
        Some(other) => bail!("unknown command '{other}' (expected 'devices' or 'init-settings')"),
        None => {}
    }

    info!("WanderAI voice starting");
    let settings = load_settings(&settings_path);
    info!(path = %settings_path.display(), "settings loaded");

    let Some(api_key) = resolve_api_key(&settings) else {
        bail!(
            "no API key: set GEMINI_API_KEY or add \"apiKey\" to {}",
            settings_path.display()
        );
    };

    let engine = VoiceEngine::start(settings.voice_config(api_key));
    spawn_event_logging(&engine);

    println!("Press Enter to talk to WanderAI (Enter again to stop, 'q' to quit).");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {
                if engine.status().is_live() {
                    println!("stopping...");
                }
                engine.toggle()?;
            }
            "q" | "quit" | "exit" => break,
            "status" => {
                println!("state: {:?}", engine.status());
                if let Some(error) = engine.last_error() {
                    println!("last error: {error}");
                }
                println!("{:#?}", engine.diagnostics_snapshot());
            }
            "devices" => print_devices(),
            other => println!("unknown input '{other}'"),
        }
    }

    engine.shutdown().await;
    info!("WanderAI voice stopped");
    Ok(())
}

fn spawn_event_logging(engine: &VoiceEngine) {
    let mut status = engine.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => {
                    match event.status {
                        SessionState::Connected => println!("● listening"),
                        SessionState::Disconnected => println!("○ disconnected"),
                        SessionState::Error => {
                            println!("✕ {}", event.detail.as_deref().unwrap_or("error"))
                        }
                        SessionState::Connecting => println!("… connecting"),
                    }
                    info!(status = ?event.status, detail = ?event.detail, "session status");
                }
                Err(RecvError::Lagged(n)) => warn!("status listener lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut volume = engine.subscribe_volume();
    tokio::spawn(async move {
        loop {
            match volume.recv().await {
                Ok(event) if event.seq % VOLUME_LOG_EVERY == 0 => {
                    debug!(level = event.level, "mic volume");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut playback = engine.subscribe_playback();
    tokio::spawn(async move {
        loop {
            match playback.recv().await {
                Ok(event) => match event.kind {
                    PlaybackEventKind::Interrupted => info!("model interrupted"),
                    PlaybackEventKind::TurnComplete => {
                        debug!(active = event.active_buffers, "model turn complete")
                    }
                    PlaybackEventKind::Scheduled => {
                        debug!(start = ?event.start_time, active = event.active_buffers, "audio scheduled")
                    }
                },
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn print_devices() {
    let devices = list_devices();
    if devices.is_empty() {
        println!("no audio devices found");
        return;
    }
    for direction in [DeviceDirection::Input, DeviceDirection::Output] {
        println!("{direction:?} devices:");
        for device in devices.iter().filter(|d| d.direction == direction) {
            let mut tags = Vec::new();
            if device.is_default {
                tags.push("default");
            }
            if device.is_recommended {
                tags.push("recommended");
            }
            if device.is_loopback_like {
                tags.push("loopback?");
            }
            if tags.is_empty() {
                println!("  {}", device.name);
            } else {
                println!("  {} [{}]", device.name, tags.join(", "));
            }
        }
    }
}
