//! Application entry point: live voice device check.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Create a current-thread [`tokio`] runtime.
//! 4. Start a session against the in-process loopback channel: microphone
//!    audio goes up as 16 kHz PCM16 and comes back as 24 kHz speech.
//! 5. Log connection status and the visualizer level until Ctrl-C or until
//!    the session ends.

use anyhow::{Context, Result};
use futures::StreamExt;
use voice_live::{
    audio::{CpalCapture, CpalOutput},
    config::AppConfig,
    pipeline::{SessionHandle, SessionManager},
    transport::LoopbackChannel,
};

fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-live starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });
    if AppConfig::is_first_run() {
        if let Err(e) = config.save() {
            log::warn!("Could not write default settings: {e}");
        }
    }

    // 3. Tokio runtime (the session is a single cooperative task)
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(run(config))
}

async fn run(config: AppConfig) -> Result<()> {
    // 4. Session
    let manager = SessionManager::new(config.clone());
    let mut session = manager
        .start(
            Box::new(CpalCapture::new(
                config.audio.input_device.clone(),
                config.audio.block_size,
            )),
            Box::new(LoopbackChannel::new()),
            Box::new(CpalOutput::new(config.audio.output_device.clone())),
        )
        .await
        .map_err(|e| {
            log::error!("{}", e.user_message());
            e
        })
        .context("failed to start session")?;

    // 5. Monitor until Ctrl-C or session end
    tokio::select! {
        _ = monitor(&session) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::warn!("Ctrl-C handler failed: {e}");
            }
            log::info!("Ctrl-C received, stopping");
        }
    }

    session.stop().await;
    let status = session.status().borrow().clone();
    log::info!(
        "Session summary: {} frames sent, {} chunks played, {} dropped, {} interruption(s)",
        status.stats.frames_sent,
        status.stats.chunks_decoded,
        status.stats.chunks_dropped + status.stats.capture_blocks_dropped,
        status.stats.interruptions,
    );
    if let Some(message) = status.message {
        anyhow::bail!(message);
    }
    Ok(())
}

/// Log status changes and roughly one visualizer level per second.  Returns
/// when the session reaches a terminal state.
async fn monitor(session: &SessionHandle) {
    let mut status = session.status();
    let mut frames = Box::pin(session.visualizer().subscribe());
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = status.borrow_and_update().clone();
                log::debug!("status: {:?}", snapshot);
                if snapshot.state.is_terminal() {
                    log::info!("Session {}", snapshot.state.label());
                    return;
                }
            }
            Some(frame) = frames.next() => {
                tick += 1;
                if tick % 60 == 0 {
                    log::info!("mic level {:.2}  peak bin {:.2}", frame.level, frame.peak());
                }
            }
        }
    }
}
