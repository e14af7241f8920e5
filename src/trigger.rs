// Trigger event sources. Each implementation feeds debounced press
// events into an mpsc channel; the orchestrator's run loop consumes
// them one at a time.

use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{TriggerConfig, TriggerKind};

/// One physical press, after debouncing.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEvent {
    pub pressed_at: DateTime<Utc>,
}

impl TriggerEvent {
    fn now() -> Self {
        Self {
            pressed_at: Utc::now(),
        }
    }
}

const CHANNEL_CAPACITY: usize = 8;

/// Start the configured trigger source and return the event channel.
pub fn spawn_trigger_source(config: &TriggerConfig) -> mpsc::Receiver<TriggerEvent> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    match config.source {
        TriggerKind::Stdin => {
            info!("Trigger source: stdin (one event per line)");
            tokio::spawn(stdin_loop(tx));
        }
        TriggerKind::Gpio => {
            info!(
                chip = %config.gpio_chip,
                line = config.gpio_line,
                "Trigger source: GPIO edge monitor"
            );
            let config = config.clone();
            tokio::spawn(gpio_loop(config, tx));
        }
    }

    rx
}

async fn stdin_loop(tx: mpsc::Sender<TriggerEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(_)) => {
                if tx.send(TriggerEvent::now()).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("stdin closed, trigger source stopping");
                break;
            }
            Err(e) => {
                error!(error = %e, "stdin trigger read failed");
                break;
            }
        }
    }
}

/// Watch a GPIO line for falling edges via the `gpiomon` CLI, one
/// stdout line per edge.
async fn gpio_loop(config: TriggerConfig, tx: mpsc::Sender<TriggerEvent>) {
    let line = config.gpio_line.to_string();
    let child = tokio::process::Command::new("gpiomon")
        .args(["--edges", "falling", &config.gpio_chip, &line])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "failed to start gpiomon; button will not work");
            return;
        }
    };

    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            error!("gpiomon spawned without stdout");
            return;
        }
    };

    let debounce = config.debounce();
    let mut last_accepted: Option<Instant> = None;
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(_edge)) = lines.next_line().await {
        if !accept_edge(&mut last_accepted, Instant::now(), debounce) {
            debug!("edge within debounce window, ignored");
            continue;
        }
        if tx.send(TriggerEvent::now()).await.is_err() {
            break;
        }
    }

    warn!("gpiomon stream ended, trigger source stopping");
    let _ = child.kill().await;
}

/// Software debounce: accept an edge only when it falls outside the
/// debounce window of the previously accepted one.
fn accept_edge(last_accepted: &mut Option<Instant>, now: Instant, window: Duration) -> bool {
    if let Some(last) = *last_accepted {
        if now.duration_since(last) < window {
            return false;
        }
    }
    *last_accepted = Some(now);
    true
}
