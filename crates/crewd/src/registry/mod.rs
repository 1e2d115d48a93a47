//! Session registry using the Actor pattern.
//!
//! The registry is the single owner of session, team and timer state. Every
//! transport funnels hook payloads into it through a [`RegistryHandle`];
//! every change leaves it as a sequenced delta.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐                                ┌──────────────────┐
//! │ HTTP / queue │     RegistryCommand (mpsc)     │  RegistryActor   │
//! │   / socket   │───────────────────────────────▶│  resolve → apply │
//! └──────────────┘                                └──────────────────┘
//!         ▲                                          │          ▲
//!         │  ReplayEntry (broadcast)                 │          │ ToolTimeout,
//!         └──────────────────────────────────────────┘          │ RemoveEnded, ...
//!                                                    ┌──────────────────┐
//!                                                    │ timers / tickers │
//!                                                    └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::WeakSender;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::monitor::ProcessProbe;
use crate::terminal::TerminalDirectory;

mod actor;
mod commands;
mod handle;
mod resolver;
mod timers;

pub use actor::RegistryActor;
pub use commands::{
    IngestOutcome, RegistryCommand, RegistryConfig, RegistryError, Resolution, SessionPatch,
    SubscribeStart, Subscription,
};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 1024;

/// Spawns the registry actor plus its sweep tickers and returns a handle.
///
/// The actor stops once every [`RegistryHandle`] has been dropped; timers
/// and tickers only hold weak senders.
pub fn spawn_registry(
    config: RegistryConfig,
    probe: Arc<dyn ProcessProbe>,
    terminals: Arc<dyn TerminalDirectory>,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (delta_tx, _) = broadcast::channel(EVENT_BUFFER);

    spawn_ticker(cmd_tx.downgrade(), config.liveness_interval, "liveness", || {
        RegistryCommand::CheckLiveness
    });
    spawn_ticker(cmd_tx.downgrade(), config.auto_idle_interval, "auto-idle", || {
        RegistryCommand::AutoIdleSweep
    });
    spawn_ticker(
        cmd_tx.downgrade(),
        config.resume_expiry_interval,
        "resume-expiry",
        || RegistryCommand::ExpireResumes,
    );

    let actor = RegistryActor::new(cmd_rx, cmd_tx.downgrade(), delta_tx, probe, terminals, config);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx)
}

/// Sends `make()` every `period` until the registry is gone.
fn spawn_ticker<F>(sender: WeakSender<RegistryCommand>, period: Duration, name: &'static str, make: F)
where
    F: Fn() -> RegistryCommand + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(tx) = sender.upgrade() else {
                break;
            };
            if tx.send(make()).await.is_err() {
                break;
            }
        }
        debug!(ticker = name, "Sweep ticker stopping: registry gone");
    });
}
