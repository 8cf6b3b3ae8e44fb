//! Pipeline stages
//!
//! ```text
//! source ─► knobs ─► flood ─► mapper ─► reducer ─► pusher ─► sink
//!   KnobUpdate  FloodVector  TaggedEvent  CountVector  DeviceConfig
//! ```
//!
//! Each stage is a [`deluge_core::MessageHandler`] for its input
//! subscription plus, where it has one, a periodic task spawned with
//! [`every`]. Stages share nothing but the bus.

pub mod flood;
pub mod knobs;
pub mod mapper;
pub mod pusher;
pub mod reducer;
pub mod source;

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Spawn a task that runs `tick` every `period` until `shutdown` flips
///
/// The first run happens one full period after spawning. A slow tick
/// delays the next one rather than bunching missed ticks together.
pub fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = name, period_ms = period.as_millis() as u64, "periodic task started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => tick().await,
            }
        }
        debug!(task = name, "periodic task stopped");
    })
}
