//! Application contract and the multinode demo app.
//!
//! Applications implement [`App`]: `setup` runs once after the stack is
//! up, then `loop_step` runs on a ~1 ms cadence for the life of the
//! process.

use crate::runtime::Runtime;
use async_trait::async_trait;
use bm_stack::Neighbor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// The two-function application contract.
#[async_trait]
pub trait App: Send {
    /// Called once, after `stack initialized`.
    async fn setup(&mut self, runtime: &Runtime);

    /// Called repeatedly after [`App::setup`].
    async fn loop_step(&mut self, runtime: &Runtime);
}

/// Drive `app` forever.
pub async fn run(runtime: &Runtime, app: &mut dyn App) -> ! {
    app.setup(runtime).await;

    let mut cadence = tokio::time::interval(Duration::from_millis(1));
    cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        cadence.tick().await;
        app.loop_step(runtime).await;
    }
}

const TEST_TOPIC: &str = "bm_sbc/test";
const TEST_PAYLOAD: &[u8] = b"hello_from_multinode";
const STARTUP_DELAY: Duration = Duration::from_secs(3);

/// Validation app: watches discovery, subscribes to the shared topic, and
/// after a short delay sends one multicast echo request and publishes one
/// message. The interesting output (`NEIGHBOR_UP`, `PUBSUB_RX`,
/// `bcmp_seq=`) lands in the logs.
pub struct MultinodeApp {
    started: Option<Instant>,
    actions_done: bool,
    neighbors_up: Arc<AtomicUsize>,
    messages_seen: Arc<AtomicUsize>,
}

impl MultinodeApp {
    /// A fresh app instance.
    pub fn new() -> Self {
        Self {
            started: None,
            actions_done: false,
            neighbors_up: Arc::new(AtomicUsize::new(0)),
            messages_seen: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for MultinodeApp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl App for MultinodeApp {
    async fn setup(&mut self, runtime: &Runtime) {
        let neighbors_up = self.neighbors_up.clone();
        runtime
            .bcmp
            .register_discovery_callback(Arc::new(move |discovered: bool, neighbor: &Neighbor| {
                if discovered {
                    neighbors_up.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    "app: neighbor {:016x} on port {} {}",
                    neighbor.node_id,
                    neighbor.port,
                    if discovered { "up" } else { "down" }
                );
            }));

        let messages_seen = self.messages_seen.clone();
        runtime.pubsub.subscribe(
            TEST_TOPIC,
            Arc::new(move |src_node: u64, _topic: &str, payload: &[u8]| {
                messages_seen.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "app: message from {src_node:016x}: {}",
                    String::from_utf8_lossy(payload)
                );
            }),
        );

        self.started = Some(Instant::now());
        info!("multinode app: setup node={:016x}", runtime.node_id);
    }

    async fn loop_step(&mut self, runtime: &Runtime) {
        if self.actions_done {
            return;
        }
        let Some(started) = self.started else {
            return;
        };
        if started.elapsed() < STARTUP_DELAY {
            return;
        }
        self.actions_done = true;

        match runtime.bcmp.send_ping().await {
            Ok(seq) => debug!("app: multicast ping sent bcmp_seq={seq}"),
            Err(err) => debug!("app: multicast ping failed: {err}"),
        }
        if let Err(err) = runtime.pubsub.publish(TEST_TOPIC, TEST_PAYLOAD).await {
            debug!("app: publish failed: {err}");
        }
    }
}
