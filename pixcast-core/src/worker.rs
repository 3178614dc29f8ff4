//! Encode-context workers.
//!
//! Every window gets its own lane: a blocking task that owns the
//! window's [`WindowEncoder`] and processes its [`WorkItem`]s strictly in
//! order. Lanes of different windows run in parallel. Finished
//! [`EncodeOutcome`]s come back on a single channel the service drains.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::engine::WindowEncodeEngine;
use crate::pipeline::CodecRegistry;
use crate::types::WindowId;
use crate::window::{EncodeOutcome, WindowEncoder, WorkItem};

/// Completion channel capacity.
const DONE_CAPACITY: usize = 1024;

pub type OutcomeReceiver = mpsc::Receiver<EncodeOutcome>;

struct Lane {
    tx: mpsc::UnboundedSender<WorkItem>,
    handle: JoinHandle<()>,
}

pub struct EncodeWorkers {
    registry: Arc<dyn CodecRegistry>,
    lanes: HashMap<WindowId, Lane>,
    done_tx: mpsc::Sender<EncodeOutcome>,
}

impl EncodeWorkers {
    /// Create the pool and the receiver its outcomes arrive on.
    pub fn new(registry: Arc<dyn CodecRegistry>) -> (Self, OutcomeReceiver) {
        let (done_tx, done_rx) = mpsc::channel(DONE_CAPACITY);
        (
            Self {
                registry,
                lanes: HashMap::new(),
                done_tx,
            },
            done_rx,
        )
    }

    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Route work items to their window's lane, starting lanes on demand.
    pub fn dispatch(&mut self, engine: &WindowEncodeEngine, items: Vec<WorkItem>) {
        for item in items {
            let id = item.window();
            let closing = matches!(item, WorkItem::Close { .. });
            if !self.lanes.contains_key(&id) {
                if closing {
                    continue;
                }
                match engine.create_encoder(id, Arc::clone(&self.registry)) {
                    Ok(encoder) => {
                        self.lanes.insert(id, self.spawn_lane(encoder));
                    }
                    Err(e) => {
                        trace!(window = id, error = %e, "dropping work for a window without state");
                        continue;
                    }
                }
            }
            let Some(lane) = self.lanes.get(&id) else {
                continue;
            };
            if lane.tx.send(item).is_err() {
                warn!(window = id, "encode lane stopped, restarting it");
                self.lanes.remove(&id);
                continue;
            }
            if closing {
                // the lane exits after the close item; keep the handle detached
                self.lanes.remove(&id);
            }
        }
    }

    fn spawn_lane(&self, mut encoder: WindowEncoder) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkItem>();
        let done_tx = self.done_tx.clone();
        let window = encoder.window();
        debug!(window, "encode lane started");
        let handle = tokio::task::spawn_blocking(move || {
            while let Some(item) = rx.blocking_recv() {
                let closing = matches!(item, WorkItem::Close { .. });
                let outcome = encoder.process(item);
                if done_tx.blocking_send(outcome).is_err() || closing {
                    break;
                }
            }
            debug!(window, "encode lane stopped");
        });
        Lane { tx, handle }
    }

    /// Close every lane and wait for the running encodes to finish.
    pub async fn shutdown(&mut self) {
        let handles: Vec<JoinHandle<()>> = self
            .lanes
            .drain()
            .map(|(_, lane)| {
                drop(lane.tx);
                lane.handle
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "encode lane panicked");
            }
        }
    }
}

impl std::fmt::Debug for EncodeWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeWorkers").field("lanes", &self.lanes.len()).finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::batch::DamageOptions;
    use crate::codec::BuiltinRegistry;
    use crate::config::EngineConfig;
    use crate::encoding::{ClientCapabilities, Encoding, WindowFlags};
    use crate::engine::CaptureBackend;
    use crate::error::CaptureError;
    use crate::region::Rectangle;
    use crate::types::{ImageBuffer, PixelFormat};

    struct Grey;

    impl CaptureBackend for Grey {
        fn get_pixels(&mut self, _window: WindowId, rect: Rectangle) -> Result<ImageBuffer, CaptureError> {
            let data = vec![0x40; rect.area() as usize * 4];
            Ok(ImageBuffer::new(rect, rect.width * 4, PixelFormat::Bgrx, data, Instant::now()))
        }
    }

    fn rgb_engine() -> WindowEncodeEngine {
        let mut config = EngineConfig::default();
        config.batch.start_delay_ms = 5;
        let caps = ClientCapabilities {
            encodings: vec![Encoding::Rgb24, Encoding::Rgb32],
            ..Default::default()
        };
        WindowEncodeEngine::new(config, caps, Box::new(Grey))
    }

    #[tokio::test]
    async fn lanes_return_outcomes_in_order() {
        let mut engine = rgb_engine();
        let now = Instant::now();
        engine.add_window(1, 32, 32, WindowFlags::empty(), now).unwrap();
        let (mut workers, mut done) = EncodeWorkers::new(Arc::new(BuiltinRegistry));

        engine.damage(1, Rectangle::new(0, 0, 8, 8), DamageOptions::default(), now).unwrap();
        engine.damage(1, Rectangle::new(8, 8, 8, 8), DamageOptions::default(), now).unwrap();
        let work = engine.take_work();
        assert_eq!(work.len(), 2);
        workers.dispatch(&engine, work);
        assert_eq!(workers.lanes(), 1);

        let first = tokio::time::timeout(Duration::from_secs(5), done.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), done.recv()).await.unwrap().unwrap();
        assert!(first.sequence < second.sequence);
        assert_eq!(first.packets.len(), 1);
        assert_eq!(first.packets[0].encoding, Encoding::Rgb24);

        workers.shutdown().await;
        assert_eq!(workers.lanes(), 0);
    }

    #[tokio::test]
    async fn close_retires_the_lane() {
        let mut engine = rgb_engine();
        let now = Instant::now();
        engine.add_window(3, 16, 16, WindowFlags::empty(), now).unwrap();
        let (mut workers, mut done) = EncodeWorkers::new(Arc::new(BuiltinRegistry));
        engine.damage(3, Rectangle::sized(16, 16), DamageOptions::default(), now).unwrap();
        let work = engine.take_work();
        workers.dispatch(&engine, work);
        assert_eq!(workers.lanes(), 1);

        engine.remove_window(3).unwrap();
        let work = engine.take_work();
        workers.dispatch(&engine, work);
        assert_eq!(workers.lanes(), 0);
        // the encode and the close both report back
        let a = tokio::time::timeout(Duration::from_secs(5), done.recv()).await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(5), done.recv()).await.unwrap();
        assert!(a.is_some() && b.is_some());
    }

    #[test]
    fn shutdown_without_lanes() {
        let (mut workers, _done) = EncodeWorkers::new(Arc::new(BuiltinRegistry));
        tokio_test::block_on(workers.shutdown());
        assert_eq!(workers.lanes(), 0);
    }
}
