//! Demo session: the engine driven by a synthetic display and client.
//!
//! Wires together everything a real host would have:
//!
//! 1. A [`SyntheticDisplay`] that changes at `demo.fps` and reports damage.
//! 2. An [`EngineService`] with the [`SimulatedRegistry`] codecs.
//! 3. A simulated client that "decodes" every packet (paying latency,
//!    bandwidth and per-pixel decode cost) and acks it.
//!
//! Statistics are logged periodically and once more at the end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use pixcast_core::{
    ClientCapabilities, DecodeResult, DrawPacket, EngineError, EngineHandle, EngineService, Statistics,
    WindowEncodeEngine,
};

use crate::codecs::SimulatedRegistry;
use crate::config::{ServerConfig, SessionConfig};
use crate::display::SyntheticDisplay;

const PACKET_CAPACITY: usize = 1024;

// ── DemoSession ──────────────────────────────────────────────────

/// The top-level host.
pub struct DemoSession {
    config: ServerConfig,
    caps: ClientCapabilities,
    running: Arc<AtomicBool>,
}

impl DemoSession {
    /// Fails when the session lists an encoding the engine does not know.
    pub fn new(config: ServerConfig) -> Result<Self, EngineError> {
        let caps = config.capabilities()?;
        Ok(Self {
            config,
            caps,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A cloneable handle that can be used to stop the session from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run until stopped or until `demo.duration_secs` elapsed.
    ///
    /// Returns the last statistics snapshot.
    pub async fn run(&self) -> Result<Statistics, EngineError> {
        self.running.store(true, Ordering::SeqCst);
        let demo = &self.config.demo;

        let display = SyntheticDisplay::new();
        for w in &demo.windows {
            display.add_window(w.id, w.width, w.height, w.content);
        }

        let engine = WindowEncodeEngine::new(self.config.engine.clone(), self.caps.clone(), Box::new(display.clone()));
        let registry = Arc::new(SimulatedRegistry::new(demo.video_lookahead));
        let (packets_tx, packets_rx) = mpsc::channel(PACKET_CAPACITY);
        let (mut engine_svc, handle) = EngineService::new(engine, registry, packets_tx);
        let engine_running = engine_svc.stop_handle();
        let engine_task = tokio::spawn(async move { engine_svc.run().await });

        for w in &demo.windows {
            handle.add_window(w.id, w.width, w.height, w.flags()).await?;
            info!(window = w.id, width = w.width, height = w.height, content = ?w.content, "window mapped");
        }

        let client_task = tokio::spawn(simulated_client(packets_rx, handle.clone(), self.config.session.clone()));

        let started = Instant::now();
        let deadline = (demo.duration_secs > 0).then(|| started + Duration::from_secs(demo.duration_secs));
        let mut frames = tokio::time::interval(Duration::from_secs_f64(1.0 / demo.fps.max(1) as f64));
        frames.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut report = tokio::time::interval(Duration::from_secs(demo.stats_interval_secs.max(1)));
        report.tick().await;

        info!(fps = demo.fps, windows = demo.windows.len(), "demo session running");
        while self.running.load(Ordering::SeqCst) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("demo duration reached");
                break;
            }
            tokio::select! {
                _ = frames.tick() => {
                    for (id, rect) in display.tick() {
                        handle.damage(id, rect).await?;
                    }
                }
                _ = report.tick() => {
                    match handle.statistics().await {
                        Ok(stats) => log_statistics(&stats),
                        Err(e) => warn!(error = %e, "statistics unavailable"),
                    }
                }
            }
        }

        let stats = handle.statistics().await?;
        log_statistics(&stats);

        engine_running.store(false, Ordering::SeqCst);
        drop(handle);
        match engine_task.await {
            Ok(Err(e)) => error!(error = %e, "engine service error"),
            Err(e) => error!(error = %e, "engine task panicked"),
            Ok(Ok(())) => {}
        }
        if let Err(e) = client_task.await {
            error!(error = %e, "client task panicked");
        }

        self.running.store(false, Ordering::SeqCst);
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "demo session stopped");
        Ok(stats)
    }

    /// Signal the session to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the session is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ── Simulated client ─────────────────────────────────────────────

/// Time the client needs before it can ack `packet`.
fn decode_cost(packet: &DrawPacket, session: &SessionConfig) -> Duration {
    let decode_us = packet.pixel_count() * session.decode_ms_per_mpixel * 1000 / 1_000_000;
    let transfer_us = match session.bandwidth_mbps {
        0 => 0,
        mbps => packet.payload.len() as u64 * 8 / mbps,
    };
    Duration::from_micros(decode_us + transfer_us)
}

/// Decodes packets one at a time, like a client with a single paint
/// thread, and acks each one after the network round trip.
async fn simulated_client(mut packets: mpsc::Receiver<DrawPacket>, handle: EngineHandle, session: SessionConfig) {
    let round_trip = Duration::from_millis(session.latency_ms * 2);
    while let Some(packet) = packets.recv().await {
        let cost = decode_cost(&packet, &session);
        tokio::time::sleep(cost).await;
        debug!(
            window = packet.window_id,
            sequence = packet.sequence,
            encoding = %packet.encoding,
            bytes = packet.payload.len(),
            decode_us = cost.as_micros() as u64,
            "client decoded packet"
        );
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(round_trip).await;
            // the engine may already be gone at shutdown
            let _ = handle.ack(&packet, DecodeResult::Decoded(cost)).await;
        });
    }
    debug!("packet channel closed, client done");
}

fn log_statistics(stats: &Statistics) {
    info!(
        damage = stats.damage_events,
        packets = stats.packets_sent,
        latency_ms = stats.avg_client_latency_ms,
        congestion = stats.congestion,
        throughput_kbps = stats.throughput_bps / 1000,
        queue = stats.encode_queue,
        buffers = stats.live_buffers,
        "engine statistics"
    );
    for w in &stats.windows {
        info!(
            window = w.window,
            encoding = ?w.encoding,
            delay_ms = w.batch_delay_ms,
            quality = w.quality,
            speed = w.speed,
            packets = w.packets_sent,
            kbytes = w.bytes_sent / 1024,
            pending = w.packets_pending,
            "window statistics"
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pixcast_core::{CodecOptions, Encoding};

    use super::*;
    use crate::config::{Content, DemoWindow};

    fn packet(width: u32, height: u32, bytes: usize) -> DrawPacket {
        DrawPacket {
            window_id: 1,
            x: 0,
            y: 0,
            width,
            height,
            encoding: Encoding::Png,
            payload: Bytes::from(vec![0u8; bytes]),
            sequence: 1,
            row_stride: 0,
            codec_options: CodecOptions::default(),
        }
    }

    #[test]
    fn decode_cost_counts_pixels_and_bandwidth() {
        let mut session = SessionConfig::default();
        session.decode_ms_per_mpixel = 10;
        assert_eq!(decode_cost(&packet(1000, 1000, 0), &session), Duration::from_millis(10));
        session.bandwidth_mbps = 8;
        // 1 MB at 8 Mbit/s
        assert_eq!(decode_cost(&packet(1, 1, 1_000_000), &session), Duration::from_secs(1));
    }

    #[test]
    fn unknown_encodings_are_rejected() {
        let mut config = ServerConfig::default();
        config.session.encodings = vec!["theora".into()];
        assert!(DemoSession::new(config).is_err());
    }

    #[tokio::test]
    async fn short_session_sends_every_window() {
        let mut config = ServerConfig::default();
        config.demo.duration_secs = 1;
        config.demo.fps = 10;
        config.demo.windows = vec![
            DemoWindow {
                id: 1,
                width: 160,
                height: 120,
                content: Content::Video,
                focused: true,
                fullscreen: false,
            },
            DemoWindow {
                id: 2,
                width: 128,
                height: 96,
                content: Content::Typing,
                focused: false,
                fullscreen: false,
            },
        ];
        let session = DemoSession::new(config).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(10), session.run())
            .await
            .unwrap()
            .unwrap();
        assert!(!session.is_running());
        assert!(stats.damage_events > 0);
        for id in [1, 2] {
            let w = stats.window(id).unwrap();
            assert!(w.packets_sent > 0, "window {id} sent nothing");
        }
    }
}
