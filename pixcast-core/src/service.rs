//! Async host for the engine.
//!
//! [`EngineService`] runs the capture context on one Tokio task:
//!
//! 1. Commands from an [`EngineHandle`] (window events, damage, acks).
//! 2. Encode outcomes coming back from the [`EncodeWorkers`].
//! 3. Engine timers, by sleeping until the next deadline.
//!
//! After each step queued work is dispatched to the workers and ready
//! packets are forwarded on the packet channel. The service stops when
//! [`stop`](EngineService::stop) is called or every handle is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::batch::DamageOptions;
use crate::control::ReconfigureTargets;
use crate::encoding::WindowFlags;
use crate::engine::{DecodeResult, WindowEncodeEngine};
use crate::error::EngineError;
use crate::packet::DrawPacket;
use crate::pipeline::CodecRegistry;
use crate::region::Rectangle;
use crate::stats::Statistics;
use crate::types::WindowId;
use crate::worker::{EncodeWorkers, OutcomeReceiver};

/// Longest the loop sleeps without checking the running flag.
const IDLE_POLL: Duration = Duration::from_millis(250);

const COMMAND_CAPACITY: usize = 1024;

// ── Commands ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum EngineCommand {
    AddWindow {
        id: WindowId,
        width: u32,
        height: u32,
        flags: WindowFlags,
    },
    RemoveWindow(WindowId),
    Resize {
        id: WindowId,
        width: u32,
        height: u32,
    },
    SetFlags {
        id: WindowId,
        flags: WindowFlags,
    },
    Damage {
        id: WindowId,
        rect: Rectangle,
        options: DamageOptions,
    },
    Ack {
        id: WindowId,
        sequence: u64,
        width: u32,
        height: u32,
        result: DecodeResult,
    },
    SetEncoding {
        id: WindowId,
        encoding: String,
        strict: bool,
    },
    Reconfigure {
        id: WindowId,
        targets: ReconfigureTargets,
    },
    Cancel(WindowId),
    Suspend(WindowId),
    Resume(WindowId),
    Statistics(oneshot::Sender<Statistics>),
}

// ── EngineHandle ─────────────────────────────────────────────────

/// Cloneable sender side of a running [`EngineService`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.tx.send(command).await?;
        Ok(())
    }

    pub async fn add_window(&self, id: WindowId, width: u32, height: u32, flags: WindowFlags) -> Result<(), EngineError> {
        self.send(EngineCommand::AddWindow {
            id,
            width,
            height,
            flags,
        })
        .await
    }

    pub async fn remove_window(&self, id: WindowId) -> Result<(), EngineError> {
        self.send(EngineCommand::RemoveWindow(id)).await
    }

    pub async fn damage(&self, id: WindowId, rect: Rectangle) -> Result<(), EngineError> {
        self.send(EngineCommand::Damage {
            id,
            rect,
            options: DamageOptions::default(),
        })
        .await
    }

    pub async fn ack(&self, packet: &DrawPacket, result: DecodeResult) -> Result<(), EngineError> {
        self.send(EngineCommand::Ack {
            id: packet.window_id,
            sequence: packet.sequence,
            width: packet.width,
            height: packet.height,
            result,
        })
        .await
    }

    /// Snapshot of the engine's statistics.
    pub async fn statistics(&self) -> Result<Statistics, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Statistics(tx)).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

// ── EngineService ────────────────────────────────────────────────

/// Runs a [`WindowEncodeEngine`] and its workers on the Tokio runtime.
///
/// # Lifetime
///
/// Call [`run`](Self::run) to start the loop. It runs until
/// [`stop`](Self::stop) is called, every [`EngineHandle`] is dropped,
/// or the packet receiver goes away.
pub struct EngineService {
    engine: WindowEncodeEngine,
    workers: EncodeWorkers,
    done: OutcomeReceiver,
    commands: mpsc::Receiver<EngineCommand>,
    packets: mpsc::Sender<DrawPacket>,
    running: Arc<AtomicBool>,
}

impl EngineService {
    /// Wrap `engine`; packets are delivered on `packets`.
    pub fn new(
        engine: WindowEncodeEngine,
        registry: Arc<dyn CodecRegistry>,
        packets: mpsc::Sender<DrawPacket>,
    ) -> (Self, EngineHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (workers, done) = EncodeWorkers::new(registry);
        (
            Self {
                engine,
                workers,
                done,
                commands,
                packets,
                running: Arc::new(AtomicBool::new(false)),
            },
            EngineHandle { tx },
        )
    }

    /// A cloneable handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn engine(&self) -> &WindowEncodeEngine {
        &self.engine
    }

    /// Run the engine loop.
    ///
    /// ```no_run
    /// # use pixcast_core::service::EngineService;
    /// # async fn example(mut svc: EngineService) {
    /// let handle = svc.stop_handle();
    /// tokio::spawn(async move { svc.run().await });
    /// // … later …
    /// handle.store(false, std::sync::atomic::Ordering::SeqCst);
    /// # }
    /// ```
    pub async fn run(&mut self) -> Result<(), EngineError> {
        self.running.store(true, Ordering::SeqCst);
        info!("engine service started");
        let result = self.run_loop().await;
        self.running.store(false, Ordering::SeqCst);
        self.workers.shutdown().await;
        info!("engine service stopped");
        result
    }

    async fn run_loop(&mut self) -> Result<(), EngineError> {
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let wake = self
                .engine
                .next_deadline()
                .map_or(now + IDLE_POLL, |d| d.min(now + IDLE_POLL));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("all engine handles dropped");
                        break;
                    }
                },
                Some(outcome) = self.done.recv() => {
                    self.engine.complete(outcome, Instant::now());
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    self.engine.fire_timers(Instant::now());
                }
            }

            self.pump().await?;
        }
        Ok(())
    }

    fn handle(&mut self, command: EngineCommand) {
        let now = Instant::now();
        let engine = &mut self.engine;
        let result = match command {
            EngineCommand::AddWindow { id, width, height, flags } => engine.add_window(id, width, height, flags, now),
            EngineCommand::RemoveWindow(id) => engine.remove_window(id),
            EngineCommand::Resize { id, width, height } => engine.resize(id, width, height, now),
            EngineCommand::SetFlags { id, flags } => engine.set_window_flags(id, flags),
            EngineCommand::Damage { id, rect, options } => engine.damage(id, rect, options, now),
            EngineCommand::Ack {
                id,
                sequence,
                width,
                height,
                result,
            } => engine.client_ack(id, sequence, width, height, result, now),
            EngineCommand::SetEncoding { id, encoding, strict } => engine.set_encoding(id, &encoding, strict),
            EngineCommand::Reconfigure { id, targets } => engine.reconfigure(id, targets, now),
            EngineCommand::Cancel(id) => engine.cancel(id),
            EngineCommand::Suspend(id) => engine.suspend(id),
            EngineCommand::Resume(id) => engine.resume(id, now),
            EngineCommand::Statistics(reply) => {
                let _ = reply.send(engine.statistics());
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "engine command failed");
        }
    }

    /// Hand queued work to the workers and ready packets to the transport.
    async fn pump(&mut self) -> Result<(), EngineError> {
        let work = self.engine.take_work();
        if !work.is_empty() {
            self.workers.dispatch(&self.engine, work);
        }
        for packet in self.engine.take_packets() {
            self.packets.send(packet).await?;
        }
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
