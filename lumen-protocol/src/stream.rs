//! Stream data-plane boundary.
//!
//! Codec work is out of scope; this module owns the seam the encoder
//! backends plug into. Each streaming session gets a pump task that
//! consumes frame-loss telemetry, drives the adaptive bitrate controller
//! at its two-second cadence, and emits [`StreamEvent`]s the encoder side
//! subscribes to.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use crate::session::bitrate::{AutoBitrateController, BitrateParams};

/// Events the data plane raises toward the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// Reconfigure the encoder to this bitrate.
    BitrateUpdate(u32),
    /// The client needs an IDR frame to recover.
    Idr,
}

/// Stream parameters fixed at session allocation.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub bitrate_kbps: u32,
    pub auto_bitrate: bool,
    /// Control/video streams negotiated GCM encryption.
    pub gcm_enabled: bool,
    pub bitrate_params: BitrateParams,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: 20_000,
            auto_bitrate: true,
            gcm_enabled: false,
            bitrate_params: BitrateParams::default(),
        }
    }
}

/// One frame-loss telemetry report from the RTP receiver feedback path.
#[derive(Debug, Clone, Copy)]
pub struct LossReport {
    pub frame_loss_percent: f32,
    pub interval_ms: u32,
}

/// Shared loss/bitrate counters, lock-free for observers.
#[derive(Debug, Default)]
pub struct StreamStats {
    /// f32 bits of the last reported loss percentage.
    last_loss_bits: AtomicU32,
    current_bitrate_kbps: AtomicU32,
}

impl StreamStats {
    pub fn last_loss_percent(&self) -> f32 {
        f32::from_bits(self.last_loss_bits.load(Ordering::Relaxed))
    }

    pub fn current_bitrate_kbps(&self) -> u32 {
        self.current_bitrate_kbps.load(Ordering::Relaxed)
    }
}

/// Per-session handle into the data plane.
pub struct StreamPlane {
    loss_tx: mpsc::UnboundedSender<LossReport>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
    stats: Arc<StreamStats>,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamPlane {
    /// Build the plane and spawn its pump task. The returned join handle
    /// is owned by the session and awaited on stop.
    pub fn spawn(config: &StreamConfig) -> (Self, tokio::task::JoinHandle<()>) {
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = Arc::new(StreamStats::default());
        stats
            .current_bitrate_kbps
            .store(config.bitrate_kbps, Ordering::Relaxed);

        let controller = config.auto_bitrate.then(|| {
            AutoBitrateController::with_params(config.bitrate_kbps, config.bitrate_params)
        });

        let join = tokio::spawn(pump(
            loss_rx,
            event_tx.clone(),
            Arc::clone(&stats),
            shutdown_rx,
            controller,
        ));

        (
            Self {
                loss_tx,
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                stats,
                shutdown_tx,
            },
            join,
        )
    }

    /// Feed a telemetry report from the receiver feedback path.
    pub fn report_loss(&self, report: LossReport) {
        let _ = self.loss_tx.send(report);
    }

    /// Ask the encoder for an IDR frame.
    pub fn request_idr(&self) {
        let _ = self.event_tx.send(StreamEvent::Idr);
    }

    /// Take the event receiver; the encoder side calls this exactly once.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.event_rx.lock().await.take()
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    /// Signal the pump to drain and exit.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn pump(
    mut loss_rx: mpsc::UnboundedReceiver<LossReport>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    stats: Arc<StreamStats>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut controller: Option<AutoBitrateController>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(2));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            report = loss_rx.recv() => {
                let Some(report) = report else { break };
                stats
                    .last_loss_bits
                    .store(report.frame_loss_percent.max(0.0).to_bits(), Ordering::Relaxed);
                if let Some(ctrl) = controller.as_mut() {
                    ctrl.update_network_metrics(report.frame_loss_percent, report.interval_ms);
                }
            }
            _ = tick.tick() => {
                if let Some(ctrl) = controller.as_mut() {
                    if let Some(kbps) = ctrl.adjusted_bitrate() {
                        stats.current_bitrate_kbps.store(kbps, Ordering::Relaxed);
                        let _ = event_tx.send(StreamEvent::BitrateUpdate(kbps));
                    }
                }
            }
        }
    }

    // Drain in-flight reports so a graceful stop observes every frame
    // the receiver already acknowledged.
    while let Ok(report) = loss_rx.try_recv() {
        stats
            .last_loss_bits
            .store(report.frame_loss_percent.max(0.0).to_bits(), Ordering::Relaxed);
    }
    debug!("stream pump exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idr_events_reach_subscriber() {
        let (plane, join) = StreamPlane::spawn(&StreamConfig::default());
        let mut events = plane.take_events().await.unwrap();

        plane.request_idr();
        assert_eq!(events.recv().await, Some(StreamEvent::Idr));

        plane.signal_shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn events_receiver_is_single_take() {
        let (plane, join) = StreamPlane::spawn(&StreamConfig::default());
        assert!(plane.take_events().await.is_some());
        assert!(plane.take_events().await.is_none());
        plane.signal_shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn loss_reports_update_stats() {
        let (plane, join) = StreamPlane::spawn(&StreamConfig::default());
        let stats = plane.stats();

        plane.report_loss(LossReport { frame_loss_percent: 7.5, interval_ms: 2000 });
        plane.signal_shutdown();
        join.await.unwrap();

        assert!((stats.last_loss_percent() - 7.5).abs() < f32::EPSILON);
        assert_eq!(stats.current_bitrate_kbps(), 20_000);
    }

    #[tokio::test]
    async fn shutdown_drains_inflight_reports() {
        let (plane, join) = StreamPlane::spawn(&StreamConfig::default());
        let stats = plane.stats();

        // A report queued right before shutdown is still observed,
        // whether the select loop or the drain pass picks it up.
        plane.report_loss(LossReport { frame_loss_percent: 3.0, interval_ms: 2000 });
        plane.signal_shutdown();
        join.await.unwrap();

        assert!((stats.last_loss_percent() - 3.0).abs() < f32::EPSILON);
    }
}
