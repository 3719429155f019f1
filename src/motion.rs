use crate::error::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(all(feature = "gpio", target_os = "linux"))]
use crate::config::{ActiveLevel, GpioConfig};
#[cfg(all(feature = "gpio", target_os = "linux"))]
use crate::error::CrittercamError;

/// A unit event signaling "motion detected now".
///
/// Produced by the sensor's interrupt callback and consumed exactly once by
/// the recorder. Carries no payload beyond its occurrence; the recorder is
/// idempotent to duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionEvent;

/// A source of motion events feeding the recorder's event queue.
///
/// `start` hands the source the queue's sender; from then on every detected
/// motion edge results in one non-blocking enqueue. The callback runs outside
/// the recorder's scheduling context and must never block: a full queue drops
/// the event with a warning, which is safe because a re-trigger while already
/// recording only resets a timer.
pub trait MotionSource: Send {
    fn start(&mut self, tx: mpsc::Sender<MotionEvent>) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Enqueue one motion event without blocking. Shared by every source
/// implementation so the drop-on-full policy stays in one place.
fn enqueue(tx: &mpsc::Sender<MotionEvent>) -> bool {
    match tx.try_send(MotionEvent) {
        Ok(()) => {
            debug!("Motion event enqueued");
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Motion event queue full, dropping event");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Motion event queue closed, dropping event");
            false
        }
    }
}

/// Motion sensor on a GPIO input line, using an async edge interrupt.
///
/// Only the configured active edge enqueues an event; the opposite edge and
/// hardware chatter inside the debounce window are filtered here, before the
/// recorder ever sees them.
#[cfg(all(feature = "gpio", target_os = "linux"))]
pub struct GpioMotionSource {
    config: GpioConfig,
    pin: Option<rppal::gpio::InputPin>,
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
impl GpioMotionSource {
    pub fn new(config: GpioConfig) -> Self {
        Self { config, pin: None }
    }
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
impl MotionSource for GpioMotionSource {
    fn start(&mut self, tx: mpsc::Sender<MotionEvent>) -> Result<()> {
        use rppal::gpio::{Gpio, Trigger};
        use std::time::Duration;

        let gpio = Gpio::new().map_err(|e| {
            CrittercamError::gpio(format!("Failed to acquire GPIO peripheral: {}", e))
        })?;

        let mut pin = gpio
            .get(self.config.motion_pin)
            .map_err(|e| {
                CrittercamError::gpio(format!(
                    "Failed to claim motion pin {}: {}",
                    self.config.motion_pin, e
                ))
            })?
            .into_input();

        let trigger = match self.config.active_level {
            ActiveLevel::High => Trigger::RisingEdge,
            ActiveLevel::Low => Trigger::FallingEdge,
        };

        let debounce = if self.config.debounce_ms > 0 {
            Some(Duration::from_millis(self.config.debounce_ms))
        } else {
            None
        };

        pin.set_async_interrupt(trigger, debounce, move |event| {
            debug!("Motion edge at {:?}", event.timestamp);
            enqueue(&tx);
        })
        .map_err(|e| {
            CrittercamError::gpio(format!(
                "Failed to register motion interrupt on pin {}: {}",
                self.config.motion_pin, e
            ))
        })?;

        info!(
            "Motion sensor armed on GPIO {} ({:?} edge)",
            self.config.motion_pin, trigger
        );
        self.pin = Some(pin);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut pin) = self.pin.take() {
            pin.clear_async_interrupt().map_err(|e| {
                CrittercamError::gpio(format!("Failed to clear motion interrupt: {}", e))
            })?;
            info!("Motion sensor disarmed on GPIO {}", self.config.motion_pin);
        }
        Ok(())
    }
}

/// Motion source for tests and development hosts without GPIO hardware.
///
/// `handle()` returns an injector that behaves like the interrupt callback:
/// a non-blocking enqueue of one event per call.
#[derive(Default)]
pub struct MockMotionSource {
    tx: std::sync::Arc<parking_lot::Mutex<Option<mpsc::Sender<MotionEvent>>>>,
}

/// Cloneable injector for simulated motion edges.
#[derive(Clone)]
pub struct MockMotionHandle {
    tx: std::sync::Arc<parking_lot::Mutex<Option<mpsc::Sender<MotionEvent>>>>,
}

impl MockMotionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockMotionHandle {
        MockMotionHandle {
            tx: std::sync::Arc::clone(&self.tx),
        }
    }
}

impl MockMotionHandle {
    /// Simulate one motion edge. Returns whether the event was enqueued.
    pub fn emit(&self) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => enqueue(tx),
            None => false,
        }
    }
}

impl MotionSource for MockMotionSource {
    fn start(&mut self, tx: mpsc::Sender<MotionEvent>) -> Result<()> {
        info!("Mock motion source started");
        *self.tx.lock() = Some(tx);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        info!("Mock motion source stopped");
        *self.tx.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_source_enqueues_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut source = MockMotionSource::new();
        let handle = source.handle();

        source.start(tx).unwrap();
        assert!(handle.emit());

        assert_eq!(rx.recv().await, Some(MotionEvent));
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut source = MockMotionSource::new();
        let handle = source.handle();
        source.start(tx).unwrap();

        assert!(handle.emit());
        // Queue capacity is 1, so the duplicate edge is dropped, not blocked on
        assert!(!handle.emit());

        assert_eq!(rx.recv().await, Some(MotionEvent));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stopped_source_ignores_edges() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut source = MockMotionSource::new();
        let handle = source.handle();

        source.start(tx).unwrap();
        source.stop().unwrap();

        assert!(!handle.emit());
        assert!(rx.try_recv().is_err());
    }
}
