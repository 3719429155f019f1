use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(all(feature = "gpio", target_os = "linux"))]
use tracing::{debug, info};

#[cfg(all(feature = "gpio", target_os = "linux"))]
use crate::config::{ActiveLevel, GpioConfig};
#[cfg(all(feature = "gpio", target_os = "linux"))]
use crate::error::{CrittercamError, Result};

/// Floodlight actuator: two idempotent, fire-and-forget hardware writes.
///
/// Hardware faults are out of scope, so neither operation has a failure path.
pub trait Floodlight: Send {
    fn set_on(&mut self);
    fn set_off(&mut self);
}

/// Floodlight driven by a GPIO output line, honoring the configured polarity.
#[cfg(all(feature = "gpio", target_os = "linux"))]
pub struct GpioFloodlight {
    pin: rppal::gpio::OutputPin,
    active_level: ActiveLevel,
    light_pin: u8,
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
impl GpioFloodlight {
    pub fn new(config: &GpioConfig) -> Result<Self> {
        use rppal::gpio::Gpio;

        let gpio = Gpio::new().map_err(|e| {
            CrittercamError::gpio(format!("Failed to acquire GPIO peripheral: {}", e))
        })?;

        let mut pin = gpio
            .get(config.light_pin)
            .map_err(|e| {
                CrittercamError::gpio(format!(
                    "Failed to claim light pin {}: {}",
                    config.light_pin, e
                ))
            })?
            .into_output();

        // Keep the last written level when the pin handle is dropped
        pin.set_reset_on_drop(false);

        let mut light = Self {
            pin,
            active_level: config.active_level,
            light_pin: config.light_pin,
        };
        light.set_off();

        info!("Floodlight attached on GPIO {}", config.light_pin);
        Ok(light)
    }
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
impl Floodlight for GpioFloodlight {
    fn set_on(&mut self) {
        debug!("Floodlight on (GPIO {})", self.light_pin);
        match self.active_level {
            ActiveLevel::High => self.pin.set_high(),
            ActiveLevel::Low => self.pin.set_low(),
        }
    }

    fn set_off(&mut self) {
        debug!("Floodlight off (GPIO {})", self.light_pin);
        match self.active_level {
            ActiveLevel::High => self.pin.set_low(),
            ActiveLevel::Low => self.pin.set_high(),
        }
    }
}

/// Floodlight stand-in that records every write for assertions.
#[derive(Default, Clone)]
pub struct MockFloodlight {
    writes: Arc<Mutex<Vec<bool>>>,
}

impl MockFloodlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full write history, in order (`true` = on).
    pub fn writes(&self) -> Vec<bool> {
        self.writes.lock().clone()
    }

    /// Whether the most recent write turned the light on.
    pub fn is_on(&self) -> bool {
        self.writes.lock().last().copied().unwrap_or(false)
    }
}

impl Floodlight for MockFloodlight {
    fn set_on(&mut self) {
        self.writes.lock().push(true);
    }

    fn set_off(&mut self) {
        self.writes.lock().push(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_floodlight_records_writes() {
        let mut light = MockFloodlight::new();
        assert!(!light.is_on());

        light.set_on();
        assert!(light.is_on());

        light.set_off();
        assert!(!light.is_on());
        assert_eq!(light.writes(), vec![true, false]);
    }
}
