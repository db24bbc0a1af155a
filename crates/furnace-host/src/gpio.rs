//! GPIO Backends
//!
//! The control plane is written against `embedded-hal` digital pins. Two
//! backends provide them: real Raspberry Pi GPIO via `rppal`, and an
//! in-process simulated pin board. When no GPIO driver is present at startup
//! the controller degrades to the simulated backend instead of refusing to
//! run; the degradation is logged once and reflected in every snapshot as
//! `gpio_available = false`.
//!
//! The simulated board doubles as the test harness: tests flip input levels
//! (door, emergency stop) and observe output levels (heater, pump, fan)
//! through the shared level map.

use anyhow::{Context, Result};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A GPIO capability: either the real pin controller or the simulated board.
pub enum Gpio {
    Hardware(rppal::gpio::Gpio),
    Simulation(SimBoard),
}

impl Gpio {
    /// Probes for GPIO hardware, falling back to simulation.
    ///
    /// Returns the backend and whether real hardware is driving the pins.
    pub fn probe(force_simulation: bool) -> (Self, bool) {
        if force_simulation {
            info!("Simulation mode forced; GPIO writes are no-ops");
            return (Self::Simulation(SimBoard::new()), false);
        }
        match rppal::gpio::Gpio::new() {
            Ok(gpio) => (Self::Hardware(gpio), true),
            Err(e) => {
                warn!("GPIO hardware unavailable ({}); entering simulation mode", e);
                (Self::Simulation(SimBoard::new()), false)
            }
        }
    }

    /// Claims a pin as an output, driven low initially.
    pub fn output(&self, pin: u8) -> Result<OutputLine> {
        match self {
            Self::Hardware(gpio) => {
                let pin = gpio
                    .get(pin)
                    .with_context(|| format!("claiming output pin {}", pin))?
                    .into_output_low();
                Ok(OutputLine::Hardware(pin))
            }
            Self::Simulation(board) => {
                board.init_level(pin, false);
                Ok(OutputLine::Sim {
                    board: board.clone(),
                    pin,
                })
            }
        }
    }

    /// Claims a pin as a plain input.
    pub fn input(&self, pin: u8) -> Result<InputLine> {
        self.claim_input(pin, false)
    }

    /// Claims a pin as an input with the internal pull-up enabled.
    pub fn input_pullup(&self, pin: u8) -> Result<InputLine> {
        self.claim_input(pin, true)
    }

    fn claim_input(&self, pin: u8, pullup: bool) -> Result<InputLine> {
        match self {
            Self::Hardware(gpio) => {
                let claimed = gpio
                    .get(pin)
                    .with_context(|| format!("claiming input pin {}", pin))?;
                let claimed = if pullup {
                    claimed.into_input_pullup()
                } else {
                    claimed.into_input()
                };
                Ok(InputLine::Hardware(claimed))
            }
            Self::Simulation(board) => {
                // A pulled-up line floats high until something drives it.
                board.init_level(pin, pullup);
                Ok(InputLine::Sim {
                    board: board.clone(),
                    pin,
                })
            }
        }
    }

    /// The simulated board, when this backend is simulated.
    pub fn sim_board(&self) -> Option<&SimBoard> {
        match self {
            Self::Hardware(_) => None,
            Self::Simulation(board) => Some(board),
        }
    }
}

/// The shared level map backing simulated pins.
#[derive(Debug, Clone, Default)]
pub struct SimBoard {
    levels: Arc<Mutex<HashMap<u8, bool>>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives a (simulated) line, e.g. a test closing the door contact.
    pub fn set_level(&self, pin: u8, high: bool) {
        self.levels.lock().insert(pin, high);
    }

    /// Reads a line level; unclaimed pins read low.
    pub fn level(&self, pin: u8) -> bool {
        *self.levels.lock().get(&pin).unwrap_or(&false)
    }

    fn init_level(&self, pin: u8, high: bool) {
        self.levels.lock().entry(pin).or_insert(high);
    }
}

/// An output line of either backend.
pub enum OutputLine {
    Hardware(rppal::gpio::OutputPin),
    Sim { board: SimBoard, pin: u8 },
}

impl ErrorType for OutputLine {
    type Error = Infallible;
}

impl OutputPin for OutputLine {
    fn set_low(&mut self) -> Result<(), Infallible> {
        match self {
            Self::Hardware(pin) => pin.set_low(),
            Self::Sim { board, pin } => board.set_level(*pin, false),
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        match self {
            Self::Hardware(pin) => pin.set_high(),
            Self::Sim { board, pin } => board.set_level(*pin, true),
        }
        Ok(())
    }
}

/// An input line of either backend.
pub enum InputLine {
    Hardware(rppal::gpio::InputPin),
    Sim { board: SimBoard, pin: u8 },
}

impl ErrorType for InputLine {
    type Error = Infallible;
}

impl InputPin for InputLine {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        match self {
            Self::Hardware(pin) => Ok(pin.is_high()),
            Self::Sim { board, pin } => Ok(board.level(*pin)),
        }
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        self.is_high().map(|level| !level)
    }
}

/// Blocking delays for the bit-banged thermocouple protocol.
pub struct Delay;

impl DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}

/// Unwraps a pin operation that cannot fail.
pub fn ok<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => match e {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_lines_share_the_board() {
        let board = SimBoard::new();
        let gpio = Gpio::Simulation(board.clone());

        let mut out = gpio.output(17).unwrap();
        assert!(!board.level(17));
        ok(out.set_high());
        assert!(board.level(17));

        let mut input = gpio.input_pullup(18).unwrap();
        // Pulled up until driven.
        assert!(ok(input.is_high()));
        board.set_level(18, false);
        assert!(ok(input.is_low()));
    }

    #[test]
    fn claiming_an_input_does_not_clobber_a_preset_level() {
        let board = SimBoard::new();
        board.set_level(25, false);
        let gpio = Gpio::Simulation(board.clone());
        let mut input = gpio.input_pullup(25).unwrap();
        assert!(ok(input.is_low()));
    }
}
