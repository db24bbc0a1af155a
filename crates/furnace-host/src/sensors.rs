//! Thermocouple Sensing Front-End
//!
//! Wraps the MAX6675 pair driver for hardware operation and a synthetic
//! furnace model for simulation mode. Both produce the same `Sample` values,
//! so the rest of the control plane does not know which one is running.

use crate::gpio::{Delay, InputLine, OutputLine};
use driver_max6675::{Channel, FrameError, Max6675Pair, ReadError};
use rand::Rng;
use thermal::fusion::{Sample, SensorFault};

/// What the sensing layer needs to know about the current tick.
#[derive(Debug, Clone, Copy)]
pub struct SensorContext {
    /// True while a program step is running.
    pub heating: bool,
    /// The active step's setpoint in °C.
    pub target_c: f64,
    /// The heater duty issued on the previous tick, percent.
    pub heater_duty: f64,
    /// Real elapsed time since the previous tick, seconds.
    pub dt_s: f64,
}

/// The pair of thermocouple channels, hardware or simulated.
pub enum SensorBank {
    Hardware(Max6675Pair<OutputLine, OutputLine, OutputLine, InputLine, InputLine, Delay>),
    Simulated(SimulatedSensors),
}

impl SensorBank {
    /// Reads both channels, serialized over the shared clock.
    pub fn read_both(&mut self, ctx: &SensorContext) -> (Sample<f64>, Sample<f64>) {
        match self {
            Self::Hardware(pair) => (
                read_channel(pair, Channel::One),
                read_channel(pair, Channel::Two),
            ),
            Self::Simulated(sim) => sim.read_both(ctx),
        }
    }

    /// The simulated model, when this bank is simulated.
    pub fn simulated_mut(&mut self) -> Option<&mut SimulatedSensors> {
        match self {
            Self::Hardware(_) => None,
            Self::Simulated(sim) => Some(sim),
        }
    }
}

fn read_channel(
    pair: &mut Max6675Pair<OutputLine, OutputLine, OutputLine, InputLine, InputLine, Delay>,
    channel: Channel,
) -> Sample<f64> {
    match pair.read(channel) {
        Ok(temperature) => Sample::Temperature(f64::from(temperature)),
        Err(ReadError::Frame(fault)) => Sample::Fault(frame_fault(fault)),
        Err(ReadError::Pin(e)) => match e {},
    }
}

fn frame_fault(fault: FrameError) -> SensorFault {
    match fault {
        FrameError::BusError => SensorFault::BusError,
        FrameError::OpenCircuit => SensorFault::OpenCircuit,
        FrameError::BadFrame => SensorFault::BadFrame,
        FrameError::OutOfRange => SensorFault::OutOfRange,
    }
}

/// A synthetic furnace chamber.
///
/// While a step is heating, the temperature rises at up to 0.5 °C/s scaled by
/// the heater duty, clamped to the setpoint; otherwise it decays at 0.1 °C/s
/// toward ambient. Reported samples carry ±1 °C of noise on top.
pub struct SimulatedSensors {
    temp_c: f64,
    ambient_c: f64,
    forced_fault: Option<SensorFault>,
}

impl SimulatedSensors {
    pub fn new(ambient_c: f64) -> Self {
        Self {
            temp_c: ambient_c,
            ambient_c,
            forced_fault: None,
        }
    }

    /// The modeled chamber temperature without sampling noise.
    pub fn temperature(&self) -> f64 {
        self.temp_c
    }

    /// Makes every subsequent read fail with the given fault (or recover).
    pub fn force_fault(&mut self, fault: Option<SensorFault>) {
        self.forced_fault = fault;
    }

    fn read_both(&mut self, ctx: &SensorContext) -> (Sample<f64>, Sample<f64>) {
        self.step_model(ctx);
        if let Some(fault) = self.forced_fault {
            return (Sample::Fault(fault), Sample::Fault(fault));
        }
        let mut rng = rand::thread_rng();
        let noisy = |rng: &mut rand::rngs::ThreadRng, temp: f64| {
            Sample::Temperature(temp + rng.gen_range(-1.0..=1.0))
        };
        (noisy(&mut rng, self.temp_c), noisy(&mut rng, self.temp_c))
    }

    fn step_model(&mut self, ctx: &SensorContext) {
        if ctx.heating && ctx.target_c > self.temp_c {
            let rise = 0.5 * (ctx.heater_duty / 100.0) * ctx.dt_s;
            self.temp_c = (self.temp_c + rise).min(ctx.target_c);
        } else if self.temp_c > self.ambient_c {
            self.temp_c = (self.temp_c - 0.1 * ctx.dt_s).max(self.ambient_c);
        } else {
            self.temp_c = (self.temp_c + 0.1 * ctx.dt_s).min(self.ambient_c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(heating: bool, target_c: f64, heater_duty: f64) -> SensorContext {
        SensorContext {
            heating,
            target_c,
            heater_duty,
            dt_s: 0.5,
        }
    }

    #[test]
    fn simulated_chamber_heats_with_duty_and_clamps_at_target() {
        let mut sim = SimulatedSensors::new(20.0);
        // Full duty for 1000 ticks of 0.5 s: +0.25 °C per tick.
        for _ in 0..1000 {
            sim.read_both(&ctx(true, 100.0, 100.0));
        }
        // 250 °C of headroom requested but clamped at the 100 °C target.
        assert_eq!(sim.temperature(), 100.0);
    }

    #[test]
    fn simulated_chamber_cools_toward_ambient() {
        let mut sim = SimulatedSensors::new(20.0);
        for _ in 0..200 {
            sim.read_both(&ctx(true, 40.0, 100.0));
        }
        assert_eq!(sim.temperature(), 40.0);
        // Heater off: decays at 0.1 °C/s, never below ambient.
        for _ in 0..10_000 {
            sim.read_both(&ctx(false, 0.0, 0.0));
        }
        assert_eq!(sim.temperature(), 20.0);
    }

    #[test]
    fn forced_faults_replace_both_channels() {
        let mut sim = SimulatedSensors::new(20.0);
        sim.force_fault(Some(SensorFault::BusError));
        let (tc1, tc2) = sim.read_both(&ctx(false, 0.0, 0.0));
        assert_eq!(tc1, Sample::Fault(SensorFault::BusError));
        assert_eq!(tc2, Sample::Fault(SensorFault::BusError));
        sim.force_fault(None);
        let (tc1, _) = sim.read_both(&ctx(false, 0.0, 0.0));
        assert!(tc1.temperature().is_some());
    }
}
