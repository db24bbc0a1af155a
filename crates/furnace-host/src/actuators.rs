//! Actuator Ownership
//!
//! The heater SSR, vacuum pump relay, and cooling fan relay live here, each
//! owning its GPIO line for the life of the process. Heater and vacuum writes
//! are gated through the interlock state: while the door is open or the
//! emergency stop is engaged the commanded value is discarded and the output
//! forced safe. The fan is deliberately not gated; it is the one actuator
//! wanted during an emergency.

use crate::gpio::{ok, OutputLine};
use crate::state::VacuumState;
use driver_ssr::{Relay, Ssr};

/// Time constant of the synthetic vacuum gauge's approach to its goal.
const VACUUM_TAU_S: f64 = 3.0;

pub struct Actuators {
    heater: Ssr<OutputLine>,
    pump: Relay<OutputLine>,
    fan: Relay<OutputLine>,
    vacuum: VacuumState,
}

impl Actuators {
    /// Takes ownership of the three output lines, all forced off.
    pub fn new(heater: OutputLine, pump: OutputLine, fan: OutputLine) -> Self {
        Self {
            heater: ok(Ssr::new(heater)),
            pump: ok(Relay::new(pump)),
            fan: ok(Relay::new(fan)),
            vacuum: VacuumState::default(),
        }
    }

    /// Drives the heater with the requested duty, subject to the interlock.
    ///
    /// Returns the duty actually issued.
    pub fn apply_heater(&mut self, requested: f64, interlocked: bool) -> f64 {
        let duty = if interlocked { 0.0 } else { requested };
        f64::from(ok(self.heater.set_duty(duty as f32)))
    }

    /// The duty last issued to the heater, percent.
    pub fn heater_duty(&self) -> f64 {
        f64::from(self.heater.duty())
    }

    /// Runs the vacuum pump toward `target_kpa` (≤ 0), subject to the
    /// interlock. A non-negative target or an active interlock vents instead.
    pub fn request_vacuum(&mut self, target_kpa: f64, interlocked: bool) {
        if interlocked || target_kpa >= 0.0 {
            self.release_vacuum();
            return;
        }
        self.vacuum.enabled = true;
        self.vacuum.target_kpa = target_kpa;
        ok(self.pump.set(true));
    }

    /// Stops the pump and lets the chamber vent.
    pub fn release_vacuum(&mut self) {
        self.vacuum.enabled = false;
        self.vacuum.target_kpa = 0.0;
        ok(self.pump.set(false));
    }

    /// Drives the cooling fan. Never interlock-gated.
    pub fn set_fan(&mut self, on: bool) {
        ok(self.fan.set(on));
    }

    pub fn fan_on(&self) -> bool {
        self.fan.is_on()
    }

    /// Advances the synthetic gauge: the modeled pressure approaches the
    /// pump's goal (the target while enabled, atmospheric while vented).
    pub fn step_vacuum_gauge(&mut self, dt_s: f64) {
        let goal = if self.vacuum.enabled {
            self.vacuum.target_kpa
        } else {
            0.0
        };
        let alpha = (dt_s / VACUUM_TAU_S).min(1.0);
        self.vacuum.current_kpa += (goal - self.vacuum.current_kpa) * alpha;
    }

    pub fn vacuum(&self) -> VacuumState {
        self.vacuum
    }

    /// Forces every output off; used on shutdown.
    pub fn all_off(&mut self) {
        self.apply_heater(0.0, false);
        self.release_vacuum();
        self.set_fan(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{Gpio, SimBoard};

    fn actuators(board: &SimBoard) -> Actuators {
        let gpio = Gpio::Simulation(board.clone());
        Actuators::new(
            gpio.output(17).unwrap(),
            gpio.output(27).unwrap(),
            gpio.output(22).unwrap(),
        )
    }

    #[test]
    fn interlock_forces_heater_off_regardless_of_request() {
        let board = SimBoard::new();
        let mut actuators = actuators(&board);

        assert_eq!(actuators.apply_heater(80.0, false), 80.0);
        assert!(board.level(17));

        assert_eq!(actuators.apply_heater(80.0, true), 0.0);
        assert!(!board.level(17));
    }

    #[test]
    fn interlock_vents_the_vacuum() {
        let board = SimBoard::new();
        let mut actuators = actuators(&board);

        actuators.request_vacuum(-50.0, false);
        assert!(board.level(27));
        assert!(actuators.vacuum().enabled);

        actuators.request_vacuum(-50.0, true);
        assert!(!board.level(27));
        assert!(!actuators.vacuum().enabled);
    }

    #[test]
    fn gauge_approaches_target_then_vents() {
        let board = SimBoard::new();
        let mut actuators = actuators(&board);

        actuators.request_vacuum(-50.0, false);
        for _ in 0..60 {
            actuators.step_vacuum_gauge(0.5);
        }
        assert!(actuators.vacuum().current_kpa < -45.0);

        actuators.release_vacuum();
        for _ in 0..60 {
            actuators.step_vacuum_gauge(0.5);
        }
        assert!(actuators.vacuum().current_kpa > -5.0);
    }

    #[test]
    fn fan_is_never_gated() {
        let board = SimBoard::new();
        let mut actuators = actuators(&board);
        actuators.set_fan(true);
        assert!(board.level(22));
    }
}
