//! A PID (Proportional-Integral-Derivative) controller for the heater.

use num_traits::{Float, Signed};

/// Number of recent error samples retained for diagnostics.
pub const HISTORY_LEN: usize = 100;

/// A PID controller for regulating a system.
///
/// The controller is driven with wall-clock timestamps rather than a fixed
/// `dt` so that a late tick integrates over the real elapsed time instead of
/// pretending the period was met.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pid<F: Float + Signed> {
    /// Proportional gain.
    pub kp: F,
    /// Integral gain.
    pub ki: F,
    /// Derivative gain.
    pub kd: F,

    /// The lower bound of the controller's output.
    pub output_min: F,
    /// The upper bound of the controller's output.
    pub output_max: F,
    /// The anti-windup clamp applied to the accumulated integral.
    pub integral_min: F,
    /// Upper integral clamp.
    pub integral_max: F,

    /// When set, the proportional gain is nudged up while the error is large
    /// and back down once the loop has settled.
    pub autotune: bool,

    // Internal state
    integral: F,
    last_error: F,
    last_tick_ms: u64,
    #[cfg_attr(feature = "serde", serde(skip))]
    history: ErrorHistory<F>,
}

impl<F: Float + Signed> Pid<F> {
    /// Creates a new PID controller with the given gains.
    ///
    /// Output is clamped to `[0, 100]` (a heater duty percentage) and the
    /// integral to `[-50, 50]`.
    pub fn new(kp: F, ki: F, kd: F) -> Self {
        let fifty = F::from(50.0).unwrap();
        Self {
            kp,
            ki,
            kd,
            output_min: F::zero(),
            output_max: F::from(100.0).unwrap(),
            integral_min: -fifty,
            integral_max: fifty,
            autotune: false,
            integral: F::zero(),
            last_error: F::zero(),
            last_tick_ms: 0,
            history: ErrorHistory::new(),
        }
    }

    /// Updates the controller with a new measurement.
    ///
    /// # Arguments
    /// * `setpoint` - The target value for the system.
    /// * `current` - The current measured value of the system.
    /// * `now_ms` - Monotonic milliseconds used to derive `dt`.
    ///
    /// # Returns
    /// The calculated output, clamped to the output limits and rounded to 0.1.
    pub fn calculate(&mut self, setpoint: F, current: F, now_ms: u64) -> F {
        // A stalled or duplicated timestamp must not divide by zero.
        let dt_ms = now_ms.saturating_sub(self.last_tick_ms).max(1);
        let dt = F::from(dt_ms).unwrap() / F::from(1000.0).unwrap();
        self.last_tick_ms = now_ms;

        let error = setpoint - current;
        self.history.push(error);

        // Proportional term
        let p_term = self.kp * error;

        // Integral term with anti-windup
        self.integral = self.integral + error * dt;
        self.integral = self.integral.max(self.integral_min).min(self.integral_max);
        let i_term = self.ki * self.integral;

        // Derivative term
        let derivative = (error - self.last_error) / dt;
        let d_term = self.kd * derivative;

        // Update state for next iteration
        self.last_error = error;

        // Calculate final output, clamped to the defined limits
        let output = (p_term + i_term + d_term)
            .max(self.output_min)
            .min(self.output_max);

        if self.autotune {
            self.adjust_kp(error, derivative);
        }

        round_tenths(output)
    }

    /// Resets the internal state of the controller.
    ///
    /// Called on program start, stop, emergency, and fault so that no integral
    /// or derivative kick carries over between runs.
    pub fn reset(&mut self, now_ms: u64) {
        self.integral = F::zero();
        self.last_error = F::zero();
        self.last_tick_ms = now_ms;
    }

    /// Re-stamps the time base without clearing the accumulated state.
    ///
    /// Used when control resumes after a pause: the integral is still valid
    /// but the pause itself must not be integrated as elapsed time.
    pub fn resync(&mut self, now_ms: u64) {
        self.last_tick_ms = now_ms;
    }

    /// Replaces the controller gains, leaving the accumulated state alone.
    pub fn set_gains(&mut self, kp: F, ki: F, kd: F) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// The accumulated integral term.
    pub fn integral(&self) -> F {
        self.integral
    }

    /// Recent error samples, oldest first.
    pub fn error_history(&self) -> impl Iterator<Item = F> + '_ {
        self.history.iter()
    }

    // Proportional auto-adjust: push kp up while far from the setpoint, relax
    // it once the loop has settled.
    fn adjust_kp(&mut self, error: F, derivative: F) {
        let far = F::from(50.0).unwrap();
        let near = F::from(5.0).unwrap();
        if error.abs() > far {
            self.kp = (self.kp * F::from(1.01).unwrap()).min(F::from(5.0).unwrap());
        } else if error.abs() < near && derivative.abs() < F::one() {
            self.kp = (self.kp * F::from(0.99).unwrap()).max(F::from(2.0).unwrap());
        }
    }
}

impl<F: Float + Signed> Default for Pid<F> {
    /// The stock furnace tuning.
    fn default() -> Self {
        Self::new(
            F::from(3.2).unwrap(),
            F::from(0.08).unwrap(),
            F::from(1.5).unwrap(),
        )
    }
}

fn round_tenths<F: Float>(value: F) -> F {
    let ten = F::from(10.0).unwrap();
    (value * ten).round() / ten
}

/// A fixed-capacity ring buffer of recent error samples.
///
/// Diagnostic only; nothing in the control law reads it back.
#[derive(Debug, Clone)]
pub struct ErrorHistory<F> {
    buf: [F; HISTORY_LEN],
    len: usize,
    next: usize,
}

impl<F: Float> Default for ErrorHistory<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Float> ErrorHistory<F> {
    fn new() -> Self {
        Self {
            buf: [F::zero(); HISTORY_LEN],
            len: 0,
            next: 0,
        }
    }

    fn push(&mut self, sample: F) {
        self.buf[self.next] = sample;
        self.next = (self.next + 1) % HISTORY_LEN;
        if self.len < HISTORY_LEN {
            self.len += 1;
        }
    }

    /// Number of samples currently retained.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no samples have been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn iter(&self) -> impl Iterator<Item = F> + '_ {
        let start = if self.len < HISTORY_LEN { 0 } else { self.next };
        (0..self.len).map(move |i| self.buf[(start + i) % HISTORY_LEN])
    }
}
