//! Controller Loop
//!
//! The single-writer control task. Every tick it polls the interlocks, reads
//! both thermocouples, runs the PID when a step is active, drives the heater,
//! vacuum pump, and fan, advances the program executor, and publishes a fresh
//! state snapshot. Operator commands arrive through a bounded mailbox and are
//! applied at the start of the next tick, never mid-tick.
//!
//! Ordering within a tick is fixed: sense, then decide, then actuate, then
//! publish. The loop is missed-tick tolerant; a late tick integrates over the
//! real elapsed time instead of catching up.

use crate::actuators::Actuators;
use crate::catalog::{CatalogError, Program, ProgramCatalog, Step};
use crate::config::FurnaceConfig;
use crate::executor::Executor;
use crate::gpio::{ok, Delay, Gpio, InputLine};
use crate::sensors::{SensorBank, SensorContext, SimulatedSensors};
use crate::state::{ErrorKind, ErrorLog, RunState, Snapshot};
use driver_interlock::DebouncedInput;
use driver_max6675::Max6675Pair;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thermal::fusion::{Fusion, Sample, SensorFault};
use thermal::Pid;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Ticks without any valid thermocouple sample before the run is faulted.
const SENSOR_LOSS_TICKS: u32 = 3;
/// How long an actuator test pulse lasts.
const TEST_PULSE_MS: u64 = 2_000;
/// Duty used for the heater test pulse.
const TEST_HEATER_DUTY: f64 = 10.0;
/// Target used for the vacuum test pulse.
const TEST_VACUUM_KPA: f64 = -50.0;

/// An operator intent, validated and applied by the controller.
#[derive(Debug, Clone)]
pub enum Command {
    Start { program_id: u32 },
    Stop,
    TogglePause,
    Resume,
    EmergencyStop,
    TunePid { kp: f64, ki: f64, kd: f64 },
    SaveProgram { name: String, steps: Vec<Step> },
    DeleteProgram { id: u32 },
    ClearErrors,
    Test(TestTarget),
}

/// What `POST /api/test/{..}` exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestTarget {
    Heater,
    Vacuum,
    Fan,
    Sensors,
}

impl TestTarget {
    pub fn name(&self) -> &'static str {
        match self {
            TestTarget::Heater => "heater",
            TestTarget::Vacuum => "vacuum",
            TestTarget::Fan => "fan",
            TestTarget::Sensors => "sensors",
        }
    }
}

/// The structured result of a successfully applied command.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Started {
        program_name: String,
        total_steps: usize,
        first_target: f64,
    },
    Stopped,
    Paused,
    Resumed,
    EmergencyStopped,
    PidTuned {
        kp: f64,
        ki: f64,
        kd: f64,
    },
    ProgramSaved {
        id: u32,
        program: Option<Program>,
    },
    ProgramDeleted,
    ErrorsCleared,
    TestStarted {
        target: TestTarget,
    },
    SensorReadings {
        tc1: Sample<f64>,
        tc2: Sample<f64>,
    },
}

/// A command-time rejection. Rejections never mutate controller state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    NotFound(String),
}

/// One mailbox entry: a command and where to send its result.
pub struct CommandRequest {
    pub command: Command,
    pub reply: oneshot::Sender<Result<CommandOutcome, CommandError>>,
}

/// The periodic control task. Owns all mutable control-plane state.
pub struct Controller {
    tick_ms: u64,
    catalog: Arc<Mutex<ProgramCatalog>>,
    snapshot: Arc<Mutex<Snapshot>>,
    gpio_available: bool,

    door: DebouncedInput<InputLine>,
    emergency: DebouncedInput<InputLine>,
    sensors: SensorBank,
    actuators: Actuators,
    pid: Pid<f64>,
    executor: Executor,
    fusion: Fusion<f64>,
    errors: ErrorLog,

    current_temp: f64,
    last_samples: (Sample<f64>, Sample<f64>),
    last_duty: f64,
    last_door: bool,
    last_emergency: bool,
    last_tick_ms: u64,
    channel_faulted: [bool; 2],
    test_pulse: Option<(TestTarget, u64)>,
}

impl Controller {
    /// Claims every pin and assembles the control plane.
    pub fn new(
        config: &FurnaceConfig,
        gpio: &Gpio,
        catalog: Arc<Mutex<ProgramCatalog>>,
        snapshot: Arc<Mutex<Snapshot>>,
        gpio_available: bool,
    ) -> anyhow::Result<Self> {
        let pins = &config.pins;

        let door = DebouncedInput::new(gpio.input_pullup(pins.door)?);
        let emergency = DebouncedInput::new(gpio.input_pullup(pins.emergency)?);

        let sensors = match gpio {
            Gpio::Hardware(_) => SensorBank::Hardware(ok(Max6675Pair::new(
                gpio.output(pins.tc_clk)?,
                gpio.output(pins.tc1_cs)?,
                gpio.output(pins.tc2_cs)?,
                gpio.input(pins.tc1_do)?,
                gpio.input(pins.tc2_do)?,
                Delay,
            ))),
            Gpio::Simulation(_) => {
                SensorBank::Simulated(SimulatedSensors::new(config.controller.ambient_c))
            }
        };

        let actuators = Actuators::new(
            gpio.output(pins.heater)?,
            gpio.output(pins.vacuum)?,
            gpio.output(pins.fan)?,
        );

        let mut pid = Pid::new(config.pid.kp, config.pid.ki, config.pid.kd);
        pid.autotune = config.pid.autotune;

        let mut errors = ErrorLog::new();
        if !gpio_available {
            errors.push(0, ErrorKind::HardwareUnavailable);
        }

        Ok(Self {
            tick_ms: config.controller.tick_ms,
            catalog,
            snapshot,
            gpio_available,
            door,
            emergency,
            sensors,
            actuators,
            pid,
            executor: Executor::new(config.controller.cooldown_s),
            fusion: Fusion::new(config.controller.ambient_c, SENSOR_LOSS_TICKS),
            errors,
            current_temp: config.controller.ambient_c,
            last_samples: (
                Sample::Temperature(config.controller.ambient_c),
                Sample::Temperature(config.controller.ambient_c),
            ),
            last_duty: 0.0,
            last_door: false,
            last_emergency: false,
            last_tick_ms: 0,
            channel_faulted: [false; 2],
            test_pulse: None,
        })
    }

    /// Runs the periodic loop until shutdown or an internal failure.
    pub async fn run(
        mut self,
        epoch: Instant,
        mut commands: mpsc::Receiver<CommandRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.tick_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick_ms, "Controller loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    // Commands are applied at the start of the tick, never
                    // mid-tick.
                    while let Ok(request) = commands.try_recv() {
                        let result = self.apply(request.command, now_ms);
                        let _ = request.reply.send(result);
                    }
                    // A panic must never leave the heater energized.
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        self.tick(now_ms)
                    }));
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(kind)) => {
                            error!("Tick failed ({}); forcing safe outputs", kind);
                            self.fail_safe(now_ms, kind);
                            break;
                        }
                        Err(panic) => {
                            let detail = panic_detail(panic);
                            error!("Tick panicked ({}); forcing safe outputs", detail);
                            self.fail_safe(now_ms, ErrorKind::Internal(detail));
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    self.graceful_stop(now_ms);
                    break;
                }
            }
        }
    }

    /// Validates and applies one command. Rejected commands leave all state
    /// untouched.
    pub fn apply(&mut self, command: Command, now_ms: u64) -> Result<CommandOutcome, CommandError> {
        match command {
            Command::Start { program_id } => self.handle_start(program_id, now_ms),
            Command::Stop => {
                self.pid.reset(now_ms);
                self.actuators.release_vacuum();
                if self.executor.stop(now_ms) {
                    info!("Run stopped; cooling down");
                }
                Ok(CommandOutcome::Stopped)
            }
            Command::TogglePause => self.handle_toggle_pause(now_ms),
            Command::Resume => {
                self.check_resume_interlocks()?;
                self.executor
                    .resume(now_ms)
                    .map_err(|reason| CommandError::Rejected(reason.into()))?;
                self.pid.resync(now_ms);
                info!("Run resumed");
                Ok(CommandOutcome::Resumed)
            }
            Command::EmergencyStop => {
                warn!("Emergency stop commanded");
                self.enter_fault(ErrorKind::Emergency, now_ms);
                Ok(CommandOutcome::EmergencyStopped)
            }
            Command::TunePid { kp, ki, kd } => {
                if ![kp, ki, kd].iter().all(|gain| gain.is_finite()) {
                    return Err(CommandError::Rejected(
                        "PID gains must be finite numbers".into(),
                    ));
                }
                self.pid.set_gains(kp, ki, kd);
                info!(kp, ki, kd, "PID gains updated");
                Ok(CommandOutcome::PidTuned { kp, ki, kd })
            }
            Command::SaveProgram { name, steps } => self.handle_save_program(&name, steps, now_ms),
            Command::DeleteProgram { id } => self.handle_delete_program(id, now_ms),
            Command::ClearErrors => {
                self.errors.clear();
                Ok(CommandOutcome::ErrorsCleared)
            }
            Command::Test(target) => self.handle_test(target, now_ms),
        }
    }

    /// One pass of the sense→decide→actuate→publish loop.
    pub fn tick(&mut self, now_ms: u64) -> Result<(), ErrorKind> {
        let dt_s = now_ms.saturating_sub(self.last_tick_ms).max(1) as f64 / 1000.0;

        // 1. Interlocks first; they dominate everything downstream.
        let door_open = ok(self.door.poll());
        let emergency = ok(self.emergency.poll());
        let interlocked = door_open || emergency;

        // 2. Sense. The simulation model consumes the duty issued last tick.
        let heating = matches!(self.executor.state(), RunState::Running { .. });
        let target_c = self
            .executor
            .current_step()
            .map_or(0.0, |(_, step)| step.target_temp);
        let ctx = SensorContext {
            heating,
            target_c,
            heater_duty: self.last_duty,
            dt_s,
        };
        let (tc1, tc2) = self.sensors.read_both(&ctx);
        let fused = self.fusion.update(&tc1, &tc2);
        self.current_temp = fused.value;
        self.note_channel_faults(now_ms, &tc1, &tc2);
        self.last_samples = (tc1, tc2);

        // 3. An emergency edge preempts the run.
        if emergency && !self.last_emergency {
            if self.executor.is_active() {
                warn!("Emergency stop engaged during run");
                self.enter_fault(ErrorKind::Emergency, now_ms);
            }
        // 4. A door edge while running suspends it.
        } else if door_open
            && !self.last_door
            && matches!(self.executor.state(), RunState::Running { .. })
        {
            warn!("Door opened during firing; pausing");
            self.executor.door_opened(now_ms);
            self.errors.push(now_ms, ErrorKind::DoorOpenedDuringRun);
        }

        // Persistent bilateral sensor loss cannot be controlled through.
        if fused.lost && !matches!(self.executor.state(), RunState::Fault { .. }) {
            error!(
                "No valid thermocouple sample for {} consecutive ticks",
                self.fusion.misses()
            );
            self.enter_fault(ErrorKind::SensorLost, now_ms);
        }

        // 5. Decide: PID only drives a running step.
        let requested = match self.executor.state() {
            RunState::Running { .. } => match self.executor.current_step() {
                Some((_, step)) => self.pid.calculate(step.target_temp, self.current_temp, now_ms),
                None => 0.0,
            },
            _ => 0.0,
        };

        // 6. Actuate, always through the interlock gate.
        let mut issued = self.actuators.apply_heater(requested, interlocked);

        match self.executor.state() {
            RunState::Running { .. } => {
                match self.executor.current_step() {
                    Some((_, step)) if step.wants_vacuum() => {
                        self.actuators.request_vacuum(step.vacuum_kpa, interlocked);
                    }
                    _ => self.actuators.release_vacuum(),
                }
            }
            _ => self.actuators.release_vacuum(),
        }

        // Idle-only actuator test pulses.
        if let Some((target, until_ms)) = self.test_pulse {
            if now_ms >= until_ms || !matches!(self.executor.state(), RunState::Idle) {
                self.test_pulse = None;
            } else {
                match target {
                    TestTarget::Heater => {
                        issued = self.actuators.apply_heater(TEST_HEATER_DUTY, interlocked);
                    }
                    TestTarget::Vacuum => {
                        self.actuators.request_vacuum(TEST_VACUUM_KPA, interlocked);
                    }
                    // The fan pulse is folded into the fan drive below.
                    TestTarget::Fan | TestTarget::Sensors => {}
                }
            }
        }

        self.actuators.step_vacuum_gauge(dt_s);

        // 7. Advance the program clock.
        self.executor.advance(now_ms);

        // A transition out of Running just now must not leave this tick's
        // duty on the relay.
        if !matches!(self.executor.state(), RunState::Running { .. })
            && issued > 0.0
            && self.test_pulse.is_none()
        {
            issued = self.actuators.apply_heater(0.0, interlocked);
        }

        let fan_on = matches!(
            self.executor.state(),
            RunState::Cooldown { .. } | RunState::Fault { .. }
        ) || matches!(self.test_pulse, Some((TestTarget::Fan, _)));
        self.actuators.set_fan(fan_on);

        self.last_duty = issued;

        // 8. Publish a consistent cross-section of this tick.
        self.publish_snapshot(now_ms, door_open, emergency);

        self.last_door = door_open;
        self.last_emergency = emergency;
        self.last_tick_ms = now_ms;
        Ok(())
    }

    fn handle_start(
        &mut self,
        program_id: u32,
        now_ms: u64,
    ) -> Result<CommandOutcome, CommandError> {
        match self.executor.state() {
            RunState::Running { .. } | RunState::Paused { .. } => {
                return Err(CommandError::Rejected(
                    "a firing is already in progress".into(),
                ));
            }
            RunState::Cooldown { .. } => {
                return Err(CommandError::Rejected("the furnace is cooling down".into()));
            }
            RunState::Fault { .. } => {
                return Err(CommandError::Rejected(
                    "the controller is faulted; send stop to acknowledge".into(),
                ));
            }
            RunState::Idle => {}
        }
        if self.last_emergency {
            return Err(interlock_rejection("emergency stop engaged"));
        }
        if self.last_door {
            return Err(interlock_rejection("door open"));
        }

        let program = self
            .catalog
            .lock()
            .get(program_id)
            .cloned()
            .ok_or_else(|| {
                CommandError::NotFound(
                    ErrorKind::InvalidProgram(format!("unknown program id {}", program_id))
                        .to_string(),
                )
            })?;

        self.pid.reset(now_ms);
        self.fusion.clear();
        self.channel_faulted = [false; 2];
        self.test_pulse = None;

        let program_name = program.name.clone();
        let total_steps = program.steps.len();
        let first_target = program.steps.first().map_or(0.0, |step| step.target_temp);
        info!(
            program = %program_name,
            total_steps,
            "Starting firing program {}",
            program_id
        );
        self.executor.start(program, now_ms);
        Ok(CommandOutcome::Started {
            program_name,
            total_steps,
            first_target,
        })
    }

    fn handle_toggle_pause(&mut self, now_ms: u64) -> Result<CommandOutcome, CommandError> {
        match self.executor.state() {
            RunState::Running { .. } => {
                self.executor
                    .toggle_pause(now_ms)
                    .map_err(|reason| CommandError::Rejected(reason.into()))?;
                info!("Run paused by operator");
                Ok(CommandOutcome::Paused)
            }
            RunState::Paused { .. } => {
                self.check_resume_interlocks()?;
                self.executor
                    .toggle_pause(now_ms)
                    .map_err(|reason| CommandError::Rejected(reason.into()))?;
                self.pid.resync(now_ms);
                info!("Run resumed");
                Ok(CommandOutcome::Resumed)
            }
            _ => Err(CommandError::Rejected("no firing in progress".into())),
        }
    }

    fn check_resume_interlocks(&self) -> Result<(), CommandError> {
        if self.last_emergency {
            return Err(interlock_rejection("emergency stop engaged"));
        }
        if self.last_door {
            return Err(interlock_rejection("close the door before resuming"));
        }
        Ok(())
    }

    fn handle_save_program(
        &mut self,
        name: &str,
        steps: Vec<Step>,
        now_ms: u64,
    ) -> Result<CommandOutcome, CommandError> {
        let mut catalog = self.catalog.lock();
        match catalog.save_user(name, steps) {
            Ok(id) => {
                let program = catalog.get(id).cloned();
                Ok(CommandOutcome::ProgramSaved { id, program })
            }
            Err(CatalogError::Invalid(reason)) => Err(CommandError::Rejected(reason)),
            Err(CatalogError::Persistence(detail)) => {
                drop(catalog);
                let kind = ErrorKind::PersistenceError(detail);
                self.errors.push(now_ms, kind.clone());
                Err(CommandError::Rejected(kind.to_string()))
            }
            Err(other) => Err(CommandError::Rejected(other.to_string())),
        }
    }

    fn handle_delete_program(
        &mut self,
        id: u32,
        now_ms: u64,
    ) -> Result<CommandOutcome, CommandError> {
        let result = self.catalog.lock().delete_user(id);
        match result {
            Ok(()) => Ok(CommandOutcome::ProgramDeleted),
            Err(CatalogError::NotDeletable(_)) => Err(CommandError::Rejected(
                "built-in programs cannot be deleted".into(),
            )),
            Err(CatalogError::NotFound(_)) => {
                Err(CommandError::NotFound(format!("no program with id {}", id)))
            }
            Err(CatalogError::Persistence(detail)) => {
                let kind = ErrorKind::PersistenceError(detail);
                self.errors.push(now_ms, kind.clone());
                Err(CommandError::Rejected(kind.to_string()))
            }
            Err(other) => Err(CommandError::Rejected(other.to_string())),
        }
    }

    fn handle_test(
        &mut self,
        target: TestTarget,
        now_ms: u64,
    ) -> Result<CommandOutcome, CommandError> {
        if !matches!(self.executor.state(), RunState::Idle) {
            return Err(CommandError::Rejected(
                "test commands are only available while idle".into(),
            ));
        }
        match target {
            TestTarget::Sensors => Ok(CommandOutcome::SensorReadings {
                tc1: self.last_samples.0,
                tc2: self.last_samples.1,
            }),
            other => {
                self.test_pulse = Some((other, now_ms + TEST_PULSE_MS));
                info!("Pulsing {} for {} ms", other.name(), TEST_PULSE_MS);
                Ok(CommandOutcome::TestStarted { target: other })
            }
        }
    }

    /// Drops into a fault: heater off, vacuum vented, fan on, PID reset.
    fn enter_fault(&mut self, kind: ErrorKind, now_ms: u64) {
        self.executor.fault(kind.clone());
        self.pid.reset(now_ms);
        self.actuators.apply_heater(0.0, false);
        self.actuators.release_vacuum();
        self.actuators.set_fan(true);
        self.last_duty = 0.0;
        self.errors.push(now_ms, kind);
    }

    /// Last-resort handling of an internal tick failure: force safe outputs,
    /// publish the fault, and let the loop terminate.
    fn fail_safe(&mut self, now_ms: u64, kind: ErrorKind) {
        self.enter_fault(kind, now_ms);
        self.publish_snapshot(now_ms, self.last_door, self.last_emergency);
    }

    /// Graceful shutdown: end any run, force every output off, publish.
    fn graceful_stop(&mut self, now_ms: u64) {
        if self.executor.is_active() {
            self.executor.stop(now_ms);
        }
        self.pid.reset(now_ms);
        self.actuators.all_off();
        self.publish_snapshot(now_ms, self.last_door, self.last_emergency);
        info!("Controller stopped; all outputs off");
    }

    fn note_channel_faults(&mut self, now_ms: u64, tc1: &Sample<f64>, tc2: &Sample<f64>) {
        for (idx, sample) in [tc1, tc2].into_iter().enumerate() {
            match sample.fault() {
                Some(reason) => {
                    if !self.channel_faulted[idx] {
                        self.channel_faulted[idx] = true;
                        let which = idx as u8 + 1;
                        warn!("Thermocouple {} fault: {:?}", which, reason);
                        self.errors
                            .push(now_ms, ErrorKind::SensorFault { which, reason });
                    }
                }
                None => self.channel_faulted[idx] = false,
            }
        }
    }

    fn publish_snapshot(&mut self, now_ms: u64, door_open: bool, emergency: bool) {
        let run_state = self.executor.state().clone();
        let (program_id, program_name) = match self.executor.program() {
            Some(program) => (Some(program.id), Some(program.name.clone())),
            None => (None, None),
        };
        let (step_idx, target_temp) = match self.executor.current_step() {
            Some((idx, step)) => (idx, step.target_temp),
            None => (0, 0.0),
        };

        let snapshot = Snapshot {
            run_state,
            program_id,
            program_name,
            step_idx,
            total_steps: self.executor.total_steps(),
            elapsed_s: self.executor.step_elapsed_ms(now_ms) / 1000,
            tc1: self.last_samples.0,
            tc2: self.last_samples.1,
            current_temp: self.current_temp,
            target_temp,
            heater_duty: self.actuators.heater_duty(),
            vacuum: self.actuators.vacuum(),
            fan_on: self.actuators.fan_on(),
            door_open,
            emergency,
            gpio_available: self.gpio_available,
            errors: self.errors.entries(),
            tick_time_ms: now_ms,
        };
        *self.snapshot.lock() = snapshot;
    }

    /// Forces both simulated channels to fault (or recover). No-op on
    /// hardware; exists so loss handling can be exercised end to end.
    pub fn inject_sensor_fault(&mut self, fault: Option<SensorFault>) {
        if let Some(sim) = self.sensors.simulated_mut() {
            sim.force_fault(fault);
        }
    }
}

/// A command-time interlock rejection, named per the error taxonomy.
fn interlock_rejection(detail: &str) -> CommandError {
    CommandError::Rejected(format!("{}: {}", ErrorKind::InterlockActive, detail))
}

fn panic_detail(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tick panicked".to_string()
    }
}
