use float_cmp::approx_eq;
use thermal::fusion::{Fusion, Sample, SensorFault};
use thermal::pid::Pid;

#[test]
fn test_pid_output_clamped() {
    let mut pid: Pid<f64> = Pid::default();
    pid.reset(0);
    // A huge positive error saturates at the top of the duty range.
    let out = pid.calculate(1500.0, 20.0, 500);
    assert!(approx_eq!(f64, out, 100.0, epsilon = 0.001));
    // A huge negative error saturates at zero, never below.
    let out = pid.calculate(0.0, 1500.0, 1000);
    assert!(approx_eq!(f64, out, 0.0, epsilon = 0.001));
}

#[test]
fn test_pid_integral_clamped() {
    let mut pid: Pid<f64> = Pid::default();
    pid.reset(0);
    // Integrate a large error for a long simulated time; the anti-windup
    // clamp must hold the integral at its limit.
    for i in 1..=600 {
        pid.calculate(1000.0, 20.0, i * 500);
    }
    assert!(pid.integral() <= 50.0);
    assert!(pid.integral() >= -50.0);
    assert!(approx_eq!(f64, pid.integral(), 50.0, epsilon = 0.001));
}

#[test]
fn test_pid_dt_floor() {
    let mut pid: Pid<f64> = Pid::default();
    pid.reset(1000);
    // Two calls with the same timestamp must not divide by zero.
    let a = pid.calculate(100.0, 90.0, 1000);
    let b = pid.calculate(100.0, 90.0, 1000);
    assert!(a.is_finite());
    assert!(b.is_finite());
}

#[test]
fn test_pid_output_resolution() {
    let mut pid: Pid<f64> = Pid::new(3.2, 0.08, 1.5);
    pid.reset(0);
    let out = pid.calculate(100.0, 89.123, 500);
    // Rounded to a tenth of a percent.
    assert!(approx_eq!(f64, out * 10.0, (out * 10.0).round(), epsilon = 1e-9));
}

#[test]
fn test_pid_reset_clears_state() {
    let mut pid: Pid<f64> = Pid::default();
    pid.reset(0);
    for i in 1..=20 {
        pid.calculate(500.0, 20.0, i * 500);
    }
    assert!(pid.integral() > 0.0);
    pid.reset(20_000);
    assert!(approx_eq!(f64, pid.integral(), 0.0, epsilon = 1e-12));
    // The first post-reset output must carry no derivative kick from the old
    // error: with a zero error it stays at zero.
    let out = pid.calculate(20.0, 20.0, 20_500);
    assert!(approx_eq!(f64, out, 0.0, epsilon = 0.001));
}

#[test]
fn test_pid_autotune_bounds() {
    let mut pid: Pid<f64> = Pid::new(4.9, 0.08, 1.5);
    pid.autotune = true;
    pid.reset(0);
    // Large error pushes kp up, but never past 5.0.
    for i in 1..=50 {
        pid.calculate(1000.0, 20.0, i * 500);
    }
    assert!(pid.kp <= 5.0);
    assert!(approx_eq!(f64, pid.kp, 5.0, epsilon = 0.001));

    let mut pid: Pid<f64> = Pid::new(2.05, 0.08, 1.5);
    pid.autotune = true;
    pid.reset(0);
    // Small, quiet error relaxes kp down toward (but not past) 2.0.
    for i in 1..=200 {
        pid.calculate(100.0, 99.0, i * 500);
    }
    assert!(pid.kp >= 2.0);
    assert!(approx_eq!(f64, pid.kp, 2.0, epsilon = 0.001));
}

#[test]
fn test_pid_autotune_disabled_by_default() {
    let mut pid: Pid<f64> = Pid::default();
    pid.reset(0);
    for i in 1..=50 {
        pid.calculate(1000.0, 20.0, i * 500);
    }
    assert!(approx_eq!(f64, pid.kp, 3.2, epsilon = 1e-9));
}

#[test]
fn test_pid_history_bounded() {
    let mut pid: Pid<f64> = Pid::default();
    pid.reset(0);
    for i in 1..=250 {
        pid.calculate(100.0, 20.0, i * 500);
    }
    assert_eq!(pid.error_history().count(), 100);
}

#[test]
fn test_pid_stability() {
    // Simple furnace model for testing.
    let mut temp = 25.0;
    let ambient = 25.0;
    let setpoint = 850.0;
    let mut pid: Pid<f64> = Pid::default();
    pid.reset(0);

    // Simulate for a while at one tick per second.
    for i in 1..=4000u64 {
        let output = pid.calculate(setpoint, temp, i * 1000);
        // Simplified model: temp change is proportional to output and heat loss.
        temp += output * 0.012 - (temp - ambient) * 0.001;
    }

    assert!(
        (temp - setpoint).abs() < 25.0,
        "Final temp {temp} was not close to setpoint {setpoint}"
    );
}

#[test]
fn test_fusion_mean_of_two_valid() {
    let mut fusion = Fusion::new(20.0, 3);
    let fused = fusion.update(&Sample::Temperature(100.0), &Sample::Temperature(104.0));
    assert!(approx_eq!(f64, fused.value, 102.0, epsilon = 0.001));
    assert!(fused.fresh);
    assert!(!fused.lost);
}

#[test]
fn test_fusion_single_channel_survives() {
    let mut fusion = Fusion::new(20.0, 3);
    let fused = fusion.update(
        &Sample::Fault(SensorFault::OpenCircuit),
        &Sample::Temperature(440.0),
    );
    assert!(approx_eq!(f64, fused.value, 440.0, epsilon = 0.001));
    assert!(fused.fresh);
}

#[test]
fn test_fusion_holds_previous_and_escalates() {
    let mut fusion = Fusion::new(20.0, 3);
    fusion.update(&Sample::Temperature(300.0), &Sample::Temperature(300.0));

    let bus = Sample::Fault(SensorFault::BusError);
    let first = fusion.update(&bus, &bus);
    assert!(approx_eq!(f64, first.value, 300.0, epsilon = 0.001));
    assert!(!first.fresh);
    assert!(!first.lost);

    let second = fusion.update(&bus, &bus);
    assert!(!second.lost);

    // Third consecutive all-invalid tick crosses the threshold.
    let third = fusion.update(&bus, &bus);
    assert!(third.lost);
}

#[test]
fn test_fusion_recovery_resets_miss_count() {
    let mut fusion = Fusion::new(20.0, 3);
    let bus = Sample::Fault(SensorFault::BusError);
    fusion.update(&bus, &bus);
    fusion.update(&bus, &bus);
    // One good read forgives the streak.
    fusion.update(&Sample::Temperature(250.0), &bus);
    assert_eq!(fusion.misses(), 0);
    let fused = fusion.update(&bus, &bus);
    assert!(!fused.lost);
}
