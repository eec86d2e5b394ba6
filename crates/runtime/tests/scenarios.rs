//! End-to-end scenarios driven through the virtual clock: straight lines,
//! backpressure, feed hold, hard limits, and homing.

use motion::{ExecFlags, FeedRate, MachineState, PlannerConfig, N_AXIS};
use runtime::{Machine, MachineError};
use stepper::StepperConfig;

const MAX_EVENTS: u64 = 50_000_000;

fn make_machine(auto_start: bool) -> Machine {
    let planner_cfg = PlannerConfig {
        steps_per_mm: [100.0; N_AXIS],
        acceleration: [36_000.0; N_AXIS], // 10 mm/s²
        junction_deviation: 0.05,
    };
    let stepper_cfg = StepperConfig::default();
    let mut machine = Machine::new(planner_cfg, stepper_cfg);
    machine.boot(false);
    machine.sys.auto_start = auto_start;
    machine
}

#[test]
fn single_axis_straight_line_executes_exact_steps() {
    let mut machine = make_machine(true);
    machine.timer.log_periods = true;

    machine
        .plan_line([10.0, 0.0, 0.0], FeedRate::UnitsPerMinute(600.0))
        .unwrap();
    machine.run_until_idle(MAX_EVENTS).unwrap();

    // 10 mm at 100 steps/mm: exactly 1000 step events on X, nothing else.
    assert_eq!(machine.port.pulses, [1000, 0, 0]);
    assert_eq!(machine.port.position, [1000, 0, 0]);
    assert_eq!(machine.sys.position, [1000, 0, 0]);
    assert_eq!(machine.state(), MachineState::Idle);

    // The profile just touches nominal speed: 600 mm/min → 60000
    // steps/min → a 16000-cycle reload, give or take one rate_delta of
    // tick discretization at the degenerate accel/decel boundary.
    let min_period = machine.timer.period_log.iter().copied().min().unwrap();
    assert!(
        (16_000..=16_400).contains(&min_period),
        "min period {min_period}"
    );
}

#[test]
fn cruise_phase_snaps_to_the_exact_nominal_rate() {
    let mut machine = make_machine(true);
    machine.timer.log_periods = true;

    // Long enough for a real cruise region.
    machine
        .plan_line([20.0, 0.0, 0.0], FeedRate::UnitsPerMinute(600.0))
        .unwrap();
    machine.run_until_idle(MAX_EVENTS).unwrap();

    let min_period = machine.timer.period_log.iter().copied().min().unwrap();
    assert_eq!(min_period, 16_000, "60·F_CPU/rate for the nominal rate");
}

#[test]
fn two_block_corner_preserves_exact_counts() {
    let mut machine = make_machine(true);

    machine
        .plan_line([20.0, 0.0, 0.0], FeedRate::UnitsPerMinute(1200.0))
        .unwrap();
    machine
        .plan_line([20.0, 20.0, 0.0], FeedRate::UnitsPerMinute(1200.0))
        .unwrap();
    machine.run_until_idle(MAX_EVENTS).unwrap();

    assert_eq!(machine.sys.position, [2000, 2000, 0]);
    assert_eq!(machine.port.position, [2000, 2000, 0]);
    assert_eq!(machine.port.pulses, [2000, 2000, 0]);
}

#[test]
fn backpressure_drains_through_the_stepper() {
    let mut machine = make_machine(true);

    // Far more segments than the buffer holds; every append must
    // eventually return by draining in virtual time.
    for i in 1..=40 {
        machine
            .plan_line([i as f32, 0.0, 0.0], FeedRate::UnitsPerMinute(900.0))
            .unwrap();
    }
    machine.run_until_idle(MAX_EVENTS).unwrap();

    assert_eq!(machine.sys.position, [4000, 0, 0]);
    assert_eq!(machine.port.position, [4000, 0, 0]);
}

#[test]
fn blocked_append_waits_for_cycle_start() {
    let mut machine = make_machine(false);
    let flags = machine.flags();

    // A parked producer only unblocks when someone issues cycle start.
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        flags.set(ExecFlags::CYCLE_START);
    });

    for i in 1..=motion::BLOCK_BUFFER_SIZE + 4 {
        machine
            .plan_line([i as f32, 0.0, 0.0], FeedRate::UnitsPerMinute(900.0))
            .unwrap();
    }
    trigger.join().unwrap();
    machine.run_until_idle(MAX_EVENTS).unwrap();

    let total = (motion::BLOCK_BUFFER_SIZE as i32 + 4) * 100;
    assert_eq!(machine.sys.position, [total, 0, 0]);
}

#[test]
fn feed_hold_mid_block_then_resume_completes_exactly() {
    let mut machine = make_machine(true);
    machine.timer.log_periods = true;

    machine
        .plan_line([100.0, 0.0, 0.0], FeedRate::UnitsPerMinute(1000.0))
        .unwrap();

    // Let roughly 200 step events through, then pull the hold.
    let mut guard = 0;
    while machine.port.position[0] < 200 {
        assert!(machine.dispatch_next(), "stepper idled early");
        guard += 1;
        assert!(guard < 1_000_000);
    }
    let hold_mark = machine.timer.period_log.len();
    machine.flags().set(ExecFlags::FEED_HOLD);
    machine.service_pending();
    assert_eq!(machine.state(), MachineState::Hold);

    machine.run_until_idle(MAX_EVENTS).unwrap();
    assert_eq!(machine.state(), MachineState::Hold);
    assert!(machine.is_hold_complete());
    assert!(machine.sys.position[0] < 10_000);

    // The rate only ever fell once the hold was in force.
    let hold_periods = &machine.timer.period_log[hold_mark..];
    assert!(hold_periods.windows(2).all(|w| w[1] >= w[0]));

    // Resume and finish: the path must be completed exactly.
    machine.flags().set(ExecFlags::CYCLE_START);
    machine.service_pending();
    machine.run_until_idle(MAX_EVENTS).unwrap();

    assert_eq!(machine.state(), MachineState::Idle);
    assert_eq!(machine.sys.position, [10_000, 0, 0]);
    assert_eq!(machine.port.position, [10_000, 0, 0]);
    assert_eq!(machine.port.pulses[0], 10_000);
}

#[test]
fn hold_resume_matches_uninterrupted_run() {
    let run = |hold_at: Option<i64>| -> ([i32; N_AXIS], [i64; N_AXIS]) {
        let mut machine = make_machine(true);
        machine
            .plan_line([30.0, 0.0, 0.0], FeedRate::UnitsPerMinute(900.0))
            .unwrap();
        machine
            .plan_line([30.0, 25.0, 0.0], FeedRate::UnitsPerMinute(900.0))
            .unwrap();

        if let Some(mark) = hold_at {
            while machine.port.position[0] < mark {
                assert!(machine.dispatch_next());
            }
            machine.flags().set(ExecFlags::FEED_HOLD);
            machine.service_pending();
            machine.run_until_idle(MAX_EVENTS).unwrap();
            assert!(machine.is_hold_complete());
            machine.flags().set(ExecFlags::CYCLE_START);
            machine.service_pending();
        }
        machine.run_until_idle(MAX_EVENTS).unwrap();
        (machine.sys.position, machine.port.position)
    };

    let (sys_plain, port_plain) = run(None);
    let (sys_held, port_held) = run(Some(1500));

    assert_eq!(sys_plain, [3000, 2500, 0]);
    assert_eq!(sys_plain, sys_held);
    assert_eq!(port_plain, port_held);
}

#[test]
fn hard_limit_latches_an_alarm() {
    let mut machine = make_machine(true);

    machine
        .plan_line([50.0, 0.0, 0.0], FeedRate::UnitsPerMinute(1200.0))
        .unwrap();
    for _ in 0..500 {
        assert!(machine.dispatch_next());
    }

    machine.trigger_hard_limit();
    assert!(!machine.timer.running, "stepper must disarm immediately");
    machine.service_pending();
    assert_eq!(machine.state(), MachineState::Alarm);
    assert_eq!(machine.take_alarm_message(), Some("Hard limit"));

    // All motion is rejected until the lock is lifted.
    let err = machine
        .plan_line([60.0, 0.0, 0.0], FeedRate::UnitsPerMinute(600.0))
        .unwrap_err();
    assert_eq!(err, MachineError::AlarmLock);

    machine.flags().set(ExecFlags::RESET_ALARM);
    machine.service_pending();
    assert_eq!(machine.state(), MachineState::Idle);
    machine
        .plan_line([1.0, 0.0, 0.0], FeedRate::UnitsPerMinute(600.0))
        .unwrap();
    machine.run_until_idle(MAX_EVENTS).unwrap();
    assert_eq!(machine.state(), MachineState::Idle);
}

#[test]
fn abort_mid_cycle_distrusts_position() {
    let mut machine = make_machine(true);
    machine
        .plan_line([50.0, 0.0, 0.0], FeedRate::UnitsPerMinute(1200.0))
        .unwrap();
    for _ in 0..200 {
        assert!(machine.dispatch_next());
    }

    machine.flags().set(ExecFlags::ABORT);
    machine.service_pending();

    assert_eq!(machine.state(), MachineState::Alarm);
    assert_eq!(machine.take_alarm_message(), Some("Abort during cycle"));
    assert!(machine.buffer.is_empty());
}

#[test]
fn abort_while_idle_stays_unlocked() {
    let mut machine = make_machine(true);
    machine.flags().set(ExecFlags::ABORT);
    machine.service_pending();
    assert_eq!(machine.state(), MachineState::Idle);
    assert_eq!(machine.take_alarm_message(), None);
}

#[test]
fn homing_pulls_off_and_rezeroes() {
    let mut machine = make_machine(true);
    machine.run_homing(1.0, 600.0, 0b001).unwrap();

    assert_eq!(machine.state(), MachineState::Idle);
    assert_eq!(machine.sys.position, [0, 0, 0]);
    // One millimeter of pull-off on each axis, X in the negative
    // direction per the homing direction mask.
    assert_eq!(machine.port.pulses, [100, 100, 100]);
    assert_eq!(machine.port.position[0], -100);
    assert_eq!(machine.port.position[1], 100);
}

#[test]
fn synchronize_drains_the_queue() {
    let mut machine = make_machine(true);
    for i in 1..=5 {
        machine
            .plan_line([i as f32 * 2.0, 0.0, 0.0], FeedRate::UnitsPerMinute(900.0))
            .unwrap();
    }
    machine.synchronize().unwrap();
    assert!(machine.buffer.is_empty());
    assert_eq!(machine.sys.position, [1000, 0, 0]);
}
