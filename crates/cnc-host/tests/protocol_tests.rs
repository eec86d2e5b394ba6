//! Protocol-level tests: settings round trips, alarm lockout, reports,
//! check mode, and startup lines.

use cnc_host::protocol::{apply_realtime_byte, Protocol};
use cnc_host::settings::MemoryStore;
use motion::ExecFlags;

fn protocol() -> Protocol<MemoryStore> {
    Protocol::new(MemoryStore::default())
}

fn ok(replies: &[String]) -> bool {
    replies.last().map(String::as_str) == Some("ok")
}

#[test]
fn plain_gcode_line_is_acknowledged_and_executed() {
    let mut protocol = protocol();
    let replies = protocol.execute_line("G1 X10 F600");
    assert_eq!(replies, vec!["ok".to_string()]);

    protocol.machine.synchronize().unwrap();
    let expected = (10.0 * protocol.settings.steps_per_mm[0]) as i32;
    assert_eq!(protocol.machine.position_steps()[0], expected);
}

#[test]
fn settings_round_trip_through_dump_and_store() {
    let mut protocol = protocol();
    assert!(ok(&protocol.execute_line("$0=80.5")));
    assert!(ok(&protocol.execute_line("$9=0.02")));

    let dump = protocol.execute_line("$$");
    assert!(dump.iter().any(|l| l.starts_with("$0=80.500")), "{dump:?}");
    assert!(dump.iter().any(|l| l.starts_with("$9=0.020")), "{dump:?}");

    // Parse every dumped value back and compare to printed precision.
    for line in dump.iter().filter(|l| l.starts_with('$')) {
        let (key, rest) = line[1..].split_once('=').unwrap();
        let value: f32 = rest.split_whitespace().next().unwrap().parse().unwrap();
        let mut copy = protocol.settings.clone();
        copy.set_numeric(key.parse().unwrap(), value).unwrap();
        // Re-assigning the printed value must not change the record.
        assert_eq!(copy, protocol.settings, "setting ${key} drifted");
    }
}

#[test]
fn settings_survive_a_power_cycle() {
    let mut protocol = protocol();
    assert!(ok(&protocol.execute_line("$0=80.5")));
    assert!(ok(&protocol.execute_line("$N0=G21 G90")));
    let store = protocol.into_store();

    let reloaded = Protocol::new(store);
    assert_eq!(reloaded.settings.steps_per_mm[0], 80.5);
    assert_eq!(reloaded.settings.startup_lines[0], "G21 G90");
}

#[test]
fn unknown_and_invalid_settings_are_rejected() {
    let mut protocol = protocol();
    assert_eq!(
        protocol.execute_line("$99=1"),
        vec!["error: Invalid setting".to_string()]
    );
    assert_eq!(
        protocol.execute_line("$3=1"),
        vec!["error: Step pulse must be >= 3 microseconds".to_string()]
    );
    assert_eq!(
        protocol.execute_line("$0=abc"),
        vec!["error: Bad number format".to_string()]
    );
}

#[test]
fn status_report_via_realtime_byte() {
    let mut protocol = protocol();
    apply_realtime_byte(&protocol.machine.flags(), b'?');
    let out = protocol.poll();
    assert_eq!(
        out,
        vec!["<Idle,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000>".to_string()]
    );
}

#[test]
fn alarm_locks_out_gcode_until_unlocked() {
    let mut protocol = protocol();
    protocol.machine.trigger_hard_limit();

    let out = protocol.poll();
    assert!(
        out.iter().any(|l| l == "ALARM: Hard limit. MPos?"),
        "{out:?}"
    );

    assert_eq!(
        protocol.execute_line("G1 X1 F100"),
        vec!["error: Alarm lock".to_string()]
    );
    // Settings views stay available while locked.
    assert!(ok(&protocol.execute_line("$$")));
    assert_eq!(
        protocol.execute_line("$5=100"),
        vec!["error: Alarm lock".to_string()]
    );

    let out = protocol.execute_line("$X");
    assert_eq!(
        out,
        vec!["[Caution: Unlocked]".to_string(), "ok".to_string()]
    );
    assert!(ok(&protocol.execute_line("G1 X1 F100")));
}

#[test]
fn soft_reset_reannounces_and_preserves_idle() {
    let mut protocol = protocol();
    apply_realtime_byte(&protocol.machine.flags(), 0x18);
    let out = protocol.poll();
    assert!(out[0].starts_with("cnc-host"), "{out:?}");
}

#[test]
fn check_mode_parses_without_moving() {
    let mut protocol = protocol();
    assert_eq!(
        protocol.execute_line("$C"),
        vec!["[Enabled]".to_string(), "ok".to_string()]
    );
    assert!(ok(&protocol.execute_line("G1 X25 F500")));
    assert_eq!(protocol.machine.position_steps(), [0, 0, 0]);

    // Bad lines still error in check mode.
    assert_eq!(
        protocol.execute_line("G55"),
        vec!["error: Unsupported statement".to_string()]
    );

    assert_eq!(
        protocol.execute_line("$C"),
        vec!["[Disabled]".to_string(), "ok".to_string()]
    );
    // Leaving check mode dropped the virtual position.
    apply_realtime_byte(&protocol.machine.flags(), b'?');
    let out = protocol.poll();
    assert!(out[0].starts_with("<Idle,MPos:0.000"), "{out:?}");
}

#[test]
fn g92_offset_shows_in_wpos_and_parameters() {
    let mut protocol = protocol();
    assert!(ok(&protocol.execute_line("G1 X10 F600")));
    protocol.machine.synchronize().unwrap();
    assert!(ok(&protocol.execute_line("G92 X0")));

    let out = protocol.execute_line("$#");
    assert_eq!(out[0], "[G92:10.000,0.000,0.000]");

    apply_realtime_byte(&protocol.machine.flags(), b'?');
    let report = protocol.poll();
    assert_eq!(
        report,
        vec!["<Idle,MPos:10.000,0.000,0.000,WPos:0.000,0.000,0.000>".to_string()]
    );
}

#[test]
fn modal_state_report() {
    let mut protocol = protocol();
    assert!(ok(&protocol.execute_line("G1 X1 F450")));
    let out = protocol.execute_line("$G");
    assert_eq!(out[0], "[G1 G90 G94 G21 F450.000]");
}

#[test]
fn startup_lines_run_on_boot() {
    let store = {
        let mut protocol = Protocol::new(MemoryStore::default());
        assert!(ok(&protocol.execute_line("$N0=G91")));
        protocol.into_store()
    };

    let mut protocol = Protocol::new(store);
    let out = protocol.startup();
    assert!(out[0].starts_with("cnc-host"));
    assert_eq!(out[1], ">G91");
    assert_eq!(out[2], "ok");
    // The startup line left the parser in relative mode.
    let modal = protocol.execute_line("$G");
    assert!(modal[0].contains("G91"), "{modal:?}");
}

#[test]
fn homing_is_gated_by_its_setting() {
    let mut protocol = protocol();
    assert_eq!(
        protocol.execute_line("$H"),
        vec!["error: Setting disabled".to_string()]
    );

    assert!(ok(&protocol.execute_line("$17=1")));
    assert!(ok(&protocol.execute_line("$H")));
    assert_eq!(protocol.machine.position_steps(), [0, 0, 0]);
}

#[test]
fn overlong_lines_report_overflow() {
    let mut protocol = protocol();
    let long_line = "G1 X1 ".repeat(20);
    assert_eq!(
        protocol.execute_line(&long_line),
        vec!["error: Line overflow".to_string()]
    );
}

#[test]
fn busy_settings_write_is_rejected_mid_queue() {
    let mut protocol = protocol();
    // Disable auto start so the queue sits in Queue state.
    assert!(ok(&protocol.execute_line("$14=0")));
    assert!(ok(&protocol.execute_line("G1 X1 F100")));
    assert_eq!(
        protocol.execute_line("$5=400"),
        vec!["error: Busy or queued".to_string()]
    );
    // Drain via cycle start so the machine ends clean.
    apply_realtime_byte(&protocol.machine.flags(), b'~');
    protocol.machine.synchronize().unwrap();
}

#[test]
fn realtime_bytes_map_to_flags() {
    let flags = ExecFlags::new();
    assert!(apply_realtime_byte(&flags, b'~'));
    assert!(apply_realtime_byte(&flags, b'!'));
    assert!(apply_realtime_byte(&flags, 0x18));
    assert!(!apply_realtime_byte(&flags, b'G'));
    assert!(flags.take(ExecFlags::CYCLE_START));
    assert!(flags.take(ExecFlags::FEED_HOLD));
    assert!(flags.take(ExecFlags::ABORT));
}
