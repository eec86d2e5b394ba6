//! Status, feedback, and alarm message formatting for the serial link.

use motion::{MachineState, N_AXIS};
use runtime::Machine;

use crate::gcode::ParserState;
use crate::settings::Settings;

const MM_PER_INCH: f32 = 25.4;

fn state_name(state: MachineState) -> &'static str {
    match state {
        MachineState::Init | MachineState::Idle => "Idle",
        MachineState::Queued => "Queue",
        MachineState::Cycle => "Run",
        MachineState::Hold => "Hold",
        MachineState::Homing => "Home",
        MachineState::Alarm => "Alarm",
        MachineState::CheckMode => "Check",
    }
}

fn format_axes(values: [f32; N_AXIS], settings: &Settings) -> String {
    let decimals = settings.decimal_places as usize;
    let scale = if settings.report_inches {
        1.0 / MM_PER_INCH
    } else {
        1.0
    };
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{:.*}", decimals, value * scale));
    }
    out
}

/// Machine position in mm, derived from the authoritative step counts.
pub fn machine_position_mm(machine: &Machine, settings: &Settings) -> [f32; N_AXIS] {
    let steps = machine.position_steps();
    let mut mm = [0.0; N_AXIS];
    for i in 0..N_AXIS {
        mm[i] = steps[i] as f32 / settings.steps_per_mm[i];
    }
    mm
}

/// The `?` real-time report: `<State,MPos:x,y,z,WPos:x,y,z>`.
pub fn status_report(machine: &Machine, settings: &Settings, parser: &ParserState) -> String {
    let mpos = machine_position_mm(machine, settings);
    let offset = parser.g92_offset();
    let mut wpos = [0.0; N_AXIS];
    for i in 0..N_AXIS {
        wpos[i] = mpos[i] - offset[i];
    }
    format!(
        "<{},MPos:{},WPos:{}>",
        state_name(machine.state()),
        format_axes(mpos, settings),
        format_axes(wpos, settings),
    )
}

/// `$#` coordinate-parameter listing.
pub fn offsets_report(parser: &ParserState, settings: &Settings) -> String {
    format!("[G92:{}]", format_axes(parser.g92_offset(), settings))
}

pub fn feedback(message: &str) -> String {
    format!("[{message}]")
}

pub fn alarm(message: &str) -> String {
    format!("ALARM: {message}. MPos?")
}
