//! The line protocol: g-code acknowledgement, `$` system commands,
//! real-time command bytes, and the report plumbing around the machine.

use motion::{ExecFlags, MachineState};
use runtime::{Machine, MachineError};
use tracing::{debug, warn};

use crate::errors::ProtocolError;
use crate::gcode::{Action, ParserState};
use crate::report;
use crate::settings::{load_or_default, Settings, SettingsStore, N_STARTUP_LINES};

/// Serial lines longer than this are rejected outright.
pub const LINE_BUFFER_SIZE: usize = 80;

/// Map a real-time byte onto the pending-command bitset. Returns false
/// for ordinary bytes that belong to the line stream.
pub fn apply_realtime_byte(flags: &ExecFlags, byte: u8) -> bool {
    let bit = match byte {
        b'~' => ExecFlags::CYCLE_START,
        b'!' => ExecFlags::FEED_HOLD,
        b'?' => ExecFlags::STATUS_REPORT,
        0x18 => ExecFlags::ABORT,
        _ => return false,
    };
    flags.set(bit);
    true
}

pub struct Protocol<S: SettingsStore> {
    pub machine: Machine,
    pub parser: ParserState,
    pub settings: Settings,
    store: S,
    check_mode: bool,
    announced_reset_count: u32,
}

impl<S: SettingsStore> Protocol<S> {
    pub fn new(mut store: S) -> Self {
        let settings = load_or_default(&mut store);
        let mut machine = Machine::new(settings.planner_config(), settings.stepper_config());
        machine.sys.auto_start = settings.auto_start;
        // Boot into the alarm lock when homing is enforced.
        machine.boot(settings.homing_enable);
        let parser = ParserState::new(&settings);
        Self {
            machine,
            parser,
            settings,
            store,
            check_mode: false,
            announced_reset_count: 0,
        }
    }

    pub fn banner() -> String {
        format!("cnc-host {} ['$' for help]", env!("CARGO_PKG_VERSION"))
    }

    /// Power-on greeting plus the persisted startup lines.
    pub fn startup(&mut self) -> Vec<String> {
        let mut out = vec![Self::banner()];
        if self.machine.state() == MachineState::Alarm {
            out.push(report::feedback("'$H'|'$X' to unlock"));
        } else {
            out.extend(self.run_startup_lines());
        }
        out
    }

    fn run_startup_lines(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        let lines: Vec<String> = self
            .settings
            .startup_lines
            .iter()
            .filter(|line| !line.is_empty())
            .cloned()
            .collect();
        for line in lines {
            out.push(format!(">{line}"));
            out.extend(self.execute_line(&line));
        }
        out
    }

    /// Execute one complete input line and return the response lines.
    pub fn execute_line(&mut self, raw: &str) -> Vec<String> {
        let line = raw.trim();
        if line.len() > LINE_BUFFER_SIZE {
            return vec![format!("error: {}", ProtocolError::LineOverflow)];
        }
        debug!(line, "executing");
        if let Some(body) = line.strip_prefix('$') {
            self.system_command(body)
        } else {
            match self.run_gcode(line) {
                Ok(()) => vec!["ok".to_string()],
                Err(err) => vec![format!("error: {err}")],
            }
        }
    }

    /// Service pending runtime commands and collect any asynchronous
    /// output (alarm messages, status reports, reset banners). Call this
    /// between lines and while otherwise idle.
    pub fn poll(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        self.machine.service_pending();

        if self.machine.reset_count() != self.announced_reset_count {
            self.announced_reset_count = self.machine.reset_count();
            // A reset re-initializes the session, like a power cycle.
            self.check_mode = false;
            self.parser = ParserState::new(&self.settings);
            self.parser
                .sync_position(report::machine_position_mm(&self.machine, &self.settings));
            out.push(Self::banner());
            if self.machine.state() == MachineState::Alarm {
                out.push(report::feedback("'$H'|'$X' to unlock"));
            }
        }
        if let Some(reason) = self.machine.take_alarm_message() {
            out.push(report::alarm(reason));
        }
        if self.machine.flags().take(ExecFlags::STATUS_REPORT) {
            out.push(report::status_report(
                &self.machine,
                &self.settings,
                &self.parser,
            ));
        }
        out
    }

    fn run_gcode(&mut self, line: &str) -> Result<(), ProtocolError> {
        if self.machine.state() == MachineState::Alarm {
            return Err(ProtocolError::AlarmLock);
        }
        let actions = self.parser.process_line(line, &self.settings)?;
        for action in actions {
            match action {
                Action::Move { target, feed } => {
                    if self.check_mode {
                        // Validated only; position tracked virtually.
                        self.parser.finish_move(target);
                        continue;
                    }
                    self.machine
                        .plan_line(target, feed)
                        .map_err(map_machine_error)?;
                    self.parser.finish_move(target);
                }
                Action::ProgramEnd => {
                    if !self.check_mode {
                        self.machine.synchronize().map_err(map_machine_error)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn system_command(&mut self, body: &str) -> Vec<String> {
        let alarmed = self.machine.state() == MachineState::Alarm;
        match body {
            "" | "help" => vec![
                report::feedback("$$ $# $G $N $x=value $Nx=line $C $X $H ~ ! ? ctrl-x"),
                "ok".to_string(),
            ],
            "$" => {
                let mut out = self.settings.dump();
                out.push("ok".to_string());
                out
            }
            "#" => vec![
                report::offsets_report(&self.parser, &self.settings),
                "ok".to_string(),
            ],
            "G" => vec![self.parser.modal_report(), "ok".to_string()],
            "N" => {
                let mut out = self.settings.dump_startup_lines();
                out.push("ok".to_string());
                out
            }
            "C" => self.toggle_check_mode(),
            "X" => self.kill_alarm_lock(),
            "H" => self.run_homing_command(),
            _ => {
                if alarmed {
                    return vec![format!("error: {}", ProtocolError::AlarmLock)];
                }
                match self.assignment_command(body) {
                    Ok(out) => out,
                    Err(err) => vec![format!("error: {err}")],
                }
            }
        }
    }

    fn toggle_check_mode(&mut self) -> Vec<String> {
        if self.check_mode {
            // Leaving check mode re-initializes the session.
            self.check_mode = false;
            self.parser = ParserState::new(&self.settings);
            self.parser
                .sync_position(report::machine_position_mm(&self.machine, &self.settings));
            self.machine.sys.state = MachineState::Idle;
            return vec![report::feedback("Disabled"), "ok".to_string()];
        }
        if self.machine.state() == MachineState::Alarm {
            return vec![format!("error: {}", ProtocolError::AlarmLock)];
        }
        if self.machine.state() != MachineState::Idle {
            return vec![format!("error: {}", ProtocolError::Busy)];
        }
        self.check_mode = true;
        self.machine.sys.state = MachineState::CheckMode;
        vec![report::feedback("Enabled"), "ok".to_string()]
    }

    fn kill_alarm_lock(&mut self) -> Vec<String> {
        if self.machine.state() != MachineState::Alarm {
            return vec!["ok".to_string()];
        }
        self.machine.flags().set(ExecFlags::RESET_ALARM);
        self.machine.service_pending();
        // The position may be stale; warn but let the user proceed.
        vec![report::feedback("Caution: Unlocked"), "ok".to_string()]
    }

    fn run_homing_command(&mut self) -> Vec<String> {
        if !self.settings.homing_enable {
            return vec![format!("error: {}", ProtocolError::SettingDisabled)];
        }
        match self.machine.run_homing(
            self.settings.homing_pulloff,
            self.settings.homing_seek_rate,
            self.settings.homing_dir_mask,
        ) {
            Ok(()) => {
                self.parser
                    .sync_position(report::machine_position_mm(&self.machine, &self.settings));
                vec!["ok".to_string()]
            }
            Err(err) => vec![format!("error: {}", map_machine_error(err))],
        }
    }

    /// `$x=value` and `$Nx=line` assignments.
    fn assignment_command(&mut self, body: &str) -> Result<Vec<String>, ProtocolError> {
        let (key, value) = body
            .split_once('=')
            .ok_or(ProtocolError::UnsupportedStatement)?;
        if self.machine.state() != MachineState::Idle {
            return Err(ProtocolError::Busy);
        }

        if let Some(index_str) = key.strip_prefix('N') {
            let index: usize = index_str
                .trim()
                .parse()
                .map_err(|_| ProtocolError::BadNumberFormat)?;
            if index >= N_STARTUP_LINES {
                return Err(ProtocolError::InvalidSetting);
            }
            if value.len() > LINE_BUFFER_SIZE {
                return Err(ProtocolError::LineOverflow);
            }
            self.settings.startup_lines[index] = value.trim().to_string();
            self.persist_settings();
            return Ok(vec!["ok".to_string()]);
        }

        let index: u8 = key
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadNumberFormat)?;
        let value: f32 = value
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadNumberFormat)?;
        self.settings.set_numeric(index, value)?;
        self.persist_settings();
        self.machine.apply_settings(
            self.settings.planner_config(),
            self.settings.stepper_config(),
            self.settings.auto_start,
        );
        Ok(vec!["ok".to_string()])
    }

    /// Hand back the settings store, e.g. to simulate a power cycle.
    pub fn into_store(self) -> S {
        self.store
    }

    fn persist_settings(&mut self) {
        match self.settings.to_record() {
            Ok(record) => {
                if let Err(err) = self.store.write(&record) {
                    warn!(%err, "failed to persist settings");
                }
            }
            Err(err) => warn!(%err, "failed to serialize settings"),
        }
    }
}

fn map_machine_error(err: MachineError) -> ProtocolError {
    match err {
        MachineError::AlarmLock => ProtocolError::AlarmLock,
        MachineError::InvalidFeedRate => ProtocolError::UndefinedFeedRate,
        MachineError::NotIdle | MachineError::Runaway(_) => ProtocolError::Busy,
    }
}
