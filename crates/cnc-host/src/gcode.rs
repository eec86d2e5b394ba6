//! Minimal modal g-code parser for the motion surface: linear moves,
//! units, distance mode, feed mode, and the G92 coordinate offset.
//! Arc interpolation, spindle, and coolant words belong to external
//! collaborators and are rejected as unsupported.

use motion::{FeedRate, N_AXIS};

use crate::errors::ProtocolError;
use crate::settings::Settings;

const MM_PER_INCH: f32 = 25.4;

/// What a parsed line asks the machine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Straight move to an absolute machine-coordinate target, mm.
    Move { target: [f32; N_AXIS], feed: FeedRate },
    /// M2/M30: drain the queue and reset the non-persistent modals.
    ProgramEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionMode {
    Seek,
    Feed,
}

/// Modal parser state, persisted across lines.
#[derive(Debug)]
pub struct ParserState {
    motion_mode: MotionMode,
    inches: bool,
    absolute: bool,
    inverse_feed: bool,
    /// Modal feed, always stored in mm/min.
    feed_rate: f32,
    /// Machine-coordinate position the parsed program has reached, mm.
    position: [f32; N_AXIS],
    g92_offset: [f32; N_AXIS],
}

impl ParserState {
    pub fn new(settings: &Settings) -> Self {
        Self {
            motion_mode: MotionMode::Seek,
            inches: false,
            absolute: true,
            inverse_feed: false,
            feed_rate: settings.default_feed_rate,
            position: [0.0; N_AXIS],
            g92_offset: [0.0; N_AXIS],
        }
    }

    /// Re-sync after anything that moved the machine outside the parser's
    /// view (reset, homing, unlock).
    pub fn sync_position(&mut self, machine_mm: [f32; N_AXIS]) {
        self.position = machine_mm;
    }

    /// Commit a successfully executed move.
    pub fn finish_move(&mut self, target: [f32; N_AXIS]) {
        self.position = target;
    }

    pub fn g92_offset(&self) -> [f32; N_AXIS] {
        self.g92_offset
    }

    /// `$G` modal state line.
    pub fn modal_report(&self) -> String {
        format!(
            "[{} {} {} {} F{:.3}]",
            match self.motion_mode {
                MotionMode::Seek => "G0",
                MotionMode::Feed => "G1",
            },
            if self.absolute { "G90" } else { "G91" },
            if self.inverse_feed { "G93" } else { "G94" },
            if self.inches { "G20" } else { "G21" },
            self.feed_rate,
        )
    }

    fn to_mm(&self, value: f32) -> f32 {
        if self.inches {
            value * MM_PER_INCH
        } else {
            value
        }
    }

    /// Parse and apply one line; returns the actions the protocol layer
    /// should execute. Modal state updates even when the line carries no
    /// motion.
    pub fn process_line(
        &mut self,
        line: &str,
        settings: &Settings,
    ) -> Result<Vec<Action>, ProtocolError> {
        let words = tokenize(line)?;

        let mut motion_words = 0u8;
        let mut axis_words: [Option<f32>; N_AXIS] = [None; N_AXIS];
        let mut feed_word: Option<f32> = None;
        let mut set_offset = false;
        let mut clear_offset = false;
        let mut program_end = false;

        for (letter, value) in words {
            match letter {
                'G' => match (value * 10.0).round() as i32 {
                    0 => {
                        self.motion_mode = MotionMode::Seek;
                        motion_words += 1;
                    }
                    10 => {
                        self.motion_mode = MotionMode::Feed;
                        motion_words += 1;
                    }
                    200 => self.inches = true,
                    210 => self.inches = false,
                    900 => self.absolute = true,
                    910 => self.absolute = false,
                    920 => set_offset = true,
                    921 => clear_offset = true,
                    930 => self.inverse_feed = true,
                    940 => self.inverse_feed = false,
                    _ => return Err(ProtocolError::UnsupportedStatement),
                },
                'M' => match value.round() as i32 {
                    2 | 30 => program_end = true,
                    _ => return Err(ProtocolError::UnsupportedStatement),
                },
                'F' => feed_word = Some(value),
                'X' => axis_words[0] = Some(value),
                'Y' => axis_words[1] = Some(value),
                'Z' => axis_words[2] = Some(value),
                // Line numbers carry no meaning here.
                'N' => {}
                // Spindle and tool words belong to external collaborators.
                'S' | 'T' => return Err(ProtocolError::UnsupportedStatement),
                _ => return Err(ProtocolError::UnsupportedStatement),
            }
        }

        if motion_words > 1 || (set_offset && clear_offset) {
            return Err(ProtocolError::ModalGroupViolation);
        }

        // The feed word updates the modal rate in units mode; in inverse
        // time mode it only ever applies to this line's move.
        if let Some(feed) = feed_word {
            if !self.inverse_feed {
                if feed <= 0.0 {
                    return Err(ProtocolError::BadNumberFormat);
                }
                self.feed_rate = self.to_mm(feed);
            }
        }

        let has_axis_words = axis_words.iter().any(Option::is_some);
        let mut actions = Vec::new();

        if clear_offset {
            self.g92_offset = [0.0; N_AXIS];
        }

        if set_offset {
            if !has_axis_words {
                return Err(ProtocolError::InvalidStatement);
            }
            if motion_words > 0 {
                // G92 claims the axis words for itself.
                return Err(ProtocolError::ModalGroupViolation);
            }
            for i in 0..N_AXIS {
                if let Some(value) = axis_words[i] {
                    self.g92_offset[i] = self.position[i] - self.to_mm(value);
                }
            }
        } else if has_axis_words {
            let mut target = self.position;
            for i in 0..N_AXIS {
                if let Some(value) = axis_words[i] {
                    let value_mm = self.to_mm(value);
                    target[i] = if self.absolute {
                        value_mm + self.g92_offset[i]
                    } else {
                        self.position[i] + value_mm
                    };
                }
            }
            let feed = match self.motion_mode {
                MotionMode::Seek => FeedRate::UnitsPerMinute(settings.default_seek_rate),
                MotionMode::Feed => {
                    if self.inverse_feed {
                        // Inverse time requires a fresh F word on every
                        // motion line.
                        let inverse = feed_word.ok_or(ProtocolError::UndefinedFeedRate)?;
                        if inverse <= 0.0 {
                            return Err(ProtocolError::UndefinedFeedRate);
                        }
                        FeedRate::InverseTime(inverse)
                    } else {
                        if self.feed_rate <= 0.0 {
                            return Err(ProtocolError::UndefinedFeedRate);
                        }
                        FeedRate::UnitsPerMinute(self.feed_rate)
                    }
                }
            };
            actions.push(Action::Move { target, feed });
        }

        if program_end {
            actions.push(Action::ProgramEnd);
        }
        Ok(actions)
    }
}

/// Split a line into `(letter, number)` words. Parenthesized and `;`
/// comments are stripped; whitespace is free.
fn tokenize(line: &str) -> Result<Vec<(char, f32)>, ProtocolError> {
    let mut words = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == ';' {
            break;
        }
        if c == '(' {
            while i < bytes.len() && bytes[i] as char != ')' {
                i += 1;
            }
            i += 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(ProtocolError::ExpectedCommandLetter);
        }
        let letter = c.to_ascii_uppercase();
        i += 1;
        let start = i;
        while i < bytes.len() {
            let d = bytes[i] as char;
            if d.is_ascii_digit() || d == '.' || d == '-' || d == '+' {
                i += 1;
            } else {
                break;
            }
        }
        let number: f32 = line[start..i]
            .parse()
            .map_err(|_| ProtocolError::BadNumberFormat)?;
        words.push((letter, number));
    }
    Ok(words)
}
