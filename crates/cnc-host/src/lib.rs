//! # CNC Host
//!
//! Serial front-end for the motion core: the line protocol, the `$`
//! settings store, the g-code parser for the motion surface, and
//! status/alarm reporting. The binary in `main.rs` serves this over
//! stdin/stdout or a Unix socket emulating the serial port.

pub mod errors;
pub mod gcode;
pub mod protocol;
pub mod report;
pub mod settings;

pub use errors::ProtocolError;
pub use protocol::{apply_realtime_byte, Protocol, LINE_BUFFER_SIZE};
pub use settings::{FileStore, MemoryStore, Settings, SettingsStore};
