//! # cnc-host
//!
//! Runs the CNC motion core behind its serial line protocol. The `run`
//! subcommand serves stdin/stdout or a Unix socket that emulates the
//! controller's serial port, so ordinary g-code senders can connect; the
//! `batch` subcommand streams a g-code file through the machine in
//! virtual time and prints every acknowledgement plus the final state.
//!
//! ## Concurrency
//!
//! The byte reader runs as an async task so real-time commands (`~ ! ?`
//! ctrl-x) reach the machine even while the foreground is parked inside a
//! planner wait loop; they travel as atomic flag bits, exactly like a
//! serial ISR would deliver them. Complete lines are handed to a
//! dedicated machine thread that owns the protocol state.

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use motion::ExecFlags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info};

use cnc_host::protocol::{apply_realtime_byte, Protocol, LINE_BUFFER_SIZE};
use cnc_host::settings::{FileStore, MemoryStore, SettingsStore};
use cnc_host::{report, ProtocolError};

/// Serial front-end for the CNC motion core.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the line protocol on stdin/stdout or a Unix socket.
    Run(RunArgs),
    /// Stream a g-code file through the machine and print the dialogue.
    Batch(BatchArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path of the persisted settings record (the EEPROM stand-in).
    #[arg(long, default_value = "settings.dat")]
    settings_path: PathBuf,

    /// Serve a Unix socket emulating the serial port instead of stdio.
    #[arg(long)]
    socket_path: Option<String>,
}

#[derive(Parser, Debug)]
struct BatchArgs {
    /// The g-code file to stream.
    gcode_file: PathBuf,

    /// Dump the recorded step/direction trace as JSON after the run.
    #[arg(long)]
    trace_out: Option<PathBuf>,
}

/// A complete inbound line, or the marker for one that outgrew the
/// serial line buffer.
enum Inbound {
    Line(String),
    Overflow,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_server(args).await,
        Commands::Batch(args) => run_batch(args),
    }
}

async fn run_server(args: RunArgs) -> Result<()> {
    match args.socket_path {
        Some(path) => serve_socket(path, args.settings_path).await,
        None => {
            serve_streams(
                tokio::io::stdin(),
                tokio::io::stdout(),
                FileStore::new(args.settings_path),
            )
            .await
        }
    }
}

async fn serve_socket(path: String, settings_path: PathBuf) -> Result<()> {
    // Clean up any stale socket file from a previous run.
    let _ = std::fs::remove_file(&path);
    let listener =
        UnixListener::bind(&path).with_context(|| format!("binding serial socket {path}"))?;
    info!(%path, "serial socket listening");

    // One sender at a time, like a real serial line.
    loop {
        let (stream, _) = listener.accept().await?;
        info!("sender connected");
        let store = FileStore::new(settings_path.clone());
        if let Err(err) = serve_stream(stream, store).await {
            error!(%err, "connection ended with error");
        }
        info!("sender disconnected");
    }
}

async fn serve_stream(stream: UnixStream, store: FileStore) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    serve_streams(read_half, write_half, store).await
}

async fn serve_streams<R, W, S>(reader: R, writer: W, store: S) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
    S: SettingsStore + Send + 'static,
{
    let protocol = Protocol::new(store);
    let flags = protocol.machine.flags();

    let (line_tx, line_rx) = mpsc::channel::<Inbound>();
    let (reply_tx, reply_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    // The machine owns the protocol state on its own thread so it can
    // park in cooperative wait loops without stalling the byte reader.
    let machine_thread = std::thread::spawn(move || machine_loop(protocol, line_rx, reply_tx));
    let reader_task = tokio::spawn(pump_input(reader, flags, line_tx));

    let result = pump_output(writer, reply_rx).await;
    reader_task.abort();
    drop(machine_thread);
    result
}

/// Foreground protocol loop: executes lines, services pending runtime
/// commands, and emits asynchronous reports between lines.
fn machine_loop<S: SettingsStore>(
    mut protocol: Protocol<S>,
    lines: mpsc::Receiver<Inbound>,
    replies: tokio::sync::mpsc::UnboundedSender<String>,
) {
    for message in protocol.startup() {
        if replies.send(message).is_err() {
            return;
        }
    }
    loop {
        match lines.recv_timeout(Duration::from_millis(25)) {
            Ok(Inbound::Line(line)) => {
                for message in protocol.execute_line(&line) {
                    if replies.send(message).is_err() {
                        return;
                    }
                }
            }
            Ok(Inbound::Overflow) => {
                let _ = replies.send(format!("error: {}", ProtocolError::LineOverflow));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        for message in protocol.poll() {
            if replies.send(message).is_err() {
                return;
            }
        }
    }
}

/// Byte reader: peels real-time command bytes out of the stream
/// immediately and assembles everything else into bounded lines.
async fn pump_input<R: AsyncRead + Unpin>(
    mut reader: R,
    flags: Arc<ExecFlags>,
    lines: mpsc::Sender<Inbound>,
) -> Result<()> {
    let mut chunk = [0u8; 512];
    let mut line: heapless::Vec<u8, LINE_BUFFER_SIZE> = heapless::Vec::new();
    let mut overflowed = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        for &byte in &chunk[..n] {
            if apply_realtime_byte(&flags, byte) {
                continue;
            }
            match byte {
                b'\r' => {}
                b'\n' => {
                    let inbound = if overflowed {
                        Inbound::Overflow
                    } else {
                        Inbound::Line(String::from_utf8_lossy(&line).into_owned())
                    };
                    line.clear();
                    overflowed = false;
                    if lines.send(inbound).is_err() {
                        return Ok(());
                    }
                }
                _ => {
                    if line.push(byte).is_err() {
                        overflowed = true;
                    }
                }
            }
        }
    }
}

async fn pump_output<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut replies: tokio::sync::mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    while let Some(line) = replies.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Batch mode: run a whole file in virtual time with an in-memory
/// settings store, printing the full dialogue and the final state.
fn run_batch(args: BatchArgs) -> Result<()> {
    let mut protocol = Protocol::new(MemoryStore::default());
    protocol.machine.port.trace_enabled = args.trace_out.is_some();

    for message in protocol.startup() {
        println!("{message}");
    }

    let file = File::open(&args.gcode_file)
        .with_context(|| format!("opening g-code file {:?}", args.gcode_file))?;
    for (line_number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        println!("[L{}] {}", line_number + 1, line);
        for message in protocol.execute_line(&line) {
            println!("{message}");
        }
        for message in protocol.poll() {
            println!("{message}");
        }
    }

    let _ = protocol.machine.synchronize();
    for message in protocol.poll() {
        println!("{message}");
    }
    println!(
        "{}",
        report::status_report(&protocol.machine, &protocol.settings, &protocol.parser)
    );

    if let Some(path) = args.trace_out {
        let json = serde_json::to_string_pretty(&protocol.machine.port.trace)
            .context("serializing step trace")?;
        std::fs::write(&path, json).with_context(|| format!("writing trace to {path:?}"))?;
        info!(?path, "step trace written");
    }
    Ok(())
}
