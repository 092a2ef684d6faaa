// benchlib test application -- CLI tool for talking SCPI to bench
// instruments and running Rigol DS acquisitions against real hardware or a
// scripted mock oscilloscope.
//
// Usage:
//   benchlib-test-app list
//   benchlib-test-app --conn tcp-raw/192.168.1.20/5555 idn
//   benchlib-test-app --conn usbtmc//dev/usbtmc0 query ':TIM:SCAL?'
//   benchlib-test-app --conn /dev/ttyUSB0 --serialcomm 38400/8n1 send ':RUN'
//   benchlib-test-app --conn vxi/10.0.0.5 acquire --frames 10 --channel 2
//   benchlib-test-app --conn tcp-rigol/10.0.0.7/5555 acquire --memory
//   benchlib-test-app --mock acquire --frames 3

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use benchlib::rigol::models::{self as rigol_models, NUM_DIGITAL_CHANNELS};
use benchlib::rigol::{DataSource, RigolBuilder, RigolScope};
use benchlib::scpi::ScpiSession;
use benchlib::transport::ConnectionSpec;
use benchlib::{Packet, PacketSink, Transport};
use benchlib_test_harness::{MockInstrument, ieee_block};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// benchlib test application -- exercises instruments from the command line.
#[derive(Parser)]
#[command(name = "benchlib-test-app", version, about)]
struct Cli {
    /// Connection string: tcp-raw/HOST/PORT, tcp-rigol/HOST/PORT,
    /// usbtmc/PATH, vxi/HOST[/INSTRUMENT], gpib/..., HOST:PORT or a serial
    /// port path. Required for all commands except `list` unless --mock is
    /// used.
    #[arg(long)]
    conn: Option<String>,

    /// Serial parameters such as 9600/8n1. Serial connections only.
    #[arg(long)]
    serialcomm: Option<String>,

    /// Talk to a scripted DS1104Z instead of real hardware.
    /// Useful for verifying CLI parsing and driver wiring.
    #[arg(long)]
    mock: bool,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all supported instrument models.
    List,

    /// Identify the instrument (*IDN?) and report driver support.
    Idn,

    /// Send a query and print the reply.
    Query {
        /// SCPI query, e.g. ':TIM:SCAL?'.
        command: String,
    },

    /// Send a command that produces no reply.
    Send {
        /// SCPI command, e.g. ':RUN'.
        command: String,
    },

    /// Run an acquisition on a Rigol DS oscilloscope and print each packet.
    Acquire {
        /// Frames to capture. 0 runs until Ctrl-C.
        #[arg(long, default_value_t = 1)]
        frames: u64,

        /// Read the deep memory instead of the screen buffer.
        #[arg(long)]
        memory: bool,

        /// Enable analog channel N (1-based). May be repeated.
        #[arg(long = "channel", value_name = "N")]
        channels: Vec<usize>,

        /// Enable logic analyzer channel N (0-15). May be repeated.
        #[arg(long = "digital", value_name = "N")]
        digital: Vec<usize>,

        /// Interval between acquisition polls in milliseconds.
        #[arg(long, default_value_t = 50)]
        poll_ms: u64,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Parse `--conn` (and `--serialcomm`) into a connection spec.
fn connection_spec(cli: &Cli) -> Result<ConnectionSpec> {
    let Some(conn) = cli.conn.as_deref() else {
        bail!("--conn is required (or use --mock)");
    };
    let spec: ConnectionSpec = conn
        .parse()
        .with_context(|| format!("invalid connection string '{conn}'"))?;
    match cli.serialcomm.as_deref() {
        Some(comm) => spec
            .with_serialcomm(comm)
            .with_context(|| format!("invalid serial comm '{comm}'")),
        None => Ok(spec),
    }
}

/// Build a scripted DS1104Z with channel 1 shown.
fn mock_scope() -> MockInstrument {
    let mock = MockInstrument::new();
    mock.reply("*IDN?", "RIGOL TECHNOLOGIES,DS1104Z,DS1ZA000000001,00.04.04.SP4");
    for n in 1..=4 {
        mock.reply(&format!(":CHAN{n}:DISP?"), if n == 1 { "1" } else { "0" });
        mock.reply(&format!(":CHAN{n}:PROB?"), "10");
        mock.reply(&format!(":CHAN{n}:SCAL?"), "1.000000e+00");
        mock.reply(&format!(":CHAN{n}:OFFS?"), "0.000000e+00");
        mock.reply(&format!(":CHAN{n}:COUP?"), "DC");
    }
    mock.reply(":WAV:YREF?", "127");
    mock.reply(":TIM:SCAL?", "1.000000e-03");
    mock.reply(":TIM:OFFS?", "0.000000e+00");
    mock.reply(":TRIG:EDGE:SOUR?", "CHAN1");
    mock.reply(":TRIG:EDGE:SLOP?", "POS");
    mock.reply(":TRIG:EDGE:LEV?", "0.000000e+00");
    mock
}

/// Queue one sine wave per enabled channel per frame on `mock`.
fn queue_mock_frames(mock: &MockInstrument, frames: u64, channels: &BTreeSet<usize>) {
    let samples = rigol_models::DS1000Z.live_samples;
    for _ in 0..frames {
        for &channel in channels {
            let phase = channel as f32;
            let wave: Vec<u8> = (0..samples)
                .map(|i| {
                    let t = i as f32 / samples as f32 * std::f32::consts::TAU * 4.0 + phase;
                    (127.0 + 50.0 * t.sin()) as u8
                })
                .collect();
            mock.queue_raw(":WAV:DATA?", &ieee_block(&wave));
        }
    }
}

async fn open_session(cli: &Cli) -> Result<ScpiSession> {
    let transport: Box<dyn Transport> = if cli.mock {
        Box::new(mock_scope())
    } else {
        connection_spec(cli)?.into_transport()?
    };
    let mut scpi = ScpiSession::new(transport);
    scpi.open().await.context("failed to open connection")?;
    tracing::debug!(link = %scpi.description(), "Connected");
    Ok(scpi)
}

/// Prints a one-line summary of every packet and tallies frames.
#[derive(Default)]
struct PrintSink {
    frames: u64,
}

impl PacketSink for PrintSink {
    fn send_packet(&mut self, packet: Packet) -> benchlib::Result<()> {
        match packet {
            Packet::Header(header) => println!("[header] feed version {}", header.feed_version),
            Packet::FrameBegin => {
                self.frames += 1;
                println!("[frame {}]", self.frames);
            }
            Packet::FrameEnd => {}
            Packet::Analog(analog) => {
                let (min, max) = analog
                    .samples
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| (lo.min(s), hi.max(s)));
                println!(
                    "  {:<4} {:>8} samples  min {:>10.*} {}  max {:>10.*} {}",
                    analog.channel,
                    analog.samples.len(),
                    analog.digits.max(0) as usize,
                    min,
                    analog.unit,
                    analog.digits.max(0) as usize,
                    max,
                    analog.unit,
                );
            }
            Packet::Logic(logic) => {
                println!("  LA   {:>8} samples  ({} bytes each)", logic.num_samples(), logic.unit_size);
            }
            Packet::End => println!("[end] {} frame(s)", self.frames),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_list() -> Result<()> {
    let entries = benchlib::supported_instruments();

    let mfr_width = entries
        .iter()
        .map(|e| e.manufacturer.len())
        .max()
        .unwrap_or(12)
        .max(12);
    let model_width = entries.iter().map(|e| e.model.len()).max().unwrap_or(8).max(8);
    let series_width = entries.iter().map(|e| e.series.len()).max().unwrap_or(8).max(8);

    println!(
        "{:<mfr_width$}  {:<model_width$}  {:<series_width$}  {:>6}  {:>7}",
        "Manufacturer", "Model", "Series", "Analog", "Digital",
    );
    println!(
        "{:<mfr_width$}  {:<model_width$}  {:<series_width$}  {:>6}  {:>7}",
        "-".repeat(mfr_width),
        "-".repeat(model_width),
        "-".repeat(series_width),
        "------",
        "-------",
    );

    for entry in &entries {
        println!(
            "{:<mfr_width$}  {:<model_width$}  {:<series_width$}  {:>6}  {:>7}",
            entry.manufacturer, entry.model, entry.series, entry.analog_channels, entry.digital_channels,
        );
    }

    println!();
    println!("{} models total.", entries.len());

    Ok(())
}

async fn cmd_idn(scpi: &mut ScpiSession) -> Result<()> {
    let hw = scpi.get_hw_id().await.context("*IDN? failed")?;

    println!("Manufacturer:  {}", hw.manufacturer);
    println!("Model:         {}", hw.model);
    println!("Serial:        {}", hw.serial_number);
    println!("Firmware:      {}", hw.firmware_version);

    match rigol_models::find_model(&hw.manufacturer, &hw.model) {
        Some(model) => {
            let format = rigol_models::data_format(&model, &hw.firmware_version);
            println!("Series:        {}", model.series.name);
            println!("Protocol:      {:?}", model.protocol());
            println!("Data format:   {format:?}");
            println!("Channels:      {} analog", model.analog_channels);
            if model.has_digital {
                println!("               {NUM_DIGITAL_CHANNELS} digital");
            }
        }
        None => println!("Driver:        none (generic SCPI only)"),
    }

    Ok(())
}

async fn cmd_query(scpi: &mut ScpiSession, command: &str) -> Result<()> {
    let reply = scpi
        .get_string(Some(command))
        .await
        .with_context(|| format!("query '{command}' failed"))?;
    println!("{reply}");
    Ok(())
}

async fn cmd_send(scpi: &mut ScpiSession, command: &str) -> Result<()> {
    scpi.send(command)
        .await
        .with_context(|| format!("send '{command}' failed"))?;
    println!("OK");
    Ok(())
}

async fn cmd_acquire(scope: &mut RigolScope) -> Result<()> {
    let ctx = scope.context();
    println!("{} ({})", scope.hw_info(), scope.description());
    println!(
        "Source: {}  Timebase: {} s/div  Trigger: {} {} @ {} V",
        scope.data_source(),
        ctx.timebase,
        ctx.trigger_source,
        ctx.trigger_slope,
        ctx.trigger_level,
    );
    if scope.frame_limit() == 0 {
        println!("Acquiring until Ctrl-C...");
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let mut sink = PrintSink::default();
    let result = scope.acquire_with_cancellation(&mut sink, cancel).await;
    watcher.abort();
    result.context("acquisition failed")
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.mock && cli.conn.is_some() {
        bail!("--mock and --conn are mutually exclusive");
    }

    match &cli.command {
        Command::List => cmd_list(),
        Command::Idn => {
            let mut scpi = open_session(&cli).await?;
            let result = cmd_idn(&mut scpi).await;
            scpi.close().await.ok();
            result
        }
        Command::Query { command } => {
            let mut scpi = open_session(&cli).await?;
            let result = cmd_query(&mut scpi, command).await;
            scpi.close().await.ok();
            result
        }
        Command::Send { command } => {
            let mut scpi = open_session(&cli).await?;
            let result = cmd_send(&mut scpi, command).await;
            scpi.close().await.ok();
            result
        }
        Command::Acquire {
            frames,
            memory,
            channels,
            digital,
            poll_ms,
        } => {
            let mut builder = RigolBuilder::new()
                .frame_limit(*frames)
                .poll_interval(Duration::from_millis(*poll_ms));
            if *memory {
                builder = builder.data_source(DataSource::Memory);
            }
            for &channel in channels {
                builder = builder.analog_channel(channel, true);
            }
            for &channel in digital {
                builder = builder.digital_channel(channel, true);
            }

            let mut scope = if cli.mock {
                if *frames == 0 {
                    bail!("--mock needs a frame count (--frames N)");
                }
                if *memory {
                    bail!("--mock only scripts live captures");
                }
                let mock = mock_scope();
                let mut enabled: BTreeSet<usize> = channels.iter().copied().collect();
                enabled.insert(1);
                queue_mock_frames(&mock, *frames, &enabled);
                builder.build_with_transport(Box::new(mock)).await?
            } else {
                builder.connection(connection_spec(&cli)?).build().await?
            };

            let result = cmd_acquire(&mut scope).await;
            scope.close().await.ok();
            result
        }
    }
}
