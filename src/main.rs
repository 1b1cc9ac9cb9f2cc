// src/main.rs
mod commands;
mod config;
mod drivers;
mod engine;
mod recorder;
mod tools;
mod types;

use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use crossbeam::channel::{self, Receiver};
use log::{debug, info, warn};

use crate::commands::OperatorCommand;
use crate::config::ConsoleConfig;
use crate::drivers::{
    render_waveform_png, ConsoleError, CursorAxis, DisplayPipeline, Instrument, PlotStyle,
    RemoteInstrument, SimulatedInstrument, TdrPreset,
};
use crate::engine::Console;
use crate::types::{ConnectionMode, DisplayMode, InstrumentState};

const DISPATCH_WAIT: Duration = Duration::from_millis(100);
const STATE_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Operator console for a networked TDR instrument
#[derive(Parser)]
#[command(name = "mtdr", version)]
#[command(about = "Stream, average and inspect TDR waveforms", long_about = None)]
struct Cli {
    /// JSON config file; CLI flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Instrument endpoint as host:port
    #[arg(long, global = true)]
    address: Option<String>,

    /// Use the built-in simulated instrument instead of the network
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and stream until Ctrl-C or `quit`; reads operator commands from stdin
    Monitor {
        /// Configure (if needed) and enable acquisition after connecting
        #[arg(long)]
        start: bool,
        /// Preset alias used by --start when the instrument is unconfigured
        #[arg(long)]
        preset: Option<String>,
        /// Averaging factor: 1, 2, 4 ... 128
        #[arg(long)]
        averaging: Option<usize>,
        /// normalized, rho, impedance or impedance-log
        #[arg(long)]
        mode: Option<DisplayMode>,
        /// Show all four cursors and log their readouts
        #[arg(long)]
        cursors: bool,
        /// Place the visible cursors at a time (ps) and value
        #[arg(long, num_args = 2, value_names = ["X_PS", "VALUE"], requires = "cursors")]
        place: Option<Vec<f64>>,
        /// Save the last displayed frame on exit (timestamped name if no path given)
        #[arg(long, num_args = 0..=1)]
        record: Option<Option<PathBuf>>,
    },
    /// Check instrument readiness
    Ping,
    /// List TDR preset keys
    Presets,
    /// Apply a TDR preset and read the configuration back
    Configure { alias: String },
    /// Read the current TDR configuration
    Config,
    /// Enable or disable acquisition
    Enable {
        #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
        enable: bool,
    },
    /// Capture one frame and print it as JSON
    Snapshot {
        #[arg(long)]
        include_samples: bool,
        #[arg(long, default_value_t = tools::DEFAULT_MAX_SAMPLES)]
        max_samples: usize,
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// Render one frame (live or from CSV) to PNG
    Plot {
        #[arg(long, short, default_value = "mtdr.png")]
        output: PathBuf,
        /// Plot a saved CSV instead of capturing a live frame
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        mode: Option<DisplayMode>,
    },
}

fn load_config(cli: &Cli) -> Result<ConsoleConfig> {
    let mut config = match &cli.config {
        Some(path) => ConsoleConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ConsoleConfig::default(),
    };
    if let Some(address) = &cli.address {
        config.address = address.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_instrument(mode: ConnectionMode, address: &str) -> Arc<dyn Instrument> {
    match mode {
        ConnectionMode::Simulation => Arc::new(SimulatedInstrument::demo()),
        ConnectionMode::Remote => Arc::new(RemoteInstrument::new(address)),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    // 连接模式
    let mode = if cli.simulate {
        ConnectionMode::Simulation
    } else {
        ConnectionMode::Remote
    };
    let instrument = || open_instrument(mode, &config.address);

    match cli.command {
        Command::Monitor {
            start,
            preset,
            averaging,
            mode: display_mode,
            cursors,
            place,
            record,
        } => {
            let mut config = config.clone();
            if preset.is_some() {
                config.preset = preset;
            }
            if let Some(display_mode) = display_mode {
                config.display_mode = display_mode;
            }
            let options = MonitorOptions {
                start,
                averaging,
                cursors,
                place,
                record: record.map(|path| {
                    path.unwrap_or_else(|| PathBuf::from(recorder::default_file_name()))
                }),
            };
            run_monitor(config, instrument(), options)
        }
        Command::Ping => {
            println!("{}", tools::ping(&*instrument()));
            Ok(())
        }
        Command::Presets => {
            for key in tools::list_presets() {
                println!("{key}");
            }
            Ok(())
        }
        Command::Configure { alias } => {
            let readback = tools::configure_preset(&*instrument(), &alias)
                .with_context(|| format!("configuring preset '{alias}'"))?;
            println!("{}", serde_json::to_string_pretty(&readback)?);
            Ok(())
        }
        Command::Config => {
            let current = tools::read_configuration(&*instrument());
            println!("{}", serde_json::to_string_pretty(&current)?);
            Ok(())
        }
        Command::Enable { enable } => {
            let working = tools::enable_tdr(&*instrument(), enable).context("enabling TDR")?;
            println!("{}", serde_json::to_string_pretty(&working)?);
            Ok(())
        }
        Command::Snapshot {
            include_samples,
            max_samples,
            timeout_ms,
        } => {
            let options = tools::SnapshotOptions {
                include_samples,
                max_samples,
                timeout: Duration::from_millis(timeout_ms),
            };
            let snap = tools::snapshot(&*instrument(), &options).context("capturing snapshot")?;
            println!("{}", serde_json::to_string_pretty(&snap)?);
            Ok(())
        }
        Command::Plot {
            output,
            csv,
            mode: display_mode,
        } => {
            let mut console = Console::new(config.clone())?;
            match csv {
                Some(path) => {
                    console
                        .import_csv(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                }
                None => {
                    let source = instrument();
                    tools::ensure_acquiring(&*source).context("starting acquisition")?;
                    let frame = tools::capture_frame(&*source, Duration::from_secs(2))
                        .context("capturing frame")?;
                    console.display_mut().load(frame);
                }
            }
            if let Some(display_mode) = display_mode {
                console.set_display_mode(display_mode);
            }
            write_plot(console.display(), &output)
        }
    }
}

fn write_plot(display: &DisplayPipeline, output: &Path) -> Result<()> {
    let png = render_waveform_png(display, &PlotStyle::default()).context("rendering plot")?;
    fs::write(output, png).with_context(|| format!("writing {}", output.display()))?;
    info!("Plot written to {}", output.display());
    Ok(())
}

struct MonitorOptions {
    start: bool,
    averaging: Option<usize>,
    cursors: bool,
    place: Option<Vec<f64>>,
    record: Option<PathBuf>,
}

fn run_monitor(
    config: ConsoleConfig,
    instrument: Arc<dyn Instrument>,
    options: MonitorOptions,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    let preset = config.preset()?;
    let mut console = Console::new(config)?;
    console
        .connect(instrument.clone())
        .context("connecting to instrument")?;
    if let Some(factor) = options.averaging {
        console.set_averaging(factor)?;
    }
    if options.start {
        start_acquisition(&mut console, preset)?;
    }

    let commands = spawn_command_reader()?;
    info!("Type 'help' for operator commands");

    let mut cursors_placed = false;
    'monitor: while running.load(Ordering::SeqCst) {
        while let Ok(parsed) = commands.try_recv() {
            let command = match parsed {
                Ok(command) => command,
                Err(err) => {
                    warn!("{err}");
                    continue;
                }
            };
            match execute(&mut console, &instrument, command) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break 'monitor,
                Err(err) => warn!("{err:#}"),
            }
        }

        let report = console.dispatch(DISPATCH_WAIT);
        if report.disconnected {
            warn!(
                "Link lost: {}",
                report.stream_error.as_deref().unwrap_or("unknown error")
            );
            break;
        }
        if options.cursors && !cursors_placed && console.display().frame().is_some() {
            show_cursors(&mut console, options.place.as_deref());
            cursors_placed = true;
        }
        if let Some(rate) = report.refresh_rate_hz.filter(|_| console.is_connected()) {
            info!("Refresh rate: {rate:.1} Hz, averaging {}", console.averaging());
            if console.display().cursors().any_visible() {
                info!("{}", console.display().readouts());
            }
        }
    }

    if let Some(path) = &options.record {
        if let Err(err) = console.export_csv(path) {
            warn!("Nothing recorded: {err}");
        }
    }
    console.disconnect();
    Ok(())
}

/// Feeds parsed stdin lines to the monitor loop. The thread ends at EOF.
fn spawn_command_reader() -> Result<Receiver<Result<OperatorCommand, ConsoleError>>> {
    let (tx, rx) = channel::unbounded();
    thread::Builder::new()
        .name("operator_input".to_owned())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(line.parse::<OperatorCommand>()).is_err() {
                    break;
                }
            }
            debug!("operator input closed");
        })
        .context("spawning operator input thread")?;
    Ok(rx)
}

enum Flow {
    Continue,
    Quit,
}

fn execute(
    console: &mut Console,
    instrument: &Arc<dyn Instrument>,
    command: OperatorCommand,
) -> Result<Flow> {
    match command {
        OperatorCommand::Pause => console.pause()?,
        OperatorCommand::Resume => console.resume()?,
        OperatorCommand::Clear => {
            console.clear_display();
            info!("Display cleared");
        }
        OperatorCommand::Averaging(factor) => console.set_averaging(factor)?,
        OperatorCommand::Preset(alias) => {
            console.configure_preset(&alias)?;
        }
        OperatorCommand::Start => {
            if !console.start_acquisition()? {
                info!("Nothing to start: TDR unconfigured or already acquiring");
            }
        }
        OperatorCommand::ToggleAcquisition => {
            if console.toggle_acquisition()?.is_none() {
                info!("TDR is not configured");
            }
        }
        OperatorCommand::ToggleLed => {
            let on = console.toggle_identify_led()?;
            info!("Identify LED {}", if on { "on" } else { "off" });
        }
        OperatorCommand::Mode(mode) => {
            console.set_display_mode(mode);
            info!("Display mode: {mode}");
        }
        OperatorCommand::ToggleCursor(axis, index) => {
            console.display_mut().toggle_cursor(axis, index);
            info!("{}", console.display().readouts());
        }
        OperatorCommand::MoveCursors { x_ps, value } => {
            console.display_mut().move_cursors(x_ps, value);
            info!("{}", console.display().readouts());
        }
        OperatorCommand::Save(path) => {
            let path = path.unwrap_or_else(|| PathBuf::from(recorder::default_file_name()));
            console.export_csv(path)?;
        }
        OperatorCommand::Import(path) => {
            console.import_csv(&path)?;
        }
        OperatorCommand::Plot(path) => {
            let path = path.unwrap_or_else(|| PathBuf::from("mtdr.png"));
            write_plot(console.display(), &path)?;
        }
        OperatorCommand::Connect => console.connect(instrument.clone())?,
        OperatorCommand::Disconnect => console.disconnect(),
        OperatorCommand::Status => print_status(console)?,
        OperatorCommand::Help => println!("{}", commands::help()),
        OperatorCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

fn print_status(console: &Console) -> Result<()> {
    let status = serde_json::json!({
        "connection": format!("{:?}", console.connection_state()),
        "connected": console.is_connected(),
        "paused": console.is_paused(),
        "averaging": console.averaging(),
        "preset": console.preset_label(),
        "acquiring": console.instrument_state().map(|state| state.acquiring),
        "display_mode": console.display().mode().name(),
        "refresh_rate_hz": console.refresh_rate_hz(),
        "frames_received": console.frames_received(),
        "queue": console.queue_metrics(),
        "identify_led": console.led_state().map(|led| led.is_lit()),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn start_acquisition(console: &mut Console, preset: Option<TdrPreset>) -> Result<()> {
    let configured = console
        .instrument_state()
        .map_or(false, InstrumentState::has_configuration);
    if !configured {
        let Some(preset) = preset else {
            bail!("instrument has no TDR configuration; pass --preset");
        };
        console.configure_preset(&preset.key())?;
        let deadline = Instant::now() + STATE_SETTLE_TIMEOUT;
        while !console
            .instrument_state()
            .map_or(false, InstrumentState::has_configuration)
        {
            if Instant::now() > deadline {
                bail!("instrument did not report the new configuration");
            }
            console.dispatch(DISPATCH_WAIT);
        }
    }
    if !console.start_acquisition()? {
        info!("TDR already acquiring");
    }
    Ok(())
}

fn show_cursors(console: &mut Console, place: Option<&[f64]>) {
    let display = console.display_mut();
    for axis in [CursorAxis::Vertical, CursorAxis::Horizontal] {
        for index in 0..2 {
            display.set_cursor_visible(axis, index, true);
        }
    }
    if let Some([x_ps, value]) = place {
        display.move_cursors(*x_ps, *value);
    }
}
