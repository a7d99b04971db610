//! MLR1 raw data decoder CLI application.
//!
//! Converts APTS, OPAMP and DPTS acquisitions to numpy arrays and CSV tables.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use log::{debug, info, warn};
use mlr1_core::dpts::{self, Calibration, EdgeHalf, Threshold, Waveform, ZeroSuppress};
use mlr1_core::{
    output, AptsDecoder, ChipVariant, HeaderTrim, OpampDecoder, ProgressSink, SampleWidth,
    ScopeSettings, Sidecar,
};
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Decoder for raw data taken with the MLR1 DAQ board.
///
/// Converts APTS and OPAMP .raw files to .npy arrays and extracts pulse
/// trains from DPTS oscilloscope traces.
#[derive(Parser, Debug)]
#[command(name = "mlr1-decode")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode an APTS .raw file to an (events, 4, 4, frames) array
    Apts(AptsArgs),
    /// Decode the ADC and oscilloscope streams of an OPAMP acquisition
    Opamp(OpampArgs),
    /// Extract pulse trains from DPTS oscilloscope CSV exports
    Dpts(DptsArgs),
}

#[derive(Args, Debug)]
struct AptsArgs {
    /// Input APTS .raw file path
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output .npy path. Defaults to the input with a .npy extension.
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Force the multiplexed pixel mapping.
    ///
    /// Without this flag the mapping is taken from chip_ID in the .json
    /// sidecar next to the input; a missing sidecar assumes a standard chip.
    #[arg(long)]
    mux: bool,

    /// Write trigger timestamps to this CSV file
    #[arg(short, long, value_name = "PATH")]
    triggers: Option<PathBuf>,

    /// Write the per-frame timestamps as an (events, frames) .npy array
    #[arg(long, value_name = "PATH")]
    frame_timestamps: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct OpampArgs {
    /// Raw ADC stream recorded by the DAQ board
    #[arg(long, value_name = "PATH")]
    adc: PathBuf,

    /// Raw waveform stream recorded by the oscilloscope
    #[arg(long, value_name = "PATH")]
    scope: PathBuf,

    /// Output prefix; writes <PREFIX>_adc.npy and <PREFIX>_scope.npy.
    /// Defaults to the ADC path without extension.
    #[arg(short, long, value_name = "PREFIX")]
    output: Option<PathBuf>,

    /// JSON file with the oscilloscope settings used to take the data.
    /// Default settings are used when omitted.
    #[arg(short, long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Bytes per scope sample (1, 2 or 4)
    #[arg(short, long, default_value_t = 1)]
    precision: usize,

    /// Number of time divisions on the scope screen
    #[arg(long, default_value_t = ScopeSettings::TIME_DIVISIONS)]
    time_divisions: u32,

    /// Strip scope headers: bytes in header, bytes in footer, pulses, scanned points
    #[arg(long, num_args = 4, value_names = ["HEADER", "FOOTER", "PULSES", "POINTS"])]
    header: Option<Vec<usize>>,
}

#[derive(Args, Debug)]
struct DptsArgs {
    /// Oscilloscope CSV exports (time ns, positive mV, negative mV)
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Compare the positive line to a fixed level in volts
    #[arg(long, value_name = "VOLTS", conflicts_with = "only_pos")]
    fixed_threshold: Option<f64>,

    /// Swap positive and negative lines before thresholding
    #[arg(long)]
    invert: bool,

    /// Use only the positive line, thresholded at its midpoint
    #[arg(long)]
    only_pos: bool,

    /// Calibration table (cols, rows, 2) .npy for pixel identification
    #[arg(short, long, value_name = "PATH")]
    calibration: Option<PathBuf>,

    /// Identify the falling-edge half of the trains instead of the rising one
    #[arg(long, requires = "calibration")]
    falling_edge: bool,

    /// Write the trains to this CSV file instead of printing them
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

/// Progress sink advancing an indicatif bar.
struct BarSink(ProgressBar);

impl ProgressSink for BarSink {
    fn update(&mut self, n: u64) {
        self.0.inc(n);
    }

    fn close(&mut self) {
        self.0.finish();
    }
}

/// Factory for byte progress bars sharing one terminal with the logger.
struct Bars {
    multi: MultiProgress,
    quiet: bool,
}

impl Bars {
    fn bytes(&self, len: u64, label: &str) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let bar = self.multi.add(ProgressBar::new(len));
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix:>6} [{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_prefix(label.to_string());
        bar
    }
}

fn init_logging(verbose: u8) -> Result<MultiProgress> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let logger = TermLogger::new(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    let multi = MultiProgress::new();
    LogWrapper::new(multi.clone(), logger)
        .try_init()
        .context("Could not create logging/progress")?;
    log::set_max_level(level);
    Ok(multi)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let bars = Bars {
        multi: init_logging(cli.verbose)?,
        quiet: cli.quiet,
    };

    match cli.command {
        Command::Apts(args) => run_apts(args, &bars),
        Command::Opamp(args) => run_opamp(args, &bars),
        Command::Dpts(args) => run_dpts(args),
    }
}

fn chip_variant(input: &Path, force_mux: bool) -> Result<ChipVariant> {
    if force_mux {
        return Ok(ChipVariant::Mux);
    }
    let sidecar = Sidecar::for_raw_file(input)
        .with_context(|| format!("Failed to read sidecar of {:?}", input))?;
    match sidecar {
        Some(sidecar) => sidecar.variant().context("Invalid chip_ID in sidecar"),
        None => {
            warn!("Assuming a non-multiplexed chip");
            Ok(ChipVariant::Standard)
        }
    }
}

fn run_apts(args: AptsArgs, bars: &Bars) -> Result<()> {
    let start_time = Instant::now();
    let variant = chip_variant(&args.input, args.mux)?;

    let decoder = AptsDecoder::open(&args.input, variant)
        .with_context(|| format!("Failed to read {:?}", args.input))?;
    let bar = bars.bytes(decoder.len() as u64, "APTS");
    let run = decoder
        .with_frame_timestamps(args.frame_timestamps.is_some())
        .with_progress(Box::new(BarSink(bar)))
        .decode_all()
        .context("Failed to decode APTS file")?;

    let output_path = args
        .output
        .unwrap_or_else(|| args.input.with_extension("npy"));
    output::write_apts_npy_file(&output_path, &run).context("Failed to write APTS array")?;

    if let Some(trigger_path) = &args.triggers {
        output::write_trigger_csv(trigger_path, &run).context("Failed to write trigger CSV")?;
        info!("Wrote trigger timestamps to {:?}", trigger_path);
    }

    if let Some(ts_path) = &args.frame_timestamps {
        let timestamps: Vec<u64> = run
            .events
            .iter()
            .flat_map(|event| event.frame_timestamps.iter().flatten().copied())
            .collect();
        output::write_npy(
            ts_path,
            &[run.events.len(), run.frames_per_event()],
            &timestamps,
        )
        .context("Failed to write frame timestamps")?;
        info!("Wrote frame timestamps to {:?}", ts_path);
    }

    let total_duration = start_time.elapsed();
    if !bars.quiet {
        let triggers = run
            .events
            .iter()
            .filter(|event| event.trigger_timestamp.is_some())
            .count();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", output_path);
        eprintln!("  Mapping:      {:?}", variant);
        eprintln!("  Events:       {}", run.events.len());
        eprintln!("  Frames/event: {}", run.frames_per_event());
        eprintln!("  Triggers:     {}", triggers);
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
    }

    Ok(())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn run_opamp(args: OpampArgs, bars: &Bars) -> Result<()> {
    let start_time = Instant::now();

    let settings = match &args.settings {
        Some(path) => ScopeSettings::read(path)
            .with_context(|| format!("Failed to read scope settings {:?}", path))?,
        None => {
            warn!("No scope settings given, using default values");
            ScopeSettings::default()
        }
    };
    let width = SampleWidth::from_bytes(args.precision)
        .with_context(|| format!("Unsupported scope precision {}", args.precision))?;
    let layout = settings
        .layout(width, args.time_divisions)
        .context("Invalid scope settings")?;
    debug!("Scope layout: {:?}", layout);

    let trim = args.header.as_deref().map(|h| HeaderTrim {
        header_bytes: h[0],
        footer_bytes: h[1],
        pulses: h[2],
        scanned_points: h[3],
    });

    let adc = std::fs::read(&args.adc).with_context(|| format!("Failed to read {:?}", args.adc))?;
    let scope =
        std::fs::read(&args.scope).with_context(|| format!("Failed to read {:?}", args.scope))?;

    let decoder = OpampDecoder::new(adc, scope, layout, trim)
        .context("Failed to prepare the scope stream")?;
    let adc_bar = bars.bytes(decoder.adc_len() as u64, "ADC");
    let scope_bar = bars.bytes(decoder.scope_len() as u64, "scope");
    let mut decoder =
        decoder.with_progress(Box::new(BarSink(adc_bar)), Box::new(BarSink(scope_bar)));

    let adc_run = decoder.drain_adc().context("Failed to decode ADC stream")?;
    let scope_events = decoder
        .drain_scope()
        .context("Failed to decode scope stream")?;
    if adc_run.events.len() != scope_events.len() {
        warn!(
            "{} ADC events but {} scope events",
            adc_run.events.len(),
            scope_events.len()
        );
    }

    let prefix = args
        .output
        .unwrap_or_else(|| args.adc.with_extension(""));
    let adc_path = with_suffix(&prefix, "_adc.npy");
    output::write_apts_npy_file(&adc_path, &adc_run).context("Failed to write ADC array")?;
    let scope_path = with_suffix(&prefix, "_scope.npy");
    if scope_events.is_empty() {
        warn!("No scope events decoded, {:?} not written", scope_path);
    } else {
        output::write_scope_npy_file(&scope_path, &scope_events)
            .context("Failed to write scope array")?;
    }

    if !bars.quiet {
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  ADC:          {:?} -> {:?}", args.adc, adc_path);
        eprintln!("  Scope:        {:?} -> {:?}", args.scope, scope_path);
        eprintln!("  ADC events:   {}", adc_run.events.len());
        eprintln!("  Scope events: {}", scope_events.len());
        eprintln!(
            "  Scope shape:  {} channels x {} samples ({} bytes)",
            layout.channels,
            layout.samples,
            layout.sample_width.bytes()
        );
        eprintln!("  Duration:     {:.3}s", start_time.elapsed().as_secs_f64());
    }

    Ok(())
}

fn run_dpts(args: DptsArgs) -> Result<()> {
    let settings = ZeroSuppress {
        threshold: match args.fixed_threshold {
            Some(level) => Threshold::Fixed(level),
            None if args.only_pos => Threshold::OnlyPositive,
            None => Threshold::Reference,
        },
        invert: args.invert,
    };
    let calibration = args
        .calibration
        .as_ref()
        .map(Calibration::from_npy_file)
        .transpose()
        .context("Failed to load calibration")?;
    let half = if args.falling_edge {
        EdgeHalf::Falling
    } else {
        EdgeHalf::Rising
    };

    let mut sets = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let waveform =
            Waveform::read_csv_file(path).with_context(|| format!("Failed to read {:?}", path))?;
        let set = waveform
            .decode(&settings)
            .with_context(|| format!("Failed to decode {:?}", path))?;
        info!(
            "{:?}: {} trains, {} bad trains",
            path,
            set.trains.len(),
            set.bad_trains.len()
        );
        for bad in &set.bad_trains {
            debug!("Bad train with {} edges at {:e}", bad.len(), bad[0]);
        }

        if let Some(calibration) = &calibration {
            match dpts::trains_to_pixels(calibration, &set, half) {
                Some(pixels) => {
                    for pixel in pixels {
                        info!("  pixel col {} row {}", pixel.col, pixel.row);
                    }
                }
                None => warn!("{:?}: only bad trains, no pixel identified", path),
            }
        }
        sets.push(set);
    }

    match &args.output {
        Some(path) => {
            output::write_trains_csv(path, &sets).context("Failed to write trains CSV")?;
            info!("Wrote trains to {:?}", path);
        }
        None => {
            println!("{:>8} {:>14} {:>14} {:>14}", "waveform", "toa", "pid", "gid");
            for (i, set) in sets.iter().enumerate() {
                for train in &set.trains {
                    println!(
                        "{:>8} {:>14.6e} {:>14.6e} {:>14.6e}",
                        i,
                        train.toa(),
                        train.pid(),
                        train.gid()
                    );
                }
            }
        }
    }

    Ok(())
}
