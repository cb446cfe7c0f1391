//! Command-line wrapper around the proctap library.
//!
//! ```text
//! proctap --pid 12345 --stdout | ffmpeg -f f32le -ar 48000 -ac 2 -i pipe:0 out.mp3
//! proctap --name firefox --stdout --sample-format int16 > capture.pcm
//! ```
//!
//! Raw little-endian PCM goes to stdout; status and errors go to stderr.

use std::io::Write;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use proctap::{CaptureConfig, ErrorKind, ProcTap, ResampleQuality, SampleFormat, TapError};

const EXIT_BAD_ARGS: i32 = 1;
const EXIT_UNSUPPORTED_OS: i32 = 2;
const EXIT_TARGET_NOT_FOUND: i32 = 3;
const EXIT_PERMISSION_DENIED: i32 = 4;
const EXIT_BACKEND_UNAVAILABLE: i32 = 5;
const EXIT_CAPTURE_ERROR: i32 = 6;

#[derive(Parser, Debug)]
#[command(
    name = "proctap",
    about = "Capture audio from a specific process",
    after_help = "Examples:\n  \
        proctap --pid 12345 --stdout | ffmpeg -f f32le -ar 48000 -ac 2 -i pipe:0 out.mp3\n  \
        proctap --name firefox --stdout --sample-format int16 --sample-rate 16000 --channels 1"
)]
struct Args {
    /// Process id to capture audio from.
    #[arg(long, conflicts_with = "name")]
    pid: Option<u32>,

    /// Process name to capture audio from (e.g. "firefox" or "VRChat.exe").
    #[arg(long)]
    name: Option<String>,

    /// Write raw PCM to stdout (no header, no framing).
    #[arg(long)]
    stdout: bool,

    /// Output sample rate in Hz.
    #[arg(long, default_value_t = 48000)]
    sample_rate: u32,

    /// Output channel count.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..=2))]
    channels: u16,

    /// Output sample format: int16, int24, int32, or float32.
    #[arg(long, default_value = "float32")]
    sample_format: String,

    /// Resampling quality: best, medium, or fast.
    #[arg(long, default_value = "medium")]
    resample_quality: String,

    /// Stop after this many seconds (runs until interrupted otherwise).
    #[arg(long)]
    duration: Option<f64>,

    /// Verbose logging to stderr (overrides PROCTAP_LOG_LEVEL).
    #[arg(long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();
    init_logging(args.verbose);

    let Some(sample_format) = SampleFormat::parse(&args.sample_format) else {
        eprintln!("error: unknown sample format '{}'", args.sample_format);
        return EXIT_BAD_ARGS;
    };
    let Some(quality) = ResampleQuality::parse(&args.resample_quality) else {
        eprintln!("error: unknown resample quality '{}'", args.resample_quality);
        return EXIT_BAD_ARGS;
    };
    if !args.stdout {
        eprintln!("error: --stdout is required (no other output mode is implemented)");
        return EXIT_BAD_ARGS;
    }

    let pid = match (args.pid, &args.name) {
        (Some(pid), None) => pid,
        (None, Some(name)) => match find_pid_by_name(name) {
            Some(pid) => {
                tracing::info!(%name, pid, "resolved process name");
                pid
            }
            None => {
                eprintln!("error: no running process named '{name}'");
                return EXIT_TARGET_NOT_FOUND;
            }
        },
        _ => {
            eprintln!("error: exactly one of --pid or --name is required");
            return EXIT_BAD_ARGS;
        }
    };

    let config = CaptureConfig {
        sample_rate: args.sample_rate,
        channels: args.channels,
        sample_format,
        resample_quality: quality,
        ..Default::default()
    };
    eprintln!(
        "capturing pid {pid} as {}Hz/{}ch/{} (ffmpeg: -f {} -ar {} -ac {})",
        args.sample_rate,
        args.channels,
        sample_format,
        ffmpeg_format_name(sample_format),
        args.sample_rate,
        args.channels,
    );

    let session = match ProcTap::builder().pid(pid).config(config).open() {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    if let Err(e) = session.start() {
        return report(&e);
    }

    let deadline = args
        .duration
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs_f64(secs));
    let mut stdout = std::io::stdout().lock();
    let mut bytes_written: u64 = 0;

    let exit = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, stopping");
                break 0;
            }
            () = sleep_until_deadline(deadline) => {
                eprintln!("duration limit reached, stopping");
                break 0;
            }
            chunk = read_chunk(&session) => {
                match chunk {
                    Ok(Some(chunk)) => {
                        if let Err(e) = stdout.write_all(&chunk.bytes).and_then(|()| stdout.flush()) {
                            // Downstream pipe closed (ffmpeg done): clean exit.
                            tracing::info!(error = %e, bytes_written, "stdout closed");
                            break 0;
                        }
                        bytes_written += chunk.bytes.len() as u64;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let cause = session.last_error().unwrap_or(e);
                        break report(&cause);
                    }
                }
            }
        }
    };

    let _ = session.stop();
    let stats = session.stats();
    eprintln!(
        "captured {} bytes ({} frames dropped)",
        bytes_written, stats.dropped_frames
    );
    let _ = session.close();
    exit
}

/// One blocking read hop, off the async runtime thread.
async fn read_chunk(session: &proctap::Session) -> Result<Option<proctap::AudioChunk>, TapError> {
    let mut stream = session.stream();
    match stream.next().await {
        Some(chunk) => Ok(Some(chunk)),
        None => {
            if session.is_running() {
                Ok(None)
            } else {
                Err(TapError::SessionStopped)
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("proctap=debug")
    } else {
        // PROCTAP_LOG_LEVEL: off, error, warn, info, debug, trace.
        let level = std::env::var("PROCTAP_LOG_LEVEL").unwrap_or_else(|_| "warn".into());
        EnvFilter::new(format!("proctap={level}"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Case-insensitive process-name lookup, tolerating a missing `.exe` suffix.
fn find_pid_by_name(name: &str) -> Option<u32> {
    let wanted = name.to_lowercase();
    let system = sysinfo::System::new_all();
    for (pid, process) in system.processes() {
        let proc_name = process.name().to_string_lossy().to_lowercase();
        if proc_name == wanted || proc_name == format!("{wanted}.exe") {
            return Some(pid.as_u32());
        }
    }
    None
}

fn ffmpeg_format_name(format: SampleFormat) -> &'static str {
    match format {
        SampleFormat::I16 => "s16le",
        SampleFormat::I24 => "s24le",
        SampleFormat::I32 => "s32le",
        SampleFormat::F32 => "f32le",
    }
}

fn report(error: &TapError) -> i32 {
    eprintln!("error: {error}");
    match error.kind() {
        ErrorKind::InvalidTarget => EXIT_BAD_ARGS,
        ErrorKind::UnsupportedOs => EXIT_UNSUPPORTED_OS,
        ErrorKind::TargetNotFound => EXIT_TARGET_NOT_FOUND,
        ErrorKind::PermissionDenied => EXIT_PERMISSION_DENIED,
        ErrorKind::BackendUnavailable => EXIT_BACKEND_UNAVAILABLE,
        _ => EXIT_CAPTURE_ERROR,
    }
}
