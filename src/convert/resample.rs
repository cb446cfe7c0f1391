//! Sample-rate conversion with backend selection.
//!
//! Backends in priority order:
//!
//! 1. libsamplerate (`src_simple`) loaded dynamically at first use, from
//!    `LIBSAMPLERATE_PATH` or a short list of conventional library names.
//! 2. Windowed-sinc polyphase filtering (rubato), long filter for `Best`,
//!    short filter for `Medium`.
//! 3. FFT-based resampling (rubato), used when sinc construction fails.
//! 4. Linear interpolation, the `Fast` path.
//!
//! Every invocation treats its input as a complete chunk (end-of-input set):
//! no filter state survives between calls, so backends can be invoked from
//! any thread without coordination.

use std::os::raw::{c_int, c_long};
use std::sync::OnceLock;

use rubato::{
    FftFixedIn, SincFixedIn, SincInterpolationParameters, SincInterpolationType, VecResampler,
    WindowFunction,
};

use crate::config::ResampleQuality;
use crate::error::TapError;

/// Expected output frame count for a rate change.
pub fn expected_frames(src_frames: usize, src_rate: u32, dst_rate: u32) -> usize {
    ((src_frames as f64) * f64::from(dst_rate) / f64::from(src_rate)).round() as usize
}

/// Resamples interleaved f32 audio from `src_rate` to `dst_rate`.
///
/// Returns `expected_frames(..) ± 1` frames. A ratio of 1.0 is the identity.
pub fn resample(
    input: &[f32],
    src_rate: u32,
    dst_rate: u32,
    channels: u16,
    quality: ResampleQuality,
) -> Result<Vec<f32>, TapError> {
    if src_rate == 0 || dst_rate == 0 {
        return Err(TapError::format_unsupported("sample rate 0"));
    }
    if src_rate == dst_rate || input.is_empty() {
        return Ok(input.to_vec());
    }
    let channels = channels as usize;
    if channels == 0 || input.len() % channels != 0 {
        return Err(TapError::format_unsupported(
            "input not a whole number of frames",
        ));
    }

    let src_frames = input.len() / channels;
    let expected = expected_frames(src_frames, src_rate, dst_rate);
    if expected == 0 {
        return Ok(Vec::new());
    }

    if let Some(sinc) = sinc_library() {
        return sinc.resample(input, src_frames, expected, channels, quality);
    }

    match quality {
        ResampleQuality::Best => {
            resample_polyphase(input, src_rate, dst_rate, channels, expected, 256)
                .or_else(|_| resample_fft(input, src_rate, dst_rate, channels, expected))
                .or_else(|_| Ok(resample_linear(input, channels, expected)))
        }
        ResampleQuality::Medium => {
            resample_polyphase(input, src_rate, dst_rate, channels, expected, 128)
                .or_else(|_| resample_fft(input, src_rate, dst_rate, channels, expected))
                .or_else(|_| Ok(resample_linear(input, channels, expected)))
        }
        ResampleQuality::Fast => Ok(resample_linear(input, channels, expected)),
    }
}

// ---------------------------------------------------------------------------
// libsamplerate via dlopen
// ---------------------------------------------------------------------------

/// Mirrors libsamplerate's `SRC_DATA`.
#[repr(C)]
struct SrcData {
    data_in: *const f32,
    data_out: *mut f32,
    input_frames: c_long,
    output_frames: c_long,
    input_frames_used: c_long,
    output_frames_gen: c_long,
    end_of_input: c_int,
    src_ratio: f64,
}

type SrcSimpleFn = unsafe extern "C" fn(*mut SrcData, c_int, c_int) -> c_int;

const SRC_SINC_BEST_QUALITY: c_int = 0;
const SRC_SINC_MEDIUM_QUALITY: c_int = 1;
const SRC_SINC_FASTEST: c_int = 2;

struct SincLibrary {
    src_simple: SrcSimpleFn,
}

// SAFETY: the function pointer comes from a library that is intentionally
// leaked for the lifetime of the process.
unsafe impl Send for SincLibrary {}
unsafe impl Sync for SincLibrary {}

static SINC_LIBRARY: OnceLock<Option<SincLibrary>> = OnceLock::new();

/// Conventional library names probed after `LIBSAMPLERATE_PATH`.
const LIBRARY_NAMES: &[&str] = &[
    "libsamplerate-0.dll",
    "samplerate.dll",
    "libsamplerate.so.0",
    "libsamplerate.so",
    "libsamplerate.0.dylib",
    "libsamplerate.dylib",
];

fn sinc_library() -> Option<&'static SincLibrary> {
    SINC_LIBRARY
        .get_or_init(|| {
            let mut candidates: Vec<String> = Vec::new();
            if let Ok(path) = std::env::var("LIBSAMPLERATE_PATH") {
                if !path.is_empty() {
                    candidates.push(path);
                }
            }
            candidates.extend(LIBRARY_NAMES.iter().map(|s| (*s).to_string()));

            for name in &candidates {
                // SAFETY: loading an arbitrary shared library runs its
                // initializers; libsamplerate has none of consequence.
                let lib = match unsafe { libloading::Library::new(name) } {
                    Ok(lib) => lib,
                    Err(_) => continue,
                };
                // The library stays loaded for the rest of the process so the
                // resolved symbol remains valid.
                let lib: &'static libloading::Library = Box::leak(Box::new(lib));
                // SAFETY: src_simple has the declared C signature in every
                // libsamplerate release.
                match unsafe { lib.get::<SrcSimpleFn>(b"src_simple\0") } {
                    Ok(symbol) => {
                        tracing::info!(library = %name, "loaded libsamplerate for SINC resampling");
                        return Some(SincLibrary {
                            src_simple: *symbol,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(library = %name, error = %e, "src_simple not found");
                    }
                }
            }
            tracing::debug!("libsamplerate unavailable, using built-in resamplers");
            None
        })
        .as_ref()
}

impl SincLibrary {
    fn resample(
        &self,
        input: &[f32],
        src_frames: usize,
        expected: usize,
        channels: usize,
        quality: ResampleQuality,
    ) -> Result<Vec<f32>, TapError> {
        let max_frames = c_long::MAX as usize;
        if src_frames > max_frames || expected > max_frames {
            return Err(TapError::format_unsupported(
                "chunk exceeds libsamplerate frame range",
            ));
        }

        // Small slack: src_simple may generate one frame either side of the
        // rounded expectation.
        let capacity = (expected + 8) * channels;
        let mut output = vec![0.0f32; capacity];

        let mut data = SrcData {
            data_in: input.as_ptr(),
            data_out: output.as_mut_ptr(),
            input_frames: src_frames as c_long,
            output_frames: (expected + 8) as c_long,
            input_frames_used: 0,
            output_frames_gen: 0,
            end_of_input: 1,
            src_ratio: expected as f64 / src_frames as f64,
        };

        let converter = match quality {
            ResampleQuality::Best => SRC_SINC_BEST_QUALITY,
            ResampleQuality::Medium => SRC_SINC_MEDIUM_QUALITY,
            ResampleQuality::Fast => SRC_SINC_FASTEST,
        };

        // SAFETY: pointers outlive the call; frame counts match allocations.
        let err = unsafe { (self.src_simple)(&mut data, converter, channels as c_int) };
        if err != 0 {
            return Err(TapError::format_unsupported(format!(
                "libsamplerate src_simple failed with code {err}"
            )));
        }

        let generated = data.output_frames_gen as usize;
        output.truncate(generated * channels);
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// rubato fallbacks
// ---------------------------------------------------------------------------

fn deinterleave(input: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = input.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in input.chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            planar[ch].push(sample);
        }
    }
    planar
}

fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let channels = planar.len();
    let frames = planar.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(frames * channels);
    for frame in 0..frames {
        for channel in planar {
            out.push(channel[frame]);
        }
    }
    out
}

/// Runs a rubato resampler over one complete chunk: process the input, flush
/// the filter delay, skip the latency prefix, and trim to `expected` frames.
fn run_one_shot(
    mut resampler: Box<dyn VecResampler<f32>>,
    planar_in: &[Vec<f32>],
    channels: usize,
    expected: usize,
) -> Result<Vec<f32>, TapError> {
    let delay = resampler.output_delay();
    let mut collected: Vec<Vec<f32>> = vec![Vec::new(); channels];

    let append = |chunks: Vec<Vec<f32>>, collected: &mut Vec<Vec<f32>>| {
        for (ch, data) in chunks.into_iter().enumerate() {
            collected[ch].extend(data);
        }
    };

    let processed = resampler
        .process(planar_in, None)
        .map_err(|e| TapError::format_unsupported(format!("polyphase resampling failed: {e}")))?;
    append(processed, &mut collected);

    // Flush until the delayed tail has been produced. Each pass feeds zeros;
    // a handful of passes covers any filter length.
    let mut flushes = 0;
    while collected[0].len() < delay + expected && flushes < 8 {
        let flushed = resampler
            .process_partial(None, None)
            .map_err(|e| TapError::format_unsupported(format!("resampler flush failed: {e}")))?;
        if flushed[0].is_empty() {
            break;
        }
        append(flushed, &mut collected);
        flushes += 1;
    }

    let mut planar_out: Vec<Vec<f32>> = Vec::with_capacity(channels);
    for mut channel in collected {
        let end = (delay + expected).min(channel.len());
        let mut trimmed: Vec<f32> = channel.drain(..end).skip(delay).collect();
        // Pad with trailing silence if flushing came up short.
        trimmed.resize(expected, 0.0);
        planar_out.push(trimmed);
    }

    Ok(interleave(&planar_out))
}

fn resample_polyphase(
    input: &[f32],
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    expected: usize,
    sinc_len: usize,
) -> Result<Vec<f32>, TapError> {
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let src_frames = input.len() / channels;
    let ratio = f64::from(dst_rate) / f64::from(src_rate);
    let resampler = SincFixedIn::<f32>::new(ratio, 1.1, params, src_frames, channels)
        .map_err(|e| TapError::format_unsupported(format!("sinc resampler: {e}")))?;

    run_one_shot(
        Box::new(resampler),
        &deinterleave(input, channels),
        channels,
        expected,
    )
}

fn resample_fft(
    input: &[f32],
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    expected: usize,
) -> Result<Vec<f32>, TapError> {
    let src_frames = input.len() / channels;
    let resampler = FftFixedIn::<f32>::new(
        src_rate as usize,
        dst_rate as usize,
        src_frames,
        2,
        channels,
    )
    .map_err(|e| TapError::format_unsupported(format!("fft resampler: {e}")))?;

    run_one_shot(
        Box::new(resampler),
        &deinterleave(input, channels),
        channels,
        expected,
    )
}

// ---------------------------------------------------------------------------
// Linear interpolation (low-latency mode)
// ---------------------------------------------------------------------------

/// Per-channel linear interpolation over interleaved frames.
///
/// Branch-free inner loop over channels keeps this friendly to
/// auto-vectorization; quality is adequate for speech at modest ratios.
fn resample_linear(input: &[f32], channels: usize, dst_frames: usize) -> Vec<f32> {
    let src_frames = input.len() / channels;
    let mut out = Vec::with_capacity(dst_frames * channels);
    if src_frames == 0 {
        return out;
    }

    let step = src_frames as f64 / dst_frames as f64;
    for i in 0..dst_frames {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;

        if idx + 1 < src_frames {
            for ch in 0..channels {
                let s0 = input[idx * channels + ch];
                let s1 = input[(idx + 1) * channels + ch];
                out.push(s0 + frac * (s1 - s0));
            }
        } else {
            let last = (src_frames - 1) * channels;
            for ch in 0..channels {
                out.push(input[last + ch]);
            }
        }
    }
    out
}
