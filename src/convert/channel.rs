//! Channel count remapping for interleaved f32 audio.

use crate::error::TapError;

/// Downmixes interleaved stereo to mono by averaging each frame.
pub fn stereo_to_mono(stereo: &[f32]) -> Vec<f32> {
    stereo
        .chunks_exact(2)
        .map(|pair| (pair[0] + pair[1]) * 0.5)
        .collect()
}

/// Upmixes mono to interleaved stereo by duplicating each sample.
pub fn mono_to_stereo(mono: &[f32]) -> Vec<f32> {
    mono.iter().flat_map(|&s| [s, s]).collect()
}

/// Remaps `samples` from `src_channels` to `dst_channels`.
///
/// Identity mappings return the input unchanged. Anything beyond
/// mono<->stereo is rejected with `FormatUnsupported`.
pub fn remap(
    samples: Vec<f32>,
    src_channels: u16,
    dst_channels: u16,
) -> Result<Vec<f32>, TapError> {
    match (src_channels, dst_channels) {
        (a, b) if a == b => Ok(samples),
        (2, 1) => Ok(stereo_to_mono(&samples)),
        (1, 2) => Ok(mono_to_stereo(&samples)),
        (a, b) => Err(TapError::format_unsupported(format!(
            "channel remap {a} -> {b} has no implemented path"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_to_mono_averages() {
        let stereo = vec![0.25, 0.75, -1.0, 1.0];
        assert_eq!(stereo_to_mono(&stereo), vec![0.5, 0.0]);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let mono = vec![0.5, -0.25];
        assert_eq!(mono_to_stereo(&mono), vec![0.5, 0.5, -0.25, -0.25]);
    }

    #[test]
    fn test_remap_identity_is_untouched() {
        let samples = vec![0.1, 0.2, 0.3];
        let out = remap(samples.clone(), 2, 2).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn test_remap_rejects_surround() {
        let err = remap(vec![0.0; 6], 6, 2).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::FormatUnsupported);
    }
}
