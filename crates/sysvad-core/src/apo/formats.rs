//! Output format negotiation
//!
//! The APO processes 32-bit float. It additionally advertises two PCM
//! formats it accepts as-is on its output.

use super::error::ApoError;
use crate::format::AudioFormat;

/// A format the APO advertises beyond plain float32
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomFormat {
    pub format: AudioFormat,
    pub representation: &'static str,
}

const CUSTOM_FORMATS: [CustomFormat; 2] = [
    CustomFormat {
        format: AudioFormat::pcm(2, 44100, 16),
        representation: "Custom #1 (really 44.1 KHz, 16-bit, stereo)",
    },
    CustomFormat {
        format: AudioFormat::pcm(2, 48000, 16),
        representation: "Custom #2 (really 48 KHz, 16-bit, stereo)",
    },
];

/// All custom formats, in index order
pub fn custom_formats() -> &'static [CustomFormat] {
    &CUSTOM_FORMATS
}

/// Display string for custom format `index`
pub fn format_representation(index: usize) -> Result<&'static str, ApoError> {
    CUSTOM_FORMATS
        .get(index)
        .map(|f| f.representation)
        .ok_or(ApoError::InvalidArgument("format index out of range"))
}

/// Outcome of an output format query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSupport {
    /// The requested format is accepted unchanged
    Supported(AudioFormat),
    /// Not accepted; this is the closest format that would be
    Suggested(AudioFormat),
}

/// Check `requested` as an output format given an optional input format
///
/// Float32 matching the input's rate and channel count is accepted, as is
/// an exact match of a custom format. Anything else gets a float32
/// suggestion at the input's (or requested) rate and channel count.
pub fn is_output_format_supported(
    input: Option<&AudioFormat>,
    requested: &AudioFormat,
) -> Result<FormatSupport, ApoError> {
    requested
        .validate()
        .map_err(|_| ApoError::InvalidConnectionFormat("requested format is malformed"))?;

    let matches_input = input
        .map(|i| i.sample_rate == requested.sample_rate && i.channels == requested.channels)
        .unwrap_or(true);

    if requested.is_float32() && matches_input {
        return Ok(FormatSupport::Supported(*requested));
    }
    if CUSTOM_FORMATS.iter().any(|c| c.format == *requested) {
        return Ok(FormatSupport::Supported(*requested));
    }

    let base = input.unwrap_or(requested);
    Ok(FormatSupport::Suggested(AudioFormat::float32(
        base.channels,
        base.sample_rate,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_formats() {
        assert_eq!(custom_formats().len(), 2);
        assert_eq!(custom_formats()[0].format.sample_rate, 44100);
        assert_eq!(custom_formats()[1].format.avg_bytes_per_sec(), 192_000);
        assert!(format_representation(1).unwrap().contains("48 KHz"));
        assert!(format_representation(2).is_err());
    }

    #[test]
    fn test_float_matching_input_supported() {
        let input = AudioFormat::float32(2, 48000);
        assert_eq!(
            is_output_format_supported(Some(&input), &input).unwrap(),
            FormatSupport::Supported(input)
        );
    }

    #[test]
    fn test_custom_pcm_supported() {
        let pcm = AudioFormat::pcm(2, 44100, 16);
        assert_eq!(
            is_output_format_supported(None, &pcm).unwrap(),
            FormatSupport::Supported(pcm)
        );
    }

    #[test]
    fn test_mismatch_gets_suggestion() {
        let input = AudioFormat::float32(2, 48000);
        let requested = AudioFormat::float32(6, 48000);
        assert_eq!(
            is_output_format_supported(Some(&input), &requested).unwrap(),
            FormatSupport::Suggested(input)
        );
        let pcm24 = AudioFormat::pcm(2, 96000, 24);
        assert_eq!(
            is_output_format_supported(None, &pcm24).unwrap(),
            FormatSupport::Suggested(AudioFormat::float32(2, 96000))
        );
    }

    #[test]
    fn test_malformed_rejected() {
        let bad = AudioFormat::pcm(0, 48000, 16);
        assert!(matches!(
            is_output_format_supported(None, &bad),
            Err(ApoError::InvalidConnectionFormat(_))
        ));
    }
}
