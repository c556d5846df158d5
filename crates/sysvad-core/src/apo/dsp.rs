//! Real-time sample kernels
//!
//! All functions operate on interleaved f32 frames, never allocate, and
//! clamp to the slice length so a short buffer cannot cause a panic.

/// Number of samples covered by `frame_count` frames, bounded by `len`
#[inline]
fn span(len: usize, frame_count: u32, channels: u32) -> usize {
    (frame_count as usize)
        .saturating_mul(channels as usize)
        .min(len)
}

/// Zero `frame_count` frames
pub fn write_silence(frames: &mut [f32], frame_count: u32, channels: u32) {
    let n = span(frames.len(), frame_count, channels);
    frames[..n].fill(0.0);
}

/// Copy `frame_count` frames from `src` to `dst`
pub fn copy_frames(dst: &mut [f32], src: &[f32], frame_count: u32, channels: u32) {
    let n = span(dst.len().min(src.len()), frame_count, channels);
    dst[..n].copy_from_slice(&src[..n]);
}

/// Swap the first two channels of every frame
///
/// Self-inverse: applying it twice restores the input.
pub fn process_swap(frames: &mut [f32], frame_count: u32, channels: u32) {
    if channels < 2 {
        return;
    }
    let n = span(frames.len(), frame_count, channels);
    for frame in frames[..n].chunks_exact_mut(channels as usize) {
        frame.swap(0, 1);
    }
}

/// Swap the first two channels and scale each channel by its coefficient
///
/// # Arguments
/// * `frames` - Interleaved samples, processed in place
/// * `frame_count` - Valid frames
/// * `channels` - Samples per frame
/// * `coefficients` - One gain per channel; missing entries leave the channel unscaled
pub fn process_swap_scale(frames: &mut [f32], frame_count: u32, channels: u32, coefficients: &[f32]) {
    if channels < 2 {
        return;
    }
    let n = span(frames.len(), frame_count, channels);
    for frame in frames[..n].chunks_exact_mut(channels as usize) {
        frame.swap(0, 1);
        for (sample, gain) in frame.iter_mut().zip(coefficients) {
            *sample *= gain;
        }
    }
}

/// Per-channel gains ramping from 1.0 down by `1/channels` per channel
pub fn swap_scale_coefficients(channels: u32, out: &mut Vec<f32>) {
    let inverse = 1.0 / channels as f32;
    out.clear();
    out.extend((0..channels).map(|i| 1.0 - inverse * i as f32));
}
