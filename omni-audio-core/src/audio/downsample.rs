//! Mono mix + integer decimation from the capture rate to the speech rate.
//!
//! ## Algorithm
//!
//! 1. Stereo frames are mixed as `(L + R) / 2` in `i32` with truncating
//!    division. Mono frames pass through unchanged.
//! 2. A phase counter is incremented once per input frame. When it reaches
//!    `ratio` it resets to 0 and the current mixed sample is emitted.
//!
//! There is no low-pass stage. Speech consumers downstream are tuned to this
//! exact naive decimation, so it must stay bit-exact.
//!
//! The counter lives in `FilterState` and is carried across calls: feeding a
//! stream one frame at a time or all at once yields the same output.

use crate::error::{AudioError, Result};

/// Channel layout of the capture feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn from_count(channels: u16) -> Result<Self> {
        match channels {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            n => Err(AudioError::UnsupportedFormat(format!(
                "{n} capture channels (expected 1 or 2)"
            ))),
        }
    }

    pub fn count(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

/// Decimation phase carried between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterState {
    /// Frames seen since the last emitted sample, in `[0, ratio)`.
    pub phase_counter: u32,
    /// Input frames per output sample (3 for 48 kHz → 16 kHz).
    pub ratio: u32,
}

impl FilterState {
    pub fn new(ratio: u32) -> Self {
        Self {
            phase_counter: 0,
            ratio,
        }
    }
}

/// Derive the decimation ratio for `from_rate → to_rate`.
///
/// # Errors
/// `AudioError::UnsupportedFormat` if either rate is zero, the target is
/// faster than the source, or the ratio is not an integer.
pub fn decimation_ratio(from_rate: u32, to_rate: u32) -> Result<u32> {
    if from_rate == 0 || to_rate == 0 || to_rate > from_rate || from_rate % to_rate != 0 {
        return Err(AudioError::UnsupportedFormat(format!(
            "cannot decimate {from_rate} Hz to {to_rate} Hz by an integer ratio"
        )));
    }
    Ok(from_rate / to_rate)
}

/// Integer average of a stereo pair, truncated toward zero.
#[inline]
pub fn mix_stereo(left: i16, right: i16) -> i16 {
    ((left as i32 + right as i32) / 2) as i16
}

/// Mix (if stereo) and decimate `input`, appending output samples to `out`.
///
/// `input` is interleaved; a trailing partial stereo frame is ignored.
/// Returns the number of samples appended.
pub fn decimate_into(
    input: &[i16],
    layout: ChannelLayout,
    state: &mut FilterState,
    out: &mut Vec<i16>,
) -> usize {
    let before = out.len();
    let mut push = |sample: i16, state: &mut FilterState| {
        state.phase_counter += 1;
        if state.phase_counter >= state.ratio {
            state.phase_counter = 0;
            out.push(sample);
        }
    };

    match layout {
        ChannelLayout::Mono => {
            for &s in input {
                push(s, state);
            }
        }
        ChannelLayout::Stereo => {
            for frame in input.chunks_exact(2) {
                push(mix_stereo(frame[0], frame[1]), state);
            }
        }
    }

    out.len() - before
}

/// Allocating convenience wrapper around [`decimate_into`].
pub fn decimate(input: &[i16], layout: ChannelLayout, state: &mut FilterState) -> Vec<i16> {
    let frames = input.len() / layout.count();
    let mut out = Vec::with_capacity(frames / state.ratio.max(1) as usize + 1);
    decimate_into(input, layout, state, &mut out);
    out
}

/// Stateful downsampler bound to one capture layout.
#[derive(Debug, Clone)]
pub struct Downsampler {
    layout: ChannelLayout,
    state: FilterState,
}

impl Downsampler {
    /// # Errors
    /// Fails on channel counts other than 1 or 2, or a non-integer rate ratio.
    pub fn new(channels: u16, from_rate: u32, to_rate: u32) -> Result<Self> {
        let layout = ChannelLayout::from_count(channels)?;
        let ratio = decimation_ratio(from_rate, to_rate)?;
        Ok(Self {
            layout,
            state: FilterState::new(ratio),
        })
    }

    /// Decimate one chunk, carrying phase into the next call.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        decimate(input, self.layout, &mut self.state)
    }

    /// Like [`Downsampler::process`], but reuses `out` (its contents are replaced).
    pub fn process_into(&mut self, input: &[i16], out: &mut Vec<i16>) -> usize {
        out.clear();
        decimate_into(input, self.layout, &mut self.state, out)
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<i16> {
        (0..n).map(|i| (i as i16).wrapping_mul(37)).collect()
    }

    #[test]
    fn ratio_48k_to_16k_is_three() {
        assert_eq!(decimation_ratio(48_000, 16_000).unwrap(), 3);
        assert_eq!(decimation_ratio(16_000, 16_000).unwrap(), 1);
    }

    #[test]
    fn rejects_non_integer_or_upsampling_ratios() {
        assert!(decimation_ratio(44_100, 16_000).is_err());
        assert!(decimation_ratio(16_000, 48_000).is_err());
        assert!(decimation_ratio(48_000, 0).is_err());
    }

    #[test]
    fn rejects_unsupported_channel_counts() {
        assert!(Downsampler::new(4, 48_000, 16_000).is_err());
        assert!(Downsampler::new(0, 48_000, 16_000).is_err());
    }

    #[test]
    fn mono_emits_every_third_frame_starting_at_index_two() {
        let mut state = FilterState::new(3);
        let input = ramp(9);
        let out = decimate(&input, ChannelLayout::Mono, &mut state);
        assert_eq!(out, vec![input[2], input[5], input[8]]);
        assert_eq!(state.phase_counter, 0);
    }

    #[test]
    fn output_count_follows_carried_phase() {
        let mut state = FilterState::new(3);
        // Leaves phase at 1.
        assert_eq!(decimate(&ramp(4), ChannelLayout::Mono, &mut state).len(), 1);
        assert_eq!(state.phase_counter, 1);
        // (1 + 5) / 3 = 2 outputs.
        assert_eq!(decimate(&ramp(5), ChannelLayout::Mono, &mut state).len(), 2);
        assert_eq!(state.phase_counter, 0);
    }

    #[test]
    fn split_calls_match_single_call() {
        let input = ramp(1000);

        let mut whole_state = FilterState::new(3);
        let whole = decimate(&input, ChannelLayout::Mono, &mut whole_state);

        let mut single_state = FilterState::new(3);
        let mut single = Vec::new();
        for s in &input {
            decimate_into(
                std::slice::from_ref(s),
                ChannelLayout::Mono,
                &mut single_state,
                &mut single,
            );
        }

        let mut ragged_state = FilterState::new(3);
        let mut ragged = Vec::new();
        let mut offset = 0;
        for size in [1usize, 2, 7, 11, 4, 100, 5].iter().cycle() {
            if offset >= input.len() {
                break;
            }
            let end = (offset + size).min(input.len());
            decimate_into(
                &input[offset..end],
                ChannelLayout::Mono,
                &mut ragged_state,
                &mut ragged,
            );
            offset = end;
        }

        assert_eq!(whole.len(), 333);
        assert_eq!(single, whole);
        assert_eq!(ragged, whole);
        assert_eq!(single_state, whole_state);
        assert_eq!(ragged_state, whole_state);
    }

    #[test]
    fn stereo_split_calls_match_single_call() {
        let input = ramp(600); // 300 frames
        let mut a = Downsampler::new(2, 48_000, 16_000).unwrap();
        let whole = a.process(&input);

        let mut b = Downsampler::new(2, 48_000, 16_000).unwrap();
        let mut pieces = Vec::new();
        for chunk in input.chunks(14) {
            pieces.extend(b.process(chunk));
        }
        assert_eq!(whole.len(), 100);
        assert_eq!(pieces, whole);
    }

    #[test]
    fn process_into_reuses_buffer_and_carries_phase() {
        let input = ramp(10);
        let mut downsampler = Downsampler::new(1, 48_000, 16_000).unwrap();
        let mut out = vec![-1i16; 32];

        assert_eq!(downsampler.process_into(&input[..4], &mut out), 1);
        assert_eq!(out, vec![input[2]]);
        assert_eq!(downsampler.process_into(&input[4..], &mut out), 2);
        assert_eq!(out, vec![input[5], input[8]]);
        assert_eq!(downsampler.state().phase_counter, 1);
        assert_eq!(downsampler.layout(), ChannelLayout::Mono);
    }

    #[test]
    fn stereo_mix_truncates_toward_zero_without_overflow() {
        assert_eq!(mix_stereo(i16::MAX, i16::MIN), 0); // -1 / 2 == 0
        assert_eq!(mix_stereo(i16::MAX, i16::MAX), i16::MAX);
        assert_eq!(mix_stereo(i16::MIN, i16::MIN), i16::MIN);
        assert_eq!(mix_stereo(-3, 0), -1);
        assert_eq!(mix_stereo(3, 0), 1);
    }

    #[test]
    fn stereo_output_is_mixed_third_frame() {
        let mut state = FilterState::new(3);
        let input = [10, 20, 30, 40, 32767, -32768, 1, 1];
        let out = decimate(&input, ChannelLayout::Stereo, &mut state);
        assert_eq!(out, vec![0]);
        assert_eq!(state.phase_counter, 1);
    }

    #[test]
    fn trailing_half_frame_is_ignored() {
        let mut state = FilterState::new(1);
        let out = decimate(&[4, 6, 9], ChannelLayout::Stereo, &mut state);
        assert_eq!(out, vec![5]);
    }
}
