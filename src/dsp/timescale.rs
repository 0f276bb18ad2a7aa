//! Time-scale primitives: pitch estimation and the WSOLA-style splice,
//! stretch and merge operations.
//!
//! All arithmetic is integer; correlations accumulate in i64 and the
//! candidate comparison cross-multiplies in i128, so no normalization
//! or floating point is needed. Cross-fades use a linear Q14 ramp.

/// Pitch search range: 2.5 ms .. 15 ms.
const MIN_LAG_HZ: u32 = 400;
const MAX_LAG_MS: u32 = 15;

/// Correlation window: 20 ms.
const CORR_WINDOW_MS: u32 = 20;

/// Best pitch period (in samples) of the tail of `x`.
///
/// Maximizes normalized autocorrelation between the last window of `x` and
/// the same window shifted back by the candidate lag. Falls back to the
/// minimum lag when there is not enough history.
pub fn best_pitch_lag(x: &[i16], fs_hz: u32) -> usize {
    let min_lag = (fs_hz / MIN_LAG_HZ).max(1) as usize;
    let max_lag = (fs_hz * MAX_LAG_MS / 1000) as usize;
    if x.len() < min_lag * 2 + 1 {
        return min_lag;
    }
    let max_lag = max_lag.min(x.len() / 2);
    let window = ((fs_hz * CORR_WINDOW_MS / 1000) as usize).min(x.len() - max_lag);

    let target = &x[x.len() - window..];
    let mut best_lag = min_lag;
    let mut best_cross: i64 = 0;
    let mut best_energy: i64 = 1;

    for lag in min_lag..=max_lag {
        let shifted = &x[x.len() - window - lag..x.len() - lag];
        let mut cross: i64 = 0;
        let mut energy: i64 = 1;
        for (&a, &b) in target.iter().zip(shifted) {
            cross += a as i64 * b as i64;
            energy += b as i64 * b as i64;
        }
        let cross = cross.max(0);
        // cross_a^2 / energy_a > cross_b^2 / energy_b, cross-multiplied.
        if (cross as i128 * cross as i128) * best_energy as i128
            > (best_cross as i128 * best_cross as i128) * energy as i128
        {
            best_cross = cross;
            best_energy = energy;
            best_lag = lag;
        }
    }
    best_lag
}

/// Linear cross-fade of two equally long slices into `out`.
/// Starts at pure `from`, ends at pure `to`.
pub fn cross_fade(from: &[i16], to: &[i16], out: &mut [i16]) {
    let len = from.len().min(to.len()).min(out.len());
    if len == 0 {
        return;
    }
    for i in 0..len {
        let w_to = ((i as i32) << 14) / len as i32;
        let w_from = (1 << 14) - w_to;
        let mixed = (from[i] as i32 * w_from + to[i] as i32 * w_to) >> 14;
        out[i] = mixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// Remove one pitch period from `frame` by cross-fading across it.
///
/// Returns the number of output samples (`frame.len() - lag`), or `None`
/// when the frame is too short to carry two periods.
pub fn accelerate(frame: &[i16], lag: usize, out: &mut [i16]) -> Option<usize> {
    let len = frame.len();
    if lag == 0 || len < 2 * lag || out.len() < len - lag {
        return None;
    }
    let cut = len - 2 * lag;
    out[..cut].copy_from_slice(&frame[..cut]);
    cross_fade(
        &frame[cut..cut + lag],
        &frame[cut + lag..cut + 2 * lag],
        &mut out[cut..cut + lag],
    );
    Some(len - lag)
}

/// Insert one extra pitch period at the end of `frame`.
///
/// The inserted period fades from the last period into the second-to-last,
/// keeping the waveform periodic at the splice. Returns the output length
/// (`frame.len() + lag`).
pub fn preemptive_expand(frame: &[i16], lag: usize, out: &mut [i16]) -> Option<usize> {
    let len = frame.len();
    if lag == 0 || len < 2 * lag || out.len() < len + lag {
        return None;
    }
    out[..len].copy_from_slice(frame);
    cross_fade(
        &frame[len - lag..],
        &frame[len - 2 * lag..len - lag],
        &mut out[len..len + lag],
    );
    Some(len + lag)
}

/// Cross-fade concealed audio into freshly decoded audio.
///
/// `concealed` covers the splice region; the fade runs over its overlap
/// with the head of `decoded`, then `decoded` continues untouched.
/// Returns the output length (`decoded.len()`).
pub fn merge(concealed: &[i16], decoded: &[i16], out: &mut [i16]) -> Option<usize> {
    if out.len() < decoded.len() {
        return None;
    }
    let fade = concealed.len().min(decoded.len());
    cross_fade(&concealed[..fade], &decoded[..fade], &mut out[..fade]);
    out[fade..decoded.len()].copy_from_slice(&decoded[fade..]);
    Some(decoded.len())
}
