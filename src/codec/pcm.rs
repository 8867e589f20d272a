//! PCM sample conversion at the provider boundary.
//!
//! VAD and ASR providers consume normalized f32 samples; the wire carries
//! s16le. Conversion clamps rather than wraps on overflow.

/// Convert signed 16-bit little-endian PCM bytes to f32 samples in [-1, 1].
///
/// A trailing odd byte is ignored.
pub fn s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            f32::from(sample) / 32768.0
        })
        .collect()
}

/// Convert f32 samples back to s16le bytes, clamping out-of-range values.
pub fn f32_to_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&clamped.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_samples() {
        let samples = vec![0.0, 0.5, -0.5, 0.999, -1.0];
        let bytes = f32_to_s16le(&samples);
        let back = s16le_to_f32(&bytes);
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1.0 / 32768.0 * 2.0, "{a} vs {b}");
        }
    }

    #[test]
    fn out_of_range_clamps() {
        let bytes = f32_to_s16le(&[2.0, -2.0]);
        let back = s16le_to_f32(&bytes);
        assert!((back[0] - 0.99997).abs() < 1e-3);
        assert!((back[1] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn odd_trailing_byte_ignored() {
        assert_eq!(s16le_to_f32(&[0, 0, 7]).len(), 1);
    }
}
