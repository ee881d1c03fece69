//! PCM utilities for the voice plane
//!
//! Pure functions over 16-bit little-endian PCM buffers. Resampling is
//! linear interpolation; voice-band audio tolerates it and it keeps the
//! crate free of native DSP dependencies.

/// Sample rate used for VAD, echo analysis and STT
pub const PROCESSING_SAMPLE_RATE: u32 = 16_000;

/// Sample rate the transport expects
pub const TRANSPORT_SAMPLE_RATE: u32 = 48_000;

/// Channel count the transport expects
pub const TRANSPORT_CHANNELS: u16 = 2;

/// One 20 ms transport frame: 48 kHz * 2 ch * 2 bytes * 0.02 s
pub const TRANSPORT_FRAME_BYTES: usize = 3840;

/// Linear-interpolation resample
///
/// Output length is `round(in_len * to / from)`; taps past the end of the
/// input repeat the last valid sample. Identity when the rates match.
pub fn resample(pcm: &[i16], from: u32, to: u32) -> Vec<i16> {
    if from == to || pcm.is_empty() {
        return pcm.to_vec();
    }

    let out_len = ((pcm.len() as u64 * to as u64 + from as u64 / 2) / from as u64) as usize;
    let ratio = from as f64 / to as f64;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;

        let a = pcm[idx.min(pcm.len() - 1)] as f64;
        let b = pcm[(idx + 1).min(pcm.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }

    out
}

/// Average interleaved stereo down to mono
pub fn stereo_to_mono(pcm: &[i16]) -> Vec<i16> {
    pcm.chunks(2)
        .map(|chunk| {
            if chunk.len() == 2 {
                ((chunk[0] as i32 + chunk[1] as i32) / 2) as i16
            } else {
                chunk[0]
            }
        })
        .collect()
}

/// Duplicate mono samples into interleaved stereo
pub fn mono_to_stereo(pcm: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for &sample in pcm {
        out.push(sample);
        out.push(sample);
    }
    out
}

/// Decoded transport audio (48 kHz stereo) to processing format (16 kHz mono)
pub fn to_processing_format(pcm_48k_stereo: &[i16]) -> Vec<i16> {
    let mono = stereo_to_mono(pcm_48k_stereo);
    resample(&mono, TRANSPORT_SAMPLE_RATE, PROCESSING_SAMPLE_RATE)
}

/// Arbitrary-rate PCM to transport format (48 kHz stereo)
pub fn to_transport_format(pcm: &[i16], sample_rate: u32, channels: u16) -> Vec<i16> {
    let mono = if channels >= 2 { stereo_to_mono(pcm) } else { pcm.to_vec() };
    let at_rate = resample(&mono, sample_rate, TRANSPORT_SAMPLE_RATE);
    mono_to_stereo(&at_rate)
}

/// Root-mean-square energy of a frame, in int16 units
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Little-endian bytes to i16 samples; a trailing odd byte is dropped
pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// i16 samples to little-endian bytes
pub fn pcm_to_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let pcm: Vec<i16> = (0..480).map(|i| (i % 100) as i16).collect();
        assert_eq!(resample(&pcm, 16000, 16000), pcm);
    }

    #[test]
    fn test_resample_length_law() {
        let pcm = vec![0i16; 480];

        let up = resample(&pcm, 16000, 48000);
        assert_eq!(up.len(), 1440);

        let down = resample(&pcm, 48000, 16000);
        assert_eq!(down.len(), 160);

        // Rounding, not truncation.
        let odd = resample(&vec![0i16; 100], 16000, 24000);
        assert_eq!(odd.len(), 150);
    }

    #[test]
    fn test_resample_edge_taps_repeat_last_sample() {
        let pcm = vec![100i16, 200, 300];
        let up = resample(&pcm, 16000, 48000);
        assert_eq!(up.len(), 9);
        // Past the final input sample the output holds its value.
        assert_eq!(*up.last().unwrap(), 300);
    }

    #[test]
    fn test_stereo_mono_roundtrip() {
        let stereo = vec![10i16, 20, 30, 40];
        let mono = stereo_to_mono(&stereo);
        assert_eq!(mono, vec![15, 35]);

        let back = mono_to_stereo(&mono);
        assert_eq!(back, vec![15, 15, 35, 35]);
    }

    #[test]
    fn test_to_processing_format() {
        // 20 ms at 48 kHz stereo -> 20 ms at 16 kHz mono
        let frame = vec![0i16; 1920];
        let processed = to_processing_format(&frame);
        assert_eq!(processed.len(), 320);
    }

    #[test]
    fn test_to_transport_format() {
        // 20 ms at 24 kHz mono -> 20 ms at 48 kHz stereo
        let pcm = vec![0i16; 480];
        let out = to_transport_format(&pcm, 24000, 1);
        assert_eq!(out.len(), 1920);
        assert_eq!(out.len() * 2, TRANSPORT_FRAME_BYTES);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0, 0, 0]), 0.0);
        let energy = rms(&[1000, -1000, 1000, -1000]);
        assert!((energy - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bytes_pcm_roundtrip() {
        let pcm = vec![1i16, -2, 32767, -32768];
        let bytes = pcm_to_bytes(&pcm);
        assert_eq!(bytes_to_pcm(&bytes), pcm);
    }
}
