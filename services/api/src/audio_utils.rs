use base64::Engine;
use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::warn;

// Define standard sample rates for clarity and consistency
pub const OPENAI_REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;
/// Microphone audio as captured by the browser.
pub const FRONTEND_MIC_SAMPLE_RATE: f64 = 24000.0;
/// Microphone audio inside a live session; Gemini consumes it as is.
pub const LIVE_INPUT_SAMPLE_RATE: f64 = 16000.0;
/// 20 ms at 24 kHz.
pub const RESAMPLER_CHUNK_FRAMES: usize = 480;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Resamples a continuous PCM16 mono stream delivered in arbitrarily sized
/// pieces. Samples that do not fill a whole resampler chunk are carried over
/// to the next call.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_sampling_rate: f64, out_sampling_rate: f64) -> anyhow::Result<Self> {
        let resampler = if in_sampling_rate == out_sampling_rate {
            None
        } else {
            Some(create_resampler(
                in_sampling_rate,
                out_sampling_rate,
                RESAMPLER_CHUNK_FRAMES,
            )?)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    /// Samples waiting for a full chunk.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn process(&mut self, pcm16: &[i16]) -> Vec<i16> {
        let Some(resampler) = self.resampler.as_mut() else {
            return pcm16.to_vec();
        };

        self.pending.extend(convert_i16_to_f32(pcm16));
        let mut resampled = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(mut output) => {
                    if let Some(channel) = output.pop() {
                        resampled.extend(channel);
                    }
                }
                Err(e) => warn!(error = %e, "Dropping audio chunk that failed to resample"),
            }
        }
        convert_f32_to_i16(&resampled)
    }
}

/// Interprets little-endian bytes as PCM16 samples. A trailing odd byte is ignored.
pub fn pcm16_from_bytes(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub fn bytes_from_pcm16(pcm16: &[i16]) -> Bytes {
    pcm16
        .iter()
        .flat_map(|sample| sample.to_le_bytes())
        .collect::<Vec<u8>>()
        .into()
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_base64(fragment: &str) -> Result<Bytes, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD
        .decode(fragment)
        .map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(24000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(48000.0, 24000.0, 1024).is_ok());
    }

    #[test]
    fn test_pcm16_from_bytes() {
        // 16384 = 0x4000, -32768 = 0x8000, little endian
        let samples = pcm16_from_bytes(&[0x00, 0x40, 0x00, 0x80, 0x7f]);
        assert_eq!(samples, vec![16384, i16::MIN]);
        assert_eq!(bytes_from_pcm16(&samples).as_ref(), &[0x00, 0x40, 0x00, 0x80]);
    }

    #[test]
    fn test_convert_f32_to_i16_clamps() {
        let result = convert_f32_to_i16(&[1.0, -1.0, 0.0, 2.0, -2.0]);
        assert_eq!(result, vec![i16::MAX, -32767, 0, i16::MAX, i16::MIN]);
        assert!(convert_f32_to_i16(&[]).is_empty());
    }

    #[test]
    fn test_convert_i16_to_f32() {
        let result = convert_i16_to_f32(&[i16::MAX, i16::MIN, 0, 16384]);
        assert_abs_diff_eq!(result[0], i16::MAX as f32 / 32768.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[3], 0.5, epsilon = 0.0001);
    }

    #[test]
    fn test_decode_base64_rejects_garbage() {
        assert!(decode_base64("invalid_base64!").is_err());
        let encoded = encode_base64(&[1, 2, 3, 4]);
        assert_eq!(decode_base64(&encoded).unwrap().as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_stream_resampler_passes_through_equal_rates() {
        let mut resampler = StreamResampler::new(24000.0, 24000.0).unwrap();
        let input: Vec<i16> = (0..100).collect();
        assert_eq!(resampler.process(&input), input);
        assert_eq!(resampler.pending_len(), 0);
    }

    #[test]
    fn test_stream_resampler_carries_partial_chunks() {
        let mut resampler =
            StreamResampler::new(FRONTEND_MIC_SAMPLE_RATE, LIVE_INPUT_SAMPLE_RATE).unwrap();

        let first = resampler.process(&vec![1000i16; 300]);
        assert!(first.is_empty());
        assert_eq!(resampler.pending_len(), 300);

        let second = resampler.process(&vec![1000i16; 300]);
        assert_eq!(resampler.pending_len(), 600 - RESAMPLER_CHUNK_FRAMES);
        assert!(!second.is_empty());
    }

    #[test]
    fn test_stream_resampler_downsamples_by_ratio() {
        let mut resampler =
            StreamResampler::new(FRONTEND_MIC_SAMPLE_RATE, LIVE_INPUT_SAMPLE_RATE).unwrap();
        let input = vec![0i16; RESAMPLER_CHUNK_FRAMES * 10];
        let output = resampler.process(&input);
        // 24 kHz -> 16 kHz keeps two thirds of the samples.
        let expected = RESAMPLER_CHUNK_FRAMES * 10 * 2 / 3;
        assert!(
            output.len().abs_diff(expected) <= RESAMPLER_CHUNK_FRAMES,
            "got {} samples, expected about {expected}",
            output.len()
        );
    }
}
