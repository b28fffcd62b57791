use base64::Engine;

/// Sample rate of the default `pcm_16000` output format.
pub const PCM16_SAMPLE_RATE: u32 = 16000;

/// Sample rate encoded in an output format name such as `pcm_16000` or `pcm_22050`.
///
/// Returns `None` for non-PCM formats, which raw PCM sinks cannot play.
pub fn pcm_sample_rate(output_format: &str) -> Option<u32> {
    output_format.strip_prefix("pcm_")?.parse().ok()
}

/// Decodes a base64 audio payload into raw PCM16 little-endian bytes.
///
/// An odd trailing byte is dropped so the result always holds whole samples.
pub fn decode_pcm16(base64_fragment: &str) -> Option<Vec<u8>> {
    match base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        Ok(mut bytes) => {
            bytes.truncate(bytes.len() - bytes.len() % 2);
            Some(bytes)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode base64 audio fragment");
            None
        }
    }
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Interprets PCM16 little-endian bytes as samples.
pub fn bytes_to_i16(pcm16_bytes: &[u8]) -> Vec<i16> {
    pcm16_bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

/// Peak absolute amplitude in `[0.0, 1.0]`, useful to tell silence from speech.
pub fn peak_level(pcm16_bytes: &[u8]) -> f32 {
    convert_i16_to_f32(&bytes_to_i16(pcm16_bytes))
        .into_iter()
        .fold(0.0f32, |peak, s| peak.max(s.abs()))
}
