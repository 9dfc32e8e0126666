use anyhow::Result;
use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Frames fed to the resampler per call.
pub const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Reads little-endian PCM16 bytes as normalised f32 samples. A trailing odd
/// byte is ignored.
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

/// Writes f32 samples as little-endian PCM16, clamping out-of-range values.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let v = (s * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Converts a PCM16 byte stream between sample rates.
///
/// Client frames rarely line up with the resampler's fixed input size, so
/// leftover samples are carried into the next call. When both rates are the
/// same the bytes pass through untouched.
pub struct PcmResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl PcmResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(
                in_rate as f64,
                out_rate as f64,
                RESAMPLER_CHUNK_SIZE,
            )?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Resamples as much of `pcm` as fills whole chunks. May return an empty
    /// buffer while input is still accumulating.
    pub fn process(&mut self, pcm: Bytes) -> Result<Bytes> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(pcm);
        };
        self.pending.extend(pcm16_to_f32(&pcm));

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let frames = resampler.process(&[chunk], None)?;
            out.extend_from_slice(&frames[0]);
        }
        Ok(Bytes::from(f32_to_pcm16(&out)))
    }

    /// Samples waiting for a full chunk.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
