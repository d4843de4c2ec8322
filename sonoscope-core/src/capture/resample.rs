//! Rate conversion to the fixed 44.1 kHz pipeline format.
//!
//! Backends produce mono `f32` at whatever rate their source runs; the
//! pipeline stores mono `i16` at [`SAMPLE_RATE`]. `RateConverter::convert`
//! does both steps in one pass: resample through a rubato `FastFixedIn`
//! session when the rates differ, then quantize with saturation. At matching
//! rates no rubato session exists and conversion is a straight quantize.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{Result, SonoscopeError};
use crate::{CHUNK_SIZE, SAMPLE_RATE};

/// Input frames per rubato call. Source samples are batched to this size;
/// a sub-block tail is held until the next `convert`.
const RESAMPLE_BLOCK: usize = CHUNK_SIZE;

/// One-way converter from a source rate to pipeline-format samples.
pub struct RateConverter {
    /// `None` at matching rates; `convert` then only quantizes.
    resampler: Option<FastFixedIn<f32>>,
    /// Tail of the input still waiting for a full resample block.
    pending: Vec<f32>,
    /// Rubato output buffer, `[1][output_frames_max]`.
    resampled: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `SonoscopeError::AudioStream` if rubato fails to initialise.
    pub fn new(source_rate: u32) -> Result<Self> {
        if source_rate == SAMPLE_RATE {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                resampled: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            f64::from(SAMPLE_RATE) / f64::from(source_rate),
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            RESAMPLE_BLOCK,
            1, // mono
        )
        .map_err(|e| SonoscopeError::AudioStream(format!("resampler init: {e}")))?;

        let resampled = vec![vec![0f32; resampler.output_frames_max()]; 1];
        debug!(source_rate, "resampling to pipeline rate");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(2 * RESAMPLE_BLOCK),
            resampled,
        })
    }

    /// Converts `input` and appends pipeline-rate `i16` samples to `out`.
    ///
    /// May append nothing while a sub-block tail accumulates; the tail is
    /// flushed as soon as later input completes a block.
    pub fn convert(&mut self, input: &[f32], out: &mut Vec<i16>) {
        let Some(ref mut resampler) = self.resampler else {
            out.extend(input.iter().map(|&v| quantize(v)));
            return;
        };

        self.pending.extend_from_slice(input);

        let mut consumed = 0;
        while self.pending.len() - consumed >= RESAMPLE_BLOCK {
            let block = &self.pending[consumed..consumed + RESAMPLE_BLOCK];
            match resampler.process_into_buffer(&[block], &mut self.resampled, None) {
                Ok((_, produced)) => {
                    out.extend(self.resampled[0][..produced].iter().map(|&v| quantize(v)));
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed += RESAMPLE_BLOCK;
        }
        if consumed > 0 {
            self.pending.copy_within(consumed.., 0);
            self.pending.truncate(self.pending.len() - consumed);
        }
    }
}

/// Saturating f32 → i16 quantization of a `[-1.0, 1.0]` sample.
fn quantize(v: f32) -> i16 {
    (v.clamp(-1.0, 1.0) * 32767.0) as i16
}
