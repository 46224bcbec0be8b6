//! Batch collation.

use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::Rng;
use voxtrain_core::{Result, VoxError};

use crate::dataset::{PuncSample, WaveMelSample};

/// Turns a list of dataset items into a model-ready batch.
///
/// Returning `Ok(None)` means every item was filtered out and the batch
/// should be skipped.
pub trait Collator<T> {
    /// Batch type produced.
    type Batch;

    /// Collate `samples` into one batch.
    fn collate(&self, samples: Vec<T>, rng: &mut StdRng) -> Result<Option<Self::Batch>>;
}

/// A batch of punctuation rows.
#[derive(Debug, Clone)]
pub struct PuncBatch {
    /// Word ids `[batch, seq_len]`.
    pub input_ids: Array,
    /// Punctuation labels `[batch, seq_len]`.
    pub labels: Array,
    /// Number of rows.
    pub batch_size: usize,
    /// Row length.
    pub seq_len: usize,
}

/// Stacks fixed-length punctuation rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct PuncCollator;

impl Collator<PuncSample> for PuncCollator {
    type Batch = PuncBatch;

    fn collate(&self, samples: Vec<PuncSample>, _rng: &mut StdRng) -> Result<Option<PuncBatch>> {
        let Some(first) = samples.first() else {
            return Ok(None);
        };
        let seq_len = first.input_ids.len();
        let batch_size = samples.len();

        let mut ids = Vec::with_capacity(batch_size * seq_len);
        let mut labels = Vec::with_capacity(batch_size * seq_len);
        for sample in &samples {
            if sample.input_ids.len() != seq_len || sample.labels.len() != seq_len {
                return Err(VoxError::ShapeMismatch {
                    expected: vec![seq_len as i32],
                    actual: vec![sample.input_ids.len() as i32, sample.labels.len() as i32],
                });
            }
            ids.extend_from_slice(&sample.input_ids);
            labels.extend_from_slice(&sample.labels);
        }

        let shape = [batch_size as i32, seq_len as i32];
        Ok(Some(PuncBatch {
            input_ids: Array::from_slice(&ids, &shape),
            labels: Array::from_slice(&labels, &shape),
            batch_size,
            seq_len,
        }))
    }
}

/// A batch of aligned waveform and mel segments.
#[derive(Debug, Clone)]
pub struct VocoderBatch {
    /// Waveform segments `[batch, 1, batch_max_steps]`.
    pub wave: Array,
    /// Mel segments with context `[batch, aux_channels, frames + 2 * aux_context_window]`.
    pub mel: Array,
}

/// Cuts a random aligned window out of every utterance.
///
/// Utterances with `frames <= batch_max_frames + 2 * aux_context_window`
/// are dropped from the batch.
#[derive(Debug, Clone)]
pub struct ClipCollator {
    batch_max_frames: usize,
    hop_size: usize,
    aux_context_window: usize,
}

impl ClipCollator {
    /// Create a collator producing `batch_max_steps` samples per item.
    ///
    /// `batch_max_steps` is rounded down to a multiple of `hop_size`.
    pub fn new(batch_max_steps: usize, hop_size: usize, aux_context_window: usize) -> Result<Self> {
        if hop_size == 0 {
            return Err(VoxError::InvalidArgument("hop_size must be positive".into()));
        }
        let batch_max_frames = batch_max_steps / hop_size;
        if batch_max_frames == 0 {
            return Err(VoxError::InvalidArgument(format!(
                "batch_max_steps ({}) must be at least hop_size ({})",
                batch_max_steps, hop_size
            )));
        }
        Ok(Self {
            batch_max_frames,
            hop_size,
            aux_context_window,
        })
    }

    /// Samples per waveform segment.
    pub fn batch_max_steps(&self) -> usize {
        self.batch_max_frames * self.hop_size
    }

    /// Frames per mel segment, excluding context.
    pub fn batch_max_frames(&self) -> usize {
        self.batch_max_frames
    }

    fn mel_threshold(&self) -> usize {
        self.batch_max_frames + 2 * self.aux_context_window
    }

    /// Pad (edge) or truncate the waveform to `frames * hop_size` samples.
    fn adjust_length(&self, wave: &mut Vec<f32>, frames: usize) {
        let target = frames * self.hop_size;
        if wave.len() < target {
            let edge = wave.last().copied().unwrap_or(0.0);
            wave.resize(target, edge);
        } else {
            wave.truncate(target);
        }
    }
}

impl Collator<Result<WaveMelSample>> for ClipCollator {
    type Batch = VocoderBatch;

    fn collate(
        &self,
        samples: Vec<Result<WaveMelSample>>,
        rng: &mut StdRng,
    ) -> Result<Option<VocoderBatch>> {
        let aux = self.aux_context_window;
        let steps = self.batch_max_steps();
        let mel_len = self.batch_max_frames + 2 * aux;

        let mut waves = Vec::new();
        let mut mels = Vec::new();
        let mut channels = None;
        let mut kept = 0usize;

        for sample in samples {
            let mut sample = sample?;
            if sample.frames <= self.mel_threshold() {
                tracing::trace!(utt_id = %sample.utt_id, frames = sample.frames, "Dropping short utterance");
                continue;
            }
            let c = *channels.get_or_insert(sample.aux_channels);
            if c != sample.aux_channels {
                return Err(VoxError::ShapeMismatch {
                    expected: vec![c as i32],
                    actual: vec![sample.aux_channels as i32],
                });
            }

            self.adjust_length(&mut sample.wave, sample.frames);

            let start = rng.gen_range(aux..sample.frames - self.batch_max_frames - aux);
            let wave_start = start * self.hop_size;
            waves.extend_from_slice(&sample.wave[wave_start..wave_start + steps]);

            // [frames, C] -> [C, frames] for the selected window
            let first = start - aux;
            for ch in 0..c {
                mels.extend((first..first + mel_len).map(|t| sample.feats[t * c + ch]));
            }
            kept += 1;
        }

        let Some(c) = channels else {
            return Ok(None);
        };

        Ok(Some(VocoderBatch {
            wave: Array::from_slice(&waves, &[kept as i32, 1, steps as i32]),
            mel: Array::from_slice(&mels, &[kept as i32, c as i32, mel_len as i32]),
        }))
    }
}
