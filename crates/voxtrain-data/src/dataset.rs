//! Dataset types and loading.

use mlx_rs::{Array, Dtype};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use voxtrain_core::{Dataset, Result, VoxError};

/// Word id used for out-of-vocabulary tokens.
pub const UNK_TOKEN: &str = "<UNK>";
/// Reserved end-of-sequence word.
pub const END_TOKEN: &str = "<END>";
/// Label for "no punctuation after this word".
pub const NO_PUNC: &str = " ";

/// One fixed-length row of the punctuation corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuncSample {
    /// Word ids.
    pub input_ids: Vec<i32>,
    /// Punctuation id following each word.
    pub labels: Vec<i32>,
}

/// Punctuation restoration corpus.
///
/// The text file holds whitespace-separated tokens where punctuation marks
/// appear as standalone tokens. Every word becomes one input position whose
/// label is the punctuation mark that follows it (or [`NO_PUNC`]).
#[derive(Debug, Clone)]
pub struct PuncDataset {
    seq_len: usize,
    word2id: HashMap<String, i32>,
    punc2id: HashMap<String, i32>,
    id2punc: Vec<String>,
    rows: Vec<PuncSample>,
}

impl PuncDataset {
    /// Load a corpus from disk.
    pub fn new(
        text_path: impl AsRef<Path>,
        vocab_path: impl AsRef<Path>,
        punc_path: impl AsRef<Path>,
        seq_len: usize,
    ) -> Result<Self> {
        if seq_len == 0 {
            return Err(VoxError::InvalidArgument("seq_len must be positive".into()));
        }
        let word2id = load_vocab(vocab_path.as_ref(), &[UNK_TOKEN, END_TOKEN])?;
        let punc2id = load_vocab(punc_path.as_ref(), &[NO_PUNC])?;

        let text = std::fs::read_to_string(text_path.as_ref()).map_err(|e| {
            VoxError::Data(format!(
                "failed to read {}: {}",
                text_path.as_ref().display(),
                e
            ))
        })?;
        let tokens: Vec<&str> = text.split_whitespace().collect();

        Self::from_tokens(&tokens, word2id, punc2id, seq_len)
    }

    /// Build a corpus from an in-memory token stream.
    pub fn from_tokens(
        tokens: &[&str],
        word2id: HashMap<String, i32>,
        punc2id: HashMap<String, i32>,
        seq_len: usize,
    ) -> Result<Self> {
        let unk = *word2id
            .get(UNK_TOKEN)
            .ok_or_else(|| VoxError::Data("vocabulary has no <UNK> entry".into()))?;
        let blank = *punc2id
            .get(NO_PUNC)
            .ok_or_else(|| VoxError::Data("punctuation vocabulary has no blank entry".into()))?;

        let mut ids = Vec::with_capacity(tokens.len());
        let mut labels = Vec::with_capacity(tokens.len());
        for window in tokens.windows(2) {
            let (token, next) = (window[0], window[1]);
            if punc2id.contains_key(token) {
                continue;
            }
            ids.push(word2id.get(token).copied().unwrap_or(unk));
            labels.push(punc2id.get(next).copied().unwrap_or(blank));
        }

        let n_rows = ids.len() / seq_len;
        let rows = (0..n_rows)
            .map(|r| {
                let span = r * seq_len..(r + 1) * seq_len;
                PuncSample {
                    input_ids: ids[span.clone()].to_vec(),
                    labels: labels[span].to_vec(),
                }
            })
            .collect();

        let mut id2punc = vec![String::new(); punc2id.len()];
        for (punc, &id) in &punc2id {
            if let Some(slot) = id2punc.get_mut(id as usize) {
                *slot = punc.clone();
            }
        }

        tracing::debug!(
            words = ids.len(),
            rows = n_rows,
            seq_len,
            "Built punctuation corpus"
        );

        Ok(Self {
            seq_len,
            word2id,
            punc2id,
            id2punc,
            rows,
        })
    }

    /// Sequence length of each row.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Size of the word vocabulary, including reserved entries.
    pub fn vocab_size(&self) -> usize {
        self.word2id.len()
    }

    /// Number of punctuation classes, including the blank class.
    pub fn num_classes(&self) -> usize {
        self.punc2id.len()
    }

    /// Label names indexed by id.
    pub fn id2punc(&self) -> &[String] {
        &self.id2punc
    }

    /// Word-to-id mapping.
    pub fn word2id(&self) -> &HashMap<String, i32> {
        &self.word2id
    }
}

impl Dataset for PuncDataset {
    type Item = PuncSample;

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn get(&self, index: usize) -> Option<Self::Item> {
        self.rows.get(index).cloned()
    }
}

/// Read a vocabulary file: one entry per line, ids starting after `reserved`.
///
/// Duplicate entries are rejected, so every id below the map's length is
/// handed out exactly once.
pub fn load_vocab(path: &Path, reserved: &[&str]) -> Result<HashMap<String, i32>> {
    let file = File::open(path)
        .map_err(|e| VoxError::Data(format!("failed to open {}: {}", path.display(), e)))?;
    let offset = reserved.len() as i32;
    let mut vocab: HashMap<String, i32> = reserved
        .iter()
        .enumerate()
        .map(|(i, word)| ((*word).to_string(), i as i32))
        .collect();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let entry = line?.trim().to_string();
        if let Some(previous) = vocab.insert(entry.clone(), i as i32 + offset) {
            return Err(VoxError::Data(format!(
                "{}: line {} repeats {:?} (already id {})",
                path.display(),
                i + 1,
                entry,
                previous
            )));
        }
    }
    Ok(vocab)
}

/// One utterance of the vocoder corpus.
#[derive(Debug, Clone)]
pub struct WaveMelSample {
    /// Utterance identifier.
    pub utt_id: String,
    /// Waveform samples.
    pub wave: Vec<f32>,
    /// Mel features, row-major `[frames, aux_channels]`.
    pub feats: Vec<f32>,
    /// Number of feature frames.
    pub frames: usize,
    /// Feature dimension.
    pub aux_channels: usize,
}

#[derive(Debug, Deserialize)]
struct MetadataRecord {
    utt_id: String,
    path: PathBuf,
}

/// Vocoder corpus described by a `metadata.jsonl` file.
///
/// Each record points at a safetensors file holding a `wave` array `[T]`
/// and a `feats` array `[frames, aux_channels]`. Files are read on access.
#[derive(Debug, Clone)]
pub struct WaveMelDataset {
    entries: Vec<(String, PathBuf)>,
}

impl WaveMelDataset {
    /// Load the utterance list from a metadata file.
    ///
    /// Relative paths are resolved against the metadata file's directory.
    pub fn from_metadata(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let file = File::open(path)
            .map_err(|e| VoxError::Data(format!("failed to open {}: {}", path.display(), e)))?;

        let mut entries = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: MetadataRecord = serde_json::from_str(&line).map_err(|e| {
                VoxError::Data(format!("{}:{}: {}", path.display(), line_no + 1, e))
            })?;
            let full = if record.path.is_absolute() {
                record.path
            } else {
                base.join(record.path)
            };
            entries.push((record.utt_id, full));
        }

        tracing::info!(utterances = entries.len(), path = %path.display(), "Loaded vocoder metadata");
        Ok(Self { entries })
    }

    /// Build from explicit `(utt_id, path)` pairs.
    pub fn from_entries(entries: Vec<(String, PathBuf)>) -> Self {
        Self { entries }
    }

    /// Load one utterance.
    pub fn load(&self, index: usize) -> Result<WaveMelSample> {
        let (utt_id, path) = self
            .entries
            .get(index)
            .ok_or_else(|| VoxError::InvalidArgument(format!("index {} out of range", index)))?;

        let tensors = Array::load_safetensors(path)
            .map_err(|e| VoxError::Data(format!("failed to load {}: {}", path.display(), e)))?;
        let wave = tensors
            .get("wave")
            .ok_or_else(|| VoxError::Data(format!("{} has no `wave` tensor", path.display())))?;
        let feats = tensors
            .get("feats")
            .ok_or_else(|| VoxError::Data(format!("{} has no `feats` tensor", path.display())))?;
        if feats.ndim() != 2 {
            return Err(VoxError::ShapeMismatch {
                expected: vec![-1, -1],
                actual: feats.shape().to_vec(),
            });
        }

        let frames = feats.dim(0) as usize;
        let aux_channels = feats.dim(1) as usize;
        Ok(WaveMelSample {
            utt_id: utt_id.clone(),
            wave: to_f32_vec(wave)?,
            feats: to_f32_vec(feats)?,
            frames,
            aux_channels,
        })
    }

    /// Save one utterance in the layout [`WaveMelDataset::load`] expects.
    pub fn write_sample(path: impl AsRef<Path>, wave: &[f32], feats: &[f32], aux_channels: usize) -> Result<()> {
        if aux_channels == 0 || feats.len() % aux_channels != 0 {
            return Err(VoxError::InvalidArgument(format!(
                "{} feature values do not divide into {} channels",
                feats.len(),
                aux_channels
            )));
        }
        let frames = (feats.len() / aux_channels) as i32;
        let wave = Array::from_slice(wave, &[wave.len() as i32]);
        let feats = Array::from_slice(feats, &[frames, aux_channels as i32]);
        let tensors: HashMap<String, Array> =
            [("wave".to_string(), wave), ("feats".to_string(), feats)].into_iter().collect();
        Array::save_safetensors(tensors, None, path.as_ref())
            .map_err(|e| VoxError::Data(format!("failed to save sample: {}", e)))
    }
}

impl Dataset for WaveMelDataset {
    type Item = Result<WaveMelSample>;

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> Option<Self::Item> {
        (index < self.entries.len()).then(|| self.load(index))
    }
}

fn to_f32_vec(array: &Array) -> Result<Vec<f32>> {
    let array = array.as_dtype(Dtype::Float32)?;
    array.eval()?;
    Ok(array.as_slice::<f32>().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_lines(dir: &TempDir, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        for l in lines {
            writeln!(f, "{}", l).unwrap();
        }
        path
    }

    #[test]
    fn test_vocab_reserves_leading_ids() {
        let dir = TempDir::new().unwrap();
        let vocab = write_lines(&dir, "vocab", &["hello", "world"]);
        let map = load_vocab(&vocab, &[UNK_TOKEN, END_TOKEN]).unwrap();
        assert_eq!(map[UNK_TOKEN], 0);
        assert_eq!(map[END_TOKEN], 1);
        assert_eq!(map["hello"], 2);
        assert_eq!(map["world"], 3);
    }

    #[test]
    fn test_vocab_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let vocab = write_lines(&dir, "vocab", &["hello", "world", "hello"]);
        let err = load_vocab(&vocab, &[UNK_TOKEN, END_TOKEN]).unwrap_err();
        assert!(err.to_string().contains("line 3"));

        let vocab = write_lines(&dir, "vocab_unk", &["<UNK>", "world"]);
        assert!(load_vocab(&vocab, &[UNK_TOKEN, END_TOKEN]).is_err());
    }

    #[test]
    fn test_punc_labels_follow_words() {
        let dir = TempDir::new().unwrap();
        let vocab = write_lines(&dir, "vocab", &["a", "b", "c", "d"]);
        let punc = write_lines(&dir, "punc", &["，", "。", "？"]);
        let text = write_lines(&dir, "train.txt", &["a b ， c d 。", "a ？ b"]);

        let ds = PuncDataset::new(&text, &vocab, &punc, 2).unwrap();
        // words emitted: a b c d a (the trailing `b` is the last token and is never emitted)
        assert_eq!(ds.len(), 2);
        let first = ds.get(0).unwrap();
        assert_eq!(first.input_ids, vec![2, 3]);
        assert_eq!(first.labels, vec![0, 1]);
        let second = ds.get(1).unwrap();
        assert_eq!(second.input_ids, vec![4, 5]);
        assert_eq!(second.labels, vec![0, 2]);
        assert_eq!(ds.id2punc(), &[" ", "，", "。", "？"]);
        assert_eq!(ds.num_classes(), 4);
    }

    #[test]
    fn test_unknown_words_map_to_unk() {
        let word2id: HashMap<String, i32> =
            [(UNK_TOKEN.to_string(), 0), (END_TOKEN.to_string(), 1), ("x".to_string(), 2)]
                .into_iter()
                .collect();
        let punc2id: HashMap<String, i32> =
            [(NO_PUNC.to_string(), 0), ("。".to_string(), 1)].into_iter().collect();
        let ds = PuncDataset::from_tokens(&["x", "zzz", "。", "x"], word2id, punc2id, 2).unwrap();
        let row = ds.get(0).unwrap();
        assert_eq!(row.input_ids, vec![2, 0]);
        assert_eq!(row.labels, vec![0, 1]);
    }

    #[test]
    fn test_zero_seq_len_rejected() {
        let dir = TempDir::new().unwrap();
        let vocab = write_lines(&dir, "vocab", &["a"]);
        let punc = write_lines(&dir, "punc", &["。"]);
        let text = write_lines(&dir, "t", &["a 。"]);
        assert!(PuncDataset::new(&text, &vocab, &punc, 0).is_err());
    }

    #[test]
    fn test_wave_mel_metadata_roundtrip() {
        let dir = TempDir::new().unwrap();
        let wave: Vec<f32> = (0..32).map(|i| i as f32 / 32.0).collect();
        let feats: Vec<f32> = (0..12).map(|i| i as f32).collect();
        WaveMelDataset::write_sample(dir.path().join("utt1.safetensors"), &wave, &feats, 3).unwrap();
        let meta = write_lines(
            &dir,
            "metadata.jsonl",
            &[r#"{"utt_id": "utt1", "path": "utt1.safetensors"}"#],
        );

        let ds = WaveMelDataset::from_metadata(&meta).unwrap();
        assert_eq!(ds.len(), 1);
        let sample = ds.get(0).unwrap().unwrap();
        assert_eq!(sample.utt_id, "utt1");
        assert_eq!(sample.frames, 4);
        assert_eq!(sample.aux_channels, 3);
        assert_eq!(sample.wave.len(), 32);
        assert!(ds.get(1).is_none());
    }
}
