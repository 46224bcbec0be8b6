//! Punctuation taggers.
//!
//! Both architectures map word ids `[batch, seq_len]` to per-token class
//! scores flattened to `[batch * seq_len, num_classes]`, together with their
//! softmax.

use mlx_rs::{
    macros::ModuleParameters,
    module::{Module, ModuleParameters},
    nn,
    ops::softmax_axis,
    Array,
};

use crate::config::{ModelParams, ModelType};
use crate::error::Result;
use crate::nn::{dropout, init_uniform, StackedLstm};

/// A trainable punctuation tagger.
pub trait PuncClassifier: ModuleParameters {
    /// Returns `(scores, probabilities)`, both `[batch * seq_len, classes]`.
    fn forward(&mut self, input_ids: &Array) -> Result<(Array, Array)>;

    /// Switch between training (dropout on) and evaluation.
    fn set_training(&mut self, training: bool);

    /// Number of output classes.
    fn num_classes(&self) -> i32;
}

/// `embed -> dropout -> lstm -> dropout -> fc`.
#[derive(Debug, ModuleParameters)]
pub struct RnnLm {
    /// Word embeddings of size `hidden_size`.
    #[param]
    pub embedder: nn::Embedding,
    /// Unidirectional LSTM.
    #[param]
    pub lstm: StackedLstm,
    /// Output projection.
    #[param]
    pub fc: nn::Linear,
    dropout: nn::Dropout,
    punc_size: i32,
}

impl RnnLm {
    /// Create the model with every weight drawn from `±init_scale`.
    pub fn new(
        vocab_size: i32,
        punc_size: i32,
        hidden_size: i32,
        num_layers: i32,
        init_scale: f32,
        dropout_p: f32,
    ) -> Result<Self> {
        let mut model = Self {
            embedder: nn::Embedding::new(vocab_size, hidden_size)?,
            lstm: StackedLstm::new(hidden_size, hidden_size, num_layers, false, dropout_p)?,
            fc: nn::LinearBuilder::new(hidden_size, punc_size).build()?,
            dropout: dropout(dropout_p)?,
            punc_size,
        };
        init_uniform(&mut model, init_scale)?;
        Ok(model)
    }
}

impl PuncClassifier for RnnLm {
    fn forward(&mut self, input_ids: &Array) -> Result<(Array, Array)> {
        let x = self.embedder.forward(input_ids)?;
        let x = self.dropout.forward(&x)?;
        let y = self.lstm.forward(&x)?;
        let y = self.dropout.forward(&y)?;
        let y = self.fc.forward(&y)?.reshape(&[-1, self.punc_size])?;
        let probs = softmax_axis(&y, -1, None)?;
        Ok((y, probs))
    }

    fn set_training(&mut self, training: bool) {
        self.dropout.training_mode(training);
        self.lstm.set_training(training);
    }

    fn num_classes(&self) -> i32 {
        self.punc_size
    }
}

/// `embed -> bidirectional lstm -> fc`.
#[derive(Debug, ModuleParameters)]
pub struct BiLstm {
    /// Word embeddings.
    #[param]
    pub embedding: nn::Embedding,
    /// Bidirectional LSTM.
    #[param]
    pub lstm: StackedLstm,
    /// Projection from `2 * hidden_size`.
    #[param]
    pub fc: nn::Linear,
    num_class: i32,
}

impl BiLstm {
    /// Create the model with every weight drawn from `±init_scale`.
    pub fn new(
        vocab_size: i32,
        embedding_size: i32,
        hidden_size: i32,
        num_layers: i32,
        num_class: i32,
        init_scale: f32,
    ) -> Result<Self> {
        let lstm = StackedLstm::new(embedding_size, hidden_size, num_layers, true, 0.0)?;
        let mut model = Self {
            embedding: nn::Embedding::new(vocab_size, embedding_size)?,
            fc: nn::LinearBuilder::new(lstm.output_size(), num_class).build()?,
            lstm,
            num_class,
        };
        init_uniform(&mut model, init_scale)?;
        Ok(model)
    }
}

impl PuncClassifier for BiLstm {
    fn forward(&mut self, input_ids: &Array) -> Result<(Array, Array)> {
        let x = self.embedding.forward(input_ids)?;
        let y = self.lstm.forward(&x)?;
        let y = self.fc.forward(&y)?.reshape(&[-1, self.num_class])?;
        let probs = softmax_axis(&y, -1, None)?;
        Ok((y, probs))
    }

    fn set_training(&mut self, training: bool) {
        self.lstm.set_training(training);
    }

    fn num_classes(&self) -> i32 {
        self.num_class
    }
}

/// Either architecture, as selected by `model_type`.
#[derive(Debug)]
pub enum PuncModel {
    /// [`RnnLm`].
    Lstm(RnnLm),
    /// [`BiLstm`].
    Blstm(BiLstm),
}

impl PuncModel {
    /// Build the architecture named by `model_type`.
    pub fn build(model_type: ModelType, params: &ModelParams) -> Result<Self> {
        params.validate()?;
        let model = match model_type {
            ModelType::Lstm => PuncModel::Lstm(RnnLm::new(
                params.vocab_size,
                params.punc_size,
                params.hidden_size,
                params.num_layers,
                params.init_scale,
                params.dropout,
            )?),
            ModelType::Blstm => PuncModel::Blstm(BiLstm::new(
                params.vocab_size,
                params.embedding_size(),
                params.hidden_size,
                params.num_layers,
                params.punc_size,
                params.init_scale,
            )?),
        };
        tracing::info!(
            model_type = ?model_type,
            parameters = model.num_parameters(),
            "Built punctuation model"
        );
        Ok(model)
    }

    /// Total scalar parameter count.
    pub fn num_parameters(&self) -> usize {
        let params = match self {
            PuncModel::Lstm(m) => m.parameters().flatten(),
            PuncModel::Blstm(m) => m.parameters().flatten(),
        };
        params.values().map(|a| a.size()).sum()
    }

    /// Scores and probabilities for `input_ids`.
    pub fn forward(&mut self, input_ids: &Array) -> Result<(Array, Array)> {
        match self {
            PuncModel::Lstm(m) => m.forward(input_ids),
            PuncModel::Blstm(m) => m.forward(input_ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ModelParams {
        ModelParams {
            vocab_size: 20,
            punc_size: 4,
            hidden_size: 6,
            embedding_size: Some(5),
            num_layers: 2,
            init_scale: 0.1,
            dropout: 0.0,
        }
    }

    #[test]
    fn test_both_models_flatten_tokens() {
        let ids = Array::from_slice(&[1i32, 2, 3, 4, 5, 6, 7, 8], &[2, 4]);
        for model_type in [ModelType::Lstm, ModelType::Blstm] {
            let mut model = PuncModel::build(model_type, &params()).unwrap();
            let (y, probs) = model.forward(&ids).unwrap();
            assert_eq!(y.shape(), &[8, 4]);
            let row_sums = probs.sum_axes(&[-1], None).unwrap();
            row_sums.eval().unwrap();
            assert!(row_sums.as_slice::<f32>().iter().all(|s| (s - 1.0).abs() < 1e-5));
        }
    }

    #[test]
    fn test_rnnlm_ignores_embedding_size() {
        let PuncModel::Lstm(model) = PuncModel::build(ModelType::Lstm, &params()).unwrap() else {
            panic!("expected RnnLm");
        };
        assert_eq!(model.embedder.weight.shape(), &[20, 6]);
    }

    #[test]
    fn test_bilstm_projection_width() {
        let PuncModel::Blstm(model) = PuncModel::build(ModelType::Blstm, &params()).unwrap() else {
            panic!("expected BiLstm");
        };
        assert_eq!(model.fc.weight.shape(), &[4, 12]);
        assert_eq!(model.num_classes(), 4);
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        let mut p = params();
        p.hidden_size = 0;
        assert!(PuncModel::build(ModelType::Lstm, &p).is_err());
    }
}
