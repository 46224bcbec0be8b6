//! Forward-only evaluation of a generator/discriminator pair.

use mlx_rs::Array;
use voxtrain_core::report;
use voxtrain_data::VocoderBatch;
use voxtrain_trainer::{BatchSource, Evaluator};

use crate::loss::{adversarial_loss, discriminator_loss};
use crate::updater::{format_losses, PwgUpdater};

/// Seed of the input noise fed to the generator on every dev batch.
const EVAL_NOISE_SEED: u64 = 0;

/// Evaluates the models held by a [`PwgUpdater`] on a dev loader.
///
/// Dev losses are deterministic: dropout is off during the pass and the
/// generator noise is drawn from a fixed key.
pub struct PwgEvaluator<L> {
    loader: L,
    lambda_adv: f32,
    msg: String,
}

impl<L> PwgEvaluator<L> {
    /// Create an evaluator over `loader`.
    pub fn new(loader: L, lambda_adv: f32) -> Self {
        Self {
            loader,
            lambda_adv,
            msg: String::new(),
        }
    }

    /// Loss message of the last evaluated batch.
    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl<L, T> Evaluator<PwgUpdater<T>> for PwgEvaluator<L>
where
    L: BatchSource<Batch = VocoderBatch>,
    T: BatchSource<Batch = VocoderBatch>,
{
    type Loader = L;

    fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    fn set_training(&mut self, updater: &mut PwgUpdater<T>, training: bool) {
        updater.generator_mut().set_training(training);
    }

    fn evaluate_core(
        &mut self,
        updater: &mut PwgUpdater<T>,
        batch: VocoderBatch,
    ) -> voxtrain_trainer::Result<()> {
        let key = mlx_rs::random::key(EVAL_NOISE_SEED)?;
        let noise = mlx_rs::random::normal::<f32>(batch.wave.shape(), None, None, Some(&key))?;
        let wav_ = updater.generator_mut().forward(&noise, &batch.mel)?;

        let discriminator = updater.discriminator();
        let p_ = discriminator.forward(&wav_)?;

        let adv = adversarial_loss(&p_)?;
        let (sc, mag) = updater.criterion_stft().forward(&wav_, &batch.wave)?;
        let gen = adv
            .multiply(&Array::from_f32(self.lambda_adv))?
            .add(&sc)?
            .add(&mag)?;

        let p = discriminator.forward(&batch.wave)?;
        let (real, fake) = discriminator_loss(&p, &p_)?;
        let dis = real.add(&fake)?;

        let losses = [
            ("adversarial_loss", adv.item::<f32>()),
            ("spectral_convergence_loss", sc.item::<f32>()),
            ("log_stft_magnitude_loss", mag.item::<f32>()),
            ("generator_loss", gen.item::<f32>()),
            ("real_loss", real.item::<f32>()),
            ("fake_loss", fake.item::<f32>()),
            ("discriminator_loss", dis.item::<f32>()),
        ];
        for (name, value) in &losses {
            report(format!("eval/{}", name), *value);
        }

        self.msg = format!("Evaluate: {}", format_losses(&losses));
        tracing::info!("{}", self.msg);
        Ok(())
    }
}
