//! Adversarial training step for Parallel WaveGAN.
//!
//! Every step trains the generator on the multi-resolution STFT loss. Once
//! the iteration counter passes `discriminator_train_start_steps` the
//! generator also receives the weighted adversarial loss and the
//! discriminator is trained on the same batch.

use std::collections::HashMap;

use mlx_rs::{error::Exception, nn, optimizers::Optimizer, Array};
use voxtrain_core::{report, LrScheduler, SchedulerKind};
use voxtrain_data::VocoderBatch;
use voxtrain_trainer::{
    clip_grad_global_norm, load_module_state, module_state, AdamL2, AdamL2Builder, BatchSource,
    Checkpoint, CheckpointPayload, GradientSync, StandardUpdater, Updater, UpdaterState,
};

use crate::config::{OptimizerParams, PwgConfig, SchedulerParams};
use crate::discriminator::PwgDiscriminator;
use crate::error::VocoderError;
use crate::generator::PwgGenerator;
use crate::loss::{adversarial_loss, discriminator_loss, MultiResolutionStftLoss};

/// Parameter prefix of the generator in checkpoints.
pub const GENERATOR_PREFIX: &str = "generator";
/// Parameter prefix of the discriminator in checkpoints.
pub const DISCRIMINATOR_PREFIX: &str = "discriminator";
const GENERATOR_OPT_PREFIX: &str = "generator_optimizer.";
const DISCRIMINATOR_OPT_PREFIX: &str = "discriminator_optimizer.";

pub(crate) fn into_exception(err: VocoderError) -> Exception {
    match err {
        VocoderError::Mlx(e) => e,
        other => Exception::custom(other.to_string()),
    }
}

pub(crate) fn build_optimizer(opt: &OptimizerParams, sched: &SchedulerParams) -> AdamL2 {
    AdamL2Builder::new(sched.learning_rate as f32)
        .with_eps(opt.epsilon)
        .with_weight_decay(opt.weight_decay)
        .build()
}

pub(crate) fn build_scheduler(sched: &SchedulerParams) -> Box<dyn LrScheduler> {
    SchedulerKind::StepDecay {
        learning_rate: sched.learning_rate,
        step_size: sched.step_size,
        gamma: sched.gamma,
    }
    .build()
}

/// Render `k: v` pairs the way the training log shows them.
pub(crate) fn format_losses(losses: &[(&str, f32)]) -> String {
    losses
        .iter()
        .map(|(k, v)| format!("{}: {:.6}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Generator/discriminator alternation over a [`VocoderBatch`] source.
pub struct PwgUpdater<L> {
    inner: StandardUpdater<L>,
    generator: PwgGenerator,
    discriminator: PwgDiscriminator,
    optimizer_g: AdamL2,
    optimizer_d: AdamL2,
    scheduler_g: Box<dyn LrScheduler>,
    scheduler_d: Box<dyn LrScheduler>,
    criterion_stft: MultiResolutionStftLoss,
    grad_sync: GradientSync,
    discriminator_train_start_steps: usize,
    lambda_adv: f32,
    generator_grad_norm: f32,
    discriminator_grad_norm: f32,
    msg: String,
}

impl<L: BatchSource<Batch = VocoderBatch>> PwgUpdater<L> {
    /// Wire models, optimizers and schedulers from `config`.
    pub fn new(
        loader: L,
        generator: PwgGenerator,
        discriminator: PwgDiscriminator,
        config: &PwgConfig,
        grad_sync: GradientSync,
    ) -> crate::Result<Self> {
        Ok(Self {
            inner: StandardUpdater::new(loader),
            generator,
            discriminator,
            optimizer_g: build_optimizer(
                &config.generator_optimizer_params,
                &config.generator_scheduler_params,
            ),
            optimizer_d: build_optimizer(
                &config.discriminator_optimizer_params,
                &config.discriminator_scheduler_params,
            ),
            scheduler_g: build_scheduler(&config.generator_scheduler_params),
            scheduler_d: build_scheduler(&config.discriminator_scheduler_params),
            criterion_stft: MultiResolutionStftLoss::new(&config.stft_loss_params)?,
            grad_sync,
            discriminator_train_start_steps: config.discriminator_train_start_steps,
            lambda_adv: config.lambda_adv,
            generator_grad_norm: config.generator_grad_norm,
            discriminator_grad_norm: config.discriminator_grad_norm,
            msg: String::new(),
        })
    }

    /// The generator.
    pub fn generator(&self) -> &PwgGenerator {
        &self.generator
    }

    /// The generator, mutably.
    pub fn generator_mut(&mut self) -> &mut PwgGenerator {
        &mut self.generator
    }

    /// The discriminator.
    pub fn discriminator(&self) -> &PwgDiscriminator {
        &self.discriminator
    }

    /// The STFT criterion.
    pub fn criterion_stft(&self) -> &MultiResolutionStftLoss {
        &self.criterion_stft
    }

    /// Current generator and discriminator learning rates.
    pub fn learning_rates(&self) -> (f32, f32) {
        (
            self.optimizer_g.learning_rate(),
            self.optimizer_d.learning_rate(),
        )
    }

    /// Whether the adversarial part runs at iteration `it`.
    pub fn adversarial_active(&self, it: usize) -> bool {
        it > self.discriminator_train_start_steps
    }

    fn generator_step(
        &mut self,
        noise: &Array,
        batch: &VocoderBatch,
        adversarial: bool,
    ) -> crate::Result<Vec<(&'static str, f32)>> {
        let criterion = &self.criterion_stft;
        let discriminator = &self.discriminator;
        let lambda_adv = Array::from_f32(self.lambda_adv);

        let loss_fn = |g: &mut PwgGenerator,
                       (noise, mel, wav): (&Array, &Array, &Array)|
         -> std::result::Result<Vec<Array>, Exception> {
            let wav_ = g.forward(noise, mel).map_err(into_exception)?;
            let (sc, mag) = criterion.forward(&wav_, wav).map_err(into_exception)?;
            let gen = sc.add(&mag)?;
            if adversarial {
                let p_ = discriminator.forward(&wav_).map_err(into_exception)?;
                let adv = adversarial_loss(&p_).map_err(into_exception)?;
                let gen = gen.add(&adv.multiply(&lambda_adv)?)?;
                Ok(vec![gen, sc, mag, adv])
            } else {
                Ok(vec![gen, sc, mag])
            }
        };

        let mut loss_and_grad = nn::value_and_grad(loss_fn);
        let (values, mut grads) =
            loss_and_grad(&mut self.generator, (noise, &batch.mel, &batch.wave))?;

        self.grad_sync.sync(&mut grads)?;
        clip_grad_global_norm(&mut grads, self.generator_grad_norm)?;
        self.optimizer_g.update(&mut self.generator, grads)?;
        self.scheduler_g.step();
        self.optimizer_g
            .set_learning_rate(self.scheduler_g.current_lr() as f32);

        let mut losses = vec![
            ("spectral_convergence_loss", values[1].item::<f32>()),
            ("log_stft_magnitude_loss", values[2].item::<f32>()),
        ];
        if let Some(adv) = values.get(3) {
            losses.push(("adversarial_loss", adv.item::<f32>()));
        }
        losses.push(("generator_loss", values[0].item::<f32>()));
        Ok(losses)
    }

    fn discriminator_step(
        &mut self,
        noise: &Array,
        batch: &VocoderBatch,
    ) -> crate::Result<Vec<(&'static str, f32)>> {
        let wav_ = mlx_rs::stop_gradient(&self.generator.forward(noise, &batch.mel)?)?;

        let loss_fn = |d: &mut PwgDiscriminator,
                       (wav, wav_): (&Array, &Array)|
         -> std::result::Result<Vec<Array>, Exception> {
            let p = d.forward(wav).map_err(into_exception)?;
            let p_ = d.forward(wav_).map_err(into_exception)?;
            let (real, fake) = discriminator_loss(&p, &p_).map_err(into_exception)?;
            Ok(vec![real.add(&fake)?, real, fake])
        };

        let mut loss_and_grad = nn::value_and_grad(loss_fn);
        let (values, mut grads) = loss_and_grad(&mut self.discriminator, (&batch.wave, &wav_))?;

        self.grad_sync.sync(&mut grads)?;
        clip_grad_global_norm(&mut grads, self.discriminator_grad_norm)?;
        self.optimizer_d.update(&mut self.discriminator, grads)?;
        self.scheduler_d.step();
        self.optimizer_d
            .set_learning_rate(self.scheduler_d.current_lr() as f32);

        Ok(vec![
            ("real_loss", values[1].item::<f32>()),
            ("fake_loss", values[2].item::<f32>()),
            ("discriminator_loss", values[0].item::<f32>()),
        ])
    }
}

impl<L: BatchSource<Batch = VocoderBatch>> Updater for PwgUpdater<L> {
    fn update(&mut self) -> voxtrain_trainer::Result<()> {
        let batch = self.inner.read_batch()?;
        let it = self.inner.state().iteration;
        let adversarial = self.adversarial_active(it);

        let noise = mlx_rs::random::normal::<f32>(batch.wave.shape(), None, None, None)?;

        let mut losses = self.generator_step(&noise, &batch, adversarial)?;
        if adversarial {
            losses.extend(self.discriminator_step(&noise, &batch)?);
        }

        for (name, value) in &losses {
            report(format!("train/{}", name), *value);
        }
        self.msg = format!(
            "Rank: {}, {}",
            self.grad_sync.context().rank(),
            format_losses(&losses)
        );

        self.inner.finish_step();
        Ok(())
    }

    fn state(&self) -> &UpdaterState {
        self.inner.state()
    }

    fn state_mut(&mut self) -> &mut UpdaterState {
        self.inner.state_mut()
    }

    fn msg(&self) -> &str {
        &self.msg
    }

    fn reader_secs(&self) -> f64 {
        self.inner.reader_secs()
    }

    fn learning_rate(&self) -> Option<f64> {
        Some(f64::from(self.optimizer_g.learning_rate()))
    }

    fn checkpoint_payload(&self) -> voxtrain_trainer::Result<CheckpointPayload> {
        let mut params = module_state(&self.generator, Some(GENERATOR_PREFIX));
        params.extend(module_state(&self.discriminator, Some(DISCRIMINATOR_PREFIX)));

        let mut optimizer = HashMap::new();
        for (k, v) in self.optimizer_g.state_dict() {
            optimizer.insert(format!("{}{}", GENERATOR_OPT_PREFIX, k), v);
        }
        for (k, v) in self.optimizer_d.state_dict() {
            optimizer.insert(format!("{}{}", DISCRIMINATOR_OPT_PREFIX, k), v);
        }
        Ok(CheckpointPayload { params, optimizer })
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> voxtrain_trainer::Result<()> {
        load_module_state(&mut self.generator, &checkpoint.params, Some(GENERATOR_PREFIX))?;
        load_module_state(
            &mut self.discriminator,
            &checkpoint.params,
            Some(DISCRIMINATOR_PREFIX),
        )?;

        let split = |prefix: &str| -> HashMap<String, Array> {
            checkpoint
                .optimizer
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(prefix).map(|s| (s.to_string(), v.clone())))
                .collect()
        };
        self.optimizer_g.load_state_dict(&split(GENERATOR_OPT_PREFIX))?;
        self.optimizer_d
            .load_state_dict(&split(DISCRIMINATOR_OPT_PREFIX))?;

        let state = UpdaterState {
            iteration: checkpoint.infos.step,
            epoch: checkpoint.infos.epoch,
        };
        self.inner.set_state(state);

        // Both schedulers step once per trained step.
        self.scheduler_g.set_step(state.iteration);
        self.scheduler_d.set_step(
            state
                .iteration
                .saturating_sub(self.discriminator_train_start_steps + 1),
        );
        self.optimizer_g
            .set_learning_rate(self.scheduler_g.current_lr() as f32);
        self.optimizer_d
            .set_learning_rate(self.scheduler_d.current_lr() as f32);
        Ok(())
    }
}
