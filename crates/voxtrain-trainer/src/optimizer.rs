//! Adam with coupled L2 weight decay.
//!
//! The decay term is added to the gradient before the moment updates
//! (`g + weight_decay * θ`), as opposed to AdamW which decays the parameter
//! directly. Both voxtrain recipes train with this variant. The moment
//! updates themselves run in `mlx_rs::optimizers::Adam`.
//!
//! ```ignore
//! use voxtrain_trainer::AdamL2Builder;
//!
//! let mut optimizer = AdamL2Builder::new(1e-4).with_eps(1e-6).build();
//! optimizer.update(&mut model, grads)?;
//! ```

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::{
    array,
    error::{Exception, Result},
    optimizers::{Adam, Optimizer, State},
    utils::Updatable,
    Array,
};

/// Adam optimizer with L2 regularization folded into the gradient.
///
/// Moment updates are delegated to [`mlx_rs::optimizers::Adam`]. Bias
/// correction is applied by rescaling its learning rate and epsilon per
/// parameter step, since the framework optimizer updates uncorrected
/// moments.
#[derive(Debug)]
pub struct AdamL2 {
    inner: Adam,
    lr: f32,
    betas: (f32, f32),
    eps: f32,
    weight_decay: f32,
    /// Update count per parameter, for bias correction.
    steps: HashMap<Rc<str>, i32>,
}

impl AdamL2 {
    /// Create an optimizer with default betas and epsilon.
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        AdamL2Builder::new(lr).with_weight_decay(weight_decay).build()
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.lr
    }

    /// Set the learning rate used by subsequent updates.
    pub fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// Number of parameters with optimizer state.
    pub fn num_tracked(&self) -> usize {
        self.inner.state.len()
    }

    /// Flatten the optimizer state for persistence.
    ///
    /// Keys are `{param}.m`, `{param}.v` and `{param}.step`.
    pub fn state_dict(&self) -> HashMap<String, Array> {
        let mut out = HashMap::with_capacity(self.inner.state.len() * 3);
        for (key, (m, v)) in &self.inner.state {
            out.insert(format!("{}.m", key), m.clone());
            out.insert(format!("{}.v", key), v.clone());
            let step = self.steps.get(key).copied().unwrap_or(0);
            out.insert(format!("{}.step", key), Array::from_int(step));
        }
        out
    }

    /// Restore state produced by [`AdamL2::state_dict`].
    pub fn load_state_dict(&mut self, state: &HashMap<String, Array>) -> Result<()> {
        self.inner.state.clear();
        self.steps.clear();
        for (name, m) in state {
            let Some(param) = name.strip_suffix(".m") else {
                continue;
            };
            let v = state
                .get(&format!("{}.v", param))
                .ok_or_else(|| Exception::custom(format!("optimizer state for `{}` has no second moment", param)))?;
            let step = match state.get(&format!("{}.step", param)) {
                Some(s) => s.item::<i32>(),
                None => 0,
            };
            let key: Rc<str> = Rc::from(param);
            self.steps.insert(key.clone(), step);
            self.inner.state.insert(key, (m.clone(), v.clone()));
        }
        Ok(())
    }
}

impl Optimizer for AdamL2 {
    type State = State<(Array, Array)>;

    fn state(&self) -> &Self::State {
        &self.inner.state
    }

    fn state_mut(&mut self) -> &mut Self::State {
        &mut self.inner.state
    }

    fn update_single(
        &mut self,
        key: &Rc<str>,
        gradient: &Array,
        parameter: &mut Array,
    ) -> Result<()> {
        let (beta1, beta2) = self.betas;

        let grad = if self.weight_decay > 0.0 {
            gradient.add(&parameter.multiply(&array!(self.weight_decay))?)?
        } else {
            gradient.clone()
        };

        // lr * m̂ / (√v̂ + eps) == lr·√bc2/bc1 * m / (√v + eps·√bc2)
        let step = self.steps.get(key).copied().unwrap_or(0) + 1;
        let bias1 = 1.0 - beta1.powi(step);
        let bias2 = (1.0 - beta2.powi(step)).sqrt();
        self.inner.lr = array!(self.lr * bias2 / bias1);
        self.inner.eps = array!(self.eps * bias2);

        self.inner.update_single(key, &grad, parameter)?;
        self.steps.insert(key.clone(), step);
        Ok(())
    }
}

impl Updatable for AdamL2 {
    fn updatable_states_len(&self) -> usize {
        self.inner.updatable_states_len()
    }

    fn updatable_states(&self) -> impl IntoIterator<Item = &Array> {
        self.inner.updatable_states()
    }

    fn updatable_states_mut(&mut self) -> impl IntoIterator<Item = &mut Array> {
        self.inner.updatable_states_mut()
    }
}

/// Builder for [`AdamL2`].
#[derive(Debug, Clone)]
pub struct AdamL2Builder {
    lr: f32,
    betas: (f32, f32),
    eps: f32,
    weight_decay: f32,
}

impl AdamL2Builder {
    /// Create a new builder with the given learning rate.
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }

    /// Set the L2 coefficient.
    pub fn with_weight_decay(mut self, wd: f32) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Set the betas for momentum.
    pub fn with_betas(mut self, betas: (f32, f32)) -> Self {
        self.betas = betas;
        self
    }

    /// Set epsilon for numerical stability.
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Build the optimizer.
    pub fn build(self) -> AdamL2 {
        let mut inner = Adam::new(self.lr);
        inner.betas = (array!(self.betas.0), array!(self.betas.1));
        inner.eps = array!(self.eps);
        AdamL2 {
            inner,
            lr: self.lr,
            betas: self.betas,
            eps: self.eps,
            weight_decay: self.weight_decay,
            steps: HashMap::new(),
        }
    }
}
