//! Scalar metric reporting.
//!
//! Training code calls [`report`] wherever a metric is produced. The values
//! land in whichever [`Observation`] is installed by the innermost
//! [`scope`] on the current thread, so updaters and evaluators never need a
//! handle to the trainer that consumes their metrics.

use std::cell::RefCell;
use std::collections::BTreeMap;

/// Per-step mapping from metric name to scalar.
pub type Observation = BTreeMap<String, f32>;

thread_local! {
    static SCOPES: RefCell<Vec<Observation>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` with `observation` installed as the report target.
///
/// Values reported inside `f` are merged into `observation` when `f`
/// returns. Scopes nest; only the innermost one receives reports.
pub fn scope<R>(observation: &mut Observation, f: impl FnOnce() -> R) -> R {
    SCOPES.with(|s| s.borrow_mut().push(std::mem::take(observation)));
    let out = f();
    if let Some(collected) = SCOPES.with(|s| s.borrow_mut().pop()) {
        *observation = collected;
    }
    out
}

/// Record a scalar in the active observation. No-op outside a scope.
pub fn report(name: impl Into<String>, value: f32) {
    SCOPES.with(|s| {
        if let Some(top) = s.borrow_mut().last_mut() {
            top.insert(name.into(), value);
        }
    });
}

/// Running mean over a sequence of observations.
#[derive(Debug, Default, Clone)]
pub struct Summary {
    sums: BTreeMap<String, (f64, usize)>,
}

impl Summary {
    /// Create an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate every entry of `observation`.
    pub fn add(&mut self, observation: &Observation) {
        for (k, v) in observation {
            let entry = self.sums.entry(k.clone()).or_insert((0.0, 0));
            entry.0 += f64::from(*v);
            entry.1 += 1;
        }
    }

    /// Per-key mean of everything added so far.
    pub fn compute_mean(&self) -> Observation {
        self.sums
            .iter()
            .map(|(k, (sum, n))| (k.clone(), (*sum / (*n).max(1) as f64) as f32))
            .collect()
    }

    /// Whether nothing has been added yet.
    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

/// Render an observation as `key: value` pairs with six decimals.
pub fn format_observation(observation: &Observation) -> String {
    observation
        .iter()
        .map(|(k, v)| format!("{}: {:.6}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
