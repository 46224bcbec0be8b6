//! When extensions fire.

use serde::{Deserialize, Serialize};

use crate::updater::UpdaterState;

/// Unit of an [`IntervalTrigger`] period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerUnit {
    /// Count optimization steps.
    Iteration,
    /// Count passes over the training set.
    Epoch,
}

/// Fires every `period` iterations or epochs.
#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    period: usize,
    unit: TriggerUnit,
    last_epoch: Option<usize>,
}

impl IntervalTrigger {
    /// Create a trigger. A zero period never fires.
    pub fn new(period: usize, unit: TriggerUnit) -> Self {
        Self {
            period,
            unit,
            last_epoch: None,
        }
    }

    /// Fire every `period` iterations.
    pub fn iterations(period: usize) -> Self {
        Self::new(period, TriggerUnit::Iteration)
    }

    /// Fire every `period` epochs.
    pub fn epochs(period: usize) -> Self {
        Self::new(period, TriggerUnit::Epoch)
    }

    /// Whether the trigger fires for `state`.
    ///
    /// Epoch triggers fire once, on the first step of a qualifying epoch.
    pub fn fire(&mut self, state: &UpdaterState) -> bool {
        if self.period == 0 {
            return false;
        }
        match self.unit {
            TriggerUnit::Iteration => state.iteration % self.period == 0,
            TriggerUnit::Epoch => {
                let changed = self.last_epoch != Some(state.epoch);
                self.last_epoch = Some(state.epoch);
                changed && state.epoch > 0 && state.epoch % self.period == 0
            }
        }
    }
}
