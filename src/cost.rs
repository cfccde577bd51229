//! Adaptive cost controller.
//!
//! Cost follows `round(c0 - a·(1 - e^(b·t)), 2)` over the global trial
//! counter `t`. With positive `b` the curve rises with `t`; the controller
//! only ever pushes a higher value to the engine.

use crate::engine::Engine;
use crate::error::TaskResult;
use crate::logging;
use crate::params::ParameterSet;

/// Engine production parameter carrying the per-rule action time.
pub const COST_PARAM: &str = ":at";

/// Two decimals, ties to even.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round_ties_even() / 100.0
}

pub fn cost_at(init_cost: f64, a: f64, b: f64, global_trial: u64) -> f64 {
    round2(init_cost - a * (1.0 - (b * global_trial as f64).exp()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostController {
    pub init_cost: f64,
    pub a: f64,
    pub b: f64,
    pub enabled: bool,
    current: f64,
}

impl CostController {
    /// Starts at the cost for `global_trial`, the counter carried into this
    /// session.
    pub fn new(params: &ParameterSet, global_trial: u64) -> Self {
        let (init_cost, a, b) = (params.init_cost(), params.cost_a(), params.cost_b());
        Self {
            init_cost,
            a,
            b,
            enabled: params.update_cost(),
            current: cost_at(init_cost, a, b, global_trial),
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// Pushes the starting cost when the carried-in counter already put it
    /// above `c0`, which setup wrote as `:dat`.
    pub fn sync<E: Engine + ?Sized>(&self, engine: &mut E) -> TaskResult<()> {
        if self.enabled && self.current > round2(self.init_cost) {
            engine.set_production_parameter(None, COST_PARAM, self.current)?;
        }
        Ok(())
    }

    /// Recomputes the cost for `global_trial` and writes it to every
    /// production when enabled and strictly higher. Returns the new value
    /// when one was written.
    pub fn update<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        global_trial: u64,
    ) -> TaskResult<Option<f64>> {
        if !self.enabled {
            return Ok(None);
        }
        let next = cost_at(self.init_cost, self.a, self.b, global_trial);
        if next <= self.current {
            return Ok(None);
        }
        engine.set_production_parameter(None, COST_PARAM, next)?;
        logging::log_cost_update(global_trial, self.current, next);
        self.current = next;
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedEngine;
    use crate::params::{ParamName, ParamValue};

    fn params(update: bool) -> ParameterSet {
        ParameterSet::task_defaults()
            .with_overrides(&[(ParamName::UpdateCost, ParamValue::Flag(update))])
            .unwrap()
    }

    #[test]
    fn test_curve_values() {
        assert_eq!(cost_at(0.05, 0.005, 0.005, 0), 0.05);
        // 0.05 + 0.005·(e^0.5 − 1) ≈ 0.0532
        assert_eq!(cost_at(0.05, 0.005, 0.005, 100), 0.05);
        // e^2.5 − 1 ≈ 11.18 -> 0.1059
        assert_eq!(cost_at(0.05, 0.005, 0.005, 500), 0.11);
    }

    #[test]
    fn test_round2_ties_to_even() {
        assert_eq!(round2(0.125), 0.12);
        assert_eq!(round2(0.375), 0.38);
        assert_eq!(round2(0.0532), 0.05);
    }

    #[test]
    fn test_disabled_never_writes() {
        let mut engine = ScriptedEngine::loaded();
        let mut cost = CostController::new(&params(false), 0);
        for t in 0..1000 {
            assert_eq!(cost.update(&mut engine, t).unwrap(), None);
        }
        assert_eq!(cost.current(), 0.05);
    }

    #[test]
    fn test_ratchet_is_monotonic() {
        let mut engine = ScriptedEngine::loaded();
        let mut cost = CostController::new(&params(true), 0);
        let mut last = cost.current();
        let mut writes = 0;
        for t in 1..=600 {
            if let Some(v) = cost.update(&mut engine, t).unwrap() {
                assert!(v > last);
                last = v;
                writes += 1;
            }
        }
        assert!(writes > 0);
        assert_eq!(
            engine.production_parameter("PROCESS-SHAPE", COST_PARAM).unwrap(),
            cost.current()
        );
    }

    #[test]
    fn test_sync_pushes_carried_cost() {
        let mut engine = ScriptedEngine::loaded();
        let cost = CostController::new(&params(true), 500);
        cost.sync(&mut engine).unwrap();
        assert_eq!(engine.production_parameter("RESPOND", COST_PARAM).unwrap(), 0.11);

        let mut engine = ScriptedEngine::loaded();
        CostController::new(&params(false), 500).sync(&mut engine).unwrap();
        assert_eq!(engine.production_parameter("RESPOND", COST_PARAM).unwrap(), 0.05);
    }

    #[test]
    fn test_negative_slope_never_lowers() {
        let mut engine = ScriptedEngine::loaded();
        let set = params(true)
            .with_overrides(&[(ParamName::CostB, ParamValue::Num(-0.01))])
            .unwrap();
        let mut cost = CostController::new(&set, 0);
        for t in 1..200 {
            assert_eq!(cost.update(&mut engine, t).unwrap(), None);
        }
        assert_eq!(cost.current(), 0.05);
    }

    #[test]
    fn test_starts_from_carried_counter() {
        let cost = CostController::new(&params(true), 500);
        assert_eq!(cost.current(), 0.11);
    }
}
