use std::path::PathBuf;

use crate::engine::scripted::ResponsePolicy;
use crate::error::TaskResult;
use crate::instrument::RuleSet;
use crate::params::{parse_assignment, ParamName, ParamValue};
use crate::sweep::{OutputMode, SessionOverride, SimulationPlan};
use crate::task::TaskOptions;

#[derive(Clone, Debug)]
pub struct Config {
    pub model: String,
    pub model_dir: PathBuf,
    /// Engine seconds per tick.
    pub tick: f64,
    pub max_stall_ticks: u32,
    pub epochs: usize,
    pub sessions: usize,
    pub output: OutputMode,
    pub out_dir: PathBuf,
    pub sqlite_path: String,
    pub threads: usize,
    /// `name=value` pairs separated by `;`.
    pub params: String,
    /// `session:name=value` entries separated by `;`.
    pub schedule: String,
    pub response_time: f64,
    pub checks: u32,
    pub error_every: usize,
    pub omit_every: usize,
    pub reward: f64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            model: std::env::var("MODEL").unwrap_or_else(|_| "simon-motivation-model3".to_string()),
            model_dir: std::env::var("MODEL_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("models")),
            tick: std::env::var("TICK_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(200.0),
            max_stall_ticks: std::env::var("MAX_STALL_TICKS").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            epochs: std::env::var("EPOCHS").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            sessions: std::env::var("SESSIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            output: std::env::var("OUTPUT_MODE").ok().and_then(|v| v.parse().ok()).unwrap_or(OutputMode::Full),
            out_dir: std::env::var("OUT_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("data")),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "data/param_log.sqlite".to_string()),
            threads: std::env::var("THREADS").ok().and_then(|v| v.parse().ok()).unwrap_or_else(num_cpus::get),
            params: std::env::var("PARAMS").unwrap_or_default(),
            schedule: std::env::var("SCHEDULE").unwrap_or_default(),
            response_time: std::env::var("RESPONSE_TIME").ok().and_then(|v| v.parse().ok()).unwrap_or(0.45),
            checks: std::env::var("CHECKS").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            error_every: std::env::var("ERROR_EVERY").ok().and_then(|v| v.parse().ok()).unwrap_or(0),
            omit_every: std::env::var("OMIT_EVERY").ok().and_then(|v| v.parse().ok()).unwrap_or(0),
            reward: std::env::var("REWARD").ok().and_then(|v| v.parse().ok()).unwrap_or(1.0),
        }
    }

    pub fn overrides(&self) -> TaskResult<Vec<(ParamName, ParamValue)>> {
        split_entries(&self.params).map(parse_assignment).collect()
    }

    pub fn session_schedule(&self) -> TaskResult<Vec<SessionOverride>> {
        split_entries(&self.schedule).map(|e| e.parse()).collect()
    }

    pub fn policy(&self) -> ResponsePolicy {
        ResponsePolicy {
            response_time: self.response_time,
            checks: self.checks,
            error_every: self.error_every,
            omit_every: self.omit_every,
            reward: self.reward,
            stall_after: None,
        }
    }

    pub fn task_options(&self) -> TaskOptions {
        TaskOptions {
            tick: self.tick,
            max_stall_ticks: self.max_stall_ticks,
            rules: RuleSet::default(),
        }
    }

    pub fn plan(&self) -> TaskResult<SimulationPlan> {
        Ok(SimulationPlan {
            model: self.model.clone(),
            model_dir: self.model_dir.clone(),
            epochs: self.epochs.max(1),
            sessions: self.sessions.max(1),
            options: self.task_options(),
            schedule: self.session_schedule()?,
        })
    }
}

fn split_entries(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|e| !e.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            model: "m".into(),
            model_dir: PathBuf::from("models"),
            tick: 200.0,
            max_stall_ticks: 3,
            epochs: 0,
            sessions: 2,
            output: OutputMode::None,
            out_dir: PathBuf::from("data"),
            sqlite_path: ":memory:".into(),
            threads: 1,
            params: "motivation=2; init_cost=0.03".into(),
            schedule: "7:motivation=10".into(),
            response_time: 0.45,
            checks: 1,
            error_every: 0,
            omit_every: 0,
            reward: 1.0,
        }
    }

    #[test]
    fn test_overrides_parse() {
        let overrides = config().overrides().unwrap();
        assert_eq!(
            overrides,
            vec![
                (ParamName::Motivation, ParamValue::Num(2.0)),
                (ParamName::InitCost, ParamValue::Num(0.03)),
            ]
        );
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut cfg = config();
        cfg.params = "velocity=3".into();
        assert!(cfg.overrides().is_err());
    }

    #[test]
    fn test_plan_clamps_counts() {
        let plan = config().plan().unwrap();
        assert_eq!(plan.epochs, 1);
        assert_eq!(plan.sessions, 2);
        assert_eq!(plan.schedule.len(), 1);
        assert_eq!(plan.schedule[0].from_session, 7);
    }
}
