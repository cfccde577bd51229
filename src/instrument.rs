//! Event instrumentation: turns engine rule firings and reward deliveries
//! into per-trial check bookkeeping and session-level traces.
//!
//! Every record carries the trial index that was current when the engine
//! delivered it. A record whose index is not the current trial is dropped
//! and counted; it never reaches a finalized trial or the session traces.

use serde::{Deserialize, Serialize};

use crate::error::{stale_event, TaskResult};
use crate::logging;
use crate::trial::{ExpectedReward, Trial};

/// Rule and chunk names the instrumentation reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Competing stimulus-processing rules; traced and snapshotted.
    pub process: Vec<String>,
    pub respond: String,
    pub retrieve: String,
    /// Firings that count as one verification.
    pub checks: Vec<String>,
    /// Check / don't-check branch; first reward per trial recorded.
    pub check_branch: Vec<String>,
    /// Memory items whose retrieval activation is snapshotted.
    pub memory_items: Vec<String>,
    /// Duplicates in the model files, disabled after every load.
    pub disabled: Vec<String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            process: names(&[
                "PROCESS-SHAPE",
                "PROCESS-LOCATION",
                "DONT-PROCESS-SHAPE",
                "DONT-PROCESS-LOCATION",
            ]),
            respond: "RESPOND".to_string(),
            retrieve: "RETRIEVE-INTENDED-RESPONSE-M3".to_string(),
            checks: names(&["CHECK-PASS-M3", "CHECK-DETECT-PROBLEM-UNLIMITED"]),
            check_branch: names(&["CHECK-PASS-M3", "DONT-CHECK"]),
            memory_items: names(&["CIRCLE-LEFT", "SQUARE-RIGHT"]),
            disabled: names(&["CHECK-PASS", "RETRIEVE-INTENDED-RESPONSE"]),
        }
    }
}

impl RuleSet {
    pub fn is_process(&self, rule: &str) -> bool {
        self.process.iter().any(|r| r == rule)
    }

    pub fn is_check(&self, rule: &str) -> bool {
        self.checks.iter().any(|r| r == rule)
    }

    pub fn is_check_branch(&self, rule: &str) -> bool {
        self.check_branch.iter().any(|r| r == rule)
    }
}

/// `PROCESS-SHAPE` -> `process_shape`
pub fn column_suffix(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    RuleFired { rule: String },
    RewardDelivered { rule: String, amount: f64, elapsed: f64 },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RuleFired { .. } => "rule_fired",
            EventKind::RewardDelivered { .. } => "reward_delivered",
        }
    }

    pub fn rule(&self) -> &str {
        match self {
            EventKind::RuleFired { rule } | EventKind::RewardDelivered { rule, .. } => rule,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub trial_index: usize,
    pub time: f64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRecord {
    pub trial: usize,
    pub time: f64,
    pub rule: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub trial: usize,
    pub time: f64,
    pub rule: String,
    pub delivered: f64,
    pub elapsed: f64,
    pub received: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Instrumentation {
    pub rules: RuleSet,
    pub productions: Vec<ProductionRecord>,
    pub rewards: Vec<RewardRecord>,
    pub stale_events: u64,
}

impl Instrumentation {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            productions: Vec::new(),
            rewards: Vec::new(),
            stale_events: 0,
        }
    }

    /// Attributes `record` to `current`. Fails with a stale-event error,
    /// leaving all state but the stale counter untouched, when the record
    /// belongs to any other trial.
    pub fn apply(&mut self, record: &EventRecord, current: Option<&mut Trial>) -> TaskResult<()> {
        let trial = match current {
            Some(trial) if trial.index == record.trial_index => trial,
            other => {
                self.stale_events += 1;
                let current_index = other.map(|t| t.index).unwrap_or(usize::MAX);
                logging::log_stale_event(
                    record.trial_index,
                    current_index,
                    record.kind.as_str(),
                    record.kind.rule(),
                );
                return Err(stale_event(format!(
                    "{} for trial {} arrived during trial {}",
                    record.kind.as_str(),
                    record.trial_index,
                    current_index
                )));
            }
        };

        match &record.kind {
            EventKind::RuleFired { rule } => self.on_rule(trial, rule, record.time),
            EventKind::RewardDelivered {
                rule,
                amount,
                elapsed,
            } => self.on_reward(trial, rule, *amount, *elapsed, record.time),
        }
        Ok(())
    }

    fn on_rule(&mut self, trial: &mut Trial, rule: &str, time: f64) {
        if self.rules.is_process(rule) {
            self.productions.push(ProductionRecord {
                trial: trial.index,
                time,
                rule: rule.to_string(),
            });
        }

        if rule == self.rules.respond {
            trial.responded = true;
        } else if trial.responded {
            // nothing after the response counts as verification
        } else if rule == self.rules.retrieve {
            if trial.check_count == 0 {
                trial.check_onset = time;
            } else if trial.detected_problem {
                trial.check_offset = time;
            }
        } else if self.rules.is_check(rule) {
            trial.check_count += 1;
            trial.check_offset = time;
            trial.detected_problem = true;
        }
    }

    fn on_reward(&mut self, trial: &mut Trial, rule: &str, amount: f64, elapsed: f64, time: f64) {
        let received = amount - elapsed;
        if self.rules.is_process(rule) {
            self.rewards.push(RewardRecord {
                trial: trial.index,
                time,
                rule: rule.to_string(),
                delivered: amount,
                elapsed,
                received,
            });
        }
        if self.rules.is_check_branch(rule) && trial.expected_reward.is_none() {
            trial.expected_reward = Some(ExpectedReward {
                rewarded_time: time,
                rule: rule.to_string(),
                delivered: amount,
                elapsed,
                received,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskErrorKind;
    use crate::stimulus::{Location, Shape, StimulusSpec};

    fn trial(index: usize) -> Trial {
        Trial::new(
            index,
            StimulusSpec::new(Shape::Square, Location::Left, Location::Right),
        )
    }

    fn fired(trial_index: usize, rule: &str, time: f64) -> EventRecord {
        EventRecord {
            trial_index,
            time,
            kind: EventKind::RuleFired { rule: rule.into() },
        }
    }

    fn reward(trial_index: usize, rule: &str, amount: f64, elapsed: f64) -> EventRecord {
        EventRecord {
            trial_index,
            time: 1.0,
            kind: EventKind::RewardDelivered {
                rule: rule.into(),
                amount,
                elapsed,
            },
        }
    }

    #[test]
    fn test_check_bookkeeping() {
        let mut inst = Instrumentation::default();
        let mut t = trial(0);
        inst.apply(&fired(0, "RETRIEVE-INTENDED-RESPONSE-M3", 1.0), Some(&mut t)).unwrap();
        inst.apply(&fired(0, "CHECK-PASS-M3", 1.2), Some(&mut t)).unwrap();
        inst.apply(&fired(0, "CHECK-DETECT-PROBLEM-UNLIMITED", 1.3), Some(&mut t)).unwrap();
        inst.apply(&fired(0, "RETRIEVE-INTENDED-RESPONSE-M3", 1.5), Some(&mut t)).unwrap();
        inst.apply(&fired(0, "RESPOND", 1.6), Some(&mut t)).unwrap();
        inst.apply(&fired(0, "CHECK-PASS-M3", 1.8), Some(&mut t)).unwrap();

        assert_eq!(t.check_count, 2);
        assert!(t.responded);
        assert!((t.check_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_process_rules_traced() {
        let mut inst = Instrumentation::default();
        let mut t = trial(3);
        inst.apply(&fired(3, "PROCESS-SHAPE", 0.1), Some(&mut t)).unwrap();
        inst.apply(&fired(3, "ATTEND-CUE", 0.2), Some(&mut t)).unwrap();
        inst.apply(&reward(3, "PROCESS-SHAPE", 1.0, 0.25), Some(&mut t)).unwrap();

        assert_eq!(inst.productions.len(), 1);
        assert_eq!(inst.productions[0].trial, 3);
        assert_eq!(inst.rewards.len(), 1);
        assert!((inst.rewards[0].received - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_first_check_branch_reward_kept() {
        let mut inst = Instrumentation::default();
        let mut t = trial(0);
        inst.apply(&reward(0, "DONT-CHECK", 2.0, 0.5), Some(&mut t)).unwrap();
        inst.apply(&reward(0, "CHECK-PASS-M3", 3.0, 0.5), Some(&mut t)).unwrap();
        let expected = t.expected_reward.unwrap();
        assert_eq!(expected.rule, "DONT-CHECK");
        assert_eq!(expected.received, 1.5);
        assert!(inst.rewards.is_empty());
    }

    #[test]
    fn test_stale_record_dropped() {
        let mut inst = Instrumentation::default();
        let mut t = trial(4);
        let err = inst
            .apply(&fired(3, "CHECK-PASS-M3", 0.1), Some(&mut t))
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::StaleEvent);
        assert_eq!(inst.stale_events, 1);
        assert_eq!(t.check_count, 0);

        let err = inst.apply(&fired(4, "PROCESS-SHAPE", 0.1), None).unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::StaleEvent);
        assert!(inst.productions.is_empty());
        assert_eq!(inst.stale_events, 2);
    }

    #[test]
    fn test_column_suffix() {
        assert_eq!(column_suffix("DONT-PROCESS-LOCATION"), "dont_process_location");
    }
}
