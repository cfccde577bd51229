//! End-to-end sessions against the scripted engine.
//!
//! Each test prepares a freshly loaded engine the way the binaries do and
//! drives a full session through the controller.

use std::path::Path;

use simonfx::aggregate::{run_stats, summary_table, trace_table};
use simonfx::engine::scripted::{ResponsePolicy, ScriptedEngine};
use simonfx::engine::Engine;
use simonfx::error::TaskErrorKind;
use simonfx::instrument::{EventKind, EventRecord, RuleSet};
use simonfx::params::{ParamName, ParamValue, ParameterSet};
use simonfx::stimulus::Condition;
use simonfx::task::{prepare_engine, SessionRecord, TaskController, TaskOptions};
use simonfx::trial::Phase;

const MODEL: &str = "simon-motivation-model3";

fn prepared(
    policy: ResponsePolicy,
    overrides: &[(ParamName, ParamValue)],
) -> (ScriptedEngine, ParameterSet) {
    let mut engine = ScriptedEngine::new(policy);
    let params = prepare_engine(
        &mut engine,
        Path::new("models"),
        MODEL,
        true,
        overrides,
        &RuleSet::default(),
    )
    .unwrap();
    (engine, params)
}

fn run_session(policy: ResponsePolicy, overrides: &[(ParamName, ParamValue)]) -> SessionRecord {
    let (mut engine, params) = prepared(policy, overrides);
    TaskController::new(&mut engine, params, 0, TaskOptions::default())
        .unwrap()
        .run()
        .unwrap()
}

fn n_trials(n: usize) -> (ParamName, ParamValue) {
    (ParamName::NTrials, ParamValue::Num(n as f64))
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[test]
fn test_all_valid_cues_fill_valid_buckets() {
    let record = run_session(
        ResponsePolicy::default(),
        &[
            n_trials(8),
            (ParamName::ValidCuePercentage, ParamValue::Num(1.0)),
            (ParamName::StimulusSeed, ParamValue::Num(100.0)),
        ],
    );
    assert!(record.complete);
    assert_eq!(record.planned, 8);
    assert_eq!(record.log.len(), 8);
    assert_eq!(record.global_trial, 8);

    let stats = run_stats(&record.log);
    let valid = stats.get(Condition::CongruentValid).unwrap().trials
        + stats.get(Condition::IncongruentValid).unwrap().trials;
    assert_eq!(valid, 8);
    for condition in [Condition::CongruentInvalid, Condition::IncongruentInvalid] {
        let c = stats.get(condition).unwrap();
        assert_eq!(c.trials, 0);
        assert_eq!(c.accuracy, None);
        assert_eq!(c.response_time, None);
    }
    assert_eq!(stats.get(Condition::CongruentValid).unwrap().accuracy, Some(1.0));
    assert!(stats.to_string().contains("NA"));
}

#[test]
fn test_trial_fields_within_bounds() {
    let record = run_session(ResponsePolicy::default(), &[n_trials(12)]);
    for (i, trial) in record.log.iter().enumerate() {
        assert_eq!(trial.index, i);
        assert!(trial.response.is_some());
        assert!(trial.response_time().unwrap() >= 0.0);
        assert!(trial.check_time() >= 0.0);
        assert!(trial.responded);
        assert_eq!(trial.check_count, 1);
        assert_eq!(
            trial.expected_reward.as_ref().map(|r| r.rule.as_str()),
            Some("CHECK-PASS-M3")
        );
        assert_eq!(trial.utility.len(), 4);
        assert_eq!(trial.activation.len(), 2);
    }

    let summary = summary_table(&record);
    assert_eq!(summary.len(), 12);
    for cell in summary.values("accuracy") {
        let v = cell.as_f64().unwrap();
        assert!(v == 0.0 || v == 1.0);
    }
    assert_eq!(summary.get(0, "pre_trial_accuracy").unwrap().to_string(), "NA");
}

#[test]
fn test_dont_check_branch() {
    let policy = ResponsePolicy {
        checks: 0,
        ..ResponsePolicy::default()
    };
    let record = run_session(policy, &[n_trials(4)]);
    for trial in &record.log {
        assert_eq!(trial.check_count, 0);
        assert_eq!(trial.check_time(), 0.0);
        assert_eq!(
            trial.expected_reward.as_ref().map(|r| r.rule.as_str()),
            Some("DONT-CHECK")
        );
    }
}

#[test]
fn test_errors_and_omissions_scored() {
    let policy = ResponsePolicy {
        error_every: 2,
        omit_every: 3,
        ..ResponsePolicy::default()
    };
    let record = run_session(policy, &[n_trials(6)]);
    // stimuli 2, 4, 6 answered wrong; 3 and 6 unanswered
    let accuracy: Vec<bool> = record.log.iter().map(|t| t.accuracy()).collect();
    assert_eq!(accuracy, vec![true, false, false, false, true, false]);
    assert_eq!(record.log[2].response, None);
    assert_eq!(record.log[2].response_time(), None);

    let summary = summary_table(&record);
    assert!(summary.get(2, "response_time").unwrap().is_null());
    assert_eq!(summary.get(3, "pre_trial_accuracy").unwrap().to_string(), "post-error");
    assert_eq!(summary.get(1, "pre_trial_accuracy").unwrap().to_string(), "post-correct");
}

#[test]
fn test_fixation_writes_motivation_goal() {
    let (mut engine, params) = prepared(
        ResponsePolicy::default(),
        &[n_trials(2), (ParamName::Motivation, ParamValue::Num(2.0))],
    );
    let mut controller =
        TaskController::new(&mut engine, params, 0, TaskOptions::default()).unwrap();
    assert_eq!(controller.step().unwrap(), Phase::Cue);

    let goal = |slot: &str| controller.engine().query_buffer_slot("goal", slot);
    assert_eq!(goal("motivation").as_deref(), Some("2"));
    assert_eq!(goal("time-onset").as_deref(), Some("0"));
    assert_eq!(goal("step").as_deref(), Some("ATTEND-CUE"));
}

#[test]
fn test_zero_motivation_writes_no_goal() {
    let (mut engine, params) = prepared(
        ResponsePolicy::default(),
        &[n_trials(2), (ParamName::Motivation, ParamValue::Num(0.0))],
    );
    let mut controller =
        TaskController::new(&mut engine, params, 0, TaskOptions::default()).unwrap();
    assert_eq!(controller.step().unwrap(), Phase::Cue);

    let goal = |slot: &str| controller.engine().query_buffer_slot("goal", slot);
    assert_eq!(goal("motivation"), None);
    assert_eq!(goal("time-onset"), None);
    assert_eq!(goal("step").as_deref(), Some("ATTEND-CUE"));

    let record = controller.run().unwrap();
    assert!(record.complete);
    assert_eq!(record.log.len(), 2);
}

// ---------------------------------------------------------------------------
// Cost controller
// ---------------------------------------------------------------------------

#[test]
fn test_fixed_cost_when_update_disabled() {
    let record = run_session(
        ResponsePolicy::default(),
        &[
            n_trials(20),
            (ParamName::UpdateCost, ParamValue::Flag(false)),
            (ParamName::CostB, ParamValue::Num(0.1)),
        ],
    );
    assert!(record.log.iter().all(|t| t.cost == Some(0.05)));
}

#[test]
fn test_adaptive_cost_never_decreases() {
    let record = run_session(
        ResponsePolicy::default(),
        &[
            n_trials(20),
            (ParamName::UpdateCost, ParamValue::Flag(true)),
            (ParamName::CostA, ParamValue::Num(0.01)),
            (ParamName::CostB, ParamValue::Num(0.1)),
        ],
    );
    let costs: Vec<f64> = record.log.iter().map(|t| t.cost.unwrap()).collect();
    assert_eq!(costs[0], 0.05);
    assert!(costs.windows(2).all(|w| w[1] >= w[0]));
    assert!(costs[19] > 0.05);
}

// ---------------------------------------------------------------------------
// Stale events and stalls
// ---------------------------------------------------------------------------

#[test]
fn test_stale_record_leaves_finalized_trial_untouched() {
    let (mut engine, params) = prepared(ResponsePolicy::default(), &[n_trials(8)]);
    let mut controller =
        TaskController::new(&mut engine, params, 0, TaskOptions::default()).unwrap();
    while controller.session().index() < 4 {
        controller.step().unwrap();
    }
    assert_eq!(controller.session().phase(), Phase::Fixation);

    let before = controller.session().log()[3].clone();
    let stale_before = controller.session().instrument().stale_events;

    let now = controller.engine().now();
    let err = controller
        .ingest(EventRecord {
            trial_index: 3,
            time: now,
            kind: EventKind::RuleFired {
                rule: "CHECK-PASS-M3".into(),
            },
        })
        .unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::StaleEvent);
    assert!(err.kind.is_recoverable());

    assert_eq!(controller.session().log()[3], before);
    assert_eq!(controller.session().instrument().stale_events, stale_before + 1);
    assert_eq!(controller.session().current().unwrap().check_count, 0);

    let record = controller.run().unwrap();
    assert!(record.complete);
    assert_eq!(record.log[3], before);
}

#[test]
fn test_stalled_engine_ends_session_incomplete() {
    let policy = ResponsePolicy {
        stall_after: Some(3),
        ..ResponsePolicy::default()
    };
    let record = run_session(policy, &[n_trials(8)]);
    assert!(!record.complete);
    assert_eq!(record.planned, 8);
    // the fourth stimulus is shown but never answered
    assert_eq!(record.log.len(), 4);
    assert_eq!(record.log[3].response, None);

    let stats = run_stats(&record.log);
    let total: usize = stats.conditions.iter().map(|c| c.trials).sum();
    assert_eq!(total, 4);
}

#[test]
fn test_empty_session() {
    let record = run_session(ResponsePolicy::default(), &[n_trials(0)]);
    assert!(record.complete);
    assert!(record.log.is_empty());
    assert_eq!(record.global_trial, 0);
    assert!(run_stats(&record.log)
        .conditions
        .iter()
        .all(|c| c.accuracy.is_none() && c.response_time.is_none()));
    assert!(summary_table(&record).is_empty());
    assert!(trace_table(&record).is_empty());
}

#[test]
fn test_commands_unregistered_after_run() {
    let (mut engine, params) = prepared(ResponsePolicy::default(), &[n_trials(2)]);
    TaskController::new(&mut engine, params, 0, TaskOptions::default())
        .unwrap()
        .run()
        .unwrap();
    assert!(!engine.has_command(simonfx::task::ACCEPT_RESPONSE));
    assert!(engine.is_disabled("CHECK-PASS"));
}

#[test]
fn test_unloaded_engine_rejected() {
    let mut engine = ScriptedEngine::new(ResponsePolicy::default());
    let err = TaskController::new(
        &mut engine,
        ParameterSet::task_defaults(),
        0,
        TaskOptions::default(),
    )
    .err()
    .unwrap();
    assert_eq!(err.kind, TaskErrorKind::EngineUnavailable);
}
