//! Multi-session orchestration and parameter sweeps.
//!
//! A simulation is `epochs × sessions` sessions of one configuration against
//! one engine. The model is reloaded at the first session of every epoch,
//! which also resets the global trial counter; later sessions of the epoch
//! continue both the engine's learned state and the counter.
//!
//! A sweep runs the Cartesian product of parameter axes. Configurations
//! already present in the parameter log are skipped. Workers each own an
//! engine from the factory and send finished simulations back over a
//! channel; only the calling thread touches the log and the output files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use serde_json::json;

use crate::aggregate::{combine_sessions, run_stats, summary_table, trace_table, RunStats, Table};
use crate::engine::{Engine, EngineFactory};
use crate::error::{malformed_parameter, TaskError, TaskResult};
use crate::export::append_csv;
use crate::logging::{self, obj, v_str, Domain, Level};
use crate::params::{parse_axis, sweep_key, ParamName, ParamValue};
use crate::storage::{ParamLog, ParamRecord};
use crate::task::{prepare_engine, TaskController, TaskOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Run only; nothing is written.
    None,
    /// Summary and trace CSVs plus the parameter log.
    Full,
    /// Parameter log and per-condition statistics only.
    SummaryOnly,
}

impl FromStr for OutputMode {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(OutputMode::None),
            "full" => Ok(OutputMode::Full),
            "summary" | "summary_only" | "summary_stat" => Ok(OutputMode::SummaryOnly),
            other => Err(malformed_parameter(format!("unknown output mode '{}'", other))),
        }
    }
}

/// Parameter change applied from a given 1-based session onward.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOverride {
    pub from_session: usize,
    pub name: ParamName,
    pub value: ParamValue,
}

impl FromStr for SessionOverride {
    type Err = TaskError;

    /// `7:motivation=10`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session, assignment) = s
            .split_once(':')
            .ok_or_else(|| malformed_parameter(format!("expected session:name=value, got '{}'", s)))?;
        let from_session: usize = session
            .trim()
            .parse()
            .map_err(|_| malformed_parameter(format!("bad session number in '{}'", s)))?;
        let (name, value) = crate::params::parse_assignment(assignment)?;
        Ok(Self {
            from_session,
            name,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationPlan {
    pub model: String,
    pub model_dir: PathBuf,
    pub epochs: usize,
    pub sessions: usize,
    pub options: TaskOptions,
    pub schedule: Vec<SessionOverride>,
}

impl SimulationPlan {
    /// Swept values followed by scheduled overrides active in `session`;
    /// later entries win.
    pub fn overrides_for(
        &self,
        point: &[(ParamName, ParamValue)],
        session: usize,
    ) -> Vec<(ParamName, ParamValue)> {
        let mut out = point.to_vec();
        for o in self.schedule.iter().filter(|o| session >= o.from_session) {
            out.retain(|(name, _)| *name != o.name);
            out.push((o.name, o.value.clone()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    pub run_suffix: String,
    pub sweep_key: String,
    pub model: Table,
    pub trace: Table,
    pub params: Vec<ParamRecord>,
    /// `(epoch, session, stats)` per session.
    pub stats: Vec<(usize, usize, RunStats)>,
    pub incomplete_sessions: usize,
}

pub fn run_suffix(key: &str) -> String {
    format!("{}_{}", logging::ts_epoch_ms(), &logging::params_hash(key)[..8])
}

/// Runs every session of one configuration on `engine`.
pub fn run_simulation<E: Engine + ?Sized>(
    engine: &mut E,
    plan: &SimulationPlan,
    point: &[(ParamName, ParamValue)],
) -> TaskResult<SimulationResult> {
    let key = sweep_key(point);
    let suffix = run_suffix(&key);
    let mut models = Vec::new();
    let mut traces = Vec::new();
    let mut records = Vec::new();
    let mut stats = Vec::new();
    let mut incomplete_sessions = 0;
    let mut counter = 0u64;

    for epoch in 1..=plan.epochs {
        for session in 1..=plan.sessions {
            let reload = session == 1;
            if reload {
                counter = 0;
            }
            let overrides = plan.overrides_for(point, session);
            let params = prepare_engine(
                &mut *engine,
                &plan.model_dir,
                &plan.model,
                reload,
                &overrides,
                &plan.options.rules,
            )?;
            let controller =
                TaskController::new(&mut *engine, params.clone(), counter, plan.options.clone())?;
            let record = controller.run()?;
            counter = record.global_trial;

            let session_stats = run_stats(&record.log);
            let accuracy = if record.log.is_empty() {
                None
            } else {
                let correct = record.log.iter().filter(|t| t.accuracy()).count();
                Some(correct as f64 / record.log.len() as f64)
            };
            logging::log_session_summary(
                epoch,
                session,
                record.planned,
                record.log.len(),
                record.stale_events,
                accuracy,
            );
            if !record.complete {
                incomplete_sessions += 1;
            }

            models.push((epoch, session, summary_table(&record)));
            traces.push((epoch, session, trace_table(&record)));
            stats.push((epoch, session, session_stats));
            records.push(ParamRecord {
                run_suffix: suffix.clone(),
                sweep_key: key.clone(),
                epoch,
                session,
                params: params.to_record(),
                planned: record.planned,
                completed: record.log.len(),
                stale_events: record.stale_events,
            });
        }
    }

    Ok(SimulationResult {
        run_suffix: suffix,
        sweep_key: key,
        model: combine_sessions(models)?,
        trace: combine_sessions(traces)?,
        params: records,
        stats,
        incomplete_sessions,
    })
}

/// Writes one finished simulation according to `mode`. The parameter log
/// commits before any CSV is written.
pub fn persist(
    result: &SimulationResult,
    store: &mut ParamLog,
    out_dir: &Path,
    mode: OutputMode,
) -> TaskResult<()> {
    if mode == OutputMode::None {
        return Ok(());
    }
    let _profile = logging::ProfileScope::new("persist");
    store.record_run(&result.run_suffix, &result.sweep_key, &result.params, &result.stats)?;
    if mode == OutputMode::Full {
        append_csv(
            &out_dir.join(format!("model_output_{}.csv", result.run_suffix)),
            &result.model,
        )?;
        append_csv(
            &out_dir.join(format!("trace_output_{}.csv", result.run_suffix)),
            &result.trace,
        )?;
    }
    logging::log(
        Level::Info,
        Domain::Storage,
        "simulation_persisted",
        obj(&[
            ("run_suffix", v_str(&result.run_suffix)),
            ("config", v_str(&result.sweep_key)),
            ("rows", json!(result.model.len())),
        ]),
    );
    Ok(())
}

// =============================================================================
// Grid
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGrid {
    pub axes: Vec<(ParamName, Vec<ParamValue>)>,
}

impl ParamGrid {
    pub fn new(axes: Vec<(ParamName, Vec<ParamValue>)>) -> Self {
        Self { axes }
    }

    /// Motivation 0.5..10, initial cost 0.01..0.10, fixed cost, and three
    /// cue validities.
    pub fn default_grid() -> Self {
        let motivation = (1..=20).map(|i| ParamValue::Num(i as f64 * 0.5)).collect();
        let init_cost = (1..=10).map(|i| ParamValue::Num(i as f64 / 100.0)).collect();
        Self::new(vec![
            (ParamName::Motivation, motivation),
            (ParamName::InitCost, init_cost),
            (ParamName::UpdateCost, vec![ParamValue::Flag(false)]),
            (
                ParamName::ValidCuePercentage,
                vec![ParamValue::Num(0.0), ParamValue::Num(0.5), ParamValue::Num(1.0)],
            ),
        ])
    }

    /// `name=v1,v2,...` per axis.
    pub fn parse(args: &[String]) -> TaskResult<Self> {
        let axes = args
            .iter()
            .map(|a| parse_axis(a))
            .collect::<TaskResult<Vec<_>>>()?;
        Ok(Self::new(axes))
    }

    pub fn len(&self) -> usize {
        if self.axes.is_empty() {
            return 0;
        }
        self.axes.iter().map(|(_, v)| v.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cartesian product; the first axis varies slowest.
    pub fn points(&self) -> Vec<Vec<(ParamName, ParamValue)>> {
        if self.axes.is_empty() {
            return Vec::new();
        }
        let mut points: Vec<Vec<(ParamName, ParamValue)>> = vec![Vec::new()];
        for (name, values) in &self.axes {
            points = points
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |v| {
                        let mut p = prefix.clone();
                        p.push((*name, v.clone()));
                        p
                    })
                })
                .collect();
        }
        points
    }
}

// =============================================================================
// Sweep
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub planned: usize,
    pub skipped: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "planned={} completed={} skipped={} failed={}",
            self.planned,
            self.completed.len(),
            self.skipped.len(),
            self.failed.len()
        )
    }
}

type Outcome = (String, TaskResult<SimulationResult>);

/// Runs every grid point not yet in `store`. A failing configuration is
/// logged and reported without stopping the rest; a persistence failure
/// stops further writes and is returned once all workers are done.
pub fn run_sweep<F: EngineFactory>(
    factory: &F,
    plan: &SimulationPlan,
    grid: &ParamGrid,
    store: &mut ParamLog,
    out_dir: &Path,
    mode: OutputMode,
    threads: usize,
) -> TaskResult<SweepReport> {
    let mut report = SweepReport {
        planned: grid.len(),
        ..SweepReport::default()
    };

    let mut pending = Vec::new();
    for point in grid.points() {
        let key = sweep_key(&point);
        if store.contains(&key)? {
            logging::log(
                Level::Debug,
                Domain::Sweep,
                "config_skipped",
                obj(&[("config", v_str(&key))]),
            );
            report.skipped.push(key);
        } else {
            pending.push(point);
        }
    }

    let workers = threads.max(1).min(pending.len().max(1));
    logging::log(
        Level::Info,
        Domain::Sweep,
        "sweep_start",
        obj(&[
            ("planned", json!(report.planned)),
            ("pending", json!(pending.len())),
            ("skipped", json!(report.skipped.len())),
            ("workers", json!(workers)),
        ]),
    );

    let next = AtomicUsize::new(0);
    let mut persist_error: Option<TaskError> = None;

    std::thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<Outcome>();
        for _ in 0..workers {
            let tx = tx.clone();
            let (next, pending) = (&next, &pending);
            scope.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                let Some(point) = pending.get(i) else { break };
                let key = sweep_key(point);
                let outcome = factory
                    .create()
                    .and_then(|mut engine| run_simulation(&mut engine, plan, point));
                if tx.send((key, outcome)).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        for (key, outcome) in rx {
            match outcome {
                Ok(result) => {
                    if persist_error.is_none() {
                        if let Err(err) = persist(&result, store, out_dir, mode) {
                            logging::log_config_failure(&key, &err.to_string());
                            persist_error = Some(err);
                        }
                    }
                    report.completed.push(key);
                }
                Err(err) => {
                    logging::log_config_failure(&key, &err.to_string());
                    report.failed.push((key, err.to_string()));
                }
            }
        }
    });

    if let Some(err) = persist_error {
        return Err(err);
    }
    logging::log(
        Level::Info,
        Domain::Sweep,
        "sweep_done",
        obj(&[("report", v_str(&report.to_string()))]),
    );
    Ok(report)
}
