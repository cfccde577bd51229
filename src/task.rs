//! Trial state machine and the session controller.
//!
//! Each trial runs fixation -> cue -> stimulus. A phase only starts once the
//! engine's goal step shows the marker that phase expects; otherwise the
//! controller runs idle ticks and gives up after `max_stall_ticks`. All
//! engine events are delivered inside `Engine::run`, through a sink that
//! borrows the session, so there is no shared state across ticks.
//!
//! ```text
//!   Fixation ──tick──► Cue ──tick──► Stimulus ──tick──► finalize
//!      ▲                                                  │
//!      └──────────── next stimulus ◄──────────────────────┤
//!                                                         ▼
//!                                                        Done
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cost::{CostController, COST_PARAM};
use crate::engine::{
    CommandAction, DisplayItem, Engine, EngineEvent, EventSink, ScheduledCommand,
};
use crate::error::{engine_unavailable, incomplete_session, TaskError, TaskErrorKind, TaskResult};
use crate::instrument::{
    EventKind, EventRecord, Instrumentation, ProductionRecord, RewardRecord, RuleSet,
};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::params::{ParamName, ParamValue, ParameterSet};
use crate::stimulus::{generate_stimuli, StimulusSpec};
use crate::trial::{Phase, Trial};

pub const ACCEPT_RESPONSE: &str = "simon-accept-response";
pub const SET_MOTIVATION: &str = "simon-set-motivation";
pub const PRESENT_FIXATION: &str = "simon-present-fixation";
pub const PRESENT_CUE: &str = "simon-present-cue";
pub const PRESENT_STIMULUS: &str = "simon-present-stimulus";
pub const PRESENT_DONE: &str = "simon-present-done";

const COMMANDS: [&str; 6] = [
    ACCEPT_RESPONSE,
    SET_MOTIVATION,
    PRESENT_FIXATION,
    PRESENT_CUE,
    PRESENT_STIMULUS,
    PRESENT_DONE,
];

const KEY_MONITOR: &str = "output-key";
const DISPLAY_DELAY: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    /// Engine seconds per tick.
    pub tick: f64,
    /// Idle ticks tolerated while waiting for a phase marker.
    pub max_stall_ticks: u32,
    pub rules: RuleSet,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            tick: 200.0,
            max_stall_ticks: 3,
            rules: RuleSet::default(),
        }
    }
}

/// Core and base model files followed by the named model.
pub fn model_files(model_dir: &Path, model: &str) -> Vec<PathBuf> {
    vec![
        model_dir.join("simon-core.lisp"),
        model_dir.join("simon-base.lisp"),
        model_dir.join(format!("{}.lisp", model)),
    ]
}

/// Optionally reloads the model, disables duplicate productions, and writes
/// `overrides` to the engine. Returns the parameter set in effect.
pub fn prepare_engine<E: Engine + ?Sized>(
    engine: &mut E,
    model_dir: &Path,
    model: &str,
    reload: bool,
    overrides: &[(ParamName, ParamValue)],
    rules: &RuleSet,
) -> TaskResult<ParameterSet> {
    if reload {
        engine.reset()?;
        for file in model_files(model_dir, model) {
            engine.load_model(&file)?;
        }
    }
    if !engine.is_ready() {
        return Err(engine_unavailable(format!("model {} is not loaded", model)));
    }
    let disabled: Vec<&str> = rules.disabled.iter().map(String::as_str).collect();
    engine.disable_productions(&disabled)?;

    let mut params = ParameterSet::from_engine(&*engine)?.with_overrides(overrides)?;
    params.apply(engine, overrides)?;
    Ok(params)
}

/// Everything a finished session hands to aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub log: Vec<Trial>,
    pub productions: Vec<ProductionRecord>,
    pub rewards: Vec<RewardRecord>,
    pub rules: RuleSet,
    pub motivation: f64,
    pub planned: usize,
    pub stale_events: u64,
    /// Global trial counter after the last finalized trial.
    pub global_trial: u64,
    pub complete: bool,
}

#[derive(Debug)]
pub struct Session {
    stimuli: Vec<StimulusSpec>,
    params: ParameterSet,
    index: usize,
    phase: Phase,
    current: Option<Trial>,
    log: Vec<Trial>,
    instrument: Instrumentation,
    cost: CostController,
    global_trial: u64,
    stall_ticks: u32,
    complete: bool,
}

impl Session {
    fn new(
        stimuli: Vec<StimulusSpec>,
        params: ParameterSet,
        global_trial: u64,
        rules: RuleSet,
    ) -> Self {
        let cost = CostController::new(&params, global_trial);
        let (phase, current) = match stimuli.first() {
            Some(first) => (Phase::Fixation, Some(Trial::new(0, *first))),
            None => (Phase::Done, None),
        };
        Self {
            stimuli,
            params,
            index: 0,
            phase,
            current,
            log: Vec::new(),
            instrument: Instrumentation::new(rules),
            cost,
            global_trial,
            stall_ticks: 0,
            complete: true,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<&Trial> {
        self.current.as_ref()
    }

    pub fn log(&self) -> &[Trial] {
        &self.log
    }

    pub fn instrument(&self) -> &Instrumentation {
        &self.instrument
    }

    fn into_record(self) -> SessionRecord {
        SessionRecord {
            planned: self.stimuli.len(),
            motivation: self.params.motivation(),
            log: self.log,
            productions: self.instrument.productions,
            rewards: self.instrument.rewards,
            rules: self.instrument.rules,
            stale_events: self.instrument.stale_events,
            global_trial: self.global_trial,
            complete: self.complete,
        }
    }
}

/// Event sink borrowed by the engine for one tick.
struct TrialSink<'a> {
    index: usize,
    phase: Phase,
    current: Option<&'a mut Trial>,
    instrument: &'a mut Instrumentation,
}

impl TrialSink<'_> {
    fn record(&mut self, time: f64, kind: EventKind) {
        let record = EventRecord {
            trial_index: self.index,
            time,
            kind,
        };
        // stale records are counted and logged by the instrumentation
        let _ = self.instrument.apply(&record, self.current.as_deref_mut());
    }
}

impl EventSink for TrialSink<'_> {
    fn deliver(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::RuleFired { rule, time } => {
                self.record(time, EventKind::RuleFired { rule })
            }
            EngineEvent::RewardDelivered {
                rule,
                amount,
                elapsed,
                time,
            } => self.record(
                time,
                EventKind::RewardDelivered {
                    rule,
                    amount,
                    elapsed,
                },
            ),
            EngineEvent::Monitored {
                command,
                args,
                time,
            } if command == ACCEPT_RESPONSE => {
                if self.phase != Phase::Stimulus {
                    return;
                }
                if let Some(trial) = self.current.as_deref_mut() {
                    trial.response = args.into_iter().next();
                    trial.offset = Some(time);
                }
            }
            EngineEvent::Command { name, time } => {
                logging::log(
                    Level::Trace,
                    Domain::Engine,
                    "command",
                    obj(&[("name", v_str(&name)), ("time", v_num(time))]),
                );
            }
            EngineEvent::Monitored { .. } => {}
        }
    }
}

/// Drives one session against a borrowed engine.
pub struct TaskController<'e, E: Engine + ?Sized> {
    engine: &'e mut E,
    session: Session,
    options: TaskOptions,
}

impl<'e, E: Engine + ?Sized> TaskController<'e, E> {
    /// Generates the stimulus list from `params` and registers the task's
    /// commands with the engine.
    pub fn new(
        engine: &'e mut E,
        params: ParameterSet,
        global_trial: u64,
        options: TaskOptions,
    ) -> TaskResult<Self> {
        let stimuli = generate_stimuli(
            params.n_trials(),
            params.valid_cue_fraction(),
            params.stimulus_seed(),
        )?;
        Self::with_stimuli(engine, params, stimuli, global_trial, options)
    }

    pub fn with_stimuli(
        engine: &'e mut E,
        params: ParameterSet,
        stimuli: Vec<StimulusSpec>,
        global_trial: u64,
        options: TaskOptions,
    ) -> TaskResult<Self> {
        if !engine.is_ready() {
            return Err(engine_unavailable("engine is not ready"));
        }
        for name in COMMANDS {
            engine.register_command(name)?;
        }
        engine.register_monitor(KEY_MONITOR, ACCEPT_RESPONSE)?;

        let session = Session::new(stimuli, params, global_trial, options.rules.clone());
        session.cost.sync(&mut *engine)?;
        Ok(Self {
            engine,
            session,
            options,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn engine(&self) -> &E {
        &*self.engine
    }

    /// Feeds a record captured outside a tick. Records stamped with any
    /// index other than the current trial are rejected as stale.
    pub fn ingest(&mut self, record: EventRecord) -> TaskResult<()> {
        self.session
            .instrument
            .apply(&record, self.session.current.as_mut())
    }

    /// Advances by one phase, or by one idle tick while the engine has not
    /// reached the expected marker.
    pub fn step(&mut self) -> TaskResult<Phase> {
        let phase = self.session.phase;
        if phase == Phase::Done {
            return Ok(phase);
        }

        let marker = self.engine.query_buffer_slot("goal", "step");
        if !phase.marker_matches(marker.as_deref()) {
            self.session.stall_ticks += 1;
            if self.session.stall_ticks > self.options.max_stall_ticks {
                return Err(self.abort(phase, marker.as_deref()));
            }
            self.tick()?;
            return Ok(phase);
        }
        self.session.stall_ticks = 0;

        match phase {
            Phase::Fixation => self.present_fixation()?,
            Phase::Cue => self.present_cue()?,
            Phase::Stimulus => self.present_stimulus()?,
            Phase::Done => {}
        }
        Ok(self.session.phase)
    }

    /// Steps until done (or stalled), unregisters the task's commands and
    /// hands back the session record.
    pub fn run(mut self) -> TaskResult<SessionRecord> {
        let _profile = logging::ProfileScope::with_context(
            "session",
            &[("planned", serde_json::json!(self.session.stimuli.len()))],
        );
        loop {
            match self.step() {
                Ok(Phase::Done) => break,
                Ok(_) => {}
                Err(err) if err.kind == TaskErrorKind::IncompleteSession => break,
                Err(err) => {
                    let _ = self.teardown();
                    return Err(err);
                }
            }
        }
        self.teardown()?;
        Ok(self.session.into_record())
    }

    fn tick(&mut self) -> TaskResult<f64> {
        let session = &mut self.session;
        let mut sink = TrialSink {
            index: session.index,
            phase: session.phase,
            current: session.current.as_mut(),
            instrument: &mut session.instrument,
        };
        self.engine.run(self.options.tick, &mut sink)
    }

    fn schedule_display(&mut self, name: &str, items: Vec<DisplayItem>) -> TaskResult<()> {
        self.engine.schedule_event_at(
            DISPLAY_DELAY,
            ScheduledCommand::new(name, CommandAction::Display(items)),
        )
    }

    fn present_fixation(&mut self) -> TaskResult<()> {
        let motivation = self.session.params.motivation();
        if motivation != 0.0 {
            let slots = vec![
                ("step".to_string(), "attend-fixation".to_string()),
                ("time-onset".to_string(), self.engine.now().to_string()),
                ("motivation".to_string(), motivation.to_string()),
            ];
            self.engine.schedule_event_at(
                0.0,
                ScheduledCommand::new(SET_MOTIVATION, CommandAction::SetGoal(slots)),
            )?;
        }
        if let Some(trial) = &self.session.current {
            let s = trial.stimulus;
            logging::log_trial_start(
                trial.index + 1,
                s.condition().label(),
                s.shape.as_str(),
                s.location.as_str(),
                s.cue.as_str(),
            );
        }
        self.schedule_display(PRESENT_FIXATION, vec![DisplayItem::text("+", 400, 300)])?;
        self.tick()?;
        self.session.phase = Phase::Cue;
        Ok(())
    }

    fn present_cue(&mut self) -> TaskResult<()> {
        let cue = match &self.session.current {
            Some(trial) => trial.stimulus.cue.as_str(),
            None => return Ok(()),
        };
        let items = vec![DisplayItem::features(
            "simon-cue",
            400,
            300,
            &[("cue", cue)],
        )];
        self.schedule_display(PRESENT_CUE, items)?;
        self.tick()?;
        self.session.phase = Phase::Stimulus;
        Ok(())
    }

    fn present_stimulus(&mut self) -> TaskResult<()> {
        let now = self.engine.now();
        let stimulus = match self.session.current.as_mut() {
            Some(trial) => {
                trial.onset = now;
                trial.stimulus
            }
            None => return Ok(()),
        };
        let items = vec![
            DisplayItem::features(
                "simon-stimulus",
                200,
                300,
                &[
                    ("shape", stimulus.shape.as_str()),
                    ("color", "black"),
                    ("location", stimulus.location.as_str()),
                ],
            ),
            DisplayItem::text("f", 600, 500),
            DisplayItem::text("j", 650, 500),
        ];
        self.schedule_display(PRESENT_STIMULUS, items)?;
        self.tick()?;
        self.snapshot();
        self.finalize()
    }

    /// Reads utilities, activations and cost into the current trial. Values
    /// the engine cannot provide are left out.
    fn snapshot(&mut self) {
        let engine = &*self.engine;
        let rules = &self.session.instrument.rules;
        let trial = match self.session.current.as_mut() {
            Some(trial) => trial,
            None => return,
        };
        let number = trial.index + 1;
        let missing = |what: &str, name: &str, err: &TaskError| {
            logging::log(
                Level::Debug,
                Domain::Instrument,
                "snapshot_missing",
                obj(&[
                    ("trial", serde_json::json!(number)),
                    ("what", v_str(what)),
                    ("name", v_str(name)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        };

        for rule in &rules.process {
            match engine.production_parameter(rule, ":u") {
                Ok(u) => {
                    trial.utility.insert(rule.clone(), u);
                }
                Err(err) => missing("utility", rule, &err),
            }
        }
        for item in &rules.memory_items {
            match engine.chunk_parameter(item, ":last-retrieval-activation") {
                Ok(act) => {
                    trial.activation.insert(item.clone(), act);
                }
                Err(err) => missing("activation", item, &err),
            }
        }
        for rule in &rules.check_branch {
            match engine.production_parameter(rule, ":u") {
                Ok(u) => {
                    trial.check_utility.insert(rule.clone(), u);
                }
                Err(err) => missing("check_utility", rule, &err),
            }
        }
        match engine.production_parameter(&rules.respond, COST_PARAM) {
            Ok(cost) => trial.cost = Some(cost),
            Err(err) => missing("cost", &rules.respond, &err),
        }
    }

    fn finalize(&mut self) -> TaskResult<()> {
        let trial = match self.session.current.take() {
            Some(trial) => trial,
            None => return Ok(()),
        };
        self.session.global_trial += 1;
        self.session
            .cost
            .update(&mut *self.engine, self.session.global_trial)?;
        logging::log_trial_end(
            trial.index + 1,
            self.session.global_trial,
            if trial.accuracy() { 1.0 } else { 0.0 },
            trial.response_time(),
        );
        self.session.log.push(trial);
        self.session.index += 1;

        match self.session.stimuli.get(self.session.index) {
            Some(next) => {
                self.session.current = Some(Trial::new(self.session.index, *next));
                self.session.phase = Phase::Fixation;
            }
            None => {
                self.session.phase = Phase::Done;
                self.schedule_display(PRESENT_DONE, vec![DisplayItem::text("done", 400, 300)])?;
                self.tick()?;
            }
        }
        Ok(())
    }

    fn abort(&mut self, phase: Phase, marker: Option<&str>) -> TaskError {
        let planned = self.session.stimuli.len();
        let completed = self.session.log.len();
        logging::log(
            Level::Warn,
            Domain::Task,
            "phase_stalled",
            obj(&[
                ("trial", serde_json::json!(self.session.index + 1)),
                ("phase", v_str(phase.as_str())),
                ("marker", marker.map(v_str).unwrap_or(serde_json::Value::Null)),
                ("stall_ticks", serde_json::json!(self.session.stall_ticks)),
            ]),
        );
        self.session.current = None;
        self.session.phase = Phase::Done;
        self.session.complete = false;
        incomplete_session(format!(
            "stalled in {} after {} of {} trials",
            phase.as_str(),
            completed,
            planned
        ))
    }

    fn teardown(&mut self) -> TaskResult<()> {
        self.engine.unregister_monitor(KEY_MONITOR, ACCEPT_RESPONSE)?;
        for name in COMMANDS {
            self.engine.unregister_command(name)?;
        }
        Ok(())
    }
}
