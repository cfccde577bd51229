//! Deterministic in-process engine.
//!
//! Plays a fixed Simon-task model: attends fixation and cue, then on every
//! stimulus fires one processing rule, retrieves the intended response,
//! verifies it a configurable number of times, responds and presses a key.
//! No model files are read; `load_model` only records the path.
//!
//! Used by the binaries when no external host is attached, and by tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::{
    CommandAction, DisplayItem, Engine, EngineEvent, EngineFactory, EventSink, ScheduledCommand,
};
use crate::error::{engine_error, engine_unavailable, TaskResult};
use crate::params::ParamValue;

const STEP: f64 = 0.05;

const PRODUCTIONS: [&str; 13] = [
    "ATTEND-FIXATION",
    "ATTEND-CUE",
    "PROCESS-SHAPE",
    "PROCESS-LOCATION",
    "DONT-PROCESS-SHAPE",
    "DONT-PROCESS-LOCATION",
    "RETRIEVE-INTENDED-RESPONSE",
    "RETRIEVE-INTENDED-RESPONSE-M3",
    "CHECK-PASS",
    "CHECK-PASS-M3",
    "CHECK-DETECT-PROBLEM-UNLIMITED",
    "DONT-CHECK",
    "RESPOND",
];

const CHUNKS: [&str; 2] = ["CIRCLE-LEFT", "SQUARE-RIGHT"];

/// How the scripted model answers each stimulus.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePolicy {
    /// Seconds from stimulus display to key press.
    pub response_time: f64,
    /// Verification firings per trial; 0 takes the don't-check branch.
    pub checks: u32,
    /// Every n-th stimulus is answered with the wrong key (0: never).
    pub error_every: usize,
    /// Every n-th stimulus gets no key press (0: never).
    pub omit_every: usize,
    /// Reward delivered to the processing and checking rules.
    pub reward: f64,
    /// Stop reacting after this many stimuli; the goal stays on the
    /// stimulus step.
    pub stall_after: Option<usize>,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            response_time: 0.45,
            checks: 1,
            error_every: 0,
            omit_every: 0,
            reward: 1.0,
            stall_after: None,
        }
    }
}

#[derive(Debug, Clone)]
enum Item {
    Command(ScheduledCommand),
    Fire(String),
    Reward {
        rule: String,
        amount: f64,
        elapsed: f64,
    },
    Key(String),
    SetStep(String),
    ClearGoal,
}

#[derive(Debug, Clone)]
struct Pending {
    due: f64,
    seq: u64,
    item: Item,
}

#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    policy: ResponsePolicy,
    loaded: Vec<PathBuf>,
    time: f64,
    seq: u64,
    params: BTreeMap<String, ParamValue>,
    productions: BTreeMap<String, BTreeMap<String, f64>>,
    disabled: BTreeSet<String>,
    chunks: BTreeMap<String, BTreeMap<String, f64>>,
    goal: Option<BTreeMap<String, String>>,
    display: Vec<DisplayItem>,
    queue: Vec<Pending>,
    commands: BTreeSet<String>,
    monitors: BTreeMap<String, BTreeSet<String>>,
    stimuli_seen: usize,
}

fn default_params() -> BTreeMap<String, ParamValue> {
    [
        (":seed", ParamValue::Text("(100 0)".to_string())),
        (":ans", ParamValue::Null),
        (":le", ParamValue::Num(1.0)),
        (":lf", ParamValue::Num(1.0)),
        (":mas", ParamValue::Null),
        (":bll", ParamValue::Null),
        (":egs", ParamValue::Num(0.0)),
        (":alpha", ParamValue::Num(0.2)),
        (":imaginal-activation", ParamValue::Num(1.0)),
        (":dat", ParamValue::Num(0.05)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl ScriptedEngine {
    pub fn new(policy: ResponsePolicy) -> Self {
        let mut engine = Self {
            policy,
            loaded: Vec::new(),
            time: 0.0,
            seq: 0,
            params: BTreeMap::new(),
            productions: BTreeMap::new(),
            disabled: BTreeSet::new(),
            chunks: BTreeMap::new(),
            goal: None,
            display: Vec::new(),
            queue: Vec::new(),
            commands: BTreeSet::new(),
            monitors: BTreeMap::new(),
            stimuli_seen: 0,
        };
        engine.clear();
        engine
    }

    /// Default policy with a model already marked as loaded.
    pub fn loaded() -> Self {
        let mut engine = Self::new(ResponsePolicy::default());
        engine.loaded.push(PathBuf::from("simon-core.lisp"));
        engine
    }

    pub fn is_disabled(&self, production: &str) -> bool {
        self.disabled.contains(production)
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains(name)
    }

    fn clear(&mut self) {
        self.time = 0.0;
        self.seq = 0;
        self.params = default_params();
        let at = self.dat();
        self.productions = PRODUCTIONS
            .iter()
            .map(|p| {
                let params = [(":u".to_string(), 0.0), (":at".to_string(), at)];
                (p.to_string(), params.into_iter().collect())
            })
            .collect();
        self.chunks = CHUNKS
            .iter()
            .map(|c| {
                let params = [(":last-retrieval-activation".to_string(), 0.0)];
                (c.to_string(), params.into_iter().collect())
            })
            .collect();
        self.disabled.clear();
        self.goal = None;
        self.display.clear();
        self.queue.clear();
        self.stimuli_seen = 0;
    }

    fn dat(&self) -> f64 {
        self.params
            .get(":dat")
            .and_then(ParamValue::as_f64)
            .unwrap_or(0.05)
    }

    fn alpha(&self) -> f64 {
        self.params
            .get(":alpha")
            .and_then(ParamValue::as_f64)
            .unwrap_or(0.2)
    }

    fn push(&mut self, due: f64, item: Item) {
        self.seq += 1;
        self.queue.push(Pending {
            due,
            seq: self.seq,
            item,
        });
    }

    fn pop_due(&mut self, end: f64) -> Option<Pending> {
        let next = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= end)
            .min_by(|(_, a), (_, b)| a.due.total_cmp(&b.due).then(a.seq.cmp(&b.seq)))
            .map(|(i, _)| i)?;
        Some(self.queue.remove(next))
    }

    fn react(&mut self, at: f64) {
        let items = self.display.clone();
        for item in items {
            match item {
                DisplayItem::Text { text, .. } if text == "+" => {
                    self.push(at + STEP, Item::Fire("ATTEND-FIXATION".into()));
                    self.push(at + STEP, Item::SetStep("ATTEND-CUE".into()));
                }
                DisplayItem::Features { kind, .. } if kind == "simon-cue" => {
                    self.push(at + STEP, Item::Fire("ATTEND-CUE".into()));
                    self.push(at + STEP, Item::SetStep("ATTEND-STIMULUS".into()));
                }
                DisplayItem::Features { kind, slots, .. } if kind == "simon-stimulus" => {
                    self.respond_to(at, slots.get("shape").map(String::as_str));
                }
                _ => {}
            }
        }
    }

    fn respond_to(&mut self, at: f64, shape: Option<&str>) {
        self.stimuli_seen += 1;
        let n = self.stimuli_seen;
        if self.policy.stall_after.map_or(false, |limit| n > limit) {
            return;
        }
        let every = |k: usize| k > 0 && n % k == 0;
        let wrong = every(self.policy.error_every);
        let omitted = every(self.policy.omit_every);
        let (correct, other, chunk) = match shape {
            Some(s) if s.eq_ignore_ascii_case("SQUARE") => ("j", "f", "SQUARE-RIGHT"),
            _ => ("f", "j", "CIRCLE-LEFT"),
        };
        let key = if wrong { other } else { correct };
        let process = if wrong { "PROCESS-LOCATION" } else { "PROCESS-SHAPE" };
        let reward = self.policy.reward;

        if let Some(params) = self.chunks.get_mut(chunk) {
            params.insert(
                ":last-retrieval-activation".to_string(),
                (1.0 + n as f64).ln() * 0.5,
            );
        }

        let mut cursor = at + STEP;
        self.push(cursor, Item::Fire(process.into()));
        self.push(
            cursor,
            Item::Reward {
                rule: process.into(),
                amount: reward,
                elapsed: STEP,
            },
        );
        cursor += STEP;
        self.push(cursor, Item::Fire("RETRIEVE-INTENDED-RESPONSE-M3".into()));

        let branch = if self.policy.checks == 0 {
            cursor += STEP;
            self.push(cursor, Item::Fire("DONT-CHECK".into()));
            "DONT-CHECK"
        } else {
            for _ in 0..self.policy.checks {
                cursor += STEP;
                self.push(cursor, Item::Fire("CHECK-PASS-M3".into()));
            }
            cursor += STEP;
            self.push(cursor, Item::Fire("RETRIEVE-INTENDED-RESPONSE-M3".into()));
            "CHECK-PASS-M3"
        };
        self.push(
            cursor,
            Item::Reward {
                rule: branch.into(),
                amount: reward,
                elapsed: cursor - at,
            },
        );

        let key_at = (at + self.policy.response_time).max(cursor + 2.0 * STEP);
        self.push(key_at - STEP, Item::Fire("RESPOND".into()));
        if !omitted {
            self.push(key_at, Item::Key(key.into()));
        }
        self.push(key_at, Item::ClearGoal);
    }

    fn process(&mut self, pending: Pending, sink: &mut dyn EventSink) {
        let time = pending.due;
        match pending.item {
            Item::Command(command) => {
                match command.action {
                    CommandAction::SetGoal(slots) => {
                        self.goal = Some(slots.into_iter().collect());
                    }
                    CommandAction::Display(items) => {
                        self.display = items;
                        self.react(time);
                    }
                }
                if self.commands.contains(&command.name) {
                    sink.deliver(EngineEvent::Command {
                        name: command.name,
                        time,
                    });
                }
            }
            Item::Fire(rule) => {
                if !self.disabled.contains(&rule) {
                    sink.deliver(EngineEvent::RuleFired { rule, time });
                }
            }
            Item::Reward {
                rule,
                amount,
                elapsed,
            } => {
                let alpha = self.alpha();
                if let Some(u) = self.productions.get_mut(&rule).and_then(|p| p.get_mut(":u")) {
                    *u += alpha * ((amount - elapsed) - *u);
                }
                sink.deliver(EngineEvent::RewardDelivered {
                    rule,
                    amount,
                    elapsed,
                    time,
                });
            }
            Item::Key(key) => {
                if let Some(commands) = self.monitors.get("output-key") {
                    for command in commands {
                        sink.deliver(EngineEvent::Monitored {
                            command: command.clone(),
                            args: vec![key.clone()],
                            time,
                        });
                    }
                }
            }
            Item::SetStep(step) => {
                self.goal
                    .get_or_insert_with(BTreeMap::new)
                    .insert("step".to_string(), step);
            }
            Item::ClearGoal => self.goal = None,
        }
    }

    fn ensure_ready(&self) -> TaskResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(engine_unavailable("no model loaded"))
        }
    }
}

impl Engine for ScriptedEngine {
    fn is_ready(&self) -> bool {
        !self.loaded.is_empty()
    }

    fn reset(&mut self) -> TaskResult<()> {
        self.loaded.clear();
        self.clear();
        Ok(())
    }

    fn load_model(&mut self, path: &Path) -> TaskResult<()> {
        self.loaded.push(path.to_path_buf());
        Ok(())
    }

    fn disable_productions(&mut self, names: &[&str]) -> TaskResult<()> {
        for name in names {
            if !self.productions.contains_key(*name) {
                return Err(engine_error(format!("unknown production {}", name)));
            }
            self.disabled.insert(name.to_string());
        }
        Ok(())
    }

    fn now(&self) -> f64 {
        self.time
    }

    fn run(&mut self, duration: f64, sink: &mut dyn EventSink) -> TaskResult<f64> {
        self.ensure_ready()?;
        let end = self.time + duration;
        while let Some(pending) = self.pop_due(end) {
            self.time = pending.due;
            self.process(pending, sink);
        }
        self.time = end;
        Ok(end)
    }

    fn schedule_event_at(&mut self, offset: f64, command: ScheduledCommand) -> TaskResult<()> {
        self.ensure_ready()?;
        self.push(self.time + offset, Item::Command(command));
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> TaskResult<()> {
        let key = name.to_lowercase();
        if !self.params.contains_key(&key) {
            return Err(engine_error(format!("unknown engine parameter {}", name)));
        }
        if key == ":dat" {
            let at = value
                .as_f64()
                .ok_or_else(|| engine_error(format!(":dat expects a number, got {}", value)))?;
            for params in self.productions.values_mut() {
                params.insert(":at".to_string(), at);
            }
        }
        self.params.insert(key, value.clone());
        Ok(())
    }

    fn get_parameter(&self, name: &str) -> TaskResult<ParamValue> {
        self.params
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| engine_error(format!("unknown engine parameter {}", name)))
    }

    fn query_buffer_slot(&self, buffer: &str, slot: &str) -> Option<String> {
        if !buffer.eq_ignore_ascii_case("goal") {
            return None;
        }
        self.goal.as_ref()?.get(slot).cloned()
    }

    fn register_command(&mut self, name: &str) -> TaskResult<()> {
        self.commands.insert(name.to_string());
        Ok(())
    }

    fn unregister_command(&mut self, name: &str) -> TaskResult<()> {
        self.commands.remove(name);
        Ok(())
    }

    fn register_monitor(&mut self, event: &str, command: &str) -> TaskResult<()> {
        self.monitors
            .entry(event.to_string())
            .or_default()
            .insert(command.to_string());
        Ok(())
    }

    fn unregister_monitor(&mut self, event: &str, command: &str) -> TaskResult<()> {
        if let Some(commands) = self.monitors.get_mut(event) {
            commands.remove(command);
        }
        Ok(())
    }

    fn production_parameter(&self, production: &str, param: &str) -> TaskResult<f64> {
        self.productions
            .get(production)
            .and_then(|p| p.get(&param.to_lowercase()))
            .copied()
            .ok_or_else(|| engine_error(format!("no {} for production {}", param, production)))
    }

    fn set_production_parameter(
        &mut self,
        production: Option<&str>,
        param: &str,
        value: f64,
    ) -> TaskResult<()> {
        let key = param.to_lowercase();
        match production {
            None => {
                for params in self.productions.values_mut() {
                    params.insert(key.clone(), value);
                }
            }
            Some(name) => {
                let params = self
                    .productions
                    .get_mut(name)
                    .ok_or_else(|| engine_error(format!("unknown production {}", name)))?;
                params.insert(key, value);
            }
        }
        Ok(())
    }

    fn chunk_parameter(&self, chunk: &str, param: &str) -> TaskResult<f64> {
        self.chunks
            .get(chunk)
            .and_then(|c| c.get(&param.to_lowercase()))
            .copied()
            .ok_or_else(|| engine_error(format!("no {} for chunk {}", param, chunk)))
    }
}

/// Hands out fresh scripted engines sharing one policy.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    pub policy: ResponsePolicy,
}

impl EngineFactory for ScriptedFactory {
    type Engine = ScriptedEngine;

    fn create(&self) -> TaskResult<ScriptedEngine> {
        Ok(ScriptedEngine::new(self.policy.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stimulus_display(shape: &str) -> CommandAction {
        CommandAction::Display(vec![DisplayItem::features(
            "simon-stimulus",
            200,
            300,
            &[("shape", shape), ("location", "LEFT")],
        )])
    }

    #[test]
    fn test_not_ready_before_load() {
        let mut engine = ScriptedEngine::new(ResponsePolicy::default());
        assert!(!engine.is_ready());
        let err = engine.run(1.0, &mut Vec::<EngineEvent>::new()).unwrap_err();
        assert_eq!(err.kind, crate::error::TaskErrorKind::EngineUnavailable);
    }

    #[test]
    fn test_goal_steps_follow_displays() {
        let mut engine = ScriptedEngine::loaded();
        let mut events: Vec<EngineEvent> = Vec::new();
        engine
            .schedule_event_at(
                0.01,
                ScheduledCommand::new(
                    "fixation",
                    CommandAction::Display(vec![DisplayItem::text("+", 400, 300)]),
                ),
            )
            .unwrap();
        engine.run(1.0, &mut events).unwrap();
        assert_eq!(engine.query_buffer_slot("goal", "step").as_deref(), Some("ATTEND-CUE"));

        engine
            .schedule_event_at(
                0.01,
                ScheduledCommand::new(
                    "cue",
                    CommandAction::Display(vec![DisplayItem::features("simon-cue", 400, 300, &[])]),
                ),
            )
            .unwrap();
        engine.run(1.0, &mut events).unwrap();
        assert_eq!(
            engine.query_buffer_slot("goal", "step").as_deref(),
            Some("ATTEND-STIMULUS")
        );

        engine
            .schedule_event_at(0.01, ScheduledCommand::new("stim", stimulus_display("SQUARE")))
            .unwrap();
        engine.run(1.0, &mut events).unwrap();
        assert_eq!(engine.query_buffer_slot("goal", "step"), None);
    }

    #[test]
    fn test_events_in_time_order_and_key_monitored() {
        let mut engine = ScriptedEngine::loaded();
        engine.register_monitor("output-key", "accept").unwrap();
        engine
            .schedule_event_at(0.0, ScheduledCommand::new("stim", stimulus_display("SQUARE")))
            .unwrap();
        let mut events: Vec<EngineEvent> = Vec::new();
        engine.run(2.0, &mut events).unwrap();

        let times: Vec<f64> = events.iter().map(EngineEvent::time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        let key = events.iter().find_map(|e| match e {
            EngineEvent::Monitored { command, args, .. } if command == "accept" => {
                args.first().cloned()
            }
            _ => None,
        });
        assert_eq!(key.as_deref(), Some("j"));
        assert_eq!(engine.now(), 2.0);
    }

    #[test]
    fn test_disabled_rules_do_not_fire() {
        let mut engine = ScriptedEngine::loaded();
        engine.disable_productions(&["CHECK-PASS-M3"]).unwrap();
        engine
            .schedule_event_at(0.0, ScheduledCommand::new("stim", stimulus_display("CIRCLE")))
            .unwrap();
        let mut events: Vec<EngineEvent> = Vec::new();
        engine.run(2.0, &mut events).unwrap();
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::RuleFired { rule, .. } if rule == "CHECK-PASS-M3")));
        assert!(engine.disable_productions(&["NO-SUCH-RULE"]).is_err());
    }

    #[test]
    fn test_rewards_move_utility() {
        let mut engine = ScriptedEngine::loaded();
        engine
            .schedule_event_at(0.0, ScheduledCommand::new("stim", stimulus_display("CIRCLE")))
            .unwrap();
        engine.run(2.0, &mut Vec::<EngineEvent>::new()).unwrap();
        assert!(engine.production_parameter("PROCESS-SHAPE", ":u").unwrap() > 0.0);
        assert!(engine.chunk_parameter("CIRCLE-LEFT", ":Last-Retrieval-Activation").unwrap() > 0.0);
    }

    #[test]
    fn test_dat_sets_action_time() {
        let mut engine = ScriptedEngine::loaded();
        engine.set_parameter(":dat", &ParamValue::Num(0.08)).unwrap();
        assert_eq!(engine.production_parameter("RESPOND", ":at").unwrap(), 0.08);
        assert!(engine.set_parameter(":speed", &ParamValue::Num(1.0)).is_err());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut engine = ScriptedEngine::loaded();
        engine.run(5.0, &mut Vec::<EngineEvent>::new()).unwrap();
        engine.reset().unwrap();
        assert!(!engine.is_ready());
        assert_eq!(engine.now(), 0.0);
    }
}
