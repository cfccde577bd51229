//! Capability interface to the external cognitive engine.
//!
//! The engine runs on its own logical clock. The controller advances it with
//! bounded [`Engine::run`] calls; everything the engine wants to tell us
//! (rule firings, reward deliveries, scheduled command callbacks, monitored
//! key presses) is pushed synchronously into the [`EventSink`] borrowed for
//! that one call, in engine order. Nothing is delivered outside `run`.
//!
//! ```text
//! ┌────────────┐  schedule / set / query   ┌────────────┐
//! │ Controller │──────────────────────────►│   Engine   │
//! │            │◄──────────────────────────│ (own clock)│
//! └────────────┘   EventSink (in-tick)     └────────────┘
//! ```

pub mod scripted;

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::TaskResult;
use crate::params::ParamValue;

/// One element written to the simulated display.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayItem {
    Text {
        text: String,
        x: i32,
        y: i32,
    },
    /// Visual features the engine can attend to, e.g. `kind = simon-cue`.
    Features {
        kind: String,
        x: i32,
        y: i32,
        slots: BTreeMap<String, String>,
    },
}

impl DisplayItem {
    pub fn text(text: &str, x: i32, y: i32) -> Self {
        DisplayItem::Text {
            text: text.to_string(),
            x,
            y,
        }
    }

    pub fn features(kind: &str, x: i32, y: i32, slots: &[(&str, &str)]) -> Self {
        DisplayItem::Features {
            kind: kind.to_string(),
            x,
            y,
            slots: slots
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandAction {
    /// Replace the goal buffer chunk with these slots.
    SetGoal(Vec<(String, String)>),
    /// Clear the display and show these items.
    Display(Vec<DisplayItem>),
}

/// A command the engine executes at a point of its own timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCommand {
    pub name: String,
    pub action: CommandAction,
}

impl ScheduledCommand {
    pub fn new(name: &str, action: CommandAction) -> Self {
        Self {
            name: name.to_string(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RuleFired {
        rule: String,
        time: f64,
    },
    RewardDelivered {
        rule: String,
        amount: f64,
        elapsed: f64,
        time: f64,
    },
    /// A registered command came due.
    Command { name: String, time: f64 },
    /// A monitored engine call (e.g. `output-key`) forwarded to `command`.
    Monitored {
        command: String,
        args: Vec<String>,
        time: f64,
    },
}

impl EngineEvent {
    pub fn time(&self) -> f64 {
        match self {
            EngineEvent::RuleFired { time, .. }
            | EngineEvent::RewardDelivered { time, .. }
            | EngineEvent::Command { time, .. }
            | EngineEvent::Monitored { time, .. } => *time,
        }
    }
}

/// Receives engine events during a single `run` call.
pub trait EventSink {
    fn deliver(&mut self, event: EngineEvent);
}

impl EventSink for Vec<EngineEvent> {
    fn deliver(&mut self, event: EngineEvent) {
        self.push(event);
    }
}

/// Opaque host capability. Any implementation with bounded synchronous ticks
/// and in-tick event delivery is substitutable.
pub trait Engine {
    fn is_ready(&self) -> bool;

    /// Clears the loaded model, clock and pending events.
    fn reset(&mut self) -> TaskResult<()>;

    fn load_model(&mut self, path: &Path) -> TaskResult<()>;

    fn disable_productions(&mut self, names: &[&str]) -> TaskResult<()>;

    /// Current engine time in seconds.
    fn now(&self) -> f64;

    /// Advance the engine by at most `duration` seconds, delivering events
    /// into `sink`. Returns the engine time afterwards.
    fn run(&mut self, duration: f64, sink: &mut dyn EventSink) -> TaskResult<f64>;

    /// Schedule `command` at `offset` seconds from now.
    fn schedule_event_at(&mut self, offset: f64, command: ScheduledCommand) -> TaskResult<()>;

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> TaskResult<()>;

    fn get_parameter(&self, name: &str) -> TaskResult<ParamValue>;

    /// `None` when the buffer is empty or the slot is unset.
    fn query_buffer_slot(&self, buffer: &str, slot: &str) -> Option<String>;

    fn register_command(&mut self, name: &str) -> TaskResult<()>;

    fn unregister_command(&mut self, name: &str) -> TaskResult<()>;

    fn register_monitor(&mut self, event: &str, command: &str) -> TaskResult<()>;

    fn unregister_monitor(&mut self, event: &str, command: &str) -> TaskResult<()>;

    fn production_parameter(&self, production: &str, param: &str) -> TaskResult<f64>;

    /// `production = None` applies to every production.
    fn set_production_parameter(
        &mut self,
        production: Option<&str>,
        param: &str,
        value: f64,
    ) -> TaskResult<()>;

    fn chunk_parameter(&self, chunk: &str, param: &str) -> TaskResult<f64>;
}

/// Builds independent engine instances, one per concurrent session.
pub trait EngineFactory: Sync {
    type Engine: Engine;

    fn create(&self) -> TaskResult<Self::Engine>;
}
