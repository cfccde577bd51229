//! Closed set of recognized parameters.
//!
//! Engine parameters are read from the host after model load and written back
//! under their `:`-prefixed names. Task parameters shape the stimulus list and
//! the cost controller and never reach the engine, except `init_cost` which is
//! written as the engine's default action time (`:dat`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::Engine;
use crate::error::{malformed_parameter, TaskError, TaskResult};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamName {
    // engine
    Seed,
    Ans,
    Le,
    Lf,
    Mas,
    Bll,
    Egs,
    Alpha,
    ImaginalActivation,
    Dat,
    // task
    Motivation,
    InitCost,
    UpdateCost,
    ValidCuePercentage,
    NTrials,
    StimulusSeed,
    CostA,
    CostB,
}

impl ParamName {
    pub const ENGINE: [ParamName; 10] = [
        ParamName::Seed,
        ParamName::Ans,
        ParamName::Le,
        ParamName::Lf,
        ParamName::Mas,
        ParamName::Bll,
        ParamName::Egs,
        ParamName::Alpha,
        ParamName::ImaginalActivation,
        ParamName::Dat,
    ];

    pub const TASK: [ParamName; 8] = [
        ParamName::Motivation,
        ParamName::InitCost,
        ParamName::UpdateCost,
        ParamName::ValidCuePercentage,
        ParamName::NTrials,
        ParamName::StimulusSeed,
        ParamName::CostA,
        ParamName::CostB,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamName::Seed => "seed",
            ParamName::Ans => "ans",
            ParamName::Le => "le",
            ParamName::Lf => "lf",
            ParamName::Mas => "mas",
            ParamName::Bll => "bll",
            ParamName::Egs => "egs",
            ParamName::Alpha => "alpha",
            ParamName::ImaginalActivation => "imaginal-activation",
            ParamName::Dat => "dat",
            ParamName::Motivation => "motivation",
            ParamName::InitCost => "init_cost",
            ParamName::UpdateCost => "update_cost",
            ParamName::ValidCuePercentage => "valid_cue_percentage",
            ParamName::NTrials => "n_trials",
            ParamName::StimulusSeed => "stimulus_seed",
            ParamName::CostA => "cost_a",
            ParamName::CostB => "cost_b",
        }
    }

    /// Host-side name, e.g. `:ans`. `None` for task-only parameters.
    pub fn engine_key(&self) -> Option<String> {
        if ParamName::ENGINE.contains(self) {
            Some(format!(":{}", self.as_str()))
        } else {
            None
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamName {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().trim_start_matches(':');
        ParamName::ENGINE
            .iter()
            .chain(ParamName::TASK.iter())
            .find(|p| p.as_str() == key)
            .copied()
            .ok_or_else(|| malformed_parameter(format!("unknown parameter '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Flag(bool),
    Num(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    /// Parses `nil`/`none`, booleans, numbers, then falls back to text.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_lowercase().as_str() {
            "nil" | "none" | "null" => return ParamValue::Null,
            "true" | "t" => return ParamValue::Flag(true),
            "false" => return ParamValue::Flag(false),
            _ => {}
        }
        match raw.parse::<f64>() {
            Ok(v) => ParamValue::Num(v),
            Err(_) => ParamValue::Text(raw.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Null => Value::Null,
            ParamValue::Flag(v) => Value::Bool(*v),
            ParamValue::Num(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParamValue::Text(v) => Value::String(v.clone()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => f.write_str("nil"),
            ParamValue::Flag(v) => write!(f, "{}", v),
            ParamValue::Num(v) => write!(f, "{}", v),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

/// Checks that `value` has the shape `name` expects.
pub fn validate(name: ParamName, value: &ParamValue) -> TaskResult<()> {
    let bad = |what: &str| {
        Err(malformed_parameter(format!(
            "{} expects {}, got '{}'",
            name, what, value
        )))
    };
    match name {
        ParamName::UpdateCost => match value {
            ParamValue::Flag(_) => Ok(()),
            _ => bad("a boolean"),
        },
        ParamName::ValidCuePercentage => match value.as_f64() {
            Some(p) if (0.0..=1.0).contains(&p) => Ok(()),
            _ => bad("a number within [0, 1]"),
        },
        ParamName::NTrials | ParamName::StimulusSeed => match value.as_f64() {
            Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(()),
            _ => bad("a non-negative integer"),
        },
        ParamName::Motivation
        | ParamName::InitCost
        | ParamName::CostA
        | ParamName::CostB
        | ParamName::Dat => match value.as_f64() {
            Some(v) if v.is_finite() => Ok(()),
            _ => bad("a number"),
        },
        // engine parameters may legitimately be nil, lists or flags
        _ => Ok(()),
    }
}

/// `dat` always follows `init_cost` and cannot be requested directly.
fn settable(name: &str) -> TaskResult<ParamName> {
    let name: ParamName = name.parse()?;
    if name == ParamName::Dat {
        return Err(malformed_parameter("dat is derived from init_cost; set init_cost instead"));
    }
    Ok(name)
}

/// Parses `name=value`.
pub fn parse_assignment(raw: &str) -> TaskResult<(ParamName, ParamValue)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| malformed_parameter(format!("expected name=value, got '{}'", raw)))?;
    let name = settable(name)?;
    let value = ParamValue::parse(value);
    validate(name, &value)?;
    Ok((name, value))
}

/// Parses `name=v1,v2,...` into a sweep axis.
pub fn parse_axis(raw: &str) -> TaskResult<(ParamName, Vec<ParamValue>)> {
    let (name, values) = raw
        .split_once('=')
        .ok_or_else(|| malformed_parameter(format!("expected name=v1,v2, got '{}'", raw)))?;
    let name = settable(name)?;
    let values: Vec<ParamValue> = values
        .split(',')
        .filter(|v| !v.trim().is_empty())
        .map(ParamValue::parse)
        .collect();
    if values.is_empty() {
        return Err(malformed_parameter(format!("axis '{}' has no values", name)));
    }
    for value in &values {
        validate(name, value)?;
    }
    Ok((name, values))
}

/// Parameters in effect for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    values: BTreeMap<ParamName, ParamValue>,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self::task_defaults()
    }
}

impl ParameterSet {
    pub fn task_defaults() -> Self {
        let mut values = BTreeMap::new();
        values.insert(ParamName::Motivation, ParamValue::Num(1.0));
        values.insert(ParamName::InitCost, ParamValue::Num(0.05));
        values.insert(ParamName::UpdateCost, ParamValue::Flag(false));
        values.insert(ParamName::ValidCuePercentage, ParamValue::Num(0.5));
        values.insert(ParamName::NTrials, ParamValue::Num(20.0));
        values.insert(ParamName::StimulusSeed, ParamValue::Num(100.0));
        values.insert(ParamName::CostA, ParamValue::Num(0.005));
        values.insert(ParamName::CostB, ParamValue::Num(0.005));
        Self { values }
    }

    /// Task defaults merged with the engine's current parameter values.
    pub fn from_engine<E: Engine + ?Sized>(engine: &E) -> TaskResult<Self> {
        let mut set = Self::task_defaults();
        for name in ParamName::ENGINE {
            if let Some(key) = name.engine_key() {
                set.values.insert(name, engine.get_parameter(&key)?);
            }
        }
        Ok(set)
    }

    pub fn get(&self, name: ParamName) -> Option<&ParamValue> {
        self.values.get(&name)
    }

    pub fn set(&mut self, name: ParamName, value: ParamValue) -> TaskResult<()> {
        validate(name, &value)?;
        self.values.insert(name, value);
        Ok(())
    }

    pub fn with_overrides(mut self, overrides: &[(ParamName, ParamValue)]) -> TaskResult<Self> {
        for (name, value) in overrides {
            self.set(*name, value.clone())?;
        }
        Ok(self)
    }

    fn num(&self, name: ParamName, fallback: f64) -> f64 {
        self.get(name).and_then(ParamValue::as_f64).unwrap_or(fallback)
    }

    pub fn motivation(&self) -> f64 {
        self.num(ParamName::Motivation, 1.0)
    }

    pub fn init_cost(&self) -> f64 {
        self.num(ParamName::InitCost, 0.05)
    }

    pub fn update_cost(&self) -> bool {
        self.get(ParamName::UpdateCost)
            .and_then(ParamValue::as_bool)
            .unwrap_or(false)
    }

    pub fn valid_cue_fraction(&self) -> f64 {
        self.num(ParamName::ValidCuePercentage, 0.5)
    }

    pub fn n_trials(&self) -> usize {
        self.num(ParamName::NTrials, 20.0) as usize
    }

    pub fn stimulus_seed(&self) -> u64 {
        self.num(ParamName::StimulusSeed, 100.0) as u64
    }

    pub fn cost_a(&self) -> f64 {
        self.num(ParamName::CostA, 0.005)
    }

    pub fn cost_b(&self) -> f64 {
        self.num(ParamName::CostB, 0.005)
    }

    /// Writes the overridden engine parameters to the host, then the
    /// initial cost as `:dat`.
    pub fn apply<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        overrides: &[(ParamName, ParamValue)],
    ) -> TaskResult<()> {
        for (name, value) in overrides {
            if *name == ParamName::Dat {
                logging::log(
                    Level::Warn,
                    Domain::Engine,
                    "dat_override_ignored",
                    obj(&[
                        ("requested", v_str(&value.to_string())),
                        ("init_cost", v_num(self.init_cost())),
                    ]),
                );
                continue;
            }
            if let Some(key) = name.engine_key() {
                engine.set_parameter(&key, value)?;
            }
        }
        let dat = ParamValue::Num(self.init_cost());
        engine.set_parameter(":dat", &dat)?;
        self.values.insert(ParamName::Dat, dat);
        Ok(())
    }

    pub fn to_record(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.to_json()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamName, &ParamValue)> {
        self.values.iter()
    }
}

/// Canonical key of a swept tuple, e.g. `init_cost=0.05;motivation=1`.
/// Entries are ordered by name, so axis order does not matter.
pub fn sweep_key(values: &[(ParamName, ParamValue)]) -> String {
    let mut entries: Vec<String> = values
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    entries.sort();
    entries.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for name in ParamName::ENGINE.iter().chain(ParamName::TASK.iter()) {
            assert_eq!(name.as_str().parse::<ParamName>().unwrap(), *name);
        }
        assert_eq!(":ans".parse::<ParamName>().unwrap(), ParamName::Ans);
        assert_eq!(
            ParamName::ImaginalActivation.engine_key().as_deref(),
            Some(":imaginal-activation")
        );
        assert!(ParamName::Motivation.engine_key().is_none());
    }

    #[test]
    fn test_unknown_name_rejected() {
        let err = "speed".parse::<ParamName>().unwrap_err();
        assert_eq!(err.kind, crate::error::TaskErrorKind::MalformedParameter);
    }

    #[test]
    fn test_value_parsing() {
        assert_eq!(ParamValue::parse("nil"), ParamValue::Null);
        assert_eq!(ParamValue::parse("True"), ParamValue::Flag(true));
        assert_eq!(ParamValue::parse("0.25"), ParamValue::Num(0.25));
        assert_eq!(ParamValue::parse("(100 0)"), ParamValue::Text("(100 0)".into()));
    }

    #[test]
    fn test_assignment_validation() {
        assert_eq!(
            parse_assignment("motivation=2.5").unwrap(),
            (ParamName::Motivation, ParamValue::Num(2.5))
        );
        assert!(parse_assignment("update_cost=1").is_err());
        assert!(parse_assignment("valid_cue_percentage=1.2").is_err());
        assert!(parse_assignment("n_trials=3.5").is_err());
        assert!(parse_assignment("motivation").is_err());
    }

    #[test]
    fn test_axis_parsing() {
        let (name, values) = parse_axis("init_cost=0.01,0.05").unwrap();
        assert_eq!(name, ParamName::InitCost);
        assert_eq!(values, vec![ParamValue::Num(0.01), ParamValue::Num(0.05)]);
        assert!(parse_axis("init_cost=").is_err());
    }

    #[test]
    fn test_defaults_and_overrides() {
        let set = ParameterSet::task_defaults()
            .with_overrides(&[
                (ParamName::Motivation, ParamValue::Num(3.0)),
                (ParamName::UpdateCost, ParamValue::Flag(true)),
            ])
            .unwrap();
        assert_eq!(set.motivation(), 3.0);
        assert!(set.update_cost());
        assert_eq!(set.init_cost(), 0.05);
        assert_eq!(set.n_trials(), 20);
        assert_eq!(set.stimulus_seed(), 100);
        assert_eq!(set.valid_cue_fraction(), 0.5);
    }

    #[test]
    fn test_sweep_key_is_stable() {
        let key = sweep_key(&[
            (ParamName::Motivation, ParamValue::Num(1.0)),
            (ParamName::InitCost, ParamValue::Num(0.05)),
            (ParamName::UpdateCost, ParamValue::Flag(false)),
        ]);
        assert_eq!(key, "init_cost=0.05;motivation=1;update_cost=false");
    }

    #[test]
    fn test_sweep_key_ignores_axis_order() {
        let a = sweep_key(&[
            (ParamName::Motivation, ParamValue::Num(2.0)),
            (ParamName::ValidCuePercentage, ParamValue::Num(0.5)),
        ]);
        let b = sweep_key(&[
            (ParamName::ValidCuePercentage, ParamValue::Num(0.5)),
            (ParamName::Motivation, ParamValue::Num(2.0)),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_dat_cannot_be_requested() {
        let err = parse_assignment("dat=0.2").unwrap_err();
        assert_eq!(err.kind, crate::error::TaskErrorKind::MalformedParameter);
        assert!(parse_assignment(":dat=0.2").is_err());
        assert!(parse_axis("dat=0.1,0.2").is_err());
    }

    #[test]
    fn test_apply_writes_init_cost_as_dat() {
        let mut engine = crate::engine::scripted::ScriptedEngine::loaded();
        let overrides = [
            (ParamName::InitCost, ParamValue::Num(0.08)),
            (ParamName::Dat, ParamValue::Num(0.3)),
        ];
        let mut set = ParameterSet::task_defaults().with_overrides(&overrides).unwrap();
        set.apply(&mut engine, &overrides).unwrap();
        assert_eq!(engine.get_parameter(":dat").unwrap(), ParamValue::Num(0.08));
        assert_eq!(set.get(ParamName::Dat), Some(&ParamValue::Num(0.08)));
    }

    #[test]
    fn test_record_serializes_values() {
        let record = ParameterSet::task_defaults().to_record();
        assert_eq!(record["motivation"], serde_json::json!(1.0));
        assert_eq!(record["update_cost"], serde_json::json!(false));
    }
}
