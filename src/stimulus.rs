//! Simon-task stimuli and the seeded factorial generator.
//!
//! A stimulus is a shape shown at a screen location, preceded by a cue
//! pointing to one side. Circle maps to the left response key, square to the
//! right one. Congruency and cue validity are derived from those two mappings
//! and never stored.

use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{malformed_parameter, TaskResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Shape {
    Circle,
    Square,
}

impl Shape {
    /// Side whose response key is correct for this shape.
    pub fn canonical_side(&self) -> Location {
        match self {
            Shape::Circle => Location::Left,
            Shape::Square => Location::Right,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Shape::Circle => "CIRCLE",
            Shape::Square => "SQUARE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Location {
    Left,
    Right,
}

impl Location {
    pub fn response_key(&self) -> &'static str {
        match self {
            Location::Left => "f",
            Location::Right => "j",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Left => "LEFT",
            Location::Right => "RIGHT",
        }
    }
}

/// The four congruency × cue-validity quadrants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Condition {
    CongruentValid,
    CongruentInvalid,
    IncongruentValid,
    IncongruentInvalid,
}

impl Condition {
    pub const ALL: [Condition; 4] = [
        Condition::CongruentValid,
        Condition::CongruentInvalid,
        Condition::IncongruentValid,
        Condition::IncongruentInvalid,
    ];

    pub fn from_flags(congruent: bool, valid: bool) -> Self {
        match (congruent, valid) {
            (true, true) => Condition::CongruentValid,
            (true, false) => Condition::CongruentInvalid,
            (false, true) => Condition::IncongruentValid,
            (false, false) => Condition::IncongruentInvalid,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Condition::CongruentValid => "CONGRUENT-VALID",
            Condition::CongruentInvalid => "CONGRUENT-INVALID",
            Condition::IncongruentValid => "INCONGRUENT-VALID",
            Condition::IncongruentInvalid => "INCONGRUENT-INVALID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StimulusSpec {
    pub shape: Shape,
    pub location: Location,
    pub cue: Location,
}

impl StimulusSpec {
    pub const fn new(shape: Shape, location: Location, cue: Location) -> Self {
        Self { shape, location, cue }
    }

    pub fn congruent(&self) -> bool {
        self.shape.canonical_side() == self.location
    }

    pub fn incongruent(&self) -> bool {
        !self.congruent()
    }

    pub fn valid(&self) -> bool {
        self.shape.canonical_side() == self.cue
    }

    pub fn invalid(&self) -> bool {
        !self.valid()
    }

    pub fn condition(&self) -> Condition {
        Condition::from_flags(self.congruent(), self.valid())
    }

    /// "congruent" / "incongruent"
    pub fn kind(&self) -> &'static str {
        if self.congruent() {
            "congruent"
        } else {
            "incongruent"
        }
    }

    /// "valid" / "invalid"
    pub fn cue_kind(&self) -> &'static str {
        if self.valid() {
            "valid"
        } else {
            "invalid"
        }
    }

    pub fn expected_response(&self) -> &'static str {
        self.shape.canonical_side().response_key()
    }
}

impl fmt::Display for StimulusSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<[{}]'{}' at {}; cue: '{}' is [{}]>",
            self.kind(),
            self.shape.as_str(),
            self.location.as_str(),
            self.cue.as_str(),
            self.cue_kind()
        )
    }
}

use Location::{Left, Right};
use Shape::{Circle, Square};

// Valid and invalid base tuples, congruent and incongruent interleaved so any
// prefix of the cycle stays balanced across congruency.
const VALID_BASE: [StimulusSpec; 4] = [
    StimulusSpec::new(Circle, Left, Left),
    StimulusSpec::new(Circle, Right, Left),
    StimulusSpec::new(Square, Right, Right),
    StimulusSpec::new(Square, Left, Right),
];

const INVALID_BASE: [StimulusSpec; 4] = [
    StimulusSpec::new(Circle, Left, Right),
    StimulusSpec::new(Circle, Right, Right),
    StimulusSpec::new(Square, Right, Left),
    StimulusSpec::new(Square, Left, Left),
];

/// Valid and invalid trial counts: `trunc(n·p)` and `trunc(n·(1−p))`.
/// Fractional remainders are dropped, so the total may be below `n`.
pub fn trial_counts(n_trials: usize, valid_fraction: f64) -> TaskResult<(usize, usize)> {
    if !valid_fraction.is_finite() || !(0.0..=1.0).contains(&valid_fraction) {
        return Err(malformed_parameter(format!(
            "valid_cue_percentage must be within [0, 1], got {}",
            valid_fraction
        )));
    }
    let n = n_trials as f64;
    let valid = (n * valid_fraction).trunc() as usize;
    let invalid = (n * (1.0 - valid_fraction)).trunc() as usize;
    Ok((valid, invalid))
}

/// Builds the shuffled stimulus sequence. Identical `(n_trials,
/// valid_fraction, seed)` always yields the identical order.
pub fn generate_stimuli(
    n_trials: usize,
    valid_fraction: f64,
    seed: u64,
) -> TaskResult<Vec<StimulusSpec>> {
    let (valid, invalid) = trial_counts(n_trials, valid_fraction)?;
    let mut stimuli: Vec<StimulusSpec> = VALID_BASE
        .iter()
        .cycle()
        .take(valid)
        .chain(INVALID_BASE.iter().cycle().take(invalid))
        .copied()
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    stimuli.shuffle(&mut rng);
    Ok(stimuli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let s = StimulusSpec::new(Circle, Left, Left);
        assert!(s.congruent() && s.valid());
        assert_eq!(s.condition(), Condition::CongruentValid);
        assert_eq!(s.expected_response(), "f");

        let s = StimulusSpec::new(Square, Left, Left);
        assert!(s.incongruent() && s.invalid());
        assert_eq!(s.condition(), Condition::IncongruentInvalid);
        assert_eq!(s.expected_response(), "j");
    }

    #[test]
    fn test_base_tuples_match_their_quadrant() {
        for s in VALID_BASE {
            assert!(s.valid(), "{}", s);
        }
        for s in INVALID_BASE {
            assert!(s.invalid(), "{}", s);
        }
        assert_eq!(VALID_BASE.iter().filter(|s| s.congruent()).count(), 2);
        assert_eq!(INVALID_BASE.iter().filter(|s| s.congruent()).count(), 2);
    }

    #[test]
    fn test_generation_is_deterministic() {
        for (n, p, seed) in [(20, 0.5, 100), (37, 0.8, 7), (10, 0.33, 0), (1, 1.0, 42)] {
            let a = generate_stimuli(n, p, seed).unwrap();
            let b = generate_stimuli(n, p, seed).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_half_valid_counts() {
        assert_eq!(trial_counts(20, 0.5).unwrap(), (10, 10));
        let stimuli = generate_stimuli(20, 0.5, 100).unwrap();
        assert_eq!(stimuli.iter().filter(|s| s.valid()).count(), 10);
        assert_eq!(stimuli.iter().filter(|s| s.invalid()).count(), 10);
    }

    #[test]
    fn test_fractional_remainder_dropped() {
        // 3.3 -> 3 and 6.7 -> 6; rounding would give 3 + 7.
        assert_eq!(trial_counts(10, 0.33).unwrap(), (3, 6));
        assert_eq!(generate_stimuli(10, 0.33, 100).unwrap().len(), 9);
    }

    #[test]
    fn test_all_valid_balanced_congruency() {
        let stimuli = generate_stimuli(8, 1.0, 100).unwrap();
        assert_eq!(stimuli.len(), 8);
        assert!(stimuli.iter().all(|s| s.valid()));
        assert_eq!(stimuli.iter().filter(|s| s.congruent()).count(), 4);
    }

    #[test]
    fn test_zero_total_is_empty() {
        assert!(generate_stimuli(0, 0.5, 1).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_out_of_range_fraction() {
        assert!(generate_stimuli(10, 1.5, 1).is_err());
        assert!(generate_stimuli(10, f64::NAN, 1).is_err());
    }

    #[test]
    fn test_display_format() {
        let s = StimulusSpec::new(Square, Left, Right);
        assert_eq!(s.to_string(), "<[incongruent]'SQUARE' at LEFT; cue: 'RIGHT' is [valid]>");
    }
}
