//! Per-trial record and the phase enum of the trial state machine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::stimulus::StimulusSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fixation,
    Cue,
    Stimulus,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fixation => "fixation",
            Phase::Cue => "cue",
            Phase::Stimulus => "stimulus",
            Phase::Done => "done",
        }
    }

    /// Goal-buffer step marker the engine must show before this phase may
    /// start. `None` means the goal step is empty.
    pub fn expected_marker(&self) -> Option<&'static str> {
        match self {
            Phase::Fixation | Phase::Done => None,
            Phase::Cue => Some("ATTEND-CUE"),
            Phase::Stimulus => Some("ATTEND-STIMULUS"),
        }
    }

    pub fn marker_matches(&self, marker: Option<&str>) -> bool {
        match (self.expected_marker(), marker) {
            (None, None) => true,
            (Some(expected), Some(seen)) => expected.eq_ignore_ascii_case(seen),
            _ => false,
        }
    }
}

/// First reward seen for a checking-branch rule within a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedReward {
    pub rewarded_time: f64,
    pub rule: String,
    pub delivered: f64,
    pub elapsed: f64,
    pub received: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub index: usize,
    pub stimulus: StimulusSpec,
    pub onset: f64,
    pub offset: Option<f64>,
    pub response: Option<String>,
    pub responded: bool,
    pub check_count: u32,
    pub check_onset: f64,
    pub check_offset: f64,
    pub detected_problem: bool,
    pub cost: Option<f64>,
    pub utility: BTreeMap<String, f64>,
    pub check_utility: BTreeMap<String, f64>,
    pub activation: BTreeMap<String, f64>,
    pub expected_reward: Option<ExpectedReward>,
}

impl Trial {
    pub fn new(index: usize, stimulus: StimulusSpec) -> Self {
        Self {
            index,
            stimulus,
            onset: 0.0,
            offset: None,
            response: None,
            responded: false,
            check_count: 0,
            check_onset: 0.0,
            check_offset: 0.0,
            detected_problem: false,
            cost: None,
            utility: BTreeMap::new(),
            check_utility: BTreeMap::new(),
            activation: BTreeMap::new(),
            expected_reward: None,
        }
    }

    pub fn correct_response(&self) -> &'static str {
        self.stimulus.expected_response()
    }

    pub fn accuracy(&self) -> bool {
        self.response.as_deref() == Some(self.correct_response())
    }

    /// Seconds from stimulus onset to the key press; `None` without one.
    pub fn response_time(&self) -> Option<f64> {
        self.offset.map(|offset| offset - self.onset)
    }

    /// Verification span, never negative.
    pub fn check_time(&self) -> f64 {
        (self.check_offset - self.check_onset).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::{Location, Shape};

    fn circle_left() -> StimulusSpec {
        StimulusSpec::new(Shape::Circle, Location::Left, Location::Left)
    }

    #[test]
    fn test_marker_matching() {
        assert!(Phase::Fixation.marker_matches(None));
        assert!(!Phase::Fixation.marker_matches(Some("ATTEND-CUE")));
        assert!(Phase::Cue.marker_matches(Some("attend-cue")));
        assert!(!Phase::Stimulus.marker_matches(Some("ATTEND-CUE")));
        assert!(!Phase::Stimulus.marker_matches(None));
    }

    #[test]
    fn test_accuracy_and_rt() {
        let mut trial = Trial::new(0, circle_left());
        assert!(!trial.accuracy());
        assert_eq!(trial.response_time(), None);

        trial.onset = 10.0;
        trial.offset = Some(10.45);
        trial.response = Some("f".into());
        assert!(trial.accuracy());
        assert!((trial.response_time().unwrap() - 0.45).abs() < 1e-9);

        trial.response = Some("j".into());
        assert!(!trial.accuracy());
    }

    #[test]
    fn test_check_time_clamped() {
        let mut trial = Trial::new(0, circle_left());
        assert_eq!(trial.check_time(), 0.0);
        trial.check_onset = 2.0;
        trial.check_offset = 1.5;
        assert_eq!(trial.check_time(), 0.0);
    }
}
