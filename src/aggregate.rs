//! Session aggregation: per-trial summary table, rule-firing trace table and
//! per-condition statistics.
//!
//! Columns are fixed by the rule set before any row is built, so a trial
//! that is missing a snapshot or a trace entry still yields a full-width row
//! with nulls in the gaps.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{persistence_conflict, TaskResult};
use crate::logging::{self, obj, Domain, Level};
use crate::instrument::{column_suffix, ProductionRecord, RewardRecord, RuleSet};
use crate::stimulus::Condition;
use crate::task::SessionRecord;
use crate::trial::Trial;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Int(i64),
    Num(f64),
    Text(String),
}

impl Cell {
    pub fn num(value: Option<f64>) -> Self {
        value.map(Cell::Num).unwrap_or(Cell::Null)
    }

    pub fn text(value: &str) -> Self {
        Cell::Text(value.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Nulls sort last; numbers before text.
    pub fn compare(&self, other: &Cell) -> Ordering {
        match (self, other) {
            (Cell::Null, Cell::Null) => Ordering::Equal,
            (Cell::Null, _) => Ordering::Greater,
            (_, Cell::Null) => Ordering::Less,
            (Cell::Text(a), Cell::Text(b)) => a.cmp(b),
            (Cell::Text(_), _) => Ordering::Greater,
            (_, Cell::Text(_)) => Ordering::Less,
            (a, b) => a
                .as_f64()
                .unwrap_or(f64::NAN)
                .total_cmp(&b.as_f64().unwrap_or(f64::NAN)),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Num(v) => write!(f, "{}", v),
            Cell::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Cell> {
        let col = self.column(column)?;
        self.rows.get(row)?.get(col)
    }

    pub fn values(&self, column: &str) -> Vec<&Cell> {
        match self.column(column) {
            Some(col) => self.rows.iter().filter_map(|r| r.get(col)).collect(),
            None => Vec::new(),
        }
    }

    /// Rows shorter than the header are padded with nulls.
    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        row.resize(self.columns.len(), Cell::Null);
        self.rows.push(row);
    }

    /// Copy with `prefix` columns inserted in front of every row.
    pub fn with_prefix(&self, prefix: &[(&str, Cell)]) -> Table {
        let mut columns: Vec<String> = prefix.iter().map(|(name, _)| name.to_string()).collect();
        columns.extend(self.columns.iter().cloned());
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut out: Vec<Cell> = prefix.iter().map(|(_, v)| v.clone()).collect();
                out.extend(row.iter().cloned());
                out
            })
            .collect();
        Table { columns, rows }
    }

    /// Stacks tables sharing one header. An empty input gives an empty table.
    pub fn concat(tables: Vec<Table>) -> TaskResult<Table> {
        let mut iter = tables.into_iter();
        let mut out = match iter.next() {
            Some(first) => first,
            None => return Ok(Table::default()),
        };
        for table in iter {
            if table.columns != out.columns {
                return Err(persistence_conflict(format!(
                    "cannot stack tables with headers [{}] and [{}]",
                    out.columns.join(","),
                    table.columns.join(",")
                )));
            }
            out.rows.extend(table.rows);
        }
        Ok(out)
    }

    /// Stable sort on the named columns; unknown names are ignored.
    pub fn sort_by(&mut self, keys: &[&str]) {
        let cols: Vec<usize> = keys.iter().filter_map(|k| self.column(k)).collect();
        self.rows.sort_by(|a, b| {
            cols.iter()
                .map(|&c| a[c].compare(&b[c]))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }
}

// =============================================================================
// Summary table
// =============================================================================

pub fn summary_columns(rules: &RuleSet) -> Vec<String> {
    let mut columns: Vec<String> = [
        "trial",
        "onset_time",
        "accuracy",
        "pre_trial_accuracy",
        "response_time",
        "response",
        "condition_stimulus",
        "condition_cue",
        "stimulus_shape",
        "stimulus_location",
        "cue_location",
        "check_count",
        "check_time",
        "motivation",
        "cost",
        "rewarded_time",
        "reward_rule",
        "delivered_reward",
        "passed_time",
        "received_reward",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    columns.extend(rules.check_branch.iter().map(|r| format!("u_{}", column_suffix(r))));
    columns
}

/// One summary row. `previous` is the trial before this one in the session.
pub fn summary_row(
    trial: &Trial,
    previous: Option<&Trial>,
    motivation: f64,
    rules: &RuleSet,
) -> Vec<Cell> {
    let s = &trial.stimulus;
    let pre = match previous {
        Some(p) if p.accuracy() => Cell::text("post-correct"),
        Some(_) => Cell::text("post-error"),
        None => Cell::text("NA"),
    };
    let reward = trial.expected_reward.as_ref();
    let mut row = vec![
        Cell::Int(trial.index as i64 + 1),
        Cell::Num(trial.onset),
        Cell::Num(if trial.accuracy() { 1.0 } else { 0.0 }),
        pre,
        Cell::num(trial.response_time()),
        trial.response.as_deref().map(Cell::text).unwrap_or(Cell::Null),
        Cell::text(s.kind()),
        Cell::text(s.cue_kind()),
        Cell::text(s.shape.as_str()),
        Cell::text(s.location.as_str()),
        Cell::text(s.cue.as_str()),
        Cell::Int(trial.check_count as i64),
        Cell::Num(trial.check_time()),
        Cell::Num(motivation),
        Cell::num(trial.cost),
        Cell::num(reward.map(|r| r.rewarded_time)),
        reward.map(|r| Cell::text(&r.rule)).unwrap_or(Cell::Null),
        Cell::num(reward.map(|r| r.delivered)),
        Cell::num(reward.map(|r| r.elapsed)),
        Cell::num(reward.map(|r| r.received)),
    ];
    row.extend(
        rules
            .check_branch
            .iter()
            .map(|r| Cell::num(trial.check_utility.get(r).copied())),
    );
    row
}

pub fn summary_table(record: &SessionRecord) -> Table {
    let mut table = Table::new(summary_columns(&record.rules));
    let mut previous: Option<&Trial> = None;
    for trial in &record.log {
        table.push_row(summary_row(trial, previous, record.motivation, &record.rules));
        previous = Some(trial);
    }
    table
}

// =============================================================================
// Trace table
// =============================================================================

pub fn trace_columns(rules: &RuleSet) -> Vec<String> {
    let mut columns: Vec<String> = [
        "trial",
        "production",
        "fired_time",
        "rewarded_time",
        "delivered_reward",
        "passed_time",
        "received_reward",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    columns.extend(rules.process.iter().map(|r| format!("u_{}", column_suffix(r))));
    columns.extend(rules.memory_items.iter().map(|c| format!("act_{}", column_suffix(c))));
    columns.push("motivation".to_string());
    columns
}

/// Rows for one trial: firings and rewards of each rule paired by arrival
/// order (outer join), then widened with that trial's snapshot, if any.
pub fn trace_rows(
    trial_index: usize,
    productions: &[&ProductionRecord],
    rewards: &[&RewardRecord],
    snapshot: Option<&Trial>,
    motivation: f64,
    rules: &RuleSet,
) -> Vec<Vec<Cell>> {
    let mut by_rule: BTreeMap<&str, (Vec<&ProductionRecord>, Vec<&RewardRecord>)> =
        BTreeMap::new();
    for p in productions {
        by_rule.entry(p.rule.as_str()).or_default().0.push(p);
    }
    for r in rewards {
        by_rule.entry(r.rule.as_str()).or_default().1.push(r);
    }

    let wide: Vec<Cell> = rules
        .process
        .iter()
        .map(|r| Cell::num(snapshot.and_then(|t| t.utility.get(r).copied())))
        .chain(
            rules
                .memory_items
                .iter()
                .map(|c| Cell::num(snapshot.and_then(|t| t.activation.get(c).copied()))),
        )
        .collect();

    let mut rows = Vec::new();
    for (rule, (fired, rewarded)) in by_rule {
        for i in 0..fired.len().max(rewarded.len()) {
            let f = fired.get(i);
            let r = rewarded.get(i);
            let mut row = vec![
                Cell::Int(trial_index as i64 + 1),
                Cell::text(rule),
                Cell::num(f.map(|p| p.time)),
                Cell::num(r.map(|r| r.time)),
                Cell::num(r.map(|r| r.delivered)),
                Cell::num(r.map(|r| r.elapsed)),
                Cell::num(r.map(|r| r.received)),
            ];
            row.extend(wide.iter().cloned());
            row.push(Cell::Num(motivation));
            rows.push(row);
        }
    }
    rows
}

pub fn trace_table(record: &SessionRecord) -> Table {
    let mut table = Table::new(trace_columns(&record.rules));
    let trials: BTreeSet<usize> = record
        .productions
        .iter()
        .map(|p| p.trial)
        .chain(record.rewards.iter().map(|r| r.trial))
        .collect();
    let snapshots: HashMap<usize, &Trial> = record.log.iter().map(|t| (t.index, t)).collect();

    for trial in trials {
        let productions: Vec<&ProductionRecord> =
            record.productions.iter().filter(|p| p.trial == trial).collect();
        let rewards: Vec<&RewardRecord> =
            record.rewards.iter().filter(|r| r.trial == trial).collect();
        for row in trace_rows(
            trial,
            &productions,
            &rewards,
            snapshots.get(&trial).copied(),
            record.motivation,
            &record.rules,
        ) {
            table.push_row(row);
        }
    }
    table
}

// =============================================================================
// Multi-session concatenation
// =============================================================================

/// Stacks per-session tables tagged with epoch and session numbers, ordered
/// by (epoch, session, trial).
pub fn combine_sessions(tables: Vec<(usize, usize, Table)>) -> TaskResult<Table> {
    let tagged: Vec<Table> = tables
        .into_iter()
        .map(|(epoch, session, table)| {
            table.with_prefix(&[
                ("epoch", Cell::Int(epoch as i64)),
                ("session", Cell::Int(session as i64)),
            ])
        })
        .collect();
    let sessions = tagged.len();
    let mut out = Table::concat(tagged)?;
    out.sort_by(&["epoch", "session", "trial"]);
    logging::log(
        Level::Debug,
        Domain::Aggregate,
        "sessions_combined",
        obj(&[
            ("sessions", json!(sessions)),
            ("rows", json!(out.len())),
            ("columns", json!(out.columns.len())),
        ]),
    );
    Ok(out)
}

// =============================================================================
// Condition statistics
// =============================================================================

/// Per-quadrant means. `None` is the not-available marker for quadrants
/// without trials (or without any response for response time).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionSummary {
    pub condition: Condition,
    pub trials: usize,
    pub accuracy: Option<f64>,
    pub response_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub conditions: Vec<ConditionSummary>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

pub fn run_stats(trials: &[Trial]) -> RunStats {
    let conditions = Condition::ALL
        .iter()
        .map(|&condition| {
            let bucket: Vec<&Trial> = trials
                .iter()
                .filter(|t| t.stimulus.condition() == condition)
                .collect();
            ConditionSummary {
                condition,
                trials: bucket.len(),
                accuracy: mean(bucket.iter().map(|t| if t.accuracy() { 1.0 } else { 0.0 })),
                response_time: mean(bucket.iter().filter_map(|t| t.response_time())),
            }
        })
        .collect();
    RunStats { conditions }
}

impl RunStats {
    pub fn get(&self, condition: Condition) -> Option<&ConditionSummary> {
        self.conditions.iter().find(|c| c.condition == condition)
    }
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "NA".to_string(),
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<20} {:>6} {:>8} {:>8}", "condition", "n", "acc", "rt")?;
        for c in &self.conditions {
            writeln!(
                f,
                "{:<20} {:>6} {:>8} {:>8}",
                c.condition.label(),
                c.trials,
                fmt_opt(c.accuracy, 2),
                fmt_opt(c.response_time, 3)
            )?;
        }
        Ok(())
    }
}

/// Multi-line condition summary for console output.
pub fn format_stats(trials: &[Trial]) -> String {
    run_stats(trials).to_string()
}
