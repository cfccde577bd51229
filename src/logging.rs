//! Structured logging for simulation runs.
//!
//! Every record is one JSON line carrying run id, sequence number, level,
//! domain and a free-form `data` object. Records go to `events.jsonl`
//! (info and above) or `trace.jsonl` (trace/debug) under
//! `$LOG_DIR/$RUN_ID/`, and are echoed to stdout unless `LOG_STDOUT=0`.
//!
//! Verbose trace mode is `LOG_LEVEL=trace`: stale instrumentation events and
//! per-trial banners only show up there.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Task,       // Phase transitions, trial lifecycle
    Instrument, // Rule firings, rewards, stale events
    Cost,       // Adaptive cost updates
    Aggregate,  // Table building, condition stats
    Sweep,      // Grid expansion, dedup, epochs
    Storage,    // Parameter log, CSV export
    Engine,     // Host setup, model loading
    System,     // Startup, shutdown
    Profile,    // Timing scopes
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Task => "task",
            Domain::Instrument => "instrument",
            Domain::Cost => "cost",
            Domain::Aggregate => "aggregate",
            Domain::Sweep => "sweep",
            Domain::Storage => "storage",
            Domain::Engine => "engine",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sequence counter and run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
    echo: bool,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let echo = !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false"));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        if base == "none" {
            return RunContext {
                run_id,
                events: None,
                trace: None,
                echo,
            };
        }

        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
            echo,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["run_suffix", "epoch", "session", "trial", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub fn enabled(level: Level, domain: Domain) -> bool {
    level >= Level::from_env() && domain.is_enabled()
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if !enabled(level, domain) {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.echo {
        println!("{}", line);
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_trial_start(trial: usize, condition: &str, shape: &str, location: &str, cue: &str) {
    log(
        Level::Trace,
        Domain::Task,
        "trial_start",
        obj(&[
            ("trial", json!(trial)),
            ("condition", v_str(condition)),
            ("shape", v_str(shape)),
            ("location", v_str(location)),
            ("cue", v_str(cue)),
        ]),
    );
}

pub fn log_trial_end(trial: usize, global_trial: u64, accuracy: f64, response_time: Option<f64>) {
    log(
        Level::Debug,
        Domain::Task,
        "trial_end",
        obj(&[
            ("trial", json!(trial)),
            ("global_trial", json!(global_trial)),
            ("accuracy", v_num(accuracy)),
            ("response_time", response_time.map(v_num).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_stale_event(event_trial: usize, current_trial: usize, kind: &str, rule: &str) {
    log(
        Level::Trace,
        Domain::Instrument,
        "stale_event",
        obj(&[
            ("event_trial", json!(event_trial)),
            ("trial", json!(current_trial)),
            ("kind", v_str(kind)),
            ("rule", v_str(rule)),
        ]),
    );
}

pub fn log_cost_update(global_trial: u64, old_cost: f64, new_cost: f64) {
    log(
        Level::Debug,
        Domain::Cost,
        "cost_update",
        obj(&[
            ("global_trial", json!(global_trial)),
            ("old_cost", v_num(old_cost)),
            ("new_cost", v_num(new_cost)),
        ]),
    );
}

pub fn log_session_summary(
    epoch: usize,
    session: usize,
    planned: usize,
    completed: usize,
    stale_events: u64,
    mean_accuracy: Option<f64>,
) {
    let level = if completed < planned { Level::Warn } else { Level::Info };
    log(
        level,
        Domain::Task,
        "session_summary",
        obj(&[
            ("epoch", json!(epoch)),
            ("session", json!(session)),
            ("planned", json!(planned)),
            ("completed", json!(completed)),
            ("stale_events", json!(stale_events)),
            ("mean_accuracy", mean_accuracy.map(v_num).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_config_failure(config: &str, error: &str) {
    log(
        Level::Error,
        Domain::Sweep,
        "config_failed",
        obj(&[("config", v_str(config)), ("error", v_str(error))]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Stable short fingerprint of a string (first 16 hex chars of SHA-256).
pub fn params_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            context: None,
            started: Instant::now(),
        }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self {
            label,
            context: Some(obj(fields)),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !enabled(Level::Trace, Domain::Profile) {
            return;
        }
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(self.elapsed_ms()));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_params_hash_deterministic() {
        let h1 = params_hash("motivation=1;init_cost=0.05");
        let h2 = params_hash("motivation=1;init_cost=0.05");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn test_params_hash_different_inputs() {
        assert_ne!(params_hash("motivation=1"), params_hash("motivation=2"));
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_split_fields_lifts_correlation_keys() {
        let (top, data) = split_fields(obj(&[
            ("trial", json!(3)),
            ("msg", v_str("hello")),
            ("cost", v_num(0.05)),
        ]));
        assert!(top.contains_key("trial"));
        assert!(top.contains_key("msg"));
        assert!(data.contains_key("cost"));
        assert!(!data.contains_key("trial"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
