//! Single experiment on the scripted engine.
//!
//! Usage: simonfx [name=value ...]
//!
//! Overrides come from `PARAMS` first, then the command line. Epochs,
//! sessions and output mode follow `Config::from_env`.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;

use simonfx::config::Config;
use simonfx::engine::scripted::ScriptedEngine;
use simonfx::logging::{self, obj, params_hash, v_str, Domain, Level};
use simonfx::params::{parse_assignment, sweep_key};
use simonfx::storage::ParamLog;
use simonfx::sweep::{persist, run_simulation, OutputMode};

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let mut overrides = cfg.overrides().context("parsing PARAMS")?;
    for arg in std::env::args().skip(1) {
        overrides.push(parse_assignment(&arg).with_context(|| format!("argument '{}'", arg))?);
    }
    let plan = cfg.plan().context("parsing SCHEDULE")?;
    let key = sweep_key(&overrides);

    logging::log(
        Level::Info,
        Domain::System,
        "experiment_start",
        obj(&[
            ("model", v_str(&plan.model)),
            ("config", v_str(&key)),
            ("params_hash", v_str(&params_hash(&key))),
            ("epochs", json!(plan.epochs)),
            ("sessions", json!(plan.sessions)),
        ]),
    );

    let mut engine = ScriptedEngine::new(cfg.policy());
    let result = run_simulation(&mut engine, &plan, &overrides)
        .with_context(|| format!("configuration [{}]", key))?;

    if cfg.output != OutputMode::None {
        std::fs::create_dir_all(&cfg.out_dir)?;
        if let Some(parent) = Path::new(&cfg.sqlite_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut store = ParamLog::new(&cfg.sqlite_path)?;
        store.init()?;
        persist(&result, &mut store, &cfg.out_dir, cfg.output)?;
    }

    for (epoch, session, stats) in &result.stats {
        println!("epoch {} session {}", epoch, session);
        println!("{}", stats);
    }
    if result.incomplete_sessions > 0 {
        eprintln!("{} session(s) ended early", result.incomplete_sessions);
    }
    Ok(())
}
