//! Cartesian parameter sweep on scripted engines.
//!
//! Usage: sweep [name=v1,v2,... ...]
//!
//! Without axes the default grid runs (motivation × initial cost × cue
//! validity). Configurations already in the parameter log are skipped.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;

use simonfx::config::Config;
use simonfx::engine::scripted::ScriptedFactory;
use simonfx::logging::{self, obj, v_num, v_str, Domain, Level};
use simonfx::storage::ParamLog;
use simonfx::sweep::{run_sweep, ParamGrid};

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let grid = if args.is_empty() {
        ParamGrid::default_grid()
    } else {
        ParamGrid::parse(&args).context("parsing grid axes")?
    };
    let plan = cfg.plan().context("parsing SCHEDULE")?;

    std::fs::create_dir_all(&cfg.out_dir)?;
    if let Some(parent) = Path::new(&cfg.sqlite_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut store = ParamLog::new(&cfg.sqlite_path)
        .with_context(|| format!("opening {}", cfg.sqlite_path))?;
    store.init()?;

    let factory = ScriptedFactory {
        policy: cfg.policy(),
    };
    let started = Instant::now();
    let report = run_sweep(
        &factory,
        &plan,
        &grid,
        &mut store,
        &cfg.out_dir,
        cfg.output,
        cfg.threads,
    )?;

    logging::log(
        Level::Info,
        Domain::System,
        "sweep_summary",
        obj(&[
            ("model", v_str(&plan.model)),
            ("planned", json!(report.planned)),
            ("completed", json!(report.completed.len())),
            ("skipped", json!(report.skipped.len())),
            ("failed", json!(report.failed.len())),
            ("elapsed_s", v_num(started.elapsed().as_secs_f64())),
        ]),
    );
    for (key, err) in &report.failed {
        eprintln!("failed [{}]: {}", key, err);
    }
    println!("{}", report);
    Ok(())
}
