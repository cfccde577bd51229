use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::aggregate::RunStats;
use crate::error::TaskResult;
use crate::logging;

/// One row of the parameter log: the parameters in effect for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRecord {
    pub run_suffix: String,
    pub sweep_key: String,
    pub epoch: usize,
    pub session: usize,
    pub params: Map<String, Value>,
    pub planned: usize,
    pub completed: usize,
    pub stale_events: u64,
}

/// SQLite-backed log of completed configurations, also used to skip
/// configurations a sweep has already covered.
pub struct ParamLog {
    conn: Connection,
}

impl ParamLog {
    pub fn new(path: &str) -> TaskResult<Self> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn in_memory() -> TaskResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn init(&mut self) -> TaskResult<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS param_log (
                ts TEXT NOT NULL,
                run_suffix TEXT NOT NULL,
                sweep_key TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                session INTEGER NOT NULL,
                params TEXT NOT NULL,
                planned INTEGER NOT NULL,
                completed INTEGER NOT NULL,
                stale_events INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS param_log_key ON param_log (sweep_key);
            CREATE TABLE IF NOT EXISTS condition_stats (
                run_suffix TEXT NOT NULL,
                sweep_key TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                session INTEGER NOT NULL,
                condition TEXT NOT NULL,
                trials INTEGER NOT NULL,
                accuracy REAL,
                response_time REAL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Writes one finished simulation in a single transaction: condition
    /// stats first, then the parameter rows that mark the configuration as
    /// done. Nothing is kept if any insert fails.
    pub fn record_run(
        &mut self,
        run_suffix: &str,
        sweep_key: &str,
        records: &[ParamRecord],
        stats: &[(usize, usize, RunStats)],
    ) -> TaskResult<()> {
        let ts = logging::ts_now();
        let tx = self.conn.transaction()?;
        for (epoch, session, run) in stats {
            for c in &run.conditions {
                tx.execute(
                    "INSERT INTO condition_stats
                     (run_suffix, sweep_key, epoch, session, condition, trials, accuracy, response_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        run_suffix,
                        sweep_key,
                        *epoch as i64,
                        *session as i64,
                        c.condition.label(),
                        c.trials as i64,
                        c.accuracy,
                        c.response_time
                    ],
                )?;
            }
        }
        for r in records {
            tx.execute(
                "INSERT INTO param_log
                 (ts, run_suffix, sweep_key, epoch, session, params, planned, completed, stale_events)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    ts,
                    r.run_suffix,
                    r.sweep_key,
                    r.epoch as i64,
                    r.session as i64,
                    Value::Object(r.params.clone()).to_string(),
                    r.planned as i64,
                    r.completed as i64,
                    r.stale_events as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Exact match on the swept tuple.
    pub fn contains(&self, sweep_key: &str) -> TaskResult<bool> {
        let hit: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM param_log WHERE sweep_key = ?1 LIMIT 1",
                params![sweep_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn len(&self) -> TaskResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM param_log", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> TaskResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Stored `(condition, trials, accuracy, response_time)` rows for one run.
    pub fn condition_stats(
        &self,
        run_suffix: &str,
    ) -> TaskResult<Vec<(String, usize, Option<f64>, Option<f64>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT condition, trials, accuracy, response_time FROM condition_stats
             WHERE run_suffix = ?1 ORDER BY epoch, session, rowid",
        )?;
        let rows = stmt
            .query_map(params![run_suffix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as usize,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
