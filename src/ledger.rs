//! Durable log of every unit of work.
//!
//! Every mutation is a conditional write keyed by `activity_id` and the
//! expected current status, checked through the affected-row count. That is
//! the only concurrency-control primitive the pipeline uses: workers racing
//! on the same activity, duplicate completion events and late finishes all
//! collapse to a failed compare-and-set, which gives at-most-once stage
//! advancement without a lock service.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;

use crate::models::activity::{Activity, ActivityAction, ActivityStatus};

pub struct ActivityLedger {
    conn: Mutex<Connection>,
}

/// Outcome of a retry request for a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry budget left: reset to NOTDONE for re-dispatch.
    Requeued,
    /// Budget exhausted: marked ERROR terminally.
    Exhausted,
}

/// Per-(cube, tile, period) counts of one stage, used by the barrier.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageCounts {
    pub total: usize,
    pub done: usize,
    pub error: usize,
}

impl StageCounts {
    pub fn all_terminal(&self) -> bool {
        self.total > 0 && self.done + self.error == self.total
    }
}

impl ActivityLedger {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let ledger = Self { conn: Mutex::new(conn) };
        ledger.run_migrations()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn: Mutex::new(conn) };
        ledger.run_migrations()?;
        Ok(ledger)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS activities (
                activity_id TEXT PRIMARY KEY,
                action      TEXT NOT NULL CHECK(action IN ('merge','blend','publish')),
                datacube_id TEXT NOT NULL,
                tile_id     TEXT NOT NULL,
                band        TEXT,
                period      TEXT,
                mystatus    TEXT NOT NULL DEFAULT 'NOTDONE'
                            CHECK(mystatus IN ('NOTDONE','DOING','DONE','ERROR')),
                mylaunch    TEXT,
                myend       TEXT,
                retries     INTEGER NOT NULL DEFAULT 0,
                error_msg   TEXT,
                dispatched  INTEGER NOT NULL DEFAULT 0,
                activity    TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_activities_cube
                ON activities(datacube_id, mystatus);
            CREATE INDEX IF NOT EXISTS idx_activities_group
                ON activities(datacube_id, tile_id, period, action);

            CREATE TABLE IF NOT EXISTS stage_gates (
                datacube_id TEXT NOT NULL,
                tile_id     TEXT NOT NULL,
                period      TEXT NOT NULL,
                stage       TEXT NOT NULL,
                advanced    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (datacube_id, tile_id, period, stage)
            );
            ",
        )?;
        Ok(())
    }

    // ── Registration ──

    /// Idempotent insert: an activity re-submitted with the same
    /// deterministic id is left untouched. Returns true if newly created.
    pub fn register(&self, activity: &Activity) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO activities
                (activity_id, action, datacube_id, tile_id, band, period, mystatus, activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'NOTDONE', ?7)",
            params![
                activity.activity_id,
                activity.action.as_str(),
                activity.datacube_id,
                activity.tile_id,
                activity.band,
                activity.period,
                activity.activity.to_string()
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get(&self, activity_id: &str) -> anyhow::Result<Option<Activity>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {ACTIVITY_COLS} FROM activities WHERE activity_id = ?1"),
                params![activity_id],
                map_activity,
            )
            .optional()?;
        Ok(row)
    }

    pub fn status(&self, activity_id: &str) -> anyhow::Result<Option<ActivityStatus>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT mystatus FROM activities WHERE activity_id = ?1",
                params![activity_id],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(row.and_then(|s| ActivityStatus::parse(&s)))
    }

    // ── Status transitions (all compare-and-set) ──

    /// NOTDONE -> DOING. False means someone else claimed it, it was
    /// cancelled, or it is already terminal.
    pub fn claim(&self, activity_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE activities SET mystatus = 'DOING', mylaunch = ?2, error_msg = NULL
             WHERE activity_id = ?1 AND mystatus = 'NOTDONE'",
            params![activity_id, now()],
        )?;
        Ok(n > 0)
    }

    /// DOING -> DONE. False on a lost race or cancellation; the caller must
    /// then treat its own work as a no-op.
    pub fn complete(&self, activity_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE activities SET mystatus = 'DONE', myend = ?2
             WHERE activity_id = ?1 AND mystatus = 'DOING'",
            params![activity_id, now()],
        )?;
        Ok(n > 0)
    }

    /// Terminal failure from any non-terminal status.
    pub fn fail(&self, activity_id: &str, reason: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE activities SET mystatus = 'ERROR', myend = ?2, error_msg = ?3
             WHERE activity_id = ?1 AND mystatus IN ('NOTDONE','DOING')",
            params![activity_id, now(), reason],
        )?;
        Ok(n > 0)
    }

    /// Update the stored payload (merge statistics recorded on completion).
    pub fn update_payload(&self, activity_id: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE activities SET activity = ?2 WHERE activity_id = ?1",
            params![activity_id, payload.to_string()],
        )?;
        Ok(())
    }

    /// Transient failure: consume one retry if budget remains, otherwise
    /// demote to terminal ERROR.
    pub fn retry(&self, activity_id: &str, max_retries: u32, reason: &str) -> anyhow::Result<RetryDecision> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE activities
             SET mystatus = 'NOTDONE', dispatched = 0, retries = retries + 1, error_msg = ?3
             WHERE activity_id = ?1 AND mystatus = 'DOING' AND retries < ?2",
            params![activity_id, max_retries, reason],
        )?;
        if n > 0 {
            return Ok(RetryDecision::Requeued);
        }
        conn.execute(
            "UPDATE activities SET mystatus = 'ERROR', myend = ?2, error_msg = ?3
             WHERE activity_id = ?1 AND mystatus = 'DOING'",
            params![activity_id, now(), format!("retries exhausted: {reason}")],
        )?;
        Ok(RetryDecision::Exhausted)
    }

    /// Explicit `force` path: the only legal DONE/ERROR -> NOTDONE
    /// transition. Resets every activity of the cube pair touching the
    /// given periods, and reopens the matching stage gates.
    pub fn force_reset(&self, datacube_ids: &[String], periods: &[String]) -> anyhow::Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut reset = 0;
        for cube in datacube_ids {
            for period in periods {
                reset += tx.execute(
                    "UPDATE activities
                     SET mystatus = 'NOTDONE', dispatched = 0, retries = 0,
                         mylaunch = NULL, myend = NULL, error_msg = NULL
                     WHERE datacube_id = ?1 AND period = ?2",
                    params![cube, period],
                )?;
                tx.execute(
                    "UPDATE stage_gates SET advanced = 0
                     WHERE datacube_id = ?1 AND period = ?2",
                    params![cube, period],
                )?;
            }
        }
        tx.commit()?;
        Ok(reset)
    }

    /// Abort a build: every non-terminal activity of the cube pair goes to
    /// ERROR("cancelled"). In-flight workers observe the failed CAS on
    /// their next write and skip the artifact.
    pub fn cancel(&self, datacube_ids: &[String]) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut cancelled = 0;
        for cube in datacube_ids {
            cancelled += conn.execute(
                "UPDATE activities SET mystatus = 'ERROR', myend = ?2, error_msg = 'cancelled'
                 WHERE datacube_id = ?1 AND mystatus IN ('NOTDONE','DOING')",
                params![cube, now()],
            )?;
        }
        Ok(cancelled)
    }

    // ── Dispatch bookkeeping ──

    /// Guard against double queue submission: flips `dispatched` 0 -> 1 for
    /// a NOTDONE activity. The flag is internal and cleared on retry/force.
    pub fn mark_dispatched(&self, activity_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE activities SET dispatched = 1
             WHERE activity_id = ?1 AND dispatched = 0 AND mystatus = 'NOTDONE'",
            params![activity_id],
        )?;
        Ok(n > 0)
    }

    /// NOTDONE work not yet handed to a lane, oldest registration first.
    pub fn undispatched(&self, action: ActivityAction, limit: usize) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT activity_id FROM activities
             WHERE action = ?1 AND mystatus = 'NOTDONE' AND dispatched = 0
             ORDER BY rowid LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![action.as_str(), limit as i64], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Barrier support ──

    pub fn stage_counts(
        &self,
        datacube_id: &str,
        tile_id: &str,
        period: &str,
        action: ActivityAction,
    ) -> anyhow::Result<StageCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT mystatus, COUNT(*) FROM activities
             WHERE datacube_id = ?1 AND tile_id = ?2 AND period = ?3 AND action = ?4
             GROUP BY mystatus",
        )?;
        let mut counts = StageCounts::default();
        let rows = stmt.query_map(params![datacube_id, tile_id, period, action.as_str()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (status, n) = row?;
            counts.total += n;
            match status.as_str() {
                "DONE" => counts.done += n,
                "ERROR" => counts.error += n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// One-shot gate per (cube, tile, period, stage). The first caller after
    /// stage completion wins; concurrent completions of the last two
    /// siblings cannot advance the pipeline twice.
    pub fn try_advance_gate(
        &self,
        datacube_id: &str,
        tile_id: &str,
        period: &str,
        stage: &str,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO stage_gates (datacube_id, tile_id, period, stage, advanced)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![datacube_id, tile_id, period, stage],
        )?;
        let n = conn.execute(
            "UPDATE stage_gates SET advanced = 1
             WHERE datacube_id = ?1 AND tile_id = ?2 AND period = ?3 AND stage = ?4
               AND advanced = 0",
            params![datacube_id, tile_id, period, stage],
        )?;
        Ok(n > 0)
    }

    // ── Queries ──

    pub fn activities_for(
        &self,
        datacube_id: &str,
        tile_id: &str,
        period: &str,
        action: ActivityAction,
    ) -> anyhow::Result<Vec<Activity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLS} FROM activities
             WHERE datacube_id = ?1 AND tile_id = ?2 AND period = ?3 AND action = ?4
             ORDER BY activity_id",
        ))?;
        let rows = stmt
            .query_map(params![datacube_id, tile_id, period, action.as_str()], map_activity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn activities_by_datacube(&self, datacube_id: &str) -> anyhow::Result<Vec<Activity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLS} FROM activities WHERE datacube_id = ?1 ORDER BY rowid",
        ))?;
        let rows = stmt
            .query_map(params![datacube_id], map_activity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest registered activity of a cube, used for build metadata.
    pub fn newest_activity(&self, datacube_id: &str) -> anyhow::Result<Option<Activity>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ACTIVITY_COLS} FROM activities
                     WHERE datacube_id = ?1 ORDER BY rowid DESC LIMIT 1",
                ),
                params![datacube_id],
                map_activity,
            )
            .optional()?;
        Ok(row)
    }

    /// Merge activities of a tile over a date window, newest period first.
    pub fn merges_in_window(
        &self,
        datacube_id: &str,
        tile_id: &str,
        start: &str,
        end: &str,
    ) -> anyhow::Result<Vec<Activity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLS} FROM activities
             WHERE datacube_id = ?1 AND tile_id = ?2 AND action = 'merge'
               AND period >= ?3 AND period <= ?4
             ORDER BY period DESC",
        ))?;
        let rows = stmt
            .query_map(params![datacube_id, tile_id, start, format!("{end}\u{ffff}")], map_activity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

const ACTIVITY_COLS: &str = "activity_id, action, datacube_id, tile_id, band, period, \
                             mystatus, mylaunch, myend, retries, error_msg, activity";

fn now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn map_activity(r: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
    let action: String = r.get(1)?;
    let status: String = r.get(6)?;
    let payload: String = r.get(11)?;
    Ok(Activity {
        activity_id: r.get(0)?,
        action: ActivityAction::parse(&action).unwrap_or(ActivityAction::Merge),
        datacube_id: r.get(2)?,
        tile_id: r.get(3)?,
        band: r.get(4)?,
        period: r.get(5)?,
        mystatus: ActivityStatus::parse(&status).unwrap_or(ActivityStatus::NotDone),
        mylaunch: r.get(7)?,
        myend: r.get(8)?,
        retries: r.get(9)?,
        error_msg: r.get(10)?,
        activity: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
    })
}

/// Wall-clock length of the union of `[launch, end]` intervals, as
/// `"H h M m S s"`. Overlapping worker intervals are merged so parallel
/// activity is not double-counted.
pub fn union_duration(mut intervals: Vec<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>) -> String {
    intervals.retain(|(s, e)| s <= e);
    intervals.sort_by_key(|(s, _)| *s);
    let mut total = chrono::Duration::zero();
    let mut current: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)> = None;
    for (s, e) in intervals {
        match current {
            Some((cs, ce)) if s <= ce => current = Some((cs, ce.max(e))),
            Some((cs, ce)) => {
                total = total + (ce - cs);
                current = Some((s, e));
            }
            None => current = Some((s, e)),
        }
    }
    if let Some((cs, ce)) = current {
        total = total + (ce - cs);
    }
    let secs = total.num_seconds().max(0);
    format!("{} h {} m {} s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::activity::activity_id;
    use chrono::TimeZone;

    fn sample(id: &str) -> Activity {
        Activity {
            activity_id: id.to_string(),
            action: ActivityAction::Merge,
            datacube_id: "mc_10".into(),
            tile_id: "003003".into(),
            band: Some("B04".into()),
            period: Some("2019-01-01_2019-01-31".into()),
            mystatus: ActivityStatus::NotDone,
            mylaunch: None,
            myend: None,
            retries: 0,
            error_msg: None,
            activity: serde_json::json!({"scene_id": "S1"}),
        }
    }

    #[test]
    fn register_is_idempotent() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        let act = sample("a1");
        assert!(ledger.register(&act).unwrap());
        assert!(!ledger.register(&act).unwrap());
        assert_eq!(ledger.status("a1").unwrap(), Some(ActivityStatus::NotDone));
    }

    #[test]
    fn transitions_are_compare_and_set() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        ledger.register(&sample("a1")).unwrap();

        // Cannot complete before claiming.
        assert!(!ledger.complete("a1").unwrap());
        assert!(ledger.claim("a1").unwrap());
        // Second claim loses the race.
        assert!(!ledger.claim("a1").unwrap());
        assert!(ledger.complete("a1").unwrap());
        // Duplicate completion is a no-op.
        assert!(!ledger.complete("a1").unwrap());
        // Terminal states are sticky without force.
        assert!(!ledger.fail("a1", "late failure").unwrap());
        assert_eq!(ledger.status("a1").unwrap(), Some(ActivityStatus::Done));
    }

    #[test]
    fn retry_consumes_budget_then_demotes() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        ledger.register(&sample("a1")).unwrap();

        for _ in 0..2 {
            assert!(ledger.claim("a1").unwrap());
            assert_eq!(
                ledger.retry("a1", 2, "timeout").unwrap(),
                RetryDecision::Requeued
            );
        }
        assert!(ledger.claim("a1").unwrap());
        assert_eq!(
            ledger.retry("a1", 2, "timeout").unwrap(),
            RetryDecision::Exhausted
        );
        let act = ledger.get("a1").unwrap().unwrap();
        assert_eq!(act.mystatus, ActivityStatus::Error);
        assert_eq!(act.retries, 2);
    }

    #[test]
    fn force_reset_reopens_terminal_rows_and_gates() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        ledger.register(&sample("a1")).unwrap();
        ledger.claim("a1").unwrap();
        ledger.complete("a1").unwrap();
        assert!(ledger
            .try_advance_gate("mc_10", "003003", "2019-01-01_2019-01-31", "merge")
            .unwrap());

        let cubes = vec!["mc_10".to_string()];
        let periods = vec!["2019-01-01_2019-01-31".to_string()];
        assert_eq!(ledger.force_reset(&cubes, &periods).unwrap(), 1);
        assert_eq!(ledger.status("a1").unwrap(), Some(ActivityStatus::NotDone));
        // Gate reopened too.
        assert!(ledger
            .try_advance_gate("mc_10", "003003", "2019-01-01_2019-01-31", "merge")
            .unwrap());
    }

    #[test]
    fn gate_advances_exactly_once() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        assert!(ledger.try_advance_gate("c", "t", "p", "merge").unwrap());
        assert!(!ledger.try_advance_gate("c", "t", "p", "merge").unwrap());
        assert!(!ledger.try_advance_gate("c", "t", "p", "merge").unwrap());
        // Distinct stage key advances independently.
        assert!(ledger.try_advance_gate("c", "t", "p", "blend").unwrap());
    }

    #[test]
    fn dispatch_flag_guards_duplicates() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        ledger.register(&sample("a1")).unwrap();
        assert_eq!(ledger.undispatched(ActivityAction::Merge, 10).unwrap(), vec!["a1"]);
        assert!(ledger.mark_dispatched("a1").unwrap());
        assert!(!ledger.mark_dispatched("a1").unwrap());
        assert!(ledger.undispatched(ActivityAction::Merge, 10).unwrap().is_empty());
    }

    #[test]
    fn cancel_marks_non_terminal_only() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        ledger.register(&sample("a1")).unwrap();
        ledger.register(&sample("a2")).unwrap();
        ledger.claim("a2").unwrap();
        ledger.complete("a2").unwrap();

        let cancelled = ledger.cancel(&["mc_10".to_string()]).unwrap();
        assert_eq!(cancelled, 1);
        let a1 = ledger.get("a1").unwrap().unwrap();
        assert_eq!(a1.mystatus, ActivityStatus::Error);
        assert_eq!(a1.error_msg.as_deref(), Some("cancelled"));
        assert_eq!(ledger.status("a2").unwrap(), Some(ActivityStatus::Done));
    }

    #[test]
    fn union_duration_merges_overlaps() {
        let t = |s: u32| Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, s).unwrap();
        // [0,10] and [5,20] overlap -> 20s; [30,40] adds 10s.
        let out = union_duration(vec![(t(0), t(10)), (t(5), t(20)), (t(30), t(40))]);
        assert_eq!(out, "0 h 0 m 30 s");
    }

    #[test]
    fn deterministic_ids_dedupe_across_requests() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        let id = activity_id(
            "mc_10",
            ActivityAction::Merge,
            "003003",
            Some("B04"),
            Some("2019-01-01_2019-01-31"),
            Some("S2A_0001"),
        );
        let mut act = sample(&id);
        act.activity_id = id.clone();
        assert!(ledger.register(&act).unwrap());
        assert!(!ledger.register(&act).unwrap());
    }
}
