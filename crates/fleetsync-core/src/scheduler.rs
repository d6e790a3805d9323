// ── Drift scheduler and trend tracker ──
//
// Schedules select devices and an interval. Every run stores a
// `DriftRun`, one report per device, and folds each drifting field into
// an open `DriftTrend` for (device, path). Trends close only when
// resolved explicitly.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::CoreError;
use crate::model::{
    BulkDriftReport, DeviceId, DriftOutcome, DriftReport, DriftReportRecord, DriftRun,
    DriftSchedule, DriftTrend, ReportId, ReportQuery, RunId, ScheduleDraft, ScheduleId, TrendId,
    TrendQuery,
};

fn next_run(from: DateTime<Utc>, interval_secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(interval_secs).ok()?;
    from.checked_add_signed(TimeDelta::try_seconds(secs)?)
}

fn validate_schedule(draft: &ScheduleDraft) -> Result<(), CoreError> {
    if draft.name.trim().is_empty() {
        return Err(CoreError::validation("schedule name is required"));
    }
    if draft.interval_secs == 0 || next_run(Utc::now(), draft.interval_secs).is_none() {
        return Err(CoreError::validation(format!(
            "schedule interval must be a positive number of seconds, got {}",
            draft.interval_secs
        )));
    }
    Ok(())
}

impl Engine {
    // ── Schedule CRUD ────────────────────────────────────────────────

    pub async fn create_schedule(&self, draft: ScheduleDraft) -> Result<DriftSchedule, CoreError> {
        validate_schedule(&draft)?;
        let now = Utc::now();
        self.inner
            .store
            .insert_schedule(DriftSchedule {
                id: ScheduleId::default(),
                name: draft.name.trim().to_owned(),
                next_run_at: if draft.enabled {
                    next_run(now, draft.interval_secs)
                } else {
                    None
                },
                device_ids: draft.device_ids,
                interval_secs: draft.interval_secs,
                enabled: draft.enabled,
                last_run_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    pub async fn update_schedule(
        &self,
        id: ScheduleId,
        draft: ScheduleDraft,
    ) -> Result<DriftSchedule, CoreError> {
        validate_schedule(&draft)?;
        let mut schedule = self.get_schedule(id).await?;
        let now = Utc::now();
        let base = schedule.last_run_at.unwrap_or(now);
        schedule.name = draft.name.trim().to_owned();
        schedule.device_ids = draft.device_ids;
        schedule.interval_secs = draft.interval_secs;
        schedule.enabled = draft.enabled;
        schedule.next_run_at = if draft.enabled {
            next_run(base, draft.interval_secs)
        } else {
            None
        };
        schedule.updated_at = now;
        self.inner.store.update_schedule(schedule).await
    }

    pub async fn get_schedule(&self, id: ScheduleId) -> Result<DriftSchedule, CoreError> {
        self.inner
            .store
            .get_schedule(id)
            .await?
            .ok_or_else(|| CoreError::not_found("schedule", id))
    }

    pub async fn list_schedules(&self) -> Result<Vec<DriftSchedule>, CoreError> {
        self.inner.store.list_schedules().await
    }

    pub async fn delete_schedule(&self, id: ScheduleId) -> Result<(), CoreError> {
        if self.inner.store.delete_schedule(id).await? {
            Ok(())
        } else {
            Err(CoreError::not_found("schedule", id))
        }
    }

    /// Flip a schedule on or off. Enabling makes it due one interval
    /// from now.
    pub async fn toggle_schedule(&self, id: ScheduleId) -> Result<DriftSchedule, CoreError> {
        let mut schedule = self.get_schedule(id).await?;
        let now = Utc::now();
        schedule.enabled = !schedule.enabled;
        schedule.next_run_at = if schedule.enabled {
            next_run(now, schedule.interval_secs)
        } else {
            None
        };
        schedule.updated_at = now;
        self.inner.store.update_schedule(schedule).await
    }

    // ── Runs ─────────────────────────────────────────────────────────

    /// Run one schedule now, regardless of when it is due.
    pub async fn run_schedule(&self, id: ScheduleId) -> Result<DriftRun, CoreError> {
        let schedule = self.get_schedule(id).await?;
        let started_at = Utc::now();
        let bulk = self.detect_drift_bulk(&schedule.device_ids).await?;
        let run = self.record_run(Some(id), started_at, &bulk).await?;

        let mut schedule = self.get_schedule(id).await?;
        schedule.last_run_at = Some(run.finished_at);
        schedule.next_run_at = if schedule.enabled {
            next_run(run.finished_at, schedule.interval_secs)
        } else {
            None
        };
        schedule.updated_at = run.finished_at;
        self.inner.store.update_schedule(schedule).await?;

        info!(
            schedule = %id,
            run = %run.id,
            total = run.total,
            drifted = run.drifted,
            errors = run.errors,
            "drift schedule ran"
        );
        Ok(run)
    }

    /// Ad hoc bulk check that is recorded like a scheduled run.
    pub async fn run_drift_check(&self, ids: &[DeviceId]) -> Result<DriftRun, CoreError> {
        let started_at = Utc::now();
        let bulk = self.detect_drift_bulk(ids).await?;
        self.record_run(None, started_at, &bulk).await
    }

    /// Run every enabled schedule due at `now`. A failing schedule is
    /// logged and does not stop the others.
    pub async fn run_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<DriftRun>, CoreError> {
        let due: Vec<ScheduleId> = self
            .list_schedules()
            .await?
            .into_iter()
            .filter(|s| s.enabled && s.next_run_at.is_none_or(|at| at <= now))
            .map(|s| s.id)
            .collect();

        let mut runs = Vec::with_capacity(due.len());
        for id in due {
            if self.inner.cancel.is_cancelled() {
                break;
            }
            match self.run_schedule(id).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(schedule = %id, error = %e, "scheduled drift run failed"),
            }
        }
        Ok(runs)
    }

    async fn record_run(
        &self,
        schedule_id: Option<ScheduleId>,
        started_at: DateTime<Utc>,
        bulk: &BulkDriftReport,
    ) -> Result<DriftRun, CoreError> {
        let store = &self.inner.store;
        let run = store
            .insert_run(DriftRun {
                id: RunId::default(),
                schedule_id,
                started_at,
                finished_at: Utc::now(),
                total: bulk.total,
                in_sync: bulk.in_sync,
                drifted: bulk.drifted,
                errors: bulk.errors,
            })
            .await?;

        for entry in &bulk.entries {
            let record = match entry {
                DriftOutcome::Report(report) => {
                    self.fold_trends(report).await?;
                    DriftReportRecord {
                        id: ReportId::default(),
                        run_id: run.id,
                        schedule_id,
                        device_id: report.device_id,
                        in_sync: report.in_sync,
                        deltas: report.deltas.clone(),
                        error: None,
                        checked_at: report.checked_at,
                    }
                }
                DriftOutcome::Error {
                    device_id, message, ..
                } => DriftReportRecord {
                    id: ReportId::default(),
                    run_id: run.id,
                    schedule_id,
                    device_id: *device_id,
                    in_sync: false,
                    deltas: Vec::new(),
                    error: Some(message.clone()),
                    checked_at: run.finished_at,
                },
            };
            store.insert_report(record).await?;
        }
        Ok(run)
    }

    /// Extend the open trend for each drifting field, or open a new one.
    async fn fold_trends(&self, report: &DriftReport) -> Result<(), CoreError> {
        let store = &self.inner.store;
        for delta in report.drifted_fields() {
            match store.find_open_trend(report.device_id, &delta.path).await? {
                Some(mut trend) => {
                    trend.occurrences = trend.occurrences.saturating_add(1);
                    trend.last_seen = report.checked_at;
                    trend.last_kind = delta.kind;
                    trend.last_desired.clone_from(&delta.desired);
                    trend.last_live.clone_from(&delta.live);
                    store.update_trend(trend).await?;
                }
                None => {
                    store
                        .insert_trend(DriftTrend {
                            id: TrendId::default(),
                            device_id: report.device_id,
                            path: delta.path.clone(),
                            first_seen: report.checked_at,
                            last_seen: report.checked_at,
                            occurrences: 1,
                            last_kind: delta.kind,
                            last_desired: delta.desired.clone(),
                            last_live: delta.live.clone(),
                            resolved: false,
                            resolved_at: None,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get_run(&self, id: RunId) -> Result<DriftRun, CoreError> {
        self.inner
            .store
            .get_run(id)
            .await?
            .ok_or_else(|| CoreError::not_found("drift run", id))
    }

    /// Run history, oldest first, optionally for one schedule.
    pub async fn list_runs(&self, schedule_id: Option<ScheduleId>) -> Result<Vec<DriftRun>, CoreError> {
        self.inner.store.list_runs(schedule_id).await
    }

    pub async fn list_reports(&self, query: ReportQuery) -> Result<Vec<DriftReportRecord>, CoreError> {
        self.inner.store.list_reports(query).await
    }

    pub async fn list_trends(&self, query: TrendQuery) -> Result<Vec<DriftTrend>, CoreError> {
        self.inner.store.list_trends(query).await
    }

    /// Mark a trend resolved. Resolving twice keeps the first timestamp.
    pub async fn resolve_trend(&self, id: TrendId) -> Result<DriftTrend, CoreError> {
        let mut trend = self
            .inner
            .store
            .get_trend(id)
            .await?
            .ok_or_else(|| CoreError::not_found("drift trend", id))?;
        if trend.resolved {
            return Ok(trend);
        }
        trend.resolved = true;
        trend.resolved_at = Some(Utc::now());
        self.inner.store.update_trend(trend).await
    }

    // ── Background task ──────────────────────────────────────────────

    /// Start the background task that runs due schedules every
    /// `scheduler_tick` until shutdown.
    pub async fn spawn_scheduler(&self) {
        let tick = self.config().scheduler_tick;
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(scheduler_task(self.clone(), tick, cancel));
        self.inner.task_handles.lock().await.push(handle);
    }
}

async fn scheduler_task(engine: Engine, tick: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = engine.run_due_schedules(Utc::now()).await {
                    warn!(error = %e, "scheduler tick failed");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{DeltaKind, DeviceDraft};
    use crate::store::{MemoryStore, RecordStore};
    use crate::test_support::{FakeDevice, FakeFactory};

    struct Fixture {
        engine: Engine,
        device: Arc<FakeDevice>,
        id: DeviceId,
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let factory = Arc::new(FakeFactory::default());
        let device = factory.add(
            FakeDevice::gen2("10.0.3.1", "a8032ab30001")
                .with_config(json!({"switch:0": {"initial_state": "off"}})),
        );
        let engine = Engine::with_factory(config, Arc::new(MemoryStore::new()), factory);
        let id = engine
            .add_device(DeviceDraft {
                name: "Boiler".into(),
                address: "10.0.3.1".into(),
                mac: "a8032ab30001".into(),
                ..DeviceDraft::default()
            })
            .await
            .unwrap()
            .id;
        engine
            .set_device_override(id, json!({"relay": {"default_state": "on"}}))
            .await
            .unwrap();
        Fixture { engine, device, id }
    }

    fn hourly(name: &str) -> ScheduleDraft {
        ScheduleDraft {
            name: name.into(),
            device_ids: Vec::new(),
            interval_secs: 3600,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn schedule_validation() {
        let f = fixture(EngineConfig::default()).await;
        let zero = ScheduleDraft {
            interval_secs: 0,
            ..hourly("zero")
        };
        assert_eq!(
            f.engine.create_schedule(zero).await.unwrap_err().kind(),
            crate::ErrorKind::Validation
        );
        assert!(f.engine.create_schedule(hourly("  ")).await.is_err());
    }

    #[tokio::test]
    async fn toggle_clears_and_restores_next_run() {
        let f = fixture(EngineConfig::default()).await;
        let s = f.engine.create_schedule(hourly("nightly")).await.unwrap();
        assert!(s.next_run_at.is_some());

        let off = f.engine.toggle_schedule(s.id).await.unwrap();
        assert!(!off.enabled);
        assert!(off.next_run_at.is_none());
        let on = f.engine.toggle_schedule(s.id).await.unwrap();
        assert!(on.enabled);
        assert!(on.next_run_at.is_some());
    }

    #[tokio::test]
    async fn runs_record_reports_and_extend_trends() {
        let f = fixture(EngineConfig::default()).await;
        let s = f.engine.create_schedule(hourly("hourly")).await.unwrap();

        let first = f.engine.run_schedule(s.id).await.unwrap();
        let second = f.engine.run_schedule(s.id).await.unwrap();
        assert_eq!(first.drifted, 1);
        assert_eq!(second.total, 1);

        let reports = f
            .engine
            .list_reports(ReportQuery {
                run_id: Some(second.id),
                ..ReportQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].in_sync);

        let trends = f
            .engine
            .list_trends(TrendQuery {
                device_id: Some(f.id),
                resolved: Some(false),
            })
            .await
            .unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].path, "relay.default_state");
        assert_eq!(trends[0].occurrences, 2);
        assert_eq!(trends[0].last_kind, DeltaKind::Changed);

        let schedule = f.engine.get_schedule(s.id).await.unwrap();
        assert_eq!(schedule.last_run_at, Some(second.finished_at));
        assert_eq!(f.engine.list_runs(Some(s.id)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resolved_trend_is_not_extended() {
        let f = fixture(EngineConfig::default()).await;
        f.engine.run_drift_check(&[f.id]).await.unwrap();
        let open = f.engine.list_trends(TrendQuery::default()).await.unwrap();
        let resolved = f.engine.resolve_trend(open[0].id).await.unwrap();
        assert!(resolved.resolved);

        f.engine.run_drift_check(&[f.id]).await.unwrap();
        let all = f.engine.list_trends(TrendQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|t| t.resolved).count(), 1);
    }

    #[tokio::test]
    async fn unreachable_device_is_stored_as_error_report() {
        let f = fixture(EngineConfig::default()).await;
        f.device.set_reachable(false);
        let run = f.engine.run_drift_check(&[]).await.unwrap();
        assert_eq!(run.errors, 1);
        let reports = f.engine.list_reports(ReportQuery::default()).await.unwrap();
        assert!(reports[0].error.is_some());
        assert!(f.engine.list_trends(TrendQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_due_enabled_schedules_run() {
        let f = fixture(EngineConfig::default()).await;
        let due = f.engine.create_schedule(hourly("due")).await.unwrap();
        let disabled = f
            .engine
            .create_schedule(ScheduleDraft {
                enabled: false,
                ..hourly("off")
            })
            .await
            .unwrap();

        let later = Utc::now() + TimeDelta::hours(2);
        let runs = f.engine.run_due_schedules(later).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].schedule_id, Some(due.id));
        assert!(f.engine.list_runs(Some(disabled.id)).await.unwrap().is_empty());

        // Next run moved an interval past the run; not due again yet.
        assert!(f.engine.run_due_schedules(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_scheduler_stops_on_shutdown() {
        let config = EngineConfig {
            scheduler_tick: Duration::from_secs(1),
            ..EngineConfig::default()
        };
        let f = fixture(config).await;
        let s = f.engine.create_schedule(hourly("bg")).await.unwrap();
        let mut due_now = f.engine.get_schedule(s.id).await.unwrap();
        due_now.next_run_at = None;
        f.engine.store().update_schedule(due_now).await.unwrap();

        f.engine.spawn_scheduler().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        f.engine.shutdown().await;

        assert_eq!(f.engine.list_runs(Some(s.id)).await.unwrap().len(), 1);
    }
}
