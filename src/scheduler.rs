// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Schedule trigger loop and maintenance jobs (C5).
//!
//! There's no equivalent of Python's `APScheduler` in this stack, so the
//! trigger loop is hand-rolled on `tokio::time`: one `interval`-driven tick
//! per schedule kind, each tick deciding whether today's (or this hour's)
//! window is open and whether a recording for it is already running.

use base::clock::Clocks;
use base::time::Time;
use base::Error;
use db::types::{RecordingSchedule, ScheduleKind};
use db::Database;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::object_store::ObjectStore;
use crate::recording_manager::RecordingManager;

const TICK_INTERVAL: Duration = Duration::from_secs(30);
const MISFIRE_GRACE: Duration = Duration::from_secs(300);
const EXPIRED_ONCE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const RETENTION_HOUR_UTC: u32 = 2;
const CLOUD_SYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);
const CLEANUP_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Runs the trigger loop and the four maintenance jobs until `shutdown` fires.
///
/// `max_instances=1` (spec.md §4.5) is enforced via `running`, a set of
/// schedule ids currently backed by an active recording; a tick that finds
/// its schedule already present there is a no-op, which also gives us
/// `coalesce=true` for free (a missed tick just gets picked up by the next
/// one within [`MISFIRE_GRACE`]).
pub struct Scheduler<C: Clocks = base::clock::RealClocks> {
    db: Arc<Database<C>>,
    recordings: Arc<RecordingManager<C>>,
    object_store: Arc<dyn ObjectStore>,
    cleanup_local_after_upload: bool,
    running: AsyncMutex<HashSet<Uuid>>,
}

impl<C: Clocks + Send + Sync + 'static> Scheduler<C> {
    pub fn new(
        db: Arc<Database<C>>,
        recordings: Arc<RecordingManager<C>>,
        object_store: Arc<dyn ObjectStore>,
        cleanup_local_after_upload: bool,
    ) -> Self {
        Scheduler {
            db,
            recordings,
            object_store,
            cleanup_local_after_upload,
            running: AsyncMutex::new(HashSet::new()),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: base::shutdown::Receiver) {
        let trigger = self.clone().trigger_loop();
        let expired_once = self.clone().expired_once_loop();
        let retention = self.clone().retention_loop();
        let cloud_sync = self.clone().cloud_sync_loop();
        let cleanup = self.clone().cleanup_loop();
        tokio::select! {
            _ = trigger => {}
            _ = expired_once => {}
            _ = retention => {}
            _ = cloud_sync => {}
            _ = cleanup => {}
            _ = shutdown.as_future() => { info!("scheduler shutting down"); }
        }
    }

    async fn trigger_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.trigger_tick().await {
                warn!(err = %e, "schedule trigger tick failed");
            }
        }
    }

    async fn trigger_tick(&self) -> Result<(), Error> {
        let now = Time::from(self.db.clocks().realtime());
        let schedules = self.db.lock().list_schedules(Some(true), None)?;
        for schedule in schedules {
            if !self.is_within_window(&schedule, now) {
                continue;
            }
            let already_running = {
                let guard = self.running.lock().await;
                guard.contains(&schedule.id) || self.recordings.is_recording(schedule.camera_id)
            };
            if already_running {
                continue;
            }
            self.start_scheduled_recording(&schedule).await;
        }
        Ok(())
    }

    /// Open-window test with a [`MISFIRE_GRACE`] trailing allowance, so a tick
    /// delayed past the exact start second still fires.
    fn is_within_window(&self, schedule: &RecordingSchedule, now: Time) -> bool {
        let zoned = jiff::Zoned::new(jiff::Timestamp::from_second(now.unix_seconds()).unwrap(), base::time::global_zone());
        let seconds_today = now.unix_seconds().rem_euclid(86400) as u32;
        let grace = MISFIRE_GRACE.as_secs() as u32;

        match schedule.kind {
            ScheduleKind::Once => {
                let Some(start_date) = schedule.start_date else { return false };
                zoned.date() == start_date
                    && seconds_today >= schedule.start_time_sec
                    && seconds_today < schedule.start_time_sec.saturating_add(grace)
            }
            ScheduleKind::Daily => {
                seconds_today >= schedule.start_time_sec && seconds_today < schedule.start_time_sec.saturating_add(grace)
            }
            ScheduleKind::Weekly => {
                schedule.weekdays.contains(zoned.date().weekday())
                    && seconds_today >= schedule.start_time_sec
                    && seconds_today < schedule.start_time_sec.saturating_add(grace)
            }
            ScheduleKind::Continuous => true,
        }
    }

    async fn start_scheduled_recording(&self, schedule: &RecordingSchedule) {
        let duration_minutes = match schedule.kind {
            // Continuous recordings are chunked into 1h files; the chunk
            // re-arms itself from `finish_chunk` below.
            ScheduleKind::Continuous => 60,
            _ => (schedule.duration_secs() / 60).max(1),
        };
        self.running.lock().await.insert(schedule.id);
        match self
            .recordings
            .start_recording(
                schedule.camera_id,
                db::types::Quality::Main,
                Some(duration_minutes),
                None,
                Some(schedule.id),
                true,
            )
            .await
        {
            Ok(recording) => {
                info!(schedule_id = %schedule.id, recording_id = %recording.id, "schedule triggered recording");
                if matches!(schedule.kind, ScheduleKind::Once) {
                    let _ = self.db.lock().set_schedule_active(schedule.id, false);
                }
                // Continuous schedules re-chunk themselves: once this 1h
                // recording finishes, `is_recording` goes false again and the
                // next 30s trigger tick starts the following chunk.
            }
            Err(e) => warn!(schedule_id = %schedule.id, err = %e, "failed to start scheduled recording"),
        }
        self.running.lock().await.remove(&schedule.id);
    }

    async fn expired_once_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(EXPIRED_ONCE_SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.db.lock().list_expired_once_schedules() {
                Ok(expired) => {
                    for schedule in expired {
                        if let Err(e) = self.db.lock().set_schedule_active(schedule.id, false) {
                            warn!(schedule_id = %schedule.id, err = %e, "failed to deactivate expired once-schedule");
                        }
                    }
                }
                Err(e) => warn!(err = %e, "expired-once sweep query failed"),
            }
        }
    }

    async fn retention_loop(self: Arc<Self>) {
        loop {
            let sleep_for = seconds_until_next_hour(self.db.clocks().realtime(), RETENTION_HOUR_UTC);
            tokio::time::sleep(Duration::from_secs(sleep_for)).await;
            if let Err(e) = self.retention_sweep().await {
                warn!(err = %e, "retention sweep failed");
            }
            tokio::time::sleep(RETENTION_SWEEP_INTERVAL - Duration::from_secs(1)).await;
        }
    }

    async fn retention_sweep(&self) -> Result<(), Error> {
        let now = Time::from(self.db.clocks().realtime());
        let cameras = self.db.lock().list_cameras(None, None)?;
        let mut deleted = 0u32;
        for camera in cameras {
            let older_than = now - base::time::Duration(i64::from(camera.max_retention_hours) * 3600 * base::time::TIME_UNITS_PER_SEC);
            let expired = self.db.lock().list_expired_recordings(camera.id, older_than)?;
            for recording in expired {
                if std::path::Path::new(&recording.file_path).exists() {
                    if let Err(e) = std::fs::remove_file(&recording.file_path) {
                        warn!(recording_id = %recording.id, err = %e, "retention sweep failed to delete file");
                        continue;
                    }
                }
                self.db.lock().delete_recording(recording.id)?;
                deleted += 1;
            }
        }
        info!(deleted, "retention sweep complete");
        Ok(())
    }

    async fn cloud_sync_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(CLOUD_SYNC_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match crate::archival::sync_recordings_to_cloud(&self.db, self.object_store.as_ref(), self.cleanup_local_after_upload).await {
                Ok(count) => info!(count, "background cloud sync pass complete"),
                Err(e) => warn!(err = %e, "background cloud sync pass failed"),
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(CLEANUP_SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match crate::archival::run_cleanup_sweep(&self.db) {
                Ok(count) => {
                    if count > 0 {
                        info!(count, "deferred cleanup sweep complete");
                    }
                }
                Err(e) => warn!(err = %e, "deferred cleanup sweep failed"),
            }
        }
    }
}

fn seconds_until_next_hour(now: jiff::Timestamp, target_hour_utc: u32) -> u64 {
    let zoned = jiff::Zoned::new(now, jiff::tz::TimeZone::UTC);
    let seconds_today = zoned.timestamp().as_second().rem_euclid(86400) as u32;
    let target = target_hour_utc * 3600;
    if seconds_today < target {
        (target - seconds_today) as u64
    } else {
        (86400 - seconds_today + target) as u64
    }
}
