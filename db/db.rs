// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Database access logic backing spec.md §4.9's persistence port.
//!
//! Unlike the teacher's `db.rs` (which caches the entire recording index in
//! RAM because per-row disk reads would be too slow for playback), this
//! schema is small — cameras, schedules, recordings, transfer jobs, live
//! sessions, and agents number in the thousands at most — so every read
//! goes straight to SQLite. The `Database<C>`-wraps-a-mutex shape is kept
//! because it's still the right way to give every component a cheap
//! `Clone`-able handle into a single-writer SQLite connection.

use crate::schema::{EXPECTED_SCHEMA_VERSION, SCHEMA};
use crate::types::*;
use base::clock::Clocks;
use base::time::Time;
use base::{err, Error};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, OptionalExtension};
use std::ops::Range;
use uuid::Uuid;

pub struct Database<C: Clocks = base::clock::RealClocks> {
    clocks: C,
    conn: Mutex<rusqlite::Connection>,
}

fn uuid_blob(id: Uuid) -> [u8; 16] {
    *id.as_bytes()
}

fn row_uuid(row: &rusqlite::Row, idx: &str) -> rusqlite::Result<Uuid> {
    let bytes: Vec<u8> = row.get(idx)?;
    Uuid::from_slice(&bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(16, rusqlite::types::Type::Blob, Box::new(e))
    })
}

fn row_opt_uuid(row: &rusqlite::Row, idx: &str) -> rusqlite::Result<Option<Uuid>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes
        .map(|b| {
            Uuid::from_slice(&b).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(16, rusqlite::types::Type::Blob, Box::new(e))
            })
        })
        .transpose()
}

fn row_time(row: &rusqlite::Row, idx: &str) -> rusqlite::Result<Time> {
    let raw: i64 = row.get(idx)?;
    Ok(Time(raw))
}

fn row_opt_time(row: &rusqlite::Row, idx: &str) -> rusqlite::Result<Option<Time>> {
    let raw: Option<i64> = row.get(idx)?;
    Ok(raw.map(Time))
}

impl<C: Clocks> Database<C> {
    /// Opens (creating if necessary) the database on `conn`, the way
    /// `server/db/db.rs`'s `Database::new` validates schema version.
    pub fn open(conn: rusqlite::Connection, clocks: C) -> Result<Self, Error> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| err!(Internal, msg("creating schema"), source(e)))?;
        let version: Option<i32> = conn
            .query_row("select schema_version from meta where id = 0", [], |r| r.get(0))
            .optional()
            .map_err(|e| err!(Internal, msg("reading schema version"), source(e)))?;
        match version {
            None => {
                conn.execute(
                    "insert into meta (id, schema_version) values (0, ?1)",
                    params![EXPECTED_SCHEMA_VERSION],
                )
                .map_err(|e| err!(Internal, msg("initializing schema version"), source(e)))?;
            }
            Some(v) if v != EXPECTED_SCHEMA_VERSION => {
                return Err(err!(
                    FailedPrecondition,
                    msg("database schema version {v} != expected {EXPECTED_SCHEMA_VERSION}; no upgrade path defined yet")
                ));
            }
            Some(_) => {}
        }
        Ok(Database {
            clocks,
            conn: Mutex::new(conn),
        })
    }

    pub fn clocks(&self) -> &C {
        &self.clocks
    }

    pub fn lock(&self) -> LockedDatabase<'_, C> {
        LockedDatabase {
            conn: self.conn.lock(),
            clocks: &self.clocks,
        }
    }
}

pub struct LockedDatabase<'db, C: Clocks> {
    conn: MutexGuard<'db, rusqlite::Connection>,
    clocks: &'db C,
}

impl<'db, C: Clocks> LockedDatabase<'db, C> {
    fn now(&self) -> Time {
        Time::from(self.clocks.realtime())
    }

    // ---- Camera -------------------------------------------------------

    pub fn insert_camera(&self, c: &Camera) -> Result<(), Error> {
        self.conn
            .execute(
                "insert into camera (id, name, description, location, manufacturer, model, host, \
                 port, rtsp_path, username, password, main_url, sub_url, rtsp_transport, \
                 auto_record, quality_tier, max_retention_hours, public, recording_mode, active, \
                 online, streaming, last_seen, creator, created_at, updated_at) \
                 values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26)",
                params![
                    uuid_blob(c.id), c.name, c.description, c.location, c.manufacturer, c.model,
                    c.host, c.port, c.rtsp_path, c.username, c.password, c.main_url, c.sub_url,
                    c.rtsp_transport, c.auto_record, c.quality_tier, c.max_retention_hours,
                    c.public, c.recording_mode, c.active, c.online, c.streaming,
                    c.last_seen.map(|t| t.0), c.creator, c.created_at.0, c.updated_at.0,
                ],
            )
            .map_err(|e| err!(Internal, msg("inserting camera {}", c.id), source(e)))?;
        Ok(())
    }

    pub fn get_camera(&self, id: Uuid) -> Result<Option<Camera>, Error> {
        self.conn
            .query_row(
                "select * from camera where id = ?1",
                params![uuid_blob(id)],
                Self::camera_from_row,
            )
            .optional()
            .map_err(|e| err!(Internal, msg("fetching camera {id}"), source(e)))
    }

    /// `active`/`public` are optional filters; `None` means "don't filter on this field".
    pub fn list_cameras(&self, active: Option<bool>, public: Option<bool>) -> Result<Vec<Camera>, Error> {
        let mut sql = "select * from camera where 1=1".to_string();
        if active.is_some() {
            sql.push_str(" and active = :active");
        }
        if public.is_some() {
            sql.push_str(" and public = :public");
        }
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| err!(Internal, msg("preparing list_cameras"), source(e)))?;
        let mut named = Vec::new();
        if let Some(a) = active {
            named.push((":active", &a as &dyn rusqlite::ToSql));
        }
        if let Some(p) = public {
            named.push((":public", &p as &dyn rusqlite::ToSql));
        }
        let rows = stmt
            .query_map(named.as_slice(), Self::camera_from_row)
            .map_err(|e| err!(Internal, msg("listing cameras"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading camera rows"), source(e)))
    }

    /// Cameras assigned to the given agent (C8 `GET /cameras`).
    pub fn list_cameras_for_client(&self, client_id: Uuid) -> Result<Vec<Camera>, Error> {
        let mut stmt = self
            .conn
            .prepare(
                "select c.* from camera c \
                 join local_recording_client_camera a on a.camera_id = c.id \
                 where a.client_id = ?1 and c.recording_mode = 'local_client'",
            )
            .map_err(|e| err!(Internal, msg("preparing list_cameras_for_client"), source(e)))?;
        let rows = stmt
            .query_map(params![uuid_blob(client_id)], Self::camera_from_row)
            .map_err(|e| err!(Internal, msg("listing client cameras"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading camera rows"), source(e)))
    }

    /// Updates the stream-lifecycle flags a reader/record task owns
    /// (spec.md §3 Camera: "mutated by stream/recording loops").
    pub fn update_camera_stream_flags(
        &self,
        id: Uuid,
        active: bool,
        online: bool,
        streaming: bool,
    ) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update camera set active=?1, online=?2, streaming=?3, last_seen=?4, updated_at=?5 where id=?6",
                params![active, online, streaming, now.0, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("updating camera {id} flags"), source(e)))?;
        Ok(())
    }

    pub fn delete_camera(&self, id: Uuid) -> Result<(), Error> {
        // Cascades to recordings per spec.md §3 Camera invariant ("deletion cascades to its recordings").
        self.conn
            .execute(
                "delete from transfer_job where recording_id in (select id from recording where camera_id = ?1)",
                params![uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("cascading transfer_job delete"), source(e)))?;
        self.conn
            .execute("delete from recording where camera_id = ?1", params![uuid_blob(id)])
            .map_err(|e| err!(Internal, msg("cascading recording delete"), source(e)))?;
        self.conn
            .execute("delete from recording_schedule where camera_id = ?1", params![uuid_blob(id)])
            .map_err(|e| err!(Internal, msg("cascading schedule delete"), source(e)))?;
        self.conn
            .execute("delete from camera where id = ?1", params![uuid_blob(id)])
            .map_err(|e| err!(Internal, msg("deleting camera {id}"), source(e)))?;
        Ok(())
    }

    fn camera_from_row(row: &rusqlite::Row) -> rusqlite::Result<Camera> {
        Ok(Camera {
            id: row_uuid(row, "id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            location: row.get("location")?,
            manufacturer: row.get("manufacturer")?,
            model: row.get("model")?,
            host: row.get("host")?,
            port: row.get::<_, Option<i64>>("port")?.map(|p| p as u16),
            rtsp_path: row.get("rtsp_path")?,
            username: row.get("username")?,
            password: row.get("password")?,
            main_url: row.get("main_url")?,
            sub_url: row.get("sub_url")?,
            rtsp_transport: row.get("rtsp_transport")?,
            auto_record: row.get("auto_record")?,
            quality_tier: row.get("quality_tier")?,
            max_retention_hours: row.get("max_retention_hours")?,
            public: row.get("public")?,
            recording_mode: row.get("recording_mode")?,
            active: row.get("active")?,
            online: row.get("online")?,
            streaming: row.get("streaming")?,
            last_seen: row_opt_time(row, "last_seen")?,
            creator: row.get("creator")?,
            created_at: row_time(row, "created_at")?,
            updated_at: row_time(row, "updated_at")?,
        })
    }

    // ---- RecordingSchedule ---------------------------------------------

    pub fn insert_schedule(&self, s: &RecordingSchedule) -> Result<(), Error> {
        self.conn
            .execute(
                "insert into recording_schedule (id, camera_id, name, kind, start_time_sec, \
                 end_time_sec, start_date, end_date, weekdays, active, creator, created_at, updated_at) \
                 values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                params![
                    uuid_blob(s.id), uuid_blob(s.camera_id), s.name, s.kind, s.start_time_sec,
                    s.end_time_sec, s.start_date.map(|d| d.to_string()), s.end_date.map(|d| d.to_string()),
                    s.weekdays.0, s.active, s.creator, s.created_at.0, s.updated_at.0,
                ],
            )
            .map_err(|e| err!(Internal, msg("inserting schedule {}", s.id), source(e)))?;
        Ok(())
    }

    pub fn get_schedule(&self, id: Uuid) -> Result<Option<RecordingSchedule>, Error> {
        self.conn
            .query_row(
                "select * from recording_schedule where id = ?1",
                params![uuid_blob(id)],
                Self::schedule_from_row,
            )
            .optional()
            .map_err(|e| err!(Internal, msg("fetching schedule {id}"), source(e)))
    }

    pub fn list_schedules(&self, active: Option<bool>, camera_id: Option<Uuid>) -> Result<Vec<RecordingSchedule>, Error> {
        let mut sql = "select * from recording_schedule where 1=1".to_string();
        if active.is_some() {
            sql.push_str(" and active = :active");
        }
        if camera_id.is_some() {
            sql.push_str(" and camera_id = :camera_id");
        }
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| err!(Internal, msg("preparing list_schedules"), source(e)))?;
        let blob = camera_id.map(uuid_blob);
        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        if let Some(a) = &active {
            named.push((":active", a));
        }
        if let Some(b) = &blob {
            named.push((":camera_id", b));
        }
        let rows = stmt
            .query_map(named.as_slice(), Self::schedule_from_row)
            .map_err(|e| err!(Internal, msg("listing schedules"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading schedule rows"), source(e)))
    }

    /// Active `once` schedules updated after `since` (C8 `GET /schedules?last_sync=`).
    pub fn list_schedules_for_client_since(
        &self,
        client_id: Uuid,
        since: Option<Time>,
    ) -> Result<Vec<RecordingSchedule>, Error> {
        let mut sql = "select s.* from recording_schedule s \
             join local_recording_client_camera a on a.camera_id = s.camera_id \
             join camera c on c.id = s.camera_id \
             where a.client_id = ?1 and c.recording_mode = 'local_client' and s.active = 1"
            .to_string();
        if since.is_some() {
            sql.push_str(" and s.updated_at > ?2");
        }
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| err!(Internal, msg("preparing client schedule pull"), source(e)))?;
        let rows = if let Some(since) = since {
            stmt.query_map(params![uuid_blob(client_id), since.0], Self::schedule_from_row)
        } else {
            stmt.query_map(params![uuid_blob(client_id)], Self::schedule_from_row)
        }
        .map_err(|e| err!(Internal, msg("listing client schedules"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading schedule rows"), source(e)))
    }

    /// Active `once` schedules whose scheduled moment has passed (C5 hourly sweep).
    pub fn list_expired_once_schedules(&self) -> Result<Vec<RecordingSchedule>, Error> {
        let now = self.now();
        let today = jiff::Zoned::new(
            jiff::Timestamp::from_second(now.unix_seconds()).unwrap(),
            base::time::global_zone(),
        )
        .date();
        let mut stmt = self
            .conn
            .prepare(
                "select * from recording_schedule where kind = 'once' and active = 1 \
                 and (start_date < ?1 or (start_date = ?1 and start_time_sec <= ?2))",
            )
            .map_err(|e| err!(Internal, msg("preparing expired-once query"), source(e)))?;
        let seconds_today = now.unix_seconds().rem_euclid(86400) as u32;
        let rows = stmt
            .query_map(params![today.to_string(), seconds_today], Self::schedule_from_row)
            .map_err(|e| err!(Internal, msg("listing expired once-schedules"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading schedule rows"), source(e)))
    }

    pub fn set_schedule_active(&self, id: Uuid, active: bool) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update recording_schedule set active=?1, updated_at=?2 where id=?3",
                params![active, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("updating schedule {id}"), source(e)))?;
        Ok(())
    }

    pub fn delete_schedule(&self, id: Uuid) -> Result<(), Error> {
        self.conn
            .execute("delete from recording_schedule where id = ?1", params![uuid_blob(id)])
            .map_err(|e| err!(Internal, msg("deleting schedule {id}"), source(e)))?;
        Ok(())
    }

    fn schedule_from_row(row: &rusqlite::Row) -> rusqlite::Result<RecordingSchedule> {
        let start_date: Option<String> = row.get("start_date")?;
        let end_date: Option<String> = row.get("end_date")?;
        Ok(RecordingSchedule {
            id: row_uuid(row, "id")?,
            camera_id: row_uuid(row, "camera_id")?,
            name: row.get("name")?,
            kind: row.get("kind")?,
            start_time_sec: row.get("start_time_sec")?,
            end_time_sec: row.get("end_time_sec")?,
            start_date: start_date.and_then(|s| s.parse().ok()),
            end_date: end_date.and_then(|s| s.parse().ok()),
            weekdays: WeekdaySet(row.get("weekdays")?),
            active: row.get("active")?,
            creator: row.get("creator")?,
            created_at: row_time(row, "created_at")?,
            updated_at: row_time(row, "updated_at")?,
        })
    }

    // ---- Recording ------------------------------------------------------

    pub fn insert_recording(&self, r: &Recording) -> Result<(), Error> {
        self.conn
            .execute(
                "insert into recording (id, camera_id, schedule_id, name, file_path, storage_type, \
                 file_size, frames_written, duration_90k, start, end, status, resolution, frame_rate, \
                 codec, error_message, thumbnail_path, recorded_by_client, creator, created_at, updated_at) \
                 values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
                params![
                    uuid_blob(r.id), uuid_blob(r.camera_id), r.schedule_id.map(uuid_blob), r.name,
                    r.file_path, r.storage_type, r.file_size, r.frames_written,
                    r.duration.map(|d| d.0), r.start.0, r.end.map(|t| t.0), r.status, r.resolution,
                    r.frame_rate, r.codec, r.error_message, r.thumbnail_path,
                    r.recorded_by_client.map(uuid_blob), r.creator, r.created_at.0, r.updated_at.0,
                ],
            )
            .map_err(|e| err!(Internal, msg("inserting recording {}", r.id), source(e)))?;
        Ok(())
    }

    pub fn get_recording(&self, id: Uuid) -> Result<Option<Recording>, Error> {
        self.conn
            .query_row(
                "select * from recording where id = ?1",
                params![uuid_blob(id)],
                Self::recording_from_row,
            )
            .optional()
            .map_err(|e| err!(Internal, msg("fetching recording {id}"), source(e)))
    }

    /// True if `camera_id` already has a recording in progress (spec.md §4.4 step 1
    /// and §3's "at most one recording with status=recording at a time" invariant).
    pub fn has_active_recording(&self, camera_id: Uuid) -> Result<bool, Error> {
        self.conn
            .query_row(
                "select 1 from recording where camera_id = ?1 and status = 'recording' limit 1",
                params![uuid_blob(camera_id)],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| err!(Internal, msg("checking active recording for {camera_id}"), source(e)))
            .map(|o| o.is_some())
    }

    pub fn list_recordings(
        &self,
        camera_id: Option<Uuid>,
        status: Option<RecordingStatus>,
        time_range: Option<Range<Time>>,
        storage_type: Option<StorageType>,
    ) -> Result<Vec<Recording>, Error> {
        let mut sql = "select * from recording where 1=1".to_string();
        if camera_id.is_some() {
            sql.push_str(" and camera_id = :camera_id");
        }
        if status.is_some() {
            sql.push_str(" and status = :status");
        }
        if time_range.is_some() {
            sql.push_str(" and start >= :range_start and start < :range_end");
        }
        if storage_type.is_some() {
            sql.push_str(" and storage_type = :storage_type");
        }
        sql.push_str(" order by start desc");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| err!(Internal, msg("preparing list_recordings"), source(e)))?;
        let camera_blob = camera_id.map(uuid_blob);
        let (range_start, range_end) = match &time_range {
            Some(r) => (Some(r.start.0), Some(r.end.0)),
            None => (None, None),
        };
        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        if let Some(b) = &camera_blob {
            named.push((":camera_id", b));
        }
        if let Some(s) = &status {
            named.push((":status", s));
        }
        if let Some(s) = &range_start {
            named.push((":range_start", s));
        }
        if let Some(e) = &range_end {
            named.push((":range_end", e));
        }
        if let Some(s) = &storage_type {
            named.push((":storage_type", s));
        }
        let rows = stmt
            .query_map(named.as_slice(), Self::recording_from_row)
            .map_err(|e| err!(Internal, msg("listing recordings"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading recording rows"), source(e)))
    }

    pub fn latest_recording(&self, camera_id: Uuid) -> Result<Option<Recording>, Error> {
        self.conn
            .query_row(
                "select * from recording where camera_id = ?1 order by start desc limit 1",
                params![uuid_blob(camera_id)],
                Self::recording_from_row,
            )
            .optional()
            .map_err(|e| err!(Internal, msg("fetching latest recording for {camera_id}"), source(e)))
    }

    /// Completed, local-only recordings not already claimed by a transfer job in a
    /// terminal-or-in-flight state; capped at `limit` (C6 background sweep, and the
    /// Open Question #1 resolution in SPEC_FULL.md §9).
    pub fn list_sync_candidates(&self, limit: u32) -> Result<Vec<Recording>, Error> {
        let mut stmt = self
            .conn
            .prepare(
                "select r.* from recording r \
                 where r.status = 'completed' and r.storage_type = 'local' \
                 and not exists ( \
                   select 1 from transfer_job t where t.recording_id = r.id \
                   and t.state in ('uploading', 'completed', 'cleanup_pending', 'cleanup_completed') \
                 ) \
                 order by r.created_at asc limit ?1",
            )
            .map_err(|e| err!(Internal, msg("preparing sync-candidate query"), source(e)))?;
        let rows = stmt
            .query_map(params![limit], Self::recording_from_row)
            .map_err(|e| err!(Internal, msg("listing sync candidates"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading recording rows"), source(e)))
    }

    /// Completed recordings for `camera_id` older than `older_than` (C5 daily 02:00
    /// retention cleanup keyed on `camera.max_retention_hours`).
    pub fn list_expired_recordings(&self, camera_id: Uuid, older_than: Time) -> Result<Vec<Recording>, Error> {
        let mut stmt = self
            .conn
            .prepare(
                "select * from recording where camera_id = ?1 and status = 'completed' and start < ?2",
            )
            .map_err(|e| err!(Internal, msg("preparing retention query"), source(e)))?;
        let rows = stmt
            .query_map(params![uuid_blob(camera_id), older_than.0], Self::recording_from_row)
            .map_err(|e| err!(Internal, msg("listing expired recordings"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading recording rows"), source(e)))
    }

    pub fn update_recording_status(&self, id: Uuid, status: RecordingStatus, error_message: Option<&str>) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update recording set status=?1, error_message=?2, updated_at=?3 where id=?4",
                params![status, error_message, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("updating recording {id} status"), source(e)))?;
        Ok(())
    }

    /// Applies a C8 agent's in-progress status push (spec.md §4.8
    /// `POST /local-client/recordings/status`) without touching fields the
    /// agent didn't report.
    pub fn update_recording_progress(&self, id: Uuid, frames_written: Option<i64>, file_size: Option<i64>) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update recording set frames_written=coalesce(?1, frames_written), \
                 file_size=coalesce(?2, file_size), updated_at=?3 where id=?4",
                params![frames_written, file_size, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("updating recording {id} progress"), source(e)))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_recording(
        &self,
        id: Uuid,
        end: Time,
        duration: base::time::Duration,
        file_size: i64,
        frames_written: i64,
        frame_rate: Option<f64>,
    ) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update recording set status='completed', end=?1, duration_90k=?2, file_size=?3, \
                 frames_written=?4, frame_rate=coalesce(?5, frame_rate), updated_at=?6 where id=?7",
                params![end.0, duration.0, file_size, frames_written, frame_rate, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("completing recording {id}"), source(e)))?;
        Ok(())
    }

    /// Persists an operator-requested stop (spec.md §3: `recording → stopped`),
    /// independent of the size/frame thresholds that gate `completed`/`failed`.
    pub fn mark_recording_stopped(
        &self,
        id: Uuid,
        end: Time,
        duration: base::time::Duration,
        file_size: i64,
        frames_written: i64,
    ) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update recording set status='stopped', end=?1, duration_90k=?2, file_size=?3, \
                 frames_written=?4, updated_at=?5 where id=?6",
                params![end.0, duration.0, file_size, frames_written, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("marking recording {id} stopped"), source(e)))?;
        Ok(())
    }

    pub fn set_recording_storage(&self, id: Uuid, storage_type: StorageType, file_path: &str) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update recording set storage_type=?1, file_path=?2, updated_at=?3 where id=?4",
                params![storage_type, file_path, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("updating recording {id} storage"), source(e)))?;
        Ok(())
    }

    pub fn delete_recording(&self, id: Uuid) -> Result<(), Error> {
        self.conn
            .execute("delete from transfer_job where recording_id = ?1", params![uuid_blob(id)])
            .map_err(|e| err!(Internal, msg("deleting transfer job for {id}"), source(e)))?;
        self.conn
            .execute("delete from recording where id = ?1", params![uuid_blob(id)])
            .map_err(|e| err!(Internal, msg("deleting recording {id}"), source(e)))?;
        Ok(())
    }

    fn recording_from_row(row: &rusqlite::Row) -> rusqlite::Result<Recording> {
        Ok(Recording {
            id: row_uuid(row, "id")?,
            camera_id: row_uuid(row, "camera_id")?,
            schedule_id: row_opt_uuid(row, "schedule_id")?,
            name: row.get("name")?,
            file_path: row.get("file_path")?,
            storage_type: row.get("storage_type")?,
            file_size: row.get("file_size")?,
            frames_written: row.get("frames_written")?,
            duration: row.get::<_, Option<i64>>("duration_90k")?.map(base::time::Duration),
            start: row_time(row, "start")?,
            end: row_opt_time(row, "end")?,
            status: row.get("status")?,
            resolution: row.get("resolution")?,
            frame_rate: row.get("frame_rate")?,
            codec: row.get("codec")?,
            error_message: row.get("error_message")?,
            thumbnail_path: row.get("thumbnail_path")?,
            recorded_by_client: row_opt_uuid(row, "recorded_by_client")?,
            creator: row.get("creator")?,
            created_at: row_time(row, "created_at")?,
            updated_at: row_time(row, "updated_at")?,
        })
    }

    // ---- TransferJob ----------------------------------------------------

    pub fn insert_transfer_job(&self, t: &TransferJob) -> Result<(), Error> {
        self.conn
            .execute(
                "insert into transfer_job (id, recording_id, local_path, object_key, url, size_bytes, \
                 state, scheduled_cleanup, retry_count, error_message, upload_started_at, \
                 upload_completed_at, cleanup_completed_at, created_at, updated_at) \
                 values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    uuid_blob(t.id), uuid_blob(t.recording_id), t.local_path, t.object_key, t.url,
                    t.size_bytes, t.state, t.scheduled_cleanup.map(|v| v.0), t.retry_count,
                    t.error_message, t.upload_started_at.map(|v| v.0), t.upload_completed_at.map(|v| v.0),
                    t.cleanup_completed_at.map(|v| v.0), t.created_at.0, t.updated_at.0,
                ],
            )
            .map_err(|e| err!(Internal, msg("inserting transfer job for {}", t.recording_id), source(e)))?;
        Ok(())
    }

    pub fn get_transfer_job_for_recording(&self, recording_id: Uuid) -> Result<Option<TransferJob>, Error> {
        self.conn
            .query_row(
                "select * from transfer_job where recording_id = ?1",
                params![uuid_blob(recording_id)],
                Self::transfer_job_from_row,
            )
            .optional()
            .map_err(|e| err!(Internal, msg("fetching transfer job for {recording_id}"), source(e)))
    }

    pub fn list_transfer_jobs(&self, state: Option<TransferState>) -> Result<Vec<TransferJob>, Error> {
        let mut sql = "select * from transfer_job where 1=1".to_string();
        if state.is_some() {
            sql.push_str(" and state = :state");
        }
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| err!(Internal, msg("preparing list_transfer_jobs"), source(e)))?;
        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        if let Some(s) = &state {
            named.push((":state", s));
        }
        let rows = stmt
            .query_map(named.as_slice(), Self::transfer_job_from_row)
            .map_err(|e| err!(Internal, msg("listing transfer jobs"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading transfer job rows"), source(e)))
    }

    /// Jobs due for the 24h-deferred cleanup sweep (spec.md §4.6).
    pub fn list_due_cleanups(&self) -> Result<Vec<TransferJob>, Error> {
        let now = self.now();
        let mut stmt = self
            .conn
            .prepare("select * from transfer_job where state = 'completed' and scheduled_cleanup <= ?1")
            .map_err(|e| err!(Internal, msg("preparing due-cleanup query"), source(e)))?;
        let rows = stmt
            .query_map(params![now.0], Self::transfer_job_from_row)
            .map_err(|e| err!(Internal, msg("listing due cleanups"), source(e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| err!(Internal, msg("reading transfer job rows"), source(e)))
    }

    pub fn set_transfer_state(&self, id: Uuid, state: TransferState) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update transfer_job set state=?1, updated_at=?2 where id=?3",
                params![state, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("updating transfer job {id} state"), source(e)))?;
        Ok(())
    }

    pub fn complete_upload(&self, id: Uuid, url: Option<&str>) -> Result<(), Error> {
        let now = self.now();
        let cleanup_at = now.0 + CLEANUP_DELAY.as_secs() as i64 * base::time::TIME_UNITS_PER_SEC;
        self.conn
            .execute(
                "update transfer_job set state='completed', url=?1, upload_completed_at=?2, \
                 scheduled_cleanup=?3, updated_at=?2 where id=?4",
                params![url, now.0, cleanup_at, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("completing upload {id}"), source(e)))?;
        Ok(())
    }

    pub fn fail_upload(&self, id: Uuid, error_message: &str) -> Result<i32, Error> {
        let now = self.now();
        self.conn
            .execute(
                "update transfer_job set retry_count = retry_count + 1, error_message=?1, \
                 state = case when retry_count + 1 >= ?2 then 'failed' else state end, \
                 updated_at=?3 where id=?4",
                params![error_message, MAX_TRANSFER_RETRIES, now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("recording upload failure for {id}"), source(e)))?;
        self.conn
            .query_row(
                "select retry_count from transfer_job where id = ?1",
                params![uuid_blob(id)],
                |r| r.get(0),
            )
            .map_err(|e| err!(Internal, msg("reading retry_count for {id}"), source(e)))
    }

    pub fn complete_cleanup(&self, id: Uuid) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update transfer_job set state='cleanup_completed', cleanup_completed_at=?1, updated_at=?1 where id=?2",
                params![now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("completing cleanup for {id}"), source(e)))?;
        Ok(())
    }

    pub fn reset_transfer_retry(&self, id: Uuid) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update transfer_job set retry_count=0, state='pending', error_message=null, updated_at=?1 where id=?2",
                params![now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("resetting retry count for {id}"), source(e)))?;
        Ok(())
    }

    fn transfer_job_from_row(row: &rusqlite::Row) -> rusqlite::Result<TransferJob> {
        Ok(TransferJob {
            id: row_uuid(row, "id")?,
            recording_id: row_uuid(row, "recording_id")?,
            local_path: row.get("local_path")?,
            object_key: row.get("object_key")?,
            url: row.get("url")?,
            size_bytes: row.get("size_bytes")?,
            state: row.get("state")?,
            scheduled_cleanup: row_opt_time(row, "scheduled_cleanup")?,
            retry_count: row.get("retry_count")?,
            error_message: row.get("error_message")?,
            upload_started_at: row_opt_time(row, "upload_started_at")?,
            upload_completed_at: row_opt_time(row, "upload_completed_at")?,
            cleanup_completed_at: row_opt_time(row, "cleanup_completed_at")?,
            created_at: row_time(row, "created_at")?,
            updated_at: row_time(row, "updated_at")?,
        })
    }

    // ---- LiveStreamSession ----------------------------------------------

    pub fn insert_live_session(&self, s: &LiveStreamSession) -> Result<(), Error> {
        self.conn
            .execute(
                "insert into live_stream_session (id, token, camera_id, principal, start, end, \
                 active, client_ip, user_agent) values (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    uuid_blob(s.id), s.token, uuid_blob(s.camera_id), s.principal, s.start.0,
                    s.end.map(|t| t.0), s.active, s.client_ip, s.user_agent,
                ],
            )
            .map_err(|e| err!(Internal, msg("inserting live session {}", s.id), source(e)))?;
        Ok(())
    }

    pub fn end_live_session(&self, token: &str) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update live_stream_session set active=0, end=?1 where token=?2",
                params![now.0, token],
            )
            .map_err(|e| err!(Internal, msg("ending live session"), source(e)))?;
        Ok(())
    }

    // ---- LocalRecordingClient --------------------------------------------

    pub fn insert_client(&self, c: &LocalRecordingClient, assigned_cameras: &[Uuid]) -> Result<(), Error> {
        self.conn
            .execute(
                "insert into local_recording_client (id, name, token, last_seen, status, created_at, updated_at) \
                 values (?1,?2,?3,?4,?5,?6,?7)",
                params![uuid_blob(c.id), c.name, c.token, c.last_seen.map(|t| t.0), c.status, c.created_at.0, c.updated_at.0],
            )
            .map_err(|e| err!(Internal, msg("inserting client {}", c.id), source(e)))?;
        for cam in assigned_cameras {
            self.conn
                .execute(
                    "insert into local_recording_client_camera (client_id, camera_id) values (?1, ?2)",
                    params![uuid_blob(c.id), uuid_blob(*cam)],
                )
                .map_err(|e| err!(Internal, msg("assigning camera {cam} to client {}", c.id), source(e)))?;
        }
        Ok(())
    }

    /// Validates a bearer token and returns the client it belongs to (C8 auth,
    /// spec.md §4.8 "central validates the bearer ... on mismatch, 401").
    pub fn get_client_by_token(&self, token: &str) -> Result<Option<LocalRecordingClient>, Error> {
        self.conn
            .query_row(
                "select * from local_recording_client where token = ?1",
                params![token],
                Self::client_from_row,
            )
            .optional()
            .map_err(|e| err!(Internal, msg("fetching client by token"), source(e)))
    }

    pub fn record_client_heartbeat(&self, id: Uuid) -> Result<(), Error> {
        let now = self.now();
        self.conn
            .execute(
                "update local_recording_client set last_seen=?1, status='online', updated_at=?1 where id=?2",
                params![now.0, uuid_blob(id)],
            )
            .map_err(|e| err!(Internal, msg("recording heartbeat for {id}"), source(e)))?;
        Ok(())
    }

    fn client_from_row(row: &rusqlite::Row) -> rusqlite::Result<LocalRecordingClient> {
        Ok(LocalRecordingClient {
            id: row_uuid(row, "id")?,
            name: row.get("name")?,
            token: row.get("token")?,
            last_seen: row_opt_time(row, "last_seen")?,
            status: row.get("status")?,
            created_at: row_time(row, "created_at")?,
            updated_at: row_time(row, "updated_at")?,
        })
    }
}
