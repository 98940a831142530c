// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Typed entities for the data model of spec.md §3 / SPEC_FULL.md §3.

use base::time::Time;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = base::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(base::err!(InvalidArgument, msg("unknown {} {s:?}", stringify!($name)))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
                let s = value.as_str()?;
                s.parse().map_err(|_| rusqlite::types::FromSqlError::InvalidType)
            }
        }
    };
}

str_enum!(Quality { Main => "main", Sub => "sub" });
str_enum!(QualityTier { Low => "low", Medium => "medium", High => "high" });
str_enum!(RtspTransport { Tcp => "tcp", Udp => "udp" });
str_enum!(RecordingMode { Server => "server", LocalClient => "local_client" });
str_enum!(ScheduleKind { Once => "once", Daily => "daily", Weekly => "weekly", Continuous => "continuous" });
str_enum!(RecordingStatus {
    Scheduled => "scheduled",
    Recording => "recording",
    Completed => "completed",
    Failed => "failed",
    Stopped => "stopped",
});
str_enum!(StorageType { Local => "local", Cloud => "cloud" });
str_enum!(TransferState {
    Pending => "pending",
    Uploading => "uploading",
    Completed => "completed",
    CleanupPending => "cleanup_pending",
    CleanupCompleted => "cleanup_completed",
    Failed => "failed",
});
str_enum!(ClientStatus { Online => "online", Offline => "offline", Error => "error" });

/// Bitmask of ISO weekdays (bit 0 = Monday .. bit 6 = Sunday), matching
/// `scheduler.py`'s explicit `{'monday': 0, ..., 'sunday': 6}` day-name map.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct WeekdaySet(pub u8);

impl WeekdaySet {
    pub fn contains(&self, weekday: jiff::civil::Weekday) -> bool {
        self.0 & (1 << weekday_index(weekday)) != 0
    }

    pub fn insert(&mut self, weekday: jiff::civil::Weekday) {
        self.0 |= 1 << weekday_index(weekday);
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

fn weekday_index(w: jiff::civil::Weekday) -> u8 {
    use jiff::civil::Weekday::*;
    match w {
        Monday => 0,
        Tuesday => 1,
        Wednesday => 2,
        Thursday => 3,
        Friday => 4,
        Saturday => 5,
        Sunday => 6,
    }
}

#[derive(Clone, Debug)]
pub struct Camera {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub rtsp_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub main_url: Option<String>,
    pub sub_url: Option<String>,
    pub rtsp_transport: RtspTransport,
    pub auto_record: bool,
    pub quality_tier: QualityTier,
    pub max_retention_hours: i64,
    pub public: bool,
    pub recording_mode: RecordingMode,
    pub active: bool,
    pub online: bool,
    pub streaming: bool,
    pub last_seen: Option<Time>,
    pub creator: Option<String>,
    pub created_at: Time,
    pub updated_at: Time,
}

impl Camera {
    /// Resolves the RTSP URL for the given quality, falling back from `sub`
    /// to `main` per the GLOSSARY's "Quality (main/sub)" entry.
    pub fn url(&self, quality: Quality) -> Result<String, base::Error> {
        if let Quality::Sub = quality {
            if let Some(u) = &self.sub_url {
                return Ok(u.clone());
            }
        }
        if let Some(u) = &self.main_url {
            return Ok(u.clone());
        }
        let (host, port, path) = match (&self.host, self.port, &self.rtsp_path) {
            (Some(h), Some(p), Some(path)) => (h, p, path),
            _ => {
                return Err(base::err!(
                    FailedPrecondition,
                    msg("camera {} has neither a full RTSP URL nor host+port+path", self.id)
                ))
            }
        };
        let auth = match (&self.username, &self.password) {
            (Some(u), Some(p)) => format!("{u}:{p}@"),
            _ => String::new(),
        };
        Ok(format!("rtsp://{auth}{host}:{port}{path}"))
    }
}

#[derive(Clone, Debug)]
pub struct RecordingSchedule {
    pub id: Uuid,
    pub camera_id: Uuid,
    pub name: String,
    pub kind: ScheduleKind,
    pub start_time_sec: u32,
    pub end_time_sec: u32,
    pub start_date: Option<jiff::civil::Date>,
    pub end_date: Option<jiff::civil::Date>,
    pub weekdays: WeekdaySet,
    pub active: bool,
    pub creator: Option<String>,
    pub created_at: Time,
    pub updated_at: Time,
}

impl RecordingSchedule {
    /// Duration in seconds, honoring overnight wrap (end < start ⇒ next day).
    pub fn duration_secs(&self) -> u32 {
        if self.end_time_sec > self.start_time_sec {
            self.end_time_sec - self.start_time_sec
        } else {
            (24 * 3600 - self.start_time_sec) + self.end_time_sec
        }
    }
}

#[derive(Clone, Debug)]
pub struct Recording {
    pub id: Uuid,
    pub camera_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub name: String,
    pub file_path: String,
    pub storage_type: StorageType,
    pub file_size: i64,
    pub frames_written: i64,
    pub duration: Option<base::time::Duration>,
    pub start: Time,
    pub end: Option<Time>,
    pub status: RecordingStatus,
    pub resolution: Option<String>,
    pub frame_rate: Option<f64>,
    pub codec: Option<String>,
    pub error_message: Option<String>,
    pub thumbnail_path: Option<String>,
    pub recorded_by_client: Option<Uuid>,
    pub creator: Option<String>,
    pub created_at: Time,
    pub updated_at: Time,
}

/// Minimum thresholds from spec.md §4.4's completion classification.
pub const MIN_COMPLETED_FILE_SIZE_BYTES: i64 = 1000;
pub const MIN_COMPLETED_FRAMES: i64 = 10;

impl Recording {
    pub fn meets_completion_thresholds(&self) -> bool {
        self.file_size > MIN_COMPLETED_FILE_SIZE_BYTES && self.frames_written > MIN_COMPLETED_FRAMES
    }
}

#[derive(Clone, Debug)]
pub struct TransferJob {
    pub id: Uuid,
    pub recording_id: Uuid,
    pub local_path: String,
    pub object_key: String,
    pub url: Option<String>,
    pub size_bytes: i64,
    pub state: TransferState,
    pub scheduled_cleanup: Option<Time>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub upload_started_at: Option<Time>,
    pub upload_completed_at: Option<Time>,
    pub cleanup_completed_at: Option<Time>,
    pub created_at: Time,
    pub updated_at: Time,
}

/// Max upload retries before a TransferJob is left `failed` (spec.md §3/§4.6).
pub const MAX_TRANSFER_RETRIES: i32 = 3;

/// Deferred-cleanup window after upload completion (spec.md §3 TransferJob invariant).
pub const CLEANUP_DELAY: std::time::Duration = std::time::Duration::from_secs(24 * 3600);

#[derive(Clone, Debug)]
pub struct LiveStreamSession {
    pub id: Uuid,
    pub token: String,
    pub camera_id: Uuid,
    pub principal: String,
    pub start: Time,
    pub end: Option<Time>,
    pub active: bool,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LocalRecordingClient {
    pub id: Uuid,
    pub name: String,
    pub token: String,
    pub last_seen: Option<Time>,
    pub status: ClientStatus,
    pub created_at: Time,
    pub updated_at: Time,
}
