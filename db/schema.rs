// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The SQLite schema backing the entities of spec.md §3. Unlike the
//! teacher's schema (which indexes mp4 sample files), this one is small
//! enough to not need a versioned `upgrade/` migration chain yet; schema
//! changes should start one (see `EXPECTED_SCHEMA_VERSION`) the first time
//! a deployed database needs to survive an upgrade.

pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

pub const SCHEMA: &str = r#"
create table if not exists meta (
  id integer primary key check (id = 0),
  schema_version integer not null
);

create table if not exists camera (
  id blob primary key check (length(id) = 16),
  name text not null,
  description text,
  location text,
  manufacturer text,
  model text,
  host text,
  port integer,
  rtsp_path text,
  username text,
  password text,
  main_url text,
  sub_url text,
  rtsp_transport text not null default 'tcp',
  auto_record integer not null default 0,
  quality_tier text not null default 'medium',
  max_retention_hours integer not null default 0,
  public integer not null default 0,
  recording_mode text not null default 'server',
  active integer not null default 0,
  online integer not null default 0,
  streaming integer not null default 0,
  last_seen integer,
  creator text,
  created_at integer not null,
  updated_at integer not null
);

create table if not exists local_recording_client (
  id blob primary key check (length(id) = 16),
  name text not null,
  token text unique not null,
  last_seen integer,
  status text not null default 'offline',
  created_at integer not null,
  updated_at integer not null
);

create table if not exists local_recording_client_camera (
  client_id blob not null references local_recording_client (id),
  camera_id blob not null references camera (id),
  primary key (client_id, camera_id)
);

create table if not exists recording_schedule (
  id blob primary key check (length(id) = 16),
  camera_id blob not null references camera (id),
  name text not null,
  kind text not null,
  start_time_sec integer not null,
  end_time_sec integer not null,
  start_date text,
  end_date text,
  weekdays integer not null default 0,
  active integer not null default 1,
  creator text,
  created_at integer not null,
  updated_at integer not null
);

create table if not exists recording (
  id blob primary key check (length(id) = 16),
  camera_id blob not null references camera (id),
  schedule_id blob references recording_schedule (id),
  name text not null,
  file_path text not null,
  storage_type text not null default 'local',
  file_size integer not null default 0,
  frames_written integer not null default 0,
  duration_90k integer,
  start integer not null,
  end integer,
  status text not null,
  resolution text,
  frame_rate real,
  codec text,
  error_message text,
  thumbnail_path text,
  recorded_by_client blob references local_recording_client (id),
  creator text,
  created_at integer not null,
  updated_at integer not null
);

create table if not exists transfer_job (
  id blob primary key check (length(id) = 16),
  recording_id blob unique not null references recording (id),
  local_path text not null,
  object_key text not null,
  url text,
  size_bytes integer not null default 0,
  state text not null default 'pending',
  scheduled_cleanup integer,
  retry_count integer not null default 0,
  error_message text,
  upload_started_at integer,
  upload_completed_at integer,
  cleanup_completed_at integer,
  created_at integer not null,
  updated_at integer not null
);

create table if not exists live_stream_session (
  id blob primary key check (length(id) = 16),
  token text unique not null,
  camera_id blob not null references camera (id),
  principal text not null,
  start integer not null,
  end integer,
  active integer not null default 1,
  client_ip text,
  user_agent text
);
"#;
