// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Test helpers shared by this crate's and downstream crates' unit tests.

use crate::db::Database;
use base::clock::SimulatedClocks;
use base::time::Time;
use uuid::Uuid;

/// An in-memory database wrapping a `SimulatedClocks`, the way the teacher's
/// `db::testutil::TestDb` wraps an in-memory connection for `db.rs` tests.
pub struct TestDb {
    pub db: Database<SimulatedClocks>,
}

impl TestDb {
    pub fn new() -> Self {
        base::time::testutil::init_zone();
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_431_000_000).unwrap());
        let conn = rusqlite::Connection::open_in_memory().expect("in-memory sqlite should open");
        let db = Database::open(conn, clocks).expect("schema should initialize");
        TestDb { db }
    }

    pub fn now(&self) -> Time {
        Time::from(self.db.clocks().realtime())
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a minimal, otherwise-default camera for use in tests.
pub fn sample_camera(name: &str, now: Time) -> crate::types::Camera {
    crate::types::Camera {
        id: Uuid::new_v4(),
        name: name.to_owned(),
        description: None,
        location: None,
        manufacturer: None,
        model: None,
        host: Some("192.0.2.1".to_owned()),
        port: Some(554),
        rtsp_path: Some("/stream1".to_owned()),
        username: None,
        password: None,
        main_url: None,
        sub_url: None,
        rtsp_transport: crate::types::RtspTransport::Tcp,
        auto_record: false,
        quality_tier: crate::types::QualityTier::Medium,
        max_retention_hours: 72,
        public: false,
        recording_mode: crate::types::RecordingMode::Server,
        active: false,
        online: false,
        streaming: false,
        last_seen: None,
        creator: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema() {
        let test_db = TestDb::new();
        let now = test_db.now();
        let cam = sample_camera("front door", now);
        test_db.db.lock().insert_camera(&cam).unwrap();
        let fetched = test_db.db.lock().get_camera(cam.id).unwrap().unwrap();
        assert_eq!(fetched.name, "front door");
    }
}
