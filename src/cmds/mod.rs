// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2016 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{err, Error};
use std::path::Path;

pub mod agent;
pub mod init;
pub mod run;

/// Opens (creating the parent directory if needed) the SQLite3 index
/// database underlying `db::Database` (C9). Unlike the teacher, there's no
/// separate sample-file directory to flock here — recordings live under
/// `media_root` as plain files, tracked only by path in the `recording`
/// table — so opening the db is just opening one SQLite connection.
pub fn open_conn(db_dir: &Path, create: bool) -> Result<rusqlite::Connection, Error> {
    if create {
        std::fs::create_dir_all(db_dir).map_err(|e| err!(Internal, msg("creating db dir {}", db_dir.display()), source(e)))?;
    }
    let db_path = db_dir.join("db");
    let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
        | if create { rusqlite::OpenFlags::SQLITE_OPEN_CREATE } else { rusqlite::OpenFlags::empty() }
        | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;
    rusqlite::Connection::open_with_flags(&db_path, flags)
        .map_err(|e| err!(Unavailable, msg("opening {}", db_path.display()), source(e)))
}
