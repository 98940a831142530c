// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes a fresh SQLite3 index database.
#[derive(Bpaf, Debug)]
#[bpaf(options("init"))]
pub struct Args {
    #[bpaf(long, argument("PATH"), fallback(crate::DEFAULT_DB_DIR.into()))]
    db_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let conn = super::open_conn(&args.db_dir, true)?;
    db::Database::open(conn, RealClocks {})?;
    info!(db_dir = %args.db_dir.display(), "database initialized");
    Ok(0)
}
