// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

#![cfg_attr(all(feature = "nightly", test), feature(test))]

//! Persistence port (SPEC_FULL.md C9): the data model of spec.md §3 and the
//! typed CRUD/query surface §4.9 requires, backed by SQLite.

pub mod db;
mod schema;
pub mod testutil;
pub mod types;

pub use crate::db::Database;
pub use crate::types::*;
