// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2022 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration file (`/etc/moonfire-nvr.json`), read with
//! `serde_json::from_slice` by `super::read_config`.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

fn default_bind() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_db_dir() -> PathBuf {
    crate::DEFAULT_DB_DIR.into()
}

fn default_media_root() -> PathBuf {
    crate::DEFAULT_MEDIA_ROOT.into()
}

/// Top-level configuration file object.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Address the HTTP surface (C7) listens on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Directory holding the SQLite3 index database.
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,

    /// Directory recordings and snapshots are written under.
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    ///
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Cloud object storage recordings are archived to, if any (C1, C6).
    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    /// Deletes a recording's local copy once its cloud upload completes
    /// (spec.md §4.6).
    #[serde(default)]
    pub cleanup_local_after_upload: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ObjectStoreConfig {
    #[default]
    None,
    S3 {
        bucket: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        public_base_url: Option<String>,
    },
}
