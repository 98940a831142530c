// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upload and retention worker (C6): per-recording immediate upload (called
//! by C4 right after a recording completes), a background reconciliation
//! sweep over recordings that missed that handoff, and the 24h-deferred
//! local-file cleanup that follows a successful upload.

use base::clock::Clocks;
use base::time::Time;
use base::{err, Error};
use db::types::{StorageType, TransferJob, TransferState};
use db::Database;
use std::path::Path;
use std::time::Duration as StdDuration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::object_store::{content_type_for_extension, put_timeout, ObjectStore};

const UPLOAD_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: StdDuration = StdDuration::from_secs(5);
const POST_UPLOAD_SETTLE: StdDuration = StdDuration::from_secs(2);
const SYNC_BATCH_SIZE: u32 = 10;

fn extension_of(path: &str) -> &str {
    Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("mp4")
}

/// Builds the central object-store key for a recording (spec.md §6):
/// `recordings/<cameraId>/<YYYYMMDD>/<filename>`.
pub fn object_key_for(camera_id: Uuid, start: Time, filename: &str) -> String {
    let date = jiff::Zoned::new(
        jiff::Timestamp::from_second(start.unix_seconds()).unwrap(),
        base::time::global_zone(),
    )
    .strftime("%Y%m%d")
    .to_string();
    format!("recordings/{camera_id}/{date}/{filename}")
}

/// Uploads one recording's local file, with retries and an optional local
/// delete on success, per spec.md §4.4's post-completion hand-off and §4.6's
/// failure semantics. Idempotent: safe to call again after a partial failure.
pub async fn upload_recording<C: Clocks>(
    db: &Database<C>,
    store: &dyn ObjectStore,
    recording_id: Uuid,
    camera_id: Uuid,
    start: Time,
    local_path: &str,
    cleanup_local_after_upload: bool,
) -> Result<(), Error> {
    let existing = db.lock().get_transfer_job_for_recording(recording_id)?;
    let job = match existing {
        Some(j) => j,
        None => {
            let size_bytes = std::fs::metadata(local_path).map(|m| m.len() as i64).unwrap_or(0);
            let filename = Path::new(local_path)
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("recording")
                .to_string();
            let now = Time::from(db.clocks().realtime());
            let job = TransferJob {
                id: Uuid::new_v4(),
                recording_id,
                local_path: local_path.to_string(),
                object_key: object_key_for(camera_id, start, &filename),
                url: None,
                size_bytes,
                state: TransferState::Pending,
                scheduled_cleanup: None,
                retry_count: 0,
                error_message: None,
                upload_started_at: None,
                upload_completed_at: None,
                cleanup_completed_at: None,
                created_at: now,
                updated_at: now,
            };
            db.lock().insert_transfer_job(&job)?;
            job
        }
    };

    db.lock().set_transfer_state(job.id, TransferState::Uploading)?;
    let content_type = content_type_for_extension(extension_of(local_path));
    let size = std::fs::metadata(local_path).map(|m| m.len()).unwrap_or(0);
    let timeout = put_timeout(size);

    let mut last_err = None;
    for attempt in 1..=UPLOAD_ATTEMPTS {
        let result = tokio::time::timeout(timeout, store.put(&job.object_key, Path::new(local_path), content_type)).await;
        match result {
            Ok(Ok(true)) => {
                let url = store.url(&job.object_key, false, crate::object_store::DEFAULT_URL_TTL).await.ok();
                db.lock().complete_upload(job.id, url.as_deref())?;
                db.lock().set_recording_storage(recording_id, StorageType::Cloud, &job.object_key)?;
                info!(%recording_id, key = %job.object_key, "uploaded recording to object store");
                if cleanup_local_after_upload {
                    tokio::time::sleep(POST_UPLOAD_SETTLE).await;
                    if let Err(e) = std::fs::remove_file(local_path) {
                        warn!(%recording_id, err = %e, "failed to delete local file after upload");
                    }
                }
                return Ok(());
            }
            Ok(Ok(false)) => {
                // Object store not configured: recording stays local; not a failure.
                db.lock().set_transfer_state(job.id, TransferState::Pending)?;
                return Ok(());
            }
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => last_err = Some(err!(DeadlineExceeded, msg("upload of {recording_id} timed out after {timeout:?}"))),
        }
        if attempt < UPLOAD_ATTEMPTS {
            tokio::time::sleep(BACKOFF_BASE * attempt).await;
        }
    }

    let e = last_err.unwrap_or_else(|| err!(Unavailable, msg("upload exhausted with no recorded error")));
    let retry_count = db.lock().fail_upload(job.id, &e.to_string())?;
    warn!(%recording_id, retry_count, err = %e, "upload attempt failed");
    Err(e)
}

/// Background reconciliation sweep: uploads up to [`SYNC_BATCH_SIZE`]
/// completed, local-only recordings that never got an immediate hand-off
/// (spec.md §4.5's 30-minute `syncRecordingsToCloud` job).
pub async fn sync_recordings_to_cloud<C: Clocks>(
    db: &Database<C>,
    store: &dyn ObjectStore,
    cleanup_local_after_upload: bool,
) -> Result<u32, Error> {
    let candidates = db.lock().list_sync_candidates(SYNC_BATCH_SIZE)?;
    let mut uploaded = 0;
    for recording in candidates {
        if recording.file_path.ends_with(".tmp") || !Path::new(&recording.file_path).exists() {
            continue;
        }
        match upload_recording(
            db,
            store,
            recording.id,
            recording.camera_id,
            recording.start,
            &recording.file_path,
            cleanup_local_after_upload,
        )
        .await
        {
            Ok(()) => uploaded += 1,
            Err(e) => warn!(recording_id = %recording.id, err = %e, "background cloud sync attempt failed"),
        }
    }
    Ok(uploaded)
}

/// Deletes local files for completed uploads once their 24h grace period has
/// elapsed, idempotently (spec.md §4.6's deferred cleanup).
pub fn run_cleanup_sweep<C: Clocks>(db: &Database<C>) -> Result<u32, Error> {
    let due = db.lock().list_due_cleanups()?;
    let mut cleaned = 0;
    for job in due {
        if Path::new(&job.local_path).exists() {
            if let Err(e) = std::fs::remove_file(&job.local_path) {
                warn!(job_id = %job.id, err = %e, "failed to delete local file during cleanup sweep");
                continue;
            }
        }
        db.lock().complete_cleanup(job.id)?;
        cleaned += 1;
    }
    Ok(cleaned)
}

/// Resets a failed transfer job so the next sweep retries it (operator action,
/// spec.md §4.6: "operators may reset retry_count").
pub fn reset_transfer(db: &Database<impl Clocks>, job_id: Uuid) -> Result<(), Error> {
    db.lock().reset_transfer_retry(job_id)
}
