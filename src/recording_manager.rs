// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Recording manager (C4): `startRecording`/`stopRecording`, a record task
//! per active recording, and the post-completion cloud hand-off of
//! spec.md §4.4.

use base::clock::Clocks;
use base::time::Time;
use base::{err, Error};
use db::types::{Quality, Recording, RecordingStatus, StorageType};
use db::Database;
use ffmpeg_sidecar::event::FfmpegEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::{CodecCache, Frame, Writer};
use crate::object_store::ObjectStore;
use crate::stream_manager::{probe_with_retries, spawn_capture};

const MAX_CONSECUTIVE_FAILURES: u32 = 30;
const READ_TIMEOUT: StdDuration = StdDuration::from_secs(2);
const LOG_CADENCE: u64 = 100;
const DEFAULT_FPS: f64 = 25.0;
const MAX_FPS: f64 = 60.0;
const FIRST_FRAME_TIMEOUT: StdDuration = StdDuration::from_secs(5);

struct ActiveRecording {
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

pub struct RecordingManager<C: Clocks = base::clock::RealClocks> {
    db: Arc<Database<C>>,
    media_root: PathBuf,
    codec_cache: Arc<CodecCache>,
    object_store: Arc<dyn ObjectStore>,
    cleanup_local_after_upload: bool,
    active: Mutex<HashMap<Uuid, Arc<ActiveRecording>>>,
}

/// Keeps only alphanumerics, space, dash, underscore (spec.md §4.4).
fn sanitize_camera_name(name: &str, camera_id: Uuid) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-' || *c == '_')
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        format!("Camera_{}", &camera_id.to_string()[..8])
    } else {
        cleaned
    }
}

pub(crate) fn timestamp_suffix(t: Time) -> String {
    jiff::Zoned::new(jiff::Timestamp::from_second(t.unix_seconds()).unwrap(), base::time::global_zone())
        .strftime("%Y%m%d_%H%M%S")
        .to_string()
}

impl<C: Clocks> RecordingManager<C> {
    pub fn new(
        db: Arc<Database<C>>,
        media_root: PathBuf,
        codec_cache: Arc<CodecCache>,
        object_store: Arc<dyn ObjectStore>,
        cleanup_local_after_upload: bool,
    ) -> Self {
        RecordingManager {
            db,
            media_root,
            codec_cache,
            object_store,
            cleanup_local_after_upload,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_recording(&self, camera_id: Uuid) -> bool {
        self.active.lock().contains_key(&camera_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn start_recording(
        &self,
        camera_id: Uuid,
        quality: Quality,
        duration_minutes: Option<u32>,
        name: Option<String>,
        schedule_id: Option<Uuid>,
        is_scheduled: bool,
    ) -> Result<Recording, Error> {
        if self.db.lock().has_active_recording(camera_id)? {
            return Err(err!(FailedPrecondition, msg("camera {camera_id} already has an active recording")));
        }
        let camera = self
            .db
            .lock()
            .get_camera(camera_id)?
            .ok_or_else(|| err!(NotFound, msg("camera {camera_id} not found")))?;
        let url = camera.url(quality)?;

        let now = Time::from(self.db.clocks().realtime());
        let safe_name = sanitize_camera_name(&camera.name, camera_id);
        let prefix = if is_scheduled { "SCHEDULED_" } else { "" };
        let base_name = name.unwrap_or_else(|| format!("{prefix}{safe_name}_{}", timestamp_suffix(now)));
        let dir = self.media_root.join("recordings").join(camera_id.to_string());
        std::fs::create_dir_all(&dir).map_err(|e| err!(Internal, msg("creating {}", dir.display()), source(e)))?;
        let temp_path = dir.join(format!("{base_name}.tmp"));

        if let Err(e) = probe_with_retries(&url).await {
            let recording = Recording {
                id: Uuid::new_v4(),
                camera_id,
                schedule_id,
                name: base_name.clone(),
                file_path: temp_path.to_string_lossy().into_owned(),
                storage_type: StorageType::Local,
                file_size: 0,
                frames_written: 0,
                duration: None,
                start: now,
                end: Some(now),
                status: RecordingStatus::Failed,
                resolution: None,
                frame_rate: None,
                codec: None,
                error_message: Some(e.to_string()),
                thumbnail_path: None,
                recorded_by_client: None,
                creator: None,
                created_at: now,
                updated_at: now,
            };
            self.db.lock().insert_recording(&recording)?;
            return Err(e);
        }

        let (width, height) = first_frame_dimensions(&url)?;
        let fps = DEFAULT_FPS.clamp(f64::MIN_POSITIVE, MAX_FPS);
        let candidates = self.codec_cache.probe(&dir, width, height, fps);
        let (writer, descriptor) = candidates
            .iter()
            .find_map(|c| crate::codec::open_writer(*c, &temp_path, width, height, fps).ok().map(|w| (w, *c)))
            .ok_or_else(|| err!(Internal, msg("no codec could open a writer for {width}x{height}@{fps}")))?;

        let recording = Recording {
            id: Uuid::new_v4(),
            camera_id,
            schedule_id,
            name: base_name,
            file_path: temp_path.to_string_lossy().into_owned(),
            storage_type: StorageType::Local,
            file_size: 0,
            frames_written: 0,
            duration: None,
            start: now,
            end: None,
            status: RecordingStatus::Recording,
            resolution: Some(format!("{width}x{height}")),
            frame_rate: Some(fps),
            codec: Some(descriptor.tag.to_string()),
            error_message: None,
            thumbnail_path: None,
            recorded_by_client: None,
            creator: None,
            created_at: now,
            updated_at: now,
        };
        self.db.lock().insert_recording(&recording)?;

        let running = Arc::new(AtomicBool::new(true));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let deadline = duration_minutes.map(|m| now + base::time::Duration(i64::from(m) * 60 * base::time::TIME_UNITS_PER_SEC));
        let active = Arc::new(ActiveRecording { running: running.clone(), stop_requested: stop_requested.clone(), join: Mutex::new(None) });

        let db = self.db.clone();
        let store = self.object_store.clone();
        let cleanup_local = self.cleanup_local_after_upload;
        let final_ext = descriptor.extension.to_string();
        let recording_id = recording.id;
        let rt = tokio::runtime::Handle::current();
        let running_for_thread = running.clone();
        let join = std::thread::spawn(move || {
            record_loop(
                url, writer, width, height, running_for_thread, stop_requested, deadline, db, recording_id, camera_id,
                temp_path, final_ext, store, cleanup_local, rt,
            );
        });
        *active.join.lock() = Some(join);
        self.active.lock().insert(camera_id, active);

        info!(%camera_id, recording_id = %recording.id, "recording started");
        Ok(recording)
    }

    /// Signals the active record task to stop; it finishes the file and
    /// classifies completion on its own.
    pub fn stop_recording(&self, camera_id: Uuid) -> Result<(), Error> {
        let active = self
            .active
            .lock()
            .remove(&camera_id)
            .ok_or_else(|| err!(FailedPrecondition, msg("camera {camera_id} has no active recording")))?;
        active.stop_requested.store(true, Ordering::SeqCst);
        active.running.store(false, Ordering::SeqCst);
        if let Some(join) = active.join.lock().take() {
            let _ = join.join();
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        let all: Vec<_> = self.active.lock().drain().map(|(_, a)| a).collect();
        for active in all {
            active.stop_requested.store(true, Ordering::SeqCst);
            active.running.store(false, Ordering::SeqCst);
            if let Some(join) = active.join.lock().take() {
                let _ = join.join();
            }
        }
    }
}

/// Opens a short-lived probe capture to learn the camera's frame dimensions
/// for codec-writer selection (spec.md §4.4: "read probe frame for fallback
/// resolution").
fn first_frame_dimensions(url: &str) -> Result<(u32, u32), Error> {
    let (tx, rx) = std::sync::mpsc::channel();
    let url = url.to_string();
    std::thread::spawn(move || {
        let result = (|| -> Result<(u32, u32), Error> {
            let mut child = spawn_capture(&url)?;
            let events = child.iter().map_err(|e| err!(Internal, msg("reading ffmpeg events"), source(e)))?;
            for event in events {
                if let FfmpegEvent::OutputFrame(f) = event {
                    if !f.data.is_empty() {
                        let _ = child.kill();
                        return Ok((f.width, f.height));
                    }
                }
            }
            Err(err!(Unavailable, msg("no frame received from {url}")))
        })();
        let _ = tx.send(result);
    });
    rx.recv_timeout(FIRST_FRAME_TIMEOUT)
        .unwrap_or_else(|_| Err(err!(DeadlineExceeded, msg("timed out reading first frame"))))
}

#[allow(clippy::too_many_arguments)]
fn record_loop<C: Clocks>(
    url: String,
    mut writer: Box<dyn Writer>,
    width: u32,
    height: u32,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    deadline: Option<Time>,
    db: Arc<Database<C>>,
    recording_id: Uuid,
    camera_id: Uuid,
    temp_path: PathBuf,
    final_ext: String,
    store: Arc<dyn ObjectStore>,
    cleanup_local: bool,
    rt: tokio::runtime::Handle,
) {
    let mut consecutive_failures: u32 = 0;
    let mut last_log = 0u64;
    let was_stopped = || stop_requested.load(Ordering::SeqCst);

    let child = match spawn_capture(&url) {
        Ok(c) => c,
        Err(e) => {
            warn!(%camera_id, err = %e, "record task failed to start ffmpeg");
            finish_recording(&db, recording_id, &temp_path, &final_ext, writer, Some(e.to_string()), was_stopped(), &store, cleanup_local, &rt);
            return;
        }
    };
    let mut child = child;
    let events = match child.iter() {
        Ok(e) => e,
        Err(e) => {
            warn!(%camera_id, err = %e, "record task failed to read ffmpeg events");
            let _ = child.kill();
            finish_recording(&db, recording_id, &temp_path, &final_ext, writer, Some(e.to_string()), was_stopped(), &store, cleanup_local, &rt);
            return;
        }
    };

    let mut read_deadline = std::time::Instant::now() + READ_TIMEOUT;
    for event in events {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if let Some(d) = deadline {
            if Time::from(db.clocks().realtime()) >= d {
                break;
            }
        }
        match event {
            FfmpegEvent::OutputFrame(f) => {
                read_deadline = std::time::Instant::now() + READ_TIMEOUT;
                let frame = Frame { width: f.width, height: f.height, rgb: f.data };
                if frame.width != width || frame.height != height || !frame.is_valid() {
                    consecutive_failures += 1;
                    continue;
                }
                match writer.write_frame(&frame) {
                    Ok(()) => {
                        consecutive_failures = 0;
                        let written = writer.frames_written();
                        if written - last_log >= LOG_CADENCE {
                            info!(%recording_id, frames = written, "recording progress");
                            last_log = written;
                        }
                    }
                    Err(e) => {
                        warn!(%recording_id, err = %e, "frame write failed");
                        consecutive_failures += 1;
                    }
                }
            }
            FfmpegEvent::Error(_) => consecutive_failures += 1,
            FfmpegEvent::Done => break,
            _ => {}
        }
        if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            warn!(%recording_id, "record task exceeded consecutive failure threshold");
            break;
        }
        if std::time::Instant::now() > read_deadline {
            consecutive_failures += 1;
            read_deadline = std::time::Instant::now() + READ_TIMEOUT;
        }
    }
    let _ = child.kill();
    finish_recording(&db, recording_id, &temp_path, &final_ext, writer, None, was_stopped(), &store, cleanup_local, &rt);
}

#[allow(clippy::too_many_arguments)]
fn finish_recording<C: Clocks>(
    db: &Arc<Database<C>>,
    recording_id: Uuid,
    temp_path: &std::path::Path,
    final_ext: &str,
    writer: Box<dyn Writer>,
    forced_error: Option<String>,
    was_stopped: bool,
    store: &Arc<dyn ObjectStore>,
    cleanup_local: bool,
    rt: &tokio::runtime::Handle,
) {
    let frames_written = writer.frames_written() as i64;
    if let Err(e) = writer.close() {
        warn!(%recording_id, err = %e, "error closing writer");
    }
    let final_path = temp_path.with_extension(final_ext);
    let file_size = std::fs::rename(temp_path, &final_path)
        .and_then(|_| std::fs::metadata(&final_path))
        .map(|m| m.len() as i64)
        .unwrap_or(0);

    let recording = match db.lock().get_recording(recording_id) {
        Ok(Some(r)) => r,
        _ => return,
    };
    let end = Time::from(db.clocks().realtime());
    let duration = end - recording.start;

    let path_str = final_path.to_string_lossy().into_owned();
    let _ = db.lock().set_recording_storage(recording_id, StorageType::Local, &path_str);

    // An operator-requested stop always lands in `stopped`, regardless of
    // the size/frame thresholds that otherwise gate completed vs. failed
    // (spec.md §3, §5).
    if was_stopped {
        if let Err(e) = db.lock().mark_recording_stopped(recording_id, end, duration, file_size, frames_written) {
            warn!(%recording_id, err = %e, "failed to persist recording stop");
            return;
        }
        info!(%recording_id, frames_written, file_size, "recording stopped");
        rt.block_on(crate::archival::upload_recording(
            db,
            store.as_ref(),
            recording_id,
            recording.camera_id,
            recording.start,
            &path_str,
            cleanup_local,
        ))
        .ok();
        return;
    }

    let meets_thresholds = file_size > db::types::MIN_COMPLETED_FILE_SIZE_BYTES && frames_written > db::types::MIN_COMPLETED_FRAMES;
    if let Some(msg) = forced_error.filter(|_| !meets_thresholds) {
        let _ = db.lock().update_recording_status(recording_id, RecordingStatus::Failed, Some(&msg));
        return;
    }
    if !meets_thresholds {
        let _ = db.lock().update_recording_status(
            recording_id,
            RecordingStatus::Failed,
            Some("recording did not meet minimum size/frame thresholds"),
        );
        return;
    }

    let duration_secs = (duration.0 as f64 / base::time::TIME_UNITS_PER_SEC as f64).max(1.0);
    let frame_rate = if recording.frame_rate.is_none() {
        Some(frames_written as f64 / duration_secs)
    } else {
        None
    };
    if let Err(e) = db.lock().complete_recording(recording_id, end, duration, file_size, frames_written, frame_rate) {
        warn!(%recording_id, err = %e, "failed to persist recording completion");
        return;
    }
    info!(%recording_id, frames_written, file_size, "recording completed");

    rt.block_on(crate::archival::upload_recording(
        db,
        store.as_ref(),
        recording_id,
        recording.camera_id,
        recording.start,
        &path_str,
        cleanup_local,
    ))
    .ok();
}
