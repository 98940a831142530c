// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-`(camera, quality)` live-capture state machine (C3).
//!
//! Each active stream owns exactly one reader task, which runs an `ffmpeg`
//! subprocess via `ffmpeg-sidecar` (there's no maintained pure-Rust decoder
//! that turns an arbitrary camera's RTSP/H.264 feed into RGB frames) and
//! republishes the latest decoded frame into a mutex-guarded slot that
//! `getFrame` callers (C7's live endpoint, C4's record task) read without
//! blocking the writer (spec.md §5: "single-writer/multi-reader per stream
//! key").

use base::clock::Clocks;
use base::time::Time;
use base::{err, Error};
use db::types::{Camera, Quality};
use db::Database;
use ffmpeg_sidecar::child::FfmpegChild;
use ffmpeg_sidecar::command::FfmpegCommand;
use ffmpeg_sidecar::event::FfmpegEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::Frame;

/// Target output pacing (spec.md §4.3: "paces ~25 FPS").
const TARGET_FPS: f64 = 25.0;

const PROBE_ATTEMPTS: u32 = 5;
const PROBE_GAP: StdDuration = StdDuration::from_secs(2);
const PROBE_READ_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 10;
const UNHEALTHY_AFTER: StdDuration = StdDuration::from_secs(30);
const RECOVER_SETTLE: StdDuration = StdDuration::from_secs(2);

/// Caps the decoded frame size (spec.md §4.3: "clamp to 1920x1080 max").
const MAX_WIDTH: u32 = 1920;
const MAX_HEIGHT: u32 = 1080;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct StreamKey {
    pub camera_id: Uuid,
    pub quality: Quality,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamStatus {
    Inactive,
    Unhealthy,
    Healthy,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Inactive => "inactive",
            StreamStatus::Unhealthy => "unhealthy",
            StreamStatus::Healthy => "healthy",
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamHealth {
    pub status: StreamStatus,
    pub last_update: Option<Time>,
    pub viewers: u32,
    pub frame_count: u64,
}

/// Shared state for one active reader task; cheaply `Clone`-able via `Arc`.
struct StreamHandle {
    latest: Mutex<Option<Arc<Frame>>>,
    last_update_90k: AtomicI64,
    frame_count: AtomicU64,
    viewers: AtomicU32,
    running: Arc<AtomicBool>,
    child: Arc<Mutex<Option<FfmpegChild>>>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl StreamHandle {
    fn health(&self, now: Time) -> StreamHealth {
        let last = self.last_update_90k.load(Ordering::Relaxed);
        let last_update = if last == 0 { None } else { Some(Time(last)) };
        let status = match last_update {
            None => StreamStatus::Inactive,
            Some(t) => {
                let age = now - t;
                if age.0 >= (UNHEALTHY_AFTER.as_secs() as i64) * base::time::TIME_UNITS_PER_SEC {
                    StreamStatus::Unhealthy
                } else {
                    StreamStatus::Healthy
                }
            }
        };
        StreamHealth {
            status,
            last_update,
            viewers: self.viewers.load(Ordering::Relaxed),
            frame_count: self.frame_count.load(Ordering::Relaxed),
        }
    }
}

/// Builds the `ffmpeg` subprocess used both to probe connectivity and to
/// read frames, grounded on `make87-apps-rtsp-camera-driver-rgb`'s
/// `spawn_ffmpeg_reader`.
pub(crate) fn spawn_capture(url: &str) -> Result<FfmpegChild, Error> {
    FfmpegCommand::new()
        .args(["-rtsp_transport", "tcp", "-timeout", "5000000", "-allowed_media_types", "video"])
        .input(url)
        .args([
            "-vf",
            &format!("scale='min({MAX_WIDTH},iw)':'min({MAX_HEIGHT},ih)':force_original_aspect_ratio=decrease"),
        ])
        .fps_mode("passthrough")
        .rawvideo()
        .spawn()
        .map_err(|e| err!(Unavailable, msg("spawning ffmpeg capture for {url}"), source(e)))
}

/// Reads `FfmpegEvent`s on a dedicated thread until the first non-empty
/// decoded frame arrives or `timeout` elapses. Used for connectivity probing
/// (spec.md §4.3 `startStream`/`recoverStream`), never for ongoing capture.
fn probe_once(url: &str, timeout: StdDuration) -> Result<(), Error> {
    let (tx, rx) = std::sync::mpsc::channel();
    let url = url.to_string();
    std::thread::spawn(move || {
        let result = (|| -> Result<(), Error> {
            let mut child = spawn_capture(&url)?;
            let events = child
                .iter()
                .map_err(|e| err!(Internal, msg("reading ffmpeg events from {url}"), source(e)))?;
            for event in events {
                if let FfmpegEvent::OutputFrame(frame) = event {
                    if !frame.data.is_empty() {
                        let _ = child.kill();
                        return Ok(());
                    }
                }
            }
            Err(err!(Unavailable, msg("ffmpeg for {url} produced no frame before exiting")))
        })();
        let _ = tx.send(result);
    });
    rx.recv_timeout(timeout)
        .unwrap_or_else(|_| Err(err!(DeadlineExceeded, msg("probe of {url} timed out after {timeout:?}"))))
}

pub(crate) async fn probe_with_retries(url: &str) -> Result<(), Error> {
    let mut last_err = None;
    for attempt in 1..=PROBE_ATTEMPTS {
        let url = url.to_string();
        let result = tokio::task::spawn_blocking(move || probe_once(&url, PROBE_READ_TIMEOUT))
            .await
            .unwrap_or_else(|e| Err(err!(Internal, msg("probe task panicked"), source(e))));
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, err = %e, "stream probe attempt failed");
                last_err = Some(e);
            }
        }
        if attempt < PROBE_ATTEMPTS {
            tokio::time::sleep(PROBE_GAP).await;
        }
    }
    Err(last_err.unwrap_or_else(|| err!(Unavailable, msg("probe exhausted with no recorded error"))))
}

/// Owns every active `(camera, quality)` reader task.
pub struct StreamManager<C: Clocks = base::clock::RealClocks> {
    db: Arc<Database<C>>,
    clocks: C,
    streams: Mutex<HashMap<StreamKey, Arc<StreamHandle>>>,
}

impl<C: Clocks> StreamManager<C> {
    pub fn new(db: Arc<Database<C>>, clocks: C) -> Self {
        StreamManager {
            db,
            clocks,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn camera(&self, camera_id: Uuid) -> Result<Camera, Error> {
        self.db
            .lock()
            .get_camera(camera_id)?
            .ok_or_else(|| err!(NotFound, msg("camera {camera_id} not found")))
    }

    /// Starts the reader task for `key` if not already running. Idempotent,
    /// but always re-runs the connectivity probe first: a viewer joining an
    /// already-active stream must still get a 503 if the camera has since
    /// gone unreachable (spec.md §4.7 step 2).
    pub async fn start_stream(&self, camera_id: Uuid, quality: Quality) -> Result<(), Error> {
        let key = StreamKey { camera_id, quality };
        let camera = self.camera(camera_id)?;
        let url = camera.url(quality)?;

        probe_with_retries(&url).await?;

        if self.streams.lock().contains_key(&key) {
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let child_slot: Arc<Mutex<Option<FfmpegChild>>> = Arc::new(Mutex::new(None));
        let handle = Arc::new(StreamHandle {
            latest: Mutex::new(None),
            last_update_90k: AtomicI64::new(0),
            frame_count: AtomicU64::new(0),
            viewers: AtomicU32::new(0),
            running: running.clone(),
            child: child_slot.clone(),
            join: Mutex::new(None),
        });

        let reader_handle = handle.clone();
        let reader_url = url.clone();
        let db = self.db.clone();
        let join = std::thread::spawn(move || {
            reader_loop(reader_url, running, child_slot, reader_handle, db, camera_id);
        });
        *handle.join.lock() = Some(join);

        self.streams.lock().insert(key, handle);
        self.db.lock().update_camera_stream_flags(camera_id, true, true, true)?;
        info!(%camera_id, ?quality, "stream started");
        Ok(())
    }

    /// Stops the reader task for `key`, releasing the capture handle.
    pub fn stop_stream(&self, camera_id: Uuid, quality: Quality) -> Result<(), Error> {
        let key = StreamKey { camera_id, quality };
        let handle = self.streams.lock().remove(&key);
        if let Some(handle) = handle {
            stop_handle(&handle);
        }
        self.db.lock().update_camera_stream_flags(camera_id, true, true, false)?;
        Ok(())
    }

    /// Returns the most recently decoded frame, if any.
    pub fn get_frame(&self, camera_id: Uuid, quality: Quality) -> Option<Arc<Frame>> {
        let key = StreamKey { camera_id, quality };
        self.streams.lock().get(&key)?.latest.lock().clone()
    }

    /// Stops, re-probes, and restarts the stream, with a settle delay before
    /// the caller may rely on fresh frames (spec.md §4.3 `recoverStream`).
    pub async fn recover_stream(&self, camera_id: Uuid, quality: Quality) -> Result<(), Error> {
        let _ = self.stop_stream(camera_id, quality);
        let camera = self.camera(camera_id)?;
        let url = camera.url(quality)?;
        probe_with_retries(&url).await?;
        self.start_stream(camera_id, quality).await?;
        tokio::time::sleep(RECOVER_SETTLE).await;
        Ok(())
    }

    pub fn stream_health(&self, camera_id: Uuid, quality: Quality) -> StreamHealth {
        let key = StreamKey { camera_id, quality };
        let now = Time::from(self.clocks.realtime());
        match self.streams.lock().get(&key) {
            Some(handle) => handle.health(now),
            None => StreamHealth {
                status: StreamStatus::Inactive,
                last_update: None,
                viewers: 0,
                frame_count: 0,
            },
        }
    }

    pub fn add_viewer(&self, camera_id: Uuid, quality: Quality) {
        let key = StreamKey { camera_id, quality };
        if let Some(handle) = self.streams.lock().get(&key) {
            handle.viewers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decrements the viewer count; stops the stream if it reaches zero
    /// (spec.md §4.3: "zero-on-remove stops stream").
    pub fn remove_viewer(&self, camera_id: Uuid, quality: Quality) {
        let key = StreamKey { camera_id, quality };
        let should_stop = {
            let streams = self.streams.lock();
            match streams.get(&key) {
                Some(handle) => handle.viewers.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1))).map(|prev| prev <= 1).unwrap_or(false),
                None => false,
            }
        };
        if should_stop {
            let _ = self.stop_stream(camera_id, quality);
        }
    }

    /// Stops every active reader task (graceful shutdown, spec.md §5).
    pub fn stop_all(&self) {
        let handles: Vec<_> = self.streams.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            stop_handle(&handle);
        }
    }
}

fn stop_handle(handle: &Arc<StreamHandle>) {
    handle.running.store(false, Ordering::SeqCst);
    if let Some(child) = handle.child.lock().as_mut() {
        let _ = child.kill();
    }
    if let Some(join) = handle.join.lock().take() {
        let _ = join.join();
    }
}

fn reader_loop<C: Clocks>(
    url: String,
    running: Arc<AtomicBool>,
    child_slot: Arc<Mutex<Option<FfmpegChild>>>,
    handle: Arc<StreamHandle>,
    db: Arc<Database<C>>,
    camera_id: Uuid,
) {
    let mut consecutive_failures: u32 = 0;
    let min_interval = StdDuration::from_secs_f64(1.0 / TARGET_FPS);
    let mut last_publish = std::time::Instant::now() - min_interval;

    let child = match spawn_capture(&url) {
        Ok(c) => c,
        Err(e) => {
            warn!(%camera_id, err = %e, "stream reader failed to start ffmpeg");
            mark_error(&db, camera_id);
            return;
        }
    };
    *child_slot.lock() = Some(child);

    let events = {
        let mut guard = child_slot.lock();
        let child = guard.as_mut().expect("just inserted");
        child.iter()
    };
    let events = match events {
        Ok(e) => e,
        Err(e) => {
            warn!(%camera_id, err = %e, "stream reader failed to read ffmpeg events");
            mark_error(&db, camera_id);
            return;
        }
    };

    for event in events {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match event {
            FfmpegEvent::OutputFrame(f) => {
                let frame = Frame { width: f.width, height: f.height, rgb: f.data };
                if !frame.is_valid() {
                    consecutive_failures += 1;
                } else {
                    consecutive_failures = 0;
                    let elapsed = last_publish.elapsed();
                    if elapsed < min_interval {
                        std::thread::sleep(min_interval - elapsed);
                    }
                    last_publish = std::time::Instant::now();
                    *handle.latest.lock() = Some(Arc::new(frame));
                    handle.frame_count.fetch_add(1, Ordering::Relaxed);
                    handle.last_update_90k.store(Time::from(db.clocks().realtime()).0, Ordering::Relaxed);
                }
            }
            FfmpegEvent::Error(e) => {
                warn!(%camera_id, %e, "ffmpeg reported an error");
                consecutive_failures += 1;
            }
            FfmpegEvent::Done => break,
            _ => {}
        }
        if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            warn!(%camera_id, "stream exceeded consecutive failure threshold, terminating");
            mark_error(&db, camera_id);
            break;
        }
    }
    if let Some(mut child) = child_slot.lock().take() {
        let _ = child.kill();
    }
}

fn mark_error<C: Clocks>(db: &Arc<Database<C>>, camera_id: Uuid) {
    let _ = db.lock().update_camera_stream_flags(camera_id, true, false, false);
}
