// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Remote-agent protocol, agent side (C8, spec.md §4.8): an off-box process
//! that owns capture and upload for its assigned cameras, coordinating with
//! the central service over HTTP. Grounded on `original_source/Backend/
//! local_client/sync_service.py` for the pull/register/status/heartbeat
//! cadence and the disk-backed pending-status queue's retry semantics.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base::{bail, err, Error};
use bpaf::Bpaf;
use ffmpeg_sidecar::event::FfmpegEvent;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::{open_writer, CodecCache, Frame, Writer};
use crate::stream_manager::{probe_with_retries, spawn_capture};

const SCHEDULE_POLL: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_secs(15);
const MISFIRE_GRACE_SECS: u32 = 300;
const MAX_STATUS_RETRIES: u32 = 5;
const MAX_CONSECUTIVE_FAILURES: u32 = 30;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_FPS: f64 = 25.0;

/// Runs the detached capture/upload agent for cameras assigned to this
/// client by the central service.
#[derive(Bpaf, Debug)]
#[bpaf(options("agent"))]
pub struct Args {
    /// Base URL of the central service, e.g. `https://nvr.example.com`.
    #[bpaf(long, argument("URL"))]
    server_url: String,

    /// Opaque bearer token identifying this `LocalRecordingClient`.
    #[bpaf(long, argument("TOKEN"))]
    token: String,

    /// Directory recordings and the pending-upload queue are kept under.
    #[bpaf(long, argument("PATH"), fallback("/var/lib/moonfire-nvr/agent".into()))]
    media_root: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| err!(Internal, msg("building tokio runtime"), source(e)))?;
    rt.block_on(async_run(args))
}

#[derive(Debug, Deserialize, Clone)]
struct AgentCamera {
    id: Uuid,
    name: String,
    host: Option<String>,
    port: Option<u16>,
    rtsp_path: Option<String>,
    username: Option<String>,
    password: Option<String>,
    main_url: Option<String>,
    sub_url: Option<String>,
}

impl AgentCamera {
    /// Mirrors `db::types::Camera::url`'s sub→main→host/port/path fallback.
    fn url(&self) -> Result<String, Error> {
        if let Some(u) = &self.main_url {
            return Ok(u.clone());
        }
        if let Some(u) = &self.sub_url {
            return Ok(u.clone());
        }
        let (host, port, path) = match (&self.host, self.port, &self.rtsp_path) {
            (Some(h), Some(p), Some(path)) => (h, p, path),
            _ => return Err(err!(FailedPrecondition, msg("camera {} has no usable RTSP URL", self.id))),
        };
        let auth = match (&self.username, &self.password) {
            (Some(u), Some(p)) => format!("{u}:{p}@"),
            _ => String::new(),
        };
        Ok(format!("rtsp://{auth}{host}:{port}{path}"))
    }
}

#[derive(Debug, Deserialize, Clone)]
struct AgentSchedule {
    id: Uuid,
    camera_id: Uuid,
    kind: String,
    start_time_sec: u32,
    end_time_sec: u32,
    start_date: Option<String>,
    weekdays: u8,
    active: bool,
    camera: AgentCamera,
}

impl AgentSchedule {
    fn duration_secs(&self) -> u32 {
        if self.end_time_sec > self.start_time_sec {
            self.end_time_sec - self.start_time_sec
        } else {
            (86400 - self.start_time_sec) + self.end_time_sec
        }
    }

    /// Same open-window-with-misfire-grace test as the central scheduler's
    /// `is_within_window`, evaluated against this agent's local clock.
    fn is_due(&self, now: &jiff::Zoned) -> bool {
        if !self.active {
            return false;
        }
        let seconds_today = now.timestamp().as_second().rem_euclid(86400) as u32;
        match self.kind.as_str() {
            "once" => {
                let Some(start_date) = &self.start_date else { return false };
                let Ok(start_date) = start_date.parse::<jiff::civil::Date>() else { return false };
                now.date() == start_date
                    && seconds_today >= self.start_time_sec
                    && seconds_today < self.start_time_sec.saturating_add(MISFIRE_GRACE_SECS)
            }
            "daily" => seconds_today >= self.start_time_sec && seconds_today < self.start_time_sec.saturating_add(MISFIRE_GRACE_SECS),
            "weekly" => {
                let idx = match now.date().weekday() {
                    jiff::civil::Weekday::Monday => 0,
                    jiff::civil::Weekday::Tuesday => 1,
                    jiff::civil::Weekday::Wednesday => 2,
                    jiff::civil::Weekday::Thursday => 3,
                    jiff::civil::Weekday::Friday => 4,
                    jiff::civil::Weekday::Saturday => 5,
                    jiff::civil::Weekday::Sunday => 6,
                };
                (self.weekdays & (1 << idx)) != 0
                    && seconds_today >= self.start_time_sec
                    && seconds_today < self.start_time_sec.saturating_add(MISFIRE_GRACE_SECS)
            }
            "continuous" => true,
            _ => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct PendingStatusUpdate {
    recording_id: Uuid,
    new_status: String,
    #[serde(default)]
    frames_written: Option<i64>,
    #[serde(default)]
    file_size: Option<i64>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    object_key: Option<String>,
    #[serde(default)]
    attempts: u32,
}

/// A disk-backed FIFO of status pushes that couldn't reach the central
/// service yet, so a network blip doesn't lose a completed recording's
/// status. One JSON array file, rewritten atomically on every drain pass.
struct PendingQueue {
    path: PathBuf,
    items: SyncMutex<Vec<PendingStatusUpdate>>,
}

impl PendingQueue {
    fn open(media_root: &Path) -> Self {
        let path = media_root.join("pending_uploads").join("status_queue.json");
        let items = std::fs::read(&path)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default();
        PendingQueue { path, items: SyncMutex::new(items) }
    }

    fn push(&self, update: PendingStatusUpdate) {
        let mut items = self.items.lock();
        items.push(update);
        self.persist(&items);
    }

    fn persist(&self, items: &[PendingStatusUpdate]) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let buf = match serde_json::to_vec(items) {
            Ok(buf) => buf,
            Err(_) => return,
        };
        let result = (|| -> std::io::Result<()> {
            use std::io::Write;
            let mut file = std::fs::File::create(&self.path)?;
            file.write_all(&buf)?;
            file.sync_all()
        })();
        if let Err(e) = result {
            warn!(err = %e, "failed to persist pending status queue");
        }
    }

    fn snapshot(&self) -> Vec<PendingStatusUpdate> {
        self.items.lock().clone()
    }

    /// Replaces the queue contents after a drain pass: successes and
    /// attempts-exhausted entries are dropped, the rest kept for retry.
    fn replace(&self, remaining: Vec<PendingStatusUpdate>) {
        let mut items = self.items.lock();
        *items = remaining;
        self.persist(&items);
    }
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let mut int = signal(SignalKind::interrupt()).map_err(|e| err!(Internal, msg("installing SIGINT handler"), source(e)))?;
    let mut term = signal(SignalKind::terminate()).map_err(|e| err!(Internal, msg("installing SIGTERM handler"), source(e)))?;

    tokio::pin! {
        let inner = inner(&args, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => { info!("received SIGINT; shutting down gracefully. Send another to exit immediately."); shutdown_tx.take(); }
        _ = term.recv() => { info!("received SIGTERM; shutting down gracefully. Send another to exit immediately."); shutdown_tx.take(); }
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(args: &Args, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    base::time::init_zone(jiff::tz::TimeZone::system);
    std::fs::create_dir_all(&args.media_root)
        .map_err(|e| err!(Internal, msg("creating {}", args.media_root.display()), source(e)))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| err!(Internal, msg("building HTTP client"), source(e)))?;

    let state = Arc::new(AgentState {
        client,
        server_url: args.server_url.trim_end_matches('/').to_string(),
        token: args.token.clone(),
        media_root: args.media_root.clone(),
        codec_cache: Arc::new(CodecCache::new()),
        schedules: AsyncMutex::new(Vec::new()),
        running: AsyncMutex::new(HashSet::new()),
        queue: PendingQueue::open(&args.media_root),
    });

    if let Err(e) = state.pull_schedules().await {
        warn!(err = %e, "initial schedule pull failed; will retry on the next tick");
    }

    let mut schedule_tick = tokio::time::interval(SCHEDULE_POLL);
    let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut queue_tick = tokio::time::interval(QUEUE_DRAIN_INTERVAL);
    let mut trigger_tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = schedule_tick.tick() => {
                if let Err(e) = state.pull_schedules().await {
                    warn!(err = %e, "schedule pull failed");
                }
            }
            _ = heartbeat_tick.tick() => {
                if let Err(e) = state.send_heartbeat().await {
                    warn!(err = %e, "heartbeat failed");
                }
            }
            _ = queue_tick.tick() => {
                state.drain_pending_queue().await;
            }
            _ = trigger_tick.tick() => {
                state.clone().trigger_tick().await;
            }
            _ = shutdown_rx.as_future() => {
                info!("agent shutting down");
                break;
            }
        }
    }
    Ok(0)
}

struct AgentState {
    client: reqwest::Client,
    server_url: String,
    token: String,
    media_root: PathBuf,
    codec_cache: Arc<CodecCache>,
    schedules: AsyncMutex<Vec<AgentSchedule>>,
    running: AsyncMutex<HashSet<Uuid>>,
    queue: PendingQueue,
}

impl AgentState {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    async fn pull_schedules(&self) -> Result<(), Error> {
        let resp = self
            .client
            .get(self.url("/local-client/schedules"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("pulling schedules"), source(e)))?;
        let schedules: Vec<AgentSchedule> = resp
            .error_for_status()
            .map_err(|e| err!(Unavailable, msg("pulling schedules"), source(e)))?
            .json()
            .await
            .map_err(|e| err!(Internal, msg("decoding schedules response"), source(e)))?;
        info!(count = schedules.len(), "pulled schedules");
        *self.schedules.lock().await = schedules;
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), Error> {
        let active = self.running.lock().await.len();
        let body = serde_json::json!({
            "active_recordings": active,
            "system_info": {
                "hostname": hostname(),
                "platform": std::env::consts::OS,
                "free_disk_gb": fs_free_gb(&self.media_root),
                "cpu_percent": serde_json::Value::Null,
            }
        });
        self.client
            .post(self.url("/local-client/heartbeat"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("sending heartbeat"), source(e)))?
            .error_for_status()
            .map_err(|e| err!(Unavailable, msg("sending heartbeat"), source(e)))?;
        Ok(())
    }

    async fn trigger_tick(self: Arc<Self>) {
        let now = jiff::Zoned::new(jiff::Timestamp::now(), base::time::global_zone());
        let due: Vec<AgentSchedule> = {
            let schedules = self.schedules.lock().await;
            schedules.iter().filter(|s| s.is_due(&now)).cloned().collect()
        };
        for schedule in due {
            let already_running = self.running.lock().await.contains(&schedule.id);
            if already_running {
                continue;
            }
            self.running.lock().await.insert(schedule.id);
            let this = self.clone();
            tokio::spawn(async move {
                this.run_scheduled_recording(schedule.clone()).await;
                this.running.lock().await.remove(&schedule.id);
            });
        }
    }

    async fn register_recording(&self, camera_id: Uuid, schedule_id: Uuid) -> Result<Uuid, Error> {
        #[derive(Serialize)]
        struct Req {
            camera_id: Uuid,
            schedule_id: Uuid,
        }
        #[derive(Deserialize)]
        struct Resp {
            recording_id: Uuid,
        }
        let resp: Resp = self
            .client
            .post(self.url("/local-client/recordings/register"))
            .bearer_auth(&self.token)
            .json(&Req { camera_id, schedule_id })
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("registering recording"), source(e)))?
            .error_for_status()
            .map_err(|e| err!(Unavailable, msg("registering recording"), source(e)))?
            .json()
            .await
            .map_err(|e| err!(Internal, msg("decoding register response"), source(e)))?;
        Ok(resp.recording_id)
    }

    async fn run_scheduled_recording(&self, schedule: AgentSchedule) {
        let recording_id = match self.register_recording(schedule.camera_id, schedule.id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(schedule_id = %schedule.id, err = %e, "failed to register recording");
                return;
            }
        };

        let duration_minutes = if schedule.kind == "continuous" { 60 } else { (schedule.duration_secs() / 60).max(1) };
        let dir = self.media_root.join("recordings").join(schedule.camera_id.to_string());
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(err = %e, "failed to create recording dir");
            return;
        }

        let url = match schedule.camera.url() {
            Ok(u) => u,
            Err(e) => {
                self.push_status(PendingStatusUpdate {
                    recording_id,
                    new_status: "failed".to_string(),
                    error_message: Some(e.to_string()),
                    ..Default::default()
                })
                .await;
                return;
            }
        };

        if let Err(e) = probe_with_retries(&url).await {
            self.push_status(PendingStatusUpdate {
                recording_id,
                new_status: "failed".to_string(),
                error_message: Some(e.to_string()),
                ..Default::default()
            })
            .await;
            return;
        }

        let temp_path = dir.join(format!("{recording_id}.tmp"));
        let codec_cache = self.codec_cache.clone();
        let deadline = std::time::Instant::now() + Duration::from_secs(u64::from(duration_minutes) * 60);
        let result = tokio::task::spawn_blocking(move || record_blocking(url, temp_path, codec_cache, deadline)).await;

        match result {
            Ok(Ok(outcome)) => {
                self.finish_local_recording(recording_id, outcome).await;
            }
            Ok(Err(e)) => {
                self.push_status(PendingStatusUpdate {
                    recording_id,
                    new_status: "failed".to_string(),
                    error_message: Some(e.to_string()),
                    ..Default::default()
                })
                .await;
            }
            Err(e) => {
                warn!(%recording_id, err = %e, "record task panicked");
            }
        }
    }

    async fn finish_local_recording(&self, recording_id: Uuid, outcome: RecordOutcome) {
        let object_key = upload_if_configured(&outcome.final_path, recording_id).await;
        self.push_status(PendingStatusUpdate {
            recording_id,
            new_status: "completed".to_string(),
            frames_written: Some(outcome.frames_written),
            file_size: Some(outcome.file_size),
            object_key,
            ..Default::default()
        })
        .await;
    }

    /// Queues a status update and attempts an immediate send so a healthy
    /// link doesn't wait for the next drain tick.
    async fn push_status(&self, update: PendingStatusUpdate) {
        if self.send_status(&update).await.is_ok() {
            return;
        }
        self.queue.push(update);
    }

    async fn send_status(&self, update: &PendingStatusUpdate) -> Result<(), Error> {
        self.client
            .post(self.url("/local-client/recordings/status"))
            .bearer_auth(&self.token)
            .json(update)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("pushing recording status"), source(e)))?
            .error_for_status()
            .map_err(|e| err!(Unavailable, msg("pushing recording status"), source(e)))?;
        Ok(())
    }

    /// Retries every queued status push, dropping entries once they exceed
    /// [`MAX_STATUS_RETRIES`] (spec.md §4.8: "5-attempt retry cap").
    async fn drain_pending_queue(&self) {
        let pending = self.queue.snapshot();
        if pending.is_empty() {
            return;
        }
        let mut remaining = Vec::new();
        for mut update in pending {
            match self.send_status(&update).await {
                Ok(()) => {}
                Err(e) => {
                    update.attempts += 1;
                    if update.attempts >= MAX_STATUS_RETRIES {
                        warn!(recording_id = %update.recording_id, err = %e, "dropping status update after exhausting retries");
                    } else {
                        remaining.push(update);
                    }
                }
            }
        }
        self.queue.replace(remaining);
    }
}

impl Default for PendingStatusUpdate {
    fn default() -> Self {
        PendingStatusUpdate {
            recording_id: Uuid::nil(),
            new_status: String::new(),
            frames_written: None,
            file_size: None,
            error_message: None,
            object_key: None,
            attempts: 0,
        }
    }
}

struct RecordOutcome {
    final_path: PathBuf,
    frames_written: i64,
    file_size: i64,
}

/// Blocking capture loop: same shape as `recording_manager`'s `record_loop`,
/// minus the direct database writes (the recording row lives centrally; the
/// agent only owns the file until upload).
fn record_blocking(url: String, temp_path: PathBuf, codec_cache: Arc<CodecCache>, deadline: std::time::Instant) -> Result<RecordOutcome, Error> {
    let mut child = spawn_capture(&url)?;
    let events = child.iter().map_err(|e| err!(Internal, msg("reading ffmpeg events"), source(e)))?;

    let mut writer: Option<Box<dyn Writer>> = None;
    let mut width = 0u32;
    let mut height = 0u32;
    let mut consecutive_failures = 0u32;
    let mut read_deadline = std::time::Instant::now() + READ_TIMEOUT;
    let mut extension = "mp4";

    for event in events {
        if std::time::Instant::now() >= deadline {
            break;
        }
        match event {
            FfmpegEvent::OutputFrame(f) => {
                read_deadline = std::time::Instant::now() + READ_TIMEOUT;
                let frame = Frame { width: f.width, height: f.height, rgb: f.data };
                if !frame.is_valid() {
                    consecutive_failures += 1;
                    continue;
                }
                if writer.is_none() {
                    width = frame.width;
                    height = frame.height;
                    let candidates = codec_cache.probe(temp_path.parent().unwrap(), width, height, DEFAULT_FPS);
                    let Some((w, descriptor)) = candidates.iter().find_map(|c| open_writer(*c, &temp_path, width, height, DEFAULT_FPS).ok().map(|w| (w, *c))) else {
                        let _ = child.kill();
                        return Err(err!(Internal, msg("no codec could open a writer for {width}x{height}")));
                    };
                    writer = Some(w);
                    extension = descriptor.extension;
                }
                if frame.width != width || frame.height != height {
                    consecutive_failures += 1;
                    continue;
                }
                if let Some(w) = writer.as_mut() {
                    match w.write_frame(&frame) {
                        Ok(()) => consecutive_failures = 0,
                        Err(_) => consecutive_failures += 1,
                    }
                }
            }
            FfmpegEvent::Error(_) => consecutive_failures += 1,
            FfmpegEvent::Done => break,
            _ => {}
        }
        if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            warn!(url, "agent record task exceeded consecutive failure threshold");
            break;
        }
        if std::time::Instant::now() > read_deadline {
            consecutive_failures += 1;
            read_deadline = std::time::Instant::now() + READ_TIMEOUT;
        }
    }
    let _ = child.kill();

    let writer = writer.ok_or_else(|| err!(Unavailable, msg("no frame ever received from {url}")))?;
    let frames_written = writer.frames_written() as i64;
    writer.close()?;

    let final_path = temp_path.with_extension(extension);
    std::fs::rename(&temp_path, &final_path).map_err(|e| err!(Internal, msg("renaming {}", temp_path.display()), source(e)))?;
    let file_size = std::fs::metadata(&final_path).map(|m| m.len() as i64).unwrap_or(0);

    Ok(RecordOutcome { final_path, frames_written, file_size })
}

/// Uploads the finished file via an ambient S3 configuration if present,
/// returning the object key on success. Falls back to leaving the file
/// local (and the recording un-cloud-tagged) if no bucket is configured or
/// the upload fails; `drain_pending_queue` and a future agent run retry
/// the status push, not the upload itself (spec.md §4.8 item 5: "otherwise
/// leaves the file in a local pending_uploads area").
async fn upload_if_configured(final_path: &Path, recording_id: Uuid) -> Option<String> {
    use crate::object_store::ObjectStore as _;
    let bucket = std::env::var("AGENT_S3_BUCKET").ok()?;
    let store = crate::object_store::S3ObjectStore::from_env(bucket, std::env::var("AGENT_S3_ENDPOINT").ok(), None).await;
    let ext = final_path.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
    let key = format!("recordings/{recording_id}.{ext}");
    let content_type = crate::object_store::content_type_for_extension(ext);
    match store.put(&key, final_path, content_type).await {
        Ok(true) => Some(key),
        Ok(false) => None,
        Err(e) => {
            warn!(%recording_id, err = %e, "agent upload failed; recording stays local");
            None
        }
    }
}

/// `statvfs` isn't wired up in this build; reported as unknown rather than a
/// fabricated number until a free-space crate is added.
fn fs_free_gb(_path: &Path) -> Option<f64> {
    None
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
