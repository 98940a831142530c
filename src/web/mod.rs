// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The core HTTP surface (C7, spec.md §6): live MJPEG streaming, snapshot/
//! thumbnail, stream and recording control, schedule CRUD, transfer queue
//! inspection.

pub mod jpeg;
mod path;

use self::path::Path;
use crate::body::{self, Body};
use base::clock::Clocks;
use base::time::Time;
use base::{err, ErrorKind};
use bytes::Bytes;
use db::types::{Quality, RecordingSchedule, ScheduleKind, WeekdaySet};
use db::Database;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::object_store::ObjectStore;
use crate::recording_manager::RecordingManager;
use crate::stream_manager::StreamManager;

/// Carries a live-stream frame forward across `unfold` iterations so the
/// MJPEG loop can reuse the last good frame and track encode failures
/// (spec.md §4.7 point 5).
struct MjpegLoopState<C: Clocks = base::clock::RealClocks> {
    streams: Arc<StreamManager<C>>,
    id: Uuid,
    quality: Quality,
    last_good: Option<Arc<crate::codec::Frame>>,
    reuses_left: u32,
    encode_failures: u32,
    last_frame_at: std::time::Instant,
}

struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<base::Error> for HttpError {
    fn from(err: base::Error) -> Self {
        HttpError(from_base_error(&err))
    }
}

type ResponseResult = Result<Response<Body>, HttpError>;

fn status_for_kind(kind: ErrorKind) -> StatusCode {
    use ErrorKind::*;
    match kind {
        Unauthenticated => StatusCode::UNAUTHORIZED,
        PermissionDenied => StatusCode::FORBIDDEN,
        InvalidArgument | FailedPrecondition => StatusCode::BAD_REQUEST,
        NotFound => StatusCode::NOT_FOUND,
        Unavailable | DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Renders spec.md §7's stable `{error, ...context}` shape.
#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn from_base_error(e: &base::Error) -> Response<Body> {
    json_response(status_for_kind(e.kind()), &ErrorBody { error: &e.to_string() })
}

fn json_response<T: Serialize>(status: StatusCode, out: &T) -> Response<Body> {
    let buf = serde_json::to_vec(out).unwrap_or_else(|_| b"{\"error\":\"failed to encode response\"}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(body::full(buf))
        .expect("hardcoded head is valid")
}

fn bad_req(msg: impl Into<String>) -> HttpError {
    HttpError(json_response(StatusCode::BAD_REQUEST, &ErrorBody { error: &msg.into() }))
}

fn not_found(msg: impl Into<String>) -> HttpError {
    HttpError(json_response(StatusCode::NOT_FOUND, &ErrorBody { error: &msg.into() }))
}

fn method_not_allowed() -> HttpError {
    HttpError(json_response(StatusCode::METHOD_NOT_ALLOWED, &ErrorBody { error: "method not allowed" }))
}

fn query_param<'a>(req: &'a Request<hyper::body::Incoming>, key: &str) -> Option<std::borrow::Cow<'a, str>> {
    let q = req.uri().query()?;
    url::form_urlencoded::parse(q.as_bytes())
        .find(|(k, _)| k.as_ref() == key)
        .map(|(_, v)| v)
}

fn quality_param(req: &Request<hyper::body::Incoming>) -> Quality {
    match query_param(req, "quality").as_deref() {
        Some("sub") => Quality::Sub,
        _ => Quality::Main,
    }
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(req: Request<hyper::body::Incoming>) -> Result<T, HttpError> {
    let bytes = req.into_body().collect().await.map_err(|e| bad_req(format!("reading request body: {e}")))?.to_bytes();
    if bytes.is_empty() {
        return serde_json::from_slice(b"{}").map_err(|e| bad_req(e.to_string()));
    }
    serde_json::from_slice(&bytes).map_err(|e| bad_req(format!("invalid JSON body: {e}")))
}

pub struct Config<C: Clocks = base::clock::RealClocks> {
    pub db: Arc<Database<C>>,
    pub streams: Arc<StreamManager<C>>,
    pub recordings: Arc<RecordingManager<C>>,
    pub object_store: Arc<dyn ObjectStore>,
    pub media_root: std::path::PathBuf,
}

pub struct Service<C: Clocks = base::clock::RealClocks> {
    db: Arc<Database<C>>,
    streams: Arc<StreamManager<C>>,
    recordings: Arc<RecordingManager<C>>,
    object_store: Arc<dyn ObjectStore>,
    media_root: std::path::PathBuf,
}

impl<C: Clocks> Service<C> {
    pub fn new(config: Config<C>) -> Self {
        Service {
            db: config.db,
            streams: config.streams,
            recordings: config.recordings,
            object_store: config.object_store,
            media_root: config.media_root,
        }
    }

    /// Serves a single HTTP request. Never returns `Err`; translates every
    /// internal failure into a response per spec.md §7's propagation policy
    /// ("operator-facing endpoints translate internal errors ... they never
    /// crash the owning process").
    pub async fn serve(self: Arc<Self>, req: Request<hyper::body::Incoming>) -> Result<Response<Body>, Infallible> {
        let p = Path::decode(req.uri().path());
        debug!(path = %req.uri(), ?p, "request");
        Ok(self.dispatch(req, p).await.unwrap_or_else(|e| e.0))
    }

    async fn dispatch(self: Arc<Self>, req: Request<hyper::body::Incoming>, p: Path) -> ResponseResult {
        match p {
            Path::Stream(id) => self.stream(req, id).await,
            Path::Snapshot(id) => self.snapshot(&req, id).await,
            Path::Thumbnail(id) => self.thumbnail(&req, id).await,
            Path::ActivateStream(id) => self.activate_stream(&req, id).await,
            Path::DeactivateStream(id) => self.deactivate_stream(&req, id).await,
            Path::StreamStatus(id) => self.stream_status(id),
            Path::StreamHealth(id) => self.stream_health(&req, id),
            Path::RecoverStream(id) => self.recover_stream(&req, id).await,
            Path::TestConnection(id) => self.test_connection(id).await,
            Path::StartRecording(id) => self.start_recording(req, id).await,
            Path::StopRecording(id) => self.stop_recording(id),
            Path::RecordingStatus(id) => self.recording_status(id),
            Path::Schedule(id) => self.schedule(req, id).await,
            Path::ScheduleActivate(id) => self.set_schedule_active(id, true),
            Path::ScheduleDeactivate(id) => self.set_schedule_active(id, false),
            Path::ScheduleStatus(id) => self.schedule_status(id),
            Path::Schedules => self.schedules(req).await,
            Path::TransferToCloud => self.transfer_to_cloud(req).await,
            Path::CloudTransfers => self.cloud_transfers(),
            Path::NotFound => Err(not_found("path not understood")),
        }
    }

    fn camera(&self, id: Uuid) -> Result<db::types::Camera, HttpError> {
        self.db.lock().get_camera(id)?.ok_or_else(|| not_found(format!("no such camera {id}")))
    }

    async fn stream(self: Arc<Self>, req: Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        let quality = quality_param(&req);
        let camera = self.camera(id)?;
        camera.url(quality).map_err(|_| bad_req("camera has no stream URL"))?;
        self.streams.start_stream(id, quality).await.map_err(HttpError::from)?;

        let streams = self.streams.clone();
        let boundary = "moonfirenvrframe";
        let state = MjpegLoopState {
            streams,
            id,
            quality,
            last_good: None,
            reuses_left: 0,
            encode_failures: 0,
            last_frame_at: std::time::Instant::now(),
        };
        let body = body::streaming(futures::stream::unfold(state, move |mut state| {
            let boundary = boundary.to_string();
            async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_millis(40));
                loop {
                    interval.tick().await;

                    if state.last_frame_at.elapsed() > std::time::Duration::from_secs(5) {
                        return None;
                    }

                    let frame = match state.streams.get_frame(state.id, state.quality) {
                        Some(frame) => {
                            state.last_good = Some(frame.clone());
                            state.reuses_left = 3;
                            state.last_frame_at = std::time::Instant::now();
                            frame
                        }
                        None => {
                            if state.reuses_left > 0 {
                                state.reuses_left -= 1;
                                match &state.last_good {
                                    Some(frame) => frame.clone(),
                                    None => continue,
                                }
                            } else {
                                continue;
                            }
                        }
                    };

                    let jpeg = match jpeg::encode(&frame.rgb, frame.width, frame.height) {
                        Ok(j) => j,
                        Err(_) => {
                            state.encode_failures += 1;
                            if state.encode_failures >= 5 {
                                let _ = state.streams.recover_stream(state.id, state.quality).await;
                                state.encode_failures = 0;
                            }
                            continue;
                        }
                    };
                    state.encode_failures = 0;
                    let mut chunk = format!(
                        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        jpeg.len()
                    )
                    .into_bytes();
                    chunk.extend_from_slice(&jpeg);
                    chunk.extend_from_slice(b"\r\n");
                    return Some((Ok::<Bytes, body::BoxError>(Bytes::from(chunk)), state));
                }
            }
        }));

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_str(&format!("multipart/x-mixed-replace; boundary={boundary}")).unwrap())
            .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache,no-store,max-age=0,must-revalidate"))
            .header(header::PRAGMA, HeaderValue::from_static("no-cache"))
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))
            .header("X-Camera-Name", HeaderValue::from_str(&camera.name).unwrap_or_else(|_| HeaderValue::from_static("camera")))
            .header("X-Stream-Quality", HeaderValue::from_static(quality.as_str()))
            .body(body)
            .expect("hardcoded head is valid"))
    }

    async fn capture_still(&self, id: Uuid, quality: Quality) -> Result<crate::codec::Frame, HttpError> {
        self.streams.start_stream(id, quality).await.map_err(HttpError::from)?;
        for _ in 0..20 {
            if let Some(frame) = self.streams.get_frame(id, quality) {
                return Ok((*frame).clone());
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        Err(err!(Unavailable, msg("no frame available for camera {id} yet")).into())
    }

    async fn snapshot(&self, req: &Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        let quality = quality_param(req);
        let camera = self.camera(id)?;
        let frame = self.capture_still(id, quality).await?;
        let jpeg = jpeg::encode(&frame.rgb, frame.width, frame.height).map_err(HttpError::from)?;
        let now = Time::from(self.db.clocks().realtime());
        let filename = format!("snapshot_{}.jpg", crate::recording_manager::timestamp_suffix(now));
        let dir = self.media_root.join("snapshots").join(id.to_string());
        std::fs::create_dir_all(&dir).ok();
        let file_path = dir.join(&filename);
        std::fs::write(&file_path, &jpeg).map_err(|e| err!(Internal, msg("writing snapshot"), source(e)))?;

        #[derive(Serialize)]
        struct SnapshotInfo {
            filename: String,
            file_path: String,
            timestamp: i64,
            camera_name: String,
        }
        #[derive(Serialize)]
        struct SnapshotResponse {
            success: bool,
            snapshot: SnapshotInfo,
        }
        Ok(json_response(
            StatusCode::OK,
            &SnapshotResponse {
                success: true,
                snapshot: SnapshotInfo {
                    filename,
                    file_path: file_path.to_string_lossy().into_owned(),
                    timestamp: now.unix_seconds(),
                    camera_name: camera.name,
                },
            },
        ))
    }

    async fn thumbnail(&self, req: &Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        let quality = quality_param(req);
        let frame = match self.streams.get_frame(id, quality) {
            Some(f) => (*f).clone(),
            None => {
                return Ok(Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .body(body::empty())
                    .expect("hardcoded head is valid"))
            }
        };
        let jpeg = jpeg::encode(&frame.rgb, frame.width, frame.height).map_err(HttpError::from)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"))
            .body(body::full(jpeg))
            .expect("hardcoded head is valid"))
    }

    async fn activate_stream(&self, req: &Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        let quality = quality_param(req);
        self.camera(id)?;
        self.streams.start_stream(id, quality).await.map_err(HttpError::from)?;
        Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true})))
    }

    async fn deactivate_stream(&self, req: &Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        let quality = quality_param(req);
        self.streams.stop_stream(id, quality).map_err(HttpError::from)?;
        Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true})))
    }

    fn stream_status(&self, id: Uuid) -> ResponseResult {
        let camera = self.camera(id)?;
        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({"active": camera.active, "online": camera.online, "streaming": camera.streaming}),
        ))
    }

    fn stream_health(&self, req: &Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        self.camera(id)?;
        let quality = quality_param(req);
        let health = self.streams.stream_health(id, quality);
        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": health.status.as_str(),
                "viewers": health.viewers,
                "frame_count": health.frame_count,
                "last_update": health.last_update.map(|t| t.unix_seconds()),
            }),
        ))
    }

    async fn recover_stream(&self, req: &Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        self.camera(id)?;
        let quality = quality_param(req);
        self.streams.recover_stream(id, quality).await.map_err(HttpError::from)?;
        Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true})))
    }

    async fn test_connection(&self, id: Uuid) -> ResponseResult {
        let camera = self.camera(id)?;
        let url = camera.url(Quality::Main).map_err(|_| bad_req("camera has no stream URL"))?;
        match crate::stream_manager::probe_with_retries(&url).await {
            Ok(()) => Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true}))),
            Err(e) => Ok(json_response(StatusCode::SERVICE_UNAVAILABLE, &ErrorBody { error: &e.to_string() })),
        }
    }

    async fn start_recording(&self, req: Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        #[derive(Deserialize, Default)]
        struct StartRecordingRequest {
            duration_minutes: Option<u32>,
            recording_name: Option<String>,
            quality: Option<String>,
        }
        self.camera(id)?;
        let body: StartRecordingRequest = read_json_body(req).await?;
        let quality = match body.quality.as_deref() {
            Some("sub") => Quality::Sub,
            _ => Quality::Main,
        };
        let recording = self
            .recordings
            .start_recording(id, quality, body.duration_minutes, body.recording_name, None, false)
            .await
            .map_err(HttpError::from)?;
        Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true, "recording_id": recording.id})))
    }

    fn stop_recording(&self, id: Uuid) -> ResponseResult {
        self.recordings.stop_recording(id).map_err(HttpError::from)?;
        Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true})))
    }

    fn recording_status(&self, id: Uuid) -> ResponseResult {
        self.camera(id)?;
        let recording = self.db.lock().latest_recording(id)?;
        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({
                "recording": self.recordings.is_recording(id),
                "latest": recording.map(|r| serde_json::json!({
                    "id": r.id,
                    "status": r.status.as_str(),
                    "start": r.start.unix_seconds(),
                    "end": r.end.map(|t| t.unix_seconds()),
                })),
            }),
        ))
    }

    async fn schedules(&self, req: Request<hyper::body::Incoming>) -> ResponseResult {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let camera_id = query_param(&req, "camera_id").and_then(|v| Uuid::parse_str(&v).ok());
                let schedules = self.db.lock().list_schedules(None, camera_id)?;
                Ok(json_response(StatusCode::OK, &schedules.iter().map(schedule_json).collect::<Vec<_>>()))
            }
            Method::POST => {
                #[derive(Deserialize)]
                struct NewSchedule {
                    camera_id: Uuid,
                    name: String,
                    kind: String,
                    start_time_sec: u32,
                    end_time_sec: u32,
                    start_date: Option<String>,
                    end_date: Option<String>,
                    weekdays: Option<u8>,
                }
                let body: NewSchedule = read_json_body(req).await?;
                let kind = parse_schedule_kind(&body.kind).map_err(|_| bad_req("invalid schedule kind"))?;
                let now = Time::from(self.db.clocks().realtime());
                let schedule = RecordingSchedule {
                    id: Uuid::new_v4(),
                    camera_id: body.camera_id,
                    name: body.name,
                    kind,
                    start_time_sec: body.start_time_sec,
                    end_time_sec: body.end_time_sec,
                    start_date: body.start_date.as_deref().and_then(|d| d.parse().ok()),
                    end_date: body.end_date.as_deref().and_then(|d| d.parse().ok()),
                    weekdays: WeekdaySet(body.weekdays.unwrap_or(0)),
                    active: true,
                    creator: None,
                    created_at: now,
                    updated_at: now,
                };
                self.db.lock().insert_schedule(&schedule)?;
                Ok(json_response(StatusCode::OK, &schedule_json(&schedule)))
            }
            _ => Err(method_not_allowed()),
        }
    }

    async fn schedule(&self, req: Request<hyper::body::Incoming>, id: Uuid) -> ResponseResult {
        match *req.method() {
            Method::GET | Method::HEAD => {
                let s = self.db.lock().get_schedule(id)?.ok_or_else(|| not_found(format!("no such schedule {id}")))?;
                Ok(json_response(StatusCode::OK, &schedule_json(&s)))
            }
            Method::DELETE => {
                self.db.lock().delete_schedule(id)?;
                Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true})))
            }
            Method::PUT => {
                #[derive(Deserialize)]
                struct UpdateSchedule {
                    active: Option<bool>,
                }
                let body: UpdateSchedule = read_json_body(req).await?;
                if let Some(active) = body.active {
                    self.db.lock().set_schedule_active(id, active)?;
                }
                let s = self.db.lock().get_schedule(id)?.ok_or_else(|| not_found(format!("no such schedule {id}")))?;
                Ok(json_response(StatusCode::OK, &schedule_json(&s)))
            }
            _ => Err(method_not_allowed()),
        }
    }

    fn set_schedule_active(&self, id: Uuid, active: bool) -> ResponseResult {
        self.db.lock().get_schedule(id)?.ok_or_else(|| not_found(format!("no such schedule {id}")))?;
        self.db.lock().set_schedule_active(id, active)?;
        Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true})))
    }

    fn schedule_status(&self, id: Uuid) -> ResponseResult {
        let s = self.db.lock().get_schedule(id)?.ok_or_else(|| not_found(format!("no such schedule {id}")))?;
        Ok(json_response(StatusCode::OK, &schedule_json(&s)))
    }

    async fn transfer_to_cloud(&self, req: Request<hyper::body::Incoming>) -> ResponseResult {
        #[derive(Deserialize, Default)]
        struct TransferRequest {
            recording_ids: Option<Vec<Uuid>>,
            batch_size: Option<u32>,
        }
        let body: TransferRequest = read_json_body(req).await?;
        let db = self.db.clone();
        let store = self.object_store.clone();
        let mut uploaded = 0u32;
        if let Some(ids) = body.recording_ids {
            for recording_id in ids {
                let Some(r) = db.lock().get_recording(recording_id)? else { continue };
                if crate::archival::upload_recording(&db, store.as_ref(), r.id, r.camera_id, r.start, &r.file_path, false)
                    .await
                    .is_ok()
                {
                    uploaded += 1;
                }
            }
        } else {
            let limit = body.batch_size.unwrap_or(10);
            let candidates = db.lock().list_sync_candidates(limit)?;
            for r in candidates {
                if crate::archival::upload_recording(&db, store.as_ref(), r.id, r.camera_id, r.start, &r.file_path, false)
                    .await
                    .is_ok()
                {
                    uploaded += 1;
                }
            }
        }
        Ok(json_response(StatusCode::OK, &serde_json::json!({"success": true, "uploaded": uploaded})))
    }

    fn cloud_transfers(&self) -> ResponseResult {
        let jobs = self.db.lock().list_transfer_jobs(None)?;
        let out: Vec<_> = jobs
            .iter()
            .map(|j| {
                serde_json::json!({
                    "id": j.id,
                    "recording_id": j.recording_id,
                    "state": j.state.as_str(),
                    "retry_count": j.retry_count,
                    "error_message": j.error_message,
                })
            })
            .collect();
        Ok(json_response(StatusCode::OK, &out))
    }
}

fn parse_schedule_kind(s: &str) -> Result<ScheduleKind, ()> {
    match s {
        "once" => Ok(ScheduleKind::Once),
        "daily" => Ok(ScheduleKind::Daily),
        "weekly" => Ok(ScheduleKind::Weekly),
        "continuous" => Ok(ScheduleKind::Continuous),
        _ => Err(()),
    }
}

fn schedule_json(s: &RecordingSchedule) -> serde_json::Value {
    serde_json::json!({
        "id": s.id,
        "camera_id": s.camera_id,
        "name": s.name,
        "kind": s.kind.as_str(),
        "start_time_sec": s.start_time_sec,
        "end_time_sec": s.end_time_sec,
        "start_date": s.start_date.map(|d| d.to_string()),
        "end_date": s.end_date.map(|d| d.to_string()),
        "weekdays": s.weekdays.0,
        "active": s.active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_renders_expected_shape() {
        let e = err!(NotFound, msg("camera {} not found", "abc"));
        let resp = from_base_error(&e);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
