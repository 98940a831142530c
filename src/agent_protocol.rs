// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Remote-agent protocol, central side (C8, spec.md §4.8): the `/local-client/*`
//! endpoints a detached capture host authenticates against with its bearer
//! token to pull schedules/cameras and push recording status and liveness.

use std::convert::Infallible;
use std::sync::Arc;

use base::clock::Clocks;
use base::time::Time;
use db::types::{Camera, RecordingSchedule, RecordingStatus, StorageType};
use db::Database;
use http::header;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::body::{self, Body};

struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<base::Error> for HttpError {
    fn from(e: base::Error) -> Self {
        use base::ErrorKind::*;
        let status = match e.kind() {
            Unauthenticated => StatusCode::UNAUTHORIZED,
            PermissionDenied => StatusCode::FORBIDDEN,
            InvalidArgument | FailedPrecondition => StatusCode::BAD_REQUEST,
            NotFound => StatusCode::NOT_FOUND,
            Unavailable | DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        HttpError(json_response(status, &ErrorBody { error: &e.to_string() }))
    }
}

type ResponseResult = Result<Response<Body>, HttpError>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn json_response<T: Serialize>(status: StatusCode, out: &T) -> Response<Body> {
    let buf = serde_json::to_vec(out).unwrap_or_else(|_| b"{\"error\":\"failed to encode response\"}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body::full(buf))
        .expect("hardcoded head is valid")
}

fn bad_req(msg: impl Into<String>) -> HttpError {
    HttpError(json_response(StatusCode::BAD_REQUEST, &ErrorBody { error: &msg.into() }))
}

fn not_found(msg: impl Into<String>) -> HttpError {
    HttpError(json_response(StatusCode::NOT_FOUND, &ErrorBody { error: &msg.into() }))
}

fn unauthenticated() -> HttpError {
    HttpError(json_response(StatusCode::UNAUTHORIZED, &ErrorBody { error: "invalid or missing agent bearer token" }))
}

enum Route {
    Schedules,
    Cameras,
    RegisterRecording,
    RecordingStatus,
    Heartbeat,
    NotFound,
}

impl Route {
    fn decode(path: &str) -> Self {
        match path.strip_prefix("/local-client/") {
            Some("schedules") => Route::Schedules,
            Some("cameras") => Route::Cameras,
            Some("recordings/register") => Route::RegisterRecording,
            Some("recordings/status") => Route::RecordingStatus,
            Some("heartbeat") => Route::Heartbeat,
            _ => Route::NotFound,
        }
    }
}

/// True for any request this module should handle; lets the caller decide
/// between this surface and the core one (`web::Service`) before dispatch.
pub fn is_agent_path(path: &str) -> bool {
    path.starts_with("/local-client/")
}

pub struct Config<C: Clocks = base::clock::RealClocks> {
    pub db: Arc<Database<C>>,
}

pub struct Service<C: Clocks = base::clock::RealClocks> {
    db: Arc<Database<C>>,
}

fn query_param<'a>(req: &'a Request<hyper::body::Incoming>, key: &str) -> Option<std::borrow::Cow<'a, str>> {
    let q = req.uri().query()?;
    url::form_urlencoded::parse(q.as_bytes()).find(|(k, _)| k.as_ref() == key).map(|(_, v)| v)
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(req: Request<hyper::body::Incoming>) -> Result<T, HttpError> {
    let bytes = req.into_body().collect().await.map_err(|e| bad_req(format!("reading request body: {e}")))?.to_bytes();
    if bytes.is_empty() {
        return serde_json::from_slice(b"{}").map_err(|e| bad_req(e.to_string()));
    }
    serde_json::from_slice(&bytes).map_err(|e| bad_req(format!("invalid JSON body: {e}")))
}

fn camera_descriptor(c: &Camera) -> serde_json::Value {
    serde_json::json!({
        "id": c.id,
        "name": c.name,
        "host": c.host,
        "port": c.port,
        "rtsp_path": c.rtsp_path,
        "username": c.username,
        "password": c.password,
        "main_url": c.main_url,
        "sub_url": c.sub_url,
        "rtsp_transport": c.rtsp_transport.as_str(),
        "quality_tier": c.quality_tier.as_str(),
        "max_retention_hours": c.max_retention_hours,
    })
}

fn schedule_json(s: &RecordingSchedule, camera: &Camera) -> serde_json::Value {
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
        "camera": camera_descriptor(camera),
    })
}

fn parse_recording_status(s: &str) -> Option<RecordingStatus> {
    match s {
        "scheduled" => Some(RecordingStatus::Scheduled),
        "recording" => Some(RecordingStatus::Recording),
        "completed" => Some(RecordingStatus::Completed),
        "failed" => Some(RecordingStatus::Failed),
        "stopped" => Some(RecordingStatus::Stopped),
        _ => None,
    }
}

#[derive(Deserialize)]
struct RegisterRecordingRequest {
    camera_id: Uuid,
    #[serde(default)]
    schedule_id: Option<Uuid>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct RegisterRecordingResponse {
    recording_id: Uuid,
}

#[derive(Deserialize)]
struct RecordingStatusRequest {
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
}

/// Carried forward verbatim from `original_source/Backend/local_client/sync_service.py`'s
/// heartbeat payload shape.
#[derive(Deserialize, Default)]
struct HeartbeatRequest {
    #[serde(default)]
    active_recordings: Option<u32>,
    #[serde(default)]
    system_info: Option<SystemInfo>,
}

#[derive(Deserialize)]
struct SystemInfo {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    free_disk_gb: Option<f64>,
    #[serde(default)]
    cpu_percent: Option<f64>,
}

impl<C: Clocks> Service<C> {
    pub fn new(config: Config<C>) -> Self {
        Service { db: config.db }
    }

    pub async fn serve(self: Arc<Self>, req: Request<hyper::body::Incoming>) -> Result<Response<Body>, Infallible> {
        Ok(self.dispatch(req).await.unwrap_or_else(|e| e.0))
    }

    fn authenticate(&self, req: &Request<hyper::body::Incoming>) -> Result<db::types::LocalRecordingClient, HttpError> {
        let header = req.headers().get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()).ok_or_else(unauthenticated)?;
        let token = header.strip_prefix("Bearer ").ok_or_else(unauthenticated)?;
        self.db.lock().get_client_by_token(token)?.ok_or_else(unauthenticated)
    }

    async fn dispatch(self: Arc<Self>, req: Request<hyper::body::Incoming>) -> ResponseResult {
        let route = Route::decode(req.uri().path());
        let client = self.authenticate(&req)?;
        match route {
            Route::Schedules => self.schedules(&req, client.id),
            Route::Cameras => self.cameras(client.id),
            Route::RegisterRecording => self.register_recording(req, client.id).await,
            Route::RecordingStatus => self.recording_status(req, client.id).await,
            Route::Heartbeat => self.heartbeat(req, client.id).await,
            Route::NotFound => Err(not_found("path not understood")),
        }
    }

    fn schedules(&self, req: &Request<hyper::body::Incoming>, client_id: Uuid) -> ResponseResult {
        let since = query_param(req, "last_sync").and_then(|s| s.parse::<jiff::Timestamp>().ok()).map(Time::from);
        let l = self.db.lock();
        let schedules = l.list_schedules_for_client_since(client_id, since)?;
        let mut out = Vec::with_capacity(schedules.len());
        for s in &schedules {
            let camera = l.get_camera(s.camera_id)?.ok_or_else(|| not_found(format!("no such camera {}", s.camera_id)))?;
            out.push(schedule_json(s, &camera));
        }
        Ok(json_response(StatusCode::OK, &out))
    }

    fn cameras(&self, client_id: Uuid) -> ResponseResult {
        let cameras = self.db.lock().list_cameras_for_client(client_id)?;
        let out: Vec<_> = cameras.iter().map(camera_descriptor).collect();
        Ok(json_response(StatusCode::OK, &out))
    }

    async fn register_recording(self: Arc<Self>, req: Request<hyper::body::Incoming>, client_id: Uuid) -> ResponseResult {
        let body: RegisterRecordingRequest = read_json_body(req).await?;
        let assigned = self.db.lock().list_cameras_for_client(client_id)?;
        let camera = assigned
            .into_iter()
            .find(|c| c.id == body.camera_id)
            .ok_or_else(|| bad_req(format!("camera {} is not assigned to this agent", body.camera_id)))?;

        let now = Time::from(self.db.clocks().realtime());
        let recording = db::types::Recording {
            id: Uuid::now_v7(),
            camera_id: camera.id,
            schedule_id: body.schedule_id,
            name: body.name.unwrap_or_else(|| format!("{}_{}", camera.name, now.unix_seconds())),
            file_path: String::new(),
            storage_type: StorageType::Local,
            file_size: 0,
            frames_written: 0,
            duration: None,
            start: now,
            end: None,
            status: RecordingStatus::Scheduled,
            resolution: None,
            frame_rate: None,
            codec: None,
            error_message: None,
            thumbnail_path: None,
            recorded_by_client: Some(client_id),
            creator: None,
            created_at: now,
            updated_at: now,
        };
        self.db.lock().insert_recording(&recording)?;
        info!(recording_id = %recording.id, camera_id = %camera.id, "agent registered recording");
        Ok(json_response(StatusCode::OK, &RegisterRecordingResponse { recording_id: recording.id }))
    }

    async fn recording_status(self: Arc<Self>, req: Request<hyper::body::Incoming>, client_id: Uuid) -> ResponseResult {
        let body: RecordingStatusRequest = read_json_body(req).await?;
        let l = self.db.lock();
        let recording = l
            .get_recording(body.recording_id)?
            .ok_or_else(|| not_found(format!("no such recording {}", body.recording_id)))?;
        if recording.recorded_by_client != Some(client_id) {
            return Err(HttpError(json_response(
                StatusCode::FORBIDDEN,
                &ErrorBody { error: "recording is not owned by this agent" },
            )));
        }
        let status = parse_recording_status(&body.new_status).ok_or_else(|| bad_req(format!("unknown status {}", body.new_status)))?;

        match status {
            RecordingStatus::Completed => {
                let end = Time::from(self.db.clocks().realtime());
                let duration = end - recording.start;
                let file_size = body.file_size.unwrap_or(recording.file_size);
                let frames_written = body.frames_written.unwrap_or(recording.frames_written);
                let duration_secs = (duration.0 as f64 / base::time::TIME_UNITS_PER_SEC as f64).max(1.0);
                let frame_rate = (frames_written > 0).then(|| frames_written as f64 / duration_secs);
                l.complete_recording(recording.id, end, duration, file_size, frames_written, frame_rate)?;
                if let Some(object_key) = &body.object_key {
                    l.set_recording_storage(recording.id, StorageType::Cloud, object_key)?;
                }
            }
            RecordingStatus::Failed => {
                l.update_recording_status(recording.id, RecordingStatus::Failed, body.error_message.as_deref())?;
            }
            other => {
                l.update_recording_status(recording.id, other, body.error_message.as_deref())?;
                if body.frames_written.is_some() || body.file_size.is_some() {
                    l.update_recording_progress(recording.id, body.frames_written, body.file_size)?;
                }
            }
        }
        Ok(json_response(StatusCode::OK, &serde_json::json!({ "success": true })))
    }

    async fn heartbeat(self: Arc<Self>, req: Request<hyper::body::Incoming>, client_id: Uuid) -> ResponseResult {
        let body: HeartbeatRequest = read_json_body(req).await?;
        self.db.lock().record_client_heartbeat(client_id)?;
        // The `local_recording_client` table has no ip/system-info columns,
        // so this is logged for operational visibility rather than persisted.
        if let Some(info) = body.system_info {
            info!(
                client_id = %client_id,
                hostname = ?info.hostname,
                platform = ?info.platform,
                free_disk_gb = ?info.free_disk_gb,
                cpu_percent = ?info.cpu_percent,
                active_recordings = ?body.active_recordings,
                "agent heartbeat"
            );
        } else {
            warn!(client_id = %client_id, "agent heartbeat with no system info");
        }
        Ok(json_response(StatusCode::OK, &serde_json::json!({ "success": true })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_agent_routes() {
        assert!(matches!(Route::decode("/local-client/schedules"), Route::Schedules));
        assert!(matches!(Route::decode("/local-client/cameras"), Route::Cameras));
        assert!(matches!(Route::decode("/local-client/recordings/register"), Route::RegisterRecording));
        assert!(matches!(Route::decode("/local-client/recordings/status"), Route::RecordingStatus));
        assert!(matches!(Route::decode("/local-client/heartbeat"), Route::Heartbeat));
        assert!(matches!(Route::decode("/cameras/foo/stream"), Route::NotFound));
    }

    #[test]
    fn recognizes_agent_paths() {
        assert!(is_agent_path("/local-client/schedules"));
        assert!(!is_agent_path("/schedules"));
    }
}
