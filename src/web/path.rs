// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Route matching for the core HTTP surface (C7, spec.md §6).

use uuid::Uuid;

#[derive(Debug, Eq, PartialEq)]
pub enum Path {
    Stream(Uuid),
    Snapshot(Uuid),
    Thumbnail(Uuid),
    ActivateStream(Uuid),
    DeactivateStream(Uuid),
    StreamStatus(Uuid),
    StreamHealth(Uuid),
    RecoverStream(Uuid),
    TestConnection(Uuid),
    StartRecording(Uuid),
    StopRecording(Uuid),
    RecordingStatus(Uuid),
    Schedule(Uuid),
    ScheduleActivate(Uuid),
    ScheduleDeactivate(Uuid),
    ScheduleStatus(Uuid),
    Schedules,
    TransferToCloud,
    CloudTransfers,
    NotFound,
}

/// Splits `/cameras/{id}/<rest>` into `(id, rest)`.
fn camera_subpath(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/cameras/")?;
    let slash = rest.find('/')?;
    Some((&rest[..slash], &rest[slash..]))
}

fn parse_uuid(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s).ok()
}

impl Path {
    pub fn decode(path: &str) -> Self {
        if path == "/schedules" {
            return Path::Schedules;
        }
        if path == "/recordings/transfer-to-cloud" {
            return Path::TransferToCloud;
        }
        if path == "/recordings/cloud-transfers" {
            return Path::CloudTransfers;
        }
        if let Some(rest) = path.strip_prefix("/schedules/") {
            return match rest.split_once('/') {
                None => parse_uuid(rest).map(Path::Schedule).unwrap_or(Path::NotFound),
                Some((id, "activate")) => parse_uuid(id).map(Path::ScheduleActivate).unwrap_or(Path::NotFound),
                Some((id, "deactivate")) => parse_uuid(id).map(Path::ScheduleDeactivate).unwrap_or(Path::NotFound),
                Some((id, "status")) => parse_uuid(id).map(Path::ScheduleStatus).unwrap_or(Path::NotFound),
                _ => Path::NotFound,
            };
        }
        let Some((id, rest)) = camera_subpath(path) else { return Path::NotFound };
        let Some(id) = parse_uuid(id) else { return Path::NotFound };
        match rest {
            "/stream" => Path::Stream(id),
            "/stream/snapshot" => Path::Snapshot(id),
            "/stream/thumbnail" => Path::Thumbnail(id),
            "/activate_stream" => Path::ActivateStream(id),
            "/deactivate_stream" => Path::DeactivateStream(id),
            "/stream_status" => Path::StreamStatus(id),
            "/stream_health" => Path::StreamHealth(id),
            "/recover_stream" => Path::RecoverStream(id),
            "/test_connection" => Path::TestConnection(id),
            "/start_recording" => Path::StartRecording(id),
            "/stop_recording" => Path::StopRecording(id),
            "/recording_status" => Path::RecordingStatus(id),
            _ => Path::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_camera_routes() {
        let id = Uuid::nil();
        assert_eq!(Path::decode(&format!("/cameras/{id}/stream")), Path::Stream(id));
        assert_eq!(Path::decode(&format!("/cameras/{id}/stream/snapshot")), Path::Snapshot(id));
        assert_eq!(Path::decode(&format!("/cameras/{id}/recording_status")), Path::RecordingStatus(id));
    }

    #[test]
    fn decodes_schedule_routes() {
        let id = Uuid::nil();
        assert_eq!(Path::decode(&format!("/schedules/{id}")), Path::Schedule(id));
        assert_eq!(Path::decode(&format!("/schedules/{id}/activate")), Path::ScheduleActivate(id));
        assert_eq!(Path::decode("/schedules"), Path::Schedules);
    }

    #[test]
    fn rejects_unknown_paths() {
        assert_eq!(Path::decode("/nope"), Path::NotFound);
        assert_eq!(Path::decode("/cameras/not-a-uuid/stream"), Path::NotFound);
    }
}
