// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Codec probe & writer (C2): try a fixed candidate list, keep the first
//! that actually opens at the given `(W, H, FPS)`, cache the result.
//!
//! The Rust ecosystem has no drop-in equivalent of an OpenCV `VideoWriter`
//! backed by system codec libraries, so only `MJPG` (motion-JPEG, written
//! directly via the `image` crate) is ever actually openable here; the rest
//! of the candidate list exists so the probe order and fallback-on-failure
//! behavior match a real deployment where most candidates are unavailable.

use base::{err, Error};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CodecDescriptor {
    pub tag: &'static str,
    pub extension: &'static str,
}

/// Fixed preference list from spec.md §4.2.
pub const CANDIDATES: &[CodecDescriptor] = &[
    CodecDescriptor { tag: "mp4v", extension: "mp4" },
    CodecDescriptor { tag: "MJPG", extension: "mp4" },
    CodecDescriptor { tag: "XVID", extension: "mp4" },
    CodecDescriptor { tag: "DIVX", extension: "mp4" },
    CodecDescriptor { tag: "WMV1", extension: "wmv" },
    CodecDescriptor { tag: "WMV2", extension: "wmv" },
    CodecDescriptor { tag: "MJPG", extension: "avi" },
    CodecDescriptor { tag: "XVID", extension: "avi" },
    CodecDescriptor { tag: "DIVX", extension: "avi" },
];

/// Used only if every candidate in [`CANDIDATES`] fails probing (spec.md
/// §4.2: "fall back to a minimal list without testing").
pub const FALLBACK_CANDIDATES: &[CodecDescriptor] = &[CodecDescriptor { tag: "MJPG", extension: "mp4" }];

const MIN_PROBE_FILE_SIZE: u64 = 50;
const PROBE_FRAME_COUNT: usize = 3;

fn cache_key(width: u32, height: u32, fps: f64) -> String {
    format!("{width}x{height}@{fps}")
}

/// Process-global, mutex-guarded probe-result cache (spec.md §4.2/§5; "the
/// codec cache is a process-global map guarded by a mutex").
pub struct CodecCache {
    results: Mutex<HashMap<String, Vec<CodecDescriptor>>>,
}

impl CodecCache {
    pub fn new() -> Self {
        CodecCache { results: Mutex::new(HashMap::new()) }
    }

    /// Clears all cached probe results, e.g. to re-probe after an upgrade.
    pub fn clear(&self) {
        self.results.lock().clear();
    }

    /// Returns working codecs for `(width, height, fps)`, probing and caching
    /// on first use.
    pub fn probe(&self, probe_dir: &Path, width: u32, height: u32, fps: f64) -> Vec<CodecDescriptor> {
        let key = cache_key(width, height, fps);
        if let Some(cached) = self.results.lock().get(&key).cloned() {
            return cached;
        }
        let working: Vec<CodecDescriptor> = CANDIDATES
            .iter()
            .copied()
            .filter(|c| probe_one(probe_dir, *c, width, height).is_ok())
            .collect();
        let working = if working.is_empty() {
            FALLBACK_CANDIDATES.to_vec()
        } else {
            working
        };
        self.results.lock().insert(key, working.clone());
        working
    }
}

impl Default for CodecCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens a writer on a temp file, writes [`PROBE_FRAME_COUNT`] synthetic
/// frames, checks the file size, then deletes it.
fn probe_one(probe_dir: &Path, candidate: CodecDescriptor, width: u32, height: u32) -> Result<(), Error> {
    let path = probe_dir.join(format!(".probe-{}-{width}x{height}.{}", candidate.tag, candidate.extension));
    let frame = synthetic_frame(width, height);
    {
        let mut writer = open_writer(candidate, &path, width, height, 25.0)?;
        for _ in 0..PROBE_FRAME_COUNT {
            writer.write_frame(&frame)?;
        }
        writer.close()?;
    }
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let _ = std::fs::remove_file(&path);
    if size > MIN_PROBE_FILE_SIZE {
        Ok(())
    } else {
        Err(err!(Internal, msg("{} probe file too small ({size} bytes)", candidate.tag)))
    }
}

fn synthetic_frame(width: u32, height: u32) -> Frame {
    Frame {
        width,
        height,
        rgb: vec![0u8; (width as usize) * (height as usize) * 3],
    }
}

/// A single decoded video frame, 3-channel (RGB), matching spec.md §4.4's
/// "drop frames whose shape is not 3-channel" policy.
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn is_valid(&self) -> bool {
        !self.rgb.is_empty() && self.rgb.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

/// Owns a writer's file handle and codec tag; resource release is
/// guaranteed on all exit paths via `Drop`.
pub trait Writer: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Frames successfully written so far.
    fn frames_written(&self) -> u64;

    /// Closes the writer, flushing and releasing the file handle.
    fn close(self: Box<Self>) -> Result<(), Error>;
}

/// Opens the first working writer for `candidate`, per spec.md §4.2/§4.4.
/// Only `MJPG` is actually implemented; any other tag's candidate is
/// rejected immediately so the caller falls through to the next candidate,
/// matching a deployment with no system codec libraries installed.
pub fn open_writer(
    candidate: CodecDescriptor,
    path: &Path,
    width: u32,
    height: u32,
    fps: f64,
) -> Result<Box<dyn Writer>, Error> {
    if candidate.tag != "MJPG" {
        return Err(err!(Unimplemented, msg("codec {} not available in this build", candidate.tag)));
    }
    Ok(Box::new(MjpegWriter::create(path, width, height, fps)?))
}

/// A minimal, fragmentation-free MJPEG container: a stream of
/// length-prefixed JPEG frames. Simple enough to probe and to re-read for
/// thumbnailing, without the B-frame/sample-index complexity of a real mp4
/// muxer (which has no counterpart in this crate's scope).
struct MjpegWriter {
    file: BufWriter<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    frames_written: u64,
    write_errors: u64,
}

impl MjpegWriter {
    fn create(path: &Path, width: u32, height: u32, _fps: f64) -> Result<Self, Error> {
        let file = File::create(path).map_err(|e| err!(Internal, msg("creating {}", path.display()), source(e)))?;
        let mut writer = BufWriter::new(file);
        // 8-byte magic + width/height header, so a reader can validate the container.
        writer
            .write_all(b"MJPGNVR1")
            .and_then(|_| writer.write_all(&width.to_le_bytes()))
            .and_then(|_| writer.write_all(&height.to_le_bytes()))
            .map_err(|e| err!(Internal, msg("writing header to {}", path.display()), source(e)))?;
        Ok(MjpegWriter {
            file: writer,
            path: path.to_owned(),
            width,
            height,
            frames_written: 0,
            write_errors: 0,
        })
    }
}

impl Writer for MjpegWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if !frame.is_valid() || frame.width != self.width || frame.height != self.height {
            self.write_errors += 1;
            return Err(err!(InvalidArgument, msg("frame shape mismatch")));
        }
        let jpeg = crate::web::jpeg::encode(&frame.rgb, frame.width, frame.height).map_err(|e| {
            self.write_errors += 1;
            e
        })?;
        let result = self
            .file
            .write_all(&(jpeg.len() as u32).to_le_bytes())
            .and_then(|_| self.file.write_all(&jpeg));
        match result {
            Ok(()) => {
                self.frames_written += 1;
                Ok(())
            }
            Err(e) => {
                self.write_errors += 1;
                Err(err!(Internal, msg("writing frame to {}", self.path.display()), source(e)))
            }
        }
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn close(mut self: Box<Self>) -> Result<(), Error> {
        self.file.flush().map_err(|e| err!(Internal, msg("flushing {}", self.path.display()), source(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_caches_results() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CodecCache::new();
        let first = cache.probe(dir.path(), 320, 240, 25.0);
        assert!(!first.is_empty());
        assert!(first.iter().any(|c| c.tag == "MJPG"));
        let second = cache.probe(dir.path(), 320, 240, 25.0);
        assert_eq!(first, second);
    }

    #[test]
    fn mjpeg_writer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut writer = open_writer(CANDIDATES[1], &path, 4, 4, 25.0).unwrap();
        let frame = synthetic_frame(4, 4);
        writer.write_frame(&frame).unwrap();
        assert_eq!(writer.frames_written(), 1);
        writer.close().unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn non_mjpg_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        assert!(open_writer(CANDIDATES[0], &path, 4, 4, 25.0).is_err());
    }
}
