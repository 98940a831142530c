// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP body type used throughout `src/web/` (C7): a single
//! `http_body_util::combinators::BoxBody`, built from whichever concrete body
//! type a given response actually needs (a full in-memory buffer for JSON/
//! JPEG responses, a `StreamBody` for the MJPEG multipart live feed).

use base::Error;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use std::convert::Infallible;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = BoxBody<Bytes, BoxError>;

/// An empty body, e.g. for a 204 or a redirect.
pub fn empty() -> Body {
    Full::new(Bytes::new()).map_err(|e: Infallible| match e {}).boxed()
}

/// A single in-memory buffer, e.g. a JSON or JPEG response.
pub fn full<T: Into<Bytes>>(data: T) -> Body {
    Full::new(data.into()).map_err(|e: Infallible| match e {}).boxed()
}

/// Wraps a [`base::Error`] as a one-chunk error body, for handlers that want
/// to surface the error message as the response body before the connection
/// is reset (used by [`crate::web::serve`] when a handler bails out after
/// already starting to stream).
pub fn from_error(e: Error) -> Body {
    full(e.to_string())
}

/// A body backed by a stream of already-framed chunks, e.g. the MJPEG
/// multipart live feed (C7), where each `Bytes` item is one `--frame`
/// boundary + headers + JPEG payload.
pub fn streaming<S>(stream: S) -> Body
where
    S: futures::Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
{
    use futures::StreamExt;
    StreamBody::new(stream.map(|r| r.map(Frame::data))).boxed()
}
