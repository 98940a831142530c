// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JPEG encoding shared by the live endpoint (C7), snapshot/thumbnail
//! handlers, and the MJPEG writer (C2). Quality fixed at 85 per spec.md
//! §4.7; `image`'s baseline encoder has no optimize/progressive switches.

use base::{err, Error};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

pub const QUALITY: u8 = 85;

/// Encodes a packed 3-channel RGB buffer as a JPEG.
pub fn encode(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, Error> {
    if rgb.len() != (width as usize) * (height as usize) * 3 {
        return Err(err!(InvalidArgument, msg("rgb buffer size does not match {width}x{height}")));
    }
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, QUALITY);
    encoder
        .write_image(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| err!(Internal, msg("encoding JPEG"), source(e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_solid_frame() {
        let rgb = vec![128u8; 4 * 4 * 3];
        let jpeg = encode(&rgb, 4, 4).unwrap();
        assert!(jpeg.starts_with(&[0xFF, 0xD8]));
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let rgb = vec![0u8; 10];
        assert!(encode(&rgb, 4, 4).is_err());
    }
}
