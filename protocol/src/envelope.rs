//! Ordinal-style binary media envelope
//!
//! Layout: nested marker, MIME-type string, a single NUL byte, then the raw
//! content bytes. Encoding and decoding must round-trip bit-for-bit.

use crate::error::DecodeError;
use crate::types::MediaPayload;

/// Nested marker opening a media envelope.
pub const MEDIA_MARKER: &[u8] = b"ord";

pub fn decode(bytes: &[u8], vout: u32) -> Result<MediaPayload, DecodeError> {
    let body = bytes
        .strip_prefix(MEDIA_MARKER)
        .ok_or_else(|| DecodeError::BadEnvelope {
            vout,
            reason: "missing media marker".into(),
        })?;

    let nul = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| DecodeError::BadEnvelope {
            vout,
            reason: "unterminated MIME type".into(),
        })?;

    let mime_type = std::str::from_utf8(&body[..nul])
        .map_err(|_| DecodeError::BadEnvelope {
            vout,
            reason: "MIME type is not valid UTF-8".into(),
        })?
        .to_string();

    Ok(MediaPayload { mime_type, bytes: body[nul + 1..].to_vec() })
}

pub fn encode(media: &MediaPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(MEDIA_MARKER.len() + media.mime_type.len() + 1 + media.bytes.len());
    out.extend_from_slice(MEDIA_MARKER);
    out.extend_from_slice(media.mime_type.as_bytes());
    out.push(0);
    out.extend_from_slice(&media.bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let media = MediaPayload { mime_type: "image/png".into(), bytes: vec![0x89, 0x50, 0x4e, 0x47, 0x00, 0xff] };
        let encoded = encode(&media);
        assert_eq!(decode(&encoded, 0).unwrap(), media);
    }

    #[test]
    fn content_may_contain_nul_bytes() {
        // Only the first NUL terminates the MIME type.
        let media = MediaPayload { mime_type: "application/octet-stream".into(), bytes: vec![0, 0, 1] };
        assert_eq!(decode(&encode(&media), 3).unwrap(), media);
    }

    #[test]
    fn missing_marker() {
        let err = decode(b"image/png\0data", 2).unwrap_err();
        assert!(matches!(err, DecodeError::BadEnvelope { vout: 2, .. }));
    }

    #[test]
    fn unterminated_mime() {
        let mut bytes = MEDIA_MARKER.to_vec();
        bytes.extend_from_slice(b"image/png");
        let err = decode(&bytes, 1).unwrap_err();
        assert!(matches!(err, DecodeError::BadEnvelope { vout: 1, .. }));
    }
}
