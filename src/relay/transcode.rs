//! Content-encoding transcoding.
//!
//! # Decision Table
//! ```text
//! origin gzip │ caller gzip │ plan             │ delivery          │ capture
//! ────────────┼─────────────┼──────────────────┼───────────────────┼──────────────
//! yes         │ yes         │ CaptureDecoded   │ origin bytes      │ decoded copy
//! yes         │ no          │ DeliverDecoded   │ decoded (shared)  │ decoded (shared)
//! no          │ yes, elig.  │ DeliverEncoded   │ gzip-encoded copy │ origin bytes
//! no          │ yes, inelig.│ Passthrough      │ origin bytes      │ origin bytes
//! no          │ no          │ Passthrough      │ origin bytes      │ origin bytes
//! ```
//!
//! At most one decode or one encode happens per byte stream, never both.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;

use crate::error::{ProxyError, ProxyResult};
use crate::http::headers::HeaderSet;

/// How the origin body is split into delivery and capture streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodePlan {
    /// Same bytes to both paths.
    Passthrough,
    /// Gzip origin, gzip caller: relay as-is, decode for capture.
    CaptureDecoded,
    /// Gzip origin, caller without gzip: decode once, share with both paths.
    DeliverDecoded,
    /// Plain origin, gzip caller: encode for delivery, capture as-is.
    DeliverEncoded {
        /// Sync-flush the encoder after every chunk (origin sent no length).
        flush_per_chunk: bool,
    },
}

impl TranscodePlan {
    /// Pick the plan for a response.
    ///
    /// `bodiless` covers HEAD requests and 204/304 responses, which are never
    /// re-encoded.
    pub fn choose(origin: &HeaderSet, caller_accepts_gzip: bool, bodiless: bool) -> Self {
        if origin_is_gzip(origin) {
            return if caller_accepts_gzip {
                TranscodePlan::CaptureDecoded
            } else {
                TranscodePlan::DeliverDecoded
            };
        }

        if caller_accepts_gzip && !bodiless && is_encoding_eligible(origin.get("content-type")) {
            TranscodePlan::DeliverEncoded {
                flush_per_chunk: !origin.contains("content-length"),
            }
        } else {
            TranscodePlan::Passthrough
        }
    }

    pub fn decodes(&self) -> bool {
        matches!(self, TranscodePlan::CaptureDecoded | TranscodePlan::DeliverDecoded)
    }

    pub fn encodes(&self) -> bool {
        matches!(self, TranscodePlan::DeliverEncoded { .. })
    }

    /// Bring response headers in line with what the caller will receive.
    ///
    /// Every change goes through [`HeaderSet`], keeping the raw sequence and
    /// canonical mapping consistent for the next restore.
    pub fn apply_headers(&self, headers: &mut HeaderSet) -> ProxyResult<()> {
        match self {
            TranscodePlan::Passthrough | TranscodePlan::CaptureDecoded => {}
            TranscodePlan::DeliverDecoded => {
                headers.set("Content-Encoding", "identity")?;
                headers.remove("content-length");
            }
            TranscodePlan::DeliverEncoded { .. } => {
                headers.set("Content-Encoding", "gzip")?;
                headers.remove("content-length");
            }
        }
        Ok(())
    }
}

fn origin_is_gzip(headers: &HeaderSet) -> bool {
    headers
        .get("content-encoding")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Whether a plain response may be gzip-encoded on the way to the caller.
///
/// Compares the whole header value, case-sensitively: anything mentioning
/// image/audio/video is ineligible, and so is any value mentioning
/// `application` unless it is exactly `application/json`. A missing content
/// type is eligible.
pub fn is_encoding_eligible(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    if ["image", "audio", "video"].iter().any(|kind| content_type.contains(kind)) {
        return false;
    }
    content_type == "application/json" || !content_type.contains("application")
}

/// One chunk split into its delivery and capture halves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forked {
    pub delivery: Bytes,
    pub capture: Bytes,
}

/// Streaming transcoder for one response body.
pub struct Transcoder {
    plan: TranscodePlan,
    decoder: Option<GzDecoder<Vec<u8>>>,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl Transcoder {
    pub fn new(plan: TranscodePlan) -> Self {
        Self {
            plan,
            decoder: plan.decodes().then(|| GzDecoder::new(Vec::new())),
            encoder: plan
                .encodes()
                .then(|| GzEncoder::new(Vec::new(), Compression::default())),
        }
    }

    pub fn plan(&self) -> TranscodePlan {
        self.plan
    }

    /// Feed one origin chunk.
    pub fn push(&mut self, chunk: Bytes) -> ProxyResult<Forked> {
        match self.plan {
            TranscodePlan::Passthrough => Ok(Forked {
                delivery: chunk.clone(),
                capture: chunk,
            }),
            TranscodePlan::CaptureDecoded => Ok(Forked {
                capture: self.decode(&chunk),
                delivery: chunk,
            }),
            TranscodePlan::DeliverDecoded => {
                let decoded = self.decode(&chunk);
                Ok(Forked {
                    delivery: decoded.clone(),
                    capture: decoded,
                })
            }
            TranscodePlan::DeliverEncoded { flush_per_chunk } => Ok(Forked {
                delivery: self.encode(&chunk, flush_per_chunk)?,
                capture: chunk,
            }),
        }
    }

    /// Drain whatever the codec still holds at end of stream.
    pub fn finish(&mut self) -> ProxyResult<Forked> {
        if let Some(mut decoder) = self.decoder.take() {
            let tail = match decoder.try_finish() {
                Ok(()) => Bytes::from(std::mem::take(decoder.get_mut())),
                Err(e) => {
                    tracing::warn!(error = %e, "Truncated gzip stream from origin");
                    Bytes::from(std::mem::take(decoder.get_mut()))
                }
            };
            return Ok(match self.plan {
                TranscodePlan::DeliverDecoded => Forked {
                    delivery: tail.clone(),
                    capture: tail,
                },
                _ => Forked {
                    delivery: Bytes::new(),
                    capture: tail,
                },
            });
        }

        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish().map_err(ProxyError::Io)?;
            return Ok(Forked {
                delivery: Bytes::from(tail),
                capture: Bytes::new(),
            });
        }

        Ok(Forked::default())
    }

    /// Decode a chunk. A corrupt stream ends the decoded output: the error is
    /// logged and every later chunk decodes to nothing.
    fn decode(&mut self, chunk: &[u8]) -> Bytes {
        let Some(decoder) = self.decoder.as_mut() else {
            return Bytes::new();
        };
        match decoder.write_all(chunk) {
            Ok(()) => Bytes::from(std::mem::take(decoder.get_mut())),
            Err(e) => {
                tracing::warn!(error = %e, "Gzip decode failed; ending decoded stream");
                let partial = Bytes::from(std::mem::take(decoder.get_mut()));
                self.decoder = None;
                partial
            }
        }
    }

    fn encode(&mut self, chunk: &[u8], flush: bool) -> ProxyResult<Bytes> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(Bytes::new());
        };
        encoder.write_all(chunk)?;
        if flush {
            encoder.flush()?;
        }
        Ok(Bytes::from(std::mem::take(encoder.get_mut())))
    }
}
