//! Splits the transcoder's MJPEG output into individual JPEG images.
//!
//! `-f mjpeg` writes back-to-back JPEG files with no container, so a frame
//! is everything from a start-of-image marker (`FF D8`) up to and including
//! the next end-of-image marker (`FF D9`). Entropy-coded data stuffs every
//! `FF` with a following `00`, so the marker pair cannot occur inside a scan.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::RelayError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub struct MjpegCodec {
    max_frame_bytes: usize,
    // 0 while looking for SOI; otherwise the offset where the EOI scan resumes
    scan_from: usize,
    discarded: u64,
}

impl MjpegCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            scan_from: 0,
            discarded: 0,
        }
    }

    /// Bytes thrown away because they were not part of any image.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn discard(&mut self, buf: &mut BytesMut, n: usize) {
        if n > 0 {
            log::debug!("mjpeg: discarding {} bytes outside of any image", n);
            self.discarded += n as u64;
            buf.advance(n);
        }
    }
}

impl Default for MjpegCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for MjpegCodec {
    type Item = Bytes;
    type Error = RelayError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, RelayError> {
        if self.scan_from == 0 {
            match find(buf, &SOI, 0) {
                Some(pos) => self.discard(buf, pos),
                None => {
                    // a trailing FF may be the first half of the next SOI
                    let keep = usize::from(buf.last() == Some(&SOI[0]));
                    let n = buf.len() - keep;
                    self.discard(buf, n);
                    return Ok(None);
                }
            }
            self.scan_from = SOI.len();
        }

        match find(buf, &EOI, self.scan_from) {
            Some(pos) => {
                self.scan_from = 0;
                Ok(Some(buf.split_to(pos + EOI.len()).freeze()))
            }
            None => {
                if buf.len() > self.max_frame_bytes {
                    self.scan_from = 0;
                    return Err(RelayError::Framing(format!(
                        "image exceeds {} bytes without an end marker",
                        self.max_frame_bytes
                    )));
                }
                // step back one byte so a marker split across reads is found
                self.scan_from = buf.len().saturating_sub(1).max(SOI.len());
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, RelayError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        let n = buf.len();
        self.discard(buf, n);
        self.scan_from = 0;
        Ok(None)
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
