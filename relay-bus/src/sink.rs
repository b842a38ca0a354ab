use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;

use crate::{error::RelayError, frame::Frame, session::RelayLease};

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// One multipart part: boundary line, headers, blank line, image, CRLF.
pub fn encode_part(frame: &Frame) -> Bytes {
    let mut part = BytesMut::with_capacity(PART_HEADER.len() + frame.len() + 2);
    part.put_slice(PART_HEADER);
    part.put_slice(frame.data());
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Writes one viewer's frames as an MJPEG multipart body.
///
/// The lease is released as soon as the stream ends, fails, or the sink is
/// dropped because the client went away, whichever comes first.
pub struct HttpSink {
    lease: Option<RelayLease>,
}

impl HttpSink {
    pub fn new(lease: RelayLease) -> Self {
        Self { lease: Some(lease) }
    }

    pub fn is_open(&self) -> bool {
        self.lease.is_some()
    }

    /// Next encoded part. An `Err` means the upstream failed and the response
    /// must be aborted; `None` means the session ended cleanly.
    pub async fn next_part(&mut self) -> Option<Result<Bytes, RelayError>> {
        let next = self.lease.as_ref()?.recv().await;
        match next {
            Some(Ok(frame)) => Some(Ok(encode_part(&frame))),
            Some(Err(err)) => {
                log::info!("closing viewer: {}", err);
                self.close();
                Some(Err(err))
            }
            None => {
                self.close();
                None
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(lease) = self.lease.take() {
            log::debug!("{}: viewer detached", lease.session().source_id());
            lease.release();
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, RelayError>> + Send + 'static {
        futures::stream::unfold(self, |mut sink| async move {
            let part = sink.next_part().await?;
            Some((part, sink))
        })
    }
}

impl Drop for HttpSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "sink_test.rs"]
mod sink_test;
