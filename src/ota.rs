// ota.rs

use crate::*;

use futures::{Stream, StreamExt};
use std::fmt::Display;

const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_PREAMBLE: usize = 1024;

/// Destination of a streamed firmware image, normally the next OTA partition.
pub trait FirmwareSink: Send {
    /// Start writing a new image.
    fn begin(&mut self) -> anyhow::Result<Box<dyn FirmwareUpdate + '_>>;
}

/// An image write in progress.
pub trait FirmwareUpdate: Send {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;
    /// Validate the image and make it the next boot target.
    fn complete(self: Box<Self>) -> anyhow::Result<()>;
    /// Drop a half-written image.
    fn abort(self: Box<Self>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtaOutcome {
    Flashed,
    Failed,
}

/// Separates image bytes from the transport framing around them.
///
/// A body opening with a multipart boundary or a header line is framed: the
/// header block up to the first blank line is dropped, and for a boundary
/// the matching closing boundary is dropped from the tail of the stream.
/// Anything else is taken as the bare image.
#[derive(Debug, Default)]
pub struct ImageFramer {
    head: Vec<u8>,
    in_body: bool,
    closing: Option<Vec<u8>>,
    tail: Vec<u8>,
}

impl ImageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed transport bytes, append ready image bytes to `out`.
    pub fn push(&mut self, data: &[u8], out: &mut Vec<u8>) {
        if self.in_body {
            self.emit(data, out);
            return;
        }

        self.head.extend_from_slice(data);
        match framing(&self.head) {
            Some(false) => self.enter_body(0, out),
            Some(true) => {
                if let Some(pos) = find(&self.head, HEADER_END) {
                    self.closing = closing_boundary(&self.head[..pos]);
                    debug!("Stripped {} byte preamble", pos + HEADER_END.len());
                    self.enter_body(pos + HEADER_END.len(), out);
                }
            }
            None => {}
        }
        if !self.in_body && self.head.len() > MAX_PREAMBLE {
            warn!("No end of upload header within {MAX_PREAMBLE} bytes, writing as is");
            self.enter_body(0, out);
        }
    }

    /// End of stream: flush whatever is held back.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.in_body {
            self.enter_body(0, out);
        }
        if let Some(closing) = self.closing.take() {
            let n = self.tail.len();
            if self.tail.ends_with(b"\r\n") && self.tail[..n - 2].ends_with(&closing) {
                self.tail.truncate(n - 2);
            }
            if self.tail.ends_with(&closing) {
                self.tail.truncate(self.tail.len() - closing.len());
            }
        }
        out.append(&mut self.tail);
    }

    fn enter_body(&mut self, skip: usize, out: &mut Vec<u8>) {
        let head = std::mem::take(&mut self.head);
        self.in_body = true;
        self.emit(&head[skip..], out);
    }

    fn emit(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let Some(closing) = &self.closing else {
            out.extend_from_slice(data);
            return;
        };
        let keep = closing.len() + 2;
        self.tail.extend_from_slice(data);
        if self.tail.len() > keep {
            let n = self.tail.len() - keep;
            out.extend(self.tail.drain(..n));
        }
    }
}

/// `Some(true)` if the body opens with a boundary or a `Name:` header line,
/// `Some(false)` for anything else, `None` while too short to tell.
fn framing(head: &[u8]) -> Option<bool> {
    if head.starts_with(b"--") {
        return Some(true);
    }
    for (i, b) in head.iter().enumerate() {
        match b {
            b':' => return Some(i > 0),
            b'-' | b'_' => {}
            b if b.is_ascii_alphanumeric() => {}
            _ => return Some(false),
        }
    }
    None
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

fn closing_boundary(head: &[u8]) -> Option<Vec<u8>> {
    let line_end = find(head, b"\r\n").unwrap_or(head.len());
    let first = &head[..line_end];
    if first.len() > 2 && first.starts_with(b"--") {
        let mut c = b"\r\n".to_vec();
        c.extend_from_slice(first);
        c.extend_from_slice(b"--");
        Some(c)
    } else {
        None
    }
}

/// Stream a firmware upload into `sink`.
///
/// `declared_len` counts transport bytes, framing included; `None` reads to
/// end of stream. A read that times out is retried, any other read error
/// aborts the update and is returned as `Err`. Sink failures are reported as
/// [`OtaOutcome::Failed`].
pub async fn receive_firmware<S, B, E>(
    sink: &mut dyn FirmwareSink,
    body: S,
    declared_len: Option<usize>,
    config: &MyConfig,
) -> anyhow::Result<OtaOutcome>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut framer = ImageFramer::new();
    let mut image = Vec::with_capacity(config.ota_chunk_size);
    let mut received = 0usize;
    let read_timeout = config.ota_read_timeout();
    let chunk_size = config.ota_chunk_size.max(1);

    info!("OTA file size: {declared_len:?}");
    let mut update = match sink.begin() {
        Ok(u) => u,
        Err(e) => {
            error!("Error with OTA begin, canceling OTA: {e:#}");
            return Ok(OtaOutcome::Failed);
        }
    };

    loop {
        if declared_len.is_some_and(|len| received >= len) {
            break;
        }

        let data = match tokio::time::timeout(read_timeout, body.next()).await {
            Err(_) => {
                info!("OTA socket timeout, retrying read");
                continue;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                error!("OTA read error: {e}");
                update.abort();
                bail!("firmware upload aborted: {e}");
            }
            Ok(Some(Ok(data))) => data,
        };

        let data = data.as_ref();
        received += data.len();
        debug!("OTA RX: {received} of {declared_len:?}");

        framer.push(data, &mut image);
        if let Err(e) = write_chunks(update.as_mut(), &mut image, chunk_size) {
            error!("OTA write error: {e:#}");
            update.abort();
            return Ok(OtaOutcome::Failed);
        }
    }

    framer.finish(&mut image);
    if let Err(e) = write_chunks(update.as_mut(), &mut image, chunk_size) {
        error!("OTA write error: {e:#}");
        update.abort();
        return Ok(OtaOutcome::Failed);
    }

    if let Err(e) = update.complete() {
        error!("OTA completion error: {e:#}");
        return Ok(OtaOutcome::Failed);
    }
    info!("OTA image written, {received} bytes received");
    Ok(OtaOutcome::Flashed)
}

fn write_chunks(
    update: &mut dyn FirmwareUpdate,
    image: &mut Vec<u8>,
    chunk_size: usize,
) -> anyhow::Result<()> {
    for chunk in image.chunks(chunk_size) {
        update.write(chunk)?;
    }
    image.clear();
    Ok(())
}

// EOF
