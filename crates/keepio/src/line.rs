use bytes::Bytes;
use bytes::BytesMut;
use memchr::memchr;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

/// Cap on a single unterminated line before the reader gives up.
pub const DEFAULT_MAX_LINE: usize = 16 * 1024;

/// Strip one complete line off the front of `buf`, if one is present.
///
/// A line ends at the first LF; an optional CR immediately before the LF is
/// removed along with it. Anything after the LF stays in `buf`. A lone CR is
/// ordinary line content and does not terminate.
pub fn split_line(buf: &mut BytesMut) -> Option<Bytes> {
    let i = memchr(b'\n', buf)?;
    let mut line = buf.split_to(i + 1);
    line.truncate(i);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Some(line.freeze())
}

#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_line: usize,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            max_line: DEFAULT_MAX_LINE,
        }
    }

    pub fn max_line(mut self, max: usize) -> Self {
        self.max_line = max.max(1);
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Bytes buffered but not yet emitted as a line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Read one line, stripping the trailing LF and optional CR.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` for a line (may be empty),
    /// - `Ok(None)` on EOF; a partial trailing fragment is dropped, since
    ///   the peer is gone and the fragment can never complete.
    pub async fn read_line(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(line) = split_line(&mut self.buf) {
                return Ok(Some(line));
            }

            if self.buf.len() > self.max_line {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }
}
