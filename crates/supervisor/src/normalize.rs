use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Reader adapter that rewrites every carriage return to a line feed.
///
/// ffmpeg repaints its status line with `\r`; after this adapter every repaint
/// is its own line. Byte counts are unchanged and nothing is buffered.
#[derive(Debug)]
pub struct CrToLf<R> {
    inner: R,
}

impl<R> CrToLf<R> {
    pub fn new(inner: R) -> Self {
        CrToLf { inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CrToLf<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let start = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            for b in &mut buf.filled_mut()[start..] {
                if *b == b'\r' {
                    *b = b'\n';
                }
            }
        }
        poll
    }
}
