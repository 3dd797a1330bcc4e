use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::MAX_LINE_BYTES;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Buffered line-oriented reader over a socket.
///
/// Bytes read past the line the caller asked for stay in the internal
/// buffer; `into_parts` hands them back so the relay can seed its buffer
/// with them instead of losing them.
pub(crate) struct LineReader<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S> LineReader<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub(crate) fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buffer)
    }
}

impl<S> LineReader<S>
where
    S: AsyncRead + Unpin,
{
    /// Reads one line including its `\n` terminator. Fails when the peer
    /// closes before any terminator arrives.
    pub(crate) async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(position) = self.buffer.iter().position(|&byte| byte == b'\n') {
                return Ok(self.buffer.drain(..=position).collect());
            }
            if self.buffer.len() > MAX_LINE_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "protocol line exceeded the line length limit",
                ));
            }
            let mut chunk = [0_u8; READ_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before line terminator",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Returns up to `max` bytes, serving already-buffered bytes first.
    /// An empty result means the peer closed the connection.
    pub(crate) async fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        if !self.buffer.is_empty() {
            let take = self.buffer.len().min(max);
            return Ok(self.buffer.drain(..take).collect());
        }
        let mut chunk = vec![0_u8; max.min(READ_CHUNK_SIZE)];
        let read = self.stream.read(&mut chunk).await?;
        chunk.truncate(read);
        Ok(chunk)
    }
}

/// Strips one trailing `\r\n` or `\n`. A line that strips to nothing is the
/// blank line that ends a header section.
pub(crate) fn strip_line_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::{strip_line_terminator, LineReader};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_lines_and_keeps_the_remainder() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = client;
        writer
            .write_all(b"GET / HTTP/1.0\r\nHost: example\r\n\r\nleftover")
            .await
            .expect("write");
        drop(writer);

        let mut reader = LineReader::new(server);
        assert_eq!(
            reader.read_line().await.expect("first line"),
            b"GET / HTTP/1.0\r\n"
        );
        assert_eq!(
            reader.read_line().await.expect("second line"),
            b"Host: example\r\n"
        );
        assert_eq!(reader.read_line().await.expect("blank line"), b"\r\n");

        let chunk = reader.read_chunk(64).await.expect("leftover");
        assert_eq!(chunk, b"leftover");
    }

    #[tokio::test]
    async fn eof_before_terminator_is_an_error() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = client;
        writer.write_all(b"partial line").await.expect("write");
        drop(writer);

        let mut reader = LineReader::new(server);
        let error = reader.read_line().await.expect_err("must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn bare_newline_terminators_are_accepted() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = client;
        writer.write_all(b"line\nrest\n").await.expect("write");
        drop(writer);

        let mut reader = LineReader::new(server);
        assert_eq!(reader.read_line().await.expect("line"), b"line\n");
        assert_eq!(reader.read_line().await.expect("rest"), b"rest\n");
    }

    #[test]
    fn terminator_stripping_handles_both_forms() {
        assert_eq!(strip_line_terminator(b"value\r\n"), b"value");
        assert_eq!(strip_line_terminator(b"value\n"), b"value");
        assert_eq!(strip_line_terminator(b"\r\n"), b"");
        assert_eq!(strip_line_terminator(b"\n"), b"");
        assert_eq!(strip_line_terminator(b"bare"), b"bare");
    }
}
