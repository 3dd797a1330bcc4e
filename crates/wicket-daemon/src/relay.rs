use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::MAX_BUFFER_SIZE;

const IO_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug)]
pub(crate) enum RelayOutcome {
    /// One peer closed; the remainder was drained and both sockets shut.
    Eof,
    /// No readiness event inside the idle bound.
    IdleTimeout,
    TransportError(io::Error),
}

impl RelayOutcome {
    pub(crate) fn reason_detail(&self) -> Option<String> {
        match self {
            Self::Eof | Self::IdleTimeout => None,
            Self::TransportError(error) => Some(error.to_string()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct RelayTotals {
    pub(crate) from_client: u64,
    pub(crate) from_server: u64,
}

/// Fixed-capacity byte buffer for one relay direction. Writes drain what
/// they can and leave the remainder.
struct RelayBuffer {
    data: BytesMut,
}

impl RelayBuffer {
    fn seeded(pending: Vec<u8>) -> Self {
        let mut data = BytesMut::with_capacity(MAX_BUFFER_SIZE);
        data.extend_from_slice(&pending);
        Self { data }
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn room(&self) -> usize {
        MAX_BUFFER_SIZE.saturating_sub(self.data.len())
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    fn consume(&mut self, count: usize) {
        self.data.advance(count);
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

enum IoStep {
    Progress(u64),
    WouldBlock,
    Eof,
    Failed(io::Error),
}

enum LoopExit {
    Eof,
    Idle,
    Error(io::Error),
}

/// Dual-direction buffered relay.
///
/// A socket is read when its ingress buffer has room and written when the
/// buffer destined for it holds bytes; the loop waits on readiness for
/// exactly those interests. The idle clock restarts on every readiness
/// wake. The first end-of-stream or hard error ends the loop, after which
/// each buffer is flushed best-effort to its intended destination.
pub(crate) async fn relay_connection(
    mut client: TcpStream,
    mut server: TcpStream,
    client_pending: Vec<u8>,
    server_pending: Vec<u8>,
    idle_timeout: Duration,
) -> (RelayOutcome, RelayTotals) {
    let mut cbuffer = RelayBuffer::seeded(client_pending);
    let mut sbuffer = RelayBuffer::seeded(server_pending);
    let mut totals = RelayTotals {
        from_client: cbuffer.len() as u64,
        from_server: sbuffer.len() as u64,
    };
    let mut last_activity = Instant::now();

    let exit = loop {
        let client_interest = build_interest(cbuffer.room() > 0, !sbuffer.is_empty());
        let server_interest = build_interest(sbuffer.room() > 0, !cbuffer.is_empty());

        let step = tokio::select! {
            _ = tokio::time::sleep_until(last_activity + idle_timeout) => {
                if last_activity.elapsed() >= idle_timeout {
                    break LoopExit::Idle;
                }
                continue;
            }
            ready = client.ready(client_interest.unwrap_or(Interest::READABLE)),
                if client_interest.is_some() =>
            {
                last_activity = Instant::now();
                match ready {
                    Ok(readiness) => {
                        let mut step = IoStep::WouldBlock;
                        if readiness.is_readable() && cbuffer.room() > 0 {
                            step = read_into(&client, &mut cbuffer);
                            if let IoStep::Progress(read) = &step {
                                totals.from_client += *read;
                            }
                        }
                        if matches!(step, IoStep::WouldBlock | IoStep::Progress(_))
                            && readiness.is_writable()
                            && !sbuffer.is_empty()
                        {
                            let write_step = write_from(&client, &mut sbuffer);
                            if !matches!(write_step, IoStep::WouldBlock) {
                                step = write_step;
                            }
                        }
                        step
                    }
                    Err(error) => IoStep::Failed(error),
                }
            }
            ready = server.ready(server_interest.unwrap_or(Interest::READABLE)),
                if server_interest.is_some() =>
            {
                last_activity = Instant::now();
                match ready {
                    Ok(readiness) => {
                        let mut step = IoStep::WouldBlock;
                        if readiness.is_readable() && sbuffer.room() > 0 {
                            step = read_into(&server, &mut sbuffer);
                            if let IoStep::Progress(read) = &step {
                                totals.from_server += *read;
                            }
                        }
                        if matches!(step, IoStep::WouldBlock | IoStep::Progress(_))
                            && readiness.is_writable()
                            && !cbuffer.is_empty()
                        {
                            let write_step = write_from(&server, &mut cbuffer);
                            if !matches!(write_step, IoStep::WouldBlock) {
                                step = write_step;
                            }
                        }
                        step
                    }
                    Err(error) => IoStep::Failed(error),
                }
            }
        };

        match step {
            IoStep::Progress(_) | IoStep::WouldBlock => {}
            IoStep::Eof => break LoopExit::Eof,
            IoStep::Failed(error) => break LoopExit::Error(error),
        }
    };

    // Best-effort drain: each buffer goes to its intended destination,
    // bounded by the idle timeout.
    if !sbuffer.is_empty() {
        let _ = tokio::time::timeout(idle_timeout, client.write_all(sbuffer.as_slice())).await;
    }
    if !cbuffer.is_empty() {
        let _ = tokio::time::timeout(idle_timeout, server.write_all(cbuffer.as_slice())).await;
    }
    let _ = client.shutdown().await;
    let _ = server.shutdown().await;

    let outcome = match exit {
        LoopExit::Eof => RelayOutcome::Eof,
        LoopExit::Idle => RelayOutcome::IdleTimeout,
        LoopExit::Error(error) => RelayOutcome::TransportError(error),
    };
    (outcome, totals)
}

fn build_interest(readable: bool, writable: bool) -> Option<Interest> {
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn read_into(stream: &TcpStream, buffer: &mut RelayBuffer) -> IoStep {
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    let take = buffer.room().min(IO_CHUNK_SIZE);
    match stream.try_read(&mut chunk[..take]) {
        Ok(0) => IoStep::Eof,
        Ok(read) => {
            buffer.extend(&chunk[..read]);
            IoStep::Progress(read as u64)
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => IoStep::WouldBlock,
        Err(error) => IoStep::Failed(error),
    }
}

fn write_from(stream: &TcpStream, buffer: &mut RelayBuffer) -> IoStep {
    match stream.try_write(buffer.as_slice()) {
        Ok(0) => IoStep::Failed(io::Error::new(
            io::ErrorKind::WriteZero,
            "relay peer accepted no bytes",
        )),
        Ok(written) => {
            buffer.consume(written);
            IoStep::Progress(written as u64)
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => IoStep::WouldBlock,
        Err(error) => IoStep::Failed(error),
    }
}
