//! Newline-delimited JSON framing over any async byte stream.
//!
//! One message per line. Reads are bounded so a misbehaving peer cannot
//! grow a line without limit; base64-wrapped 64 KiB chunks fit well
//! inside the bound. `recv` accumulates partial lines inside the
//! `Wire`, so it can be raced against timeouts in `select!` without
//! tearing frames.

use crate::message::Message;
use crate::{Error, Result};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

/// Upper bound on a single wire line, including the trailing newline.
pub const MAX_LINE_BYTES: usize = 512 * 1024;

/// A framed bidirectional connection.
pub struct Wire<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: WriteHalf<T>,
    /// Partial line carried across cancelled reads.
    line_buf: Vec<u8>,
}

impl<T: AsyncRead + AsyncWrite> Wire<T> {
    pub fn new(stream: T) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self { reader: BufReader::new(read), writer: write, line_buf: Vec::new() }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Wire<T> {
    /// Write one message followed by `\n` and flush.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next message. `Ok(None)` means the peer closed the
    /// connection cleanly. Blank lines are skipped.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if self.line_buf.last() != Some(&b'\n') {
                let remaining = MAX_LINE_BYTES.saturating_sub(self.line_buf.len());
                if remaining == 0 {
                    return Err(Error::LineTooLong { max: MAX_LINE_BYTES });
                }
                let n = (&mut self.reader)
                    .take(remaining as u64)
                    .read_until(b'\n', &mut self.line_buf)
                    .await?;
                if n == 0 {
                    if self.line_buf.iter().all(u8::is_ascii_whitespace) {
                        return Ok(None);
                    }
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )));
                }
                if self.line_buf.last() != Some(&b'\n') {
                    // Either the cap was hit or more bytes are pending.
                    continue;
                }
            }
            let line = std::mem::take(&mut self.line_buf);
            let trimmed = trim_ascii(&line);
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_slice(trimmed)?));
        }
    }

    /// Shut down the write side, signalling end-of-stream to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn trim_ascii(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JobSpec, StreamKind};
    use std::time::Duration;

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Wire::new(a);
        let mut right = Wire::new(b);

        left.send(&Message::Queue).await.unwrap();
        left.send(&Message::Attach { job_id: "ab12cd34".into() }).await.unwrap();

        assert!(matches!(right.recv().await.unwrap(), Some(Message::Queue)));
        match right.recv().await.unwrap() {
            Some(Message::Attach { job_id }) => assert_eq!(job_id, "ab12cd34"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Wire::new(a);
        let mut right = Wire::new(b);
        left.send(&Message::Queue).await.unwrap();
        left.shutdown().await.unwrap();
        drop(left);

        assert!(right.recv().await.unwrap().is_some());
        assert!(right.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn payload_newlines_do_not_split_frames() {
        // Raw newlines in the child output must survive framing because
        // the payload travels base64-encoded.
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Wire::new(a);
        let mut right = Wire::new(b);

        let data = b"line one\nline two\n".to_vec();
        left.send(&Message::Out {
            job_id: "ab12cd34".into(),
            stream: StreamKind::Stdout,
            data: data.clone(),
        })
        .await
        .unwrap();

        match right.recv().await.unwrap() {
            Some(Message::Out { data: got, .. }) => assert_eq!(got, data),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_line_is_an_error_not_a_hang() {
        let (a, b) = tokio::io::duplex(4096);
        let mut right = Wire::new(b);
        use tokio::io::AsyncWriteExt as _;
        let mut raw = a;
        raw.write_all(b"{not json}\n").await.unwrap();
        assert!(right.recv().await.is_err());
    }

    #[tokio::test]
    async fn a_timed_out_read_does_not_tear_the_frame() {
        let (a, b) = tokio::io::duplex(4096);
        let mut right = Wire::new(b);
        use tokio::io::AsyncWriteExt as _;
        let mut raw = a;

        // first half of a frame, then a pause, then the rest
        raw.write_all(br#"{"type":"attach","#).await.unwrap();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), right.recv()).await;
        assert!(timed_out.is_err(), "read should still be pending");

        raw.write_all(b"\"job_id\":\"ab12cd34\"}\n").await.unwrap();
        match right.recv().await.unwrap() {
            Some(Message::Attach { job_id }) => assert_eq!(job_id, "ab12cd34"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_spec_round_trips() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Wire::new(a);
        let mut right = Wire::new(b);

        let spec = JobSpec {
            owner: "alice".into(),
            command: "python train.py".into(),
            gpus: 2,
            pins: vec![],
            priority: 5,
            distributed: Default::default(),
            interactive: true,
            cancel_on_detach: None,
            mem_mb: Some(16_000),
        };
        left.send(&Message::Submit { spec }).await.unwrap();
        match right.recv().await.unwrap() {
            Some(Message::Submit { spec }) => {
                assert_eq!(spec.owner, "alice");
                assert_eq!(spec.gpus, 2);
                assert_eq!(spec.mem_mb, Some(16_000));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
