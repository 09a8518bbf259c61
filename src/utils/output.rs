/// Bounded output capture for auxiliary commands
///
/// One reader thread per stream feeds a channel; the collector keeps each
/// stream plus an arrival-ordered combined buffer, all capped at `limit`.
/// Readers keep draining past the cap so the child never blocks on a full pipe.
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::{self, Read};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub combined: Vec<u8>,
    pub truncated: bool,
}

fn append_bounded(buffer: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(buffer.len());
    buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
    chunk.len() > room
}

impl CapturedOutput {
    fn push(&mut self, stream: Stream, chunk: &[u8], limit: usize) {
        let target = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        let cut = append_bounded(target, chunk, limit);
        let cut_combined = append_bounded(&mut self.combined, chunk, limit);
        self.truncated |= cut || cut_combined;
    }
}

/// Running capture of a child's stdout and stderr.
pub struct OutputCapture {
    rx: Receiver<(Stream, Vec<u8>)>,
    readers: Vec<JoinHandle<()>>,
    limit: usize,
}

impl OutputCapture {
    /// Spawn one named reader thread per present stream.
    pub fn start<O, E>(stdout: Option<O>, stderr: Option<E>, limit: usize) -> io::Result<Self>
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let mut readers = Vec::new();
        if let Some(out) = stdout {
            let tx = tx.clone();
            readers.push(
                thread::Builder::new()
                    .name("capture-stdout".to_string())
                    .spawn(move || pump(out, Stream::Stdout, tx))?,
            );
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            readers.push(
                thread::Builder::new()
                    .name("capture-stderr".to_string())
                    .spawn(move || pump(err, Stream::Stderr, tx))?,
            );
        }
        drop(tx);
        Ok(Self { rx, readers, limit })
    }

    /// Collect until both streams close or `grace` passes.
    ///
    /// A descendant holding the pipe open past `grace` is abandoned.
    pub fn finish(self, grace: Duration) -> CapturedOutput {
        let deadline = Instant::now() + grace;
        let mut output = CapturedOutput::default();
        let mut closed = true;
        loop {
            let now = Instant::now();
            let wait = deadline.saturating_duration_since(now);
            match self.rx.recv_timeout(wait) {
                Ok((stream, chunk)) => output.push(stream, &chunk, self.limit),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    closed = false;
                    break;
                }
            }
        }
        if closed {
            for reader in self.readers {
                let _ = reader.join();
            }
        } else {
            log::warn!("Output streams still open after {:?}, returning partial output", grace);
            output.truncated = true;
        }
        output
    }
}

fn pump<R: Read>(mut reader: R, stream: Stream, tx: Sender<(Stream, Vec<u8>)>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((stream, chunk[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("{:?} read failed: {}", stream, e);
                break;
            }
        }
    }
}
