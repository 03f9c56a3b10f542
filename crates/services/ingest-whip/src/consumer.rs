//! Stream consumers: where each session's MPEG-TS bytes end up
//!
//! A consumer runs on a blocking thread and owns the stream until it
//! returns; the session ends right after.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};
use whip_mpegts_core::OutputStream;

use crate::config::{OutputConfig, OutputMode};
use crate::session::SessionId;

pub trait StreamConsumer: Send + Sync {
    /// Called once per activated session with its output stream.
    fn consume(&self, session_id: &SessionId, stream: OutputStream);
}

impl<F> StreamConsumer for F
where
    F: Fn(&SessionId, OutputStream) + Send + Sync,
{
    fn consume(&self, session_id: &SessionId, stream: OutputStream) {
        self(session_id, stream)
    }
}

/// Build the consumer selected by `[output]`
pub fn from_config(config: &OutputConfig) -> Arc<dyn StreamConsumer> {
    match config.mode {
        OutputMode::Stdout => Arc::new(StdoutConsumer::default()),
        OutputMode::Directory => Arc::new(DirectoryConsumer::new(config.directory.clone())),
    }
}

/// Copies streams to standard output, one whole session at a time
#[derive(Default)]
pub struct StdoutConsumer {
    // Concurrent sessions would otherwise interleave transport packets
    exclusive: Mutex<()>,
}

impl StreamConsumer for StdoutConsumer {
    fn consume(&self, session_id: &SessionId, mut stream: OutputStream) {
        let _guard = self.exclusive.lock();
        info!(session_id = %session_id, "Writing stream to stdout");

        let stdout = io::stdout();
        let mut out = stdout.lock();
        match io::copy(&mut stream, &mut out).and_then(|n| out.flush().map(|_| n)) {
            Ok(bytes) => info!(session_id = %session_id, bytes, "Stream finished"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Stream ended with error"),
        }
    }
}

/// Writes each session to `<directory>/<session-id>.ts`
pub struct DirectoryConsumer {
    directory: PathBuf,
}

impl DirectoryConsumer {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.directory.join(format!("{}.ts", session_id))
    }

    fn write(&self, session_id: &SessionId, stream: &mut OutputStream) -> io::Result<u64> {
        std::fs::create_dir_all(&self.directory)?;
        let mut file = BufWriter::new(File::create(self.path_for(session_id))?);
        let bytes = io::copy(stream, &mut file)?;
        file.flush()?;
        Ok(bytes)
    }
}

impl StreamConsumer for DirectoryConsumer {
    fn consume(&self, session_id: &SessionId, mut stream: OutputStream) {
        let path = self.path_for(session_id);
        info!(session_id = %session_id, path = %path.display(), "Recording stream");

        match self.write(session_id, &mut stream) {
            Ok(bytes) => info!(session_id = %session_id, bytes, "Recording finished"),
            Err(e) => error!(
                session_id = %session_id,
                path = %path.display(),
                error = %e,
                "Recording failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whip_mpegts_core::output_relay;

    #[test]
    fn test_directory_consumer_writes_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let consumer = DirectoryConsumer::new(dir.path().join("out"));
        let id = SessionId::from("abc123");

        let (sink, stream) = output_relay(4);
        let writer = std::thread::spawn(move || {
            sink.send(&[0x47; 188]).unwrap();
            sink.send(&[0x47; 188]).unwrap();
        });
        let reader = std::thread::spawn({
            let id = id.clone();
            move || consumer.consume(&id, stream)
        });
        writer.join().unwrap();
        reader.join().unwrap();

        let written = std::fs::read(dir.path().join("out").join("abc123.ts")).unwrap();
        assert_eq!(written.len(), 376);
    }

    #[test]
    fn test_closure_is_a_consumer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer: Arc<dyn StreamConsumer> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |id: &SessionId, _stream: OutputStream| {
                seen.lock().push(id.clone());
            })
        };

        let (_sink, stream) = output_relay(1);
        consumer.consume(&SessionId::from("s1"), stream);
        assert_eq!(seen.lock().as_slice(), &[SessionId::from("s1")]);
    }
}
