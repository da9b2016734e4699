//! Log sinks: the per-event traffic log and tracing initialisation.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
};

use tracing::warn;

/// Enables tracing output filtered by `RUST_LOG`.
pub fn enable_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Buffered sink for the per-event traffic log.
///
/// One line per wire emission or destination delivery:
/// `<t.7f> <sender> <next_node> <msg_id> <split> <of_type>`.
pub struct TrafficLog {
    out: BufWriter<File>,
    write_failed: bool,
}

impl TrafficLog {
    /// Opens the log in append mode, so a restored run continues the file
    /// its checkpointed predecessor started.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file: File = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            write_failed: false,
        })
    }

    pub fn record(
        &mut self,
        time: f64,
        sender: &str,
        next_node: &str,
        msg_id: &str,
        split: &str,
        of_type: &str,
    ) {
        let result = writeln!(
            self.out,
            "{time:.7} {sender} {next_node} {msg_id} {split} {of_type}"
        );

        // A full disk shouldn't kill a long simulation; complain once.
        if result.is_err() && !self.write_failed {
            self.write_failed = true;
            warn!("traffic log writes are failing");
        }
    }

    pub fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

impl Drop for TrafficLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;

    #[test]
    fn lines_follow_the_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");

        let mut log = TrafficLog::create(&path).unwrap();
        log.record(
            12.5,
            "u000000",
            "p000001",
            "0123456789abcdef01234567",
            "00000",
            "PAYLOAD",
        );
        log.flush();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "12.5000000 u000000 p000001 0123456789abcdef01234567 00000 PAYLOAD\n"
        );
    }
}
