//! Loading and validation of the mail trace driving PAYLOAD traffic.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// A single legitimate email from the trace.
///
/// `time` is relative to the start of PAYLOAD emission; the engine offsets
/// it by the configured lag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    pub time: f64,
    pub size: usize,
    pub sender: String,
    pub receiver: String,
}

/// Loads the mail trace from a JSON file.
pub fn load_traces(path: &Path) -> Result<Vec<Mail>, SimError> {
    let raw = fs::read_to_string(path)?;
    let traces: Vec<Mail> = serde_json::from_str(&raw)?;

    for (idx, mail) in traces.iter().enumerate() {
        if mail.size == 0 {
            return Err(SimError::Config(format!(
                "trace entry {idx} has an empty body"
            )));
        }
        if mail.time < 0.0 || !mail.time.is_finite() {
            return Err(SimError::Config(format!(
                "trace entry {idx} has an invalid send time"
            )));
        }
        for id in [&mail.sender, &mail.receiver] {
            if !is_user_id(id) {
                return Err(SimError::Config(format!(
                    "trace entry {idx} has a malformed user id: {id}"
                )));
            }
        }
    }

    Ok(traces)
}

/// Checks the `u######` user id format.
pub fn is_user_id(id: &str) -> bool {
    id.len() == 7 && id.starts_with('u') && id[1..].bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn write_trace(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("couldn't create a temporary file");
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn well_formed_trace_loads() {
        let file = write_trace(
            r#"[{"time": 0.5, "size": 100, "sender": "u000000", "receiver": "u000001"}]"#,
        );

        let traces = load_traces(file.path()).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].sender, "u000000");
        assert_eq!(traces[0].size, 100);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let file = write_trace(
            r#"[{"time": 0.0, "size": 1, "sender": "x000000", "receiver": "u000001"}]"#,
        );
        assert!(load_traces(file.path()).is_err());
    }

    #[test]
    fn empty_mails_are_rejected() {
        let file = write_trace(
            r#"[{"time": 0.0, "size": 0, "sender": "u000000", "receiver": "u000001"}]"#,
        );
        assert!(load_traces(file.path()).is_err());
    }

    #[test]
    fn user_id_format() {
        assert!(is_user_id("u012345"));
        assert!(!is_user_id("p000000"));
        assert!(!is_user_id("u01234"));
        assert!(!is_user_id("u01234x"));
    }
}
