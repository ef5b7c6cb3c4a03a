//! Append-only scenario store.
//!
//! One JSON object per line, `{"key": ..., "record": ...}`. Each append is a single
//! write followed by a flush and `sync_data`, so an interrupted process leaves at
//! most one torn line at the end of the file. Readers skip that line; reopening for
//! append cuts it off before writing anything new. A failed append truncates the
//! file back to the last committed record before reporting the error.

use crate::discovery::Discovery;
use crate::training::LossTrace;
use crate::trajectory::Trajectory;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on scenario store: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Scenario key '{0}' is already present in the store")]
    DuplicateKey(String),
    #[error("Malformed record on line {line}: {message}")]
    Corrupt { line: usize, message: String },
    #[error("Scenario store lock was poisoned by a panicking writer")]
    Poisoned,
}

/// Everything kept about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub run: usize,
    pub magnitude: f64,
    /// Noisy observations, including their sample times.
    pub observed: Trajectory,
    pub initial_parameters: Vec<f64>,
    pub trained_parameters: Vec<f64>,
    pub loss_trace: LossTrace,
    #[serde(with = "nonfinite")]
    pub phase_one_loss: f64,
    #[serde(with = "nonfinite")]
    pub final_loss: f64,
    pub discovery: Option<Discovery>,
    /// Display form of the discovered right-hand sides.
    pub equations: Vec<String>,
    pub discovery_failure: Option<String>,
    /// Squared error of the recovered system against the observations.
    pub recovered_error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredGroup {
    pub key: String,
    pub record: ScenarioRecord,
}

#[derive(Serialize)]
struct GroupRef<'a> {
    key: &'a str,
    record: &'a ScenarioRecord,
}

struct Writer {
    file: File,
    keys: HashSet<String>,
    /// File length up to and including the last acknowledged record.
    committed: u64,
}

impl Writer {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)?;
        self.file.flush()?;
        self.file.sync_data()
    }
}

/// Handle to an open store. Appends from several threads are serialized.
pub struct ScenarioStore {
    path: PathBuf,
    writer: Mutex<Writer>,
}

impl ScenarioStore {
    /// Opens `path` for appending, creating it (and its directory) if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let (groups, valid_len) = if path.exists() {
            read_groups(&fs::read(&path)?)?
        } else {
            (Vec::new(), 0)
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), "dropping torn trailing record");
            file.set_len(valid_len)?;
        }

        let keys = groups.into_iter().map(|g| g.key).collect();
        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file,
                keys,
                committed: valid_len,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(writer.keys.contains(key))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(writer.keys.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Appends one group. Keys are unique for the lifetime of the file.
    pub fn append(&self, key: &str, record: &ScenarioRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&GroupRef { key, record })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        if writer.keys.contains(key) {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }
        let committed = writer.committed;
        if writer.file.metadata()?.len() != committed {
            warn!(path = %self.path.display(), "dropping bytes past the last committed record");
            writer.file.set_len(committed)?;
        }
        if let Err(e) = writer.write_line(&line) {
            if let Err(restore) = writer.file.set_len(committed) {
                error!(
                    path = %self.path.display(),
                    error = %restore,
                    "failed to drop partial record"
                );
            }
            return Err(e.into());
        }
        writer.committed += line.len() as u64;
        writer.keys.insert(key.to_string());
        Ok(())
    }

    /// Every group currently in the file, in write order.
    pub fn groups(&self) -> Result<Vec<StoredGroup>, StoreError> {
        let _guard = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        load(&self.path)
    }
}

/// Reads a store file without opening it for writing.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<StoredGroup>, StoreError> {
    let bytes = fs::read(path.as_ref())?;
    let (groups, valid_len) = read_groups(&bytes)?;
    if (valid_len as usize) < bytes.len() {
        warn!(path = %path.as_ref().display(), "ignoring torn trailing record");
    }
    Ok(groups)
}

/// Parses complete lines. Returns the groups and the byte length they cover.
///
/// Only the final line may be damaged; anything malformed before it is an error.
fn read_groups(bytes: &[u8]) -> Result<(Vec<StoredGroup>, u64), StoreError> {
    let mut groups = Vec::new();
    let mut keys = HashSet::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(end) = rest.iter().position(|b| *b == b'\n') else {
            // Unterminated tail: an append that never finished.
            break;
        };
        let line = &rest[..end];
        let next = offset + end + 1;
        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<StoredGroup>(line) {
                Ok(group) => {
                    if !keys.insert(group.key.clone()) {
                        return Err(StoreError::DuplicateKey(group.key));
                    }
                    groups.push(group);
                }
                Err(_) if next == bytes.len() => break,
                Err(e) => {
                    return Err(StoreError::Corrupt {
                        line: line_no,
                        message: e.to_string(),
                    })
                }
            }
        }
        offset = next;
    }
    Ok((groups, offset as u64))
}

/// JSON has no infinity; losses from failed integrations are written as `null`.
pub mod nonfinite {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }

    pub mod vec {
        use serde::ser::SerializeSeq;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(values.len()))?;
            for v in values {
                seq.serialize_element(&Some(*v).filter(|v| v.is_finite()))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
            let raw = Vec::<Option<f64>>::deserialize(deserializer)?;
            Ok(raw.into_iter().map(|v| v.unwrap_or(f64::INFINITY)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::SymbolicModel;

    fn scratch(name: &str) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("ude-store-{}", std::process::id()))
            .join(format!("{name}.jsonl"));
        let _ = fs::remove_file(&path);
        path
    }

    fn record(run: usize) -> ScenarioRecord {
        let observed = Trajectory::new(vec![0.0, 0.1], vec![vec![1.0, 2.0], vec![1.1, 1.9]])
            .expect("trajectory");
        let mut trace = LossTrace::new();
        trace.push(f64::INFINITY);
        trace.push(3.5);
        trace.close_phase_one();
        trace.push(1.25);
        let model = SymbolicModel {
            variables: vec!["u1".into(), "u2".into()],
            terms: vec!["u1*u2".into()],
            coefficients: vec![vec![-0.9], vec![0.8]],
            errors: vec![1e-3, 2e-3],
        };
        ScenarioRecord {
            run,
            magnitude: 1e-3,
            observed,
            initial_parameters: vec![0.5, -0.25],
            trained_parameters: vec![0.1, 0.2],
            loss_trace: trace,
            phase_one_loss: 3.5,
            final_loss: 1.25,
            equations: model.equations(),
            discovery: Some(Discovery {
                intermediate: model.clone(),
                model,
                selected_thresholds: vec![Some(0.1), None],
            }),
            discovery_failure: None,
            recovered_error: Some(0.01),
        }
    }

    #[test]
    fn appended_groups_survive_reopen() {
        let path = scratch("reopen");
        {
            let store = ScenarioStore::open(&path).expect("open");
            for i in 1..=3 {
                store.append(&format!("lv/{i}"), &record(i)).expect("append");
            }
        }
        let store = ScenarioStore::open(&path).expect("reopen");
        assert_eq!(store.len().expect("len"), 3);
        assert!(store.contains("lv/2").expect("contains"));
        store.append("lv/4", &record(4)).expect("append after reopen");

        let groups = store.groups().expect("groups");
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["lv/1", "lv/2", "lv/3", "lv/4"]);
        assert_eq!(groups[1].record, record(2));
        assert!(groups[0].record.loss_trace.values()[0].is_infinite());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let path = scratch("duplicate");
        let store = ScenarioStore::open(&path).expect("open");
        store.append("lv/1", &record(1)).expect("append");
        let err = store.append("lv/1", &record(1)).expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicateKey(ref k) if k == "lv/1"));
        assert_eq!(load(&path).expect("load").len(), 1);
    }

    #[test]
    fn torn_trailing_line_is_skipped_and_truncated() {
        let path = scratch("torn");
        {
            let store = ScenarioStore::open(&path).expect("open");
            store.append("lv/1", &record(1)).expect("append");
            store.append("lv/2", &record(2)).expect("append");
        }
        let full_len = fs::metadata(&path).expect("metadata").len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("raw open");
            file.write_all(b"{\"key\":\"lv/3\",\"rec").expect("partial write");
        }

        let groups = load(&path).expect("load with torn tail");
        assert_eq!(groups.len(), 2);

        let store = ScenarioStore::open(&path).expect("reopen");
        assert_eq!(fs::metadata(&path).expect("metadata").len(), full_len);
        store.append("lv/3", &record(3)).expect("append after repair");
        assert_eq!(store.groups().expect("groups").len(), 3);
    }

    #[test]
    fn partial_write_is_dropped_before_next_append() {
        let path = scratch("partial");
        let store = ScenarioStore::open(&path).expect("open");
        store.append("lv/1", &record(1)).expect("append");
        {
            // What an interrupted write leaves behind through the open handle.
            let mut writer = store.writer.lock().expect("lock");
            writer
                .file
                .write_all(b"{\"key\":\"lv/2\",\"rec")
                .expect("partial write");
        }
        store.append("lv/3", &record(3)).expect("append after partial write");
        let keys: Vec<String> = load(&path).expect("load").into_iter().map(|g| g.key).collect();
        assert_eq!(keys, vec!["lv/1", "lv/3"]);

        store.append("lv/4", &record(4)).expect("append");
        assert_eq!(load(&path).expect("load").len(), 3);
        drop(store);
        let reopened = ScenarioStore::open(&path).expect("reopen");
        assert_eq!(reopened.len().expect("len"), 3);
        assert_eq!(reopened.groups().expect("groups")[1].record, record(3));
    }

    #[test]
    fn damaged_interior_line_is_an_error() {
        let path = scratch("corrupt");
        fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        let good = serde_json::to_string(&GroupRef {
            key: "lv/1",
            record: &record(1),
        })
        .expect("encode");
        fs::write(&path, format!("not json\n{good}\n")).expect("write");
        let err = load(&path).expect_err("corrupt");
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }
}
