use std::{
    fs,
    io::{BufRead, BufReader, Write as _},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use proto::CommandRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub device_id: String,
    pub payload: Value,
    pub created_unix_ms: u64,
}

pub trait DurableStore: Send + Sync {
    fn insert_telemetry(
        &self,
        device_id: &str,
        payload: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError>;

    fn insert_detection(
        &self,
        device_id: &str,
        payload: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError>;

    fn insert_command(
        &self,
        device_id: &str,
        command: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError>;

    // Unprocessed commands for a device, strict ascending id order.
    fn unprocessed_commands(&self, device_id: &str, limit: usize)
    -> Result<Vec<CommandRow>, StoreError>;

    // Idempotent; returns whether the command id exists at all.
    fn mark_processed(&self, command_id: i64) -> Result<bool, StoreError>;
}

#[derive(Serialize, Deserialize)]
struct AckLine {
    command_id: i64,
}

const TELEMETRY_FILE: &str = "telemetry.jsonl";
const DETECTIONS_FILE: &str = "detections.jsonl";
const COMMANDS_FILE: &str = "commands.jsonl";
const ACKS_FILE: &str = "acks.jsonl";

// Append-only JSONL tables under a data directory. Command rows and the ack
// log are replayed into memory at open; the telemetry and detection tables
// are write-only from the controller's side.
pub struct JsonlStore {
    root: PathBuf,
    commands: Mutex<Vec<CommandRow>>,
    telemetry_sequence: AtomicI64,
    detection_sequence: AtomicI64,
    command_sequence: AtomicI64,
}

impl JsonlStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let telemetry_sequence = last_event_id(&root.join(TELEMETRY_FILE))?;
        let detection_sequence = last_event_id(&root.join(DETECTIONS_FILE))?;

        let mut commands = read_lines::<CommandRow>(&root.join(COMMANDS_FILE))?;
        let command_sequence = commands.iter().map(|row| row.id).max().unwrap_or(0);
        for ack in read_lines::<AckLine>(&root.join(ACKS_FILE))? {
            if let Some(row) = commands.iter_mut().find(|row| row.id == ack.command_id) {
                row.processed = true;
            }
        }

        Ok(Self {
            root,
            commands: Mutex::new(commands),
            telemetry_sequence: AtomicI64::new(telemetry_sequence),
            detection_sequence: AtomicI64::new(detection_sequence),
            command_sequence: AtomicI64::new(command_sequence),
        })
    }

    fn append_line<T: Serialize>(&self, file: &str, row: &T) -> Result<(), StoreError> {
        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(file))?;
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        handle.write_all(line.as_bytes())?;
        Ok(())
    }

    fn append_event(
        &self,
        file: &str,
        sequence: &AtomicI64,
        device_id: &str,
        payload: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError> {
        let id = sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.append_line(
            file,
            &StoredEvent {
                id,
                device_id: device_id.to_string(),
                payload: payload.clone(),
                created_unix_ms,
            },
        )?;
        Ok(id)
    }
}

impl DurableStore for JsonlStore {
    fn insert_telemetry(
        &self,
        device_id: &str,
        payload: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError> {
        self.append_event(
            TELEMETRY_FILE,
            &self.telemetry_sequence,
            device_id,
            payload,
            created_unix_ms,
        )
    }

    fn insert_detection(
        &self,
        device_id: &str,
        payload: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError> {
        self.append_event(
            DETECTIONS_FILE,
            &self.detection_sequence,
            device_id,
            payload,
            created_unix_ms,
        )
    }

    fn insert_command(
        &self,
        device_id: &str,
        command: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError> {
        let mut commands = self.commands.lock().expect("command table lock poisoned");
        let id = self.command_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let row = CommandRow {
            id,
            device_id: device_id.to_string(),
            command: command.clone(),
            processed: false,
            created_unix_ms,
        };
        self.append_line(COMMANDS_FILE, &row)?;
        commands.push(row);
        Ok(id)
    }

    fn unprocessed_commands(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<CommandRow>, StoreError> {
        let commands = self.commands.lock().expect("command table lock poisoned");
        Ok(commands
            .iter()
            .filter(|row| row.device_id == device_id && !row.processed)
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_processed(&self, command_id: i64) -> Result<bool, StoreError> {
        let mut commands = self.commands.lock().expect("command table lock poisoned");
        let Some(row) = commands.iter_mut().find(|row| row.id == command_id) else {
            return Ok(false);
        };
        if !row.processed {
            self.append_line(ACKS_FILE, &AckLine { command_id })?;
            row.processed = true;
        }
        Ok(true)
    }
}

fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

fn last_event_id(path: &Path) -> Result<i64, StoreError> {
    // Concurrent appends are not id-ordered on disk; recover the high water
    // mark, not the final line.
    Ok(read_lines::<StoredEvent>(path)?
        .iter()
        .map(|event| event.id)
        .max()
        .unwrap_or(0))
}

#[derive(Default)]
struct MemoryTables {
    telemetry: Vec<StoredEvent>,
    detections: Vec<StoredEvent>,
    commands: Vec<CommandRow>,
}

// In-memory store for tests; `set_fail_inserts(true)` rejects every insert
// while reads keep working.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    fail_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::Relaxed);
    }

    pub fn telemetry_rows(&self) -> Vec<StoredEvent> {
        self.tables.lock().expect("table lock poisoned").telemetry.clone()
    }

    pub fn detection_rows(&self) -> Vec<StoredEvent> {
        self.tables.lock().expect("table lock poisoned").detections.clone()
    }

    pub fn command(&self, command_id: i64) -> Option<CommandRow> {
        self.tables
            .lock()
            .expect("table lock poisoned")
            .commands
            .iter()
            .find(|row| row.id == command_id)
            .cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("injected insert failure".to_string()));
        }
        Ok(())
    }
}

impl DurableStore for MemoryStore {
    fn insert_telemetry(
        &self,
        device_id: &str,
        payload: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().expect("table lock poisoned");
        let id = tables.telemetry.len() as i64 + 1;
        tables.telemetry.push(StoredEvent {
            id,
            device_id: device_id.to_string(),
            payload: payload.clone(),
            created_unix_ms,
        });
        Ok(id)
    }

    fn insert_detection(
        &self,
        device_id: &str,
        payload: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().expect("table lock poisoned");
        let id = tables.detections.len() as i64 + 1;
        tables.detections.push(StoredEvent {
            id,
            device_id: device_id.to_string(),
            payload: payload.clone(),
            created_unix_ms,
        });
        Ok(id)
    }

    fn insert_command(
        &self,
        device_id: &str,
        command: &Value,
        created_unix_ms: u64,
    ) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().expect("table lock poisoned");
        let id = tables.commands.len() as i64 + 1;
        tables.commands.push(CommandRow {
            id,
            device_id: device_id.to_string(),
            command: command.clone(),
            processed: false,
            created_unix_ms,
        });
        Ok(id)
    }

    fn unprocessed_commands(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<CommandRow>, StoreError> {
        let tables = self.tables.lock().expect("table lock poisoned");
        Ok(tables
            .commands
            .iter()
            .filter(|row| row.device_id == device_id && !row.processed)
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_processed(&self, command_id: i64) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().expect("table lock poisoned");
        let Some(row) = tables.commands.iter_mut().find(|row| row.id == command_id) else {
            return Ok(false);
        };
        row.processed = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, JsonlStore) {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let store = JsonlStore::open(dir.path()).expect("store should open");
        (dir, store)
    }

    #[test]
    fn command_ids_ascend_and_polls_are_ordered() {
        let (_dir, store) = temp_store();
        let a = store.insert_command("r1", &json!({"op": "a"}), 1).unwrap();
        let b = store.insert_command("r1", &json!({"op": "b"}), 2).unwrap();
        let c = store.insert_command("r1", &json!({"op": "c"}), 3).unwrap();
        assert!(a < b && b < c);

        let rows = store.unprocessed_commands("r1", 50).unwrap();
        assert_eq!(rows.iter().map(|row| row.id).collect::<Vec<_>>(), vec![a, b, c]);
    }

    #[test]
    fn mark_processed_is_idempotent_and_excludes_from_polls() {
        let (_dir, store) = temp_store();
        let id = store.insert_command("r1", &json!({"op": "stop"}), 1).unwrap();

        assert!(store.mark_processed(id).unwrap());
        assert!(store.mark_processed(id).unwrap());
        assert!(!store.mark_processed(999).unwrap());

        assert!(store.unprocessed_commands("r1", 50).unwrap().is_empty());
    }

    #[test]
    fn poll_respects_limit_and_device_filter() {
        let (_dir, store) = temp_store();
        for index in 0..5 {
            store.insert_command("r1", &json!({"n": index}), index).unwrap();
        }
        store.insert_command("r2", &json!({"n": "other"}), 9).unwrap();

        let rows = store.unprocessed_commands("r1", 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.device_id == "r1"));
    }

    #[test]
    fn reopen_recovers_sequences_and_processed_flags() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let first_ids = {
            let store = JsonlStore::open(dir.path()).expect("store should open");
            let telemetry = store.insert_telemetry("r1", &json!({"temp": 21}), 1).unwrap();
            let command = store.insert_command("r1", &json!({"op": "stop"}), 2).unwrap();
            store.mark_processed(command).unwrap();
            (telemetry, command)
        };

        let store = JsonlStore::open(dir.path()).expect("store should reopen");
        let telemetry = store.insert_telemetry("r1", &json!({"temp": 22}), 3).unwrap();
        assert_eq!(telemetry, first_ids.0 + 1);

        let command = store.insert_command("r1", &json!({"op": "go"}), 4).unwrap();
        assert_eq!(command, first_ids.1 + 1);

        let rows = store.unprocessed_commands("r1", 50).unwrap();
        assert_eq!(rows.iter().map(|row| row.id).collect::<Vec<_>>(), vec![command]);
    }

    #[test]
    fn memory_store_failure_toggle_only_affects_inserts() {
        let store = MemoryStore::new();
        let id = store.insert_command("r1", &json!({"op": "a"}), 1).unwrap();

        store.set_fail_inserts(true);
        assert!(matches!(
            store.insert_telemetry("r1", &json!({}), 2),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.unprocessed_commands("r1", 50).unwrap().len(), 1);

        store.set_fail_inserts(false);
        assert!(store.mark_processed(id).unwrap());
    }
}
