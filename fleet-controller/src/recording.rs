use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use proto::{RecordingEntry, RecordingStartResponse, RecordingStopResponse};
use tokio::{
    process::{Child, Command},
    sync::oneshot,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::server::now_unix_ms;

const OUTPUT_EXTENSION: &str = "mp4";
const MS_PER_DAY: u64 = 24 * 60 * 60 * 1_000;

#[derive(Clone, Debug)]
pub struct RecordingConfig {
    pub recordings_dir: PathBuf,
    pub capture_bin: String,
    // `{source}` and `{output}` are substituted per session.
    pub capture_args: Vec<String>,
    pub retention_days: u64,
    pub stop_grace: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from(".fleet-controller/recordings"),
            capture_bin: "ffmpeg".to_string(),
            capture_args: [
                "-nostdin",
                "-loglevel",
                "error",
                "-rtsp_transport",
                "tcp",
                "-i",
                "{source}",
                "-c",
                "copy",
                "{output}",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            retention_days: 7,
            stop_grace: Duration::from_secs(10),
        }
    }
}

struct RecordingHandle {
    device_id: String,
    output_file: PathBuf,
    pid: Option<u32>,
    stop_tx: oneshot::Sender<()>,
}

pub struct RecordingSupervisor {
    config: RecordingConfig,
    processes: Arc<Mutex<HashMap<String, RecordingHandle>>>,
    start_sequence: AtomicU64,
}

impl RecordingSupervisor {
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            config,
            processes: Arc::new(Mutex::new(HashMap::new())),
            start_sequence: AtomicU64::new(0),
        }
    }

    // The handle is registered before this returns; the capture itself runs
    // asynchronously and a later nonzero exit is only logged.
    pub fn start(&self, device_id: &str, source: &str) -> io::Result<RecordingStartResponse> {
        fs::create_dir_all(&self.config.recordings_dir)?;

        let sequence = self.start_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = format!("rec-{}-{}-{}", file_safe(device_id), now_unix_ms(), sequence);
        let output_file = self
            .config
            .recordings_dir
            .join(format!("{session_id}.{OUTPUT_EXTENSION}"));
        let output_text = output_file.display().to_string();

        let args: Vec<String> = self
            .config
            .capture_args
            .iter()
            .map(|arg| arg.replace("{source}", source).replace("{output}", &output_text))
            .collect();
        let mut child = Command::new(&self.config.capture_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child.id();

        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut processes = self.processes.lock().expect("process table lock poisoned");
            processes.insert(
                session_id.clone(),
                RecordingHandle {
                    device_id: device_id.to_string(),
                    output_file: output_file.clone(),
                    pid,
                    stop_tx,
                },
            );
        }
        self.spawn_waiter(session_id.clone(), child, stop_rx);

        info!(session_id = %session_id, device_id = %device_id, "capture process started");
        Ok(RecordingStartResponse {
            session_id,
            output_file: output_text,
        })
    }

    // A session with no live process is resolved against the recordings
    // directory: the table may have been lost to a restart while the output
    // file survived.
    pub fn stop(&self, device_id: &str, session_id: &str) -> RecordingStopResponse {
        let removed = {
            let mut processes = self.processes.lock().expect("process table lock poisoned");
            processes.remove(session_id)
        };

        if let Some(handle) = removed {
            if handle.device_id != device_id {
                debug!(
                    session_id = %session_id,
                    owner = %handle.device_id,
                    caller = %device_id,
                    "stop addressed through a different device id"
                );
            }
            let _ = handle.stop_tx.send(());
            info!(session_id = %session_id, "capture stop requested");
            return RecordingStopResponse {
                session_id: session_id.to_string(),
                output_file: Some(handle.output_file.display().to_string()),
            };
        }

        let on_disk = self.find_output_on_disk(session_id);
        if on_disk.is_some() {
            info!(session_id = %session_id, "no live capture process, reconciled from disk");
        }
        RecordingStopResponse {
            session_id: session_id.to_string(),
            output_file: on_disk,
        }
    }

    pub fn active(&self) -> usize {
        self.processes.lock().expect("process table lock poisoned").len()
    }

    pub fn list(&self) -> io::Result<Vec<RecordingEntry>> {
        let dir = match fs::read_dir(&self.config.recordings_dir) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let now = now_unix_ms();
        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified_unix_ms = unix_ms(metadata.modified()?);
            let age_ms = now.saturating_sub(modified_unix_ms);
            entries.push(RecordingEntry {
                file: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: metadata.len(),
                modified_unix_ms,
                age_days: age_ms / MS_PER_DAY,
            });
        }
        entries.sort_by(|lhs, rhs| lhs.file.cmp(&rhs.file));
        Ok(entries)
    }

    // Per-file failures are skipped so one bad entry never stalls the sweep.
    pub fn purge_expired(&self) -> Vec<String> {
        let dir = match fs::read_dir(&self.config.recordings_dir) {
            Ok(dir) => dir,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("recordings directory scan failed: {err}");
                }
                return Vec::new();
            }
        };

        let now = now_unix_ms();
        let max_age_ms = self.config.retention_days * MS_PER_DAY;
        let mut removed = Vec::new();
        for entry in dir {
            let Ok(entry) = entry else { continue };
            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else { continue };
            if now.saturating_sub(unix_ms(modified)) <= max_age_ms {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(file = %path.display(), "retired expired recording");
                    removed.push(entry.file_name().to_string_lossy().into_owned());
                }
                Err(err) => warn!(file = %path.display(), "failed to retire recording: {err}"),
            }
        }
        removed
    }

    pub fn shutdown(&self) {
        let drained: Vec<(String, RecordingHandle)> = {
            let mut processes = self.processes.lock().expect("process table lock poisoned");
            processes.drain().collect()
        };
        for (session_id, handle) in drained {
            info!(session_id = %session_id, "stopping capture process for shutdown");
            if let Some(pid) = handle.pid {
                signal_pid_graceful(pid);
            }
            let _ = handle.stop_tx.send(());
        }
    }

    fn find_output_on_disk(&self, session_id: &str) -> Option<String> {
        let dir = fs::read_dir(&self.config.recordings_dir).ok()?;
        for entry in dir.flatten() {
            let path = entry.path();
            if path.file_stem().and_then(|stem| stem.to_str()) == Some(session_id) {
                return Some(path.display().to_string());
            }
        }
        None
    }

    fn spawn_waiter(&self, session_id: String, mut child: Child, mut stop_rx: oneshot::Receiver<()>) {
        let processes = Arc::clone(&self.processes);
        let stop_grace = self.config.stop_grace;
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    // Ended on its own; drop the now-dangling table entry.
                    log_capture_exit(&session_id, status);
                    let mut processes = processes.lock().expect("process table lock poisoned");
                    processes.remove(&session_id);
                }
                _ = &mut stop_rx => {
                    request_graceful_exit(&mut child);
                    match timeout(stop_grace, child.wait()).await {
                        Ok(status) => log_capture_exit(&session_id, status),
                        Err(_) => {
                            warn!(
                                session_id = %session_id,
                                "capture process ignored graceful stop, killing"
                            );
                            if let Err(err) = child.kill().await {
                                warn!(session_id = %session_id, "kill failed: {err}");
                            }
                        }
                    }
                }
            }
        });
    }
}

fn log_capture_exit(session_id: &str, status: io::Result<std::process::ExitStatus>) {
    match status {
        Ok(status) if status.success() => {
            info!(session_id = %session_id, "capture process finished");
        }
        Ok(status) => {
            warn!(session_id = %session_id, "capture process exited abnormally: {status}");
        }
        Err(err) => {
            warn!(session_id = %session_id, "capture process wait failed: {err}");
        }
    }
}

fn request_graceful_exit(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_pid_graceful(pid);
        return;
    }
    // Already gone, or no signal support on this platform.
    let _ = child.start_kill();
}

fn signal_pid_graceful(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

// Device ids land in file names.
fn file_safe(device_id: &str) -> String {
    device_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect()
}

fn unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn sleeper_supervisor(dir: &Path) -> RecordingSupervisor {
        RecordingSupervisor::new(RecordingConfig {
            recordings_dir: dir.to_path_buf(),
            capture_bin: "sleep".to_string(),
            capture_args: vec!["30".to_string()],
            retention_days: 7,
            stop_grace: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn start_registers_handle_and_stop_releases_it() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let supervisor = sleeper_supervisor(dir.path());

        let started = supervisor.start("r1", "rtsp://cam/stream").expect("start should spawn");
        assert!(started.session_id.starts_with("rec-r1-"));
        assert_eq!(supervisor.active(), 1);

        let stopped = supervisor.stop("r1", &started.session_id);
        assert_eq!(stopped.output_file.as_deref(), Some(started.output_file.as_str()));
        assert_eq!(supervisor.active(), 0);
    }

    #[tokio::test]
    async fn concurrent_starts_for_one_device_produce_independent_sessions() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let supervisor = sleeper_supervisor(dir.path());

        let first = supervisor.start("r1", "rtsp://cam/a").expect("first start");
        let second = supervisor.start("r1", "rtsp://cam/b").expect("second start");
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(supervisor.active(), 2);

        supervisor.shutdown();
        assert_eq!(supervisor.active(), 0);
    }

    #[tokio::test]
    async fn stop_reconciles_orphaned_output_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let supervisor = sleeper_supervisor(dir.path());

        // On disk, not in the table: a crashed supervisor left it behind.
        let orphan = dir.path().join("rec-r1-1700000000000-1.mp4");
        fs::write(&orphan, b"container bytes").expect("orphan should write");

        let stopped = supervisor.stop("r1", "rec-r1-1700000000000-1");
        assert_eq!(stopped.output_file.as_deref(), Some(orphan.display().to_string().as_str()));

        let missing = supervisor.stop("r1", "rec-r1-999-9");
        assert!(missing.output_file.is_none());
    }

    #[tokio::test]
    async fn start_failure_leaves_no_table_entry() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let supervisor = RecordingSupervisor::new(RecordingConfig {
            recordings_dir: dir.path().to_path_buf(),
            capture_bin: "./no-such-capture-binary".to_string(),
            capture_args: vec![],
            ..RecordingConfig::default()
        });

        assert!(supervisor.start("r1", "rtsp://cam/stream").is_err());
        assert_eq!(supervisor.active(), 0);
    }

    #[tokio::test]
    async fn purge_removes_only_files_past_the_retention_window() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let supervisor = RecordingSupervisor::new(RecordingConfig {
            recordings_dir: dir.path().to_path_buf(),
            retention_days: 0,
            ..RecordingConfig::default()
        });

        let stale = dir.path().join("rec-r1-1-1.mp4");
        fs::write(&stale, b"old").expect("stale file should write");
        std::thread::sleep(Duration::from_millis(20));

        let removed = supervisor.purge_expired();
        assert_eq!(removed, vec!["rec-r1-1-1.mp4".to_string()]);
        assert!(!stale.exists());

        let kept = RecordingSupervisor::new(RecordingConfig {
            recordings_dir: dir.path().to_path_buf(),
            retention_days: 7,
            ..RecordingConfig::default()
        });
        let fresh = dir.path().join("rec-r2-2-2.mp4");
        fs::write(&fresh, b"new").expect("fresh file should write");
        assert!(kept.purge_expired().is_empty());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn listing_reports_size_and_age() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let supervisor = sleeper_supervisor(dir.path());

        fs::write(dir.path().join("rec-r1-1-1.mp4"), b"12345").expect("file should write");
        let entries = supervisor.list().expect("list should scan");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file, "rec-r1-1-1.mp4");
        assert_eq!(entries[0].size_bytes, 5);
        assert_eq!(entries[0].age_days, 0);
    }

    #[test]
    fn device_ids_are_made_file_safe() {
        assert_eq!(file_safe("r1"), "r1");
        assert_eq!(file_safe("../etc/passwd"), "---etc-passwd");
    }
}
