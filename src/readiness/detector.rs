use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::batch::directory_is_busy;
use crate::settings::ReadinessSettings;

/// Terminal verdict of a readiness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Size is stable and no other process holds the file
    Ready,
    /// The file disappeared while being watched (renamed or deleted)
    Vanished,
    /// Size never settled within the allowed time
    TimedOut,
    /// Size settled but the file stayed locked
    Locked,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        self == Readiness::Ready
    }
}

/// Sibling-activity probe: `(candidate, window) -> busy`
pub type BatchProbe = Arc<dyn Fn(&Path, Duration) -> bool + Send + Sync>;

/// Per-file state while the size is being watched
#[derive(Debug)]
struct PendingFile {
    path: PathBuf,
    detection_start: Instant,
    last_observed_size: Option<u64>,
    stable_count: u32,
    zero_byte_polls: u32,
    /// Time not charged against the base budget because siblings were busy
    busy_credit: Duration,
}

impl PendingFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            detection_start: Instant::now(),
            last_observed_size: None,
            stable_count: 0,
            zero_byte_polls: 0,
            busy_credit: Duration::ZERO,
        }
    }

    fn observe(&mut self, size: u64) {
        if self.last_observed_size == Some(size) {
            self.stable_count += 1;
        } else {
            self.stable_count = 0;
        }
        self.last_observed_size = Some(size);
    }
}

/// Decides when a freshly detected download is finished and safe to move.
#[derive(Clone)]
pub struct ReadinessDetector {
    config: ReadinessSettings,
    probe: BatchProbe,
}

impl ReadinessDetector {
    pub fn new(config: ReadinessSettings) -> Self {
        Self {
            config,
            probe: Arc::new(directory_is_busy),
        }
    }

    /// Replace the sibling-activity probe
    pub fn with_probe(mut self, probe: BatchProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn is_ready(&self, path: &Path) -> bool {
        self.check(path).is_ready()
    }

    /// Block until `path` reaches a terminal verdict.
    pub fn check(&self, path: &Path) -> Readiness {
        let mut pending = PendingFile::new(path);

        let verdict = self.wait_for_stable_size(&mut pending);
        if verdict != Readiness::Ready {
            return verdict;
        }

        self.wait_for_unlock(&pending.path)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn wait_for_stable_size(&self, pending: &mut PendingFile) -> Readiness {
        let interval = self.poll_interval();
        let window = Duration::from_secs(self.config.batch_window_secs);
        let base_budget = Duration::from_secs(self.config.max_wait_secs);
        let ceiling = base_budget.max(Duration::from_secs(self.config.max_busy_wait_secs));

        loop {
            match fs::metadata(&pending.path) {
                Ok(meta) if meta.is_file() => pending.observe(meta.len()),
                Ok(_) => return Readiness::Vanished,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(path = %pending.path.display(), "File vanished while sizing");
                    return Readiness::Vanished;
                }
                Err(e) => {
                    tracing::debug!(path = %pending.path.display(), error = %e, "Size poll failed");
                    pending.stable_count = 0;
                }
            }

            let busy = (self.probe)(&pending.path, window);
            if busy {
                pending.busy_credit += interval;
            }

            // A zero-byte file is usually a placeholder created before the
            // real write starts. Hold it for a grace period, and keep holding
            // while siblings are still downloading.
            let held = if pending.last_observed_size == Some(0) {
                if busy {
                    pending.zero_byte_polls = 0;
                } else {
                    pending.zero_byte_polls += 1;
                }
                pending.zero_byte_polls < self.config.zero_byte_grace_polls
            } else {
                pending.zero_byte_polls = 0;
                false
            };

            if !held && pending.stable_count >= self.config.stable_polls {
                tracing::debug!(
                    path = %pending.path.display(),
                    size = pending.last_observed_size.unwrap_or(0),
                    "Size stable"
                );
                return Readiness::Ready;
            }

            let elapsed = pending.detection_start.elapsed();
            if elapsed >= ceiling || elapsed.saturating_sub(pending.busy_credit) >= base_budget {
                tracing::warn!(
                    path = %pending.path.display(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Timed out waiting for size stability"
                );
                return Readiness::TimedOut;
            }

            thread::sleep(interval);
        }
    }

    /// Renaming a file onto itself fails while another process holds an
    /// exclusive handle (Windows) and is a no-op otherwise.
    fn wait_for_unlock(&self, path: &Path) -> Readiness {
        let attempts = self.config.lock_retries.max(1);
        let delay = Duration::from_millis(self.config.lock_retry_delay_ms);

        for attempt in 1..=attempts {
            match fs::rename(path, path) {
                Ok(()) => return Readiness::Ready,
                Err(e) if e.kind() == ErrorKind::NotFound => return Readiness::Vanished,
                Err(e) => {
                    tracing::debug!(path = %path.display(), attempt, error = %e, "File still locked");
                }
            }
            if attempt < attempts {
                thread::sleep(delay);
            }
        }

        tracing::warn!(path = %path.display(), "File is locked by another process");
        Readiness::Locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn fast_config() -> ReadinessSettings {
        ReadinessSettings {
            poll_interval_ms: 20,
            stable_polls: 3,
            max_wait_secs: 1,
            max_busy_wait_secs: 5,
            zero_byte_grace_polls: 5,
            lock_retries: 3,
            lock_retry_delay_ms: 10,
            batch_window_secs: 1,
        }
    }

    fn never_busy() -> BatchProbe {
        Arc::new(|_: &Path, _: Duration| false)
    }

    #[test]
    fn test_stable_file_is_ready() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("done.pdf");
        fs::write(&file, b"complete").unwrap();

        let detector = ReadinessDetector::new(fast_config()).with_probe(never_busy());
        assert_eq!(detector.check(&file), Readiness::Ready);
        assert!(detector.is_ready(&file));
    }

    #[test]
    fn test_missing_file_vanished() {
        let temp_dir = TempDir::new().unwrap();
        let detector = ReadinessDetector::new(fast_config());

        assert_eq!(detector.check(&temp_dir.path().join("nope")), Readiness::Vanished);
    }

    #[test]
    fn test_file_deleted_during_sizing_vanished() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("short-lived.bin");
        fs::write(&file, b"x").unwrap();

        let remover = {
            let file = file.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                fs::remove_file(&file).unwrap();
            })
        };

        let mut config = fast_config();
        config.stable_polls = 50;
        let detector = ReadinessDetector::new(config).with_probe(never_busy());
        assert_eq!(detector.check(&file), Readiness::Vanished);
        remover.join().unwrap();
    }

    #[test]
    fn test_always_growing_file_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("growing.iso");
        fs::write(&file, b"").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let file = file.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut f = fs::OpenOptions::new().append(true).open(&file).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    f.write_all(&[0u8; 64]).unwrap();
                    f.flush().unwrap();
                    thread::sleep(Duration::from_millis(2));
                }
            })
        };

        let detector = ReadinessDetector::new(fast_config()).with_probe(never_busy());
        let started = Instant::now();
        assert_eq!(detector.check(&file), Readiness::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(1));

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }

    #[test]
    fn test_zero_byte_file_ready_after_grace() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("empty.txt");
        fs::write(&file, b"").unwrap();

        let detector = ReadinessDetector::new(fast_config()).with_probe(never_busy());
        let started = Instant::now();
        assert_eq!(detector.check(&file), Readiness::Ready);
        // Held for the grace period, not accepted after three polls
        assert!(started.elapsed() >= Duration::from_millis(4 * 20));
    }

    #[test]
    fn test_zero_byte_file_held_while_batch_busy() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("placeholder.zip");
        fs::write(&file, b"").unwrap();

        let mut config = fast_config();
        config.max_busy_wait_secs = 1;
        let detector = ReadinessDetector::new(config).with_probe(Arc::new(|_: &Path, _: Duration| true));
        assert_eq!(detector.check(&file), Readiness::TimedOut);
    }

    /// Simulates a browser: zero-byte placeholder under the final name plus a
    /// growing `.crdownload`, renamed over the placeholder when finished.
    fn simulate_download(dir: &Path, name: &str, duration: Duration) -> thread::JoinHandle<()> {
        let final_path = dir.join(name);
        let partial = dir.join(format!("{}.crdownload", name));
        fs::write(&final_path, b"").unwrap();
        fs::write(&partial, b"").unwrap();

        thread::spawn(move || {
            let started = Instant::now();
            let mut f = fs::OpenOptions::new().append(true).open(&partial).unwrap();
            while started.elapsed() < duration {
                f.write_all(&[1u8; 128]).unwrap();
                f.flush().unwrap();
                thread::sleep(Duration::from_millis(10));
            }
            drop(f);
            fs::rename(&partial, &final_path).unwrap();
        })
    }

    #[test]
    fn test_batch_downloads_not_timed_out_early() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = fast_config();
        config.batch_window_secs = 1;

        // Both downloads outlast the 1s base budget; sibling activity has to
        // extend it.
        let a = simulate_download(temp_dir.path(), "a.zip", Duration::from_millis(1400));
        let b = simulate_download(temp_dir.path(), "b.zip", Duration::from_millis(1800));

        let checks: Vec<_> = ["a.zip", "b.zip"]
            .iter()
            .map(|name| {
                let detector = ReadinessDetector::new(config.clone());
                let path = temp_dir.path().join(name);
                thread::spawn(move || (detector.check(&path), fs::metadata(&path).map(|m| m.len()).unwrap_or(0)))
            })
            .collect();

        for check in checks {
            let (verdict, size) = check.join().unwrap();
            assert_eq!(verdict, Readiness::Ready);
            assert!(size > 0, "placeholder accepted before the real file arrived");
        }
        a.join().unwrap();
        b.join().unwrap();
    }
}
