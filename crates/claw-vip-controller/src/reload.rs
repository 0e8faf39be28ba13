//! C5 — Reload Coordinator: content-hash gate, atomic write, and the
//! SIGHUP-by-process-name nudge that makes keepalived pick up the new
//! config.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::ReloadError;

/// Outcome of one `ReloadCoordinator::apply` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Content changed; the file was rewritten and the daemon signaled.
    Reloaded,
    /// Content was identical to the last applied render; no write, no
    /// signal. Idle clusters cause zero reload churn.
    Skipped,
}

/// A crude token-bucket limiting how often `apply` is allowed to actually
/// touch disk and signal the daemon, independent of the content-hash gate.
/// Guards against a misbehaving upstream watch flapping the same key.
struct RateLimiter {
    capacity: u32,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(refill_per_sec: f64, capacity: u32) -> Self {
        Self {
            capacity,
            tokens: f64::from(capacity),
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(f64::from(self.capacity));
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// How a `ReloadCoordinator` nudges the daemon to pick up a new config.
/// Exists as a trait so tests can substitute a fixture instead of signaling
/// a real process by name, the same way `topology::LocalInterfaces` swaps
/// out host network enumeration.
trait DaemonSignal: Send + Sync {
    fn signal(&self, daemon_name: &str) -> Result<(), ReloadError>;
}

/// The real `DaemonSignal`, backed by a `/proc` process-name lookup and
/// `SIGHUP`.
struct ProcessSignal;

impl DaemonSignal for ProcessSignal {
    fn signal(&self, daemon_name: &str) -> Result<(), ReloadError> {
        signal_daemon(daemon_name)
    }
}

/// Applies rendered keepalived configs to disk, gated on content change and
/// rate-limited, then signals the daemon to reload.
pub struct ReloadCoordinator {
    config_path: PathBuf,
    daemon_name: String,
    last_hash: Mutex<Option<blake3::Hash>>,
    limiter: Mutex<RateLimiter>,
    signal: Box<dyn DaemonSignal>,
}

impl ReloadCoordinator {
    /// Creates a coordinator that writes to `config_path` and signals any
    /// process named `daemon_name`. Allows roughly ten reloads per second
    /// sustained, bursting up to ten.
    #[must_use]
    pub fn new(config_path: PathBuf, daemon_name: impl Into<String>) -> Self {
        Self::with_signal(config_path, daemon_name, Box::new(ProcessSignal))
    }

    fn with_signal(
        config_path: PathBuf,
        daemon_name: impl Into<String>,
        signal: Box<dyn DaemonSignal>,
    ) -> Self {
        Self {
            config_path,
            daemon_name: daemon_name.into(),
            last_hash: Mutex::new(None),
            limiter: Mutex::new(RateLimiter::new(10.0, 10)),
            signal,
        }
    }

    /// Applies `rendered` if it differs from the last applied content.
    ///
    /// # Errors
    ///
    /// Returns `ReloadError` if the write fails, if no matching daemon
    /// process could be signaled, or if the rate limiter has no token
    /// available. The last case is retryable: `last_hash` is left
    /// untouched, so the same content will be applied on a later retry
    /// rather than silently dropped.
    pub fn apply(&self, rendered: &str) -> Result<Outcome, ReloadError> {
        let hash = blake3::hash(rendered.as_bytes());
        if *self.last_hash.lock() == Some(hash) {
            debug!("rendered config unchanged, skipping reload");
            return Ok(Outcome::Skipped);
        }

        if !self.limiter.lock().try_acquire() {
            warn!("reload rate limit exceeded, caller should retry with backoff");
            return Err(ReloadError::RateLimited);
        }

        write_atomic(&self.config_path, rendered)?;
        self.signal.signal(&self.daemon_name)?;
        *self.last_hash.lock() = Some(hash);
        info!(path = %self.config_path.display(), daemon = %self.daemon_name, "reloaded keepalived config");
        Ok(Outcome::Reloaded)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), ReloadError> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents).map_err(|source| ReloadError::Write {
        path: tmp_path.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| ReloadError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(target_os = "linux")]
fn signal_daemon(name: &str) -> Result<(), ReloadError> {
    let pid = find_pid_by_name(name).ok_or_else(|| ReloadError::DaemonNotRunning(name.to_string()))?;
    send_sighup(pid)
}

#[cfg(not(target_os = "linux"))]
fn signal_daemon(name: &str) -> Result<(), ReloadError> {
    Err(ReloadError::DaemonNotRunning(name.to_string()))
}

#[cfg(target_os = "linux")]
fn find_pid_by_name(name: &str) -> Option<i32> {
    let proc_dir = std::fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let pid: i32 = entry.file_name().to_str()?.parse().ok()?;
        let comm_path = entry.path().join("comm");
        if let Ok(comm) = std::fs::read_to_string(comm_path) {
            if comm.trim() == name {
                return Some(pid);
            }
        }
    }
    None
}

/// Sends `SIGHUP` to `pid`, telling keepalived to reload its configuration
/// without dropping the VRRP instance's current state.
///
/// # Safety
///
/// `libc::kill` is safe to call with any pid and a valid signal number;
/// the only failure mode is the errno this function already surfaces.
#[allow(unsafe_code)]
fn send_sighup(pid: i32) -> Result<(), ReloadError> {
    let result = unsafe { libc::kill(pid, libc::SIGHUP) };
    if result == 0 {
        Ok(())
    } else {
        Err(ReloadError::Signal { pid, source: io::Error::last_os_error() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopSignal;

    impl DaemonSignal for NoopSignal {
        fn signal(&self, _daemon_name: &str) -> Result<(), ReloadError> {
            Ok(())
        }
    }

    #[test]
    fn second_apply_of_unchanged_content_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepalived.conf");
        let coordinator =
            ReloadCoordinator::with_signal(path.clone(), "keepalived", Box::new(NoopSignal));

        assert_eq!(coordinator.apply("vrrp_instance VI_1 {}").unwrap(), Outcome::Reloaded);
        let first_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert_eq!(coordinator.apply("vrrp_instance VI_1 {}").unwrap(), Outcome::Skipped);
        let second_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(first_mtime, second_mtime);
    }

    #[test]
    fn apply_reloads_again_once_content_actually_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepalived.conf");
        let coordinator =
            ReloadCoordinator::with_signal(path.clone(), "keepalived", Box::new(NoopSignal));

        assert_eq!(coordinator.apply("one").unwrap(), Outcome::Reloaded);
        assert_eq!(coordinator.apply("one").unwrap(), Outcome::Skipped);
        assert_eq!(coordinator.apply("two").unwrap(), Outcome::Reloaded);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn rate_limiter_exhausts_then_refills() {
        let mut limiter = RateLimiter::new(1000.0, 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn exhausted_rate_limit_errors_instead_of_dropping_the_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepalived.conf");
        let coordinator =
            ReloadCoordinator::with_signal(path.clone(), "keepalived", Box::new(NoopSignal));
        // Drain the burst capacity so the next apply hits the limiter.
        *coordinator.limiter.lock() = RateLimiter::new(0.0, 0);

        let result = coordinator.apply("vrrp_instance VI_1 {}");
        assert!(matches!(result, Err(ReloadError::RateLimited)));
        assert!(!path.exists());
        assert!(coordinator.last_hash.lock().is_none());
    }

    #[test]
    fn write_atomic_creates_file_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepalived.conf");
        write_atomic(&path, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn write_atomic_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keepalived.conf");
        write_atomic(&path, "first").unwrap();
        write_atomic(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn signal_daemon_reports_not_running_for_bogus_name() {
        let result = signal_daemon("definitely-not-a-real-process-xyz");
        assert!(matches!(result, Err(ReloadError::DaemonNotRunning(_))));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn hash_gate_never_flags_identical_content_as_changed(
                a in "[a-zA-Z0-9 \n]{0,200}",
                b in "[a-zA-Z0-9 \n]{0,200}",
            ) {
                let hash_a1 = blake3::hash(a.as_bytes());
                let hash_a2 = blake3::hash(a.as_bytes());
                prop_assert_eq!(hash_a1, hash_a2);
                if a != b {
                    prop_assert_ne!(blake3::hash(a.as_bytes()), blake3::hash(b.as_bytes()));
                }
            }

            #[test]
            fn rate_limiter_never_exceeds_capacity_in_an_instant_burst(
                capacity in 1u32..=20,
                attempts in 0u32..=40,
            ) {
                let mut limiter = RateLimiter::new(0.0, capacity);
                let mut acquired = 0u32;
                for _ in 0..attempts {
                    if limiter.try_acquire() {
                        acquired += 1;
                    }
                }
                prop_assert!(acquired <= capacity);
            }
        }
    }
}
