//! C7 — Supervisor: owns the keepalived child process and the shutdown
//! signal, mirroring `clawnode::node::Node::run`'s select-loop shape.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Shutdown signal receiver.
pub type ShutdownRx = broadcast::Receiver<()>;
/// Shutdown signal sender.
pub type ShutdownTx = broadcast::Sender<()>;

/// Owns the keepalived child process: spawns it, pipes its stdout/stderr
/// into `tracing`, and terminates it on shutdown.
pub struct Supervisor {
    binary: PathBuf,
    config_path: PathBuf,
    shutdown_tx: ShutdownTx,
}

impl Supervisor {
    /// Creates a supervisor for the keepalived binary at `binary`, invoked
    /// with `--dont-fork --log-console --use-file <config_path>`.
    #[must_use]
    pub fn new(binary: PathBuf, config_path: PathBuf) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { binary, config_path, shutdown_tx }
    }

    /// A shutdown signal receiver, for coordinating with the reconciler
    /// worker task.
    #[must_use]
    pub fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_tx.subscribe()
    }

    /// Spawns keepalived and runs it to completion, forwarding SIGTERM and
    /// SIGINT from the supervisor process and broadcasting shutdown to
    /// every other subsystem the moment either the child exits or a signal
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the child process cannot be spawned.
    pub async fn run(self) -> std::io::Result<()> {
        let mut child = self.spawn_child()?;
        info!(binary = %self.binary.display(), config = %self.config_path.display(), "keepalived started");

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT, initiating shutdown");
                let _ = shutdown_tx.send(());
            }
        });

        #[cfg(unix)]
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let shutdown_tx_term = self.shutdown_tx.clone();
        #[cfg(unix)]
        tokio::spawn(async move {
            sigterm.recv().await;
            info!("received SIGTERM, initiating shutdown");
            let _ = shutdown_tx_term.send(());
        });

        let mut shutdown_rx = self.shutdown_rx();

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => {
                        warn!("keepalived exited cleanly but unexpectedly");
                    }
                    Ok(status) => {
                        error!(?status, "keepalived exited with failure");
                    }
                    Err(err) => {
                        error!(error = %err, "failed to wait on keepalived child");
                    }
                }
                let _ = self.shutdown_tx.send(());
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received, stopping keepalived");
                terminate_child(&mut child).await;
            }
        }

        Ok(())
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new(&self.binary)
            .arg("--dont-fork")
            .arg("--log-console")
            .arg("--use-file")
            .arg(&self.config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map(|mut child| {
                pipe_to_tracing(&mut child);
                child
            })
    }
}

fn pipe_to_tracing(child: &mut Child) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "keepalived", "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "keepalived", "{line}");
            }
        });
    }
}

async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
        Ok(_) => info!("keepalived stopped"),
        Err(_) => {
            warn!("keepalived did not exit within grace period, killing");
            let _ = child.kill().await;
        }
    }
}
