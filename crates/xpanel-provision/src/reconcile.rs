//! Propagation of data-store changes to the live proxy engine.
//!
//! Reconciliation regenerates the engine configuration from the panel database
//! and restarts the service. It is expensive, so callers invoke it once per batch
//! and never per item.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command} failed: {message}")]
    Failed { command: String, message: String },
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self) -> Result<(), ReconcileError>;
}

/// Runs the panel's regeneration command, then an optional restart command.
#[derive(Debug, Clone)]
pub struct CommandReconciler {
    command: String,
    args: Vec<String>,
    restart: Option<(String, Vec<String>)>,
    timeout: Duration,
}

impl CommandReconciler {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            restart: None,
            timeout,
        }
    }

    pub fn with_restart(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.restart = Some((command.into(), args));
        self
    }

    pub fn from_config(cfg: &ReconcileConfig) -> Self {
        let reconciler = Self::new(
            cfg.command.clone(),
            cfg.args.clone(),
            cfg.timeout(),
        );
        match &cfg.restart_command {
            Some(restart) if !restart.trim().is_empty() => {
                reconciler.with_restart(restart.clone(), cfg.restart_args.clone())
            }
            _ => reconciler,
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<(), ReconcileError> {
        let rendered = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(command = %rendered, "Running reconciliation command");

        let output = Command::new(program).args(args).kill_on_drop(true).output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| ReconcileError::Timeout {
                command: rendered.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| ReconcileError::Failed {
                command: rendered.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReconcileError::Failed {
                command: rendered,
                message: format!("{} {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for CommandReconciler {
    async fn reconcile(&self) -> Result<(), ReconcileError> {
        self.run(&self.command, &self.args).await?;
        if let Some((program, args)) = &self.restart {
            self.run(program, args).await?;
        }
        info!(command = %self.command, "Reconciliation completed");
        Ok(())
    }
}

/// Does nothing. Used for dry runs and when reconciliation is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReconciler;

#[async_trait]
impl Reconciler for NoopReconciler {
    async fn reconcile(&self) -> Result<(), ReconcileError> {
        debug!("Reconciliation skipped (no-op)");
        Ok(())
    }
}

/// Lets one reconciliation run at a time across all jobs and counts the calls.
pub struct SerializedReconciler {
    inner: Arc<dyn Reconciler>,
    guard: Mutex<()>,
    calls: AtomicU64,
}

impl SerializedReconciler {
    pub fn new(inner: Arc<dyn Reconciler>) -> Self {
        Self {
            inner,
            guard: Mutex::new(()),
            calls: AtomicU64::new(0),
        }
    }

    /// Number of reconciliations started so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reconciler for SerializedReconciler {
    async fn reconcile(&self) -> Result<(), ReconcileError> {
        let _running = self.guard.lock().await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.reconcile().await;
        if let Err(e) = &result {
            warn!(error = %e, "Reconciliation failed");
        }
        result
    }
}

/// Builds the reconciler described by the configuration.
pub fn from_config(cfg: &ReconcileConfig) -> Arc<SerializedReconciler> {
    let inner: Arc<dyn Reconciler> = if cfg.enabled {
        Arc::new(CommandReconciler::from_config(cfg))
    } else {
        Arc::new(NoopReconciler)
    };
    Arc::new(SerializedReconciler::new(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_counts_calls() {
        let reconciler = SerializedReconciler::new(Arc::new(NoopReconciler));
        reconciler.reconcile().await.unwrap();
        reconciler.reconcile().await.unwrap();
        assert_eq!(reconciler.calls(), 2);
    }

    #[tokio::test]
    async fn test_disabled_config_uses_noop() {
        let cfg = ReconcileConfig {
            enabled: false,
            ..ReconcileConfig::default()
        };
        let reconciler = from_config(&cfg);
        assert!(reconciler.reconcile().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_exit_status() {
        let ok = CommandReconciler::new("true", vec![], Duration::from_secs(5));
        assert!(ok.reconcile().await.is_ok());

        let failing = CommandReconciler::new("false", vec![], Duration::from_secs(5));
        assert!(matches!(
            failing.reconcile().await,
            Err(ReconcileError::Failed { .. })
        ));

        let restart_fails = CommandReconciler::new("true", vec![], Duration::from_secs(5))
            .with_restart("false", vec![]);
        assert!(restart_fails.reconcile().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let slow = CommandReconciler::new("sleep", vec!["5".into()], Duration::from_millis(100));
        assert!(matches!(
            slow.reconcile().await,
            Err(ReconcileError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_failure() {
        let missing = CommandReconciler::new(
            "/nonexistent/x-ui-binary",
            vec!["migrate".into()],
            Duration::from_secs(1),
        );
        assert!(matches!(
            missing.reconcile().await,
            Err(ReconcileError::Failed { .. })
        ));
    }
}
