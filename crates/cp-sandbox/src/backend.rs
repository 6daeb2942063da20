use async_trait::async_trait;

use crate::error::Result;

/// The abstract execution port: start/exec/write/read/kill. The pool
/// manager talks only to this trait; a real implementation wraps
/// whatever isolation technology backs a sandbox (a container, a
/// microVM, a remote session).
///
/// Mirrors the `LspInstance`/`ChildHandle` split in the broker crate's
/// process supervisor: a handle
/// returned by `start` owns the lifecycle of one external process-like
/// resource, and `kill` is a best-effort graceful-then-force shutdown of
/// that handle, not of the trait object itself.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Starts a new backing instance for `template`, returning an opaque
    /// handle the pool stores alongside its [`crate::model::Sandbox`].
    async fn start(&self, template: &str) -> Result<ExecutorHandle>;

    /// Runs `command` inside the instance behind `handle`, returning its
    /// exit code and captured stdout.
    async fn exec(&self, handle: &ExecutorHandle, command: &str) -> Result<ExecOutcome>;

    /// Writes `bytes` to `path` inside the instance.
    async fn write_file(&self, handle: &ExecutorHandle, path: &str, bytes: &[u8]) -> Result<()>;

    /// Reads `path` from inside the instance.
    async fn read_file(&self, handle: &ExecutorHandle, path: &str) -> Result<Vec<u8>>;

    /// Best-effort graceful-then-force termination of the instance.
    async fn kill(&self, handle: ExecutorHandle) -> Result<()>;
}

/// Opaque handle returned by [`ExecutorBackend::start`]. Carries only an
/// id the backend can resolve back to its own internal resource; the
/// pool manager never inspects it.
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    pub backend_instance_id: String,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}
