//! Stand-ins for the external collaborators this binary keeps abstract: the
//! sandbox provider behind [`cp_sandbox::ExecutorBackend`] and the
//! identity provider behind [`crate::auth::TokenVerifier`] (the latter
//! lives in `auth.rs`). Neither is a production adapter — both are
//! documented placeholders so this binary has something to boot and
//! drive end to end without a concrete integration wired up.

use async_trait::async_trait;
use cp_sandbox::{ExecOutcome, ExecutorBackend, ExecutorHandle, Result as SandboxResult};
use uuid::Uuid;

/// An [`ExecutorBackend`] that never actually isolates anything: `start`
/// mints a handle, `exec` reports success without running `command`
/// anywhere. Lets the Sandbox Pool's lifecycle/health/eviction state
/// machine run end to end against something, standing in for the real
/// sandbox provider.
pub struct LoopbackExecutorBackend;

#[async_trait]
impl ExecutorBackend for LoopbackExecutorBackend {
    async fn start(&self, _template: &str) -> SandboxResult<ExecutorHandle> {
        Ok(ExecutorHandle { backend_instance_id: Uuid::new_v4().to_string() })
    }

    async fn exec(&self, _handle: &ExecutorHandle, _command: &str) -> SandboxResult<ExecOutcome> {
        Ok(ExecOutcome { exit_code: 0, stdout: String::new(), stderr: String::new(), bytes_in: 0, bytes_out: 0 })
    }

    async fn write_file(&self, _handle: &ExecutorHandle, _path: &str, _bytes: &[u8]) -> SandboxResult<()> {
        Ok(())
    }

    async fn read_file(&self, _handle: &ExecutorHandle, _path: &str) -> SandboxResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn kill(&self, _handle: ExecutorHandle) -> SandboxResult<()> {
        Ok(())
    }
}
