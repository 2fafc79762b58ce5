use amgrid_core::{AllocateRequest, AllocateResponse};
use async_trait::async_trait;

/// The resource manager's allocate RPC.
///
/// One call per heartbeat. An error means the request was not applied and
/// the allocator will resend its in-flight asks on the next heartbeat.
#[async_trait]
pub trait ResourceManagerClient: Send + Sync {
    async fn allocate(&self, request: AllocateRequest) -> anyhow::Result<AllocateResponse>;
}
