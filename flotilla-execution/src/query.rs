//! Client side of `DescribeMappedJobs`

use flotilla_core::TaskSnapshot;
use flotilla_ipc::{run_single_rpc, IpcError, RpcReply, RpcRequest};
use std::time::Duration;
use tracing::debug;

use crate::error::ExecutionError;

/// Fetch the task snapshots of every batch mapped through the pool at
/// `endpoint`
pub async fn query_mapped_jobs(
    endpoint: &str,
    timeout: Duration,
) -> Result<Vec<Vec<TaskSnapshot>>, ExecutionError> {
    debug!(endpoint, "Querying mapped jobs");
    match run_single_rpc(&[endpoint], RpcRequest::describe_mapped_jobs(), timeout).await? {
        RpcReply::MappedJobs { batches, .. } => Ok(batches),
        other => Err(IpcError::InvalidMessage(format!(
            "unexpected reply to DescribeMappedJobs: {:?}",
            other
        ))
        .into()),
    }
}
