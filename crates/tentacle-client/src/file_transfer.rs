use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tentacle_protocol::capabilities::FILE_TRANSFER_SERVICE;
use tentacle_protocol::{DownloadFileRequest, TentacleRpc, UploadFileCommand, UploadResult};

use crate::error::ClientResult;
use crate::executor::RpcCallExecutor;
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall};

/// File transfer calls. Both are idempotent on the agent, so both are
/// retried whenever the client has retries enabled.
#[derive(Clone)]
pub struct FileTransferExecutor {
    rpc: Arc<dyn TentacleRpc>,
    calls: RpcCallExecutor,
}

impl FileTransferExecutor {
    pub fn new(rpc: Arc<dyn TentacleRpc>, calls: RpcCallExecutor) -> Self {
        Self { rpc, calls }
    }

    pub async fn upload_file(
        &self,
        command: &UploadFileCommand,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<UploadResult> {
        let uploaded = self
            .calls
            .execute(
                RpcCall::new(FILE_TRANSFER_SERVICE, "UploadFile"),
                true,
                || self.rpc.upload_file(command),
                operation,
                cancel,
            )
            .await?;
        info!(
            path = %uploaded.full_path,
            length = uploaded.length,
            hash = %uploaded.hash,
            "uploaded file"
        );
        Ok(uploaded)
    }

    pub async fn download_file(
        &self,
        request: &DownloadFileRequest,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<u8>> {
        let data = self
            .calls
            .execute(
                RpcCall::new(FILE_TRANSFER_SERVICE, "DownloadFile"),
                true,
                || self.rpc.download_file(request),
                operation,
                cancel,
            )
            .await?;
        info!(path = %request.remote_path, length = data.len(), "downloaded file");
        Ok(data)
    }
}
