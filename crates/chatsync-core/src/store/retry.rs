use std::future::Future;

use tracing::warn;

use crate::config::ChatConfig;
use crate::error::ChatResult;

/// Run a store mutation, retrying after a rejected write.
///
/// Only [`ChatError::WriteConflict`](crate::ChatError::WriteConflict) is
/// retried, at most `config.write_retries` times; any other error, or a
/// conflict after the last retry, is returned to the caller.
pub async fn write_with_retry<F, Fut, T>(
    config: &ChatConfig,
    operation_name: &str,
    mut operation: F,
) -> ChatResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChatResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_write_conflict() && attempt < config.write_retries => {
                attempt += 1;
                warn!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    "Write rejected, retrying"
                );
                tokio::time::sleep(config.retry_delay()).await;
            }
            Err(e) => return Err(e),
        }
    }
}
