//! Full state construction from chain reads.

use {
    crate::SubscriberConfig,
    anyhow::Result,
    ethrpc::Block,
    std::future::Future,
};

/// Builds the full state of an entity from chain reads alone.
///
/// Implementations only read (usually through a
/// [`Batcher`](ethrpc::multicall::Batcher)) and may be called concurrently
/// for different blocks.
#[async_trait::async_trait]
pub trait StateGenerating: Send + Sync {
    type State;

    async fn generate_state(&self, block: Block) -> Result<Self::State>;
}

// Sometimes node requests error when we ask for state at what we think is the
// current block but the request got load balanced to a node that hasn't seen
// the block yet. We repeat the request up to N times while sleeping in between.
pub(crate) async fn with_retries<T, F, Fut>(config: &SubscriberConfig, fetch: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for _ in 0..config.max_retries {
        match fetch().await {
            Ok(value) => return Ok(value),
            Err(err) => tracing::warn!(?err, "retrying state generation"),
        }
        tokio::time::sleep(config.delay_between_retries).await;
    }
    fetch().await
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{
            sync::atomic::{AtomicU32, Ordering},
            time::Duration,
        },
    };

    fn config(max_retries: u32) -> SubscriberConfig {
        SubscriberConfig {
            max_retries,
            delay_between_retries: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = with_retries(&config(3), || async {
            match attempts.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(anyhow::anyhow!("block not yet known")),
                n => Ok(n),
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retries(&config(2), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("node down"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
