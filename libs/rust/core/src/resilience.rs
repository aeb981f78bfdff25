//! Retry with exponential backoff and jitter, for calls to remote collaborators
//! (model registry, artifact store).

use std::time::Duration;
use rand::{thread_rng, Rng};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 2, base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(5), jitter: 0.25 } } }

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: usize) -> Self { self.max_retries = max_retries; self }
    /// No retries at all: the operation runs exactly once.
    pub fn none() -> Self { Self { max_retries: 0, ..Self::default() } }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32));
        let mut delay = std::cmp::min(exp, self.max_delay);
        if self.jitter > 0.0 {
            let jitter_ms = (delay.as_millis() as f64 * self.jitter) as u64;
            let offset: i64 = thread_rng().gen_range(-(jitter_ms as i64)..(jitter_ms as i64 + 1));
            let base_ms = delay.as_millis() as i64 + offset;
            delay = Duration::from_millis(base_ms.max(0) as u64);
        }
        delay
    }
}

/// Run `op` until it succeeds or `cfg.max_retries` extra attempts are spent.
/// `op` receives the zero-based attempt number.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let delay = cfg.delay_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
