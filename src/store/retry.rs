use std::time::Duration;

/// Bounded retry for metadata reads racing a concurrent atomic replace.
///
/// A reader that lands between a writer's rename and its own open can see a
/// transient failure; the store retries up to `max_attempts` times with a fixed
/// `delay` before surfacing the last error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(20),
        }
    }
}

/// Last failure of an operation that did not succeed within the policy.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl ReadRetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds, the policy is exhausted, or it fails with an
    /// error `retryable` rejects. Always makes at least one attempt.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut() -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryExhausted<E>> {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max && retryable(&err) => {
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
            }
        }
    }
}
