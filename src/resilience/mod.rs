/*!
 * Failure isolation for backend and worker calls.
 *
 * - `circuit_breaker`: three-state breaker around any fallible call
 * - `retry`: retry policy with jittered exponential backoff
 * - `fallback`: ordered fallback strategies, failure tracking and degraded mode
 *
 * Call sites compose them as retries around a breaker around the call, with
 * the fallback chain taking over once the retries give up.
 */

pub mod circuit_breaker;
pub mod fallback;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use fallback::{FallbackManager, FallbackStatus, FallbackStrategy};
pub use retry::RetryPolicy;
