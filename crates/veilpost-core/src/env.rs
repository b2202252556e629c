//! Environment abstraction for deterministic testing.
//!
//! Services read time and randomness only through [`Environment`]. Production
//! uses [`crate::SystemEnv`]; tests use [`test_utils::MockEnv`] with a seeded
//! RNG and tokio's pausable clock, so timeouts and sweeps can be driven
//! without waiting on wall-clock time.

use std::{future::Future, time::Duration};

use rand::{CryptoRng, RngCore};

/// Abstract environment providing time, randomness, and async sleep.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Seconds since the Unix epoch. Used for event timestamps and for
    /// expiry deadlines that must survive a restart.
    fn wall_clock_secs(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (timers, sweeps) should await this.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// 16 random bytes, hex encoded. Used for request and connection ids.
    fn random_id(&self) -> String {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// Adapts an [`Environment`] into an RNG for the crypto layer.
pub struct EnvRng<'a, E: Environment>(pub &'a E);

impl<E: Environment> RngCore for EnvRng<'_, E> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        self.0.random_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.random_bytes(dest);
        Ok(())
    }
}

impl<E: Environment> CryptoRng for EnvRng<'_, E> {}

/// Deterministic environment and fault-injecting wrappers for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use std::{
        sync::{
            Arc, Mutex, PoisonError,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Default wall clock for [`MockEnv`]: 2023-11-14T22:13:20Z
    pub const DEFAULT_WALL_CLOCK_SECS: u64 = 1_700_000_000;

    /// Seeded environment on tokio's clock.
    ///
    /// Under `#[tokio::test(start_paused = true)]` both `now()` and
    /// `wall_clock_secs()` advance only with `tokio::time::advance` or
    /// auto-advance. `advance_wall_clock` additionally skews the wall clock
    /// for synchronous tests.
    #[derive(Clone)]
    pub struct MockEnv {
        inner: Arc<MockEnvInner>,
    }

    struct MockEnvInner {
        rng: Mutex<ChaCha20Rng>,
        started: tokio::time::Instant,
        base_secs: u64,
        skew_secs: AtomicU64,
    }

    impl MockEnv {
        /// Environment with the given RNG seed and the default wall clock.
        pub fn new(seed: u64) -> Self {
            Self::with_wall_clock(seed, DEFAULT_WALL_CLOCK_SECS)
        }

        /// Environment starting at `wall_clock_secs`.
        pub fn with_wall_clock(seed: u64, wall_clock_secs: u64) -> Self {
            Self {
                inner: Arc::new(MockEnvInner {
                    rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
                    started: tokio::time::Instant::now(),
                    base_secs: wall_clock_secs,
                    skew_secs: AtomicU64::new(0),
                }),
            }
        }

        /// Move the wall clock forward without touching the monotonic clock.
        pub fn advance_wall_clock(&self, by: Duration) {
            self.inner.skew_secs.fetch_add(by.as_secs(), Ordering::SeqCst);
        }
    }

    impl Environment for MockEnv {
        type Instant = tokio::time::Instant;

        fn now(&self) -> Self::Instant {
            tokio::time::Instant::now()
        }

        fn wall_clock_secs(&self) -> u64 {
            let elapsed = self.now().duration_since(self.inner.started).as_secs();
            self.inner.base_secs + self.inner.skew_secs.load(Ordering::SeqCst) + elapsed
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            tokio::time::sleep(duration)
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.inner.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
        }
    }
}
