//! Thread pool management for production deployment.
//!
//! Work is split by type:
//!
//! - **State Machine**: Single task for deterministic event processing
//! - **Crypto Pool**: ed25519 verification of inbound messages (CPU-bound)
//! - **Apply Pool**: Hand-off of committed proposals to the ledger executor
//! - **Async I/O**: Network, storage, timers (tokio runtime)
//!
//! # Example
//!
//! ```no_run
//! use pbft_production::{ThreadPoolConfig, ThreadPoolManager};
//!
//! // Auto-detect cores and use default ratios
//! let config = ThreadPoolConfig::auto();
//! let manager = ThreadPoolManager::new(config).unwrap();
//!
//! // Or customize
//! let config = ThreadPoolConfig::builder()
//!     .crypto_threads(4)
//!     .apply_threads(1)
//!     .io_threads(2)
//!     .build()
//!     .unwrap();
//!
//! let manager = ThreadPoolManager::new(config).unwrap();
//! ```

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors from thread pool configuration.
#[derive(Debug, Error)]
pub enum ThreadPoolError {
    #[error("Failed to build thread pool: {0}")]
    BuildError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for production thread pools.
///
/// Use `ThreadPoolConfig::auto()` to detect available cores and allocate them
/// using the default ratios.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Threads verifying message signatures.
    pub crypto_threads: usize,

    /// Threads calling into the ledger executor. Proposals are applied one at
    /// a time, so more than one thread only helps when the executor blocks.
    pub apply_threads: usize,

    /// Worker threads for the tokio runtime (network, storage, timers).
    pub io_threads: usize,

    /// Stack size for crypto threads (bytes). Default: 2MB.
    pub crypto_stack_size: usize,

    /// Stack size for apply threads (bytes). Default: 8MB.
    pub apply_stack_size: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

impl ThreadPoolConfig {
    /// Automatically configure based on available CPU cores.
    ///
    /// - State Machine: 1 core (always)
    /// - Apply: 1 thread
    /// - Crypto: 50% of remaining cores (min 1)
    /// - I/O: the rest (min 1)
    pub fn auto() -> Self {
        let available = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);

        Self::for_core_count(available)
    }

    /// Configure for a specific number of available cores.
    pub fn for_core_count(total_cores: usize) -> Self {
        // State machine and apply each take one.
        let remaining = total_cores.saturating_sub(2).max(2);
        let crypto = (remaining / 2).max(1);
        let io = remaining.saturating_sub(crypto).max(1);

        Self {
            crypto_threads: crypto,
            apply_threads: 1,
            io_threads: io,
            crypto_stack_size: 2 * 1024 * 1024,
            apply_stack_size: 8 * 1024 * 1024,
        }
    }

    /// Create a builder for custom configuration.
    pub fn builder() -> ThreadPoolConfigBuilder {
        ThreadPoolConfigBuilder::new()
    }

    /// Create a minimal configuration for testing (1 thread per pool).
    pub fn minimal() -> Self {
        Self {
            crypto_threads: 1,
            apply_threads: 1,
            io_threads: 1,
            crypto_stack_size: 2 * 1024 * 1024,
            apply_stack_size: 8 * 1024 * 1024,
        }
    }

    /// Total number of threads that will be spawned (excluding state machine).
    pub fn total_threads(&self) -> usize {
        self.crypto_threads + self.apply_threads + self.io_threads
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ThreadPoolError> {
        if self.crypto_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "crypto_threads must be at least 1".to_string(),
            ));
        }
        if self.apply_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "apply_threads must be at least 1".to_string(),
            ));
        }
        if self.io_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "io_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ThreadPoolConfig.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfigBuilder {
    config: ThreadPoolConfig,
}

impl ThreadPoolConfigBuilder {
    /// Create a new builder with auto-detected defaults.
    pub fn new() -> Self {
        Self {
            config: ThreadPoolConfig::auto(),
        }
    }

    pub fn crypto_threads(mut self, count: usize) -> Self {
        self.config.crypto_threads = count;
        self
    }

    pub fn apply_threads(mut self, count: usize) -> Self {
        self.config.apply_threads = count;
        self
    }

    pub fn io_threads(mut self, count: usize) -> Self {
        self.config.io_threads = count;
        self
    }

    pub fn crypto_stack_size(mut self, size: usize) -> Self {
        self.config.crypto_stack_size = size;
        self
    }

    pub fn apply_stack_size(mut self, size: usize) -> Self {
        self.config.apply_stack_size = size;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<ThreadPoolConfig, ThreadPoolError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> ThreadPoolConfig {
        self.config
    }
}

impl Default for ThreadPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the rayon pools used by the runner.
///
/// The tokio runtime is built from the same configuration by the caller.
pub struct ThreadPoolManager {
    config: ThreadPoolConfig,

    /// Rayon pool for signature verification.
    crypto_pool: rayon::ThreadPool,

    /// Rayon pool for proposal application.
    apply_pool: rayon::ThreadPool,

    /// Queue depth tracking (for metrics).
    crypto_pending: Arc<AtomicUsize>,
    apply_pending: Arc<AtomicUsize>,
}

impl ThreadPoolManager {
    /// Create a new thread pool manager with the given configuration.
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        config.validate()?;

        let crypto_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.crypto_threads)
            .stack_size(config.crypto_stack_size)
            .thread_name(|i| format!("crypto-{}", i))
            .build()
            .map_err(|e| ThreadPoolError::BuildError(e.to_string()))?;

        let apply_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.apply_threads)
            .stack_size(config.apply_stack_size)
            .thread_name(|i| format!("apply-{}", i))
            .build()
            .map_err(|e| ThreadPoolError::BuildError(e.to_string()))?;

        tracing::info!(
            crypto_threads = config.crypto_threads,
            apply_threads = config.apply_threads,
            io_threads = config.io_threads,
            "Thread pools initialized"
        );

        Ok(Self {
            config,
            crypto_pool,
            apply_pool,
            crypto_pending: Arc::new(AtomicUsize::new(0)),
            apply_pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Create with auto-detected configuration.
    pub fn auto() -> Result<Self, ThreadPoolError> {
        Self::new(ThreadPoolConfig::auto())
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.config
    }

    /// Number of I/O threads (for tokio runtime configuration).
    pub fn io_threads(&self) -> usize {
        self.config.io_threads
    }

    /// Build a tokio runtime with the configured I/O threads.
    pub fn build_tokio_runtime(&self) -> Result<tokio::runtime::Runtime, ThreadPoolError> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.io_threads)
            .thread_name("io")
            .enable_all()
            .build()
            .map_err(|e| ThreadPoolError::BuildError(e.to_string()))
    }

    /// Spawn a verification task on the crypto pool.
    pub fn spawn_crypto<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.crypto_pending.fetch_add(1, Ordering::Relaxed);
        let pending = self.crypto_pending.clone();
        self.crypto_pool.spawn(move || {
            f();
            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Spawn an application task on the apply pool.
    pub fn spawn_apply<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.apply_pending.fetch_add(1, Ordering::Relaxed);
        let pending = self.apply_pending.clone();
        self.apply_pool.spawn(move || {
            f();
            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }

    pub fn crypto_queue_depth(&self) -> usize {
        self.crypto_pending.load(Ordering::Relaxed)
    }

    pub fn apply_queue_depth(&self) -> usize {
        self.apply_pending.load(Ordering::Relaxed)
    }
}
