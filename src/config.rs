//! Global configuration.
//!
//! The configuration governs how the blosc codec is driven, most importantly
//! whether it may spin up its internal thread pool (see [`ThreadPolicy`]).
//! Access it with [`global_config`]:
//!
//! ```rust
//! use carray::config::{global_config, ThreadPolicy};
//!
//! global_config().write().unwrap().set_thread_policy(ThreadPolicy::Never);
//! ```

use std::sync::{OnceLock, RwLock};

/// When the codec is allowed to parallelise internally.
///
/// Nested thread pools are the hazard here: a caller running the library from
/// its own worker threads must not have every decompression fan out again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadPolicy {
    /// Always use the configured thread count.
    Always,
    /// Always use the serial, context-local codec path.
    Never,
    /// Use threads only when called from the process main thread; otherwise
    /// fall back to the serial, context-local codec path.
    MainThreadOnly,
}

/// Library configuration.
#[derive(Debug, Clone)]
pub struct Config {
    codec_nthreads: usize,
    thread_policy: ThreadPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let codec_nthreads = std::env::var("BLOSC_NTHREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
            });
        Self {
            codec_nthreads,
            thread_policy: ThreadPolicy::MainThreadOnly,
        }
    }
}

impl Config {
    /// The number of threads the codec may use when threading is permitted.
    ///
    /// Defaults to the `BLOSC_NTHREADS` environment variable if set, otherwise
    /// the available parallelism.
    #[must_use]
    pub fn codec_nthreads(&self) -> usize {
        self.codec_nthreads
    }

    /// Set the number of threads the codec may use.
    ///
    /// A value of zero is treated as one.
    pub fn set_codec_nthreads(&mut self, nthreads: usize) -> &mut Self {
        self.codec_nthreads = nthreads.max(1);
        self
    }

    /// The active [`ThreadPolicy`].
    #[must_use]
    pub fn thread_policy(&self) -> ThreadPolicy {
        self.thread_policy
    }

    /// Set the [`ThreadPolicy`].
    pub fn set_thread_policy(&mut self, policy: ThreadPolicy) -> &mut Self {
        self.thread_policy = policy;
        self
    }

    /// Resolve the policy for the calling thread: the thread count to hand the
    /// codec, or [`None`] for the serial context path.
    #[must_use]
    pub(crate) fn resolve_threads(&self) -> Option<usize> {
        match self.thread_policy {
            ThreadPolicy::Always => Some(self.codec_nthreads),
            ThreadPolicy::Never => None,
            ThreadPolicy::MainThreadOnly => {
                (std::thread::current().name() == Some("main")).then_some(self.codec_nthreads)
            }
        }
    }
}

/// Returns a reference to the global configuration.
pub fn global_config() -> &'static RwLock<Config> {
    static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();
    CONFIG.get_or_init(|| RwLock::new(Config::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_threads() {
        let mut config = Config::default();
        assert!(config.codec_nthreads() >= 1);
        config.set_codec_nthreads(0);
        assert_eq!(config.codec_nthreads(), 1);
        config.set_thread_policy(ThreadPolicy::Never);
        assert_eq!(config.resolve_threads(), None);
        config.set_thread_policy(ThreadPolicy::Always);
        config.set_codec_nthreads(4);
        assert_eq!(config.resolve_threads(), Some(4));
    }
}
