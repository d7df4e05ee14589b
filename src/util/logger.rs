//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate. It is enabled by the Cargo
//! feature "builtin_env_logger" which is enabled by default. When enabled, it can be initialized
//! by calling [`try_init`] once during process startup, and will show logs of levels INFO or
//! lower (the lower, the more important).
//!
//! This provides convenient out-of-the-box experience for callers so that they can see logs when
//! using this crate without configuration, and can easily configure log levels from environment
//! variables. Some embedders may wish to choose a different implementation, or implement their
//! own logging to integrate with an existing framework. In such cases, disable the Cargo feature
//! "builtin_env_logger" and register an implementation with the `log` crate directly.

/// Attempt to init an env_logger for this crate.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("hier_bitmap initialized the logger.");
                }
                Err(e) => {
                    // Currently `log::SetLoggerError` can only be raised for one reason: the logger has already been initialized.
                    debug!("hier_bitmap failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("hier_bitmap didn't initialize the built-in env_logger. The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
