//! Diagnostic tracing for hosts embedding the engine.
//!
//! Every run emits spans and events through `tracing`; this module only
//! installs a subscriber. Hosts with their own subscriber skip it.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize a stderr subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset, which still reports
/// circuit breakers opening and failed actions.
///
/// # Example
/// ```bash
/// RUST_LOG=planloop=debug my-host
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A host may already have installed a global subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_keeps_first_subscriber() {
        init();
        init();
        tracing::warn!("still logging");
    }
}
