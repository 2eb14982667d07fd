//! Signal handling for graceful shutdown.

/// Install a handler for SIGINT/SIGTERM that invokes `on_signal` once. A
/// second signal forces immediate exit.
pub fn install(on_signal: impl Fn() + Send + 'static) {
    let mut fired = false;
    ctrlc::set_handler(move || {
        if fired {
            tracing::warn!("second signal, forcing exit");
            std::process::exit(1);
        }
        fired = true;
        tracing::info!("shutdown signal received");
        on_signal();
    })
    .expect("failed to install signal handler");
}
