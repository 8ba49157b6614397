//! Signal handling for the monitor and sync commands.
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels a [`CancellationToken`]: the
//! scheduler stops admitting new transfers and the monitor loop exits after
//! the current cycle settles. A second signal exits immediately with 130.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Register signal listeners and return the token they cancel.
///
/// Listeners are registered before this returns so a signal arriving right
/// after startup is never lost.
pub(crate) fn install_signal_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let signals = Arc::new(AtomicU32::new(0));

    #[cfg(unix)]
    let (mut sigterm, mut sighup) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::terminate())?,
            signal(SignalKind::hangup())?,
        )
    };

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            let received = tokio::select! {
                r = tokio::signal::ctrl_c() => r.is_ok(),
                s = sigterm.recv() => s.is_some(),
                s = sighup.recv() => s.is_some(),
            };

            #[cfg(not(unix))]
            let received = tokio::signal::ctrl_c().await.is_ok();

            if !received {
                tracing::warn!("Signal listener closed; shutdown signals will be ignored");
                return;
            }

            if signals.fetch_add(1, Ordering::SeqCst) == 0 {
                tracing::info!("Shutdown requested, letting in-flight transfers finish");
                tracing::info!("Send the signal again to exit immediately");
                handler_token.cancel();
            } else {
                tracing::warn!("Forced exit");
                std::process::exit(130);
            }
        }
    });

    Ok(token)
}
