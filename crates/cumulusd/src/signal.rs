//! Process termination signals.

use std::io;

use tracing::{error, info};

/// Which signal asked the daemon to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Interrupt,
    Terminate,
}

/// SIGINT and SIGTERM listeners, registered eagerly so a signal that
/// arrives before [`Signals::wait`] is polled is not lost.
pub struct Signals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// Resolve on the first SIGINT (Ctrl-C) or SIGTERM.
    pub async fn wait(mut self) -> Stop {
        let first = {
            #[cfg(unix)]
            let terminate = self.terminate.recv();
            #[cfg(not(unix))]
            let terminate = std::future::pending::<Option<()>>();

            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => Some(Stop::Interrupt),
                    Err(e) => {
                        error!(error = %e, "failed to listen for ctrl-c");
                        None
                    }
                },
                _ = terminate => Some(Stop::Terminate),
            }
        };
        let stop = match first {
            Some(stop) => stop,
            // Ctrl-C cannot be observed; only SIGTERM stops us.
            None => {
                #[cfg(unix)]
                self.terminate.recv().await;
                #[cfg(not(unix))]
                std::future::pending::<()>().await;
                Stop::Terminate
            }
        };
        info!(signal = ?stop, "shutdown signal received");
        stop
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sigterm_stops_the_daemon() {
        let signals = Signals::install().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let stop = tokio::time::timeout(Duration::from_secs(5), signals.wait())
            .await
            .unwrap();
        assert_eq!(stop, Stop::Terminate);
    }
}
