//! Tracing setup for the broker binary.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the process-wide subscriber.
///
/// `verbosity` comes from repeated `-v` flags; `DURAQ_LOG` overrides it with
/// a full filter directive when set.
pub fn init(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "duraq=info",
        1 => "duraq=debug",
        _ => "duraq=trace",
    };

    let filter = EnvFilter::try_from_env("DURAQ_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    // Ignore the error if a subscriber is already installed (tests).
    let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
}
