//! Logging setup for brlink binaries.
//!
//! A binary calls one of the init_* functions once, before connecting to a
//! display. Library code only emits events, through the macros re-exported
//! in [`prelude`]:
//!
//! ```ignore
//! use crate::tracing::prelude::*;
//! debug!(model = "fx", attempt, "Sending identify");
//! ```

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub use tracing_subscriber::filter::LevelFilter;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Log to journald when started by systemd, to stdout otherwise.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry()
                .with(env_filter(LevelFilter::INFO))
                .with(layer)
                .init(),
            Err(e) => {
                init_stdout(LevelFilter::INFO);
                error!(error = %e, "Failed to initialize journald logging, using stdout");
            }
        }
    } else {
        init_stdout(LevelFilter::INFO);
    }
}

/// Log to stdout at `default` unless `RUST_LOG` says otherwise.
pub fn init_stdout(default: LevelFilter) {
    tracing_subscriber::registry()
        .with(env_filter(default))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

/// Log to stderr without timestamps, for command-line tools whose stdout
/// carries their output.
pub fn init_stderr(default: LevelFilter) {
    tracing_subscriber::registry()
        .with(env_filter(default))
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

// Local time to the nearest second. Display sessions are long-lived and the
// default UTC timestamps are hard to line up with what the user did.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{stamp}")
    }
}
