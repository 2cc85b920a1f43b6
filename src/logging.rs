//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; binaries and test harnesses that
//! want to see them call [`init_logging`] once.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, Result};

/// Install a global subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the level follows `verbosity`
/// (0 = info, 1 = debug, 2+ = trace). `json_output` switches to one JSON
/// object per event.
pub fn init_logging(verbosity: u8, json_output: bool) -> Result<()> {
    let default_directive = match verbosity {
        0 => "dolomite=info,dolomite_convert=info,warn",
        1 => "dolomite=debug,dolomite_convert=debug,info",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let result = if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    result.map_err(|e| Error::config(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_fails_cleanly() {
        // whichever call comes first wins; the other must report, not panic
        let first = init_logging(0, false);
        let second = init_logging(1, true);
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());
    }
}
