// src/logging.rs

use anyhow::Result;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Handle to the installed filter, so the level can change once config is known.
pub struct Logging {
    filter: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl Logging {
    /// Switches to `level` unless `RUST_LOG` chose the filter.
    pub fn set_level(&self, level: &str) -> Result<()> {
        if self.from_env {
            return Ok(());
        }
        self.filter.reload(EnvFilter::try_new(level)?)?;
        Ok(())
    }
}

fn filter_layer(level: &str) -> (reload::Layer<EnvFilter, Registry>, Logging) {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (
            EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
            false,
        ),
    };
    let (layer, handle) = reload::Layer::new(filter);
    (
        layer,
        Logging {
            filter: handle,
            from_env,
        },
    )
}

/// Installs the global `fmt` subscriber. `RUST_LOG` wins over `level`.
///
/// Returns `None` when a subscriber is already installed.
pub fn init(level: &str) -> Option<Logging> {
    let (filter, logging) = filter_layer(level);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .ok()
        .map(|_| logging)
}
