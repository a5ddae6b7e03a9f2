//! Tracing bootstrap with a runtime-adjustable level filter, backing the
//! `/api/v1/_config/log-level` surface.

use std::sync::Mutex;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

/// Handle over the installed filter.
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    current: Mutex<String>,
}

/// The accepted level names, in increasing severity.
pub const LEVELS: [&str; 4] = ["debug", "info", "warning", "error"];

fn filter_for(level: &str) -> Option<EnvFilter> {
    let directive = match level {
        "debug" => "debug",
        "info" => "info",
        "warning" | "warn" => "warn",
        "error" => "error",
        _ => return None,
    };
    Some(EnvFilter::new(directive))
}

/// Install the global subscriber. Returns `None` if one is already set
/// (tests call this repeatedly; the first installation wins).
pub fn init(level: &str) -> Option<LogHandle> {
    let filter = filter_for(level).unwrap_or_else(|| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();
    installed.then(|| LogHandle {
        reload: handle,
        current: Mutex::new(level.to_string()),
    })
}

impl LogHandle {
    pub fn current(&self) -> String {
        self.current.lock().expect("log level lock poisoned").clone()
    }

    /// Change the level at runtime. Unknown names are rejected.
    pub fn set(&self, level: &str) -> Result<(), String> {
        let filter = filter_for(level).ok_or_else(|| {
            format!("unknown log level {level:?}, expected one of {LEVELS:?}")
        })?;
        self.reload
            .reload(filter)
            .map_err(|e| format!("filter reload failed: {e}"))?;
        *self.current.lock().expect("log level lock poisoned") = level.to_string();
        tracing::info!(level, "log level changed");
        Ok(())
    }
}
