//! Provide tracing, tailored to this program.
//!
//! At startup, the program should call [`init_journald_or_stdout`] to install
//! a tracing subscriber (i.e., something that emits events to a log),
//! optionally mirroring every event into a plain log file.
//!
//! The rest of the program can include `use tracing::prelude::*` for convenient
//! access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and `error!()`
//! macros.

use std::env;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
/// With `log_file`, events are also appended to that file without colors.
pub fn init_journald_or_stdout(log_file: Option<&Path>) {
    let (file, file_error) = match log_file.map(open_log_file) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(layer)
                .with(file_layer(file))
                .init();
        } else {
            use_stdout(file);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(file);
    }

    if let Some(e) = file_error {
        error!(error = %e, "Failed to open log file");
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

// Mirror into the log file, same layout without colors.
fn file_layer<S>(file: Option<File>) -> Option<impl tracing_subscriber::Layer<S>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .event_format(CustomFormatter { ansi: false })
    })
}

// Log to stdout, filtering according to environment variable RUST_LOG,
// overriding the default level (ERROR) to INFO.
fn use_stdout(file: Option<File>) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer(file))
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_target(true)
                .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
                .event_format(CustomFormatter { ansi: true }),
        )
        .init();
}

/// Event formatter that strips the crate prefix and displays fields on a
/// second line for readability. Without ANSI, colors are left out and the
/// timestamp carries the date.
struct CustomFormatter {
    ansi: bool,
}

/// Visitor that collects fields into a string buffer.
struct FieldCollector {
    fields: Vec<(String, String)>,
    message: Option<String>,
}

impl FieldCollector {
    fn new() -> Self {
        Self {
            fields: Vec::new(),
            message: None,
        }
    }
}

impl tracing::field::Visit for FieldCollector {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields
                .push((field.name().to_string(), clean_value(&format!("{:?}", value))));
        }
    }
}

// Some("foo") -> foo, "foo" -> foo
fn clean_value(formatted: &str) -> String {
    let inner = match formatted.strip_prefix("Some(") {
        Some(inner) => inner.strip_suffix(')').unwrap_or(inner),
        None => formatted,
    };
    inner.trim_matches('"').to_string()
}

// Our own modules lose the crate prefix; dependencies keep their full path.
fn short_target(target: &str) -> &str {
    target.strip_prefix("fpga_miner::").unwrap_or(target)
}

// ANSI color and fixed-width label per level.
fn level_label(level: tracing::Level) -> (&'static str, &'static str) {
    match level {
        tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
        tracing::Level::WARN => ("\x1b[33m", "WARN "),
        tracing::Level::INFO => ("\x1b[32m", "INFO "),
        tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
        tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

impl CustomFormatter {
    // Column where the module name starts, for the field line below it.
    fn indent(&self) -> usize {
        if self.ansi {
            15
        } else {
            26
        }
    }

    fn write_fields(&self, writer: &mut Writer<'_>, fields: &[&(String, String)]) -> std::fmt::Result {
        let line = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        if self.ansi {
            write!(writer, "\n\x1b[90m{:indent$}{line}\x1b[0m", "", indent = self.indent())
        } else {
            write!(writer, "\n{:indent$}{line}", "", indent = self.indent())
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for CustomFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = FieldCollector::new();
        event.record(&mut visitor);

        let (color, label) = level_label(*event.metadata().level());
        if self.ansi {
            LocalTimer.format_time(&mut writer)?;
            write!(writer, " {color}{label}\x1b[0m ")?;
        } else {
            DatedTimer.format_time(&mut writer)?;
            write!(writer, " {label} ")?;
        }

        // Events bridged from `log` carry their module in log.target.
        let target = event.metadata().target();
        let module = match target {
            "log" => visitor
                .fields
                .iter()
                .find(|(k, _)| k == "log.target")
                .map_or(target, |(_, v)| v.as_str()),
            _ => short_target(target),
        };
        write!(writer, "{module}: ")?;

        if let Some(msg) = &visitor.message {
            write!(writer, "{}", msg.trim_matches('"'))?;
        }

        let fields: Vec<_> = visitor
            .fields
            .iter()
            .filter(|(k, _)| !k.starts_with("log."))
            .collect();
        if !fields.is_empty() {
            self.write_fields(&mut writer, &fields)?;
        }

        writeln!(writer)
    }
}

fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc())
}

// Local time to the nearest second; the default timer prints long UTC stamps.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let stamp = now_local()
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}

// Log files outlive a day; their timestamps carry the date.
struct DatedTimer;

impl FormatTime for DatedTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let stamp = now_local()
            .format(time::macros::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_value() {
        assert_eq!(clean_value("Some(\"12.5C\")"), "12.5C");
        assert_eq!(clean_value("\"bus0/dev1\""), "bus0/dev1");
        assert_eq!(clean_value("None"), "None");
        assert_eq!(clean_value("42"), "42");
    }

    #[test]
    fn test_short_target() {
        assert_eq!(short_target("fpga_miner::session"), "session");
        assert_eq!(short_target("reqwest::connect"), "reqwest::connect");
    }
}
