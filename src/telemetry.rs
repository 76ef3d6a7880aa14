//! Logging bootstrap for the obsframe binary.
//!
//! The library never installs a subscriber; callers pass their span in
//! through [`ExportContext`](crate::context::ExportContext).

use crate::{Error, Result};

use chrono::{SecondsFormat, Utc};
use std::fmt::{self, Write as _};
use std::str::FromStr;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// `key=value` text lines
    #[default]
    Logfmt,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Logfmt => "logfmt",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "logfmt" => Ok(LogFormat::Logfmt),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!(
                "invalid log format '{other}', expected one of [logfmt, json]"
            ))),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let level = parse_log_level(level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_ascii_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match format {
        LogFormat::Logfmt => builder.event_format(Logfmt).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))
}

/// Renders each event as one logfmt line:
/// `ts=<rfc3339> level=<level> target=<target> msg=<message> key=value ...`
///
/// Fields of the enclosing spans follow the event's own fields, outermost
/// span first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logfmt;

impl<S, N> FormatEvent<S, N> for Logfmt
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut line = String::new();
        push_pair(
            &mut line,
            "ts",
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        push_pair(&mut line, "level", &meta.level().as_str().to_ascii_lowercase());
        push_pair(&mut line, "target", meta.target());
        event.record(&mut LogfmtVisitor { line: &mut line });

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                push_pair(&mut line, "span", span.name());
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        line.push(' ');
                        line.push_str(fields.as_str());
                    }
                }
            }
        }

        writeln!(writer, "{line}")
    }
}

struct LogfmtVisitor<'a> {
    line: &'a mut String,
}

impl Visit for LogfmtVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        push_pair(self.line, field_key(field), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        push_pair(self.line, field_key(field), &format!("{value:?}"));
    }
}

fn field_key(field: &Field) -> &'static str {
    match field.name() {
        "message" => "msg",
        name => name,
    }
}

/// Append ` key=value`, quoting the value when logfmt requires it.
fn push_pair(line: &mut String, key: &str, value: &str) {
    if !line.is_empty() {
        line.push(' ');
    }
    line.push_str(key);
    line.push('=');

    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c == ' ' || c == '=' || c == '"' || c.is_control());
    if !needs_quotes {
        line.push_str(value);
        return;
    }

    line.push('"');
    for c in value.chars() {
        match c {
            '"' => line.push_str("\\\""),
            '\\' => line.push_str("\\\\"),
            '\n' => line.push_str("\\n"),
            '\t' => line.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(line, "\\u{{{:04x}}}", c as u32);
            }
            c => line.push(c),
        }
    }
    line.push('"');
}

pub fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[test]
    fn parse_log_level_rejects_unknown() {
        assert_eq!(parse_log_level(" DEBUG ").unwrap(), Level::DEBUG);
        let err = parse_log_level("verbose").unwrap_err();
        assert!(format!("{err}").contains("invalid log level"));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(emit: impl FnOnce()) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::TRACE)
            .with_writer(move || writer.clone())
            .event_format(Logfmt)
            .finish();
        tracing::subscriber::with_default(subscriber, emit);
        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn logfmt_writes_key_value_pairs() {
        let line = capture(|| {
            let span = tracing::info_span!("export", destination = "a/b.parquet");
            let _entered = span.enter();
            tracing::warn!(rows = 3, reason = "disk full", "Aborted artifact");
        });

        assert!(line.starts_with("ts="), "{line}");
        assert!(line.ends_with('\n'));
        assert!(line.contains(" level=warn "), "{line}");
        assert!(line.contains(" target=obsframe::telemetry::tests "), "{line}");
        assert!(line.contains(r#" msg="Aborted artifact""#), "{line}");
        assert!(line.contains(" rows=3"), "{line}");
        assert!(line.contains(r#" reason="disk full""#), "{line}");
        assert!(line.contains(" span=export"), "{line}");
        assert!(line.contains("destination="), "{line}");
    }

    #[test]
    fn logfmt_quotes_only_when_needed() {
        let mut line = String::new();
        push_pair(&mut line, "a", "plain");
        push_pair(&mut line, "b", "");
        push_pair(&mut line, "c", r#"say "hi""#);
        push_pair(&mut line, "d", "k=v");
        push_pair(&mut line, "e", "two\nlines");
        assert_eq!(
            line,
            r#"a=plain b="" c="say \"hi\"" d="k=v" e="two\nlines""#
        );
    }

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("LOGFMT".parse::<LogFormat>().unwrap(), LogFormat::Logfmt);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
