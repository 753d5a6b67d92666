//! Console log format for the node binary.
//!
//! Lines look like `[timestamp] [component] [level] message`. Events that
//! carry a `component` field are labelled `jingle-<component>`.

use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 18;
const LEVEL_WIDTH: usize = 9;

/// Formats events for the `jingle-node` console
pub struct JingleLogFormatter {
    service: String,
    color_enabled: bool,
}

impl JingleLogFormatter {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            color_enabled: color_supported(),
        }
    }

    #[cfg(test)]
    fn without_color(mut self) -> Self {
        self.color_enabled = false;
        self
    }

    /// Fixed-width label of the emitting component
    fn component_label(&self, component: Option<&str>) -> String {
        let label = match component {
            Some(component) => format!("{}-{}", self.service, component),
            None => self.service.clone(),
        };

        if label.chars().count() > COMPONENT_WIDTH {
            let truncated: String = label.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", label, width = COMPONENT_WIDTH)
        }
    }

    fn level_label(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn write_line(
        &self,
        writer: &mut impl fmt::Write,
        timestamp: &str,
        level: &Level,
        fields: &EventFields,
    ) -> fmt::Result {
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.component_label(fields.component.as_deref()),
            self.level_color(level),
            Self::level_label(level),
            reset
        )?;
        write!(writer, "{}", fields.message)?;
        for (name, value) in &fields.extra {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

impl<S, N> FormatEvent<S, N> for JingleLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        self.write_line(&mut writer, &timestamp, event.metadata().level(), &fields)
    }
}

/// Message, component and any remaining fields of one event
#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl EventFields {
    fn record_value(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            name => self.extra.push((name, value)),
        }
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_value(field, unquoted);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.to_string());
    }
}

fn color_supported() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_label() {
        let formatter = JingleLogFormatter::new("jingle").without_color();
        assert_eq!(formatter.component_label(None).trim_end(), "jingle");
        assert_eq!(formatter.component_label(Some("demo")).trim_end(), "jingle-demo");
        assert_eq!(formatter.component_label(None).len(), COMPONENT_WIDTH);

        let long = formatter.component_label(Some("a-very-long-component"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_plain_line() {
        let formatter = JingleLogFormatter::new("jingle").without_color();
        let fields = EventFields {
            message: "Session abc is active".to_string(),
            component: Some("demo".to_string()),
            extra: vec![("bytes", "4096".to_string())],
        };

        let mut line = String::new();
        formatter
            .write_line(&mut line, "2024-01-01 00:00:00.000", &Level::WARN, &fields)
            .unwrap();

        assert!(line.starts_with("[2024-01-01 00:00:00.000] [jingle-demo"));
        assert!(line.contains("⚠ WARN"));
        assert!(line.ends_with("Session abc is active bytes=4096\n"));
        assert!(!line.contains('\x1b'));
    }
}
