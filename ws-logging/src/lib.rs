//! Logging setup shared by the engine binaries.
//!
//! Everything is driven by environment variables so the same binary can log
//! human-readable output on a terminal and JSON into a rolling file in
//! production:
//!
//! - `WS_LOG_LEVEL` (or `RUST_LOG`): filter directives, default `info`
//! - `WS_LOG_OUTPUT`: `console`, `file`, `both` or `none`
//! - `WS_LOG_FORMAT`: `human` or `json`
//! - `WS_LOG_TAGS`: comma separated `key:value` span field filters, for
//!   example `workspace_id:3f2a` to follow a single workspace
//! - `WS_LOG_FILE`: log file path (rotated daily)

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{writer::BoxMakeWriter, MakeWriter},
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// A `key:value` pair that must be present on an enclosing span.
/// A value of `*` matches any value for the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub tags: Vec<Tag>,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            tags: Vec::new(),
            file_path: PathBuf::from("/tmp/ws-engine.log"),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let level = lookup("WS_LOG_LEVEL")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or(defaults.level);

        let output = match lookup("WS_LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            Some("none") => LogOutput::Disabled,
            _ => LogOutput::Console,
        };

        let format = match lookup("WS_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };

        let tags = lookup("WS_LOG_TAGS")
            .map(|raw| parse_tags(&raw))
            .unwrap_or_default();

        let file_path = lookup("WS_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.file_path);

        Self {
            level,
            output,
            format,
            tags,
            file_path,
        }
    }
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            (!key.is_empty() && !value.is_empty()).then(|| Tag {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

// Writes every record to two writers; used for `WS_LOG_OUTPUT=both`.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if self.filters.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut fields = HashMap::new();
            attrs.record(&mut FieldVisitor(&mut fields));
            span.extensions_mut().insert(fields);
        }
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        // With tags configured, events outside any span are dropped.
        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        tags_match(&self.filters, &all_fields)
    }
}

fn tags_match(filters: &[Tag], fields: &HashMap<String, String>) -> bool {
    filters.iter().all(|filter| {
        fields
            .get(&filter.key)
            .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
    })
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("/tmp"));
    let file_name = path
        .file_name()
        .unwrap_or_else(|| "ws-engine.log".as_ref());
    let appender = tracing_appender::rolling::daily(dir, file_name);
    tracing_appender::non_blocking(appender)
}

/// Initializes the global tracing subscriber from `WS_LOG_*` variables.
///
/// The returned guard must be kept alive for file output to be flushed.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

/// Initializes the global subscriber from explicit settings. If a global
/// subscriber is already installed this leaves it in place.
pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_new(&settings.level)
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("tokio=warn".parse().expect("static directive"))
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("sqlx=warn".parse().expect("static directive"));

    let mut guard = None;
    let writer = match settings.output {
        LogOutput::Console => Some(BoxMakeWriter::new(std::io::stdout)),
        LogOutput::File => {
            let (non_blocking, file_guard) = file_writer(&settings.file_path);
            guard = Some(file_guard);
            Some(BoxMakeWriter::new(non_blocking))
        }
        LogOutput::Both => {
            let (non_blocking, file_guard) = file_writer(&settings.file_path);
            guard = Some(file_guard);
            Some(BoxMakeWriter::new(MakeTee {
                make_a: std::io::stdout,
                make_b: non_blocking,
            }))
        }
        LogOutput::Disabled => None,
    };

    let (json_layer, human_layer) = match (writer, settings.format) {
        (Some(writer), LogFormat::Json) => (
            Some(tracing_subscriber::fmt::layer().json().with_writer(writer)),
            None,
        ),
        (Some(writer), LogFormat::Human) => (
            None,
            Some(tracing_subscriber::fmt::layer().with_target(true).with_writer(writer)),
        ),
        (None, _) => (None, None),
    };

    let installed = registry()
        .with(env_filter)
        .with(TagFilterLayer {
            filters: settings.tags.clone(),
        })
        .with(json_layer)
        .with(human_layer)
        .try_init();

    if installed.is_err() {
        tracing::debug!("global subscriber already installed, keeping it");
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let settings = LogSettings::from_lookup(|_| None);
        assert_eq!(settings, LogSettings::default());
    }

    #[test]
    fn test_settings_from_variables() {
        let settings = LogSettings::from_lookup(lookup_from(&[
            ("WS_LOG_LEVEL", "debug,sqlx=warn"),
            ("WS_LOG_OUTPUT", "both"),
            ("WS_LOG_FORMAT", "json"),
            ("WS_LOG_TAGS", "workspace_id:abc, operation:*,broken"),
            ("WS_LOG_FILE", "/var/log/ws/engine.log"),
        ]));

        assert_eq!(settings.level, "debug,sqlx=warn");
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(
            settings.tags,
            vec![
                Tag {
                    key: "workspace_id".into(),
                    value: "abc".into()
                },
                Tag {
                    key: "operation".into(),
                    value: "*".into()
                },
            ]
        );
        assert_eq!(settings.file_path, PathBuf::from("/var/log/ws/engine.log"));
    }

    #[test]
    fn test_rust_log_is_a_fallback_level() {
        let settings = LogSettings::from_lookup(lookup_from(&[("RUST_LOG", "trace")]));
        assert_eq!(settings.level, "trace");
    }

    #[test]
    fn test_tag_matching() {
        let filters = parse_tags("workspace_id:abc,operation:*");
        let mut fields = HashMap::new();
        fields.insert("workspace_id".to_string(), "abc-123".to_string());
        assert!(!tags_match(&filters, &fields));

        fields.insert("operation".to_string(), "stop".to_string());
        assert!(tags_match(&filters, &fields));

        fields.insert("workspace_id".to_string(), "zzz".to_string());
        assert!(!tags_match(&filters, &fields));
    }
}
