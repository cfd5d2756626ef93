//! Tracing setup shared by the devbench binaries.
//!
//! Configured entirely through environment variables:
//!
//! - `LOG_LEVEL`: default filter when `RUST_LOG` is unset (`info`)
//! - `LOG_OUTPUT`: `console`, `file`, `both` or `none` (`console`)
//! - `LOG_FORMAT`: `human` or `json` (`human`)
//! - `LOG_FILE_PATH`: rolling log file (`/tmp/devbench.log`)
//! - `LOG_TAGS`: comma-separated `field:value` span filters, e.g. `vm_id:42`

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub json: bool,
    pub file_path: PathBuf,
    pub tags: Vec<Tag>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let output = match lookup("LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            Some("none") => LogOutput::None,
            _ => LogOutput::Console,
        };

        Self {
            level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            output,
            json: lookup("LOG_FORMAT").as_deref() == Some("json"),
            file_path: lookup("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/devbench.log")),
            tags: lookup("LOG_TAGS")
                .map(|tags| parse_tags(&tags))
                .unwrap_or_default(),
        }
    }
}

// --- Custom "Tee" Writer ---
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

// --- Tag-Based Filtering Logic ---

/// A `field:value` pair matched against span fields; `*` matches any value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        let mut visitor = FieldVisitor(&mut fields);
        attrs.record(&mut visitor);
        span.extensions_mut().insert(fields);
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

        self.filters.iter().all(|filter| {
            all_fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
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

fn env_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for directive in ["tokio=warn", "sqlx=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initializes the global tracing subscriber from the environment.
///
/// Keep the returned guard alive for the lifetime of the process when file
/// output is enabled, otherwise buffered lines are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(LogSettings::from_env())
}

pub fn init_with(settings: LogSettings) -> Option<WorkerGuard> {
    let tag_filter_layer = TagFilterLayer {
        filters: settings.tags.clone(),
    };
    let subscriber = registry()
        .with(env_filter(&settings.level))
        .with(tag_filter_layer);

    let log_path = settings.file_path.as_path();
    let log_dir = log_path.parent().unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = log_path.file_name().unwrap_or("devbench.log".as_ref());

    let mut guard: Option<WorkerGuard> = None;

    match settings.output {
        LogOutput::Both => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let tee_writer = MakeTee {
                make_a: std::io::stderr,
                make_b: non_blocking,
            };

            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(tee_writer);
            if settings.json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
        }
        LogOutput::Console => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if settings.json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
        }
        LogOutput::File => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking);
            if settings.json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
        }
        LogOutput::None => subscriber.init(),
    }

    guard
}
