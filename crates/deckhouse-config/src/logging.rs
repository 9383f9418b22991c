use std::{
    io::{Sink, sink},
    path::PathBuf,
};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{
        MakeWriter,
        writer::{EitherWriter, MakeWriterExt as _},
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Environment variable the controller reads its log filter from.
pub const LOG_ENV: &str = "DECKHOUSE_CONTROLLER_LOG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Initializes `tracing` with the filter from the `env` variable, INFO if unset.
///
/// Setting `{env}_DIRECTORY` to a directory additionally copies every event
/// into a rotated file `{app_name}.log` in it.
pub fn initialize_logging(env: &str, app_name: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_env(env).unwrap_or_else(|_| EnvFilter::new("info"));

    let directory = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from);
    let file_appender = OptionalMakeWriter::from(directory.as_deref().and_then(|directory| {
        RollingFileAppender::builder()
            .filename_suffix(format!("{app_name}.log"))
            .max_log_files(6)
            .build(directory)
            .inspect_err(|error| eprintln!("file logging disabled: {error}"))
            .ok()
    }));

    let writer = std::io::stdout.and(file_appender);
    let fmt = match format {
        LogFormat::Plain => tracing_subscriber::fmt::layer().with_writer(writer).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
    };

    // A second initialization (tests) keeps the first subscriber.
    if Registry::default().with(filter).with(fmt).try_init().is_err() {
        return;
    }

    match directory {
        Some(directory) => tracing::info!(directory = %directory.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, no log directory set"),
    }
}

/// [`EitherWriter`] for [`MakeWriter`]s, picked at runtime.
enum EitherMakeWriter<A, B> {
    A(A),
    B(B),
}

impl<'a, A, B> MakeWriter<'a> for EitherMakeWriter<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = EitherWriter<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer()),
            Self::B(b) => EitherWriter::B(b.make_writer()),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer_for(meta)),
            Self::B(b) => EitherWriter::B(b.make_writer_for(meta)),
        }
    }
}

type OptionalMakeWriter<T> = EitherMakeWriter<T, fn() -> Sink>;

impl<T> From<Option<T>> for OptionalMakeWriter<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(writer) => Self::A(writer),
            None => Self::B(sink),
        }
    }
}
