use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, fmt, registry};

use super::*;

#[rustfmt::skip] // `rustfmt` formats this into unreadable single line
pub type Logger<S> = filter::Filtered<
    fmt::Layer<S>,
    filter::EnvFilter,
    S,
>;

pub fn new_logger<S>(config: &LoggerConfig) -> Logger<S>
where
    S: tracing::Subscriber + for<'span> registry::LookupSpan<'span>,
{
    new_layer(config).with_filter(new_filter(config))
}

pub fn new_layer<S>(config: &LoggerConfig) -> fmt::Layer<S>
where
    S: tracing::Subscriber + for<'span> registry::LookupSpan<'span>,
{
    fmt::Layer::default()
        .with_target(config.with_target)
        .with_ansi(config.color.unwrap_or_default().to_bool())
}

pub fn new_filter(config: &LoggerConfig) -> filter::EnvFilter {
    filter(config.log_level.as_deref().unwrap_or(""))
}
