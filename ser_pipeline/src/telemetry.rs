use std::fmt;

use indicatif::{ProgressState, ProgressStyle};
use tracing::Subscriber;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    fmt::{format::Writer, time::FormatTime},
    layer::SubscriberExt,
    EnvFilter, Layer,
};

pub const DEFAULT_DIRECTIVES: &str = "WARN,ser_ml=DEBUG,ser_pipeline=DEBUG";

/// Build the global subscriber, `RUST_LOG` takes precedence over `default_directives`.
///
/// Every open span (preprocessing, epochs, inference) gets its own spinner line.
pub fn create_subscriber(default_directives: &str) -> eyre::Result<impl Subscriber> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    let indicatif_layer = IndicatifLayer::new()
        .with_progress_style(
            ProgressStyle::with_template("{span_child_prefix}{spinner} {span_name}{{{span_fields}}} {wide_msg} {elapsed_subsec}")?
                .with_key("elapsed_subsec", elapsed_subsec),
        )
        .with_span_child_prefix_symbol("↳ ")
        .with_span_child_prefix_indent(" ");

    let format = tracing_subscriber::fmt::format()
        .with_source_location(false)
        .with_file(false)
        .with_timer(Uptime::default());

    Ok(tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .event_format(format)
                .with_filter(env_filter),
        )
        .with(indicatif_layer))
}

struct Uptime(std::time::Instant);

impl Default for Uptime {
    fn default() -> Self {
        Uptime(std::time::Instant::now())
    }
}

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let e = self.0.elapsed();
        let minutes = e.as_secs() / 60;
        let seconds = e.as_secs() % 60;
        write!(w, "{minutes:02}:{seconds:02}.{}", (e.as_millis() % 1000) / 100)
    }
}

fn elapsed_subsec(state: &ProgressState, writer: &mut dyn std::fmt::Write) {
    let seconds = state.elapsed().as_secs();
    let sub_seconds = (state.elapsed().as_millis() % 1000) / 100;
    let _ = writer.write_str(&format!("{}.{}s", seconds, sub_seconds));
}
