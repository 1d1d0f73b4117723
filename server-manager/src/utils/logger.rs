//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. `RUST_LOG` wins over `level`; `format` is `full` or `compact`.
pub fn init(level: &str, format: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        "compact" => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init()?,
        "full" => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        other => anyhow::bail!("unknown log format `{}` (expected `full` or `compact`)", other),
    }

    Ok(())
}
