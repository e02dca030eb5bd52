use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

/// Directive used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install a stderr subscriber filtered by `RUST_LOG` and route `log`
/// records through it.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true),
    );

    tracing::subscriber::set_global_default(subscriber)?;
    LogTracer::init()?;

    Ok(())
}
