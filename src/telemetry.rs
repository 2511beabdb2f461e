use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber. `RUST_LOG` overrides the `info` default.
///
/// Launched instances inherit a log file as stderr, so this also feeds
/// `<instance>/logs/bot.log`.
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
