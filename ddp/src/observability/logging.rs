use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for a launcher or a worker
///
/// - Stdout in `pretty` or `json` format, per `config.format`
/// - When `config.log_dir` is set, also `rank-<n>.log` (or `launcher.log`)
///   in that directory, without colors
/// - `RUST_LOG` overrides `config.level`
pub fn init_logging(config: &LoggingConfig, rank: Option<usize>) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_name = match rank {
                Some(rank) => format!("rank-{rank}.log"),
                None => "launcher.log".to_string(),
            };
            let appender = tracing_appender::rolling::never(dir, file_name);
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    let initialized = if config.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .try_init()
    } else {
        registry
            .with(fmt::layer().pretty().with_writer(std::io::stdout))
            .try_init()
    };
    initialized.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::debug!(
        level = %config.level,
        format = %config.format,
        rank = ?rank,
        "Logging initialized"
    );

    Ok(())
}

/// Stdout-only logging at `level`, for short-lived CLI commands.
pub fn init_simple_logging(level: &str) -> anyhow::Result<()> {
    let config = LoggingConfig {
        level: level.to_string(),
        ..LoggingConfig::default()
    };
    init_logging(&config, None)
}
