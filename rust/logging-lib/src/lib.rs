use clap::{Args, ValueEnum};
use is_terminal::IsTerminal;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Args)]
pub struct LoggingOpts {
    #[clap(long, env = "BENCH_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[clap(long, env = "BENCH_LOG_COLOR", default_value = "auto")]
    pub log_color: LogColor,

    /// Additional directives in the RUST_LOG format to configure logging on
    /// a per-target basis. Anything set through RUST_LOG itself takes
    /// priority.
    #[clap(long)]
    pub log_directives: Option<String>,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            log_color: LogColor::Auto,
            log_directives: None,
        }
    }
}

pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    let color = match opts.log_color {
        LogColor::Auto => std::io::stderr().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    // Directives passed on the command line form the default; the RUST_LOG
    // env var overrides them.
    let mut filter = EnvFilter::builder();
    if let Some(directives) = &opts.log_directives {
        filter = filter.with_default_directive(directives.parse()?);
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter.from_env_lossy())
        .with_writer(std::io::stderr);

    match opts.log_format {
        LogFormat::Text => builder
            .with_ansi(color)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?,
        LogFormat::Json => builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?,
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_directives_are_rejected() {
        let opts = LoggingOpts {
            log_directives: Some("not==valid==".to_string()),
            ..LoggingOpts::default()
        };
        assert!(init(&opts).is_err());
    }
}
