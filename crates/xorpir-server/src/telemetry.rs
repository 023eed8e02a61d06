use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default EnvFilter for tracing when RUST_LOG is not set.
pub const DEFAULT_ENV_FILTER: &str = "xorpir_server=info,xorpir_pim=info";

/// Installs a stderr fmt subscriber. Benchmark results stay on stdout.
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_ENV_FILTER.into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    #[test]
    fn default_filter_covers_library_targets() {
        let default_filter = super::DEFAULT_ENV_FILTER;
        let _filter = tracing_subscriber::EnvFilter::new(default_filter);

        assert!(default_filter.contains("xorpir_server=info"));
        assert!(default_filter.contains("xorpir_pim=info"));
    }
}
