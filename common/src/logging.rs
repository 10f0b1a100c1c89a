use tracing_subscriber::EnvFilter;

fn level_for(output: &crate::config::OutputConfig) -> &'static str {
    if output.quiet {
        return "off";
    }
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence over the verbosity flag.
pub fn init(output: &crate::config::OutputConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_for(output)));
    // a subscriber may already be installed, e.g. by a test harness
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Sets up logging, builds the tokio runtime and runs `func` to completion.
///
/// Returns `None` if `func` failed; the error has been logged by then.
pub fn run<F, Fut, T>(
    output: crate::config::OutputConfig,
    runtime: crate::config::RuntimeConfig,
    func: F,
) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    init(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(error) => {
            tracing::error!("failed to build tokio runtime: {:#}", error);
            return None;
        }
    };
    match rt.block_on(func()) {
        Ok(value) => Some(value),
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", error);
                eprintln!("{error:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputConfig;

    #[test]
    fn verbosity_maps_to_levels() {
        let mut output = OutputConfig::default();
        assert_eq!(level_for(&output), "error");
        output.verbose = 2;
        assert_eq!(level_for(&output), "debug");
        output.verbose = 7;
        assert_eq!(level_for(&output), "trace");
        output.quiet = true;
        assert_eq!(level_for(&output), "off");
    }

    #[test]
    fn run_reports_failure_as_none() {
        let output = OutputConfig {
            quiet: true,
            verbose: 0,
        };
        let res: Option<()> = run(output, Default::default(), || async {
            Err(anyhow::anyhow!("boom"))
        });
        assert!(res.is_none());
        let res = run(output, Default::default(), || async { Ok(42) });
        assert_eq!(res, Some(42));
    }
}
