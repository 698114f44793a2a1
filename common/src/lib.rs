//! Shared plumbing for the sftp-publish tools
//!
//! This crate holds the ambient pieces every binary in the workspace needs: tracing setup driven
//! by the verbosity flags, the tokio runtime bootstrap and the output settings.
//!
//! # Logging
//!
//! Verbosity maps to a default filter: `-v` INFO, `-vv` DEBUG, `-vvv` TRACE, ERROR otherwise.
//! `--quiet` turns error reporting off. When `RUST_LOG` is set it takes precedence over the
//! flags, which is handy for narrowing output to one target, e.g. `RUST_LOG=sftp::collector=debug`.
//! Logs go to stdout.
//!
//! # Runtime
//!
//! The SFTP event loop is single-threaded by construction (one connection, cooperative tasks), so
//! [`run`] drives the given future on a current-thread tokio runtime.

pub mod config;
pub mod version;

pub use config::OutputConfig;

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.filter_directive()));
    // a subscriber may already be installed (e.g. by a test harness), that's fine
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(output.verbose > 1)
        .try_init();
}

/// Runs `func` to completion and reports the outcome.
///
/// Returns the summary produced by `func`, or `None` if anything failed. Errors are logged (unless
/// quiet mode is on); the summary is printed when requested or when running verbosely.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    if let Err(error) = output.validate() {
        eprintln!("{error}");
        return None;
    }
    init_tracing(&output);
    tracing::info!("sftp-publish {}", version::BuildVersion::current());
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to build tokio runtime: {:#}", error);
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_summary_on_success() {
        let res = run(
            OutputConfig {
                quiet: true,
                verbose: 0,
                print_summary: false,
            },
            || async { Ok::<_, anyhow::Error>(7u32) },
        );
        assert_eq!(res, Some(7));
    }

    #[test]
    fn run_returns_none_on_failure() {
        let res = run(
            OutputConfig {
                quiet: true,
                verbose: 0,
                print_summary: false,
            },
            || async { Err::<u32, _>(anyhow::anyhow!("boom")) },
        );
        assert_eq!(res, None);
    }

    #[test]
    fn run_rejects_invalid_output_config() {
        let res = run(
            OutputConfig {
                quiet: true,
                verbose: 2,
                print_summary: false,
            },
            || async { Ok::<_, anyhow::Error>(1u32) },
        );
        assert_eq!(res, None);
    }
}
