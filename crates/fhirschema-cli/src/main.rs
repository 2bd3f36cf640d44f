//! fhirschema - deploys and migrates the FHIR server schema.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fhirschema_cli::exit::{EXIT_BAD_ARGS, EXIT_OK};
use fhirschema_cli::{exit_code, run, Args};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fhirschema=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(if e.use_stderr() { EXIT_BAD_ARGS } else { EXIT_OK });
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting fhirschema");
    let outcome = args.into_config().and_then(|config| run(&config, &mut std::io::stdout().lock()));
    match outcome {
        Ok(()) => {
            tracing::info!("done");
            ExitCode::from(EXIT_OK)
        }
        Err(e) => {
            let code = exit_code(&e);
            tracing::error!(error = %e, exit_code = code, retryable = e.is_retryable(), "fhirschema failed");
            ExitCode::from(code)
        }
    }
}
