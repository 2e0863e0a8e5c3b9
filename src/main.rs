use anyhow::Result;
use devhaven::app::App;
use devhaven::cli;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn main() -> Result<()> {
    // Process CLI arguments first (before logging init for cleaner output)
    let runtime_options = match cli::process_cli() {
        cli::CliResult::Exit(code) => {
            if code == 0 {
                return Ok(());
            }
            std::process::exit(code);
        }
        cli::CliResult::Continue(options) => options,
    };
    // Routes all log::info!() etc. to the debug log file, mirrored to stderr
    // when RUST_LOG is set. --log-level wins over RUST_LOG, which wins over
    // the config file (applied once it is loaded).
    devhaven::debug::init_log_bridge(runtime_options.log_level);

    log::info!("Starting devhaven {}", devhaven::VERSION);

    let runtime = Arc::new(Runtime::new()?);
    let result = App::new(Arc::clone(&runtime), runtime_options).and_then(App::run);

    // Don't let a stuck control channel hold the process open
    if let Ok(rt) = Arc::try_unwrap(runtime) {
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
    }

    if let Err(ref e) = result {
        eprintln!("devhaven: error: {e:#}");
        let missing_tmux = e.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<devhaven_tmux::TmuxError>(),
                Some(devhaven_tmux::TmuxError::Spawn { .. } | devhaven_tmux::TmuxError::Unsupported(_))
            )
        });
        if missing_tmux {
            eprintln!(
                "devhaven: hint: install tmux or set tmux_path in {}",
                devhaven_config::Config::config_path().display()
            );
        }
    }
    result
}
