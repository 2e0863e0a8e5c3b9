// Library exports for testing and potential library use
//
// The engine lives in the `devhaven-tmux` crate and its settings in
// `devhaven-config`; this crate adds the command-line front end.
//
// # Mutex Usage Policy
//
//   - `tokio::sync::Mutex`: state held across `.await` (the control
//     channel writer, session lifecycle).
//   - `parking_lot::Mutex`: short sync-only critical sections (mirrored
//     topology, output buffers, pending replies). Never held across `.await`.

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[macro_use]
pub mod debug;

pub mod app;
pub mod cli;

pub use devhaven_config as config;
pub use devhaven_tmux as tmux;
