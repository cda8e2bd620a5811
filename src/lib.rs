//! sshdeck
//!
//! SSH client core with an encrypted credential vault, multiplexed shell
//! sessions, remote filesystem channels and parallel host diagnostics.
//!
//! # Architecture
//!
//! - **Vault Module**: master-password vault; every secret sealed with
//!   Argon2id + AES-256-GCM
//! - **Transport Module**: connection traits and the `ssh2` implementation
//! - **Session Module**: registry of live shells with one event stream
//! - **Remote Module**: per-channel SFTP directory cursor and file ops
//! - **Diagnostics Module**: parallel probes aggregated into one report
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sshdeck::session::SessionRegistry;
//! use sshdeck::transport::{Endpoint, SshTransport};
//!
//! # async fn run() -> sshdeck::Result<()> {
//! let transport = Arc::new(SshTransport::default());
//! let (registry, mut events) = SessionRegistry::new(transport);
//!
//! let endpoint = Endpoint::new("10.0.0.5", 22, "root").with_password("secret");
//! let id = registry.create_session(&endpoint).await?;
//! registry.send_input(id, b"uptime\n").await;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod remote;
pub mod session;
pub mod transport;
pub mod vault;

// Re-export main types
pub use config::Config;
pub use diagnostics::{DiagnosticCollector, DiagnosticReport};
pub use error::{Error, Result};
pub use remote::FilesystemManager;
pub use session::{SessionEvent, SessionId, SessionRegistry};
pub use transport::{Endpoint, SshTransport};
pub use vault::{Vault, VaultError};
