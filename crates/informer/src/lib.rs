//! Tanjun informer: a local, eventually consistent mirror of remote objects
//! with change notifications.
//!
//! ```ignore
//! let informer = Informer::new(source, InformerConfig::namespaced("test"))?;
//! informer.add_handler(HandlerFuncs::new().on_add(|t: &Tanjunchen| { info!(name = %t.name_any()); Ok(()) }));
//! let run = informer.start(stop.clone())?;
//! informer.wait_for_sync(&stop).await;
//! let all = informer.lister().list(Some("test"));
//! ```

#![forbid(unsafe_code)]

pub mod config;
mod handler;
mod informer;
mod lister;

pub use config::{ConfigError, InformerConfig};
pub use handler::{Handler, HandlerError, HandlerFuncs, HandlerId};
pub use informer::{Informer, RunHandle};
pub use lister::Lister;
pub use tanjun_kubehub::{ErrorHook, Health};

#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    #[error("informer already started")]
    AlreadyStarted,
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("informer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
