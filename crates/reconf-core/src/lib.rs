//! Reconf Core - configuration reconfiguration engine
//!
//! Keeps the configuration files of a component's running instances in
//! line with their declared state:
//! - Tracks named configuration items and their overrides
//! - Drives each item through its lifecycle and reconfiguration phases
//! - Merges templates and overrides into content-addressed revisions
//! - Rolls revisions out to every instance, with retry and backoff
//! - Aggregates item phases into one resource phase
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reconf_core::prelude::*;
//!
//! # async fn example(store: Arc<dyn TemplateStore>, instances: Arc<dyn InstanceProvider>,
//! #                  executor: Arc<dyn ReloadExecutor>) -> Result<(), ReconfError> {
//! let engine = ReconfigurationEngine::builder("mysql")
//!     .with_template_store(store)
//!     .with_instance_provider(instances)
//!     .with_executor(ReloadPolicy::Sql, executor)
//!     .build()?;
//!
//! let item = ConfigurationItem::new("mysql-config", "mysql-8.0")?
//!     .with_params("my.cnf", ConfigParams::new().set("max_connections", "100"));
//! engine.upsert(item).await?;
//!
//! println!("resource is {}", engine.resource_phase());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod phase;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod status;
pub mod types;
mod worker;

pub use config::{ConfigError, EngineConfig, FailurePolicy};
pub use dispatcher::{
    InstanceFailure, ProgressSink, ReloadExecutor, ReloadExecutors, RolloutDispatcher,
    RolloutOutcome, RolloutReport,
};
pub use engine::{EngineBuilder, ReconfigurationEngine};
pub use error::{ProviderError, ReconfError, ReloadError};
pub use phase::{
    InitStep, LifecycleEvent, LifecyclePhase, Phase, ReconfigEvent, ReconfigPhase,
    TransitionError,
};
pub use provider::{InstanceProvider, TemplateStore};
pub use registry::{ItemRegistry, UpsertOutcome};
pub use retry::RetryConfig;
pub use status::{IntegrityError, StatusBoard, TransitionLog, TransitionRecord};
pub use types::{
    ConfigurationItem, ConfigurationItemStatus, ExecResult, Instance, ReconcileDetail,
    ResourceStatus,
};

pub use reconf_artifact::{ConfigParams, ItemName, RenderedConfig, Revision};
pub use reconf_merge::{ConfigTemplate, ReloadPolicy, TemplateFile, TemplateRef};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the engine
    pub use crate::{
        ConfigParams, ConfigTemplate, ConfigurationItem, ConfigurationItemStatus, EngineConfig,
        FailurePolicy, Instance, InstanceProvider, Phase, ReconfError, ReconfigurationEngine,
        ReloadError, ReloadExecutor, ReloadPolicy, RenderedConfig, TemplateFile, TemplateRef,
        TemplateStore,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
