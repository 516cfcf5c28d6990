//! Offline servicing of Windows install images.
//!
//! A run mounts one index of a WIM/ESD image, applies drivers, updates,
//! language resources, app removals, registry policy and script hooks to the
//! mounted tree, then commits (or discards) and optionally exports it.
//!
//! - **Mount lifecycle** - one mount per working directory, lock plus
//!   on-disk session record, stale-mount detection and repair
//! - **Version classification** - raw build strings to release identities
//! - **Update resolution** - applicability, supersedence, ordering and the
//!   wrapped/bare container fallback
//! - **Pipeline** - fixed stage order, per-stage failure policy, operator
//!   pauses and cooperative cancellation
//! - **Reports** - per-stage outcomes persisted as JSON run reports
//!
//! # Architecture
//!
//! ```text
//! image-servicer (bin)
//!     │
//!     ├── config ──► StageConfig + ServicingPlan + RunContext
//!     │
//!     └── pipeline::Orchestrator
//!             │
//!             ├── version::VersionClassifier
//!             ├── mount::MountManager ──────────┐
//!             ├── updates (resolve + apply) ────┤
//!             ├── stages (drivers, language,    ├──► engine::ImageEngine
//!             │   removal, registry, hooks) ────┘      (dism / reg / expand)
//!             └── report::RunReport ──► report::store (runs/<id>/)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use image_servicer::config::load_run_config;
//! use image_servicer::{DismEngine, Orchestrator, Unattended};
//!
//! # fn main() -> anyhow::Result<()> {
//! let loaded = load_run_config(Path::new("servicing.toml"))?;
//! let ctx = loaded.run_context(Arc::new(DismEngine::from_path()));
//! let orchestrator = Orchestrator::new(&ctx, &loaded.stages, &loaded.plan)?;
//! let report = orchestrator.run(&Unattended);
//! println!("{}", report.overall_status());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod control;
pub mod engine;
pub mod error;
pub mod mount;
pub mod pipeline;
pub mod preflight;
pub mod report;
pub mod stages;
pub mod timestamp;
pub mod updates;
pub mod version;

#[cfg(test)]
mod testutil;

pub use context::RunContext;
pub use control::{CancellationToken, Operator, ResumeSignal, SuspendPoint, Unattended};
pub use engine::{DismEngine, EngineError, ImageEngine};
pub use error::{Result, ServicingError};
pub use mount::{MountHealth, MountManager, MountSession, MountState};
pub use pipeline::{FailurePolicy, Orchestrator, ServicingPlan, Stage, StageConfig};
pub use report::{RunReport, StageOutcome, StageStatus};
pub use updates::{ContainerFormat, UpdateClass, UpdatePackage};
pub use version::{ReleaseId, VersionClassification, VersionClassifier};
