//! wpheal: diagnosis and self-healing for remote WordPress sites.
//!
//! A diagnosis runs a profile's checks against a site, folds them into a
//! weighted health score and names a probable cause. A heal approves the
//! resulting execution and queues a job that backs the site up, applies the
//! remedy, verifies the result and learns from the outcome. A per-target
//! circuit breaker stops repeated failing attempts.
//!
//! # Quick Start
//!
//! ```ignore
//! use wpheal::{config::Config, engine::Engine, healing::DiagnoseOptions, model::TriggerSource};
//!
//! let engine = Engine::bootstrap(Config::load(None)?).await?;
//! let execution = engine
//!     .diagnose("blog", TriggerSource::Manual, &DiagnoseOptions::default())
//!     .await?;
//! engine.heal(&execution.id, None).await?;
//! engine.run_pending().await?;
//! ```

// ─── Foundations ───────────────────────────────────────────────────
pub mod clock;
pub mod config;
pub mod errors;
pub mod model;
pub mod observability;

// ─── Collaborators ─────────────────────────────────────────────────
pub mod backup;
pub mod queue;
pub mod remote;
pub mod store;

// ─── Diagnosis & Healing ──────────────────────────────────────────
pub mod checks;
pub mod diagnosis;
pub mod healing;
pub mod learning;
pub mod supervision;
pub mod verification;

// ─── Wiring & Surfaces ────────────────────────────────────────────
pub mod cli;
pub mod engine;
pub mod testing;

pub use config::Config;
pub use engine::{Engine, EngineStats};
pub use errors::{HealerError, Result};
