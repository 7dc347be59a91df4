// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Convergent
//!
//! A declarative resource reconciliation and drift-detection engine.
//!
//! ## Overview
//!
//! You declare the resources that should exist; convergent works out which
//! remote calls bring the remote system in line and runs them:
//!
//! - Declared resources are typed by per-type schemas
//! - Plans are ordered by explicit and implicit dependencies
//! - Independent actions run concurrently with bounded parallelism
//! - Observed state is persisted locally or in S3 and guarded by a lock
//! - Drift between the remote and the declared set is reported on demand
//!
//! ## Architecture
//!
//! 1. **Declared set**: [`resource::ResourceDescriptor`]s, usually read from `convergent.yaml`
//! 2. **Observed state**: [`state::ObservedState`], the last-known remote attributes
//! 3. **Planner**: diffs the two into an [`planner::ExecutionPlan`]
//! 4. **Executor**: runs the plan against a [`remote::RemoteClient`], saving after every action
//!
//! ## Modules
//!
//! - [`resource`]: Attribute values, schemas and descriptors
//! - [`config`]: Configuration parsing and validation
//! - [`state`]: State storage backends (local, S3, memory) and locking
//! - [`remote`]: Remote clients (HTTP, in-memory), retries and refresh
//! - [`planner`]: Dependency graph, diff computation, planning and execution
//! - [`reconciler`]: Plan, apply, refresh, drift, import and destroy
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: frontdoor
//!   environment: prod
//!
//! remote:
//!   endpoint: https://api.example.net
//!
//! resources:
//!   - type: frontdoor_backend_pool
//!     name: backend-bing
//!     attributes:
//!       backend:
//!         - address: www.bing.com
//!           http_port: 80
//!           https_port: 443
//!   - type: frontdoor_routing_rule
//!     name: routing-rule
//!     attributes:
//!       patterns_to_match: ["/*"]
//!       forwarding_configuration:
//!         backend_pool_name: backend-bing
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod reconciler;
pub mod remote;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, EngineConfig};
pub use error::{ConvergentError, Result};
pub use planner::{ApplyResult, DiffEngine, ExecutionPlan, PlanExecutor, Planner};
pub use reconciler::{ApplyOutcome, DriftReport, Reconciler};
pub use remote::{HttpRemoteClient, InMemoryRemote, RemoteClient};
pub use resource::{DescriptorSource, ResourceDescriptor, SchemaRegistry};
pub use state::{LocalStateStore, MemoryStateStore, ObservedState, S3StateStore, StateStore};
