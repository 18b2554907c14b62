//! A concurrent DICOM query/retrieve task scheduler.
//!
//! The crate coordinates asynchronous C-FIND (query) and C-GET / C-MOVE
//! (retrieve) operations across one or more remote application entities,
//! indexes the returned datasets into a local database through an adapter,
//! and exposes a progress/lifecycle event stream to UI layers.
//!
//! - [`Scheduler`] owns the worker pool and the per-task registry, applies
//!   priority, retry and cancellation, and fans results into the indexer.
//! - [`QueryDriver`](query::QueryDriver) and
//!   [`RetrieveDriver`](retrieve::RetrieveDriver) run one DIMSE exchange
//!   each over an [`Association`](dimse::association::Association).
//! - [`ThumbnailCoordinator`] prefetches the central frame of a series at
//!   elevated priority and backfills the rest.
//!
//! The local database stays behind the [`DicomDatabase`] trait: this crate
//! writes through it and reads series metadata from it, nothing more.

pub mod config;
pub mod database;
pub mod dimse;
pub mod events;
pub mod filters;
pub mod indexer;
pub mod query;
pub mod results;
pub mod retrieve;
pub mod scheduler;
pub mod server;
pub mod task;
pub mod thumbnail;
pub mod types;

pub use config::SchedulerConfig;
pub use database::{DicomDatabase, IndexError, InstanceRecord};
pub use events::{ProgressMessage, SchedulerEvent};
pub use filters::{FilterValue, QueryFilters};
pub use results::{ResultPayload, TaskResult, TaskResultKind};
pub use scheduler::{ScheduleError, Scheduler};
pub use server::{RetrieveProtocol, ServerDescriptor, ServerDescriptorError};
pub use task::{QueryLevel, RetrieveLevel, TaskUid};
pub use thumbnail::ThumbnailCoordinator;
pub use types::TaskPriority;
