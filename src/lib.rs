//! Dynamic master/worker work dispatch over a simple MPI-like process group.
//!
//! One coordinator (rank 0) hands out a stream of `N` unit-work tickets to `W`
//! workers (ranks `1..=W`). Each worker holds at most one ticket at a time;
//! whichever worker reports back first gets the next ticket, and once the
//! tickets run out every worker is sent a termination signal exactly once.
//!
//! # Quick Start
//!
//! ```rust
//! use simple_dispatch::comm::LocalWorld;
//! use simple_dispatch::session::{run_session, SessionOutcome};
//!
//! // One coordinator and three workers, each on its own thread
//! let outcomes = LocalWorld::run(4, |world| run_session(world, 100, 1)).unwrap();
//!
//! if let Ok(SessionOutcome::Coordinator(report)) = &outcomes[0] {
//!     assert_eq!(report.completions.len(), 100);
//!     println!("{}", report);
//! }
//! ```
//!
//! # Architecture
//!
//! - [`comm`]: the [`Communicator`] process-group handle with a shared-memory
//!   multi-process transport ([`World`]) and a thread transport ([`LocalWorld`]).
//! - [`protocol`]: tickets, the termination sentinel and message tags.
//! - [`coordinator`]: the [`Dispatcher`] state machine and the rank 0 loop.
//! - [`worker`]: the simulated workload and the worker loop.
//! - [`session`]: what every rank runs, including the end-of-run gather and barrier.
//!
//! # Error Handling
//!
//! All operations return a `Result` type with detailed error variants through [`DispatchError`].
//! Errors end the participation of the rank that detected them; nothing is
//! propagated to other ranks.

pub mod comm;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod worker;

pub use comm::{Communicator, LocalWorld, RequestSet, World};
pub use coordinator::{DispatchReport, Dispatcher, Phase};
pub use error::{DispatchError, Result};
pub use protocol::{Assignment, Ticket};
