//! Trace-to-pack construction pipeline.
//!
//! Consumes the kernel trace of a representative workload and produces one
//! readahead pack per device:
//!
//! - open-family events flow through the path filter into the file scanner,
//!   which records paths and candidate blocks from page-cache residency;
//! - filemap events feed the interval index of pages processes actually read;
//! - the block reducer intersects the two to drop readahead residue;
//! - on rotating media an ordering pass adds inode-group preload hints and
//!   sorts blocks and paths for a sequential sweep of the disk.
//!
//! [`session::trace`] orchestrates the whole run, including trace-subsystem
//! setup and restore, the signal-terminated wait, and pack write-out.

pub mod ingest;
pub mod order;
pub mod path_filter;
pub mod reduce;
pub mod scanner;
pub mod session;

pub use path_filter::{PathFilter, PathPrefix, normalise};
pub use scanner::{PackSet, Scanner};
pub use session::{TraceConfig, trace};
