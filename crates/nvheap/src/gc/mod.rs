//! Crash recovery by tracing from the persistent roots.
//!
//! After a dirty restart the allocator metadata cannot be trusted: thread
//! caches were lost, anchors may be stale and list heads may point at
//! superblocks that were being retired. Recovery rebuilds all of it from the
//! one thing that is always consistent, the object graph reachable from the
//! roots. A block is live iff it is reachable.

mod bitmap;
mod recovery;
mod trace;

pub use bitmap::MarkBitmap;
pub use trace::{Trace, Visitor};

pub(crate) use recovery::{recover, trace_conservative, trace_typed, TraceFn};
