//! On-demand delivery of debug information to debuggers.
//!
//! Two processes cooperate on a host. `symfetch-fs` mounts a passthrough
//! view of a cache directory beneath each debug tree (object debug info
//! and source); on metadata lookups it asks `symfetchd` over a local
//! abstract socket to hydrate the cache from a remote archive catalog,
//! then answers from the cache. Missing paths look missing, present paths
//! look like they were always there, and the debugger never learns the
//! difference.

pub mod config;
pub mod daemon;
pub mod proto;
pub mod shadow;
