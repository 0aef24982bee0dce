//! Process-level isolation primitives
//!
//! This module contains the defense-in-depth applied to every child:
//! - `limits` - setrlimit ceilings applied between fork and exec
//! - `group` - process-group termination so timeouts reach every descendant
//!
//! There are no namespaces, cgroups or syscall filters here. Least privilege for
//! the host process itself is a deployment concern.

pub mod group;
pub mod limits;

pub use self::group::{GroupGuard, GroupId};
pub use self::limits::ProcessLimits;
