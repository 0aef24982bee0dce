//! Process-group termination

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// Process group led by a spawned child (`setpgid(0, 0)` makes pgid == pid)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupId(Pid);

impl GroupId {
    /// Group of a child spawned with `process_group(0)`
    #[must_use]
    pub fn from_child_pid(pid: u32) -> Option<Self> {
        i32::try_from(pid)
            .ok()
            .filter(|&raw| raw > 0)
            .map(|raw| Self(Pid::from_raw(raw)))
    }

    #[must_use]
    pub fn as_raw(self) -> i32 {
        self.0.as_raw()
    }
}

/// SIGKILL every member of the group.
///
/// Returns `Ok(false)` when the group is already gone.
pub fn terminate_group(group: GroupId) -> nix::Result<bool> {
    match killpg(group.0, Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Kills a process group when dropped, unless disarmed first.
///
/// Must be dropped before the child is reaped: the pgid is only guaranteed to
/// name our group while the leader or one of its members is still around.
#[derive(Debug)]
pub struct GroupGuard(Option<GroupId>);

impl GroupGuard {
    #[must_use]
    pub const fn new(group: Option<GroupId>) -> Self {
        Self(group)
    }

    /// Kill the group now; later calls and the drop are no-ops
    pub fn terminate(&mut self) {
        let Some(group) = self.0.take() else {
            return;
        };
        match terminate_group(group) {
            Ok(true) => tracing::debug!(pgid = group.as_raw(), "process group killed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(pgid = group.as_raw(), error = %e, "killpg failed"),
        }
    }

    /// Forget the group without signalling it
    pub fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_ids() {
        assert!(GroupId::from_child_pid(0).is_none());
        assert!(GroupId::from_child_pid(u32::MAX).is_none());
        assert_eq!(GroupId::from_child_pid(4242).map(GroupId::as_raw), Some(4242));
    }
}
