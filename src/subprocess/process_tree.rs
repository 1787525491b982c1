//! Process group and descendant bookkeeping
//!
//! A command started through a shell usually forks the real work off into
//! children. Stopping it means signalling the whole process group, plus any
//! descendant that moved itself into a different group, and then confirming
//! that none of them are still alive.

use std::collections::{HashMap, HashSet, VecDeque};
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

/// Point-in-time view of the processes running on this machine
pub struct ProcessTable {
    /// pid -> parent pid, live processes only (threads excluded)
    parents: HashMap<u32, Option<u32>>,
}

impl ProcessTable {
    /// Capture the process table on the blocking pool.
    pub async fn capture() -> std::io::Result<Self> {
        tokio::task::spawn_blocking(Self::capture_blocking)
            .await
            .map_err(std::io::Error::other)
    }

    pub fn capture_blocking() -> Self {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let parents = system
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .filter(|(_, process)| {
                !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
            })
            .map(|(pid, process)| (pid.as_u32(), process.parent().map(|p| p.as_u32())))
            .collect();

        Self { parents }
    }

    /// Whether `pid` exists and has not exited. Zombies count as exited.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.parents.contains_key(&pid)
    }

    /// Live descendants of `root`, not including `root` itself.
    pub fn descendants(&self, root: u32) -> HashSet<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (&pid, &parent) in &self.parents {
            if let Some(parent) = parent {
                children.entry(parent).or_default().push(pid);
            }
        }

        let mut found = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            for &child in children.get(&pid).into_iter().flatten() {
                if found.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        found
    }

    /// Live members of process group `pgid`.
    #[cfg(unix)]
    pub fn group_members(&self, pgid: u32) -> HashSet<u32> {
        use nix::unistd::{getpgid, Pid};

        self.parents
            .keys()
            .copied()
            .filter(|&pid| {
                getpgid(Some(Pid::from_raw(pid as i32)))
                    .map(|group| group.as_raw() as u32 == pgid)
                    .unwrap_or(false)
            })
            .collect()
    }

    #[cfg(not(unix))]
    pub fn group_members(&self, pgid: u32) -> HashSet<u32> {
        self.parents
            .keys()
            .copied()
            .filter(|&pid| pid == pgid)
            .collect()
    }

    /// Everything that belongs to the unit led by `leader`: the group it
    /// leads and all of its descendants.
    pub fn unit(&self, leader: u32) -> HashSet<u32> {
        let mut unit = self.group_members(leader);
        unit.extend(self.descendants(leader));
        if self.is_alive(leader) {
            unit.insert(leader);
        }
        unit
    }
}

/// Signals understood by [`signal_unit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

/// Send a termination signal to process group `pgid` and to every pid in
/// `extra`. Processes that are already gone are ignored.
#[cfg(unix)]
pub fn signal_unit(pgid: u32, extra: &HashSet<u32>, termination: Termination) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match termination {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };

    // Negative pid addresses the whole group.
    match kill(Pid::from_raw(-(pgid as i32)), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to send {} to group {}: {}", signal, pgid, e),
    }

    for &pid in extra {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!("Failed to send {} to pid {}: {}", signal, pid, e),
        }
    }
}

#[cfg(not(unix))]
pub fn signal_unit(_pgid: u32, _extra: &HashSet<u32>, _termination: Termination) {}
