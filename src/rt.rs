//! One-shot real-time scheduling setup.
//!
//! Setuid-root builds start with a privileged effective uid. Privileges are
//! dropped right away, raised again only around `sched_setscheduler`, then
//! dropped for good. Without privileges every step degrades to a warning.

use nix::errno::Errno;
use nix::unistd::{getresuid, seteuid, setresuid, Uid};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TakeError};

pub const DEFAULT_RT_PRIORITY: i32 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    Fifo,
    Rr,
}

impl SchedPolicy {
    fn raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::Rr => libc::SCHED_RR,
        }
    }
}

/// What the scheduling step actually achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtOutcome {
    pub scheduled: bool,
    pub privileges_dropped: bool,
    pub pinned_cpu: Option<usize>,
}

static OUTCOME: OnceCell<RtOutcome> = OnceCell::new();

#[derive(Debug, Clone)]
pub struct RealTimeScheduler {
    pub policy: SchedPolicy,
    pub priority: i32,
    pub cpu: Option<usize>,
}

impl Default for RealTimeScheduler {
    fn default() -> Self {
        Self {
            policy: SchedPolicy::Fifo,
            priority: DEFAULT_RT_PRIORITY,
            cpu: None,
        }
    }
}

impl RealTimeScheduler {
    /// Apply once per process; later calls return the first outcome untouched
    pub fn apply(&self) -> &'static RtOutcome {
        OUTCOME.get_or_init(|| self.apply_once())
    }

    fn apply_once(&self) -> RtOutcome {
        let mut outcome = RtOutcome {
            scheduled: false,
            privileges_dropped: false,
            pinned_cpu: None,
        };

        let ids = match getresuid() {
            Ok(ids) => Some(ids),
            Err(e) => {
                warn!("getresuid failed: {}", e);
                None
            }
        };

        if let Some(ids) = &ids {
            report(privilege("seteuid(real)", seteuid(ids.real)));
            report(privilege("seteuid(effective)", seteuid(ids.effective)));
        }

        match set_scheduler(self.policy, self.priority) {
            Ok(()) => {
                info!("Scheduler set to {:?} priority {}", self.policy, self.priority);
                outcome.scheduled = true;
            }
            Err(e) => warn!("{}, continuing with default scheduling", e),
        }

        if let Some(ids) = &ids {
            if ids.effective != ids.real {
                let r: Uid = ids.real;
                match privilege("setresuid", setresuid(r, r, r)) {
                    Ok(()) => {
                        info!("Dropped privileges to uid {}", r);
                        outcome.privileges_dropped = true;
                    }
                    Err(e) => warn!("{}", e),
                }
            } else {
                report(privilege("seteuid(real)", seteuid(ids.real)));
            }
        }

        if let Some(cpu) = self.cpu {
            outcome.pinned_cpu = pin_to_cpu(cpu);
        }
        outcome
    }
}

fn privilege(op: &'static str, res: nix::Result<()>) -> Result<()> {
    res.map_err(|source| TakeError::Privilege { op, source })
}

fn report(res: Result<()>) {
    if let Err(e) = res {
        warn!("{}", e);
    }
}

fn set_scheduler(policy: SchedPolicy, priority: i32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 targets the calling thread and `param` is a valid pointer.
    let rc = unsafe { libc::sched_setscheduler(0, policy.raw(), &param) };
    if rc != 0 {
        return Err(TakeError::Privilege {
            op: "sched_setscheduler",
            source: Errno::last(),
        });
    }
    Ok(())
}

fn pin_to_cpu(cpu: usize) -> Option<usize> {
    let ids = core_affinity::get_core_ids()?;
    match ids.into_iter().find(|c| c.id == cpu) {
        Some(core) if core_affinity::set_for_current(core) => {
            info!("Pinned acquisition thread to CPU {}", cpu);
            Some(cpu)
        }
        Some(_) => {
            warn!("Failed to pin to CPU {}", cpu);
            None
        }
        None => {
            warn!("CPU {} not available for pinning", cpu);
            None
        }
    }
}
