use sysinfo::{Pid, System};

/// Reports how much of the memory budget the process is using, as a ratio.
pub trait MemoryProbe: Send {
    fn usage_ratio(&mut self) -> f64;
}

/// Samples the current process' resident memory through `sysinfo`.
pub struct SystemMemory {
    system: System,
    pid: Option<Pid>,
    limit_bytes: u64,
}

impl SystemMemory {
    /// `limit_bytes` of `None` uses the host's total memory as the budget.
    pub fn new(limit_bytes: Option<u64>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let limit_bytes = limit_bytes.unwrap_or_else(|| system.total_memory()).max(1);
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Cannot determine own PID, memory checks disabled: {}", e);
                None
            }
        };
        SystemMemory {
            system,
            pid,
            limit_bytes,
        }
    }
}

impl MemoryProbe for SystemMemory {
    fn usage_ratio(&mut self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        if !self.system.refresh_process(pid) {
            return 0.0;
        }
        let used = self.system.process(pid).map(|p| p.memory()).unwrap_or(0);
        used as f64 / self.limit_bytes as f64
    }
}

/// A probe that always reports the same ratio.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub f64);

impl MemoryProbe for FixedMemory {
    fn usage_ratio(&mut self) -> f64 {
        self.0
    }
}
