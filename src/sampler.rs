//! OS-level resource readings for the supervised process and the host.

use crate::sys;
use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("process {0} is gone")]
    ProcessGone(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceReading {
    /// Share of total host CPU, 0..=100. `None` on the first sample of a pid.
    pub cpu_percent: Option<f64>,
    pub memory_bytes: u64,
    pub system_memory_percent: f64,
}

pub struct ResourceSampler {
    system: System,
    primed: Option<u32>,
    cores: f64,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Self {
            system: System::new(),
            primed: None,
            cores,
        }
    }

    /// Take one reading. CPU is the delta since the previous call for the
    /// same pid; a different pid starts a fresh baseline.
    pub fn sample(&mut self, pid: u32) -> Result<ResourceReading, SampleError> {
        if !sys::is_pid_alive(pid) {
            self.primed = None;
            return Err(SampleError::ProcessGone(pid));
        }

        let sys_pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        self.system.refresh_memory();

        let Some(process) = self.system.process(sys_pid) else {
            self.primed = None;
            return Err(SampleError::ProcessGone(pid));
        };

        let cpu_percent = if self.primed == Some(pid) {
            let per_core = process.cpu_usage() as f64;
            Some((per_core / self.cores).clamp(0.0, 100.0))
        } else {
            self.primed = Some(pid);
            None
        };

        let memory_bytes = process.memory();
        let total = self.system.total_memory();
        let system_memory_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };

        Ok(ResourceReading {
            cpu_percent,
            memory_bytes,
            system_memory_percent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_primes_cpu() {
        let mut sampler = ResourceSampler::new();
        let pid = std::process::id();

        let first = sampler.sample(pid).unwrap();
        assert!(first.cpu_percent.is_none());
        assert!(first.memory_bytes > 0);
        assert!((0.0..=100.0).contains(&first.system_memory_percent));

        let second = sampler.sample(pid).unwrap();
        let cpu = second.cpu_percent.expect("second sample has cpu");
        assert!((0.0..=100.0).contains(&cpu));
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_pid_is_process_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let mut sampler = ResourceSampler::new();
        assert!(matches!(
            sampler.sample(pid),
            Err(SampleError::ProcessGone(p)) if p == pid
        ));
    }
}
