use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

/// Raw memory figures for the current process, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub rss: u64,
    pub array_buffers: u64,
}

/// Cumulative CPU time consumed by the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: Duration,
    pub system: Duration,
}

/// Source of process-level measurements. Any call may fail; the sampler
/// turns a failure into zeros for that category.
pub trait SystemProbe: Send + Sync {
    fn memory(&self) -> Result<MemorySample>;
    fn cpu_times(&self) -> Result<CpuTimes>;
    fn open_file_descriptors(&self) -> Result<u64>;
}

/// Probe backed by `sysinfo`, `getrusage` and the process fd table.
///
/// `heap_used` is the resident set and `heap_total` is the resident set plus
/// the memory the system still has available, so the usage percentage rises
/// as the machine runs out of room for this process.
pub struct ProcessProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("current pid unavailable: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl SystemProbe for ProcessProbe {
    fn memory(&self) -> Result<MemorySample> {
        let pid = self.pid.ok_or_else(|| anyhow!("current pid unavailable"))?;
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let process = system
            .process(pid)
            .ok_or_else(|| anyhow!("process {} not found", pid))?;
        let rss = process.memory();

        Ok(MemorySample {
            heap_used: rss,
            heap_total: rss.saturating_add(system.available_memory()),
            external: 0,
            rss,
            array_buffers: 0,
        })
    }

    #[cfg(unix)]
    fn cpu_times(&self) -> Result<CpuTimes> {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: getrusage only writes into the provided struct.
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: zero-initialised and filled by a successful getrusage call.
        let usage = unsafe { usage.assume_init() };
        Ok(CpuTimes {
            user: timeval_to_duration(usage.ru_utime),
            system: timeval_to_duration(usage.ru_stime),
        })
    }

    #[cfg(not(unix))]
    fn cpu_times(&self) -> Result<CpuTimes> {
        Err(anyhow!("process cpu times are not available on this platform"))
    }

    fn open_file_descriptors(&self) -> Result<u64> {
        for dir in ["/proc/self/fd", "/dev/fd"] {
            if let Ok(entries) = std::fs::read_dir(dir) {
                return Ok(entries.count() as u64);
            }
        }
        Err(anyhow!("no file descriptor table to inspect"))
    }
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Probe that replays scripted samples, for tests and simulations.
///
/// Each call pops the next scripted value; once a script runs dry the last
/// value keeps being returned. An empty script fails the call.
#[derive(Default)]
pub struct ScriptedProbe {
    memory: Mutex<Script<MemorySample>>,
    cpu: Mutex<Script<CpuTimes>>,
    fds: Mutex<Script<u64>>,
}

struct Script<T> {
    pending: VecDeque<T>,
    last: Option<T>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            last: None,
        }
    }
}

impl<T: Copy> Script<T> {
    fn next(&mut self, what: &str) -> Result<T> {
        if let Some(value) = self.pending.pop_front() {
            self.last = Some(value);
        }
        self.last.ok_or_else(|| anyhow!("no scripted {} sample", what))
    }
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_memory(&self, sample: MemorySample) -> &Self {
        self.memory.lock().pending.push_back(sample);
        self
    }

    pub fn push_cpu(&self, times: CpuTimes) -> &Self {
        self.cpu.lock().pending.push_back(times);
        self
    }

    pub fn push_open_file_descriptors(&self, count: u64) -> &Self {
        self.fds.lock().pending.push_back(count);
        self
    }
}

impl SystemProbe for ScriptedProbe {
    fn memory(&self) -> Result<MemorySample> {
        self.memory.lock().next("memory")
    }

    fn cpu_times(&self) -> Result<CpuTimes> {
        self.cpu.lock().next("cpu")
    }

    fn open_file_descriptors(&self) -> Result<u64> {
        self.fds.lock().next("file descriptor")
    }
}
