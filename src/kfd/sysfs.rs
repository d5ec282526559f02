//! Per-process attribute tree, the `proc/<pid>/` directory of the KFD sysfs node.
//!
//! Layout below each process directory:
//!
//! ```text
//! pasid
//! vram_<gpuid>
//! sdma_<gpuid>
//! stats_<gpuid>/evicted_ms
//! stats_<gpuid>/cu_occupancy      (devices that report occupancy)
//! queues/<qid>/{size,type,gpuid}
//! ```
//!
//! Entries only hold what is needed to find the process again; values are computed from
//! live process state on every read. The tree lock is never held while a process is
//! locked for a read.

use crate::error::{KfdError, KfdResult};
use crate::kfd::device::GpuId;
use crate::kfd::ioctl::QueueType;
use crate::kfd::qcm::QueueProperties;
use crate::mm::Pid;
use crate::process::KfdProcess;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// SDMA counters tick in 10 ns units; the attribute reports microseconds.
const SDMA_ACTIVITY_DIVISOR: u64 = 100;

#[derive(Debug, Clone, Copy)]
struct QueueDir {
    size: u64,
    queue_type: QueueType,
    gpu_id: GpuId,
}

#[derive(Debug)]
struct ProcDir {
    process: Weak<KfdProcess>,
    files: BTreeSet<String>,
    queues: BTreeMap<u32, QueueDir>,
}

/// Attribute of a process directory, parsed from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attr {
    Pasid,
    Vram(GpuId),
    Sdma(GpuId),
    EvictedMs(GpuId),
    CuOccupancy(GpuId),
}

impl Attr {
    fn parse(path: &str) -> Option<Self> {
        if path == "pasid" {
            return Some(Self::Pasid);
        }
        if let Some(gpu) = path.strip_prefix("vram_") {
            return gpu.parse().ok().map(Self::Vram);
        }
        if let Some(gpu) = path.strip_prefix("sdma_") {
            return gpu.parse().ok().map(Self::Sdma);
        }
        let (dir, file) = path.strip_prefix("stats_")?.split_once('/')?;
        let gpu = dir.parse().ok()?;
        match file {
            "evicted_ms" => Some(Self::EvictedMs(gpu)),
            "cu_occupancy" => Some(Self::CuOccupancy(gpu)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Procfs {
    procs: Mutex<BTreeMap<Pid, ProcDir>>,
}

impl Procfs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the directory of `process` with one attribute set per attached device.
    pub(crate) fn add_process(&self, process: &Arc<KfdProcess>) {
        let mut files = BTreeSet::from(["pasid".to_owned()]);
        {
            let st = process.lock();
            for pdd in st.pdds() {
                let gpu = pdd.gpu_id();
                files.insert(format!("vram_{gpu}"));
                files.insert(format!("sdma_{gpu}"));
                files.insert(format!("stats_{gpu}/evicted_ms"));
                if pdd.device().kfd2kgd().supports_cu_occupancy() {
                    files.insert(format!("stats_{gpu}/cu_occupancy"));
                }
            }
        }

        let pid = process.lead_pid();
        let dir = ProcDir {
            process: Arc::downgrade(process),
            files,
            queues: BTreeMap::new(),
        };
        if self.procs.lock().insert(pid, dir).is_some() {
            warn!(pid, "replaced a stale procfs directory");
        }
        debug!(pid, "created procfs directory");
    }

    pub(crate) fn add_queue(&self, pid: Pid, queue: &QueueProperties, gpu_id: GpuId) {
        let mut procs = self.procs.lock();
        let Some(dir) = procs.get_mut(&pid) else {
            warn!(pid, qid = queue.queue_id, "no procfs directory for queue");
            return;
        };
        dir.queues.insert(
            queue.queue_id,
            QueueDir {
                size: queue.queue_size,
                queue_type: queue.queue_type,
                gpu_id,
            },
        );
    }

    pub(crate) fn del_queue(&self, pid: Pid, qid: u32) {
        if let Some(dir) = self.procs.lock().get_mut(&pid) {
            dir.queues.remove(&qid);
        }
    }

    pub(crate) fn remove_process(&self, pid: Pid) {
        if self.procs.lock().remove(&pid).is_some() {
            debug!(pid, "removed procfs directory");
        }
    }

    #[must_use]
    pub fn contains_process(&self, pid: Pid) -> bool {
        self.procs.lock().contains_key(&pid)
    }

    /// Every readable path, relative to the `proc` directory.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let procs = self.procs.lock();
        let mut out = Vec::new();
        for (pid, dir) in procs.iter() {
            out.extend(dir.files.iter().map(|f| format!("{pid}/{f}")));
            for qid in dir.queues.keys() {
                for attr in ["size", "type", "gpuid"] {
                    out.push(format!("{pid}/queues/{qid}/{attr}"));
                }
            }
        }
        out
    }

    /// Reads the attribute at `path`, e.g. `"1234/vram_4096"`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a path that does not exist or a process that is
    /// already gone.
    pub fn read(&self, path: &str) -> KfdResult<String> {
        let no_entry = || KfdError::invalid(format!("no such attribute: {path}"));
        let (pid, rest) = path.split_once('/').ok_or_else(no_entry)?;
        let pid: Pid = pid.parse().map_err(|_| no_entry())?;

        let process = {
            let procs = self.procs.lock();
            let dir = procs.get(&pid).ok_or_else(no_entry)?;

            if let Some(queue_path) = rest.strip_prefix("queues/") {
                let (qid, attr) = queue_path.split_once('/').ok_or_else(no_entry)?;
                let qid: u32 = qid.parse().map_err(|_| no_entry())?;
                let q = dir.queues.get(&qid).ok_or_else(no_entry)?;
                return match attr {
                    "size" => Ok(q.size.to_string()),
                    "type" => Ok(q.queue_type.as_raw().to_string()),
                    "gpuid" => Ok(q.gpu_id.to_string()),
                    _ => Err(no_entry()),
                };
            }

            if !dir.files.contains(rest) {
                return Err(no_entry());
            }
            dir.process.upgrade().ok_or_else(no_entry)?
        };

        let Some(attr) = Attr::parse(rest) else {
            error!(path, "invalid procfs attribute");
            return Err(no_entry());
        };
        show(&process, attr).map(|v| format!("{v}\n"))
    }
}

fn show(process: &KfdProcess, attr: Attr) -> KfdResult<u64> {
    let missing = |gpu: GpuId| KfdError::invalid(format!("process has no data for gpu {gpu}"));

    match attr {
        Attr::Pasid => Ok(u64::from(process.pasid())),
        Attr::Vram(gpu) => {
            let st = process.lock();
            st.pdd(gpu).map(|p| p.vram_usage()).ok_or_else(|| missing(gpu))
        }
        Attr::Sdma(gpu) => Ok(process.sdma_activity(gpu)? / SDMA_ACTIVITY_DIVISOR),
        Attr::EvictedMs(gpu) => {
            let st = process.lock();
            st.pdd(gpu)
                .map(|p| p.eviction_stats().evicted_ms())
                .ok_or_else(|| missing(gpu))
        }
        Attr::CuOccupancy(gpu) => cu_occupancy(process, gpu),
    }
}

/// Compute units in use by the process's waves, rounded up.
fn cu_occupancy(process: &KfdProcess, gpu_id: GpuId) -> KfdResult<u64> {
    let st = process.lock();
    let pdd = st
        .pdd(gpu_id)
        .ok_or_else(|| KfdError::invalid(format!("process has no data for gpu {gpu_id}")))?;
    let hooks = pdd.device().kfd2kgd();
    if !hooks.supports_cu_occupancy() {
        return Err(KfdError::invalid("device does not report CU occupancy"));
    }
    if pdd.qpd().queue_count() == 0 {
        debug!(gpu_id, "gpu has no active queues for process");
        return Ok(0);
    }

    let (waves, max_waves_per_cu) = hooks.cu_occupancy(process.pasid()).unwrap_or((0, 0));
    if max_waves_per_cu == 0 {
        return Ok(0);
    }
    Ok(u64::from(waves.div_ceil(max_waves_per_cu)))
}
