//! Queue eviction and restore.
//!
//! An eviction stops every user-mode queue of a process so the memory manager can move
//! its buffers. The eviction worker runs on the process workqueue, signals the eviction
//! fence once the queues are stopped and schedules a restore no earlier than the settle
//! time after the eviction. Restores run on an ordered workqueue so at most one is in
//! flight system-wide, and a failed buffer restore is retried after a back-off, forever.
//!
//! Lock order: the process lock is taken before the address-space mmap lock. Work items
//! are flushed, cancelled and queued without holding any process lock.

use super::KfdShared;
use super::object::{KfdProcess, ProcessState};
use crate::error::KfdResult;
use crate::sync::DmaFence;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

macro_rules! evict_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Remaining wait before a restore may run, given the last eviction.
#[must_use]
pub fn restore_delay(now: Instant, last_evict: Instant, settle: Duration) -> Duration {
    settle.saturating_sub(now.saturating_duration_since(last_evict))
}

// ===============================================================================================
// Queue Eviction
// ===============================================================================================

impl ProcessState {
    /// Evicts the queues of every process-device. Devices evicted before a failure are
    /// restored again, so the process is either fully evicted or not at all.
    ///
    /// # Errors
    /// Returns the first eviction failure.
    pub fn evict_queues(&mut self) -> KfdResult<()> {
        let pasid = self.pasid;
        let mut n_evicted = 0;
        let mut failure = None;

        for pdd in &mut self.pdds {
            match pdd.dev.dqm().evict_process_queues(&pdd.qpd) {
                Ok(()) => {
                    pdd.eviction.evicted();
                    n_evicted += 1;
                }
                Err(e) => {
                    error!(pasid, gpu_id = pdd.gpu_id(), error = %e, "failed to evict process queues");
                    failure = Some(e);
                    break;
                }
            }
        }

        let Some(err) = failure else {
            return Ok(());
        };

        for pdd in self.pdds.iter_mut().take(n_evicted) {
            match pdd.dev.dqm().restore_process_queues(&pdd.qpd) {
                Ok(()) => pdd.eviction.restored(),
                Err(e) => error!(pasid, gpu_id = pdd.gpu_id(), error = %e, "failed to restore queues"),
            }
        }
        Err(err)
    }

    /// Restores the queues of every process-device, carrying on past failures.
    ///
    /// # Errors
    /// Returns the first restore failure.
    pub fn restore_queues(&mut self) -> KfdResult<()> {
        let pasid = self.pasid;
        let mut result = Ok(());

        for pdd in &mut self.pdds {
            match pdd.dev.dqm().restore_process_queues(&pdd.qpd) {
                Ok(()) => pdd.eviction.restored(),
                Err(e) => {
                    error!(pasid, gpu_id = pdd.gpu_id(), error = %e, "failed to restore process queues");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    fn unmap_doorbells(&mut self) {
        let Some(mm) = self.mm() else {
            return;
        };
        let _map = mm.mmap_lock.write();
        for pdd in &mut self.pdds {
            if pdd.qpd.doorbell_vma.is_some() {
                pdd.qpd.doorbells_mapped = false;
            }
        }
    }

    fn remap_doorbells(&mut self) -> KfdResult<()> {
        let mm = self
            .mm()
            .ok_or_else(|| crate::error::KfdError::invalid("address space is gone"))?;
        let _map = mm.mmap_lock.write();
        for pdd in &mut self.pdds {
            if pdd.qpd.doorbell_vma.is_some() {
                pdd.qpd.doorbells_mapped = true;
            }
        }
        Ok(())
    }

    /// With doorbells unmapped no new work can be submitted, so the queues can be checked
    /// for idleness. Returns `true` if all were idle and the doorbells stay unmapped.
    fn unmap_doorbells_if_idle(&mut self) -> bool {
        self.unmap_doorbells();

        let busy = self
            .pdds
            .iter()
            .any(|pdd| pdd.dev.dqm().check_queues_active(&pdd.qpd));
        if busy {
            if let Err(e) = self.remap_doorbells() {
                warn!(pasid = self.pasid, error = %e, "failed to remap doorbells");
            }
            return false;
        }
        self.idle_evicted = true;
        true
    }
}

// ===============================================================================================
// Deferred Work
// ===============================================================================================

impl KfdProcess {
    /// Queues the restore to run once the settle time after the last eviction has passed
    /// and returns the delay used.
    pub fn schedule_restore(&self) -> Duration {
        let delay = restore_delay(
            Instant::now(),
            self.last_evict_timestamp(),
            self.kfd.config.restore_time,
        );
        debug!(pasid = self.pasid(), delay_ms = delay.as_millis(), "scheduling restore");
        if !self.restore_work.queue_delayed(delay) {
            warn!(pasid = self.pasid(), "failed to schedule restore work");
        }
        delay
    }

    /// Queues an eviction for the memory manager's eviction fence `fence`. Returns `false`
    /// if an eviction for this fence was already requested.
    ///
    /// A freshly restored process gets to run for the active time before it is evicted
    /// again.
    pub fn schedule_eviction(&self, fence: &DmaFence) -> bool {
        if fence.seqno() == self.last_eviction_seqno() {
            return false;
        }
        self.set_last_eviction_seqno(fence.seqno());

        let delay = restore_delay(
            Instant::now(),
            self.last_restore_timestamp(),
            self.kfd.config.active_time,
        );
        if !self.eviction_work.queue_delayed(delay) {
            debug!(pasid = self.pasid(), "eviction already pending");
            return false;
        }
        true
    }

    /// Maps the doorbells of a process that was left evicted because it was idle, and
    /// restores it right away.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the address space is gone.
    pub fn remap_doorbells(&self) -> KfdResult<()> {
        let mut st = self.lock();
        st.remap_doorbells()?;
        let resume = std::mem::take(&mut st.idle_evicted);
        drop(st);

        if resume && !self.restore_work.queue_delayed(Duration::ZERO) {
            warn!(pasid = self.pasid(), "failed to schedule restore work");
        }
        Ok(())
    }
}

/// Eviction work item.
pub fn evict_process_worker(p: &KfdProcess) {
    let verbose = p.kfd.config.debug_evictions;

    // A restore that has unreserved the process BOs can race with this eviction while it
    // is still restoring queues, so wait for it first. A restore queued again after this
    // flush is not waited for.
    p.restore_work.flush();

    let mut st = p.lock();
    if let Some(ef) = &st.ef {
        if ef.seqno() != p.last_eviction_seqno() {
            warn!(pasid = p.pasid(), "eviction fence mismatch");
        }
    }

    p.set_last_evict_timestamp(Instant::now());
    evict_log!(verbose, pasid = p.pasid(), "started evicting");

    if let Err(e) = st.evict_queues() {
        error!(pasid = p.pasid(), error = %e, "failed to evict queues");
        return;
    }

    if let Some(ef) = st.ef.take() {
        ef.signal();
    }

    let stay_evicted = p.kfd.config.keep_idle_process_evicted && st.unmap_doorbells_if_idle();
    drop(st);

    if stay_evicted {
        debug!(pasid = p.pasid(), "queues idle, doorbells unmapped");
    } else {
        p.schedule_restore();
    }
    evict_log!(verbose, pasid = p.pasid(), "finished evicting");
}

/// Restore work item.
pub fn restore_process_worker(p: &KfdProcess) {
    let verbose = p.kfd.config.debug_evictions;
    evict_log!(verbose, pasid = p.pasid(), "started restoring");

    // Once the BOs are unreserved below the process can be evicted again, and the next
    // eviction is delayed relative to this timestamp, so it is taken first. A failed
    // attempt takes it again on the next try.
    p.set_last_restore_timestamp(Instant::now());

    let mut st = p.lock();

    // No VM has been acquired yet when a debugger attached before first use.
    if let Some(info) = st.process_info {
        match p.kfd.gpuvm.restore_process_bos(info) {
            Ok(fence) => st.ef = Some(fence),
            Err(e) => {
                drop(st);
                let back_off = p.kfd.config.back_off_time;
                info!(
                    pasid = p.pasid(),
                    error = %e,
                    "failed to restore BOs, retry after {} ms",
                    back_off.as_millis()
                );
                if !p.restore_work.queue_delayed(back_off) {
                    warn!(pasid = p.pasid(), "failed to reschedule restore work");
                }
                return;
            }
        }
    }

    st.idle_evicted = false;
    match st.restore_queues() {
        Ok(()) => evict_log!(verbose, pasid = p.pasid(), "finished restoring"),
        Err(e) => error!(pasid = p.pasid(), error = %e, "failed to restore queues"),
    }
}

// ===============================================================================================
// System Suspend
// ===============================================================================================

pub(crate) fn suspend_all(kfd: &KfdShared) {
    let _read = kfd.table.read_lock();
    if kfd.config.debug_evictions {
        warn!("evicting all processes");
    }

    for p in kfd.table.snapshot() {
        p.eviction_work.cancel_sync();
        p.restore_work.cancel_sync();

        let mut st = p.lock();
        if let Err(e) = st.evict_queues() {
            error!(pasid = p.pasid(), error = %e, "failed to suspend process");
        }
        if let Some(ef) = st.ef.take() {
            ef.signal();
        }
    }
}

pub(crate) fn resume_all(kfd: &KfdShared) -> KfdResult<()> {
    let _read = kfd.table.read_lock();
    let mut result = Ok(());

    for p in kfd.table.snapshot() {
        if !p.restore_work.queue_delayed(Duration::ZERO) {
            error!(pasid = p.pasid(), "restore process failed during resume");
            result = Err(std::io::Error::from_raw_os_error(libc::EFAULT).into());
        }
    }
    result
}
