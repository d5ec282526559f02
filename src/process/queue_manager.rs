//! User-mode queues of one process across its devices.

use super::object::{KfdProcess, ProcessGuard};
use crate::error::{KfdError, KfdResult};
use crate::kfd::device::GpuId;
use crate::kfd::doorbell::KFD_MAX_NUM_OF_QUEUES_PER_PROCESS;
use crate::kfd::qcm::QueueProperties;
use crate::mm::NotifierScope;
use crate::utils::IdPool;
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Process-wide queue ids and the device each queue lives on.
#[derive(Debug)]
pub struct ProcessQueueManager {
    slots: IdPool,
    queues: BTreeMap<u32, GpuId>,
}

impl Default for ProcessQueueManager {
    fn default() -> Self {
        Self {
            slots: IdPool::with_capacity(KFD_MAX_NUM_OF_QUEUES_PER_PROCESS),
            queues: BTreeMap::new(),
        }
    }
}

impl ProcessQueueManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn gpu_of(&self, qid: u32) -> Option<GpuId> {
        self.queues.get(&qid).copied()
    }

    #[must_use]
    pub fn queue_ids(&self) -> Vec<u32> {
        self.queues.keys().copied().collect()
    }
}

impl ProcessGuard<'_> {
    /// Creates a queue on `gpu_id` and returns its process-wide id.
    ///
    /// # Errors
    /// Returns `ResourceExhausted` once all queue slots are taken, or the queue manager's
    /// failure.
    pub fn create_queue(&mut self, gpu_id: GpuId, mut props: QueueProperties) -> KfdResult<u32> {
        let process = self.process;
        let st = &mut *self.state;
        let idx = st
            .pdd_index(gpu_id)
            .ok_or_else(|| KfdError::invalid(format!("process has no data for gpu {gpu_id}")))?;

        let slot = st.pqm.slots.acquire(0).ok_or_else(|| {
            error!(
                "maximum number of queues per process ({KFD_MAX_NUM_OF_QUEUES_PER_PROCESS}) reached"
            );
            KfdError::ResourceExhausted("queue slots")
        })?;
        #[allow(clippy::cast_possible_truncation)]
        let qid = slot as u32;
        props.queue_id = qid;

        let pdd = &mut st.pdds[idx];
        match pdd.dev.dqm().create_queue(&pdd.qpd, &props) {
            Ok(vmid) => {
                if vmid != 0 {
                    pdd.qpd.vmid = vmid;
                }
            }
            Err(e) => {
                st.pqm.slots.release(slot);
                return Err(e);
            }
        }
        pdd.qpd.queues.push(props.clone());
        pdd.already_dequeued = false;
        st.pqm.queues.insert(qid, gpu_id);

        process.kfd.procfs.add_queue(process.lead_pid(), &props, gpu_id);
        debug!(pasid = st.pasid, gpu_id, qid, "created queue");
        Ok(qid)
    }

    /// Destroys a queue. The activity counter of an SDMA queue is folded into the device's
    /// past-activity counter first.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown id, or the queue manager's failure, in
    /// which case the queue is kept.
    pub fn destroy_queue(&mut self, qid: u32) -> KfdResult<()> {
        let process = self.process;
        let st = &mut *self.state;
        let gpu_id = st
            .pqm
            .gpu_of(qid)
            .ok_or_else(|| KfdError::invalid(format!("no queue {qid}")))?;
        let mm = st.mm();
        let pdd = st
            .pdd_mut(gpu_id)
            .ok_or_else(|| KfdError::invalid(format!("process has no data for gpu {gpu_id}")))?;
        let pos = pdd
            .qpd
            .queues
            .iter()
            .position(|q| q.queue_id == qid)
            .ok_or_else(|| KfdError::invalid(format!("no queue {qid}")))?;

        let props = pdd.qpd.queues[pos].clone();
        pdd.dev.dqm().destroy_queue(&pdd.qpd, &props)?;

        if props.queue_type.is_sdma() {
            let counter = mm.as_ref().map(|mm| {
                let _map = mm.mmap_lock.read();
                mm.read_u64(props.sdma_counter_addr())
            });
            match counter {
                Some(Ok(value)) => pdd.sdma_past_activity_counter += value,
                Some(Err(e)) => debug!(qid, error = %e, "failed to read SDMA queue counter"),
                None => {}
            }
        }

        pdd.qpd.queues.remove(pos);
        st.pqm.queues.remove(&qid);
        st.pqm.slots.release(qid as usize);
        process.kfd.procfs.del_queue(process.lead_pid(), qid);
        Ok(())
    }

    /// Asks each device's queue manager to tear down the process's queues, once per
    /// device.
    pub(crate) fn dequeue_from_all_devices(&mut self, _scope: &NotifierScope) {
        let pasid = self.pasid;
        for pdd in &mut self.state.pdds {
            if pdd.already_dequeued {
                continue;
            }
            if let Err(e) = pdd.dev.dqm().process_termination(&pdd.qpd) {
                error!(pasid, gpu_id = pdd.gpu_id(), error = %e, "process termination failed");
            }
            pdd.already_dequeued = true;
        }
    }

    /// Forgets every queue. Their hardware state is gone after
    /// [`dequeue_from_all_devices`](Self::dequeue_from_all_devices).
    pub(crate) fn pqm_uninit(&mut self, _scope: &NotifierScope) {
        let process = self.process;
        let st = &mut *self.state;
        for qid in std::mem::take(&mut st.pqm.queues).into_keys() {
            process.kfd.procfs.del_queue(process.lead_pid(), qid);
            st.pqm.slots.release(qid as usize);
        }
        for pdd in &mut st.pdds {
            pdd.qpd.queues.clear();
        }
    }
}

impl KfdProcess {
    /// Total SDMA activity of the process on `gpu_id`: the live counters of its SDMA
    /// queues plus those of queues already destroyed.
    ///
    /// The live counters sit in user memory and are read without holding the process
    /// lock. A queue destroyed in between has its counter folded into the past counter,
    /// so its sampled value is taken back out.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the process has no data for the device.
    pub fn sdma_activity(&self, gpu_id: GpuId) -> KfdResult<u64> {
        let missing = || KfdError::invalid(format!("process has no data for gpu {gpu_id}"));

        let sampled: Vec<(u32, u64)> = {
            let st = self.lock();
            let pdd = st.pdd(gpu_id).ok_or_else(missing)?;
            pdd.qpd
                .queues
                .iter()
                .filter(|q| q.queue_type.is_sdma())
                .map(|q| (q.queue_id, q.read_ptr))
                .collect()
        };

        let mm = self
            .lead_thread()
            .and_then(|t| t.mm().cloned())
            .filter(|mm| !mm.has_exited());
        let Some(mm) = mm else {
            return Ok(0);
        };

        let mut total: u64 = 0;
        let mut values = Vec::with_capacity(sampled.len());
        {
            let _map = mm.mmap_lock.read();
            for &(qid, read_ptr) in &sampled {
                match mm.read_u64(read_ptr + 8) {
                    Ok(v) => {
                        total = total.wrapping_add(v);
                        values.push(v);
                    }
                    Err(e) => {
                        debug!(qid, error = %e, "failed to read SDMA queue active counter");
                        values.push(0);
                    }
                }
            }
        }

        let st = self.lock();
        let pdd = st.pdd(gpu_id).ok_or_else(missing)?;
        total = total.wrapping_add(pdd.sdma_past_activity_counter);
        for (&(qid, read_ptr), &value) in sampled.iter().zip(&values) {
            let alive = pdd
                .qpd
                .queues
                .iter()
                .any(|q| q.queue_id == qid && q.read_ptr == read_ptr);
            if !alive {
                total = total.wrapping_sub(value);
            }
        }
        Ok(total)
    }
}
