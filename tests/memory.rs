mod common;

use common::{GPU0, GPU1, Harness, fast_config, user_process, wait_for};
use kfd_process::kfd::aperture::{KFD_CWSR_TBA_TMA_SIZE, KFD_CWSR_TMA_OFFSET, SVM_CWSR_BASE, SVM_IB_BASE};
use kfd_process::kfd::device::{DeviceProperties, SchedPolicy};
use kfd_process::kfd::doorbell::{KFD_DOORBELL_PROCESS_SLICE_SIZE, KFD_QUEUE_DOORBELL_MIRROR_OFFSET};
use kfd_process::kfd::ioctl::{
    AllocFlags, KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE, KFD_IOC_ALLOC_MEM_FLAGS_GTT, KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
    KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE, QueueType,
};
use kfd_process::kfd::qcm::{CwsrMemory, QueueProperties};
use kfd_process::process::{ProcessPhase, ProcessRef};
use kfd_process::{KfdError, ProcessConfig};
use std::time::{Duration, Instant};

const SETTLE: Duration = Duration::from_secs(3);
const VRAM: u32 = KFD_IOC_ALLOC_MEM_FLAGS_VRAM;

fn bound(h: &Harness, pid: i32) -> ProcessRef {
    let (task, _mm) = user_process(pid);
    let r = h.kfd.create_process(&task).unwrap();
    {
        let mut st = r.lock();
        for dev in h.kfd.devices() {
            st.bind_process_to_device(dev.gpu_id(), &task).unwrap();
        }
    }
    r
}

#[test]
fn vram_usage_follows_allocations() {
    let h = Harness::with_devices(ProcessConfig::new(), 1);
    let r = bound(&h, 10);
    let mut st = r.lock();

    let vram_flags = AllocFlags::new().vram().host_access().coherent().to_kfd_ioctl_flags();
    let vram = st.alloc_memory_of_gpu(GPU0, 0x10_0000, 0x2000, vram_flags).unwrap();
    let gtt = st
        .alloc_memory_of_gpu(GPU0, 0x20_0000, 0x1000, KFD_IOC_ALLOC_MEM_FLAGS_GTT)
        .unwrap();
    let doorbell = st
        .alloc_memory_of_gpu(GPU0, 0x30_0000, 0x1000, AllocFlags::new().doorbell().to_kfd_ioctl_flags())
        .unwrap();
    assert_eq!(st.pdd(GPU0).unwrap().vram_usage(), 0x2000);
    assert!(st.bos().find_bo(GPU0, vram).unwrap().mem_type.is_vram());
    assert!(!st.bos().find_bo(GPU0, doorbell).unwrap().mem_type.is_vram());
    assert!(h.gpuvm.alloc_flags.lock().contains(&(0x10_0000, vram_flags)));

    st.free_memory_of_gpu(GPU0, vram).unwrap();
    assert_eq!(st.pdd(GPU0).unwrap().vram_usage(), 0);
    assert!(st.bos().find_bo(GPU0, vram).is_none());
    assert!(st.bos().find_bo(GPU0, gtt).is_some());

    // The range now belongs to another buffer only after the first one is gone.
    assert!(matches!(
        st.alloc_memory_of_gpu(GPU0, 0x20_0800, 0x1000, VRAM),
        Err(KfdError::InvalidArgument(_))
    ));
    st.alloc_memory_of_gpu(GPU0, 0x10_0000, 0x1000, VRAM).unwrap();

    assert!(matches!(
        st.free_memory_of_gpu(GPU0, vram),
        Err(KfdError::InvalidArgument(_))
    ));
}

#[test]
fn allocation_needs_a_vm() {
    let h = Harness::with_devices(ProcessConfig::new(), 1);
    let (task, _mm) = user_process(15);
    let r = h.kfd.create_process(&task).unwrap();
    assert!(matches!(
        r.lock().alloc_memory_of_gpu(GPU0, 0x10_0000, 0x1000, VRAM),
        Err(KfdError::InvalidArgument(_))
    ));
}

#[test]
fn address_ranges_resolve_to_a_single_buffer() {
    let h = Harness::with_devices(ProcessConfig::new(), 1);
    let r = bound(&h, 20);
    let mut st = r.lock();
    let a = st.alloc_memory_of_gpu(GPU0, 0x10_0000, 0x2000, VRAM).unwrap();
    st.alloc_memory_of_gpu(GPU0, 0x10_2000, 0x1000, VRAM).unwrap();

    let bos = st.bos();
    assert_eq!(bos.find_bo_by_interval(0x10_0000, 0x10_0fff).unwrap().handle, a);
    assert!(matches!(
        bos.find_bo_by_interval(0x10_1000, 0x10_2fff),
        Err(KfdError::AmbiguousRange { .. })
    ));
    assert!(matches!(
        bos.find_bo_by_interval(0x0f_f000, 0x10_0fff),
        Err(KfdError::NotFound)
    ));
    assert!(matches!(
        bos.find_bo_by_interval(0x30_0000, 0x30_0fff),
        Err(KfdError::NotFound)
    ));
}

#[test]
fn mapping_flushes_each_target() {
    let h = Harness::with_devices(ProcessConfig::new(), 2);
    let r = bound(&h, 30);
    h.log.clear();

    let mut st = r.lock();
    let bo = st.alloc_memory_of_gpu(GPU0, 0x10_0000, 0x1000, VRAM).unwrap();
    st.map_memory_to_gpu(GPU0, bo, &[GPU0, GPU1]).unwrap();
    assert_eq!(h.log.count(&format!("map:{GPU0}")), 1);
    assert_eq!(h.log.count(&format!("map:{GPU1}")), 1);
    assert_eq!(h.log.count(&format!("flush_pasid:{}", r.pasid())), 2);

    st.unmap_memory_from_gpu(GPU0, bo, &[GPU1]).unwrap();
    assert_eq!(h.log.count(&format!("unmap:{GPU1}")), 1);
    assert!(st.map_memory_to_gpu(GPU0, bo + 100, &[GPU0]).is_err());
}

#[test]
fn mapping_to_a_device_without_vm_fails() {
    let h = Harness::with_devices(ProcessConfig::new(), 2);
    let (task, _mm) = user_process(35);
    let r = h.kfd.create_process(&task).unwrap();
    let mut st = r.lock();
    st.bind_process_to_device(GPU0, &task).unwrap();

    let bo = st.alloc_memory_of_gpu(GPU0, 0x10_0000, 0x1000, VRAM).unwrap();
    assert!(matches!(
        st.map_memory_to_gpu(GPU0, bo, &[GPU1]),
        Err(KfdError::InvalidArgument(_))
    ));
}

#[test]
fn tlb_flush_without_hws_waits_for_a_vmid() {
    let props = DeviceProperties {
        sched_policy: SchedPolicy::NoHws,
        ..DeviceProperties::default()
    };
    let h = Harness::new(ProcessConfig::new(), vec![props]);
    let (task, _mm) = user_process(40);
    let r = h.kfd.create_process(&task).unwrap();
    let mut st = r.lock();

    st.flush_tlb(GPU0).unwrap();
    assert_eq!(h.log.count("flush_"), 0);

    st.create_queue(GPU0, QueueProperties::new(QueueType::Compute, 0x1_0000, 0x1000))
        .unwrap();
    st.flush_tlb(GPU0).unwrap();
    assert_eq!(h.log.count("flush_vmid:8"), 1);
    assert!(st.flush_tlb(GPU1).is_err());
}

#[test]
fn release_frees_every_buffer() {
    let h = Harness::with_devices(ProcessConfig::new(), 2);
    let (task, mm) = user_process(50);
    let r = h.kfd.create_process(&task).unwrap();
    {
        let mut st = r.lock();
        st.bind_process_to_device(GPU0, &task).unwrap();
        st.bind_process_to_device(GPU1, &task).unwrap();
        let bo = st.alloc_memory_of_gpu(GPU0, 0x10_0000, 0x1000, VRAM).unwrap();
        st.map_memory_to_gpu(GPU0, bo, &[GPU0, GPU1]).unwrap();
        st.alloc_memory_of_gpu(GPU1, 0x20_0000, 0x1000, VRAM).unwrap();
    }
    assert_eq!(h.gpuvm.live_mems.lock().len(), 4);

    let p = r.arc().clone();
    drop(r);
    mm.exit();
    h.kfd.drain();
    assert!(wait_for(SETTLE, || p.phase() == ProcessPhase::Destroyed));

    assert!(h.gpuvm.live_mems.lock().is_empty());
    assert!(p.lock().bos().is_empty());
    assert!(h.log.count(&format!("unmap:{GPU1}")) >= 1);
}

#[test]
fn dgpu_gets_cwsr_area_in_its_vm() {
    let isa = vec![0xab; 16];
    let props = DeviceProperties {
        cwsr_enabled: true,
        cwsr_isa: isa.clone(),
        ..DeviceProperties::default()
    };
    let h = Harness::new(ProcessConfig::new(), vec![props]);
    let r = bound(&h, 60);

    let st = r.lock();
    let qpd = st.pdd(GPU0).unwrap().qpd();
    assert_eq!(qpd.cwsr_base, SVM_CWSR_BASE);
    assert_eq!(qpd.ib_base, SVM_IB_BASE);
    assert_eq!(qpd.tba_addr, SVM_CWSR_BASE);
    assert_eq!(qpd.tma_addr, SVM_CWSR_BASE + KFD_CWSR_TMA_OFFSET);
    assert!(qpd.ib_kaddr.is_some());
    let Some(CwsrMemory::Gpuvm { kaddr, .. }) = &qpd.cwsr else {
        panic!("no CWSR buffer");
    };
    assert!(h.gpuvm.kernel_writes.lock().contains(&(*kaddr, isa)));

    let flags = h.gpuvm.alloc_flags.lock().clone();
    let (_, cwsr_flags) = flags.iter().find(|(va, _)| *va == SVM_CWSR_BASE).unwrap();
    assert_eq!(cwsr_flags & KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE, 0);
    assert_ne!(cwsr_flags & KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE, 0);
    assert_eq!(
        h.log.find("alloc:").unwrap(),
        format!("alloc:{GPU0}:0x{SVM_IB_BASE:x}:0x1000")
    );
}

#[test]
fn apu_cwsr_area_is_mapped_once() {
    let props = DeviceProperties {
        dgpu: false,
        cwsr_enabled: true,
        cwsr_isa: vec![1, 2, 3],
        ..DeviceProperties::default()
    };
    let h = Harness::new(ProcessConfig::new(), vec![props]);
    let (task, _mm) = user_process(70);
    let r = h.kfd.create_process(&task).unwrap();

    let mut st = r.lock();
    st.init_cwsr_apu().unwrap();
    assert!(st.has_cwsr());
    let qpd = st.pdd(GPU0).unwrap().qpd();
    let tba = qpd.tba_addr;
    assert_ne!(tba, 0);
    assert_eq!(qpd.tma_addr, tba + KFD_CWSR_TMA_OFFSET);
    let Some(CwsrMemory::Pages(pages)) = &qpd.cwsr else {
        panic!("no CWSR pages");
    };
    assert_eq!(pages.len() as u64, KFD_CWSR_TBA_TMA_SIZE);
    assert_eq!(&pages[..4], &[1, 2, 3, 0]);

    st.init_cwsr_apu().unwrap();
    assert_eq!(st.pdd(GPU0).unwrap().qpd().tba_addr, tba);
}

#[test]
fn reserved_mapping_must_match_area_size() {
    let h = Harness::with_devices(ProcessConfig::new(), 1);
    let (task, _mm) = user_process(75);
    let r = h.kfd.create_process(&task).unwrap();
    let mut st = r.lock();

    assert!(matches!(
        st.reserved_mem_mmap(GPU0, 4096),
        Err(KfdError::InvalidArgument(_))
    ));
    st.reserved_mem_mmap(GPU0, KFD_CWSR_TBA_TMA_SIZE).unwrap();
    assert!(matches!(
        st.pdd(GPU0).unwrap().qpd().cwsr,
        Some(CwsrMemory::Pages(_))
    ));
}

#[test]
fn reserved_doorbells_are_masked() {
    let props = DeviceProperties {
        non_cp_doorbells_start: 0x10,
        non_cp_doorbells_end: 0x1f,
        doorbell_slices: 64,
        ..DeviceProperties::default()
    };
    let h = Harness::new(ProcessConfig::new(), vec![props]);
    let (task, _mm) = user_process(80);
    let r = h.kfd.create_process(&task).unwrap();

    let st = r.lock();
    let pdd = st.pdd(GPU0).unwrap();
    assert!(pdd.doorbell_index() < 64);
    assert_eq!(
        pdd.doorbell_offset(),
        u64::from(pdd.doorbell_index()) * KFD_DOORBELL_PROCESS_SLICE_SIZE
    );
    let bitmap = pdd.qpd().doorbell_bitmap.as_ref().unwrap();
    for i in 0x10..=0x1f {
        assert!(bitmap.test_bit(i));
        assert!(bitmap.test_bit(i + KFD_QUEUE_DOORBELL_MIRROR_OFFSET));
    }
    assert!(!bitmap.test_bit(0x0f));
    assert!(!bitmap.test_bit(0x20));
    assert_eq!(bitmap.count_ones(), 32);
}

#[test]
fn queue_ids_are_process_wide() {
    let h = Harness::with_devices(ProcessConfig::new(), 2);
    let (task, _mm) = user_process(85);
    let r = h.kfd.create_process(&task).unwrap();
    let mut st = r.lock();

    let compute = QueueProperties::new(QueueType::Compute, 0x1_0000, 0x1000);
    let q0 = st.create_queue(GPU0, compute.clone()).unwrap();
    let q1 = st.create_queue(GPU1, compute.clone()).unwrap();
    assert_ne!(q0, q1);
    assert_eq!(st.queue_count(), 2);
    assert_eq!(st.pdd(GPU1).unwrap().qpd().queue_count(), 1);

    st.destroy_queue(q0).unwrap();
    assert!(matches!(st.destroy_queue(q0), Err(KfdError::InvalidArgument(_))));
    assert_eq!(st.create_queue(GPU0, compute.clone()).unwrap(), q0);
    assert!(st.create_queue(0xdead, compute).is_err());
}

#[test]
fn end_to_end_eviction_cycle() {
    let props = DeviceProperties {
        doorbell_slices: 64,
        ..DeviceProperties::default()
    };
    let config = fast_config().restore_time(Duration::from_millis(50));
    let h = Harness::new(config, vec![props]);
    for _ in 0..4 {
        h.kfd.pasid_allocator().alloc().unwrap();
    }

    let (task, mm) = user_process(90);
    let r = h.kfd.create_process(&task).unwrap();
    assert_eq!(r.pasid(), 5);
    assert!(r.lock().pdd(GPU0).unwrap().doorbell_index() < 64);

    r.lock().bind_process_to_device(GPU0, &task).unwrap();
    r.lock()
        .create_queue(GPU0, QueueProperties::new(QueueType::ComputeAql, 0x1_0000, 0x1000))
        .unwrap();
    let fence = r.eviction_fence().unwrap();

    let t0 = Instant::now();
    h.kfd.schedule_evict_and_restore(&mm, &fence).unwrap();
    assert!(fence.wait_timeout(SETTLE));
    assert!(wait_for(SETTLE, || h.gpuvm.restore_calls() == 1
        && h.dqms[0].depth(5) == 0));

    let restore_started = h.gpuvm.restore_spans.lock()[0].start;
    assert!(restore_started >= t0 + config.restore_time);
    let fresh = r.eviction_fence().unwrap();
    assert_ne!(fresh.seqno(), fence.seqno());
    assert!(!fresh.is_signaled());
    assert_eq!(r.lock().queue_count(), 1);

    let p = r.arc().clone();
    drop(r);
    mm.exit();
    h.kfd.drain();
    assert!(wait_for(SETTLE, || p.phase() == ProcessPhase::Destroyed));
    assert_eq!(h.kfd.pasid_allocator().in_use(), 4);
    assert_eq!(h.device(GPU0).doorbells().in_use(), 0);
}
