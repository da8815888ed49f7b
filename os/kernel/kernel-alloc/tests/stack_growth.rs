mod common;

use common::{boot, boot_with, page, va};
use kernel_alloc::{
    CloneMode, FaultHandlerFn, FaultKind, FaultResolution, InterruptRegistry, Pid, ProcessTable,
    ProcessVm, VmmConfig, install_fault_handler,
};
use kernel_info::memory::PAGE_FAULT_VECTOR;
use kernel_vmem::PageFault;
use kernel_vmem::sim::Mode;

/// Lowest page of the initial stack.
const STACK: u32 = 0xBFF0_0000;

fn with_stack(vmm: &mut kernel_alloc::Vmm<kernel_vmem::sim::SimMachine>) -> ProcessVm {
    let mut p = ProcessVm::new(7, vmm.initial_space(), page(STACK));
    vmm.pgalloc_fixed(page(STACK), 1, Some(p.space.registry_mut()))
        .unwrap();
    p
}

#[test]
fn fault_below_the_boundary_grows_the_stack() {
    let mut vmm = boot();
    let mut p = with_stack(&mut vmm);
    let target = page(STACK) - 3;

    let fault = vmm
        .platform()
        .write_u8(target.base() + 0x10, 1, Mode::User)
        .unwrap_err();
    assert!(!fault.error.present());

    assert_eq!(
        vmm.handle_page_fault(Some(&mut p), fault),
        Ok(FaultResolution::StackGrown { pages: 3 })
    );
    assert_eq!(p.user_stack_boundary, target);
    assert_eq!(p.space.registry().len(), 4);
    for i in 0..3 {
        assert!(vmm.translate_page(target + i).is_some());
    }
    assert!(vmm.platform().write_u8(target.base() + 0x10, 1, Mode::User).is_ok());
}

#[test]
fn fault_beyond_the_window_is_fatal_and_allocates_nothing() {
    let mut vmm = boot();
    let mut p = with_stack(&mut vmm);
    let frames = vmm.free_frames();
    let ranges = vmm.free_ranges(kernel_alloc::Area::User);

    let far = page(STACK) - 1025;
    let fault = vmm.platform().read_u8(far.base(), Mode::User).unwrap_err();
    let fatal = vmm.handle_page_fault(Some(&mut p), fault).unwrap_err();

    assert_eq!(fatal.kind, FaultKind::NotPresent);
    assert_eq!(vmm.free_frames(), frames);
    assert_eq!(vmm.free_ranges(kernel_alloc::Area::User), ranges);
    assert_eq!(p.user_stack_boundary, page(STACK));
}

#[test]
fn the_window_is_inclusive_and_configurable() {
    let mut vmm = boot_with(VmmConfig {
        stack_growth_max_pages: 4,
        ..VmmConfig::default()
    });
    let mut p = with_stack(&mut vmm);

    let fault = vmm
        .platform()
        .read_u8((page(STACK) - 5).base(), Mode::User)
        .unwrap_err();
    assert!(vmm.handle_page_fault(Some(&mut p), fault).is_err());

    let fault = vmm
        .platform()
        .read_u8((page(STACK) - 4).base(), Mode::User)
        .unwrap_err();
    assert_eq!(
        vmm.handle_page_fault(Some(&mut p), fault),
        Ok(FaultResolution::StackGrown { pages: 4 })
    );
}

#[test]
fn growth_into_used_memory_is_fatal() {
    let mut vmm = boot();
    let mut p = with_stack(&mut vmm);
    // Something else already lives two pages below the stack.
    vmm.pgalloc_fixed(page(STACK) - 2, 1, None).unwrap();
    let frames = vmm.free_frames();

    let fault = vmm
        .platform()
        .read_u8((page(STACK) - 3).base(), Mode::User)
        .unwrap_err();
    let fatal = vmm.handle_page_fault(Some(&mut p), fault).unwrap_err();
    assert_eq!(fatal.kind, FaultKind::StackGrowth);
    assert_eq!(p.user_stack_boundary, page(STACK));
    assert_eq!(vmm.free_frames(), frames);
    assert_eq!(vmm.translate_page(page(STACK) - 3), None);
}

#[test]
fn parent_and_child_both_grow_after_a_fork() {
    let mut vmm = boot();
    let mut a = with_stack(&mut vmm);
    let mut b = ProcessVm::new(
        8,
        vmm.clone_address_space(&a.space, CloneMode::CopyOnWrite)
            .unwrap(),
        a.user_stack_boundary,
    );
    let below = page(STACK) - 1;

    vmm.switch_to(&b.space);
    let fault = vmm
        .platform()
        .read_u8(below.base(), Mode::User)
        .unwrap_err();
    assert_eq!(
        vmm.handle_page_fault(Some(&mut b), fault),
        Ok(FaultResolution::StackGrown { pages: 1 })
    );
    let in_b = vmm.translate_page(below).unwrap();

    vmm.switch_to(&a.space);
    let fault = vmm
        .platform()
        .read_u8(below.base(), Mode::User)
        .unwrap_err();
    assert_eq!(
        vmm.handle_page_fault(Some(&mut a), fault),
        Ok(FaultResolution::StackGrown { pages: 1 })
    );
    let in_a = vmm.translate_page(below).unwrap();

    assert_ne!(in_a, in_b);
    assert_eq!(a.user_stack_boundary, below);
    assert_eq!(b.user_stack_boundary, below);
    assert_eq!(a.space.registry().get(below).unwrap().ref_count(), 1);
    assert_eq!(b.space.registry().get(below).unwrap().physical_page(), in_b);
}

#[test]
fn a_reserved_but_unmapped_window_is_still_growable() {
    let mut vmm = boot();
    let mut p = with_stack(&mut vmm);
    vmm.pgalloc_fixed(page(STACK) - 2, 2, None).unwrap();
    vmm.unmap_range(page(STACK) - 2, 2).unwrap();
    let ranges = vmm.free_ranges(kernel_alloc::Area::User);

    let fault = vmm
        .platform()
        .read_u8((page(STACK) - 2).base(), Mode::User)
        .unwrap_err();
    assert_eq!(
        vmm.handle_page_fault(Some(&mut p), fault),
        Ok(FaultResolution::StackGrown { pages: 2 })
    );
    assert_eq!(vmm.free_ranges(kernel_alloc::Area::User), ranges);
}

#[test]
fn faults_above_the_boundary_are_fatal() {
    let mut vmm = boot();
    let mut p = with_stack(&mut vmm);
    let fault = vmm
        .platform()
        .read_u8(va(0x0200_0000), Mode::User)
        .unwrap_err();
    assert_eq!(
        vmm.handle_page_fault(Some(&mut p), fault).unwrap_err().kind,
        FaultKind::NotPresent
    );
}

struct Table(Vec<ProcessVm>, Option<Pid>);

impl ProcessTable for Table {
    fn current_id(&self) -> Option<Pid> {
        self.1
    }

    fn get_mut(&mut self, id: Pid) -> Option<&mut ProcessVm> {
        self.0.iter_mut().find(|p| p.id == id)
    }
}

#[test]
fn entry_point_resolves_for_the_current_process() {
    let mut vmm = boot();
    let p = with_stack(&mut vmm);
    let mut table = Table(vec![p], Some(7));

    let fault = vmm
        .platform()
        .write_u8((page(STACK) - 1).base(), 1, Mode::User)
        .unwrap_err();
    assert_eq!(
        vmm.on_page_fault(&mut table, fault),
        FaultResolution::StackGrown { pages: 1 }
    );
    assert_eq!(table.0[0].user_stack_boundary, page(STACK) - 1);
}

#[test]
#[should_panic(expected = "unhandled page fault")]
fn entry_point_halts_on_fatal_faults() {
    let mut vmm = boot();
    let p = with_stack(&mut vmm);
    let mut table = Table(vec![p], Some(7));
    let fault = vmm
        .platform()
        .read_u8(va(0x0200_0000), Mode::User)
        .unwrap_err();
    vmm.on_page_fault(&mut table, fault);
}

#[derive(Default)]
struct Vectors(Vec<(u8, FaultHandlerFn)>);

impl InterruptRegistry for Vectors {
    fn register(&mut self, vector: u8, handler: FaultHandlerFn) {
        self.0.push((vector, handler));
    }
}

fn ignore(_: PageFault) {}

#[test]
fn handler_goes_on_the_page_fault_vector() {
    let mut vectors = Vectors::default();
    install_fault_handler(&mut vectors, ignore);
    assert_eq!(vectors.0.len(), 1);
    assert_eq!(vectors.0[0].0, PAGE_FAULT_VECTOR);
    assert_eq!(PAGE_FAULT_VECTOR, 14);
}
