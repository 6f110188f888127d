//! Broken invariants must abort the process with a diagnostic.
//!
//! Each test re-runs this binary filtered to itself with `CHILD_ENV` set;
//! the child performs the fatal operation and the parent checks how it died.

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

use vcpu_sync::{
    fatal, NodeTranslator, PageTableNode, PhysicalRegion, PhysicalRegions, PhysicalTranslator,
    PAGE_SIZE,
};
use vm_memory::GuestAddress;

const CHILD_ENV: &str = "VCPU_SYNC_FATAL_CHILD";

fn in_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

fn run_child(test: &str) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap()
}

fn assert_aborted(output: &Output, message: &str) {
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "child status: {:?}",
        output.status
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(message), "stderr: {stderr}");
}

#[test]
fn untranslatable_node_aborts() {
    if in_child() {
        let mapped = PageTableNode::new();
        let stray = Box::new(PageTableNode::new());
        let map = PhysicalRegions::new(vec![PhysicalRegion::new(
            &mapped as *const PageTableNode as usize,
            GuestAddress(0x1000),
            PAGE_SIZE,
        )])
        .unwrap();

        NodeTranslator::new(&map).translate_to_physical(&stray);
        unreachable!("translation of an unmapped node returned");
    }

    let output = run_child("untranslatable_node_aborts");
    assert_aborted(&output, "unable to translate page table node");
}

#[test]
fn short_backing_aborts() {
    if in_child() {
        let node = Box::new(PageTableNode::new());
        let map = PhysicalRegions::new(vec![PhysicalRegion::new(
            &*node as *const PageTableNode as usize,
            GuestAddress(0x1000),
            PAGE_SIZE / 2,
        )])
        .unwrap();

        NodeTranslator::new(&map).translate_to_physical(&node);
        unreachable!("translation of a half-backed node returned");
    }

    let output = run_child("short_backing_aborts");
    assert_aborted(&output, "unable to translate page table node");
}

#[test]
fn signal_safe_throw_aborts() {
    if in_child() {
        fatal::throw("futex wake error");
    }

    let output = run_child("signal_safe_throw_aborts");
    assert_aborted(&output, "fatal error: futex wake error");
}
