//! Nested VMX emulation and HVM state save/restore.
//!
//! A guest hypervisor (L1) runs on a virtual CPU that exposes VMX. Its VMX
//! instructions, VMX capability MSR reads and the exits of its own guest (L2) are
//! emulated against a virtual VMCS kept in L1 memory. The snapshot codec saves
//! and restores the per-vCPU state through a registry of typed record handlers.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate static_assertions;

extern crate alloc;

pub mod config;
pub mod domain;
pub mod error;
pub mod intel;
pub mod save;
