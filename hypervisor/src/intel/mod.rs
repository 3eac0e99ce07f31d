//! Nested VMX emulation for Intel VT-x.

pub mod events;
pub mod instruction;
pub mod memory;
pub mod nested;
pub mod registers;
pub mod vcpu;
pub mod vmerror;
pub mod vmexit;
pub mod vvmcs;
