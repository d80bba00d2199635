#![cfg_attr(not(test), no_std)]

#![feature(abi_x86_interrupt)]
#![feature(ptr_to_from_bits)]

extern crate alloc;

pub mod cfg;
pub mod cpu;
pub mod dispatch;
pub mod handoff;
pub mod memmap;
pub mod mutator;
pub mod out;
pub mod pagetable;
pub mod palloc;
pub mod tables;

