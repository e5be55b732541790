//! Core value types of the pagestore storage engine.
//!
//! This crate defines the block-addressing scheme, the on-disk page header layout and the
//! recovery log group flags in a backend-agnostic manner. None of these types perform I/O.
//!
//! The types of this crate do not require the standard library, but do require Rust's alloc
//! crate.

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod block_addr;
pub mod group;
pub mod page;

pub use block_addr::VirtualBlockAddr;
pub use group::GroupTag;
pub use page::{PageHeader, HEADER_SIZE};
