// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Arena-backed parsing, editing and serialization of [Flattened Device
//! Tree (FDT)] blobs.
//!
//! [`Fdt`] is a zero-copy view of a DTB blob that validates the header and
//! exposes the raw blocks. [`DeviceTree::parse`] walks the structure block
//! once and builds the whole tree into two bump arenas (one for nodes, one
//! for properties) sized by a pre-pass over the token stream, together with
//! a phandle lookup index. Node names and property payloads stay borrowed
//! from the blob; the tree only owns data created through the mutation API
//! (behind the `write` feature).
//!
//! The tree can be flattened back into a spec-conformant blob with
//! [`DeviceTree::flatten_into`] or [`DeviceTree::to_dtb`].
//!
//! [Flattened Device Tree (FDT)]: https://devicetree-specification.readthedocs.io/en/latest/chapter5-flattened-format.html

#![no_std]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

pub type Result<T> = core::result::Result<T, Error>;

mod arena;
pub mod config;
pub mod error;
pub mod fdt;
pub mod memreserve;
#[cfg(feature = "write")]
#[cfg_attr(docsrs, doc(cfg(feature = "write")))]
mod mutate;
pub mod node;
pub mod property;
pub mod tree;
mod writer;

pub use arena::{NodeId, PropId};
pub use config::Config;
pub use error::{Error, ErrorKind};
pub use fdt::Fdt;
pub use memreserve::MemoryReservation;
pub use node::{Node, NodeStat};
pub use property::Property;
pub use tree::DeviceTree;
