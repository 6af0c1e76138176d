// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The arena-backed device tree and its query surface.
//!
//! [`DeviceTree::parse`] decodes the structure block of a blob in a single
//! pass, after a pre-pass census has sized the arenas. Node names and
//! property payloads are borrowed from the blob, so the blob must outlive
//! the tree. Lookups hand out [`Node`] / [`Property`] views; the mutation
//! API (behind the `write` feature) works on the underlying [`NodeId`] /
//! [`PropId`] indices instead.

use alloc::borrow::Cow;
use alloc::vec::Vec;
use core::fmt;

use log::{error, warn};

use crate::arena::{Arena, NodeId, NodeRecord, PropId, PropRecord};
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::fdt::{
    self, Fdt, FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_NOP, FDT_PROP, FDT_TAGSIZE,
};
use crate::memreserve::MemoryReservation;
use crate::node::Node;
use crate::property::Property;
use crate::writer;

/// A device tree decoded into node and property arenas.
pub struct DeviceTree<'blob> {
    pub(crate) arena: Arena<'blob>,
    pub(crate) root: Option<NodeId>,
    /// The memory reservations of this device tree.
    pub memory_reservations: Vec<MemoryReservation>,
    pub(crate) writable: bool,
}

impl<'blob> DeviceTree<'blob> {
    /// Parses the given blob with the default [`Config`].
    pub fn parse(blob: &'blob [u8]) -> Result<Self, Error> {
        Self::parse_with_config(blob, Config::default())
    }

    /// Parses the given blob.
    ///
    /// The config is sanitised first, so flags unknown to the caller's
    /// config version are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed header (bad magic, version below
    /// 16, sizes that do not fit the blob) or a structurally broken
    /// structure block. No tree is produced in that case.
    pub fn parse_with_config(blob: &'blob [u8], config: Config) -> Result<Self, Error> {
        let fdt = Fdt::new(blob)?;
        Self::from_fdt_with_config(&fdt, config)
    }

    /// Builds a tree from an already validated [`Fdt`] view.
    pub fn from_fdt(fdt: &Fdt<'blob>) -> Result<Self, Error> {
        Self::from_fdt_with_config(fdt, Config::default())
    }

    /// Builds a tree from an already validated [`Fdt`] view, with the given
    /// config.
    pub fn from_fdt_with_config(fdt: &Fdt<'blob>, config: Config) -> Result<Self, Error> {
        let config = config.sanitised();
        let structs = fdt.struct_block()?;
        let mut builder = TreeBuilder {
            fdt,
            structs,
            base: fdt.struct_base(),
            arena: Arena::with_census(fdt::token_census(structs)),
        };

        // Every BEGIN_NODE at top level starts a root-level sibling.
        // Conformant blobs contain exactly one.
        let mut root = None;
        let mut last_root: Option<NodeId> = None;
        let mut offset = 0;
        while offset < structs.len() {
            match builder.read_cell(offset)? {
                FDT_BEGIN_NODE => {
                    let node = builder.parse_node(&mut offset, None)?;
                    if root.is_some() {
                        warn!("blob contains more than one top-level node");
                    }
                    match last_root {
                        Some(prev) => builder.arena.node_mut(prev).next_sibling = Some(node),
                        None => root = Some(node),
                    }
                    last_root = Some(node);
                }
                FDT_END => break,
                FDT_NOP => offset += FDT_TAGSIZE,
                other => {
                    warn!("skipping unexpected cell 0x{other:x} at top level");
                    offset += FDT_TAGSIZE;
                }
            }
        }

        Ok(DeviceTree {
            arena: builder.arena,
            root,
            memory_reservations: fdt.memory_reservations().collect(),
            writable: config.writable,
        })
    }

    /// Returns the root node, if the tree has any nodes at all.
    pub fn root(&self) -> Option<Node<'_, 'blob>> {
        self.root.map(|id| self.node_ref(id))
    }

    /// Whether this tree accepts mutation, as configured at parse time.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns a [`Node`] view for an id previously obtained from this tree.
    pub fn node(&self, id: NodeId) -> Option<Node<'_, 'blob>> {
        (id.index() < self.arena.node_count()).then(|| self.node_ref(id))
    }

    /// Finds a node by its path.
    ///
    /// Leading and repeated slashes are collapsed, and an empty trailing
    /// segment resolves to the node reached so far, so `find("/")` is the
    /// root. Each segment is compared against the part of a child's name
    /// before any `@` unit-address separator: `find("/soc/uart")` matches
    /// `uart@10000000`. Use [`Node::child`] for full-name matching.
    pub fn find(&self, path: &str) -> Option<Node<'_, 'blob>> {
        let mut node = self.root?;
        let mut rest = path;
        loop {
            rest = rest.trim_start_matches('/');
            if rest.is_empty() {
                return Some(self.node_ref(node));
            }
            let (segment, tail) = match rest.find('/') {
                Some(i) => rest.split_at(i),
                None => (rest, ""),
            };
            node = self.child_by_base_name(node, segment)?;
            rest = tail;
        }
    }

    /// Finds the next node whose `compatible` list contains `compat`.
    ///
    /// The scan runs over the node arena in allocation order, starting
    /// after `after` (or from the beginning when `after` is `None`), so
    /// repeated calls enumerate every match exactly once.
    pub fn find_compatible(&self, after: Option<NodeId>, compat: &str) -> Option<Node<'_, 'blob>> {
        let start = after.map_or(0, |id| id.index() + 1);
        (start..self.arena.node_count())
            .map(NodeId::new)
            .find(|&id| self.node_ref(id).is_compatible(compat))
            .map(|id| self.node_ref(id))
    }

    /// Resolves a phandle to its node.
    ///
    /// Phandles recorded during parsing resolve through the index in O(1).
    /// Anything else (values beyond the index capacity, or phandle
    /// properties written after parsing) falls back to a linear scan.
    pub fn find_phandle(&self, handle: u32) -> Option<Node<'_, 'blob>> {
        if let Some(id) = self.arena.phandle_slot(handle) {
            return Some(self.node_ref(id));
        }
        (0..self.arena.node_count())
            .map(NodeId::new)
            .find(|&id| {
                let node = self.node_ref(id);
                ["phandle", "linux,phandle"].iter().any(|&name| {
                    node.property(name).and_then(|p| p.as_u32().ok()) == Some(handle)
                })
            })
            .map(|id| self.node_ref(id))
    }

    /// Number of bytes [`Self::flatten_into`] requires.
    pub fn flattened_size(&self) -> usize {
        writer::flattened_size(self)
    }

    /// Flattens the tree into `buffer` and returns the number of bytes
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BufferTooSmall`] (carrying the required size)
    /// when the buffer cannot hold the flattened tree, and
    /// [`ErrorKind::BufferMisaligned`] when it does not start on a 32-bit
    /// boundary. Nothing is written in either case.
    pub fn flatten_into(&self, buffer: &mut [u8], boot_cpu_id: u32) -> Result<usize, Error> {
        writer::flatten_into(self, buffer, boot_cpu_id)
    }

    /// Flattens the tree into a freshly allocated blob.
    pub fn to_dtb(&self, boot_cpu_id: u32) -> Vec<u8> {
        writer::to_dtb(self, boot_cpu_id)
    }

    pub(crate) fn node_ref(&self, id: NodeId) -> Node<'_, 'blob> {
        Node { tree: self, id }
    }

    pub(crate) fn prop_ref(&self, id: PropId) -> Property<'_, 'blob> {
        Property { tree: self, id }
    }

    /// Finds a direct child whose name up to any `@` separator equals
    /// `segment` (exact length on the compared part).
    pub(crate) fn child_by_base_name(&self, parent: NodeId, segment: &str) -> Option<NodeId> {
        let mut next = self.arena.node(parent).first_child;
        while let Some(id) = next {
            let record = self.arena.node(id);
            let name = record.name.as_deref().unwrap_or("");
            let base = match name.find('@') {
                Some(at) => &name[..at],
                None => name,
            };
            if base == segment {
                return Some(id);
            }
            next = record.next_sibling;
        }
        None
    }
}

impl fmt::Display for DeviceTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "/dts-v1/;")?;
        for reservation in &self.memory_reservations {
            writeln!(
                f,
                "/memreserve/ 0x{:x} 0x{:x};",
                reservation.address(),
                reservation.size()
            )?;
        }
        writeln!(f)?;
        let mut next = self.root;
        while let Some(id) = next {
            self.node_ref(id).fmt_recursive(f, 0)?;
            next = self.arena.node(id).next_sibling;
        }
        Ok(())
    }
}

struct TreeBuilder<'f, 'blob> {
    fdt: &'f Fdt<'blob>,
    structs: &'blob [u8],
    /// Byte offset of the structure block within the blob, for error
    /// reporting.
    base: usize,
    arena: Arena<'blob>,
}

impl<'f, 'blob> TreeBuilder<'f, 'blob> {
    fn read_cell(&self, offset: usize) -> Result<u32, Error> {
        fdt::read_u32(self.structs, offset)
            .map_err(|_| Error::new(ErrorKind::InvalidLength, self.base + offset))
    }

    /// Parses one node. `offset` must point at its `BEGIN_NODE` token and
    /// is left one past the matching `END_NODE`.
    fn parse_node(&mut self, offset: &mut usize, parent: Option<NodeId>) -> Result<NodeId, Error> {
        let node_start = *offset;
        *offset += FDT_TAGSIZE;

        let name = fdt::string_at(self.structs, *offset)
            .map_err(|_| Error::new(ErrorKind::InvalidString, self.base + *offset))?;
        *offset = Fdt::align_tag_offset(*offset + name.len() + 1);
        // An empty name marks a synthetic root.
        let name = (!name.is_empty()).then(|| Cow::Borrowed(name));

        let id = self.arena.alloc_node(NodeRecord::new(name, parent));
        let mut last_child: Option<NodeId> = None;
        let mut last_prop: Option<PropId> = None;

        while *offset < self.structs.len() {
            match self.read_cell(*offset)? {
                FDT_END_NODE => {
                    *offset += FDT_TAGSIZE;
                    return Ok(id);
                }
                FDT_BEGIN_NODE => {
                    let child = self.parse_node(offset, Some(id))?;
                    match last_child {
                        Some(prev) => self.arena.node_mut(prev).next_sibling = Some(child),
                        None => self.arena.node_mut(id).first_child = Some(child),
                    }
                    last_child = Some(child);
                }
                FDT_PROP => {
                    let prop = self.parse_prop(offset)?;
                    match last_prop {
                        Some(prev) => self.arena.prop_mut(prev).next = Some(prop),
                        None => self.arena.node_mut(id).first_prop = Some(prop),
                    }
                    last_prop = Some(prop);
                    self.check_special_prop(id, prop);
                }
                // NOP, and anything unexpected, costs one cell.
                _ => *offset += FDT_TAGSIZE,
            }
        }

        error!(
            "node at offset {} is missing its terminating tag",
            self.base + node_start
        );
        Err(Error::new(
            ErrorKind::UnterminatedNode,
            self.base + node_start,
        ))
    }

    /// Parses one property. `offset` must point at its `PROP` token and is
    /// left at the next aligned cell after the payload.
    fn parse_prop(&mut self, offset: &mut usize) -> Result<PropId, Error> {
        *offset += FDT_TAGSIZE;
        let length = self.read_cell(*offset)? as usize;
        let name_offset = self.read_cell(*offset + FDT_TAGSIZE)? as usize;
        let payload_start = *offset + 2 * FDT_TAGSIZE;

        let value = self
            .structs
            .get(payload_start..payload_start + length)
            .ok_or(Error::new(
                ErrorKind::InvalidLength,
                self.base + payload_start,
            ))?;
        let name = self.fdt.string(name_offset)?;
        *offset = Fdt::align_tag_offset(payload_start + length);

        Ok(self.arena.alloc_prop(PropRecord {
            name: Cow::Borrowed(name),
            value: Cow::Borrowed(value),
            next: None,
        }))
    }

    /// Records the owning node in the phandle index when the new property
    /// is `phandle` or `linux,phandle`.
    fn check_special_prop(&mut self, node: NodeId, prop: PropId) {
        let record = self.arena.prop(prop);
        if record.name != "phandle" && record.name != "linux,phandle" {
            return;
        }
        let Ok(cell) = <[u8; 4]>::try_from(&*record.value) else {
            warn!("ignoring {} property with a non-cell payload", record.name);
            return;
        };
        let handle = u32::from_be_bytes(cell);
        if !self.arena.record_phandle(handle, node) {
            warn!("phandle 0x{handle:x} exceeds the index, lookups fall back to scanning");
        }
    }
}
