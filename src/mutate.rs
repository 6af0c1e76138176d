// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The mutation API, behind the `write` feature.
//!
//! Created names and written payloads are owned by the tree and dropped
//! with it; everything parsed from the blob stays borrowed. Destroying a
//! node or property only unlinks it, the record stays in its arena until
//! the tree is dropped.

use alloc::borrow::{Cow, ToOwned};
use alloc::vec::Vec;

use crate::arena::{Arena, NodeId, NodeRecord, PropId, PropRecord};
use crate::error::{Error, ErrorKind};
use crate::fdt::TokenCensus;
use crate::tree::DeviceTree;

// TODO: reject characters outside the node-name set of the devicetree spec
// in create_child/create_sibling.

impl<'blob> DeviceTree<'blob> {
    /// Creates an empty, writable tree holding only a synthetic root.
    #[must_use]
    pub fn new_empty() -> Self {
        let mut arena = Arena::with_census(TokenCensus { nodes: 0, props: 0 });
        let root = arena.alloc_node(NodeRecord::new(None, None));
        DeviceTree {
            arena,
            root: Some(root),
            memory_reservations: Vec::new(),
            writable: true,
        }
    }

    /// Creates a child of `parent` and appends it to the child list.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::NameInUse`] when a child of that name
    /// already exists, [`ErrorKind::InvalidName`] for an empty name, and
    /// [`ErrorKind::ReadOnly`] on a non-writable tree.
    pub fn create_child(&mut self, parent: NodeId, name: &str) -> Result<NodeId, Error> {
        self.ensure_writable()?;
        self.checked_node(parent)?;
        check_name(name)?;
        let mut tail = None;
        let mut next = self.arena.node(parent).first_child;
        while let Some(id) = next {
            let record = self.arena.node(id);
            if record.name.as_deref() == Some(name) {
                return Err(Error::new(ErrorKind::NameInUse, 0));
            }
            tail = Some(id);
            next = record.next_sibling;
        }

        let child = self
            .arena
            .alloc_node(NodeRecord::new(Some(Cow::Owned(name.to_owned())), Some(parent)));
        match tail {
            Some(prev) => self.arena.node_mut(prev).next_sibling = Some(child),
            None => self.arena.node_mut(parent).first_child = Some(child),
        }
        Ok(child)
    }

    /// Creates a sibling of `node` and inserts it right after `node` in
    /// the list.
    ///
    /// # Errors
    ///
    /// As [`Self::create_child`], with uniqueness checked against the
    /// whole list `node` belongs to (the parent's children, or the
    /// top-level chain for a root).
    pub fn create_sibling(&mut self, node: NodeId, name: &str) -> Result<NodeId, Error> {
        self.ensure_writable()?;
        self.checked_node(node)?;
        check_name(name)?;
        let parent = self.arena.node(node).parent;
        let mut next = match parent {
            Some(parent) => self.arena.node(parent).first_child,
            None => self.root,
        };
        while let Some(id) = next {
            let record = self.arena.node(id);
            if record.name.as_deref() == Some(name) {
                return Err(Error::new(ErrorKind::NameInUse, 0));
            }
            next = record.next_sibling;
        }

        let sibling = self
            .arena
            .alloc_node(NodeRecord::new(Some(Cow::Owned(name.to_owned())), parent));
        let after = self.arena.node(node).next_sibling;
        self.arena.node_mut(sibling).next_sibling = after;
        self.arena.node_mut(node).next_sibling = Some(sibling);
        Ok(sibling)
    }

    /// Creates a property with an empty payload and appends it to the
    /// property list of `node`.
    pub fn create_prop(&mut self, node: NodeId, name: &str) -> Result<PropId, Error> {
        self.ensure_writable()?;
        self.checked_node(node)?;
        check_name(name)?;
        let prop = self.arena.alloc_prop(PropRecord {
            name: Cow::Owned(name.to_owned()),
            value: Cow::Owned(Vec::new()),
            next: None,
        });

        let mut tail = None;
        let mut next = self.arena.node(node).first_prop;
        while let Some(id) = next {
            tail = Some(id);
            next = self.arena.prop(id).next;
        }
        match tail {
            Some(prev) => self.arena.prop_mut(prev).next = Some(prop),
            None => self.arena.node_mut(node).first_prop = Some(prop),
        }
        Ok(prop)
    }

    /// Returns the property named `name` of `node`, creating it with an
    /// empty payload when missing.
    pub fn find_or_create_prop(&mut self, node: NodeId, name: &str) -> Result<PropId, Error> {
        self.ensure_writable()?;
        self.checked_node(node)?;
        let mut next = self.arena.node(node).first_prop;
        while let Some(id) = next {
            let record = self.arena.prop(id);
            if record.name == name {
                return Ok(id);
            }
            next = record.next;
        }
        self.create_prop(node, name)
    }

    /// Walks `path` like [`Self::find`](DeviceTree::find), creating every
    /// missing segment along the way with the literal segment text.
    ///
    /// Existing segments match on the part of the name before any `@`
    /// separator first, then on the full name. An empty tree gets a
    /// synthetic root.
    pub fn find_or_create_node(&mut self, path: &str) -> Result<NodeId, Error> {
        self.ensure_writable()?;
        let mut node = match self.root {
            Some(root) => root,
            None => {
                let root = self.arena.alloc_node(NodeRecord::new(None, None));
                self.root = Some(root);
                root
            }
        };

        let mut rest = path;
        loop {
            rest = rest.trim_start_matches('/');
            if rest.is_empty() {
                return Ok(node);
            }
            let (segment, tail) = match rest.find('/') {
                Some(i) => rest.split_at(i),
                None => (rest, ""),
            };
            node = match self.child_by_base_name(node, segment) {
                Some(child) => child,
                None => match self.child_by_full_name(node, segment) {
                    Some(child) => child,
                    None => self.create_child(node, segment)?,
                },
            };
            rest = tail;
        }
    }

    /// Unlinks `node` from its parent's child list (or the top-level
    /// chain). The subtree stays allocated but becomes unreachable, and
    /// phandle index slots pointing into it are cleared.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::NotFound`] when the node was already
    /// unlinked.
    pub fn destroy_node(&mut self, node: NodeId) -> Result<(), Error> {
        self.ensure_writable()?;
        self.checked_node(node)?;
        let parent = self.arena.node(node).parent;
        let next_sibling = self.arena.node(node).next_sibling;

        let head = match parent {
            Some(parent) => self.arena.node(parent).first_child,
            None => self.root,
        };
        let mut prev = None;
        let mut scan = head;
        while let Some(id) = scan {
            if id == node {
                break;
            }
            prev = Some(id);
            scan = self.arena.node(id).next_sibling;
        }
        if scan.is_none() {
            return Err(Error::new(ErrorKind::NotFound, 0));
        }

        match prev {
            Some(prev) => self.arena.node_mut(prev).next_sibling = next_sibling,
            None => match parent {
                Some(parent) => self.arena.node_mut(parent).first_child = next_sibling,
                None => self.root = next_sibling,
            },
        }
        self.arena.node_mut(node).next_sibling = None;

        // The subtree is unreachable now; drop its phandle index entries.
        let mut pending = Vec::new();
        pending.push(node);
        while let Some(id) = pending.pop() {
            self.arena.clear_phandles_of(id);
            let mut child = self.arena.node(id).first_child;
            while let Some(cid) = child {
                pending.push(cid);
                child = self.arena.node(cid).next_sibling;
            }
        }
        Ok(())
    }

    /// Unlinks `prop` from the property list of `node`.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::NotFound`] when the property is not in the
    /// node's list.
    pub fn destroy_prop(&mut self, node: NodeId, prop: PropId) -> Result<(), Error> {
        self.ensure_writable()?;
        self.checked_node(node)?;
        self.checked_prop(prop)?;
        let mut prev = None;
        let mut scan = self.arena.node(node).first_prop;
        while let Some(id) = scan {
            if id == prop {
                break;
            }
            prev = Some(id);
            scan = self.arena.prop(id).next;
        }
        if scan.is_none() {
            return Err(Error::new(ErrorKind::NotFound, 0));
        }

        let next = self.arena.prop(prop).next;
        match prev {
            Some(prev) => self.arena.prop_mut(prev).next = next,
            None => self.arena.node_mut(node).first_prop = next,
        }
        self.arena.prop_mut(prop).next = None;
        Ok(())
    }

    /// Replaces the payload of `prop` with a NUL-terminated copy of `value`.
    pub fn write_prop_string(&mut self, prop: PropId, value: &str) -> Result<(), Error> {
        self.ensure_writable()?;
        self.checked_prop(prop)?;
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.arena.prop_mut(prop).value = Cow::Owned(payload);
        Ok(())
    }

    /// Replaces the payload of `prop` with `values`, each encoded as
    /// `cell_count` big-endian cells. Inverse of
    /// [`Property::values`](crate::Property::values).
    pub fn write_prop_values(
        &mut self,
        prop: PropId,
        cell_count: usize,
        values: &[u64],
    ) -> Result<(), Error> {
        self.ensure_writable()?;
        self.checked_prop(prop)?;
        check_layout(&[cell_count])?;
        let mut payload = Vec::with_capacity(values.len() * cell_count * 4);
        for &value in values {
            push_cells(&mut payload, value, cell_count);
        }
        self.arena.prop_mut(prop).value = Cow::Owned(payload);
        Ok(())
    }

    /// Replaces the payload of `prop` with integer pairs laid out as in
    /// [`Property::pairs`](crate::Property::pairs).
    pub fn write_prop_pairs(
        &mut self,
        prop: PropId,
        layout: (usize, usize),
        values: &[(u64, u64)],
    ) -> Result<(), Error> {
        self.ensure_writable()?;
        self.checked_prop(prop)?;
        check_layout(&[layout.0, layout.1])?;
        let mut payload = Vec::with_capacity(values.len() * (layout.0 + layout.1) * 4);
        for &(a, b) in values {
            push_cells(&mut payload, a, layout.0);
            push_cells(&mut payload, b, layout.1);
        }
        self.arena.prop_mut(prop).value = Cow::Owned(payload);
        Ok(())
    }

    /// Replaces the payload of `prop` with integer triplets laid out as in
    /// [`Property::triplets`](crate::Property::triplets).
    pub fn write_prop_triplets(
        &mut self,
        prop: PropId,
        layout: (usize, usize, usize),
        values: &[(u64, u64, u64)],
    ) -> Result<(), Error> {
        self.ensure_writable()?;
        self.checked_prop(prop)?;
        check_layout(&[layout.0, layout.1, layout.2])?;
        let mut payload =
            Vec::with_capacity(values.len() * (layout.0 + layout.1 + layout.2) * 4);
        for &(a, b, c) in values {
            push_cells(&mut payload, a, layout.0);
            push_cells(&mut payload, b, layout.1);
            push_cells(&mut payload, c, layout.2);
        }
        self.arena.prop_mut(prop).value = Cow::Owned(payload);
        Ok(())
    }

    /// Replaces the payload of `prop` with integer quads laid out as in
    /// [`Property::quads`](crate::Property::quads).
    pub fn write_prop_quads(
        &mut self,
        prop: PropId,
        layout: (usize, usize, usize, usize),
        values: &[(u64, u64, u64, u64)],
    ) -> Result<(), Error> {
        self.ensure_writable()?;
        self.checked_prop(prop)?;
        check_layout(&[layout.0, layout.1, layout.2, layout.3])?;
        let mut payload =
            Vec::with_capacity(values.len() * (layout.0 + layout.1 + layout.2 + layout.3) * 4);
        for &(a, b, c, d) in values {
            push_cells(&mut payload, a, layout.0);
            push_cells(&mut payload, b, layout.1);
            push_cells(&mut payload, c, layout.2);
            push_cells(&mut payload, d, layout.3);
        }
        self.arena.prop_mut(prop).value = Cow::Owned(payload);
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), Error> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::ReadOnly, 0))
        }
    }

    fn checked_node(&self, id: NodeId) -> Result<(), Error> {
        if id.index() < self.arena.node_count() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::NotFound, 0))
        }
    }

    fn checked_prop(&self, id: PropId) -> Result<(), Error> {
        if id.index() < self.arena.prop_count() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::NotFound, 0))
        }
    }

    fn child_by_full_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let mut next = self.arena.node(parent).first_child;
        while let Some(id) = next {
            let record = self.arena.node(id);
            if record.name.as_deref() == Some(name) {
                return Some(id);
            }
            next = record.next_sibling;
        }
        None
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        Err(Error::new(ErrorKind::InvalidName, 0))
    } else {
        Ok(())
    }
}

fn check_layout(widths: &[usize]) -> Result<(), Error> {
    if widths.iter().any(|&width| width == 0) {
        Err(Error::new(ErrorKind::InvalidLength, 0))
    } else {
        Ok(())
    }
}

/// Encodes `value` as `width` big-endian cells, most-significant first.
/// Cells beyond the low 64 bits are written as zero.
fn push_cells(out: &mut Vec<u8>, value: u64, width: usize) {
    for i in (0..width).rev() {
        let shift = 32 * i;
        let cell = if shift >= 64 { 0 } else { (value >> shift) as u32 };
        out.extend_from_slice(&cell.to_be_bytes());
    }
}
