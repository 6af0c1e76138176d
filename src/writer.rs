// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Flattens a [`DeviceTree`] back into a spec-conformant blob.
//!
//! Two passes: a sizing pass walks the tree once, accumulating the
//! structure-block cell count and building the deduplicated strings block,
//! then the emission pass writes header, memory reservations, structure
//! block and strings block with every write bounds-checked.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec::Vec;

use indexmap::IndexMap;
use twox_hash::xxhash64;
use zerocopy::IntoBytes;

use crate::arena::NodeId;
use crate::error::{Error, ErrorKind};
use crate::fdt::{
    FdtHeader, FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_PROP,
    FDT_TAGSIZE, FDT_VERSION,
};
use crate::tree::DeviceTree;

const STRING_TABLE_SEED: u64 = 0xdead_cafe;
/// One `(base, size)` entry of the reserved-memory block.
const RESERVED_ENTRY_SIZE: usize = 2 * size_of::<u64>();

/// Result of the sizing pass: the structure-block cell count plus the
/// finished strings block.
struct Plan {
    struct_cells: usize,
    strings: Vec<u8>,
    string_offsets: IndexMap<String, u32, xxhash64::State>,
}

fn build_plan(tree: &DeviceTree) -> Plan {
    let mut strings = Vec::new();
    // A leading NUL makes offset 0 a valid empty string.
    strings.push(0);
    let mut plan = Plan {
        struct_cells: 0,
        strings,
        string_offsets: IndexMap::with_hasher(xxhash64::State::with_seed(STRING_TABLE_SEED)),
    };

    let mut next = tree.root;
    while let Some(id) = next {
        plan_node(tree, id, &mut plan);
        next = tree.arena.node(id).next_sibling;
    }
    plan.struct_cells += 1; // terminating FDT_END
    plan
}

fn plan_node(tree: &DeviceTree, id: NodeId, plan: &mut Plan) {
    let record = tree.arena.node(id);
    let name_len = record.name.as_deref().unwrap_or("").len();
    // BEGIN_NODE and END_NODE tokens plus the aligned NUL-terminated name.
    plan.struct_cells += 2 + (name_len + 1).div_ceil(FDT_TAGSIZE);

    let mut prop = record.first_prop;
    while let Some(pid) = prop {
        let record = tree.arena.prop(pid);
        // PROP token, length, name offset, aligned payload.
        plan.struct_cells += 3 + record.value.len().div_ceil(FDT_TAGSIZE);
        if !plan.string_offsets.contains_key(record.name.as_ref()) {
            let offset =
                u32::try_from(plan.strings.len()).expect("string block length exceeds u32");
            plan.strings.extend_from_slice(record.name.as_bytes());
            plan.strings.push(0);
            plan.string_offsets.insert(record.name.as_ref().to_owned(), offset);
        }
        prop = record.next;
    }

    let mut child = record.first_child;
    while let Some(cid) = child {
        plan_node(tree, cid, plan);
        child = tree.arena.node(cid).next_sibling;
    }
}

fn total_size(tree: &DeviceTree, plan: &Plan) -> usize {
    size_of::<FdtHeader>()
        + (tree.memory_reservations.len() + 1) * RESERVED_ENTRY_SIZE
        + plan.struct_cells * FDT_TAGSIZE
        + plan.strings.len()
}

pub(crate) fn flattened_size(tree: &DeviceTree) -> usize {
    let plan = build_plan(tree);
    total_size(tree, &plan)
}

pub(crate) fn flatten_into(
    tree: &DeviceTree,
    buffer: &mut [u8],
    boot_cpu_id: u32,
) -> Result<usize, Error> {
    let plan = build_plan(tree);
    let required = total_size(tree, &plan);
    if buffer.len() < required {
        return Err(Error::new(ErrorKind::BufferTooSmall { required }, 0));
    }
    if buffer.as_ptr().align_offset(FDT_TAGSIZE) != 0 {
        return Err(Error::new(ErrorKind::BufferMisaligned, 0));
    }
    emit(tree, &plan, &mut buffer[..required], boot_cpu_id)
}

pub(crate) fn to_dtb(tree: &DeviceTree, boot_cpu_id: u32) -> Vec<u8> {
    let plan = build_plan(tree);
    let mut buffer = Vec::new();
    buffer.resize(total_size(tree, &plan), 0);
    emit(tree, &plan, &mut buffer, boot_cpu_id).expect("sized buffer cannot run out of space");
    buffer
}

fn emit(
    tree: &DeviceTree,
    plan: &Plan,
    buffer: &mut [u8],
    boot_cpu_id: u32,
) -> Result<usize, Error> {
    let required = total_size(tree, plan);
    let off_mem_rsvmap = size_of::<FdtHeader>();
    let off_dt_struct =
        off_mem_rsvmap + (tree.memory_reservations.len() + 1) * RESERVED_ENTRY_SIZE;
    let off_dt_strings = off_dt_struct + plan.struct_cells * FDT_TAGSIZE;

    let header = FdtHeader {
        magic: FDT_MAGIC.into(),
        totalsize: u32::try_from(required)
            .expect("totalsize exceeds u32")
            .into(),
        off_dt_struct: u32::try_from(off_dt_struct)
            .expect("off_dt_struct exceeds u32")
            .into(),
        off_dt_strings: u32::try_from(off_dt_strings)
            .expect("off_dt_strings exceeds u32")
            .into(),
        off_mem_rsvmap: u32::try_from(off_mem_rsvmap)
            .expect("off_mem_rsvmap exceeds u32")
            .into(),
        version: FDT_VERSION.into(),
        last_comp_version: FDT_LAST_COMP_VERSION.into(),
        boot_cpuid_phys: boot_cpu_id.into(),
        size_dt_strings: u32::try_from(plan.strings.len())
            .expect("size_dt_strings exceeds u32")
            .into(),
        size_dt_struct: u32::try_from(plan.struct_cells * FDT_TAGSIZE)
            .expect("size_dt_struct exceeds u32")
            .into(),
    };

    let mut out = Emitter {
        buffer,
        position: 0,
        required,
    };
    out.put(header.as_bytes())?;

    // Reserved-memory block. The list has no count field; the all-zero
    // entry is the mandatory terminator.
    for reservation in &tree.memory_reservations {
        out.put(&reservation.address().to_be_bytes())?;
        out.put(&reservation.size().to_be_bytes())?;
    }
    out.put(&[0u8; RESERVED_ENTRY_SIZE])?;

    let mut next = tree.root;
    while let Some(id) = next {
        emit_node(tree, plan, &mut out, id)?;
        next = tree.arena.node(id).next_sibling;
    }
    out.put_u32(FDT_END)?;

    out.put(&plan.strings)?;
    Ok(out.position)
}

fn emit_node(
    tree: &DeviceTree,
    plan: &Plan,
    out: &mut Emitter<'_>,
    id: NodeId,
) -> Result<(), Error> {
    let record = tree.arena.node(id);
    out.put_u32(FDT_BEGIN_NODE)?;
    out.put(record.name.as_deref().unwrap_or("").as_bytes())?;
    out.put(&[0])?;
    out.pad_to_cell()?;

    let mut prop = record.first_prop;
    while let Some(pid) = prop {
        let record = tree.arena.prop(pid);
        let name_offset = plan
            .string_offsets
            .get(record.name.as_ref())
            .copied()
            .expect("every property name is planned");
        out.put_u32(FDT_PROP)?;
        out.put_u32(u32::try_from(record.value.len()).expect("property value length exceeds u32"))?;
        out.put_u32(name_offset)?;
        out.put(&record.value)?;
        out.pad_to_cell()?;
        prop = record.next;
    }

    let mut child = record.first_child;
    while let Some(cid) = child {
        emit_node(tree, plan, out, cid)?;
        child = tree.arena.node(cid).next_sibling;
    }

    out.put_u32(FDT_END_NODE)
}

struct Emitter<'w> {
    buffer: &'w mut [u8],
    position: usize,
    required: usize,
}

impl Emitter<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let end = self.position + bytes.len();
        let slot = self.buffer.get_mut(self.position..end).ok_or(Error::new(
            ErrorKind::BufferTooSmall {
                required: self.required,
            },
            0,
        ))?;
        slot.copy_from_slice(bytes);
        self.position = end;
        Ok(())
    }

    fn put_u32(&mut self, value: u32) -> Result<(), Error> {
        self.put(&value.to_be_bytes())
    }

    fn pad_to_cell(&mut self) -> Result<(), Error> {
        while self.position % FDT_TAGSIZE != 0 {
            self.put(&[0])?;
        }
        Ok(())
    }
}
