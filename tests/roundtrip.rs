// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

mod common;

use common::BlobBuilder;
use fdt_arena::{DeviceTree, ErrorKind, Fdt};

/// Collects (depth, name, properties) for every node, in traversal order.
fn shape(tree: &DeviceTree) -> Vec<(usize, String, Vec<(String, Vec<u8>)>)> {
    fn walk(
        out: &mut Vec<(usize, String, Vec<(String, Vec<u8>)>)>,
        node: fdt_arena::Node<'_, '_>,
        depth: usize,
    ) {
        let props = node
            .properties()
            .map(|prop| (prop.name().to_string(), prop.value().to_vec()))
            .collect();
        out.push((depth, node.name().to_string(), props));
        for child in node.children() {
            walk(out, child, depth + 1);
        }
    }

    let mut out = Vec::new();
    let mut next = tree.root();
    while let Some(node) = next {
        walk(&mut out, node, 0);
        next = node.next_sibling();
    }
    out
}

#[test]
fn flatten_then_reparse_preserves_everything() {
    let blob = common::sample_blob();
    let tree = DeviceTree::parse(&blob).unwrap();

    let size = tree.flattened_size();
    let mut buffer = vec![0u8; size];
    let written = tree.flatten_into(&mut buffer, 0).unwrap();
    assert_eq!(written, size);

    let reparsed = DeviceTree::parse(&buffer).unwrap();
    assert_eq!(shape(&tree), shape(&reparsed));
}

#[test]
fn flattening_is_a_fixed_point() {
    let blob = common::sample_blob();
    let first = DeviceTree::parse(&blob).unwrap().to_dtb(0);
    let second = DeviceTree::parse(&first).unwrap().to_dtb(0);
    assert_eq!(first, second);
}

#[test]
fn to_dtb_matches_flatten_into() {
    let blob = common::sample_blob();
    let tree = DeviceTree::parse(&blob).unwrap();

    let mut buffer = vec![0u8; tree.flattened_size()];
    tree.flatten_into(&mut buffer, 7).unwrap();
    assert_eq!(tree.to_dtb(7), buffer);
}

#[test]
fn header_fields_are_rewritten() {
    let blob = common::sample_blob();
    let tree = DeviceTree::parse(&blob).unwrap();
    let out = tree.to_dtb(3);

    let fdt = Fdt::new(&out).unwrap();
    assert_eq!(fdt.total_size(), out.len());
    assert_eq!(fdt.boot_cpu_id(), 3);
    // version = 17, last_comp_version = 16.
    assert_eq!(out[20..24], 17u32.to_be_bytes());
    assert_eq!(out[24..28], 16u32.to_be_bytes());
}

#[test]
fn reservations_survive_the_round_trip() {
    let mut b = BlobBuilder::new();
    b.reservation(0x4000, 0x40);
    b.node("", |_| {});
    let blob = b.build();

    let tree = DeviceTree::parse(&blob).unwrap();
    let out = tree.to_dtb(0);

    let reparsed = DeviceTree::parse(&out).unwrap();
    assert_eq!(reparsed.memory_reservations, tree.memory_reservations);
}

#[test]
fn undersized_buffer_reports_required_size() {
    let blob = common::sample_blob();
    let tree = DeviceTree::parse(&blob).unwrap();
    let size = tree.flattened_size();

    let mut buffer = vec![0u8; size - 1];
    match tree.flatten_into(&mut buffer, 0) {
        Err(e) => assert_eq!(e.kind, ErrorKind::BufferTooSmall { required: size }),
        Ok(written) => panic!("flatten succeeded, wrote {written} bytes"),
    }
    // Nothing was written.
    assert!(buffer.iter().all(|&b| b == 0));
}

#[test]
fn misaligned_buffer_is_rejected() {
    let blob = common::sample_blob();
    let tree = DeviceTree::parse(&blob).unwrap();
    let size = tree.flattened_size();

    // u32 backing storage guarantees the base is 4-byte aligned, so the
    // slice starting one byte in is guaranteed misaligned.
    let mut words = vec![0u32; size / 4 + 2];
    let bytes: &mut [u8] = zerocopy::IntoBytes::as_mut_bytes(words.as_mut_slice());
    let result = tree.flatten_into(&mut bytes[1..size + 1], 0);
    assert!(matches!(result, Err(e) if e.kind == ErrorKind::BufferMisaligned));
}

#[test]
fn flattened_strings_block_starts_with_nul_and_dedups() {
    let mut b = BlobBuilder::new();
    b.begin_node("");
    b.node("a", |b| {
        b.prop_u32("status", 1);
    });
    b.node("b", |b| {
        b.prop_u32("status", 2);
    });
    b.end_node();
    let blob = b.build();

    let tree = DeviceTree::parse(&blob).unwrap();
    let out = tree.to_dtb(0);

    let off_dt_strings = u32::from_be_bytes(out[12..16].try_into().unwrap()) as usize;
    let size_dt_strings = u32::from_be_bytes(out[32..36].try_into().unwrap()) as usize;
    let strings = &out[off_dt_strings..off_dt_strings + size_dt_strings];
    // Leading NUL, then each distinct name once.
    assert_eq!(strings, b"\0status\0");
}

#[test]
fn empty_tree_flattens_to_header_and_terminators() {
    let blob = BlobBuilder::new().build();
    let tree = DeviceTree::parse(&blob).unwrap();
    let out = tree.to_dtb(0);

    // Header, one reserved-memory sentinel entry, FDT_END, leading NUL.
    assert_eq!(out.len(), 40 + 16 + 4 + 1);
    let reparsed = DeviceTree::parse(&out).unwrap();
    assert!(reparsed.root().is_none());
}
