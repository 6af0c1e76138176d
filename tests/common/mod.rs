// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Byte-level DTB builder for test fixtures.
//!
//! Assembles blobs straight from tokens and big-endian fields, on purpose
//! sharing no code with the crate's serializer, so the tests cross-check
//! the two implementations against each other.

#![allow(dead_code)]

const FDT_MAGIC: u32 = 0xd00dfeed;
const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

const HEADER_SIZE: usize = 40;

pub struct BlobBuilder {
    struct_block: Vec<u8>,
    strings: Vec<u8>,
    reservations: Vec<(u64, u64)>,
    version: u32,
    boot_cpu_id: u32,
}

impl BlobBuilder {
    pub fn new() -> Self {
        Self {
            struct_block: Vec::new(),
            strings: Vec::new(),
            reservations: Vec::new(),
            version: 17,
            boot_cpu_id: 0,
        }
    }

    pub fn version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }

    pub fn boot_cpu_id(&mut self, id: u32) -> &mut Self {
        self.boot_cpu_id = id;
        self
    }

    pub fn reservation(&mut self, base: u64, size: u64) -> &mut Self {
        self.reservations.push((base, size));
        self
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.struct_block.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        self.struct_block.extend_from_slice(name.as_bytes());
        self.struct_block.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.struct_block.extend_from_slice(&FDT_END_NODE.to_be_bytes());
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.struct_block.extend_from_slice(&FDT_NOP.to_be_bytes());
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let name_offset = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);

        self.struct_block.extend_from_slice(&FDT_PROP.to_be_bytes());
        self.struct_block
            .extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.struct_block.extend_from_slice(&name_offset.to_be_bytes());
        self.struct_block.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.prop(name, &value.to_be_bytes())
    }

    pub fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
        let mut bytes = Vec::from(value.as_bytes());
        bytes.push(0);
        self.prop(name, &bytes)
    }

    pub fn prop_str_list(&mut self, name: &str, values: &[&str]) -> &mut Self {
        let mut bytes = Vec::new();
        for value in values {
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
        }
        self.prop(name, &bytes)
    }

    /// Convenience for a leaf node: begin, properties via `f`, end.
    pub fn node(&mut self, name: &str, f: impl FnOnce(&mut Self)) -> &mut Self {
        self.begin_node(name);
        f(&mut *self);
        self.end_node()
    }

    pub fn build(&self) -> Vec<u8> {
        let mut struct_block = self.struct_block.clone();
        struct_block.extend_from_slice(&FDT_END.to_be_bytes());

        let off_mem_rsvmap = HEADER_SIZE;
        let off_dt_struct = off_mem_rsvmap + (self.reservations.len() + 1) * 16;
        let off_dt_strings = off_dt_struct + struct_block.len();
        let totalsize = off_dt_strings + self.strings.len();

        let mut blob = Vec::with_capacity(totalsize);
        for field in [
            FDT_MAGIC,
            totalsize as u32,
            off_dt_struct as u32,
            off_dt_strings as u32,
            off_mem_rsvmap as u32,
            self.version,
            16, // last_comp_version
            self.boot_cpu_id,
            self.strings.len() as u32,
            struct_block.len() as u32,
        ] {
            blob.extend_from_slice(&field.to_be_bytes());
        }

        for &(base, size) in &self.reservations {
            blob.extend_from_slice(&base.to_be_bytes());
            blob.extend_from_slice(&size.to_be_bytes());
        }
        blob.extend_from_slice(&[0; 16]);

        blob.extend_from_slice(&struct_block);
        blob.extend_from_slice(&self.strings);
        blob
    }

    fn pad(&mut self) {
        while self.struct_block.len() % 4 != 0 {
            self.struct_block.push(0);
        }
    }
}

/// A root with one `/soc/uart@10000000` branch and a couple of leaves,
/// shared by several tests.
pub fn sample_blob() -> Vec<u8> {
    let mut b = BlobBuilder::new();
    b.begin_node("");
    b.prop_str("model", "acme,devboard");
    b.prop_str("compatible", "acme,board");
    b.begin_node("soc");
    b.node("uart@10000000", |b| {
        b.prop_str_list("compatible", &["ns16550a", "ns16550"]);
        b.prop("reg", &[0, 0, 0, 0, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x10, 0]);
        b.prop_u32("phandle", 0x2a);
    });
    b.node("uart@10001000", |b| {
        b.prop_str_list("compatible", &["ns16550a", "ns16550"]);
    });
    b.end_node(); // soc
    b.node("memory@80000000", |b| {
        b.prop_str("device_type", "memory");
        b.prop(
            "reg",
            &[0, 0, 0, 0, 0x80, 0, 0, 0, 0, 0, 0, 0, 0x10, 0, 0, 0],
        );
    });
    b.end_node(); // root
    b.build()
}
