// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A read-only view of a device tree property, and the cell decoders that
//! interpret its payload.
//!
//! Payloads are opaque byte strings whose meaning is fixed by external
//! device bindings. This module only offers the structural decodings: the
//! packed NUL-separated string list, and arrays of integers (or integer
//! tuples) built from consecutive 32-bit big-endian cells.

use core::ffi::CStr;
use core::fmt;

use zerocopy::byteorder::big_endian;
use zerocopy::FromBytes;

use crate::arena::PropId;
use crate::error::{Error, ErrorKind};
use crate::fdt::FDT_TAGSIZE;
use crate::tree::DeviceTree;

/// A property of a device tree node.
#[derive(Clone, Copy)]
pub struct Property<'tree, 'blob> {
    pub(crate) tree: &'tree DeviceTree<'blob>,
    pub(crate) id: PropId,
}

impl<'tree, 'blob> Property<'tree, 'blob> {
    /// Returns the id of this property.
    #[must_use]
    pub fn id(&self) -> PropId {
        self.id
    }

    /// Returns the name of this property.
    #[must_use]
    pub fn name(&self) -> &'tree str {
        &self.tree.arena.prop(self.id).name
    }

    /// Returns the raw payload of this property.
    #[must_use]
    pub fn value(&self) -> &'tree [u8] {
        &self.tree.arena.prop(self.id).value
    }

    /// Returns the payload as a single `u32` cell.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidLength`] unless the payload is exactly
    /// 4 bytes long.
    pub fn as_u32(&self) -> Result<u32, Error> {
        big_endian::U32::read_from_bytes(self.value())
            .map(|val| val.get())
            .map_err(|_e| Error::new(ErrorKind::InvalidLength, 0))
    }

    /// Returns the payload as a `u64` built from two cells,
    /// most-significant first.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidLength`] unless the payload is exactly
    /// 8 bytes long.
    pub fn as_u64(&self) -> Result<u64, Error> {
        big_endian::U64::read_from_bytes(self.value())
            .map(|val| val.get())
            .map_err(|_e| Error::new(ErrorKind::InvalidLength, 0))
    }

    /// Returns the payload as a single NUL-terminated string.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidString`] if the payload is not
    /// NUL-terminated or is not valid UTF-8.
    pub fn as_str(&self) -> Result<&'tree str, Error> {
        let cstr = CStr::from_bytes_with_nul(self.value())
            .map_err(|_| Error::new(ErrorKind::InvalidString, 0))?;
        cstr.to_str()
            .map_err(|_| Error::new(ErrorKind::InvalidString, 0))
    }

    /// Returns an iterator over the packed NUL-separated string list.
    pub fn strings(&self) -> StringList<'tree> {
        StringList {
            value: self.value(),
        }
    }

    /// Returns the `index`-th string of the packed list, or `None` past
    /// the end. A zero-length payload holds no strings.
    #[must_use]
    pub fn string(&self, index: usize) -> Option<&'tree str> {
        self.strings().nth(index)
    }

    /// Decodes the payload as an array of integers, each `cell_count`
    /// consecutive big-endian cells wide.
    ///
    /// The element count is `len / (cell_count * 4)`; trailing bytes that
    /// do not fill an element are ignored. Components wider than two cells
    /// keep their low 64 bits. A `cell_count` of zero yields nothing.
    pub fn values(&self, cell_count: usize) -> CellValues<'tree> {
        CellValues {
            data: self.value(),
            width: cell_count,
        }
    }

    /// Decodes the payload as an array of integer pairs whose components
    /// are `layout.0` and `layout.1` cells wide.
    ///
    /// The element count is `len / ((layout.0 + layout.1) * 4)`. Both
    /// widths must be non-zero, otherwise nothing is yielded.
    pub fn pairs(&self, layout: (usize, usize)) -> CellPairs<'tree> {
        CellPairs {
            data: self.value(),
            layout,
        }
    }

    /// Decodes the payload as an array of integer triplets, as
    /// [`Self::pairs`] with a third component.
    pub fn triplets(&self, layout: (usize, usize, usize)) -> CellTriplets<'tree> {
        CellTriplets {
            data: self.value(),
            layout,
        }
    }

    /// Decodes the payload as an array of integer quads, as
    /// [`Self::pairs`] with four components.
    pub fn quads(&self, layout: (usize, usize, usize, usize)) -> CellQuads<'tree> {
        CellQuads {
            data: self.value(),
            layout,
        }
    }

    pub(crate) fn fmt(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.name(), indent = indent)?;

        let value = self.value();
        if value.is_empty() {
            writeln!(f, ";")?;
            return Ok(());
        }

        let is_printable = value
            .iter()
            .all(|&ch| ch.is_ascii_graphic() || ch == b' ' || ch == 0);
        let has_empty = value.windows(2).any(|window| window == [0, 0]);
        if is_printable && value.ends_with(&[0]) && !has_empty {
            let mut strings = self.strings();
            if let Some(first) = strings.next() {
                write!(f, " = \"{first}\"")?;
                for s in strings {
                    write!(f, ", \"{s}\"")?;
                }
                writeln!(f, ";")?;
                return Ok(());
            }
        }

        if value.len() % FDT_TAGSIZE == 0 {
            write!(f, " = <")?;
            for (i, chunk) in value.chunks_exact(FDT_TAGSIZE).enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                let val = u32::from_be_bytes(
                    chunk
                        .try_into()
                        .expect("u32::from_be_bytes() should always succeed with 4 bytes"),
                );
                write!(f, "0x{val:02x}")?;
            }
            writeln!(f, ">;")?;
        } else {
            write!(f, " = [")?;
            for (i, byte) in value.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{byte:02x}")?;
            }
            writeln!(f, "];")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Property<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("value", &self.value())
            .finish()
    }
}

/// Assembles one big-endian integer from consecutive cells, keeping the
/// low 64 bits.
pub(crate) fn extract_cells(bytes: &[u8]) -> u64 {
    bytes.chunks_exact(FDT_TAGSIZE).fold(0, |acc, cell| {
        let cell = u32::from_be_bytes(cell.try_into().expect("chunks are 4 bytes"));
        (acc << 32) | u64::from(cell)
    })
}

/// An iterator over the strings of a packed NUL-separated string list.
pub struct StringList<'a> {
    value: &'a [u8],
}

impl<'a> Iterator for StringList<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.value.is_empty() {
            return None;
        }
        let cstr = CStr::from_bytes_until_nul(self.value).ok()?;
        let s = cstr.to_str().ok()?;
        self.value = &self.value[s.len() + 1..];
        Some(s)
    }
}

/// An iterator over N-cell integers, see [`Property::values`].
pub struct CellValues<'a> {
    data: &'a [u8],
    width: usize,
}

impl Iterator for CellValues<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.width == 0 {
            return None;
        }
        let bytes = self.width * FDT_TAGSIZE;
        if self.data.len() < bytes {
            return None;
        }
        let (element, rest) = self.data.split_at(bytes);
        self.data = rest;
        Some(extract_cells(element))
    }
}

/// An iterator over integer pairs, see [`Property::pairs`].
pub struct CellPairs<'a> {
    data: &'a [u8],
    layout: (usize, usize),
}

impl Iterator for CellPairs<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let (a, b) = self.layout;
        if a == 0 || b == 0 {
            return None;
        }
        let stride = (a + b) * FDT_TAGSIZE;
        if self.data.len() < stride {
            return None;
        }
        let (element, rest) = self.data.split_at(stride);
        self.data = rest;
        let (first, second) = element.split_at(a * FDT_TAGSIZE);
        Some((extract_cells(first), extract_cells(second)))
    }
}

/// An iterator over integer triplets, see [`Property::triplets`].
pub struct CellTriplets<'a> {
    data: &'a [u8],
    layout: (usize, usize, usize),
}

impl Iterator for CellTriplets<'_> {
    type Item = (u64, u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let (a, b, c) = self.layout;
        if a == 0 || b == 0 || c == 0 {
            return None;
        }
        let stride = (a + b + c) * FDT_TAGSIZE;
        if self.data.len() < stride {
            return None;
        }
        let (element, rest) = self.data.split_at(stride);
        self.data = rest;
        let (first, element) = element.split_at(a * FDT_TAGSIZE);
        let (second, third) = element.split_at(b * FDT_TAGSIZE);
        Some((
            extract_cells(first),
            extract_cells(second),
            extract_cells(third),
        ))
    }
}

/// An iterator over integer quads, see [`Property::quads`].
pub struct CellQuads<'a> {
    data: &'a [u8],
    layout: (usize, usize, usize, usize),
}

impl Iterator for CellQuads<'_> {
    type Item = (u64, u64, u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let (a, b, c, d) = self.layout;
        if a == 0 || b == 0 || c == 0 || d == 0 {
            return None;
        }
        let stride = (a + b + c + d) * FDT_TAGSIZE;
        if self.data.len() < stride {
            return None;
        }
        let (element, rest) = self.data.split_at(stride);
        self.data = rest;
        let (first, element) = element.split_at(a * FDT_TAGSIZE);
        let (second, element) = element.split_at(b * FDT_TAGSIZE);
        let (third, fourth) = element.split_at(c * FDT_TAGSIZE);
        Some((
            extract_cells(first),
            extract_cells(second),
            extract_cells(third),
            extract_cells(fourth),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_cells_is_most_significant_first() {
        let bytes = [0x00, 0x00, 0x00, 0x01, 0x80, 0x00, 0x00, 0x00];
        assert_eq!(extract_cells(&bytes), 0x1_8000_0000);
    }

    #[test]
    fn extract_cells_keeps_low_64_bits() {
        let mut bytes = [0u8; 12];
        bytes[3] = 0xff; // shifted out entirely
        bytes[7] = 0x01;
        bytes[11] = 0x02;
        assert_eq!(extract_cells(&bytes), 0x1_0000_0002);
    }
}
