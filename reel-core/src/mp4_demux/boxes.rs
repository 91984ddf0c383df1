//! MP4 box tree parsing.
//!
//! Box header layouts:
//!
//! ```text
//! standard:  [u32 size][4cc type]                 size counts the header
//! extended:  [u32 size == 1][4cc type][u64 size]  16-byte header
//! to-EOF:    [u32 size == 0][4cc type]            box runs to end of resource
//! ```
//!
//! Container boxes from a fixed allow-list are expanded recursively; every
//! other box is kept as a leaf and its payload is left unread.

use bytes::{Buf, Bytes};

use super::{fourcc_str, Mp4Error, DINF, EDTS, MDIA, MINF, MOOV, MVEX, STBL, TRAK, UDTA};
use crate::source::{ByteSource, SourceError};

/// Box types whose payload is a sequence of child boxes
pub const CONTAINER_TYPES: [[u8; 4]; 9] = [MOOV, TRAK, MDIA, MINF, STBL, EDTS, DINF, UDTA, MVEX];

pub fn is_container_type(box_type: &[u8; 4]) -> bool {
    CONTAINER_TYPES.contains(box_type)
}

/// A parsed box. Parents own their children; the tree is immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Box {
    pub box_type: [u8; 4],
    /// Total size including the header
    pub size: u64,
    /// Absolute offset of the header in the resource
    pub offset: u64,
    /// 8 for standard and to-EOF headers, 16 for extended
    pub header_size: u8,
    pub children: Vec<Mp4Box>,
}

impl Mp4Box {
    pub fn payload_offset(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    pub fn payload_size(&self) -> u64 {
        self.size - self.header_size as u64
    }

    /// Offset one past the last byte of this box
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    pub fn is_container(&self) -> bool {
        is_container_type(&self.box_type)
    }

    pub fn type_str(&self) -> String {
        fourcc_str(&self.box_type)
    }

    /// First direct child of the given type
    pub fn child(&self, box_type: &[u8; 4]) -> Option<&Mp4Box> {
        self.children.iter().find(|b| &b.box_type == box_type)
    }

    /// Direct children of the given type, in file order
    pub fn children_of_type<'a>(&'a self, box_type: &'a [u8; 4]) -> impl Iterator<Item = &'a Mp4Box> + 'a {
        self.children.iter().filter(move |b| &b.box_type == box_type)
    }
}

// ============================================================================
// Parser
// ============================================================================

pub struct BoxParser<'a, S: ByteSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: ByteSource + ?Sized> BoxParser<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Length of the underlying resource in bytes
    pub fn resource_len(&self) -> u64 {
        self.source.len()
    }

    /// Decode the header at `offset` into a childless box.
    pub fn parse_box_header(&self, offset: u64) -> Result<Mp4Box, Mp4Error> {
        let total = self.source.len();
        let available = total.saturating_sub(offset);
        if available < 8 {
            return Err(Mp4Error::InvalidHeader { offset, available });
        }

        let header = self.source.read(offset, 16)?;
        let mut cursor = &header[..];
        let size32 = cursor.get_u32();
        let mut box_type = [0u8; 4];
        cursor.copy_to_slice(&mut box_type);

        let (size, header_size) = match size32 {
            1 => {
                if cursor.remaining() < 8 {
                    return Err(Mp4Error::InvalidHeader { offset, available });
                }
                (cursor.get_u64(), 16u8)
            }
            0 => (available, 8u8),
            n => (n as u64, 8u8),
        };

        if size < header_size as u64 {
            return Err(Mp4Error::SizeTooSmall {
                box_type: fourcc_str(&box_type),
                offset,
                size,
                header_size,
            });
        }
        if offset.checked_add(size).is_none() {
            return Err(Mp4Error::BoxOverrun {
                box_type: fourcc_str(&box_type),
                offset,
                size,
                limit: total,
            });
        }

        Ok(Mp4Box {
            box_type,
            size,
            offset,
            header_size,
            children: Vec::new(),
        })
    }

    /// Expand the children of a container box in place.
    pub fn parse_container(&self, parent: &mut Mp4Box) -> Result<(), Mp4Error> {
        let end = parent.end();
        let mut cursor = parent.payload_offset();

        while end.saturating_sub(cursor) >= 8 {
            let child = self.parse_child(cursor, end)?;
            cursor = child.end();
            parent.children.push(child);
        }

        Ok(())
    }

    fn parse_child(&self, offset: u64, limit: u64) -> Result<Mp4Box, Mp4Error> {
        let mut child = self.parse_box_header(offset)?;
        if child.end() > limit {
            return Err(Mp4Error::BoxOverrun {
                box_type: child.type_str(),
                offset: child.offset,
                size: child.size,
                limit,
            });
        }
        if child.is_container() {
            self.parse_container(&mut child)?;
        }
        Ok(child)
    }

    /// Parse every top-level box from offset 0 to the end of the resource.
    pub fn parse_full_structure(&self) -> Result<Vec<Mp4Box>, Mp4Error> {
        let total = self.source.len();
        let mut boxes = Vec::new();
        let mut offset = 0u64;

        while offset < total {
            let top = self.parse_child(offset, total)?;
            offset = top.end();
            boxes.push(top);
        }

        tracing::debug!(
            "Parsed {} top-level boxes: {:?}",
            boxes.len(),
            boxes.iter().map(Mp4Box::type_str).collect::<Vec<_>>()
        );
        Ok(boxes)
    }

    /// Read the payload of a (leaf) box.
    pub fn read_payload(&self, mp4_box: &Mp4Box) -> Result<Bytes, Mp4Error> {
        let size = mp4_box.payload_size() as usize;
        if size == 0 {
            return Ok(Bytes::new());
        }
        let payload = self.source.read(mp4_box.payload_offset(), size)?;
        if payload.len() < size {
            return Err(Mp4Error::Source(SourceError::InvalidRange {
                offset: mp4_box.payload_offset() + payload.len() as u64,
                len: self.source.len(),
            }));
        }
        Ok(payload)
    }
}

// ============================================================================
// Search
// ============================================================================

/// First box of the given type, pre-order depth-first
pub fn find_box<'a>(boxes: &'a [Mp4Box], box_type: &[u8; 4]) -> Option<&'a Mp4Box> {
    for b in boxes {
        if &b.box_type == box_type {
            return Some(b);
        }
        if let Some(found) = find_box(&b.children, box_type) {
            return Some(found);
        }
    }
    None
}

/// Every box of the given type, pre-order depth-first
pub fn find_all_boxes<'a>(boxes: &'a [Mp4Box], box_type: &[u8; 4]) -> Vec<&'a Mp4Box> {
    let mut found = Vec::new();
    collect_boxes(boxes, box_type, &mut found);
    found
}

fn collect_boxes<'a>(boxes: &'a [Mp4Box], box_type: &[u8; 4], found: &mut Vec<&'a Mp4Box>) {
    for b in boxes {
        if &b.box_type == box_type {
            found.push(b);
        }
        collect_boxes(&b.children, box_type, found);
    }
}

/// Follow a fixed chain of direct children, e.g. `[MINF, STBL]` from `mdia`
pub fn find_path<'a>(root: &'a Mp4Box, path: &[[u8; 4]]) -> Option<&'a Mp4Box> {
    path.iter().try_fold(root, |node, box_type| node.child(box_type))
}
