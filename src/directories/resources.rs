//! Resource directory (`IMAGE_DIRECTORY_ENTRY_RESOURCE`).
//!
//! The resource tree is modelled as nested [`ResourceTable`]s keyed by [`ResourceKey`].
//! Leaves are [`ResourceData`] entries that reference the resource bytes wherever they
//! live; encoding only rewrites the tree (tables, name strings and data entries), the
//! resource bytes themselves stay put. That is what makes merging the trees of two images
//! cheap: the guest's leaves keep pointing into the guest's transplanted sections.

use std::{cmp::Ordering, collections::BTreeMap, collections::BTreeSet, fmt};

use widestring::U16String;

use crate::{
    directories::{cursor, put_u32, EncodeContext, Encoded, ParseContext},
    file::parser::Parser,
    image::DataRef,
    Result,
};

/// Size of `IMAGE_RESOURCE_DIRECTORY`.
const TABLE_HEADER_SIZE: u32 = 16;
/// Size of `IMAGE_RESOURCE_DIRECTORY_ENTRY`.
const TABLE_ENTRY_SIZE: u32 = 8;
/// Size of `IMAGE_RESOURCE_DATA_ENTRY`.
const DATA_ENTRY_SIZE: u32 = 16;
/// High bit marking a name string or a subdirectory.
const HIGH_BIT: u32 = 0x8000_0000;
/// Deepest nesting accepted from a file.
const MAX_DEPTH: usize = 16;

/// Key of a resource table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    /// Named entry
    Name(U16String),
    /// Numeric entry
    Id(u32),
}

impl ResourceKey {
    /// Named key from a Rust string.
    #[must_use]
    pub fn name(name: &str) -> Self {
        ResourceKey::Name(U16String::from_str(name))
    }

    fn folded(name: &U16String) -> Vec<u16> {
        name.as_slice()
            .iter()
            .map(|unit| {
                if (u16::from(b'a')..=u16::from(b'z')).contains(unit) {
                    unit - 0x20
                } else {
                    *unit
                }
            })
            .collect()
    }
}

impl Ord for ResourceKey {
    /// Named entries sort before numeric ones; names compare case-insensitively.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ResourceKey::Name(left), ResourceKey::Name(right)) => Self::folded(left)
                .cmp(&Self::folded(right))
                .then_with(|| left.as_slice().cmp(right.as_slice())),
            (ResourceKey::Name(_), ResourceKey::Id(_)) => Ordering::Less,
            (ResourceKey::Id(_), ResourceKey::Name(_)) => Ordering::Greater,
            (ResourceKey::Id(left), ResourceKey::Id(right)) => left.cmp(right),
        }
    }
}

impl PartialOrd for ResourceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Name(name) => write!(f, "{}", name.to_string_lossy()),
            ResourceKey::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// A leaf of the resource tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceData {
    /// The resource bytes, sized
    pub data: DataRef,
    /// Code page of the data
    pub code_page: u32,
    /// Reserved, preserved verbatim
    pub reserved: u32,
}

/// A node of the resource tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceNode {
    /// Subdirectory
    Table(ResourceTable),
    /// Leaf
    Data(ResourceData),
}

/// One level of the resource tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTable {
    /// Reserved, preserved verbatim
    pub characteristics: u32,
    /// Creation time
    pub time_date_stamp: u32,
    /// Major version
    pub major_version: u16,
    /// Minor version
    pub minor_version: u16,
    /// Entries, names before ids
    pub entries: BTreeMap<ResourceKey, ResourceNode>,
}

/// A leaf or table of the host that was replaced while merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCollision {
    /// Keys from the root to the replaced node
    pub path: Vec<ResourceKey>,
}

impl fmt::Display for ResourceCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.path.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("/"))
    }
}

impl ResourceTable {
    /// Merge `other` into this table. Tables present on both sides merge recursively; any
    /// other collision is resolved in favour of `other` and reported.
    pub fn merge(&mut self, other: ResourceTable) -> Vec<ResourceCollision> {
        let mut collisions = Vec::new();
        self.merge_at(other, &mut Vec::new(), &mut collisions);
        collisions
    }

    fn merge_at(
        &mut self,
        other: ResourceTable,
        path: &mut Vec<ResourceKey>,
        collisions: &mut Vec<ResourceCollision>,
    ) {
        for (key, node) in other.entries {
            path.push(key.clone());
            match (self.entries.get_mut(&key), node) {
                (Some(ResourceNode::Table(mine)), ResourceNode::Table(theirs)) => {
                    mine.merge_at(theirs, path, collisions);
                }
                (Some(existing), node) => {
                    *existing = node;
                    collisions.push(ResourceCollision { path: path.clone() });
                }
                (None, node) => {
                    self.entries.insert(key, node);
                }
            }
            path.pop();
        }
    }

    /// Visit every leaf below this table.
    pub fn for_each_data_mut<F: FnMut(&mut ResourceData)>(&mut self, f: &mut F) {
        for node in self.entries.values_mut() {
            match node {
                ResourceNode::Table(table) => table.for_each_data_mut(f),
                ResourceNode::Data(data) => f(data),
            }
        }
    }

    /// Number of leaves below this table.
    #[must_use]
    pub fn data_count(&self) -> usize {
        self.entries
            .values()
            .map(|node| match node {
                ResourceNode::Table(table) => table.data_count(),
                ResourceNode::Data(_) => 1,
            })
            .sum()
    }

    /// Follow `path` from this table.
    #[must_use]
    pub fn lookup(&self, path: &[ResourceKey]) -> Option<&ResourceNode> {
        let (first, rest) = path.split_first()?;
        let node = self.entries.get(first)?;
        match (node, rest.is_empty()) {
            (_, true) => Some(node),
            (ResourceNode::Table(table), false) => table.lookup(rest),
            (ResourceNode::Data(_), false) => None,
        }
    }
}

/// The resource directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDirectory {
    /// Root table (level 1: resource types)
    pub root: ResourceTable,
}

struct TreeReader<'c, 'a> {
    ctx: &'c ParseContext<'a>,
    base: u32,
    visited: BTreeSet<u32>,
}

impl TreeReader<'_, '_> {
    fn table(&mut self, offset: u32, depth: usize) -> Result<ResourceTable> {
        if depth > MAX_DEPTH || !self.visited.insert(offset) {
            return Err(malformed_error!(
                "Resource table at offset {:#x} is nested too deeply or cyclic",
                offset
            ));
        }

        let header = self.ctx.read(self.base + offset, TABLE_HEADER_SIZE)?;
        let mut parser = Parser::new(&header);
        let characteristics = parser.read_le::<u32>()?;
        let time_date_stamp = parser.read_le::<u32>()?;
        let major_version = parser.read_le::<u16>()?;
        let minor_version = parser.read_le::<u16>()?;
        let count = u32::from(parser.read_le::<u16>()?) + u32::from(parser.read_le::<u16>()?);

        let raw_entries = self.ctx.read(
            self.base + offset + TABLE_HEADER_SIZE,
            count * TABLE_ENTRY_SIZE,
        )?;
        let mut parser = Parser::new(&raw_entries);
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let name = parser.read_le::<u32>()?;
            let target = parser.read_le::<u32>()?;

            let key = if name & HIGH_BIT != 0 {
                ResourceKey::Name(self.string(name & !HIGH_BIT)?)
            } else {
                ResourceKey::Id(name)
            };
            let node = if target & HIGH_BIT != 0 {
                ResourceNode::Table(self.table(target & !HIGH_BIT, depth + 1)?)
            } else {
                ResourceNode::Data(self.data(target)?)
            };
            entries.insert(key, node);
        }

        Ok(ResourceTable {
            characteristics,
            time_date_stamp,
            major_version,
            minor_version,
            entries,
        })
    }

    fn string(&self, offset: u32) -> Result<U16String> {
        let length = self.ctx.read(self.base + offset, 2)?;
        let length = u32::from(u16::from_le_bytes([length[0], length[1]]));
        let raw = self.ctx.read(self.base + offset + 2, length * 2)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(U16String::from_vec(units))
    }

    fn data(&self, offset: u32) -> Result<ResourceData> {
        let raw = self.ctx.read(self.base + offset, DATA_ENTRY_SIZE)?;
        let mut parser = Parser::new(&raw);
        let rva = parser.read_le::<u32>()?;
        let size = parser.read_le::<u32>()?;
        Ok(ResourceData {
            data: self.ctx.data_ref(rva, size)?,
            code_page: parser.read_le::<u32>()?,
            reserved: parser.read_le::<u32>()?,
        })
    }
}

impl ResourceDirectory {
    /// Parse the resource tree rooted at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for cyclic or out-of-bounds trees.
    pub fn parse(ctx: &ParseContext, rva: u32, _size: u32) -> Result<Self> {
        let mut reader = TreeReader {
            ctx,
            base: rva,
            visited: BTreeSet::new(),
        };
        Ok(ResourceDirectory {
            root: reader.table(0, 0)?,
        })
    }

    /// Encode the tree at `ctx.base_rva()`: all tables breadth-first, then data entries,
    /// then name strings.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if a leaf reference can not be resolved.
    pub fn encode(&self, ctx: &EncodeContext) -> Result<Encoded> {
        let mut tables: Vec<&ResourceTable> = vec![&self.root];
        let mut position = 0;
        while position < tables.len() {
            let current = tables[position];
            for node in current.entries.values() {
                if let ResourceNode::Table(table) = node {
                    tables.push(table);
                }
            }
            position += 1;
        }

        let mut table_offsets = Vec::with_capacity(tables.len());
        let mut offset = 0u32;
        let mut leaf_count = 0u32;
        for table in &tables {
            table_offsets.push(offset);
            let count = u32::try_from(table.entries.len()).unwrap_or(u32::MAX);
            offset += TABLE_HEADER_SIZE + count * TABLE_ENTRY_SIZE;
            leaf_count += u32::try_from(
                table
                    .entries
                    .values()
                    .filter(|node| matches!(node, ResourceNode::Data(_)))
                    .count(),
            )
            .unwrap_or(u32::MAX);
        }
        let data_start = offset;
        let strings_start = data_start + leaf_count * DATA_ENTRY_SIZE;

        let mut bytes = vec![0u8; strings_start as usize];
        let mut next_table = 1usize;
        let mut next_leaf = 0u32;

        for (index, table) in tables.iter().enumerate() {
            let at = table_offsets[index];
            let named = table
                .entries
                .keys()
                .filter(|key| matches!(key, ResourceKey::Name(_)))
                .count();
            let ids = table.entries.len() - named;

            put_u32(&mut bytes, at, table.characteristics);
            put_u32(&mut bytes, at + 4, table.time_date_stamp);
            put_u16(&mut bytes, at + 8, table.major_version);
            put_u16(&mut bytes, at + 10, table.minor_version);
            put_u16(&mut bytes, at + 12, u16::try_from(named).unwrap_or(u16::MAX));
            put_u16(&mut bytes, at + 14, u16::try_from(ids).unwrap_or(u16::MAX));

            let mut entry_at = at + TABLE_HEADER_SIZE;
            for (key, node) in &table.entries {
                let name = match key {
                    ResourceKey::Id(id) => *id & !HIGH_BIT,
                    ResourceKey::Name(name) => {
                        let string_offset = cursor(&bytes);
                        let units = name.as_slice();
                        bytes.extend_from_slice(
                            &u16::try_from(units.len()).unwrap_or(u16::MAX).to_le_bytes(),
                        );
                        for unit in units {
                            bytes.extend_from_slice(&unit.to_le_bytes());
                        }
                        HIGH_BIT | string_offset
                    }
                };

                let target = match node {
                    ResourceNode::Table(_) => {
                        let child = table_offsets[next_table];
                        next_table += 1;
                        HIGH_BIT | child
                    }
                    ResourceNode::Data(leaf) => {
                        let leaf_at = data_start + next_leaf * DATA_ENTRY_SIZE;
                        next_leaf += 1;
                        put_u32(&mut bytes, leaf_at, ctx.rva_of(&leaf.data)?);
                        put_u32(&mut bytes, leaf_at + 4, leaf.data.size().unwrap_or(0));
                        put_u32(&mut bytes, leaf_at + 8, leaf.code_page);
                        put_u32(&mut bytes, leaf_at + 12, leaf.reserved);
                        leaf_at
                    }
                };

                put_u32(&mut bytes, entry_at, name);
                put_u32(&mut bytes, entry_at + 4, target);
                entry_at += TABLE_ENTRY_SIZE;
            }
        }

        super::pad_to(&mut bytes, 4);
        Ok(Encoded::new(bytes))
    }
}

fn put_u16(bytes: &mut [u8], offset: u32, value: u16) {
    let offset = offset as usize;
    if let Some(slot) = bytes.get_mut(offset..offset + 2) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Section, SectionFlags, SectionStore};

    fn leaf(data: DataRef) -> ResourceNode {
        ResourceNode::Data(ResourceData {
            data,
            code_page: 0,
            reserved: 0,
        })
    }

    fn table(entries: Vec<(ResourceKey, ResourceNode)>) -> ResourceTable {
        ResourceTable {
            entries: entries.into_iter().collect(),
            ..ResourceTable::default()
        }
    }

    #[test]
    fn key_order() {
        let mut keys = vec![
            ResourceKey::Id(3),
            ResourceKey::name("zeta"),
            ResourceKey::Id(1),
            ResourceKey::name("ALPHA"),
            ResourceKey::name("Beta"),
        ];
        keys.sort();
        let rendered: Vec<_> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["ALPHA", "Beta", "zeta", "#1", "#3"]);
    }

    #[test]
    fn merge_policy() {
        let mut host = table(vec![
            (
                ResourceKey::Id(3),
                ResourceNode::Table(table(vec![(
                    ResourceKey::Id(1),
                    ResourceNode::Table(table(vec![(ResourceKey::Id(1033), leaf(DataRef::null()))])),
                )])),
            ),
            (ResourceKey::Id(16), leaf(DataRef::null())),
        ]);
        let guest_leaf = DataRef::null().with_size(4);
        let guest = table(vec![
            (
                ResourceKey::Id(3),
                ResourceNode::Table(table(vec![
                    (
                        ResourceKey::Id(1),
                        ResourceNode::Table(table(vec![(ResourceKey::Id(1033), leaf(guest_leaf))])),
                    ),
                    (ResourceKey::Id(2), leaf(guest_leaf)),
                ])),
            ),
            (ResourceKey::Id(16), ResourceNode::Table(ResourceTable::default())),
            (ResourceKey::name("GUESTRES"), leaf(guest_leaf)),
        ]);

        let collisions = host.merge(guest);
        let rendered: Vec<_> = collisions.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["#3/#1/#1033", "#16"]);

        assert_eq!(
            host.lookup(&[ResourceKey::Id(3), ResourceKey::Id(1), ResourceKey::Id(1033)]),
            Some(&leaf(guest_leaf))
        );
        assert!(host
            .lookup(&[ResourceKey::Id(3), ResourceKey::Id(2)])
            .is_some());
        assert!(matches!(
            host.lookup(&[ResourceKey::Id(16)]),
            Some(ResourceNode::Table(_))
        ));
        assert_eq!(host.data_count(), 3);
    }

    #[test]
    fn encode_then_parse() {
        let mut store = SectionStore::new(0x1000, 0x400);
        let rsrc = store
            .place_section(Section::with_address(
                ".rsrc",
                SectionFlags::RDATA,
                0x4000,
                0x1000,
                vec![0; 0x1000],
            ))
            .unwrap();
        let payload = DataRef::new(rsrc, 0x800).with_size(0x20);

        let directory = ResourceDirectory {
            root: table(vec![
                (
                    ResourceKey::name("CONFIG"),
                    ResourceNode::Table(table(vec![(ResourceKey::Id(1), leaf(payload))])),
                ),
                (
                    ResourceKey::Id(16),
                    ResourceNode::Table(table(vec![(
                        ResourceKey::Id(1),
                        ResourceNode::Table(table(vec![(ResourceKey::Id(1033), leaf(payload))])),
                    )])),
                ),
            ]),
        };

        let ctx = EncodeContext::new(&store, 0x40_0000, false, 0x4000);
        let encoded = directory.encode(&ctx).unwrap();
        store.get_mut(rsrc).unwrap().write(0, &encoded.bytes).unwrap();

        let parse = ParseContext::new(&store, &[], 0x40_0000, false, 0x14c);
        let parsed = ResourceDirectory::parse(&parse, 0x4000, encoded.size()).unwrap();
        assert_eq!(parsed.root.data_count(), 2);

        let found = parsed
            .root
            .lookup(&[ResourceKey::Id(16), ResourceKey::Id(1), ResourceKey::Id(1033)]);
        match found {
            Some(ResourceNode::Data(data)) => {
                assert_eq!(data.data.rva(&store), 0x4800);
                assert_eq!(data.data.size(), Some(0x20));
            }
            other => panic!("unexpected node {other:?}"),
        }
        assert!(parsed
            .root
            .lookup(&[ResourceKey::name("config"), ResourceKey::Id(1)])
            .is_none());
        assert!(parsed
            .root
            .lookup(&[ResourceKey::name("CONFIG"), ResourceKey::Id(1)])
            .is_some());
    }

    #[test]
    fn cyclic_tree_is_rejected() {
        let mut store = SectionStore::new(0x1000, 0x400);
        let mut bytes = vec![0u8; 0x20];
        bytes[14] = 1; // one id entry
        bytes[16..20].copy_from_slice(&1u32.to_le_bytes());
        bytes[20..24].copy_from_slice(&HIGH_BIT.to_le_bytes()); // points back at the root
        store
            .place_section(Section::with_address(
                ".rsrc",
                SectionFlags::RDATA,
                0x4000,
                0x20,
                bytes,
            ))
            .unwrap();

        let parse = ParseContext::new(&store, &[], 0x40_0000, false, 0x14c);
        assert!(matches!(
            ResourceDirectory::parse(&parse, 0x4000, 0x20),
            Err(crate::Error::Malformed { .. })
        ));
    }
}
