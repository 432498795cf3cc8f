//! Program-repository store access.
//!
//! The store is a single file holding interned names, fragment blobs and
//! ticket member lists, each reachable through a sorted fixed-width index
//! table. The assembler maps the file read-only and binary-searches the
//! tables; nothing here mutates an existing store. [`StoreBuilder`] produces
//! the format for the compile-side tooling and the tests.
//!
//! Layout: a 64-byte header (magic, version, table extents), a body of name
//! records / fragment blobs / ticket bodies in deposit order, then the three
//! index tables (names sorted by string value, fragments by digest, tickets
//! by UUID).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use memmap2::Mmap;
use object::pod::{self, Pod};
use tracing::debug;

use crate::align::align_up;
use crate::digest::FragmentDigest;
use crate::fragment::Fragment;
use crate::ticket::{Linkage, NameRef, TicketId, TicketMember};

const STORE_MAGIC: [u8; 8] = *b"uRepoDB\0";
const STORE_VERSION: u32 = 1;
const HEADER_SIZE: usize = std::mem::size_of::<StoreHeader>();

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct StoreHeader {
    magic: [u8; 8],
    version: u32,
    reserved: u32,
    name_index_off: u64,
    name_count: u64,
    fragment_index_off: u64,
    fragment_count: u64,
    ticket_index_off: u64,
    ticket_count: u64,
}

unsafe impl Pod for StoreHeader {}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct FragmentIndexEntry {
    digest: [u8; 16],
    offset: u64,
    size: u64,
}

unsafe impl Pod for FragmentIndexEntry {}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct TicketIndexEntry {
    uuid: [u8; 16],
    offset: u64,
    num_members: u32,
    reserved: u32,
}

unsafe impl Pod for TicketIndexEntry {}

/// On-disk image of one ticket member.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct TicketMemberRecord {
    name: u64,
    digest: [u8; 16],
    linkage: u8,
    reserved: [u8; 7],
}

unsafe impl Pod for TicketMemberRecord {}

/// Extent of a fragment blob within the store.
#[derive(Debug, Clone, Copy)]
pub struct FragmentAddr {
    offset: u64,
    size: u64,
}

/// Extent of a ticket body within the store.
#[derive(Debug, Clone, Copy)]
pub struct TicketAddr {
    offset: u64,
    num_members: u32,
}

/// A read-only, memory-mapped store.
pub struct Store {
    mmap: Mmap,
}

impl Store {
    /// Opens and maps `path` read-only, checking the header and that every
    /// index table lies within the file.
    pub fn open(path: &Path) -> Result<Store> {
        let file = File::open(path)
            .with_context(|| format!("failed to open repository {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map repository {}", path.display()))?;

        let store = Store { mmap };
        let bytes = store.bytes();
        ensure!(
            bytes.len() >= HEADER_SIZE,
            "repository {} is too small to hold a store header",
            path.display()
        );
        let header = store.header();
        ensure!(
            header.magic == STORE_MAGIC,
            "repository {} has a bad signature",
            path.display()
        );
        ensure!(
            header.version == STORE_VERSION,
            "repository {} has unsupported version {}",
            path.display(),
            header.version
        );
        for (off, count, entry_size) in [
            (header.name_index_off, header.name_count, 8),
            (
                header.fragment_index_off,
                header.fragment_count,
                std::mem::size_of::<FragmentIndexEntry>() as u64,
            ),
            (
                header.ticket_index_off,
                header.ticket_count,
                std::mem::size_of::<TicketIndexEntry>() as u64,
            ),
        ] {
            let end = count
                .checked_mul(entry_size)
                .and_then(|table| off.checked_add(table));
            ensure!(
                off % 8 == 0 && end.is_some_and(|end| end <= bytes.len() as u64),
                "repository {} index table overruns the file",
                path.display()
            );
        }
        debug!(
            names = header.name_count,
            fragments = header.fragment_count,
            tickets = header.ticket_count,
            "opened repository"
        );
        Ok(store)
    }

    fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    fn header(&self) -> &StoreHeader {
        let (header, _) =
            pod::from_bytes::<StoreHeader>(self.bytes()).expect("header checked at open");
        header
    }

    fn name_index(&self) -> &[u64] {
        let header = self.header();
        let (entries, _) = pod::slice_from_bytes::<u64>(
            &self.bytes()[header.name_index_off as usize..],
            header.name_count as usize,
        )
        .expect("index extent checked at open");
        entries
    }

    fn fragment_index(&self) -> &[FragmentIndexEntry] {
        let header = self.header();
        let (entries, _) = pod::slice_from_bytes::<FragmentIndexEntry>(
            &self.bytes()[header.fragment_index_off as usize..],
            header.fragment_count as usize,
        )
        .expect("index extent checked at open");
        entries
    }

    fn ticket_index(&self) -> &[TicketIndexEntry] {
        let header = self.header();
        let (entries, _) = pod::slice_from_bytes::<TicketIndexEntry>(
            &self.bytes()[header.ticket_index_off as usize..],
            header.ticket_count as usize,
        )
        .expect("index extent checked at open");
        entries
    }

    /// The interned string at `addr`.
    pub fn name(&self, addr: NameRef) -> Result<&str> {
        let bytes = self.bytes();
        let offset = addr.0 as usize;
        ensure!(
            offset.checked_add(4).is_some_and(|end| end <= bytes.len()),
            "name address {:#x} outside the repository",
            addr.0
        );
        let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        ensure!(
            offset + 4 + len <= bytes.len(),
            "name at {:#x} overruns the repository",
            addr.0
        );
        std::str::from_utf8(&bytes[offset + 4..offset + 4 + len])
            .map_err(|_| anyhow!("name at {:#x} is not valid UTF-8", addr.0))
    }

    /// Looks up an interned name by value.
    pub fn find_name(&self, needle: &str) -> Option<NameRef> {
        let entries = self.name_index();
        let mut lo = 0usize;
        let mut hi = entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let addr = NameRef(entries[mid]);
            let value = self.name(addr).ok()?;
            match value.cmp(needle) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(addr),
            }
        }
        None
    }

    /// Looks up a fragment extent by digest.
    pub fn find_fragment(&self, digest: &FragmentDigest) -> Option<FragmentAddr> {
        let entries = self.fragment_index();
        let position = entries
            .binary_search_by(|entry| entry.digest.cmp(digest.as_bytes()))
            .ok()?;
        Some(FragmentAddr {
            offset: entries[position].offset,
            size: entries[position].size,
        })
    }

    /// Loads and validates the fragment at `addr`.
    pub fn load_fragment(&self, addr: FragmentAddr) -> Result<Arc<Fragment>> {
        let bytes = self.bytes();
        let (offset, size) = (addr.offset as usize, addr.size as usize);
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= bytes.len()),
            "fragment extent overruns the repository"
        );
        let fragment = Fragment::parse(&bytes[offset..offset + size])
            .context("stored fragment failed validation")?;
        Ok(Arc::new(fragment))
    }

    /// Looks up a ticket extent by UUID.
    pub fn find_ticket(&self, id: &TicketId) -> Option<TicketAddr> {
        let entries = self.ticket_index();
        let position = entries
            .binary_search_by(|entry| entry.uuid.cmp(id.as_bytes()))
            .ok()?;
        Some(TicketAddr {
            offset: entries[position].offset,
            num_members: entries[position].num_members,
        })
    }

    /// Loads the ordered member list of the ticket at `addr`.
    pub fn load_ticket(&self, addr: TicketAddr) -> Result<Vec<TicketMember>> {
        let bytes = self.bytes();
        let offset = addr.offset as usize;
        let count = addr.num_members as usize;
        ensure!(
            offset <= bytes.len(),
            "ticket body overruns the repository"
        );
        let (records, _) = pod::slice_from_bytes::<TicketMemberRecord>(&bytes[offset..], count)
            .map_err(|()| anyhow!("ticket body overruns the repository"))?;

        let mut members = Vec::with_capacity(count);
        for record in records {
            let linkage = Linkage::from_u8(record.linkage)
                .ok_or_else(|| anyhow!("ticket member has unknown linkage {}", record.linkage))?;
            members.push(TicketMember {
                name: NameRef(record.name),
                digest: FragmentDigest::new(record.digest),
                linkage,
            });
        }
        Ok(members)
    }
}

/// Accumulates names, fragments and tickets, then writes a store file.
#[derive(Default)]
pub struct StoreBuilder {
    body: Vec<u8>,
    names: BTreeMap<String, u64>,
    fragments: BTreeMap<[u8; 16], (u64, u64)>,
    tickets: BTreeMap<[u8; 16], (u64, u32)>,
}

impl StoreBuilder {
    pub fn new() -> StoreBuilder {
        StoreBuilder {
            // The header is patched in at the end; offsets are file-absolute.
            body: vec![0u8; HEADER_SIZE],
            ..StoreBuilder::default()
        }
    }

    /// Interns `name`, returning its address.
    pub fn add_name(&mut self, name: &str) -> NameRef {
        if let Some(&addr) = self.names.get(name) {
            return NameRef(addr);
        }
        let addr = self.body.len() as u64;
        self.body
            .extend_from_slice(&(name.len() as u32).to_le_bytes());
        self.body.extend_from_slice(name.as_bytes());
        self.names.insert(name.to_string(), addr);
        NameRef(addr)
    }

    /// Deposits a fragment blob keyed by `digest`. Depositing the same digest
    /// again is a no-op (content-addressed deduplication).
    pub fn add_fragment(&mut self, digest: FragmentDigest, fragment: &Fragment) {
        if self.fragments.contains_key(digest.as_bytes()) {
            return;
        }
        self.pad_to(8);
        let offset = self.body.len() as u64;
        self.body.extend_from_slice(fragment.as_bytes());
        self.fragments.insert(
            *digest.as_bytes(),
            (offset, fragment.as_bytes().len() as u64),
        );
    }

    /// Deposits a ticket's member list keyed by `id`.
    pub fn add_ticket(&mut self, id: TicketId, members: &[TicketMember]) {
        self.pad_to(8);
        let offset = self.body.len() as u64;
        for member in members {
            let record = TicketMemberRecord {
                name: member.name.0,
                digest: *member.digest.as_bytes(),
                linkage: member.linkage as u8,
                reserved: [0; 7],
            };
            self.body.extend_from_slice(pod::bytes_of(&record));
        }
        self.tickets
            .insert(*id.as_bytes(), (offset, members.len() as u32));
    }

    /// Finalises the file image: body, sorted index tables, patched header.
    pub fn finish(mut self) -> Vec<u8> {
        self.pad_to(8);
        let name_index_off = self.body.len() as u64;
        for &addr in self.names.values() {
            self.body.extend_from_slice(&addr.to_le_bytes());
        }

        self.pad_to(8);
        let fragment_index_off = self.body.len() as u64;
        for (digest, &(offset, size)) in &self.fragments {
            let entry = FragmentIndexEntry {
                digest: *digest,
                offset,
                size,
            };
            self.body.extend_from_slice(pod::bytes_of(&entry));
        }

        self.pad_to(8);
        let ticket_index_off = self.body.len() as u64;
        for (uuid, &(offset, num_members)) in &self.tickets {
            let entry = TicketIndexEntry {
                uuid: *uuid,
                offset,
                num_members,
                reserved: 0,
            };
            self.body.extend_from_slice(pod::bytes_of(&entry));
        }

        let header = StoreHeader {
            magic: STORE_MAGIC,
            version: STORE_VERSION,
            reserved: 0,
            name_index_off,
            name_count: self.names.len() as u64,
            fragment_index_off,
            fragment_count: self.fragments.len() as u64,
            ticket_index_off,
            ticket_count: self.tickets.len() as u64,
        };
        self.body[..HEADER_SIZE].copy_from_slice(pod::bytes_of(&header));
        self.body
    }

    /// Writes the finished store to `path`.
    pub fn write(self, path: &Path) -> Result<()> {
        let bytes = self.finish();
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }

    fn pad_to(&mut self, align: usize) {
        let len = align_up(self.body.len(), align);
        self.body.resize(len, 0);
    }
}
