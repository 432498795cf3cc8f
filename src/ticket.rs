//! Tickets.
//!
//! A ticket is an ordered list of `(name, digest, linkage)` members naming
//! the fragments that constitute one translation unit. Compilation leaves a
//! small ticket file beside the build artefacts; the store holds the member
//! list itself, keyed by the ticket's UUID.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::digest::FragmentDigest;

/// Address of an interned string in the store's name set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameRef(pub u64);

/// Linkage of a ticket member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Linkage {
    External = 0,
    Internal = 1,
    Linkonce = 2,
    Common = 3,
    Weak = 4,
    Appending = 5,
}

impl Linkage {
    pub fn from_u8(value: u8) -> Option<Linkage> {
        match value {
            0 => Some(Linkage::External),
            1 => Some(Linkage::Internal),
            2 => Some(Linkage::Linkonce),
            3 => Some(Linkage::Common),
            4 => Some(Linkage::Weak),
            5 => Some(Linkage::Appending),
            _ => None,
        }
    }
}

/// One entry of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketMember {
    pub name: NameRef,
    pub digest: FragmentDigest,
    pub linkage: Linkage,
}

/// Identifier of a ticket: an opaque 16-byte UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketId([u8; 16]);

impl TicketId {
    pub const SIZE: usize = 16;

    pub fn new(bytes: [u8; 16]) -> TicketId {
        TicketId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

const TICKET_FILE_SIGNATURE: &[u8; 8] = b"RepoUuid";
const TICKET_FILE_SIZE: usize = TICKET_FILE_SIGNATURE.len() + TicketId::SIZE;

/// Reads a ticket file: an 8-byte `RepoUuid` signature followed by the
/// 16-byte ticket UUID. Any other size or signature is a format error.
pub fn read_ticket_file(path: &Path) -> Result<TicketId> {
    let contents =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if contents.len() != TICKET_FILE_SIZE || &contents[..8] != TICKET_FILE_SIGNATURE {
        bail!("file \"{}\" is not a repo ticket file", path.display());
    }
    let mut uuid = [0u8; TicketId::SIZE];
    uuid.copy_from_slice(&contents[8..]);
    Ok(TicketId::new(uuid))
}

/// Writes a ticket file for `id`.
pub fn write_ticket_file(path: &Path, id: TicketId) -> Result<()> {
    let mut contents = Vec::with_capacity(TICKET_FILE_SIZE);
    contents.extend_from_slice(TICKET_FILE_SIGNATURE);
    contents.extend_from_slice(id.as_bytes());
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_id_renders_canonical_uuid_form() {
        let id = TicketId::new([
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ]);
        assert_eq!(id.to_string(), "12345678-9abc-def0-0123-456789abcdef");
    }

    #[test]
    fn ticket_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.o");
        let id = TicketId::new([7u8; 16]);
        write_ticket_file(&path, id).unwrap();
        assert_eq!(read_ticket_file(&path).unwrap(), id);
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.o");
        fs::write(&path, b"NotAUuid0123456789abcdef").unwrap();
        assert!(read_ticket_file(&path).is_err());
    }

    #[test]
    fn wrong_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.o");
        fs::write(&path, b"RepoUuid1234").unwrap();
        assert!(read_ticket_file(&path).is_err());
    }

    #[test]
    fn linkage_round_trips_through_bytes() {
        for linkage in [
            Linkage::External,
            Linkage::Internal,
            Linkage::Linkonce,
            Linkage::Common,
            Linkage::Weak,
            Linkage::Appending,
        ] {
            assert_eq!(Linkage::from_u8(linkage as u8), Some(linkage));
        }
        assert_eq!(Linkage::from_u8(6), None);
    }
}
