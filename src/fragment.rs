//! Content-addressed code fragments.
//!
//! A fragment is a single contiguous, position-independent blob recording the
//! section bodies and relocations of one compilation unit. The blob starts
//! with a sparse-array header (presence bitmap over [`SectionKind`] plus a
//! dense array of section offsets); each present section is a 16-byte header
//! followed by its raw data, internal fixups and external fixups, each at the
//! alignment of its element type. The on-disk image is exactly the in-memory
//! image: all internal references are blob-relative offsets.

use anyhow::{anyhow, ensure, Result};
use object::pod::{self, Pod};

use crate::align::{align_up, align_up_for};
use crate::sparse::{self, SparseArray};

/// Role of a section body within a fragment. A closed enumeration; new kinds
/// may only be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SectionKind {
    Bss = 0,
    Common,
    Data,
    RelRo,
    Text,
    Mergeable1ByteCString,
    Mergeable2ByteCString,
    Mergeable4ByteCString,
    MergeableConst4,
    MergeableConst8,
    MergeableConst16,
    MergeableConst32,
    MergeableConst,
    ReadOnly,
    ThreadBss,
    ThreadData,
    ThreadLocal,
    Metadata,
}

impl SectionKind {
    pub const COUNT: usize = 18;

    pub const ALL: [SectionKind; Self::COUNT] = [
        SectionKind::Bss,
        SectionKind::Common,
        SectionKind::Data,
        SectionKind::RelRo,
        SectionKind::Text,
        SectionKind::Mergeable1ByteCString,
        SectionKind::Mergeable2ByteCString,
        SectionKind::Mergeable4ByteCString,
        SectionKind::MergeableConst4,
        SectionKind::MergeableConst8,
        SectionKind::MergeableConst16,
        SectionKind::MergeableConst32,
        SectionKind::MergeableConst,
        SectionKind::ReadOnly,
        SectionKind::ThreadBss,
        SectionKind::ThreadData,
        SectionKind::ThreadLocal,
        SectionKind::Metadata,
    ];

    pub fn from_u8(value: u8) -> Option<SectionKind> {
        Self::ALL.get(value as usize).copied()
    }

    /// Alignment of this section's contribution when merged into an output
    /// section. Fragments do not carry a per-section alignment field, so the
    /// grain is fixed by kind.
    pub fn alignment(self) -> u64 {
        match self {
            SectionKind::Text => 16,
            SectionKind::Mergeable1ByteCString => 1,
            SectionKind::Mergeable2ByteCString => 2,
            SectionKind::Mergeable4ByteCString => 4,
            SectionKind::MergeableConst4 => 4,
            SectionKind::MergeableConst8 => 8,
            SectionKind::MergeableConst16 => 16,
            SectionKind::MergeableConst32 => 32,
            SectionKind::MergeableConst => 16,
            SectionKind::Metadata => 1,
            _ => 8,
        }
    }
}

/// A relocation whose target is another section of the same fragment.
///
/// 12 bytes, no trailing padding: `section` at 0, `reloc_type` at 1, two
/// explicit padding bytes, `offset` at 4, `addend` at 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct InternalFixup {
    pub section: u8,
    pub reloc_type: u8,
    padding: u16,
    pub offset: u32,
    pub addend: i32,
}

unsafe impl Pod for InternalFixup {}

impl InternalFixup {
    pub fn new(section: SectionKind, reloc_type: u8, offset: u32, addend: i32) -> Self {
        InternalFixup {
            section: section as u8,
            reloc_type,
            padding: 0,
            offset,
            addend,
        }
    }

    pub fn section_kind(&self) -> Option<SectionKind> {
        SectionKind::from_u8(self.section)
    }
}

/// A relocation whose target is a named external symbol. `name` is the
/// address of the symbol's string in the store's interned-name set.
///
/// 32 bytes: `name` at 0, `reloc_type` at 8, seven explicit padding bytes,
/// `offset` at 16, `addend` at 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ExternalFixup {
    pub name: u64,
    pub reloc_type: u8,
    padding: [u8; 7],
    pub offset: u64,
    pub addend: i64,
}

unsafe impl Pod for ExternalFixup {}

impl ExternalFixup {
    pub fn new(name: u64, reloc_type: u8, offset: u64, addend: i64) -> Self {
        ExternalFixup {
            name,
            reloc_type,
            padding: [0; 7],
            offset,
            addend,
        }
    }
}

/// Fixed 16-byte header preceding each section's three arrays.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct SectionHeader {
    num_ifixups: u32,
    num_xfixups: u32,
    data_size: u64,
}

unsafe impl Pod for SectionHeader {}

const SECTION_HEADER_SIZE: usize = std::mem::size_of::<SectionHeader>();
const SECTION_ALIGN: usize = 8;

/// Build-time contents of one section: the inputs from which a [`Fragment`]
/// is assembled.
#[derive(Debug, Clone)]
pub struct SectionContent {
    pub kind: SectionKind,
    pub data: Vec<u8>,
    pub ifixups: Vec<InternalFixup>,
    pub xfixups: Vec<ExternalFixup>,
}

impl SectionContent {
    pub fn new(kind: SectionKind) -> Self {
        SectionContent {
            kind,
            data: Vec::new(),
            ifixups: Vec::new(),
            xfixups: Vec::new(),
        }
    }

    fn size_bytes(&self) -> usize {
        section_size_bytes(self.data.len(), self.ifixups.len(), self.xfixups.len())
    }
}

/// Bytes needed for a section with the given data size and fixup counts.
/// A sub-array contributes alignment padding only when it is non-empty.
pub fn section_size_bytes(data_size: usize, num_ifixups: usize, num_xfixups: usize) -> usize {
    let mut pos = SECTION_HEADER_SIZE;
    if data_size > 0 {
        pos += data_size;
    }
    if num_ifixups > 0 {
        pos = align_up_for::<InternalFixup>(pos) + num_ifixups * std::mem::size_of::<InternalFixup>();
    }
    if num_xfixups > 0 {
        pos = align_up_for::<ExternalFixup>(pos) + num_xfixups * std::mem::size_of::<ExternalFixup>();
    }
    pos
}

/// Read-only view of one section within a fragment blob. `bytes` runs from
/// the section header to the end of the blob; the header's counts bound the
/// three arrays.
#[derive(Clone, Copy)]
pub struct Section<'a> {
    bytes: &'a [u8],
}

impl<'a> Section<'a> {
    fn header(&self) -> &'a SectionHeader {
        let (header, _) =
            pod::from_bytes::<SectionHeader>(self.bytes).expect("fragment validated at load");
        header
    }

    pub fn data_size(&self) -> u64 {
        self.header().data_size
    }

    pub fn num_ifixups(&self) -> usize {
        self.header().num_ifixups as usize
    }

    pub fn num_xfixups(&self) -> usize {
        self.header().num_xfixups as usize
    }

    pub fn data(&self) -> &'a [u8] {
        let start = SECTION_HEADER_SIZE;
        &self.bytes[start..start + self.data_size() as usize]
    }

    pub fn ifixups(&self) -> &'a [InternalFixup] {
        let count = self.num_ifixups();
        if count == 0 {
            return &[];
        }
        let start = align_up_for::<InternalFixup>(SECTION_HEADER_SIZE + self.data().len());
        let (fixups, _) = pod::slice_from_bytes::<InternalFixup>(&self.bytes[start..], count)
            .expect("fragment validated at load");
        fixups
    }

    pub fn xfixups(&self) -> &'a [ExternalFixup] {
        let count = self.num_xfixups();
        if count == 0 {
            return &[];
        }
        let mut start = SECTION_HEADER_SIZE + self.data().len();
        if self.num_ifixups() > 0 {
            start = align_up_for::<InternalFixup>(start)
                + self.num_ifixups() * std::mem::size_of::<InternalFixup>();
        }
        start = align_up_for::<ExternalFixup>(start);
        let (fixups, _) = pod::slice_from_bytes::<ExternalFixup>(&self.bytes[start..], count)
            .expect("fragment validated at load");
        fixups
    }

    /// Bytes occupied by this section, including inter-array padding.
    pub fn size_bytes(&self) -> usize {
        section_size_bytes(
            self.data_size() as usize,
            self.num_ifixups(),
            self.num_xfixups(),
        )
    }
}

/// 8-byte aligned owned byte buffer. Fragment sub-arrays are read through
/// typed slice views, so the backing storage must be at least 8-aligned.
struct AlignedBuf {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize) -> AlignedBuf {
        AlignedBuf {
            words: vec![0u64; (len + 7) / 8].into_boxed_slice(),
            len,
        }
    }

    fn copy_from(bytes: &[u8]) -> AlignedBuf {
        let mut buf = AlignedBuf::zeroed(bytes.len());
        buf.as_bytes_mut().copy_from_slice(bytes);
        buf
    }

    fn as_bytes(&self) -> &[u8] {
        &pod::bytes_of_slice(&self.words)[..self.len]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut pod::bytes_of_slice_mut(&mut self.words)[..len]
    }
}

/// An immutable fragment blob.
pub struct Fragment {
    buf: AlignedBuf,
}

impl Fragment {
    /// Assembles a fragment from section contents. Input order is irrelevant;
    /// sections are laid out in ascending kind order. Fails on duplicate
    /// kinds, on counts that overflow their header fields, and on internal
    /// fixups that name an absent section.
    pub fn build(contents: &[SectionContent]) -> Result<Fragment> {
        let mut order: Vec<usize> = (0..contents.len()).collect();
        order.sort_by_key(|&i| contents[i].kind);
        for pair in order.windows(2) {
            ensure!(
                contents[pair[0]].kind != contents[pair[1]].kind,
                "duplicate fragment section kind {:?}",
                contents[pair[0]].kind
            );
        }
        for content in contents {
            ensure!(
                content.ifixups.len() <= u32::MAX as usize
                    && content.xfixups.len() <= u32::MAX as usize,
                "fixup count overflows section header"
            );
        }

        // Pre-compute the blob size, then fill; the two walks must agree.
        let mut size = sparse::size_bytes(contents.len());
        for &i in &order {
            size = align_up(size, SECTION_ALIGN);
            size += contents[i].size_bytes();
        }

        let mut buf = AlignedBuf::zeroed(size);
        let bytes = buf.as_bytes_mut();
        sparse::write_bitmap(bytes, contents.iter().map(|c| c.kind as u8));

        let mut pos = sparse::size_bytes(contents.len());
        for &i in &order {
            let content = &contents[i];
            pos = align_up(pos, SECTION_ALIGN);
            sparse::assign(bytes, content.kind as u8, pos as u64);
            pos = write_section(bytes, pos, content);
        }
        assert_eq!(pos, size, "fragment size precomputation mismatch");

        let fragment = Fragment { buf };
        fragment.validate()?;
        Ok(fragment)
    }

    /// Reconstructs a fragment from its on-disk image, re-checking every
    /// layout invariant (store contents are untrusted input).
    pub fn parse(bytes: &[u8]) -> Result<Fragment> {
        let fragment = Fragment {
            buf: AlignedBuf::copy_from(bytes),
        };
        fragment.validate()?;
        Ok(fragment)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    pub fn size_bytes(&self) -> usize {
        self.buf.len
    }

    /// The sparse array mapping section kind to blob-relative offset.
    pub fn sections(&self) -> SparseArray<'_> {
        SparseArray::new(self.as_bytes())
    }

    pub fn num_sections(&self) -> usize {
        self.sections().len()
    }

    pub fn has_section(&self, kind: SectionKind) -> bool {
        self.sections().get(kind as u8).is_some()
    }

    /// The section stored for `kind`, if present.
    pub fn section(&self, kind: SectionKind) -> Option<Section<'_>> {
        let offset = self.sections().get(kind as u8)?;
        Some(Section {
            bytes: &self.as_bytes()[offset as usize..],
        })
    }

    /// Checks the fragment's structural invariants: every offset is aligned
    /// and in bounds, sections tile the blob exactly, and every fixup names a
    /// present section and an in-range offset.
    pub fn validate(&self) -> Result<()> {
        let bytes = self.as_bytes();
        let sections = self.sections();
        let num = sections.len();
        ensure!(
            bytes.len() >= sparse::size_bytes(num),
            "fragment blob shorter than its sparse-array header"
        );

        let mut pos = sparse::size_bytes(num);
        for key in sections.indices() {
            let kind = SectionKind::from_u8(key)
                .ok_or_else(|| anyhow!("unknown section kind {} in fragment bitmap", key))?;
            let offset = sections.get(key).expect("key drawn from bitmap") as usize;
            ensure!(
                offset == align_up(pos, SECTION_ALIGN),
                "section {:?} at offset {} is misplaced",
                kind,
                offset
            );
            ensure!(
                offset + SECTION_HEADER_SIZE <= bytes.len(),
                "section {:?} header overruns the blob",
                kind
            );

            let section = Section {
                bytes: &bytes[offset..],
            };
            // Bound each count by the blob length before any size arithmetic
            // so corrupt headers cannot overflow it.
            ensure!(
                section.data_size() <= bytes.len() as u64
                    && section.num_ifixups() <= bytes.len()
                    && section.num_xfixups() <= bytes.len(),
                "section {:?} counts overflow the blob",
                kind
            );
            let size = section.size_bytes();
            ensure!(
                offset + size <= bytes.len(),
                "section {:?} contents overrun the blob",
                kind
            );

            for fixup in section.ifixups() {
                let targets_present = fixup
                    .section_kind()
                    .is_some_and(|k| sections.get(k as u8).is_some());
                ensure!(
                    targets_present,
                    "internal fixup in {:?} targets absent section {}",
                    kind,
                    fixup.section
                );
                ensure!(
                    (fixup.offset as u64) < section.data_size(),
                    "internal fixup offset {} outside {:?} data",
                    fixup.offset,
                    kind
                );
            }
            for fixup in section.xfixups() {
                ensure!(
                    fixup.offset < section.data_size(),
                    "external fixup offset {} outside {:?} data",
                    fixup.offset,
                    kind
                );
            }

            pos = offset + size;
        }

        ensure!(
            pos == bytes.len(),
            "fragment sections do not tile the blob ({} of {} bytes)",
            pos,
            bytes.len()
        );
        Ok(())
    }
}

/// Writes one section at `pos` (already 8-aligned); returns the end offset.
fn write_section(buf: &mut [u8], pos: usize, content: &SectionContent) -> usize {
    debug_assert_eq!(pos % SECTION_ALIGN, 0);
    let header = SectionHeader {
        num_ifixups: content.ifixups.len() as u32,
        num_xfixups: content.xfixups.len() as u32,
        data_size: content.data.len() as u64,
    };
    buf[pos..pos + SECTION_HEADER_SIZE].copy_from_slice(pod::bytes_of(&header));

    let mut out = pos + SECTION_HEADER_SIZE;
    if !content.data.is_empty() {
        buf[out..out + content.data.len()].copy_from_slice(&content.data);
        out += content.data.len();
    }
    if !content.ifixups.is_empty() {
        out = align_up_for::<InternalFixup>(out);
        let raw = pod::bytes_of_slice(&content.ifixups);
        buf[out..out + raw.len()].copy_from_slice(raw);
        out += raw.len();
    }
    if !content.xfixups.is_empty() {
        out = align_up_for::<ExternalFixup>(out);
        let raw = pod::bytes_of_slice(&content.xfixups);
        buf[out..out + raw.len()].copy_from_slice(raw);
        out += raw.len();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_section(data: &[u8]) -> SectionContent {
        SectionContent {
            kind: SectionKind::Text,
            data: data.to_vec(),
            ifixups: Vec::new(),
            xfixups: Vec::new(),
        }
    }

    #[test]
    fn fixup_records_have_fixed_layout() {
        assert_eq!(std::mem::size_of::<InternalFixup>(), 12);
        assert_eq!(std::mem::align_of::<InternalFixup>(), 4);
        assert_eq!(std::mem::size_of::<ExternalFixup>(), 32);
        assert_eq!(std::mem::align_of::<ExternalFixup>(), 8);
        assert_eq!(std::mem::size_of::<SectionHeader>(), 16);
    }

    #[test]
    fn single_text_section_layout() {
        // Four no-ops, no fixups: sparse header (16) + section header (16) +
        // data (4) = 36 bytes.
        let fragment = Fragment::build(&[text_section(&[0x90; 4])]).unwrap();
        assert_eq!(fragment.size_bytes(), 36);
        assert_eq!(fragment.num_sections(), 1);

        let text = fragment.section(SectionKind::Text).unwrap();
        assert_eq!(text.data(), &[0x90; 4]);
        assert!(text.ifixups().is_empty());
        assert!(text.xfixups().is_empty());
        assert!(fragment.section(SectionKind::Data).is_none());
    }

    #[test]
    fn internal_fixup_to_present_section_validates() {
        let mut text = text_section(&[0x8b, 0x05, 0, 0, 0, 0]);
        text.ifixups
            .push(InternalFixup::new(SectionKind::Data, 1, 2, 0));
        let data = SectionContent {
            kind: SectionKind::Data,
            data: vec![0u8; 8],
            ifixups: Vec::new(),
            xfixups: Vec::new(),
        };

        let fragment = Fragment::build(&[text, data]).unwrap();
        assert_eq!(fragment.num_sections(), 2);
        let section = fragment.section(SectionKind::Text).unwrap();
        assert_eq!(section.ifixups().len(), 1);
        assert_eq!(section.ifixups()[0].offset, 2);
        assert_eq!(
            section.ifixups()[0].section_kind(),
            Some(SectionKind::Data)
        );
    }

    #[test]
    fn internal_fixup_to_absent_section_is_rejected() {
        let mut text = text_section(&[0; 4]);
        text.ifixups
            .push(InternalFixup::new(SectionKind::Data, 1, 0, 0));
        assert!(Fragment::build(&[text]).is_err());
    }

    #[test]
    fn duplicate_kinds_are_rejected() {
        let err = Fragment::build(&[text_section(&[1]), text_section(&[2])]);
        assert!(err.is_err());
    }

    #[test]
    fn round_trip_preserves_all_arrays() {
        let mut text = text_section(&[0xc3, 0x90, 0x90]);
        text.ifixups
            .push(InternalFixup::new(SectionKind::ReadOnly, 2, 1, -4));
        text.xfixups.push(ExternalFixup::new(0x1000, 4, 1, 8));
        text.xfixups.push(ExternalFixup::new(0x2000, 9, 2, -2));
        let rodata = SectionContent {
            kind: SectionKind::ReadOnly,
            data: (0..33u8).collect(),
            ifixups: Vec::new(),
            xfixups: Vec::new(),
        };

        let built = Fragment::build(&[rodata.clone(), text.clone()]).unwrap();
        let loaded = Fragment::parse(built.as_bytes()).unwrap();
        assert_eq!(built.as_bytes(), loaded.as_bytes());

        let section = loaded.section(SectionKind::Text).unwrap();
        assert_eq!(section.data(), &text.data[..]);
        assert_eq!(section.ifixups(), &text.ifixups[..]);
        assert_eq!(section.xfixups(), &text.xfixups[..]);
        let ro = loaded.section(SectionKind::ReadOnly).unwrap();
        assert_eq!(ro.data(), &rodata.data[..]);
    }

    #[test]
    fn precomputed_size_matches_written_bytes() {
        let mut text = text_section(&[0u8; 7]);
        text.ifixups
            .push(InternalFixup::new(SectionKind::Text, 1, 0, 0));
        text.xfixups.push(ExternalFixup::new(1, 1, 0, 0));
        let bss = SectionContent {
            kind: SectionKind::Bss,
            data: vec![0u8; 3],
            ifixups: Vec::new(),
            xfixups: Vec::new(),
        };

        let mut expected = sparse::size_bytes(2);
        for content in [&bss, &text] {
            expected = align_up(expected, 8) + content.size_bytes();
        }
        let fragment = Fragment::build(&[text, bss]).unwrap();
        assert_eq!(fragment.size_bytes(), expected);
    }

    #[test]
    fn sub_arrays_are_aligned_for_their_element_type() {
        let mut text = text_section(&[0u8; 5]);
        text.ifixups
            .push(InternalFixup::new(SectionKind::Text, 1, 0, 0));
        text.xfixups.push(ExternalFixup::new(1, 1, 0, 0));
        let fragment = Fragment::build(&[text]).unwrap();

        let base = fragment.as_bytes().as_ptr() as usize;
        let offset = fragment.sections().get(SectionKind::Text as u8).unwrap() as usize;
        assert_eq!(offset % 8, 0);

        let section = fragment.section(SectionKind::Text).unwrap();
        assert_eq!((section.ifixups().as_ptr() as usize - base) % 4, 0);
        assert_eq!((section.xfixups().as_ptr() as usize - base) % 8, 0);
    }

    #[test]
    fn section_offsets_ascend_in_kind_order() {
        let kinds = [SectionKind::Text, SectionKind::Bss, SectionKind::Data];
        let contents: Vec<SectionContent> = kinds
            .iter()
            .map(|&kind| SectionContent {
                kind,
                data: vec![0u8; 4],
                ifixups: Vec::new(),
                xfixups: Vec::new(),
            })
            .collect();
        let fragment = Fragment::build(&contents).unwrap();

        let keys: Vec<u8> = fragment.sections().indices().collect();
        assert_eq!(
            keys,
            vec![
                SectionKind::Bss as u8,
                SectionKind::Data as u8,
                SectionKind::Text as u8
            ]
        );
        let offsets: Vec<u64> = keys
            .iter()
            .map(|&k| fragment.sections().get(k).unwrap())
            .collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn corrupt_blob_fails_validation() {
        let fragment = Fragment::build(&[text_section(&[0x90; 4])]).unwrap();
        let mut bytes = fragment.as_bytes().to_vec();
        // Claim a second, absent section.
        bytes[0] |= 1 << (SectionKind::Data as u8);
        assert!(Fragment::parse(&bytes).is_err());

        // Truncate the data.
        let bytes = &fragment.as_bytes()[..fragment.size_bytes() - 2];
        assert!(Fragment::parse(bytes).is_err());
    }
}
