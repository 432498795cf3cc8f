//! End-to-end assembly tests: build a store, deposit fragments and a ticket,
//! assemble the object, then re-parse it with the `object` reader.

use object::read::{Object, ObjectComdat, ObjectSection, ObjectSymbol};
use object::{ObjectKind, RelocationTarget, SectionKind as ObjSectionKind, SymbolKind};

use urepo::digest::FragmentDigest;
use urepo::fragment::{ExternalFixup, Fragment, InternalFixup, SectionContent, SectionKind};
use urepo::store::{Store, StoreBuilder};
use urepo::ticket::{Linkage, NameRef, TicketId, TicketMember};
use urepo::writer;

fn digest(seed: u8) -> FragmentDigest {
    FragmentDigest::new([seed; 16])
}

fn section(kind: SectionKind, data: &[u8]) -> SectionContent {
    let mut content = SectionContent::new(kind);
    content.data = data.to_vec();
    content
}

/// Accumulates a store and one ticket, then assembles it.
struct TestStore {
    builder: StoreBuilder,
    members: Vec<TicketMember>,
}

impl TestStore {
    fn new() -> TestStore {
        TestStore {
            builder: StoreBuilder::new(),
            members: Vec::new(),
        }
    }

    fn name(&mut self, value: &str) -> NameRef {
        self.builder.add_name(value)
    }

    fn member(&mut self, name: &str, seed: u8, linkage: Linkage, fragment: &Fragment) {
        let name = self.builder.add_name(name);
        self.builder.add_fragment(digest(seed), fragment);
        self.members.push(TicketMember {
            name,
            digest: digest(seed),
            linkage,
        });
    }

    fn assemble(mut self) -> anyhow::Result<Vec<u8>> {
        let ticket = TicketId::new([0xaa; 16]);
        self.builder.add_ticket(ticket, &self.members);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clang.db");
        self.builder.write(&path).unwrap();
        let store = Store::open(&path)?;
        writer::assemble(&store, ticket)
    }
}

fn u16le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn u32le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64le(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// Raw section header fields `(sh_type, sh_offset, sh_info)` for `index`.
fn raw_shdr(bytes: &[u8], index: usize) -> (u32, u64, u32) {
    let shoff = u64le(bytes, 40) as usize;
    let base = shoff + index * 64;
    (
        u32le(bytes, base + 4),
        u64le(bytes, base + 24),
        u32le(bytes, base + 44),
    )
}

#[test]
fn external_function_produces_minimal_object() {
    let mut store = TestStore::new();
    let puts = store.name("puts");
    let mut text = section(SectionKind::Text, &[0xe8, 0, 0, 0, 0, 0xc3]);
    text.xfixups.push(ExternalFixup::new(puts.0, 4, 1, -4));
    let fragment = Fragment::build(&[text]).unwrap();
    store.member("f", 1, Linkage::External, &fragment);

    let bytes = store.assemble().unwrap();

    // ELF64, little-endian, ET_REL, EM_X86_64.
    assert_eq!(&bytes[..4], b"\x7fELF");
    assert_eq!(bytes[4], 2);
    assert_eq!(bytes[5], 1);
    assert_eq!(u16le(&bytes, 16), 1);
    assert_eq!(u16le(&bytes, 18), 62);
    // Exactly: null, .strtab, .symtab, .text, .rela.text.
    assert_eq!(u16le(&bytes, 60), 5);
    assert_eq!(u16le(&bytes, 62), 1);

    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.kind(), ObjectKind::Relocatable);

    let text_section = file
        .sections()
        .find(|s| s.name().map_or(false, |n| n == ".text"))
        .unwrap();
    assert_eq!(text_section.kind(), ObjSectionKind::Text);
    assert_eq!(text_section.data().unwrap(), &[0xe8, 0, 0, 0, 0, 0xc3]);

    let relocations: Vec<_> = text_section.relocations().collect();
    assert_eq!(relocations.len(), 1);
    assert_eq!(relocations[0].0, 1);
    assert_eq!(relocations[0].1.addend(), -4);
    let RelocationTarget::Symbol(target) = relocations[0].1.target() else {
        panic!("relocation should target a symbol");
    };
    assert_eq!(file.symbol_by_index(target).unwrap().name().unwrap(), "puts");

    let f = file
        .symbols()
        .find(|s| s.name().map_or(false, |n| n == "f"))
        .unwrap();
    assert!(f.is_global());
    assert!(!f.is_undefined());
    assert_eq!(f.kind(), SymbolKind::Text);
    assert_eq!(f.address(), 0);

    let puts_symbol = file
        .symbols()
        .find(|s| s.name().map_or(false, |n| n == "puts"))
        .unwrap();
    assert!(puts_symbol.is_undefined());

    // No locals beyond the null symbol.
    let (sh_type, _, sh_info) = raw_shdr(&bytes, 2);
    assert_eq!(sh_type, 2); // SHT_SYMTAB
    assert_eq!(sh_info, 1);
}

#[test]
fn linkonce_twins_share_one_comdat_group() {
    let mut store = TestStore::new();
    let a = Fragment::build(&[section(SectionKind::Text, &[0x90, 0xc3])]).unwrap();
    let b = Fragment::build(&[section(SectionKind::Text, &[0x90, 0x90, 0xc3])]).unwrap();
    store.member("f", 2, Linkage::Linkonce, &a);
    store.member("f", 3, Linkage::Linkonce, &b);

    let bytes = store.assemble().unwrap();
    let file = object::File::parse(&*bytes).unwrap();

    // Each definition lands in its own .text section.
    let texts: Vec<_> = file
        .sections()
        .filter(|s| s.name().map_or(false, |n| n == ".text"))
        .collect();
    assert_eq!(texts.len(), 2);

    // One COMDAT group signed by the shared name, holding both sections.
    let comdats: Vec<_> = file.comdats().collect();
    assert_eq!(comdats.len(), 1);
    let signature = file.symbol_by_index(comdats[0].symbol()).unwrap();
    assert_eq!(signature.name().unwrap(), "f");
    let members: Vec<_> = comdats[0].sections().collect();
    assert_eq!(members.len(), 2);

    // The group's header precedes its members' (ELF requirement).
    let group_index = (0..u16le(&bytes, 60) as usize)
        .find(|&i| raw_shdr(&bytes, i).0 == 17) // SHT_GROUP
        .unwrap();
    for text in &texts {
        assert!(group_index < text.index().0);
    }

    // A single weak symbol for the shared name.
    let f_symbols: Vec<_> = file
        .symbols()
        .filter(|s| s.name().map_or(false, |n| n == "f"))
        .collect();
    assert_eq!(f_symbols.len(), 1);
    assert!(f_symbols[0].is_weak());
}

#[test]
fn common_member_emits_common_symbol() {
    let mut store = TestStore::new();
    let fragment = Fragment::build(&[section(SectionKind::Bss, &[0u8; 16])]).unwrap();
    store.member("buffer", 4, Linkage::Common, &fragment);

    let bytes = store.assemble().unwrap();
    let file = object::File::parse(&*bytes).unwrap();

    let buffer = file
        .symbols()
        .find(|s| s.name().map_or(false, |n| n == "buffer"))
        .unwrap();
    assert!(buffer.is_common());
    assert_eq!(buffer.size(), 16);

    // The fragment's BSS section contributes no output section.
    assert!(!file
        .sections()
        .any(|s| s.name().map_or(false, |n| n == ".bss")));
}

#[test]
fn common_member_requires_a_sole_bss_section() {
    let mut store = TestStore::new();
    let fragment = Fragment::build(&[section(SectionKind::Text, &[0xc3])]).unwrap();
    store.member("buffer", 5, Linkage::Common, &fragment);

    let err = store.assemble().unwrap_err();
    assert!(err.to_string().contains("sole BSS section"));
}

#[test]
fn internal_fixups_relocate_against_section_symbols() {
    let mut store = TestStore::new();
    let mut text = section(SectionKind::Text, &[0x8b, 0x05, 0, 0, 0, 0, 0xc3]);
    text.ifixups
        .push(InternalFixup::new(SectionKind::Data, 2, 2, -4));
    let data = section(SectionKind::Data, &[1, 2, 3, 4]);
    let fragment = Fragment::build(&[text, data]).unwrap();
    store.member("g", 6, Linkage::External, &fragment);

    let bytes = store.assemble().unwrap();
    let file = object::File::parse(&*bytes).unwrap();

    let data_section = file
        .sections()
        .find(|s| s.name().map_or(false, |n| n == ".data"))
        .unwrap();
    let text_section = file
        .sections()
        .find(|s| s.name().map_or(false, |n| n == ".text"))
        .unwrap();

    let relocations: Vec<_> = text_section.relocations().collect();
    assert_eq!(relocations.len(), 1);
    let (offset, relocation) = &relocations[0];
    assert_eq!(*offset, 2);
    // Contribution offset (0) folded into the addend.
    assert_eq!(relocation.addend(), -4);
    let RelocationTarget::Symbol(target) = relocation.target() else {
        panic!("relocation should target a symbol");
    };
    let target = file.symbol_by_index(target).unwrap();
    assert_eq!(target.kind(), SymbolKind::Section);
    assert_eq!(target.section_index(), Some(data_section.index()));

    // The member symbol prefers the Text contribution.
    let g = file
        .symbols()
        .find(|s| s.name().map_or(false, |n| n == "g"))
        .unwrap();
    assert_eq!(g.kind(), SymbolKind::Text);
    assert_eq!(g.section_index(), Some(text_section.index()));

    // Null + the section symbol are local; sh_info points past them.
    let (_, _, sh_info) = raw_shdr(&bytes, 2);
    assert_eq!(sh_info, 2);
}

#[test]
fn sentinel_member_names_redirect_to_init_and_fini_arrays() {
    let mut store = TestStore::new();
    let ctors = Fragment::build(&[section(SectionKind::Data, &[0u8; 8])]).unwrap();
    let dtors = Fragment::build(&[section(SectionKind::Data, &[0u8; 16])]).unwrap();
    store.member("llvm.global_ctors", 7, Linkage::Appending, &ctors);
    store.member("llvm.global_dtors", 8, Linkage::Appending, &dtors);

    let bytes = store.assemble().unwrap();
    let file = object::File::parse(&*bytes).unwrap();

    let init = file
        .sections()
        .find(|s| s.name().map_or(false, |n| n == ".init_array"))
        .unwrap();
    assert_eq!(init.size(), 8);
    let fini = file
        .sections()
        .find(|s| s.name().map_or(false, |n| n == ".fini_array"))
        .unwrap();
    assert_eq!(fini.size(), 16);
    assert!(!file
        .sections()
        .any(|s| s.name().map_or(false, |n| n == ".data")));
}

#[test]
fn data_members_define_object_symbols() {
    let mut store = TestStore::new();
    let fragment = Fragment::build(&[section(SectionKind::Data, &[42u8; 24])]).unwrap();
    store.member("counter", 9, Linkage::Internal, &fragment);

    let bytes = store.assemble().unwrap();
    let file = object::File::parse(&*bytes).unwrap();

    let counter = file
        .symbols()
        .find(|s| s.name().map_or(false, |n| n == "counter"))
        .unwrap();
    assert_eq!(counter.kind(), SymbolKind::Data);
    assert!(counter.is_local());
    assert_eq!(counter.size(), 24);
}

#[test]
fn contributions_accumulate_with_alignment() {
    let mut store = TestStore::new();
    let a = Fragment::build(&[section(SectionKind::Text, &[0x90; 3])]).unwrap();
    let b = Fragment::build(&[section(SectionKind::Text, &[0xc3; 2])]).unwrap();
    store.member("first", 10, Linkage::External, &a);
    store.member("second", 11, Linkage::External, &b);

    let bytes = store.assemble().unwrap();
    let file = object::File::parse(&*bytes).unwrap();

    let text = file
        .sections()
        .find(|s| s.name().map_or(false, |n| n == ".text"))
        .unwrap();
    // Second contribution starts at the next 16-byte boundary.
    assert_eq!(text.size(), 18);
    let second = file
        .symbols()
        .find(|s| s.name().map_or(false, |n| n == "second"))
        .unwrap();
    assert_eq!(second.address(), 16);
}

#[test]
fn missing_fragment_is_a_fatal_error() {
    let mut store = TestStore::new();
    let name = store.name("ghost");
    store.members.push(TicketMember {
        name,
        digest: digest(250),
        linkage: Linkage::External,
    });

    let err = store.assemble().unwrap_err();
    assert!(err.to_string().contains("was not found"));
}

#[test]
fn section_data_offsets_are_monotonic() {
    let mut store = TestStore::new();
    let mut text = section(SectionKind::Text, &[0xe8, 0, 0, 0, 0, 0xc3]);
    let callee = store.name("callee");
    text.xfixups.push(ExternalFixup::new(callee.0, 4, 1, -4));
    let rodata = section(SectionKind::ReadOnly, &[9u8; 12]);
    let fragment = Fragment::build(&[text, rodata]).unwrap();
    store.member("h", 12, Linkage::External, &fragment);

    let bytes = store.assemble().unwrap();
    let shnum = u16le(&bytes, 60) as usize;
    let mut last = 0u64;
    for index in 1..shnum {
        let (sh_type, sh_offset, _) = raw_shdr(&bytes, index);
        if sh_type == 8 {
            continue; // SHT_NOBITS
        }
        // String and symbol tables are written after the data sections but
        // keep their early header slots; skip the mandatory pair.
        if index <= 2 {
            continue;
        }
        assert!(sh_offset >= last, "section {} regresses", index);
        last = sh_offset;
    }
    // The section header table itself comes last.
    assert!(u64le(&bytes, 40) >= last);
}
