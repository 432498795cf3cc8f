//! ELF object assembly.
//!
//! Reconstitutes a relocatable ELF64 object from a ticket: loads each
//! member's fragment from the store, merges fragment sections into output
//! sections (grouping linkonce members into COMDAT groups), synthesises the
//! symbol table, and writes header, section bodies, relocations, group
//! bodies, string table, symbol table and the section header table.
//!
//! 1. Load ticket, resolve sentinel names
//! 2. Per member: intern output sections, place symbols, append data,
//!    record relocations
//! 3. Sort symbols (locals first)
//! 4. Emit everything, patching the ELF header last

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, ensure, Result};
use object::elf;
use object::endian::{Endianness, I64, U16, U32, U64};
use object::pod::bytes_of;
use tracing::debug;

use crate::align::align_up;
use crate::fragment::SectionKind;
use crate::output::{ElfKind, GroupInfo, OutputSection, Relocation, SectionId};
use crate::store::Store;
use crate::strtab::StringTable;
use crate::symtab::{binding_for, SymbolTable};
use crate::ticket::{Linkage, NameRef, TicketId, TicketMember};

type Ehdr = elf::FileHeader64<Endianness>;
type Shdr = elf::SectionHeader64<Endianness>;
type Rela = elf::Rela64<Endianness>;
type Sym = elf::Sym64<Endianness>;

// Mandatory section header slots.
const SHN_NULL_INDEX: usize = 0;
const SHN_STRTAB_INDEX: usize = 1;
const SHN_SYMTAB_INDEX: usize = 2;

fn u16v(value: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, value)
}
fn u32v(value: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, value)
}
fn u64v(value: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, value)
}
fn i64v(value: i64) -> I64<Endianness> {
    I64::new(Endianness::Little, value)
}

fn zero_shdr() -> Shdr {
    Shdr {
        sh_name: u32v(0),
        sh_type: u32v(0),
        sh_flags: u64v(0),
        sh_addr: u64v(0),
        sh_offset: u64v(0),
        sh_size: u64v(0),
        sh_link: u32v(0),
        sh_info: u32v(0),
        sh_addralign: u64v(0),
        sh_entsize: u64v(0),
    }
}

fn pad(buffer: &mut Vec<u8>, align: usize) {
    let len = align_up(buffer.len(), align);
    buffer.resize(len, 0);
}

/// Assembles the object for `ticket` from `store` and returns its bytes.
pub fn assemble(store: &Store, ticket: TicketId) -> Result<Vec<u8>> {
    let mut writer = ObjectWriter::new(store);
    writer.process_ticket(ticket)?;
    writer.finish()
}

/// The two member names that redirect a fragment's sections into the
/// init/fini arrays. Resolved against the store's interned names once; a
/// store without them simply has no constructors to run.
struct SpecialNames {
    ctor: Option<NameRef>,
    dtor: Option<NameRef>,
}

impl SpecialNames {
    fn resolve(store: &Store) -> SpecialNames {
        let ctor = store.find_name("llvm.global_ctors");
        let dtor = store.find_name("llvm.global_dtors");
        if ctor.is_none() && dtor.is_none() {
            debug!("no constructor/destructor names interned in the repository");
        }
        SpecialNames { ctor, dtor }
    }

    fn elf_kind_for(&self, kind: SectionKind, member_name: NameRef) -> Option<ElfKind> {
        if self.ctor == Some(member_name) {
            return Some(ElfKind::InitArray);
        }
        if self.dtor == Some(member_name) {
            return Some(ElfKind::FiniArray);
        }
        ElfKind::from_section_kind(kind)
    }
}

struct ObjectWriter<'s> {
    store: &'s Store,
    strings: StringTable,
    symbols: SymbolTable,
    sections: BTreeMap<SectionId, OutputSection>,
    groups: BTreeMap<String, GroupInfo>,
    /// Occurrences of each linkonce name seen so far, for discriminator
    /// ordinals.
    linkonce_seen: HashMap<String, u32>,
    headers: Vec<Shdr>,
}

impl<'s> ObjectWriter<'s> {
    fn new(store: &'s Store) -> Self {
        ObjectWriter {
            store,
            strings: StringTable::new(),
            symbols: SymbolTable::new(),
            sections: BTreeMap::new(),
            groups: BTreeMap::new(),
            linkonce_seen: HashMap::new(),
            headers: Vec::new(),
        }
    }

    fn process_ticket(&mut self, ticket: TicketId) -> Result<()> {
        let addr = self
            .store
            .find_ticket(&ticket)
            .ok_or_else(|| anyhow!("ticket {} was not found", ticket))?;
        let members = self.store.load_ticket(addr)?;
        let sentinels = SpecialNames::resolve(self.store);
        for member in &members {
            self.add_member(member, &sentinels)?;
        }
        Ok(())
    }

    fn add_member(&mut self, member: &TicketMember, sentinels: &SpecialNames) -> Result<()> {
        let name = self.store.name(member.name)?.to_string();
        debug!(member = %name, digest = %member.digest, "processing ticket member");

        let addr = self
            .store
            .find_fragment(&member.digest)
            .ok_or_else(|| anyhow!("fragment {} was not found", member.digest))?;
        let fragment = self.store.load_fragment(addr)?;

        if member.linkage == Linkage::Common {
            ensure!(
                fragment.num_sections() == 1 && fragment.has_section(SectionKind::Bss),
                "fragment for common symbol \"{}\" did not contain a sole BSS section",
                name
            );
            let size = fragment
                .section(SectionKind::Bss)
                .expect("checked above")
                .data_size();
            self.symbols.insert_common(&name, size, &mut self.strings);
            return Ok(());
        }

        let is_linkonce = member.linkage == Linkage::Linkonce;
        let discriminator = is_linkonce.then(|| {
            let seen = self.linkonce_seen.entry(name.clone()).or_insert(0);
            let ordinal = *seen;
            *seen += 1;
            (name.clone(), ordinal)
        });

        // First pass: intern the output section for each fragment section
        // and record the offset its data will be appended at. All offsets
        // must be known before relocations can target sibling sections.
        let mut contributions: Vec<Option<(SectionId, u64)>> = vec![None; SectionKind::COUNT];
        for key in fragment.sections().indices() {
            let kind = SectionKind::from_u8(key).expect("fragment validated at load");
            let elf_kind = sentinels
                .elf_kind_for(kind, member.name)
                .ok_or_else(|| anyhow!("no ELF output section mapping for {:?} section", kind))?;
            let id = SectionId {
                kind: elf_kind,
                discriminator: discriminator.clone(),
            };

            let inserted = !self.sections.contains_key(&id);
            let section = self
                .sections
                .entry(id.clone())
                .or_insert_with(|| OutputSection::new(id.clone()));
            if inserted && is_linkonce {
                let group = self
                    .groups
                    .entry(name.clone())
                    .or_insert_with(|| GroupInfo::new(name.clone()));
                group.members.push(id.clone());
                section.group = Some(name.clone());
            }

            let offset = section.aligned_size(kind.alignment());
            contributions[key as usize] = Some((id, offset));
        }

        // The member's named symbol lands on the Text contribution when the
        // fragment has one, otherwise on its first section in kind order.
        let primary = if contributions[SectionKind::Text as usize].is_some() {
            Some(SectionKind::Text as u8)
        } else {
            fragment.sections().indices().next()
        };
        if let Some(primary) = primary {
            let (section_id, offset) = contributions[primary as usize]
                .clone()
                .expect("recorded in the first pass");
            let kind = SectionKind::from_u8(primary).expect("fragment validated at load");
            let size = fragment
                .section(kind)
                .expect("key drawn from bitmap")
                .data_size();
            let sym_type = if kind == SectionKind::Text {
                elf::STT_FUNC
            } else {
                elf::STT_OBJECT
            };
            self.symbols.insert_definition(
                &name,
                section_id,
                offset,
                size,
                binding_for(member.linkage),
                sym_type,
                &mut self.strings,
            );
        }

        // Second pass: append the data and turn fixups into relocations.
        for key in fragment.sections().indices() {
            let kind = SectionKind::from_u8(key).expect("fragment validated at load");
            let section = fragment.section(kind).expect("key drawn from bitmap");
            let (id, offset) = contributions[key as usize]
                .clone()
                .expect("recorded in the first pass");

            let mut relocations = Vec::new();
            for fixup in section.ifixups() {
                let target_kind = fixup.section_kind().expect("fragment validated at load");
                let (target_id, target_offset) = contributions[target_kind as usize]
                    .clone()
                    .expect("fragment validated at load");
                let symbol = self.symbols.section_symbol(target_id, &mut self.strings);
                relocations.push(Relocation {
                    offset: offset + fixup.offset as u64,
                    symbol,
                    reloc_type: fixup.reloc_type,
                    addend: target_offset as i64 + fixup.addend as i64,
                });
            }
            for fixup in section.xfixups() {
                let target = self.store.name(NameRef(fixup.name))?.to_string();
                let symbol = self.symbols.insert_reference(&target, &mut self.strings);
                relocations.push(Relocation {
                    offset: offset + fixup.offset,
                    symbol,
                    reloc_type: fixup.reloc_type,
                    addend: fixup.addend,
                });
            }

            let out = self
                .sections
                .get_mut(&id)
                .expect("interned in the first pass");
            let appended_at = out.append(section.data(), kind.alignment());
            debug_assert_eq!(appended_at, offset);
            out.relocations.extend(relocations);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u8>> {
        let order = self.symbols.sort();

        let mut buffer = Vec::new();
        buffer.extend_from_slice(bytes_of(&self.file_header(0, 0)));
        self.init_standard_sections();

        // Output sections in map order. A group's header is created just
        // before its first member's, satisfying the ELF requirement that
        // group headers precede their members'.
        let ids: Vec<SectionId> = self.sections.keys().cloned().collect();
        for id in &ids {
            if let Some(signature) = self.sections[id].group.clone() {
                self.build_group_header(&signature)?;
            }

            let index = self.headers.len() as u32;
            let attrs = id.kind.attributes();
            let section = self.sections.get_mut(id).expect("listed above");
            section.index = index;

            let group_flag = if section.group.is_some() {
                elf::SHF_GROUP as u64
            } else {
                0
            };
            let size = section.size;
            let align = section.align.max(1);
            let num_relocations = section.relocations.len();

            pad(&mut buffer, align as usize);
            let sh_offset = buffer.len() as u64;
            if !id.kind.is_nobits() {
                let data = std::mem::take(&mut section.data);
                buffer.extend_from_slice(&data);
            }
            let mut header = zero_shdr();
            header.sh_name = u32v(self.strings.insert(attrs.name));
            header.sh_type = u32v(attrs.sh_type);
            header.sh_flags = u64v(attrs.sh_flags | group_flag);
            header.sh_offset = u64v(sh_offset);
            header.sh_size = u64v(size);
            header.sh_addralign = u64v(align);
            self.headers.push(header);

            // The relocation section immediately follows its data section;
            // group bodies rely on that index relationship.
            if num_relocations > 0 {
                pad(&mut buffer, 8);
                let rela_offset = buffer.len() as u64;
                let section = &self.sections[id];
                for relocation in &section.relocations {
                    let sym_index = self.symbols.final_index(relocation.symbol) as u64;
                    let rela = Rela {
                        r_offset: u64v(relocation.offset),
                        r_info: u64v((sym_index << 32) | relocation.reloc_type as u64),
                        r_addend: i64v(relocation.addend),
                    };
                    buffer.extend_from_slice(bytes_of(&rela));
                }
                let mut header = zero_shdr();
                header.sh_name = u32v(self.strings.insert(&format!(".rela{}", attrs.name)));
                header.sh_type = u32v(elf::SHT_RELA);
                header.sh_flags = u64v(elf::SHF_INFO_LINK as u64 | group_flag);
                header.sh_offset = u64v(rela_offset);
                header.sh_size = u64v((num_relocations * std::mem::size_of::<Rela>()) as u64);
                header.sh_link = u32v(SHN_SYMTAB_INDEX as u32);
                header.sh_info = u32v(index);
                header.sh_addralign = u64v(8);
                header.sh_entsize = u64v(std::mem::size_of::<Rela>() as u64);
                self.headers.push(header);
            }
        }

        self.write_group_sections(&mut buffer);

        // String table contents; every name has been interned by now.
        {
            let offset = buffer.len() as u64;
            buffer.extend_from_slice(self.strings.as_bytes());
            let header = &mut self.headers[SHN_STRTAB_INDEX];
            header.sh_offset = u64v(offset);
            header.sh_size = u64v(self.strings.size() as u64);
        }

        // Symbol table.
        {
            pad(&mut buffer, 8);
            let offset = buffer.len() as u64;
            let sections = &self.sections;
            let bytes = self.symbols.write(&order, |id| sections[id].index as u16);
            let header = &mut self.headers[SHN_SYMTAB_INDEX];
            header.sh_offset = u64v(offset);
            header.sh_size = u64v(bytes.len() as u64);
            header.sh_info = u32v(self.symbols.first_non_local(&order));
            buffer.extend_from_slice(&bytes);
        }

        // Section header table, then the final ELF header over the
        // placeholder at offset zero.
        pad(&mut buffer, std::mem::align_of::<Shdr>());
        let sh_offset = buffer.len() as u64;
        for header in &self.headers {
            buffer.extend_from_slice(bytes_of(header));
        }
        let file_header = self.file_header(sh_offset, self.headers.len() as u16);
        buffer[..std::mem::size_of::<Ehdr>()].copy_from_slice(bytes_of(&file_header));

        Ok(buffer)
    }

    fn file_header(&self, sh_offset: u64, sh_num: u16) -> Ehdr {
        Ehdr {
            e_ident: elf::Ident {
                magic: elf::ELFMAG,
                class: elf::ELFCLASS64,
                data: elf::ELFDATA2LSB,
                version: elf::EV_CURRENT,
                os_abi: elf::ELFOSABI_NONE,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: u16v(elf::ET_REL),
            e_machine: u16v(elf::EM_X86_64),
            e_version: u32v(elf::EV_CURRENT as u32),
            e_entry: u64v(0),
            e_phoff: u64v(0),
            e_shoff: u64v(sh_offset),
            e_flags: u32v(0),
            e_ehsize: u16v(std::mem::size_of::<Ehdr>() as u16),
            e_phentsize: u16v(0),
            e_phnum: u16v(0),
            e_shentsize: u16v(std::mem::size_of::<Shdr>() as u16),
            e_shnum: u16v(sh_num),
            e_shstrndx: u16v(SHN_STRTAB_INDEX as u16),
        }
    }

    /// Seeds the mandatory header slots: null, `.strtab`, `.symtab`.
    fn init_standard_sections(&mut self) {
        debug_assert_eq!(self.headers.len(), SHN_NULL_INDEX);
        self.headers.push(zero_shdr());

        let mut strtab = zero_shdr();
        strtab.sh_name = u32v(self.strings.insert(".strtab"));
        strtab.sh_type = u32v(elf::SHT_STRTAB);
        strtab.sh_addralign = u64v(1);
        debug_assert_eq!(self.headers.len(), SHN_STRTAB_INDEX);
        self.headers.push(strtab);

        let mut symtab = zero_shdr();
        symtab.sh_name = u32v(self.strings.insert(".symtab"));
        symtab.sh_type = u32v(elf::SHT_SYMTAB);
        symtab.sh_link = u32v(SHN_STRTAB_INDEX as u32);
        symtab.sh_entsize = u64v(std::mem::size_of::<Sym>() as u64);
        symtab.sh_addralign = u64v(8);
        debug_assert_eq!(self.headers.len(), SHN_SYMTAB_INDEX);
        self.headers.push(symtab);
    }

    /// Creates the header for `signature`'s group on first use. Symbol
    /// indices are already final, so `sh_info` can name the signature symbol
    /// directly.
    fn build_group_header(&mut self, signature: &str) -> Result<()> {
        let group = self
            .groups
            .get_mut(signature)
            .expect("sections only attach to existing groups");
        if group.section_index != 0 {
            return Ok(());
        }
        let symbol = self
            .symbols
            .find(signature)
            .ok_or_else(|| anyhow!("group signature symbol \"{}\" was not defined", signature))?;
        let mut header = zero_shdr();
        header.sh_name = u32v(self.strings.insert(".group"));
        header.sh_type = u32v(elf::SHT_GROUP);
        header.sh_link = u32v(SHN_SYMTAB_INDEX as u32);
        header.sh_info = u32v(self.symbols.final_index(symbol));
        header.sh_addralign = u64v(4);
        header.sh_entsize = u64v(4);
        group.section_index = self.headers.len() as u32;
        self.headers.push(header);
        Ok(())
    }

    /// Writes the group bodies recorded by [`Self::build_group_header`]:
    /// `GRP_COMDAT` followed by the member section indices (and their
    /// relocation sections'), patching each group header's extent.
    fn write_group_sections(&mut self, buffer: &mut Vec<u8>) {
        for group in self.groups.values() {
            pad(buffer, 4);
            let start = buffer.len();
            buffer.extend_from_slice(&elf::GRP_COMDAT.to_le_bytes());
            for member in &group.members {
                let section = &self.sections[member];
                buffer.extend_from_slice(&section.index.to_le_bytes());
                if !section.relocations.is_empty() {
                    buffer.extend_from_slice(&(section.index + 1).to_le_bytes());
                }
            }
            let header = &mut self.headers[group.section_index as usize];
            header.sh_offset = u64v(start as u64);
            header.sh_size = u64v((buffer.len() - start) as u64);
        }
    }
}
