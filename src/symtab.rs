//! ELF symbol table.
//!
//! Collects the symbols synthesised while merging fragment sections: named
//! definitions for ticket members, undefined references for external fixups,
//! common symbols, and one local section symbol per output section for
//! internal fixups. Emission order is locals first (required for
//! `.symtab`'s `sh_info`), preserving insertion order within each class.

use std::collections::HashMap;

use object::elf;
use object::endian::{Endianness, U16, U32, U64};
use object::pod::bytes_of;

use crate::output::SectionId;
use crate::strtab::StringTable;
use crate::ticket::Linkage;

/// Handle to a symbol; stable across sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolId(usize);

/// Where a symbol lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolPlacement {
    Undefined,
    Common { size: u64 },
    Section { section: SectionId, offset: u64, size: u64 },
}

#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    name_offset: u32,
    pub placement: SymbolPlacement,
    pub binding: u8,
    pub sym_type: u8,
    index: Option<u32>,
}

impl Symbol {
    pub fn is_local(&self) -> bool {
        self.binding == elf::STB_LOCAL
    }
}

/// Symbol binding derived from a ticket member's linkage.
pub fn binding_for(linkage: Linkage) -> u8 {
    match linkage {
        Linkage::External | Linkage::Common | Linkage::Appending => elf::STB_GLOBAL,
        Linkage::Internal => elf::STB_LOCAL,
        Linkage::Linkonce | Linkage::Weak => elf::STB_WEAK,
    }
}

#[derive(Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymbolId>,
    by_section: HashMap<SectionId, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    /// Defines `name` at an offset within an output section. An existing
    /// undefined reference is upgraded in place; an existing definition wins
    /// over later ones (linkonce twins contribute sections, not symbols).
    pub fn insert_definition(
        &mut self,
        name: &str,
        section: SectionId,
        offset: u64,
        size: u64,
        binding: u8,
        sym_type: u8,
        strings: &mut StringTable,
    ) -> SymbolId {
        if let Some(id) = self.find(name) {
            let symbol = &mut self.symbols[id.0];
            if symbol.placement == SymbolPlacement::Undefined {
                symbol.placement = SymbolPlacement::Section {
                    section,
                    offset,
                    size,
                };
                symbol.binding = binding;
                symbol.sym_type = sym_type;
            }
            return id;
        }
        self.push(
            name,
            SymbolPlacement::Section {
                section,
                offset,
                size,
            },
            binding,
            sym_type,
            strings,
        )
    }

    /// Emits a common symbol: undefined-with-size, `SHN_COMMON`.
    pub fn insert_common(&mut self, name: &str, size: u64, strings: &mut StringTable) -> SymbolId {
        if let Some(id) = self.find(name) {
            let symbol = &mut self.symbols[id.0];
            if symbol.placement == SymbolPlacement::Undefined {
                symbol.placement = SymbolPlacement::Common { size };
                symbol.binding = elf::STB_GLOBAL;
                symbol.sym_type = elf::STT_OBJECT;
            }
            return id;
        }
        self.push(
            name,
            SymbolPlacement::Common { size },
            elf::STB_GLOBAL,
            elf::STT_OBJECT,
            strings,
        )
    }

    /// References `name`, creating an undefined global if it is unknown.
    pub fn insert_reference(&mut self, name: &str, strings: &mut StringTable) -> SymbolId {
        if let Some(id) = self.find(name) {
            return id;
        }
        self.push(
            name,
            SymbolPlacement::Undefined,
            elf::STB_GLOBAL,
            elf::STT_NOTYPE,
            strings,
        )
    }

    /// The local section symbol for `section`, created on first use.
    /// Internal fixups relocate against these, with the contribution offset
    /// folded into the addend.
    pub fn section_symbol(&mut self, section: SectionId, strings: &mut StringTable) -> SymbolId {
        if let Some(&id) = self.by_section.get(&section) {
            return id;
        }
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol {
            name: String::new(),
            name_offset: strings.insert(""),
            placement: SymbolPlacement::Section {
                section: section.clone(),
                offset: 0,
                size: 0,
            },
            binding: elf::STB_LOCAL,
            sym_type: elf::STT_SECTION,
            index: None,
        });
        self.by_section.insert(section, id);
        id
    }

    fn push(
        &mut self,
        name: &str,
        placement: SymbolPlacement,
        binding: u8,
        sym_type: u8,
        strings: &mut StringTable,
    ) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol {
            name: name.to_string(),
            name_offset: strings.insert(name),
            placement,
            binding,
            sym_type,
            index: None,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Orders the table locals-first (stable within each class) and assigns
    /// final symbol-table indices. Index 0 is the null symbol.
    pub fn sort(&mut self) -> Vec<SymbolId> {
        let mut order: Vec<usize> = (0..self.symbols.len()).collect();
        order.sort_by_key(|&i| !self.symbols[i].is_local());
        for (position, &i) in order.iter().enumerate() {
            self.symbols[i].index = Some(position as u32 + 1);
        }
        order.into_iter().map(SymbolId).collect()
    }

    /// Final index of a sorted symbol.
    pub fn final_index(&self, id: SymbolId) -> u32 {
        self.symbols[id.0]
            .index
            .expect("symbol table sorted before index queries")
    }

    /// `sh_info` for `.symtab`: one greater than the index of the last local
    /// symbol (the null symbol at index 0 counts as local).
    pub fn first_non_local(&self, order: &[SymbolId]) -> u32 {
        order
            .iter()
            .position(|&id| !self.get(id).is_local())
            .map(|position| position as u32 + 1)
            .unwrap_or(order.len() as u32 + 1)
    }

    /// Serialises the table in `order`, resolving section header indices
    /// through `section_index`.
    pub fn write(&self, order: &[SymbolId], section_index: impl Fn(&SectionId) -> u16) -> Vec<u8> {
        fn u16v(value: u16) -> U16<Endianness> {
            U16::new(Endianness::Little, value)
        }
        fn u32v(value: u32) -> U32<Endianness> {
            U32::new(Endianness::Little, value)
        }
        fn u64v(value: u64) -> U64<Endianness> {
            U64::new(Endianness::Little, value)
        }

        let mut bytes = Vec::with_capacity((order.len() + 1) * std::mem::size_of::<Sym>());
        let null = Sym {
            st_name: u32v(0),
            st_info: 0,
            st_other: 0,
            st_shndx: u16v(0),
            st_value: u64v(0),
            st_size: u64v(0),
        };
        bytes.extend_from_slice(bytes_of(&null));

        for &id in order {
            let symbol = self.get(id);
            let (shndx, value, size) = match &symbol.placement {
                SymbolPlacement::Undefined => (0, 0, 0),
                SymbolPlacement::Common { size } => (elf::SHN_COMMON, 0, *size),
                SymbolPlacement::Section {
                    section,
                    offset,
                    size,
                } => (section_index(section), *offset, *size),
            };
            let sym = Sym {
                st_name: u32v(symbol.name_offset),
                st_info: (symbol.binding << 4) | symbol.sym_type,
                st_other: elf::STV_DEFAULT,
                st_shndx: u16v(shndx),
                st_value: u64v(value),
                st_size: u64v(size),
            };
            bytes.extend_from_slice(bytes_of(&sym));
        }
        bytes
    }
}

type Sym = elf::Sym64<Endianness>;
