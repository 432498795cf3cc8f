//! Structural content hashing.
//!
//! Computes the 128-bit digest of a function, global variable or global alias
//! over every semantic input to code generation. Each update is prefixed by a
//! kind tag so that byte-identical payloads hashed in different roles cannot
//! collide. Local value identity (arguments, instruction results, blocks) is
//! canonicalised through a serial-number map so equivalent functions hash
//! identically regardless of how their ids were allocated; globals reachable
//! from initializers are numbered through a second map which doubles as the
//! recursion guard for cyclic references.

use std::collections::{HashMap, HashSet};

use md5::{Digest as _, Md5};

use crate::digest::FragmentDigest;
use crate::ir::{
    ApFloat, ApInt, AtomicOrdering, Attribute, BlockId, Constant, ConstantKind, Function,
    GlobalAlias, GlobalVariable, InstExtra, Instruction, Module, OperandBundle, RangeMetadata,
    Type, Value,
};

/// Domain-separation tags. One byte each; the numbering is part of the hash
/// format and must never be reordered.
#[derive(Clone, Copy)]
#[repr(u8)]
enum Tag {
    StringRef = 0,
    Type = 1,
    Constant = 2,
    Value = 3,
    Instruction = 4,
    ApInt = 5,
    ApFloat = 6,
    AtomicOrdering = 7,
    AttributeEnum = 8,
    AttributeInt = 9,
    AttributeString = 10,
    AttributeList = 11,
    InlineAsm = 12,
    InlineAsmSideEffects = 13,
    InlineAsmAlignStack = 14,
    InlineAsmDialect = 15,
    RangeMetadata = 16,
    Signature = 17,
    SignatureGc = 18,
    SignatureSec = 19,
    SignatureVarArg = 20,
    SignatureCc = 21,
    SignatureArg = 22,
    Datalayout = 23,
    Triple = 24,
    BasicBlock = 25,
    PhiNode = 26,
    AllocaInst = 27,
    LoadInst = 28,
    StoreInst = 29,
    CmpInst = 30,
    CallInst = 31,
    InvokeInst = 32,
    InsertValueInst = 33,
    ExtractValueInst = 34,
    FenceInst = 35,
    AtomicCmpXchgInst = 36,
    AtomicRmwInst = 37,
    GetElementPtrInst = 38,
    OperandBundles = 39,
    GlobalFunction = 40,
    GlobalVariable = 41,
    GlobalAlias = 42,
    GvComdat = 43,
    GvConstant = 44,
    GvThreadLocalMode = 45,
    GvAlignment = 46,
    GvUnnamedAddr = 47,
    GvInitValue = 48,
    GvVisibility = 49,
    GvDllStorageClass = 50,
}

/// Identity of a function-local value for serial numbering.
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
enum LocalId {
    Arg(u32),
    Inst(u32),
    Block(BlockId),
}

/// Digest of a function definition.
pub fn hash_function(module: &Module, function: &Function) -> FragmentDigest {
    let mut calc = HashCalculator::new(module);
    calc.tag(Tag::GlobalFunction);
    calc.module_hash();
    calc.signature_hash(function);

    // CFG-ordered walk from the entry block: the block list's order in the
    // source representation is immaterial, and unreachable blocks do not
    // participate. Depth-first, successors pushed in terminator order.
    let mut pending: Vec<BlockId> = Vec::new();
    let mut visited: HashSet<BlockId> = HashSet::new();
    if let Some(entry) = function.blocks.first() {
        pending.push(entry.id);
        visited.insert(entry.id);
    }
    while let Some(id) = pending.pop() {
        let block = function
            .block(id)
            .unwrap_or_else(|| panic!("terminator targets unknown block {}", id));
        calc.value_hash(&Value::Block(id));
        calc.tag(Tag::BasicBlock);
        for inst in &block.instructions {
            calc.instruction_hash(inst);
        }
        if let Some(term) = block.terminator() {
            for succ in term.successors() {
                if visited.insert(succ) {
                    pending.push(succ);
                }
            }
        }
    }
    calc.finish()
}

/// Digest of a global variable definition.
pub fn hash_variable(module: &Module, gv: &GlobalVariable) -> FragmentDigest {
    let mut calc = HashCalculator::new(module);
    calc.tag(Tag::GlobalVariable);
    calc.module_hash();
    calc.type_hash(&gv.value_ty);
    calc.tag(Tag::GvConstant);
    calc.flag(gv.is_constant);
    calc.tag(Tag::GvThreadLocalMode);
    calc.byte(gv.thread_local as u8);
    calc.tag(Tag::GvAlignment);
    calc.number_u32(gv.align);
    calc.tag(Tag::GvUnnamedAddr);
    calc.byte(gv.unnamed_addr as u8);
    if let Some(comdat) = &gv.comdat {
        calc.tag(Tag::GvComdat);
        calc.raw(comdat.name.as_bytes());
        calc.byte(comdat.selection as u8);
    }
    if !gv.name.is_empty() {
        if let Some(init) = &gv.initializer {
            calc.tag(Tag::GvInitValue);
            calc.constant_hash(init);
        }
    }
    calc.finish()
}

/// Digest of a global alias. Aliases hash their own attributes plus the
/// aliasee; the module context does not participate.
pub fn hash_alias(module: &Module, ga: &GlobalAlias) -> FragmentDigest {
    let mut calc = HashCalculator::new(module);
    calc.tag(Tag::GlobalAlias);
    calc.type_hash(&ga.value_ty);
    calc.byte(ga.linkage as u8);
    calc.tag(Tag::GvVisibility);
    calc.byte(ga.visibility as u8);
    calc.tag(Tag::GvThreadLocalMode);
    calc.byte(ga.thread_local as u8);
    calc.tag(Tag::GvAlignment);
    calc.number_u32(ga.align);
    calc.tag(Tag::GvUnnamedAddr);
    calc.byte(ga.unnamed_addr as u8);
    calc.tag(Tag::GvDllStorageClass);
    calc.byte(ga.dll_storage as u8);
    calc.constant_hash(&ga.aliasee);
    calc.finish()
}

struct HashCalculator<'m> {
    module: &'m Module,
    hash: Md5,
    sn_map: HashMap<LocalId, u32>,
    global_numbers: HashMap<String, u32>,
}

impl<'m> HashCalculator<'m> {
    /// Fresh accumulator with empty side tables. The side tables are scoped
    /// to a single digest computation and must never be shared.
    fn new(module: &'m Module) -> Self {
        HashCalculator {
            module,
            hash: Md5::new(),
            sn_map: HashMap::new(),
            global_numbers: HashMap::new(),
        }
    }

    fn finish(self) -> FragmentDigest {
        FragmentDigest::new(self.hash.finalize().into())
    }

    fn tag(&mut self, tag: Tag) {
        self.hash.update([tag as u8]);
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.hash.update(bytes);
    }

    fn byte(&mut self, value: u8) {
        self.hash.update([value]);
    }

    fn flag(&mut self, value: bool) {
        self.byte(value as u8);
    }

    fn number_u32(&mut self, value: u32) {
        self.hash.update(value.to_le_bytes());
    }

    fn number_u64(&mut self, value: u64) {
        self.hash.update(value.to_le_bytes());
    }

    fn number_i16(&mut self, value: i16) {
        self.hash.update(value.to_le_bytes());
    }

    /// Length-prefixed string hash.
    fn mem_hash(&mut self, bytes: &[u8]) {
        self.tag(Tag::StringRef);
        self.number_u64(bytes.len() as u64);
        self.raw(bytes);
    }

    fn apint_hash(&mut self, value: &ApInt) {
        self.tag(Tag::ApInt);
        for word in &value.words {
            self.number_u64(*word);
        }
    }

    fn apfloat_hash(&mut self, value: &ApFloat) {
        self.tag(Tag::ApFloat);
        // Ordered first by semantics, then by the bit pattern.
        self.number_u32(value.precision);
        self.number_i16(value.max_exponent);
        self.number_i16(value.min_exponent);
        self.number_u32(value.size_in_bits);
        self.apint_hash(&value.value);
    }

    fn ordering_hash(&mut self, ordering: AtomicOrdering) {
        self.tag(Tag::AtomicOrdering);
        self.byte(ordering as u8);
    }

    fn attribute_hash(&mut self, attribute: &Attribute) {
        match attribute {
            Attribute::Enum(kind) => {
                self.tag(Tag::AttributeEnum);
                self.number_u32(*kind);
            }
            Attribute::Int(kind, value) => {
                self.tag(Tag::AttributeInt);
                self.number_u32(*kind);
                self.number_u64(*value);
            }
            Attribute::String { kind, value } => {
                self.tag(Tag::AttributeString);
                self.mem_hash(kind.as_bytes());
                self.mem_hash(value.as_bytes());
            }
        }
    }

    fn attribute_list_hash(&mut self, attributes: &[Attribute]) {
        self.tag(Tag::AttributeList);
        for attribute in attributes {
            self.attribute_hash(attribute);
        }
    }

    fn range_metadata_hash(&mut self, range: Option<&RangeMetadata>) {
        let Some(range) = range else { return };
        self.tag(Tag::RangeMetadata);
        for bound in range {
            self.apint_hash(bound);
        }
    }

    fn operand_bundles_hash(&mut self, bundles: &[OperandBundle]) {
        self.tag(Tag::OperandBundles);
        for bundle in bundles {
            // Input values already reach the hash through the instruction's
            // operands; only the arity is added here.
            self.mem_hash(bundle.tag.as_bytes());
            self.number_u64(bundle.num_inputs);
        }
    }

    fn type_hash(&mut self, ty: &Type) {
        self.tag(Tag::Type);
        self.byte(ty.type_id());
        match ty {
            Type::Void
            | Type::Half
            | Type::Float
            | Type::Double
            | Type::X86Fp80
            | Type::Fp128
            | Type::PpcFp128
            | Type::Label
            | Type::Metadata
            | Type::Token => {}
            Type::Integer(width) => self.number_u32(*width),
            Type::Function {
                params,
                var_arg,
                ret,
            } => {
                for param in params {
                    self.type_hash(param);
                }
                self.flag(*var_arg);
                self.type_hash(ret);
            }
            Type::Pointer { address_space } => self.number_u32(*address_space),
            Type::Struct { elements, packed } => {
                for element in elements {
                    self.type_hash(element);
                }
                if *packed {
                    self.flag(*packed);
                }
            }
            Type::Array { len, element } | Type::Vector { len, element } => {
                self.number_u64(*len);
                self.type_hash(element);
            }
        }
    }

    fn constant_hash(&mut self, constant: &Constant) {
        self.tag(Tag::Constant);
        self.type_hash(&constant.ty);

        if let ConstantKind::GlobalRef(name) = &constant.kind {
            // Global-value path: only a variable with a definitive
            // initializer contributes content. The number is assigned before
            // recursing so cyclic reference graphs terminate.
            let module = self.module;
            if let Some(gv) = module.globals.get(name) {
                if let Some(init) = &gv.initializer {
                    if let Some(&number) = self.global_numbers.get(name) {
                        self.number_u32(number);
                    } else {
                        let number = self.global_numbers.len() as u32;
                        self.global_numbers.insert(name.clone(), number);
                        self.constant_hash(init);
                    }
                }
            }
            return;
        }

        self.number_u32(constant.kind.value_id());
        match &constant.kind {
            ConstantKind::Undef
            | ConstantKind::TokenNone
            | ConstantKind::AggregateZero
            | ConstantKind::PointerNull => {}
            ConstantKind::Int(value) => self.apint_hash(value),
            ConstantKind::Fp(value) => self.apfloat_hash(value),
            ConstantKind::Array(elements)
            | ConstantKind::Struct(elements)
            | ConstantKind::Vector(elements)
            | ConstantKind::Expr(elements) => {
                for element in elements {
                    self.constant_hash(element);
                }
            }
            ConstantKind::BlockAddress { function, block } => {
                self.value_hash(&Value::Global(function.clone()));
                self.value_hash(&Value::Block(*block));
            }
            ConstantKind::Data(raw) => self.mem_hash(raw),
            ConstantKind::GlobalRef(_) => unreachable!("handled above"),
        }
    }

    fn inline_asm_hash(
        &mut self,
        fn_ty: &Type,
        asm: &str,
        constraints: &str,
        side_effects: bool,
        align_stack: bool,
        dialect: u8,
    ) {
        self.tag(Tag::InlineAsm);
        self.type_hash(fn_ty);
        self.mem_hash(asm.as_bytes());
        self.mem_hash(constraints.as_bytes());
        self.tag(Tag::InlineAsmSideEffects);
        self.flag(side_effects);
        self.tag(Tag::InlineAsmAlignStack);
        self.flag(align_stack);
        self.tag(Tag::InlineAsmDialect);
        self.byte(dialect);
    }

    fn value_hash(&mut self, value: &Value) {
        self.tag(Tag::Value);
        match value {
            Value::Constant(constant) => self.constant_hash(constant),
            Value::InlineAsm {
                fn_ty,
                asm,
                constraints,
                side_effects,
                align_stack,
                dialect,
            } => self.inline_asm_hash(
                fn_ty,
                asm,
                constraints,
                *side_effects,
                *align_stack,
                *dialect as u8,
            ),
            Value::Global(name) => self.mem_hash(name.as_bytes()),
            Value::Argument(index) => self.serial_number(LocalId::Arg(*index)),
            Value::Local(index) => self.serial_number(LocalId::Inst(*index)),
            Value::Block(id) => self.serial_number(LocalId::Block(*id)),
        }
    }

    /// Canonical number for a function-local value: first use assigns the
    /// next serial number, later uses repeat it.
    fn serial_number(&mut self, id: LocalId) {
        let next = self.sn_map.len() as u32;
        let number = *self.sn_map.entry(id).or_insert(next);
        self.number_u32(number);
    }

    fn module_hash(&mut self) {
        let module = self.module;
        self.tag(Tag::Datalayout);
        self.mem_hash(module.data_layout.as_bytes());
        self.tag(Tag::Triple);
        self.mem_hash(module.triple.as_bytes());
    }

    fn signature_hash(&mut self, function: &Function) {
        self.tag(Tag::Signature);
        self.attribute_list_hash(&function.attributes);
        if let Some(gc) = &function.gc {
            self.tag(Tag::SignatureGc);
            self.mem_hash(gc.as_bytes());
        }
        if let Some(section) = &function.section {
            self.tag(Tag::SignatureSec);
            self.mem_hash(section.as_bytes());
        }
        self.tag(Tag::SignatureVarArg);
        self.flag(function.is_var_arg());

        // The calling convention decides where parameters and return values
        // live, so it participates whenever the function has parameters or
        // returns void. Preserved as-is for digest compatibility.
        if function.num_params() != 0 || *function.return_type() == Type::Void {
            self.tag(Tag::SignatureCc);
            self.number_u32(function.calling_conv);
        }

        self.type_hash(&function.ty);
        // Enumerate the arguments in passing order so they claim the first
        // serial numbers.
        self.tag(Tag::SignatureArg);
        for index in 0..function.num_params() {
            self.value_hash(&Value::Argument(index as u32));
        }
    }

    fn instruction_hash(&mut self, inst: &Instruction) {
        self.tag(Tag::Instruction);
        self.number_u32(inst.opcode as u32);
        self.type_hash(&inst.ty);
        self.number_u32(inst.subclass_data);

        for operand in &inst.operands {
            self.type_hash(&operand.ty);
            self.value_hash(&operand.value);
        }

        match &inst.extra {
            InstExtra::None => {}
            InstExtra::GetElementPtr { source_element_ty } => {
                self.tag(Tag::GetElementPtrInst);
                self.type_hash(source_element_ty);
            }
            InstExtra::Alloca {
                allocated_ty,
                align,
            } => {
                self.tag(Tag::AllocaInst);
                self.type_hash(allocated_ty);
                self.number_u32(*align);
            }
            InstExtra::Load {
                volatile,
                align,
                ordering,
                sync_scope,
                range,
            } => {
                self.tag(Tag::LoadInst);
                self.flag(*volatile);
                self.number_u32(*align);
                self.ordering_hash(*ordering);
                self.byte(*sync_scope as u8);
                self.range_metadata_hash(range.as_ref());
            }
            InstExtra::Store {
                volatile,
                align,
                ordering,
                sync_scope,
            } => {
                self.tag(Tag::StoreInst);
                self.flag(*volatile);
                self.number_u32(*align);
                self.ordering_hash(*ordering);
                self.byte(*sync_scope as u8);
            }
            InstExtra::Cmp { predicate } => {
                self.tag(Tag::CmpInst);
                self.byte(*predicate);
            }
            InstExtra::Call {
                tail_call,
                attributes,
                bundles,
                range,
                callee,
            } => {
                self.tag(Tag::CallInst);
                self.flag(*tail_call);
                self.attribute_list_hash(attributes);
                self.operand_bundles_hash(bundles);
                self.range_metadata_hash(range.as_ref());
                if let Some(callee) = callee {
                    self.mem_hash(callee.as_bytes());
                }
            }
            InstExtra::Invoke {
                calling_conv,
                attributes,
                bundles,
                range,
                callee,
            } => {
                self.tag(Tag::InvokeInst);
                self.number_u32(*calling_conv);
                self.attribute_list_hash(attributes);
                self.operand_bundles_hash(bundles);
                self.range_metadata_hash(range.as_ref());
                if let Some(callee) = callee {
                    self.mem_hash(callee.as_bytes());
                }
            }
            InstExtra::InsertValue { indices } => {
                self.tag(Tag::InsertValueInst);
                for index in indices {
                    self.number_u32(*index);
                }
            }
            InstExtra::ExtractValue { indices } => {
                self.tag(Tag::ExtractValueInst);
                for index in indices {
                    self.number_u32(*index);
                }
            }
            InstExtra::Fence {
                ordering,
                sync_scope,
            } => {
                self.tag(Tag::FenceInst);
                self.ordering_hash(*ordering);
                self.byte(*sync_scope as u8);
            }
            InstExtra::CmpXchg {
                volatile,
                weak,
                success_ordering,
                failure_ordering,
                sync_scope,
            } => {
                self.tag(Tag::AtomicCmpXchgInst);
                self.flag(*volatile);
                self.flag(*weak);
                self.ordering_hash(*success_ordering);
                self.ordering_hash(*failure_ordering);
                self.byte(*sync_scope as u8);
            }
            InstExtra::AtomicRmw {
                operation,
                volatile,
                ordering,
                sync_scope,
            } => {
                self.tag(Tag::AtomicRmwInst);
                self.byte(*operation);
                self.flag(*volatile);
                self.ordering_hash(*ordering);
                self.byte(*sync_scope as u8);
            }
            InstExtra::Phi { incoming_blocks } => {
                self.tag(Tag::PhiNode);
                // The incoming values are ordinary operands; the incoming
                // blocks must match as well.
                for block in incoming_blocks {
                    self.value_hash(&Value::Block(*block));
                }
            }
        }
    }
}
