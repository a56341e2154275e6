//! The entry stub that initializes embedded guests before the host runs.
//!
//! A stub does, in order:
//!
//! 1. optionally writes the previous entry RVA back into the in-memory optional header,
//!    bracketed by two `VirtualProtect` calls,
//! 2. sets up the guest's TLS index,
//! 3. calls each TLS callback and then `DllMain` with `(0, DLL_PROCESS_ATTACH, 0)`,
//! 4. jumps to the previous entry point.
//!
//! All targets are given as virtual addresses at the preferred image base.

use std::collections::BTreeSet;

use iced_x86::{
    code_asm::{
        dword_ptr, eax, ecx, edx, esp, qword_ptr, r8d, r9, rax, rcx, rsp, CodeAssembler,
    },
    BlockEncoderOptions, Code, Instruction, Register,
};

use crate::{
    codegen::{find_fixups, CodeBlob},
    Error, Result,
};

const DLL_PROCESS_ATTACH: i32 = 1;
const PAGE_READWRITE: i32 = 0x04;
/// Home space for four register arguments, plus alignment to 16 bytes after the return address.
const X64_FRAME: i32 = 0x28;

/// Restore of `AddressOfEntryPoint` in the mapped headers.
///
/// Some runtimes read the entry point back from the loaded image; this puts the host's
/// original value back before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRestore {
    /// Virtual address of the `AddressOfEntryPoint` field
    pub field_va: u64,
    /// Value to store
    pub entry_rva: u32,
    /// Virtual address of the `VirtualProtect` IAT slot
    pub virtual_protect_iat: u64,
}

/// How the stub initializes a guest's TLS index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSetup {
    /// Store 0 into the slot; the patched guest code reads its block through a one-entry table.
    FixedIndex {
        /// Virtual address of the guest's index variable
        index_va: u64,
    },
    /// Allocate an index with `TlsAlloc` and bind the template copy to it with `TlsSetValue`.
    Allocated {
        /// Virtual address of the guest's index variable
        index_va: u64,
        /// Virtual address of the template copy
        template_va: u64,
        /// Virtual address of the `TlsAlloc` IAT slot
        tls_alloc_iat: u64,
        /// Virtual address of the `TlsSetValue` IAT slot
        tls_set_value_iat: u64,
    },
}

/// Everything the stub needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrampolinePlan {
    /// 32 or 64
    pub bitness: u32,
    /// Virtual address the stub is assembled for
    pub base_va: u64,
    /// Optional header restore
    pub restore_entry: Option<EntryRestore>,
    /// TLS index setups, one per guest that has TLS
    pub tls: Vec<TlsSetup>,
    /// TLS callbacks to run before the entry routines
    pub callbacks: Vec<u64>,
    /// Guest entry routines
    pub dll_mains: Vec<u64>,
    /// Where control goes afterwards
    pub next_entry: u64,
}

impl TrampolinePlan {
    /// A plan that only jumps to `next_entry`.
    #[must_use]
    pub fn new(bitness: u32, base_va: u64, next_entry: u64) -> Self {
        TrampolinePlan {
            bitness,
            base_va,
            restore_entry: None,
            tls: Vec::new(),
            callbacks: Vec::new(),
            dll_mains: Vec::new(),
            next_entry,
        }
    }

    /// Absolute addresses the stub loads into registers.
    fn addresses(&self) -> BTreeSet<u64> {
        let mut addresses = BTreeSet::new();
        if let Some(restore) = &self.restore_entry {
            addresses.insert(restore.field_va);
            addresses.insert(restore.virtual_protect_iat);
        }
        for setup in &self.tls {
            match *setup {
                TlsSetup::FixedIndex { index_va } => {
                    addresses.insert(index_va);
                }
                TlsSetup::Allocated {
                    index_va,
                    template_va,
                    tls_alloc_iat,
                    tls_set_value_iat,
                } => {
                    addresses.extend([index_va, template_va, tls_alloc_iat, tls_set_value_iat]);
                }
            }
        }
        addresses
    }
}

/// Assemble `plan` at its `base_va`.
///
/// # Errors
/// Returns [`Error::NotSupported`] for a bitness other than 32 or 64, and
/// [`Error::Codegen`] if the encoder rejects an instruction or a target is out of range.
pub fn assemble_trampoline(plan: &TrampolinePlan) -> Result<CodeBlob> {
    let mut a = CodeAssembler::new(plan.bitness)?;
    let mut entry = a.create_label();
    a.set_label(&mut entry)?;

    match plan.bitness {
        32 => emit_x86(&mut a, plan)?,
        64 => emit_x64(&mut a, plan)?,
        _ => return Err(Error::NotSupported),
    }

    let result = a.assemble_options(
        plan.base_va,
        BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
    )?;
    let entry_offset = result.label_ip(&entry)? - plan.base_va;
    let bytes = result.inner.code_buffer;

    let fixups = find_fixups(&bytes, plan.bitness, plan.base_va, &plan.addresses());
    Ok(CodeBlob {
        base_va: plan.base_va,
        bytes,
        entry_offset: u32::try_from(entry_offset).map_err(|_| Error::OutOfBounds)?,
        fixups,
    })
}

fn va32(va: u64) -> Result<u32> {
    u32::try_from(va).map_err(|_| internal_error!("{:#x} is not a 32-bit address", va))
}

fn emit_x86(a: &mut CodeAssembler, plan: &TrampolinePlan) -> Result<()> {
    if let Some(restore) = &plan.restore_entry {
        let field = va32(restore.field_va)?;
        let protect = va32(restore.virtual_protect_iat)?;

        // [esp] receives the previous protection
        a.sub(esp, 4)?;
        virtual_protect_x86(a, field, protect, None)?;
        a.mov(eax, field)?;
        a.mov(dword_ptr(eax), restore.entry_rva)?;
        virtual_protect_x86(a, field, protect, Some(4))?;
        a.add(esp, 4)?;
    }

    for setup in &plan.tls {
        match *setup {
            TlsSetup::FixedIndex { index_va } => {
                a.mov(eax, va32(index_va)?)?;
                a.mov(dword_ptr(eax), 0)?;
            }
            TlsSetup::Allocated {
                index_va,
                template_va,
                tls_alloc_iat,
                tls_set_value_iat,
            } => {
                a.mov(eax, va32(tls_alloc_iat)?)?;
                a.call(dword_ptr(eax))?;
                a.mov(ecx, va32(index_va)?)?;
                a.mov(dword_ptr(ecx), eax)?;
                a.mov(ecx, va32(template_va)?)?;
                a.push(ecx)?;
                a.push(eax)?;
                a.mov(eax, va32(tls_set_value_iat)?)?;
                a.call(dword_ptr(eax))?;
            }
        }
    }

    for target in plan.callbacks.iter().chain(&plan.dll_mains) {
        a.push(0)?;
        a.push(DLL_PROCESS_ATTACH)?;
        a.push(0)?;
        a.call(*target)?;
    }

    a.jmp(plan.next_entry)?;
    Ok(())
}

/// `VirtualProtect(field, 4, protection, &[esp])`, where the protection is either
/// `PAGE_READWRITE` or the dword at `[esp + n]` after the first push.
fn virtual_protect_x86(
    a: &mut CodeAssembler,
    field: u32,
    protect_iat: u32,
    previous_at: Option<i32>,
) -> Result<()> {
    a.mov(eax, esp)?;
    a.push(eax)?;
    match previous_at {
        Some(displacement) => a.push(dword_ptr(esp + displacement))?,
        None => a.push(PAGE_READWRITE)?,
    }
    a.push(4)?;
    a.mov(eax, field)?;
    a.push(eax)?;
    a.mov(eax, protect_iat)?;
    a.call(dword_ptr(eax))?;
    Ok(())
}

/// `mov reg, imm64` even for small values, so every address has a relocatable field.
fn load_address(a: &mut CodeAssembler, register: Register, va: u64) -> Result<()> {
    a.add_instruction(Instruction::with2(Code::Mov_r64_imm64, register, va)?)?;
    Ok(())
}

fn emit_x64(a: &mut CodeAssembler, plan: &TrampolinePlan) -> Result<()> {
    a.sub(rsp, X64_FRAME)?;

    if let Some(restore) = &plan.restore_entry {
        // [rsp + 0x20] receives the previous protection
        load_address(a, Register::RCX, restore.field_va)?;
        a.mov(edx, 4)?;
        a.mov(r8d, PAGE_READWRITE)?;
        a.lea(r9, qword_ptr(rsp + 0x20))?;
        load_address(a, Register::RAX, restore.virtual_protect_iat)?;
        a.call(qword_ptr(rax))?;

        load_address(a, Register::RAX, restore.field_va)?;
        a.mov(dword_ptr(rax), restore.entry_rva)?;

        load_address(a, Register::RCX, restore.field_va)?;
        a.mov(edx, 4)?;
        a.mov(r8d, dword_ptr(rsp + 0x20))?;
        a.lea(r9, qword_ptr(rsp + 0x20))?;
        load_address(a, Register::RAX, restore.virtual_protect_iat)?;
        a.call(qword_ptr(rax))?;
    }

    for setup in &plan.tls {
        match *setup {
            TlsSetup::FixedIndex { index_va } => {
                load_address(a, Register::RAX, index_va)?;
                a.mov(dword_ptr(rax), 0)?;
            }
            TlsSetup::Allocated {
                index_va,
                template_va,
                tls_alloc_iat,
                tls_set_value_iat,
            } => {
                load_address(a, Register::RAX, tls_alloc_iat)?;
                a.call(qword_ptr(rax))?;
                load_address(a, Register::RCX, index_va)?;
                a.mov(dword_ptr(rcx), eax)?;
                a.mov(ecx, eax)?;
                load_address(a, Register::RDX, template_va)?;
                load_address(a, Register::RAX, tls_set_value_iat)?;
                a.call(qword_ptr(rax))?;
            }
        }
    }

    for target in plan.callbacks.iter().chain(&plan.dll_mains) {
        a.xor(ecx, ecx)?;
        a.mov(edx, DLL_PROCESS_ATTACH)?;
        a.xor(r8d, r8d)?;
        a.call(*target)?;
    }

    a.add(rsp, X64_FRAME)?;
    a.jmp(plan.next_entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directories::relocations::RelocationType;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn decode(blob: &CodeBlob, bitness: u32) -> Vec<Instruction> {
        let mut decoder =
            Decoder::with_ip(bitness, &blob.bytes, blob.base_va, DecoderOptions::NONE);
        let mut instructions = Vec::new();
        while decoder.can_decode() {
            instructions.push(decoder.decode());
        }
        instructions
    }

    fn call_targets(instructions: &[Instruction]) -> Vec<u64> {
        instructions
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Call && i.is_call_near())
            .map(Instruction::near_branch_target)
            .collect()
    }

    fn read_u32(blob: &CodeBlob, offset: u32) -> u32 {
        let at = offset as usize;
        u32::from_le_bytes(blob.bytes[at..at + 4].try_into().unwrap())
    }

    fn read_u64(blob: &CodeBlob, offset: u32) -> u64 {
        let at = offset as usize;
        u64::from_le_bytes(blob.bytes[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn x86_calls_callbacks_then_entry_then_jumps() {
        let mut plan = TrampolinePlan::new(32, 0x40_8000, 0x40_1000);
        plan.tls.push(TlsSetup::FixedIndex {
            index_va: 0x40_7020,
        });
        plan.callbacks.push(0x40_5020);
        plan.dll_mains.push(0x40_5000);

        let blob = assemble_trampoline(&plan).unwrap();
        assert_eq!(blob.entry_offset, 0);

        let instructions = decode(&blob, 32);
        assert_eq!(call_targets(&instructions), vec![0x40_5020, 0x40_5000]);

        let last = instructions.last().unwrap();
        assert_eq!(last.mnemonic(), Mnemonic::Jmp);
        assert_eq!(last.near_branch_target(), 0x40_1000);

        // mov eax, index ; mov dword [eax], 0
        assert_eq!(instructions[0].mnemonic(), Mnemonic::Mov);
        assert_eq!(instructions[0].immediate32(), 0x40_7020);
        assert_eq!(blob.fixups.len(), 1);
        assert_eq!(blob.fixups[0].kind, RelocationType::HighLow);
        assert_eq!(read_u32(&blob, blob.fixups[0].offset), 0x40_7020);

        // Each call is preceded by three pushes
        let pushes = instructions
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Push)
            .count();
        assert_eq!(pushes, 6);
    }

    #[test]
    fn x86_entry_restore_relocates_header_and_iat() {
        let mut plan = TrampolinePlan::new(32, 0x40_8000, 0x40_1000);
        plan.restore_entry = Some(EntryRestore {
            field_va: 0x40_00A8,
            entry_rva: 0x1000,
            virtual_protect_iat: 0x40_2018,
        });

        let blob = assemble_trampoline(&plan).unwrap();
        let values: Vec<u32> = blob
            .fixups
            .iter()
            .map(|fixup| read_u32(&blob, fixup.offset))
            .collect();
        assert_eq!(
            values,
            vec![0x40_00A8, 0x40_2018, 0x40_00A8, 0x40_00A8, 0x40_2018]
        );

        let instructions = decode(&blob, 32);
        let indirect_calls = instructions
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Call && !i.is_call_near())
            .count();
        assert_eq!(indirect_calls, 2);
        assert_eq!(instructions.last().unwrap().mnemonic(), Mnemonic::Jmp);
    }

    #[test]
    fn x64_allocates_index_and_keeps_frame() {
        let base = 0x1_4000_8000;
        let mut plan = TrampolinePlan::new(64, base, 0x1_4000_1000);
        plan.tls.push(TlsSetup::Allocated {
            index_va: 0x1_4000_7020,
            template_va: 0x1_4000_9010,
            tls_alloc_iat: 0x1_4000_9000,
            tls_set_value_iat: 0x1_4000_9008,
        });
        plan.callbacks.push(0x1_4000_5020);
        plan.dll_mains.push(0x1_4000_5000);

        let blob = assemble_trampoline(&plan).unwrap();
        // sub rsp, 0x28
        assert_eq!(&blob.bytes[..4], &[0x48, 0x83, 0xEC, 0x28]);

        let instructions = decode(&blob, 64);
        assert_eq!(
            call_targets(&instructions),
            vec![0x1_4000_5020, 0x1_4000_5000]
        );
        let tail = &instructions[instructions.len() - 2..];
        assert_eq!(tail[0].mnemonic(), Mnemonic::Add);
        assert_eq!(tail[1].mnemonic(), Mnemonic::Jmp);
        assert_eq!(tail[1].near_branch_target(), 0x1_4000_1000);

        let values: BTreeSet<u64> = blob
            .fixups
            .iter()
            .inspect(|fixup| assert_eq!(fixup.kind, RelocationType::Dir64))
            .map(|fixup| read_u64(&blob, fixup.offset))
            .collect();
        assert_eq!(
            values,
            BTreeSet::from([0x1_4000_7020, 0x1_4000_9010, 0x1_4000_9000, 0x1_4000_9008])
        );
    }

    #[test]
    fn rejects_unknown_bitness() {
        let plan = TrampolinePlan::new(16, 0x1000, 0x2000);
        assert!(assemble_trampoline(&plan).is_err());
    }
}
