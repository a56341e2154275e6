//! Exception directory (`IMAGE_DIRECTORY_ENTRY_EXCEPTION`).
//!
//! The runtime function table is an array of fixed-size records sorted by function start.
//! Its record layout depends on the machine; [`FORMATS`] maps each supported machine to
//! its [`RuntimeFunctionFormat`]. Records are kept as references so the table can be
//! rebuilt after functions were transplanted, and the encoder re-sorts by final RVA.

use goblin::pe::header::{
    COFF_MACHINE_ARM, COFF_MACHINE_ARM64, COFF_MACHINE_ARMNT, COFF_MACHINE_THUMB,
    COFF_MACHINE_X86_64,
};

use crate::{
    directories::{EncodeContext, Encoded, ParseContext},
    file::parser::Parser,
    image::DataRef,
    Error, Result,
};

/// Layout of one runtime function record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFunctionFormat {
    /// `BeginAddress`, `EndAddress`, `UnwindInfoAddress`
    Amd64,
    /// `BeginAddress`, packed unwind data or `.xdata` RVA
    Arm64,
    /// Same record layout as ARM64, Thumb-2 code
    ArmNt,
    /// Windows CE: `BeginAddress` and a packed prolog/function length word
    LegacyArm,
}

/// Machine → record format.
pub const FORMATS: [(u16, RuntimeFunctionFormat); 5] = [
    (COFF_MACHINE_X86_64, RuntimeFunctionFormat::Amd64),
    (COFF_MACHINE_ARM64, RuntimeFunctionFormat::Arm64),
    (COFF_MACHINE_ARMNT, RuntimeFunctionFormat::ArmNt),
    (COFF_MACHINE_ARM, RuntimeFunctionFormat::LegacyArm),
    (COFF_MACHINE_THUMB, RuntimeFunctionFormat::LegacyArm),
];

impl RuntimeFunctionFormat {
    /// Record format used by `machine`, if it has a runtime function table.
    #[must_use]
    pub fn for_machine(machine: u16) -> Option<Self> {
        FORMATS
            .iter()
            .find(|(candidate, _)| *candidate == machine)
            .map(|(_, format)| *format)
    }

    /// Size of one record in bytes.
    #[must_use]
    pub fn record_size(self) -> u32 {
        match self {
            RuntimeFunctionFormat::Amd64 => 12,
            _ => 8,
        }
    }
}

/// Where a function's unwind information is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindData {
    /// `UNWIND_INFO` / `.xdata` record
    Info(DataRef),
    /// x64 indirection: the unwind slot points at another runtime function record
    Chained(DataRef),
    /// Unwind data packed into the record itself
    Packed(u32),
}

/// One runtime function record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    /// First byte of the function
    pub begin: DataRef,
    /// Length in bytes for x64 records, `0` for formats that pack it
    pub length: u32,
    /// Unwind information
    pub unwind: UnwindData,
}

/// The runtime function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionTable {
    /// Record layout
    pub format: RuntimeFunctionFormat,
    /// Records, in table order
    pub functions: Vec<RuntimeFunction>,
}

/// `UNW_FLAG_EHANDLER`
pub const UNW_FLAG_EHANDLER: u8 = 0x1;
/// `UNW_FLAG_UHANDLER`
pub const UNW_FLAG_UHANDLER: u8 = 0x2;
/// `UNW_FLAG_CHAININFO`
pub const UNW_FLAG_CHAININFO: u8 = 0x4;

/// Offsets, relative to the start of an x64 `UNWIND_INFO`, of the fields holding RVAs:
/// the exception handler or the three RVAs of the chained runtime function.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `info` is too short to hold its unwind codes.
pub fn unwind_info_rva_fields(info: &[u8]) -> Result<Vec<u32>> {
    let header = info.get(..4).ok_or(Error::OutOfBounds)?;
    let flags = header[0] >> 3;
    let code_count = u32::from(header[2]);
    // Unwind codes are padded to an even count.
    let tail = 4 + ((code_count + 1) & !1) * 2;

    let mut fields = Vec::new();
    if flags & UNW_FLAG_CHAININFO != 0 {
        fields.extend([tail, tail + 4, tail + 8]);
    } else if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
        fields.push(tail);
    }
    if let Some(last) = fields.last() {
        if info.len() < (*last + 4) as usize {
            return Err(Error::OutOfBounds);
        }
    }
    Ok(fields)
}

impl ExceptionTable {
    /// An empty table for `machine`.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedMachine`] for machines without runtime functions.
    pub fn new(machine: u16) -> Result<Self> {
        let format = RuntimeFunctionFormat::for_machine(machine)
            .ok_or(Error::UnsupportedMachine(machine))?;
        Ok(ExceptionTable {
            format,
            functions: Vec::new(),
        })
    }

    /// Parse `size / record_size` records at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedMachine`] for machines without a known format and
    /// [`crate::Error::Malformed`] for records referencing unmapped code.
    pub fn parse(ctx: &ParseContext, rva: u32, size: u32) -> Result<Self> {
        let mut table = ExceptionTable::new(ctx.machine())?;
        let record = table.format.record_size();
        let count = size / record;
        let raw = ctx.read(rva, count * record)?;
        let mut parser = Parser::new(&raw);

        for _ in 0..count {
            let begin = parser.read_le::<u32>()?;
            let function = match table.format {
                RuntimeFunctionFormat::Amd64 => {
                    let end = parser.read_le::<u32>()?;
                    let unwind = parser.read_le::<u32>()?;
                    let length = end.saturating_sub(begin);
                    let unwind = if unwind & 1 != 0 {
                        UnwindData::Chained(ctx.data_ref(unwind & !1, record)?)
                    } else {
                        UnwindData::Info(ctx.data_ref(unwind, 4)?)
                    };
                    RuntimeFunction {
                        begin: ctx.data_ref(begin, length)?,
                        length,
                        unwind,
                    }
                }
                RuntimeFunctionFormat::Arm64 | RuntimeFunctionFormat::ArmNt => {
                    let word = parser.read_le::<u32>()?;
                    let unwind = if word & 0x3 == 0 {
                        UnwindData::Info(ctx.data_ref(word, 4)?)
                    } else {
                        UnwindData::Packed(word)
                    };
                    // Thumb-2 starts carry the interworking bit.
                    RuntimeFunction {
                        begin: ctx.data_ref(begin & !1, 1)?,
                        length: 0,
                        unwind,
                    }
                }
                RuntimeFunctionFormat::LegacyArm => RuntimeFunction {
                    begin: ctx.data_ref(begin, 1)?,
                    length: 0,
                    unwind: UnwindData::Packed(parser.read_le::<u32>()?),
                },
            };
            table.functions.push(function);
        }
        Ok(table)
    }

    /// Encode the records sorted by final start address.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if a reference can not be resolved.
    pub fn encode(&self, ctx: &EncodeContext) -> Result<Encoded> {
        let mut records = Vec::with_capacity(self.functions.len());
        for function in &self.functions {
            let begin = ctx.rva_of(&function.begin)?;
            let mut words = Vec::with_capacity(3);
            match self.format {
                RuntimeFunctionFormat::Amd64 => {
                    words.push(begin);
                    words.push(begin + function.length);
                }
                RuntimeFunctionFormat::ArmNt => words.push(begin | 1),
                RuntimeFunctionFormat::Arm64 | RuntimeFunctionFormat::LegacyArm => {
                    words.push(begin);
                }
            }
            words.push(match function.unwind {
                UnwindData::Info(data) => ctx.rva_of(&data)?,
                UnwindData::Chained(data) => ctx.rva_of(&data)? | 1,
                UnwindData::Packed(word) => word,
            });
            records.push((begin, words));
        }
        records.sort_by_key(|(begin, _)| *begin);

        let mut bytes = Vec::with_capacity(records.len() * self.format.record_size() as usize);
        for (_, words) in records {
            for word in words {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        Ok(Encoded::new(bytes))
    }
}
