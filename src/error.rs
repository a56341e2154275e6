use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! internal_error {
    ($msg:expr) => {
        crate::Error::Internal {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Internal {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into four classes that callers usually want to tell apart:
///
/// ## Format errors
/// The input is not a PE image this crate can model, or a structure inside it is corrupt.
/// - [`Error::Malformed`] - Corrupted structure, with the source location that detected it
/// - [`Error::OutOfBounds`] - A read or write would have crossed a buffer boundary
/// - [`Error::NotSupported`] - Unsupported optional header magic or feature
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::UnsupportedRelocation`] - A base relocation type that cannot be rebased
///
/// ## Capability errors
/// The inputs are well formed but cannot be combined.
/// - [`Error::NotADll`], [`Error::NotAnExecutable`]
/// - [`Error::ArchitectureMismatch`], [`Error::UnsupportedMachine`]
/// - [`Error::RelocationsStripped`], [`Error::MissingEntryPoint`]
///
/// ## Resource exhaustion
/// - [`Error::NoAddressSpace`] - No gap of the requested size below the 2 GiB image limit
/// - [`Error::HeaderOverflow`] - The section table no longer fits in front of the first section
///
/// ## Internal consistency
/// - [`Error::Internal`] - An invariant of the image model was violated. These are bugs and are
///   never recovered from.
///
/// # Examples
///
/// ```rust,no_run
/// use peweld::{Error, PeImage};
/// use std::path::Path;
///
/// match PeImage::from_file(Path::new("host.exe")) {
///     Ok(image) => println!("{} sections", image.sections().len()),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed file: {} ({}:{})", message, file, line);
///     }
///     Err(error) => eprintln!("error: {error} (exit code {})", error.exit_code()),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // File parsing Errors
    /// The file is damaged and could not be parsed.
    ///
    /// This error indicates that a header, table or directory is corrupted or references data
    /// that does not exist. The error includes the source location where the malformation was
    /// detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    ///
    /// This error occurs when trying to read data beyond the end of a buffer. It's a safety
    /// check to prevent buffer overruns during parsing.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This file type is not supported.
    ///
    /// Indicates an optional header magic other than PE32 / PE32+, or a feature of the
    /// image this crate does not model.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// A base relocation of a type that cannot be rebased was found in a guest image.
    ///
    /// Only `HIGH`, `LOW`, `HIGHLOW` and `DIR64` entries can be carried over into a host;
    /// `ABSOLUTE` padding is skipped. The value is the raw 4-bit relocation type.
    #[error("Unsupported base relocation type {0}")]
    UnsupportedRelocation(u8),

    // Capability errors
    /// The image that was supposed to be embedded is not a DLL.
    #[error("Guest image is not a DLL")]
    NotADll,

    /// The image that was supposed to receive a guest is not an executable.
    #[error("Host image is not an executable")]
    NotAnExecutable,

    /// Host and guest were built for different machines.
    #[error("Architecture mismatch - host machine {host:#06x}, guest machine {guest:#06x}")]
    ArchitectureMismatch {
        /// COFF machine value of the host
        host: u16,
        /// COFF machine value of the guest
        guest: u16,
    },

    /// The machine type is not one the embedding engine can generate code for.
    #[error("Unsupported machine type {0:#06x}")]
    UnsupportedMachine(u16),

    /// A 32-bit guest carries no base relocations and cannot be moved to a new address.
    #[error("Guest image has no base relocations and cannot be rebased")]
    RelocationsStripped,

    /// An entry point was required but is absent or does not resolve into a section.
    #[error("Entry point is missing or does not resolve into a section")]
    MissingEntryPoint,

    // Resource exhaustion
    /// No free range of the requested size exists in the image address space.
    #[error("No free address space for {size:#x} bytes")]
    NoAddressSpace {
        /// The number of bytes that were requested
        size: u32,
    },

    /// The headers plus section table would overlap the first section.
    #[error("Headers of {needed:#x} bytes do not fit below the first section at {limit:#x}")]
    HeaderOverflow {
        /// Bytes required for the header block
        needed: u32,
        /// RVA of the first section
        limit: u32,
    },

    // Internal consistency
    /// An invariant of the image model was violated.
    ///
    /// Raised when, for example, a directory is serialized while it still references a
    /// section without a final address, or an allocation is claimed twice. This always
    /// indicates a bug in the caller or in this crate.
    #[error("Internal error - {file}:{line}: {message}")]
    Internal {
        /// Description of the violated invariant
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    // I/O and collaborators
    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur during file operations
    /// such as reading from disk, permission issues, or filesystem errors.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// Error from the goblin crate while cross-checking a written image.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// The trampoline assembler rejected an instruction sequence.
    #[error("Code generation failed - {0}")]
    Codegen(#[from] iced_x86::IcedError),

    /// Memory-mapped output file could not be created or written.
    #[error("Failed to write output - {message}")]
    WriteMmapFailed {
        /// Description of the failure
        message: String,
    },

    /// The output file could not be finalized.
    #[error("Failed to finalize output - {message}")]
    WriteFinalizationFailed {
        /// Description of the failure
        message: String,
    },
}

impl Error {
    /// Returns the process exit code reported by the command line tool for this error.
    ///
    /// Every error class maps to a distinct small negative integer so scripts can tell a
    /// bad input from an impossible combination or an internal failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::FileError(_)
            | Error::WriteMmapFailed { .. }
            | Error::WriteFinalizationFailed { .. } => -1,
            Error::Malformed { .. }
            | Error::OutOfBounds
            | Error::Empty
            | Error::NotSupported
            | Error::GoblinErr(_) => -2,
            Error::NotADll => -3,
            Error::NotAnExecutable => -4,
            Error::ArchitectureMismatch { .. } => -5,
            Error::UnsupportedMachine(_) => -6,
            Error::RelocationsStripped => -7,
            Error::UnsupportedRelocation(_) => -8,
            Error::MissingEntryPoint => -9,
            Error::NoAddressSpace { .. } | Error::HeaderOverflow { .. } => -10,
            Error::Codegen(_) => -11,
            Error::Internal { .. } | Error::Error(_) => -12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_macro_records_location() {
        let error = malformed_error!("bad descriptor at {:#x}", 0x2000);
        match error {
            Error::Malformed {
                message,
                file,
                line,
            } => {
                assert_eq!(message, "bad descriptor at 0x2000");
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn exit_codes_are_distinct_per_class() {
        let codes = [
            Error::Empty.exit_code(),
            Error::NotADll.exit_code(),
            Error::NotAnExecutable.exit_code(),
            Error::ArchitectureMismatch {
                host: 0x14c,
                guest: 0x8664,
            }
            .exit_code(),
            Error::UnsupportedMachine(0x1c0).exit_code(),
            Error::RelocationsStripped.exit_code(),
            Error::UnsupportedRelocation(5).exit_code(),
            Error::MissingEntryPoint.exit_code(),
            Error::NoAddressSpace { size: 1 }.exit_code(),
            internal_error!("broken").exit_code(),
        ];

        for (i, a) in codes.iter().enumerate() {
            assert!(*a < 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
