//! # peweld Prelude
//!
//! The types most programs need to load an image, inspect its directories and embed a DLL.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all peweld operations
pub use crate::Error;

/// The result type used throughout peweld
pub use crate::Result;

// ================================================================================================
// Image Model
// ================================================================================================

/// The image and the options of its writer
pub use crate::image::{EntryPoint, LayoutOptions, PeImage};

/// Sections and handles into them
pub use crate::image::{DataRef, Section, SectionFlags, SectionId, SectionStore};

/// Header fields
pub use crate::image::headers::{FileCharacteristics, ImageKind, Machine};

/// Low-level input access
pub use crate::{File, Parser};

// ================================================================================================
// Data Directories
// ================================================================================================

/// Slot indices and the directory union
pub use crate::directories::{Directory, DirectoryKind};

/// Imports and delay imports
pub use crate::directories::{
    delay::{DelayImportDescriptor, DelayImportDirectory},
    imports::{ImportDescriptor, ImportDirectory, ImportEntry},
};

/// Exports
pub use crate::directories::exports::{ExportDirectory, ExportTarget};

/// Base relocations
pub use crate::directories::relocations::{RelocationTable, RelocationType};

/// Thread local storage
pub use crate::directories::tls::TlsDirectory;

/// Resources
pub use crate::directories::resources::{ResourceDirectory, ResourceKey, ResourceNode};

/// Runtime function tables
pub use crate::directories::exceptions::{ExceptionTable, RuntimeFunction, UnwindData};

// ================================================================================================
// Embedding
// ================================================================================================

/// The embedding engine
pub use crate::embed::{EmbedOptions, EmbedReport, Embedder, LinkMap};

/// Trampoline generation
pub use crate::codegen::{assemble_trampoline, CodeBlob, TrampolinePlan};
