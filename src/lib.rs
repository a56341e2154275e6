// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory
// - 'file/output.rs' uses mmap for the output file

//! # peweld
//!
//! A library for reading, mutating and writing Windows PE/PE32+ images, and for welding a
//! DLL into an executable so the pair ships as one file.
//!
//! ## Features
//!
//! - **Byte-exact round trips** - An image that is parsed and written back without changes
//!   produces the same bytes
//! - **Reference based model** - Directories point into sections through handles instead of
//!   raw RVAs, so sections can be added and moved without dangling pointers
//! - **Typed directories** - Imports, exports, base relocations, TLS, resources, delay
//!   imports, debug entries, bound imports and exception tables
//! - **DLL embedding** - Map a DLL into free address space of an executable, rebase it,
//!   merge its directories and run it before the executable's own entry point
//! - **x86 and x64** - Entry trampolines are assembled with `iced-x86`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peweld::prelude::*;
//! use std::path::Path;
//!
//! let mut host = PeImage::from_file(Path::new("app.exe"))?;
//! let guest = PeImage::from_file(Path::new("plugin.dll"))?;
//!
//! let report = Embedder::new(&mut host).embed(&guest, "plugin.dll")?;
//! println!("guest mapped at {:#x}", report.embed_base);
//!
//! host.write_to_file(Path::new("app.welded.exe"))?;
//! # Ok::<(), peweld::Error>(())
//! ```
//!
//! ### Editing an image
//!
//! ```rust,no_run
//! use peweld::{image::{Section, SectionFlags}, PeImage};
//! use std::path::Path;
//!
//! let mut image = PeImage::from_file(Path::new("app.exe"))?;
//! let rva = image
//!     .sections()
//!     .find_section_space(0x100)
//!     .ok_or(peweld::Error::NoAddressSpace { size: 0x100 })?;
//! image.sections_mut().place_section(Section::with_address(
//!     ".extra",
//!     SectionFlags::DATA,
//!     rva,
//!     0x100,
//!     vec![0; 0x100],
//! ))?;
//! let bytes = image.to_bytes()?;
//! # Ok::<(), peweld::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`image`] - The [`PeImage`] model: headers, sections, section handles and the writer
//! - [`directories`] - Typed data directories and their encoders
//! - [`codegen`] - Entry trampoline assembly
//! - [`embed`] - The [`Embedder`] and its stages
//! - [`prelude`] - Convenient re-exports of commonly used types
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`]. Every [`Error`] variant maps to a stable
//! process exit code through [`Error::exit_code`], which the command line tool uses.

#[macro_use]
pub(crate) mod error;
pub(crate) mod file;
pub(crate) mod utils;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use peweld::prelude::*;
///
/// let image = PeImage::from_file("app.exe".as_ref())?;
/// println!("{} sections", image.sections().len());
/// # Ok::<(), peweld::Error>(())
/// ```
pub mod prelude;

/// The PE image model.
///
/// See [`PeImage`] for parsing, mutation and serialization. Sections are held in a
/// [`image::SectionStore`] and referenced through [`image::DataRef`] handles.
pub mod image;

/// Typed data directories.
///
/// Each directory parses from its raw layout into a model that references section data
/// through [`image::DataRef`]s, and re-encodes into fresh space when it was modified.
///
/// # Examples
///
/// ```rust,no_run
/// use peweld::PeImage;
///
/// let image = PeImage::from_file("app.exe".as_ref())?;
/// if let Some(imports) = image.imports() {
///     for descriptor in &imports.descriptors {
///         println!("{}: {} entries", descriptor.dll_name, descriptor.entries.len());
///     }
/// }
/// # Ok::<(), peweld::Error>(())
/// ```
pub mod directories;

/// Machine code generation for entry trampolines.
pub mod codegen;

/// Embedding a DLL into an executable.
///
/// The [`Embedder`] runs the embedding stages against a host [`PeImage`]; [`EmbedOptions`]
/// selects the optional ones and [`EmbedReport`] summarizes what happened.
pub mod embed;

/// `peweld` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust,no_run
/// use peweld::{PeImage, Result};
///
/// fn load(path: &str) -> Result<PeImage> {
///     PeImage::from_file(std::path::Path::new(path))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `peweld` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use peweld::{Error, PeImage};
///
/// match PeImage::from_file(std::path::Path::new("app.exe")) {
///     Ok(image) => println!("{} sections", image.sections().len()),
///     Err(Error::NotSupported) => println!("Unsupported format"),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {}", message),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// A PE/PE32+ image.
pub use image::PeImage;

/// Embedding entry point and its configuration and result.
pub use embed::{EmbedOptions, EmbedReport, Embedder};

/// Raw input access.
///
/// # Example
///
/// ```rust,no_run
/// use peweld::File;
/// let file = File::from_file(std::path::Path::new("app.exe"))?;
/// println!("{} bytes", file.len());
/// # Ok::<(), peweld::Error>(())
/// ```
pub use file::File;

/// Bounds-checked little-endian reader over a byte slice.
pub use file::parser::Parser;
