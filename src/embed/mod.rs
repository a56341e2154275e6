//! Embedding a DLL into an executable.
//!
//! [`Embedder::embed`] maps a guest DLL into free address space of a host executable so
//! the guest runs without being a separate file. The stages run in this order:
//!
//! 1. **Validate** - guest is a DLL, host an executable, same supported machine, the guest
//!    can be rebased and the host has an entry point
//! 2. **Reserve** - the lowest host gap of the guest's `SizeOfImage`
//! 3. **Transplant** - copy every guest section to `embed_base + VirtualAddress`
//! 4. **Merge** - imports always; exports, delay imports, resources and the exception
//!    table per [`EmbedOptions`]
//! 5. **Rebase** - apply the guest's base relocations for its new address
//! 6. **Inject** - optionally resolve host imports of the guest to the transplanted code
//! 7. **TLS** - private TLS block in the `.meta` section, `fs:[0x2C]` rewrites on x86
//! 8. **Trampoline** - new entry point calling TLS callbacks and `DllMain` before
//!    jumping to the previous entry point
//!
//! Every stage reports what it did in the returned [`EmbedReport`]. An error leaves the
//! host partially modified; callers that need to retry should embed into a fresh parse.
//!
//! # Examples
//!
//! ```rust,no_run
//! use peweld::{EmbedOptions, Embedder, PeImage};
//! use std::path::Path;
//!
//! let mut host = PeImage::from_file(Path::new("app.exe"))?;
//! let guest = PeImage::from_file(Path::new("plugin.dll"))?;
//!
//! let report = Embedder::new(&mut host)
//!     .with_options(EmbedOptions::default().with_inject_imports(true))
//!     .embed(&guest, "plugin.dll")?;
//! println!("{report}");
//!
//! host.write_to_file(Path::new("app.embedded.exe"))?;
//! # Ok::<(), peweld::Error>(())
//! ```

mod inject;
mod link;
mod merge;
mod meta;
mod options;
mod rebase;
mod report;
mod stub;
mod tls;
mod transplant;

pub use link::LinkMap;
pub use options::EmbedOptions;
pub use report::EmbedReport;

use log::{info, warn};

use crate::{
    codegen::{EntryRestore, TlsSetup, TrampolinePlan},
    image::{
        headers::{Machine, COFF_HEADER_SIZE, ENTRY_POINT_OFFSET},
        EntryPoint, PeImage,
    },
    Error, Result,
};

use meta::{build_meta, MetaBlock, MetaRequest};
use tls::TLS_HELPERS;

/// `KERNEL32.dll` function used to unprotect the mapped headers.
const VIRTUAL_PROTECT: &str = "VirtualProtect";

/// Embeds guest DLLs into one host executable.
///
/// Several guests can be embedded one after the other; each gets its own trampoline that
/// chains to the entry point left by the previous one.
pub struct Embedder<'a> {
    host: &'a mut PeImage,
    options: EmbedOptions,
}

impl<'a> Embedder<'a> {
    /// An embedder with [`EmbedOptions::default`].
    pub fn new(host: &'a mut PeImage) -> Self {
        Embedder {
            host,
            options: EmbedOptions::default(),
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: EmbedOptions) -> Self {
        self.options = options;
        self
    }

    /// The options in effect.
    #[must_use]
    pub fn options(&self) -> &EmbedOptions {
        &self.options
    }

    /// Embed `guest` under `guest_name`, the name host imports refer to it by.
    ///
    /// # Errors
    /// - [`Error::NotADll`], [`Error::NotAnExecutable`], [`Error::ArchitectureMismatch`],
    ///   [`Error::UnsupportedMachine`], [`Error::RelocationsStripped`] and
    ///   [`Error::MissingEntryPoint`] if the pair fails validation
    /// - [`Error::NoAddressSpace`] if the host has no room for the guest, `.meta` or the
    ///   trampoline
    /// - [`Error::UnsupportedRelocation`] for guest relocations that cannot be applied
    /// - [`Error::Codegen`] if the trampoline cannot be assembled
    pub fn embed(&mut self, guest: &PeImage, guest_name: &str) -> Result<EmbedReport> {
        validate(self.host, guest)?;
        let previous_entry = self
            .host
            .entry_point_rva()
            .ok_or(Error::MissingEntryPoint)?;

        let embed_base = transplant::reserve(self.host, guest)?;
        let link = transplant::transplant_sections(self.host, guest, embed_base)?;
        info!(
            "embedding {guest_name} at {embed_base:#x} ({:#x} bytes)",
            guest.size_of_image()
        );

        let mut report = EmbedReport {
            guest_name: guest_name.to_string(),
            embed_base,
            sections: link.len(),
            previous_entry,
            ..EmbedReport::default()
        };

        if self.host.clear_certificates() {
            warn!("host signature removed, the output is unsigned");
        }

        merge::merge_imports(self.host, guest, &link, &mut report)?;
        if self.options.merge_exports {
            merge::merge_exports(self.host, guest, &link, &mut report)?;
        }
        if self.options.merge_delay_imports {
            merge::merge_delay_imports(self.host, guest, &link, &mut report)?;
        }
        if self.options.merge_resources {
            merge::merge_resources(self.host, guest, &link, &mut report)?;
        }

        report.relocations_applied = rebase::apply_relocations(self.host, guest, &link)?;

        if self.options.merge_exception_table {
            merge::merge_exception_table(self.host, guest, &link, &mut report)?;
        }
        if self.options.inject_imports {
            inject::inject_imports(self.host, guest, guest_name, embed_base, &mut report)?;
        }

        let plan = self.plan_trampoline(guest, &link, previous_entry, &mut report)?;
        let stub_rva = stub::place_trampoline(self.host, &self.options.stub_section_name, plan)?;
        let entry = self
            .host
            .data_ref(stub_rva, 1)
            .ok_or_else(|| internal_error!("trampoline entry {:#x} is not mapped", stub_rva))?;
        self.host.set_entry_point(entry);
        report.stub_rva = stub_rva;

        info!(
            "{guest_name} embedded, entry point {previous_entry:#x} -> {stub_rva:#x}"
        );
        Ok(report)
    }

    /// Build `.meta`, patch TLS accesses and work out what the trampoline must do.
    fn plan_trampoline(
        &mut self,
        guest: &PeImage,
        link: &LinkMap,
        previous_entry: u32,
        report: &mut EmbedReport,
    ) -> Result<TrampolinePlan> {
        let host = &mut *self.host;
        let image_base = host.image_base();
        let va = |rva: u32| image_base + u64::from(rva);
        let bitness = if host.is_pe32_plus() { 64 } else { 32 };

        let guest_tls = guest.tls();
        let private_tls = guest_tls.filter(|_| self.options.patch_static_tls);

        let mut request = MetaRequest::default();
        if self.options.fix_entry_point {
            request.helpers.push(VIRTUAL_PROTECT);
        }
        if let Some(tls) = private_tls {
            request.block = Some(tls::template_copy(host, link, tls)?);
            if bitness == 64 {
                request.helpers.extend(TLS_HELPERS);
            } else {
                request.pointer_table = true;
            }
        }
        let meta = build_meta(host, &self.options.meta_section_name, request)?.unwrap_or_default();

        let mut plan = TrampolinePlan::new(bitness, 0, va(previous_entry));

        if self.options.fix_entry_point {
            let slot = meta
                .helper(VIRTUAL_PROTECT)
                .ok_or_else(|| internal_error!("{} has no IAT slot", VIRTUAL_PROTECT))?;
            plan.restore_entry = Some(EntryRestore {
                field_va: va(host.pe_offset() + 4 + COFF_HEADER_SIZE + ENTRY_POINT_OFFSET),
                entry_rva: previous_entry,
                virtual_protect_iat: va(slot),
            });
        }

        if let Some(tls) = private_tls {
            if let Some(table) = meta.pointer_table {
                report.tls_patches = tls::patch_fs_accesses(host, guest, link, va(table))?;
            } else {
                tls::patch_fs_accesses(host, guest, link, 0)?;
            }
            if let Some(index) = link.translate(tls.index).try_rva(host.sections()) {
                plan.tls.push(tls_setup(&meta, bitness, va(index), &va)?);
            }
        }

        if let Some(tls) = guest_tls {
            for callback in &tls.callbacks {
                match link.translate(*callback).try_rva(host.sections()) {
                    Some(rva) => plan.callbacks.push(va(rva)),
                    None => warn!("skipping TLS callback outside the guest sections"),
                }
            }
            report.tls_callbacks = plan.callbacks.len();
        }

        match guest.entry_point() {
            EntryPoint::Mapped(entry) => {
                if let Some(rva) = link.translate(entry).try_rva(host.sections()) {
                    plan.dll_mains.push(va(rva));
                    report.dll_main = Some(rva);
                }
            }
            EntryPoint::Unmapped(rva) => {
                warn!("guest entry point {rva:#x} is outside its sections, DllMain is not called");
            }
            EntryPoint::None => {}
        }

        Ok(plan)
    }
}

/// TLS index initialization for the guest's index slot at `index_va`.
fn tls_setup(
    meta: &MetaBlock,
    bitness: u32,
    index_va: u64,
    va: &impl Fn(u32) -> u64,
) -> Result<TlsSetup> {
    if bitness == 32 {
        return Ok(TlsSetup::FixedIndex { index_va });
    }
    let missing = || internal_error!("TLS helpers missing from .meta");
    let [alloc, set_value] = TLS_HELPERS;
    Ok(TlsSetup::Allocated {
        index_va,
        template_va: va(meta.block.ok_or_else(missing)?),
        tls_alloc_iat: va(meta.helper(alloc).ok_or_else(missing)?),
        tls_set_value_iat: va(meta.helper(set_value).ok_or_else(missing)?),
    })
}

/// Check that `guest` can be embedded into `host`.
fn validate(host: &PeImage, guest: &PeImage) -> Result<()> {
    if !guest.is_dll() {
        return Err(Error::NotADll);
    }
    if host.is_dll() {
        return Err(Error::NotAnExecutable);
    }
    if host.machine() != guest.machine() {
        return Err(Error::ArchitectureMismatch {
            host: host.machine(),
            guest: guest.machine(),
        });
    }
    let machine = Machine::from_repr(guest.machine())
        .filter(|machine| matches!(machine, Machine::I386 | Machine::Amd64))
        .ok_or(Error::UnsupportedMachine(guest.machine()))?;
    // x64 code is mostly RIP relative, so a guest without relocations may still work there
    if machine == Machine::I386 && !guest.is_relocatable() {
        return Err(Error::RelocationsStripped);
    }
    if host.entry_point_rva().is_none() {
        return Err(Error::MissingEntryPoint);
    }
    Ok(())
}
