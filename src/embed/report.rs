//! What an embedding did.

use std::fmt;

use crate::directories::resources::ResourceCollision;

/// Summary of one [`crate::Embedder::embed`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    /// Name the guest was embedded under
    pub guest_name: String,
    /// RVA in the host where the guest image starts
    pub embed_base: u32,
    /// Number of transplanted sections
    pub sections: usize,
    /// Import descriptors added to the host
    pub imports_merged: usize,
    /// Export slots appended to the host
    pub exports_merged: usize,
    /// Guest export names not added because the host already exports them
    pub export_collisions: Vec<String>,
    /// Delay-load descriptors added to the host
    pub delay_imports_merged: usize,
    /// Host resources replaced by guest resources
    pub resource_collisions: Vec<ResourceCollision>,
    /// Guest base relocations applied
    pub relocations_applied: usize,
    /// Host import slots resolved by name
    pub injected_by_name: usize,
    /// Host import slots resolved by ordinal
    pub injected_by_ordinal: usize,
    /// `fs:[0x2C]` accesses rewritten
    pub tls_patches: usize,
    /// TLS callbacks called by the trampoline
    pub tls_callbacks: usize,
    /// Runtime functions appended to the host exception table
    pub exception_functions_merged: usize,
    /// RVA of the trampoline, the host's new entry point
    pub stub_rva: u32,
    /// Entry point the trampoline jumps to
    pub previous_entry: u32,
    /// RVA of the guest's `DllMain` in the host, if it has one
    pub dll_main: Option<u32>,
}

impl EmbedReport {
    /// Total number of import slots resolved to the guest.
    #[must_use]
    pub fn injected(&self) -> usize {
        self.injected_by_name + self.injected_by_ordinal
    }
}

impl fmt::Display for EmbedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} at {:#x}", self.guest_name, self.embed_base)?;
        writeln!(f, "  sections:       {}", self.sections)?;
        writeln!(f, "  imports:        {}", self.imports_merged)?;
        writeln!(
            f,
            "  exports:        {} ({} name collisions)",
            self.exports_merged,
            self.export_collisions.len()
        )?;
        writeln!(f, "  delay imports:  {}", self.delay_imports_merged)?;
        writeln!(
            f,
            "  resources:      {} replaced",
            self.resource_collisions.len()
        )?;
        writeln!(f, "  relocations:    {}", self.relocations_applied)?;
        writeln!(
            f,
            "  injected:       {} by name, {} by ordinal",
            self.injected_by_name, self.injected_by_ordinal
        )?;
        writeln!(
            f,
            "  tls:            {} patches, {} callbacks",
            self.tls_patches, self.tls_callbacks
        )?;
        writeln!(f, "  unwind entries: {}", self.exception_functions_merged)?;
        write!(
            f,
            "  entry:          {:#x} -> {:#x}",
            self.stub_rva, self.previous_entry
        )
    }
}
