//! Configuration of the optional embedding stages.

/// Which optional stages [`crate::Embedder`] runs, and the names of the sections it adds.
///
/// Validation, transplanting, import merging, rebasing and the entry trampoline always run.
///
/// # Examples
///
/// ```rust
/// use peweld::EmbedOptions;
///
/// let options = EmbedOptions::default()
///     .with_inject_imports(true)
///     .with_merge_resources(false);
/// assert!(options.inject_imports);
/// assert!(options.merge_exports);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct EmbedOptions {
    /// Append the guest's exports to the host export directory
    pub merge_exports: bool,

    /// Merge the guest's resource tree into the host's; guest leaves replace host leaves
    pub merge_resources: bool,

    /// Append the guest's delay-load descriptors to the host's
    pub merge_delay_imports: bool,

    /// Resolve host imports of the guest DLL directly to the transplanted code
    pub inject_imports: bool,

    /// Write the original entry point back into the mapped headers before the host runs
    pub fix_entry_point: bool,

    /// Give the guest a private TLS block (x86: rewrite `fs:[0x2C]` accesses; x64: allocate
    /// an index)
    pub patch_static_tls: bool,

    /// Append the guest's runtime functions to the host exception table (x64)
    pub merge_exception_table: bool,

    /// Name of the section holding helper imports and the TLS block copy
    pub meta_section_name: String,

    /// Name of the section holding the entry trampoline
    pub stub_section_name: String,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            merge_exports: true,
            merge_resources: true,
            merge_delay_imports: true,
            inject_imports: false,
            fix_entry_point: false,
            patch_static_tls: true,
            merge_exception_table: true,
            meta_section_name: ".meta".to_string(),
            stub_section_name: ".stub".to_string(),
        }
    }
}

impl EmbedOptions {
    /// Only the mandatory stages.
    ///
    /// The guest's code runs, but the host sees none of its exports, resources or
    /// delay-load descriptors, and a guest using static TLS will fault.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            merge_exports: false,
            merge_resources: false,
            merge_delay_imports: false,
            inject_imports: false,
            fix_entry_point: false,
            patch_static_tls: false,
            merge_exception_table: false,
            ..Self::default()
        }
    }

    /// Every optional stage, including import injection and the entry point restore.
    #[must_use]
    pub fn full() -> Self {
        Self {
            inject_imports: true,
            fix_entry_point: true,
            ..Self::default()
        }
    }

    /// Set [`EmbedOptions::merge_exports`].
    #[must_use]
    pub fn with_merge_exports(mut self, enabled: bool) -> Self {
        self.merge_exports = enabled;
        self
    }

    /// Set [`EmbedOptions::merge_resources`].
    #[must_use]
    pub fn with_merge_resources(mut self, enabled: bool) -> Self {
        self.merge_resources = enabled;
        self
    }

    /// Set [`EmbedOptions::merge_delay_imports`].
    #[must_use]
    pub fn with_merge_delay_imports(mut self, enabled: bool) -> Self {
        self.merge_delay_imports = enabled;
        self
    }

    /// Set [`EmbedOptions::inject_imports`].
    #[must_use]
    pub fn with_inject_imports(mut self, enabled: bool) -> Self {
        self.inject_imports = enabled;
        self
    }

    /// Set [`EmbedOptions::fix_entry_point`].
    #[must_use]
    pub fn with_fix_entry_point(mut self, enabled: bool) -> Self {
        self.fix_entry_point = enabled;
        self
    }

    /// Set [`EmbedOptions::patch_static_tls`].
    #[must_use]
    pub fn with_patch_static_tls(mut self, enabled: bool) -> Self {
        self.patch_static_tls = enabled;
        self
    }

    /// Set [`EmbedOptions::merge_exception_table`].
    #[must_use]
    pub fn with_merge_exception_table(mut self, enabled: bool) -> Self {
        self.merge_exception_table = enabled;
        self
    }

    /// Set both section names.
    #[must_use]
    pub fn with_section_names(mut self, meta: &str, stub: &str) -> Self {
        self.meta_section_name = meta.to_string();
        self.stub_section_name = stub.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        let minimal = EmbedOptions::minimal();
        assert!(!minimal.merge_exports && !minimal.patch_static_tls);
        assert_eq!(minimal.stub_section_name, ".stub");

        let full = EmbedOptions::full();
        assert!(full.inject_imports && full.fix_entry_point && full.merge_resources);

        let named = EmbedOptions::default().with_section_names(".gmeta", ".gstub");
        assert_eq!(named.meta_section_name, ".gmeta");
        assert_eq!(named.stub_section_name, ".gstub");
    }
}
