//! Thread local storage directory (`IMAGE_DIRECTORY_ENTRY_TLS`).
//!
//! All pointers in the TLS directory are absolute virtual addresses, so every non-null
//! field of an encoded directory (and every callback in the callback array emitted next
//! to it) is reported as an absolute field needing a base relocation.

use crate::{
    directories::{EncodeContext, Encoded, ParseContext},
    file::io::read_le_at_dyn,
    file::parser::Parser,
    image::DataRef,
    Result,
};

/// Upper bound of callbacks read from a file.
const MAX_CALLBACKS: usize = 0x1000;

/// The TLS directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsDirectory {
    /// Template data copied into each thread's block; its size is the template length
    pub raw_data: DataRef,
    /// Slot the loader stores the TLS index in
    pub index: DataRef,
    /// Callbacks invoked on process/thread attach and detach
    pub callbacks: Vec<DataRef>,
    /// Zero bytes appended to the template
    pub size_of_zero_fill: u32,
    /// Alignment characteristics
    pub characteristics: u32,
}

impl TlsDirectory {
    /// Size of the directory structure itself.
    #[must_use]
    pub fn structure_size(pe32_plus: bool) -> u32 {
        if pe32_plus {
            40
        } else {
            24
        }
    }

    /// Length of the template data.
    #[must_use]
    pub fn template_size(&self) -> u32 {
        self.raw_data.size().unwrap_or(0)
    }

    /// Parse the directory at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if an address lies outside the image.
    pub fn parse(ctx: &ParseContext, rva: u32, _size: u32) -> Result<Self> {
        let wide = ctx.pe32_plus();
        let raw = ctx.read(rva, Self::structure_size(wide))?;
        let mut parser = Parser::new(&raw);
        let start = parser.read_le_dyn(wide)?;
        let end = parser.read_le_dyn(wide)?;
        let index = parser.read_le_dyn(wide)?;
        let callbacks = parser.read_le_dyn(wide)?;
        let size_of_zero_fill = parser.read_le::<u32>()?;
        let characteristics = parser.read_le::<u32>()?;

        let raw_data = if start == 0 || end <= start {
            DataRef::null()
        } else {
            let len = u32::try_from(end - start)
                .map_err(|_| malformed_error!("TLS template of {:#x} bytes", end - start))?;
            ctx.data_ref(ctx.va_to_rva(start)?, len)?
        };

        let index = if index == 0 {
            DataRef::null()
        } else {
            ctx.data_ref(ctx.va_to_rva(index)?, 4)?
        };

        let mut callback_refs = Vec::new();
        if callbacks != 0 {
            let view = ctx.view(ctx.va_to_rva(callbacks)?)?;
            let mut offset = 0;
            loop {
                let callback = read_le_at_dyn(&view, &mut offset, wide)?;
                if callback == 0 {
                    break;
                }
                if callback_refs.len() >= MAX_CALLBACKS {
                    return Err(malformed_error!("Unterminated TLS callback array"));
                }
                callback_refs.push(ctx.data_ref(ctx.va_to_rva(callback)?, 1)?);
            }
        }

        Ok(TlsDirectory {
            raw_data,
            index,
            callbacks: callback_refs,
            size_of_zero_fill,
            characteristics,
        })
    }

    /// Encode the directory followed by its callback array at `ctx.base_rva()`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if a reference can not be resolved.
    pub fn encode(&self, ctx: &EncodeContext) -> Result<Encoded> {
        let ptr = ctx.ptr_size();
        let structure = Self::structure_size(ctx.pe32_plus());
        let mut bytes = Vec::with_capacity(structure as usize);
        let mut absolute_fields = Vec::new();

        let start = ctx.va_or_zero(&self.raw_data)?;
        let end = if start == 0 {
            0
        } else {
            start + u64::from(self.template_size())
        };
        let index = ctx.va_or_zero(&self.index)?;
        let callbacks = if self.callbacks.is_empty() {
            0
        } else {
            ctx.image_base() + u64::from(ctx.base_rva() + structure)
        };

        for (position, value) in [start, end, index, callbacks].into_iter().enumerate() {
            if value != 0 {
                absolute_fields.push(u32::try_from(position).unwrap_or(0) * ptr);
            }
            ctx.push_ptr(&mut bytes, value);
        }
        bytes.extend_from_slice(&self.size_of_zero_fill.to_le_bytes());
        bytes.extend_from_slice(&self.characteristics.to_le_bytes());

        if !self.callbacks.is_empty() {
            for callback in &self.callbacks {
                absolute_fields.push(super::cursor(&bytes));
                ctx.push_ptr(&mut bytes, ctx.va_or_zero(callback)?);
            }
            ctx.push_ptr(&mut bytes, 0);
        }

        Ok(Encoded {
            bytes,
            absolute_fields,
            patches: Vec::new(),
        })
    }
}
