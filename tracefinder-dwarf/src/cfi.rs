// Call Frame Information lookup
// Resolves the CFA rule at a PC so `DW_OP_call_frame_cfa` frame bases can
// be folded into the same register+offset form as everything else.

use crate::location::FrameBase;
use crate::{ProbeError, Result};
use gimli::{BaseAddresses, DebugFrame, EhFrame, LittleEndian, UnwindSection};
use tracing::debug;

/// Owns copies of the unwind sections and answers CFA queries lazily.
#[derive(Debug, Default)]
pub(crate) struct CfiContext {
    base_addresses: BaseAddresses,
    eh_frame_data: Option<Vec<u8>>,
    debug_frame_data: Option<Vec<u8>>,
}

impl CfiContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_eh_frame(&mut self, data: &[u8], base_addresses: BaseAddresses) {
        self.base_addresses = base_addresses;
        self.eh_frame_data = Some(data.to_vec());
        debug!("Stored .eh_frame section data for lazy parsing");
    }

    pub fn load_from_debug_frame(&mut self, data: &[u8], base_addresses: BaseAddresses) {
        self.base_addresses = base_addresses;
        self.debug_frame_data = Some(data.to_vec());
        debug!("Stored .debug_frame section data for lazy parsing");
    }

    pub fn is_empty(&self) -> bool {
        self.eh_frame_data.is_none() && self.debug_frame_data.is_none()
    }

    /// Resolve the CFA rule at `pc` into the canonical register+offset
    /// frame-base form. `.debug_frame` is preferred (kernel images carry
    /// it), `.eh_frame` is the fallback.
    pub fn cfa_rule(&self, pc: u64) -> Result<FrameBase> {
        if let Some(fb) = self.try_debug_frame(pc) {
            return Ok(fb);
        }
        if let Some(fb) = self.try_eh_frame(pc) {
            return Ok(fb);
        }
        Err(ProbeError::NotFound(format!("CFA on 0x{:x}", pc)))
    }

    fn try_debug_frame(&self, pc: u64) -> Option<FrameBase> {
        let data = self.debug_frame_data.as_ref()?;
        let debug_frame = DebugFrame::new(data, LittleEndian);
        let mut unwind_context = gimli::UnwindContext::new();
        match debug_frame.unwind_info_for_address(
            &self.base_addresses,
            &mut unwind_context,
            pc,
            |section, bases, offset| section.cie_from_offset(bases, offset),
        ) {
            Ok(row) => cfa_rule_to_frame_base(row.cfa()),
            Err(e) => {
                debug!("No .debug_frame unwind info for 0x{:x}: {}", pc, e);
                None
            }
        }
    }

    fn try_eh_frame(&self, pc: u64) -> Option<FrameBase> {
        let data = self.eh_frame_data.as_ref()?;
        let eh_frame = EhFrame::new(data, LittleEndian);
        let mut unwind_context = gimli::UnwindContext::new();
        match eh_frame.unwind_info_for_address(
            &self.base_addresses,
            &mut unwind_context,
            pc,
            |section, bases, offset| section.cie_from_offset(bases, offset),
        ) {
            Ok(row) => cfa_rule_to_frame_base(row.cfa()),
            Err(e) => {
                debug!("No .eh_frame unwind info for 0x{:x}: {}", pc, e);
                None
            }
        }
    }
}

fn cfa_rule_to_frame_base<T: gimli::ReaderOffset>(
    rule: &gimli::CfaRule<T>,
) -> Option<FrameBase> {
    match rule {
        gimli::CfaRule::RegisterAndOffset { register, offset } => {
            debug!("CFA rule: register {} + offset {}", register.0, offset);
            Some(FrameBase::Register {
                reg: register.0,
                offset: *offset,
            })
        }
        gimli::CfaRule::Expression(_) => {
            debug!("CFA uses a DWARF expression - not supported");
            None
        }
    }
}
