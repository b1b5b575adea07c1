/// Platform-specific register mappings for probe argument synthesis
///
/// This module handles the mapping between DWARF register numbers and the
/// register names understood by the kernel tracer's argument grammar.
use tracing::warn;

/// Convert DWARF register number to kernel-tracer register name for x86_64
///
/// The names use the tracer's spelling (`%di`, not `RDI`) because they are
/// emitted verbatim into probe definitions.
///
/// Reference: System V AMD64 psABI, DWARF register number mapping.
pub fn dwarf_reg_to_name_x86_64(dwarf_reg: u16) -> Option<&'static str> {
    match dwarf_reg {
        0 => Some("%ax"),   // DWARF 0 = RAX
        1 => Some("%dx"),   // DWARF 1 = RDX
        2 => Some("%cx"),   // DWARF 2 = RCX
        3 => Some("%bx"),   // DWARF 3 = RBX
        4 => Some("%si"),   // DWARF 4 = RSI
        5 => Some("%di"),   // DWARF 5 = RDI
        6 => Some("%bp"),   // DWARF 6 = RBP
        7 => Some("%sp"),   // DWARF 7 = RSP
        8 => Some("%r8"),   // DWARF 8 = R8
        9 => Some("%r9"),   // DWARF 9 = R9
        10 => Some("%r10"), // DWARF 10 = R10
        11 => Some("%r11"), // DWARF 11 = R11
        12 => Some("%r12"), // DWARF 12 = R12
        13 => Some("%r13"), // DWARF 13 = R13
        14 => Some("%r14"), // DWARF 14 = R14
        15 => Some("%r15"), // DWARF 15 = R15
        _ => {
            warn!("Unknown DWARF register {} for x86_64", dwarf_reg);
            None
        }
    }
}

/// Convert DWARF register number to kernel-tracer register name
///
/// Currently only supports x86_64. This function can be extended
/// to support other architectures in the future.
pub fn dwarf_reg_to_name(dwarf_reg: u16) -> Option<&'static str> {
    dwarf_reg_to_name_x86_64(dwarf_reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_dwarf_to_name_mapping() {
        // Test argument-passing registers
        assert_eq!(dwarf_reg_to_name_x86_64(5), Some("%di"));
        assert_eq!(dwarf_reg_to_name_x86_64(4), Some("%si"));
        assert_eq!(dwarf_reg_to_name_x86_64(1), Some("%dx"));
        assert_eq!(dwarf_reg_to_name_x86_64(2), Some("%cx"));
        assert_eq!(dwarf_reg_to_name_x86_64(8), Some("%r8"));
        assert_eq!(dwarf_reg_to_name_x86_64(9), Some("%r9"));

        // Frame and stack pointers
        assert_eq!(dwarf_reg_to_name_x86_64(6), Some("%bp"));
        assert_eq!(dwarf_reg_to_name_x86_64(7), Some("%sp"));

        // Extended registers
        assert_eq!(dwarf_reg_to_name_x86_64(15), Some("%r15"));

        // Beyond the table
        assert_eq!(dwarf_reg_to_name_x86_64(16), None);
        assert_eq!(dwarf_reg_to_name_x86_64(99), None);
    }

    #[test]
    fn test_dwarf_reg_to_name_generic() {
        assert_eq!(dwarf_reg_to_name(0), Some("%ax"));
        assert_eq!(dwarf_reg_to_name(5), Some("%di"));
        assert_eq!(dwarf_reg_to_name(99), None);
    }
}
