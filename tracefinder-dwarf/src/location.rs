// Variable conversion: DWARF location, basic type, and field chains
// Turns a variable DIE at a given PC into the tracer's value grammar:
// a register name, an indirection chain, or a symbolic address.

use crate::cfi::CfiContext;
use crate::die::{self, Die, Dwarf, Unit, UnitOffset};
use crate::probe::{ArgSpec, Config, FieldAccess, TraceArg};
use crate::{ProbeError, Result};
use gimli::AttributeValue;
use tracing::{debug, info, warn};

/// Kernel tracer basic type is up to u64.
const MAX_BASIC_TYPE_BITS: u64 = 64;

/// Canonical frame base at a PC: absent, or a single register + offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameBase {
    None,
    Register { reg: u16, offset: i64 },
}

/// Pick the location expression covering `pc` from a location attribute:
/// either a plain expression block or the matching location-list entry.
fn location_expr_at(
    dwarf: &Dwarf,
    unit: &Unit,
    value: AttributeValue<die::Reader>,
    pc: u64,
) -> Result<Option<gimli::Expression<die::Reader>>> {
    match value {
        AttributeValue::Exprloc(expr) => Ok(Some(expr)),
        AttributeValue::LocationListsRef(offset) => {
            let mut locations = dwarf.locations(unit, offset)?;
            while let Some(entry) = locations.next()? {
                if entry.range.begin <= pc && pc < entry.range.end {
                    return Ok(Some(entry.data));
                }
            }
            Ok(None)
        }
        _ => {
            debug!("Unsupported location attribute form");
            Ok(None)
        }
    }
}

/// Resolve `DW_AT_frame_base` at `pc` into the canonical form. A
/// `DW_OP_call_frame_cfa` frame base is pushed through the CFI tables.
pub(crate) fn resolve_frame_base(
    dwarf: &Dwarf,
    unit: &Unit,
    cfi: Option<&CfiContext>,
    sp_die: &Die,
    pc: u64,
) -> Result<FrameBase> {
    let Some(value) = sp_die.attr_value(gimli::DW_AT_frame_base)? else {
        return Ok(FrameBase::None);
    };
    let Some(expr) = location_expr_at(dwarf, unit, value, pc)? else {
        return Ok(FrameBase::None);
    };
    let mut reader = expr.0;
    let op = match gimli::Operation::parse(&mut reader, unit.encoding()) {
        Ok(op) => op,
        Err(_) => return Ok(FrameBase::None),
    };
    match op {
        gimli::Operation::Register { register } => Ok(FrameBase::Register {
            reg: register.0,
            offset: 0,
        }),
        gimli::Operation::RegisterOffset {
            register, offset, ..
        } => Ok(FrameBase::Register {
            reg: register.0,
            offset,
        }),
        gimli::Operation::CallFrameCFA => match cfi {
            Some(cfi) => {
                let fb = cfi.cfa_rule(pc).map_err(|e| {
                    warn!("Failed to get CFA on 0x{:x}", pc);
                    e
                })?;
                Ok(fb)
            }
            None => Ok(FrameBase::None),
        },
        other => {
            debug!("Unexpected frame base operation {:?}", other);
            Ok(FrameBase::None)
        }
    }
}

/// Convert the variable's location at `pc` into the tracer value: fills
/// `value` and, for memory locations, opens the first indirection frame.
pub(crate) fn convert_variable_location(
    dwarf: &Dwarf,
    unit: &Unit,
    var: UnitOffset,
    pc: u64,
    frame_base: &FrameBase,
    config: &Config,
    tvar: &mut TraceArg,
) -> Result<()> {
    let var_die = unit.entry(var)?;
    let Some(value) = var_die.attr_value(gimli::DW_AT_location)? else {
        warn!(
            "Failed to find the location of {} at this address. Perhaps, it has been optimized out.",
            tvar.name
        );
        return Err(ProbeError::NotFound(format!("location of {}", tvar.name)));
    };
    let Some(expr) = location_expr_at(dwarf, unit, value, pc)? else {
        warn!(
            "Failed to find the location of {} at this address. Perhaps, it has been optimized out.",
            tvar.name
        );
        return Err(ProbeError::NotFound(format!("location of {}", tvar.name)));
    };

    if expr.0.is_empty() {
        warn!(
            "Failed to find the location of {} at this address. Perhaps, it has been optimized out.",
            tvar.name
        );
        return Err(ProbeError::NotFound(format!("location of {}", tvar.name)));
    }
    let mut reader = expr.0;
    let op = gimli::Operation::parse(&mut reader, unit.encoding())?;

    // Static variables live in memory, not in the frame: emit @symbol.
    if let gimli::Operation::Address { .. } = op {
        let name = die::die_name(dwarf, unit, var)?
            .ok_or_else(|| ProbeError::NotFound("name of a static variable".to_string()))?;
        tvar.value = format!("@{}", name);
        tvar.refs.push(0);
        return Ok(());
    }

    let (regn, reference, offset) = match op {
        // Frame-relative: compose with the frame base register + offset
        gimli::Operation::FrameOffset { offset: fb_offset } => {
            let FrameBase::Register { reg, offset: base } = *frame_base else {
                warn!("The attribute of frame base is not supported.");
                return Err(ProbeError::NotSupported("frame base".to_string()));
            };
            (reg, true, fb_offset + base)
        }
        gimli::Operation::RegisterOffset {
            register, offset, ..
        } => (register.0, true, offset),
        gimli::Operation::Register { register } => (register.0, false, 0),
        other => {
            warn!("DWARF operation {:?} is not supported.", other);
            return Err(ProbeError::NotSupported(
                "location expression operation".to_string(),
            ));
        }
    };

    let Some(name) = (config.register_name)(regn) else {
        warn!(
            "Mapping for DWARF register number {} missing on this architecture.",
            regn
        );
        return Err(ProbeError::MissingRegisterName(regn));
    };

    tvar.value = name.to_string();
    if reference {
        tvar.refs.push(offset);
    }
    Ok(())
}

/// `s<bits>`/`u<bits>` for a scalar, clamped to what the tracer can fetch.
/// Zero-sized types yield no tag and let the kernel infer.
fn basic_type_tag(type_name: &str, byte_size: u64, signed: bool) -> Option<String> {
    let mut bits = byte_size * 8;
    if bits == 0 {
        return None;
    }
    if bits > MAX_BASIC_TYPE_BITS {
        info!(
            "{} exceeds max-bitwidth. Cut down to {} bits.",
            type_name, MAX_BASIC_TYPE_BITS
        );
        bits = MAX_BASIC_TYPE_BITS;
    }
    Some(format!("{}{}", if signed { 's' } else { 'u' }, bits))
}

/// Infer the trace type tag from the variable's resolved scalar type.
pub(crate) fn convert_variable_type(
    dwarf: &Dwarf,
    unit: &Unit,
    var: UnitOffset,
    tvar: &mut TraceArg,
) -> Result<()> {
    let Some(type_off) = die::real_type(unit, var)? else {
        warn!("Failed to get a type information of {}.", tvar.name);
        return Err(ProbeError::NotFound(format!("type of {}", tvar.name)));
    };
    let type_die = unit.entry(type_off)?;
    let type_name =
        die::die_name(dwarf, unit, type_off)?.unwrap_or_else(|| "<anonymous>".to_string());
    debug!("{} type is {}.", tvar.name, type_name);
    tvar.type_tag = basic_type_tag(&type_name, die::byte_size(&type_die), die::is_signed(&type_die));
    Ok(())
}

/// Walk the field-access chain, dereferencing pointers and accumulating
/// member and element offsets into the indirection list (`refs`, outermost
/// first). Returns the DIE whose type describes the final value.
pub(crate) fn convert_variable_fields(
    dwarf: &Dwarf,
    unit: &Unit,
    var: UnitOffset,
    varname: &str,
    fields: &[FieldAccess],
    refs: &mut Vec<i64>,
) -> Result<UnitOffset> {
    let mut vr_off = var;
    for (i, field) in fields.iter().enumerate() {
        let more = i + 1 < fields.len();
        debug!("converting {:?} in {}", field, varname);
        let Some(type_off) = die::real_type(unit, vr_off)? else {
            warn!("Failed to get the type of {}.", varname);
            return Err(ProbeError::NotFound(format!("type of {}", varname)));
        };
        let type_die = unit.entry(type_off)?;
        let tag = type_die.tag();

        match field {
            FieldAccess::Index(index) => {
                if tag != gimli::DW_TAG_array_type && tag != gimli::DW_TAG_pointer_type {
                    return Err(ProbeError::Invalid(format!(
                        "{} is not a pointer nor array",
                        varname
                    )));
                }
                let Some(elem_off) = die::real_type(unit, type_off)? else {
                    warn!("Failed to get the type of {}.", varname);
                    return Err(ProbeError::NotFound(format!("element type of {}", varname)));
                };
                let elem_die = unit.entry(elem_off)?;
                if tag == gimli::DW_TAG_pointer_type {
                    // Indexing a pointer reads through it: new outermost frame
                    refs.insert(0, 0);
                } else if refs.is_empty() {
                    warn!("Array on a register is not supported.");
                    return Err(ProbeError::NotSupported(
                        "array held in a register".to_string(),
                    ));
                }
                refs[0] += die::byte_size(&elem_die) as i64 * index;
                if more {
                    // Keep walking from the array/pointer type; the next
                    // round resolves it to the element type.
                    vr_off = type_off;
                }
            }
            FieldAccess::Member { name, deref } => {
                let struct_off = if tag == gimli::DW_TAG_pointer_type {
                    if !deref {
                        return Err(ProbeError::Invalid(format!(
                            "{} must be referred by '->'",
                            name
                        )));
                    }
                    let Some(pointee_off) = die::real_type(unit, type_off)? else {
                        warn!("Failed to get the type of {}.", varname);
                        return Err(ProbeError::NotFound(format!("pointee type of {}", varname)));
                    };
                    if unit.entry(pointee_off)?.tag() != gimli::DW_TAG_structure_type {
                        warn!("{} is not a data structure.", varname);
                        return Err(ProbeError::Invalid(format!(
                            "{} is not a data structure",
                            varname
                        )));
                    }
                    refs.insert(0, 0);
                    pointee_off
                } else {
                    if tag != gimli::DW_TAG_structure_type {
                        warn!("{} is not a data structure.", varname);
                        return Err(ProbeError::Invalid(format!(
                            "{} is not a data structure",
                            varname
                        )));
                    }
                    if *deref {
                        return Err(ProbeError::Invalid(format!(
                            "{} must be referred by '.'",
                            name
                        )));
                    }
                    if refs.is_empty() {
                        warn!("Structure on a register is not supported yet.");
                        return Err(ProbeError::NotSupported(
                            "structure held in a register".to_string(),
                        ));
                    }
                    type_off
                };

                let Some(member_off) = die::find_member(dwarf, unit, struct_off, name)? else {
                    warn!("{} has no member {}.", varname, name);
                    return Err(ProbeError::Invalid(format!(
                        "{} has no member {}",
                        varname, name
                    )));
                };
                let member_die = unit.entry(member_off)?;
                let member_offset = die::data_member_location(unit, &member_die).map_err(|e| {
                    warn!("Failed to get the offset of {}.", name);
                    e
                })?;
                refs[0] += member_offset;
                vr_off = member_off;
            }
        }
    }
    Ok(vr_off)
}

/// Full conversion of one argument: location, then fields, then type.
#[allow(clippy::too_many_arguments)]
pub(crate) fn convert_variable(
    dwarf: &Dwarf,
    unit: &Unit,
    var: UnitOffset,
    pc: u64,
    frame_base: &FrameBase,
    spec: &ArgSpec,
    config: &Config,
    tvar: &mut TraceArg,
) -> Result<()> {
    debug!("Converting variable {} into trace event.", spec.var);
    convert_variable_location(dwarf, unit, var, pc, frame_base, config, tvar)?;
    let mut type_die = var;
    if !spec.fields.is_empty() {
        type_die =
            convert_variable_fields(dwarf, unit, var, &spec.var, &spec.fields, &mut tvar.refs)?;
    }
    match &spec.type_cast {
        Some(cast) => tvar.type_tag = Some(cast.clone()),
        None => convert_variable_type(dwarf, unit, type_die, tvar)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_type_tag() {
        assert_eq!(basic_type_tag("int", 4, true), Some("s32".to_string()));
        assert_eq!(
            basic_type_tag("unsigned char", 1, false),
            Some("u8".to_string())
        );
        assert_eq!(
            basic_type_tag("long long", 8, true),
            Some("s64".to_string())
        );
        // Incomplete types carry no tag; the kernel infers
        assert_eq!(basic_type_tag("void", 0, false), None);
    }

    #[test]
    fn test_basic_type_tag_clamps_wide_types() {
        assert_eq!(
            basic_type_tag("__int128", 16, true),
            Some("s64".to_string())
        );
        assert_eq!(
            basic_type_tag("unsigned __int128", 16, false),
            Some("u64".to_string())
        );
    }
}
