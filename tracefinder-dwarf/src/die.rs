// DIE navigation primitives
// DIE handles are unit offsets: copyable descriptors re-seated on demand
// with `unit.entry`, so nothing borrows the traversal cursors.

use crate::{lines, ProbeError, Result};
use gimli::AttributeValue;
use tracing::debug;

pub(crate) type Reader = gimli::EndianSlice<'static, gimli::LittleEndian>;
pub(crate) type Dwarf = gimli::Dwarf<Reader>;
pub(crate) type Unit = gimli::Unit<Reader>;
pub(crate) type UnitOffset = gimli::UnitOffset<usize>;
pub(crate) type Die<'a> = gimli::DebuggingInformationEntry<'a, 'a, Reader>;

/// Reference-following depth bound; attribute chains are short and this
/// keeps malformed cyclic DWARF from hanging the walk.
const MAX_REF_DEPTH: usize = 16;

/// What a search predicate tells the tree walk to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkAction {
    /// Stop; this DIE is the answer.
    Found,
    /// Search this DIE's children, then stop either way.
    #[allow(dead_code)]
    DescendOnly,
    /// Skip this DIE's children, keep going through its siblings.
    SkipChildren,
    /// Search children and siblings both.
    Continue,
}

/// Depth-first search below `root` (the unit DIE when `None`), driven by
/// the predicate. Returns the offset of the first DIE reported `Found`.
pub(crate) fn find_child<F>(
    unit: &Unit,
    root: Option<UnitOffset>,
    pred: &mut F,
) -> Result<Option<UnitOffset>>
where
    F: FnMut(&Die) -> WalkAction,
{
    let mut tree = unit.entries_tree(root)?;
    let node = tree.root()?;
    walk_children(node, pred)
}

fn walk_children<F>(
    node: gimli::EntriesTreeNode<'_, '_, '_, Reader>,
    pred: &mut F,
) -> Result<Option<UnitOffset>>
where
    F: FnMut(&Die) -> WalkAction,
{
    let mut children = node.children();
    while let Some(child) = children.next()? {
        match pred(child.entry()) {
            WalkAction::Found => return Ok(Some(child.entry().offset())),
            WalkAction::DescendOnly => return walk_children(child, pred),
            WalkAction::SkipChildren => continue,
            WalkAction::Continue => {
                if let Some(found) = walk_children(child, pred)? {
                    return Ok(Some(found));
                }
            }
        }
    }
    Ok(None)
}

/// Read an attribute, following `DW_AT_abstract_origin` and
/// `DW_AT_specification` references when the DIE itself lacks it.
fn attr_integrated(
    unit: &Unit,
    offset: UnitOffset,
    name: gimli::DwAt,
) -> Result<Option<AttributeValue<Reader>>> {
    let mut offset = offset;
    for _ in 0..MAX_REF_DEPTH {
        let entry = unit.entry(offset)?;
        if let Some(value) = entry.attr_value(name)? {
            return Ok(Some(value));
        }
        let origin = match entry.attr_value(gimli::DW_AT_abstract_origin)? {
            Some(value) => Some(value),
            None => entry.attr_value(gimli::DW_AT_specification)?,
        };
        match origin {
            Some(AttributeValue::UnitRef(next)) => offset = next,
            _ => return Ok(None),
        }
    }
    Ok(None)
}

/// The DIE's name, resolved through origin references.
pub(crate) fn die_name(dwarf: &Dwarf, unit: &Unit, offset: UnitOffset) -> Result<Option<String>> {
    match attr_integrated(unit, offset, gimli::DW_AT_name)? {
        Some(value) => {
            let s = dwarf.attr_string(unit, value)?;
            Ok(Some(s.to_string_lossy().into_owned()))
        }
        None => Ok(None),
    }
}

/// Name equality; a nameless DIE never matches.
pub(crate) fn compare_name(dwarf: &Dwarf, unit: &Unit, die: &Die, expected: &str) -> bool {
    matches!(die_name(dwarf, unit, die.offset()), Ok(Some(name)) if name == expected)
}

/// Follow `DW_AT_type`, skipping qualifiers and typedefs, to the DIE that
/// actually describes the storage.
pub(crate) fn real_type(unit: &Unit, offset: UnitOffset) -> Result<Option<UnitOffset>> {
    let mut cur = offset;
    for _ in 0..MAX_REF_DEPTH * 4 {
        let entry = unit.entry(cur)?;
        let Some(AttributeValue::UnitRef(next)) = entry.attr_value(gimli::DW_AT_type)? else {
            return Ok(None);
        };
        let ty = unit.entry(next)?;
        match ty.tag() {
            gimli::DW_TAG_const_type
            | gimli::DW_TAG_restrict_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_shared_type
            | gimli::DW_TAG_typedef => cur = next,
            _ => return Ok(Some(next)),
        }
    }
    Ok(None)
}

pub(crate) fn byte_size(die: &Die) -> u64 {
    die.attr_value(gimli::DW_AT_byte_size)
        .ok()
        .flatten()
        .and_then(|v| v.udata_value())
        .unwrap_or(0)
}

pub(crate) fn is_signed(die: &Die) -> bool {
    let encoding = match die.attr_value(gimli::DW_AT_encoding) {
        Ok(Some(AttributeValue::Encoding(ate))) => ate,
        Ok(Some(value)) => match value.udata_value() {
            Some(v) => gimli::DwAte(v as u8),
            None => return false,
        },
        _ => return false,
    };
    matches!(
        encoding,
        gimli::DW_ATE_signed | gimli::DW_ATE_signed_char | gimli::DW_ATE_signed_fixed
    )
}

/// Byte offset of a member within its structure. A literal value is
/// preferred; a one-op `DW_OP_plus_uconst` expression is accepted.
pub(crate) fn data_member_location(unit: &Unit, die: &Die) -> Result<i64> {
    let Some(value) = die.attr_value(gimli::DW_AT_data_member_location)? else {
        return Err(ProbeError::NotFound("data member location".to_string()));
    };
    if let Some(offset) = value.udata_value() {
        return Ok(offset as i64);
    }
    if let AttributeValue::Sdata(offset) = value {
        return Ok(offset);
    }
    if let AttributeValue::Exprloc(expr) = value {
        let mut reader = expr.0;
        let op = gimli::Operation::parse(&mut reader, unit.encoding())?;
        if reader.is_empty() {
            if let gimli::Operation::PlusConstant { value } = op {
                return Ok(value as i64);
            }
        }
        debug!("Unable to get offset: unexpected member location expression");
        return Err(ProbeError::NotSupported(
            "member location expression".to_string(),
        ));
    }
    Err(ProbeError::NotFound("data member location".to_string()))
}

/// Whether any of the DIE's PC ranges covers `pc`.
pub(crate) fn die_has_pc(dwarf: &Dwarf, unit: &Unit, die: &Die, pc: u64) -> Result<bool> {
    let mut ranges = dwarf.die_ranges(unit, die)?;
    while let Some(range) = ranges.next()? {
        if range.begin <= pc && pc < range.end {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Entry PC: `DW_AT_entry_pc` when present, the low PC otherwise.
pub(crate) fn entry_pc(dwarf: &Dwarf, unit: &Unit, die: &Die) -> Result<Option<u64>> {
    for at in [gimli::DW_AT_entry_pc, gimli::DW_AT_low_pc] {
        if let Some(value) = die.attr_value(at)? {
            if let Some(addr) = dwarf.attr_address(unit, value)? {
                return Ok(Some(addr));
            }
        }
    }
    Ok(None)
}

/// Declaration line, resolved through origin references.
pub(crate) fn decl_line(unit: &Unit, offset: UnitOffset) -> Result<Option<u32>> {
    Ok(attr_integrated(unit, offset, gimli::DW_AT_decl_line)?
        .and_then(|v| v.udata_value())
        .map(|v| v as u32))
}

/// Declaration file path, resolved through origin references and rendered
/// from the unit's line-program file table.
pub(crate) fn decl_file(dwarf: &Dwarf, unit: &Unit, offset: UnitOffset) -> Result<Option<String>> {
    let Some(index) = attr_integrated(unit, offset, gimli::DW_AT_decl_file)?.and_then(|v| match v {
        AttributeValue::FileIndex(index) => Some(index),
        other => other.udata_value(),
    }) else {
        return Ok(None);
    };
    let Some(program) = &unit.line_program else {
        return Ok(None);
    };
    let header = program.header();
    let Some(file) = header.file(index) else {
        return Ok(None);
    };
    Ok(Some(lines::render_file(dwarf, unit, header, file)?))
}

/// Whether the subprogram was inlined (its concrete code lives in
/// `DW_TAG_inlined_subroutine` instances, not under this DIE).
pub(crate) fn is_inline_function(die: &Die) -> Result<bool> {
    let Some(value) = die.attr_value(gimli::DW_AT_inline)? else {
        return Ok(false);
    };
    let inl = match value {
        AttributeValue::Inline(inl) => inl,
        other => match other.udata_value() {
            Some(v) => gimli::DwInl(v as u8),
            None => return Ok(false),
        },
    };
    Ok(inl == gimli::DW_INL_inlined || inl == gimli::DW_INL_declared_inlined)
}

/// Offsets of the unit's top-level subprograms, in declaration order.
pub(crate) fn subprograms(unit: &Unit) -> Result<Vec<UnitOffset>> {
    let mut tree = unit.entries_tree(None)?;
    let root = tree.root()?;
    let mut out = Vec::new();
    let mut children = root.children();
    while let Some(child) = children.next()? {
        if child.entry().tag() == gimli::DW_TAG_subprogram {
            out.push(child.entry().offset());
        }
    }
    Ok(out)
}

/// The first out-of-line subprogram whose ranges cover `pc`.
pub(crate) fn find_real_subprogram(
    dwarf: &Dwarf,
    unit: &Unit,
    pc: u64,
) -> Result<Option<UnitOffset>> {
    for sp_off in subprograms(unit)? {
        let sp = unit.entry(sp_off)?;
        if die_has_pc(dwarf, unit, &sp, pc)? {
            return Ok(Some(sp_off));
        }
    }
    Ok(None)
}

/// The innermost-first inlined subroutine below `scope` covering `pc`.
pub(crate) fn find_inline_instance(
    dwarf: &Dwarf,
    unit: &Unit,
    scope: UnitOffset,
    pc: u64,
) -> Result<Option<UnitOffset>> {
    find_child(unit, Some(scope), &mut |die| {
        if die.tag() == gimli::DW_TAG_inlined_subroutine
            && die_has_pc(dwarf, unit, die, pc).unwrap_or(false)
        {
            WalkAction::Found
        } else {
            WalkAction::Continue
        }
    })
}

/// All inlined instances of the abstract subprogram at `origin`, anywhere
/// in the unit.
pub(crate) fn inline_instances(unit: &Unit, origin: UnitOffset) -> Result<Vec<UnitOffset>> {
    let mut out = Vec::new();
    let mut entries = unit.entries();
    while let Some((_, entry)) = entries.next_dfs()? {
        if entry.tag() != gimli::DW_TAG_inlined_subroutine {
            continue;
        }
        if let Some(AttributeValue::UnitRef(target)) =
            entry.attr_value(gimli::DW_AT_abstract_origin)?
        {
            if target == origin {
                out.push(entry.offset());
            }
        }
    }
    Ok(out)
}

/// Search the scope subtree for a local variable or parameter by name.
pub(crate) fn find_variable(
    dwarf: &Dwarf,
    unit: &Unit,
    scope: UnitOffset,
    name: &str,
) -> Result<Option<UnitOffset>> {
    find_child(unit, Some(scope), &mut |die| {
        let tag = die.tag();
        if (tag == gimli::DW_TAG_formal_parameter || tag == gimli::DW_TAG_variable)
            && compare_name(dwarf, unit, die, name)
        {
            WalkAction::Found
        } else {
            WalkAction::Continue
        }
    })
}

/// Find a structure member by name among the immediate children.
pub(crate) fn find_member(
    dwarf: &Dwarf,
    unit: &Unit,
    structure: UnitOffset,
    name: &str,
) -> Result<Option<UnitOffset>> {
    find_child(unit, Some(structure), &mut |die| {
        if die.tag() == gimli::DW_TAG_member && compare_name(dwarf, unit, die, name) {
            WalkAction::Found
        } else {
            WalkAction::SkipChildren
        }
    })
}

/// Ancestors of `target`, innermost first, ending with the unit DIE.
/// Empty when `target` is not in this unit's tree.
fn scope_chain(unit: &Unit, target: UnitOffset) -> Result<Vec<UnitOffset>> {
    fn path_to(
        node: gimli::EntriesTreeNode<'_, '_, '_, Reader>,
        target: UnitOffset,
        out: &mut Vec<UnitOffset>,
    ) -> Result<bool> {
        let offset = node.entry().offset();
        if offset == target {
            return Ok(true);
        }
        let mut children = node.children();
        while let Some(child) = children.next()? {
            if path_to(child, target, out)? {
                out.push(offset);
                return Ok(true);
            }
        }
        Ok(false)
    }

    let mut tree = unit.entries_tree(None)?;
    let root = tree.root()?;
    let mut out = Vec::new();
    path_to(root, target, &mut out)?;
    Ok(out)
}

/// Search the scopes enclosing `scope` (outward, up to and including the
/// unit DIE) for a variable by name. Only each scope's immediate children
/// are considered; nested functions keep their locals to themselves.
pub(crate) fn find_scope_variable(
    dwarf: &Dwarf,
    unit: &Unit,
    scope: UnitOffset,
    name: &str,
) -> Result<Option<UnitOffset>> {
    for ancestor in scope_chain(unit, scope)? {
        let found = find_child(unit, Some(ancestor), &mut |die| {
            let tag = die.tag();
            if (tag == gimli::DW_TAG_formal_parameter || tag == gimli::DW_TAG_variable)
                && compare_name(dwarf, unit, die, name)
            {
                WalkAction::Found
            } else {
                WalkAction::SkipChildren
            }
        })?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}
