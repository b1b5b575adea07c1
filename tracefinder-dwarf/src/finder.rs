// Probe point location, reverse lookup and line ranges
// Owns the loaded debug image and walks compilation units to answer the
// three resolver queries.

use crate::cfi::CfiContext;
use crate::die::{self, Reader, Unit, UnitOffset};
use crate::lazy;
use crate::line_list::LineList;
use crate::lines::{tail_match, LineTable};
use crate::location::{self, FrameBase};
use crate::probe::{
    is_c_varname, ArgSpec, Config, LineRange, LineRangeSpec, ProbePoint, ProbeRequest, TraceArg,
    TraceEvent, TracePoint,
};
use crate::source::get_real_path;
use crate::{ProbeError, Result};
use object::{Object, ObjectSection};
use std::path::Path;
use tracing::{debug, info, warn};

/// A loaded debug-info image and its parsed DWARF sections.
#[derive(Debug)]
pub struct DebugInfo {
    dwarf: gimli::Dwarf<Reader>,
    cfi: Option<CfiContext>,
    // Keep the file image alive for the 'static section slices
    _file_data: Box<[u8]>,
}

impl DebugInfo {
    /// Load DWARF debug information from an ELF image on disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading DWARF debug info from: {}", path.display());

        let file_data = std::fs::read(path)?.into_boxed_slice();
        let object_file = object::File::parse(&*file_data)?;

        if !has_debug_info(&object_file) {
            warn!(
                "No dwarf info found in {} - was it built with debug info?",
                path.display()
            );
            return Err(ProbeError::NoDebugInfo);
        }

        let dwarf = load_dwarf_sections(&object_file)?;

        // Wire up unwind sections so call_frame_cfa frame bases resolve
        let mut base_addresses = gimli::BaseAddresses::default();
        if let Some(section) = object_file.section_by_name(".text") {
            base_addresses = base_addresses.set_text(section.address());
        }
        if let Some(section) = object_file.section_by_name(".eh_frame") {
            base_addresses = base_addresses.set_eh_frame(section.address());
        }

        let mut cfi = CfiContext::new();
        if let Some(data) = section_data(&object_file, ".debug_frame") {
            if !data.is_empty() {
                cfi.load_from_debug_frame(data, base_addresses.clone());
            }
        }
        if let Some(data) = section_data(&object_file, ".eh_frame") {
            if !data.is_empty() {
                cfi.load_from_eh_frame(data, base_addresses.clone());
            }
        }
        let cfi = (!cfi.is_empty()).then_some(cfi);

        info!("Loaded DWARF debug information from {}", path.display());
        Ok(DebugInfo {
            dwarf,
            cfi,
            _file_data: file_data,
        })
    }

    /// Resolve a probe request into trace events, at most `max_tevs` of
    /// them. An empty result is success: nothing matched.
    pub fn find_trace_events(
        &self,
        request: &ProbeRequest,
        max_tevs: usize,
        config: &Config,
    ) -> Result<Vec<TraceEvent>> {
        let mut finder = ProbeFinder {
            di: self,
            request,
            config,
            max_tevs,
            tevs: Vec::new(),
            lcache: LineList::new(),
        };
        finder.run()?;
        Ok(finder.tevs)
    }

    /// Reverse lookup: the function/source position of an address.
    /// `Ok(None)` means the debug info has nothing to say about it.
    pub fn find_probe_point(&self, addr: u64) -> Result<Option<ProbePoint>> {
        let mut point = ProbePoint::default();
        let mut found = false;

        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            if !unit_contains(&self.dwarf, &unit, addr)? {
                continue;
            }

            // A line entry at exactly this address gives file and line
            let lines = LineTable::parse(&self.dwarf, &unit)?;
            if let Some(table) = &lines {
                if let Some(row) = table
                    .rows
                    .iter()
                    .find(|row| row.address == addr && row.line != 0)
                {
                    if let Some(src) = table.file(row.file_index) {
                        point.file = Some(src.to_string());
                        point.line = Some(row.line);
                        found = true;
                    }
                }
            }

            // The enclosing function, preferring an inline instance as the
            // line anchor when one covers the address
            if let Some(sp_off) = die::find_real_subprogram(&self.dwarf, &unit, addr)? {
                let sp = unit.entry(sp_off)?;
                let name = die::die_name(&self.dwarf, &unit, sp_off)?;
                let entry = die::entry_pc(&self.dwarf, &unit, &sp)?;
                let (Some(mut function), Some(entry)) = (name, entry) else {
                    break;
                };

                let mut relative = None;
                if let Some(line) = point.line {
                    let anchor = if let Some(in_off) =
                        die::find_inline_instance(&self.dwarf, &unit, sp_off, addr)?
                    {
                        match die::die_name(&self.dwarf, &unit, in_off)? {
                            Some(in_name) => {
                                function = in_name;
                                die::decl_line(&unit, in_off)?
                            }
                            None => break,
                        }
                    } else if entry == addr {
                        // Function entry: relative line zero
                        Some(line)
                    } else {
                        die::decl_line(&unit, sp_off)?
                    };
                    relative = anchor.map(|anchor| line.saturating_sub(anchor));
                }

                match relative {
                    Some(rel) => point.line = Some(rel),
                    // No usable line: fall back to a byte offset
                    None => point.offset = Some(addr.saturating_sub(entry)),
                }
                point.function = Some(function);
                found = true;
            }
            break;
        }

        Ok(found.then_some(point))
    }

    /// Enumerate probeable source lines for a function or a file range.
    /// `Ok(None)` when no lines qualify.
    pub fn find_line_range(
        &self,
        spec: &LineRangeSpec,
        config: &Config,
    ) -> Result<Option<LineRange>> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let lines = LineTable::parse(&self.dwarf, &unit)?;

            // With a file restriction, skip units that do not include it
            let fname = match &spec.file {
                Some(file) => {
                    let resolved = lines
                        .as_ref()
                        .and_then(|table| table.find_realpath(file))
                        .map(str::to_string);
                    match resolved {
                        Some(fname) => Some(fname),
                        None => continue,
                    }
                }
                None => None,
            };

            let found = if spec.function.is_some() {
                self.line_range_by_func(&unit, lines.as_ref(), spec, config)?
            } else {
                let fname = fname.ok_or_else(|| {
                    ProbeError::Invalid("line range needs a function or a file".to_string())
                })?;
                self.line_range_by_line(
                    &unit,
                    lines.as_ref(),
                    None,
                    &fname,
                    spec.start,
                    spec.end,
                    None,
                    config,
                )?
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn line_range_by_func(
        &self,
        unit: &Unit,
        lines: Option<&LineTable>,
        spec: &LineRangeSpec,
        config: &Config,
    ) -> Result<Option<LineRange>> {
        let function = spec.function.as_deref().unwrap_or_default();
        for sp_off in die::subprograms(unit)? {
            let sp = unit.entry(sp_off)?;
            if !die::compare_name(&self.dwarf, unit, &sp, function) {
                continue;
            }

            let fname = die::decl_file(&self.dwarf, unit, sp_off)?.ok_or_else(|| {
                ProbeError::NotFound(format!("declaration file of {}", function))
            })?;
            let offset = die::decl_line(unit, sp_off)?.unwrap_or(0);
            let lno_s = offset.saturating_add(spec.start);
            let lno_e = offset.saturating_add(spec.end);
            debug!("New line range: {} to {}", lno_s, lno_e);

            let scope = if die::is_inline_function(&sp)? {
                // One instance is enough to enumerate the lines
                match die::inline_instances(unit, sp_off)?.into_iter().next() {
                    Some(instance) => instance,
                    None => return Ok(None),
                }
            } else {
                sp_off
            };
            return self.line_range_by_line(
                unit,
                lines,
                Some(scope),
                &fname,
                lno_s,
                lno_e,
                Some(offset),
                config,
            );
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn line_range_by_line(
        &self,
        unit: &Unit,
        lines: Option<&LineTable>,
        scope: Option<UnitOffset>,
        fname: &str,
        lno_s: u32,
        lno_e: u32,
        func_decl: Option<u32>,
        config: &Config,
    ) -> Result<Option<LineRange>> {
        let Some(table) = lines else {
            warn!("No source lines found in this CU.");
            return Err(ProbeError::NotFound("source lines in this unit".to_string()));
        };

        let mut list = LineList::new();
        let mut path = None;

        for row in &table.rows {
            if row.line == 0 || row.line < lno_s || row.line > lno_e {
                continue;
            }
            if let Some(scope_off) = scope {
                let scope_die = unit.entry(scope_off)?;
                // The address must be this function's own code, not an
                // inlined callee's
                if !die::die_has_pc(&self.dwarf, unit, &scope_die, row.address)? {
                    continue;
                }
                if die::find_inline_instance(&self.dwarf, unit, scope_off, row.address)?.is_some() {
                    continue;
                }
            }
            let Some(src) = table.file(row.file_index) else {
                continue;
            };
            if !tail_match(src, fname) {
                continue;
            }
            if path.is_none() {
                path = Some(get_real_path(src, config.source_prefix.as_deref())?);
            }
            list.add(row.line);
        }

        // Line tables omit declarations; put them back
        if let Some(scope_off) = scope {
            if let (Some(src), Some(line)) = (
                die::decl_file(&self.dwarf, unit, scope_off)?,
                die::decl_line(unit, scope_off)?,
            ) {
                if lno_s <= line && line <= lno_e {
                    if path.is_none() {
                        path = Some(get_real_path(&src, config.source_prefix.as_deref())?);
                    }
                    list.add(line);
                }
            }
        } else {
            for sp_off in die::subprograms(unit)? {
                let Some(src) = die::decl_file(&self.dwarf, unit, sp_off)? else {
                    continue;
                };
                if !tail_match(&src, fname) {
                    continue;
                }
                let Some(line) = die::decl_line(unit, sp_off)? else {
                    continue;
                };
                if line < lno_s || line > lno_e {
                    continue;
                }
                if path.is_none() {
                    path = Some(get_real_path(&src, config.source_prefix.as_deref())?);
                }
                list.add(line);
            }
        }

        let Some(path) = path else {
            return Ok(None);
        };
        if list.is_empty() {
            return Ok(None);
        }
        Ok(Some(LineRange {
            path,
            start: lno_s,
            end: lno_e,
            offset: func_decl,
            lines: list,
        }))
    }
}

/// Per-request state for the forward probe search.
struct ProbeFinder<'a> {
    di: &'a DebugInfo,
    request: &'a ProbeRequest,
    config: &'a Config,
    max_tevs: usize,
    tevs: Vec<TraceEvent>,
    // Lazy-pattern line numbers, built once per request
    lcache: LineList,
}

impl ProbeFinder<'_> {
    fn run(&mut self) -> Result<()> {
        let point = self.request.point.clone();
        let mut units = self.di.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.di.dwarf.unit(header)?;
            let lines = LineTable::parse(&self.di.dwarf, &unit)?;

            // With a file selector, skip units that do not include it
            let fname = match &point.file {
                Some(file) => {
                    let resolved = lines
                        .as_ref()
                        .and_then(|table| table.find_realpath(file))
                        .map(str::to_string);
                    match resolved {
                        Some(fname) => Some(fname),
                        None => continue,
                    }
                }
                None => None,
            };

            if point.function.is_some() {
                self.find_by_func(&unit, lines.as_ref())?;
            } else if let Some(pattern) = &point.lazy_pattern {
                let fname = fname.ok_or_else(|| {
                    ProbeError::Invalid("lazy pattern needs a source file".to_string())
                })?;
                self.find_lazy(&unit, lines.as_ref(), &fname, pattern, None)?;
            } else {
                let lineno = point.line.ok_or_else(|| {
                    ProbeError::Invalid("probe point needs a function, line or pattern".to_string())
                })?;
                let fname = fname.ok_or_else(|| {
                    ProbeError::Invalid("an absolute line needs a source file".to_string())
                })?;
                self.find_by_line(&unit, lines.as_ref(), &fname, lineno, None)?;
            }
        }
        Ok(())
    }

    /// Probe by function name, with optional relative line, byte offset or
    /// lazy pattern refinement.
    fn find_by_func(&mut self, unit: &Unit, lines: Option<&LineTable>) -> Result<()> {
        let point = self.request.point.clone();
        let function = point.function.as_deref().unwrap_or_default();
        let dwarf = &self.di.dwarf;

        for sp_off in die::subprograms(unit)? {
            let sp = unit.entry(sp_off)?;
            if !die::compare_name(dwarf, unit, &sp, function) {
                continue;
            }

            let fname = die::decl_file(dwarf, unit, sp_off)?;
            let inline = die::is_inline_function(&sp)?;

            if let Some(rel_line) = point.line {
                // Function-relative line: make it absolute and go by line,
                // confined to this function's code when it is out of line
                let decl = die::decl_line(unit, sp_off)?.unwrap_or(0);
                let lineno = decl.saturating_add(rel_line);
                let fname = fname.ok_or_else(|| {
                    ProbeError::NotFound(format!("declaration file of {}", function))
                })?;
                let scope = (!inline).then_some(sp_off);
                self.find_by_line(unit, lines, &fname, lineno, scope)?;
            } else if !inline {
                if let Some(pattern) = &point.lazy_pattern {
                    let fname = fname.ok_or_else(|| {
                        ProbeError::NotFound(format!("declaration file of {}", function))
                    })?;
                    self.find_lazy(unit, lines, &fname, pattern, Some(sp_off))?;
                } else {
                    let Some(entry) = die::entry_pc(dwarf, unit, &sp)? else {
                        warn!("Failed to get entry pc of {}.", function);
                        return Err(ProbeError::NotFound(format!(
                            "entry address of {}",
                            function
                        )));
                    };
                    self.convert_probe_point(unit, Some(sp_off), entry + point.offset)?;
                }
            } else {
                // Inlined function: visit every concrete instance
                for inst_off in die::inline_instances(unit, sp_off)? {
                    if let Some(pattern) = &point.lazy_pattern {
                        let fname = fname.clone().ok_or_else(|| {
                            ProbeError::NotFound(format!("declaration file of {}", function))
                        })?;
                        self.find_lazy(unit, lines, &fname, pattern, Some(inst_off))?;
                    } else {
                        let inst = unit.entry(inst_off)?;
                        let Some(entry) = die::entry_pc(dwarf, unit, &inst)? else {
                            warn!("Failed to get entry pc of {}.", function);
                            return Err(ProbeError::NotFound(format!(
                                "entry address of {}",
                                function
                            )));
                        };
                        debug!("found inline addr: 0x{:x}", entry + point.offset);
                        self.convert_probe_point(unit, Some(inst_off), entry + point.offset)?;
                    }
                }
            }
            // No second subprogram of the same name in this unit
            break;
        }
        Ok(())
    }

    /// Probe every line-table row matching the line number and file.
    /// The same line may map to several addresses through inlining.
    fn find_by_line(
        &mut self,
        unit: &Unit,
        lines: Option<&LineTable>,
        fname: &str,
        lineno: u32,
        scope: Option<UnitOffset>,
    ) -> Result<()> {
        let Some(table) = lines else {
            warn!("No source lines found in this CU.");
            return Err(ProbeError::NotFound("source lines in this unit".to_string()));
        };

        for row in &table.rows {
            if row.line != lineno {
                continue;
            }
            let Some(src) = table.file(row.file_index) else {
                continue;
            };
            if !tail_match(src, fname) {
                continue;
            }
            if let Some(scope_off) = scope {
                let scope_die = unit.entry(scope_off)?;
                if !die::die_has_pc(&self.di.dwarf, unit, &scope_die, row.address)? {
                    continue;
                }
            }
            debug!("Probe line found: line {} addr 0x{:x}", lineno, row.address);
            self.convert_probe_point(unit, scope, row.address)?;
        }
        Ok(())
    }

    /// Probe every line whose source text matches the lazy pattern.
    fn find_lazy(
        &mut self,
        unit: &Unit,
        lines: Option<&LineTable>,
        fname: &str,
        pattern: &str,
        scope: Option<UnitOffset>,
    ) -> Result<()> {
        if self.lcache.is_empty() {
            let matched = lazy::find_lazy_match_lines(&mut self.lcache, Path::new(fname), pattern)?;
            if matched == 0 {
                debug!("No matched lines found in {}.", fname);
                return Ok(());
            }
        }

        let Some(table) = lines else {
            warn!("No source lines found in this CU.");
            return Err(ProbeError::NotFound("source lines in this unit".to_string()));
        };

        for row in &table.rows {
            if !self.lcache.contains(row.line) {
                continue;
            }
            let Some(src) = table.file(row.file_index) else {
                continue;
            };
            if !tail_match(src, fname) {
                continue;
            }
            if let Some(scope_off) = scope {
                let scope_die = unit.entry(scope_off)?;
                // Only this scope's own code; skip addresses belonging to
                // a deeper inlined callee
                if !die::die_has_pc(&self.di.dwarf, unit, &scope_die, row.address)? {
                    continue;
                }
                if die::find_inline_instance(&self.di.dwarf, unit, scope_off, row.address)?
                    .is_some()
                {
                    continue;
                }
            }
            debug!(
                "Probe line found: line {} addr 0x{:x}",
                row.line, row.address
            );
            self.convert_probe_point(unit, scope, row.address)?;
        }
        Ok(())
    }

    /// Emit one trace event at `addr`, resolving all requested arguments.
    fn convert_probe_point(
        &mut self,
        unit: &Unit,
        scope: Option<UnitOffset>,
        addr: u64,
    ) -> Result<()> {
        if self.tevs.len() == self.max_tevs {
            warn!("Too many ( > {}) probe point found.", self.max_tevs);
            return Err(ProbeError::TooManyProbes(self.max_tevs));
        }
        let dwarf = &self.di.dwarf;

        // The scope may be an inline instance or absent; anchor the event
        // to the real subprogram enclosing the address
        let scoped_sp =
            match scope {
                Some(off) => (unit.entry(off)?.tag() == gimli::DW_TAG_subprogram).then_some(off),
                None => None,
            };
        let sp_off = match scoped_sp {
            Some(off) => Some(off),
            None => die::find_real_subprogram(dwarf, unit, addr)?,
        };
        let Some(sp_off) = sp_off else {
            warn!("Failed to find probe point in any functions.");
            return Err(ProbeError::NotFound(format!(
                "function enclosing 0x{:x}",
                addr
            )));
        };
        let sp = unit.entry(sp_off)?;

        let mut point = TracePoint {
            retprobe: self.request.point.retprobe,
            ..Default::default()
        };
        match die::die_name(dwarf, unit, sp_off)? {
            Some(name) => {
                let Some(entry) = die::entry_pc(dwarf, unit, &sp)? else {
                    warn!("Failed to get entry pc of {}", name);
                    return Err(ProbeError::NotFound(format!("entry address of {}", name)));
                };
                point.offset = addr.checked_sub(entry).ok_or_else(|| {
                    ProbeError::Invalid(format!(
                        "address 0x{:x} precedes the entry of {}",
                        addr, name
                    ))
                })?;
                point.symbol = name;
            }
            // This function has no name: keep the raw address
            None => point.offset = addr,
        }
        debug!("Probe point found: {}", point);

        let frame_base =
            location::resolve_frame_base(dwarf, unit, self.di.cfi.as_ref(), &sp, addr)?;

        let mut args = Vec::with_capacity(self.request.args.len());
        for spec in &self.request.args {
            args.push(self.resolve_arg(unit, sp_off, addr, &frame_base, spec)?);
        }

        self.tevs.push(TraceEvent { point, args });
        Ok(())
    }

    /// Resolve one argument spec at a concrete probe site.
    fn resolve_arg(
        &self,
        unit: &Unit,
        sp_off: UnitOffset,
        addr: u64,
        frame_base: &FrameBase,
        spec: &ArgSpec,
    ) -> Result<TraceArg> {
        let mut tvar = TraceArg {
            name: spec.display_name(),
            ..Default::default()
        };

        if !is_c_varname(&spec.var) {
            // Raw tokens ($retval, %reg, @symbol, ...) pass through
            tvar.value = spec.var.clone();
            return Ok(tvar);
        }

        debug!("Searching '{}' variable in context.", spec.var);
        let dwarf = &self.di.dwarf;
        let var_off = match die::find_variable(dwarf, unit, sp_off, &spec.var)? {
            Some(off) => off,
            // Not local: try the enclosing scopes up to the unit
            None => die::find_scope_variable(dwarf, unit, sp_off, &spec.var)?.ok_or_else(|| {
                warn!("Failed to find '{}' in this function.", spec.var);
                ProbeError::NotFound(format!("variable '{}'", spec.var))
            })?,
        };

        location::convert_variable(
            dwarf,
            unit,
            var_off,
            addr,
            frame_base,
            spec,
            self.config,
            &mut tvar,
        )?;
        Ok(tvar)
    }
}

/// Whether the unit's address ranges cover `addr`.
fn unit_contains(dwarf: &gimli::Dwarf<Reader>, unit: &Unit, addr: u64) -> Result<bool> {
    let mut ranges = dwarf.unit_ranges(unit)?;
    while let Some(range) = ranges.next()? {
        if range.begin <= addr && addr < range.end {
            return Ok(true);
        }
    }
    Ok(false)
}

fn section_data<'a>(object_file: &'a object::File, name: &str) -> Option<&'a [u8]> {
    object_file
        .section_by_name(name)
        .and_then(|section| section.data().ok())
}

/// The resolver is useless without `.debug_info`; check before parsing.
fn has_debug_info(object_file: &object::File) -> bool {
    section_data(object_file, ".debug_info").is_some_and(|data| !data.is_empty())
}

/// Load all DWARF sections as 'static slices backed by the file image.
fn load_dwarf_sections(object_file: &object::File) -> Result<gimli::Dwarf<Reader>> {
    let endian = gimli::LittleEndian;

    let load_section = |id: gimli::SectionId| -> Result<Reader> {
        let data = section_data(object_file, id.name()).unwrap_or(&[]);
        // SAFETY: the backing buffer is owned by DebugInfo and outlives
        // every reader handed out from it
        let static_data = unsafe { std::slice::from_raw_parts(data.as_ptr(), data.len()) };
        Ok(gimli::EndianSlice::new(static_data, endian))
    };

    Ok(gimli::Dwarf::load(load_section)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file() {
        let err = DebugInfo::load("/no/such/binary").unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
    }

    #[test]
    fn test_load_garbage_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an ELF image").unwrap();
        file.flush().unwrap();
        let err = DebugInfo::load(file.path()).unwrap_err();
        assert!(matches!(err, ProbeError::Object(_)));
    }

    #[test]
    fn test_load_own_image() {
        // The test binary itself is a valid object; depending on how it
        // was built it may or may not carry .debug_info.
        let exe = std::env::current_exe().unwrap();
        match DebugInfo::load(&exe) {
            Ok(_) => {}
            Err(ProbeError::NoDebugInfo) => {}
            Err(other) => panic!("unexpected load failure: {other}"),
        }
    }
}
