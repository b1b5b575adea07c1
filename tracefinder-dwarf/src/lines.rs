// Per-unit line table snapshot
// One pass over the unit's line program yields the (address, file, line)
// rows the finders iterate, plus the rendered file name table.

use crate::Result;
use tracing::debug;

type Reader = gimli::EndianSlice<'static, gimli::LittleEndian>;

/// A single line mapping entry.
#[derive(Debug, Clone)]
pub(crate) struct LineRow {
    pub address: u64,
    pub file_index: u64,
    pub line: u32,
}

/// Parsed line information for one compilation unit.
#[derive(Debug, Default)]
pub(crate) struct LineTable {
    files: Vec<String>,
    pub rows: Vec<LineRow>,
}

impl LineTable {
    /// Run the unit's line program and collect rows in emission order.
    /// Returns `None` when the unit carries no line program.
    pub fn parse(
        dwarf: &gimli::Dwarf<Reader>,
        unit: &gimli::Unit<Reader>,
    ) -> Result<Option<Self>> {
        let ilnp = match unit.line_program {
            Some(ref ilnp) => ilnp.clone(),
            None => return Ok(None),
        };

        let mut rows = Vec::new();
        let mut sm = ilnp.rows();
        while let Some((_, row)) = sm.next_row()? {
            if row.end_sequence() {
                continue;
            }
            let line = row.line().map(|l| l.get()).unwrap_or(0) as u32;
            rows.push(LineRow {
                address: row.address(),
                file_index: row.file_index(),
                line,
            });
        }

        let header = sm.header();
        let mut files = Vec::new();
        match header.file(0) {
            Some(file) => files.push(render_file(dwarf, unit, header, file)?),
            // DWARF versions <= 4 have no 0th file entry
            None => files.push(String::new()),
        }
        let mut index = 1;
        while let Some(file) = header.file(index) {
            files.push(render_file(dwarf, unit, header, file)?);
            index += 1;
        }

        debug!(
            "line table: {} rows, {} files in this unit",
            rows.len(),
            files.len()
        );
        Ok(Some(LineTable { files, rows }))
    }

    pub fn file(&self, index: u64) -> Option<&str> {
        self.files
            .get(index as usize)
            .map(String::as_str)
            .filter(|f| !f.is_empty())
    }

    /// Find the full path of a source file referenced by its tail.
    /// The first tail-matching entry of the unit's file table wins.
    pub fn find_realpath(&self, fname: &str) -> Option<&str> {
        self.files
            .iter()
            .map(String::as_str)
            .find(|src| !src.is_empty() && tail_match(src, fname))
    }
}

/// Compare the tails of two paths, character by character from the right.
/// They match when the whole of either string equals the other's tail.
/// Tolerant of build-tree vs. source-tree prefix differences.
pub(crate) fn tail_match(s1: &str, s2: &str) -> bool {
    s1.bytes()
        .rev()
        .zip(s2.bytes().rev())
        .all(|(a, b)| a == b)
}

/// Render a line-program file entry into a full path, rooted at the unit's
/// compilation directory.
pub(crate) fn render_file(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    header: &gimli::LineProgramHeader<Reader>,
    file: &gimli::FileEntry<Reader>,
) -> Result<String> {
    let mut path = match unit.comp_dir {
        Some(comp_dir) => comp_dir.to_string_lossy().into_owned(),
        None => String::new(),
    };

    // Directory index 0 is the compilation unit directory itself.
    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            path_push(
                &mut path,
                dwarf.attr_string(unit, directory)?.to_string_lossy().as_ref(),
            );
        }
    }

    path_push(
        &mut path,
        dwarf
            .attr_string(unit, file.path_name())?
            .to_string_lossy()
            .as_ref(),
    );

    Ok(path)
}

fn path_push(path: &mut String, p: &str) {
    if p.starts_with('/') {
        *path = p.to_string();
    } else {
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        *path += p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_match() {
        // Exact and suffix matches, both directions
        assert!(tail_match("kernel/sched.c", "kernel/sched.c"));
        assert!(tail_match("/build/linux/kernel/sched.c", "kernel/sched.c"));
        assert!(tail_match("sched.c", "/build/linux/kernel/sched.c"));

        // Differing tails never match
        assert!(!tail_match("kernel/fork.c", "kernel/sched.c"));
        assert!(!tail_match("/a/mysched.c", "/a/sched.c"));

        // Character-level comparison: a bare suffix matches even across a
        // path component boundary
        assert!(tail_match("/path/to/mytest.c", "test.c"));
    }

    #[test]
    fn test_path_push() {
        let mut p = "/usr/src".to_string();
        path_push(&mut p, "kernel/sched.c");
        assert_eq!(p, "/usr/src/kernel/sched.c");

        let mut p = "/usr/src".to_string();
        path_push(&mut p, "/abs/override.c");
        assert_eq!(p, "/abs/override.c");

        let mut p = String::new();
        path_push(&mut p, "rel.c");
        assert_eq!(p, "rel.c");
    }
}
