// Probe request/result data model
// The request side mirrors what the user-syntax parser produces; the result
// side is expressed in the kernel tracer's vocabulary.

use crate::line_list::LineList;
use std::fmt;
use std::path::PathBuf;

/// Read-only configuration injected into every resolver entry point.
#[derive(Clone)]
pub struct Config {
    /// Optional prefix prepended while resolving DWARF source paths.
    pub source_prefix: Option<PathBuf>,
    /// Architecture register map: DWARF register number to tracer name.
    pub register_name: fn(u16) -> Option<&'static str>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_prefix: None,
            register_name: tracefinder_platform::dwarf_reg_to_name,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("source_prefix", &self.source_prefix)
            .finish()
    }
}

/// Where to install the probe.
///
/// Exactly one selector is expected: a function (optionally restricted by
/// file, relative line, byte offset or lazy pattern), a file plus absolute
/// line, or a file plus lazy pattern.
#[derive(Debug, Clone, Default)]
pub struct ProbeSpec {
    pub function: Option<String>,
    pub file: Option<String>,
    /// Relative to the function declaration when `function` is set,
    /// absolute otherwise.
    pub line: Option<u32>,
    /// Byte offset from the function entry.
    pub offset: u64,
    pub lazy_pattern: Option<String>,
    pub retprobe: bool,
}

/// One step of a C field-access chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAccess {
    /// `.name` or, when `deref` is set, `->name`.
    Member { name: String, deref: bool },
    /// `[index]`
    Index(i64),
}

/// One argument to capture at the probe site.
#[derive(Debug, Clone, Default)]
pub struct ArgSpec {
    /// User-chosen alias; synthesized from the expression when absent.
    pub name: Option<String>,
    /// C variable name, or a raw token passed through verbatim
    /// (`$retval`, `%ax`, `@symbol`, ...).
    pub var: String,
    pub fields: Vec<FieldAccess>,
    /// Textual type override such as `u32` or `x64`; wins over inference.
    pub type_cast: Option<String>,
}

/// A fully parsed probe request.
#[derive(Debug, Clone, Default)]
pub struct ProbeRequest {
    pub point: ProbeSpec,
    pub args: Vec<ArgSpec>,
}

/// A concrete probe site in the tracer's vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracePoint {
    /// Enclosing function symbol; empty when the function is nameless.
    pub symbol: String,
    /// Bytes from the function entry, or the raw address for a nameless
    /// function.
    pub offset: u64,
    pub retprobe: bool,
}

/// One argument of a probe record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceArg {
    pub name: String,
    /// Register name, `@symbol`, or a raw passthrough token.
    pub value: String,
    /// Indirection offsets, outermost first: `+r0(+r1(...(value)...))`.
    pub refs: Vec<i64>,
    /// `s8`..`s64`, `u8`..`u64`, or a user cast; `None` lets the kernel
    /// infer.
    pub type_tag: Option<String>,
}

/// One resolved probe record.
#[derive(Debug, Clone, Default)]
pub struct TraceEvent {
    pub point: TracePoint,
    pub args: Vec<TraceArg>,
}

/// Reverse-lookup result: the source position of an address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbePoint {
    pub function: Option<String>,
    pub file: Option<String>,
    /// Relative to the anchor declaration line when `function` is set.
    pub line: Option<u32>,
    /// Byte offset from the function entry, when no line was available.
    pub offset: Option<u64>,
}

/// Line-range request: a function with relative bounds, or a file with
/// absolute bounds.
#[derive(Debug, Clone)]
pub struct LineRangeSpec {
    pub function: Option<String>,
    pub file: Option<String>,
    pub start: u32,
    pub end: u32,
}

impl LineRangeSpec {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            function: Some(name.into()),
            file: None,
            start: 0,
            end: u32::MAX,
        }
    }

    pub fn file(path: impl Into<String>, start: u32, end: u32) -> Self {
        Self {
            function: None,
            file: Some(path.into()),
            start,
            end,
        }
    }
}

/// Probeable lines found for a range request.
#[derive(Debug, Clone)]
pub struct LineRange {
    /// Resolved on-disk source path.
    pub path: PathBuf,
    /// Absolute line bounds actually searched.
    pub start: u32,
    pub end: u32,
    /// Declaration line of the scoping function, when one was requested.
    pub offset: Option<u32>,
    pub lines: LineList,
}

/// A C variable name starts with a letter or underscore; anything else is
/// passed through to the tracer untouched.
pub(crate) fn is_c_varname(s: &str) -> bool {
    s.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
}

impl ArgSpec {
    /// Render the argument back into source syntax (`var->f[0].g:u32`).
    pub fn synthesize(&self) -> String {
        let mut buf = self.var.clone();
        for field in &self.fields {
            match field {
                FieldAccess::Member { name, deref } => {
                    buf.push_str(if *deref { "->" } else { "." });
                    buf.push_str(name);
                }
                FieldAccess::Index(idx) => {
                    buf.push('[');
                    buf.push_str(&idx.to_string());
                    buf.push(']');
                }
            }
        }
        if let Some(cast) = &self.type_cast {
            buf.push(':');
            buf.push_str(cast);
        }
        buf
    }

    /// The name the trace record carries: the user alias verbatim, or the
    /// synthesized expression with the type separator rewritten.
    pub(crate) fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.synthesize().replacen(':', "_", 1),
        }
    }
}

impl fmt::Display for TracePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.symbol.is_empty() {
            write!(f, "0x{:x}", self.offset)
        } else {
            write!(f, "{}+{}", self.symbol, self.offset)
        }
    }
}

impl fmt::Display for TraceArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=", self.name)?;
        for offset in &self.refs {
            write!(f, "{:+}(", offset)?;
        }
        f.write_str(&self.value)?;
        for _ in &self.refs {
            f.write_str(")")?;
        }
        if let Some(tag) = &self.type_tag {
            write!(f, ":{}", tag)?;
        }
        Ok(())
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.point)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_c_varname() {
        assert!(is_c_varname("cpu"));
        assert!(is_c_varname("_rq"));
        assert!(!is_c_varname("$retval"));
        assert!(!is_c_varname("%ax"));
        assert!(!is_c_varname("@symbol"));
        assert!(!is_c_varname("42"));
        assert!(!is_c_varname(""));
    }

    #[test]
    fn test_synthesize_fields() {
        let arg = ArgSpec {
            name: None,
            var: "rq".to_string(),
            fields: vec![
                FieldAccess::Member {
                    name: "curr".to_string(),
                    deref: true,
                },
                FieldAccess::Member {
                    name: "pid".to_string(),
                    deref: false,
                },
                FieldAccess::Index(2),
            ],
            type_cast: Some("u32".to_string()),
        };
        assert_eq!(arg.synthesize(), "rq->curr.pid[2]:u32");
        // Type separator becomes '_' in the synthesized name
        assert_eq!(arg.display_name(), "rq->curr.pid[2]_u32");
    }

    #[test]
    fn test_display_name_prefers_alias() {
        let arg = ArgSpec {
            name: Some("task".to_string()),
            var: "rq".to_string(),
            fields: vec![FieldAccess::Member {
                name: "curr".to_string(),
                deref: true,
            }],
            type_cast: None,
        };
        assert_eq!(arg.display_name(), "task");
    }

    #[test]
    fn test_trace_arg_rendering() {
        let arg = TraceArg {
            name: "pid".to_string(),
            value: "%di".to_string(),
            refs: vec![8, -16],
            type_tag: Some("s32".to_string()),
        };
        // Outermost ref first: read [[%di - 16] + 8]
        assert_eq!(arg.to_string(), "pid=+8(-16(%di)):s32");

        let plain = TraceArg {
            name: "cpu".to_string(),
            value: "%si".to_string(),
            refs: Vec::new(),
            type_tag: None,
        };
        assert_eq!(plain.to_string(), "cpu=%si");
    }

    #[test]
    fn test_trace_event_rendering() {
        let event = TraceEvent {
            point: TracePoint {
                symbol: "schedule".to_string(),
                offset: 12,
                retprobe: false,
            },
            args: vec![TraceArg {
                name: "cpu".to_string(),
                value: "%di".to_string(),
                refs: Vec::new(),
                type_tag: Some("s32".to_string()),
            }],
        };
        assert_eq!(event.to_string(), "schedule+12 cpu=%di:s32");
    }

    #[test]
    fn test_nameless_point_renders_address() {
        let point = TracePoint {
            symbol: String::new(),
            offset: 0xffffffff81000000,
            retprobe: false,
        };
        assert_eq!(point.to_string(), "0xffffffff81000000");
    }
}
