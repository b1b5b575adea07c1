// Lazy pattern matching: a whitespace-insensitive glob applied per source
// line, used to pick probe lines by content instead of number.

use crate::line_list::{LineList, LineListAdd};
use crate::Result;
use std::path::Path;
use tracing::{debug, warn};

/// Match `line` against `pattern` under glob semantics, ignoring all
/// whitespace on both sides.
pub(crate) fn lazy_match(line: &str, pattern: &str) -> bool {
    let stripped_line: Vec<u8> = line
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let stripped_pat: Vec<u8> = pattern
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    glob_match(&stripped_line, &stripped_pat)
}

/// Glob matching with `*`, `?`, `[set]`, `[!set]`, `a-z` ranges and
/// backslash escapes.
fn glob_match(s: &[u8], p: &[u8]) -> bool {
    let mut si = 0;
    let mut pi = 0;

    while si < s.len() && pi < p.len() && p[pi] != b'*' {
        match p[pi] {
            b'?' => {
                si += 1;
                pi += 1;
            }
            b'[' => {
                if !class_match(s[si], p, &mut pi) {
                    return false;
                }
                si += 1;
            }
            b'\\' => {
                pi += 1;
                if pi >= p.len() || s[si] != p[pi] {
                    return false;
                }
                si += 1;
                pi += 1;
            }
            c => {
                if s[si] != c {
                    return false;
                }
                si += 1;
                pi += 1;
            }
        }
    }

    if pi < p.len() && p[pi] == b'*' {
        while pi < p.len() && p[pi] == b'*' {
            pi += 1;
        }
        if pi == p.len() {
            return true;
        }
        return (si..=s.len()).any(|k| glob_match(&s[k..], &p[pi..]));
    }

    si == s.len() && pi == p.len()
}

/// Match one character against a `[...]` class. `pi` points at the opening
/// bracket on entry and is left one past the closing bracket on a
/// successful parse. A pattern with an unterminated class never matches.
fn class_match(c: u8, p: &[u8], pi: &mut usize) -> bool {
    *pi += 1;
    let negated = p.get(*pi) == Some(&b'!');
    if negated {
        *pi += 1;
    }
    let mut matched = false;
    loop {
        match p.get(*pi) {
            None => return false,
            Some(b']') => break,
            Some(&lo)
                if p.get(*pi + 1) == Some(&b'-')
                    && p.get(*pi + 2).is_some_and(|&hi| hi != b']') =>
            {
                let hi = p[*pi + 2];
                if (lo..=hi).contains(&c) {
                    matched = true;
                }
                *pi += 3;
            }
            Some(&ch) => {
                if ch == c {
                    matched = true;
                }
                *pi += 1;
            }
        }
    }
    *pi += 1;
    matched != negated
}

/// Scan a source file and record every line whose content matches the lazy
/// pattern. Returns the number of matching lines.
pub(crate) fn find_lazy_match_lines(
    list: &mut LineList,
    path: &Path,
    pattern: &str,
) -> Result<usize> {
    let data = std::fs::read(path).map_err(|e| {
        warn!("Failed to open {}: {}", path.display(), e);
        e
    })?;
    let text = String::from_utf8_lossy(&data);

    let mut nlines = 0;
    for (idx, line) in text.lines().enumerate() {
        if lazy_match(line, pattern) {
            if list.add((idx + 1) as u32) == LineListAdd::Added {
                nlines += 1;
            }
        }
    }
    debug!(
        "lazy match: {} lines of {} match '{}'",
        nlines,
        path.display(),
        pattern
    );
    Ok(nlines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_literal_and_wildcards() {
        assert!(lazy_match("a = b;", "a=b;"));
        assert!(lazy_match("rq = cpu_rq(cpu);", "rq=cpu_rq*"));
        assert!(lazy_match("abc", "a?c"));
        assert!(!lazy_match("abc", "a?d"));
        assert!(!lazy_match("abc", "abcd"));
        assert!(lazy_match("anything at all", "*"));
    }

    #[test]
    fn test_star_backtracking() {
        assert!(lazy_match("foo_bar_baz", "foo*baz"));
        assert!(lazy_match("foo_bar_baz", "*bar*"));
        assert!(!lazy_match("foo_bar", "foo*baz"));
        assert!(lazy_match("aaab", "a*ab"));
    }

    #[test]
    fn test_character_classes() {
        assert!(lazy_match("x1", "x[0-9]"));
        assert!(!lazy_match("xa", "x[0-9]"));
        assert!(lazy_match("xa", "x[!0-9]"));
        assert!(lazy_match("xb", "x[abc]"));
        assert!(!lazy_match("xd", "x[abc]"));
        // Unterminated class never matches
        assert!(!lazy_match("xa", "x[a"));
    }

    #[test]
    fn test_escape() {
        assert!(lazy_match("f(*p)", r"f(\*p)"));
        assert!(!lazy_match("f(xp)", r"f(\*p)"));
    }

    #[test]
    fn test_whitespace_insensitive() {
        assert!(lazy_match("\tif (err < 0)\t", "if(err<0)"));
        assert!(lazy_match("if(err<0)", "if (err < 0)"));
    }

    #[test]
    fn test_find_lazy_match_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "int main(void)").unwrap();
        writeln!(file, "{{").unwrap();
        writeln!(file, "\tint rc = do_work();").unwrap();
        writeln!(file, "\treturn rc;").unwrap();
        writeln!(file, "}}").unwrap();
        file.flush().unwrap();

        let mut list = LineList::new();
        let n = find_lazy_match_lines(&mut list, file.path(), "rc=do_work*").unwrap();
        assert_eq!(n, 1);
        assert_eq!(list.as_slice(), &[3]);

        let mut list = LineList::new();
        let n = find_lazy_match_lines(&mut list, file.path(), "no_such_line").unwrap();
        assert_eq!(n, 0);
        assert!(list.is_empty());
    }

    #[test]
    fn test_find_lazy_match_lines_missing_file() {
        let mut list = LineList::new();
        let err = find_lazy_match_lines(
            &mut list,
            Path::new("/nonexistent/source.c"),
            "*",
        )
        .unwrap_err();
        assert!(matches!(err, crate::ProbeError::Io(_)));
    }
}
