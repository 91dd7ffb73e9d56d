// Python block extraction.
//
// Parses a source blob with RustPython's parser and flattens it into the
// ordered block list used for fingerprinting: one block per function,
// async function, or class (named by dotted path from the module root),
// plus a synthetic <module> block covering every line that belongs to no
// top-level definition. Unparseable input degrades to a single
// <parse_error> block checksummed over the raw bytes, so any further edit
// to such a file invalidates all of its dependents.

use crc32fast::Hasher;
use rustpython_parser::{ast, Parse};
use rustpython_parser_core::source_code::RandomLocator;

use crate::types::Block;

/// Synthetic block name for the module-level remainder.
pub const MODULE_BLOCK: &str = "<module>";

/// Synthetic block name for files the parser rejects.
pub const PARSE_ERROR_BLOCK: &str = "<parse_error>";

/// Parse a source blob into its ordered block list.
///
/// Output is a pure function of the input bytes; block order matches
/// source order with `<module>` first. Never fails: parse errors yield
/// the `<parse_error>` pseudo-block.
pub fn parse_blocks(source: &str) -> Vec<Block> {
    let line_count = source.lines().count();

    let parsed = match ast::Suite::parse(source, "<embedded>") {
        Ok(parsed) => parsed,
        Err(_) => {
            return vec![Block {
                name: PARSE_ERROR_BLOCK.to_string(),
                start_line: 1,
                end_line: line_count.max(1),
                checksum: checksum_bytes(source.as_bytes()),
            }]
        }
    };

    let mut locator = RandomLocator::new(source);
    let lines: Vec<&str> = source.lines().collect();

    let mut named = Vec::new();
    let mut covered = Vec::new();
    let mut walker = Walker {
        lines: &lines,
        locator: &mut locator,
        blocks: &mut named,
        top_level_spans: &mut covered,
    };
    walker.walk(&parsed, &NamePath::root());

    let mut blocks = Vec::with_capacity(named.len() + 1);
    blocks.push(Block {
        name: MODULE_BLOCK.to_string(),
        start_line: 1,
        end_line: line_count.max(1),
        checksum: checksum_str(&module_text(&lines, &covered)),
    });
    blocks.extend(named);
    blocks
}

/// CRC-32 of a normalized text, by bit pattern.
pub fn checksum_str(text: &str) -> i32 {
    checksum_bytes(text.as_bytes())
}

pub fn checksum_bytes(bytes: &[u8]) -> i32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize() as i32
}

/// Dotted-name stack for nested definitions.
struct NamePath(Vec<String>);

impl NamePath {
    fn root() -> Self {
        NamePath(Vec::new())
    }

    fn child(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        NamePath(segments)
    }

    fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    fn dotted(&self) -> String {
        self.0.join(".")
    }
}

struct Walker<'a, 'b> {
    lines: &'a [&'a str],
    locator: &'b mut RandomLocator<'a>,
    blocks: &'b mut Vec<Block>,
    /// Line spans of blocks with no enclosing definition; everything else
    /// is the <module> remainder.
    top_level_spans: &'b mut Vec<(usize, usize)>,
}

impl Walker<'_, '_> {
    fn walk(&mut self, statements: &[ast::Stmt], path: &NamePath) {
        for stmt in statements {
            self.walk_stmt(stmt, path);
        }
    }

    fn walk_stmt(&mut self, stmt: &ast::Stmt, path: &NamePath) {
        match stmt {
            ast::Stmt::FunctionDef(def) => {
                self.definition(stmt, &def.name, &def.decorator_list, &def.body, path);
            }
            ast::Stmt::AsyncFunctionDef(def) => {
                self.definition(stmt, &def.name, &def.decorator_list, &def.body, path);
            }
            ast::Stmt::ClassDef(def) => {
                self.definition(stmt, &def.name, &def.decorator_list, &def.body, path);
            }
            // Compound statements may hide definitions; walk their bodies
            // without extending the dotted path.
            ast::Stmt::If(s) => {
                self.walk(&s.body, path);
                self.walk(&s.orelse, path);
            }
            ast::Stmt::For(s) => {
                self.walk(&s.body, path);
                self.walk(&s.orelse, path);
            }
            ast::Stmt::AsyncFor(s) => {
                self.walk(&s.body, path);
                self.walk(&s.orelse, path);
            }
            ast::Stmt::While(s) => {
                self.walk(&s.body, path);
                self.walk(&s.orelse, path);
            }
            ast::Stmt::With(s) => self.walk(&s.body, path),
            ast::Stmt::AsyncWith(s) => self.walk(&s.body, path),
            ast::Stmt::Try(s) => {
                self.walk(&s.body, path);
                for handler in &s.handlers {
                    match handler {
                        ast::ExceptHandler::ExceptHandler(h) => self.walk(&h.body, path),
                    }
                }
                self.walk(&s.orelse, path);
                self.walk(&s.finalbody, path);
            }
            _ => {}
        }
    }

    fn definition(
        &mut self,
        stmt: &ast::Stmt,
        name: &str,
        decorator_list: &[ast::Expr],
        body: &[ast::Stmt],
        path: &NamePath,
    ) {
        use ast::Ranged;

        let def_line = self.line_of(stmt.start());
        let start = decorator_list
            .first()
            .map(|d| self.line_of(d.start()))
            .unwrap_or(def_line);
        let end = self.line_of(stmt.end());

        if path.is_root() {
            self.top_level_spans.push((start, end));
        }

        let child = path.child(name);
        self.blocks.push(Block {
            name: child.dotted(),
            start_line: start,
            end_line: end,
            checksum: checksum_str(&normalize_lines(self.lines, start, end)),
        });

        self.walk(body, &child);
    }

    fn line_of(&mut self, offset: rustpython_parser_core::text_size::TextSize) -> usize {
        self.locator.locate(offset).row.get() as usize
    }
}

/// Assemble the normalized text of the lines `start..=end` (1-indexed,
/// inclusive): trailing whitespace stripped per line, `\n` joins, fully
/// blank leading and trailing lines dropped. Comments, docstrings, and
/// indentation are retained.
fn normalize_lines(lines: &[&str], start: usize, end: usize) -> String {
    let end = end.min(lines.len());
    if start < 1 || start > end {
        return String::new();
    }
    normalize(lines[start - 1..end].iter().map(|l| l.trim_end()))
}

/// Normalized text of every line outside the top-level definition spans.
fn module_text(lines: &[&str], covered: &[(usize, usize)]) -> String {
    let remainder = lines.iter().enumerate().filter_map(|(idx, line)| {
        let lineno = idx + 1;
        let inside = covered.iter().any(|&(s, e)| lineno >= s && lineno <= e);
        (!inside).then(|| line.trim_end())
    });
    normalize(remainder)
}

fn normalize<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let collected: Vec<&str> = lines.collect();
    let first = collected.iter().position(|l| !l.is_empty());
    let last = collected.iter().rposition(|l| !l.is_empty());
    match (first, last) {
        (Some(first), Some(last)) => collected[first..=last].join("\n"),
        _ => String::new(),
    }
}
