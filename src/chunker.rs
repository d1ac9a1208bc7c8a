//! Code-aware chunker.
//!
//! Splits file content into size-bounded chunks along semantic
//! boundaries — function/class starts for code, headings for Markdown,
//! fixed line windows for everything else — and prepends a configurable
//! token-estimated overlap from the previous chunk so that retrieval
//! context survives chunk borders.
//!
//! Token counts are estimated as `ceil(bytes / 4)`; no tokenizer is
//! loaded.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Languages with a semantic splitter. Everything else falls back to
/// line windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Go,
    Python,
    JavaScript,
    TypeScript,
    Java,
    C,
    Cpp,
    Markdown,
    Rust,
    Unknown,
}

impl Language {
    /// Detect from a file extension.
    pub fn from_path(path: &str) -> Language {
        let ext = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "go" => Language::Go,
            "py" => Language::Python,
            "js" | "jsx" | "mjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "java" => Language::Java,
            "c" | "h" => Language::C,
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => Language::Cpp,
            "md" | "markdown" => Language::Markdown,
            "rs" => Language::Rust,
            _ => Language::Unknown,
        }
    }

    /// Canonical lowercase name stored in chunk metadata.
    pub fn name(&self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Markdown => "markdown",
            Language::Rust => "rust",
            Language::Unknown => "text",
        }
    }
}

/// Chunking parameters.
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    /// Soft maximum chunk size in estimated tokens.
    pub max_tokens: usize,
    /// Fraction of the previous chunk prepended to the next one.
    pub overlap_ratio: f64,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_ratio: 0.20,
        }
    }
}

/// One chunk of a source file. `content` includes the overlap prefix;
/// `start_line`/`end_line` cover the chunk's own lines (1-based,
/// inclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Content-addressed id: SHA-256 over `(file_path, start_line,
    /// end_line, content)`.
    pub id: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Top-level symbols defined in this chunk (function/class names).
    pub symbols: Vec<String>,
    /// Modules or paths imported by this chunk.
    pub imports: Vec<String>,
}

/// `ceil(bytes / 4)` token estimate used across the chunker and its
/// callers.
pub fn estimate_tokens(bytes: usize) -> usize {
    bytes.div_ceil(4)
}

/// Stable content-addressed chunk id.
pub fn chunk_id(file_path: &str, start_line: usize, end_line: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update(start_line.to_le_bytes());
    hasher.update(end_line.to_le_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============ Boundary detection ============

struct Patterns {
    boundary: Regex,
    symbol: Regex,
    import: Regex,
}

fn go_patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        boundary: Regex::new(r"^(func|type)\s").unwrap(),
        symbol: Regex::new(r"^func\s+(?:\([^)]*\)\s*)?(\w+)|^type\s+(\w+)").unwrap(),
        import: Regex::new(r#"^\s*(?:import\s+)?(?:\w+\s+)?"([^"]+)""#).unwrap(),
    })
}

fn python_patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        boundary: Regex::new(r"^(def|class|async\s+def)\s").unwrap(),
        symbol: Regex::new(r"^(?:async\s+)?(?:def|class)\s+(\w+)").unwrap(),
        import: Regex::new(r"^(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))").unwrap(),
    })
}

fn js_patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        boundary: Regex::new(
            r"^(export\s+)?(async\s+)?(function|class|const\s+\w+\s*=\s*(async\s*)?\()",
        )
        .unwrap(),
        symbol: Regex::new(r"^(?:export\s+)?(?:async\s+)?(?:function|class)\s+(\w+)|^(?:export\s+)?const\s+(\w+)\s*=")
            .unwrap(),
        import: Regex::new(r#"(?:import\s.*?from\s+|require\()\s*['"]([^'"]+)['"]"#).unwrap(),
    })
}

fn java_patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        boundary: Regex::new(
            r"^\s*(public|private|protected|static|final|abstract|class|interface|enum)\s",
        )
        .unwrap(),
        symbol: Regex::new(r"(?:class|interface|enum)\s+(\w+)|(?:\w+)\s+(\w+)\s*\(").unwrap(),
        import: Regex::new(r"^import\s+(?:static\s+)?([\w.]+);").unwrap(),
    })
}

fn c_patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        boundary: Regex::new(r"^\w[\w\s\*]*\s+\**\w+\s*\([^;]*$|^(struct|class|enum|union)\s")
            .unwrap(),
        symbol: Regex::new(r"^[\w\s\*]+?(\w+)\s*\(|^(?:struct|class|enum|union)\s+(\w+)").unwrap(),
        import: Regex::new(r#"^#include\s+[<"]([^>"]+)[>"]"#).unwrap(),
    })
}

fn rust_patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        boundary: Regex::new(r"^\s*(pub\s+)?(fn|struct|enum|trait|impl|mod)\s").unwrap(),
        symbol: Regex::new(r"^\s*(?:pub\s+)?(?:fn|struct|enum|trait|mod)\s+(\w+)").unwrap(),
        import: Regex::new(r"^\s*use\s+([\w:]+)").unwrap(),
    })
}

fn markdown_boundary() -> &'static Regex {
    static P: OnceLock<Regex> = OnceLock::new();
    P.get_or_init(|| Regex::new(r"^#{1,6}\s").unwrap())
}

fn patterns_for(language: Language) -> Option<&'static Patterns> {
    match language {
        Language::Go => Some(go_patterns()),
        Language::Python => Some(python_patterns()),
        Language::JavaScript | Language::TypeScript => Some(js_patterns()),
        Language::Java => Some(java_patterns()),
        Language::C | Language::Cpp => Some(c_patterns()),
        Language::Rust => Some(rust_patterns()),
        Language::Markdown | Language::Unknown => None,
    }
}

/// True when `line` starts a new semantic unit for `language`.
fn is_boundary(language: Language, line: &str) -> bool {
    match language {
        Language::Markdown => markdown_boundary().is_match(line),
        Language::Unknown => false,
        other => patterns_for(other)
            .map(|p| p.boundary.is_match(line))
            .unwrap_or(false),
    }
}

fn extract_symbols(language: Language, content: &str) -> Vec<String> {
    let Some(patterns) = patterns_for(language) else {
        return Vec::new();
    };
    let mut symbols = Vec::new();
    for line in content.lines() {
        if let Some(caps) = patterns.symbol.captures(line) {
            for group in caps.iter().skip(1).flatten() {
                let name = group.as_str().to_string();
                if !name.is_empty() && !symbols.contains(&name) {
                    symbols.push(name);
                }
            }
        }
    }
    symbols
}

fn extract_imports(language: Language, content: &str) -> Vec<String> {
    let Some(patterns) = patterns_for(language) else {
        return Vec::new();
    };
    let mut imports = Vec::new();
    for line in content.lines() {
        if let Some(caps) = patterns.import.captures(line) {
            for group in caps.iter().skip(1).flatten() {
                let name = group.as_str().to_string();
                if !name.is_empty() && !imports.contains(&name) {
                    imports.push(name);
                }
            }
        }
    }
    imports
}

// ============ Overlap ============

/// Round a byte index down to a char boundary.
fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// The overlap text prepended to the chunk after `prev`: the trailing
/// `ceil(estimate_tokens(prev) * ratio) * 4` bytes, trimmed to start
/// just after the first newline inside that window when one exists, and
/// capped at the previous chunk's full size.
fn overlap_suffix(prev: &str, ratio: f64) -> String {
    if ratio <= 0.0 || prev.is_empty() {
        return String::new();
    }
    let overlap_bytes =
        ((estimate_tokens(prev.len()) as f64 * ratio).ceil() as usize).saturating_mul(4);
    let window = overlap_bytes.min(prev.len());
    if window == 0 {
        return String::new();
    }
    let start = floor_char_boundary(prev, prev.len() - window);
    let slice = &prev[start..];

    // Align to whole lines when the window contains a newline; keep the
    // raw tail otherwise.
    match slice.find('\n') {
        Some(pos) if pos + 1 < slice.len() => slice[pos + 1..].to_string(),
        _ => slice.to_string(),
    }
}

// ============ Chunking ============

struct RawChunk {
    lines: Vec<String>,
    start_line: usize,
    end_line: usize,
}

/// Split `content` into chunks for `file_path`.
///
/// Empty content yields an empty vector. A file that fits one chunk
/// yields a single chunk without overlap.
pub fn chunk_file(
    file_path: &str,
    content: &str,
    language: Language,
    opts: &ChunkOptions,
) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }

    let max_bytes = opts.max_tokens.max(1) * 4;
    let lines: Vec<&str> = content.lines().collect();

    let mut raw: Vec<RawChunk> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_bytes = 0usize;
    let mut current_start = 1usize;

    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx + 1;
        let line_bytes = line.len() + 1;

        let at_boundary = is_boundary(language, line);
        let would_overflow = current_bytes + line_bytes > max_bytes;

        // Prefer semantic boundaries once past half the budget so chunks
        // do not degenerate to single declarations; hard-split on
        // overflow regardless.
        let should_flush = !current.is_empty()
            && (would_overflow || (at_boundary && current_bytes >= max_bytes / 2));

        if should_flush {
            raw.push(RawChunk {
                lines: std::mem::take(&mut current),
                start_line: current_start,
                end_line: line_no - 1,
            });
            current_bytes = 0;
            current_start = line_no;
        }

        current.push((*line).to_string());
        current_bytes += line_bytes;
    }

    if !current.is_empty() {
        raw.push(RawChunk {
            lines: current,
            start_line: current_start,
            end_line: lines.len(),
        });
    }

    let mut chunks = Vec::with_capacity(raw.len());
    let mut prev_body: Option<String> = None;

    for rc in raw {
        let body = rc.lines.join("\n");
        let content = match prev_body {
            Some(ref prev) => {
                let overlap = overlap_suffix(prev, opts.overlap_ratio);
                if overlap.is_empty() {
                    body.clone()
                } else {
                    format!("{overlap}\n{body}")
                }
            }
            None => body.clone(),
        };

        let symbols = extract_symbols(language, &body);
        let imports = extract_imports(language, &body);
        let id = chunk_id(file_path, rc.start_line, rc.end_line, &content);

        chunks.push(Chunk {
            id,
            content,
            start_line: rc.start_line,
            end_line: rc.end_line,
            symbols,
            imports,
        });
        prev_body = Some(body);
    }

    chunks
}
