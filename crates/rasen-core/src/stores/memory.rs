//! Cross-session memory in human-readable markdown.
//!
//! `memories.md` is grouped into one section per kind and is meant to be
//! git-tracked so humans can curate it out-of-band. Entries are append-only
//! from the supervisor's side:
//!
//! ```markdown
//! ## Patterns
//!
//! ### mem-20260127-001
//! > Repository uses builder-style constructors everywhere
//! <!-- tags: style, api | created: 2026-01-27T10:00:00Z -->
//! ```

use crate::file_lock::{atomic_write, FileLock};
use crate::stores::StoreError;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Classification of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// How this codebase does things.
    Pattern,
    /// Why something was chosen.
    Decision,
    /// Solution to a recurring problem.
    Fix,
}

impl MemoryKind {
    /// Markdown section header name for this kind.
    pub fn section_name(&self) -> &'static str {
        match self {
            Self::Pattern => "Patterns",
            Self::Decision => "Decisions",
            Self::Fix => "Fixes",
        }
    }

    /// Parses a section header name back into a kind.
    pub fn from_section(s: &str) -> Option<Self> {
        match s {
            "Patterns" => Some(Self::Pattern),
            "Decisions" => Some(Self::Decision),
            "Fixes" => Some(Self::Fix),
            _ => None,
        }
    }

    /// All kinds in storage order.
    pub fn all() -> &'static [Self] {
        &[Self::Pattern, Self::Decision, Self::Fix]
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pattern => write!(f, "pattern"),
            Self::Decision => write!(f, "decision"),
            Self::Fix => write!(f, "fix"),
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pattern" => Ok(Self::Pattern),
            "decision" => Ok(Self::Decision),
            "fix" => Ok(Self::Fix),
            _ => Err(format!(
                "invalid memory kind '{s}', expected pattern, decision, or fix"
            )),
        }
    }
}

/// A single memory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    /// `mem-YYYYMMDD-NNN`, unique within a day.
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Store for `memories.md`.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    path: PathBuf,
}

const EMPTY_TEMPLATE: &str = "# Memories\n\n## Patterns\n\n## Decisions\n\n## Fixes\n";

impl MemoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses all memories from the file, in order of appearance.
    ///
    /// Returns an empty list if the file does not exist.
    pub fn load(&self) -> Result<Vec<Memory>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let lock = FileLock::new(&self.path)?;
        let _guard = lock.shared()?;
        let content = std::fs::read_to_string(&self.path)?;
        Ok(parse_memories(&content))
    }

    /// Appends a memory into its kind's section.
    ///
    /// Creates the file from the template on first write.
    pub fn append(&self, memory: &Memory) -> Result<(), StoreError> {
        let lock = FileLock::new(&self.path)?;
        let _guard = lock.exclusive()?;

        let content = if self.path.exists() {
            std::fs::read_to_string(&self.path)?
        } else {
            EMPTY_TEMPLATE.to_string()
        };

        let section = format!("## {}", memory.kind.section_name());
        let entry = format_memory(memory);

        let new_content = if let Some(pos) = content.find(&section) {
            let insert_at = content[pos..]
                .find('\n')
                .map(|n| pos + n + 1)
                .unwrap_or(content.len());
            format!("{}\n{}{}", &content[..insert_at], entry, &content[insert_at..])
        } else {
            format!("{}\n{}\n{}", content.trim_end(), section, entry)
        };

        atomic_write(&self.path, &new_content)?;
        Ok(())
    }

    /// Creates a memory with a fresh id and appends it.
    pub fn record(
        &self,
        kind: MemoryKind,
        content: &str,
        tags: Vec<String>,
    ) -> Result<Memory, StoreError> {
        let memory = Memory {
            id: self.next_id()?,
            kind,
            content: content.to_string(),
            tags,
            created_at: Utc::now(),
        };
        self.append(&memory)?;
        Ok(memory)
    }

    /// Serializes memories most-recent-first into a bulleted list, halted by
    /// an approximate token budget (word count × 1.3).
    pub fn format_for_injection(&self, max_tokens: u32) -> Result<String, StoreError> {
        let memories = self.load()?;
        if memories.is_empty() {
            return Ok(String::new());
        }

        let mut out = String::from("## Relevant Memories from Previous Sessions\n");
        let mut token_estimate = 10u32; // header

        for memory in memories.iter().rev() {
            let entry = format!("- **{}**: {}\n", memory.kind, memory.content);
            let entry_tokens = (entry.split_whitespace().count() as f64 * 1.3) as u32;
            if token_estimate + entry_tokens > max_tokens {
                break;
            }
            out.push_str(&entry);
            token_estimate += entry_tokens;
        }

        Ok(out)
    }

    /// Case-insensitive search over content and tags.
    pub fn search(&self, query: &str) -> Result<Vec<Memory>, StoreError> {
        let query = query.to_lowercase();
        Ok(self
            .load()?
            .into_iter()
            .filter(|m| {
                m.content.to_lowercase().contains(&query)
                    || m.tags.iter().any(|t| t.to_lowercase().contains(&query))
            })
            .collect())
    }

    /// Next `mem-YYYYMMDD-NNN` id, unique within the current day.
    fn next_id(&self) -> Result<String, StoreError> {
        let date = Utc::now().format("%Y%m%d").to_string();
        let today = self
            .load()?
            .iter()
            .filter(|m| m.id.contains(&date))
            .count();
        Ok(format!("mem-{}-{:03}", date, today + 1))
    }
}

fn format_memory(memory: &Memory) -> String {
    let content_lines: Vec<String> = memory
        .content
        .lines()
        .map(|line| format!("> {line}"))
        .collect();
    format!(
        "### {}\n{}\n<!-- tags: {} | created: {} -->\n",
        memory.id,
        content_lines.join("\n"),
        memory.tags.join(", "),
        memory.created_at.to_rfc3339(),
    )
}

/// Line-oriented parser for the memories document.
fn parse_memories(content: &str) -> Vec<Memory> {
    let mut memories = Vec::new();
    let mut section = MemoryKind::Pattern;
    let mut current: Option<(String, Vec<String>)> = None; // (id, content lines)

    for line in content.lines() {
        if let Some(name) = line.strip_prefix("## ") {
            if let Some(kind) = MemoryKind::from_section(name.trim()) {
                section = kind;
            }
            current = None;
        } else if let Some(id) = line.strip_prefix("### ") {
            current = Some((id.trim().to_string(), Vec::new()));
        } else if let Some(quoted) = line.strip_prefix("> ") {
            if let Some((_, lines)) = current.as_mut() {
                lines.push(quoted.to_string());
            }
        } else if let Some((tags, created)) = parse_meta_comment(line) {
            if let Some((id, lines)) = current.take() {
                let Ok(created_at) = DateTime::parse_from_rfc3339(&created) else {
                    continue;
                };
                memories.push(Memory {
                    id,
                    kind: section,
                    content: lines.join("\n"),
                    tags,
                    created_at: created_at.with_timezone(&Utc),
                });
            }
        }
    }

    memories
}

fn parse_meta_comment(line: &str) -> Option<(Vec<String>, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^<!--\s*tags:\s*(.*?)\s*\|\s*created:\s*(.*?)\s*-->$")
            .expect("meta comment regex is valid")
    });
    let cap = re.captures(line.trim())?;
    let tags = cap[1]
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    Some((tags, cap[2].to_string()))
}

/// Scans assistant output for explicit memory markers of the form
/// `<!-- memory: KIND: CONTENT -->`.
pub fn extract_memory_markers(output: &str) -> Vec<(MemoryKind, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?si)<!--\s*memory:\s*(pattern|decision|fix)\s*:\s*(.*?)-->")
            .expect("memory marker regex is valid")
    });

    re.captures_iter(output)
        .filter_map(|cap| {
            let kind: MemoryKind = cap[1].parse().ok()?;
            let content = cap[2].trim().to_string();
            if content.is_empty() {
                None
            } else {
                Some((kind, content))
            }
        })
        .collect()
}
