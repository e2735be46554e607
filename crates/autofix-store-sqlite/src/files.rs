use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use autofix_core::KnowledgeBase;
use tempfile::NamedTempFile;
use time::OffsetDateTime;

/// Replace `path` with `contents` so readers see either the old or new file, never a torn write.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp = staged_file(path, contents)?;
    temp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Create `path` with `contents` unless it already exists. Returns whether this call created it.
pub(crate) fn write_new(path: &Path, contents: &[u8]) -> Result<bool> {
    let temp = staged_file(path, contents)?;
    match temp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(anyhow::Error::new(err.error)
            .context(format!("failed to create {}", path.display()))),
    }
}

fn staged_file(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    temp.write_all(contents)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", path.display()))?;
    Ok(temp)
}

/// Load the knowledge base document, or an empty one when the file does not exist yet.
pub(crate) fn read_knowledge(path: &Path, now: OffsetDateTime) -> Result<KnowledgeBase> {
    if !path.exists() {
        return Ok(KnowledgeBase::empty(now));
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read knowledge base {}", path.display()))?;
    KnowledgeBase::from_json(&raw)
        .with_context(|| format!("failed to parse knowledge base {}", path.display()))
}

pub(crate) fn encode_knowledge(knowledge: &KnowledgeBase) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(knowledge).context("failed to serialize knowledge base")
}

pub(crate) fn write_knowledge(path: &Path, knowledge: &KnowledgeBase) -> Result<()> {
    write_atomic(path, &encode_knowledge(knowledge)?)
}

/// Seed the knowledge base file without overwriting one another store wrote first.
pub(crate) fn create_knowledge(path: &Path, knowledge: &KnowledgeBase) -> Result<bool> {
    write_new(path, &encode_knowledge(knowledge)?)
}
