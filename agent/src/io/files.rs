//! Structured file operations on the session's target host.
//!
//! Local targets use the filesystem directly. Remote targets go through the
//! [`Shell`]: content moves with `upload`/`download` into a temporary path and
//! is then moved into place, so a failed transfer never leaves a half-written
//! file behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

use crate::core::action::{EditFileAction, EditKind};
use crate::io::shell::{Shell, ShellOutput, shell_quote};

const PREVIEW_CHARS: usize = 500;
const MAX_LIST_ENTRIES: usize = 1000;
const REMOTE_TMP_DIR: &str = "/tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub path: String,
    pub bytes: usize,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub path: String,
    pub action: &'static str,
    pub changes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadOutcome {
    pub path: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub lines_read: usize,
    pub total_lines: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub relative_path: String,
    pub kind: EntryKind,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListOutcome {
    pub path: String,
    pub recursive: bool,
    pub total: usize,
    pub truncated: bool,
    pub entries: Vec<DirEntryInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyOutcome {
    pub source: String,
    pub destination: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

/// File operations bound to a shell.
pub struct FileOps<'a, S: Shell + ?Sized> {
    shell: &'a S,
    timeout: Duration,
}

impl<'a, S: Shell + ?Sized> FileOps<'a, S> {
    pub fn new(shell: &'a S, timeout: Duration) -> Self {
        Self { shell, timeout }
    }

    #[instrument(skip_all, fields(path))]
    pub fn write(&self, path: &str, content: &str) -> Result<WriteOutcome> {
        let path = require_path(path)?;
        if self.shell.is_remote() {
            let mut local = NamedTempFile::new().context("create local staging file")?;
            std::io::Write::write_all(&mut local, content.as_bytes())
                .context("write local staging file")?;
            self.install_remote(local.path(), path)?;
        } else {
            write_local_atomic(Path::new(path), content)?;
        }
        debug!(bytes = content.len(), "file written");
        Ok(WriteOutcome {
            path: path.to_string(),
            bytes: content.len(),
            preview: content.chars().take(PREVIEW_CHARS).collect(),
        })
    }

    #[instrument(skip_all, fields(path = %edit.path, action = edit.action.as_str()))]
    pub fn edit(&self, edit: &EditFileAction) -> Result<EditOutcome> {
        edit.validate().map_err(|reason| anyhow!(reason))?;
        let path = require_path(&edit.path)?;
        let original = self.read_whole(path)?;
        let (updated, changes) = apply_edit(&original, edit)?;

        if self.shell.is_remote() {
            let mut local = NamedTempFile::new().context("create local staging file")?;
            std::io::Write::write_all(&mut local, updated.as_bytes())
                .context("write local staging file")?;
            self.install_remote(local.path(), path)?;
        } else {
            write_local_atomic(Path::new(path), &updated)?;
        }
        Ok(EditOutcome {
            path: path.to_string(),
            action: edit.action.as_str(),
            changes,
        })
    }

    #[instrument(skip_all, fields(path))]
    pub fn read(
        &self,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<ReadOutcome> {
        let path = require_path(path)?;
        let content = self.read_whole(path)?;
        select_lines(path, &content, start_line, end_line)
    }

    #[instrument(skip_all, fields(path, recursive))]
    pub fn list(&self, path: &str, recursive: bool, pattern: Option<&str>) -> Result<ListOutcome> {
        let path = require_path(path)?;
        let matcher = pattern
            .filter(|p| !p.trim().is_empty())
            .map(glob_to_regex)
            .transpose()?;

        let mut entries = if self.shell.is_remote() {
            self.list_remote(path, recursive)?
        } else {
            list_local(Path::new(path), recursive)?
        };
        if let Some(matcher) = matcher {
            entries.retain(|entry| matcher.is_match(&entry.name));
        }
        entries.sort_by(|a, b| {
            (a.kind != EntryKind::Directory)
                .cmp(&(b.kind != EntryKind::Directory))
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });
        let total = entries.len();
        entries.truncate(MAX_LIST_ENTRIES);
        Ok(ListOutcome {
            path: path.to_string(),
            recursive,
            total,
            truncated: total > MAX_LIST_ENTRIES,
            entries,
        })
    }

    #[instrument(skip_all, fields(source, destination, overwrite))]
    pub fn copy(&self, source: &str, destination: &str, overwrite: bool) -> Result<CopyOutcome> {
        let source = require_path(source)?;
        let destination = require_path(destination)?;
        let kind = if self.shell.is_remote() {
            let kind = self.remote_kind(source)?;
            if !overwrite && self.remote_kind(destination).is_ok() {
                bail!("destination {destination} already exists (set overwrite to replace it)");
            }
            let mut command = String::new();
            if let Some(parent) = parent_of(destination) {
                command.push_str(&format!("mkdir -p {} && ", shell_quote(parent)));
            }
            if overwrite {
                command.push_str(&format!("rm -rf {} && ", shell_quote(destination)));
            }
            command.push_str(&format!(
                "cp -rp {} {}",
                shell_quote(source),
                shell_quote(destination)
            ));
            self.check(&command, "copy")?;
            kind
        } else {
            let source_path = Path::new(source);
            let destination_path = Path::new(destination);
            let kind = local_kind(source_path)?;
            if destination_path.exists() {
                if !overwrite {
                    bail!("destination {destination} already exists (set overwrite to replace it)");
                }
                remove_local(destination_path)?;
            }
            if let Some(parent) = destination_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            copy_local(source_path, destination_path)?;
            kind
        };
        Ok(CopyOutcome {
            source: source.to_string(),
            destination: destination.to_string(),
            kind,
        })
    }

    #[instrument(skip_all, fields(path, backup))]
    pub fn delete(&self, path: &str, backup: bool) -> Result<DeleteOutcome> {
        let path = require_path(path)?;
        let backup_path = backup.then(|| backup_path_for(path));
        let kind = if self.shell.is_remote() {
            let kind = self.remote_kind(path)?;
            if let Some(backup_path) = &backup_path {
                self.check(
                    &format!("cp -rp {} {}", shell_quote(path), shell_quote(backup_path)),
                    "backup",
                )?;
            }
            self.check(&format!("rm -rf {}", shell_quote(path)), "delete")?;
            kind
        } else {
            let local = Path::new(path);
            let kind = local_kind(local)?;
            if let Some(backup_path) = &backup_path {
                copy_local(local, Path::new(backup_path))
                    .with_context(|| format!("back up {path}"))?;
            }
            remove_local(local)?;
            kind
        };
        Ok(DeleteOutcome {
            path: path.to_string(),
            kind,
            backup_path,
        })
    }

    fn read_whole(&self, path: &str) -> Result<String> {
        if self.shell.is_remote() {
            let local = NamedTempFile::new().context("create local staging file")?;
            self.shell.download(path, local.path())?;
            fs::read_to_string(local.path()).with_context(|| format!("read {path} (not UTF-8 text?)"))
        } else {
            fs::read_to_string(path).with_context(|| format!("read {path}"))
        }
    }

    /// Uploads `local` to a remote staging path, then moves it over `path`.
    fn install_remote(&self, local: &Path, path: &str) -> Result<()> {
        let staging_name = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent-upload".to_string());
        let staging = format!("{REMOTE_TMP_DIR}/.agent-{staging_name}");

        let mut command = String::new();
        if let Some(parent) = parent_of(path) {
            command.push_str(&format!("mkdir -p {} && ", shell_quote(parent)));
        }
        command.push_str(&format!("mv -f {} {}", shell_quote(&staging), shell_quote(path)));
        let installed = self
            .shell
            .upload(local, &staging)
            .and_then(|()| self.check(&command, "move into place").map(|_| ()));
        if installed.is_err() {
            // a failed transfer can still leave a partial staging file
            self.remove_staging(&staging);
        }
        installed
    }

    fn remove_staging(&self, staging: &str) {
        if let Err(err) = self.run(&format!("rm -f {}", shell_quote(staging))) {
            warn!(staging, error = %format!("{err:#}"), "could not remove staging file");
        }
    }

    fn list_remote(&self, path: &str, recursive: bool) -> Result<Vec<DirEntryInfo>> {
        self.remote_kind(path)?;
        let depth = if recursive { "" } else { " -maxdepth 1" };
        let listing = self.check(
            &format!(
                "find {} -mindepth 1{depth} -printf '%y\\t%s\\t%m\\t%P\\n'",
                shell_quote(path)
            ),
            "list directory",
        )?;
        Ok(listing.lines().filter_map(parse_find_line).collect())
    }

    fn remote_kind(&self, path: &str) -> Result<EntryKind> {
        let quoted = shell_quote(path);
        let kind = self.run(&format!(
            "if [ -L {quoted} ]; then echo symlink; elif [ -d {quoted} ]; then echo directory; elif [ -e {quoted} ]; then echo file; else echo missing; fi"
        ))?;
        match kind.output.trim() {
            "symlink" => Ok(EntryKind::Symlink),
            "directory" => Ok(EntryKind::Directory),
            "file" => Ok(EntryKind::File),
            _ => bail!("{path} does not exist"),
        }
    }

    fn run(&self, command: &str) -> Result<ShellOutput> {
        self.shell.exec(command, self.timeout)
    }

    fn check(&self, command: &str, what: &str) -> Result<String> {
        let out = self.run(command)?;
        if !out.success() {
            bail!(
                "{what} failed with exit code {}: {}",
                out.exit_code,
                out.output.trim()
            );
        }
        Ok(out.output)
    }
}

fn require_path(path: &str) -> Result<&str> {
    let path = path.trim();
    if path.is_empty() {
        bail!("path must not be empty");
    }
    Ok(path)
}

fn parent_of(path: &str) -> Option<&str> {
    Path::new(path)
        .parent()
        .and_then(Path::to_str)
        .filter(|p| !p.is_empty() && *p != "/")
}

fn backup_path_for(path: &str) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("{}.backup_{stamp}", path.trim_end_matches('/'))
}

fn write_local_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(&parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    std::io::Write::write_all(&mut tmp, content.as_bytes())
        .with_context(|| format!("write temp file for {}", path.display()))?;
    // temp files are created 0600; keep the replaced file's mode instead
    let permissions = match fs::metadata(path) {
        Ok(meta) => Some(meta.permissions()),
        Err(_) => default_file_permissions(),
    };
    if let Some(permissions) = permissions {
        tmp.as_file()
            .set_permissions(permissions)
            .with_context(|| format!("set permissions for {}", path.display()))?;
    }
    tmp.persist(path)
        .map_err(|err| anyhow!(err.error))
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn local_kind(path: &Path) -> Result<EntryKind> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("{} does not exist", path.display()))?;
    Ok(kind_of(&meta.file_type()))
}

fn kind_of(file_type: &fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

fn remove_local(path: &Path) -> Result<()> {
    if local_kind(path)? == EntryKind::Directory {
        fs::remove_dir_all(path).with_context(|| format!("remove directory {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))
    }
}

fn copy_local(source: &Path, destination: &Path) -> Result<()> {
    if local_kind(source)? != EntryKind::Directory {
        fs::copy(source, destination).with_context(|| {
            format!("copy {} to {}", source.display(), destination.display())
        })?;
        return Ok(());
    }
    fs::create_dir_all(destination)
        .with_context(|| format!("create directory {}", destination.display()))?;
    for entry in fs::read_dir(source).with_context(|| format!("read {}", source.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", source.display()))?;
        copy_local(&entry.path(), &destination.join(entry.file_name()))?;
    }
    Ok(())
}

fn list_local(root: &Path, recursive: bool) -> Result<Vec<DirEntryInfo>> {
    if local_kind(root)? != EntryKind::Directory {
        bail!("{} is not a directory", root.display());
    }
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let meta = entry
                .metadata()
                .or_else(|_| fs::symlink_metadata(entry.path()))
                .with_context(|| format!("stat {}", entry.path().display()))?;
            let kind = kind_of(&entry.file_type().unwrap_or_else(|_| meta.file_type()));
            let relative = entry
                .path()
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| entry.file_name().to_string_lossy().into_owned());
            if recursive && kind == EntryKind::Directory {
                pending.push(entry.path());
            }
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                relative_path: relative,
                kind,
                size: meta.len(),
                permissions: permissions_of(&meta),
            });
        }
    }
    Ok(entries)
}

#[cfg(unix)]
fn permissions_of(meta: &fs::Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(format!("{:o}", meta.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn permissions_of(_meta: &fs::Metadata) -> Option<String> {
    None
}

#[cfg(unix)]
fn default_file_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_file_permissions() -> Option<fs::Permissions> {
    None
}

/// Parses one `find -printf '%y\t%s\t%m\t%P\n'` line.
fn parse_find_line(line: &str) -> Option<DirEntryInfo> {
    let mut parts = line.splitn(4, '\t');
    let kind = match parts.next()? {
        "d" => EntryKind::Directory,
        "f" => EntryKind::File,
        "l" => EntryKind::Symlink,
        _ => EntryKind::Other,
    };
    let size = parts.next()?.parse().unwrap_or(0);
    let permissions = parts.next().map(str::to_string);
    let relative_path = parts.next()?.to_string();
    if relative_path.is_empty() {
        return None;
    }
    let name = relative_path
        .rsplit('/')
        .next()
        .unwrap_or(&relative_path)
        .to_string();
    Some(DirEntryInfo {
        name,
        relative_path,
        kind,
        size,
        permissions,
    })
}

/// Translates a shell glob (`*`, `?`, `[...]`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    let mut in_class = false;
    for ch in pattern.trim().chars() {
        match ch {
            '*' if !in_class => re.push_str(".*"),
            '?' if !in_class => re.push('.'),
            '[' if !in_class => {
                in_class = true;
                re.push('[');
            }
            ']' if in_class => {
                in_class = false;
                re.push(']');
            }
            '!' if in_class && re.ends_with('[') => re.push('^'),
            c if in_class => re.push(c),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).with_context(|| format!("invalid pattern '{pattern}'"))
}

/// Applies an edit to `content`, returning the new text and the number of
/// changes made. Lines match when they contain the trimmed search text.
pub fn apply_edit(content: &str, edit: &EditFileAction) -> Result<(String, usize)> {
    edit.validate().map_err(|reason| anyhow!(reason))?;
    if edit.action == EditKind::Replace {
        let replacement = edit.replace.as_deref().unwrap_or_default();
        let count = content.matches(edit.search.as_str()).count();
        if count == 0 {
            bail!("search text not found in {}", edit.path);
        }
        return Ok((content.replace(edit.search.as_str(), replacement), count));
    }

    let needle = edit.search.trim();
    let trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = Vec::new();
    let mut changes = 0;
    for line in content.lines() {
        let hit = line.contains(needle);
        match edit.action {
            EditKind::InsertBefore if hit => {
                lines.extend(edit.line.iter().flat_map(|l| l.lines()).map(str::to_string));
                lines.push(line.to_string());
            }
            EditKind::InsertAfter if hit => {
                lines.push(line.to_string());
                lines.extend(edit.line.iter().flat_map(|l| l.lines()).map(str::to_string));
            }
            EditKind::DeleteLine if hit => {}
            _ => {
                lines.push(line.to_string());
                continue;
            }
        }
        changes += 1;
    }
    if changes == 0 {
        bail!("no line in {} contains '{needle}'", edit.path);
    }
    let mut updated = lines.join("\n");
    if trailing_newline && !updated.is_empty() {
        updated.push('\n');
    }
    Ok((updated, changes))
}

fn select_lines(
    path: &str,
    content: &str,
    start_line: Option<usize>,
    end_line: Option<usize>,
) -> Result<ReadOutcome> {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let start = start_line.unwrap_or(1).max(1);
    let end = end_line.unwrap_or(total).min(total);
    if start_line.is_some() && start > total.max(1) {
        bail!("start_line {start} is past the end of {path} ({total} lines)");
    }
    if end_line.is_some() && end < start {
        bail!("end_line {end} is before start_line {start}");
    }
    let selected = if total == 0 || end < start {
        Vec::new()
    } else {
        lines[start - 1..end].to_vec()
    };
    Ok(ReadOutcome {
        path: path.to_string(),
        content: selected.join("\n"),
        start_line: start,
        end_line: end.max(start.saturating_sub(1)),
        lines_read: selected.len(),
        total_lines: total,
    })
}
