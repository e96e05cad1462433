// Selective content merge
//
// Merges a generated SYSTEM content tree into a mounted SYSTEM image. Each
// top-level source entry is governed by a rule chosen by the merge policy;
// destination entries that no rule names are never touched.
//
// Every install is all-or-nothing at the entry level: the source is copied
// to a staging sibling first and only renamed into place once the copy has
// fully succeeded.

use crate::{RecoveryError, RecoveryResult};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// General content directory, merged one level deep
pub const GENERAL_CONTENT: &str = "Contents";
/// Registered content, always replaced wholesale
pub const REGISTERED_CONTENT: &str = "registered";
/// System save data
pub const SAVE_DATA: &str = "save";

const STAGING_SUFFIX: &str = ".nandfix-partial";

/// What happens to one entry of the source tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeRule {
    /// Delete the destination entry, then copy the source entry in full
    ReplaceWhole,
    /// Recurse one level: children follow the policy's child rule
    MergeSubtreePreserveUnknown,
    /// Copy only if the destination has no entry of that name
    AddIfAbsent,
    /// Leave the destination alone
    Skip,
}

/// Per-level merge behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// In-place restore: existing save data survives
    PreserveUserData,
    /// Rebuild into a donor image: save data is replaced
    Rebuild,
    /// Total reconstruction: only registered content and save data are touched
    ReplaceOnly,
}

fn named(name: &OsStr, expected: &str) -> bool {
    name.to_str()
        .map(|n| n.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

impl MergePolicy {
    pub fn rule_for(&self, name: &OsStr) -> MergeRule {
        if named(name, GENERAL_CONTENT) {
            return MergeRule::MergeSubtreePreserveUnknown;
        }
        if named(name, SAVE_DATA) {
            return match self {
                MergePolicy::PreserveUserData => MergeRule::AddIfAbsent,
                MergePolicy::Rebuild | MergePolicy::ReplaceOnly => MergeRule::ReplaceWhole,
            };
        }
        match self {
            MergePolicy::ReplaceOnly => MergeRule::Skip,
            _ => MergeRule::AddIfAbsent,
        }
    }

    /// Rule for an immediate child of the general content directory
    pub fn child_rule(&self, name: &OsStr) -> MergeRule {
        if named(name, REGISTERED_CONTENT) {
            return MergeRule::ReplaceWhole;
        }
        match self {
            MergePolicy::ReplaceOnly => MergeRule::Skip,
            _ => MergeRule::AddIfAbsent,
        }
    }
}

/// What a merge did, by destination path
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub replaced: Vec<PathBuf>,
    pub added: Vec<PathBuf>,
    pub preserved: Vec<PathBuf>,
}

impl MergeSummary {
    pub fn touched(&self) -> usize {
        self.replaced.len() + self.added.len()
    }
}

pub struct ContentMerger {
    policy: MergePolicy,
}

impl ContentMerger {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    /// Merge `source` into `dest` under this merger's policy
    pub fn merge(&self, source: &Path, dest: &Path) -> RecoveryResult<MergeSummary> {
        tracing::info!(
            source = %source.display(),
            dest = %dest.display(),
            policy = ?self.policy,
            "Merging system content"
        );

        let mut summary = MergeSummary::default();
        for entry in sorted_entries(source)? {
            let name = entry.file_name().unwrap_or_default().to_os_string();
            let target = dest.join(&name);

            match self.policy.rule_for(&name) {
                MergeRule::ReplaceWhole => {
                    install(&entry, &target, true)?;
                    summary.replaced.push(target);
                }
                MergeRule::AddIfAbsent => self.add_if_absent(&entry, target, &mut summary)?,
                MergeRule::MergeSubtreePreserveUnknown => {
                    if !target.exists()
                        && entry.is_dir()
                        && self.policy == MergePolicy::ReplaceOnly
                    {
                        // Only the governed children may land in the image
                        fs::create_dir_all(&target).map_err(|source| {
                            RecoveryError::MergeFailed {
                                path: target.clone(),
                                source,
                            }
                        })?;
                        self.merge_children(&entry, &target, &mut summary)?;
                    } else if !target.exists() {
                        install(&entry, &target, false)?;
                        summary.added.push(target);
                    } else if !entry.is_dir() || !target.is_dir() {
                        install(&entry, &target, true)?;
                        summary.replaced.push(target);
                    } else {
                        self.merge_children(&entry, &target, &mut summary)?;
                    }
                }
                MergeRule::Skip => {
                    tracing::debug!(entry = %name.to_string_lossy(), "Not governed by this policy");
                }
            }
        }

        tracing::info!(
            replaced = summary.replaced.len(),
            added = summary.added.len(),
            preserved = summary.preserved.len(),
            "Content merge complete"
        );
        Ok(summary)
    }

    fn merge_children(
        &self,
        source: &Path,
        dest: &Path,
        summary: &mut MergeSummary,
    ) -> RecoveryResult<()> {
        for child in sorted_entries(source)? {
            let name = child.file_name().unwrap_or_default().to_os_string();
            let target = dest.join(&name);

            match self.policy.child_rule(&name) {
                MergeRule::ReplaceWhole => {
                    install(&child, &target, true)?;
                    tracing::info!(
                        path = %target.display(),
                        items = count_children(&target),
                        "Replaced registered content"
                    );
                    summary.replaced.push(target);
                }
                MergeRule::AddIfAbsent | MergeRule::MergeSubtreePreserveUnknown => {
                    self.add_if_absent(&child, target, summary)?
                }
                MergeRule::Skip => {}
            }
        }
        Ok(())
    }

    fn add_if_absent(
        &self,
        source: &Path,
        target: PathBuf,
        summary: &mut MergeSummary,
    ) -> RecoveryResult<()> {
        if exists_no_follow(&target) {
            summary.preserved.push(target);
        } else {
            install(source, &target, false)?;
            summary.added.push(target);
        }
        Ok(())
    }
}

fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn sorted_entries(dir: &Path) -> RecoveryResult<Vec<PathBuf>> {
    let read = fs::read_dir(dir).map_err(|source| RecoveryError::MergeFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.map_err(|source| RecoveryError::MergeFailed {
            path: dir.to_path_buf(),
            source,
        })?;
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

fn count_children(dir: &Path) -> usize {
    fs::read_dir(dir).map(|r| r.count()).unwrap_or(0)
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target.file_name().unwrap_or_default().to_string_lossy();
    target.with_file_name(format!(".{}{}", name, STAGING_SUFFIX))
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy `source` to `target` as a unit, replacing any existing entry when
/// `replace` is set
fn install(source: &Path, target: &Path, replace: bool) -> RecoveryResult<()> {
    let staging = staging_path(target);
    if exists_no_follow(&staging) {
        let _ = remove_entry(&staging);
    }

    if let Err((path, source_err)) = copy_tree(source, &staging) {
        if let Err(e) = remove_entry(&staging) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %staging.display(), error = %e, "Failed to remove partial copy");
            }
        }
        return Err(RecoveryError::MergeFailed {
            path,
            source: source_err,
        });
    }

    let commit = || -> io::Result<()> {
        if replace && exists_no_follow(target) {
            remove_entry(target)?;
        }
        fs::rename(&staging, target)
    };
    commit().map_err(|source| RecoveryError::MergeFailed {
        path: target.to_path_buf(),
        source,
    })
}

/// Recursive copy; on failure reports the path that could not be copied
fn copy_tree(source: &Path, dest: &Path) -> Result<(), (PathBuf, io::Error)> {
    let meta = fs::metadata(source).map_err(|e| (source.to_path_buf(), e))?;

    if meta.is_dir() {
        fs::create_dir(dest).map_err(|e| (dest.to_path_buf(), e))?;
        let entries = fs::read_dir(source).map_err(|e| (source.to_path_buf(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| (source.to_path_buf(), e))?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, dest).map_err(|e| (source.to_path_buf(), e))?;
    }
    Ok(())
}
