//! Plain-text mirror tree
//!
//! Two category values are duplicated outside the database so that callers
//! without query access can read them:
//!
//! ```text
//! <settings_dir>/<app_id>/systemLogsSetting      "0" | "1" | "2"
//! <settings_dir>/<app_id>/ipTableProtectSetting  "0" | "1" | "2"
//! ```
//!
//! Mirror changes happen before the database commit. Every mutating call
//! returns a `MirrorUndo` holding the previous contents; the store restores it
//! if the commit fails, so both sides succeed or fail together.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::platform_durability::{sync_dir, write_durable};
use crate::record::{Category, PolicyValue, SettingRecord};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Previous mirror state, restorable after a failed commit.
#[derive(Debug, Default)]
#[must_use = "a failed commit needs the undo log"]
pub struct MirrorUndo {
    /// (file, previous contents or None if it did not exist)
    files: Vec<(PathBuf, Option<Vec<u8>>)>,
    /// Directories created by the change, deepest last
    created_dirs: Vec<PathBuf>,
}

impl MirrorUndo {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.created_dirs.is_empty()
    }

    fn absorb(&mut self, other: MirrorUndo) {
        self.files.extend(other.files);
        self.created_dirs.extend(other.created_dirs);
    }

    /// Put every touched file back the way it was. Best effort: failures are
    /// logged and the remaining entries are still restored.
    pub fn restore(self) {
        for (path, previous) in self.files.into_iter().rev() {
            let result = match previous {
                Some(bytes) => {
                    if let Some(parent) = path.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    write_durable(&path, &bytes, FILE_MODE)
                }
                None => match fs::remove_file(&path) {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "could not restore mirror file");
            }
        }
        for dir in self.created_dirs.into_iter().rev() {
            // Only succeeds when empty, which is what we want
            let _ = fs::remove_dir(&dir);
        }
    }
}

/// Root of the mirror tree.
#[derive(Debug, Clone)]
pub struct MirrorTree {
    root: PathBuf,
}

impl MirrorTree {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if missing.
    pub fn ensure_root(&self) -> StoreResult<()> {
        create_dir(&self.root)?;
        Ok(())
    }

    pub fn app_dir(&self, app_id: &str) -> StoreResult<PathBuf> {
        validate_app_id(app_id)?;
        Ok(self.root.join(app_id))
    }

    pub fn file_path(&self, app_id: &str, category: Category) -> StoreResult<PathBuf> {
        Ok(self.app_dir(app_id)?.join(category.column()))
    }

    /// Mirrored value for one application, if the file exists and parses.
    pub fn read(&self, app_id: &str, category: Category) -> StoreResult<Option<PolicyValue>> {
        let path = self.file_path(app_id, category)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text.trim().parse::<i64>().ok().and_then(PolicyValue::from_i64)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Write the mirrored categories of `record`.
    pub fn write(&self, record: &SettingRecord) -> StoreResult<MirrorUndo> {
        let dir = self.app_dir(&record.app_id)?;
        let mut undo = MirrorUndo::default();
        if create_dir(&self.root)? {
            undo.created_dirs.push(self.root.clone());
        }
        if create_dir(&dir)? {
            undo.created_dirs.push(dir.clone());
        }

        for category in Category::MIRRORED {
            let path = dir.join(category.column());
            let previous = read_previous(&path)?;
            undo.files.push((path.clone(), previous));
            let text = record.get(category).as_i64().to_string();
            if let Err(e) = write_durable(&path, text.as_bytes(), FILE_MODE) {
                let err = StoreError::io(&path, e);
                undo.restore();
                return Err(err);
            }
        }
        debug!(app_id = %record.app_id, "wrote mirror files");
        Ok(undo)
    }

    /// Remove the mirror files of one application, and its directory if that
    /// leaves it empty.
    pub fn remove(&self, app_id: &str) -> StoreResult<MirrorUndo> {
        let dir = self.app_dir(app_id)?;
        let mut undo = MirrorUndo::default();
        for category in Category::MIRRORED {
            let path = dir.join(category.column());
            let Some(previous) = read_previous(&path)? else { continue };
            if let Err(e) = fs::remove_file(&path) {
                let err = StoreError::io(&path, e);
                undo.restore();
                return Err(err);
            }
            undo.files.push((path, Some(previous)));
        }
        remove_dir_if_empty(&dir);
        Ok(undo)
    }

    /// Remove the mirror directory of every application not in `keep`.
    /// Returns the removed application ids.
    pub fn purge_except(&self, keep: &HashSet<String>) -> StoreResult<(Vec<String>, MirrorUndo)> {
        let mut removed = Vec::new();
        let mut undo = MirrorUndo::default();
        for app_id in self.app_dirs()? {
            if keep.contains(&app_id) {
                continue;
            }
            let dir = self.root.join(&app_id);
            match snapshot_tree(&dir) {
                Ok(snapshot) => undo.files.extend(snapshot),
                Err(e) => {
                    undo.restore();
                    return Err(StoreError::io(&dir, e));
                }
            }
            if let Err(e) = fs::remove_dir_all(&dir) {
                undo.restore();
                return Err(StoreError::io(&dir, e));
            }
            removed.push(app_id);
        }
        if !removed.is_empty() {
            let _ = sync_dir(&self.root);
        }
        Ok((removed, undo))
    }

    /// Delete the whole tree, root included.
    pub fn remove_all(&self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.root, e)),
        }
    }

    /// Move `<app>/<uid>/<file>` up to `<app>/<file>` and drop the uid level.
    /// Of several files in one uid directory, the first by name wins.
    pub fn flatten_legacy(&self) -> StoreResult<MirrorUndo> {
        let mut undo = MirrorUndo::default();
        for app_id in self.app_dirs()? {
            let app_dir = self.root.join(&app_id);
            for uid_dir in sorted_entries(&app_dir)? {
                if !uid_dir.is_dir() {
                    continue;
                }
                match flatten_one(&app_dir, &uid_dir) {
                    Ok(step) => undo.absorb(step),
                    Err(e) => {
                        undo.restore();
                        return Err(StoreError::io(&uid_dir, e));
                    }
                }
            }
        }
        Ok(undo)
    }

    /// Names of the per-application directories.
    pub fn app_dirs(&self) -> StoreResult<Vec<String>> {
        let entries = match sorted_entries(&self.root) {
            Ok(entries) => entries,
            Err(StoreError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };
        Ok(entries
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_owned))
            .collect())
    }
}

/// App ids become directory names; refuse anything that would escape the root.
fn validate_app_id(app_id: &str) -> StoreResult<()> {
    if app_id.is_empty()
        || app_id == "."
        || app_id == ".."
        || app_id.contains('/')
        || app_id.contains('\\')
        || app_id.contains('\0')
    {
        return Err(StoreError::InvalidRecord(format!("unusable application id {app_id:?}")));
    }
    Ok(())
}

/// Returns true if the directory was created by this call.
fn create_dir(dir: &Path) -> StoreResult<bool> {
    if dir.is_dir() {
        return Ok(false);
    }
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))
            .map_err(|e| StoreError::io(dir, e))?;
    }
    Ok(true)
}

fn read_previous(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn remove_dir_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir).map(|mut it| it.next().is_none()).unwrap_or(false);
    if empty {
        if let Err(e) = fs::remove_dir(dir) {
            warn!(path = %dir.display(), error = %e, "could not remove mirror directory");
        }
    }
}

fn sorted_entries(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        entries.push(entry.map_err(|e| StoreError::io(dir, e))?.path());
    }
    entries.sort();
    Ok(entries)
}

/// Every regular file below `dir` with its contents.
fn snapshot_tree(dir: &Path) -> io::Result<Vec<(PathBuf, Option<Vec<u8>>)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(snapshot_tree(&path)?);
        } else {
            let bytes = fs::read(&path)?;
            files.push((path, Some(bytes)));
        }
    }
    Ok(files)
}

fn flatten_one(app_dir: &Path, uid_dir: &Path) -> io::Result<MirrorUndo> {
    let mut undo = MirrorUndo::default();
    let mut files: Vec<PathBuf> = fs::read_dir(uid_dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    files.sort();

    let mut moved = false;
    if let Some(first) = files.iter().find(|p| p.is_file()) {
        if let Some(name) = first.file_name() {
            let target = app_dir.join(name);
            let previous = match fs::read(&target) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            let bytes = fs::read(first)?;
            undo.files.push((first.clone(), Some(bytes.clone())));
            undo.files.push((target.clone(), previous));
            write_durable(&target, &bytes, FILE_MODE)?;
            moved = true;
        }
    }
    if moved {
        for path in files.iter().filter(|p| p.is_file()) {
            if !undo.files.iter().any(|(p, _)| p == path) {
                undo.files.push((path.clone(), Some(fs::read(path)?)));
            }
        }
        fs::remove_dir_all(uid_dir)?;
        sync_dir(app_dir)?;
    }
    Ok(undo)
}
