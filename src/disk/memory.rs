//! A tiny, in-memory [`Disk`] backend.
//!
//! Backs the integration suite and the IPC$ pseudo-share. Files live in a
//! path-keyed map guarded by one `RwLock`; lookups are case-insensitive the
//! way SMB clients expect, while the stored name keeps its original case.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    CreateAction, CreateDisposition, CreateOptions, Disk, DiskDriver, DiskGeometry, Error,
    FileAttributes, FileInfo, Fh, OpenOutcome, Result, SetInfo,
};

#[derive(Clone)]
struct Node {
    /// Display name of the final component.
    name: String,
    attributes: FileAttributes,
    data: Vec<u8>,
    allocation: u64,
    created: SystemTime,
    accessed: SystemTime,
    written: SystemTime,
    file_id: u64,
}

impl Node {
    fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            attributes: self.attributes,
            size: self.data.len() as u64,
            allocation: self.allocation.max(self.data.len() as u64),
            created: self.created,
            accessed: self.accessed,
            written: self.written,
            changed: self.written,
            file_id: self.file_id,
        }
    }

    fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }
}

struct State {
    /// Case-folded path -> node. The root directory is the empty key.
    nodes: BTreeMap<String, Node>,
    handles: HashMap<u64, String>,
}

/// In-memory disk context.
pub struct MemoryDisk {
    state: RwLock<State>,
    next_handle: AtomicU64,
    next_file_id: AtomicU64,
}

impl Default for MemoryDisk {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node {
                name: String::new(),
                attributes: FileAttributes::DIRECTORY,
                data: Vec::new(),
                allocation: 0,
                created: SystemTime::now(),
                accessed: SystemTime::now(),
                written: SystemTime::now(),
                file_id: 1,
            },
        );
        MemoryDisk {
            state: RwLock::new(State { nodes, handles: HashMap::new() }),
            next_handle: AtomicU64::new(1),
            next_file_id: AtomicU64::new(2),
        }
    }
}

fn fold(path: &str) -> String {
    path.trim_matches('\\').to_ascii_uppercase()
}

fn parent_of(key: &str) -> &str {
    match key.rfind('\\') {
        Some(at) => &key[..at],
        None => "",
    }
}

fn leaf_of(path: &str) -> &str {
    let trimmed = path.trim_matches('\\');
    match trimmed.rfind('\\') {
        Some(at) => &trimmed[at + 1..],
        None => trimmed,
    }
}

impl MemoryDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a file with the given contents, making parent directories on
    /// the way. Fixture helper for tests and demo setups.
    pub async fn seed_file(&self, path: &str, data: &[u8]) {
        let key = fold(path);
        let mut state = self.state.write().await;
        self.ensure_parents(&mut state, &key);
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        state.nodes.insert(
            key,
            Node {
                name: leaf_of(path).to_string(),
                attributes: FileAttributes::ARCHIVE,
                data: data.to_vec(),
                allocation: data.len() as u64,
                created: SystemTime::now(),
                accessed: SystemTime::now(),
                written: SystemTime::now(),
                file_id,
            },
        );
    }

    /// Creates a directory, making parents on the way.
    pub async fn seed_directory(&self, path: &str) {
        let key = fold(path);
        let mut state = self.state.write().await;
        self.ensure_parents(&mut state, &key);
        self.insert_directory(&mut state, &key, leaf_of(path));
    }

    fn ensure_parents(&self, state: &mut State, key: &str) {
        let mut at = 0;
        while let Some(sep) = key[at..].find('\\') {
            let prefix = &key[..at + sep];
            if !state.nodes.contains_key(prefix) {
                self.insert_directory(state, prefix, leaf_of(prefix));
            }
            at += sep + 1;
        }
    }

    fn insert_directory(&self, state: &mut State, key: &str, name: &str) {
        if state.nodes.contains_key(key) {
            return;
        }
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        state.nodes.insert(
            key.to_string(),
            Node {
                name: name.to_string(),
                attributes: FileAttributes::DIRECTORY,
                data: Vec::new(),
                allocation: 0,
                created: SystemTime::now(),
                accessed: SystemTime::now(),
                written: SystemTime::now(),
                file_id,
            },
        );
    }

    fn check_parent(state: &State, key: &str) -> Result<()> {
        let parent = parent_of(key);
        match state.nodes.get(parent) {
            Some(node) if node.is_directory() => Ok(()),
            Some(_) => Err(Error::PathNotFound),
            None => Err(Error::PathNotFound),
        }
    }

    fn handle_key(state: &State, handle: Fh) -> Result<String> {
        state.handles.get(&handle.0).cloned().ok_or(Error::BadHandle)
    }
}

#[async_trait]
impl Disk for MemoryDisk {
    async fn open(
        &self,
        path: &str,
        disposition: CreateDisposition,
        options: CreateOptions,
        attributes: FileAttributes,
    ) -> Result<OpenOutcome> {
        let key = fold(path);
        let mut state = self.state.write().await;
        let exists = state.nodes.contains_key(&key);
        if !exists {
            Self::check_parent(&state, &key)?;
        }

        let want_directory = options.contains(CreateOptions::DIRECTORY_FILE);
        let action = match (disposition, exists) {
            (CreateDisposition::Create, true) => return Err(Error::Exists),
            (CreateDisposition::Open, false) | (CreateDisposition::Overwrite, false) => {
                return Err(Error::NotFound)
            }
            (CreateDisposition::Open, true) | (CreateDisposition::OpenIf, true) => {
                CreateAction::Opened
            }
            (CreateDisposition::Overwrite, true) | (CreateDisposition::OverwriteIf, true) => {
                CreateAction::Overwritten
            }
            (CreateDisposition::Supersede, true) => CreateAction::Superseded,
            _ => CreateAction::Created,
        };

        match action {
            CreateAction::Created => {
                let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                let node_attrs = if want_directory {
                    FileAttributes::DIRECTORY
                } else {
                    let stored = attributes
                        & (FileAttributes::READONLY
                            | FileAttributes::HIDDEN
                            | FileAttributes::SYSTEM);
                    stored | FileAttributes::ARCHIVE
                };
                state.nodes.insert(
                    key.clone(),
                    Node {
                        name: leaf_of(path).to_string(),
                        attributes: node_attrs,
                        data: Vec::new(),
                        allocation: 0,
                        created: SystemTime::now(),
                        accessed: SystemTime::now(),
                        written: SystemTime::now(),
                        file_id,
                    },
                );
            }
            CreateAction::Overwritten | CreateAction::Superseded => {
                let node = state.nodes.get_mut(&key).ok_or(Error::NotFound)?;
                if node.is_directory() {
                    return Err(Error::IsDirectory);
                }
                node.data.clear();
                node.allocation = 0;
                node.written = SystemTime::now();
                if action == CreateAction::Superseded {
                    node.attributes = attributes | FileAttributes::ARCHIVE;
                    node.created = SystemTime::now();
                }
            }
            CreateAction::Opened => {
                let node = state.nodes.get(&key).ok_or(Error::NotFound)?;
                if want_directory && !node.is_directory() {
                    return Err(Error::NotDirectory);
                }
                if options.contains(CreateOptions::NON_DIRECTORY_FILE) && node.is_directory() {
                    return Err(Error::IsDirectory);
                }
            }
        }

        let info = state.nodes[&key].info();
        let handle = Fh(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.handles.insert(handle.0, key);
        Ok(OpenOutcome { handle, info, action })
    }

    async fn read(&self, handle: Fh, offset: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let key = Self::handle_key(&state, handle)?;
        let node = state.nodes.get(&key).ok_or(Error::NotFound)?;
        if node.is_directory() {
            return Err(Error::IsDirectory);
        }
        let start = (offset as usize).min(node.data.len());
        let end = start.saturating_add(len).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    async fn write(
        &self,
        handle: Fh,
        offset: u64,
        data: &[u8],
        _write_through: bool,
    ) -> Result<usize> {
        let mut state = self.state.write().await;
        let key = Self::handle_key(&state, handle)?;
        let node = state.nodes.get_mut(&key).ok_or(Error::NotFound)?;
        if node.is_directory() {
            return Err(Error::IsDirectory);
        }
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.written = SystemTime::now();
        Ok(data.len())
    }

    async fn flush(&self, handle: Fh) -> Result<()> {
        let state = self.state.read().await;
        Self::handle_key(&state, handle).map(|_| ())
    }

    async fn query_handle(&self, handle: Fh) -> Result<FileInfo> {
        let state = self.state.read().await;
        let key = Self::handle_key(&state, handle)?;
        state.nodes.get(&key).map(Node::info).ok_or(Error::NotFound)
    }

    async fn query_path(&self, path: &str) -> Result<FileInfo> {
        let state = self.state.read().await;
        state.nodes.get(&fold(path)).map(Node::info).ok_or(Error::NotFound)
    }

    async fn set_info(&self, handle: Fh, info: SetInfo) -> Result<()> {
        let mut state = self.state.write().await;
        let key = Self::handle_key(&state, handle)?;
        let node = state.nodes.get_mut(&key).ok_or(Error::NotFound)?;
        match info {
            SetInfo::Basic { attributes, created, accessed, written } => {
                if let Some(attributes) = attributes {
                    let keep = node.attributes & FileAttributes::DIRECTORY;
                    node.attributes = keep | (attributes & !FileAttributes::DIRECTORY);
                }
                if let Some(created) = created {
                    node.created = created;
                }
                if let Some(accessed) = accessed {
                    node.accessed = accessed;
                }
                if let Some(written) = written {
                    node.written = written;
                }
            }
            SetInfo::AllocationSize(allocation) => {
                node.allocation = allocation;
                if (node.data.len() as u64) > allocation {
                    node.data.truncate(allocation as usize);
                }
            }
            SetInfo::EndOfFile(eof) => {
                node.data.resize(eof as usize, 0);
                node.written = SystemTime::now();
            }
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str, replace: bool) -> Result<()> {
        let from_key = fold(from);
        let to_key = fold(to);
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(&from_key) {
            return Err(Error::NotFound);
        }
        Self::check_parent(&state, &to_key)?;
        if from_key != to_key && state.nodes.contains_key(&to_key) {
            if !replace {
                return Err(Error::Exists);
            }
            state.nodes.remove(&to_key);
        }
        let mut node = state.nodes.remove(&from_key).ok_or(Error::NotFound)?;
        node.name = leaf_of(to).to_string();
        // Children of a renamed directory move with it.
        let descendants: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| k.starts_with(&format!("{from_key}\\")))
            .cloned()
            .collect();
        for old_key in descendants {
            if let Some(child) = state.nodes.remove(&old_key) {
                let new_key = format!("{}{}", to_key, &old_key[from_key.len()..]);
                state.nodes.insert(new_key, child);
            }
        }
        state.nodes.insert(to_key.clone(), node);
        for key in state.handles.values_mut() {
            if *key == from_key {
                *key = to_key.clone();
            }
        }
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let key = fold(path);
        let mut state = self.state.write().await;
        match state.nodes.get(&key) {
            Some(node) if node.is_directory() => Err(Error::IsDirectory),
            Some(_) => {
                state.nodes.remove(&key);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    async fn make_directory(&self, path: &str) -> Result<()> {
        let key = fold(path);
        let mut state = self.state.write().await;
        if state.nodes.contains_key(&key) {
            return Err(Error::Exists);
        }
        Self::check_parent(&state, &key)?;
        self.insert_directory(&mut state, &key, leaf_of(path));
        Ok(())
    }

    async fn remove_directory(&self, path: &str) -> Result<()> {
        let key = fold(path);
        let mut state = self.state.write().await;
        match state.nodes.get(&key) {
            Some(node) if !node.is_directory() => return Err(Error::NotDirectory),
            Some(_) => {}
            None => return Err(Error::NotFound),
        }
        let prefix = format!("{key}\\");
        if state.nodes.keys().any(|k| k.starts_with(&prefix)) {
            return Err(Error::NotEmpty);
        }
        state.nodes.remove(&key);
        Ok(())
    }

    async fn enumerate(&self, dir: &str, pattern: &str) -> Result<Vec<FileInfo>> {
        let dir_key = fold(dir);
        let state = self.state.read().await;
        match state.nodes.get(&dir_key) {
            Some(node) if node.is_directory() => {}
            Some(_) => return Err(Error::NotDirectory),
            None => return Err(Error::NotFound),
        }
        let prefix = if dir_key.is_empty() { String::new() } else { format!("{dir_key}\\") };
        let mut entries = Vec::new();
        for (key, node) in state.nodes.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            if key.is_empty() || key[prefix.len()..].contains('\\') {
                continue;
            }
            if super::wildcard_match(pattern, &node.name) {
                entries.push(node.info());
            }
        }
        entries.sort_by(|a, b| a.name.to_ascii_uppercase().cmp(&b.name.to_ascii_uppercase()));
        Ok(entries)
    }

    async fn close(&self, handle: Fh) -> Result<()> {
        let mut state = self.state.write().await;
        state.handles.remove(&handle.0).map(|_| ()).ok_or(Error::BadHandle)
    }

    fn geometry(&self) -> DiskGeometry {
        DiskGeometry {
            total_units: 65536,
            free_units: 32768,
            sectors_per_unit: 8,
            bytes_per_sector: 512,
        }
    }
}

/// Driver producing one fresh [`MemoryDisk`] per share.
pub struct MemoryDiskDriver;

#[async_trait]
impl DiskDriver for MemoryDiskDriver {
    async fn create_context(
        &self,
        _share_name: &str,
        _params: &toml::Table,
    ) -> Result<std::sync::Arc<dyn Disk>> {
        Ok(std::sync::Arc::new(MemoryDisk::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_open_round_trip() {
        let disk = MemoryDisk::new();
        let created = disk
            .open(
                "docs\\report.txt",
                CreateDisposition::Create,
                CreateOptions::empty(),
                FileAttributes::NORMAL,
            )
            .await;
        // parent directory does not exist yet
        assert_eq!(created.unwrap_err(), Error::PathNotFound);

        disk.seed_directory("docs").await;
        let created = disk
            .open(
                "docs\\report.txt",
                CreateDisposition::Create,
                CreateOptions::empty(),
                FileAttributes::NORMAL,
            )
            .await
            .unwrap();
        assert_eq!(created.action, CreateAction::Created);

        disk.write(created.handle, 0, b"hello", false).await.unwrap();
        let reopened = disk
            .open(
                "DOCS\\REPORT.TXT",
                CreateDisposition::Open,
                CreateOptions::empty(),
                FileAttributes::empty(),
            )
            .await
            .unwrap();
        assert_eq!(reopened.action, CreateAction::Opened);
        assert_eq!(reopened.info.size, 5);
        assert_eq!(disk.read(reopened.handle, 0, 16).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn overwrite_truncates() {
        let disk = MemoryDisk::new();
        disk.seed_file("a.bin", &[1, 2, 3]).await;
        let out = disk
            .open(
                "a.bin",
                CreateDisposition::Overwrite,
                CreateOptions::empty(),
                FileAttributes::empty(),
            )
            .await
            .unwrap();
        assert_eq!(out.action, CreateAction::Overwritten);
        assert_eq!(out.info.size, 0);
    }

    #[tokio::test]
    async fn directory_removal_requires_empty() {
        let disk = MemoryDisk::new();
        disk.seed_file("dir\\inner.txt", b"x").await;
        assert_eq!(disk.remove_directory("dir").await.unwrap_err(), Error::NotEmpty);
        disk.unlink("dir\\inner.txt").await.unwrap();
        disk.remove_directory("dir").await.unwrap();
    }

    #[tokio::test]
    async fn enumerate_filters_and_sorts() {
        let disk = MemoryDisk::new();
        disk.seed_file("b.txt", b"").await;
        disk.seed_file("A.TXT", b"").await;
        disk.seed_file("c.doc", b"").await;
        let entries = disk.enumerate("", "*.txt").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A.TXT", "b.txt"]);
    }

    #[tokio::test]
    async fn rename_moves_children() {
        let disk = MemoryDisk::new();
        disk.seed_file("old\\f.txt", b"data").await;
        disk.rename("old", "new", false).await.unwrap();
        assert!(disk.query_path("new\\f.txt").await.is_ok());
        assert_eq!(disk.query_path("old\\f.txt").await.unwrap_err(), Error::NotFound);
    }
}
