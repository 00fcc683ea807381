//! Scratch storage and workspace properties supplied to editors.
//!
//! A [`WorkspaceMediator`] belongs to exactly one in-flight editor. Editors
//! park incoming delta windows in temporary locations until the file's
//! window stream ends, and hand `svn:wc:*` properties to it instead of
//! treating them as versioned data.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{trace, warn};

use crate::{DiffWindow, PropName, SvnError};

/// Storage collaborator of an editor.
pub trait WorkspaceMediator: Send {
    /// Allocates scratch storage keyed by `id` for data belonging to `path`.
    ///
    /// An existing location with the same id is replaced.
    fn create_temporary_location(
        &mut self,
        path: &str,
        id: &str,
    ) -> Result<Box<dyn Write + Send + '_>, SvnError>;

    /// Reads back what was written to `id`.
    fn temporary_location(&mut self, id: &str) -> Result<Box<dyn Read + Send + '_>, SvnError>;

    /// Number of bytes stored under `id`.
    fn length(&mut self, id: &str) -> Result<u64, SvnError>;

    /// Releases `id`. Releasing an unknown id is a no-op.
    fn delete_temporary_location(&mut self, id: &str) -> Result<(), SvnError>;

    /// Returns a workspace property of `path`.
    fn workspace_property(&self, path: &str, name: &PropName) -> Option<Vec<u8>>;

    /// Sets (`Some`) or removes (`None`) a workspace property of `path`.
    fn set_workspace_property(
        &mut self,
        path: &str,
        name: &PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError>;
}

fn unknown_location(id: &str) -> SvnError {
    SvnError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no temporary location '{id}'"),
    ))
}

type PropKey = (String, String);

#[derive(Debug, Default)]
struct MemoryStore {
    temporary: HashMap<String, Vec<u8>>,
    props: BTreeMap<PropKey, Vec<u8>>,
}

/// A mediator that keeps everything in memory.
///
/// Clones share the same storage, so a caller can keep a handle to inspect
/// what an editor left behind.
#[derive(Clone, Debug, Default)]
pub struct MemoryMediator {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryMediator {
    /// Creates an empty mediator.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of temporary locations currently allocated.
    pub fn temporary_count(&self) -> usize {
        self.lock().temporary.len()
    }

    /// All workspace properties, keyed by `(path, name)`.
    pub fn workspace_properties(&self) -> BTreeMap<PropKey, Vec<u8>> {
        self.lock().props.clone()
    }
}

struct MemoryWriter {
    store: Arc<Mutex<MemoryStore>>,
    id: String,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = store
            .temporary
            .get_mut(&self.id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "temporary location released"))?;
        slot.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WorkspaceMediator for MemoryMediator {
    fn create_temporary_location(
        &mut self,
        path: &str,
        id: &str,
    ) -> Result<Box<dyn Write + Send + '_>, SvnError> {
        trace!(path, id, "allocating temporary location");
        self.lock().temporary.insert(id.to_string(), Vec::new());
        Ok(Box::new(MemoryWriter {
            store: Arc::clone(&self.store),
            id: id.to_string(),
        }))
    }

    fn temporary_location(&mut self, id: &str) -> Result<Box<dyn Read + Send + '_>, SvnError> {
        let data = self
            .lock()
            .temporary
            .get(id)
            .cloned()
            .ok_or_else(|| unknown_location(id))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn length(&mut self, id: &str) -> Result<u64, SvnError> {
        self.lock()
            .temporary
            .get(id)
            .map(|data| data.len() as u64)
            .ok_or_else(|| unknown_location(id))
    }

    fn delete_temporary_location(&mut self, id: &str) -> Result<(), SvnError> {
        self.lock().temporary.remove(id);
        Ok(())
    }

    fn workspace_property(&self, path: &str, name: &PropName) -> Option<Vec<u8>> {
        self.lock()
            .props
            .get(&(path.to_string(), name.as_str().to_string()))
            .cloned()
    }

    fn set_workspace_property(
        &mut self,
        path: &str,
        name: &PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        let key = (path.to_string(), name.as_str().to_string());
        let mut store = self.lock();
        match value {
            Some(value) => {
                store.props.insert(key, value);
            }
            None => {
                store.props.remove(&key);
            }
        }
        Ok(())
    }
}

/// A mediator that keeps temporary locations as files in a directory.
///
/// Workspace properties are held in memory for the lifetime of the value.
#[derive(Debug)]
pub struct FsMediator {
    dir: PathBuf,
    files: HashMap<String, PathBuf>,
    props: BTreeMap<PropKey, Vec<u8>>,
    next_tmp_id: u64,
}

impl FsMediator {
    /// Uses `dir` (created if missing) for temporary files.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SvnError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: HashMap::new(),
            props: BTreeMap::new(),
            next_tmp_id: 0,
        })
    }

    /// Directory holding the temporary files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&mut self, id: &str) -> PathBuf {
        let mut name: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if name.is_empty() {
            name = "tmp".to_string();
        }
        self.next_tmp_id = self.next_tmp_id.wrapping_add(1);
        self.dir
            .join(format!(".svn-ra.{name}.{}.tmp", self.next_tmp_id))
    }

    fn path_of(&self, id: &str) -> Result<&Path, SvnError> {
        self.files
            .get(id)
            .map(PathBuf::as_path)
            .ok_or_else(|| unknown_location(id))
    }
}

impl WorkspaceMediator for FsMediator {
    fn create_temporary_location(
        &mut self,
        path: &str,
        id: &str,
    ) -> Result<Box<dyn Write + Send + '_>, SvnError> {
        self.delete_temporary_location(id)?;
        let file_path = self.file_for(id);
        trace!(path, id, file = %file_path.display(), "allocating temporary file");
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file_path)?;
        self.files.insert(id.to_string(), file_path);
        Ok(Box::new(io::BufWriter::new(file)))
    }

    fn temporary_location(&mut self, id: &str) -> Result<Box<dyn Read + Send + '_>, SvnError> {
        let file = File::open(self.path_of(id)?)?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn length(&mut self, id: &str) -> Result<u64, SvnError> {
        Ok(std::fs::metadata(self.path_of(id)?)?.len())
    }

    fn delete_temporary_location(&mut self, id: &str) -> Result<(), SvnError> {
        if let Some(path) = self.files.remove(id) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn workspace_property(&self, path: &str, name: &PropName) -> Option<Vec<u8>> {
        self.props
            .get(&(path.to_string(), name.as_str().to_string()))
            .cloned()
    }

    fn set_workspace_property(
        &mut self,
        path: &str,
        name: &PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        let key = (path.to_string(), name.as_str().to_string());
        match value {
            Some(value) => {
                self.props.insert(key, value);
            }
            None => {
                self.props.remove(&key);
            }
        }
        Ok(())
    }
}

impl Drop for FsMediator {
    fn drop(&mut self) {
        for (_, path) in self.files.drain() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Windows of one file parked in a mediator until `text_delta_end`.
#[derive(Debug)]
pub(crate) struct StagedDelta {
    path: String,
    prefix: String,
    ids: Vec<String>,
}

impl StagedDelta {
    pub(crate) fn new(path: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
            ids: Vec::new(),
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// Encodes `window` into a fresh temporary location.
    pub(crate) fn push(
        &mut self,
        mediator: &mut dyn WorkspaceMediator,
        window: &DiffWindow,
    ) -> Result<(), SvnError> {
        let id = format!("{}.{}", self.prefix, self.ids.len());
        {
            let mut out = mediator.create_temporary_location(&self.path, &id)?;
            out.write_all(&window.encode())?;
            out.flush()?;
        }
        self.ids.push(id);
        Ok(())
    }

    /// Reads every staged window back, in order, releasing its storage.
    ///
    /// On error the unread windows stay staged for [`StagedDelta::discard`].
    pub(crate) fn drain(
        &mut self,
        mediator: &mut dyn WorkspaceMediator,
    ) -> Result<Vec<DiffWindow>, SvnError> {
        let mut windows = Vec::with_capacity(self.ids.len());
        let mut pending = std::mem::take(&mut self.ids).into_iter();
        while let Some(id) = pending.next() {
            match read_back(mediator, &id) {
                Ok(window) => windows.push(window),
                Err(err) => {
                    self.ids = std::iter::once(id).chain(pending).collect();
                    return Err(err);
                }
            }
        }
        Ok(windows)
    }

    /// Releases all storage without reading it.
    pub(crate) fn discard(&mut self, mediator: &mut dyn WorkspaceMediator) {
        for id in self.ids.drain(..) {
            if let Err(err) = mediator.delete_temporary_location(&id) {
                warn!(id = %id, error = %err, "failed to release temporary location");
            }
        }
    }
}

fn read_back(mediator: &mut dyn WorkspaceMediator, id: &str) -> Result<DiffWindow, SvnError> {
    let expected = mediator.length(id)?;
    let mut buf = Vec::with_capacity(expected as usize);
    mediator.temporary_location(id)?.read_to_end(&mut buf)?;
    mediator.delete_temporary_location(id)?;
    if buf.len() as u64 != expected {
        return Err(crate::DeltaError::Truncated(format!(
            "staged window '{id}' shrank from {expected} to {} bytes",
            buf.len()
        ))
        .into());
    }
    Ok(DiffWindow::decode(&buf)?)
}
