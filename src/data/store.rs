//! Chunk-addressed array store (Zarr V3).
//!
//! One store directory holds every array of a run. Each named array is a group whose
//! attributes carry the axis names, coordinates and acquisition metadata, with the
//! pixel data in a child array:
//!
//! ```text
//! run.zarr/
//! +-- zarr.json              root group
//! +-- tiles/
//!     +-- zarr.json          group: dims, coords, schedule metadata
//!     +-- data/
//!         +-- zarr.json      array: shape (leading axes..., y, x), uint16, fill 0
//!         +-- c/0/0/1/2/0/0  one chunk per frame
//! ```
//!
//! Chunks are one frame along the trailing two axes and 1 along every other axis, so a
//! frame write touches exactly one chunk file. Writes to the same chunk are serialized;
//! writes to different chunks proceed concurrently. A second process reopens the store
//! read-only and sees every chunk that has been written, or the zero fill value for
//! those that have not. All file I/O is performed via `tokio::task::spawn_blocking`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::ReadableWritableListableStorage;

use crate::hardware::Frame;

const DATA_ARRAY: &str = "data";
const FRAME_DIMS: [&str; 2] = ["y", "x"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Array '{0}' already exists")]
    AlreadyExists(String),

    #[error("Array '{0}' not found")]
    NotFound(String),

    #[error("'{0}' is not a valid array name")]
    InvalidName(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Store is open read-only")]
    ReadOnly,

    #[error("Zarr error: {0}")]
    Zarr(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Size of a leading axis: anonymous with a length, or labelled by coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisSpec {
    /// Anonymous axis of this length, coordinates `0..n`
    Size(u64),
    /// Axis labelled by these coordinates, in order
    Coords(Vec<Value>),
}

impl AxisSpec {
    /// Number of entries along the axis.
    pub fn len(&self) -> u64 {
        match self {
            AxisSpec::Size(n) => *n,
            AxisSpec::Coords(coords) => coords.len() as u64,
        }
    }

    /// Whether the axis has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn coords(&self) -> Vec<Value> {
        match self {
            AxisSpec::Size(n) => (0..*n).map(|i| json!(i)).collect(),
            AxisSpec::Coords(coords) => coords.clone(),
        }
    }
}

/// What a reader needs to interpret an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMetadata {
    /// Array name
    pub name: String,
    /// Axis names, frame axes included
    pub dims: Vec<String>,
    /// Full shape, frame axes included
    pub shape: Vec<u64>,
    /// Group attributes (coordinates and acquisition metadata)
    pub attributes: Map<String, Value>,
}

impl ArrayMetadata {
    /// Number of leading (non-frame) axes.
    pub fn leading_dims(&self) -> usize {
        self.shape.len().saturating_sub(FRAME_DIMS.len())
    }

    /// Number of frames the array holds.
    pub fn frame_count(&self) -> u64 {
        self.shape[..self.leading_dims()].iter().product()
    }

    /// Frame `(height, width)`.
    pub fn frame_shape(&self) -> (u64, u64) {
        let n = self.shape.len();
        if n < 2 {
            return (0, 0);
        }
        (self.shape[n - 2], self.shape[n - 1])
    }
}

struct DeclaredArray {
    path: String,
    shape: Vec<u64>,
}

/// Handle onto a directory-backed array store.
pub struct ArrayStore {
    root: PathBuf,
    store: ReadableWritableListableStorage,
    read_only: bool,
    declared: RwLock<HashMap<String, DeclaredArray>>,
    chunk_locks: Mutex<HashMap<(String, Vec<u64>), Arc<Mutex<()>>>>,
}

impl ArrayStore {
    /// Create (or reuse) a store directory for writing.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        let root_clone = root.clone();

        let store = tokio::task::spawn_blocking(
            move || -> Result<ReadableWritableListableStorage, StoreError> {
                std::fs::create_dir_all(&root_clone)?;
                let store = FilesystemStore::new(&root_clone)
                    .map_err(|e| StoreError::Zarr(format!("Failed to create store: {e}")))?;
                let store: ReadableWritableListableStorage = Arc::new(store);

                if !root_clone.join("zarr.json").exists() {
                    let group = GroupBuilder::new()
                        .build(store.clone(), "/")
                        .map_err(|e| StoreError::Zarr(format!("Failed to create root group: {e}")))?;
                    group.store_metadata().map_err(|e| {
                        StoreError::Zarr(format!("Failed to store root group metadata: {e}"))
                    })?;
                }
                Ok(store)
            },
        )
        .await??;

        info!(path = %root.display(), "Array store ready");
        Ok(Self::with_store(root, store, false))
    }

    /// Reopen an existing store for reading, as the display process does.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        if !root.join("zarr.json").exists() {
            return Err(StoreError::NotFound(root.display().to_string()));
        }
        let root_clone = root.clone();
        let store = tokio::task::spawn_blocking(
            move || -> Result<ReadableWritableListableStorage, StoreError> {
                let store = FilesystemStore::new(&root_clone)
                    .map_err(|e| StoreError::Zarr(format!("Failed to open store: {e}")))?;
                let store: ReadableWritableListableStorage = Arc::new(store);
                Ok(store)
            },
        )
        .await??;

        debug!(path = %root.display(), "Array store opened read-only");
        Ok(Self::with_store(root, store, true))
    }

    fn with_store(root: PathBuf, store: ReadableWritableListableStorage, read_only: bool) -> Self {
        Self {
            root,
            store,
            read_only,
            declared: RwLock::new(HashMap::new()),
            chunk_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Declare a named array of `dims` leading axes followed by a `frame_shape`
    /// `(height, width)` frame, zero-filled, one chunk per frame.
    ///
    /// `attributes` are stored on the array's group next to `dims` and `coords`.
    /// Fails with [`StoreError::AlreadyExists`] if the name is already on disk.
    pub async fn declare(
        &self,
        name: &str,
        dims: &[(String, AxisSpec)],
        frame_shape: (u32, u32),
        attributes: Map<String, Value>,
    ) -> Result<ArrayMetadata, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        validate_name(name)?;
        if let Some((axis, _)) = dims.iter().find(|(_, spec)| spec.is_empty()) {
            return Err(StoreError::ShapeMismatch(format!("axis '{axis}' is empty")));
        }
        if frame_shape.0 == 0 || frame_shape.1 == 0 {
            return Err(StoreError::ShapeMismatch(format!(
                "frame shape {frame_shape:?} is empty"
            )));
        }

        // Held across the existence check and creation
        let mut declared = self.declared.write().await;
        let group_dir = self.root.join(name);
        if declared.contains_key(name) || group_dir.exists() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        let mut dim_names: Vec<String> = dims.iter().map(|(axis, _)| axis.clone()).collect();
        dim_names.extend(FRAME_DIMS.iter().map(|d| d.to_string()));

        let mut shape: Vec<u64> = dims.iter().map(|(_, spec)| spec.len()).collect();
        shape.push(frame_shape.0 as u64);
        shape.push(frame_shape.1 as u64);

        let mut chunks = vec![1u64; dims.len()];
        chunks.push(frame_shape.0 as u64);
        chunks.push(frame_shape.1 as u64);

        let coords: Map<String, Value> = dims
            .iter()
            .map(|(axis, spec)| (axis.clone(), Value::Array(spec.coords())))
            .collect();

        let mut group_attributes = attributes;
        group_attributes.insert("dims".to_string(), json!(dim_names));
        group_attributes.insert("coords".to_string(), Value::Object(coords));

        let mut array_attributes = Map::new();
        array_attributes.insert("_ARRAY_DIMENSIONS".to_string(), json!(dim_names));

        let store = self.store.clone();
        let group_path = format!("/{name}");
        let array_path = format!("/{name}/{DATA_ARRAY}");
        let metadata_attributes = group_attributes.clone();
        let array_shape = shape.clone();
        let dimension_names: Vec<Option<String>> = dim_names.iter().cloned().map(Some).collect();
        let path = array_path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let group = GroupBuilder::new()
                .attributes(group_attributes)
                .build(store.clone(), &group_path)
                .map_err(|e| StoreError::Zarr(format!("Failed to create group '{group_path}': {e}")))?;
            group
                .store_metadata()
                .map_err(|e| StoreError::Zarr(format!("Failed to store group metadata: {e}")))?;

            let mut builder =
                ArrayBuilder::new(array_shape, chunks, DataType::UInt16, FillValue::from(0u16));
            builder.attributes(array_attributes);
            builder.dimension_names(Some(dimension_names));

            let array = builder
                .build(store, &path)
                .map_err(|e| StoreError::Zarr(format!("Failed to create array '{path}': {e}")))?;
            array
                .store_metadata()
                .map_err(|e| StoreError::Zarr(format!("Failed to store array metadata: {e}")))?;
            Ok(())
        })
        .await??;

        declared.insert(
            name.to_string(),
            DeclaredArray {
                path: array_path,
                shape: shape.clone(),
            },
        );

        info!(array = name, ?shape, "Declared array");
        Ok(ArrayMetadata {
            name: name.to_string(),
            dims: dim_names,
            shape,
            attributes: metadata_attributes,
        })
    }

    /// Write one frame at `index` (one entry per leading axis).
    pub async fn write(&self, name: &str, index: &[u64], frame: &Frame) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }

        let (path, shape) = {
            let declared = self.declared.read().await;
            let array = declared
                .get(name)
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            (array.path.clone(), array.shape.clone())
        };
        let chunk = chunk_indices(&shape, index)?;
        check_frame(&shape, frame)?;

        let lock = {
            let mut locks = self.chunk_locks.lock().await;
            locks
                .entry((name.to_string(), chunk.clone()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;

        let store = self.store.clone();
        let data = frame.buffer.clone();
        let key = (name.to_string(), chunk.clone());
        let result = tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let array = Array::open(store, &path)
                .map_err(|e| StoreError::Zarr(format!("Failed to open array: {e}")))?;
            array
                .store_chunk_elements(&chunk, &data)
                .map_err(|e| StoreError::Zarr(format!("Failed to write chunk: {e}")))?;
            Ok(())
        })
        .await;
        drop(guard);
        self.release_chunk_lock(key, lock).await;
        result??;

        debug!(array = name, ?index, "Wrote frame");
        Ok(())
    }

    /// Forget a chunk lock nobody else holds or waits on.
    ///
    /// Clones are only taken under the map lock, so a count of two (the map and
    /// `lock`) cannot grow while it is held.
    async fn release_chunk_lock(&self, key: (String, Vec<u64>), lock: Arc<Mutex<()>>) {
        let mut locks = self.chunk_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
    }

    /// Read the frame at `index`. Unwritten chunks read as zeros.
    pub async fn read(&self, name: &str, index: &[u64]) -> Result<Frame, StoreError> {
        validate_name(name)?;
        let store = self.store.clone();
        let path = format!("/{name}/{DATA_ARRAY}");
        let index = index.to_vec();
        let missing = name.to_string();

        tokio::task::spawn_blocking(move || -> Result<Frame, StoreError> {
            let array = Array::open(store, &path).map_err(|_| StoreError::NotFound(missing))?;
            let shape = array.shape().to_vec();
            let chunk = chunk_indices(&shape, &index)?;
            let data: Vec<u16> = array
                .retrieve_chunk_elements(&chunk)
                .map_err(|e| StoreError::Zarr(format!("Failed to read chunk: {e}")))?;
            let n = shape.len();
            Ok(Frame::new(shape[n - 1] as u32, shape[n - 2] as u32, data))
        })
        .await?
    }

    /// Names of every array in the store, sorted.
    ///
    /// Reads the directory each time, so arrays declared by another process appear
    /// as soon as their metadata is on disk.
    pub async fn names(&self) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, StoreError> {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&root)? {
                let entry = entry?;
                if entry.path().join(DATA_ARRAY).join("zarr.json").exists() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
            names.sort();
            Ok(names)
        })
        .await?
    }

    /// Axis names, shape and group attributes of a named array.
    pub async fn metadata(&self, name: &str) -> Result<ArrayMetadata, StoreError> {
        validate_name(name)?;
        let store = self.store.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || -> Result<ArrayMetadata, StoreError> {
            let group = Group::open(store.clone(), &format!("/{name}"))
                .map_err(|_| StoreError::NotFound(name.clone()))?;
            let array = Array::open(store, &format!("/{name}/{DATA_ARRAY}"))
                .map_err(|_| StoreError::NotFound(name.clone()))?;

            let attributes = group.attributes().clone();
            let dims = attributes
                .get("dims")
                .and_then(|d| serde_json::from_value::<Vec<String>>(d.clone()).ok())
                .unwrap_or_default();

            Ok(ArrayMetadata {
                name,
                dims,
                shape: array.shape().to_vec(),
                attributes,
            })
        })
        .await?
    }

    /// Whether the chunk at `index` has been written.
    pub fn chunk_written(&self, name: &str, index: &[u64]) -> bool {
        let mut path = self.root.join(name).join(DATA_ARRAY).join("c");
        for i in index.iter().chain(&[0, 0]) {
            path.push(i.to_string());
        }
        path.is_file()
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.starts_with("__")
        || name.contains(['/', '\\']);
    if invalid {
        Err(StoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

fn chunk_indices(shape: &[u64], index: &[u64]) -> Result<Vec<u64>, StoreError> {
    let leading = shape.len().saturating_sub(FRAME_DIMS.len());
    if index.len() != leading {
        return Err(StoreError::ShapeMismatch(format!(
            "index {index:?} has {} entries, array has {leading} leading axes",
            index.len()
        )));
    }
    for (axis, (&i, &n)) in index.iter().zip(&shape[..leading]).enumerate() {
        if i >= n {
            return Err(StoreError::ShapeMismatch(format!(
                "index {i} out of bounds for axis {axis} of length {n}"
            )));
        }
    }
    let mut chunk = index.to_vec();
    chunk.extend([0, 0]);
    Ok(chunk)
}

fn check_frame(shape: &[u64], frame: &Frame) -> Result<(), StoreError> {
    let n = shape.len();
    let expected = (shape[n - 2], shape[n - 1]);
    let actual = (frame.height as u64, frame.width as u64);
    if expected != actual || !frame.is_consistent() {
        return Err(StoreError::ShapeMismatch(format!(
            "frame is {actual:?} with {} pixels, array frames are {expected:?}",
            frame.buffer.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn axes() -> Vec<(String, AxisSpec)> {
        vec![
            ("channel".to_string(), AxisSpec::Coords(vec![json!("dapi"), json!("gfp")])),
            ("time".to_string(), AxisSpec::Size(1)),
        ]
    }

    #[tokio::test]
    async fn test_declare_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArrayStore::create(temp_dir.path().join("run.zarr")).await.unwrap();

        let mut attrs = Map::new();
        attrs.insert("overlap".to_string(), json!(0.1));
        let metadata = store.declare("tiles", &axes(), (4, 6), attrs).await.unwrap();

        assert_eq!(metadata.shape, vec![2, 1, 4, 6]);
        assert_eq!(metadata.dims, vec!["channel", "time", "y", "x"]);
        assert_eq!(metadata.frame_count(), 2);
        assert_eq!(metadata.frame_shape(), (4, 6));

        let root = store.root();
        assert!(root.join("zarr.json").exists());
        assert!(root.join("tiles").join("zarr.json").exists());
        assert!(root.join("tiles").join("data").join("zarr.json").exists());

        let reread = store.metadata("tiles").await.unwrap();
        assert_eq!(reread.shape, metadata.shape);
        assert_eq!(reread.attributes["overlap"], json!(0.1));
        assert_eq!(reread.attributes["coords"]["channel"], json!(["dapi", "gfp"]));
        assert_eq!(reread.attributes["coords"]["time"], json!([0]));
    }

    #[tokio::test]
    async fn test_write_and_read_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArrayStore::create(temp_dir.path()).await.unwrap();
        store.declare("tiles", &axes(), (2, 3), Map::new()).await.unwrap();

        let frame = Frame::new(3, 2, vec![1, 2, 3, 4, 5, 6]);
        store.write("tiles", &[1, 0], &frame).await.unwrap();

        assert!(store.chunk_written("tiles", &[1, 0]));
        assert!(!store.chunk_written("tiles", &[0, 0]));
        assert_eq!(store.read("tiles", &[1, 0]).await.unwrap(), frame);
        assert_eq!(store.read("tiles", &[0, 0]).await.unwrap(), Frame::zeros(3, 2));
    }

    #[tokio::test]
    async fn test_write_rejects_bad_shapes() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArrayStore::create(temp_dir.path()).await.unwrap();
        store.declare("tiles", &axes(), (2, 2), Map::new()).await.unwrap();
        let frame = Frame::zeros(2, 2);

        assert!(matches!(
            store.write("tiles", &[2, 0], &frame).await,
            Err(StoreError::ShapeMismatch(_))
        ));
        assert!(matches!(
            store.write("tiles", &[0], &frame).await,
            Err(StoreError::ShapeMismatch(_))
        ));
        assert!(matches!(
            store.write("tiles", &[0, 0], &Frame::zeros(3, 2)).await,
            Err(StoreError::ShapeMismatch(_))
        ));
        assert!(matches!(
            store.write("missing", &[0, 0], &frame).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_names_and_invalid_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArrayStore::create(temp_dir.path()).await.unwrap();
        store.declare("b", &axes(), (2, 2), Map::new()).await.unwrap();
        store.declare("a", &[], (2, 2), Map::new()).await.unwrap();

        assert_eq!(store.names().await.unwrap(), vec!["a", "b"]);
        assert!(matches!(
            store.declare("x/y", &axes(), (2, 2), Map::new()).await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.declare("empty", &[("t".into(), AxisSpec::Size(0))], (2, 2), Map::new()).await,
            Err(StoreError::ShapeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_distinct_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(ArrayStore::create(temp_dir.path()).await.unwrap());
        let dims = vec![("position".to_string(), AxisSpec::Size(8))];
        store.declare("tiles", &dims, (4, 4), Map::new()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let frame = Frame::new(4, 4, vec![i as u16 + 1; 16]);
                store.write("tiles", &[i], &frame).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for i in 0..8u64 {
            let frame = store.read("tiles", &[i]).await.unwrap();
            assert!(frame.buffer.iter().all(|&v| v == i as u16 + 1));
        }
        assert!(store.chunk_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_same_chunk_writes_release_their_lock() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(ArrayStore::create(temp_dir.path()).await.unwrap());
        let dims = vec![("position".to_string(), AxisSpec::Size(2))];
        store.declare("tiles", &dims, (2, 2), Map::new()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write("tiles", &[1], &Frame::new(2, 2, vec![i; 4])).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(store.chunk_locks.lock().await.is_empty());

        let frame = store.read("tiles", &[1]).await.unwrap();
        assert!(frame.buffer.windows(2).all(|w| w[0] == w[1]));
    }
}
