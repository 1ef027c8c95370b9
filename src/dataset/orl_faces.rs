//! The ORL Database of Faces.
//!
//! The dataset contains images of 40 subjects, one folder per subject named `s<N>` with `N`
//! between 1 and 40. Each folder holds ten images of that subject named `<M>.pgm`, with `M`
//! between 1 and 10. Images are 112x92 greymaps with 256 grey levels.
//!
//! Images of every subject are randomly split in a training partition (7 images) and a test
//! partition (3 images), consistently for a given seed. The partitions are generated the first
//! time the dataset is built and cached under the root; loading the dataset again with another
//! seed has no effect unless the cache files are deleted.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use burn::data::dataset::Dataset;
use log::info;

use super::archive::extract_archive;
use super::layout::{
    DatasetLayout, Partition, ARCHIVE_MD5, ARCHIVE_URL, DEFAULT_SEED, NUM_SUBJECTS,
};
use super::partition::{PartitionBuilder, PartitionData};
use super::raster::{ByteOrder, RasterImage};
use crate::error::{OrlFacesError, Result};

/// Function applied to every image on access.
pub type ImageTransform = Arc<dyn Fn(RasterImage) -> RasterImage + Send + Sync>;

/// ORL Faces item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrlFacesItem {
    /// Face image.
    pub image: RasterImage,

    /// Zero-indexed subject of the image.
    pub label: usize,
}

/// One partition of the ORL Faces dataset, loaded in memory from its cache.
///
/// The whole cache is small (400 images of 112x92 bytes), so it is loaded eagerly and images are
/// materialized on access.
pub struct OrlFacesDataset {
    layout: DatasetLayout,
    partition: Partition,
    data: PartitionData,
    transform: Option<ImageTransform>,
}

impl OrlFacesDataset {
    /// Loads a partition of the dataset stored under `root`.
    ///
    /// When `download` is set and the cache is absent, the cache is built first from the raw
    /// data with the default seed.
    pub fn new<P: AsRef<Path>>(root: P, partition: Partition, download: bool) -> Result<Self> {
        OrlFacesLoader::new(root)
            .partition(partition)
            .download(download)
            .load()
    }

    /// Loads the cached training partition.
    pub fn train<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::new(root, Partition::Train, false)
    }

    /// Loads the cached test partition.
    pub fn test<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::new(root, Partition::Test, false)
    }

    /// Options builder for the dataset stored under `root`.
    pub fn loader<P: AsRef<Path>>(root: P) -> OrlFacesLoader {
        OrlFacesLoader::new(root)
    }

    /// Gets the sample at the given index.
    pub fn get(&self, index: usize) -> Result<OrlFacesItem> {
        let (image, label) = self
            .data
            .get(index)
            .ok_or(OrlFacesError::IndexOutOfRange {
                index,
                len: self.count(),
            })?;

        let image = match &self.transform {
            Some(transform) => transform(image),
            None => image,
        };

        Ok(OrlFacesItem { image, label })
    }

    /// Number of samples in the partition.
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Loaded partition.
    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Paths of the dataset files.
    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Labels of the partition, in sample order.
    pub fn labels(&self) -> &[usize] {
        self.data.labels()
    }

    /// `(height, width)` of the images.
    pub fn image_shape(&self) -> (usize, usize) {
        self.data.image_shape()
    }

    /// Subject numbers, as named by the subject folders.
    pub fn classes() -> Vec<u32> {
        (1..=NUM_SUBJECTS as u32).collect()
    }

    /// Maps a subject number to its label.
    pub fn class_to_idx() -> HashMap<u32, usize> {
        Self::classes()
            .into_iter()
            .enumerate()
            .map(|(idx, class)| (class, idx))
            .collect()
    }

    /// Maps a label to its subject number.
    pub fn idx_to_class() -> HashMap<usize, u32> {
        Self::classes().into_iter().enumerate().collect()
    }

    /// Subject number of a label.
    pub fn subject_of(label: usize) -> Result<u32> {
        Self::classes()
            .get(label)
            .copied()
            .ok_or_else(|| OrlFacesError::Structure(format!("label {label} has no subject")))
    }
}

impl Dataset<OrlFacesItem> for OrlFacesDataset {
    fn get(&self, index: usize) -> Option<OrlFacesItem> {
        OrlFacesDataset::get(self, index).ok()
    }

    fn len(&self) -> usize {
        self.count()
    }
}

impl fmt::Debug for OrlFacesDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrlFacesDataset")
            .field("root", &self.layout.root())
            .field("partition", &self.partition)
            .field("len", &self.count())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl fmt::Display for OrlFacesDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dataset ORLFaces")?;
        writeln!(f, "    Number of datapoints: {}", self.count())?;
        writeln!(f, "    Root location: {}", self.layout.root().display())?;
        write!(f, "    Split: {}", self.partition)
    }
}

/// Options to load an [OrlFacesDataset].
pub struct OrlFacesLoader {
    layout: DatasetLayout,
    partition: Partition,
    download: bool,
    seed: u64,
    byte_order: ByteOrder,
    archive_md5: Option<String>,
    transform: Option<ImageTransform>,
}

impl OrlFacesLoader {
    /// Default options for the dataset stored under `root`: training partition, no build, seed
    /// `123456`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            layout: DatasetLayout::new(root),
            partition: Partition::default(),
            download: false,
            seed: DEFAULT_SEED,
            byte_order: ByteOrder::default(),
            archive_md5: Some(ARCHIVE_MD5.to_string()),
            transform: None,
        }
    }

    /// Partition to load.
    pub fn partition(mut self, partition: Partition) -> Self {
        self.partition = partition;
        self
    }

    /// Partition to load, by name (`"train"` or `"test"`).
    pub fn split(mut self, split: &str) -> Result<Self> {
        self.partition = split.parse()?;
        Ok(self)
    }

    /// Whether to build the cache when it is absent.
    pub fn download(mut self, download: bool) -> Self {
        self.download = download;
        self
    }

    /// Seed of the partitioning. Only used when the cache is built.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Byte order of two-byte raster samples.
    pub fn byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Digest the raw archive is checked against before extraction, `None` to skip the check.
    pub fn archive_md5(mut self, md5: Option<&str>) -> Self {
        self.archive_md5 = md5.map(str::to_string);
        self
    }

    /// Function applied to every image on access. It is not cached.
    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(RasterImage) -> RasterImage + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Loads the dataset, building the cache first when requested.
    pub fn load(self) -> Result<OrlFacesDataset> {
        if self.download {
            self.prepare()?;
        }

        if !self.layout.cache_exists() {
            return Err(OrlFacesError::NotFound(self.layout.processed_folder()));
        }

        let data = PartitionData::load(&self.layout.cache_file(self.partition))?;

        Ok(OrlFacesDataset {
            layout: self.layout,
            partition: self.partition,
            data,
            transform: self.transform,
        })
    }

    /// Extracts the raw archive when needed and builds the partition caches.
    fn prepare(&self) -> Result<()> {
        if self.layout.cache_exists() {
            return Ok(());
        }

        if !self.layout.raw_data_folder().exists() {
            let archive = self.layout.archive_file();
            if !archive.is_file() {
                return Err(OrlFacesError::Structure(format!(
                    "raw data folder `{}` is missing, fetch the archive from {ARCHIVE_URL} to `{}`",
                    self.layout.raw_data_folder().display(),
                    archive.display()
                )));
            }
            extract_archive(
                &archive,
                &self.layout.raw_folder(),
                self.archive_md5.as_deref(),
            )?;
        }

        info!("Processing...");
        PartitionBuilder::new(self.layout.clone())
            .with_seed(self.seed)
            .with_byte_order(self.byte_order)
            .build()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_maps() {
        let classes = OrlFacesDataset::classes();
        assert_eq!(classes.len(), 40);
        assert_eq!(classes[0], 1);
        assert_eq!(classes[39], 40);

        assert_eq!(OrlFacesDataset::class_to_idx()[&1], 0);
        assert_eq!(OrlFacesDataset::class_to_idx()[&40], 39);
        assert_eq!(OrlFacesDataset::idx_to_class()[&0], 1);
        assert_eq!(OrlFacesDataset::idx_to_class()[&39], 40);
    }

    #[test]
    fn subject_of_labels() {
        assert_eq!(OrlFacesDataset::subject_of(0).unwrap(), 1);
        assert_eq!(OrlFacesDataset::subject_of(39).unwrap(), 40);
        assert!(matches!(
            OrlFacesDataset::subject_of(40),
            Err(OrlFacesError::Structure(_))
        ));
    }

    #[test]
    fn absent_cache_without_download_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = OrlFacesDataset::new(dir.path(), Partition::Train, false);

        assert!(matches!(result, Err(OrlFacesError::NotFound(_))));
        // Nothing is created under the root.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn download_without_raw_data_is_a_structure_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = OrlFacesDataset::new(dir.path(), Partition::Test, true);

        assert!(matches!(result, Err(OrlFacesError::Structure(_))));
    }

    #[test]
    fn loader_split_names() {
        let loader = OrlFacesDataset::loader("/data").split("test").unwrap();
        assert_eq!(loader.partition, Partition::Test);

        assert!(OrlFacesDataset::loader("/data").split("validation").is_err());
    }
}
