use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OrlFacesError;

/// Folder holding the dataset under the root.
pub const DATASET_FOLDER: &str = "ORLFaces";
/// Folder of the extracted archive under the raw folder.
pub const RAW_DATA_FOLDER: &str = "orl_faces";
/// Archive file name expected in the raw folder.
pub const ARCHIVE_NAME: &str = "orl_faces.tar.gz";
/// MD5 digest of the published archive.
pub const ARCHIVE_MD5: &str = "83134c1ac2309b40441b35d5fa37a3f1";
/// Where the archive is published. It is never fetched by this crate.
pub const ARCHIVE_URL: &str = "https://www.dropbox.com/s/gxus70grtlt8bpq/orl_faces.tar.gz?dl=1";

/// Prefix of the subject folder names (`s1` .. `s40`).
pub const SUBJECT_PREFIX: &str = "s";
/// Number of subjects in the dataset.
pub const NUM_SUBJECTS: usize = 40;
/// Number of images of each subject.
pub const IMAGES_PER_SUBJECT: usize = 10;
/// Number of images of each subject in the training partition.
pub const TRAIN_IMAGES_PER_SUBJECT: usize = 7;

/// Image height.
pub const HEIGHT: usize = 112;
/// Image width.
pub const WIDTH: usize = 92;

/// Seed of the partitioning when none is provided.
pub const DEFAULT_SEED: u64 = 123456;

/// Data partition for machine learning experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Partition {
    /// Training partition, 7 images per subject.
    #[default]
    Train,
    /// Test partition, 3 images per subject.
    Test,
}

impl Partition {
    /// Both partitions, training first.
    pub const ALL: [Partition; 2] = [Partition::Train, Partition::Test];

    /// Stored name of the partition.
    pub fn name(&self) -> &'static str {
        match self {
            Partition::Train => "training",
            Partition::Test => "test",
        }
    }

    /// Cache file name of the partition.
    pub fn cache_file_name(&self) -> String {
        format!("{}.bin", self.name())
    }
}

impl FromStr for Partition {
    type Err = OrlFacesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "train" => Ok(Partition::Train),
            "test" => Ok(Partition::Test),
            _ => Err(OrlFacesError::InvalidPartition(s.to_string())),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Paths of the dataset files under a root directory.
///
/// ```text
/// <root>/ORLFaces/raw/orl_faces.tar.gz
/// <root>/ORLFaces/raw/orl_faces/s<N>/<M>.pgm
/// <root>/ORLFaces/processed/{training,test}.bin
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    /// Creates the layout of the dataset stored under `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/ORLFaces`
    pub fn dataset_folder(&self) -> PathBuf {
        self.root.join(DATASET_FOLDER)
    }

    /// `<root>/ORLFaces/raw`
    pub fn raw_folder(&self) -> PathBuf {
        self.dataset_folder().join("raw")
    }

    /// `<root>/ORLFaces/raw/orl_faces`
    pub fn raw_data_folder(&self) -> PathBuf {
        self.raw_folder().join(RAW_DATA_FOLDER)
    }

    /// `<root>/ORLFaces/raw/orl_faces.tar.gz`
    pub fn archive_file(&self) -> PathBuf {
        self.raw_folder().join(ARCHIVE_NAME)
    }

    /// `<root>/ORLFaces/processed`
    pub fn processed_folder(&self) -> PathBuf {
        self.dataset_folder().join("processed")
    }

    /// Cache file of a partition.
    pub fn cache_file(&self, partition: Partition) -> PathBuf {
        self.processed_folder().join(partition.cache_file_name())
    }

    /// Lock file held while the caches are built.
    pub fn lock_file(&self) -> PathBuf {
        self.processed_folder().join(".build.lock")
    }

    /// Whether the caches of both partitions exist. A lone cache file is the remain of an
    /// interrupted build and does not count.
    pub fn cache_exists(&self) -> bool {
        Partition::ALL
            .iter()
            .all(|&partition| self.cache_file(partition).is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_from_str() {
        assert_eq!("train".parse::<Partition>().unwrap(), Partition::Train);
        assert_eq!(" Test\n".parse::<Partition>().unwrap(), Partition::Test);
        assert_eq!("TRAIN".parse::<Partition>().unwrap(), Partition::Train);
    }

    #[test]
    fn partition_from_str_rejects_unknown_names() {
        let err = "validation".parse::<Partition>().unwrap_err();
        assert!(matches!(err, OrlFacesError::InvalidPartition(name) if name == "validation"));

        // Stored names are not accepted as user input.
        assert!("training".parse::<Partition>().is_err());
    }

    #[test]
    fn partition_names() {
        assert_eq!(Partition::Train.to_string(), "training");
        assert_eq!(Partition::Test.cache_file_name(), "test.bin");
    }

    #[test]
    fn layout_paths() {
        let layout = DatasetLayout::new("/data");

        assert_eq!(layout.raw_folder(), Path::new("/data/ORLFaces/raw"));
        assert_eq!(
            layout.raw_data_folder(),
            Path::new("/data/ORLFaces/raw/orl_faces")
        );
        assert_eq!(
            layout.archive_file(),
            Path::new("/data/ORLFaces/raw/orl_faces.tar.gz")
        );
        assert_eq!(
            layout.cache_file(Partition::Train),
            Path::new("/data/ORLFaces/processed/training.bin")
        );
        assert_eq!(
            layout.cache_file(Partition::Test),
            Path::new("/data/ORLFaces/processed/test.bin")
        );
    }

    #[test]
    fn cache_exists_requires_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        assert!(!layout.cache_exists());

        std::fs::create_dir_all(layout.processed_folder()).unwrap();
        std::fs::write(layout.cache_file(Partition::Train), b"").unwrap();
        assert!(!layout.cache_exists());

        std::fs::write(layout.cache_file(Partition::Test), b"").unwrap();
        assert!(layout.cache_exists());
    }
}
