use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use bincode::Options;
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::layout::{
    DatasetLayout, Partition, DEFAULT_SEED, IMAGES_PER_SUBJECT, NUM_SUBJECTS, SUBJECT_PREFIX,
    TRAIN_IMAGES_PER_SUBJECT,
};
use super::raster::{self, ByteOrder, RasterImage, SampleDepth, Samples};
use crate::error::{OrlFacesError, Result};

/// A subject folder of the raw data, with its images sorted by image index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    number: u32,
    images: Vec<PathBuf>,
}

impl Subject {
    /// Subject number parsed from the folder name, starting at 1.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Zero-indexed class of the subject.
    pub fn label(&self) -> usize {
        self.number as usize - 1
    }

    /// Image files, sorted by image index.
    pub fn images(&self) -> &[PathBuf] {
        &self.images
    }
}

/// Parses a subject folder name (`s<N>`), returning `N`.
pub fn parse_subject_number(folder_name: &str) -> Option<u32> {
    folder_name
        .strip_prefix(SUBJECT_PREFIX)?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Lists the subject folders of the raw data folder, in ascending subject order.
///
/// Entries that are not directories or not named `s<N>` are skipped.
pub fn discover_subjects(raw_data_folder: &Path) -> Result<Vec<Subject>> {
    if !raw_data_folder.is_dir() {
        return Err(OrlFacesError::Structure(format!(
            "raw data folder `{}` is missing",
            raw_data_folder.display()
        )));
    }

    let mut folders = BTreeMap::new();
    for entry in fs::read_dir(raw_data_folder)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();

        let number = match parse_subject_number(&name) {
            Some(number) => number,
            None => {
                debug!("Skipping `{name}`, not a subject folder");
                continue;
            }
        };
        if !entry.file_type()?.is_dir() {
            debug!("Skipping `{name}`, not a directory");
            continue;
        }

        if number == 0 || number as usize > NUM_SUBJECTS {
            return Err(OrlFacesError::Structure(format!(
                "subject folder `{name}` must be numbered from 1 to {NUM_SUBJECTS}"
            )));
        }
        if let Some(previous) = folders.insert(number, entry.path()) {
            return Err(OrlFacesError::Structure(format!(
                "subject {number} appears twice (`{}` and `{name}`)",
                previous.display()
            )));
        }
    }

    if folders.is_empty() {
        return Err(OrlFacesError::Structure(format!(
            "no subject folder found in `{}`",
            raw_data_folder.display()
        )));
    }

    folders
        .into_iter()
        .map(|(number, folder)| {
            Ok(Subject {
                number,
                images: list_images(&folder)?,
            })
        })
        .collect()
}

/// Lists the image files of a subject folder, sorted by the index leading their names.
fn list_images(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut images = BTreeMap::new();

    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type()?.is_file() {
            continue;
        }

        let index = name
            .split('.')
            .next()
            .and_then(|stem| stem.parse::<u32>().ok())
            .ok_or_else(|| {
                OrlFacesError::Structure(format!(
                    "image `{}` is not named after its index",
                    entry.path().display()
                ))
            })?;

        if images.insert(index, entry.path()).is_some() {
            return Err(OrlFacesError::Structure(format!(
                "image index {index} appears twice in `{}`",
                folder.display()
            )));
        }
    }

    if images.len() != IMAGES_PER_SUBJECT {
        return Err(OrlFacesError::Structure(format!(
            "`{}` holds {} images, expected {IMAGES_PER_SUBJECT}",
            folder.display(),
            images.len()
        )));
    }

    Ok(images.into_values().collect())
}

/// Draws `selected` of the positions `0..total` without replacement.
///
/// A partial Fisher-Yates shuffle: for `i` in `0..selected`, position `i` is swapped with a
/// position drawn uniformly in `i..total`. The drawn positions are returned in draw order, the
/// remaining ones in ascending order.
pub fn split_positions<R: Rng>(rng: &mut R, total: usize, selected: usize) -> (Vec<usize>, Vec<usize>) {
    let mut positions: Vec<usize> = (0..total).collect();
    for i in 0..selected.min(total) {
        let j = rng.gen_range(i..total);
        positions.swap(i, j);
    }

    let mut rest = positions.split_off(selected.min(total));
    rest.sort_unstable();

    (positions, rest)
}

/// Images and labels of a partition, as persisted in its cache file.
///
/// Images are stacked in a `[len, height, width]` row-major buffer. Each image keeps its own
/// maximum value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionData {
    height: usize,
    width: usize,
    max_values: Vec<u16>,
    samples: Samples,
    labels: Vec<usize>,
}

impl PartitionData {
    /// Stacks labelled images into a partition.
    ///
    /// All images must have the same shape. Samples are stored on one byte when every image is
    /// 8-bit, otherwise all images are widened to 16 bits.
    pub fn stack(items: Vec<(RasterImage, usize)>) -> Result<Self> {
        let (height, width) = match items.first() {
            Some((image, _)) => image.shape(),
            None => {
                return Err(OrlFacesError::Structure(
                    "cannot stack an empty partition".to_string(),
                ))
            }
        };
        let wide = items
            .iter()
            .any(|(image, _)| image.depth() == SampleDepth::U16);

        let mut labels = Vec::with_capacity(items.len());
        let mut max_values = Vec::with_capacity(items.len());
        let mut samples = Vec::with_capacity(items.len() * height * width);
        for (image, label) in items {
            if image.shape() != (height, width) {
                return Err(OrlFacesError::Structure(format!(
                    "image of shape {:?} cannot be stacked with images of shape {:?}",
                    image.shape(),
                    (height, width)
                )));
            }
            max_values.push(image.max_value());
            samples.extend(image.into_samples().widen());
            labels.push(label);
        }

        let samples = if wide {
            Samples::U16(samples)
        } else {
            Samples::U8(samples.into_iter().map(|v| v as u8).collect())
        };

        Ok(Self {
            height,
            width,
            max_values,
            samples,
            labels,
        })
    }

    /// Loads a partition from its cache file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // Nothing read from the cache can be larger than the file itself.
        let limit = file.metadata()?.len();
        let data: PartitionData = cache_options()
            .with_limit(limit)
            .deserialize_from(BufReader::new(file))?;

        let expected = data
            .labels
            .len()
            .checked_mul(data.height)
            .and_then(|len| len.checked_mul(data.width));
        if data.height == 0
            || data.width == 0
            || expected != Some(data.samples.len())
            || data.max_values.len() != data.labels.len()
            || data.max_values.contains(&0)
        {
            return Err(OrlFacesError::Structure(format!(
                "cache file `{}` is corrupted",
                path.display()
            )));
        }

        Ok(data)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the partition holds no sample.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `(height, width)` of every image.
    pub fn image_shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Labels, in sample order.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Image and label of a sample.
    pub fn get(&self, index: usize) -> Option<(RasterImage, usize)> {
        let label = *self.labels.get(index)?;
        let max_value = *self.max_values.get(index)?;
        let size = self.height * self.width;
        let samples = self.samples.slice(index * size, (index + 1) * size);

        RasterImage::new(self.height, self.width, max_value, samples)
            .ok()
            .map(|image| (image, label))
    }

    fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        cache_options().serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Fixed-size integers, so the cache layout does not depend on the values.
fn cache_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// How long a build waits for another build to release the lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive right to write the caches of a dataset, released on drop.
#[derive(Debug)]
pub(crate) struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    /// Creates the lock file, waiting up to `timeout` for the current holder to release it.
    pub(crate) fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        let mut waiting = false;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let lock = Self {
                        path: path.to_path_buf(),
                    };
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(lock);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(OrlFacesError::BuildLocked(path.to_path_buf()));
                    }
                    if !waiting {
                        info!("Waiting for another build to release `{}`", path.display());
                        waiting = true;
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("Failed to release `{}`: {err}", self.path.display());
        }
    }
}

/// Builds the train and test caches from the raw subject folders.
#[derive(Debug, Clone)]
pub struct PartitionBuilder {
    layout: DatasetLayout,
    seed: u64,
    byte_order: ByteOrder,
    lock_timeout: Duration,
}

impl PartitionBuilder {
    /// Creates a builder for the dataset stored in `layout`.
    pub fn new(layout: DatasetLayout) -> Self {
        Self {
            layout,
            seed: DEFAULT_SEED,
            byte_order: ByteOrder::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets the seed of the image selection.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the byte order of two-byte raster samples.
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Sets how long to wait for a concurrent build to finish.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Builds both partition caches, unless they already exist.
    ///
    /// Returns `false` when the caches were already present, or were completed by a concurrent
    /// build while this one waited for the lock. Nothing is written when any raw file is invalid.
    pub fn build(&self) -> Result<bool> {
        if self.layout.cache_exists() {
            info!(
                "Partitions already cached in `{}`",
                self.layout.processed_folder().display()
            );
            return Ok(false);
        }

        info!("Processing partitions with seed {}", self.seed);
        let subjects = discover_subjects(&self.layout.raw_data_folder())?;

        fs::create_dir_all(self.layout.processed_folder())?;
        let _lock = BuildLock::acquire(&self.layout.lock_file(), self.lock_timeout)?;
        if self.layout.cache_exists() {
            info!("Partitions were cached by another build");
            return Ok(false);
        }

        let (train, test) = self.partition(&subjects)?;
        self.persist([(Partition::Train, train), (Partition::Test, test)])?;
        info!("Done!");

        Ok(true)
    }

    /// Splits the images of every subject between train and test, and stacks each partition.
    pub fn partition(&self, subjects: &[Subject]) -> Result<(PartitionData, PartitionData)> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut train = Vec::new();
        let mut test = Vec::new();

        for subject in subjects {
            if subject.images.len() != IMAGES_PER_SUBJECT {
                return Err(OrlFacesError::Structure(format!(
                    "subject {} has {} images, expected {IMAGES_PER_SUBJECT}",
                    subject.number,
                    subject.images.len()
                )));
            }

            let (train_positions, test_positions) =
                split_positions(&mut rng, IMAGES_PER_SUBJECT, TRAIN_IMAGES_PER_SUBJECT);
            debug!(
                "Subject {}: training positions {train_positions:?}, test positions {test_positions:?}",
                subject.number
            );

            for position in train_positions {
                train.push((self.read_image(&subject.images[position])?, subject.label()));
            }
            for position in test_positions {
                test.push((self.read_image(&subject.images[position])?, subject.label()));
            }
        }

        Ok((PartitionData::stack(train)?, PartitionData::stack(test)?))
    }

    fn read_image(&self, path: &Path) -> Result<RasterImage> {
        let bytes = fs::read(path)?;
        raster::decode_with(&bytes, self.byte_order).map_err(|source| OrlFacesError::Format {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes every partition to a temporary file, then moves them in place.
    ///
    /// Must be called with the build lock held.
    fn persist(&self, partitions: [(Partition, PartitionData); 2]) -> Result<()> {
        let processed_folder = self.layout.processed_folder();

        for partition in Partition::ALL {
            let path = self.layout.cache_file(partition);
            if path.exists() {
                warn!("Removing incomplete cache `{}`", path.display());
                fs::remove_file(&path)?;
            }
        }

        let mut staged = Vec::with_capacity(partitions.len());
        for (partition, data) in partitions {
            let mut file = NamedTempFile::new_in(&processed_folder)?;
            data.write_to(file.as_file_mut())?;
            file.as_file().sync_all()?;
            staged.push((partition, data.len(), file));
        }

        for (partition, len, file) in staged {
            let path = self.layout.cache_file(partition);
            file.persist_noclobber(&path).map_err(|err| err.error)?;
            info!("Saved {len} {partition} samples to `{}`", path.display());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(value: u8) -> RasterImage {
        RasterImage::new(2, 2, 255, Samples::U8(vec![value; 4])).unwrap()
    }

    #[test]
    fn subject_folder_names() {
        assert_eq!(parse_subject_number("s1"), Some(1));
        assert_eq!(parse_subject_number("s40"), Some(40));
        assert_eq!(parse_subject_number("README"), None);
        assert_eq!(parse_subject_number("s"), None);
        assert_eq!(parse_subject_number("x1"), None);
    }

    #[test]
    fn split_positions_is_a_partition() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        for _ in 0..50 {
            let (train, test) = split_positions(&mut rng, 10, 7);
            assert_eq!(train.len(), 7);
            assert_eq!(test.len(), 3);
            assert!(test.windows(2).all(|pair| pair[0] < pair[1]));

            let mut all = [train, test].concat();
            all.sort_unstable();
            assert_eq!(all, (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn split_positions_is_seeded() {
        let draw = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..5)
                .map(|_| split_positions(&mut rng, 10, 7))
                .collect::<Vec<_>>()
        };

        assert_eq!(draw(123456), draw(123456));
        assert_ne!(draw(1), draw(2));
    }

    #[test]
    fn stack_keeps_order_and_labels() {
        let data = PartitionData::stack(vec![(image(1), 0), (image(2), 0), (image(3), 1)]).unwrap();

        assert_eq!(data.len(), 3);
        assert_eq!(data.labels(), &[0, 0, 1]);
        assert_eq!(data.image_shape(), (2, 2));

        let (third, label) = data.get(2).unwrap();
        assert_eq!(third, image(3));
        assert_eq!(label, 1);
        assert!(data.get(3).is_none());
    }

    #[test]
    fn stack_widens_mixed_depths() {
        let wide = RasterImage::new(2, 2, 1000, Samples::U16(vec![1000; 4])).unwrap();
        let data = PartitionData::stack(vec![(image(7), 0), (wide, 1)]).unwrap();

        let (first, _) = data.get(0).unwrap();
        assert_eq!(first.depth(), SampleDepth::U16);
        assert_eq!(first.get(0, 0), Some(7));
        assert_eq!(first.max_value(), 255);

        let (second, _) = data.get(1).unwrap();
        assert_eq!(second.max_value(), 1000);
    }

    #[test]
    fn stack_keeps_the_max_value_of_each_image() {
        let narrow = RasterImage::new(1, 1, 100, Samples::U8(vec![100])).unwrap();
        let wide = RasterImage::new(1, 1, 1000, Samples::U16(vec![1000])).unwrap();
        let data = PartitionData::stack(vec![(narrow.clone(), 0), (wide, 1)]).unwrap();

        let (first, _) = data.get(0).unwrap();
        assert_eq!(first.max_value(), 100);
        assert_eq!(first.to_f32(), vec![1.0]);
        assert_eq!(first.to_pgm(), narrow.to_pgm());
    }

    #[test]
    fn stack_rejects_mismatched_shapes() {
        let other = RasterImage::new(1, 4, 255, Samples::U8(vec![0; 4])).unwrap();
        let result = PartitionData::stack(vec![(image(1), 0), (other, 0)]);

        assert!(matches!(result, Err(OrlFacesError::Structure(_))));
        assert!(PartitionData::stack(Vec::new()).is_err());
    }

    fn write_raw(layout: &DatasetLayout, subjects: u32) {
        for subject in 1..=subjects {
            let folder = layout.raw_data_folder().join(format!("s{subject}"));
            fs::create_dir_all(&folder).unwrap();
            for index in 1..=10u8 {
                fs::write(folder.join(format!("{index}.pgm")), image(index).to_pgm()).unwrap();
            }
        }
    }

    #[test]
    fn load_rejects_inconsistent_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.bin");
        let data = PartitionData::stack(vec![(image(1), 0), (image(2), 1)]).unwrap();

        let mut bytes = Vec::new();
        data.write_to(&mut bytes).unwrap();
        fs::write(&path, &bytes).unwrap();
        assert_eq!(PartitionData::load(&path).unwrap(), data);

        // A height that overflows the sample count.
        let mut overflowing = bytes.clone();
        overflowing[..8].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        fs::write(&path, &overflowing).unwrap();
        assert!(matches!(
            PartitionData::load(&path),
            Err(OrlFacesError::Structure(_))
        ));

        // A vector length larger than the file.
        let mut oversized = bytes[..16].to_vec();
        oversized.extend_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, &oversized).unwrap();
        assert!(matches!(
            PartitionData::load(&path),
            Err(OrlFacesError::Serialization(_))
        ));

        fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(PartitionData::load(&path).is_err());
    }

    #[test]
    fn subjects_above_the_last_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        write_raw(&layout, 1);
        fs::create_dir_all(layout.raw_data_folder().join("s41")).unwrap();

        let result = discover_subjects(&layout.raw_data_folder());

        assert!(matches!(result, Err(OrlFacesError::Structure(_))));
    }

    #[test]
    fn build_waits_for_a_concurrent_build() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        write_raw(&layout, 2);
        fs::create_dir_all(layout.processed_folder()).unwrap();

        let lock = BuildLock::acquire(&layout.lock_file(), Duration::ZERO).unwrap();
        let waiting = {
            let layout = layout.clone();
            thread::spawn(move || PartitionBuilder::new(layout).with_seed(2).build())
        };

        let first = PartitionBuilder::new(layout.clone()).with_seed(1);
        let subjects = discover_subjects(&layout.raw_data_folder()).unwrap();
        let (train, test) = first.partition(&subjects).unwrap();
        first
            .persist([(Partition::Train, train.clone()), (Partition::Test, test.clone())])
            .unwrap();
        drop(lock);

        assert!(!waiting.join().unwrap().unwrap());
        assert_eq!(PartitionData::load(&layout.cache_file(Partition::Train)).unwrap(), train);
        assert_eq!(PartitionData::load(&layout.cache_file(Partition::Test)).unwrap(), test);
        assert!(!layout.lock_file().exists());
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        write_raw(&layout, 1);
        fs::create_dir_all(layout.processed_folder()).unwrap();
        let _lock = BuildLock::acquire(&layout.lock_file(), Duration::ZERO).unwrap();

        let result = PartitionBuilder::new(layout.clone())
            .with_lock_timeout(Duration::from_millis(50))
            .build();

        assert!(matches!(result, Err(OrlFacesError::BuildLocked(_))));
        assert!(!layout.cache_file(Partition::Train).exists());
    }

    #[test]
    fn persist_replaces_a_leftover_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        write_raw(&layout, 1);
        fs::create_dir_all(layout.processed_folder()).unwrap();
        fs::write(layout.cache_file(Partition::Test), b"stale").unwrap();

        assert!(PartitionBuilder::new(layout.clone()).build().unwrap());

        let test = PartitionData::load(&layout.cache_file(Partition::Test)).unwrap();
        assert_eq!(test.len(), 3);
        assert!(!layout.lock_file().exists());
    }

    #[test]
    fn missing_raw_folder_is_a_structure_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = discover_subjects(&dir.path().join("missing"));

        assert!(matches!(result, Err(OrlFacesError::Structure(_))));
    }
}
