use std::fs;
use std::path::{Path, PathBuf};

use orl_faces::dataset::DatasetLayout;

pub const SIDE: usize = 4;

/// Every sample of the image `index` of subject `subject` holds this value.
pub fn marker(subject: u32, index: u32) -> u8 {
    (subject * 10 + index) as u8
}

/// Binary greymap of a square image filled with `value`.
pub fn pgm(value: u8) -> Vec<u8> {
    let mut bytes = format!("P5\n# fixture\n{SIDE} {SIDE}\n255\n").into_bytes();
    bytes.extend(std::iter::repeat(value).take(SIDE * SIDE));
    bytes
}

/// Writes `images` marked images for each of `subjects` under the raw data folder of `root`.
pub fn write_subjects(root: &Path, subjects: &[u32], images: u32) -> DatasetLayout {
    let layout = DatasetLayout::new(root);
    for &subject in subjects {
        let folder = subject_folder(&layout, subject);
        fs::create_dir_all(&folder).unwrap();
        for index in 1..=images {
            fs::write(folder.join(format!("{index}.pgm")), pgm(marker(subject, index))).unwrap();
        }
    }
    layout
}

pub fn subject_folder(layout: &DatasetLayout, subject: u32) -> PathBuf {
    layout.raw_data_folder().join(format!("s{subject}"))
}
