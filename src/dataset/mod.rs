mod archive;
mod layout;
mod orl_faces;
mod partition;

/// Binary greymap decoding.
pub mod raster;

pub use archive::*;
pub use layout::*;
pub use orl_faces::*;
pub use partition::*;
pub use raster::{ByteOrder, FormatError, RasterImage, SampleDepth, Samples};
