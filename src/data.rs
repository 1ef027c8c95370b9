use std::marker::PhantomData;

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::ElementConversion,
};

use crate::dataset::OrlFacesItem;

/// Turns ORL Faces items into flattened image batches.
pub struct OrlFacesBatcher<B: Backend> {
    backend: PhantomData<B>,
}

impl<B: Backend> OrlFacesBatcher<B> {
    pub fn new() -> Self {
        Self {
            backend: PhantomData,
        }
    }
}

impl<B: Backend> Default for OrlFacesBatcher<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Clone for OrlFacesBatcher<B> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct OrlFacesBatch<B: Backend> {
    /// Images flattened row by row and scaled to `[0, 1]`, `[batch_size, height * width]`.
    pub images: Tensor<B, 2>,
    /// Subject labels, `[batch_size]`.
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, OrlFacesItem, OrlFacesBatch<B>> for OrlFacesBatcher<B> {
    fn batch(&self, items: Vec<OrlFacesItem>, device: &B::Device) -> OrlFacesBatch<B> {
        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    TensorData::from([(item.label as i64).elem::<B::IntElem>()]),
                    device,
                )
            })
            .collect();

        let images = items
            .iter()
            .map(|item| {
                let (height, width) = item.image.shape();
                TensorData::new(item.image.to_f32(), Shape::new([1, height * width]))
            })
            .map(|data| Tensor::<B, 2>::from_data(data.convert::<B::FloatElem>(), device))
            .collect();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        OrlFacesBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{RasterImage, Samples};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn item(value: u8, label: usize) -> OrlFacesItem {
        OrlFacesItem {
            image: RasterImage::new(2, 3, 255, Samples::U8(vec![value; 6])).unwrap(),
            label,
        }
    }

    #[test]
    fn batch_flattens_and_scales_images() {
        let device = Default::default();
        let batcher = OrlFacesBatcher::<TestBackend>::new();

        let batch = batcher.batch(vec![item(255, 3), item(0, 1), item(51, 0)], &device);

        assert_eq!(batch.images.dims(), [3, 6]);
        assert_eq!(batch.targets.dims(), [3]);

        let images = batch.images.into_data().to_vec::<f32>().unwrap();
        assert!(images[..6].iter().all(|&v| v == 1.0));
        assert!(images[6..12].iter().all(|&v| v == 0.0));
        assert!(images[12..].iter().all(|&v| (v - 0.2).abs() < 1e-6));

        let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![3, 1, 0]);
    }
}
