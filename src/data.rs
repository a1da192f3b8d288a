//! Labelled image datasets and minibatch shuffling.
//!
//! Images are stored as one contiguous `f32` buffer with shape
//! `(count, height, width, channels)`, row-major. Byte images are normalised to
//! `[0, 1]` on construction. A [`Dataset`] is an ordinary owned value: build it,
//! borrow it for training, drop it.

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::{Error, Result, check_len};
use crate::math;

/// Shape of a single image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// A flat feature vector of `len` values.
    pub fn flat(len: usize) -> Self {
        Self::new(1, len, 1)
    }

    /// Values per image.
    #[inline]
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    images: Vec<f32>,
    labels: Vec<usize>,
    shape: ImageShape,
    classes: usize,
}

impl Dataset {
    /// Builds a dataset from `f32` pixels, used as is.
    pub fn from_floats(
        images: Vec<f32>,
        labels: Vec<usize>,
        shape: ImageShape,
        classes: usize,
    ) -> Result<Self> {
        if shape.is_empty() {
            return Err(Error::InvalidData(format!(
                "image shape must be non-empty, got {shape:?}"
            )));
        }
        if classes == 0 {
            return Err(Error::InvalidData("classes must be > 0".to_owned()));
        }
        let expected = labels
            .len()
            .checked_mul(shape.len())
            .ok_or_else(|| Error::InvalidData("image buffer size overflow".to_owned()))?;
        if images.len() != expected {
            return Err(Error::InvalidData(format!(
                "image buffer has {} values, expected {} images of {}",
                images.len(),
                labels.len(),
                shape.len()
            )));
        }
        if let Some((i, &label)) = labels.iter().enumerate().find(|&(_, &l)| l >= classes) {
            return Err(Error::InvalidData(format!(
                "label {label} at index {i} out of range for {classes} classes"
            )));
        }
        if images.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidData("image values must be finite".to_owned()));
        }
        Ok(Self {
            images,
            labels,
            shape,
            classes,
        })
    }

    /// Builds a dataset from byte pixels, mapping `0..=255` onto `[0, 1]`.
    pub fn from_bytes(
        images: &[u8],
        labels: Vec<usize>,
        shape: ImageShape,
        classes: usize,
    ) -> Result<Self> {
        let images = images.iter().map(|&b| f32::from(b) / 255.0).collect();
        Self::from_floats(images, labels, shape, classes)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[inline]
    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Values per image; must equal the network's input size.
    #[inline]
    pub fn image_len(&self) -> usize {
        self.shape.len()
    }

    /// Number of classes; must equal the network's output size.
    #[inline]
    pub fn classes(&self) -> usize {
        self.classes
    }

    /// Panics if `idx >= len()`.
    #[inline]
    pub fn image(&self, idx: usize) -> &[f32] {
        let n = self.shape.len();
        &self.images[idx * n..(idx + 1) * n]
    }

    /// Panics if `idx >= len()`.
    #[inline]
    pub fn label(&self, idx: usize) -> usize {
        self.labels[idx]
    }

    pub fn copy_image_into(&self, idx: usize, dst: &mut [f32]) -> Result<()> {
        self.check_index(idx)?;
        check_len("image destination", self.image_len(), dst.len())?;
        dst.copy_from_slice(self.image(idx));
        Ok(())
    }

    /// Writes the one-hot target for example `idx` into `dst`.
    pub fn target_into(&self, idx: usize, dst: &mut [f32]) -> Result<()> {
        self.check_index(idx)?;
        check_len("target destination", self.classes, dst.len())?;
        math::one_hot(self.labels[idx], dst)
    }

    fn check_index(&self, idx: usize) -> Result<()> {
        if idx >= self.len() {
            return Err(Error::InvalidData(format!(
                "example {idx} out of range for {} examples",
                self.len()
            )));
        }
        Ok(())
    }
}

/// Hands out example indices in random minibatches without replacement.
///
/// Once every index has been handed out, the next call reshuffles and starts over;
/// the last batch of a pass may be shorter than requested.
#[derive(Debug, Clone)]
pub struct Shuffler {
    order: Vec<usize>,
    cursor: usize,
}

impl Shuffler {
    pub fn new(len: usize) -> Self {
        Self {
            order: (0..len).collect(),
            cursor: len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Indices not yet handed out in the current pass.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.order.len() - self.cursor
    }

    /// Replaces `out` with the next batch of at most `size` indices.
    pub fn next_batch<R: Rng + ?Sized>(
        &mut self,
        size: usize,
        rng: &mut R,
        out: &mut Vec<usize>,
    ) {
        out.clear();
        if self.order.is_empty() || size == 0 {
            return;
        }
        if self.cursor == self.order.len() {
            self.order.shuffle(rng);
            self.cursor = 0;
            debug!(examples = self.order.len(), "reshuffled");
        }
        let end = (self.cursor + size).min(self.order.len());
        out.extend_from_slice(&self.order[self.cursor..end]);
        self.cursor = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn two_by_two() -> Dataset {
        Dataset::from_bytes(
            &[0, 255, 51, 102, 255, 255, 0, 0],
            vec![1, 0],
            ImageShape::new(2, 2, 1),
            3,
        )
        .unwrap()
    }

    #[test]
    fn bytes_are_normalised() {
        let data = two_by_two();
        assert_eq!(data.len(), 2);
        assert_eq!(data.image(0), &[0.0, 1.0, 0.2, 0.4]);
        assert_eq!(data.label(1), 0);
    }

    #[test]
    fn rejects_inconsistent_buffers() {
        let shape = ImageShape::flat(2);
        assert!(Dataset::from_floats(vec![0.0; 3], vec![0], shape, 2).is_err());
        assert!(Dataset::from_floats(vec![0.0; 2], vec![2], shape, 2).is_err());
        assert!(Dataset::from_floats(vec![0.0; 2], vec![0], shape, 0).is_err());
        assert!(Dataset::from_floats(vec![f32::NAN, 0.0], vec![0], shape, 2).is_err());
    }

    #[test]
    fn copy_and_target() {
        let data = two_by_two();
        let mut img = [9.0; 4];
        data.copy_image_into(1, &mut img).unwrap();
        assert_eq!(img, [1.0, 1.0, 0.0, 0.0]);

        let mut t = [9.0; 3];
        data.target_into(0, &mut t).unwrap();
        assert_eq!(t, [0.0, 1.0, 0.0]);

        assert!(data.copy_image_into(2, &mut img).is_err());
        assert!(data.target_into(0, &mut [0.0; 2]).is_err());
    }

    #[test]
    fn shuffler_covers_every_index_once_per_pass() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut shuffler = Shuffler::new(10);
        let mut batch = Vec::new();

        for _ in 0..3 {
            let mut seen = Vec::new();
            for expected in [4, 4, 2] {
                shuffler.next_batch(4, &mut rng, &mut batch);
                assert_eq!(batch.len(), expected);
                seen.extend_from_slice(&batch);
            }
            assert_eq!(shuffler.remaining(), 0);
            seen.sort_unstable();
            assert_eq!(seen, (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn shuffler_is_seeded() {
        let mut a = Shuffler::new(50);
        let mut b = Shuffler::new(50);
        let (mut ba, mut bb) = (Vec::new(), Vec::new());
        a.next_batch(50, &mut StdRng::seed_from_u64(9), &mut ba);
        b.next_batch(50, &mut StdRng::seed_from_u64(9), &mut bb);
        assert_eq!(ba, bb);
    }
}
