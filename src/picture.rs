use crate::{
    batch::{BatchKind, SparseBatch},
    rng::Rng,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::info;

/// Per channel scale applied to every codified feature.
///
/// Each constant is the largest absolute value seen for that channel over a sample of training
/// vectors. Persisted only as the tail of a weight checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegularizingConstants(Vec<f32>);

impl RegularizingConstants {
    /// Unit constants, ie features are left unscaled.
    pub fn ones(feature_width: usize) -> Self {
        Self(vec![1.; feature_width])
    }
    pub fn from_vec(constants: Vec<f32>) -> Self {
        Self(constants)
    }
    /// Estimates the constants from `samples` pictures drawn from `pictures`.
    ///
    /// A channel that is always zero keeps a constant of 1.
    ///
    /// **Errors**
    ///
    /// If `pictures` is empty.
    pub fn estimate(
        pictures: &[Picture],
        grid_side: usize,
        feature_width: usize,
        samples: usize,
        rng: &mut Rng,
    ) -> Result<Self> {
        info!(
            "Using {} training samples to calculate regularizing constants.",
            pictures.len()
        );
        let encoding = InputEncoding::new(grid_side, Self::ones(feature_width));
        let mut batch = SparseBatch::new(BatchKind::Train, grid_side, feature_width);
        for _ in 0..samples {
            let index = rng.index(pictures)?;
            pictures[index].codify(&mut batch, &encoding);
        }
        let mut constants = vec![0f32; feature_width];
        for vector in batch.features().chunks_exact(feature_width) {
            for (c, x) in constants.iter_mut().zip(vector) {
                *c = c.max(x.abs());
            }
        }
        for c in constants.iter_mut() {
            if *c == 0. {
                *c = 1.;
            }
        }
        info!("Regularizing constants: {constants:?}");
        Ok(Self(constants))
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// The input side of a network: grid size and feature scaling.
#[derive(Clone, Debug, PartialEq)]
pub struct InputEncoding {
    grid_side: usize,
    constants: RegularizingConstants,
}

impl InputEncoding {
    pub fn new(grid_side: usize, constants: RegularizingConstants) -> Self {
        Self {
            grid_side,
            constants,
        }
    }
    pub fn grid_side(&self) -> usize {
        self.grid_side
    }
    pub fn feature_width(&self) -> usize {
        self.constants.len()
    }
    pub fn constants(&self) -> &RegularizingConstants {
        &self.constants
    }
    /// An empty batch of `kind` for this encoding.
    pub fn batch(&self, kind: BatchKind) -> SparseBatch {
        SparseBatch::new(kind, self.grid_side, self.feature_width())
    }
    /// Maps coordinates centred on the grid to a cell, if inside.
    fn cell(&self, x: i64, y: i64) -> Option<usize> {
        let half = (self.grid_side / 2) as i64;
        let side = self.grid_side as i64;
        let (row, col) = (x + half, y + half);
        if (0..side).contains(&row) && (0..side).contains(&col) {
            Some((row * side + col) as usize)
        } else {
            None
        }
    }
}

/// Random perturbation applied to training pictures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Distortion {
    #[default]
    Identity,
    /// Translates by a uniform integer offset in `-radius ..= radius` on each axis.
    Jiggle { radius: i32 },
}

/// A dense multi channel bitmap, `[channel, y, x]` row major.
#[derive(Clone, Debug, PartialEq)]
pub struct BitmapPicture {
    width: usize,
    height: usize,
    x_offset: i32,
    y_offset: i32,
    bitmap: Vec<f32>,
}

impl BitmapPicture {
    /// Creates a bitmap centred on the grid.
    ///
    /// The number of channels is `bitmap.len() / (width * height)`.
    pub fn new(width: usize, height: usize, bitmap: Vec<f32>) -> Self {
        debug_assert_eq!(bitmap.len() % (width * height).max(1), 0);
        Self {
            width,
            height,
            x_offset: -(width as i32) / 2,
            y_offset: -(height as i32) / 2,
            bitmap,
        }
    }
    pub fn bitmap(&self) -> &[f32] {
        &self.bitmap
    }
    pub fn channels(&self) -> usize {
        self.bitmap.len() / (self.width * self.height).max(1)
    }
    fn translate(&mut self, dx: i32, dy: i32) {
        self.x_offset += dx;
        self.y_offset += dy;
    }
    fn codify(&self, batch: &mut SparseBatch, encoding: &InputEncoding, label: Option<usize>) {
        let plane = self.width * self.height;
        // channels beyond the bitmap stay 0
        let channels = self.channels().min(encoding.feature_width());
        let constants = &encoding.constants.as_slice()[..channels];
        batch.push_sample(label, |writer| {
            for x in 0..self.width {
                for y in 0..self.height {
                    let cell = encoding.cell(
                        x as i64 + self.x_offset as i64,
                        y as i64 + self.y_offset as i64,
                    );
                    let Some(cell) = cell else { continue };
                    let pixel = x + y * self.width;
                    let ink = constants
                        .iter()
                        .enumerate()
                        .any(|(i, c)| self.bitmap[pixel + i * plane].abs() > 0.005 * c);
                    if ink {
                        writer.write(
                            cell,
                            constants
                                .iter()
                                .enumerate()
                                .map(|(i, c)| self.bitmap[pixel + i * plane] / c),
                        );
                    }
                }
            }
        });
    }
}

/// One ink point of a [`PointPicture`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pixel {
    pub x: i32,
    pub y: i32,
    pub values: Vec<f32>,
}

/// A list of ink points with coordinates centred on the grid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointPicture {
    pixels: Vec<Pixel>,
}

impl PointPicture {
    pub fn new(pixels: Vec<Pixel>) -> Self {
        Self { pixels }
    }
    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }
    fn translate(&mut self, dx: i32, dy: i32) {
        for pixel in self.pixels.iter_mut() {
            pixel.x += dx;
            pixel.y += dy;
        }
    }
    fn codify(&self, batch: &mut SparseBatch, encoding: &InputEncoding, label: Option<usize>) {
        let constants = encoding.constants.as_slice();
        batch.push_sample(label, |writer| {
            for pixel in self.pixels.iter() {
                if let Some(cell) = encoding.cell(pixel.x as i64, pixel.y as i64) {
                    writer.write(
                        cell,
                        pixel.values.iter().zip(constants).map(|(x, c)| x / c),
                    );
                }
            }
        });
    }
}

/// Online handwriting: pen strokes as polylines, in grid units centred on the grid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StrokePicture {
    strokes: Vec<Vec<[f32; 2]>>,
}

impl StrokePicture {
    pub fn new(strokes: Vec<Vec<[f32; 2]>>) -> Self {
        Self { strokes }
    }
    /// Centres the strokes and scales them so that the longer side of their bounding box
    /// is `extent`.
    pub fn normalized(strokes: Vec<Vec<[f32; 2]>>, extent: f32) -> Self {
        let points = || strokes.iter().flatten();
        let (mut min, mut max) = ([f32::MAX; 2], [f32::MIN; 2]);
        for p in points() {
            for k in 0..2 {
                min[k] = min[k].min(p[k]);
                max[k] = max[k].max(p[k]);
            }
        }
        if min[0] > max[0] {
            return Self::new(strokes);
        }
        let span = (max[0] - min[0]).max(max[1] - min[1]);
        let scale = if span > 0. { extent / span } else { 1. };
        let centre = [(min[0] + max[0]) / 2., (min[1] + max[1]) / 2.];
        let strokes = strokes
            .iter()
            .map(|stroke| {
                stroke
                    .iter()
                    .map(|p| [(p[0] - centre[0]) * scale, (p[1] - centre[1]) * scale])
                    .collect()
            })
            .collect();
        Self::new(strokes)
    }
    pub fn strokes(&self) -> &[Vec<[f32; 2]>] {
        &self.strokes
    }
    fn translate(&mut self, dx: i32, dy: i32) {
        for p in self.strokes.iter_mut().flatten() {
            p[0] += dx as f32;
            p[1] += dy as f32;
        }
    }
    /// Channel 0 is ink, channels 1 and 2 (when present) accumulate the unit pen direction.
    fn codify(&self, batch: &mut SparseBatch, encoding: &InputEncoding, label: Option<usize>) {
        let constants = encoding.constants.as_slice();
        let cell_of = |p: [f32; 2]| encoding.cell(p[0].floor() as i64, p[1].floor() as i64);
        batch.push_sample(label, |writer| {
            let mut mark = |cell: usize, direction: [f32; 2]| {
                let vector = writer.vector_mut(cell);
                if let Some(ink) = vector.first_mut() {
                    *ink = 1. / constants[0];
                }
                for (k, x) in vector.iter_mut().enumerate().skip(1).take(2) {
                    *x += direction[k - 1] / constants[k];
                }
            };
            for stroke in self.strokes.iter() {
                if let [p] = stroke.as_slice() {
                    if let Some(cell) = cell_of(*p) {
                        mark(cell, [0., 0.]);
                    }
                }
                for segment in stroke.windows(2) {
                    let (p, q) = (segment[0], segment[1]);
                    let delta = [q[0] - p[0], q[1] - p[1]];
                    let length = (delta[0] * delta[0] + delta[1] * delta[1]).sqrt();
                    let direction = if length > 0. {
                        [delta[0] / length, delta[1] / length]
                    } else {
                        [0., 0.]
                    };
                    let steps = ((2. * length).ceil() as usize).max(1);
                    let mut previous = None;
                    for t in 0..=steps {
                        let s = t as f32 / steps as f32;
                        let cell = cell_of([p[0] + s * delta[0], p[1] + s * delta[1]]);
                        if let Some(c) = cell.filter(|_| cell != previous) {
                            mark(c, direction);
                        }
                        previous = cell;
                    }
                }
            }
        });
    }
}

/// The supported input encodings.
#[derive(Clone, Debug, PartialEq)]
pub enum Encoding {
    /// Offline, dense bitmap.
    Bitmap(BitmapPicture),
    /// Offline, sparse list of ink points.
    Points(PointPicture),
    /// Online, pen strokes.
    Strokes(StrokePicture),
}

/// A labelled sample that can codify itself into a [`SparseBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct Picture {
    label: Option<usize>,
    encoding: Encoding,
}

impl Picture {
    pub fn new(label: Option<usize>, encoding: impl Into<Encoding>) -> Self {
        Self {
            label,
            encoding: encoding.into(),
        }
    }
    /// The class, if known.
    pub fn label(&self) -> Option<usize> {
        self.label
    }
    pub fn set_label(&mut self, label: Option<usize>) {
        self.label = label;
    }
    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }
    /// Appends this picture as one sample of `batch`.
    pub fn codify(&self, batch: &mut SparseBatch, encoding: &InputEncoding) {
        match &self.encoding {
            Encoding::Bitmap(x) => x.codify(batch, encoding, self.label),
            Encoding::Points(x) => x.codify(batch, encoding, self.label),
            Encoding::Strokes(x) => x.codify(batch, encoding, self.label),
        }
    }
    /// A randomly perturbed picture.
    ///
    /// [`Distortion::Identity`] borrows `self`.
    pub fn distort(&self, distortion: &Distortion, rng: &mut Rng) -> Cow<Self> {
        match *distortion {
            Distortion::Identity => Cow::Borrowed(self),
            Distortion::Jiggle { radius } => {
                let span = (2 * radius.max(0) + 1) as usize;
                let dx = rng.randint(span) as i32 - radius.max(0);
                let dy = rng.randint(span) as i32 - radius.max(0);
                let mut picture = self.clone();
                match &mut picture.encoding {
                    Encoding::Bitmap(x) => x.translate(dx, dy),
                    Encoding::Points(x) => x.translate(dx, dy),
                    Encoding::Strokes(x) => x.translate(dx, dy),
                }
                Cow::Owned(picture)
            }
        }
    }
}

impl From<BitmapPicture> for Encoding {
    fn from(picture: BitmapPicture) -> Self {
        Self::Bitmap(picture)
    }
}

impl From<PointPicture> for Encoding {
    fn from(picture: PointPicture) -> Self {
        Self::Points(picture)
    }
}

impl From<StrokePicture> for Encoding {
    fn from(picture: StrokePicture) -> Self {
        Self::Strokes(picture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(grid_side: usize, width: usize) -> InputEncoding {
        InputEncoding::new(grid_side, RegularizingConstants::ones(width))
    }

    #[test]
    fn bitmap_skips_faint_pixels() {
        let mut bitmap = vec![0.; 16];
        bitmap[5] = 1.;
        bitmap[6] = 0.001;
        let picture = Picture::new(Some(2), BitmapPicture::new(4, 4, bitmap));
        let encoding = unit(6, 1);
        let mut batch = encoding.batch(BatchKind::Train);
        picture.codify(&mut batch, &encoding);
        assert_eq!(batch.vector_count(), 2);
        assert_eq!(batch.distinct_grid_values(0), 2);
        // x = 1, y = 1 shifted by the offset -2 and the half side 3
        assert_eq!(batch.grids()[0][2 * 6 + 2], 1);
        assert_eq!(batch.labels(), &[Some(2)]);
    }

    #[test]
    fn bitmap_features_are_regularized() {
        let picture = Picture::new(None, BitmapPicture::new(1, 1, vec![3., -8.]));
        let encoding = InputEncoding::new(4, RegularizingConstants::from_vec(vec![2., 4.]));
        let mut batch = encoding.batch(BatchKind::Unlabelled);
        picture.codify(&mut batch, &encoding);
        assert_eq!(&batch.features()[2..], &[1.5, -2.]);
    }

    #[test]
    fn bitmap_missing_channels_are_zero() {
        let picture = Picture::new(Some(1), BitmapPicture::new(1, 1, vec![2., 4.]));
        let encoding = InputEncoding::new(4, RegularizingConstants::from_vec(vec![2., 4., 8.]));
        let mut batch = encoding.batch(BatchKind::Train);
        picture.codify(&mut batch, &encoding);
        assert_eq!(batch.vector_count(), 2);
        assert_eq!(&batch.features()[3..], &[1., 1., 0.]);
        let constants =
            RegularizingConstants::estimate(&[picture], 4, 3, 5, &mut Rng::from_seed(0)).unwrap();
        assert_eq!(constants.as_slice(), &[2., 4., 1.]);
    }

    #[test]
    fn points_outside_grid_are_dropped() {
        let pixels = vec![
            Pixel {
                x: 0,
                y: 0,
                values: vec![1.],
            },
            Pixel {
                x: 10,
                y: 0,
                values: vec![1.],
            },
        ];
        let picture = Picture::new(Some(0), PointPicture::new(pixels));
        let encoding = unit(4, 1);
        let mut batch = encoding.batch(BatchKind::Train);
        picture.codify(&mut batch, &encoding);
        assert_eq!(batch.vector_count(), 2);
        assert_eq!(batch.grids()[0][2 * 4 + 2], 1);
    }

    #[test]
    fn strokes_mark_each_cell_once() {
        let picture = Picture::new(
            Some(1),
            StrokePicture::new(vec![vec![[-2.5, 0.5], [1.5, 0.5]]]),
        );
        let encoding = unit(8, 3);
        let mut batch = encoding.batch(BatchKind::Train);
        picture.codify(&mut batch, &encoding);
        // rows -3 ..= 1, one column
        assert_eq!(batch.vector_count(), 1 + 5);
        assert_eq!(batch.distinct_grid_values(0), 6);
        for vector in batch.features().chunks_exact(3).skip(1) {
            assert_eq!(vector[0], 1.);
            assert!(vector[1] > 0.);
        }
    }

    #[test]
    fn jiggle_translates_a_copy() {
        let picture = Picture::new(Some(0), BitmapPicture::new(2, 2, vec![1.; 4]));
        let mut rng = Rng::from_seed(5);
        assert!(matches!(
            picture.distort(&Distortion::Identity, &mut rng),
            Cow::Borrowed(_)
        ));
        let jiggled = picture.distort(&Distortion::Jiggle { radius: 2 }, &mut rng);
        assert!(matches!(jiggled, Cow::Owned(_)));
        assert_eq!(jiggled.label(), Some(0));
    }

    #[test]
    fn constants_are_channel_maxima() {
        let pictures = vec![
            Picture::new(Some(0), BitmapPicture::new(1, 1, vec![2., -5., 0.])),
            Picture::new(Some(1), BitmapPicture::new(1, 1, vec![-3., 1., 0.])),
        ];
        let mut rng = Rng::from_seed(0);
        let constants = RegularizingConstants::estimate(&pictures, 4, 3, 50, &mut rng).unwrap();
        assert_eq!(constants.as_slice(), &[3., 5., 1.]);
    }
}
