use super::{Dataset, LoadDataset};
use crate::{
    error::DatasetError,
    picture::{BitmapPicture, Picture},
};
use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};
use tracing::info;

/// The kind of Mnist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MnistKind {
    /// [MNIST](<http://yann.lecun.com/exdb/mnist/>)
    Digits,
    /// [FashionMNIST](<https://github.com/zalandoresearch/fashion-mnist>)
    Fashion,
}

/// Mnist builder.
pub mod builders {
    use super::{Mnist, MnistKind};
    use std::path::PathBuf;

    /// Mnist builder.
    #[derive(Debug)]
    pub struct MnistBuilder {
        pub(super) path: PathBuf,
        pub(super) kind: MnistKind,
    }

    impl Default for MnistBuilder {
        fn default() -> Self {
            Self {
                path: PathBuf::from("Data"),
                kind: MnistKind::Digits,
            }
        }
    }

    impl MnistBuilder {
        /// The folder containing the "mnist" or "fashion-mnist" folder. Defaults to "Data".
        pub fn path(self, path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                ..self
            }
        }
        /// The kind of Mnist to use. Defaults to [`MnistKind::Digits`].
        pub fn kind(self, kind: MnistKind) -> Self {
            Self { kind, ..self }
        }
        pub fn build(self) -> Mnist {
            let name = match self.kind {
                MnistKind::Digits => "mnist",
                MnistKind::Fashion => "fashion-mnist",
            };
            Mnist {
                path: self.path.join(name),
                kind: self.kind,
            }
        }
    }
}
use builders::MnistBuilder;

/// Reads the MNIST idx files.
///
/// Each of `train-images-idx3-ubyte`, `train-labels-idx1-ubyte`, `t10k-images-idx3-ubyte` and
/// `t10k-labels-idx1-ubyte` may be gzipped, with a ".gz" extension. Pixels are kept as raw
/// intensities in `0 ..= 255`, the network scales them with its regularizing constants.
#[derive(Clone, Debug)]
pub struct Mnist {
    path: PathBuf,
    kind: MnistKind,
}

impl Mnist {
    /// Returns an [`MnistBuilder`] used to specify options.
    pub fn builder() -> MnistBuilder {
        MnistBuilder::default()
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn kind(&self) -> MnistKind {
        self.kind
    }
    fn open(&self, name: &str) -> Result<Box<dyn Read>> {
        let path = self.path.join(name);
        if path.exists() {
            return Ok(Box::new(BufReader::new(File::open(path)?)));
        }
        let gz_path = path.with_extension("gz");
        if gz_path.exists() {
            return Ok(Box::new(GzDecoder::new(BufReader::new(File::open(gz_path)?))));
        }
        Err(DatasetError::Format(format!("cannot find {path:?}")).into())
    }
    fn load_split(&self, images: &str, labels: &str) -> Result<Vec<Picture>> {
        let bitmaps = read_images(self.open(images)?)?;
        let labels = read_labels(self.open(labels)?)?;
        if bitmaps.len() != labels.len() {
            return Err(DatasetError::Format(format!(
                "{images} has {} images but {labels} has {} labels",
                bitmaps.len(),
                labels.len()
            ))
            .into());
        }
        Ok(bitmaps
            .into_iter()
            .zip(labels)
            .map(|(bitmap, label)| Picture::new(Some(label as usize), bitmap))
            .collect())
    }
}

impl LoadDataset for Mnist {
    fn load(&self) -> Result<Dataset> {
        let train = self.load_split("train-images-idx3-ubyte", "train-labels-idx1-ubyte")?;
        let test = self.load_split("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte")?;
        info!(
            "Loaded {:?} from {:?}: {} training, {} test pictures.",
            self.kind,
            self.path,
            train.len(),
            test.len()
        );
        Ok(Dataset::new(train, test))
    }
}

const IMAGES_MAGIC: i32 = 2_051;
const LABELS_MAGIC: i32 = 2_049;

fn read_header(reader: &mut impl Read, magic: i32) -> Result<usize> {
    let found = reader.read_i32::<BigEndian>()?;
    if found != magic {
        return Err(DatasetError::Format(format!("expected magic {magic}, found {found}")).into());
    }
    Ok(reader.read_i32::<BigEndian>()?.max(0) as usize)
}

fn read_images(mut reader: impl Read) -> Result<Vec<BitmapPicture>> {
    let n = read_header(&mut reader, IMAGES_MAGIC)?;
    let rows = reader.read_i32::<BigEndian>()?.max(0) as usize;
    let columns = reader.read_i32::<BigEndian>()?.max(0) as usize;
    let mut pixels = vec![0u8; rows * columns];
    let mut images = Vec::with_capacity(n);
    for _ in 0..n {
        reader.read_exact(&mut pixels)?;
        let bitmap = pixels.iter().map(|&x| x as f32).collect();
        images.push(BitmapPicture::new(columns, rows, bitmap));
    }
    Ok(images)
}

fn read_labels(mut reader: impl Read) -> Result<Vec<u8>> {
    let n = read_header(&mut reader, LABELS_MAGIC)?;
    let mut labels = vec![0u8; n];
    reader.read_exact(&mut labels)?;
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use flate2::{write::GzEncoder, Compression};
    use std::{fs, io::Write};

    fn images(n: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        for x in [IMAGES_MAGIC, n as i32, 2, 2] {
            bytes.write_i32::<BigEndian>(x).unwrap();
        }
        for i in 0..n {
            bytes.extend([0, i as u8, 255, 0]);
        }
        bytes
    }

    fn labels(n: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        for x in [LABELS_MAGIC, n as i32] {
            bytes.write_i32::<BigEndian>(x).unwrap();
        }
        bytes.extend((0..n).map(|i| (i % 10) as u8));
        bytes
    }

    #[test]
    fn load_plain_and_gzipped() {
        let dir = tempfile::tempdir().unwrap();
        let mnist = Mnist::builder().path(dir.path()).build();
        fs::create_dir_all(mnist.path()).unwrap();
        fs::write(mnist.path().join("train-images-idx3-ubyte"), images(3)).unwrap();
        fs::write(mnist.path().join("train-labels-idx1-ubyte"), labels(3)).unwrap();
        for (name, bytes) in [
            ("t10k-images-idx3-ubyte.gz", images(2)),
            ("t10k-labels-idx1-ubyte.gz", labels(2)),
        ] {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&bytes).unwrap();
            fs::write(mnist.path().join(name), encoder.finish().unwrap()).unwrap();
        }
        let dataset = mnist.load().unwrap();
        assert_eq!(dataset.train().len(), 3);
        assert_eq!(dataset.test().len(), 2);
        assert_eq!(dataset.train()[2].label(), Some(2));
        let crate::picture::Encoding::Bitmap(bitmap) = dataset.train()[1].encoding() else {
            panic!("expected a bitmap");
        };
        assert_eq!(bitmap.bitmap(), &[0., 1., 255., 0.]);
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let mut bytes = labels(1);
        bytes[3] = 0;
        let error = read_labels(bytes.as_slice()).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<DatasetError>(),
            Some(DatasetError::Format(_))
        ));
    }
}
