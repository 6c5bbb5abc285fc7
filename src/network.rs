use crate::{
    batch::{BatchKind, SparseBatch},
    engine::{LayerEngine, LayerPass},
    error::{CheckpointError, ConfigError},
    gemm::Gemm,
    layer::{Activation, ConvolutionalLayer, LayerGeometry, LayerSpec},
    optimizer::{LayerGradients, Sgd},
    picture::{InputEncoding, Picture, RegularizingConstants},
    rng::{Rng, SeedSequence},
    rules::{LayerRules, SparseGrids},
};
use anyhow::{bail, ensure, Result};
use ndarray::{Array2, ArrayView1};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// The number of guesses reported per unlabelled sample.
const TOP_GUESSES: usize = 10;

/// Network presets.
///
/// The DeepCNet family requires an input side of `3 · 2^l`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// `l` pooling layers of `k, 2k, ..` filters, then a softmax classifier.
    DeepCNet { l: usize, k: usize },
    /// [`DeepCNet`](Self::DeepCNet) with an additional fully connected tanh layer.
    DeepDeepCNet { l: usize, k: usize },
    /// [`DeepCNet`](Self::DeepCNet) with `k` filters in every layer.
    FlatDeepCNet { l: usize, k: usize },
    /// For 28 or 32 pixel inputs.
    LeNet5 { multiplier: usize },
    /// For 96 pixel inputs.
    LeNet7 { multiplier: usize },
}

impl Architecture {
    /// The input side required by the preset, if any.
    pub fn input_side(&self) -> Option<usize> {
        match *self {
            Self::DeepCNet { l, .. } | Self::DeepDeepCNet { l, .. } | Self::FlatDeepCNet { l, .. } => {
                Some(3 << l)
            }
            Self::LeNet5 { .. } | Self::LeNet7 { .. } => None,
        }
    }
    /// The number of layers.
    pub fn depth(&self) -> usize {
        match *self {
            Self::DeepCNet { l, .. } | Self::FlatDeepCNet { l, .. } => l + 2,
            Self::DeepDeepCNet { l, .. } => l + 3,
            Self::LeNet5 { .. } => 4,
            Self::LeNet7 { .. } => 5,
        }
    }
    /// The layers of the preset for `classes` outputs.
    ///
    /// `dropout` and `maxout` are per layer, empty for none.
    ///
    /// **Errors**
    ///
    /// - [`ConfigError::InputSideMismatch`] if `input_side` is not the side of the preset.
    /// - [`ConfigError::DepthMismatch`] if `dropout` or `maxout` are not empty and do not have
    ///   [`.depth()`](Self::depth) values.
    pub fn layers(
        &self,
        input_side: usize,
        classes: usize,
        dropout: &[f32],
        maxout: &[usize],
    ) -> Result<Vec<LayerSpec>, ConfigError> {
        if let Some(expected) = self.input_side() {
            if expected != input_side {
                return Err(ConfigError::InputSideMismatch {
                    expected,
                    found: input_side,
                });
            }
        }
        let depth = self.depth();
        for (what, found) in [("dropout", dropout.len()), ("maxout", maxout.len())] {
            if found != 0 && found != depth {
                return Err(ConfigError::DepthMismatch {
                    what,
                    expected: depth,
                    found,
                });
            }
        }
        use Activation::{RectifiedLinear, Softmax, Tanh};
        let mut layers = Vec::with_capacity(depth);
        match *self {
            Self::DeepCNet { l, k } | Self::DeepDeepCNet { l, k } | Self::FlatDeepCNet { l, k } => {
                let flat = matches!(self, Self::FlatDeepCNet { .. });
                let width = |i: usize| if flat { k } else { i * k };
                layers.push(LayerSpec::new(3, 2, k, RectifiedLinear));
                for i in 2..=l {
                    layers.push(LayerSpec::new(2, 2, width(i), RectifiedLinear));
                }
                if let Self::DeepDeepCNet { .. } = self {
                    layers.push(LayerSpec::new(2, 1, (l + 1) * k, Tanh));
                    layers.push(LayerSpec::new(1, 1, (l + 2) * k, Tanh));
                } else {
                    layers.push(LayerSpec::new(2, 1, width(l + 1), RectifiedLinear));
                }
            }
            Self::LeNet5 { multiplier: m } => {
                let first = LayerGeometry::for_layer(0, input_side, 5, 2)?;
                let second = LayerGeometry::for_layer(1, first.output_side, 5, 2)?;
                layers.push(LayerSpec::new(5, 2, 2 * m, RectifiedLinear));
                layers.push(LayerSpec::new(5, 2, 5 * m, RectifiedLinear));
                layers.push(LayerSpec::new(second.output_side, 1, 50 * m, Tanh));
            }
            Self::LeNet7 { multiplier: m } => {
                layers.push(LayerSpec::new(5, 4, m, RectifiedLinear));
                layers.push(LayerSpec::new(6, 3, 3 * m, RectifiedLinear));
                layers.push(LayerSpec::new(6, 1, 12 * m, Tanh));
                layers.push(LayerSpec::new(1, 1, 60 * m, Tanh));
            }
        }
        layers.push(LayerSpec::new(1, 1, classes, Softmax));
        for (i, layer) in layers.iter_mut().enumerate() {
            if let Some(p) = dropout.get(i) {
                layer.dropout = *p;
            }
            if let Some(k) = maxout.get(i) {
                layer.maxout = *k;
            }
        }
        Ok(layers)
    }
}

/// Where and how often weights are saved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoints {
    pub dir: PathBuf,
    pub name: String,
    /// Saves after every `interval` training batches, 0 to disable.
    pub interval: usize,
}

impl Checkpoints {
    /// `<dir>/<name>_epoch-<epoch>.cnn`
    pub fn path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}_epoch-{epoch}.cnn", self.name))
    }
}

/// Builder for creating a [`Network`].
pub struct NetworkBuilder {
    input_side: usize,
    feature_width: usize,
    layers: Vec<LayerSpec>,
    sgd: Option<Sgd>,
    threads: usize,
    seed: u64,
    checkpoints: Option<Checkpoints>,
}

impl NetworkBuilder {
    /// Appends a layer.
    pub fn layer(mut self, layer: LayerSpec) -> Self {
        self.layers.push(layer);
        self
    }
    /// Appends layers, see [`Architecture::layers()`].
    pub fn layers(mut self, layers: impl IntoIterator<Item = LayerSpec>) -> Self {
        self.layers.extend(layers);
        self
    }
    /// The optimizer. Default is [`Sgd::builder()`].
    pub fn sgd(self, sgd: Sgd) -> Self {
        Self {
            sgd: Some(sgd),
            ..self
        }
    }
    /// GEMM threads, 0 for one per core. Default is 0.
    pub fn threads(self, threads: usize) -> Self {
        Self { threads, ..self }
    }
    /// Seed of the weight initialization and of the dropout masks. Default is 0.
    pub fn seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }
    /// Saves weights while training.
    pub fn checkpoints(self, checkpoints: Checkpoints) -> Self {
        Self {
            checkpoints: Some(checkpoints),
            ..self
        }
    }
    /// Builds the network and logs its layers.
    ///
    /// **Errors**
    ///
    /// See [`ConfigError`].
    pub fn build(self) -> Result<Network> {
        let Self {
            input_side,
            feature_width,
            layers,
            sgd,
            threads,
            seed,
            checkpoints,
        } = self;
        if layers.is_empty() {
            return Err(ConfigError::NoLayers.into());
        }
        let sgd = match sgd {
            Some(sgd) => sgd,
            None => Sgd::builder().build()?,
        };
        let gemm = Gemm::new(threads)?;
        let seeds = SeedSequence::new(seed);
        let mut rng = seeds.rng();
        let mut engines = Vec::with_capacity(layers.len());
        let (mut side, mut inputs) = (input_side, feature_width);
        info!("size0\t#in\tdropout\tfilter\tsize1\tmaxout\tpool\tsize2\t#out\tfunction");
        for (index, spec) in layers.iter().enumerate() {
            let last = index + 1 == layers.len();
            if !(0. ..1.).contains(&spec.dropout) {
                return Err(ConfigError::InvalidRate {
                    what: "dropout",
                    value: spec.dropout,
                }
                .into());
            }
            if spec.effective_activation() == Activation::Softmax && !last {
                return Err(ConfigError::SoftmaxNotLast { layer: index }.into());
            }
            let geometry =
                LayerGeometry::for_layer(index, side, spec.filter_size, spec.pool_size)?;
            let layer = ConvolutionalLayer::new(geometry, inputs, *spec, &mut rng);
            info!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                geometry.input_side,
                inputs,
                spec.dropout,
                geometry.filter_size,
                geometry.conv_side,
                layer.maxout(),
                geometry.pool_size,
                geometry.output_side,
                spec.outputs,
                layer.activation(),
            );
            side = geometry.output_side;
            inputs = spec.outputs;
            engines.push(LayerEngine::new(index, layer, gemm.clone()));
        }
        if side != 1 {
            return Err(ConfigError::FinalSpatialSize { side }.into());
        }
        if layers.last().map(LayerSpec::effective_activation) != Some(Activation::Softmax) {
            return Err(ConfigError::FinalNotSoftmax.into());
        }
        Ok(Network {
            encoding: InputEncoding::new(input_side, RegularizingConstants::ones(feature_width)),
            engines,
            sgd,
            update: Mutex::new(UpdateState {
                batches_completed: 0,
            }),
            seeds,
            checkpoints,
        })
    }
}

/// The steps of [`Network::process_batch()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchState {
    Idle,
    RulesBuilt,
    DataStaged,
    ForwardDone,
    BackwardDone,
    Updated,
    Cleaned,
}

/// Per batch rules and buffers, dropped at [`BatchState::Cleaned`].
struct BatchArena<'a> {
    state: BatchState,
    batch: &'a SparseBatch,
    rules: Vec<LayerRules>,
    input: Array2<f32>,
    passes: Vec<LayerPass>,
    gradients: Vec<LayerGradients>,
}

impl<'a> BatchArena<'a> {
    fn new(batch: &'a SparseBatch) -> Self {
        Self {
            state: BatchState::Idle,
            batch,
            rules: Vec::new(),
            input: Array2::zeros([0, 0]),
            passes: Vec::new(),
            gradients: Vec::new(),
        }
    }
    fn advance(&mut self, state: BatchState) {
        debug_assert!(state > self.state, "{:?} -> {state:?}", self.state);
        self.state = state;
    }
    /// The sample of each vector input to layer `l`.
    fn input_owners(&self, l: usize) -> &[usize] {
        match l.checked_sub(1) {
            Some(previous) => self.rules[previous].output.owner_of_vector(),
            None => self.batch.owner_of_vector(),
        }
    }
    /// The top layer vector of each sample.
    fn top_vectors(&self) -> Vec<usize> {
        self.rules
            .last()
            .map(|rules| rules.output.grids().iter().map(|grid| grid[0]).collect())
            .unwrap_or_default()
    }
    fn top_output(&self) -> Option<&Array2<f32>> {
        self.passes.last().map(LayerPass::output)
    }
}

#[derive(Debug)]
struct UpdateState {
    batches_completed: usize,
}

/// The result of [`Network::process_batch()`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub samples: usize,
    /// Labelled samples whose most likely class is not the label.
    pub mistakes: usize,
    /// The most likely class of each sample.
    pub predictions: Vec<usize>,
    /// Up to 10 classes per sample, most likely first. Only for unlabelled batches.
    pub top_guesses: Vec<Vec<usize>>,
}

/// A sparse convolutional network.
///
/// Shared between threads by reference: passes take read locks on the layers, weight updates are
/// serialized by an internal mutex.
#[derive(Debug)]
pub struct Network {
    encoding: InputEncoding,
    engines: Vec<LayerEngine>,
    sgd: Sgd,
    update: Mutex<UpdateState>,
    seeds: SeedSequence,
    checkpoints: Option<Checkpoints>,
}

impl Network {
    /// A builder for a network with inputs of `input_side` and `feature_width` channels.
    pub fn builder(input_side: usize, feature_width: usize) -> NetworkBuilder {
        NetworkBuilder {
            input_side,
            feature_width,
            layers: Vec::new(),
            sgd: None,
            threads: 0,
            seed: 0,
            checkpoints: None,
        }
    }
    pub fn input_side(&self) -> usize {
        self.encoding.grid_side()
    }
    pub fn feature_width(&self) -> usize {
        self.encoding.feature_width()
    }
    /// The grid and regularizing constants used to codify pictures for this network.
    pub fn encoding(&self) -> &InputEncoding {
        &self.encoding
    }
    pub fn set_constants(&mut self, constants: RegularizingConstants) -> Result<()> {
        ensure!(
            constants.len() == self.feature_width(),
            "expected {} regularizing constants, found {}",
            self.feature_width(),
            constants.len()
        );
        self.encoding = InputEncoding::new(self.input_side(), constants);
        Ok(())
    }
    pub fn layers(&self) -> &[LayerEngine] {
        &self.engines
    }
    /// The number of output classes.
    pub fn classes(&self) -> usize {
        self.engines
            .last()
            .map_or(0, |engine| engine.layer().outputs())
    }
    pub fn sgd(&self) -> &Sgd {
        &self.sgd
    }
    pub fn checkpoints(&self) -> Option<&Checkpoints> {
        self.checkpoints.as_ref()
    }
    /// The number of training batches applied, including those of a loaded checkpoint.
    pub fn batches_completed(&self) -> usize {
        self.update.lock().batches_completed
    }
    /// Prepares the network for training from `start_epoch`.
    ///
    /// If `start_epoch` is 0, the regularizing constants are estimated from `regularizing_samples`
    /// random training pictures. Otherwise the checkpoint of that epoch is loaded.
    ///
    /// **Errors**
    ///
    /// - [`CheckpointError::Missing`] if the checkpoint does not exist.
    /// - If the checkpoint has the wrong size.
    /// - If `train` is empty and constants must be estimated.
    pub fn initialize(
        &mut self,
        train: &[Picture],
        start_epoch: usize,
        regularizing_samples: usize,
    ) -> Result<()> {
        if start_epoch > 0 {
            let Some(checkpoints) = self.checkpoints.as_ref() else {
                bail!("cannot resume from epoch {start_epoch} without a checkpoint directory");
            };
            let path = checkpoints.path(start_epoch);
            self.load_checkpoint(&path)?;
            self.update.lock().batches_completed = start_epoch;
        } else {
            info!("Initialized network parameters using the uniform distribution.");
            let constants = RegularizingConstants::estimate(
                train,
                self.input_side(),
                self.feature_width(),
                regularizing_samples,
                &mut self.seeds.rng(),
            )?;
            self.set_constants(constants)?;
        }
        Ok(())
    }
    fn checkpoint_len(&self) -> usize {
        self.engines
            .iter()
            .map(|engine| engine.layer().byte_len())
            .sum::<usize>()
            + self.feature_width() * std::mem::size_of::<f32>()
    }
    /// Writes the weights and biases of every layer followed by the regularizing constants.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut bytes = Vec::with_capacity(self.checkpoint_len());
        for engine in self.engines.iter() {
            engine.layer().write_bytes(&mut bytes);
        }
        bytes.extend_from_slice(bytemuck::cast_slice(self.encoding.constants().as_slice()));
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, bytes)?;
        info!("Saved network parameters to {path:?}");
        Ok(())
    }
    /// Reads a checkpoint written by [`.save_checkpoint()`](Self::save_checkpoint).
    ///
    /// **Errors**
    ///
    /// - [`CheckpointError::Missing`] if `path` does not exist.
    /// - [`CheckpointError::ShapeMismatch`] if the size does not match the layers.
    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CheckpointError::Missing {
                path: path.to_owned(),
            }
            .into());
        }
        info!("Loading network parameters from {path:?}");
        let bytes = fs::read(path)?;
        let expected = self.checkpoint_len();
        if bytes.len() != expected {
            return Err(CheckpointError::ShapeMismatch {
                expected,
                found: bytes.len(),
            }
            .into());
        }
        let mut offset = 0;
        for engine in self.engines.iter() {
            let mut layer = engine.layer_mut();
            let len = layer.byte_len();
            layer.read_bytes(&bytes[offset..offset + len])?;
            offset += len;
        }
        let constants = bytes[offset..]
            .chunks_exact(std::mem::size_of::<f32>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        self.set_constants(RegularizingConstants::from_vec(constants))?;
        Ok(())
    }
    fn build_rules<'a>(&self, batch: &'a SparseBatch) -> Result<BatchArena<'a>> {
        ensure!(
            batch.grid_side() == self.input_side() && batch.feature_width() == self.feature_width(),
            "batch of side {} with {} features does not match network of side {} with {} features",
            batch.grid_side(),
            batch.feature_width(),
            self.input_side(),
            self.feature_width(),
        );
        let mut arena = BatchArena::new(batch);
        let input = SparseGrids::from_batch(batch);
        for engine in self.engines.iter() {
            let rules = LayerRules::new(
                engine.geometry(),
                arena.rules.last().map_or(&input, |rules| &rules.output),
            );
            arena.rules.push(rules);
        }
        arena.advance(BatchState::RulesBuilt);
        Ok(arena)
    }
    fn stage(&self, arena: &mut BatchArena) -> Result<()> {
        let batch = arena.batch;
        arena.input = Array2::from_shape_vec(
            [batch.vector_count(), batch.feature_width()],
            batch.features().to_vec(),
        )?;
        arena.advance(BatchState::DataStaged);
        Ok(())
    }
    fn forward_arena(&self, arena: &mut BatchArena, rng: &mut Rng) -> Result<()> {
        let kind = arena.batch.kind();
        for (l, engine) in self.engines.iter().enumerate() {
            let owners = match l.checked_sub(1) {
                Some(previous) => arena.rules[previous].output.owner_of_vector(),
                None => arena.batch.owner_of_vector(),
            };
            let input = match arena.passes.last_mut() {
                Some(pass) => pass.output_mut(),
                None => &mut arena.input,
            };
            let pass = engine.forward(input, owners, &arena.rules[l], kind, rng)?;
            arena.passes.push(pass);
        }
        arena.advance(BatchState::ForwardDone);
        Ok(())
    }
    /// `softmax - onehot(label)` on the top vector of each labelled sample.
    fn loss_gradient(&self, arena: &BatchArena) -> Result<Array2<f32>> {
        let Some(output) = arena.top_output() else {
            bail!("loss gradient before the forward pass");
        };
        let mut delta = Array2::zeros(output.raw_dim());
        for (v, label) in arena.top_vectors().into_iter().zip(arena.batch.labels()) {
            if let Some(label) = *label {
                ensure!(
                    label < output.ncols(),
                    "label {label} is out of range for {} classes",
                    output.ncols()
                );
                let mut row = delta.row_mut(v);
                row.assign(&output.row(v));
                row[label] -= 1.;
            }
        }
        Ok(delta)
    }
    fn backward_arena(&self, arena: &mut BatchArena) -> Result<()> {
        let mut delta = self.loss_gradient(arena)?;
        let mut gradients = Vec::with_capacity(self.engines.len());
        for (l, engine) in self.engines.iter().enumerate().rev() {
            let (layer_gradients, input_delta) = engine.backward(
                &arena.passes[l],
                &arena.rules[l],
                arena.input_owners(l),
                delta,
                l > 0,
            )?;
            gradients.push(layer_gradients);
            match input_delta {
                Some(input_delta) => delta = input_delta,
                None => break,
            }
        }
        gradients.reverse();
        arena.gradients = gradients;
        arena.advance(BatchState::BackwardDone);
        Ok(())
    }
    fn apply_gradients(&self, arena: &mut BatchArena) -> Result<()> {
        let mut update = self.update.lock();
        for (engine, gradients) in self.engines.iter().zip(arena.gradients.iter_mut()) {
            engine.update(&self.sgd, update.batches_completed, gradients);
        }
        update.batches_completed += 1;
        let epoch = update.batches_completed;
        if let Some(checkpoints) = self.checkpoints.as_ref() {
            if checkpoints.interval > 0 && epoch % checkpoints.interval == 0 {
                self.save_checkpoint(checkpoints.path(epoch))?;
            }
        }
        arena.advance(BatchState::Updated);
        Ok(())
    }
    fn outcome(&self, arena: &BatchArena) -> BatchOutcome {
        let Some(output) = arena.top_output() else {
            return BatchOutcome::default();
        };
        let top_vectors = arena.top_vectors();
        let mut outcome = BatchOutcome {
            samples: top_vectors.len(),
            ..BatchOutcome::default()
        };
        for (&v, label) in top_vectors.iter().zip(arena.batch.labels()) {
            let row = output.row(v);
            let prediction = argmax(row);
            outcome.predictions.push(prediction);
            if arena.batch.kind() == BatchKind::Unlabelled {
                outcome.top_guesses.push(top_guesses(row, TOP_GUESSES));
            } else if label.map_or(false, |label| label != prediction) {
                outcome.mistakes += 1;
            }
        }
        outcome
    }
    /// Runs one batch through the network.
    ///
    /// Every batch is forwarded. Train and test batches count mistakes, unlabelled batches report
    /// the top guesses. Train batches are then backpropagated and the weights updated, and a
    /// checkpoint is saved every [`Checkpoints::interval`] training batches.
    ///
    /// **Errors**
    ///
    /// - If the batch does not match the input of the network.
    /// - [`NumericError::NonFinite`](crate::error::NumericError::NonFinite) if a layer output is
    ///   not finite.
    /// - If saving a checkpoint fails.
    pub fn process_batch(&self, batch: &SparseBatch) -> Result<BatchOutcome> {
        let mut arena = self.build_rules(batch)?;
        self.stage(&mut arena)?;
        self.forward_arena(&mut arena, &mut self.seeds.rng())?;
        let outcome = self.outcome(&arena);
        if batch.kind() == BatchKind::Train {
            self.backward_arena(&mut arena)?;
            self.apply_gradients(&mut arena)?;
        }
        arena.advance(BatchState::Cleaned);
        debug!(
            "processed {:?} batch of {} samples, {} mistakes",
            batch.kind(),
            outcome.samples,
            outcome.mistakes
        );
        Ok(outcome)
    }
    /// The class probabilities of each sample, `[samples, classes]`.
    ///
    /// Dropout is applied as for the kind of the batch.
    pub fn forward(&self, batch: &SparseBatch) -> Result<Array2<f32>> {
        let mut arena = self.build_rules(batch)?;
        self.stage(&mut arena)?;
        self.forward_arena(&mut arena, &mut self.seeds.rng())?;
        let Some(output) = arena.top_output() else {
            bail!("network has no layers");
        };
        let top_vectors = arena.top_vectors();
        let mut probabilities = Array2::zeros([top_vectors.len(), output.ncols()]);
        for (mut row, v) in probabilities.rows_mut().into_iter().zip(top_vectors) {
            row.assign(&output.row(v));
        }
        Ok(probabilities)
    }
    /// The gradients of the summed cross entropy of `batch` with respect to the parameters of
    /// each layer, without updating the network.
    pub fn gradients(&self, batch: &SparseBatch) -> Result<Vec<LayerGradients>> {
        let mut arena = self.build_rules(batch)?;
        self.stage(&mut arena)?;
        self.forward_arena(&mut arena, &mut self.seeds.rng())?;
        self.backward_arena(&mut arena)?;
        Ok(arena.gradients)
    }
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &x)| {
            if x > best.1 {
                (i, x)
            } else {
                best
            }
        })
        .0
}

fn top_guesses(row: ArrayView1<f32>, k: usize) -> Vec<usize> {
    let mut classes: Vec<usize> = (0..row.len()).collect();
    classes.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
    classes.truncate(k);
    classes
}
