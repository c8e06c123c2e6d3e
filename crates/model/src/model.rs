use candle_core::{Error, Result, Tensor, Var};
use rand::rngs::StdRng;
use serde::Deserialize;

use crate::{block::ConvLayer, config::ModelSpec, SegmentationModel};

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PointwiseArgs {
    bias: bool,
}

impl Default for PointwiseArgs {
    fn default() -> Self {
        Self { bias: true }
    }
}

/// Per-pixel linear classifier (a single 1x1 convolution).
pub struct PointwiseClassifier {
    spec: ModelSpec,
    classifier: ConvLayer,
}

impl PointwiseClassifier {
    pub fn new(spec: ModelSpec, rng: &mut StdRng) -> Result<Self> {
        spec.validate()?;
        let args: PointwiseArgs = spec.parse_args()?;
        let classifier = ConvLayer::new(
            "classifier",
            spec.in_channels,
            spec.n_classes,
            1,
            args.bias,
            rng,
            &spec.device,
        )?;
        Ok(Self { spec, classifier })
    }
}

impl SegmentationModel for PointwiseClassifier {
    fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        expect_channels(inputs, self.spec.in_channels)?;
        self.classifier.forward(inputs)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.classifier.parameters()
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FcnArgs {
    hidden_channels: usize,
    depth: usize,
    kernel_size: usize,
}

impl Default for FcnArgs {
    fn default() -> Self {
        Self {
            hidden_channels: 16,
            depth: 2,
            kernel_size: 3,
        }
    }
}

/// Small fully-convolutional network: `depth` conv+ReLU blocks followed by a
/// 1x1 classification head. Every operation is per-example, so outputs do
/// not depend on how a batch is partitioned.
pub struct FullyConvNet {
    spec: ModelSpec,
    blocks: Vec<ConvLayer>,
    head: ConvLayer,
}

impl FullyConvNet {
    pub fn new(spec: ModelSpec, rng: &mut StdRng) -> Result<Self> {
        spec.validate()?;
        let args: FcnArgs = spec.parse_args()?;
        if args.depth == 0 || args.hidden_channels == 0 {
            return Err(Error::Msg(
                "fcn requires depth > 0 and hidden_channels > 0".into(),
            ));
        }

        let mut blocks = Vec::with_capacity(args.depth);
        let mut channels = spec.in_channels;
        for idx in 0..args.depth {
            blocks.push(ConvLayer::new(
                format!("blocks.{idx}"),
                channels,
                args.hidden_channels,
                args.kernel_size,
                true,
                rng,
                &spec.device,
            )?);
            channels = args.hidden_channels;
        }
        let head = ConvLayer::new("head", channels, spec.n_classes, 1, true, rng, &spec.device)?;

        Ok(Self { spec, blocks, head })
    }
}

impl SegmentationModel for FullyConvNet {
    fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        expect_channels(inputs, self.spec.in_channels)?;
        let mut hidden = inputs.clone();
        for block in &self.blocks {
            hidden = block.forward(&hidden)?.relu()?;
        }
        self.head.forward(&hidden)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.blocks
            .iter()
            .chain(std::iter::once(&self.head))
            .flat_map(ConvLayer::parameters)
            .collect()
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }
}

fn expect_channels(inputs: &Tensor, expected: usize) -> Result<()> {
    match inputs.dims() {
        [_, channels, _, _] if *channels == expected => Ok(()),
        dims => Err(Error::Msg(format!(
            "expected (batch, {expected}, height, width) input, got {dims:?}"
        ))),
    }
}
