use candle_core::{Device, Result, Tensor, Var};
use rand::rngs::StdRng;

use crate::init::kaiming_uniform;

/// Square-kernel 2D convolution with stride 1 and "same" padding.
pub struct ConvLayer {
    name: String,
    weight: Var,
    bias: Option<Var>,
    padding: usize,
}

impl ConvLayer {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        bias: bool,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        if kernel_size % 2 == 0 {
            candle_core::bail!("kernel_size must be odd to preserve spatial size");
        }
        let fan_in = in_channels * kernel_size * kernel_size;
        let weight = kaiming_uniform(
            &[out_channels, in_channels, kernel_size, kernel_size],
            fan_in,
            rng,
            device,
        )?;
        let bias = if bias {
            Some(kaiming_uniform(&[out_channels], fan_in, rng, device)?)
        } else {
            None
        };
        Ok(Self {
            name: name.into(),
            weight,
            bias,
            padding: kernel_size / 2,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.conv2d(self.weight.as_tensor(), self.padding, 1, 1, 1)?;
        match &self.bias {
            Some(bias) => {
                let channels = bias.dims()[0];
                ys.broadcast_add(&bias.as_tensor().reshape((1, channels, 1, 1))?)
            }
            None => Ok(ys),
        }
    }

    pub fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = vec![(format!("{}.weight", self.name), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{}.bias", self.name), bias.clone()));
        }
        params
    }
}
