use candle_core::{Device, Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Everything needed to rebuild a model's parameter layout.
///
/// `args` is the free-form constructor argument object from the run
/// configuration; each architecture deserializes the keys it understands.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub in_channels: usize,
    pub n_classes: usize,
    pub args: Value,
    pub device: Device,
}

impl ModelSpec {
    pub fn new(in_channels: usize, n_classes: usize, args: Value, device: Device) -> Self {
        Self {
            in_channels,
            n_classes,
            args,
            device,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if self.n_classes < 2 {
            return Err(Error::Msg(format!(
                "n_classes must be at least 2 (got {})",
                self.n_classes
            )));
        }
        if !(self.args.is_null() || self.args.is_object()) {
            return Err(Error::Msg("model args must be a table".into()));
        }
        Ok(())
    }

    pub(crate) fn parse_args<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        if self.args.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.args.clone())
            .map_err(|err| Error::Msg(format!("invalid model args: {err}")))
    }
}
