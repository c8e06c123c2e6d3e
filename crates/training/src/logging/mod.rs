pub mod console;
pub mod tensorboard;

pub use console::{ConsoleLogger, FileConsoleLogger, IntervalRecord};
pub use tensorboard::{PredictionImage, TensorBoardLogger, VisualLogger};
