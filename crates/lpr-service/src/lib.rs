pub mod assembler;
pub mod capability;
pub mod config;
pub mod error;
pub mod frame;
pub mod locator;
pub mod pipeline;
pub mod poller;
pub mod sink;
pub mod source;
pub mod validator;

pub use assembler::{PipelineOutput, ResultAssembler};
pub use config::{PipelineConfig, PipelineSettings, ServiceConfig};
pub use error::{PipelineError, Rejection};
pub use frame::Frame;
pub use pipeline::PlatePipeline;
pub use poller::{CameraPoller, PollerSettings};
pub use source::{ImageSource, ImageTarget};
