mod command;
mod response;
mod writer;

pub use command::{
    CaptureParams, Command, NormalizedRegion, OutputSurfaceSpec, ThreeAParams, VibrateParams,
};
pub use response::{Response, ResponseTag};
pub(crate) use writer::Outbound;
pub use writer::{ResponseSender, ResponseWriter};
