mod batch;
mod manager;
mod reader;
mod sensors;
mod state;
mod three_a;

pub use batch::CaptureBatch;
pub use manager::{resolve_output_specs, CaptureSessionManager, OutputFormat, OutputSpec};
pub use reader::{DroppingListener, ImageListener, ImageReader};
pub use sensors::SensorEventLog;
pub use state::StateWaiter;
pub use three_a::{plan_triggers, rendezvous_gate, Gate, GateOpener, ThreeAController, ThreeAPhase};
