pub mod controller;
pub mod engine;
pub mod loop_worker;
pub mod window;

pub use controller::MonitorController;
pub use engine::{
    ClosedWindow, DerivedMetrics, Sample, SampleEngine, SampleOutcome, WindowEndReason,
};
pub use loop_worker::{monitor_loop, MonitorContext};
pub use window::AccumulatedWindow;
