pub mod calibration;
pub mod data;
pub mod rig;

pub use calibration::CalibrationSession;
pub use data::Recorder;
pub use rig::Connection;
