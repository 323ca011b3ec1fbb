pub mod parser;
pub mod recorder;
pub mod sink;

pub use parser::{parse_line, DeviceConfig, LogRecord, ParsedLine};
pub use recorder::Recorder;
pub use sink::{LogError, LogSink, OpenMode, Recorded, Schema};
