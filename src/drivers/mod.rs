// src/drivers/mod.rs
// 采集管线的子模块
pub mod averaging;
pub mod buffer;
pub mod cursor;
pub mod error;
pub mod pipeline;
pub mod plot;
pub mod preset;
pub mod remote;
pub mod simulated;
pub mod source;
pub mod transform;
// 公开导出常用类型，方便外部调用
pub use averaging::{Accumulator, AVERAGING_FACTORS};
pub use buffer::{HandoffQueue, QueueMetrics};
pub use cursor::CursorAxis;
pub use error::ConsoleError;
pub use pipeline::{DisplayPipeline, DisplayUpdate};
pub use plot::{render_waveform_png, PlotStyle};
pub use preset::TdrPreset;
pub use remote::RemoteInstrument;
pub use simulated::SimulatedInstrument;
pub use source::{CancelToken, Instrument, Subscription};
