pub mod notify;
pub mod processing;

pub use notify::CompletionNotifier;
pub use notify::CompletionSink;
pub use processing::AuxContext;
pub use processing::FrameProcessor;
pub use processing::PendingInput;
pub use processing::ProcessingStage;
pub use processing::StageError;
