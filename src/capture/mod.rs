pub mod frame;
pub mod source;

pub use frame::Frame;
pub use frame::FrameHandle;
pub use frame::PixelFormat;
pub use source::FrameSource;
pub use source::SyntheticDepthSource;
