//! Built-in nodes for the conducto pipeline engine.
//!
//! Each module pairs a descriptor builder with a [`Processor`] implementation.
//! The control surface's node registry maps `builtin://` URIs onto these
//! factories; the descriptors carry the port and parameter shapes the
//! compiler binds against.
//!
//! [`Processor`]: conducto_core::Processor

pub mod crasher;
pub mod dc;
pub mod event_source;
pub mod gain;
pub mod join;
pub mod oscillator;
pub mod passthru;
pub mod sink;
pub mod split;
pub mod wavfile;

pub use crasher::Crasher;
pub use dc::DcSource;
pub use event_source::EventSource;
pub use gain::Gain;
pub use join::JoinChannels;
pub use oscillator::SineOscillator;
pub use passthru::PassThru;
pub use split::SplitChannels;
pub use wavfile::WavFileSource;
