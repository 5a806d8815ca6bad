pub mod engine;
pub mod helper;
pub mod predicates;
pub mod slide;
pub mod slide_buffer;

pub use engine::{PlaybackConfig, PredicatePlayback, RendererStrategy};
pub use helper::PlaybackHelper;
pub use predicates::{
    FrameCounted, MainThreadShouldSwap, PredicateInput, RenderPredicate, SwapPredicate, ThreadHasSwapped, Timed,
};
pub use slide::{
    PresentationInfo, Slide, SlideDuration, SlidePresentedCallback, SlideRecord, SlideState, SlideTimingInfo,
};
pub use slide_buffer::{DurationMode, PresentationErrors, SlideBuffer, DEFAULT_LATE_START_TOLERANCE};
