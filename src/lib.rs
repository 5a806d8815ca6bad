//! Synchronized audiovisual stimulus scheduling.
//!
//! Displays and audio streams are both swap sources: each swap advances a
//! unit counter (refreshes, sample frames) at a timestamp. Linear models fit on
//! recent swaps predict when any unit will be reached, which lets a presenter
//! pick a display frame and the sample frame heard at the same moment.

pub mod audio;
pub mod core;
pub mod display;
pub mod error;
pub mod playback;
pub mod presenter;
pub mod render;
pub mod sync;

pub use crate::core::time::Time;
pub use crate::display::Display;
pub use crate::error::{Error, Result};
pub use crate::playback::{Slide, SlideBuffer, SlideDuration};
pub use crate::presenter::{AvPresenter, PresenterConfig, PresenterMode};
