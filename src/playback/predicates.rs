//! Decisions that drive predicate-based playback.
//!
//! Swap predicates decide whether the engine swaps on the calling thread
//! (should-swap) or whether a swap made elsewhere has happened (has-swapped).
//! Render predicates decide whether the next slide is rendered now.
//! Closures implement both traits, so ad-hoc predicates need no new type.

use tracing::error;

use crate::core::time::Time;
use crate::display::{Display, SwapTiming};
use crate::playback::slide::{SlideRecord, SlideState};
use crate::sync::data_client::DataClientConfig;
use crate::sync::swap_data::{PolledSwapListener, SwapData};

/// What a render predicate gets to look at.
#[derive(Debug, Clone)]
pub struct PredicateInput<'a> {
    /// The call follows a swap observed in this iteration.
    pub has_swapped: bool,
    pub current_slide: Option<&'a SlideRecord>,
    pub next_slide: Option<&'a SlideRecord>,
    pub last_swap: Option<SwapData>,
    pub next_swap_unit: u64,
    /// Model prediction of the next swap, when the display model is usable.
    pub predicted_next_swap_time: Option<Time>,
    pub frame_period: Time,
}

impl PredicateInput<'_> {
    /// The next slide, if it is still waiting to be rendered.
    pub fn pending_next_slide(&self) -> Option<&SlideRecord> {
        self.next_slide
            .filter(|slide| slide.state == SlideState::NotStarted && !slide.dropped)
    }
}

pub trait SwapPredicate: Send {
    fn check(&mut self, display: &Display) -> bool;
}

impl<F> SwapPredicate for F
where
    F: FnMut(&Display) -> bool + Send,
{
    fn check(&mut self, display: &Display) -> bool {
        self(display)
    }
}

pub trait RenderPredicate: Send {
    fn check(&mut self, input: &PredicateInput<'_>) -> bool;
}

impl<F> RenderPredicate for F
where
    F: FnMut(&PredicateInput<'_>) -> bool + Send,
{
    fn check(&mut self, input: &PredicateInput<'_>) -> bool {
        self(input)
    }
}

/// Render the next slide once the next swap reaches its intended start frame.
///
/// With a lookahead of `n`, render up to `n` swaps early; used when frames are
/// queued on the display thread rather than drawn into the back buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCounted {
    lookahead: u64,
}

impl FrameCounted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lookahead(lookahead: u64) -> Self {
        Self { lookahead }
    }
}

impl RenderPredicate for FrameCounted {
    fn check(&mut self, input: &PredicateInput<'_>) -> bool {
        let Some(next) = input.pending_next_slide() else {
            return false;
        };
        let start = next.intended.start_frame;
        if start > input.next_swap_unit + self.lookahead {
            return false;
        }
        if start < input.next_swap_unit {
            error!(
                "Slide '{}' intended for frame {} rendered when the next swap reaches {}",
                next.name, start, input.next_swap_unit
            );
        }
        true
    }
}

/// Render the next slide once its intended start time falls on the next swap.
///
/// A start within half a frame period after the predicted next swap is closer
/// to that swap than to the one after it, so it is rendered for that swap.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timed;

impl RenderPredicate for Timed {
    fn check(&mut self, input: &PredicateInput<'_>) -> bool {
        let Some(next) = input.pending_next_slide() else {
            return false;
        };
        let last_swap_time = input.last_swap.map_or(Time::ZERO, |s| s.time);
        let next_swap_time = input
            .predicted_next_swap_time
            .unwrap_or(last_swap_time + input.frame_period);
        if next.intended.start_time > next_swap_time + input.frame_period / 2.0 {
            return false;
        }
        if next.intended.start_time < last_swap_time {
            error!(
                "Slide '{}' intended for {} rendered after the swap at {}",
                next.name, next.intended.start_time, last_swap_time
            );
        }
        true
    }
}

/// Swap on the calling thread when the next refresh is imminent.
#[derive(Debug)]
pub struct MainThreadShouldSwap {
    timing: SwapTiming,
}

impl MainThreadShouldSwap {
    pub fn new(display: &Display, config: DataClientConfig, pre_swap_safety_buffer: Time) -> Self {
        Self {
            timing: SwapTiming::new(
                display.swap_data().clone(),
                display.frame_period(),
                config,
                pre_swap_safety_buffer,
            ),
        }
    }
}

impl SwapPredicate for MainThreadShouldSwap {
    fn check(&mut self, display: &Display) -> bool {
        display.rendering_on_this_thread() && self.timing.should_swap(display.now())
    }
}

/// Report swaps made by the display thread.
#[derive(Debug)]
pub struct ThreadHasSwapped {
    listener: PolledSwapListener,
}

impl ThreadHasSwapped {
    pub fn new(display: &Display) -> Self {
        Self {
            listener: PolledSwapListener::new(display.swap_data().clone()),
        }
    }
}

impl SwapPredicate for ThreadHasSwapped {
    fn check(&mut self, _display: &Display) -> bool {
        self.listener.has_swapped(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::slide::{PresentationInfo, SlideTimingInfo};

    const PERIOD: Time = Time::from_nanos(16_666_667);

    fn slide(start_frame: u64, start_time: Time) -> SlideRecord {
        SlideRecord {
            index: 0,
            name: "s".into(),
            state: SlideState::NotStarted,
            intended: SlideTimingInfo {
                start_time,
                time_duration: PERIOD,
                start_frame,
                frame_duration: 1,
            },
            actual: SlideTimingInfo::default(),
            presentation: PresentationInfo::default(),
            dropped: false,
        }
    }

    fn input(next: Option<&SlideRecord>, last_unit: u64) -> PredicateInput<'_> {
        PredicateInput {
            has_swapped: true,
            current_slide: None,
            next_slide: next,
            last_swap: Some(SwapData::new(last_unit, PERIOD * last_unit as i64)),
            next_swap_unit: last_unit + 1,
            predicted_next_swap_time: None,
            frame_period: PERIOD,
        }
    }

    #[test]
    fn test_frame_counted() {
        let next = slide(10, PERIOD * 10);
        let mut predicate = FrameCounted::new();
        assert!(!predicate.check(&input(Some(&next), 8)));
        assert!(predicate.check(&input(Some(&next), 9)));
        // late, still rendered
        assert!(predicate.check(&input(Some(&next), 12)));
        assert!(!predicate.check(&input(None, 9)));

        let mut ahead = FrameCounted::with_lookahead(2);
        assert!(ahead.check(&input(Some(&next), 7)));
        assert!(!ahead.check(&input(Some(&next), 6)));
    }

    #[test]
    fn test_frame_counted_skips_rendered_and_dropped() {
        let mut rendered = slide(10, PERIOD * 10);
        rendered.state = SlideState::RenderStarted;
        assert!(!FrameCounted::new().check(&input(Some(&rendered), 9)));
        let mut dropped = slide(10, PERIOD * 10);
        dropped.dropped = true;
        assert!(!FrameCounted::new().check(&input(Some(&dropped), 9)));
    }

    #[test]
    fn test_timed() {
        let next = slide(0, PERIOD * 10);
        let mut predicate = Timed;
        assert!(!predicate.check(&input(Some(&next), 8)));
        assert!(predicate.check(&input(Some(&next), 9)));
        // half a period of slack
        let near = slide(0, PERIOD * 10 + Time::from_millis(8));
        assert!(predicate.check(&input(Some(&near), 9)));
        let far = slide(0, PERIOD * 10 + Time::from_millis(9));
        assert!(!predicate.check(&input(Some(&far), 9)));
    }

    #[test]
    fn test_closures_are_predicates() {
        let mut always = |_: &PredicateInput<'_>| true;
        assert!(RenderPredicate::check(&mut always, &input(None, 0)));
    }
}
