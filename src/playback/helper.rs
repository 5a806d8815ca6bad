//! Walks a slide buffer as buffer swaps happen.
//!
//! The helper knows which slide is on screen (`current`) and which one the
//! next swap can bring on screen (`next`). It never swaps or renders on its
//! own initiative; the engine or presenter tells it when a swap happened and
//! when to render.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::playback::slide::SlideState;
use crate::playback::slide_buffer::SlideBuffer;
use crate::sync::swap_data::SwapData;

#[derive(Debug)]
pub struct PlaybackHelper {
    buffer: Arc<SlideBuffer>,
    current: Option<usize>,
    playing: bool,
    slide_advanced_on_last_swap: bool,
    last_swap: Option<SwapData>,
}

impl PlaybackHelper {
    pub fn new(buffer: Arc<SlideBuffer>) -> Self {
        Self {
            buffer,
            current: None,
            playing: false,
            slide_advanced_on_last_swap: false,
            last_swap: None,
        }
    }

    pub fn buffer(&self) -> &Arc<SlideBuffer> {
        &self.buffer
    }

    /// Reset every slide and wait for the first swap.
    pub fn start_playing(&mut self) {
        self.buffer.reset_presentation_info();
        self.current = None;
        self.playing = true;
        self.slide_advanced_on_last_swap = false;
        self.last_swap = None;
    }

    pub fn stop_playing(&mut self) {
        if self.playing {
            debug!("Playback helper stopped");
        }
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Slide on screen; `None` before the first slide was swapped in.
    pub fn current_slide_index(&self) -> Option<usize> {
        self.current
    }

    /// Slide the next swap can bring on screen.
    pub fn next_slide_index(&self) -> Option<usize> {
        self.buffer.next_active_index(self.current)
    }

    pub fn slide_advanced_on_last_swap(&self) -> bool {
        self.slide_advanced_on_last_swap
    }

    /// A swap happened. Returns whether it brought the next slide on screen.
    ///
    /// The next slide advances only if it has been rendered. When there is
    /// no next slide, the current one is swapped out once its intended
    /// duration has elapsed, which ends playback.
    pub fn buffer_swap(&mut self, swap: SwapData) -> Result<bool> {
        if !self.playing || self.last_swap.is_some_and(|last| swap.unit <= last.unit) {
            return Ok(false);
        }
        self.last_swap = Some(swap);
        self.slide_advanced_on_last_swap = false;

        match self.next_slide_index() {
            Some(next) => {
                if self.buffer.state(next).is_some_and(SlideState::is_rendered) {
                    self.advance_to(next, swap)?;
                }
            }
            None => {
                self.finish_if_elapsed(swap)?;
            }
        }
        Ok(self.slide_advanced_on_last_swap)
    }

    /// Bring slide `index` on screen with `swap`, retiring the current slide.
    pub(crate) fn advance_to(&mut self, index: usize, swap: SwapData) -> Result<()> {
        if let Some(current) = self.current {
            self.buffer.swapped_out(current, swap)?;
        }
        let swapped_in = self.buffer.swapped_in(index, swap)?;
        self.current = Some(index);
        self.slide_advanced_on_last_swap = true;
        self.last_swap = Some(swap);
        if let Some(swapped_in) = swapped_in {
            swapped_in.notify();
        }
        Ok(())
    }

    /// End playback once the last slide has been up for its intended frames.
    pub(crate) fn finish_if_elapsed(&mut self, swap: SwapData) -> Result<bool> {
        if !self.playing || self.next_slide_index().is_some() {
            return Ok(false);
        }
        let Some(current) = self.current else {
            info!("No slides left to show");
            self.playing = false;
            return Ok(true);
        };
        let Some(record) = self.buffer.record(current) else {
            self.playing = false;
            return Ok(true);
        };
        let end = record.actual.start_frame + record.intended.frame_duration;
        if record.state == SlideState::OnScreen && swap.unit >= end {
            self.buffer.swapped_out(current, swap)?;
            self.playing = false;
            info!("Playback finished with slide '{}'", record.name);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn render_next_slide(&self) -> Result<bool> {
        match self.next_slide_index() {
            Some(next) => {
                self.buffer.render_slide(next)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn re_render_current_slide(&self) -> Result<bool> {
        match self.current {
            Some(current) => {
                self.buffer.render_slide(current)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Poll the fence of the next slide if it is rendering.
    pub fn update_playback(&self) {
        if let Some(next) = self.next_slide_index() {
            if self.buffer.state(next) == Some(SlideState::RenderStarted) {
                self.buffer.poll_render(next);
            }
        }
    }

    /// After a late swap-in, move every remaining slide so that it keeps its
    /// intended distance to the current slide. Returns whether anything moved.
    pub fn set_intended_starts_from_current_slide(&self) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        let Some(record) = self.buffer.record(current) else {
            return false;
        };
        if record.actual.start_frame == record.intended.start_frame {
            return false;
        }
        let frame_period = self.buffer.frame_period();
        let start_frame = record.actual.start_frame + record.intended.frame_duration;
        let start_time = record.actual.start_time + frame_period * record.intended.frame_duration as i64;
        debug!(
            "Slide '{}' started at frame {} instead of {}, moving later slides to {}",
            record.name, record.actual.start_frame, record.intended.start_frame, start_frame
        );
        self.buffer.set_intended_starts_from(current + 1, start_time, start_frame);
        true
    }

    /// Drop unrendered slides whose whole intended window ends at or before
    /// `next_swap_unit`. Returns how many were dropped.
    pub fn drop_missed_slides(&self, next_swap_unit: u64) -> usize {
        let mut dropped = 0;
        while let Some(next) = self.next_slide_index() {
            let Some(record) = self.buffer.record(next) else {
                break;
            };
            let end = record.intended.start_frame + record.intended.frame_duration;
            if record.state != SlideState::NotStarted || end > next_swap_unit {
                break;
            }
            self.buffer.drop_slide(next);
            dropped += 1;
        }
        dropped
    }
}
