//! Ownership of the rendering context.
//!
//! Exactly one thread may draw at a time. The display hands the context
//! between the main thread and the display thread; every drawing entry point
//! checks ownership first.

use parking_lot::Mutex;
use std::thread::{self, ThreadId};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct RenderingContext {
    owner: Mutex<Option<ThreadId>>,
}

impl RenderingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the context current on the calling thread.
    ///
    /// # Errors
    ///
    /// Fails if another thread owns the context.
    pub fn acquire(&self) -> Result<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        match *owner {
            Some(current) if current != me => Err(Error::ContextAcquisition(format!(
                "context is owned by {:?}",
                current
            ))),
            _ => {
                *owner = Some(me);
                debug!("Rendering context acquired by {:?}", me);
                Ok(())
            }
        }
    }

    /// Release the context if the calling thread owns it.
    pub fn release(&self) -> bool {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner == Some(me) {
            *owner = None;
            debug!("Rendering context released by {:?}", me);
            true
        } else {
            false
        }
    }

    pub fn is_current(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_and_release() {
        let context = RenderingContext::new();
        assert!(!context.is_current());
        context.acquire().unwrap();
        assert!(context.is_current());
        // re-acquiring on the owner is fine
        context.acquire().unwrap();
        assert!(context.release());
        assert!(!context.release());
        assert_eq!(context.owner(), None);
    }

    #[test]
    fn test_other_thread_cannot_steal() {
        let context = Arc::new(RenderingContext::new());
        context.acquire().unwrap();
        let other = context.clone();
        let result = std::thread::spawn(move || (other.acquire().is_err(), other.release()))
            .join()
            .unwrap();
        assert_eq!(result, (true, false));
        assert!(context.is_current());
    }
}
