//! Opaque payload envelope carried across threads into a [`RunLoop`](crate::RunLoop).
//!
//! An [`Event`] owns any `Send + 'static` value. The run loop never looks inside;
//! the registered event callback recovers the concrete type with
//! [`Event::downcast_ref`] or [`Event::downcast`].

use std::any::Any;
use std::fmt;

/// A type erased value delivered to a run loop's event callback.
pub struct Event {
    payload: Box<dyn Any + Send>,
}

impl Event {
    pub fn new<T: Any + Send>(payload: T) -> Self {
        Self { payload: Box::new(payload) }
    }

    #[inline]
    pub fn is<T: Any>(&self) -> bool {
        self.payload.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Takes the payload back out, returning the event untouched if it holds another type.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        match self.payload.downcast::<T>() {
            Ok(payload) => Ok(*payload),
            Err(payload) => Err(Self { payload }),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast() {
        let event = Event::new(42_u32);
        assert!(event.is::<u32>());
        assert_eq!(event.downcast_ref::<u32>(), Some(&42));
        assert_eq!(event.downcast_ref::<i64>(), None);

        let event = match event.downcast::<String>() {
            Ok(_) => panic!("payload is not a string"),
            Err(event) => event,
        };
        assert_eq!(event.downcast::<u32>().ok(), Some(42));
    }
}
