//! Panic capture for user code run by executors and route callbacks.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
};

/// A captured panic payload that displays as its message.
///
/// `String` and `&'static str` payloads print verbatim; anything else falls
/// back to `Debug`.
///
/// ```
/// use kgnet::panic::format_panic;
/// assert_eq!(format_panic(Box::new("boom")).to_string(), "boom");
/// assert!(format_panic(Box::new(5_u32)).to_string().contains("Any"));
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Wrap a payload returned by [`std::panic::catch_unwind`].
pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(panic) }

/// Run `f`, converting a panic into a [`PanicMessage`].
///
/// # Errors
///
/// Returns the panic payload if `f` unwinds.
pub fn catch<T>(f: impl FnOnce() -> T) -> Result<T, PanicMessage> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(format_panic)
}

#[cfg(test)]
mod tests {
    use super::catch;

    #[test]
    fn catch_returns_value_or_message() {
        assert_eq!(catch(|| 3).ok(), Some(3));
        let err = catch(|| -> u8 { panic!("handler exploded") }).expect_err("panicked");
        assert_eq!(err.to_string(), "handler exploded");
    }
}
