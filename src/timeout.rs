//! Timeout classification.
//!
//! Decides whether a failure means "the other side was too slow", as opposed
//! to a refused connection, a codec problem or an explicit cancellation.

use std::error::Error;
use std::io;

use crate::error::ForwardError;

/// Returns `true` if `err` is, wraps, or joins a timeout.
///
/// Recognised timeouts are [`ForwardError::DeadlineExceeded`], I/O errors of
/// kind [`io::ErrorKind::TimedOut`], and [`tokio::time::error::Elapsed`].
/// The whole `source()` chain, the inner error of an [`io::Error`] and every
/// member of [`ForwardError::Joined`] are searched. `None` is never a timeout.
pub fn is_timeout(err: Option<&(dyn Error + 'static)>) -> bool {
    let mut stack: Vec<&(dyn Error + 'static)> = err.into_iter().collect();

    while let Some(err) = stack.pop() {
        if let Some(fwd) = err.downcast_ref::<ForwardError>() {
            match fwd {
                ForwardError::DeadlineExceeded => return true,
                ForwardError::Cancelled => continue,
                ForwardError::Joined(errors) => {
                    stack.extend(errors.iter().map(|e| e as &(dyn Error + 'static)));
                    continue;
                }
                _ => {}
            }
        }

        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
            if let Some(inner) = io_err.get_ref() {
                stack.push(inner);
                continue;
            }
        }

        if err.is::<tokio::time::error::Elapsed>() {
            return true;
        }

        if let Some(source) = err.source() {
            stack.push(source);
        }
    }

    false
}
