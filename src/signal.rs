//! The three kinds of signal a producer can emit.

use crate::error::ProcessorError;
use crate::subscriber::Subscriber;

/// One element of a signal stream: a value, or one of the two terminal kinds.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    Next(T),
    Error(ProcessorError),
    Complete,
}

impl<T> Signal<T> {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }

    /// Splits a signal into its value or its terminal part.
    pub fn into_parts(self) -> Result<T, Terminal> {
        match self {
            Signal::Next(value) => Ok(value),
            Signal::Error(error) => Err(Terminal::Error(error)),
            Signal::Complete => Err(Terminal::Complete),
        }
    }
}

impl<T> From<Terminal> for Signal<T> {
    fn from(terminal: Terminal) -> Self {
        match terminal {
            Terminal::Complete => Signal::Complete,
            Terminal::Error(error) => Signal::Error(error),
        }
    }
}

/// A recorded terminal signal.
///
/// Every engine records at most one terminal and replays it verbatim to
/// current and late subscribers.
#[derive(Debug, Clone)]
pub enum Terminal {
    Complete,
    Error(ProcessorError),
}

impl Terminal {
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Terminal::Error(_))
    }

    pub fn error(&self) -> Option<&ProcessorError> {
        match self {
            Terminal::Error(error) => Some(error),
            Terminal::Complete => None,
        }
    }

    /// Hands this terminal to `subscriber`.
    pub(crate) fn deliver<T: 'static>(&self, subscriber: &dyn Subscriber<T>) {
        match self {
            Terminal::Complete => subscriber.on_complete(),
            Terminal::Error(error) => subscriber.on_error(error.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_parts() {
        assert_eq!(Signal::Next(3).into_parts().ok(), Some(3));
        assert!(matches!(
            Signal::<u8>::Complete.into_parts(),
            Err(Terminal::Complete)
        ));
        assert!(matches!(
            Signal::<u8>::Error(ProcessorError::Overflow).into_parts(),
            Err(Terminal::Error(ProcessorError::Overflow))
        ));
    }

    #[test]
    fn test_terminal_round_trips_into_signal() {
        let signal: Signal<u8> = Terminal::Error(ProcessorError::Disposed).into();
        assert!(signal.is_terminal());
        assert!(!Signal::Next(1).is_terminal());
    }
}
