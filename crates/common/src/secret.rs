//! Redacting wrapper for API keys and hub tokens

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value. Debug and Display print `[REDACTED]`; memory is zeroed on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Last four characters, for telling keys apart in logs.
    pub fn hint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("...{tail}")
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let key = Secret::new(String::from("AIzaSyExampleKey0001"));
        assert_eq!(format!("{key:?}"), "[REDACTED]");
        assert_eq!(format!("{key}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner_value() {
        let key: Secret<String> = String::from("AIzaSyExampleKey0001").into();
        assert_eq!(key.expose(), "AIzaSyExampleKey0001");
    }

    #[test]
    fn hint_shows_only_the_tail() {
        let key = Secret::new(String::from("AIzaSyExampleKey0001"));
        assert_eq!(key.hint(), "...0001");

        let short = Secret::new(String::from("abc"));
        assert_eq!(short.hint(), "****");
    }
}
