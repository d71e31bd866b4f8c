//! Browser automation interface
//!
//! The classifier drives a [`BrowserSession`]; the engine obtains sessions
//! from a [`BrowserLauncher`]. The production implementation speaks W3C
//! WebDriver (see [`webdriver`]).

pub mod webdriver;

pub use webdriver::{WebDriverLauncher, WebDriverSession};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Browser automation errors
#[derive(Debug, Error)]
pub enum BrowserError {
    /// A navigation or script timeout reported by the browser
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No such element: {0}")]
    NoSuchElement(String),

    /// The driver could not be reached or answered with garbage
    #[error("WebDriver transport error: {0}")]
    Transport(String),

    /// The driver rejected a command
    #[error("WebDriver error {error}: {message}")]
    Protocol { error: String, message: String },
}

impl BrowserError {
    /// The driver no longer knows the session (crashed tab, closed window)
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            BrowserError::Protocol { error, .. }
                if error == "invalid session id" || error == "no such window"
        )
    }

    /// Worth another try only on a freshly launched session
    pub fn needs_new_session(&self) -> bool {
        self.is_session_lost() || matches!(self, BrowserError::Transport(_))
    }
}

/// Element locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Css(String),
    XPath(String),
}

impl Selector {
    /// `<input>` whose placeholder contains `text`
    pub fn placeholder_contains(text: &str) -> Self {
        Selector::Css(format!(
            "input[placeholder*=\"{}\"]",
            text.replace('\\', "\\\\").replace('"', "\\\"")
        ))
    }

    /// `<button>` whose visible text contains `text`
    pub fn button_with_text(text: &str) -> Self {
        Selector::XPath(format!(
            "//button[contains(normalize-space(.), {})]",
            xpath_literal(text)
        ))
    }
}

/// Quote `text` as an XPath 1.0 string literal
fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        format!("'{}'", text)
    } else if !text.contains('"') {
        format!("\"{}\"", text)
    } else {
        let parts: Vec<String> = text.split('\'').map(|p| format!("'{}'", p)).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// Opaque handle to an element found in the current page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// One live browser session.
///
/// Waits take explicit timeouts; "not visible within the timeout" is
/// `Ok(None)`, never an error.
#[async_trait]
pub trait BrowserSession: Send {
    /// Load `url`, failing with [`BrowserError::Timeout`] past `timeout`
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// First element matching `selector` that becomes visible within `timeout`
    async fn find_visible(
        &mut self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<Option<ElementRef>, BrowserError>;

    async fn click(&mut self, element: &ElementRef) -> Result<(), BrowserError>;

    async fn clear(&mut self, element: &ElementRef) -> Result<(), BrowserError>;

    async fn type_text(&mut self, element: &ElementRef, text: &str) -> Result<(), BrowserError>;

    /// Submit by sending the Enter key to `element`
    async fn press_enter(&mut self, element: &ElementRef) -> Result<(), BrowserError>;

    /// Full rendered markup of the current page
    async fn page_source(&mut self) -> Result<String, BrowserError>;

    /// Current `value` of an input element (empty when unset)
    async fn input_value(&mut self, element: &ElementRef) -> Result<String, BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Factory for browser sessions
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}
