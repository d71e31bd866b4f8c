//! W3C WebDriver client
//!
//! Talks to chromedriver (or a Selenium grid) over HTTP with `reqwest`.
//! Only the handful of commands the portal classifier needs are covered.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{BrowserError, BrowserLauncher, BrowserSession, ElementRef, Selector};
use crate::config::WebDriverSettings;

/// JSON key carrying element ids in W3C responses
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecc";

/// WebDriver code point for the Enter key
const ENTER_KEY: &str = "\u{E007}";

/// Starts headless Chrome sessions on a WebDriver endpoint
pub struct WebDriverLauncher {
    client: Client,
    settings: WebDriverSettings,
}

impl WebDriverLauncher {
    pub fn new(settings: WebDriverSettings) -> Result<Self, BrowserError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|e| BrowserError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> &str {
        self.settings.endpoint.trim_end_matches('/')
    }

    /// New-session payload for Chrome
    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            format!(
                "--window-size={},{}",
                self.settings.window_width, self.settings.window_height
            ),
        ];
        if self.settings.headless {
            args.push("--headless=new".to_string());
        }
        if let Some(agent) = &self.settings.user_agent {
            args.push(format!("--user-agent={}", agent));
        }

        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    // Return once the DOM is ready; the portal keeps loading assets
                    "pageLoadStrategy": "eager",
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let url = format!("{}/session", self.endpoint());
        let value = send(self.client.post(&url).json(&self.capabilities())).await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Transport("New session response lacks sessionId".into()))?;

        info!(session_id, endpoint = self.endpoint(), "WebDriver session started");

        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.endpoint(), session_id),
            element_poll: Duration::from_millis(self.settings.element_poll_ms.max(1)),
            closed: false,
        }))
    }
}

/// One WebDriver session
pub struct WebDriverSession {
    client: Client,
    /// `<endpoint>/session/<id>`
    base: String,
    element_poll: Duration,
    closed: bool,
}

impl WebDriverSession {
    async fn post(&self, path: &str, body: Value) -> Result<Value, BrowserError> {
        send(self.client.post(format!("{}{}", self.base, path)).json(&body)).await
    }

    async fn get(&self, path: &str) -> Result<Value, BrowserError> {
        send(self.client.get(format!("{}{}", self.base, path))).await
    }

    async fn find_all(&self, selector: &Selector) -> Result<Vec<ElementRef>, BrowserError> {
        let (using, value) = match selector {
            Selector::Css(css) => ("css selector", css),
            Selector::XPath(xpath) => ("xpath", xpath),
        };
        let found = self
            .post("/elements", json!({ "using": using, "value": value }))
            .await?;
        Ok(element_refs(&found))
    }

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool, BrowserError> {
        match self.get(&format!("/element/{}/displayed", element.0)).await {
            Ok(value) => Ok(value.as_bool().unwrap_or(false)),
            // Replaced by a re-render between lookup and check
            Err(BrowserError::NoSuchElement(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.post("/timeouts", json!({ "pageLoad": timeout.as_millis() as u64 }))
            .await?;
        self.post("/url", json!({ "url": url })).await?;
        Ok(())
    }

    async fn find_visible(
        &mut self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<Option<ElementRef>, BrowserError> {
        let deadline = Instant::now() + timeout;

        loop {
            for element in self.find_all(selector).await? {
                if self.is_displayed(&element).await? {
                    return Ok(Some(element));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(?selector, "Element not visible before timeout");
                return Ok(None);
            }
            tokio::time::sleep(self.element_poll.min(deadline - now)).await;
        }
    }

    async fn click(&mut self, element: &ElementRef) -> Result<(), BrowserError> {
        self.post(&format!("/element/{}/click", element.0), json!({}))
            .await
            .map(|_| ())
    }

    async fn clear(&mut self, element: &ElementRef) -> Result<(), BrowserError> {
        self.post(&format!("/element/{}/clear", element.0), json!({}))
            .await
            .map(|_| ())
    }

    async fn type_text(&mut self, element: &ElementRef, text: &str) -> Result<(), BrowserError> {
        self.post(&format!("/element/{}/value", element.0), json!({ "text": text }))
            .await
            .map(|_| ())
    }

    async fn press_enter(&mut self, element: &ElementRef) -> Result<(), BrowserError> {
        self.type_text(element, ENTER_KEY).await
    }

    async fn page_source(&mut self) -> Result<String, BrowserError> {
        match self.get("/source").await? {
            Value::String(source) => Ok(source),
            other => Err(BrowserError::Transport(format!(
                "Unexpected page source payload: {}",
                other
            ))),
        }
    }

    async fn input_value(&mut self, element: &ElementRef) -> Result<String, BrowserError> {
        match self
            .get(&format!("/element/{}/property/value", element.0))
            .await?
        {
            Value::String(value) => Ok(value),
            Value::Null => Ok(String::new()),
            other => Ok(other.to_string()),
        }
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if self.closed {
            return Ok(());
        }
        send(self.client.delete(&self.base)).await?;
        self.closed = true;
        debug!(session = %self.base, "WebDriver session closed");
        Ok(())
    }
}

/// Send a command and unwrap the `value` member of the response
async fn send(request: RequestBuilder) -> Result<Value, BrowserError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            BrowserError::Timeout(format!("WebDriver request timed out: {}", e))
        } else {
            BrowserError::Transport(e.to_string())
        }
    })?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| BrowserError::Transport(format!("Invalid response body ({}): {}", status, e)))?;

    unwrap_response(status.is_success(), body)
}

fn unwrap_response(success: bool, mut body: Value) -> Result<Value, BrowserError> {
    let value = body.get_mut("value").map(Value::take).unwrap_or(Value::Null);
    if success {
        return Ok(value);
    }

    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(map_error(error, message))
}

/// Map a W3C error code onto [`BrowserError`]
fn map_error(error: String, message: String) -> BrowserError {
    match error.as_str() {
        "timeout" | "script timeout" => BrowserError::Timeout(message),
        "no such element" | "stale element reference" => BrowserError::NoSuchElement(message),
        _ => BrowserError::Protocol { error, message },
    }
}

fn element_refs(value: &Value) -> Vec<ElementRef> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(ELEMENT_KEY).and_then(Value::as_str))
                .map(|id| ElementRef(id.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher(headless: bool) -> WebDriverLauncher {
        WebDriverLauncher::new(WebDriverSettings {
            endpoint: "http://localhost:9515/".to_string(),
            headless,
            user_agent: None,
            ..WebDriverSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_capabilities_request_headless_chrome() {
        let caps = launcher(true).capabilities();
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["browserName"], "chrome");
        assert_eq!(always["pageLoadStrategy"], "eager");

        let args: Vec<&str> = always["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a.as_str().unwrap())
            .collect();
        assert!(args.contains(&"--headless=new"));
        assert!(args.contains(&"--window-size=1920,1080"));
        assert!(!args.iter().any(|a| a.starts_with("--user-agent")));
    }

    #[test]
    fn test_headful_capabilities_omit_headless_flag() {
        let caps = launcher(false).capabilities();
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap()
            .clone();
        assert!(!args.contains(&json!("--headless=new")));
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        assert_eq!(launcher(true).endpoint(), "http://localhost:9515");
    }

    #[test]
    fn test_error_codes_map_to_variants() {
        assert!(matches!(
            map_error("timeout".into(), "page load".into()),
            BrowserError::Timeout(_)
        ));
        assert!(matches!(
            map_error("no such element".into(), String::new()),
            BrowserError::NoSuchElement(_)
        ));
        match map_error("invalid session id".into(), "gone".into()) {
            BrowserError::Protocol { error, message } => {
                assert_eq!(error, "invalid session id");
                assert_eq!(message, "gone");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unwrap_response_success_and_failure() {
        let ok = unwrap_response(true, json!({ "value": "<html></html>" })).unwrap();
        assert_eq!(ok, json!("<html></html>"));

        let err = unwrap_response(
            false,
            json!({ "value": { "error": "timeout", "message": "Timed out receiving message" } }),
        )
        .unwrap_err();
        assert!(matches!(err, BrowserError::Timeout(msg) if msg.contains("Timed out")));
    }

    #[test]
    fn test_element_refs_extracts_ids() {
        let value = json!([
            { ELEMENT_KEY: "a1" },
            { "unrelated": "x" },
            { ELEMENT_KEY: "b2" }
        ]);
        assert_eq!(
            element_refs(&value),
            vec![ElementRef("a1".into()), ElementRef("b2".into())]
        );
        assert!(element_refs(&json!(null)).is_empty());
    }
}
