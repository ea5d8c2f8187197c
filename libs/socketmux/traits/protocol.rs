//! Exchange-specific request/response conventions
//!
//! The session layer never inspects business payloads itself. Everything it
//! needs to know about the wire schema (how to recognise the answer to a
//! subscribe, unsubscribe or authentication request) comes through
//! [`SocketProtocol`].

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

#[async_trait]
pub trait SocketProtocol: Send + Sync + 'static {
    /// Whether credentials are configured for authenticated streams
    fn has_credentials(&self) -> bool {
        false
    }

    /// Request to send after connecting, before any authenticated subscription.
    ///
    /// `Ok(None)` means the exchange authenticates some other way (headers,
    /// signed URL) and nothing has to be sent.
    async fn authentication_request(&self) -> Result<Option<Value>> {
        Ok(None)
    }

    /// `Some(ok)` if `message` answers the authentication `request`
    fn authentication_response(&self, _request: &Value, _message: &Value) -> Option<bool> {
        None
    }

    /// `Some(ack)` if `message` answers the subscribe `request`, `None` otherwise
    fn subscribe_response(&self, request: &Value, message: &Value) -> Option<bool>;

    /// Request that undoes the subscribe `request`, if the exchange has one
    fn unsubscribe_request(&self, request: &Value) -> Option<Value>;

    /// `Some(ack)` if `message` answers the unsubscribe `request`
    fn unsubscribe_response(&self, request: &Value, message: &Value) -> Option<bool>;
}

/// Correlates requests and answers through an `id` field.
///
/// Requests look like `{"method": "...", "params": ..., "id": n}`. An answer
/// carries the same id and is an acknowledgment unless it has a non-null
/// `error` member.
pub struct JsonRpcProtocol {
    subscribe_method: String,
    unsubscribe_method: String,
    next_id: AtomicU64,
    auth: Option<Box<dyn Fn(u64) -> Value + Send + Sync>>,
}

impl JsonRpcProtocol {
    pub fn new(subscribe_method: impl Into<String>, unsubscribe_method: impl Into<String>) -> Self {
        Self {
            subscribe_method: subscribe_method.into(),
            unsubscribe_method: unsubscribe_method.into(),
            next_id: AtomicU64::new(1),
            auth: None,
        }
    }

    /// Enable authenticated streams; `build` receives the request id
    pub fn with_authentication<F>(mut self, build: F) -> Self
    where
        F: Fn(u64) -> Value + Send + Sync + 'static,
    {
        self.auth = Some(Box::new(build));
        self
    }

    /// Allocate the next request id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a subscribe request for `params`
    pub fn subscribe_request(&self, params: Value) -> Value {
        json!({
            "method": self.subscribe_method,
            "params": params,
            "id": self.next_id(),
        })
    }

    fn answer(request: &Value, message: &Value) -> Option<bool> {
        let id = request.get("id")?;
        if message.get("id")? != id {
            return None;
        }
        Some(message.get("error").map_or(true, Value::is_null))
    }
}

#[async_trait]
impl SocketProtocol for JsonRpcProtocol {
    fn has_credentials(&self) -> bool {
        self.auth.is_some()
    }

    async fn authentication_request(&self) -> Result<Option<Value>> {
        Ok(self.auth.as_ref().map(|build| build(self.next_id())))
    }

    fn authentication_response(&self, request: &Value, message: &Value) -> Option<bool> {
        Self::answer(request, message)
    }

    fn subscribe_response(&self, request: &Value, message: &Value) -> Option<bool> {
        Self::answer(request, message)
    }

    fn unsubscribe_request(&self, request: &Value) -> Option<Value> {
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        Some(json!({
            "method": self.unsubscribe_method,
            "params": params,
            "id": self.next_id(),
        }))
    }

    fn unsubscribe_response(&self, request: &Value, message: &Value) -> Option<bool> {
        Self::answer(request, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_answer_by_id() {
        let protocol = JsonRpcProtocol::new("SUBSCRIBE", "UNSUBSCRIBE");
        let request = protocol.subscribe_request(json!(["btcusdt@trade"]));
        let id = request["id"].clone();

        assert_eq!(
            protocol.subscribe_response(&request, &json!({"id": id, "result": null})),
            Some(true)
        );
        assert_eq!(
            protocol.subscribe_response(&request, &json!({"id": id, "error": {"code": 2}})),
            Some(false)
        );
        assert_eq!(
            protocol.subscribe_response(&request, &json!({"id": 999999, "result": null})),
            None
        );
        assert_eq!(protocol.subscribe_response(&request, &json!({"e": "trade"})), None);
    }

    #[test]
    fn test_unsubscribe_request_uses_fresh_id() {
        let protocol = JsonRpcProtocol::new("SUBSCRIBE", "UNSUBSCRIBE");
        let request = protocol.subscribe_request(json!(["a"]));
        let unsub = protocol.unsubscribe_request(&request).unwrap();

        assert_eq!(unsub["method"], "UNSUBSCRIBE");
        assert_eq!(unsub["params"], json!(["a"]));
        assert_ne!(unsub["id"], request["id"]);
    }

    #[tokio::test]
    async fn test_authentication_only_with_credentials() {
        let plain = JsonRpcProtocol::new("s", "u");
        assert!(!plain.has_credentials());
        assert!(plain.authentication_request().await.unwrap().is_none());

        let authed = JsonRpcProtocol::new("s", "u")
            .with_authentication(|id| json!({"method": "auth", "id": id}));
        assert!(authed.has_credentials());
        let request = authed.authentication_request().await.unwrap().unwrap();
        assert_eq!(request["method"], "auth");
    }
}
