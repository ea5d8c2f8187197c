use crate::pending::MessageMatcher;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Inbound data handed to a subscription callback
#[derive(Debug, Clone, Copy)]
pub struct DataEvent<'a> {
    pub connection_id: u64,
    pub subscription_id: u64,
    pub data: &'a Value,
    pub raw: &'a str,
}

pub type DataCallback = Arc<dyn Fn(&DataEvent<'_>) + Send + Sync>;

/// Lifecycle changes reported for user subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Server acknowledged the request (or no request was needed)
    Confirmed,
    /// Server refused the request or never answered
    Rejected,
    /// Removed by the caller
    Unsubscribed,
    /// Owning connection closed for good
    Closed,
}

/// What to subscribe to and where
///
/// ```ignore
/// let request = SubscribeRequest::with_request(url, json!({"method": "SUBSCRIBE", "params": ["btcusdt@trade"], "id": 1}))
///     .filter(|msg| msg["s"] == "BTCUSDT");
/// ```
#[derive(Clone)]
pub struct SubscribeRequest {
    pub url: String,
    pub request: Option<Value>,
    pub identifier: Option<String>,
    pub filter: Option<MessageMatcher>,
    pub authenticated: bool,
}

impl SubscribeRequest {
    /// Subscription established by sending `request` and awaiting its answer
    pub fn with_request(url: impl Into<String>, request: Value) -> Self {
        Self {
            url: url.into(),
            request: Some(request),
            identifier: None,
            filter: None,
            authenticated: false,
        }
    }

    /// Subscription that needs nothing sent (the stream is implied by the URL)
    pub fn with_identifier(url: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request: None,
            identifier: Some(identifier.into()),
            filter: None,
            authenticated: false,
        }
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }
}

impl std::fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("url", &self.url)
            .field("request", &self.request)
            .field("identifier", &self.identifier)
            .field("filtered", &self.filter.is_some())
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

/// A standing registration owned by one connection
pub struct Subscription {
    id: u64,
    request: Option<Value>,
    identifier: Option<String>,
    filter: Option<MessageMatcher>,
    callback: DataCallback,
    authenticated: bool,
    user: bool,
    confirmed: AtomicBool,
}

impl Subscription {
    /// Caller-visible subscription
    pub fn new(id: u64, request: &SubscribeRequest, callback: DataCallback) -> Self {
        Self {
            id,
            request: request.request.clone(),
            identifier: request.identifier.clone(),
            filter: request.filter.clone(),
            callback,
            authenticated: request.authenticated,
            user: true,
            confirmed: AtomicBool::new(false),
        }
    }

    /// Housekeeping handler; never counted as load and never resubscribed
    pub fn internal(id: u64, filter: Option<MessageMatcher>, callback: DataCallback) -> Self {
        Self {
            id,
            request: None,
            identifier: None,
            filter,
            callback,
            authenticated: false,
            user: false,
            confirmed: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> Option<&Value> {
        self.request.as_ref()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_user(&self) -> bool {
        self.user
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    pub fn set_confirmed(&self, confirmed: bool) {
        self.confirmed.store(confirmed, Ordering::Release);
    }

    /// Confirmed and established through a request, so a new socket needs it resent
    pub fn needs_resubscribe(&self) -> bool {
        self.request.is_some() && self.is_confirmed()
    }

    /// No filter accepts everything
    pub fn accepts(&self, message: &Value) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(message))
    }

    pub fn deliver(&self, event: &DataEvent<'_>) {
        (self.callback)(event);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("identifier", &self.identifier)
            .field("user", &self.user)
            .field("confirmed", &self.is_confirmed())
            .finish()
    }
}
