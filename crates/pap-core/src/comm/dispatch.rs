//! Inbound message routing.
//!
//! Two stages: [`MessageTypeDispatcher`] reads the `messageName`
//! discriminator from the raw envelope and hands the message to whichever
//! listener is registered for that type; [`RequestIdDispatcher`] decodes the
//! status and routes it to the listener registered under its correlation id,
//! falling back to the anonymous listeners (heartbeat fan-out) when no id
//! matches.
//!
//! Delivery is synchronous on the caller's thread; listeners must return
//! promptly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::messages::PdpStatus;

/// Listener invoked with a decoded status message.
pub type StatusListener = std::sync::Arc<dyn Fn(&PdpStatus) + Send + Sync>;

/// Listener for one message type on the topic.
pub trait MessageListener: Send + Sync {
    /// Handle a raw envelope of the registered type.
    fn on_message(&self, raw: &serde_json::Value);
}

/// Routes raw envelopes by their type discriminator.
pub struct MessageTypeDispatcher {
    /// Path of field names leading to the discriminator.
    type_field_path: Vec<String>,
    routes: Mutex<HashMap<String, std::sync::Arc<dyn MessageListener>>>,
}

impl MessageTypeDispatcher {
    /// Create a dispatcher reading the discriminator at the given field
    /// path.
    #[must_use]
    pub fn new(type_field_path: &[&str]) -> Self {
        Self {
            type_field_path: type_field_path.iter().map(ToString::to_string).collect(),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Register the listener for a message type, replacing any prior one.
    pub fn register(&self, msg_type: impl Into<String>, listener: std::sync::Arc<dyn MessageListener>) {
        self.routes
            .lock()
            .expect("lock poisoned")
            .insert(msg_type.into(), listener);
    }

    /// Remove the listener for a message type; unknown types are ignored.
    pub fn unregister(&self, msg_type: &str) {
        self.routes.lock().expect("lock poisoned").remove(msg_type);
    }

    /// Decode and route one line received from the topic.
    pub fn on_receive(&self, text: &str) {
        let raw: serde_json::Value = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "discarding unparseable message");
                return;
            }
        };

        let mut field = &raw;
        for name in &self.type_field_path {
            field = &field[name.as_str()];
        }

        let Some(msg_type) = field.as_str() else {
            warn!("discarding message without a type discriminator");
            return;
        };

        let listener = self
            .routes
            .lock()
            .expect("lock poisoned")
            .get(msg_type)
            .cloned();

        match listener {
            Some(listener) => listener.on_message(&raw),
            None => debug!(msg_type, "no listener for message type"),
        }
    }
}

/// Routes decoded status messages to per-request-id listeners.
#[derive(Default)]
pub struct RequestIdDispatcher {
    listeners: Mutex<HashMap<String, StatusListener>>,
    anonymous: Mutex<HashMap<u64, StatusListener>>,
    next_anonymous_id: AtomicU64,
}

impl RequestIdDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the listener for a request id, replacing any prior one.
    pub fn register(&self, request_id: impl Into<String>, listener: StatusListener) {
        self.listeners
            .lock()
            .expect("lock poisoned")
            .insert(request_id.into(), listener);
    }

    /// Remove the listener for a request id; unknown ids are ignored.
    pub fn unregister(&self, request_id: &str) {
        self.listeners
            .lock()
            .expect("lock poisoned")
            .remove(request_id);
    }

    /// Register a listener for statuses that match no request id.
    ///
    /// Returns a key for [`unregister_anonymous`](Self::unregister_anonymous).
    pub fn register_anonymous(&self, listener: StatusListener) -> u64 {
        let key = self.next_anonymous_id.fetch_add(1, Ordering::Relaxed);
        self.anonymous
            .lock()
            .expect("lock poisoned")
            .insert(key, listener);
        key
    }

    /// Remove an anonymous listener.
    pub fn unregister_anonymous(&self, key: u64) {
        self.anonymous.lock().expect("lock poisoned").remove(&key);
    }

    /// Route one decoded status.
    pub fn on_status(&self, status: &PdpStatus) {
        if let Some(request_id) = status.response_to() {
            let listener = self
                .listeners
                .lock()
                .expect("lock poisoned")
                .get(request_id)
                .cloned();

            if let Some(listener) = listener {
                trace!(request_id, "routing response to registered listener");
                listener(status);
                return;
            }

            debug!(request_id, "no listener for response; treating as anonymous");
        }

        let listeners: Vec<StatusListener> = self
            .anonymous
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(status);
        }
    }
}

impl MessageListener for RequestIdDispatcher {
    fn on_message(&self, raw: &serde_json::Value) {
        match serde_json::from_value::<PdpStatus>(raw.clone()) {
            Ok(status) => self.on_status(&status),
            Err(err) => warn!(error = %err, "discarding undecodable status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::messages::{MSG_PDP_STATUS, MSG_TYPE_FIELD};

    fn recorder() -> (StatusListener, Arc<StdMutex<Vec<String>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let listener: StatusListener = {
            let seen = Arc::clone(&seen);
            Arc::new(move |status: &PdpStatus| {
                seen.lock()
                    .unwrap()
                    .push(status.name.clone().unwrap_or_default());
            })
        };
        (listener, seen)
    }

    fn status_json(name: &str, response_to: Option<&str>) -> String {
        let mut value = serde_json::json!({
            "messageName": MSG_PDP_STATUS,
            "name": name,
            "state": "ACTIVE",
        });
        if let Some(response_to) = response_to {
            value["response"] = serde_json::json!({ "responseTo": response_to });
        }
        value.to_string()
    }

    fn wired() -> (MessageTypeDispatcher, Arc<RequestIdDispatcher>) {
        let request_ids = Arc::new(RequestIdDispatcher::new());
        let dispatcher = MessageTypeDispatcher::new(&[MSG_TYPE_FIELD]);
        dispatcher.register(MSG_PDP_STATUS, request_ids.clone());
        (dispatcher, request_ids)
    }

    #[test]
    fn test_response_routed_by_request_id() {
        let (dispatcher, request_ids) = wired();
        let (listener, seen) = recorder();
        let (other_listener, other_seen) = recorder();

        request_ids.register("req-1", listener);
        request_ids.register("req-2", other_listener);

        dispatcher.on_receive(&status_json("pdp_1", Some("req-1")));

        assert_eq!(*seen.lock().unwrap(), vec!["pdp_1"]);
        assert!(other_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unmatched_response_goes_to_anonymous() {
        let (dispatcher, request_ids) = wired();
        let (listener, seen) = recorder();
        request_ids.register_anonymous(listener);

        dispatcher.on_receive(&status_json("pdp_1", Some("unknown")));
        dispatcher.on_receive(&status_json("pdp_2", None));

        assert_eq!(*seen.lock().unwrap(), vec!["pdp_1", "pdp_2"]);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let (dispatcher, request_ids) = wired();
        let (listener, seen) = recorder();

        request_ids.register("req-1", listener.clone());
        request_ids.unregister("req-1");
        dispatcher.on_receive(&status_json("pdp_1", Some("req-1")));
        assert!(seen.lock().unwrap().is_empty());

        let key = request_ids.register_anonymous(listener);
        request_ids.unregister_anonymous(key);
        dispatcher.on_receive(&status_json("pdp_1", None));
        assert!(seen.lock().unwrap().is_empty());

        // unregistering twice is fine
        request_ids.unregister("req-1");
    }

    #[test]
    fn test_register_replaces_prior_listener(){
        let (dispatcher, request_ids) = wired();
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();

        request_ids.register("req-1", first);
        request_ids.register("req-1", second);

        dispatcher.on_receive(&status_json("pdp_1", Some("req-1")));
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(*second_seen.lock().unwrap(), vec!["pdp_1"]);
    }

    #[test]
    fn test_garbage_and_unknown_types_ignored() {
        let (dispatcher, request_ids) = wired();
        let (listener, seen) = recorder();
        request_ids.register_anonymous(listener);

        dispatcher.on_receive("not json");
        dispatcher.on_receive(r#"{"noDiscriminator": true}"#);
        dispatcher.on_receive(r#"{"messageName": "PDP_UPDATE", "name": "pdp_1"}"#);

        assert!(seen.lock().unwrap().is_empty());
    }
}
