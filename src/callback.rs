//! Registry of pending invocation callbacks.

use crate::{error::InvocationError, value::Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::*;

/// Outcome of a tracked invocation.
///
/// Carries the completion's result or error, or the teardown reason when the
/// connection closed before the server replied.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl CompletionResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn into_result(self) -> Result<Option<Value>, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

/// One-shot handle resolved by the matching completion message.
pub struct PendingInvocation {
    invocation_id: String,
    receiver: flume::Receiver<CompletionResult>,
}

impl PendingInvocation {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Waits for the invocation to complete.
    ///
    /// Resolves with an error-carrying [`CompletionResult`] if the connection
    /// closes first; [`InvocationError::ConnectionDropped`] only occurs when
    /// the owning connection was dropped entirely.
    pub async fn response(self) -> Result<CompletionResult, InvocationError> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| InvocationError::ConnectionDropped)
    }
}

/// Maps generated invocation ids to their completion slots.
///
/// The lock is held only across map mutation. Slots are always resolved
/// outside of it so that a resolution observed by user code can re-enter the
/// manager without deadlocking.
#[derive(Default)]
pub(crate) struct CallbackManager {
    callbacks: Mutex<HashMap<String, flume::Sender<CompletionResult>>>,
    next_id: AtomicU64,
}

impl CallbackManager {
    /// Reserves the next invocation id and its completion slot.
    pub(crate) fn register_callback(&self) -> (String, PendingInvocation) {
        let invocation_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (sender, receiver) = flume::bounded(1);

        self.callbacks
            .lock()
            .unwrap()
            .insert(invocation_id.clone(), sender);

        (
            invocation_id.clone(),
            PendingInvocation {
                invocation_id,
                receiver,
            },
        )
    }

    /// Resolves the callback registered under `invocation_id`.
    ///
    /// Returns `false` if the id is unknown, which is not a fault of the
    /// connection.
    pub(crate) fn invoke_callback(
        &self,
        invocation_id: &str,
        payload: CompletionResult,
        remove_callback: bool,
    ) -> bool {
        let sender = {
            let mut callbacks = self.callbacks.lock().unwrap();
            let sender = if remove_callback {
                callbacks.remove(invocation_id)
            } else {
                callbacks.get(invocation_id).cloned()
            };
            match sender {
                Some(sender) => sender,
                None => return false,
            }
        };

        if sender.try_send(payload).is_err() {
            warn!(%invocation_id, "completion received for a dropped invocation");
        }
        true
    }

    /// Erases a callback without resolving it.
    pub(crate) fn remove_callback(&self, invocation_id: &str) -> bool {
        self.callbacks.lock().unwrap().remove(invocation_id).is_some()
    }

    /// Resolves every pending callback with `reason` and empties the registry.
    pub(crate) fn clear(&self, reason: &str) {
        let pending: Vec<_> = {
            let mut callbacks = self.callbacks.lock().unwrap();
            callbacks.drain().collect()
        };

        for (_, sender) in pending {
            let _ = sender.try_send(CompletionResult {
                result: None,
                error: Some(reason.to_owned()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn concurrent_registrations_yield_unique_ids() {
        let manager = Arc::new(CallbackManager::default());
        let mut workers = Vec::new();

        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            workers.push(std::thread::spawn(move || {
                (0..50)
                    .map(|_| manager.register_callback().0)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(seen.insert(id), "duplicate invocation id");
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let manager = CallbackManager::default();
        let first: u64 = manager.register_callback().0.parse().unwrap();
        let second: u64 = manager.register_callback().0.parse().unwrap();
        assert!(second > first);
    }

    #[test]
    fn invoking_unknown_id_returns_false_without_side_effects() {
        let manager = CallbackManager::default();
        let (id, pending) = manager.register_callback();

        let payload = CompletionResult {
            result: None,
            error: None,
        };
        assert!(!manager.invoke_callback("no-such-id", payload.clone(), true));

        // The registered callback is untouched and still resolvable.
        assert!(manager.invoke_callback(&id, payload, true));
        drop(pending);
    }

    #[tokio::test]
    async fn invoked_callback_resolves_with_payload() {
        let manager = CallbackManager::default();
        let (id, pending) = manager.register_callback();

        let payload = CompletionResult {
            result: Some(Value::from(5i32)),
            error: None,
        };
        assert!(manager.invoke_callback(&id, payload.clone(), true));
        assert_eq!(pending.response().await.unwrap(), payload);

        // Removed on resolution, a second completion finds nothing.
        assert!(!manager.invoke_callback(
            &id,
            CompletionResult {
                result: None,
                error: None,
            },
            true
        ));
    }

    #[tokio::test]
    async fn clear_resolves_every_pending_callback_exactly_once() {
        let manager = CallbackManager::default();
        let (_, first) = manager.register_callback();
        let (_, second) = manager.register_callback();

        manager.clear("connection lost");

        for pending in [first, second] {
            let completion = pending.response().await.unwrap();
            assert_eq!(completion.error.as_deref(), Some("connection lost"));
        }

        assert!(manager.callbacks.lock().unwrap().is_empty());
    }

    #[test]
    fn removed_callback_is_not_invoked() {
        let manager = CallbackManager::default();
        let (id, pending) = manager.register_callback();

        assert!(manager.remove_callback(&id));
        assert!(!manager.remove_callback(&id));
        assert!(!manager.invoke_callback(
            &id,
            CompletionResult {
                result: None,
                error: None,
            },
            true
        ));
        drop(pending);
    }
}
