//! Actor-call transport.
//!
//! Wraps the host RPC substrate behind [`ActorCall`] and binds it to one
//! peer actor. Delivery policy lives here: fire-and-forget sends swallow
//! failures (the data plane is at-least-once), synchronous calls collapse
//! every failure mode (RPC error, remote exception, the reserved 4-byte
//! "not yet initialized" reply) into `None` so callers can retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::message::ActorId;

/// Reserved reply width meaning "peer not yet initialized, retry".
///
/// Handlers must never produce a legitimate reply of exactly this size; all
/// protocol replies are header-sized (68+ bytes).
pub const NOT_READY_REPLY_LEN: usize = 4;

/// A named remote function descriptor, the unit the host RPC layer
/// dispatches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallFunction {
    name: &'static str,
}

impl CallFunction {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The host RPC substrate: submits a task on a peer actor, optionally
/// waiting for its single return value.
pub trait ActorCall: Send + Sync {
    /// Submits a one-way actor task.
    fn submit(&self, peer: ActorId, function: &CallFunction, payload: Vec<u8>) -> Result<()>;

    /// Submits an actor task and waits up to `timeout` for its reply.
    fn submit_for_result(
        &self,
        peer: ActorId,
        function: &CallFunction,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>>;
}

/// A transport bound to one peer actor.
#[derive(Clone)]
pub struct Transport {
    caller: Arc<dyn ActorCall>,
    peer_actor_id: ActorId,
}

impl Transport {
    pub fn new(caller: Arc<dyn ActorCall>, peer_actor_id: ActorId) -> Self {
        Self {
            caller,
            peer_actor_id,
        }
    }

    pub fn peer_actor_id(&self) -> ActorId {
        self.peer_actor_id
    }

    /// Fire-and-forget send. Failures are logged and dropped; recovery is
    /// the data plane's at-least-once machinery, not the transport's.
    pub fn send(&self, payload: Vec<u8>, function: &CallFunction) {
        if let Err(err) = self.caller.submit(self.peer_actor_id, function, payload) {
            warn!(peer = %self.peer_actor_id, function = function.name(), %err, "send failed");
        }
    }

    /// One synchronous attempt. Returns `None` on RPC failure, remote
    /// exception, or the reserved not-ready reply.
    pub fn send_for_result(
        &self,
        payload: &[u8],
        function: &CallFunction,
        timeout: Duration,
    ) -> Option<Vec<u8>> {
        match self
            .caller
            .submit_for_result(self.peer_actor_id, function, payload, timeout)
        {
            Ok(reply) if reply.len() == NOT_READY_REPLY_LEN => {
                warn!(peer = %self.peer_actor_id, "peer not ready yet, should retry");
                None
            }
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!(peer = %self.peer_actor_id, function = function.name(), %err, "call failed");
                None
            }
        }
    }

    /// Loops [`send_for_result`](Self::send_for_result) up to `retries`
    /// times, returning the first reply.
    pub fn send_for_result_with_retry(
        &self,
        payload: &[u8],
        function: &CallFunction,
        retries: u32,
        timeout: Duration,
    ) -> Option<Vec<u8>> {
        for _ in 0..retries {
            if let Some(reply) = self.send_for_result(payload, function, timeout) {
                return Some(reply);
            }
        }
        info!(
            peer = %self.peer_actor_id,
            function = function.name(),
            retries,
            "no reply after retry"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replies with the not-ready sentinel for the first `ready_after`
    /// attempts, then with a fixed payload.
    struct FlakyPeer {
        attempts: AtomicU32,
        ready_after: u32,
    }

    impl ActorCall for FlakyPeer {
        fn submit(&self, _peer: ActorId, _function: &CallFunction, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }

        fn submit_for_result(
            &self,
            _peer: ActorId,
            _function: &CallFunction,
            _payload: &[u8],
            _timeout: Duration,
        ) -> Result<Vec<u8>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.ready_after {
                Ok(vec![0; NOT_READY_REPLY_LEN])
            } else {
                Ok(vec![9; 16])
            }
        }
    }

    struct DeadPeer;

    impl ActorCall for DeadPeer {
        fn submit(&self, _peer: ActorId, _function: &CallFunction, _payload: Vec<u8>) -> Result<()> {
            Err(TransferError::IoError("down".into()))
        }

        fn submit_for_result(
            &self,
            _peer: ActorId,
            _function: &CallFunction,
            _payload: &[u8],
            _timeout: Duration,
        ) -> Result<Vec<u8>> {
            Err(TransferError::IoError("down".into()))
        }
    }

    const FUNC: CallFunction = CallFunction::new("peer_sync");

    #[test]
    fn test_not_ready_reply_maps_to_none() {
        let transport = Transport::new(
            Arc::new(FlakyPeer {
                attempts: AtomicU32::new(0),
                ready_after: 1,
            }),
            ActorId::random(),
        );
        assert!(transport
            .send_for_result(&[1], &FUNC, Duration::from_millis(10))
            .is_none());
        assert_eq!(
            transport
                .send_for_result(&[1], &FUNC, Duration::from_millis(10))
                .unwrap(),
            vec![9; 16]
        );
    }

    #[test]
    fn test_retry_until_ready() {
        let transport = Transport::new(
            Arc::new(FlakyPeer {
                attempts: AtomicU32::new(0),
                ready_after: 3,
            }),
            ActorId::random(),
        );
        let reply = transport
            .send_for_result_with_retry(&[1], &FUNC, 10, Duration::from_millis(10))
            .unwrap();
        assert_eq!(reply, vec![9; 16]);
    }

    #[test]
    fn test_retry_exhaustion_returns_none() {
        let transport = Transport::new(
            Arc::new(FlakyPeer {
                attempts: AtomicU32::new(0),
                ready_after: 100,
            }),
            ActorId::random(),
        );
        assert!(transport
            .send_for_result_with_retry(&[1], &FUNC, 3, Duration::from_millis(10))
            .is_none());
    }

    #[test]
    fn test_send_swallows_failure() {
        let transport = Transport::new(Arc::new(DeadPeer), ActorId::random());
        transport.send(vec![1, 2, 3], &FUNC);
    }
}
