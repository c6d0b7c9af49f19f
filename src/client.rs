//! Client side of the procedure protocol.
//!
//! Everything goes through the broker; the client never talks to the
//! manager directly.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, Subscription};
use crate::endpoints;
use crate::error::BrokerError;
use crate::messages::{
    ArgsKwargs, ProcedureAbort, ProcedureClearUnhandled, ProcedureExecution, ProcedureRequest,
    QueueNotification, RequestResponse,
};
use crate::queue::ExecutionQueueHelper;

pub struct ProcedureClient {
    helper: ExecutionQueueHelper,
}

impl ProcedureClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            helper: ExecutionQueueHelper::new(broker),
        }
    }

    fn broker(&self) -> &Arc<dyn Broker> {
        self.helper.broker()
    }

    async fn send<T: serde::Serialize>(&self, channel: &str, message: &T) -> Result<(), BrokerError> {
        self.broker()
            .publish(channel, &serde_json::to_string(message)?)
            .await
    }

    /// Ask for `identifier` to run on `queue` (the manager's default queue
    /// when `None`).
    pub async fn request(
        &self,
        identifier: &str,
        args_kwargs: Option<ArgsKwargs>,
        queue: Option<&str>,
    ) -> Result<(), BrokerError> {
        let request = ProcedureRequest {
            identifier: identifier.to_string(),
            args_kwargs,
            queue: queue.map(str::to_string),
        };
        self.send(endpoints::PROCEDURE_REQUEST, &request).await
    }

    /// Send a request and wait up to `timeout` for the next acknowledgement.
    ///
    /// Acknowledgements carry no request id, so with several concurrent
    /// clients the one received may belong to someone else.
    pub async fn request_and_wait(
        &self,
        identifier: &str,
        args_kwargs: Option<ArgsKwargs>,
        queue: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<RequestResponse>, BrokerError> {
        let mut responses = self.subscribe_responses().await?;
        self.request(identifier, args_kwargs, queue).await?;
        let Ok(received) = tokio::time::timeout(timeout, responses.recv()).await else {
            return Ok(None);
        };
        let payload = received.ok_or_else(|| BrokerError::SubscriptionClosed {
            channel: responses.channel().to_string(),
        })?;
        Ok(Some(serde_json::from_str(&payload)?))
    }

    pub async fn subscribe_responses(&self) -> Result<Subscription, BrokerError> {
        self.broker()
            .subscribe(endpoints::PROCEDURE_REQUEST_RESPONSE)
            .await
    }

    /// Notifications about queue changes, raw. Decode with [`decode_notification`].
    pub async fn subscribe_notifications(&self) -> Result<Subscription, BrokerError> {
        self.broker()
            .subscribe(endpoints::PROCEDURE_QUEUE_NOTIFICATION)
            .await
    }

    pub async fn abort_execution(&self, execution_id: &str) -> Result<(), BrokerError> {
        let message = ProcedureAbort {
            execution_id: Some(execution_id.to_string()),
            ..Default::default()
        };
        self.send(endpoints::PROCEDURE_ABORT, &message).await
    }

    pub async fn abort_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let message = ProcedureAbort {
            queue: Some(queue.to_string()),
            ..Default::default()
        };
        self.send(endpoints::PROCEDURE_ABORT, &message).await
    }

    pub async fn abort_all(&self) -> Result<(), BrokerError> {
        let message = ProcedureAbort {
            abort_all: true,
            ..Default::default()
        };
        self.send(endpoints::PROCEDURE_ABORT, &message).await
    }

    pub async fn clear_unhandled_execution(&self, execution_id: &str) -> Result<(), BrokerError> {
        let message = ProcedureClearUnhandled {
            execution_id: Some(execution_id.to_string()),
            ..Default::default()
        };
        self.send(endpoints::PROCEDURE_CLEAR_UNHANDLED, &message).await
    }

    pub async fn clear_unhandled_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let message = ProcedureClearUnhandled {
            queue: Some(queue.to_string()),
            ..Default::default()
        };
        self.send(endpoints::PROCEDURE_CLEAR_UNHANDLED, &message).await
    }

    pub async fn clear_all_unhandled(&self) -> Result<(), BrokerError> {
        let message = ProcedureClearUnhandled {
            abort_all: true,
            ..Default::default()
        };
        self.send(endpoints::PROCEDURE_CLEAR_UNHANDLED, &message).await
    }

    pub async fn pending(&self, queue: &str) -> Result<Vec<ProcedureExecution>, BrokerError> {
        self.helper.pending(queue).await
    }

    pub async fn unhandled(&self, queue: &str) -> Result<Vec<ProcedureExecution>, BrokerError> {
        self.helper.unhandled(queue).await
    }

    pub async fn active(&self, queue: Option<&str>) -> Result<Vec<ProcedureExecution>, BrokerError> {
        self.helper.active(queue).await
    }

    /// Identifiers the manager published at startup.
    pub async fn available_procedures(&self) -> Result<Vec<String>, BrokerError> {
        self.helper.available().await
    }
}

pub fn decode_notification(payload: &str) -> Result<QueueNotification, BrokerError> {
    Ok(serde_json::from_str(payload)?)
}
