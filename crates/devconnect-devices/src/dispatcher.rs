/*!
 * Command dispatcher.
 *
 * Turns a generic request into a device operation. Checks run in a fixed
 * order and every failure before the driver call is synchronous:
 *
 * 1. empty service id
 * 2. unknown device (no transport interaction)
 * 3. profile, attribute and action support
 * 4. parameter rules
 * 5. connection state (leaving a stream is allowed while offline)
 *
 * Fire-and-forget mutations and queries run under the device's lock and
 * return immediately. One-shot commands register with the correlator, are
 * sent while still holding the lock, and hand back a [`PendingHandle`].
 */
use std::sync::Arc;

use tracing::{debug, instrument};

use devconnect_core::{
    config::CorrelatorConfig,
    event::Capability,
    message::Request,
    types::{Params, ServiceId},
};

use crate::correlator::{Correlator, PendingHandle};
use crate::device::{DeviceError, Result};
use crate::profile::{OperationKind, ProfileSet, RetryBudget};
use crate::registry::{DeviceRegistry, DeviceSlot};
use crate::transport::{Frame, FramePayload};

/// Result of issuing a request
#[derive(Debug)]
pub enum Issued {
    /// Done; the payload is the answer
    Immediate(Params),
    /// Sent; the answer arrives through the handle
    Pending {
        /// Completion handle
        handle: PendingHandle,
        /// Operation name, needed to decode the reply
        operation: &'static str,
    },
    /// Validated event registration; the caller attaches a listener
    Subscribe {
        /// Stream to subscribe to
        capability: Capability,
        /// Subscription parameters
        params: Params,
    },
    /// Validated event unregistration
    Unsubscribe {
        /// Stream to leave
        capability: Capability,
    },
}

/// Command dispatcher
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    profiles: Arc<ProfileSet>,
    correlator: Correlator,
    budget: CorrelatorConfig,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        registry: Arc<DeviceRegistry>,
        profiles: Arc<ProfileSet>,
        correlator: Correlator,
        budget: CorrelatorConfig,
    ) -> Self {
        Self {
            registry,
            profiles,
            correlator,
            budget,
        }
    }

    /// The profile tables
    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    /// Validate a request and carry it out
    #[instrument(skip(self, request), fields(service_id = %request.service_id, path = %request.path(), action = %request.action))]
    pub async fn issue(&self, request: &Request) -> Result<Issued> {
        if request.service_id.is_empty() {
            return Err(DeviceError::EmptyServiceId);
        }
        let slot = self.registry.find(&request.service_id)?;

        let resolved = self.profiles.resolve(request)?;
        if !slot.info().supports_profile(resolved.profile) {
            return Err(DeviceError::NotSupportProfile(format!(
                "{} on {}",
                resolved.profile, request.service_id
            )));
        }
        let operation = resolved.operation;
        operation.validate(&request.params)?;

        if operation.kind != OperationKind::Unsubscribe && !slot.is_online() {
            return Err(DeviceError::NotConnected(request.service_id.to_string()));
        }

        let capability = resolved.capability();
        match operation.kind {
            OperationKind::Apply => {
                let mut guard = slot.lock_driver().await;
                let driver = guard
                    .as_mut()
                    .ok_or_else(|| DeviceError::NotConnected(format!("{} has no driver", slot.id())))?;
                driver.apply(operation.name, &request.params).await?;
                debug!(operation = operation.name, "Applied");
                Ok(Issued::Immediate(Params::new()))
            }
            OperationKind::Query => {
                let mut guard = slot.lock_driver().await;
                let driver = guard
                    .as_mut()
                    .ok_or_else(|| DeviceError::NotConnected(format!("{} has no driver", slot.id())))?;
                let payload = driver.query(operation.name, &request.params).await?;
                Ok(Issued::Immediate(payload))
            }
            OperationKind::OneShot(budget) => {
                let handle = self
                    .send_one_shot(&slot, &capability, operation.name, &request.params, budget)
                    .await?;
                Ok(Issued::Pending {
                    handle,
                    operation: operation.name,
                })
            }
            OperationKind::Subscribe => Ok(Issued::Subscribe {
                capability,
                params: operation.declared(&request.params),
            }),
            OperationKind::Unsubscribe => Ok(Issued::Unsubscribe { capability }),
        }
    }

    /// Decode the reply to a one-shot command
    pub async fn decode(
        &self,
        service_id: &ServiceId,
        operation: &str,
        body: &FramePayload,
    ) -> Result<Params> {
        let slot = self.registry.find(service_id)?;
        let mut guard = slot.lock_driver().await;
        let driver = guard
            .as_mut()
            .ok_or_else(|| DeviceError::NotConnected(format!("{} has no driver", service_id)))?;
        driver.decode(operation, body)
    }

    fn max_retries(&self, budget: RetryBudget) -> u32 {
        match budget {
            RetryBudget::Default => self.budget.nack_retries,
            RetryBudget::Parameter => self.budget.parameter_attempts.saturating_sub(1),
            RetryBudget::None => 0,
        }
    }

    async fn send_one_shot(
        &self,
        slot: &DeviceSlot,
        capability: &Capability,
        operation: &'static str,
        params: &Params,
        budget: RetryBudget,
    ) -> Result<PendingHandle> {
        let transport = slot
            .transport()
            .ok_or_else(|| DeviceError::NotConnected(format!("{} has no transport", slot.id())))?;

        let mut guard = slot.lock_driver().await;
        let driver = guard
            .as_mut()
            .ok_or_else(|| DeviceError::NotConnected(format!("{} has no driver", slot.id())))?;
        let payload = driver.encode(operation, params)?;

        let handle = self
            .correlator
            .register(slot.id(), capability, self.max_retries(budget));
        let frame = Frame {
            request_id: Some(handle.id()),
            service_id: slot.id().clone(),
            command: operation.to_string(),
            payload,
        };
        self.correlator.arm(handle.id(), frame.clone(), transport.acknowledges());

        if let Err(e) = transport.send(&frame).await {
            self.correlator.fail(handle.id(), e.clone());
            return Err(e);
        }
        debug!(request_id = %handle.id(), transport = transport.name(), "Sent {}", frame);
        Ok(handle)
    }
}
