//! Notification and indication subscriptions.
//!
//! Subscribing is a two-step affair: local delivery is switched on in the
//! session, then the peripheral's CCC descriptor is written. The
//! characteristic only counts as notifying once the peripheral confirms the
//! descriptor write; that confirmation is the only thing that changes the
//! subscription set.

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::backend::GattBackend;
use crate::ble::connection::Shared;
use crate::ble::events::ConnectionEventKind;
use crate::ble::gatt::{CharacteristicKey, CharacteristicRef, GattStatus, PeripheralAddress, SessionId};
use crate::ble::session::Session;
use crate::ble::uuids::{
    is_cccd, CCCD_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE,
};
use crate::error::{Error, Result};

/// Result of applying a descriptor write confirmation to a session.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DescriptorOutcome {
    Event(ConnectionEventKind),
    Ignored,
    Failed,
}

/// Choose the CCCD value that enables pushes for a characteristic.
///
/// Indications win over notifications when both are supported.
pub fn enable_value(characteristic: &CharacteristicRef) -> Option<[u8; 2]> {
    let properties = characteristic.properties;
    if properties.is_indicatable() {
        Some(ENABLE_INDICATION_VALUE)
    } else if properties.is_notifiable() {
        Some(ENABLE_NOTIFICATION_VALUE)
    } else {
        None
    }
}

/// Toggles notifications/indications on a connection's sessions.
pub struct NotificationController<B: GattBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: GattBackend> Clone for NotificationController<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: GattBackend> NotificationController<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>) -> Self {
        Self { shared }
    }

    /// Enable notifications (or indications) for a characteristic.
    ///
    /// `NotificationsEnabled` follows once the peripheral confirms.
    pub fn enable(&self, address: &PeripheralAddress, characteristic: &CharacteristicRef) -> Result<()> {
        let payload = enable_value(characteristic).ok_or_else(|| {
            error!(
                "{} doesn't support notifications/indications",
                characteristic.uuid
            );
            unsupported(characteristic)
        })?;

        self.toggle(address, characteristic, true, payload)
    }

    /// Disable notifications and indications for a characteristic.
    ///
    /// `NotificationsDisabled` follows once the peripheral confirms.
    pub fn disable(&self, address: &PeripheralAddress, characteristic: &CharacteristicRef) -> Result<()> {
        if !characteristic.properties.supports_notifications() {
            error!(
                "{} doesn't support notifications/indications",
                characteristic.uuid
            );
            return Err(unsupported(characteristic));
        }

        self.toggle(address, characteristic, false, DISABLE_NOTIFICATION_VALUE)
    }

    /// Check if the peripheral confirmed notifications for a characteristic.
    pub fn is_notifying(&self, address: &PeripheralAddress, uuid: &Uuid) -> bool {
        self.shared
            .sessions
            .read()
            .get(address)
            .map_or(false, |s| s.subscriptions.iter().any(|k| k.uuid == *uuid))
    }

    fn toggle(
        &self,
        address: &PeripheralAddress,
        characteristic: &CharacteristicRef,
        enabled: bool,
        payload: [u8; 2],
    ) -> Result<()> {
        let key = characteristic.key();

        let session_id = {
            let mut sessions = self.shared.sessions.write();
            let session = sessions
                .get_mut(address)
                .filter(|s| s.state.is_ready())
                .ok_or(Error::NotConnected)?;

            if session.is_busy(&key) {
                return Err(Error::OperationInFlight {
                    uuid: characteristic.uuid.to_string(),
                });
            }
            session.pending_descriptors.insert(key, payload.to_vec());
            session.id
        };

        let backend = &self.shared.backend;

        if !backend.set_notification(address, characteristic, enabled) {
            error!("set_notification({}) failed for {}", enabled, characteristic.uuid);
            self.clear_pending(address, session_id, &key);
            return Err(Error::LocalEnableFailed {
                uuid: characteristic.uuid.to_string(),
            });
        }

        let Some(cccd) = characteristic.descriptor(&CCCD_UUID) else {
            error!("{} doesn't contain the CCC descriptor", characteristic.uuid);
            if enabled {
                backend.set_notification(address, characteristic, false);
            }
            self.clear_pending(address, session_id, &key);
            return Err(Error::MissingDescriptor {
                uuid: characteristic.uuid.to_string(),
            });
        };

        debug!(
            "Writing {:02X?} to CCCD of {} on {}",
            payload, characteristic.uuid, address
        );

        if let Err(e) =
            backend.write_descriptor(address, session_id, characteristic, cccd.uuid, &payload)
        {
            warn!("CCCD write for {} not enqueued: {}", characteristic.uuid, e);
            self.clear_pending(address, session_id, &key);
            return Err(e);
        }

        Ok(())
    }

    fn clear_pending(&self, address: &PeripheralAddress, session_id: SessionId, key: &CharacteristicKey) {
        if let Some(session) = self.shared.sessions.write().get_mut(address) {
            if session.id == session_id {
                session.pending_descriptors.remove(key);
            }
        }
    }
}

/// Apply a descriptor write confirmation to a session's subscription set.
pub(crate) fn apply_descriptor_write(
    session: &mut Session,
    key: &CharacteristicKey,
    descriptor: &Uuid,
    status: &GattStatus,
    value: &[u8],
) -> DescriptorOutcome {
    if !is_cccd(descriptor) {
        debug!("Descriptor {} on {} written", descriptor, key);
        return DescriptorOutcome::Ignored;
    }

    if session.pending_descriptors.remove(key).is_none() {
        debug!("Unsolicited CCCD confirmation for {} on {}", key, session.address);
    }

    if !status.is_success() {
        warn!(
            "CCCD write for {} on {} failed: {}",
            key, session.address, status
        );
        return DescriptorOutcome::Failed;
    }

    if value == DISABLE_NOTIFICATION_VALUE {
        session.subscriptions.remove(key);
        info!("Disabled notifications on {}", key.uuid);
        DescriptorOutcome::Event(ConnectionEventKind::NotificationsDisabled { uuid: key.uuid })
    } else if value == ENABLE_NOTIFICATION_VALUE || value == ENABLE_INDICATION_VALUE {
        session.subscriptions.insert(*key);
        info!("Enabled notifications on {}", key.uuid);
        DescriptorOutcome::Event(ConnectionEventKind::NotificationsEnabled { uuid: key.uuid })
    } else {
        warn!("Unexpected CCCD value {:02X?} for {}", value, key);
        DescriptorOutcome::Ignored
    }
}

fn unsupported(characteristic: &CharacteristicRef) -> Error {
    Error::UnsupportedOperation {
        uuid: characteristic.uuid.to_string(),
        operation: "notifications/indications".to_string(),
    }
}
