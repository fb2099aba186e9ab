//! GATT link to a Galcon controller.
//!
//! [`GattLink::open`] connects and locates the three vendor characteristics,
//! disconnecting again if any step fails. Each [`ValveLink::transact`] call
//! translates one link frame into the wake / control / status GATT traffic
//! the controller expects and answers with a link frame.

use std::future::Future;
use std::time::Duration;

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;

use valvehub_app::ports::{LinkError, ValveLink};
use valvehub_domain::command::Command;
use valvehub_domain::protocol::{self, NackReason, Response};

use crate::config::BleConfig;
use crate::error::BleError;
use crate::galcon::{self, CONTROL_CHAR, STATUS_CHAR, WAKE_CHAR, WAKE_PAYLOAD};

/// Find a GATT characteristic by UUID on a peripheral that has already
/// discovered its services.
///
/// # Errors
///
/// Returns [`BleError::CharacteristicNotFound`] if no characteristic with
/// the given UUID is present.
fn find_characteristic(
    peripheral: &Peripheral,
    uuid: uuid::Uuid,
) -> Result<Characteristic, BleError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(BleError::CharacteristicNotFound { uuid })
}

/// An open GATT connection to one controller.
pub struct GattLink {
    peripheral: Peripheral,
    wake: Characteristic,
    status: Characteristic,
    control: Characteristic,
    wake_settle: Duration,
    post_command: Duration,
}

impl GattLink {
    /// Connect to `peripheral` and locate the vendor characteristics.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::Ble`] if the connection or service discovery
    /// fails and [`BleError::CharacteristicNotFound`] if the peripheral is
    /// not a Galcon controller.
    pub async fn open(peripheral: Peripheral, config: &BleConfig) -> Result<Self, BleError> {
        peripheral.connect().await?;

        match Self::locate(&peripheral).await {
            Ok((wake, status, control)) => Ok(Self {
                peripheral,
                wake,
                status,
                control,
                wake_settle: config.wake_settle(),
                post_command: config.post_command(),
            }),
            Err(err) => {
                if let Err(disconnect_err) = peripheral.disconnect().await {
                    tracing::warn!(err = %disconnect_err, "failed to disconnect controller");
                }
                Err(err)
            }
        }
    }

    async fn locate(
        peripheral: &Peripheral,
    ) -> Result<(Characteristic, Characteristic, Characteristic), BleError> {
        peripheral.discover_services().await?;
        Ok((
            find_characteristic(peripheral, WAKE_CHAR)?,
            find_characteristic(peripheral, STATUS_CHAR)?,
            find_characteristic(peripheral, CONTROL_CHAR)?,
        ))
    }

    async fn wake_up(&self) -> Result<(), BleError> {
        self.peripheral
            .write(&self.wake, &WAKE_PAYLOAD, WriteType::WithResponse)
            .await?;
        tokio::time::sleep(self.wake_settle).await;
        Ok(())
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, BleError> {
        let command = protocol::decode_command(request).map_err(BleError::BadRequest)?;
        self.wake_up().await?;

        let response = match galcon::control_payload(&command) {
            Some(payload) => self.write_control(&command, &payload).await?,
            None => {
                let data = self.peripheral.read(&self.status).await?;
                let status = galcon::parse_status(&data)?;
                tracing::debug!(
                    open = status.valve_open,
                    manual = status.manual_open,
                    remaining_secs = status.remaining_seconds,
                    battery = ?status.battery_percent,
                    "status read"
                );
                status.answer(&command)?
            }
        };
        Ok(protocol::encode_response(&response))
    }

    async fn write_control(&self, command: &Command, payload: &[u8]) -> Result<Response, BleError> {
        match self
            .peripheral
            .write(&self.control, payload, WriteType::WithResponse)
            .await
        {
            Ok(()) => {
                tracing::debug!(%command, "control written");
                tokio::time::sleep(self.post_command).await;
                Ok(Response::Ack)
            }
            Err(btleplug::Error::PermissionDenied) => {
                tracing::warn!(%command, "control write refused");
                Ok(Response::Nack(NackReason::NOT_PERMITTED))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl ValveLink for GattLink {
    fn transact(
        &mut self,
        request: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, LinkError>> + Send {
        async move { self.exchange(request).await.map_err(LinkError::from) }
    }

    fn disconnect(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send {
        async move {
            self.peripheral
                .disconnect()
                .await
                .map_err(|err| LinkError::from(BleError::from(err)))
        }
    }
}
