use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::lock::{self, LockSession};
use super::models::{self, reg, BaudRate, ConnectionState, OperatingMode};
use super::{Result, ServoError};
use crate::config::{BusConfig, ConnectOptions};
use crate::serial::{
    GroupSyncRead, GroupSyncWrite, NativePortProvider, PacketHandler, SerialInterface,
    TransportProvider, Width,
};

/// One physical servo bus.
///
/// Owns the port and protocol engine while connected. Callers create one
/// instance per bus and may share it between tasks; transactions are
/// serialized by the engine.
pub struct ServoBus {
    provider: Box<dyn TransportProvider>,
    state: RwLock<ConnectionState>,
    handler: RwLock<Option<Arc<PacketHandler>>>,
}

impl ServoBus {
    pub fn new(provider: impl TransportProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            state: RwLock::new(ConnectionState::Disconnected),
            handler: RwLock::new(None),
        }
    }

    /// Bus on the serial device named in `config`.
    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(NativePortProvider::new(config.port_name.clone()))
    }

    /// Open the bus. Connecting an already connected bus is a no-op.
    pub async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        let mut handler = self.handler.write().await;
        if handler.is_some() {
            log::debug!("Servo bus already connected");
            return Ok(());
        }
        options.validate()?;

        self.set_state(ConnectionState::Connecting).await;
        match self.open_port(options).await {
            Ok(port) => {
                log::info!(
                    "Connected to servo bus on {} at {} baud ({:?})",
                    port.port_name(),
                    options.baud_rate,
                    options.protocol
                );
                *handler = Some(Arc::new(PacketHandler::new(port, options.protocol)));
                self.set_state(ConnectionState::Connected).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(e)
            }
        }
    }

    async fn open_port(&self, options: &ConnectOptions) -> Result<SerialInterface> {
        let io = self
            .provider
            .acquire()
            .await
            .map_err(|e| ServoError::ConnectionFailed(e.to_string()))?;

        let mut port = SerialInterface::from_io(io).with_latency_timer(options.latency_timer_ms);
        if let Err(e) = port.open(options.baud_rate).await {
            // release whatever the failed open left behind
            if let Err(close_err) = port.close().await {
                log::warn!("Closing {} after failed open: {}", port.port_name(), close_err);
            }
            return Err(ServoError::ConnectionFailed(format!(
                "{}: {}",
                port.port_name(),
                e
            )));
        }
        Ok(port)
    }

    /// Close the bus. Disconnecting a closed bus is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        // held until the state is updated so a concurrent connect waits
        let mut slot = self.handler.write().await;
        let Some(handler) = slot.take() else {
            return Ok(());
        };
        let port_name = handler.port_name().await;
        if let Err(e) = handler.close().await {
            log::warn!("Error while closing {}: {}", port_name, e);
        }
        self.set_state(ConnectionState::Disconnected).await;
        drop(slot);
        log::info!("Disconnected from servo bus on {}", port_name);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn handler(&self) -> Result<Arc<PacketHandler>> {
        self.handler
            .read()
            .await
            .clone()
            .ok_or(ServoError::NotConnected)
    }

    /// Ping `id` and return its model number.
    pub async fn ping(&self, id: u8) -> Result<u16> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        handler.ping(id).await.check("ping", id)?;
        let model = handler
            .read_register(id, reg::MODEL, Width::Word)
            .await
            .check("read_model", id)?;
        Ok(model)
    }

    pub async fn read_position(&self, id: u8) -> Result<u16> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        let raw = handler
            .read_register(id, reg::PRESENT_POSITION, Width::Word)
            .await
            .check("read_position", id)?;
        Ok(raw)
    }

    /// Present speed, decoded from sign-magnitude.
    pub async fn read_speed(&self, id: u8) -> Result<i32> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        let raw = handler
            .read_register(id, reg::PRESENT_SPEED, Width::Word)
            .await
            .check("read_speed", id)?;
        Ok(models::speed_from_raw(raw))
    }

    pub async fn read_baud_rate_index(&self, id: u8) -> Result<u8> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        let raw = handler
            .read_register(id, reg::BAUD_RATE, Width::Byte)
            .await
            .check("read_baud_rate", id)?;
        Ok(raw as u8)
    }

    /// Raw operating mode byte; see [`OperatingMode::from_raw`].
    pub async fn read_mode(&self, id: u8) -> Result<u8> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        let raw = handler
            .read_register(id, reg::MODE, Width::Byte)
            .await
            .check("read_mode", id)?;
        Ok(raw as u8)
    }

    pub async fn write_position(&self, id: u8, position: f64) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        let raw = models::position_to_raw(position)?;
        handler
            .write_register(id, reg::GOAL_POSITION, raw, Width::Word)
            .await
            .check("write_position", id)?;
        Ok(())
    }

    pub async fn write_torque_enable(&self, id: u8, enabled: bool) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        handler
            .write_register(id, reg::TORQUE_ENABLE, enabled as u16, Width::Byte)
            .await
            .check("write_torque_enable", id)?;
        Ok(())
    }

    /// Out of range accelerations are clamped to 0..=254, not rejected.
    pub async fn write_acceleration(&self, id: u8, acceleration: f64) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        let raw = models::acceleration_to_raw(acceleration);
        handler
            .write_register(id, reg::ACCELERATION, raw as u16, Width::Byte)
            .await
            .check("write_acceleration", id)?;
        Ok(())
    }

    /// Goal speed for wheel mode, clamped to +-10000.
    pub async fn write_wheel_speed(&self, id: u8, speed: i32) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        let raw = models::wheel_speed_to_raw(speed);
        handler
            .write_register(id, reg::GOAL_SPEED, raw, Width::Word)
            .await
            .check("write_wheel_speed", id)?;
        Ok(())
    }

    /// Clear the write protection of `id`. Callers bracketing their own
    /// protected writes must call [`lock`](Self::lock) afterwards.
    pub async fn unlock(&self, id: u8) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        lock::write_lock(&handler, id, false)
            .await
            .check("unlock", id)?;
        Ok(())
    }

    pub async fn lock(&self, id: u8) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(id)?;
        lock::write_lock(&handler, id, true)
            .await
            .check("lock", id)?;
        Ok(())
    }

    pub async fn write_mode(&self, id: u8, mode: OperatingMode) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(id)?;

        let session = LockSession::open(&handler, "write_mode", id).await?;
        let written = handler
            .write_register(id, reg::MODE, mode as u16, Width::Byte)
            .await
            .check("write_mode", id);
        if let Err(e) = written {
            return Err(session.abort(e).await);
        }
        session.close().await
    }

    pub async fn set_wheel_mode(&self, id: u8) -> Result<()> {
        self.write_mode(id, OperatingMode::Wheel).await
    }

    pub async fn set_position_mode(&self, id: u8) -> Result<()> {
        self.write_mode(id, OperatingMode::Position).await
    }

    /// Move the servo answering at `current_id` to `new_id`.
    ///
    /// Once the id write is acknowledged the servo only answers at
    /// `new_id`, so the closing lock goes there.
    pub async fn write_id(&self, current_id: u8, new_id: u8) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(current_id)?;
        models::validate_id(new_id)?;
        if current_id == new_id {
            return Ok(());
        }

        let mut session = LockSession::open(&handler, "write_id", current_id).await?;
        let written = handler
            .write_register(session.target(), reg::ID, new_id as u16, Width::Byte)
            .await
            .check("write_id", current_id);
        if let Err(e) = written {
            return Err(session.abort(e).await);
        }
        session.retarget(new_id);
        session.close().await?;

        log::info!("Servo {} now answers at id {}", current_id, new_id);
        Ok(())
    }

    pub async fn write_baud_rate(&self, id: u8, baud_rate: BaudRate) -> Result<()> {
        let handler = self.handler().await?;
        models::validate_id(id)?;

        let session = LockSession::open(&handler, "write_baud_rate", id).await?;
        let written = handler
            .write_register(id, reg::BAUD_RATE, baud_rate.index() as u16, Width::Byte)
            .await
            .check("write_baud_rate", id);
        if let Err(e) = written {
            return Err(session.abort(e).await);
        }
        session.close().await
    }

    pub async fn write_baud_rate_index(&self, id: u8, index: u8) -> Result<()> {
        self.handler().await?;
        let baud_rate = BaudRate::from_index(index)?;
        self.write_baud_rate(id, baud_rate).await
    }

    /// Goal positions for many servos in one frame. Every entry is
    /// validated before anything is sent.
    pub async fn sync_write_positions(&self, positions: &BTreeMap<u8, f64>) -> Result<()> {
        let handler = self.handler().await?;
        let mut group = GroupSyncWrite::new(reg::GOAL_POSITION, Width::Word.size());
        for (&id, &position) in positions {
            models::validate_id(id)?;
            let raw = models::position_to_raw(position)?;
            group.add_param(id, &handler.register_bytes(raw, Width::Word));
        }
        self.commit("sync_write_positions", &handler, &group).await
    }

    /// Wheel speeds for many servos in one frame, clamped like
    /// [`write_wheel_speed`](Self::write_wheel_speed).
    pub async fn sync_write_wheel_speed(&self, speeds: &BTreeMap<u8, i32>) -> Result<()> {
        let handler = self.handler().await?;
        let mut group = GroupSyncWrite::new(reg::GOAL_SPEED, Width::Word.size());
        for (&id, &speed) in speeds {
            models::validate_id(id)?;
            let raw = models::wheel_speed_to_raw(speed);
            group.add_param(id, &handler.register_bytes(raw, Width::Word));
        }
        self.commit("sync_write_wheel_speed", &handler, &group).await
    }

    async fn commit(
        &self,
        operation: &'static str,
        handler: &PacketHandler,
        group: &GroupSyncWrite,
    ) -> Result<()> {
        let result = group.commit(handler).await;
        if !result.is_success() {
            return Err(ServoError::SyncWrite { operation, result });
        }
        log::debug!("{}: {} servos written", operation, group.len());
        Ok(())
    }

    /// Present positions of every id that answered. Invalid or repeated ids
    /// are skipped with a warning, silent servos are simply missing.
    pub async fn sync_read_positions(&self, ids: &[u8]) -> Result<BTreeMap<u8, u16>> {
        let handler = self.handler().await?;
        let mut group = GroupSyncRead::new(reg::PRESENT_POSITION, Width::Word.size() as u8);
        for &id in ids {
            if models::validate_id(id).is_err() {
                log::warn!("sync_read_positions: skipping invalid servo id {}", id);
            } else if !group.add_param(id) {
                log::warn!("sync_read_positions: servo id {} listed twice", id);
            }
        }

        let variant = handler.variant();
        let positions = group
            .read(&handler)
            .await
            .into_iter()
            .filter_map(|(id, data)| match data.as_slice() {
                [a, b] => Some((id, variant.decode_word([*a, *b]))),
                _ => None,
            })
            .collect();
        Ok(positions)
    }
}
