//! Write protection bracket for EEPROM-backed registers.
//!
//! Mode, id and baud rate only stick while the lock register reads 0. Every
//! change runs unlock, write, lock; when the write fails the lock is put back
//! on a best-effort basis and the write error is what the caller sees.

use super::models::reg;
use super::{Compensation, Result, ServoError};
use crate::serial::{CommError, PacketHandler, TxRxResult, Width};

const UNLOCKED: u16 = 0;
const LOCKED: u16 = 1;

pub(crate) async fn write_lock(handler: &PacketHandler, id: u8, locked: bool) -> TxRxResult<()> {
    let value = if locked { LOCKED } else { UNLOCKED };
    handler.write_register(id, reg::LOCK, value, Width::Byte).await
}

/// Unlocked state held for the duration of one configuration change.
///
/// `target` is the id the servo currently answers to. An id change moves it
/// once the new id has been confirmed written.
pub(crate) struct LockSession<'a> {
    handler: &'a PacketHandler,
    operation: &'static str,
    target: u8,
}

impl<'a> LockSession<'a> {
    /// Unlock `id`. On failure nothing was changed on the servo.
    pub(crate) async fn open(
        handler: &'a PacketHandler,
        operation: &'static str,
        id: u8,
    ) -> Result<LockSession<'a>> {
        write_lock(handler, id, false).await.check("unlock", id)?;
        log::debug!("{}: servo {} unlocked", operation, id);
        Ok(Self {
            handler,
            operation,
            target: id,
        })
    }

    pub(crate) fn target(&self) -> u8 {
        self.target
    }

    pub(crate) fn retarget(&mut self, id: u8) {
        log::debug!("{}: lock target moved from {} to {}", self.operation, self.target, id);
        self.target = id;
    }

    /// Lock the servo again after a successful write.
    pub(crate) async fn close(self) -> Result<()> {
        match write_lock(self.handler, self.target, true)
            .await
            .check("lock", self.target)
        {
            Ok(()) => Ok(()),
            Err(source) => {
                log::error!(
                    "{}: servo {} may be left unlocked: {}",
                    self.operation,
                    self.target,
                    source
                );
                Err(ServoError::LeftUnlocked {
                    operation: self.operation,
                    id: self.target,
                    source,
                })
            }
        }
    }

    /// Try to lock again after `original` failed and wrap it. A failing
    /// re-lock is logged and recorded but never replaces `original`.
    pub(crate) async fn abort(self, original: CommError) -> ServoError {
        let compensation = match write_lock(self.handler, self.target, true)
            .await
            .check("lock", self.target)
        {
            Ok(()) => Compensation::Relocked,
            Err(relock) => {
                log::warn!(
                    "{}: re-lock of servo {} after failed write also failed: {}",
                    self.operation,
                    self.target,
                    relock
                );
                Compensation::RelockFailed(relock.to_string())
            }
        };

        ServoError::ProtectedWrite {
            operation: self.operation,
            id: self.target,
            compensation,
            source: original,
        }
    }
}
