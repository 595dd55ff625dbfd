//! Multi-servo transactions on a single register.
//!
//! Writes go out as one SYNC_WRITE frame that no servo acknowledges. Reads
//! are a sequence of ordinary READ transactions, one per servo, so one
//! silent servo only costs its own entry.

use std::collections::BTreeMap;

use super::packet::{MAX_ID, MIN_ID, TXPACKET_MAX_LEN};
use super::protocol::{CommResult, PacketHandler};

fn is_addressable(id: u8) -> bool {
    (MIN_ID..=MAX_ID).contains(&id)
}

/// Accumulates per-servo payloads for one SYNC_WRITE frame.
#[derive(Debug, Clone)]
pub struct GroupSyncWrite {
    address: u8,
    data_len: usize,
    params: Vec<(u8, Vec<u8>)>,
}

impl GroupSyncWrite {
    pub fn new(address: u8, data_len: usize) -> Self {
        Self {
            address,
            data_len,
            params: Vec::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn contains(&self, id: u8) -> bool {
        self.params.iter().any(|(pid, _)| *pid == id)
    }

    /// Add the payload for `id`. Returns false, leaving the group untouched,
    /// when `id` is not addressable, already present, or `data` has the
    /// wrong width.
    pub fn add_param(&mut self, id: u8, data: &[u8]) -> bool {
        if !is_addressable(id) || data.len() != self.data_len || self.contains(id) {
            return false;
        }
        self.params.push((id, data.to_vec()));
        true
    }

    /// Replace the payload of an id that is already in the group.
    pub fn change_param(&mut self, id: u8, data: &[u8]) -> bool {
        if data.len() != self.data_len {
            return false;
        }
        match self.params.iter_mut().find(|(pid, _)| *pid == id) {
            Some((_, payload)) => {
                *payload = data.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn remove_param(&mut self, id: u8) -> bool {
        let before = self.params.len();
        self.params.retain(|(pid, _)| *pid != id);
        self.params.len() != before
    }

    pub fn clear(&mut self) {
        self.params.clear();
    }

    /// Concatenated `(id, payload)` blocks in insertion order.
    pub fn param_block(&self) -> Vec<u8> {
        let mut block = Vec::with_capacity(self.params.len() * (self.data_len + 1));
        for (id, data) in &self.params {
            block.push(*id);
            block.extend_from_slice(data);
        }
        block
    }

    /// Send the group as one frame. An empty group is a successful no-op.
    ///
    /// Success only means the frame left the host; servos do not answer a
    /// SYNC_WRITE.
    pub async fn commit(&self, handler: &PacketHandler) -> CommResult {
        if self.params.is_empty() {
            return CommResult::Success;
        }

        // header(2) id len inst addr data_len ... chk
        let frame_len = 8 + self.params.len() * (self.data_len + 1);
        if frame_len > TXPACKET_MAX_LEN || self.data_len > u8::MAX as usize {
            log::error!(
                "Sync write of {} servos at address {} does not fit in one frame",
                self.params.len(),
                self.address
            );
            return CommResult::TxFail;
        }

        handler
            .sync_write_tx_only(self.address, self.data_len as u8, &self.param_block())
            .await
    }
}

/// Reads the same register from several servos, one transaction each.
#[derive(Debug, Clone)]
pub struct GroupSyncRead {
    address: u8,
    data_len: u8,
    ids: Vec<u8>,
}

impl GroupSyncRead {
    pub fn new(address: u8, data_len: u8) -> Self {
        Self {
            address,
            data_len,
            ids: Vec::new(),
        }
    }

    pub fn add_param(&mut self, id: u8) -> bool {
        if !is_addressable(id) || self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn remove_param(&mut self, id: u8) -> bool {
        let before = self.ids.len();
        self.ids.retain(|pid| *pid != id);
        self.ids.len() != before
    }

    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Read every id in turn. Ids that fail are logged and left out of the
    /// returned map; they never stop the remaining reads.
    pub async fn read(&self, handler: &PacketHandler) -> BTreeMap<u8, Vec<u8>> {
        let mut out = BTreeMap::new();
        for &id in &self.ids {
            let res = handler.read_bytes(id, self.address, self.data_len).await;
            if res.result.is_success() {
                if res.error != 0 {
                    log::warn!("Servo {} reported hardware error 0x{:02X}", id, res.error);
                }
                out.insert(id, res.value);
            } else {
                log::warn!(
                    "Sync read of address {} from servo {} failed: {} (error byte 0x{:02X})",
                    self.address,
                    id,
                    res.result,
                    res.error
                );
            }
        }
        out
    }
}
