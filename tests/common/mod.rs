// Shared in-memory servo bus for the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use servobus_lib::serial::packet::{self, instruction, Packet, BROADCAST_ID};
use servobus_lib::serial::{SerialError, SerialPortIO, TransportProvider};
use servobus_lib::servo::reg;
use servobus_lib::{ConnectOptions, ProtocolVariant, ServoBus};

pub const MODEL_NUMBER: u16 = 777;

/// A write the simulated servo swallows without answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dropped {
    pub id: u8,
    pub address: u8,
    pub value: Option<u8>,
}

#[derive(Default)]
pub struct BusState {
    pub variant: ProtocolVariant,
    pub servos: BTreeMap<u8, Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub rx: VecDeque<u8>,
    pub silent: HashSet<u8>,
    pub dropped: HashSet<Dropped>,
    pub fail_open: bool,
    pub fail_acquire: bool,
    pub is_open: bool,
    pub close_delay: Option<Duration>,
    pub baud_rate: Option<u32>,
    pub open_calls: usize,
    pub close_calls: usize,
}

impl BusState {
    fn word(&self, value: u16) -> [u8; 2] {
        self.variant.encode_word(value)
    }

    fn reply(&mut self, id: u8, data: &[u8]) {
        if let Ok(pkt) = packet::encode(id, 0, data) {
            self.rx.extend(pkt);
        }
    }

    fn is_dropped(&self, id: u8, address: u8, data: &[u8]) -> bool {
        let value = data.first().copied();
        self.dropped.contains(&Dropped { id, address, value: None })
            || self.dropped.contains(&Dropped { id, address, value })
    }

    fn store(&mut self, id: u8, address: u8, data: &[u8]) {
        let Some(mem) = self.servos.get_mut(&id) else { return };
        let locked = mem[reg::LOCK as usize] != 0;
        let eeprom = [reg::ID, reg::BAUD_RATE, reg::MODE].contains(&address);
        if locked && eeprom {
            return;
        }
        let start = address as usize;
        mem[start..start + data.len()].copy_from_slice(data);
        if address == reg::GOAL_POSITION {
            // the simulated servo reaches its goal instantly
            let present = reg::PRESENT_POSITION as usize;
            mem[present..present + data.len()].copy_from_slice(data);
        }
        if address == reg::ID && data[0] != id {
            if let Some(mem) = self.servos.remove(&id) {
                self.servos.insert(data[0], mem);
            }
        }
    }

    fn handle(&mut self, frame: &[u8]) {
        let Ok(Packet { id, code, params }) = packet::decode(frame) else { return };

        if id == BROADCAST_ID {
            if code == instruction::SYNC_WRITE && params.len() >= 2 {
                let address = params[0];
                let width = params[1] as usize;
                for block in params[2..].chunks(width + 1) {
                    self.store(block[0], address, &block[1..]);
                }
            }
            return;
        }
        if self.silent.contains(&id) || !self.servos.contains_key(&id) {
            return;
        }

        match code {
            instruction::PING => self.reply(id, &[]),
            instruction::READ => {
                let start = params[0] as usize;
                let data = self.servos[&id][start..start + params[1] as usize].to_vec();
                self.reply(id, &data);
            }
            instruction::WRITE => {
                let (address, data) = (params[0], &params[1..]);
                if self.is_dropped(id, address, data) {
                    return;
                }
                self.reply(id, &[]);
                self.store(id, address, data);
            }
            _ => {}
        }
    }
}

pub struct MockPort {
    state: Arc<Mutex<BusState>>,
}

#[async_trait::async_trait]
impl SerialPortIO for MockPort {
    async fn open(&mut self, baud_rate: u32) -> Result<(), SerialError> {
        let mut state = self.state.lock().unwrap();
        state.open_calls += 1;
        if state.fail_open {
            return Err(SerialError::ConnectionFailed("device busy".into()));
        }
        state.is_open = true;
        state.baud_rate = Some(baud_rate);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SerialError> {
        let delay = self.state.lock().unwrap().close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        state.is_open = false;
        Ok(())
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<usize, SerialError> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(data.to_vec());
        state.handle(data);
        Ok(data.len())
    }

    async fn read_data(&mut self, buf: &mut [u8], _timeout_ms: u64) -> Result<usize, SerialError> {
        let mut state = self.state.lock().unwrap();
        if state.rx.is_empty() {
            return Err(SerialError::Timeout);
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn clear_input(&mut self) -> Result<(), SerialError> {
        self.state.lock().unwrap().rx.clear();
        Ok(())
    }

    fn port_name(&self) -> String {
        "mock".to_string()
    }
}

pub struct MockProvider {
    state: Arc<Mutex<BusState>>,
}

#[async_trait::async_trait]
impl TransportProvider for MockProvider {
    async fn acquire(&self) -> Result<Box<dyn SerialPortIO>, SerialError> {
        if self.state.lock().unwrap().fail_acquire {
            return Err(SerialError::PortNotFound("mock".into()));
        }
        Ok(Box::new(MockPort {
            state: self.state.clone(),
        }))
    }
}

/// Handle on the simulated bus for scripting and inspection.
#[derive(Clone, Default)]
pub struct MockBus {
    pub state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn with_servos(ids: &[u8]) -> Self {
        Self::with_variant(ids, ProtocolVariant::Sts)
    }

    pub fn with_variant(ids: &[u8], variant: ProtocolVariant) -> Self {
        let bus = MockBus::default();
        {
            let mut state = bus.state.lock().unwrap();
            state.variant = variant;
            for &id in ids {
                let mut mem = vec![0u8; 128];
                let model = state.word(MODEL_NUMBER);
                mem[reg::MODEL as usize..reg::MODEL as usize + 2].copy_from_slice(&model);
                mem[reg::ID as usize] = id;
                mem[reg::LOCK as usize] = 1;
                state.servos.insert(id, mem);
            }
        }
        bus
    }

    pub fn provider(&self) -> MockProvider {
        MockProvider {
            state: self.state.clone(),
        }
    }

    pub async fn connect(&self) -> ServoBus {
        let variant = self.state.lock().unwrap().variant;
        let bus = ServoBus::new(self.provider());
        bus.connect(&ConnectOptions::default().with_protocol(variant))
            .await
            .expect("mock bus connects");
        bus
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_packets(&self) -> Vec<Packet> {
        self.sent()
            .iter()
            .map(|frame| packet::decode(frame).expect("host sends valid frames"))
            .collect()
    }

    /// Destination id of every frame sent so far.
    pub fn destinations(&self) -> Vec<u8> {
        self.sent_packets().iter().map(|p| p.id).collect()
    }

    /// `(destination, address, first data byte)` of every WRITE sent.
    pub fn writes(&self) -> Vec<(u8, u8, u8)> {
        self.sent_packets()
            .iter()
            .filter(|p| p.code == instruction::WRITE)
            .map(|p| (p.id, p.params[0], p.params[1]))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    pub fn silence(&self, id: u8) {
        self.state.lock().unwrap().silent.insert(id);
    }

    pub fn drop_write(&self, id: u8, address: u8, value: Option<u8>) {
        self.state
            .lock()
            .unwrap()
            .dropped
            .insert(Dropped { id, address, value });
    }

    pub fn register(&self, id: u8, address: u8) -> u8 {
        self.state.lock().unwrap().servos[&id][address as usize]
    }

    pub fn set_register(&self, id: u8, address: u8, value: u8) {
        if let Some(mem) = self.state.lock().unwrap().servos.get_mut(&id) {
            mem[address as usize] = value;
        }
    }

    pub fn has_servo(&self, id: u8) -> bool {
        self.state.lock().unwrap().servos.contains_key(&id)
    }
}
