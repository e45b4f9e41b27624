//! In-memory stand-ins for the host stack and the device firmware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common::Timeout;

use crate::driver_interface::{
    Completion, ControlTransport, DeviceHandle, DeviceIdent, DeviceReqData, IsoPacket, LinkSpeed,
    RawEndpoint, TransferQueue, TransportError, UsbBus,
};
use crate::endpoint::{EndpointDescriptor, Fx3Ids, SET_INTERFACE};
use crate::image::{BOOTLOADER_PROBE_INDEX, FW_DOWNLOAD};
use crate::registers::{request, REG24_ADDR_MASK, REG_ADDR_MASK};

static NEXT_LOCATION: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequestRecord {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub len: usize,
    pub device_to_host: bool,
}

pub struct DeviceState {
    pub ident: DeviceIdent,
    pub bootloader: bool,
    pub become_streaming_on_jump: bool,
    pub regs: [u8; 128],
    pub regs24: HashMap<u16, u8>,
    pub gpio: HashMap<u16, u32>,
    pub gpio_status: u32,
    pub debug: [u32; 7],
    pub requests: Vec<RequestRecord>,
    pub failing: HashSet<u8>,
    pub alt_settings: Vec<Vec<RawEndpoint>>,
    pub alt_history: Vec<u8>,
    pub current_alt: u8,
    pub downloaded: usize,
    pub jumped_to: Option<u32>,
    pub queue_script: Vec<Outcome>,
    pub queue_dropped: bool,
}

impl DeviceState {
    fn new(vendor: u16, product: u16, bootloader: bool) -> Self {
        let location = NEXT_LOCATION.fetch_add(1, Ordering::Relaxed);
        Self {
            ident: DeviceIdent {
                vendor,
                product,
                usb: 0x0300,
                speed: Some(LinkSpeed::Super),
                location: format!("mock-{}", location),
            },
            bootloader,
            become_streaming_on_jump: false,
            regs: [0; 128],
            regs24: HashMap::new(),
            gpio: HashMap::new(),
            gpio_status: 0,
            debug: [0; 7],
            requests: Vec::new(),
            failing: HashSet::new(),
            alt_settings: vec![vec![RawEndpoint {
                address: 0x81,
                attributes: 2,
                max_packet_size: 1024,
                ss_max_burst: 15,
            }]],
            alt_history: Vec::new(),
            current_alt: 0,
            downloaded: 0,
            jumped_to: None,
            queue_script: Vec::new(),
            queue_dropped: false,
        }
    }

    fn bootloader_request(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransportError> {
        if request != FW_DOWNLOAD {
            return Err(TransportError::Stalled);
        }
        match data {
            DeviceReqData::In(buf) if index == BOOTLOADER_PROBE_INDEX && !buf.is_empty() => {
                buf[0] = 0x01;
                Ok(1)
            }
            DeviceReqData::In(_) => Err(TransportError::Stalled),
            DeviceReqData::Out(buf) => {
                self.downloaded += buf.len();
                Ok(buf.len())
            }
            DeviceReqData::NoData => {
                self.jumped_to = Some(u32::from(value) | u32::from(index) << 16);
                if self.become_streaming_on_jump {
                    let streaming = DeviceState::new(self.ident.vendor, 0, false);
                    self.bootloader = false;
                    self.ident.product = Fx3Ids::default().stream_product;
                    self.ident.usb = streaming.ident.usb;
                    self.ident.speed = streaming.ident.speed;
                    self.alt_settings = streaming.alt_settings;
                }
                Ok(0)
            }
        }
    }

    fn streaming_request(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransportError> {
        match (request, data) {
            (request::REG_WRITE, DeviceReqData::Out(buf)) => {
                self.regs[usize::from(buf[1] & REG_ADDR_MASK)] = buf[0];
                Ok(buf.len())
            }
            (request::REG_READ, DeviceReqData::In(buf)) => {
                buf[0] = self.regs[usize::from(index as u8 & REG_ADDR_MASK)];
                Ok(buf.len())
            }
            (request::REG24_WRITE, DeviceReqData::Out(buf)) => {
                let address = u16::from_le_bytes([buf[1], buf[2]]);
                self.regs24.insert(address, buf[0]);
                Ok(buf.len())
            }
            (request::REG24_READ, DeviceReqData::In(buf)) => {
                buf[0] = self
                    .regs24
                    .get(&(index & REG24_ADDR_MASK))
                    .copied()
                    .unwrap_or(0);
                Ok(buf.len())
            }
            (request::WRITE_GPIO, DeviceReqData::In(buf)) => {
                if self.gpio_status == 0 {
                    self.gpio.insert(index, u32::from(value));
                }
                let line = self.gpio.get(&index).copied().unwrap_or(0);
                Ok(self.gpio_answer(buf, line))
            }
            (request::READ_GPIO, DeviceReqData::In(buf)) => {
                let line = self.gpio.get(&index).copied().unwrap_or(0);
                Ok(self.gpio_answer(buf, line))
            }
            (request::DEBUG_INFO, DeviceReqData::In(buf)) => {
                for (chunk, word) in buf.chunks_exact_mut(4).zip(self.debug.iter()) {
                    chunk.copy_from_slice(&word.to_le_bytes());
                }
                Ok(buf.len())
            }
            (request::START, DeviceReqData::In(buf)) => {
                buf.iter_mut().for_each(|byte| *byte = 0);
                Ok(buf.len())
            }
            (request::CYPRESS_RESET, DeviceReqData::Out(buf)) => Ok(buf.len()),
            _ => Err(TransportError::Stalled),
        }
    }

    fn gpio_answer(&self, buf: &mut [u8], line: u32) -> usize {
        buf[0..4].copy_from_slice(&self.gpio_status.to_le_bytes());
        buf[4..8].copy_from_slice(&line.to_le_bytes());
        buf.len()
    }
}

/// A device whose firmware is emulated in memory. Clones share the same device.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn with_ids(vendor: u16, product: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::new(vendor, product, false))),
        }
    }

    pub fn streaming() -> Self {
        let ids = Fx3Ids::default();
        Self::with_ids(ids.vendor, ids.stream_product)
    }

    pub fn bootloader() -> Self {
        let ids = Fx3Ids::default();
        let device = Self {
            state: Arc::new(Mutex::new(DeviceState::new(ids.vendor, ids.boot_product, true))),
        };
        {
            let mut state = device.state();
            state.ident.usb = 0x0200;
            state.ident.speed = Some(LinkSpeed::High);
            state.alt_settings = vec![Vec::new()];
        }
        device
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }
}

impl ControlTransport for MockDevice {
    fn device_request(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransportError> {
        let mut state = self.state();
        state.requests.push(RequestRecord {
            request,
            value,
            index,
            len: data.len(),
            device_to_host: matches!(data, DeviceReqData::In(_)),
        });
        if state.failing.contains(&request) {
            return Err(TransportError::Stalled);
        }
        if state.bootloader {
            state.bootloader_request(request, value, index, data)
        } else {
            state.streaming_request(request, value, index, data)
        }
    }
}

impl DeviceHandle for MockDevice {
    type Queue = MockQueue;

    fn ident(&self) -> DeviceIdent {
        self.state().ident.clone()
    }

    fn alt_setting_count(&self) -> Result<u8, TransportError> {
        Ok(self.state().alt_settings.len() as u8)
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError> {
        let mut state = self.state();
        state.alt_history.push(alt);
        if state.failing.contains(&SET_INTERFACE) || usize::from(alt) >= state.alt_settings.len() {
            return Err(TransportError::Stalled);
        }
        state.current_alt = alt;
        Ok(())
    }

    fn active_endpoints(&self) -> Result<Vec<RawEndpoint>, TransportError> {
        let state = self.state();
        Ok(state.alt_settings[usize::from(state.current_alt)].clone())
    }

    fn open_queue(&mut self, _endpoint: &EndpointDescriptor) -> Result<MockQueue, TransportError> {
        let script = std::mem::take(&mut self.state().queue_script);
        let (mut queue, _probe) = MockQueue::new(script);
        queue.device = Some(Arc::clone(&self.state));
        Ok(queue)
    }
}

pub struct MockBus {
    devices: Vec<MockDevice>,
    opened: AtomicUsize,
}

impl MockBus {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl UsbBus for MockBus {
    type Handle = MockDevice;

    fn list(&self) -> Result<Vec<DeviceIdent>, TransportError> {
        Ok(self.devices.iter().map(|device| device.state().ident.clone()).collect())
    }

    fn open(&self, ident: &DeviceIdent) -> Result<MockDevice, TransportError> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.devices
            .iter()
            .find(|device| device.state().ident.location == ident.location)
            .cloned()
            .ok_or(TransportError::Disconnected)
    }
}

/// What the next transfer handed back by a [`MockQueue`] looks like.
#[derive(Clone, Debug)]
pub enum Outcome {
    Ok,
    Fail,
    Iso(Vec<IsoPacket>),
}

/// What a [`MockQueue`] observed, readable after the queue moved into a worker.
#[derive(Debug)]
pub struct QueueProbe {
    pub allocations: usize,
    pub submits: usize,
    pub max_pending: usize,
    pub pending_after_submit: Vec<usize>,
    pub buffers: HashSet<usize>,
    pub completed: Vec<usize>,
    pub aborts: usize,
    pub packets_seen_clean: bool,
    pub dropped: bool,
    pub pending_at_drop: usize,
}

impl Default for QueueProbe {
    fn default() -> Self {
        Self {
            allocations: 0,
            submits: 0,
            max_pending: 0,
            pending_after_submit: Vec::new(),
            buffers: HashSet::new(),
            completed: Vec::new(),
            aborts: 0,
            packets_seen_clean: true,
            dropped: false,
            pending_at_drop: 0,
        }
    }
}

struct InFlight {
    slot: usize,
    buffer: Vec<u8>,
    cancelled: bool,
}

/// Completes transfers in submission order following a script. Once the script runs out,
/// transfers stay pending until aborted.
pub struct MockQueue {
    script: VecDeque<Outcome>,
    in_flight: VecDeque<InFlight>,
    probe: Arc<Mutex<QueueProbe>>,
    fail_submit_at: Option<usize>,
    fail_alloc_at: Option<usize>,
    device: Option<Arc<Mutex<DeviceState>>>,
}

impl MockQueue {
    pub fn new(script: Vec<Outcome>) -> (Self, Arc<Mutex<QueueProbe>>) {
        let probe = Arc::new(Mutex::new(QueueProbe::default()));
        let queue = Self {
            script: script.into(),
            in_flight: VecDeque::new(),
            probe: Arc::clone(&probe),
            fail_submit_at: None,
            fail_alloc_at: None,
            device: None,
        };
        (queue, probe)
    }

    /// Makes the n-th submission (counting from zero) fail.
    pub fn fail_submit_at(mut self, n: usize) -> Self {
        self.fail_submit_at = Some(n);
        self
    }

    pub fn fail_alloc_at(mut self, n: usize) -> Self {
        self.fail_alloc_at = Some(n);
        self
    }

    fn probe(&self) -> MutexGuard<'_, QueueProbe> {
        self.probe.lock().unwrap()
    }
}

fn idle(timeout: Duration) {
    let timeout = Timeout::new(timeout);
    while timeout.run().is_ok() {}
}

impl TransferQueue for MockQueue {
    type Buffer = Vec<u8>;

    fn allocate(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut probe = self.probe();
        let n = probe.allocations;
        probe.allocations += 1;
        if Some(n) == self.fail_alloc_at {
            return Err(TransportError::Usb("out of memory".to_string()));
        }
        Ok(vec![0; len])
    }

    fn submit(&mut self, slot: usize, buffer: Vec<u8>) -> Result<(), TransportError> {
        let n = self.probe().submits;
        self.probe().submits += 1;
        if Some(n) == self.fail_submit_at {
            return Err(TransportError::Disconnected);
        }

        let ptr = buffer.as_ptr() as usize;
        self.in_flight.push_back(InFlight {
            slot,
            buffer,
            cancelled: false,
        });
        let pending = self.in_flight.len();
        let mut probe = self.probe();
        probe.buffers.insert(ptr);
        probe.pending_after_submit.push(pending);
        probe.max_pending = probe.max_pending.max(pending);
        Ok(())
    }

    fn await_completion(
        &mut self,
        slot: usize,
        timeout: Duration,
        packets: &mut [IsoPacket],
    ) -> Option<Completion<Vec<u8>>> {
        if packets.iter().any(|packet| *packet != IsoPacket::default()) {
            self.probe().packets_seen_clean = false;
        }

        let pos = match self.in_flight.iter().position(|entry| entry.slot == slot) {
            Some(pos) => pos,
            None => {
                idle(timeout);
                return None;
            }
        };

        let outcome = if self.in_flight[pos].cancelled {
            None
        } else {
            match self.script.pop_front() {
                Some(outcome) => Some(outcome),
                None => {
                    idle(timeout);
                    return None;
                }
            }
        };

        let entry = self.in_flight.remove(pos)?;
        self.probe().completed.push(slot);
        let len = entry.buffer.len();
        let (actual_len, status) = match outcome {
            None => (0, Err(TransportError::Cancelled)),
            Some(Outcome::Ok) => (len, Ok(())),
            Some(Outcome::Fail) => (0, Err(TransportError::Stalled)),
            Some(Outcome::Iso(records)) => {
                for (dst, src) in packets.iter_mut().zip(records) {
                    *dst = src;
                }
                (len, Ok(()))
            }
        };
        Some(Completion {
            buffer: entry.buffer,
            actual_len,
            status,
        })
    }

    fn abort(&mut self) {
        self.probe().aborts += 1;
        for entry in self.in_flight.iter_mut() {
            entry.cancelled = true;
        }
    }

    fn pending(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for MockQueue {
    fn drop(&mut self) {
        let pending = self.in_flight.len();
        if let Ok(mut probe) = self.probe.lock() {
            probe.dropped = true;
            probe.pending_at_drop = pending;
        }
        if let Some(device) = &self.device {
            if let Ok(mut state) = device.lock() {
                state.queue_dropped = true;
            }
        }
    }
}
