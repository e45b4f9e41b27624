use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fx3_interface::registers::request;
use fx3_interface::{
    BringUp, BringUpState, Completion, ControlTransport, DeviceHandle, DeviceIdent, DeviceReqData,
    ErrorCode, Fx3Config, IsoPacket, LinkSpeed, RawEndpoint, StreamParams, TransferQueue,
    TransportError, UsbBus,
};

/// A board already running the streaming firmware.
#[derive(Clone, Default)]
struct Board {
    requests: Arc<Mutex<Vec<u8>>>,
}

impl Board {
    fn ident() -> DeviceIdent {
        DeviceIdent {
            vendor: 0x04B4,
            product: 0x00F1,
            usb: 0x0300,
            speed: Some(LinkSpeed::Super),
            location: "2-1".to_string(),
        }
    }

    fn requests(&self) -> Vec<u8> {
        self.requests.lock().unwrap().clone()
    }
}

impl ControlTransport for Board {
    fn device_request(
        &self,
        req: u8,
        _value: u16,
        _index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransportError> {
        self.requests.lock().unwrap().push(req);
        match data {
            DeviceReqData::In(buf) => {
                buf.iter_mut().for_each(|byte| *byte = 0);
                if req == request::DEBUG_INFO {
                    buf[0..4].copy_from_slice(&42u32.to_le_bytes());
                    buf[4..8].copy_from_slice(&3u32.to_le_bytes());
                }
                Ok(buf.len())
            }
            DeviceReqData::Out(buf) => Ok(buf.len()),
            DeviceReqData::NoData => Ok(0),
        }
    }
}

impl DeviceHandle for Board {
    type Queue = Loopback;

    fn ident(&self) -> DeviceIdent {
        Self::ident()
    }
    fn alt_setting_count(&self) -> Result<u8, TransportError> {
        Ok(1)
    }
    fn set_alt_setting(&mut self, _alt: u8) -> Result<(), TransportError> {
        Ok(())
    }
    fn active_endpoints(&self) -> Result<Vec<RawEndpoint>, TransportError> {
        Ok(vec![RawEndpoint {
            address: 0x81,
            attributes: 2,
            max_packet_size: 1024,
            ss_max_burst: 1,
        }])
    }
    fn open_queue(
        &mut self,
        _endpoint: &fx3_interface::EndpointDescriptor,
    ) -> Result<Loopback, TransportError> {
        Ok(Loopback::default())
    }
}

struct Bus(Board);

impl UsbBus for Bus {
    type Handle = Board;

    fn list(&self) -> Result<Vec<DeviceIdent>, TransportError> {
        Ok(vec![Board::ident()])
    }
    fn open(&self, _ident: &DeviceIdent) -> Result<Board, TransportError> {
        Ok(self.0.clone())
    }
}

/// Completes every transfer full, one millisecond after it is awaited.
#[derive(Default)]
struct Loopback {
    in_flight: VecDeque<(usize, Vec<u8>)>,
    aborted: bool,
}

impl TransferQueue for Loopback {
    type Buffer = Vec<u8>;

    fn allocate(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        Ok(vec![0x5A; len])
    }

    fn submit(&mut self, slot: usize, buffer: Vec<u8>) -> Result<(), TransportError> {
        self.in_flight.push_back((slot, buffer));
        Ok(())
    }

    fn await_completion(
        &mut self,
        slot: usize,
        timeout: Duration,
        _packets: &mut [IsoPacket],
    ) -> Option<Completion<Vec<u8>>> {
        if self.in_flight.front().map(|(next, _)| *next) != Some(slot) {
            thread::sleep(timeout);
            return None;
        }
        thread::sleep(Duration::from_millis(1));
        let (_, buffer) = self.in_flight.pop_front()?;
        let (actual_len, status) = if self.aborted {
            (0, Err(TransportError::Cancelled))
        } else {
            (buffer.len(), Ok(()))
        };
        Some(Completion {
            buffer,
            actual_len,
            status,
        })
    }

    fn abort(&mut self) {
        self.aborted = true;
    }

    fn pending(&self) -> usize {
        self.in_flight.len()
    }
}

fn config() -> Fx3Config {
    let mut config = Fx3Config::default();
    config.frontend.rail_settle_ms = 0;
    config.device.reset_wait_ms = 0;
    config
}

#[test]
fn bring_up_stream_and_close() {
    let board = Board::default();
    let bus = Bus(board.clone());
    let config = config();

    let mut bringup = BringUp::new(&bus, &config);
    let mut fx3 = bringup.run().unwrap();
    assert_eq!(bringup.state(), BringUpState::EndpointsPrepared);
    assert_eq!(fx3.endpoints().len(), 1);
    assert!(fx3.endpoints()[0].is_bulk());

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let params = StreamParams {
        packets_per_transfer: 4,
        queue_depth: 3,
        timeout: Duration::from_millis(100),
        abort_grace: Duration::from_millis(100),
    };
    fx3.start_read(0, &params, move |data: &[u8]| {
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|byte| *byte == 0x5A));
        counter.fetch_add(data.len(), Ordering::Relaxed);
    })
    .unwrap();
    assert!(board.requests().contains(&request::START));

    thread::sleep(Duration::from_millis(50));
    let snapshot = fx3.debug_info(false);
    assert_eq!(snapshot.status, ErrorCode::Ok);
    assert_eq!(snapshot.transfers, 42);
    assert_eq!(snapshot.overflows_since_last, 3);
    assert!(snapshot.megabytes_sent > 0.0);

    fx3.stop_read().unwrap();
    assert!(!fx3.is_streaming());
    let total = received.load(Ordering::Relaxed);
    assert!(total > 0);
    assert_eq!(total % 4096, 0);
    assert_eq!(fx3.stream_stats().failures(), 0);

    fx3.close().unwrap();
    assert_eq!(board.requests().last(), Some(&request::CYPRESS_RESET));
}

#[test]
fn throughput_only_skips_the_device() {
    let board = Board::default();
    let bus = Bus(board.clone());
    let config = config();
    let mut fx3 = BringUp::new(&bus, &config).run().unwrap();

    let before = board.requests().len();
    let snapshot = fx3.debug_info(true);
    assert_eq!(snapshot.transfers, 0);
    assert_eq!(snapshot.megabytes_sent, 0.0);
    assert_eq!(board.requests().len(), before);
}
