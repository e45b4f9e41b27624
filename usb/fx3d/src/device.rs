use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use smallvec::SmallVec;

use crate::driver_interface::{DeviceHandle, DeviceIdent};
use crate::endpoint::{EndpointDescriptor, SET_INTERFACE};
use crate::error::Fx3Error;
use crate::nt1065;
use crate::registers::{request, RegisterAccess};
use crate::stream::{DeviceDataHandler, StreamEngine, StreamError, StreamParams, StreamStats};
use crate::telemetry::{DeviceErrorSnapshot, Telemetry};

/// Pause between stopping the stream and resetting the device on close.
pub const STOP_PAUSE: Duration = Duration::from_millis(500);
/// Time the device needs to come back after a reset.
pub const DEFAULT_RESET_WAIT: Duration = Duration::from_secs(2);

/// A device running the streaming firmware, with its endpoint directory.
pub struct Fx3Device<H: DeviceHandle> {
    handle: H,
    endpoints: SmallVec<[EndpointDescriptor; 4]>,
    telemetry: Telemetry,
    engine: Option<StreamEngine>,
    reset_wait: Duration,
}

impl<H: DeviceHandle> Fx3Device<H> {
    pub fn new(handle: H, endpoints: SmallVec<[EndpointDescriptor; 4]>) -> Self {
        Self {
            handle,
            endpoints,
            telemetry: Telemetry::new(Arc::new(StreamStats::default())),
            engine: None,
            reset_wait: DEFAULT_RESET_WAIT,
        }
    }

    pub fn with_reset_wait(mut self, reset_wait: Duration) -> Self {
        self.reset_wait = reset_wait;
        self
    }

    pub fn ident(&self) -> DeviceIdent {
        self.handle.ident()
    }

    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }

    /// The control channel, for register and GPIO access.
    pub fn control(&self) -> &H {
        &self.handle
    }

    pub fn stream_stats(&self) -> &Arc<StreamStats> {
        self.telemetry.stats()
    }

    /// Starts streaming from the endpoint at `endpoint_index` into `handler`, then tells the
    /// firmware to start producing data.
    pub fn start_read<D: DeviceDataHandler>(
        &mut self,
        endpoint_index: usize,
        params: &StreamParams,
        handler: D,
    ) -> Result<(), Fx3Error> {
        if let Some(mut engine) = self.engine.take() {
            if engine.is_running() {
                self.engine = Some(engine);
                return Err(StreamError::AlreadyRunning.into());
            }
            if let Err(err) = engine.stop() {
                warn!("previous stream session ended with error: {}", err);
            }
        }

        let endpoint = *self
            .endpoints
            .get(endpoint_index)
            .ok_or(StreamError::NoEndpoint(endpoint_index))?;

        self.handle
            .set_alt_setting(endpoint.interface)
            .map_err(Fx3Error::control(SET_INTERFACE))?;
        let queue = self
            .handle
            .open_queue(&endpoint)
            .map_err(StreamError::Open)?;

        let stats = Arc::clone(self.telemetry.stats());
        stats.take_bytes();
        let mut engine = StreamEngine::start(
            queue,
            &endpoint,
            self.handle.ident().speed,
            params,
            stats,
            handler,
        )?;

        if let Err(source) = self.handle.start_streaming() {
            if let Err(err) = engine.stop() {
                warn!("stream session ended with error: {}", err);
            }
            return Err(Fx3Error::control(request::START)(source));
        }
        self.engine = Some(engine);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.engine.as_ref().map_or(false, StreamEngine::is_running)
    }

    /// Stops the current session, if any, after its worker has exited.
    pub fn stop_read(&mut self) -> Result<(), Fx3Error> {
        match self.engine.take() {
            Some(mut engine) => engine.stop().map_err(Fx3Error::from),
            None => Ok(()),
        }
    }

    pub fn debug_info(&mut self, throughput_only: bool) -> DeviceErrorSnapshot {
        self.telemetry.snapshot(&self.handle, throughput_only)
    }

    pub fn chip_id(&self) -> Result<u32, Fx3Error> {
        nt1065::chip_id(&self.handle).map_err(Fx3Error::control(request::REG_READ))
    }

    /// Stops streaming and resets the device, waiting for it to restart.
    pub fn close(mut self) -> Result<(), Fx3Error> {
        if let Err(err) = self.stop_read() {
            warn!("{}", err);
        }
        thread::sleep(STOP_PAUSE);

        self.handle
            .reset_device()
            .map_err(Fx3Error::control(request::CYPRESS_RESET))?;
        info!("device is resetting, waiting {:?}", self.reset_wait);
        thread::sleep(self.reset_wait);
        Ok(())
    }
}

impl<H: DeviceHandle> Drop for Fx3Device<H> {
    fn drop(&mut self) {
        if let Err(err) = self.stop_read() {
            warn!("{}", err);
        }
    }
}
