//! Bring-up: from whatever is on the bus to a device streaming firmware with a programmed
//! front-end.
//!
//! ```text
//! Start -> Scanned -> BootloaderDetected -> FirmwareDownloaded -> Scanned (once)
//!                  \-> StreamingReady -> EndpointsPrepared [-> RegisterSequenceApplied]
//! ```

use std::path::Path;
use std::{fs, io, thread};

use log::{debug, info, warn};
use smallvec::SmallVec;

use crate::config::Fx3Config;
use crate::device::Fx3Device;
use crate::driver_interface::UsbBus;
use crate::endpoint::{enumerate, scan, DeviceMode, EndpointDescriptor, ScanReport};
use crate::error::Fx3Error;
use crate::image::{bootloader_active, FirmwareImage, FW_DOWNLOAD};
use crate::nt1065;
use crate::registers::request;
use crate::script::{self, RegisterScript};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BringUpState {
    Start,
    Scanned { loadable: usize, streamable: usize },
    BootloaderDetected,
    StreamingReady,
    FirmwareDownloaded,
    EndpointsPrepared,
    RegisterSequenceApplied,
}

pub struct BringUp<'a, B: UsbBus> {
    bus: &'a B,
    config: &'a Fx3Config,
    state: BringUpState,
    history: Vec<BringUpState>,
    rescanned: bool,
    report: ScanReport,
    handle: Option<B::Handle>,
    endpoints: SmallVec<[EndpointDescriptor; 4]>,
}

impl<'a, B: UsbBus> BringUp<'a, B> {
    pub fn new(bus: &'a B, config: &'a Fx3Config) -> Self {
        Self {
            bus,
            config,
            state: BringUpState::Start,
            history: vec![BringUpState::Start],
            rescanned: false,
            report: ScanReport::default(),
            handle: None,
            endpoints: SmallVec::new(),
        }
    }

    pub fn state(&self) -> BringUpState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[BringUpState] {
        &self.history
    }

    /// Drives the machine to completion and hands over the prepared device.
    pub fn run(&mut self) -> Result<Fx3Device<B::Handle>, Fx3Error> {
        while self.step()? {}

        let handle = self
            .handle
            .take()
            .ok_or(Fx3Error::BadDevice("bring-up finished without a device"))?;
        let endpoints = std::mem::take(&mut self.endpoints);
        Ok(Fx3Device::new(handle, endpoints).with_reset_wait(self.config.device.reset_wait()))
    }

    fn enter(&mut self, state: BringUpState) {
        debug!("bring-up: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    /// Performs one transition. Returns false once there is nothing left to do.
    pub fn step(&mut self) -> Result<bool, Fx3Error> {
        match self.state {
            BringUpState::Start => self.scan()?,
            BringUpState::Scanned { .. } => match self.report.mode() {
                DeviceMode::Streaming => self.open_streaming()?,
                DeviceMode::Bootloader if self.rescanned => {
                    return Err(Fx3Error::BadDevice(
                        "device is still in the bootloader after firmware download",
                    ));
                }
                DeviceMode::Bootloader => self.enter(BringUpState::BootloaderDetected),
                DeviceMode::Unrecognized => {
                    return Err(Fx3Error::BadDevice("no device in streaming or bootloader mode"));
                }
            },
            BringUpState::BootloaderDetected => self.download()?,
            BringUpState::FirmwareDownloaded => {
                let settle = self.config.firmware.settle();
                info!("firmware downloaded, waiting {:?} for the device to restart", settle);
                thread::sleep(settle);
                self.handle = None;
                self.rescanned = true;
                self.scan()?;
            }
            BringUpState::StreamingReady => self.prepare_endpoints()?,
            BringUpState::EndpointsPrepared => match self.config.firmware.script() {
                Some(script) => self.apply_script(&script)?,
                None => return Ok(false),
            },
            BringUpState::RegisterSequenceApplied => return Ok(false),
        }
        Ok(true)
    }

    fn scan(&mut self) -> Result<(), Fx3Error> {
        let report = scan(self.bus, &self.config.device.ids())?;
        report.check()?;
        let state = BringUpState::Scanned {
            loadable: report.loadable,
            streamable: report.streamable,
        };
        self.report = report;
        self.enter(state);
        Ok(())
    }

    fn open_streaming(&mut self) -> Result<(), Fx3Error> {
        let ident = self
            .report
            .stream
            .clone()
            .ok_or(Fx3Error::BadDevice("streaming device vanished"))?;
        let handle = self.bus.open(&ident).map_err(Fx3Error::UsbInitFailed)?;
        info!("opened {}", ident);
        self.handle = Some(handle);
        self.enter(BringUpState::StreamingReady);
        Ok(())
    }

    fn download(&mut self) -> Result<(), Fx3Error> {
        let path = self
            .config
            .firmware
            .image
            .clone()
            .unwrap_or_default();
        let bytes = read_firmware(&path)?;

        let ident = self
            .report
            .boot
            .clone()
            .ok_or(Fx3Error::BadDevice("bootloader device vanished"))?;
        let handle = self.bus.open(&ident).map_err(Fx3Error::UsbInitFailed)?;
        if !bootloader_active(&handle) {
            return Err(Fx3Error::BadDevice("bootloader is not running"));
        }

        let image = FirmwareImage::parse(&bytes)?;
        info!(
            "downloading {} ({} bytes in {} sections)",
            path.display(),
            image.len(),
            image.sections.len()
        );
        image
            .download(&handle)
            .map_err(Fx3Error::control(FW_DOWNLOAD))?;

        drop(handle);
        self.enter(BringUpState::FirmwareDownloaded);
        Ok(())
    }

    fn prepare_endpoints(&mut self) -> Result<(), Fx3Error> {
        let ids = self.config.device.ids();
        let frontend = &self.config.frontend;
        let handle = self
            .handle
            .as_mut()
            .ok_or(Fx3Error::BadDevice("no open streaming device"))?;

        self.endpoints = enumerate(handle, &ids)?;
        if self.endpoints.is_empty() {
            warn!("device exposes no data endpoints");
        }

        if frontend.power_up {
            nt1065::power_up(&*handle, &frontend.lines, frontend.rail_settle())
                .map_err(Fx3Error::control(request::WRITE_GPIO))?;
        }
        if let Err(err) = nt1065::chip_id(&*handle) {
            warn!("cannot read front-end chip id: {}", err);
        }

        self.enter(BringUpState::EndpointsPrepared);
        Ok(())
    }

    fn apply_script(&mut self, script: &RegisterScript) -> Result<(), Fx3Error> {
        let firmware = &self.config.firmware;
        let handle = self
            .handle
            .as_ref()
            .ok_or(Fx3Error::BadDevice("no open streaming device"))?;

        match script {
            RegisterScript::Builtin => {
                info!("applying built-in front-end sequence");
                nt1065::apply_sequence(handle, nt1065::DEFAULT_SEQUENCE)
                    .map_err(Fx3Error::control(request::REG_WRITE))?;
            }
            RegisterScript::File(path) => {
                let writes = read_script(path)?;
                info!("applying {} ({} writes)", path.display(), writes.len());
                script::apply_writes(
                    handle,
                    &writes,
                    firmware.stop_address,
                    firmware.write_delay(),
                )
                .map_err(Fx3Error::control(request::REG_WRITE))?;
            }
        }

        self.enter(BringUpState::RegisterSequenceApplied);
        Ok(())
    }
}

fn read_firmware(path: &Path) -> Result<Vec<u8>, Fx3Error> {
    let io_error = |source| Fx3Error::FirmwareFileIo {
        path: path.to_path_buf(),
        source,
    };
    if path.as_os_str().is_empty() {
        return Err(io_error(io::Error::new(
            io::ErrorKind::NotFound,
            "no firmware image configured",
        )));
    }
    fs::read(path).map_err(io_error)
}

fn read_script(path: &Path) -> Result<Vec<script::RegisterWrite>, Fx3Error> {
    let io_error = |source| Fx3Error::AdditionalFirmwareFileIo {
        path: path.to_path_buf(),
        source,
    };
    let text = fs::read_to_string(path).map_err(io_error)?;
    script::parse(&text).map_err(|err| io_error(io::Error::new(io::ErrorKind::InvalidData, err)))
}
