use std::sync::Arc;

use log::warn;
use serde::Serialize;

use crate::driver_interface::ControlTransport;
use crate::error::{ErrorCode, Fx3Error};
use crate::registers::{request, RegisterAccess};
use crate::stream::StreamStats;

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeviceErrorSnapshot {
    pub transfers: u32,
    pub overflows: u32,
    pub overflows_since_last: u32,
    pub phy_error_delta: u32,
    pub link_error_delta: u32,
    pub error_register: u32,
    pub phy_errors: u32,
    pub link_errors: u32,
    pub megabytes_sent: f64,
    pub transfer_successes: u64,
    pub transfer_failures: u64,
    pub status: ErrorCode,
}

pub struct Telemetry {
    stats: Arc<StreamStats>,
    last_overflow_count: u32,
}

impl Telemetry {
    pub fn new(stats: Arc<StreamStats>) -> Self {
        Self {
            stats,
            last_overflow_count: 0,
        }
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Collects the throughput since the previous snapshot and, unless `throughput_only`, the
    /// device's debug block.
    ///
    /// A failed debug read still returns the throughput, with `status` set.
    pub fn snapshot<C: ControlTransport + ?Sized>(
        &mut self,
        ctl: &C,
        throughput_only: bool,
    ) -> DeviceErrorSnapshot {
        let mut snapshot = DeviceErrorSnapshot {
            megabytes_sent: self.stats.take_bytes() as f64 / BYTES_PER_MEGABYTE,
            transfer_successes: self.stats.successes(),
            transfer_failures: self.stats.failures(),
            ..DeviceErrorSnapshot::default()
        };
        if throughput_only {
            return snapshot;
        }

        let info = match ctl.read_debug_info() {
            Ok(info) => info,
            Err(source) => {
                let err = Fx3Error::control(request::DEBUG_INFO)(source);
                warn!("debug info unavailable: {}", err);
                snapshot.status = err.code();
                return snapshot;
            }
        };

        snapshot.transfers = info.transfers;
        snapshot.overflows = info.overflows;
        snapshot.overflows_since_last = info.overflows.saturating_sub(self.last_overflow_count);
        snapshot.phy_error_delta = info.phy_err_inc;
        snapshot.link_error_delta = info.lnk_err_inc;
        snapshot.error_register = info.err_reg;
        snapshot.phy_errors = info.phy_errs;
        snapshot.link_errors = info.lnk_errs;
        self.last_overflow_count = info.overflows;
        snapshot
    }
}
