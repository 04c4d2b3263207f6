// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use indexmap::IndexMap;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

pub(crate) const TIMEOUT_CONTROL: Duration = Duration::from_secs(5);
pub(crate) const TIMEOUT_DATA: Duration = Duration::from_secs(30);
pub(crate) const TIMEOUT_ERASE: Duration = Duration::from_secs(120);
pub(crate) const TIMEOUT_AUTH: Duration = Duration::from_secs(10);

/// Settle time between the Sahara DONE_RESP and the programmer coming up.
pub(crate) const PROGRAMMER_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Pause between consecutive restricted-firmware probe attempts.
pub(crate) const PROBE_RETRY_DELAY: Duration = Duration::from_millis(50);

pub type Result<T, E = EdlError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EdlError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("Sahara failed: {0}")]
    SaharaFailed(String),

    #[error("command NAKed by the device")]
    Nak,

    #[error("storage access requires authentication")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("programmer refused sectors {start}..={end} on LUN {lun}")]
    RestrictedAddress { lun: u8, start: u64, end: u64 },

    #[error("invalid GPT: {0}")]
    InvalidGpt(String),

    #[error("flash plan error: {0}")]
    Plan(String),

    #[error("LUN {0} is protected; refusing to write")]
    ProtectedLun(u8),

    #[error("operator action required: {0}")]
    RequiresUserAction(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("fatal device state: {0}")]
    Fatal(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirehoseStatus {
    Ack,
    Nak,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FirehoseStorageType {
    #[default]
    Ufs,
    Emmc,
    Nvme,
}

impl FirehoseStorageType {
    /// The sector size assumed when the device declines to report one.
    pub fn default_sector_size(&self) -> usize {
        match self {
            FirehoseStorageType::Ufs => 4096,
            FirehoseStorageType::Emmc | FirehoseStorageType::Nvme => 512,
        }
    }

    /// The MemoryName attribute value for <configure>.
    pub fn memory_name(&self) -> &'static str {
        match self {
            FirehoseStorageType::Ufs => "ufs",
            FirehoseStorageType::Emmc => "emmc",
            FirehoseStorageType::Nvme => "nvme",
        }
    }
}

impl FromStr for FirehoseStorageType {
    type Err = EdlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ufs" => Ok(FirehoseStorageType::Ufs),
            "emmc" => Ok(FirehoseStorageType::Emmc),
            "nvme" => Ok(FirehoseStorageType::Nvme),
            _ => Err(EdlError::Protocol(format!("unknown storage type '{s}'"))),
        }
    }
}

impl std::fmt::Display for FirehoseStorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.memory_name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FirehoseResetMode {
    /// Reboot into the OS
    System,
    /// Power off
    Off,
    /// Reboot back into the emergency download mode
    #[default]
    Edl,
}

impl FirehoseResetMode {
    /// The value attribute of the <power> command.
    pub fn power_value(&self) -> &'static str {
        match self {
            FirehoseResetMode::System => "reset",
            FirehoseResetMode::Off => "off",
            FirehoseResetMode::Edl => "reset_to_edl",
        }
    }
}

impl FromStr for FirehoseResetMode {
    type Err = EdlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(FirehoseResetMode::System),
            "off" => Ok(FirehoseResetMode::Off),
            "edl" => Ok(FirehoseResetMode::Edl),
            _ => Err(EdlError::Protocol(format!("unknown reset mode '{s}'"))),
        }
    }
}

impl std::fmt::Display for FirehoseResetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirehoseResetMode::System => f.write_str("system"),
            FirehoseResetMode::Off => f.write_str("off"),
            FirehoseResetMode::Edl => f.write_str("edl"),
        }
    }
}

/// Everything the Sahara handshake managed to learn about the chip.
///
/// Immutable once the handshake completes; some fields stay empty when the
/// device doesn't implement the command-mode queries.
#[derive(Clone, Debug, Default)]
pub struct DeviceFingerprint {
    pub chip_name: String,
    pub msm_id: u32,
    /// Hex, lowercase; 32 or 64 digits depending on the fuse layout
    pub pk_hash: String,
    pub oem_id: u16,
    pub model_id: u16,
    pub serial: u32,
    pub sahara_version: u32,
    pub is_64bit: bool,
    pub storage_type: Option<FirehoseStorageType>,
}

impl DeviceFingerprint {
    pub fn describe(&self) -> String {
        format!(
            "chip={} msm_id={:#010x} serial={:#010x} oem={:#06x} model={:#06x} pk_hash={}",
            if self.chip_name.is_empty() { "?" } else { &self.chip_name },
            self.msm_id,
            self.serial,
            self.oem_id,
            self.model_id,
            if self.pk_hash.is_empty() { "?" } else { &self.pk_hash },
        )
    }
}

/// Host-side Firehose channel state, negotiated through <configure> and
/// <getstorageinfo> at session start.
#[derive(Clone, Debug)]
pub struct FirehoseConfiguration {
    pub storage_type: FirehoseStorageType,
    pub storage_sector_size: usize,
    /// MaxPayloadSizeToTargetInBytes after negotiation
    pub send_buffer_size: usize,
    pub xml_buf_size: usize,
    pub skip_storage_init: bool,
    pub skip_firehose_log: bool,
    pub verbose_firehose: bool,
    /// Total sector count per LUN, as reported by <getstorageinfo>
    pub lun_sector_counts: IndexMap<u8, u64>,
}

impl Default for FirehoseConfiguration {
    fn default() -> Self {
        FirehoseConfiguration {
            storage_type: FirehoseStorageType::default(),
            storage_sector_size: FirehoseStorageType::default().default_sector_size(),
            send_buffer_size: 1024 * 1024,
            xml_buf_size: 4096,
            skip_storage_init: false,
            skip_firehose_log: false,
            verbose_firehose: false,
            lun_sector_counts: IndexMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashPhase {
    Connecting,
    SaharaHandshake,
    LoaderUpload,
    FirehoseConfig,
    ReadPartitionTable,
    ValidatePartitions,
    Flashing,
    ApplyingPatch,
    Rebooting,
    Completed,
}

impl std::fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlashPhase::Connecting => "connecting",
            FlashPhase::SaharaHandshake => "sahara handshake",
            FlashPhase::LoaderUpload => "loader upload",
            FlashPhase::FirehoseConfig => "firehose configuration",
            FlashPhase::ReadPartitionTable => "reading partition table",
            FlashPhase::ValidatePartitions => "validating partitions",
            FlashPhase::Flashing => "flashing",
            FlashPhase::ApplyingPatch => "applying patches",
            FlashPhase::Rebooting => "rebooting",
            FlashPhase::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Event sink for everything a frontend may want to surface: phase changes,
/// per-task transfer progress and the human-readable trace (including the
/// device's own <log> frames).
pub trait FlashEvents {
    fn phase(&self, _phase: FlashPhase, _msg: &str) {}
    fn progress(&self, _current_bytes: u64, _total_bytes: u64) {}
    fn log(&self, _line: &str) {}
}

pub struct NullEvents;

impl FlashEvents for NullEvents {}

/// Cooperative cancellation token, checked before commands, between raw
/// chunks and between flash tasks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EdlError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Marker for byte channels a device session can run over.
pub trait EdlReadWrite: Read + Write {
    /// Drop any queued input, e.g. a stale HELLO from a previous attempt.
    fn flush_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A device session channel: the raw byte pipe plus the negotiated Firehose
/// state, the fingerprint being assembled, and the event sink. All protocol
/// operations are free functions generic over this trait.
pub trait EdlChan: Read + Write {
    fn fh_config(&self) -> &FirehoseConfiguration;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration;
    fn fingerprint(&self) -> &DeviceFingerprint;
    fn mut_fingerprint(&mut self) -> &mut DeviceFingerprint;
    fn events(&self) -> &dyn FlashEvents;
    fn flush_input(&mut self) -> std::io::Result<()>;
}

pub struct EdlDevice<'a> {
    pub rw: Box<dyn EdlReadWrite + 'a>,
    pub fh_cfg: FirehoseConfiguration,
    pub fingerprint: DeviceFingerprint,
    pub events: &'a dyn FlashEvents,
    pub reset_on_drop: bool,
}

impl Read for EdlDevice<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.rw.read(buf)
    }
}

impl Write for EdlDevice<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rw.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.rw.flush()
    }
}

impl EdlChan for EdlDevice<'_> {
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }

    fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    fn mut_fingerprint(&mut self) -> &mut DeviceFingerprint {
        &mut self.fingerprint
    }

    fn events(&self) -> &dyn FlashEvents {
        self.events
    }

    fn flush_input(&mut self) -> std::io::Result<()> {
        self.rw.flush_input()
    }
}

impl Drop for EdlDevice<'_> {
    fn drop(&mut self) {
        if self.reset_on_drop {
            // Best effort; the session is going away either way
            let _ = self.rw.write_all(
                b"<?xml version=\"1.0\" encoding=\"utf-8\"?><data><power value=\"reset_to_edl\" DelayInSeconds=\"0\" /></data>",
            );
            let _ = self.rw.flush();
        }
    }
}
