// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! End-to-end session driver: open the port, run Sahara, upload the
//! programmer, bring up Firehose, read the partition tables and hand out a
//! session object for flashing and service operations.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::executor::{FlashReport, execute_plan};
use crate::gpt::{GptSnapshot, Partition};
use crate::loaders::select_loader;
use crate::plan::FlashPlan;
use crate::sahara::{
    SaharaMode, sahara_connect, sahara_push_loader, sahara_reset, sahara_send_hello_rsp,
};
use crate::strategy::{AuthKind, AuthMaterial, Strategy};
use crate::types::{
    CancelToken, DeviceFingerprint, EdlChan, EdlDevice, EdlError, FirehoseConfiguration,
    FirehoseResetMode, FirehoseStatus, FirehoseStorageType, FlashEvents, FlashPhase, Result,
};
use crate::vip::load_signature_dir;
use crate::{
    firehose_configure, firehose_drain_logs, firehose_get_storage_info, firehose_nop,
    firehose_read, firehose_reset, firehose_set_bootable,
};
use crate::parsers::firehose_parser_configure_response;
use crate::serial::setup_serial_device;

const SAHARA_ATTEMPTS: u32 = 3;
const SAHARA_RETRY_BACKOFF: Duration = Duration::from_secs(1);
const WELCOME_LOG_WINDOW: Duration = Duration::from_millis(500);

pub struct SessionOptions {
    pub dev_path: String,
    pub loader_path: Option<PathBuf>,
    pub loader_dir: Option<PathBuf>,
    pub auth: AuthKind,
    pub vip_digest_path: Option<PathBuf>,
    pub vip_signature_path: Option<PathBuf>,
    pub xiaomi_sig_dir: Option<PathBuf>,
    pub storage_type: FirehoseStorageType,
    /// Overrides both the per-type default and whatever the device reports
    pub sector_size: Option<usize>,
    pub protect_lun5: bool,
    pub skip_storage_init: bool,
    /// Don't wait for HELLO; another program already consumed it
    pub skip_hello_wait: bool,
    /// Drop the programmer's own <log> chatter instead of forwarding it
    pub skip_firehose_log: bool,
    pub reset_mode: FirehoseResetMode,
}

impl SessionOptions {
    pub fn new(dev_path: &str) -> Self {
        SessionOptions {
            dev_path: dev_path.to_owned(),
            loader_path: None,
            loader_dir: None,
            auth: AuthKind::Standard,
            vip_digest_path: None,
            vip_signature_path: None,
            xiaomi_sig_dir: None,
            storage_type: FirehoseStorageType::Ufs,
            sector_size: None,
            protect_lun5: true,
            skip_storage_init: false,
            skip_hello_wait: false,
            skip_firehose_log: false,
            reset_mode: FirehoseResetMode::System,
        }
    }
}

/// The structured result a frontend gets back from [`run_flash`].
#[derive(Debug, Default)]
pub struct FlashOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub failed_phase: Option<FlashPhase>,
    pub partitions_written: usize,
    pub partitions_failed: usize,
    pub elapsed: Duration,
    pub device_info: Option<DeviceFingerprint>,
    pub partition_table: Option<GptSnapshot>,
    pub requires_user_action: bool,
    pub user_guidance: Option<String>,
}

/// A live Firehose session with the partition tables already read.
pub struct EdlSession<'a> {
    pub dev: EdlDevice<'a>,
    pub strategy: Strategy,
    pub gpt: GptSnapshot,
    pub protect_lun5: bool,
    pub cancel: CancelToken,
}

fn load_auth_material(opts: &SessionOptions, events: &dyn FlashEvents) -> AuthMaterial {
    let mut auth = AuthMaterial::default();

    let mut read_blob = |path: &Option<PathBuf>, what: &str| -> Option<Vec<u8>> {
        let path = path.as_ref()?;
        match fs::read(path) {
            Ok(b) => Some(b),
            Err(e) => {
                events.log(&format!("can't read {what} {}: {e}", path.display()));
                None
            }
        }
    };

    auth.vip_digest = read_blob(&opts.vip_digest_path, "VIP digest table");
    auth.vip_signature = read_blob(&opts.vip_signature_path, "VIP signature");

    if let Some(dir) = &opts.xiaomi_sig_dir {
        match load_signature_dir(dir) {
            Ok(sigs) => auth.xiaomi_signatures = sigs,
            Err(e) => events.log(&format!(
                "can't read signatures from {}: {e}",
                dir.display()
            )),
        }
    }

    auth
}

fn sahara_phase(
    dev: &mut EdlDevice<'_>,
    opts: &SessionOptions,
    events: &dyn FlashEvents,
) -> Result<()> {
    let mut enrich = true;

    for attempt in 1..=SAHARA_ATTEMPTS {
        let res = if opts.skip_hello_wait && attempt == 1 {
            sahara_send_hello_rsp(dev, SaharaMode::ImageTxPending)
        } else {
            sahara_connect(dev, enrich)
        };

        match res {
            Ok(()) => return Ok(()),
            Err(e) if attempt < SAHARA_ATTEMPTS => {
                events.log(&format!("sahara attempt {attempt} failed: {e}, retrying"));
                let _ = dev.flush_input();
                // The identity queries are the flakiest part; drop them on retry
                enrich = false;
                thread::sleep(SAHARA_RETRY_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("loop returns on the last attempt")
}

fn configure_phase<T: EdlChan>(
    chan: &mut T,
    skip_storage_init: bool,
    sector_size_override: Option<usize>,
) -> Result<()> {
    firehose_drain_logs(chan, WELCOME_LOG_WINDOW);

    firehose_configure(chan, skip_storage_init)?;
    let mut status = firehose_read(chan, firehose_parser_configure_response)?;

    if status == FirehoseStatus::Nak
        && chan.fh_config().storage_type != FirehoseStorageType::Emmc
    {
        chan.events()
            .log("device refused the configure; retrying as eMMC");
        chan.mut_fh_config().storage_type = FirehoseStorageType::Emmc;
        if sector_size_override.is_none() {
            chan.mut_fh_config().storage_sector_size =
                FirehoseStorageType::Emmc.default_sector_size();
        }

        firehose_configure(chan, skip_storage_init)?;
        status = firehose_read(chan, firehose_parser_configure_response)?;
    }

    if status != FirehoseStatus::Ack {
        return Err(EdlError::Fatal(
            "device rejected every <configure> attempt".to_owned(),
        ));
    }

    // Sector geometry; the per-type default stands if the device is silent
    match firehose_get_storage_info(chan, 0) {
        Ok(info) => {
            if sector_size_override.is_none() {
                if let Some(ss) = info.sector_size {
                    chan.mut_fh_config().storage_sector_size = ss;
                }
            }
        }
        Err(EdlError::Nak) | Err(EdlError::Timeout(_)) => {
            let assumed = chan.fh_config().storage_sector_size;
            chan.events().log(&format!(
                "device reports no storage info, assuming {assumed}-byte sectors"
            ));
        }
        Err(e) => return Err(e),
    }

    Ok(())
}

fn open_session_inner<'a>(
    opts: &SessionOptions,
    events: &'a dyn FlashEvents,
    cancel: &CancelToken,
    phase: &mut FlashPhase,
) -> Result<EdlSession<'a>> {
    let set = |phase: &mut FlashPhase, p: FlashPhase, msg: &str| {
        *phase = p;
        events.phase(p, msg);
    };

    set(phase, FlashPhase::Connecting, &opts.dev_path);
    let transport = setup_serial_device(&opts.dev_path)?;

    let fh_cfg = FirehoseConfiguration {
        storage_type: opts.storage_type,
        storage_sector_size: opts
            .sector_size
            .unwrap_or_else(|| opts.storage_type.default_sector_size()),
        skip_storage_init: opts.skip_storage_init,
        skip_firehose_log: opts.skip_firehose_log,
        ..Default::default()
    };

    let mut dev = EdlDevice {
        rw: Box::new(transport),
        fh_cfg,
        fingerprint: DeviceFingerprint::default(),
        events,
        reset_on_drop: false,
    };

    set(phase, FlashPhase::SaharaHandshake, "waiting for HELLO");
    sahara_phase(&mut dev, opts, events)?;
    events.log(&format!("device: {}", dev.fingerprint.describe()));

    set(phase, FlashPhase::LoaderUpload, "selecting a programmer");
    let loader_path = match select_loader(
        &dev.fingerprint,
        opts.loader_path.as_deref(),
        opts.loader_dir.as_deref(),
    ) {
        Ok(p) => p,
        Err(e) => {
            // The SBL is waiting for an image; reset it instead of leaving
            // the handshake half-open
            let _ = sahara_reset(&mut dev);
            return Err(e);
        }
    };
    events.log(&format!("programmer: {}", loader_path.display()));
    let loader = fs::read(&loader_path)?;
    sahara_push_loader(&mut dev, &loader)?;

    // From here on a dropped session resets the device back to EDL
    dev.reset_on_drop = true;

    set(phase, FlashPhase::FirehoseConfig, "negotiating transfer sizes");
    configure_phase(&mut dev, opts.skip_storage_init, opts.sector_size)?;

    let mut strategy = Strategy::for_auth(opts.auth);
    let auth = load_auth_material(opts, events);
    strategy.authenticate(&mut dev, &auth)?;

    set(phase, FlashPhase::ReadPartitionTable, "reading GPTs");
    let gpt = strategy.read_gpt(&mut dev, cancel)?;
    events.log(&format!(
        "found {} partitions across {} LUNs",
        gpt.len(),
        gpt.luns().count()
    ));

    Ok(EdlSession {
        dev,
        strategy,
        gpt,
        protect_lun5: opts.protect_lun5,
        cancel: cancel.clone(),
    })
}

/// Bring a device all the way up to a usable Firehose session.
pub fn open_session<'a>(
    opts: &SessionOptions,
    events: &'a dyn FlashEvents,
    cancel: &CancelToken,
) -> Result<EdlSession<'a>> {
    let mut phase = FlashPhase::Connecting;
    open_session_inner(opts, events, cancel, &mut phase)
}

impl EdlSession<'_> {
    pub fn partition_table(&self) -> &GptSnapshot {
        &self.gpt
    }

    pub fn refresh_partition_table(&mut self) -> Result<()> {
        self.gpt = self.strategy.read_gpt(&mut self.dev, &self.cancel)?;
        Ok(())
    }

    pub fn find_partition(&self, name: &str) -> Result<Partition> {
        self.gpt.find(name).cloned().ok_or_else(|| {
            EdlError::Plan(format!("no partition named '{name}' on the device"))
        })
    }

    pub fn read_partition(&mut self, name: &str, out: &mut dyn Write) -> Result<()> {
        let part = self.find_partition(name)?;
        self.read_range(part.lun, part.start_lba, part.sectors, &part.name, out)
    }

    pub fn read_range(
        &mut self,
        lun: u8,
        start: u64,
        count: u64,
        label: &str,
        out: &mut dyn Write,
    ) -> Result<()> {
        self.strategy
            .read_range(&mut self.dev, lun, start, count, label, out, &self.cancel)
    }

    /// Flash one image into a named partition. Caller-visible safety: the
    /// image must fit.
    pub fn write_partition(&mut self, name: &str, image: &Path) -> Result<()> {
        let part = self.find_partition(name)?;
        let sector_size = self.dev.fh_cfg.storage_sector_size as u64;

        let len = fs::metadata(image)?.len();
        let sectors = len.div_ceil(sector_size);
        if sectors > part.sectors {
            return Err(EdlError::Plan(format!(
                "{} is {sectors} sectors, partition {name} only holds {}",
                image.display(),
                part.sectors
            )));
        }

        let filename = image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_owned();
        let mut file = fs::File::open(image)?;

        self.strategy.write_range(
            &mut self.dev,
            part.lun,
            &part.start_lba.to_string(),
            sectors,
            &filename,
            &part.name,
            &mut file,
            self.protect_lun5,
            &self.cancel,
        )
    }

    /// Raw sector-range write, for service use. Same LUN 5 policy as
    /// everything else.
    pub fn write_range(&mut self, lun: u8, start: u64, image: &Path) -> Result<()> {
        let sector_size = self.dev.fh_cfg.storage_sector_size as u64;
        let sectors = fs::metadata(image)?.len().div_ceil(sector_size);

        let filename = image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_owned();
        let mut file = fs::File::open(image)?;

        self.strategy.write_range(
            &mut self.dev,
            lun,
            &start.to_string(),
            sectors,
            &filename,
            "raw",
            &mut file,
            self.protect_lun5,
            &self.cancel,
        )
    }

    pub fn erase_partition(&mut self, name: &str) -> Result<()> {
        let part = self.find_partition(name)?;
        self.strategy.erase_range(
            &mut self.dev,
            part.lun,
            part.start_lba,
            part.sectors,
            self.protect_lun5,
        )
    }

    pub fn nop(&mut self) -> Result<()> {
        firehose_nop(&mut self.dev)
    }

    pub fn set_bootable(&mut self, lun: u8) -> Result<()> {
        firehose_set_bootable(&mut self.dev, lun)
    }

    /// Terminal; the session is over afterwards.
    pub fn reset(mut self, mode: FirehoseResetMode) -> Result<()> {
        self.dev.reset_on_drop = false;
        firehose_reset(&mut self.dev, &mode, 0)
    }
}

fn validate_plan(
    plan: &FlashPlan,
    gpt: &GptSnapshot,
    sector_size: usize,
    events: &dyn FlashEvents,
) -> Result<()> {
    for task in &plan.tasks {
        if task.sector_size != sector_size {
            return Err(EdlError::Plan(format!(
                "{}: descriptor assumes {}-byte sectors, device uses {sector_size}",
                task.label, task.sector_size
            )));
        }

        // Cross-check descriptor addresses against the live table; vendors
        // do ship firmware packages for the wrong variant
        if let (Some(start), Some(part)) = (task.start_lba, gpt.find(&task.label)) {
            if part.lun == task.lun && part.start_lba != start {
                events.log(&format!(
                    "warning: {} starts at {} on the device but {} in the descriptor",
                    task.label, part.start_lba, start
                ));
            }
        }
    }

    Ok(())
}

struct FlashProgressState {
    device_info: Option<DeviceFingerprint>,
    partition_table: Option<GptSnapshot>,
    written: usize,
    failed: usize,
}

fn run_flash_inner(
    opts: &SessionOptions,
    firmware: &Path,
    events: &dyn FlashEvents,
    cancel: &CancelToken,
    phase: &mut FlashPhase,
    state: &mut FlashProgressState,
) -> Result<()> {
    let mut session = open_session_inner(opts, events, cancel, phase)?;
    state.device_info = Some(session.dev.fingerprint.clone());
    state.partition_table = Some(session.gpt.clone());

    *phase = FlashPhase::ValidatePartitions;
    events.phase(*phase, "binding the plan to the partition table");
    let plan = FlashPlan::build(firmware, events)?;
    validate_plan(
        &plan,
        &session.gpt,
        session.dev.fh_cfg.storage_sector_size,
        events,
    )?;

    *phase = FlashPhase::Flashing;
    events.phase(
        *phase,
        &format!("{} tasks, {} bytes", plan.tasks.len(), plan.total_bytes()),
    );
    let report: FlashReport = execute_plan(
        &mut session.dev,
        &mut session.strategy,
        &plan,
        opts.protect_lun5,
        cancel,
        Some(opts.reset_mode),
    )?;
    state.written = report.written;
    state.failed = report.failed;

    if !report.ok() {
        return Err(EdlError::Fatal(
            report
                .first_error
                .unwrap_or_else(|| "flash plan failed".to_owned()),
        ));
    }

    // The executor already sent the reset; don't fire the drop reset on top
    session.dev.reset_on_drop = false;

    *phase = FlashPhase::Completed;
    events.phase(*phase, "");
    Ok(())
}

/// Full firmware flash, start to finish, folded into a structured outcome
/// instead of an error so frontends can render partial progress.
pub fn run_flash(
    opts: &SessionOptions,
    firmware: &Path,
    events: &dyn FlashEvents,
    cancel: &CancelToken,
) -> FlashOutcome {
    let started = Instant::now();
    let mut phase = FlashPhase::Connecting;
    let mut state = FlashProgressState {
        device_info: None,
        partition_table: None,
        written: 0,
        failed: 0,
    };

    let result = run_flash_inner(opts, firmware, events, cancel, &mut phase, &mut state);

    let mut outcome = FlashOutcome {
        success: false,
        elapsed: started.elapsed(),
        partitions_written: state.written,
        partitions_failed: state.failed,
        device_info: state.device_info,
        partition_table: state.partition_table,
        ..Default::default()
    };

    match result {
        Ok(()) => outcome.success = true,
        Err(EdlError::RequiresUserAction(guidance)) => {
            outcome.requires_user_action = true;
            outcome.user_guidance = Some(guidance);
        }
        Err(e) => {
            outcome.error_message = Some(e.to_string());
            outcome.failed_phase = Some(phase);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeChan;
    use crate::types::NullEvents;

    #[test]
    fn configure_falls_back_to_emmc_and_adopts_the_sector_size() {
        let mut chan = FakeChan::open_disk(64);
        chan.dev.nak_memory_names = vec!["ufs".to_owned()];
        chan.dev.max_payload = Some(131072);

        configure_phase(&mut chan, false, None).unwrap();

        assert_eq!(chan.cfg.storage_type, FirehoseStorageType::Emmc);
        assert_eq!(chan.cfg.storage_sector_size, 512);
        // The device talked us down from the default megabyte
        assert_eq!(chan.cfg.send_buffer_size, 131072);
    }

    #[test]
    fn unreachable_port_fails_in_the_connect_phase() {
        let opts = SessionOptions::new("/dev/does-not-exist-edl");
        let outcome = run_flash(
            &opts,
            Path::new("/nonexistent-firmware"),
            &NullEvents,
            &CancelToken::new(),
        );

        assert!(!outcome.success);
        assert_eq!(outcome.failed_phase, Some(FlashPhase::Connecting));
        assert!(outcome.error_message.unwrap().contains("does-not-exist"));
        assert!(!outcome.requires_user_action);
    }

    #[test]
    fn plan_validation_rejects_sector_size_mismatch() {
        use crate::plan::FlashTask;

        let mut plan = FlashPlan::default();
        plan.tasks.push(FlashTask {
            lun: 0,
            label: "boot".to_owned(),
            start_sector: "0".to_owned(),
            start_lba: Some(0),
            num_sectors: 1,
            sector_size: 512,
            source: PathBuf::from("/dev/null"),
            file_offset_sectors: 0,
        });

        let err = validate_plan(&plan, &GptSnapshot::default(), 4096, &NullEvents);
        assert!(matches!(err, Err(EdlError::Plan(_))));
    }
}
