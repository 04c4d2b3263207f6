// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Drives a [`FlashPlan`](crate::plan::FlashPlan) through a device
//! strategy: program tasks in plan order, then the patch list, then an
//! optional bootable mark and reset. Aborts the remainder of the plan on
//! the first failure and reports the aggregate.

use std::fs::File;
use std::io::{Seek, SeekFrom};

use crate::plan::{FlashPlan, FlashTask, PatchTask};
use crate::strategy::Strategy;
use crate::types::{CancelToken, EdlChan, EdlError, FirehoseResetMode, FlashPhase, Result};
use crate::{firehose_reset, firehose_set_bootable};

#[derive(Clone, Debug, Default)]
pub struct FlashReport {
    pub written: usize,
    pub failed: usize,
    pub first_error: Option<String>,
}

impl FlashReport {
    pub fn ok(&self) -> bool {
        self.failed == 0
    }
}

fn run_one_task<T: EdlChan>(
    chan: &mut T,
    strategy: &mut Strategy,
    task: &FlashTask,
    protect_lun5: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let dev_sector = chan.fh_config().storage_sector_size;
    if task.sector_size != dev_sector {
        return Err(EdlError::Plan(format!(
            "{}: descriptor assumes {}-byte sectors, device uses {dev_sector}",
            task.label, task.sector_size
        )));
    }

    let mut file = File::open(&task.source)?;
    file.seek(SeekFrom::Start(
        task.file_offset_sectors * task.sector_size as u64,
    ))?;

    let filename = task
        .source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_owned();

    strategy.write_range(
        chan,
        task.lun,
        &task.start_sector,
        task.num_sectors,
        &filename,
        &task.label,
        &mut file,
        protect_lun5,
        cancel,
    )
}

/// Program every task, in order. The first failure aborts the rest;
/// cancellation aborts the executor itself.
pub fn run_programs<T: EdlChan>(
    chan: &mut T,
    strategy: &mut Strategy,
    tasks: &[FlashTask],
    protect_lun5: bool,
    cancel: &CancelToken,
) -> Result<FlashReport> {
    let mut report = FlashReport::default();

    for (idx, task) in tasks.iter().enumerate() {
        cancel.check()?;

        chan.events().log(&format!(
            "[{}/{}] writing {} ({} bytes) to LUN {} @ {}",
            idx + 1,
            tasks.len(),
            task.label,
            task.total_bytes(),
            task.lun,
            task.start_sector
        ));

        match run_one_task(chan, strategy, task, protect_lun5, cancel) {
            Ok(()) => report.written += 1,
            Err(EdlError::Cancelled) => return Err(EdlError::Cancelled),
            Err(e) => {
                chan.events()
                    .log(&format!("{} failed: {e}; aborting the plan", task.label));
                report.failed = tasks.len() - report.written;
                report.first_error = Some(format!("{}: {e}", task.label));
                return Ok(report);
            }
        }
    }

    Ok(report)
}

/// Resolve a descriptor sector expression: a plain number, or
/// `NUM_DISK_SECTORS[-N]` (with the vendor's trailing dot) against the LUN
/// geometry learned from <getstorageinfo>.
fn resolve_sector_expr(expr: &str, total_sectors: Option<u64>) -> Result<u64> {
    let expr = expr.trim().trim_end_matches('.');

    if let Some(rest) = expr.strip_prefix("NUM_DISK_SECTORS") {
        let total = total_sectors.ok_or_else(|| {
            EdlError::Plan(format!(
                "'{expr}' needs the LUN size, which the device did not report"
            ))
        })?;

        let rest = rest.trim();
        if rest.is_empty() {
            return Ok(total);
        }
        let offset: u64 = rest
            .strip_prefix('-')
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| EdlError::Plan(format!("unsupported sector expression '{expr}'")))?;
        return total
            .checked_sub(offset)
            .ok_or_else(|| EdlError::Plan(format!("'{expr}' underflows the LUN size")));
    }

    if let Some(hex) = expr.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| EdlError::Plan(format!("bad sector literal '{expr}'")));
    }

    expr.parse()
        .map_err(|_| EdlError::Plan(format!("bad sector literal '{expr}'")))
}

/// Resolve a patch value: a number, or `CRC32(start,len)` computed over the
/// device's current content at that range.
fn resolve_patch_value<T: EdlChan>(
    chan: &mut T,
    strategy: &mut Strategy,
    patch: &PatchTask,
    total_sectors: Option<u64>,
    cancel: &CancelToken,
) -> Result<u64> {
    let value = patch.value.trim();

    if let Some(inner) = value
        .strip_prefix("CRC32(")
        .and_then(|v| v.strip_suffix(')'))
    {
        let (start_expr, len_str) = inner.split_once(',').ok_or_else(|| {
            EdlError::Plan(format!("malformed patch value '{value}'"))
        })?;

        let start = resolve_sector_expr(start_expr, total_sectors)?;
        let len: u64 = len_str
            .trim()
            .parse()
            .map_err(|_| EdlError::Plan(format!("bad CRC32 length in '{value}'")))?;

        let sector_size = chan.fh_config().storage_sector_size as u64;
        let sectors = len.div_ceil(sector_size);
        let mut data = Vec::with_capacity((sectors * sector_size) as usize);
        strategy.read_range(chan, patch.lun, start, sectors, "PrimaryGPT", &mut data, cancel)?;

        return Ok(crc32fast::hash(&data[..len as usize]) as u64);
    }

    if let Some(hex) = value.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| EdlError::Plan(format!("bad patch value '{value}'")));
    }

    value
        .parse()
        .map_err(|_| EdlError::Plan(format!("bad patch value '{value}'")))
}

fn apply_one_patch<T: EdlChan>(
    chan: &mut T,
    strategy: &mut Strategy,
    patch: &PatchTask,
    protect_lun5: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let sector_size = chan.fh_config().storage_sector_size as u64;
    let total_sectors = chan.fh_config().lun_sector_counts.get(&patch.lun).copied();

    let base = resolve_sector_expr(&patch.start_sector, total_sectors)?;
    let sector = base + patch.byte_offset / sector_size;
    let offset = (patch.byte_offset % sector_size) as usize;

    if offset as u64 + patch.size_in_bytes > sector_size {
        return Err(EdlError::Plan(format!(
            "patch at sector {sector} crosses a sector boundary"
        )));
    }
    if patch.size_in_bytes > 8 {
        return Err(EdlError::Plan(format!(
            "patch of {} bytes is wider than a u64",
            patch.size_in_bytes
        )));
    }

    let value = resolve_patch_value(chan, strategy, patch, total_sectors, cancel)?;

    // Read, splice, write back
    let mut buf = Vec::with_capacity(sector_size as usize);
    strategy.read_range(chan, patch.lun, sector, 1, "PrimaryGPT", &mut buf, cancel)?;

    let bytes = value.to_le_bytes();
    buf[offset..offset + patch.size_in_bytes as usize]
        .copy_from_slice(&bytes[..patch.size_in_bytes as usize]);

    strategy.write_range(
        chan,
        patch.lun,
        &sector.to_string(),
        1,
        "DISK",
        "PrimaryGPT",
        &mut &buf[..],
        protect_lun5,
        cancel,
    )
}

/// Apply the patch list, in order. Unlike programs, a failing patch is a
/// hard error: half-patched tables are worse than unpatched ones.
pub fn apply_patches<T: EdlChan>(
    chan: &mut T,
    strategy: &mut Strategy,
    patches: &[PatchTask],
    protect_lun5: bool,
    cancel: &CancelToken,
) -> Result<()> {
    for patch in patches {
        cancel.check()?;
        apply_one_patch(chan, strategy, patch, protect_lun5, cancel)?;
    }
    Ok(())
}

/// The whole plan in one call: programs, then patches and the bootable
/// mark, then an optional reset once everything stuck. A failed plan skips
/// the follow-up steps so the caller decides what state to leave the
/// device in.
pub fn execute_plan<T: EdlChan>(
    chan: &mut T,
    strategy: &mut Strategy,
    plan: &FlashPlan,
    protect_lun5: bool,
    cancel: &CancelToken,
    reset_after: Option<FirehoseResetMode>,
) -> Result<FlashReport> {
    let report = run_programs(chan, strategy, &plan.tasks, protect_lun5, cancel)?;

    if report.ok() {
        chan.events().phase(
            FlashPhase::ApplyingPatch,
            &format!("{} patches", plan.patches.len()),
        );
        apply_patches(chan, strategy, &plan.patches, protect_lun5, cancel)?;

        if let Some(lun) = plan.bootable_lun {
            chan.events().log(&format!("marking LUN {lun} bootable"));
            firehose_set_bootable(chan, lun)?;
        }

        if let Some(mode) = reset_after {
            chan.events().phase(FlashPhase::Rebooting, &mode.to_string());
            firehose_reset(chan, &mode, 0)?;
        }
    }

    Ok(report)
}
