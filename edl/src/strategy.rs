// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Vendor-specific storage access.
//!
//! Stock programmers ignore the `filename`/`label` attributes on `<read>`
//! and `<program>`. Some vendor builds don't: Oppo/Realme firmware gates
//! sector access on those names (with one "gap" sector only readable under
//! the name of the LUN's first real partition), and Xiaomi firmware wants a
//! signature replay before it talks at all. Each variant lives here behind
//! one common surface.

use std::io::{Read, Write, sink};
use std::str::FromStr;
use std::thread;

use indexmap::IndexMap;

use crate::gpt::{GPT_SIGNATURE, GptHeader, GptSnapshot, Partition, parse_backup_gpt, parse_primary_gpt};
use crate::types::{
    CancelToken, EdlChan, EdlError, PROBE_RETRY_DELAY, Result,
};
use crate::vip::{miauth_bypass, perform_vip_auth};
use crate::{firehose_erase_storage, firehose_get_storage_info, firehose_program_storage, firehose_read_storage};

/// Which authentication family the session runs under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthKind {
    #[default]
    Standard,
    Vip,
    Xiaomi,
}

impl FromStr for AuthKind {
    type Err = EdlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "none" => Ok(AuthKind::Standard),
            "vip" | "oppo" => Ok(AuthKind::Vip),
            "xiaomi" | "miauth" => Ok(AuthKind::Xiaomi),
            _ => Err(EdlError::Protocol(format!("unknown auth kind '{s}'"))),
        }
    }
}

/// Operator-supplied auth blobs. All optional; strategies log and continue
/// without them, and the device gets to reject whatever needs auth later.
#[derive(Default)]
pub struct AuthMaterial {
    pub vip_digest: Option<Vec<u8>>,
    pub vip_signature: Option<Vec<u8>>,
    pub xiaomi_signatures: Vec<Vec<u8>>,
}

/// Access mode of a restricted Oppo/Realme programmer, learned once per
/// session by probing and cached until the device re-attaches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RwMode {
    #[default]
    Unknown,
    /// Names are ignored, plain access works
    Normal,
    /// Only the backup-GPT name pair is whitelisted
    GptBackup,
    /// gpt_main names, sector 6 gated behind the first partition's name
    GptMainGap6,
    /// gpt_main names, sector 34 gated behind the first partition's name
    GptMainGap34,
}

impl RwMode {
    pub fn gap(self) -> Option<u64> {
        match self {
            RwMode::GptMainGap6 => Some(6),
            RwMode::GptMainGap34 => Some(34),
            _ => None,
        }
    }
}

const PROTECTED_LUN: u8 = 5;

fn check_write_allowed(lun: u8, protect_lun5: bool) -> Result<()> {
    if protect_lun5 && lun == PROTECTED_LUN {
        return Err(EdlError::ProtectedLun(lun));
    }
    Ok(())
}

/// Iterate LUNs 0..=5. A LUN without a valid table ends the walk, except
/// for LUN 0 where it is a hard failure (the device clearly has storage).
fn read_all_luns<T, F>(chan: &mut T, mut read_one: F) -> Result<GptSnapshot>
where
    T: EdlChan,
    F: FnMut(&mut T, u8) -> Result<Vec<Partition>>,
{
    let mut snap = GptSnapshot::default();

    for lun in 0..=PROTECTED_LUN {
        match read_one(chan, lun) {
            Ok(parts) => snap.insert_lun(lun, parts),
            Err(e) if lun == 0 => return Err(e),
            Err(
                EdlError::InvalidGpt(_) | EdlError::Nak | EdlError::RestrictedAddress { .. },
            ) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(snap)
}

/// Pull one LUN's table through whatever raw reader the strategy provides:
/// 6 sectors to see the header, the full primary span once its size is
/// known, and the disk tail for the backup table if the primary is damaged.
fn read_lun_gpt<T, F>(chan: &mut T, lun: u8, mut raw_read: F) -> Result<Vec<Partition>>
where
    T: EdlChan,
    F: FnMut(&mut T, u64, u64, &mut Vec<u8>) -> Result<()>,
{
    // Geometry first; also feeds NUM_DISK_SECTORS patches later on
    match firehose_get_storage_info(chan, lun) {
        Ok(_) | Err(EdlError::Nak) | Err(EdlError::Timeout(_)) => {}
        Err(e) => return Err(e),
    }

    let sector_size = chan.fh_config().storage_sector_size;
    let mut head = Vec::new();
    raw_read(chan, 0, 6, &mut head)?;
    if head.len() < 2 * sector_size {
        return Err(EdlError::InvalidGpt("short read of the GPT head".to_owned()));
    }

    if &head[sector_size..sector_size + 8] != GPT_SIGNATURE {
        return Err(EdlError::InvalidGpt(format!(
            "LUN {lun} has no GPT signature"
        )));
    }

    match GptHeader::parse(&head[sector_size..2 * sector_size]) {
        Ok(hdr) => {
            let span = hdr.entries_lba + hdr.entries_len_sectors(sector_size);
            let buf = if span > 6 {
                let mut full = Vec::new();
                raw_read(chan, 0, span, &mut full)?;
                full
            } else {
                head
            };
            parse_primary_gpt(&buf, sector_size, lun)
        }
        Err(primary_err) => {
            // Primary is damaged; the backup table lives in the last 33
            // sectors of the LUN, if we know how big the LUN is.
            let Some(&total) = chan.fh_config().lun_sector_counts.get(&lun) else {
                return Err(primary_err);
            };

            chan.events().log(&format!(
                "LUN {lun} primary GPT is damaged ({primary_err}), trying the backup"
            ));

            let tail_sectors = 33u64.min(total);
            let mut tail = Vec::new();
            raw_read(chan, total - tail_sectors, tail_sectors, &mut tail)?;
            parse_backup_gpt(&tail, sector_size, lun, total)
        }
    }
}

#[derive(Default)]
pub struct StandardStrategy;

impl StandardStrategy {
    fn read_gpt<T: EdlChan>(&mut self, chan: &mut T, cancel: &CancelToken) -> Result<GptSnapshot> {
        read_all_luns(chan, |chan, lun| {
            let filename = format!("gpt_main{lun}.bin");
            read_lun_gpt(chan, lun, |chan, start, count, out| {
                firehose_read_storage(chan, out, lun, start, count, &filename, "PrimaryGPT", cancel)
            })
        })
    }

    fn read_range<T: EdlChan>(
        &mut self,
        chan: &mut T,
        lun: u8,
        start: u64,
        count: u64,
        label: &str,
        out: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<()> {
        let filename = format!("{label}.bin");
        firehose_read_storage(chan, out, lun, start, count, &filename, label, cancel)
    }
}

pub struct OppoStrategy {
    mode: RwMode,
    probed: bool,
    first_names: IndexMap<u8, String>,
}

impl OppoStrategy {
    fn new() -> Self {
        OppoStrategy {
            mode: RwMode::Unknown,
            probed: false,
            first_names: IndexMap::new(),
        }
    }

    /// The (filename, label) pair this mode's whitelist accepts.
    fn names_for(&self, lun: u8) -> (String, String) {
        match self.mode {
            RwMode::GptBackup => (format!("gpt_backup{lun}.bin"), "BackupGPT".to_owned()),
            RwMode::GptMainGap6 | RwMode::GptMainGap34 => {
                (format!("gpt_main{lun}.bin"), format!("gpt_main{lun}.bin"))
            }
            RwMode::Normal | RwMode::Unknown => {
                (format!("gpt_main{lun}.bin"), "PrimaryGPT".to_owned())
            }
        }
    }

    fn probe<T: EdlChan>(
        chan: &mut T,
        start: u64,
        count: u64,
        filename: &str,
        label: &str,
        cancel: &CancelToken,
    ) -> Result<bool> {
        match firehose_read_storage(chan, &mut sink(), 0, start, count, filename, label, cancel) {
            Ok(()) => Ok(true),
            Err(EdlError::Nak) => {
                thread::sleep(PROBE_RETRY_DELAY);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Figure out which whitelist this programmer enforces. Probes run once
    /// per session; the verdict is cached.
    fn ensure_mode<T: EdlChan>(&mut self, chan: &mut T, cancel: &CancelToken) -> Result<RwMode> {
        if self.probed {
            return Ok(self.mode);
        }
        self.probed = true;

        // Sectors 5..=35 under the backup names
        if Self::probe(chan, 5, 31, "gpt_backup0.bin", "BackupGPT", cancel)? {
            self.mode = RwMode::GptBackup;
        // Sectors 33..=35 under gpt_main names: readable only when the gap
        // sits at 6
        } else if Self::probe(chan, 33, 3, "gpt_main0.bin", "gpt_main0.bin", cancel)? {
            self.mode = RwMode::GptMainGap6;
        // Sectors 35..=44: past the gap at 34
        } else if Self::probe(chan, 35, 10, "gpt_main0.bin", "gpt_main0.bin", cancel)? {
            self.mode = RwMode::GptMainGap34;
        // Sectors 0..=5 under the plain names
        } else if Self::probe(chan, 0, 6, "gpt_main0.bin", "PrimaryGPT", cancel)? {
            self.mode = RwMode::Normal;
        } else {
            chan.events()
                .log("no probe succeeded, falling back to per-operation name waterfall");
            return Ok(self.mode);
        }

        chan.events()
            .log(&format!("restricted access mode: {:?}", self.mode));
        Ok(self.mode)
    }

    fn read_plain<T: EdlChan>(
        &self,
        chan: &mut T,
        lun: u8,
        start: u64,
        count: u64,
        out: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<()> {
        let (filename, label) = self.names_for(lun);
        firehose_read_storage(chan, out, lun, start, count, &filename, &label, cancel).map_err(
            |e| match e {
                EdlError::Nak => EdlError::RestrictedAddress {
                    lun,
                    start,
                    end: start + count - 1,
                },
                other => other,
            },
        )
    }

    /// Every name pair seen in the wild, for programmers whose whitelist we
    /// failed to classify.
    fn waterfall_read<T: EdlChan>(
        &self,
        chan: &mut T,
        lun: u8,
        start: u64,
        count: u64,
        label: &str,
        out: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<()> {
        let pairs = [
            (format!("gpt_main{lun}.bin"), "PrimaryGPT".to_owned()),
            (format!("gpt_backup{lun}.bin"), "BackupGPT".to_owned()),
            (format!("gpt_main{lun}.bin"), format!("gpt_main{lun}.bin")),
            (format!("{label}.img"), label.to_owned()),
        ];

        for (filename, l) in &pairs {
            match firehose_read_storage(chan, out, lun, start, count, filename, l, cancel) {
                Ok(()) => return Ok(()),
                Err(EdlError::Nak) => thread::sleep(PROBE_RETRY_DELAY),
                Err(e) => return Err(e),
            }
        }

        Err(EdlError::RestrictedAddress {
            lun,
            start,
            end: start + count - 1,
        })
    }

    fn read_range<T: EdlChan>(
        &mut self,
        chan: &mut T,
        lun: u8,
        start: u64,
        count: u64,
        label: &str,
        out: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mode = self.ensure_mode(chan, cancel)?;
        if mode == RwMode::Unknown {
            return self.waterfall_read(chan, lun, start, count, label, out, cancel);
        }

        let end = start + count - 1;
        if let Some(gap) = mode.gap() {
            if start <= gap && gap <= end {
                // The gap sector only opens under the name of the LUN's
                // first real partition, so split the read around it
                let first = self
                    .first_names
                    .get(&lun)
                    .cloned()
                    .ok_or(EdlError::RestrictedAddress {
                        lun,
                        start: gap,
                        end: gap,
                    })?;

                if start < gap {
                    self.read_plain(chan, lun, start, gap - start, out, cancel)?;
                }
                firehose_read_storage(chan, out, lun, gap, 1, &first, &first, cancel).map_err(
                    |e| match e {
                        EdlError::Nak => EdlError::RestrictedAddress {
                            lun,
                            start: gap,
                            end: gap,
                        },
                        other => other,
                    },
                )?;
                if gap < end {
                    self.read_plain(chan, lun, gap + 1, end - gap, out, cancel)?;
                }
                return Ok(());
            }
        }

        self.read_plain(chan, lun, start, count, out, cancel)
    }

    fn read_gpt<T: EdlChan>(&mut self, chan: &mut T, cancel: &CancelToken) -> Result<GptSnapshot> {
        let mode = self.ensure_mode(chan, cancel)?;

        // Table reads never cross the gap: a gap of 6 comes with 4096-byte
        // sectors (table spans 0..=5), a gap of 34 with 512-byte sectors
        // (table spans 0..=33).
        let me = &*self;
        let snap = read_all_luns(chan, |chan, lun| {
            read_lun_gpt(chan, lun, |chan, start, count, out| {
                if mode == RwMode::Unknown {
                    me.waterfall_read(chan, lun, start, count, "PrimaryGPT", out, cancel)
                } else {
                    me.read_plain(chan, lun, start, count, out, cancel)
                }
            })
        })?;

        for lun in snap.luns().collect::<Vec<_>>() {
            if let Some(first) = snap.first_partition_name(lun) {
                self.first_names.insert(lun, first.to_owned());
            }
        }

        Ok(snap)
    }
}

pub struct XiaomiStrategy;

impl XiaomiStrategy {
    fn read_gpt<T: EdlChan>(&mut self, chan: &mut T, cancel: &CancelToken) -> Result<GptSnapshot> {
        read_all_luns(chan, |chan, lun| {
            let filename = format!("gpt_main{lun}.bin");
            read_lun_gpt(chan, lun, |chan, start, count, out| {
                firehose_read_storage(chan, out, lun, start, count, &filename, "PrimaryGPT", cancel)
            })
        })
    }

    fn read_range<T: EdlChan>(
        &mut self,
        chan: &mut T,
        lun: u8,
        start: u64,
        count: u64,
        label: &str,
        out: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<()> {
        let filename = format!("{label}.img");
        firehose_read_storage(chan, out, lun, start, count, &filename, label, cancel)
    }
}

/// The three supported access strategies behind one dispatch surface.
pub enum Strategy {
    Standard(StandardStrategy),
    Oppo(OppoStrategy),
    Xiaomi(XiaomiStrategy),
}

impl Strategy {
    pub fn for_auth(kind: AuthKind) -> Strategy {
        match kind {
            AuthKind::Standard => Strategy::Standard(StandardStrategy),
            AuthKind::Vip => Strategy::Oppo(OppoStrategy::new()),
            AuthKind::Xiaomi => Strategy::Xiaomi(XiaomiStrategy),
        }
    }

    /// Run whatever unlock the variant needs. Missing material downgrades
    /// to a warning; the device will refuse restricted operations later and
    /// that refusal is the real answer.
    pub fn authenticate<T: EdlChan>(&mut self, chan: &mut T, auth: &AuthMaterial) -> Result<()> {
        match self {
            Strategy::Standard(_) => Ok(()),
            Strategy::Oppo(_) => match (&auth.vip_digest, &auth.vip_signature) {
                (Some(digest), Some(sig)) => perform_vip_auth(chan, digest, sig),
                _ => {
                    chan.events()
                        .log("no VIP digest/signature supplied, proceeding unauthenticated");
                    Ok(())
                }
            },
            Strategy::Xiaomi(_) => {
                if auth.xiaomi_signatures.is_empty() {
                    chan.events()
                        .log("no precomputed signatures supplied, proceeding unauthenticated");
                    return Ok(());
                }
                miauth_bypass(chan, &auth.xiaomi_signatures).map(|_| ())
            }
        }
    }

    pub fn read_gpt<T: EdlChan>(&mut self, chan: &mut T, cancel: &CancelToken) -> Result<GptSnapshot> {
        match self {
            Strategy::Standard(s) => s.read_gpt(chan, cancel),
            Strategy::Oppo(s) => s.read_gpt(chan, cancel),
            Strategy::Xiaomi(s) => s.read_gpt(chan, cancel),
        }
    }

    pub fn read_range<T: EdlChan>(
        &mut self,
        chan: &mut T,
        lun: u8,
        start: u64,
        count: u64,
        label: &str,
        out: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<()> {
        match self {
            Strategy::Standard(s) => s.read_range(chan, lun, start, count, label, out, cancel),
            Strategy::Oppo(s) => s.read_range(chan, lun, start, count, label, out, cancel),
            Strategy::Xiaomi(s) => s.read_range(chan, lun, start, count, label, out, cancel),
        }
    }

    /// Writes pass the plan's own names through; vendor rawprogram files
    /// already carry whatever the firmware whitelist wants to see.
    pub fn write_range<T: EdlChan>(
        &mut self,
        chan: &mut T,
        lun: u8,
        start_sector: &str,
        count: u64,
        filename: &str,
        label: &str,
        src: &mut dyn Read,
        protect_lun5: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        check_write_allowed(lun, protect_lun5)?;

        firehose_program_storage(chan, src, lun, start_sector, count, filename, label, cancel)
            .map_err(|e| match e {
                EdlError::Nak if !matches!(self, Strategy::Standard(_)) => {
                    let start = start_sector.parse::<u64>().unwrap_or(0);
                    EdlError::RestrictedAddress {
                        lun,
                        start,
                        end: start + count.saturating_sub(1),
                    }
                }
                other => other,
            })
    }

    pub fn erase_range<T: EdlChan>(
        &mut self,
        chan: &mut T,
        lun: u8,
        start: u64,
        count: u64,
        protect_lun5: bool,
    ) -> Result<()> {
        check_write_allowed(lun, protect_lun5)?;
        firehose_erase_storage(chan, lun, start, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::tests::build_disk_with;
    use crate::testutil::FakeChan;

    const UFS_SECTOR: usize = 4096;

    fn gap6_chan() -> FakeChan {
        // 4096-byte sectors: GPT spans sectors 0..=5, the gap sits at 6
        let disk = build_disk_with(64, UFS_SECTOR, &[("xbl", 10, 19), ("boot", 20, 39)]);
        let mut chan = FakeChan::with_lun(0, disk, UFS_SECTOR);
        chan.dev.allow_read = Box::new(|filename, label, start, count, _| {
            let crosses_gap = start <= 6 && 6 <= start + count - 1;
            let gpt_names = filename == "gpt_main0.bin" && label == "gpt_main0.bin";
            let first_part = filename == "xbl" && label == "xbl" && start == 6 && count == 1;
            (gpt_names && !crosses_gap) || first_part
        });
        chan
    }

    #[test]
    fn probe_ladder_finds_gap6_mode() {
        let mut chan = gap6_chan();
        let mut strat = OppoStrategy::new();

        let mode = strat.ensure_mode(&mut chan, &CancelToken::new()).unwrap();
        assert_eq!(mode, RwMode::GptMainGap6);

        // backup probe NAKed, gptmain probe passed
        assert_eq!(chan.dev.reads[0].3, "gpt_backup0.bin");
        assert_eq!(chan.dev.reads[1].3, "gpt_main0.bin");

        // Cached: probing again must not touch the device
        let before = chan.dev.reads.len();
        strat.ensure_mode(&mut chan, &CancelToken::new()).unwrap();
        assert_eq!(chan.dev.reads.len(), before);
    }

    #[test]
    fn gap_read_is_split_and_byte_identical() {
        let mut chan = gap6_chan();
        let mut strat = OppoStrategy::new();
        let cancel = CancelToken::new();

        let snap = strat.read_gpt(&mut chan, &cancel).unwrap();
        assert_eq!(snap.first_partition_name(0), Some("xbl"));

        chan.dev.reads.clear();
        let mut out = Vec::new();
        strat
            .read_range(&mut chan, 0, 0, 20, "boot", &mut out, &cancel)
            .unwrap();

        // [0..=5] + [6..=6] + [7..=19], middle read named after xbl
        let reads: Vec<_> = chan
            .dev
            .reads
            .iter()
            .map(|(_, start, count, filename, label)| {
                (*start, *count, filename.clone(), label.clone())
            })
            .collect();
        assert_eq!(reads.len(), 3);
        assert_eq!(reads[0].0, 0);
        assert_eq!(reads[0].1, 6);
        assert_eq!(reads[1], (6, 1, "xbl".to_owned(), "xbl".to_owned()));
        assert_eq!(reads[2].0, 7);
        assert_eq!(reads[2].1, 13);

        // Byte-identical to the underlying disk span
        assert_eq!(out, chan.dev.luns[&0][..20 * UFS_SECTOR]);
    }

    #[test]
    fn reads_away_from_the_gap_are_not_split() {
        let mut chan = gap6_chan();
        let mut strat = OppoStrategy::new();
        let cancel = CancelToken::new();
        strat.read_gpt(&mut chan, &cancel).unwrap();

        chan.dev.reads.clear();
        let mut out = Vec::new();
        strat
            .read_range(&mut chan, 0, 10, 10, "xbl", &mut out, &cancel)
            .unwrap();
        assert_eq!(chan.dev.reads.len(), 1);
        assert_eq!(out, chan.dev.luns[&0][10 * UFS_SECTOR..20 * UFS_SECTOR]);
    }

    #[test]
    fn backup_mode_wins_when_its_probe_passes() {
        let disk = build_disk_with(64, UFS_SECTOR, &[("xbl", 10, 19)]);
        let mut chan = FakeChan::with_lun(0, disk, UFS_SECTOR);
        chan.dev.allow_read =
            Box::new(|filename, label, _, _, _| filename.starts_with("gpt_backup") && label == "BackupGPT");

        let mut strat = OppoStrategy::new();
        let mode = strat.ensure_mode(&mut chan, &CancelToken::new()).unwrap();
        assert_eq!(mode, RwMode::GptBackup);
        assert!(mode.gap().is_none());
    }

    #[test]
    fn standard_strategy_walks_luns_until_one_is_missing() {
        let disk0 = build_disk_with(128, 512, &[("xbl", 40, 49)]);
        let disk1 = build_disk_with(128, 512, &[("modem", 40, 59)]);
        let mut chan = FakeChan::with_lun(0, disk0, 512);
        chan.dev.luns.insert(1, disk1);

        let mut strat = Strategy::for_auth(AuthKind::Standard);
        let snap = strat.read_gpt(&mut chan, &CancelToken::new()).unwrap();

        assert_eq!(snap.luns().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(snap.find("modem").unwrap().lun, 1);
    }

    #[test]
    fn missing_first_lun_is_fatal() {
        let mut chan = FakeChan::with_lun(0, vec![0u8; 64 * 512], 512);
        chan.dev.allow_read = Box::new(|_, _, _, _, _| false);

        let mut strat = Strategy::for_auth(AuthKind::Standard);
        assert!(strat.read_gpt(&mut chan, &CancelToken::new()).is_err());
    }

    #[test]
    fn lun5_writes_are_rejected_without_device_contact() {
        let mut chan = FakeChan::open_disk(64);
        let mut strat = Strategy::for_auth(AuthKind::Standard);

        let err = strat.write_range(
            &mut chan,
            5,
            "0",
            1,
            "rpmb.img",
            "rpmb",
            &mut &[0u8; 512][..],
            true,
            &CancelToken::new(),
        );
        assert!(matches!(err, Err(EdlError::ProtectedLun(5))));
        assert!(chan.dev.programs.is_empty());
        assert!(chan.output_empty());

        // With the override the write goes through
        strat
            .write_range(
                &mut chan,
                5,
                "0",
                1,
                "rpmb.img",
                "rpmb",
                &mut &[0u8; 512][..],
                false,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(chan.dev.programs.len(), 1);
    }

    #[test]
    fn erase_honors_the_lun5_policy_too() {
        let mut chan = FakeChan::open_disk(64);
        let mut strat = Strategy::for_auth(AuthKind::Standard);

        let err = strat.erase_range(&mut chan, 5, 0, 4, true);
        assert!(matches!(err, Err(EdlError::ProtectedLun(5))));
        assert!(chan.dev.erases.is_empty());

        strat.erase_range(&mut chan, 0, 8, 4, true).unwrap();
        assert_eq!(chan.dev.erases, vec![(0, 8, 4)]);
    }
}
