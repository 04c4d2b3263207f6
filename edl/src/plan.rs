// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Flash plans from vendor firmware descriptors: every `rawprogram*.xml`
//! under a firmware tree becomes an ordered list of program tasks, every
//! `patch*.xml` a list of on-device patches to run afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use xmltree::{Element, XMLNode};

use crate::types::{EdlError, FlashEvents, Result};

const BOOTABLE_PART_NAMES: [&str; 3] = ["xbl", "xbl_a", "sbl1"];

#[derive(Clone, Debug)]
pub struct FlashTask {
    pub lun: u8,
    pub label: String,
    /// Echoed to the device verbatim; vendors use expressions like
    /// `NUM_DISK_SECTORS-5.` that only the programmer can resolve
    pub start_sector: String,
    /// Numeric form, when `start_sector` is a plain number
    pub start_lba: Option<u64>,
    pub num_sectors: u64,
    pub sector_size: usize,
    pub source: PathBuf,
    pub file_offset_sectors: u64,
}

impl FlashTask {
    pub fn total_bytes(&self) -> u64 {
        self.num_sectors * self.sector_size as u64
    }
}

#[derive(Clone, Debug)]
pub struct PatchTask {
    pub lun: u8,
    pub start_sector: String,
    pub byte_offset: u64,
    pub size_in_bytes: u64,
    /// Literal number or a token like `CRC32(start,len)`
    pub value: String,
}

#[derive(Debug, Default)]
pub struct FlashPlan {
    pub tasks: Vec<FlashTask>,
    pub patches: Vec<PatchTask>,
    /// LUN that held a bootloader label, to be marked bootable afterwards
    pub bootable_lun: Option<u8>,
}

fn required<'a>(e: &'a Element, name: &str, file: &Path) -> Result<&'a str> {
    e.attributes
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| {
            EdlError::Plan(format!(
                "<{}> without {name} in {}",
                e.name,
                file.display()
            ))
        })
}

fn parse_num<N: std::str::FromStr>(raw: &str, name: &str, file: &Path) -> Result<N> {
    raw.trim().parse().map_err(|_| {
        EdlError::Plan(format!(
            "bad {name} value '{raw}' in {}",
            file.display()
        ))
    })
}

fn collect_descriptor_files(
    dir: &Path,
    programs: &mut Vec<PathBuf>,
    patches: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_descriptor_files(&path, programs, patches)?;
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let lower = name.to_ascii_lowercase();
        if !lower.ends_with(".xml") {
            continue;
        }
        if lower.starts_with("rawprogram") {
            programs.push(path);
        } else if lower.starts_with("patch") {
            patches.push(path);
        }
    }
    Ok(())
}

impl FlashPlan {
    /// Build a plan from a firmware directory (searched recursively) or a
    /// single rawprogram file.
    pub fn build(root: &Path, events: &dyn FlashEvents) -> Result<FlashPlan> {
        let mut plan = FlashPlan::default();

        if root.is_file() {
            plan.add_program_file(root, events)?;
            return Ok(plan);
        }

        let mut programs = Vec::new();
        let mut patches = Vec::new();
        collect_descriptor_files(root, &mut programs, &mut patches)?;
        programs.sort();
        patches.sort();

        if programs.is_empty() {
            return Err(EdlError::Plan(format!(
                "no rawprogram*.xml under {}",
                root.display()
            )));
        }

        for p in &programs {
            plan.add_program_file(p, events)?;
        }
        for p in &patches {
            plan.add_patch_file(p, events)?;
        }

        Ok(plan)
    }

    pub fn add_program_file(&mut self, path: &Path, events: &dyn FlashEvents) -> Result<()> {
        let raw = fs::read(path)?;
        let xml = Element::parse(&raw[..])
            .map_err(|e| EdlError::Plan(format!("{}: {e}", path.display())))?;
        let dir = path.parent().unwrap_or(Path::new("."));

        for node in xml.children.iter() {
            let XMLNode::Element(e) = node else { continue };
            if !e.name.eq_ignore_ascii_case("program") {
                continue;
            }

            let label = required(e, "label", path)?.to_owned();
            let sector_size: usize =
                parse_num(required(e, "SECTOR_SIZE_IN_BYTES", path)?, "sector size", path)?;
            let lun: u8 = parse_num(
                required(e, "physical_partition_number", path)?,
                "physical partition number",
                path,
            )?;
            let start_sector = required(e, "start_sector", path)?.to_owned();

            let filename = required(e, "filename", path)?;
            if filename.is_empty() {
                events.log(&format!("skipping bogus entry for {label}"));
                continue;
            }

            let source = {
                let p = Path::new(filename);
                if p.is_absolute() { p.to_owned() } else { dir.join(p) }
            };
            if !source.is_file() {
                events.log(&format!(
                    "skipping {label}: {} does not exist",
                    source.display()
                ));
                continue;
            }

            let file_offset_sectors: u64 = e
                .attributes
                .get("file_sector_offset")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            // num_partition_sectors=0 means "as big as the file"
            let mut num_sectors: u64 =
                parse_num(required(e, "num_partition_sectors", path)?, "sector count", path)?;
            if num_sectors == 0 {
                let len = fs::metadata(&source)?.len();
                let payload = len.saturating_sub(file_offset_sectors * sector_size as u64);
                num_sectors = payload.div_ceil(sector_size as u64);
            }
            if num_sectors == 0 {
                events.log(&format!("skipping 0-length entry for {label}"));
                continue;
            }

            if BOOTABLE_PART_NAMES.contains(&label.as_str()) {
                self.bootable_lun = Some(lun);
            }

            self.tasks.push(FlashTask {
                lun,
                start_lba: start_sector.trim().parse().ok(),
                start_sector,
                num_sectors,
                sector_size,
                source,
                file_offset_sectors,
                label,
            });
        }

        Ok(())
    }

    pub fn add_patch_file(&mut self, path: &Path, events: &dyn FlashEvents) -> Result<()> {
        let raw = fs::read(path)?;
        let xml = Element::parse(&raw[..])
            .map_err(|e| EdlError::Plan(format!("{}: {e}", path.display())))?;

        for node in xml.children.iter() {
            let XMLNode::Element(e) = node else { continue };
            if !e.name.eq_ignore_ascii_case("patch") {
                continue;
            }

            // Entries not aimed at the device patch files on the host
            // filesystem; those were already applied by the vendor
            let filename = required(e, "filename", path)?;
            if filename != "DISK" {
                events.log(&format!("skipping host-side patch of {filename}"));
                continue;
            }

            self.patches.push(PatchTask {
                lun: parse_num(
                    required(e, "physical_partition_number", path)?,
                    "physical partition number",
                    path,
                )?,
                start_sector: required(e, "start_sector", path)?.to_owned(),
                byte_offset: parse_num(required(e, "byte_offset", path)?, "byte offset", path)?,
                size_in_bytes: parse_num(required(e, "size_in_bytes", path)?, "patch size", path)?,
                value: required(e, "value", path)?.to_owned(),
            });
        }

        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.tasks.iter().map(FlashTask::total_bytes).sum()
    }
}
