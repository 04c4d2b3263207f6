// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Test doubles: a channel that replays a canned byte script, and a fake
//! Firehose device that actually parses commands against an in-memory disk
//! so the spoofing and flashing layers can be exercised end to end.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Cursor, Read, Write};

use indexmap::IndexMap;
use xmltree::{Element, XMLNode};

use crate::types::{DeviceFingerprint, EdlChan, FirehoseConfiguration, FlashEvents};

#[derive(Default)]
pub(crate) struct RecordingEvents {
    logs: RefCell<Vec<String>>,
    progress: RefCell<Vec<(u64, u64)>>,
}

impl RecordingEvents {
    pub fn logs(&self) -> Vec<String> {
        self.logs.borrow().clone()
    }

    pub fn progress_events(&self) -> Vec<(u64, u64)> {
        self.progress.borrow().clone()
    }
}

impl FlashEvents for RecordingEvents {
    fn progress(&self, current: u64, total: u64) {
        self.progress.borrow_mut().push((current, total));
    }

    fn log(&self, line: &str) {
        self.logs.borrow_mut().push(line.to_owned());
    }
}

/// Replays a fixed input script and records whatever the host sends.
pub(crate) struct ScriptedChan {
    pub input: Cursor<Vec<u8>>,
    pub output: Vec<u8>,
    pub cfg: FirehoseConfiguration,
    pub fp: DeviceFingerprint,
    pub events: RecordingEvents,
}

impl ScriptedChan {
    pub fn new(script: Vec<u8>) -> Self {
        ScriptedChan {
            input: Cursor::new(script),
            output: Vec::new(),
            cfg: FirehoseConfiguration::default(),
            fp: DeviceFingerprint::default(),
            events: RecordingEvents::default(),
        }
    }
}

impl Read for ScriptedChan {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for ScriptedChan {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl EdlChan for ScriptedChan {
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.cfg
    }

    fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fp
    }

    fn mut_fingerprint(&mut self) -> &mut DeviceFingerprint {
        &mut self.fp
    }

    fn events(&self) -> &dyn FlashEvents {
        &self.events
    }

    fn flush_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

type AccessFn = Box<dyn Fn(&str, &str, u64, u64, u8) -> bool>;

enum RawKind {
    Program { lun: u8, start: u64 },
    Sig { ok: bool },
}

struct RawExpect {
    kind: RawKind,
    remaining: usize,
    buf: Vec<u8>,
}

/// A device-side Firehose implementation over in-memory LUN images.
/// `allow_read`/`allow_write` take (filename, label, start, count, lun) and
/// model vendor whitelists.
pub(crate) struct FakeDevice {
    pub sector_size: usize,
    pub luns: IndexMap<u8, Vec<u8>>,
    pub allow_read: AccessFn,
    pub allow_write: AccessFn,
    pub nak_memory_names: Vec<String>,
    pub max_payload: Option<usize>,
    pub accept_sig_index: Option<usize>,
    pub accept_all_sigs: bool,
    pub sigs_seen: usize,
    pub reads: Vec<(u8, u64, u64, String, String)>,
    pub programs: Vec<(u8, u64, u64, String)>,
    pub erases: Vec<(u8, u64, u64)>,
    pub powered: Option<String>,
    pub bootable: Option<u8>,
    pub total_rx: usize,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    raw: Option<RawExpect>,
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn attr<'a>(e: &'a Element, name: &str) -> &'a str {
    e.attributes.get(name).map(String::as_str).unwrap_or("")
}

fn attr_u64(e: &Element, name: &str) -> u64 {
    attr(e, name).parse().unwrap_or(0)
}

impl FakeDevice {
    pub fn new(sector_size: usize) -> Self {
        FakeDevice {
            sector_size,
            luns: IndexMap::new(),
            allow_read: Box::new(|_, _, _, _, _| true),
            allow_write: Box::new(|_, _, _, _, _| true),
            nak_memory_names: Vec::new(),
            max_payload: None,
            accept_sig_index: None,
            accept_all_sigs: false,
            sigs_seen: 0,
            reads: Vec::new(),
            programs: Vec::new(),
            erases: Vec::new(),
            powered: None,
            bootable: None,
            total_rx: 0,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            raw: None,
        }
    }

    fn push_response(&mut self, value: &str, extra: &[(&str, String)]) {
        let attrs: String = extra
            .iter()
            .map(|(k, v)| format!(" {k}=\"{v}\""))
            .collect();
        let frame = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" ?><data><response value=\"{value}\"{attrs} /></data>"
        );
        self.outbox.extend(frame.as_bytes());
    }

    fn finish_raw(&mut self, raw: RawExpect) {
        match raw.kind {
            RawKind::Program { lun, start } => {
                let ss = self.sector_size;
                let end = start as usize * ss + raw.buf.len();
                let image = self.luns.entry(lun).or_default();
                if image.len() < end {
                    image.resize(end, 0);
                }
                image[start as usize * ss..end].copy_from_slice(&raw.buf);
                self.push_response("ACK", &[]);
            }
            RawKind::Sig { ok } => {
                self.push_response(if ok { "ACK" } else { "NAK" }, &[]);
            }
        }
    }

    fn handle_read(&mut self, e: &Element) {
        let lun = attr_u64(e, "physical_partition_number") as u8;
        let start = attr_u64(e, "start_sector");
        let count = attr_u64(e, "num_partition_sectors");
        let filename = attr(e, "filename").to_owned();
        let label = attr(e, "label").to_owned();

        self.reads
            .push((lun, start, count, filename.clone(), label.clone()));

        let allowed = self.luns.contains_key(&lun)
            && (self.allow_read)(&filename, &label, start, count, lun);
        if !allowed {
            self.push_response("NAK", &[]);
            return;
        }

        let ss = self.sector_size;
        let image = &self.luns[&lun];
        let mut data = vec![0u8; count as usize * ss];
        let from = (start as usize * ss).min(image.len());
        let to = ((start + count) as usize * ss).min(image.len());
        if from < to {
            data[..to - from].copy_from_slice(&image[from..to]);
        }

        self.outbox.extend(data);
        self.push_response("ACK", &[]);
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let start = frame.iter().position(|&b| b == b'<').unwrap();
        let doc = Element::parse(&frame[start..]).expect("host sent malformed XML");

        for node in doc.children.iter() {
            let XMLNode::Element(e) = node else { continue };
            match e.name.as_str() {
                "read" => self.handle_read(e),
                "program" => {
                    let lun = attr_u64(e, "physical_partition_number") as u8;
                    let start = attr_u64(e, "start_sector");
                    let count = attr_u64(e, "num_partition_sectors");
                    let filename = attr(e, "filename").to_owned();
                    let label = attr(e, "label").to_owned();

                    self.programs.push((lun, start, count, label.clone()));

                    if !(self.allow_write)(&filename, &label, start, count, lun) {
                        self.push_response("NAK", &[]);
                        continue;
                    }

                    self.raw = Some(RawExpect {
                        kind: RawKind::Program { lun, start },
                        remaining: count as usize * self.sector_size,
                        buf: Vec::new(),
                    });
                }
                "erase" => {
                    let lun = attr_u64(e, "physical_partition_number") as u8;
                    let start = attr_u64(e, "start_sector");
                    let count = attr_u64(e, "num_partition_sectors");
                    self.erases.push((lun, start, count));

                    let ss = self.sector_size;
                    match self.luns.get_mut(&lun) {
                        Some(image) => {
                            let from = (start as usize * ss).min(image.len());
                            let to = ((start + count) as usize * ss).min(image.len());
                            image[from..to].fill(0);
                            self.push_response("ACK", &[]);
                        }
                        None => self.push_response("NAK", &[]),
                    }
                }
                "configure" => {
                    let mem = attr(e, "MemoryName").to_owned();
                    if self.nak_memory_names.contains(&mem) {
                        self.push_response("NAK", &[]);
                        continue;
                    }

                    let requested = attr_u64(e, "MaxPayloadSizeToTargetInBytes") as usize;
                    let granted = match self.max_payload {
                        Some(m) => m.min(requested.max(1)),
                        None => requested.max(1),
                    };
                    self.push_response(
                        "ACK",
                        &[("MaxPayloadSizeToTargetInBytes", granted.to_string())],
                    );
                }
                "getstorageinfo" => {
                    let lun = attr_u64(e, "physical_partition_number") as u8;
                    match self.luns.get(&lun) {
                        Some(image) => {
                            let sectors = (image.len() / self.sector_size).to_string();
                            let ss = self.sector_size.to_string();
                            self.push_response(
                                "ACK",
                                &[
                                    ("SECTOR_SIZE_IN_BYTES", ss),
                                    ("num_partition_sectors", sectors),
                                ],
                            );
                        }
                        None => self.push_response("NAK", &[]),
                    }
                }
                "sig" => {
                    let size = attr_u64(e, "size_in_bytes") as usize;
                    let idx = self.sigs_seen;
                    self.sigs_seen += 1;
                    let ok = self.accept_all_sigs || self.accept_sig_index == Some(idx);
                    self.raw = Some(RawExpect {
                        kind: RawKind::Sig { ok },
                        remaining: size,
                        buf: Vec::new(),
                    });
                }
                "power" => {
                    self.powered = Some(attr(e, "value").to_owned());
                    self.push_response("ACK", &[]);
                }
                "setbootablestoragedrive" => {
                    self.bootable = Some(attr_u64(e, "value") as u8);
                    self.push_response("ACK", &[]);
                }
                "nop" => self.push_response("ACK", &[]),
                _ => self.push_response("NAK", &[]),
            }
        }
    }

    fn feed(&mut self, mut data: &[u8]) {
        self.total_rx += data.len();

        while !data.is_empty() {
            if let Some(mut raw) = self.raw.take() {
                let n = raw.remaining.min(data.len());
                raw.buf.extend_from_slice(&data[..n]);
                raw.remaining -= n;
                data = &data[n..];

                if raw.remaining == 0 {
                    self.finish_raw(raw);
                } else {
                    self.raw = Some(raw);
                }
                continue;
            }

            self.inbox.extend_from_slice(data);
            data = &[];

            while let Some(pos) = find_subslice(&self.inbox, b"</data>") {
                let frame: Vec<u8> = self.inbox.drain(..pos + b"</data>".len()).collect();
                self.handle_frame(&frame);
                // A <program>/<sig> switches us to raw consumption; anything
                // still queued belongs to the payload
                if self.raw.is_some() {
                    let rest = std::mem::take(&mut self.inbox);
                    self.feed_raw_tail(&rest);
                    break;
                }
            }
        }
    }

    fn feed_raw_tail(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(mut raw) = self.raw.take() {
            let n = raw.remaining.min(data.len());
            raw.buf.extend_from_slice(&data[..n]);
            raw.remaining -= n;
            if raw.remaining == 0 {
                self.finish_raw(raw);
            } else {
                self.raw = Some(raw);
            }
            if n < data.len() {
                self.feed(&data[n..]);
            }
        }
    }
}

pub(crate) struct FakeChan {
    pub dev: FakeDevice,
    pub cfg: FirehoseConfiguration,
    pub fp: DeviceFingerprint,
    pub events: RecordingEvents,
}

impl FakeChan {
    pub fn with_lun(lun: u8, image: Vec<u8>, sector_size: usize) -> Self {
        let mut dev = FakeDevice::new(sector_size);
        dev.luns.insert(lun, image);

        let mut cfg = FirehoseConfiguration::default();
        cfg.storage_sector_size = sector_size;

        FakeChan {
            dev,
            cfg,
            fp: DeviceFingerprint::default(),
            events: RecordingEvents::default(),
        }
    }

    /// An unrestricted 512-byte-sector device with a blank LUN 0.
    pub fn open_disk(total_sectors: u64) -> Self {
        Self::with_lun(0, vec![0u8; total_sectors as usize * 512], 512)
    }

    pub fn output_empty(&self) -> bool {
        self.dev.total_rx == 0
    }
}

impl Read for FakeChan {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.dev.outbox.len());
        for b in buf.iter_mut().take(n) {
            *b = self.dev.outbox.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for FakeChan {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.dev.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl EdlChan for FakeChan {
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.cfg
    }

    fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fp
    }

    fn mut_fingerprint(&mut self) -> &mut DeviceFingerprint {
        &mut self.fp
    }

    fn events(&self) -> &dyn FlashEvents {
        &self.events
    }

    fn flush_input(&mut self) -> std::io::Result<()> {
        self.dev.outbox.clear();
        Ok(())
    }
}
