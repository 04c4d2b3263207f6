// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Host-side implementation of the Qualcomm Emergency Download stack:
//! the Sahara boot protocol, the Firehose programmer protocol and the
//! flashing machinery layered on top of them.

pub mod executor;
pub mod gpt;
pub mod loaders;
pub mod orchestrator;
pub mod parsers;
pub mod plan;
pub mod sahara;
pub mod serial;
pub mod strategy;
pub mod types;
pub mod vip;

#[cfg(test)]
pub(crate) mod testutil;

use indexmap::IndexMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::parsers::firehose_parser_ack_nak;
use crate::serial::{read_exact_timeout, read_some, read_until};
use crate::types::{
    CancelToken, EdlChan, EdlError, FirehoseResetMode, FirehoseStatus, Result, TIMEOUT_CONTROL,
    TIMEOUT_DATA, TIMEOUT_ERASE,
};

/// Signature every response parser conforms to. The channel reference lets
/// parsers update the negotiated configuration in place.
pub type FirehoseParser<T> =
    fn(&mut T, &IndexMap<String, String>) -> Result<FirehoseStatus>;

/// Render a single-command Firehose document: `<?xml?><data><cmd …/></data>`.
/// Attribute order is preserved, some programmers care.
pub fn firehose_xml_setup(cmd: &str, args: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut cmd_el = Element::new(cmd);
    for (k, v) in args {
        cmd_el.attributes.insert((*k).to_owned(), (*v).to_owned());
    }

    let mut root = Element::new("data");
    root.children.push(XMLNode::Element(cmd_el));

    let mut out = Vec::new();
    root.write_with_config(
        &mut out,
        EmitterConfig::new()
            .write_document_declaration(true)
            .perform_indent(false),
    )
    .map_err(|e| EdlError::Protocol(format!("xml encode: {e}")))?;

    Ok(out)
}

pub(crate) fn firehose_tx<T: EdlChan>(
    chan: &mut T,
    cmd: &str,
    args: &[(&str, &str)],
) -> Result<()> {
    let pkt = firehose_xml_setup(cmd, args)?;
    let xml_max = chan.fh_config().xml_buf_size;
    if pkt.len() > xml_max {
        return Err(EdlError::Protocol(format!(
            "<{cmd}> document is {} bytes, device takes at most {xml_max}",
            pkt.len()
        )));
    }

    if chan.fh_config().verbose_firehose {
        chan.events()
            .log(&format!("firehose tx: {}", String::from_utf8_lossy(&pkt)));
    }

    chan.write_all(&pkt)?;
    chan.flush()?;
    Ok(())
}

fn parse_frame(frame: &[u8]) -> Result<Element> {
    // Programmers occasionally prefix frames with stray NULs
    let start = frame
        .iter()
        .position(|&b| b == b'<')
        .ok_or_else(|| EdlError::Protocol("frame contains no XML".to_owned()))?;

    Element::parse(&frame[start..])
        .map_err(|e| EdlError::Protocol(format!("malformed firehose frame: {e}")))
}

/// Walk one `<data>` document: forward `<log>` entries, hand the first
/// `<response>` to the parser. Returns None for log-only frames.
fn dispatch_frame<T: EdlChan>(
    chan: &mut T,
    frame: &[u8],
    parser: FirehoseParser<T>,
) -> Result<Option<FirehoseStatus>> {
    let doc = parse_frame(frame)?;

    for node in doc.children.iter() {
        if let XMLNode::Element(e) = node {
            match e.name.to_ascii_lowercase().as_str() {
                "log" => {
                    if let Some(v) = e.attributes.get("value") {
                        if !chan.fh_config().skip_firehose_log {
                            chan.events().log(v);
                        }
                    }
                }
                "response" => return parser(chan, &e.attributes).map(Some),
                _ => continue,
            }
        }
    }

    Ok(None)
}

/// Accumulate frames until a `<response>` shows up, forwarding interleaved
/// logs along the way.
pub fn firehose_read_timeout<T: EdlChan>(
    chan: &mut T,
    timeout: Duration,
    parser: FirehoseParser<T>,
) -> Result<FirehoseStatus> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EdlError::Timeout("firehose response"));
        }

        let frame = read_until(chan, b"</data>", remaining, "firehose response")?;
        if let Some(status) = dispatch_frame(chan, &frame, parser)? {
            return Ok(status);
        }
    }
}

pub fn firehose_read<T: EdlChan>(chan: &mut T, parser: FirehoseParser<T>) -> Result<FirehoseStatus> {
    firehose_read_timeout(chan, TIMEOUT_DATA, parser)
}

/// Collect whatever the programmer feels like printing right after boot.
/// There is no response to wait for, so this runs until the line goes quiet.
pub fn firehose_drain_logs<T: EdlChan>(chan: &mut T, window: Duration) {
    let deadline = Instant::now() + window;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }

        match read_until(chan, b"</data>", remaining, "firehose log") {
            Ok(frame) => {
                let _ = dispatch_frame(chan, &frame, firehose_parser_ack_nak);
            }
            Err(_) => return,
        }
    }
}

/// Send the host capabilities. The reply must be pumped separately with
/// [`parsers::firehose_parser_configure_response`], which adopts whatever
/// payload size the device talks us down to.
pub fn firehose_configure<T: EdlChan>(chan: &mut T, skip_storage_init: bool) -> Result<()> {
    let memory_name = chan.fh_config().storage_type.memory_name();
    let payload_size = chan.fh_config().send_buffer_size.to_string();

    firehose_tx(
        chan,
        "configure",
        &[
            ("MemoryName", memory_name),
            ("MaxPayloadSizeToTargetInBytes", &payload_size),
            ("Verbose", "0"),
            ("AlwaysValidate", "0"),
            ("MaxDigestTableSizeInBytes", "2048"),
            ("ZlpAwareHost", "1"),
            ("SkipStorageInit", if skip_storage_init { "1" } else { "0" }),
        ],
    )
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StorageInfo {
    pub sector_size: Option<usize>,
    pub total_sectors: Option<u64>,
}

fn json_u64(line: &str, key: &str) -> Option<u64> {
    let needle = format!("\"{key}\":");
    let idx = line.find(&needle)?;
    let digits: String = line[idx + needle.len()..]
        .chars()
        .skip_while(|c| *c == ' ')
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Query sector geometry for one LUN. Newer programmers answer in response
/// attributes, older ones bury a JSON blob in the log stream; take either.
pub fn firehose_get_storage_info<T: EdlChan>(chan: &mut T, lun: u8) -> Result<StorageInfo> {
    let lun_s = lun.to_string();
    firehose_tx(
        chan,
        "getstorageinfo",
        &[("physical_partition_number", &lun_s)],
    )?;

    let deadline = Instant::now() + TIMEOUT_CONTROL;
    let mut info = StorageInfo::default();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EdlError::Timeout("storage info"));
        }

        let frame = read_until(chan, b"</data>", remaining, "storage info")?;
        let doc = parse_frame(&frame)?;

        for node in doc.children.iter() {
            let XMLNode::Element(e) = node else { continue };
            match e.name.to_ascii_lowercase().as_str() {
                "log" => {
                    if let Some(v) = e.attributes.get("value") {
                        if let Some(n) = json_u64(v, "block_size") {
                            info.sector_size = Some(n as usize);
                        }
                        if let Some(n) = json_u64(v, "total_blocks") {
                            info.total_sectors = Some(n);
                        }
                        if !chan.fh_config().skip_firehose_log {
                            chan.events().log(v);
                        }
                    }
                }
                "response" => {
                    if let Some(n) = e.attributes.get("SECTOR_SIZE_IN_BYTES") {
                        info.sector_size = n.parse().ok();
                    }
                    if let Some(n) = e.attributes.get("num_partition_sectors") {
                        info.total_sectors = n.parse().ok();
                    }

                    let status = firehose_parser_ack_nak(chan, &e.attributes)?;
                    if status == FirehoseStatus::Nak {
                        return Err(EdlError::Nak);
                    }

                    if let Some(total) = info.total_sectors {
                        chan.mut_fh_config().lun_sector_counts.insert(lun, total);
                    }
                    return Ok(info);
                }
                _ => continue,
            }
        }
    }
}

/// The programmer either starts streaming sectors or refuses with an XML
/// frame in place of the data. Restricted vendor firmware does the latter a
/// lot, so sniff the first bytes instead of waiting out a long timeout.
fn handle_early_frame<T: EdlChan>(chan: &mut T, head: &[u8]) -> Result<()> {
    let mut frame = head.to_vec();
    if !frame.ends_with(b"</data>") {
        frame.extend(read_until(
            chan,
            b"</data>",
            TIMEOUT_CONTROL,
            "refusal frame",
        )?);
    }

    match dispatch_frame(chan, &frame, firehose_parser_ack_nak)? {
        Some(FirehoseStatus::Nak) => Err(EdlError::Nak),
        Some(FirehoseStatus::Ack) => Err(EdlError::Protocol(
            "device ACKed a read before sending any data".to_owned(),
        )),
        None => Err(EdlError::Protocol(
            "device sent XML instead of read data".to_owned(),
        )),
    }
}

/// Read `num_sectors` sectors into `out`. The sink receives exactly
/// `num_sectors * sector_size` bytes or nothing at all.
pub fn firehose_read_storage<T: EdlChan>(
    chan: &mut T,
    out: &mut dyn Write,
    lun: u8,
    start_sector: u64,
    num_sectors: u64,
    filename: &str,
    label: &str,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;

    let sector_size = chan.fh_config().storage_sector_size;
    let chunk_max = chan.fh_config().send_buffer_size;
    let total = num_sectors * sector_size as u64;

    let ss = sector_size.to_string();
    let ns = num_sectors.to_string();
    let st = start_sector.to_string();
    let ls = lun.to_string();
    firehose_tx(
        chan,
        "read",
        &[
            ("SECTOR_SIZE_IN_BYTES", &ss),
            ("num_partition_sectors", &ns),
            ("physical_partition_number", &ls),
            ("start_sector", &st),
            ("filename", filename),
            ("label", label),
        ],
    )?;

    let mut buf = vec![0u8; chunk_max];
    let mut done: u64 = 0;
    let mut sniffed = false;

    while done < total {
        cancel.check()?;
        let n = chunk_max.min((total - done) as usize);

        if !sniffed {
            let first = read_some(chan, &mut buf[..n], TIMEOUT_DATA, "read payload")?;
            if buf[0] == b'<' {
                return handle_early_frame(chan, &buf[..first]);
            }
            sniffed = true;
            out.write_all(&buf[..first])?;
            done += first as u64;
            chan.events().progress(done, total);
            continue;
        }

        read_exact_timeout(chan, &mut buf[..n], TIMEOUT_DATA, "read payload")?;
        out.write_all(&buf[..n])?;
        done += n as u64;
        chan.events().progress(done, total);
    }

    match firehose_read(chan, firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(EdlError::Nak),
    }
}

/// Stream `num_sectors` sectors out of `src`. A source that runs short is
/// padded with zeroes up to the full sector count.
pub fn firehose_program_storage<T: EdlChan>(
    chan: &mut T,
    src: &mut dyn Read,
    lun: u8,
    start_sector: &str,
    num_sectors: u64,
    filename: &str,
    label: &str,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;

    let sector_size = chan.fh_config().storage_sector_size;
    let chunk_max = chan.fh_config().send_buffer_size;
    let total = num_sectors * sector_size as u64;

    let ss = sector_size.to_string();
    let ns = num_sectors.to_string();
    let ls = lun.to_string();
    firehose_tx(
        chan,
        "program",
        &[
            ("SECTOR_SIZE_IN_BYTES", &ss),
            ("num_partition_sectors", &ns),
            ("physical_partition_number", &ls),
            ("start_sector", start_sector),
            ("filename", filename),
            ("label", label),
        ],
    )?;

    let mut buf = vec![0u8; chunk_max];
    let mut done: u64 = 0;
    let mut src_exhausted = false;

    while done < total {
        cancel.check()?;
        let n = chunk_max.min((total - done) as usize);

        let mut filled = 0;
        while filled < n && !src_exhausted {
            match src.read(&mut buf[filled..n])? {
                0 => src_exhausted = true,
                k => filled += k,
            }
        }
        buf[filled..n].fill(0);

        chan.write_all(&buf[..n])?;
        done += n as u64;
        chan.events().progress(done, total);
    }
    chan.flush()?;

    match firehose_read(chan, firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(EdlError::Nak),
    }
}

pub fn firehose_erase_storage<T: EdlChan>(
    chan: &mut T,
    lun: u8,
    start_sector: u64,
    num_sectors: u64,
) -> Result<()> {
    let ss = chan.fh_config().storage_sector_size.to_string();
    let ns = num_sectors.to_string();
    let st = start_sector.to_string();
    let ls = lun.to_string();

    firehose_tx(
        chan,
        "erase",
        &[
            ("SECTOR_SIZE_IN_BYTES", &ss),
            ("num_partition_sectors", &ns),
            ("physical_partition_number", &ls),
            ("start_sector", &st),
        ],
    )?;

    match firehose_read_timeout(chan, TIMEOUT_ERASE, firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(EdlError::Nak),
    }
}

pub fn firehose_nop<T: EdlChan>(chan: &mut T) -> Result<()> {
    firehose_tx(chan, "nop", &[])?;
    match firehose_read_timeout(chan, TIMEOUT_CONTROL, firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(EdlError::Nak),
    }
}

/// Mark a physical partition (e.g. the LUN holding xbl) as the boot unit.
pub fn firehose_set_bootable<T: EdlChan>(chan: &mut T, part_idx: u8) -> Result<()> {
    let v = part_idx.to_string();
    firehose_tx(chan, "setbootablestoragedrive", &[("value", &v)])?;
    match firehose_read_timeout(chan, TIMEOUT_CONTROL, firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(EdlError::Nak),
    }
}

/// Terminal: the device leaves Firehose after this, so a missing response
/// is not an error.
pub fn firehose_reset<T: EdlChan>(
    chan: &mut T,
    mode: &FirehoseResetMode,
    delay_secs: u32,
) -> Result<()> {
    let delay = delay_secs.to_string();
    firehose_tx(
        chan,
        "power",
        &[("value", mode.power_value()), ("DelayInSeconds", &delay)],
    )?;

    match firehose_read_timeout(chan, TIMEOUT_CONTROL, firehose_parser_ack_nak) {
        Ok(_) | Err(EdlError::Timeout(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedChan;

    #[test]
    fn xml_setup_preserves_attribute_order() {
        let doc = firehose_xml_setup(
            "read",
            &[
                ("SECTOR_SIZE_IN_BYTES", "4096"),
                ("num_partition_sectors", "6"),
                ("start_sector", "0"),
            ],
        )
        .unwrap();
        let s = String::from_utf8(doc).unwrap();

        let a = s.find("SECTOR_SIZE_IN_BYTES").unwrap();
        let b = s.find("num_partition_sectors").unwrap();
        let c = s.find("start_sector").unwrap();
        assert!(a < b && b < c);
        assert!(s.contains("<data>"));
        assert!(s.trim_end().ends_with("</data>"));
    }

    #[test]
    fn pump_interleaves_logs_and_stops_at_response() {
        let script = concat!(
            "<?xml version=\"1.0\"?><data><log value=\"one\" /></data>",
            "<?xml version=\"1.0\"?><data><log value=\"two\" /><response value=\"ACK\" /></data>",
            "<?xml version=\"1.0\"?><data><log value=\"after\" /></data>",
        );
        let mut chan = ScriptedChan::new(script.as_bytes().to_vec());

        let status = firehose_read(&mut chan, firehose_parser_ack_nak).unwrap();
        assert_eq!(status, FirehoseStatus::Ack);
        assert_eq!(chan.events.logs(), vec!["one".to_owned(), "two".to_owned()]);
    }

    #[test]
    fn read_storage_conserves_sectors() {
        let mut script: Vec<u8> = (0u8..=255).cycle().take(3 * 512).collect();
        script.extend_from_slice(b"<?xml version=\"1.0\"?><data><response value=\"ACK\" /></data>");

        let mut chan = ScriptedChan::new(script);
        chan.cfg.storage_sector_size = 512;
        chan.cfg.send_buffer_size = 1024;

        let mut sink = Vec::new();
        firehose_read_storage(
            &mut chan,
            &mut sink,
            0,
            16,
            3,
            "gpt_main0.bin",
            "PrimaryGPT",
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(sink.len(), 3 * 512);
        let expect: Vec<u8> = (0u8..=255).cycle().take(3 * 512).collect();
        assert_eq!(sink, expect);

        // Progress is monotonic and ends at the full byte count
        let progress = chan.events.progress_events();
        assert_eq!(progress.last(), Some(&(1536, 1536)));
        assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn read_storage_detects_refusal() {
        let script =
            b"<?xml version=\"1.0\"?><data><response value=\"NAK\" /></data>".to_vec();
        let mut chan = ScriptedChan::new(script);
        chan.cfg.storage_sector_size = 512;

        let mut sink = Vec::new();
        let err = firehose_read_storage(
            &mut chan,
            &mut sink,
            0,
            0,
            6,
            "gpt_main0.bin",
            "PrimaryGPT",
            &CancelToken::new(),
        );
        assert!(matches!(err, Err(EdlError::Nak)));
        assert!(sink.is_empty());
    }

    #[test]
    fn program_pads_short_sources_to_full_sectors() {
        let script =
            b"<?xml version=\"1.0\"?><data><response value=\"ACK\" /></data>".to_vec();
        let mut chan = ScriptedChan::new(script);
        chan.cfg.storage_sector_size = 512;
        chan.cfg.send_buffer_size = 4096;

        let image = vec![0xABu8; 700];
        firehose_program_storage(
            &mut chan,
            &mut &image[..],
            0,
            "1024",
            2,
            "boot.img",
            "boot",
            &CancelToken::new(),
        )
        .unwrap();

        // Skip the XML command, then expect 2 sectors of payload
        let cmd_end = chan
            .output
            .windows(7)
            .position(|w| w == b"</data>")
            .unwrap()
            + 7;
        let payload = &chan.output[cmd_end..];
        assert_eq!(payload.len(), 1024);
        assert_eq!(&payload[..700], &image[..]);
        assert!(payload[700..].iter().all(|&b| b == 0));
    }

    #[test]
    fn cancelled_before_command_sends_nothing() {
        let mut chan = ScriptedChan::new(Vec::new());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = firehose_program_storage(
            &mut chan,
            &mut &[0u8; 16][..],
            0,
            "0",
            1,
            "x",
            "x",
            &cancel,
        );
        assert!(matches!(err, Err(EdlError::Cancelled)));
        assert!(chan.output.is_empty());
    }

    #[test]
    fn storage_info_from_log_json() {
        let script = concat!(
            "<?xml version=\"1.0\"?><data><log value=\"INFO: {&quot;storage_info&quot;: {&quot;total_blocks&quot;:30535680, &quot;block_size&quot;:4096}}\" /></data>",
            "<?xml version=\"1.0\"?><data><response value=\"ACK\" /></data>",
        );
        let mut chan = ScriptedChan::new(script.as_bytes().to_vec());

        let info = firehose_get_storage_info(&mut chan, 0).unwrap();
        assert_eq!(info.sector_size, Some(4096));
        assert_eq!(info.total_sectors, Some(30535680));
        assert_eq!(chan.cfg.lun_sector_counts.get(&0), Some(&30535680));
    }
}
