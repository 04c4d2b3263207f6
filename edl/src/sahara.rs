// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::io::Write as _;
use std::thread;

use crate::serial::read_exact_timeout;
use crate::types::{
    EdlChan, EdlError, PROGRAMMER_SETTLE_DELAY, Result, TIMEOUT_CONTROL,
};

const SAHARA_HELLO: u32 = 0x01;
const SAHARA_HELLO_RESP: u32 = 0x02;
const SAHARA_READ_DATA: u32 = 0x03;
const SAHARA_END_OF_IMAGE: u32 = 0x04;
const SAHARA_DONE: u32 = 0x05;
const SAHARA_DONE_RESP: u32 = 0x06;
const SAHARA_RESET: u32 = 0x07;
const SAHARA_RESET_RESP: u32 = 0x08;
const SAHARA_CMD_READY: u32 = 0x0b;
const SAHARA_CMD_SWITCH_MODE: u32 = 0x0c;
const SAHARA_CMD_EXEC: u32 = 0x0d;
const SAHARA_CMD_EXEC_RESP: u32 = 0x0e;
const SAHARA_CMD_EXEC_DATA: u32 = 0x0f;
const SAHARA_READ_DATA_64: u32 = 0x12;

// Anything bigger is not a Sahara packet but us falling out of sync
const SAHARA_MAX_PKT_LEN: usize = 0x1000;

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum SaharaMode {
    ImageTxPending = 0,
    ImageTxComplete = 1,
    MemoryDebug = 2,
    Command = 3,
}

/// Queries the target SBL may answer while in command mode
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum SaharaCmdModeCmd {
    ReadSerialNum = 0x01,
    ReadHwId = 0x02,
    ReadOemKeyHash = 0x03,
}

#[derive(Serialize, Deserialize, Debug)]
struct SaharaHdr {
    cmd: u32,
    length: u32,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SaharaHello {
    pub version: u32,
    pub min_version: u32,
    pub max_cmd_len: u32,
    pub mode: u32,
}

#[derive(Serialize, Debug)]
struct SaharaHelloResp {
    version: u32,
    min_version: u32,
    status: u32,
    mode: SaharaMode,
    reserved: [u32; 6],
}

#[derive(Deserialize, Debug)]
struct SaharaReadData {
    _image: u32,
    offset: u32,
    length: u32,
}

#[derive(Deserialize, Debug)]
struct SaharaReadData64 {
    _image: u64,
    offset: u64,
    length: u64,
}

#[derive(Deserialize, Debug)]
struct SaharaEndOfImage {
    _image: u32,
    status: u32,
}

#[derive(Serialize, Debug)]
struct SaharaSwitchMode {
    mode: SaharaMode,
}

#[derive(Serialize, Debug)]
struct SaharaCmdExec {
    client_cmd: SaharaCmdModeCmd,
}

#[derive(Deserialize, Debug)]
struct SaharaCmdExecResp {
    _client_cmd: u32,
    data_len: u32,
}

fn sahara_tx<T: EdlChan>(chan: &mut T, cmd: u32, payload: &impl Serialize) -> Result<()> {
    let body = bincode::serialize(payload)
        .map_err(|e| EdlError::Protocol(format!("sahara packet encode: {e}")))?;
    let hdr = SaharaHdr {
        cmd,
        length: (body.len() + 8) as u32,
    };

    let mut pkt = bincode::serialize(&hdr)
        .map_err(|e| EdlError::Protocol(format!("sahara header encode: {e}")))?;
    pkt.extend_from_slice(&body);

    chan.write_all(&pkt)?;
    chan.flush()?;
    Ok(())
}

fn sahara_rx<T: EdlChan>(chan: &mut T) -> Result<(u32, Vec<u8>)> {
    let mut hdr = [0u8; 8];
    read_exact_timeout(chan, &mut hdr, TIMEOUT_CONTROL, "sahara packet header")?;

    let cmd = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    let length = u32::from_le_bytes(hdr[4..8].try_into().unwrap()) as usize;
    if !(8..=SAHARA_MAX_PKT_LEN).contains(&length) {
        return Err(EdlError::Protocol(format!(
            "sahara packet {cmd:#04x} claims bogus length {length}"
        )));
    }

    let mut payload = vec![0u8; length - 8];
    read_exact_timeout(chan, &mut payload, TIMEOUT_CONTROL, "sahara packet payload")?;

    Ok((cmd, payload))
}

fn decode<'a, P: Deserialize<'a>>(payload: &'a [u8], what: &str) -> Result<P> {
    bincode::deserialize(payload)
        .map_err(|e| EdlError::Protocol(format!("truncated sahara {what}: {e}")))
}

/// Wait for the device's HELLO and record the protocol version it speaks.
pub fn sahara_wait_hello<T: EdlChan>(chan: &mut T) -> Result<SaharaHello> {
    let (cmd, payload) = sahara_rx(chan)?;
    if cmd != SAHARA_HELLO {
        return Err(EdlError::SaharaFailed(format!(
            "expected HELLO, got command {cmd:#04x}"
        )));
    }

    let hello: SaharaHello = decode(&payload, "HELLO")?;
    if hello.version < 1 {
        return Err(EdlError::SaharaFailed(format!(
            "unsupported protocol version {}",
            hello.version
        )));
    }

    chan.mut_fingerprint().sahara_version = hello.version;
    Ok(hello)
}

/// Answer a HELLO (possibly one another program already consumed) and pick
/// the mode for the rest of the exchange.
pub fn sahara_send_hello_rsp<T: EdlChan>(chan: &mut T, mode: SaharaMode) -> Result<()> {
    let version = match chan.fingerprint().sahara_version {
        0 => 2,
        v => v.min(2),
    };

    sahara_tx(
        chan,
        SAHARA_HELLO_RESP,
        &SaharaHelloResp {
            version,
            min_version: 1,
            status: 0,
            mode,
            reserved: [0; 6],
        },
    )
}

fn sahara_cmd_exec<T: EdlChan>(chan: &mut T, cmd: SaharaCmdModeCmd) -> Result<Vec<u8>> {
    sahara_tx(chan, SAHARA_CMD_EXEC, &SaharaCmdExec { client_cmd: cmd })?;

    let (rcmd, payload) = sahara_rx(chan)?;
    if rcmd != SAHARA_CMD_EXEC_RESP {
        // Typically END_OF_IMAGE, meaning the SBL doesn't know this query
        return Err(EdlError::SaharaFailed(format!(
            "exec {cmd:?} rejected with command {rcmd:#04x}"
        )));
    }
    let resp: SaharaCmdExecResp = decode(&payload, "EXEC_RESP")?;
    if resp.data_len as usize > SAHARA_MAX_PKT_LEN {
        return Err(EdlError::Protocol(format!(
            "exec {cmd:?} claims {} bytes of data",
            resp.data_len
        )));
    }

    // The answer comes back raw, without packet framing
    sahara_tx(chan, SAHARA_CMD_EXEC_DATA, &SaharaCmdExec { client_cmd: cmd })?;
    let mut data = vec![0u8; resp.data_len as usize];
    read_exact_timeout(chan, &mut data, TIMEOUT_CONTROL, "sahara exec data")?;

    Ok(data)
}

/// Known MSM ids, by the upper half of the hardware id fuse.
pub fn chip_name_for(msm_id: u32) -> Option<&'static str> {
    Some(match msm_id {
        0x007050E1 => "MSM8916",
        0x000460E1 => "MSM8953",
        0x0006B0E1 => "MSM8937",
        0x009470E1 => "MSM8996",
        0x0005E0E1 => "MSM8998",
        0x000AC0E1 => "SDM630",
        0x0008C0E1 => "SDM660",
        0x000910E1 => "SDM670",
        0x0008B0E1 => "SDM845",
        0x000A50E1 => "SM6125",
        0x000950E1 => "SM8150",
        0x000C30E1 => "SM8250",
        0x001350E1 => "SM8350",
        _ => return None,
    })
}

fn apply_hw_id<T: EdlChan>(chan: &mut T, data: &[u8]) {
    if data.len() < 8 {
        return;
    }

    let fp = chan.mut_fingerprint();
    fp.model_id = u16::from_le_bytes(data[0..2].try_into().unwrap());
    fp.oem_id = u16::from_le_bytes(data[2..4].try_into().unwrap());
    fp.msm_id = u32::from_le_bytes(data[4..8].try_into().unwrap());
    fp.chip_name = chip_name_for(fp.msm_id)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("QC{:08X}", fp.msm_id));
}

/// Dip into command mode to harvest identifying fuses, then switch the SBL
/// back to image transfer (which re-issues a HELLO).
///
/// Individual queries are best effort; not every SBL implements all of them.
pub fn sahara_enrich_fingerprint<T: EdlChan>(chan: &mut T) -> Result<()> {
    sahara_send_hello_rsp(chan, SaharaMode::Command)?;

    let (cmd, _) = sahara_rx(chan)?;
    if cmd != SAHARA_CMD_READY {
        return Err(EdlError::SaharaFailed(format!(
            "device did not enter command mode (got {cmd:#04x})"
        )));
    }

    match sahara_cmd_exec(chan, SaharaCmdModeCmd::ReadSerialNum) {
        Ok(data) if data.len() >= 4 => {
            chan.mut_fingerprint().serial = u32::from_le_bytes(data[0..4].try_into().unwrap());
        }
        Ok(_) => {}
        Err(e) => {
            chan.events().log(&format!("serial number query failed: {e}"));
            let _ = chan.flush_input();
        }
    }

    match sahara_cmd_exec(chan, SaharaCmdModeCmd::ReadHwId) {
        Ok(data) => apply_hw_id(chan, &data),
        Err(e) => {
            chan.events().log(&format!("hardware id query failed: {e}"));
            let _ = chan.flush_input();
        }
    }

    match sahara_cmd_exec(chan, SaharaCmdModeCmd::ReadOemKeyHash) {
        Ok(data) if !data.is_empty() => {
            // SBLs often repeat the fused hash 2-3 times; one copy is plenty
            let n = data.len().min(32);
            chan.mut_fingerprint().pk_hash = hex::encode(&data[..n]);
        }
        Ok(_) => {}
        Err(e) => {
            chan.events().log(&format!("OEM key hash query failed: {e}"));
            let _ = chan.flush_input();
        }
    }

    sahara_tx(
        chan,
        SAHARA_CMD_SWITCH_MODE,
        &SaharaSwitchMode {
            mode: SaharaMode::ImageTxPending,
        },
    )?;

    // Mode switches restart the handshake
    sahara_wait_hello(chan)?;
    sahara_send_hello_rsp(chan, SaharaMode::ImageTxPending)
}

fn send_chunk<T: EdlChan>(chan: &mut T, loader: &[u8], offset: u64, length: u64) -> Result<()> {
    let off = offset as usize;
    let len = length as usize;
    if off.checked_add(len).is_none_or(|end| end > loader.len()) {
        return Err(EdlError::SaharaFailed(format!(
            "programmer requested {len} bytes at {off}, image is {} bytes",
            loader.len()
        )));
    }

    chan.write_all(&loader[off..off + len])?;
    chan.flush()?;
    Ok(())
}

/// Serve READ_DATA requests out of the programmer image until the device
/// reports END_OF_IMAGE, then complete the DONE exchange.
///
/// Offsets need not be sequential; the SBL walks the ELF headers first.
pub fn sahara_push_loader<T: EdlChan>(chan: &mut T, loader: &[u8]) -> Result<()> {
    loop {
        let (cmd, payload) = sahara_rx(chan)?;
        match cmd {
            SAHARA_READ_DATA => {
                let req: SaharaReadData = decode(&payload, "READ_DATA")?;
                send_chunk(chan, loader, req.offset as u64, req.length as u64)?;
            }
            SAHARA_READ_DATA_64 => {
                chan.mut_fingerprint().is_64bit = true;
                let req: SaharaReadData64 = decode(&payload, "READ_DATA_64")?;
                send_chunk(chan, loader, req.offset, req.length)?;
            }
            SAHARA_END_OF_IMAGE => {
                let eoi: SaharaEndOfImage = decode(&payload, "END_OF_IMAGE")?;
                if eoi.status != 0 {
                    return Err(EdlError::SaharaFailed(format!(
                        "image rejected with status {:#x}",
                        eoi.status
                    )));
                }
                sahara_tx(chan, SAHARA_DONE, &())?;
            }
            SAHARA_DONE_RESP => {
                let status = match payload.len() {
                    l if l >= 4 => u32::from_le_bytes(payload[0..4].try_into().unwrap()),
                    _ => 0,
                };
                if status != 0 {
                    return Err(EdlError::SaharaFailed(format!(
                        "image transfer failed with status {status:#x}"
                    )));
                }

                // Give the programmer time to initialize before we talk Firehose
                thread::sleep(PROGRAMMER_SETTLE_DELAY);
                return Ok(());
            }
            other => {
                return Err(EdlError::SaharaFailed(format!(
                    "unexpected command {other:#04x} during image transfer"
                )));
            }
        }
    }
}

/// Run the handshake up to the point where the device starts requesting
/// image data. `enrich` controls the command-mode identity queries.
pub fn sahara_connect<T: EdlChan>(chan: &mut T, enrich: bool) -> Result<()> {
    let hello = sahara_wait_hello(chan)?;

    if enrich && hello.version >= 2 {
        sahara_enrich_fingerprint(chan)
    } else {
        sahara_send_hello_rsp(chan, SaharaMode::ImageTxPending)
    }
}

/// Full Sahara session: handshake, optional identity harvest, programmer
/// upload, DONE.
pub fn sahara_run<T: EdlChan>(chan: &mut T, loader: &[u8], enrich: bool) -> Result<()> {
    sahara_connect(chan, enrich)?;
    sahara_push_loader(chan, loader)
}

/// Ask the SBL to reset. Used to bail out of a half-open session.
pub fn sahara_reset<T: EdlChan>(chan: &mut T) -> Result<()> {
    sahara_tx(chan, SAHARA_RESET, &())?;
    let (cmd, _) = sahara_rx(chan)?;
    if cmd != SAHARA_RESET_RESP {
        return Err(EdlError::SaharaFailed(format!(
            "expected RESET_RESP, got {cmd:#04x}"
        )));
    }
    Ok(())
}
