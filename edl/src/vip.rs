// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Authenticated-programmer support: streaming operator-supplied VIP blobs
//! (a signed digest table plus its signature) and the precomputed-signature
//! replay some Xiaomi firmware accepts in place of a live challenge.
//!
//! The blobs are opaque here. Generating them requires the OEM signing key
//! and happens offline.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::thread;

use crate::types::{
    EdlChan, EdlError, FirehoseStatus, PROBE_RETRY_DELAY, Result, TIMEOUT_AUTH,
};
use crate::{firehose_read_timeout, firehose_tx};
use crate::parsers::firehose_parser_ack_nak;

/// Push one opaque auth blob: a `<sig>` header frame, then the raw bytes in
/// payload-sized chunks, then wait for the device's verdict.
pub fn vip_send_blob<T: EdlChan>(
    chan: &mut T,
    blob: &[u8],
    target_name: &str,
) -> Result<FirehoseStatus> {
    let size = blob.len().to_string();
    firehose_tx(
        chan,
        "sig",
        &[
            ("TargetName", target_name),
            ("size_in_bytes", &size),
            ("verbose", "1"),
        ],
    )?;

    let chunk_max = chan.fh_config().send_buffer_size;
    for chunk in blob.chunks(chunk_max) {
        chan.write_all(chunk)?;
    }
    chan.flush()?;

    firehose_read_timeout(chan, TIMEOUT_AUTH, firehose_parser_ack_nak)
}

/// Run the VIP unlock: digest table first, then the signature over it.
pub fn perform_vip_auth<T: EdlChan>(
    chan: &mut T,
    digest_table: &[u8],
    signature: &[u8],
) -> Result<()> {
    chan.events().log("sending VIP digest table");
    if vip_send_blob(chan, digest_table, "digest")? != FirehoseStatus::Ack {
        return Err(EdlError::AuthFailed(
            "device rejected the digest table".to_owned(),
        ));
    }

    chan.events().log("sending VIP signature");
    if vip_send_blob(chan, signature, "sig")? != FirehoseStatus::Ack {
        return Err(EdlError::AuthFailed(
            "device rejected the signature".to_owned(),
        ));
    }

    Ok(())
}

/// Replay precomputed signatures until one sticks. Returns the index of the
/// accepted signature; the first hit is final.
pub fn miauth_bypass<T: EdlChan>(chan: &mut T, signatures: &[Vec<u8>]) -> Result<usize> {
    for (idx, sig) in signatures.iter().enumerate() {
        chan.events()
            .log(&format!("trying precomputed signature {idx}"));

        match vip_send_blob(chan, sig, "sig") {
            Ok(FirehoseStatus::Ack) => return Ok(idx),
            Ok(FirehoseStatus::Nak) | Err(EdlError::Nak) => {
                thread::sleep(PROBE_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }

    Err(EdlError::AuthFailed(format!(
        "none of the {} precomputed signatures were accepted",
        signatures.len()
    )))
}

/// Load every signature blob from a directory, in filename order, so index
/// N in the replay loop always means the same file.
pub fn load_signature_dir(dir: &Path) -> Result<Vec<Vec<u8>>> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut blobs = Vec::with_capacity(paths.len());
    for p in paths {
        blobs.push(fs::read(p)?);
    }
    Ok(blobs)
}
