// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use indexmap::IndexMap;

use crate::types::{EdlChan, EdlError, FirehoseStatus, Result};

// Parsers are kept separate for more flexibility (e.g. log replay analysis)

/// Check "value" for ack/nak (generic)
pub fn firehose_parser_ack_nak<T: EdlChan>(
    _: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus> {
    match attrs.get("value").map(String::as_str) {
        Some("ACK") => Ok(FirehoseStatus::Ack),
        Some("NAK") => Ok(FirehoseStatus::Nak),
        _ => Err(EdlError::Protocol(format!(
            "response without a usable value attribute: {attrs:?}"
        ))),
    }
}

/// Parse the \<configure\> response
///
/// The device echoes the payload size it is actually willing to take, on
/// NAK as well as on ACK; whatever it says is adopted verbatim.
pub fn firehose_parser_configure_response<T: EdlChan>(
    channel: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus> {
    let status = firehose_parser_ack_nak(channel, attrs)?;

    if let Some(val) = attrs.get("MaxPayloadSizeToTargetInBytes") {
        match val.parse::<usize>() {
            Ok(n) if n > 0 => channel.mut_fh_config().send_buffer_size = n,
            _ => {
                return Err(EdlError::Protocol(format!(
                    "bogus MaxPayloadSizeToTargetInBytes '{val}'"
                )));
            }
        }
    }

    if let Some(val) = attrs.get("MaxXMLSizeInBytes") {
        if let Ok(n) = val.parse::<usize>() {
            if n > 0 {
                channel.mut_fh_config().xml_buf_size = n;
            }
        }
    }

    Ok(status)
}
