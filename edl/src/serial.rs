// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use serial2::{self, SerialPort};
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::types::{EdlError, EdlReadWrite, Result};

const OPEN_ATTEMPTS: u32 = 3;
const OPEN_BACKOFF: Duration = Duration::from_secs(1);
const PORT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SerialTransport {
    serport: SerialPort,
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        self.serport.write(buf)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.serport.flush()
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        self.serport.read(buf)
    }
}

impl EdlReadWrite for SerialTransport {
    fn flush_input(&mut self) -> Result<(), std::io::Error> {
        self.serport.discard_input_buffer()
    }
}

/// Open the named endpoint at 115200-8N1 raw. EDL devices re-enumerate
/// slowly after a mode switch, so the open is retried with a backoff.
pub fn setup_serial_device(dev_path: &str) -> Result<SerialTransport> {
    let mut last_err = None;

    for attempt in 0..OPEN_ATTEMPTS {
        if attempt > 0 {
            thread::sleep(OPEN_BACKOFF);
        }

        match SerialPort::open(dev_path, |mut settings: serial2::Settings| {
            settings.set_raw();
            settings.set_baud_rate(115200)?;
            Ok(settings)
        }) {
            Ok(mut serport) => {
                serport.set_read_timeout(PORT_TIMEOUT)?;
                serport.set_write_timeout(PORT_TIMEOUT)?;
                return Ok(SerialTransport { serport });
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(EdlError::DeviceUnavailable(format!(
        "{dev_path}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn is_would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

/// Read exactly `buf.len()` bytes before the deadline runs out.
///
/// End of stream counts as a timeout: the device simply hasn't produced the
/// bytes we were promised.
pub fn read_exact_timeout<T: Read + ?Sized>(
    chan: &mut T,
    buf: &mut [u8],
    timeout: Duration,
    what: &'static str,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut got = 0;

    while got < buf.len() {
        match chan.read(&mut buf[got..]) {
            Ok(0) => return Err(EdlError::Timeout(what)),
            Ok(n) => got += n,
            Err(e) if is_would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(EdlError::Timeout(what));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Read whatever is available, at least one byte, before the deadline.
pub(crate) fn read_some<T: Read + ?Sized>(
    chan: &mut T,
    buf: &mut [u8],
    timeout: Duration,
    what: &'static str,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;

    loop {
        match chan.read(buf) {
            Ok(0) => return Err(EdlError::Timeout(what)),
            Ok(n) => return Ok(n),
            Err(e) if is_would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(EdlError::Timeout(what));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read until (and including) `sentinel`, byte by byte.
///
/// Only used for XML frames, which are small; going bytewise means we never
/// consume the head of whatever the device queues next.
pub fn read_until<T: Read + ?Sized>(
    chan: &mut T,
    sentinel: &[u8],
    timeout: Duration,
    what: &'static str,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match chan.read(&mut byte) {
            Ok(0) => return Err(EdlError::Timeout(what)),
            Ok(_) => {
                out.push(byte[0]);
                if out.ends_with(sentinel) {
                    return Ok(out);
                }
            }
            Err(e) if is_would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(EdlError::Timeout(what));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}
