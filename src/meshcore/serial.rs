//! USB serial transport.
//!
//! `serialport` is blocking, so the port is bridged onto an in-memory
//! [`tokio::io::DuplexStream`] by two plain threads: one pumps port → stream, the other
//! stream → port. Dropping the returned [`SerialGuard`] stops the reader thread; the
//! writer thread ends when the link drops its side of the stream.

use log::{debug, warn};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tokio::time::sleep;

use crate::transport::TransportError;

const BRIDGE_BUFFER: usize = 4096;
const READ_POLL: Duration = Duration::from_millis(100);

/// Stops the bridge threads when dropped.
#[derive(Debug)]
pub struct SerialGuard {
    stop: Arc<AtomicBool>,
    port: String,
}

impl Drop for SerialGuard {
    fn drop(&mut self) {
        debug!("Releasing serial port {}", self.port);
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Open `port_name` and return an async stream bridged to it.
pub async fn open(
    port_name: &str,
    baud_rate: u32,
) -> Result<(DuplexStream, SerialGuard), TransportError> {
    debug!("Opening serial port {} at {} baud", port_name, baud_rate);
    let mut builder = serialport::new(port_name, baud_rate).timeout(READ_POLL);
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder.open().map_err(to_io)?;

    // ESP32 boards reset or stay asleep unless DTR/RTS are asserted
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    sleep(Duration::from_millis(150)).await;
    let _ = port.clear(serialport::ClearBuffer::Input);

    let mut reader_port = port.try_clone().map_err(to_io)?;
    let mut writer_port = port;

    let (app_side, bridge_side) = tokio::io::duplex(BRIDGE_BUFFER);
    let (mut from_app, mut to_app) = tokio::io::split(bridge_side);
    let stop = Arc::new(AtomicBool::new(false));
    let handle = Handle::current();

    {
        let stop = stop.clone();
        let handle = handle.clone();
        let name = port_name.to_string();
        std::thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                while !stop.load(Ordering::SeqCst) {
                    match reader_port.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            if handle.block_on(to_app.write_all(&buf[..n])).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("Serial read error on {}: {}", name, e);
                            break;
                        }
                    }
                }
                // EOF towards the link
                let _ = handle.block_on(to_app.shutdown());
                debug!("Serial reader for {} stopped", name);
            })?;
    }

    {
        let stop = stop.clone();
        let name = port_name.to_string();
        std::thread::Builder::new()
            .name("serial-tx".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                loop {
                    let n = match handle.block_on(from_app.read(&mut buf)) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if let Err(e) = writer_port
                        .write_all(&buf[..n])
                        .and_then(|_| writer_port.flush())
                    {
                        warn!("Serial write error on {}: {}", name, e);
                        break;
                    }
                }
                stop.store(true, Ordering::SeqCst);
                debug!("Serial writer for {} stopped", name);
            })?;
    }

    Ok((
        app_side,
        SerialGuard {
            stop,
            port: port_name.to_string(),
        },
    ))
}

fn to_io(e: serialport::Error) -> TransportError {
    TransportError::Io(e.into())
}
