use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::SerialStream;

/// Line settings for a serial device.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Line speed in bits per second. Default: 115200.
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { baud_rate: 115_200 }
    }
}

/// Serial tty transport.
///
/// Opens the device without becoming its controlling terminal, switches it to
/// raw 8N1 mode at the configured speed and leaves the descriptor
/// non-blocking.
pub struct SerialPort;

impl SerialPort {
    /// Open and configure a serial device.
    pub fn open(path: impl AsRef<Path>, config: &SerialConfig) -> Result<SerialStream> {
        let path = path.as_ref();
        let speed = baud_constant(config.baud_rate)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| TransportError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        configure_raw(&file, speed).map_err(|source| TransportError::Configure {
            path: path.to_path_buf(),
            source,
        })?;

        info!(?path, baud = config.baud_rate, "opened serial device");
        Ok(SerialStream::from_tty(file))
    }
}

fn configure_raw(file: &File, speed: libc::speed_t) -> std::io::Result<()> {
    let fd = file.as_raw_fd();

    // SAFETY: `termios` is a plain C struct; all-zero is a valid bit pattern
    // and it is fully overwritten by `tcgetattr` before use.
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is an open descriptor owned by `file` and `termios` is a
    // valid writable pointer for the duration of the call.
    if unsafe { libc::tcgetattr(fd, &mut termios) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: `termios` was initialised by `tcgetattr` above.
    unsafe {
        libc::cfmakeraw(&mut termios);
        libc::cfsetispeed(&mut termios, speed);
        libc::cfsetospeed(&mut termios, speed);
    }
    termios.c_cflag |= libc::CLOCAL | libc::CREAD;
    termios.c_cc[libc::VMIN] = 0;
    termios.c_cc[libc::VTIME] = 0;

    // SAFETY: `fd` is open and `termios` is a fully initialised struct.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    debug!(fd, "serial line switched to raw mode");
    Ok(())
}

fn baud_constant(baud_rate: u32) -> Result<libc::speed_t> {
    let speed = match baud_rate {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        other => return Err(TransportError::UnsupportedBaudRate(other)),
    };
    Ok(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_baud_rate() {
        let result = SerialPort::open("/dev/null", &SerialConfig { baud_rate: 12_345 });
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedBaudRate(12_345))
        ));
    }

    #[test]
    fn missing_device_is_open_error() {
        let result = SerialPort::open(
            "/nonexistent/cmux-tty-does-not-exist",
            &SerialConfig::default(),
        );
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    #[test]
    fn non_tty_is_configure_error() {
        let result = SerialPort::open("/dev/null", &SerialConfig::default());
        assert!(matches!(result, Err(TransportError::Configure { .. })));
    }

    #[test]
    fn default_speed_is_115200() {
        assert_eq!(SerialConfig::default().baud_rate, 115_200);
        assert!(baud_constant(115_200).is_ok());
    }
}
