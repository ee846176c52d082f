// src/serial/port.rs
//! tokio-serial backed transport and USB chipset probe

use super::controller::{DeviceId, DeviceProbe, SerialController, SerialLink};
use super::line::{BaudRate, Parity, SerialLineConfiguration, StopBits};
use crate::error::ControllerError;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream};
use tracing::{debug, info};

/// USB vendor ids of supported serial chipsets
pub const SUPPORTED_USB_VENDORS: &[(u16, &str)] = &[
    (0x067B, "Prolific"),
    (0x10C4, "Silicon Labs"),
    (0x0403, "FTDI"),
    (0x1546, "u-blox"),
    (0x1A86, "Qinheng"),
    (0x03EB, "Atmel"),
];

const PORT_TIMEOUT: Duration = Duration::from_millis(1000);

pub fn chipset_name(vid: u16) -> Option<&'static str> {
    SUPPORTED_USB_VENDORS
        .iter()
        .find(|(id, _)| *id == vid)
        .map(|(_, name)| *name)
}

/// Settings in tokio-serial terms
#[derive(Debug, Clone, Copy, PartialEq)]
struct PortSettings {
    baud_rate: u32,
    data_bits: tokio_serial::DataBits,
    parity: tokio_serial::Parity,
    stop_bits: tokio_serial::StopBits,
}

impl PortSettings {
    fn resolve(config: &SerialLineConfiguration) -> Result<Self, ControllerError> {
        let baud_rate = match config.baud_rate {
            BaudRate::Fixed(rate) => rate,
            BaudRate::Auto => {
                return Err(ControllerError::Unsupported(
                    "baud rate must be resolved before use".to_string(),
                ))
            }
        };
        let data_bits = match config.data_bits.get() {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            bits => return Err(ControllerError::Unsupported(format!("{} data bits", bits))),
        };
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
            other => return Err(ControllerError::Unsupported(format!("{:?} parity", other))),
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(ControllerError::Unsupported("1.5 stop bits".to_string()))
            }
        };
        Ok(Self {
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        })
    }

    fn apply(&self, port: &mut SerialStream) -> Result<(), ControllerError> {
        port.set_baud_rate(self.baud_rate)?;
        port.set_data_bits(self.data_bits)?;
        port.set_parity(self.parity)?;
        port.set_stop_bits(self.stop_bits)?;
        Ok(())
    }
}

/// Stream and parked tasks of one open port
struct PortState {
    /// `None` once detached; dropping the stream closes the fd
    stream: Option<SerialStream>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// One open port shared by the read and write halves of a link.
///
/// `close` drops the stream and wakes any task parked on it, so a pending
/// read ends with `BrokenPipe` instead of waiting for data that never comes.
#[derive(Clone)]
struct SharedPort {
    state: Arc<Mutex<PortState>>,
}

impl SharedPort {
    fn new(stream: SerialStream) -> Self {
        Self {
            state: Arc::new(Mutex::new(PortState {
                stream: Some(stream),
                read_waker: None,
                write_waker: None,
            })),
        }
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "serial port detached")
    }

    fn apply(&self, settings: &PortSettings) -> Result<(), ControllerError> {
        let mut state = self.state.lock();
        let stream = state.stream.as_mut().ok_or(ControllerError::NotAttached)?;
        settings.apply(stream)
    }

    fn close(&self) {
        let (stream, wakers) = {
            let mut state = self.state.lock();
            (
                state.stream.take(),
                [state.read_waker.take(), state.write_waker.take()],
            )
        };
        drop(stream);
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }
}

impl AsyncRead for SharedPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        let PortState {
            stream, read_waker, ..
        } = &mut *state;
        let Some(stream) = stream.as_mut() else {
            return Poll::Ready(Err(Self::closed_error()));
        };
        let poll = Pin::new(stream).poll_read(cx, buf);
        if poll.is_pending() {
            *read_waker = Some(cx.waker().clone());
        }
        poll
    }
}

impl AsyncWrite for SharedPort {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        let PortState {
            stream, write_waker, ..
        } = &mut *state;
        let Some(stream) = stream.as_mut() else {
            return Poll::Ready(Err(Self::closed_error()));
        };
        let poll = Pin::new(stream).poll_write(cx, buf);
        if poll.is_pending() {
            *write_waker = Some(cx.waker().clone());
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.state.lock().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(Self::closed_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.state.lock().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Serial controller for a port opened through tokio-serial
pub struct TokioSerialController {
    device: DeviceId,
    config: SerialLineConfiguration,
    port: Option<SharedPort>,
}

impl TokioSerialController {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            config: SerialLineConfiguration::default(),
            port: None,
        }
    }

    fn open_error(&self, err: tokio_serial::Error) -> ControllerError {
        match err.kind() {
            tokio_serial::ErrorKind::NoDevice
            | tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound) => {
                ControllerError::NotFound(self.device.to_string())
            }
            tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                ControllerError::PermissionDenied(self.device.to_string())
            }
            _ => ControllerError::Serial(err),
        }
    }
}

impl SerialController for TokioSerialController {
    fn device_id(&self) -> &DeviceId {
        &self.device
    }

    fn configuration(&self) -> &SerialLineConfiguration {
        &self.config
    }

    fn set_configuration(&mut self, config: SerialLineConfiguration) -> Result<(), ControllerError> {
        let settings = PortSettings::resolve(&config)?;
        if let Some(port) = &self.port {
            port.apply(&settings)?;
            debug!("Applied {} to {}", config, self.device);
        }
        self.config = config;
        Ok(())
    }

    fn attach(&mut self) -> Result<SerialLink, ControllerError> {
        self.detach();
        let settings = PortSettings::resolve(&self.config)?;

        let stream = tokio_serial::new(self.device.as_str(), settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .timeout(PORT_TIMEOUT)
            .open_native_async()
            .map_err(|e| self.open_error(e))?;

        info!("Opened {} ({})", self.device, self.config);
        let port = SharedPort::new(stream);
        self.port = Some(port.clone());
        Ok(SerialLink::new(port.clone(), port))
    }

    fn detach(&mut self) {
        if let Some(port) = self.port.take() {
            port.close();
            debug!("Detached {}", self.device);
        }
    }

    fn is_attached(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for TokioSerialController {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Recognises supported USB serial chipsets among the system's ports
#[derive(Debug, Clone, Default)]
pub struct SerialPortProbe {
    allow_any_port: bool,
    port: Option<String>,
}

impl SerialPortProbe {
    pub fn new(allow_any_port: bool) -> Self {
        Self {
            allow_any_port,
            port: None,
        }
    }

    /// Only consider the named port; an explicitly named port is always
    /// accepted regardless of its chipset.
    #[must_use]
    pub fn with_port(mut self, port: Option<String>) -> Self {
        self.port = port;
        self
    }

    pub fn is_supported(&self, info: &SerialPortInfo) -> bool {
        if let Some(port) = &self.port {
            return info.port_name == *port;
        }
        if self.allow_any_port {
            return true;
        }
        match &info.port_type {
            SerialPortType::UsbPort(usb) => chipset_name(usb.vid).is_some(),
            _ => false,
        }
    }

    fn ports(&self) -> Vec<SerialPortInfo> {
        match tokio_serial::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                debug!("Failed to list serial ports: {}", e);
                Vec::new()
            }
        }
    }
}

impl DeviceProbe for SerialPortProbe {
    fn supported_devices(&self) -> Vec<DeviceId> {
        self.ports()
            .into_iter()
            .filter(|info| self.is_supported(info))
            .map(|info| DeviceId::new(info.port_name))
            .collect()
    }

    fn probe(&self, device: &DeviceId) -> Option<Box<dyn SerialController>> {
        let supported = self
            .ports()
            .iter()
            .any(|info| info.port_name == device.as_str() && self.is_supported(info));
        if !supported {
            debug!("{} is not a supported serial device", device);
            return None;
        }
        Some(Box::new(TokioSerialController::new(device.clone())))
    }
}
