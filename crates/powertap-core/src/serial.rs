//! Forward live ANE power to a serial display as `ANE_PWR:<mW>\n` lines.
//!
//! The device on the other end is a dumb line sink. When no device is
//! present the forwarder is simply inert; nothing else changes.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::sample::PowerSample;

/// Device name prefixes probed under `/dev`, in priority order.
const DEVICE_PREFIXES: &[&str] = &["cu.usbmodem", "tty.usbmodem", "ttyACM", "ttyUSB"];

/// First matching serial device under `dev_dir`.
pub fn detect_device_in(dev_dir: &Path) -> Option<PathBuf> {
    let mut names: Vec<String> = std::fs::read_dir(dev_dir)
        .ok()?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    DEVICE_PREFIXES.iter().find_map(|prefix| {
        names
            .iter()
            .find(|n| n.starts_with(prefix))
            .map(|n| dev_dir.join(n))
    })
}

pub fn detect_device() -> Option<PathBuf> {
    detect_device_in(Path::new("/dev"))
}

/// The line written for one sample, or `None` when ANE is absent.
pub fn format_line(sample: &PowerSample) -> Option<String> {
    sample.ane_mw.map(|mw| format!("ANE_PWR:{mw:.1}\n"))
}

/// Writes ANE lines to any sink. Inert when constructed without one.
pub struct SerialForwarder<W: Write> {
    sink: Option<W>,
    lines_written: u64,
}

impl<W: Write> SerialForwarder<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Some(sink),
            lines_written: 0,
        }
    }

    pub fn inert() -> Self {
        Self {
            sink: None,
            lines_written: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.sink.is_some()
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Forward one sample. A write failure disables the forwarder (the
    /// device was probably unplugged) rather than failing the session.
    pub fn forward(&mut self, sample: &PowerSample) {
        let (Some(sink), Some(line)) = (self.sink.as_mut(), format_line(sample)) else {
            return;
        };
        match sink.write_all(line.as_bytes()).and_then(|()| sink.flush()) {
            Ok(()) => self.lines_written += 1,
            Err(e) => {
                log::warn!("serial write failed, disabling forwarder: {e}");
                self.sink = None;
            }
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.sink
    }
}

impl<W: Write + Send + 'static> SerialForwarder<W> {
    /// Erase the sink type so forwarders over different sinks can be passed
    /// around interchangeably.
    pub fn boxed(self) -> SerialForwarder<Box<dyn Write + Send>> {
        SerialForwarder {
            sink: self.sink.map(|w| Box::new(w) as Box<dyn Write + Send>),
            lines_written: self.lines_written,
        }
    }
}

/// Where to send serial output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialTarget {
    Auto,
    Path(PathBuf),
}

impl std::str::FromStr for SerialTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("auto") {
            Self::Auto
        } else {
            Self::Path(PathBuf::from(s))
        })
    }
}

/// Open the target device for writing, falling back to an inert forwarder.
pub fn open(target: &SerialTarget) -> SerialForwarder<File> {
    let path = match target {
        SerialTarget::Auto => match detect_device() {
            Some(p) => p,
            None => {
                log::info!("no serial device found, serial output disabled");
                return SerialForwarder::inert();
            }
        },
        SerialTarget::Path(p) => p.clone(),
    };
    match open_device(&path) {
        Ok(f) => {
            log::info!("forwarding ANE power to {}", path.display());
            SerialForwarder::new(f)
        }
        Err(e) => {
            log::warn!("cannot open {}: {e}; serial output disabled", path.display());
            SerialForwarder::inert()
        }
    }
}

fn open_device(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Rail;

    #[test]
    fn line_format() {
        let s = PowerSample::at(0.0).with(Rail::Ane, 1234.56);
        assert_eq!(format_line(&s).unwrap(), "ANE_PWR:1234.6\n");
        assert!(format_line(&PowerSample::at(0.0).with(Rail::Cpu, 1.0)).is_none());
    }

    #[test]
    fn forwards_to_sink() {
        let mut fwd = SerialForwarder::new(Vec::new());
        fwd.forward(&PowerSample::at(0.0).with(Rail::Ane, 5.0));
        fwd.forward(&PowerSample::at(1.0).with(Rail::Cpu, 5.0));
        fwd.forward(&PowerSample::at(2.0).with(Rail::Ane, 7.0));
        assert_eq!(fwd.lines_written(), 2);
        let out = String::from_utf8(fwd.into_inner().unwrap()).unwrap();
        assert_eq!(out, "ANE_PWR:5.0\nANE_PWR:7.0\n");
    }

    #[test]
    fn inert_forwarder_does_nothing() {
        let mut fwd: SerialForwarder<Vec<u8>> = SerialForwarder::inert();
        fwd.forward(&PowerSample::at(0.0).with(Rail::Ane, 5.0));
        assert!(!fwd.is_active());
        assert_eq!(fwd.lines_written(), 0);
    }

    struct Broken;
    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_disables() {
        let mut fwd = SerialForwarder::new(Broken);
        fwd.forward(&PowerSample::at(0.0).with(Rail::Ane, 5.0));
        assert!(!fwd.is_active());
    }

    #[test]
    fn detects_usbmodem_first() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["ttyACM0", "cu.usbmodem1101", "null"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        assert_eq!(
            detect_device_in(tmp.path()).unwrap(),
            tmp.path().join("cu.usbmodem1101")
        );
    }

    #[test]
    fn no_device_found() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(detect_device_in(tmp.path()).is_none());
    }

    #[test]
    fn open_missing_path_is_inert() {
        let fwd = open(&SerialTarget::Path("/nonexistent/tty".into()));
        assert!(!fwd.is_active());
    }

    #[test]
    fn target_parses() {
        assert_eq!("AUTO".parse::<SerialTarget>().unwrap(), SerialTarget::Auto);
        assert_eq!(
            "/dev/ttyACM0".parse::<SerialTarget>().unwrap(),
            SerialTarget::Path("/dev/ttyACM0".into())
        );
    }
}
