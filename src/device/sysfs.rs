//! Linux `/sys/class/gpio` driver.
//!
//! Pin names are resolved to kernel line numbers: `BCM<n>` (Raspberry Pi), `GPIO<bank>_IO<n>` (i.MX, 32 lines per
//! bank, banks counted from 1) and bare numbers. Edge detection is done by the kernel; a watched line gets a
//! thread that polls its `value` file for `POLLPRI` and hands each wake-up to the sink.
use super::driver::{Driver, EdgeSink, Line, LineConfig};
use super::error::DriverError;
use super::pin::{Direction, Edge, EdgeEvent, EdgeKind, Value};
use crate::board::PinName;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct SysfsDriver {
    root: PathBuf,
}

impl Default for SysfsDriver {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ROOT)
    }
}

impl SysfsDriver {
    pub const DEFAULT_ROOT: &'static str = "/sys/class/gpio";
    const BANK_WIDTH: u32 = 32;
    // Upper bound on how long `unwatch` waits for the poll thread to notice.
    const POLL_TIMEOUT_MS: i32 = 100;

    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }

    pub fn line_number(name: &PinName) -> Option<u32> {
        let name = name.as_str();

        if let Some(bcm) = name.strip_prefix("BCM") {
            return bcm.parse().ok();
        }
        if let Some(rest) = name.strip_prefix("GPIO") {
            let mut parts = rest.splitn(2, "_IO");
            let bank: u32 = parts.next()?.parse().ok()?;
            let index: u32 = parts.next()?.parse().ok()?;
            if bank == 0 || index >= Self::BANK_WIDTH {
                return None;
            }
            return Some((bank - 1) * Self::BANK_WIDTH + index);
        }
        name.parse().ok()
    }
}

impl Driver for SysfsDriver {
    fn open(&self, name: &PinName, config: &LineConfig) -> Result<Box<dyn Line>, DriverError> {
        Ok(Box::new(self.open_line(name, config)?))
    }
}

impl SysfsDriver {
    fn open_line(&self, name: &PinName, config: &LineConfig) -> Result<SysfsLine, DriverError> {
        let line = Self::line_number(name).ok_or_else(|| DriverError::UnknownPin(name.clone()))?;
        let dir = self.root.join(format!("gpio{}", line));

        if !dir.exists() {
            write_attr(line, &self.root.join("export"), &line.to_string())?;
        }

        let direction = match (config.direction, config.initial) {
            (Direction::Input, _) => "in",
            (Direction::Output, Value::Low) => "low",
            (Direction::Output, Value::High) => "high",
        };
        write_attr(line, &dir.join("direction"), direction)?;

        let mut opened = SysfsLine {
            name: name.clone(),
            line,
            root: self.root.clone(),
            dir,
            edge: Arc::new(AtomicU8::new(Edge::None as u8)),
            watcher: None,
        };
        if config.direction == Direction::Input {
            opened.set_edge(config.edge)?;
        }

        Ok(opened)
    }
}

struct Watcher {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct SysfsLine {
    name: PinName,
    line: u32,
    root: PathBuf,
    dir: PathBuf,
    // Shared with the poll thread, so a new trigger applies to a running watcher.
    edge: Arc<AtomicU8>,
    watcher: Option<Watcher>,
}

fn load_edge(edge: &AtomicU8) -> Edge {
    Edge::try_from(edge.load(Ordering::SeqCst)).unwrap_or(Edge::None)
}

/// Labels a wake-up of the poll thread, given the level read right after it.
fn edge_kind(edge: Edge, value: Value) -> Option<EdgeKind> {
    match edge {
        Edge::Rising => Some(EdgeKind::Rising),
        Edge::Falling => Some(EdgeKind::Falling),
        Edge::Both if value == Value::High => Some(EdgeKind::Rising),
        Edge::Both => Some(EdgeKind::Falling),
        Edge::None => None,
    }
}

fn write_attr(line: u32, path: &Path, contents: &str) -> Result<(), DriverError> {
    fs::write(path, contents).map_err(|source| DriverError::Io {
        line,
        path: path.display().to_string(),
        source,
    })
}

fn parse_value(raw: &str) -> Result<Value, DriverError> {
    raw.trim()
        .parse::<u8>()
        .ok()
        .and_then(|v| Value::try_from(v).ok())
        .ok_or_else(|| DriverError::BadValue(raw.to_owned()))
}

fn edge_attr(edge: Edge) -> &'static str {
    match edge {
        Edge::None => "none",
        Edge::Rising => "rising",
        Edge::Falling => "falling",
        Edge::Both => "both",
    }
}

impl Line for SysfsLine {
    fn read(&self) -> Result<Value, DriverError> {
        let path = self.dir.join("value");
        let raw = fs::read_to_string(&path).map_err(|source| DriverError::Io {
            line: self.line,
            path: path.display().to_string(),
            source,
        })?;
        parse_value(&raw)
    }

    fn write(&mut self, value: Value) -> Result<(), DriverError> {
        write_attr(self.line, &self.dir.join("value"), &(value as u8).to_string())
    }

    fn set_edge(&mut self, edge: Edge) -> Result<(), DriverError> {
        write_attr(self.line, &self.dir.join("edge"), edge_attr(edge))?;
        self.edge.store(edge as u8, Ordering::SeqCst);
        Ok(())
    }

    fn watch(&mut self, sink: EdgeSink) -> Result<(), DriverError> {
        self.unwatch()?;

        let line = self.line;
        let path = self.dir.join("value");
        let io_err = |source| DriverError::Io {
            line,
            path: path.display().to_string(),
            source,
        };
        let file = File::open(&path).map_err(io_err)?;
        let stop = Arc::new(AtomicBool::new(false));

        let poller = Poller {
            line,
            pin: self.name.clone(),
            edge: Arc::clone(&self.edge),
            file,
            stop: Arc::clone(&stop),
            sink,
        };
        let thread = thread::Builder::new()
            .name(format!("gpio{}-edge", line))
            .spawn(move || poller.run())
            .map_err(io_err)?;

        self.watcher = Some(Watcher { stop, thread });
        Ok(())
    }

    fn unwatch(&mut self) -> Result<(), DriverError> {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop.store(true, Ordering::SeqCst);
            if watcher.thread.join().is_err() {
                log::error!("edge poller of line {} panicked", self.line);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.unwatch()?;
        write_attr(self.line, &self.root.join("unexport"), &self.line.to_string())
    }
}

struct Poller {
    line: u32,
    pin: PinName,
    edge: Arc<AtomicU8>,
    file: File,
    stop: Arc<AtomicBool>,
    sink: EdgeSink,
}

impl Poller {
    fn run(mut self) {
        // The first read clears the pending "changed" state left over from export.
        if let Err(err) = self.read_value() {
            log::error!("line {}: {}", self.line, err);
            return;
        }

        while !self.stop.load(Ordering::SeqCst) {
            let mut fds = [PollFd::new(
                self.file.as_raw_fd(),
                PollFlags::POLLPRI | PollFlags::POLLERR,
            )];

            match poll(&mut fds, SysfsDriver::POLL_TIMEOUT_MS) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(err) => {
                    log::error!("{}", DriverError::Poll(self.line, err));
                    return;
                }
            }

            let value = match self.read_value() {
                Ok(value) => value,
                Err(err) => {
                    log::error!("line {}: {}", self.line, err);
                    return;
                }
            };
            let kind = match edge_kind(load_edge(&self.edge), value) {
                Some(kind) => kind,
                None => continue,
            };

            (self.sink)(EdgeEvent {
                pin: self.pin.clone(),
                kind,
                at: Instant::now(),
            });
        }
    }

    fn read_value(&mut self) -> Result<Value, DriverError> {
        let line = self.line;
        let io_err = |source| DriverError::Io {
            line,
            path: format!("gpio{}/value", line),
            source,
        };
        let mut raw = String::with_capacity(4);
        self.file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        self.file.read_to_string(&mut raw).map_err(io_err)?;
        parse_value(&raw)
    }
}

impl Drop for SysfsLine {
    fn drop(&mut self) {
        if let Err(err) = self.unwatch() {
            log::error!("failed to stop watching line {}: {}", self.line, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn fake_root(tag: &str) -> PathBuf {
        let root = env::temp_dir().join(format!("gpio-lifecycle-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("gpio21")).unwrap();
        fs::create_dir_all(root.join("gpio6")).unwrap();
        fs::write(root.join("gpio21/value"), "1\n").unwrap();
        root
    }

    #[test]
    fn pin_names_resolve_to_lines() {
        assert_eq!(SysfsDriver::line_number(&"BCM21".into()), Some(21));
        assert_eq!(SysfsDriver::line_number(&"GPIO6_IO14".into()), Some(174));
        assert_eq!(SysfsDriver::line_number(&"GPIO2_IO02".into()), Some(34));
        assert_eq!(SysfsDriver::line_number(&"17".into()), Some(17));
        assert_eq!(SysfsDriver::line_number(&"GPIO0_IO01".into()), None);
        assert_eq!(SysfsDriver::line_number(&"LED".into()), None);
    }

    #[test]
    fn open_configures_attributes() {
        let root = fake_root("open");
        let driver = SysfsDriver::new(&root);

        let button = driver
            .open(
                &"BCM21".into(),
                &LineConfig {
                    direction: Direction::Input,
                    edge: Edge::Falling,
                    initial: Value::Low,
                },
            )
            .unwrap();
        assert_eq!(fs::read_to_string(root.join("gpio21/direction")).unwrap(), "in");
        assert_eq!(fs::read_to_string(root.join("gpio21/edge")).unwrap(), "falling");
        assert_eq!(button.read().unwrap(), Value::High);

        let mut led = driver
            .open(
                &"BCM6".into(),
                &LineConfig {
                    direction: Direction::Output,
                    edge: Edge::None,
                    initial: Value::Low,
                },
            )
            .unwrap();
        assert_eq!(fs::read_to_string(root.join("gpio6/direction")).unwrap(), "low");
        led.write(Value::High).unwrap();
        assert_eq!(fs::read_to_string(root.join("gpio6/value")).unwrap(), "1");

        led.close().unwrap();
        assert_eq!(fs::read_to_string(root.join("unexport")).unwrap(), "6");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_export_is_a_driver_error() {
        let driver = SysfsDriver::new(env::temp_dir().join("gpio-lifecycle-missing-root"));
        let res = driver.open(
            &"BCM5".into(),
            &LineConfig {
                direction: Direction::Output,
                edge: Edge::None,
                initial: Value::Low,
            },
        );
        assert!(matches!(res, Err(DriverError::Io { line: 5, .. })));
    }

    #[test]
    fn edge_trigger_change_reaches_running_watcher() {
        let root = fake_root("retrigger");
        let driver = SysfsDriver::new(&root);
        let mut button = driver
            .open_line(
                &"BCM21".into(),
                &LineConfig {
                    direction: Direction::Input,
                    edge: Edge::Falling,
                    initial: Value::Low,
                },
            )
            .unwrap();
        button.watch(Arc::new(|_: EdgeEvent| ())).unwrap();
        let seen_by_poller = Arc::clone(&button.edge);

        button.set_edge(Edge::Rising).unwrap();
        assert_eq!(fs::read_to_string(root.join("gpio21/edge")).unwrap(), "rising");
        assert_eq!(load_edge(&seen_by_poller), Edge::Rising);
        assert_eq!(edge_kind(load_edge(&seen_by_poller), Value::High), Some(EdgeKind::Rising));

        button.set_edge(Edge::Both).unwrap();
        assert_eq!(edge_kind(load_edge(&seen_by_poller), Value::Low), Some(EdgeKind::Falling));
        button.set_edge(Edge::None).unwrap();
        assert_eq!(edge_kind(load_edge(&seen_by_poller), Value::High), None);

        button.unwatch().unwrap();
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn garbage_values_are_rejected() {
        assert_eq!(parse_value("0\n").unwrap(), Value::Low);
        assert!(matches!(parse_value("7"), Err(DriverError::BadValue(_))));
    }
}
