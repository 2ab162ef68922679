// SPDX-License-Identifier: MPL-2.0

//! AC/battery detection.
//!
//! UPower's `OnBattery` property on the system bus is followed through its
//! change signal. Systems without UPower fall back to polling
//! `/sys/class/power_supply`.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

pub const SYSFS_POWER_SUPPLY: &str = "/sys/class/power_supply";

/// Notification sent into the event loop when the power source flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStateChanged {
    pub on_battery: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSource {
    Ac,
    Battery,
}

fn read_attr(supply: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(supply.join(attr))
        .ok()
        .map(|value| value.trim().to_owned())
}

/// Determine the active power source from a `power_supply` class directory.
///
/// Any online `Mains` or `USB` supply means AC. Without an online external
/// supply, a `Battery` reporting `Discharging` means battery. Machines without
/// any supply (desktops, VMs) are on AC.
///
/// # Errors
///
/// Fails if `root` cannot be listed.
pub fn read_power_source(root: &Path) -> io::Result<PowerSource> {
    let mut external_seen = false;
    let mut external_online = false;
    let mut discharging = false;

    for entry in fs::read_dir(root)? {
        let supply = entry?.path();
        let Some(kind) = read_attr(&supply, "type") else {
            continue;
        };

        match kind.as_str() {
            "Mains" | "USB" => {
                external_seen = true;
                if read_attr(&supply, "online").as_deref() == Some("1") {
                    external_online = true;
                }
            }
            "Battery" => {
                // Peripheral batteries (mice, headsets) report scope=Device.
                if read_attr(&supply, "scope").as_deref() == Some("Device") {
                    continue;
                }
                if read_attr(&supply, "status").as_deref() == Some("Discharging") {
                    discharging = true;
                }
            }
            _ => {}
        }
    }

    if external_seen && !external_online {
        tracing::trace!(discharging, "external supplies offline");
    }

    Ok(if discharging && !external_online {
        PowerSource::Battery
    } else {
        PowerSource::Ac
    })
}

#[zbus::proxy(
    interface = "org.freedesktop.UPower",
    default_service = "org.freedesktop.UPower",
    default_path = "/org/freedesktop/UPower",
    gen_async = false
)]
trait UPower {
    #[zbus(property)]
    fn on_battery(&self) -> zbus::Result<bool>;
}

/// Where power state changes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerBackend {
    UPower,
    Sysfs,
}

/// Background watcher of the power source.
///
/// Dropping the handle stops the thread.
#[derive(Debug)]
pub struct PowerMonitorHandle {
    backend: PowerBackend,
    on_battery: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    stop_tx: Option<mpsc::Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl PowerMonitorHandle {
    /// Last observed state.
    #[must_use]
    pub fn on_battery(&self) -> bool {
        self.on_battery.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn backend(&self) -> PowerBackend {
        self.backend
    }

    /// Stop reporting changes.
    ///
    /// A UPower thread blocked on the bus is detached and exits on the next
    /// signal without reporting it.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_tx.take();
        if let Some(join) = self.join.take() {
            if self.backend == PowerBackend::Sysfs {
                let _ = join.join();
            }
        }
    }
}

impl Drop for PowerMonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn connect_upower() -> zbus::Result<(UPowerProxy<'static>, bool)> {
    let conn = zbus::blocking::Connection::system()?;
    let proxy = UPowerProxy::new(&conn)?;
    let on_battery = proxy.on_battery()?;
    Ok((proxy, on_battery))
}

fn sysfs_on_battery(root: &Path) -> bool {
    match read_power_source(root) {
        Ok(source) => source == PowerSource::Battery,
        Err(why) => {
            tracing::debug!(?why, root = %root.display(), "no power supply information, assuming AC");
            false
        }
    }
}

/// Reports state flips to `notify`. Owned by the monitor thread.
struct Reporter<F> {
    last: Option<bool>,
    shared: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    notify: F,
}

impl<F: FnMut(PowerStateChanged) -> bool> Reporter<F> {
    /// Returns `false` once the thread should end.
    fn report(&mut self, on_battery: bool) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        if self.last == Some(on_battery) {
            return true;
        }
        tracing::debug!(on_battery, "power source changed");
        self.shared.store(on_battery, Ordering::Release);
        self.last = Some(on_battery);
        (self.notify)(PowerStateChanged { on_battery })
    }
}

/// Feed UPower `OnBattery` values to `reporter` until the stream ends.
///
/// Returns `true` if the thread should go on polling sysfs.
fn follow_changes<F, I>(reporter: &mut Reporter<F>, initial: bool, changes: I) -> bool
where
    F: FnMut(PowerStateChanged) -> bool,
    I: IntoIterator<Item = zbus::Result<bool>>,
{
    if !reporter.report(initial) {
        return false;
    }
    for change in changes {
        match change {
            Ok(on_battery) => {
                if !reporter.report(on_battery) {
                    return false;
                }
            }
            Err(why) => {
                tracing::warn!(?why, "lost UPower, polling sysfs instead");
                return true;
            }
        }
    }
    tracing::warn!("UPower change stream ended, polling sysfs instead");
    true
}

fn poll_sysfs<F>(
    reporter: &mut Reporter<F>,
    root: &Path,
    interval: Duration,
    stop_rx: &mpsc::Receiver<()>,
) where
    F: FnMut(PowerStateChanged) -> bool,
{
    loop {
        if !reporter.report(sysfs_on_battery(root)) {
            break;
        }
        match stop_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Follow UPower's `OnBattery` property and call `notify` whenever it
/// changes, starting with the initial reading.
///
/// Without UPower on the system bus, `root` is polled every `interval`
/// instead. The initial state is read before returning, so
/// [`PowerMonitorHandle::on_battery`] is immediately meaningful.
/// `notify` returns `false` when the receiver is gone, which ends the thread.
///
/// # Errors
///
/// Fails if the monitor thread could not be spawned.
pub fn start_power_monitor<F>(
    root: PathBuf,
    interval: Duration,
    notify: F,
) -> io::Result<PowerMonitorHandle>
where
    F: FnMut(PowerStateChanged) -> bool + Send + 'static,
{
    match connect_upower() {
        Ok((proxy, initial)) => {
            tracing::debug!(on_battery = initial, "following UPower");
            spawn_monitor(PowerBackend::UPower, initial, notify, move |reporter, stop_rx| {
                let changes = proxy
                    .receive_on_battery_changed()
                    .map(|change| change.get());
                if follow_changes(reporter, initial, changes) {
                    poll_sysfs(reporter, &root, interval, stop_rx);
                }
            })
        }
        Err(why) => {
            tracing::info!(?why, "UPower unavailable, polling the power_supply class");
            start_sysfs_monitor(root, interval, notify)
        }
    }
}

/// Poll `root` every `interval`, reporting like [`start_power_monitor`].
///
/// # Errors
///
/// Fails if the polling thread could not be spawned.
pub fn start_sysfs_monitor<F>(
    root: PathBuf,
    interval: Duration,
    notify: F,
) -> io::Result<PowerMonitorHandle>
where
    F: FnMut(PowerStateChanged) -> bool + Send + 'static,
{
    let initial = sysfs_on_battery(&root);
    spawn_monitor(PowerBackend::Sysfs, initial, notify, move |reporter, stop_rx| {
        poll_sysfs(reporter, &root, interval, stop_rx);
    })
}

fn spawn_monitor<F, W>(
    backend: PowerBackend,
    initial: bool,
    notify: F,
    watch: W,
) -> io::Result<PowerMonitorHandle>
where
    F: FnMut(PowerStateChanged) -> bool + Send + 'static,
    W: FnOnce(&mut Reporter<F>, &mpsc::Receiver<()>) + Send + 'static,
{
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let on_battery = Arc::new(AtomicBool::new(initial));
    let stopped = Arc::new(AtomicBool::new(false));
    let mut reporter = Reporter {
        last: None,
        shared: Arc::clone(&on_battery),
        stopped: Arc::clone(&stopped),
        notify,
    };

    let join = thread::Builder::new()
        .name("power-monitor".into())
        .spawn(move || watch(&mut reporter, &stop_rx))?;

    Ok(PowerMonitorHandle {
        backend,
        on_battery,
        stopped,
        stop_tx: Some(stop_tx),
        join: Some(join),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (attr, value) in attrs {
            fs::write(dir.join(attr), format!("{value}\n")).unwrap();
        }
    }

    #[test]
    fn test_no_supplies_is_ac() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(read_power_source(root.path()).unwrap(), PowerSource::Ac);
    }

    #[test]
    fn test_laptop_unplugged() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "0")]);
        supply(
            root.path(),
            "BAT0",
            &[("type", "Battery"), ("status", "Discharging")],
        );
        assert_eq!(read_power_source(root.path()).unwrap(), PowerSource::Battery);
    }

    #[test]
    fn test_laptop_plugged_in() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        supply(
            root.path(),
            "BAT0",
            &[("type", "Battery"), ("status", "Charging")],
        );
        assert_eq!(read_power_source(root.path()).unwrap(), PowerSource::Ac);
    }

    #[test]
    fn test_usb_c_charger_counts_as_ac() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "ucsi-source-psy-1", &[("type", "USB"), ("online", "1")]);
        supply(
            root.path(),
            "BAT1",
            &[("type", "Battery"), ("status", "Discharging")],
        );
        assert_eq!(read_power_source(root.path()).unwrap(), PowerSource::Ac);
    }

    #[test]
    fn test_peripheral_battery_ignored() {
        let root = tempfile::tempdir().unwrap();
        supply(
            root.path(),
            "hidpp_battery_0",
            &[("type", "Battery"), ("scope", "Device"), ("status", "Discharging")],
        );
        assert_eq!(read_power_source(root.path()).unwrap(), PowerSource::Ac);
    }

    #[test]
    fn test_missing_root_is_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(read_power_source(&root.path().join("missing")).is_err());
    }

    #[test]
    fn test_monitor_reports_initial_state_and_changes() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        supply(
            root.path(),
            "BAT0",
            &[("type", "Battery"), ("status", "Charging")],
        );

        let (tx, rx) = mpsc::channel();
        let handle = start_sysfs_monitor(
            root.path().to_path_buf(),
            Duration::from_millis(20),
            move |event| tx.send(event).is_ok(),
        )
        .unwrap();

        assert_eq!(handle.backend(), PowerBackend::Sysfs);
        assert!(!handle.on_battery());
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!first.on_battery);

        supply(root.path(), "AC", &[("online", "0")]);
        supply(root.path(), "BAT0", &[("status", "Discharging")]);

        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(second.on_battery);
        assert!(handle.on_battery());
        drop(handle);
    }

    fn reporter(
        tx: mpsc::Sender<PowerStateChanged>,
    ) -> Reporter<impl FnMut(PowerStateChanged) -> bool> {
        Reporter {
            last: None,
            shared: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            notify: move |event| tx.send(event).is_ok(),
        }
    }

    #[test]
    fn test_upower_changes_are_reported_once_each() {
        let (tx, rx) = mpsc::channel();
        let mut reporter = reporter(tx);

        let fallback = follow_changes(&mut reporter, false, [Ok(false), Ok(true), Ok(true), Ok(false)]);

        let seen: Vec<bool> = rx.try_iter().map(|event| event.on_battery).collect();
        assert_eq!(seen, vec![false, true, false]);
        assert!(!reporter.shared.load(Ordering::Acquire));
        // The stream ending hands over to sysfs polling.
        assert!(fallback);
    }

    #[test]
    fn test_upower_error_falls_back_to_polling() {
        let (tx, rx) = mpsc::channel();
        let mut reporter = reporter(tx);

        let fallback = follow_changes(
            &mut reporter,
            true,
            [Err(zbus::Error::Failure("bus gone".into())), Ok(false)],
        );

        assert!(fallback);
        let seen: Vec<bool> = rx.try_iter().map(|event| event.on_battery).collect();
        assert_eq!(seen, vec![true]);
    }

    #[test]
    fn test_stopped_reporter_drops_upower_changes() {
        let (tx, rx) = mpsc::channel();
        let mut reporter = reporter(tx);
        reporter.stopped.store(true, Ordering::Release);

        let fallback = follow_changes(&mut reporter, true, [Ok(false)]);

        assert!(!fallback);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_gone_receiver_ends_upower_thread() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let mut reporter = reporter(tx);

        assert!(!follow_changes(&mut reporter, false, [Ok(true)]));
    }
}
