// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated PCI host for exercising the rescan without hardware.
//!
//! Bridges are backed by [`ConfigSpaceType1Emulator`]s. Functions can be
//! held "link down" so that boot enumeration misses them, the way a switch
//! port that is still training hides its device.

use crate::topology::BusId;
use crate::topology::ConfigSpaceAccess;
use crate::topology::ConfigSpaceError;
use crate::topology::DeviceKind;
use crate::topology::PciAddress;
use crate::topology::PciBridge;
use crate::topology::PciBus;
use crate::topology::PciDevice;
use crate::topology::PciHost;
use crate::topology::RescanSession;
use crate::topology::ResourceWindow;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use parking_lot::RwLock;
use pci_core::cfg_space_emu::CfgAccessError;
use pci_core::cfg_space_emu::ConfigSpaceType1Emulator;
use pci_core::spec::cfg_space::HeaderType01;
use pci_core::spec::cfg_space::type1;
use pci_core::spec::hwid::ClassCode;
use pci_core::spec::hwid::HardwareIds;
use pci_core::spec::hwid::Subclass;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Something the emulated host observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Lock,
    Scan(BusId),
    Assign(BusId),
    ConfigWrite(PciAddress),
    AddDevices(BusId),
    /// A driver probed `address`; `reachable` is whether every bridge above
    /// it was forwarding memory at that moment.
    Probe {
        address: PciAddress,
        reachable: bool,
    },
    Unlock,
}

/// A single logged config space access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgAccess {
    pub address: PciAddress,
    pub offset: u16,
    /// `Some(value)` for writes.
    pub written: Option<u16>,
}

struct Function {
    secondary_bus: Option<u8>,
    link_up: bool,
    mem_plan: Option<ResourceWindow>,
    io_plan: Option<ResourceWindow>,
}

struct HostState {
    hardware: BTreeMap<PciAddress, Function>,
    tree: PciBus,
    attached: BTreeSet<PciAddress>,
}

/// Config space of every emulated bridge, with an access log.
pub struct EmulatedConfigSpace {
    bridges: Mutex<BTreeMap<PciAddress, ConfigSpaceType1Emulator>>,
    failing: Mutex<BTreeSet<PciAddress>>,
    accesses: Mutex<Vec<CfgAccess>>,
    events: Arc<Mutex<Vec<HostEvent>>>,
}

impl EmulatedConfigSpace {
    fn access<T>(
        &self,
        address: PciAddress,
        offset: u16,
        written: Option<u16>,
        f: impl FnOnce(&mut ConfigSpaceType1Emulator) -> Result<T, CfgAccessError>,
    ) -> Result<T, ConfigSpaceError> {
        self.accesses.lock().push(CfgAccess {
            address,
            offset,
            written,
        });
        if written.is_some() {
            self.events.lock().push(HostEvent::ConfigWrite(address));
        }
        if self.failing.lock().contains(&address) {
            return Err(ConfigSpaceError::Access {
                address,
                offset,
                source: Box::new(std::io::Error::other("injected failure")),
            });
        }
        let mut bridges = self.bridges.lock();
        let emu = bridges
            .get_mut(&address)
            .ok_or(ConfigSpaceError::NoDevice(address))?;
        f(emu).map_err(|err| ConfigSpaceError::Access {
            address,
            offset,
            source: Box::new(err),
        })
    }
}

impl ConfigSpaceAccess for EmulatedConfigSpace {
    fn read_u8(&self, address: PciAddress, offset: u16) -> Result<u8, ConfigSpaceError> {
        self.access(address, offset, None, |emu| emu.read_u8(offset))
    }

    fn read_u16(&self, address: PciAddress, offset: u16) -> Result<u16, ConfigSpaceError> {
        self.access(address, offset, None, |emu| emu.read_u16(offset))
    }

    fn write_u8(
        &self,
        address: PciAddress,
        offset: u16,
        value: u8,
    ) -> Result<(), ConfigSpaceError> {
        self.access(address, offset, Some(value.into()), |emu| {
            emu.write_u8(offset, value)
        })
    }

    fn write_u16(
        &self,
        address: PciAddress,
        offset: u16,
        value: u16,
    ) -> Result<(), ConfigSpaceError> {
        self.access(address, offset, Some(value), |emu| {
            emu.write_u16(offset, value)
        })
    }
}

/// An emulated PCI host with a single root bus.
pub struct EmulatedHost {
    known_buses: RwLock<BTreeSet<BusId>>,
    state: Mutex<HostState>,
    cfg: EmulatedConfigSpace,
    events: Arc<Mutex<Vec<HostEvent>>>,
    lock_count: AtomicUsize,
}

impl EmulatedHost {
    pub fn new(root: BusId) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        Self {
            known_buses: RwLock::new([root].into()),
            state: Mutex::new(HostState {
                hardware: BTreeMap::new(),
                tree: PciBus::new(root),
                attached: BTreeSet::new(),
            }),
            cfg: EmulatedConfigSpace {
                bridges: Mutex::new(BTreeMap::new()),
                failing: Mutex::new(BTreeSet::new()),
                accesses: Mutex::new(Vec::new()),
                events: events.clone(),
            },
            events,
            lock_count: AtomicUsize::new(0),
        }
    }

    /// Plugs in a PCI-to-PCI bridge whose secondary bus is `secondary`.
    pub fn add_bridge(&self, address: PciAddress, secondary: u8) {
        let mut emu = ConfigSpaceType1Emulator::new(HardwareIds {
            vendor_id: 0x1d87,
            device_id: 0x3588,
            revision_id: 1,
            prog_if: 0,
            sub_class: Subclass::BRIDGE_PCI_TO_PCI,
            base_class: ClassCode::BRIDGE,
        });
        let bus_numbers = (secondary as u32) << 16 | (secondary as u32) << 8 | address.bus as u32;
        emu.write_u32(HeaderType01::LATENCY_BUS_NUMBERS.0, bus_numbers).unwrap();
        self.cfg.bridges.lock().insert(address, emu);
        self.add_function(address, Some(secondary));
    }

    /// Plugs in an endpoint.
    pub fn add_endpoint(&self, address: PciAddress) {
        self.add_function(address, None);
    }

    fn add_function(&self, address: PciAddress, secondary_bus: Option<u8>) {
        self.state.lock().hardware.insert(
            address,
            Function {
                secondary_bus,
                link_up: true,
                mem_plan: None,
                io_plan: None,
            },
        );
    }

    /// Controls whether a function answers enumeration.
    pub fn set_link_up(&self, address: PciAddress, up: bool) {
        self.state
            .lock()
            .hardware
            .get_mut(&address)
            .unwrap()
            .link_up = up;
    }

    /// The memory window resource assignment will pick for `address`.
    pub fn plan_mem_window(&self, address: PciAddress, start: u64, end: u64) {
        self.state
            .lock()
            .hardware
            .get_mut(&address)
            .unwrap()
            .mem_plan = Some(ResourceWindow::memory(start, end));
    }

    /// The I/O window resource assignment will pick for `address`.
    pub fn plan_io_window(&self, address: PciAddress, start: u64, end: u64) {
        self.state
            .lock()
            .hardware
            .get_mut(&address)
            .unwrap()
            .io_plan = Some(ResourceWindow::io(start, end));
    }

    /// Sets the command register without logging the access.
    pub fn set_command(&self, address: PciAddress, command: u16) {
        self.poke_u16(address, type1::COMMAND, command);
    }

    pub fn poke_u8(&self, address: PciAddress, offset: u16, value: u8) {
        let mut bridges = self.cfg.bridges.lock();
        bridges
            .get_mut(&address)
            .unwrap()
            .write_u8(offset, value)
            .unwrap();
    }

    pub fn poke_u16(&self, address: PciAddress, offset: u16, value: u16) {
        let mut bridges = self.cfg.bridges.lock();
        bridges
            .get_mut(&address)
            .unwrap()
            .write_u16(offset, value)
            .unwrap();
    }

    pub fn read_u8(&self, address: PciAddress, offset: u16) -> u8 {
        self.cfg.bridges.lock()[&address].read_u8(offset).unwrap()
    }

    pub fn read_u16(&self, address: PciAddress, offset: u16) -> u16 {
        self.cfg.bridges.lock()[&address].read_u16(offset).unwrap()
    }

    /// Makes every config space access to `address` fail.
    pub fn fail_accesses_to(&self, address: PciAddress) {
        self.cfg.failing.lock().insert(address);
    }

    /// Runs boot-time enumeration: scan, assign, attach, with whatever links
    /// are currently up. History is cleared afterwards.
    pub fn enumerate(&self) {
        let root = self.state.lock().tree.id;
        {
            let mut session = self.session();
            session.scan_child_bus(root);
            session.assign_unassigned_bus_resources(root);
            session.bus_add_devices(root);
        }
        self.clear_history();
    }

    pub fn clear_history(&self) {
        self.cfg.accesses.lock().clear();
        self.events.lock().clear();
        self.lock_count.store(0, Ordering::SeqCst);
    }

    /// Takes the rescan/remove lock.
    pub fn session(&self) -> EmulatedSession<'_> {
        let state = self.state.lock();
        self.lock_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(HostEvent::Lock);
        EmulatedSession { host: self, state }
    }

    pub fn accesses(&self) -> Vec<CfgAccess> {
        self.cfg.accesses.lock().clone()
    }

    /// Offsets written to `address`, in order.
    pub fn written_offsets(&self, address: PciAddress) -> Vec<u16> {
        self.cfg
            .accesses
            .lock()
            .iter()
            .filter(|a| a.address == address && a.written.is_some())
            .map(|a| a.offset)
            .collect()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self, address: PciAddress) -> bool {
        self.state.lock().attached.contains(&address)
    }

    /// The raw type 1 header of every bridge.
    pub fn register_snapshot(&self) -> BTreeMap<PciAddress, Vec<u32>> {
        self.cfg
            .bridges
            .lock()
            .iter()
            .map(|(address, emu)| {
                let header = (0..0x40)
                    .step_by(4)
                    .map(|offset| {
                        let mut value = 0;
                        emu.read_u32(offset, &mut value).unwrap();
                        value
                    })
                    .collect();
                (*address, header)
            })
            .collect()
    }
}

impl PciHost for EmulatedHost {
    fn find_bus(&self, id: BusId) -> Option<BusId> {
        self.known_buses.read().get(&id).copied()
    }

    fn lock_rescan_remove(&self) -> Box<dyn RescanSession + '_> {
        Box::new(self.session())
    }
}

/// The emulated host with its rescan/remove lock held.
pub struct EmulatedSession<'a> {
    host: &'a EmulatedHost,
    state: MutexGuard<'a, HostState>,
}

impl Drop for EmulatedSession<'_> {
    fn drop(&mut self) {
        self.host.events.lock().push(HostEvent::Unlock);
    }
}

fn find_bus_mut(bus: &mut PciBus, id: BusId) -> Option<&mut PciBus> {
    if bus.id == id {
        return Some(bus);
    }
    bus.devices
        .iter_mut()
        .filter_map(PciDevice::as_bridge_mut)
        .find_map(|bridge| find_bus_mut(&mut bridge.subordinate, id))
}

fn find_bus(bus: &PciBus, id: BusId) -> Option<&PciBus> {
    if bus.id == id {
        return Some(bus);
    }
    bus.devices
        .iter()
        .filter_map(PciDevice::as_bridge)
        .find_map(|bridge| find_bus(&bridge.subordinate, id))
}

fn scan_bus(bus: &mut PciBus, hardware: &BTreeMap<PciAddress, Function>, found: &mut Vec<BusId>) {
    for (address, function) in hardware {
        if address.bus_id() != bus.id
            || !function.link_up
            || bus.devices.iter().any(|d| d.address == *address)
        {
            continue;
        }
        let kind = match function.secondary_bus {
            Some(secondary) => {
                let id = BusId::new(address.domain, secondary);
                found.push(id);
                DeviceKind::Bridge(PciBridge::new(PciBus::new(id)))
            }
            None => DeviceKind::Endpoint,
        };
        bus.devices.push(PciDevice {
            address: *address,
            kind,
        });
    }
    bus.devices.sort_by_key(|d| d.address);
    for bridge in bus.devices.iter_mut().filter_map(PciDevice::as_bridge_mut) {
        scan_bus(&mut bridge.subordinate, hardware, found);
    }
}

fn assign_bus(bus: &mut PciBus, hardware: &BTreeMap<PciAddress, Function>) {
    for device in &mut bus.devices {
        let function = &hardware[&device.address];
        let Some(bridge) = device.as_bridge_mut() else {
            continue;
        };
        if bridge.mem_window.size() == 0 {
            if let Some(plan) = function.mem_plan {
                bridge.mem_window = plan;
            }
        }
        if bridge.io_window.size() == 0 {
            if let Some(plan) = function.io_plan {
                bridge.io_window = plan;
            }
        }
        assign_bus(&mut bridge.subordinate, hardware);
    }
}

impl EmulatedSession<'_> {
    fn attach_bus(
        &self,
        bus: &PciBus,
        upstream: &mut Vec<PciAddress>,
        attached: &mut BTreeSet<PciAddress>,
    ) {
        for device in &bus.devices {
            if attached.insert(device.address) {
                let bridges = self.host.cfg.bridges.lock();
                let reachable = upstream.iter().all(|bridge| {
                    let emu = &bridges[bridge];
                    emu.assigned_memory_range().is_some() && emu.command().bus_master()
                });
                self.host.events.lock().push(HostEvent::Probe {
                    address: device.address,
                    reachable,
                });
            }
            if let Some(bridge) = device.as_bridge() {
                upstream.push(device.address);
                self.attach_bus(&bridge.subordinate, upstream, attached);
                upstream.pop();
            }
        }
    }
}

impl RescanSession for EmulatedSession<'_> {
    fn scan_child_bus(&mut self, bus: BusId) {
        self.host.events.lock().push(HostEvent::Scan(bus));
        let HostState { hardware, tree, .. } = &mut *self.state;
        let Some(bus) = find_bus_mut(tree, bus) else {
            return;
        };
        let mut found = Vec::new();
        scan_bus(bus, hardware, &mut found);
        self.host.known_buses.write().extend(found);
    }

    fn assign_unassigned_bus_resources(&mut self, bus: BusId) {
        self.host.events.lock().push(HostEvent::Assign(bus));
        let HostState { hardware, tree, .. } = &mut *self.state;
        if let Some(bus) = find_bus_mut(tree, bus) {
            assign_bus(bus, hardware);
        }
    }

    fn bus(&self, bus: BusId) -> Option<&PciBus> {
        find_bus(&self.state.tree, bus)
    }

    fn config_space(&self) -> &dyn ConfigSpaceAccess {
        &self.host.cfg
    }

    fn bus_add_devices(&mut self, id: BusId) {
        self.host.events.lock().push(HostEvent::AddDevices(id));
        // Bridges between the root and `id` gate reachability as well.
        let mut upstream = Vec::new();
        if !upstream_bridges(&self.state.tree, id, &mut upstream) {
            return;
        }
        let mut attached = std::mem::take(&mut self.state.attached);
        if let Some(bus) = find_bus(&self.state.tree, id) {
            self.attach_bus(bus, &mut upstream, &mut attached);
        }
        self.state.attached = attached;
    }
}

/// Collects the bridges leading from `bus` down to `id`. Returns false if
/// `id` is not below `bus`.
fn upstream_bridges(bus: &PciBus, id: BusId, path: &mut Vec<PciAddress>) -> bool {
    if bus.id == id {
        return true;
    }
    for device in &bus.devices {
        if let Some(bridge) = device.as_bridge() {
            path.push(device.address);
            if upstream_bridges(&bridge.subordinate, id, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}

/// Counts captured log lines containing `needle`.
pub fn count_lines(logs: &[String], needle: &str) -> usize {
    logs.iter().filter(|l| l.contains(needle)).count()
}

/// Log output captured by [`capture_logs`].
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Runs `f` with a subscriber that records every formatted log line,
/// including those emitted from threads that inherit the dispatcher.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, Vec<String>) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .without_time()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let text = String::from_utf8(buffer.0.lock().clone()).unwrap();
    (result, text.lines().map(str::to_owned).collect())
}
