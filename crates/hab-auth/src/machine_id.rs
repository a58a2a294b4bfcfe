//! Machine-bound key derivation.
//!
//! The credential key is the SHA-256 digest of a fingerprint built from, in
//! order, the host name, the MAC address of the first interface that is up and
//! not a loopback, and a platform hardware identifier.  Every source is best
//! effort: a missing one is left out, so the fingerprint degrades but stays
//! stable for a given machine.
//!
//! Because the key never leaves the machine, a credential file copied to
//! another host cannot be decrypted there.

use sha2::{Digest, Sha256};

/// Length in bytes of the derived key.
pub const KEY_LEN: usize = 32;

const SEPARATOR: &str = "|";

/// A source of a platform hardware identifier.
///
/// Implementations return `None` whenever the identifier is unavailable;
/// they never fail the derivation.
pub trait HardwareIdSource {
    fn hardware_id(&self) -> Option<String>;
}

/// `IOPlatformUUID` from the IOKit registry (macOS).
pub struct IoPlatformUuid;

impl HardwareIdSource for IoPlatformUuid {
    fn hardware_id(&self) -> Option<String> {
        let output = std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()?;
        parse_ioreg_uuid(&String::from_utf8_lossy(&output.stdout))
    }
}

/// systemd / D-Bus machine id (Linux).
pub struct LinuxMachineId;

impl HardwareIdSource for LinuxMachineId {
    fn hardware_id(&self) -> Option<String> {
        ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .find_map(|path| std::fs::read_to_string(path).ok())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    }
}

/// `MachineGuid` from the Cryptography registry key (Windows).
pub struct WindowsMachineGuid;

impl HardwareIdSource for WindowsMachineGuid {
    fn hardware_id(&self) -> Option<String> {
        let output = std::process::Command::new("reg")
            .args([
                "query",
                r"HKLM\SOFTWARE\Microsoft\Cryptography",
                "/v",
                "MachineGuid",
            ])
            .output()
            .ok()?;
        parse_reg_machine_guid(&String::from_utf8_lossy(&output.stdout))
    }
}

/// No hardware identifier on this platform.
pub struct NoHardwareId;

impl HardwareIdSource for NoHardwareId {
    fn hardware_id(&self) -> Option<String> {
        None
    }
}

/// The hardware identifier source for the platform we were built for.
pub fn platform_hardware_source() -> Box<dyn HardwareIdSource> {
    if cfg!(target_os = "macos") {
        Box::new(IoPlatformUuid)
    } else if cfg!(target_os = "linux") {
        Box::new(LinuxMachineId)
    } else if cfg!(target_os = "windows") {
        Box::new(WindowsMachineGuid)
    } else {
        Box::new(NoHardwareId)
    }
}

/// The identity signals collected from the current machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineIdentity {
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub hardware_id: Option<String>,
}

impl MachineIdentity {
    /// Collect the identity of the current machine.
    pub fn probe() -> Self {
        Self::probe_with(platform_hardware_source().as_ref())
    }

    /// Collect the identity using a specific hardware identifier source.
    pub fn probe_with(hardware: &dyn HardwareIdSource) -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .map(|name| name.to_string_lossy().into_owned())
                .filter(|name| !name.is_empty()),
            mac_address: primary_mac_address(),
            hardware_id: hardware.hardware_id(),
        }
    }

    /// Available sources joined with `|`, in fixed order.
    pub fn fingerprint(&self) -> String {
        [&self.hostname, &self.mac_address, &self.hardware_id]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }

    /// Digest the fingerprint into a symmetric key.
    pub fn derive_key(&self) -> [u8; KEY_LEN] {
        Sha256::digest(self.fingerprint().as_bytes()).into()
    }
}

/// Derive the credential key for the current machine.
pub fn derive_machine_key() -> [u8; KEY_LEN] {
    MachineIdentity::probe().derive_key()
}

/// Extract `IOPlatformUUID` from `ioreg -rd1 -c IOPlatformExpertDevice` output.
fn parse_ioreg_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("IOPlatformUUID"))
        .and_then(|line| line.split('"').nth(3))
        .map(str::to_string)
}

/// Extract `MachineGuid` from `reg query` output: the last field on its line.
fn parse_reg_machine_guid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("MachineGuid"))
        .and_then(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            (fields.len() >= 3).then(|| fields[fields.len() - 1].to_string())
        })
}

// Read from sysfs: `mac_address` cannot tell whether an interface is up.
#[cfg(target_os = "linux")]
fn primary_mac_address() -> Option<String> {
    use std::fs;

    const IFF_UP: u32 = 0x1;
    const IFF_LOOPBACK: u32 = 0x8;

    let read = |path: &std::path::Path| fs::read_to_string(path).ok().map(|s| s.trim().to_string());

    let mut interfaces: Vec<(u32, String)> = fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let dir = entry.path();
            let flags = read(&dir.join("flags"))?;
            let flags = u32::from_str_radix(flags.trim_start_matches("0x"), 16).ok()?;
            if flags & IFF_UP == 0 || flags & IFF_LOOPBACK != 0 {
                return None;
            }
            let address = read(&dir.join("address"))?;
            if address.is_empty() || address == "00:00:00:00:00:00" {
                return None;
            }
            let index = read(&dir.join("ifindex"))?.parse().ok()?;
            Some((index, address))
        })
        .collect();

    interfaces.sort_by_key(|(index, _)| *index);
    interfaces.into_iter().next().map(|(_, address)| address)
}

#[cfg(not(target_os = "linux"))]
fn primary_mac_address() -> Option<String> {
    mac_address::get_mac_address()
        .ok()
        .flatten()
        .map(|mac| mac.to_string().to_lowercase())
}
