//! Host facts: the narrow surface behind which all platform-specific
//! probing lives. The schedulers and reporters know nothing about the OS.

use std::net::{ToSocketAddrs, UdpSocket};

use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tracing::debug;

/// Address used to pick the outbound interface. This is the cloud metadata
/// server; no packet is actually sent.
const ROUTE_PROBE_ADDR: &str = "100.100.100.200:80";

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The primary outbound IP, determined by the local address a connected UDP
/// socket would use. Empty when no route exists.
pub fn main_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(ROUTE_PROBE_ADDR)?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            debug!("outbound route probe failed: {e}");
            String::new()
        }
    }
}

/// All known local IPs: the main outbound IP plus whatever the hostname
/// resolves to, loopback excluded.
pub fn local_ips() -> Vec<String> {
    let mut ips = Vec::new();
    let main = main_ip();
    if !main.is_empty() {
        ips.push(main);
    }

    let name = hostname();
    if !name.is_empty() {
        if let Ok(addrs) = (name.as_str(), 0u16).to_socket_addrs() {
            for addr in addrs {
                if addr.ip().is_loopback() {
                    continue;
                }
                let ip = addr.ip().to_string();
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
    }
    ips
}

/// OS display name, e.g. `Linux (Ubuntu)`.
pub fn os_name() -> String {
    let kernel = std::env::consts::OS;
    let kernel = match kernel {
        "linux" => "Linux",
        "macos" => "Mac OS",
        "windows" => "Windows",
        other => other,
    };
    match System::name() {
        Some(distro) if !distro.is_empty() => format!("{kernel} ({distro})"),
        _ => kernel.to_string(),
    }
}

pub fn os_version() -> String {
    System::os_version().unwrap_or_default()
}

/// CPU architecture in the wire vocabulary: amd64, 386, arm64.
pub fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Free space of the root filesystem, in bytes.
pub fn free_disk_space() -> u64 {
    let disks = Disks::new_with_refreshed_list();
    let mut root_free = 0u64;
    let mut max_free = 0u64;
    for disk in disks.list() {
        let free = disk.available_space();
        max_free = max_free.max(free);
        if disk.mount_point() == std::path::Path::new("/") {
            root_free = free;
        }
    }
    if root_free > 0 {
        root_free
    } else {
        max_free
    }
}

pub fn env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

/// One sample of the agent's own resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStat {
    /// CPU use since the previous sample, as a fraction of one core
    /// (0.5 = 50%).
    pub cpu_fraction: f64,
    pub rss_bytes: u64,
    pub open_fd_count: u64,
}

/// Samples the current process. Holds the [`System`] between calls so CPU
/// percentages are deltas over the sampling interval.
pub struct ProcessSampler {
    system: System,
    pid: Pid,
}

impl ProcessSampler {
    pub fn new() -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        Some(Self {
            system: System::new(),
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_u32()
    }

    pub fn sample(&mut self) -> Option<ProcessStat> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self.system.process(self.pid)?;
        Some(ProcessStat {
            cpu_fraction: process.cpu_usage() as f64 / 100.0,
            rss_bytes: process.memory(),
            open_fd_count: open_fd_count(),
        })
    }
}

#[cfg(target_os = "linux")]
fn open_fd_count() -> u64 {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count() as u64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn open_fd_count() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_uses_wire_vocabulary() {
        let a = arch();
        assert!(!a.is_empty());
        assert_ne!(a, "x86_64");
        assert_ne!(a, "aarch64");
    }

    #[test]
    fn os_name_has_kernel_prefix() {
        let name = os_name();
        assert!(!name.is_empty());
    }

    #[test]
    fn process_sampler_reports_rss() {
        let mut sampler = ProcessSampler::new().unwrap();
        let stat = sampler.sample().unwrap();
        assert!(stat.rss_bytes > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn fd_count_is_nonzero_on_linux() {
        assert!(open_fd_count() > 0);
    }
}
