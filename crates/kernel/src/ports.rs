use std::{
    collections::BTreeSet,
    net::{Ipv4Addr, TcpListener},
    ops::Range,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use crate::{error::PortError, KernelConfig};

struct Leases {
    next: u16,
    leased: BTreeSet<u16>,
}

/// Hands out loopback ports from a fixed range. A port stays leased until it
/// is released, and is only handed out if it can currently be bound.
pub struct PortPool {
    range: Range<u16>,
    is_free: fn(u16) -> bool,
    leases: Mutex<Leases>,
}

impl PortPool {
    pub fn new(range: Range<u16>) -> Self {
        Self::with_check(range, can_bind)
    }

    pub fn with_check(range: Range<u16>, is_free: fn(u16) -> bool) -> Self {
        Self {
            leases: Mutex::new(Leases {
                next: range.start,
                leased: BTreeSet::new(),
            }),
            range,
            is_free,
        }
    }

    fn leases(&self) -> MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self) -> Result<u16, PortError> {
        let mut leases = self.leases();
        let start = u32::from(self.range.start);
        let span = u32::from(self.range.end).saturating_sub(start);
        let first = u32::from(leases.next).saturating_sub(start);

        for offset in 0..span {
            let candidate = (start + (first + offset) % span) as u16;
            if leases.leased.contains(&candidate) || !(self.is_free)(candidate) {
                continue;
            }

            leases.leased.insert(candidate);
            leases.next = (start + (first + offset + 1) % span) as u16;
            debug!(port = candidate, "port leased");
            return Ok(candidate);
        }

        Err(PortError::Exhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Returns false if the port was not leased.
    pub fn release(&self, port: u16) -> bool {
        let released = self.leases().leased.remove(&port);
        if released {
            debug!(port, "port released");
        }
        released
    }

    /// Leases the distinct ports one kernel needs.
    pub fn allocate(&self, heartbeat: bool) -> Result<KernelConfig, PortError> {
        let count = if heartbeat { 3 } else { 2 };
        let mut ports = Vec::with_capacity(count);

        for _ in 0..count {
            match self.acquire() {
                Ok(port) => ports.push(port),
                Err(e) => {
                    for port in ports {
                        self.release(port);
                    }
                    return Err(e);
                }
            }
        }

        let config = KernelConfig::new(ports[0], ports[1]);
        Ok(match ports.get(2) {
            Some(&hb_port) => config.with_heartbeat(hb_port),
            None => config,
        })
    }

    pub fn release_config(&self, config: &KernelConfig) {
        for port in config.ports() {
            self.release(port);
        }
    }

    pub fn leased(&self) -> usize {
        self.leases().leased.len()
    }
}

fn can_bind(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
