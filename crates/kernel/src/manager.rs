use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{error, info};

use crate::{
    client::KernelClient,
    error::{KernelError, ShutdownAllError},
    process::KernelLaunch,
    EventSinks, KernelConfig,
};

#[derive(Default)]
struct Registry {
    kernels: HashMap<String, Arc<KernelClient>>,
    /// Ids whose kernel is still starting; they count as taken.
    starting: HashSet<String>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds an id in `starting` until dropped.
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    id: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.registry).starting.remove(self.id);
    }
}

/// Registry of the live kernels owned by this process. Every change to the
/// registry goes through here.
pub struct KernelManager {
    launch: KernelLaunch,
    registry: Mutex<Registry>,
}

impl KernelManager {
    pub fn new(launch: KernelLaunch) -> Self {
        Self {
            launch,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    fn reserve<'a>(&'a self, id: &'a str) -> Result<Reservation<'a>, KernelError> {
        let mut registry = self.registry();
        if registry.kernels.contains_key(id) || !registry.starting.insert(id.to_string()) {
            return Err(KernelError::Duplicate(id.to_string()));
        }

        Ok(Reservation {
            registry: &self.registry,
            id,
        })
    }

    /// Starts a kernel and registers it under `id`. A kernel that fails to
    /// start is never registered, and neither is one whose start was
    /// cancelled by dropping this future.
    pub async fn create(
        &self,
        id: &str,
        config: KernelConfig,
        sinks: EventSinks,
    ) -> Result<Arc<KernelClient>, KernelError> {
        let reservation = self.reserve(id)?;

        let kernel = Arc::new(KernelClient::new(id, config, self.launch.clone(), sinks));
        if let Err(e) = kernel.start().await {
            error!(kernel = id, "kernel failed to start: {e}");
            return Err(e);
        }

        self.registry().kernels.insert(id.to_string(), kernel.clone());
        drop(reservation);
        info!(kernel = id, "kernel registered");

        Ok(kernel)
    }

    pub fn get(&self, id: &str) -> Option<Arc<KernelClient>> {
        self.registry().kernels.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<KernelClient>> {
        self.registry().kernels.values().cloned().collect()
    }

    /// Shuts the kernel down, then unregisters it. A kernel whose shutdown
    /// fails stays registered.
    pub async fn shutdown(&self, id: &str) -> Result<(), KernelError> {
        let kernel = self
            .get(id)
            .ok_or_else(|| KernelError::NotFound(id.to_string()))?;

        kernel.shutdown().await?;

        self.registry().kernels.remove(id);
        info!(kernel = id, "kernel unregistered");

        Ok(())
    }

    /// Shuts down every registered kernel, carrying on past failures.
    pub async fn shutdown_all(&self) -> Result<(), ShutdownAllError> {
        let ids: Vec<String> = self.registry().kernels.keys().cloned().collect();
        let mut failures = Vec::new();

        for id in ids {
            if let Err(e) = self.shutdown(&id).await {
                error!(kernel = %id, "kernel shutdown failed: {e}");
                failures.push((id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownAllError { failures })
        }
    }
}
