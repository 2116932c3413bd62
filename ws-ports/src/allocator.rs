//! Port allocator backed by a file-locked registry.
//!
//! The registry is a JSON document mapping host identifiers to the ports
//! currently held on that host. Every read-modify-write happens while holding
//! both an in-process per-host mutex and an exclusive lock on a sibling
//! `.lock` file, and the document is replaced with a temp-file rename so a
//! crash never leaves it half written.

// Standard library
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// External crates
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// Internal imports
use crate::error::{PortError, Result};
use crate::range::PortRange;

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// One held port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub holder: String,
    pub allocated_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    hosts: BTreeMap<String, BTreeMap<u16, Allocation>>,
}

/// Hands out the lowest free port of a range, per host.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    registry_path: PathBuf,
    host_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PortAllocator {
    pub fn new(range: PortRange, registry_path: impl Into<PathBuf>) -> Self {
        Self {
            range,
            registry_path: registry_path.into(),
            host_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Allocates the lowest port in range that is not held on `host`.
    pub fn allocate(&self, host: &str, holder: &str) -> Result<u16> {
        let range = self.range;
        let port = self.with_host(host, |ports| {
            let port = range
                .ports()
                .find(|port| !ports.contains_key(port))
                .ok_or_else(|| PortError::PoolExhausted {
                    host: host.to_string(),
                    range: range.to_string(),
                })?;
            ports.insert(
                port,
                Allocation {
                    holder: holder.to_string(),
                    allocated_at: Utc::now().timestamp(),
                },
            );
            Ok(port)
        })?;

        info!(host, holder, port, "allocated port");
        Ok(port)
    }

    /// Records a specific port for `holder`. Re-reserving a port the holder
    /// already owns succeeds; a port owned by someone else is a conflict.
    pub fn reserve(&self, host: &str, port: u16, holder: &str) -> Result<()> {
        if !self.range.contains(port) {
            return Err(PortError::OutOfRange {
                port,
                range: self.range.to_string(),
            });
        }

        self.with_host(host, |ports| match ports.get(&port) {
            Some(existing) if existing.holder != holder => Err(PortError::Conflict {
                host: host.to_string(),
                port,
                holder: existing.holder.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                ports.insert(
                    port,
                    Allocation {
                        holder: holder.to_string(),
                        allocated_at: Utc::now().timestamp(),
                    },
                );
                Ok(())
            }
        })
    }

    /// Marks `port` free on `host`. Returns whether it was held.
    pub fn release(&self, host: &str, port: u16) -> Result<bool> {
        let released = self.with_host(host, |ports| Ok(ports.remove(&port).is_some()))?;
        if released {
            info!(host, port, "released port");
        } else {
            debug!(host, port, "release of a port that was not held");
        }
        Ok(released)
    }

    /// Current allocations on `host`, keyed by port.
    pub fn allocations(&self, host: &str) -> Result<BTreeMap<u16, Allocation>> {
        self.with_host(host, |ports| Ok(ports.clone()))
    }

    pub fn holder_of(&self, host: &str, port: u16) -> Result<Option<String>> {
        Ok(self
            .allocations(host)?
            .remove(&port)
            .map(|allocation| allocation.holder))
    }

    fn host_lock(&self, host: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .host_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(host.to_string()).or_default())
    }

    /// Runs `update_fn` against the ports of `host` inside the exclusive
    /// section and persists the result when it succeeds.
    fn with_host<T, F>(&self, host: &str, update_fn: F) -> Result<T>
    where
        F: FnOnce(&mut BTreeMap<u16, Allocation>) -> Result<T>,
    {
        let host_lock = self.host_lock(host);
        let _host_guard = host_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.registry_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = self.registry_path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        let lock_start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) => {
                    if lock_start.elapsed() > LOCK_TIMEOUT {
                        return Err(PortError::Lock {
                            path: lock_path,
                            reason: e.to_string(),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
            }
        }

        let _file_guard = scopeguard::guard((), |_| {
            let _ = fs2::FileExt::unlock(&lock_file);
        });

        let mut document = self.read_document()?;
        let before = document.hosts.get(host).cloned().unwrap_or_default();
        let mut ports = before.clone();

        let value = update_fn(&mut ports)?;

        if ports != before {
            if ports.is_empty() {
                document.hosts.remove(host);
            } else {
                document.hosts.insert(host.to_string(), ports);
            }
            self.write_document(&document)?;
        }

        Ok(value)
    }

    fn read_document(&self) -> Result<RegistryDocument> {
        let content = match fs::read_to_string(&self.registry_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Default::default()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            warn!(path = ?self.registry_path, "port registry is empty, treating as no allocations");
            return Ok(RegistryDocument::default());
        }

        serde_json::from_str(&content).map_err(|source| PortError::Corrupt {
            path: self.registry_path.clone(),
            source,
        })
    }

    fn write_document(&self, document: &RegistryDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(document).map_err(|source| PortError::Corrupt {
            path: self.registry_path.clone(),
            source,
        })?;
        ws_core::write_atomic(&self.registry_path, json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn allocator(dir: &Path, start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(
            PortRange::new(start, end).unwrap(),
            dir.join("ports.json"),
        )
    }

    #[test]
    fn test_allocates_lowest_free_port() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path(), 20000, 20009);

        assert_eq!(ports.allocate("host-a", "ws-1").unwrap(), 20000);
        assert_eq!(ports.allocate("host-a", "ws-2").unwrap(), 20001);
        assert!(ports.release("host-a", 20000).unwrap());
        assert_eq!(ports.allocate("host-a", "ws-3").unwrap(), 20000);
        assert_eq!(ports.allocate("host-a", "ws-4").unwrap(), 20002);
    }

    #[test]
    fn test_hosts_are_independent() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path(), 20000, 20009);

        assert_eq!(ports.allocate("host-a", "ws-1").unwrap(), 20000);
        assert_eq!(ports.allocate("host-b", "ws-2").unwrap(), 20000);
    }

    #[test]
    fn test_pool_exhausted() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path(), 20000, 20001);

        ports.allocate("host-a", "ws-1").unwrap();
        ports.allocate("host-a", "ws-2").unwrap();
        let err = ports.allocate("host-a", "ws-3").unwrap_err();
        assert!(matches!(err, PortError::PoolExhausted { .. }));
    }

    #[test]
    fn test_release_of_free_port_reports_false() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path(), 20000, 20001);
        assert!(!ports.release("host-a", 20001).unwrap());
    }

    #[test]
    fn test_reserve_conflicts_with_other_holder() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path(), 20000, 20009);

        ports.reserve("host-a", 20005, "ws-1").unwrap();
        ports.reserve("host-a", 20005, "ws-1").unwrap();
        let err = ports.reserve("host-a", 20005, "ws-2").unwrap_err();
        assert!(matches!(err, PortError::Conflict { port: 20005, .. }));
        assert!(matches!(
            ports.reserve("host-a", 30000, "ws-2"),
            Err(PortError::OutOfRange { .. })
        ));
        assert_eq!(
            ports.holder_of("host-a", 20005).unwrap().as_deref(),
            Some("ws-1")
        );
    }

    #[test]
    fn test_allocations_survive_new_instance() {
        let dir = tempdir().unwrap();
        allocator(dir.path(), 20000, 20009)
            .allocate("host-a", "ws-1")
            .unwrap();

        let reopened = allocator(dir.path(), 20000, 20009);
        assert_eq!(reopened.allocate("host-a", "ws-2").unwrap(), 20001);
        assert_eq!(reopened.allocations("host-a").unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_registry_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ports.json"), "{not json").unwrap();
        let ports = allocator(dir.path(), 20000, 20009);
        assert!(matches!(
            ports.allocate("host-a", "ws-1"),
            Err(PortError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        use std::thread;

        let dir = tempdir().unwrap();
        let shared = Arc::new(allocator(dir.path(), 20000, 20099));
        let registry_path = shared.registry_path().to_path_buf();

        let mut handles = Vec::new();
        for i in 0..16 {
            // Half the threads share an allocator, half open their own to
            // exercise the file lock rather than only the in-process mutex.
            let handle = if i % 2 == 0 {
                let ports = Arc::clone(&shared);
                thread::spawn(move || ports.allocate("host-a", &format!("ws-{i}")))
            } else {
                let path = registry_path.clone();
                thread::spawn(move || {
                    PortAllocator::new(PortRange::new(20000, 20099).unwrap(), path)
                        .allocate("host-a", &format!("ws-{i}"))
                })
            };
            handles.push(handle);
        }

        let ports: Vec<u16> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked").expect("allocation failed"))
            .collect();

        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
        assert_eq!(shared.allocations("host-a").unwrap().len(), 16);
        assert_eq!(*ports.iter().max().unwrap(), 20015);
    }
}
