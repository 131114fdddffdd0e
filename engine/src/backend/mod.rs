//! Backend layer (component G, spec §4.G): turns a `Job` the make state
//! machine decided must run into an actual process invocation, subject to
//! resource pool admission.

pub mod local;

use std::collections::BTreeMap;

use async_semaphore::AsyncSemaphore;

/// One named resource pool (cpu, mem, tmp, ...), sized from
/// `Config::default_resources` (§4.G "aggregate resource counters").
pub struct ResourcePools {
    pools: BTreeMap<String, AsyncSemaphore>,
}

impl ResourcePools {
    pub fn new(sizes: &BTreeMap<String, u64>) -> ResourcePools {
        ResourcePools {
            pools: sizes.iter().map(|(k, &v)| (k.clone(), AsyncSemaphore::new(v as usize))).collect(),
        }
    }

    /// Acquires every resource class a rule's `resources` map requests,
    /// waiting on each in a fixed (sorted) order to avoid pool-acquisition
    /// deadlocks between concurrently launching jobs.
    pub async fn acquire(&self, request: &BTreeMap<String, u64>) -> Vec<async_semaphore::OwnedPermit> {
        let mut permits = Vec::with_capacity(request.len());
        for (name, &weight) in request {
            if weight == 0 {
                continue;
            }
            if let Some(pool) = self.pools.get(name) {
                permits.push(pool.acquire_owned(weight as usize).await);
            }
        }
        permits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquiring_an_unknown_resource_class_is_a_no_op() {
        let pools = ResourcePools::new(&BTreeMap::new());
        let mut request = BTreeMap::new();
        request.insert("gpu".to_string(), 1);
        let permits = pools.acquire(&request).await;
        assert!(permits.is_empty());
    }

    #[tokio::test]
    async fn acquiring_a_known_resource_class_blocks_until_available() {
        let mut sizes = BTreeMap::new();
        sizes.insert("cpu".to_string(), 2);
        let pools = ResourcePools::new(&sizes);
        let mut request = BTreeMap::new();
        request.insert("cpu".to_string(), 2);
        let permits = pools.acquire(&request).await;
        assert_eq!(permits.len(), 1);
    }
}
