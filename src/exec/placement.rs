//! Host selection for new container VMs.

use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::fabric::HostRef;

/// Picks the host a new VM is created on.
pub trait Placement: Send + Sync {
    fn choose(&self, datastore: &str, hosts: &[HostRef]) -> Result<HostRef>;
}

/// Uniformly random over the hosts attached to the image datastore.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPlacement;

impl Placement for RandomPlacement {
    fn choose(&self, datastore: &str, hosts: &[HostRef]) -> Result<HostRef> {
        hosts
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::Fabric(format!("no host attached to datastore {datastore}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_placement_stays_within_candidates() {
        let hosts: Vec<_> = ["h1", "h2", "h3"].iter().map(|h| HostRef((*h).into())).collect();
        for _ in 0..32 {
            let chosen = RandomPlacement.choose("ds1", &hosts).unwrap();
            assert!(hosts.contains(&chosen));
        }
        assert!(matches!(RandomPlacement.choose("ds1", &[]), Err(Error::Fabric(_))));
    }
}
