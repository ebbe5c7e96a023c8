//! Participant counts per placement.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Placement;

/// How many participants each placement has in one execution.
///
/// Supplied when an executor stack or a service session is created. Never
/// part of the IR.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardinalityMap(BTreeMap<Placement, usize>);

impl CardinalityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// One server and `clients` clients, the usual shape.
    pub fn server_and_clients(clients: usize) -> Self {
        Self::new()
            .with(Placement::Server, 1)
            .with(Placement::Clients, clients)
    }

    pub fn with(mut self, placement: Placement, count: usize) -> Self {
        self.0.insert(placement, count);
        self
    }

    pub fn get(&self, placement: Placement) -> usize {
        self.0.get(&placement).copied().unwrap_or(0)
    }

    pub fn clients(&self) -> usize {
        self.get(Placement::Clients)
    }

    pub fn server(&self) -> usize {
        self.get(Placement::Server)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Placement, usize)> + '_ {
        self.0.iter().map(|(p, n)| (*p, *n))
    }

    /// Split the clients as evenly as possible across `shards` shards.
    pub fn split_even(&self, shards: usize) -> Vec<CardinalityMap> {
        let shards = shards.max(1);
        let clients = self.clients();
        let base = clients / shards;
        let extra = clients % shards;
        (0..shards)
            .map(|i| {
                let n = base + usize::from(i < extra);
                self.clone().with(Placement::Clients, n)
            })
            .collect()
    }
}
