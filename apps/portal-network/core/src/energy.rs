use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::EndpointId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnergyError {
    #[error("insufficient energy: required {required}, available {available}")]
    Insufficient { required: u64, available: u64 },
    #[error("endpoint {0} has no energy store")]
    NoStore(EndpointId),
}

/// Energy balance supplied by the surrounding world.
pub trait EnergyProvider {
    fn available_energy(&self, anchor: EndpointId) -> u64;

    fn debit(&mut self, anchor: EndpointId, amount: u64) -> Result<(), EnergyError>;
}

/// Per-endpoint balances held in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnergyLedger {
    balances: BTreeMap<EndpointId, u64>,
}

impl EnergyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&mut self, anchor: EndpointId, amount: u64) {
        self.balances.insert(anchor, amount);
    }

    pub fn credit(&mut self, anchor: EndpointId, amount: u64) -> u64 {
        let balance = self.balances.entry(anchor).or_insert(0);
        *balance = balance.saturating_add(amount);
        *balance
    }

    pub fn remove(&mut self, anchor: EndpointId) -> Option<u64> {
        self.balances.remove(&anchor)
    }
}

impl EnergyProvider for EnergyLedger {
    fn available_energy(&self, anchor: EndpointId) -> u64 {
        self.balances.get(&anchor).copied().unwrap_or(0)
    }

    fn debit(&mut self, anchor: EndpointId, amount: u64) -> Result<(), EnergyError> {
        if amount == 0 {
            return Ok(());
        }
        let balance = self
            .balances
            .get_mut(&anchor)
            .ok_or(EnergyError::NoStore(anchor))?;
        if *balance < amount {
            return Err(EnergyError::Insufficient {
                required: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn debit_checks_balance() {
        let mut ledger = EnergyLedger::new();
        let id = EndpointId::generate();
        assert_eq!(ledger.debit(id, 1), Err(EnergyError::NoStore(id)));
        assert_eq!(ledger.debit(id, 0), Ok(()));

        ledger.set_balance(id, 40);
        assert_eq!(
            ledger.debit(id, 50),
            Err(EnergyError::Insufficient {
                required: 50,
                available: 40
            })
        );
        assert_eq!(ledger.available_energy(id), 40);
        ledger.credit(id, 10);
        assert_eq!(ledger.debit(id, 50), Ok(()));
        assert_eq!(ledger.available_energy(id), 0);
    }
}
