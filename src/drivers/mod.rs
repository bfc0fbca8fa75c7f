//! Storage controller drivers.
//!
//! Two controller families cover the supported boot media: the DesignWare
//! MSHC style host behind the SD slot ([`dwmmc`]) and the SDHC style host
//! behind the soldered eMMC ([`sdhci`]). Both expose the same transfer
//! contract: a claimable transfer descriptor, a single active slot per
//! controller, command sequencing by bounded polling, and data completion
//! through the interrupt bridge and the scheduler's waiter list.

pub mod dwmmc;
pub mod sdhci;
