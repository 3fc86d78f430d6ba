// Solstage orchestration: locating and verifying the on-chain filter pointer,
// editing and re-anchoring the filter document, and bucketing a wallet's NFTs
// for display.

pub mod cli;
pub mod gallery;
pub mod reconcile;
