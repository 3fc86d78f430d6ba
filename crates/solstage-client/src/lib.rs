// Network clients: Solana JSON-RPC, transaction building, NFT sources,
// Shadow Drive storage, wallet operations and the Jupiter swap API.

pub mod nft;
pub mod rpc;
pub mod storage;
pub mod swap;
pub mod tx;
pub mod wallet;
